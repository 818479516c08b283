//! Tunable thresholds for the signal pipeline and session recovery.
//!
//! Every number that shapes the behaviour of calibration, phase detection,
//! rate estimation, or checkpointing lives here with its default.  Components
//! receive the relevant struct at construction time.
//!
//! [`AppConfig`] bundles everything the CLI needs and can be read from a JSON
//! file; missing fields fall back to their defaults.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::belt_client::BeltClientConfig;

// ── Signal pipeline ───────────────────────────────────────────────────────────

/// Thresholds for calibration, normalisation, phase hysteresis, and rate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Length of the calibration window in milliseconds. Default: `20_000`.
    pub calibration_duration_ms: u64,
    /// Fewest readings a calibration window must contain to be valid. Default: `50`.
    pub calibration_min_samples: usize,
    /// Calibration finalises early once this many readings are buffered. Default: `2_000`.
    pub calibration_max_samples: usize,
    /// Smallest `max − min` spread (N) that counts as real breathing rather
    /// than the sensor noise floor. Default: `0.1`.
    pub min_force_range: f32,
    /// Amplitude above which the phase flips to inhale. Default: `0.7`.
    pub inhale_threshold: f32,
    /// Amplitude below which the phase flips to exhale. Default: `0.3`.
    pub exhale_threshold: f32,
    /// Time the amplitude must stay between the two thresholds before the
    /// phase becomes [`crate::types::BreathPhase::Pause`]. Default: `2_500`.
    pub pause_dwell_ms: u64,
    /// Sliding window used for rate estimation. Default: `60_000`.
    pub rate_window_ms: u64,
    /// Samples on each side a local peak must dominate. Default: `3`.
    pub peak_neighborhood: usize,
    /// A peak only counts when its amplitude exceeds the baseline amplitude
    /// by this margin. Default: `0.1`.
    pub peak_margin: f32,
    /// With fewer samples in the window the previous rate is reported. Default: `20`.
    pub min_rate_samples: usize,
    /// Exclusive lower bound for a plausible decoded force (N). Default: `0.0`.
    pub plausible_min_force: f32,
    /// Exclusive upper bound for a plausible decoded force (N). Default: `40.0`.
    pub plausible_max_force: f32,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            calibration_duration_ms: 20_000,
            calibration_min_samples: 50,
            calibration_max_samples: 2_000,
            min_force_range: 0.1,
            inhale_threshold: 0.7,
            exhale_threshold: 0.3,
            pause_dwell_ms: 2_500,
            rate_window_ms: 60_000,
            peak_neighborhood: 3,
            peak_margin: 0.1,
            min_rate_samples: 20,
            plausible_min_force: 0.0,
            plausible_max_force: 40.0,
        }
    }
}

// ── Session recovery ──────────────────────────────────────────────────────────

/// Timing and retention rules for the session recovery manager.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Period of the durable checkpoint task. Default: `30`.
    pub checkpoint_interval_secs: u64,
    /// Emergency checkpoints older than this are discarded on startup. Default: `300`.
    pub emergency_max_age_secs: i64,
    /// An active-session record whose last update is older than this is
    /// treated as abandoned. Default: `120`.
    pub active_stale_after_secs: i64,
    /// Oldest failed records are dropped beyond this many. Default: `50`.
    pub failed_queue_limit: usize,
    /// Sessions are rounded down to multiples of this and discarded below it.
    /// Default: `60`.
    pub min_session_secs: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            checkpoint_interval_secs: 30,
            emergency_max_age_secs: 5 * 60,
            active_stale_after_secs: 2 * 60,
            failed_queue_limit: 50,
            min_session_secs: 60,
        }
    }
}

// ── Application ───────────────────────────────────────────────────────────────

/// Top-level configuration consumed by the `breathbelt` binary.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub belt: BeltClientConfig,
    pub pipeline: PipelineConfig,
    pub session: SessionConfig,
    /// Base URL of the session API; sessions are posted to `{server_url}/sessions`.
    pub server_url: String,
    /// Directory holding the durable session records.
    pub storage_dir: PathBuf,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            belt: BeltClientConfig::default(),
            pipeline: PipelineConfig::default(),
            session: SessionConfig::default(),
            server_url: "http://localhost:3000/api".into(),
            storage_dir: PathBuf::from(".breathbelt"),
        }
    }
}

impl AppConfig {
    /// Read a JSON config file. Fields absent from the file keep their defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config from {}", path.display()))?;
        serde_json::from_str(&contents)
            .with_context(|| format!("Invalid config in {}", path.display()))
    }
}
