//! Calibration window: collect readings for a fixed time, then summarise
//! them into a [`CalibrationProfile`].
//!
//! A calibration run is driven by two inputs.  Every decoded reading goes
//! through [`CalibrationEngine::on_sample`], and a 1 s countdown calls
//! [`CalibrationEngine::tick`] so the window also closes when the stream has
//! gone quiet.  Starting a new run discards whatever the previous one had
//! buffered.

use log::{debug, info};

use crate::config::PipelineConfig;
use crate::types::{CalibrationProfile, ForceReading};

/// Result of feeding the engine.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CalibrationStatus {
    /// No calibration is running; the reading was ignored.
    Idle,
    /// Still collecting.  `progress` is elapsed / duration in `[0, 1]`.
    Collecting { progress: f32 },
    /// The window closed with this profile.  Check `is_valid` before use.
    Finished(CalibrationProfile),
}

/// Summarise a calibration buffer.
///
/// Fewer than `min_samples` values, or any non-finite value, yields an
/// invalid profile carrying only the sample count.
pub fn compute_profile(values: &[f32], min_samples: usize, min_range: f32) -> CalibrationProfile {
    if values.len() < min_samples.max(1) || values.iter().any(|v| !v.is_finite()) {
        return CalibrationProfile::invalid(values.len());
    }
    let (min_force, max_force, sum) = values.iter().fold(
        (f32::INFINITY, f32::NEG_INFINITY, 0.0f64),
        |(lo, hi, sum), &v| (lo.min(v), hi.max(v), sum + v as f64),
    );
    let force_range = max_force - min_force;
    CalibrationProfile {
        min_force,
        max_force,
        baseline_force: (sum / values.len() as f64) as f32,
        force_range,
        sample_count: values.len(),
        is_valid: force_range > min_range,
    }
}

/// Collects readings while a calibration window is open.
pub struct CalibrationEngine {
    min_samples: usize,
    max_samples: usize,
    min_force_range: f32,
    default_duration_ms: u64,
    duration_ms: u64,
    /// Start of the running window, ms since epoch.
    started_at: Option<f64>,
    buffer: Vec<f32>,
    last_profile: Option<CalibrationProfile>,
}

impl CalibrationEngine {
    pub fn new(config: &PipelineConfig) -> Self {
        Self {
            min_samples: config.calibration_min_samples,
            max_samples: config.calibration_max_samples.max(1),
            min_force_range: config.min_force_range,
            default_duration_ms: config.calibration_duration_ms,
            duration_ms: config.calibration_duration_ms,
            started_at: None,
            buffer: Vec::new(),
            last_profile: None,
        }
    }

    /// Open a window of the configured length starting at `now_ms`.
    pub fn start(&mut self, now_ms: f64) {
        self.start_with_duration(now_ms, self.default_duration_ms);
    }

    /// Open a window of `duration_ms`, discarding any run in progress.
    pub fn start_with_duration(&mut self, now_ms: f64, duration_ms: u64) {
        if self.started_at.is_some() {
            debug!("calibration restarted; dropping {} buffered readings", self.buffer.len());
        }
        self.buffer.clear();
        self.duration_ms = duration_ms;
        self.started_at = Some(now_ms);
        info!("calibration started ({} s)", duration_ms as f64 / 1000.0);
    }

    /// Abort without producing a profile.
    pub fn cancel(&mut self) {
        self.started_at = None;
        self.buffer.clear();
    }

    pub fn is_calibrating(&self) -> bool {
        self.started_at.is_some()
    }

    /// Readings buffered in the current run.
    pub fn sample_count(&self) -> usize {
        self.buffer.len()
    }

    /// Profile from the most recently finished run.
    pub fn last_profile(&self) -> Option<&CalibrationProfile> {
        self.last_profile.as_ref()
    }

    /// Buffer `reading` and close the window once it is full or has run out
    /// of time.
    pub fn on_sample(&mut self, reading: ForceReading) -> CalibrationStatus {
        if self.started_at.is_none() {
            return CalibrationStatus::Idle;
        }
        self.buffer.push(reading.value);
        if self.buffer.len() >= self.max_samples || self.progress(reading.timestamp) >= 1.0 {
            return CalibrationStatus::Finished(self.finalize());
        }
        CalibrationStatus::Collecting {
            progress: self.progress(reading.timestamp),
        }
    }

    /// Countdown tick: closes the window when time is up even if no reading
    /// arrived.
    pub fn tick(&mut self, now_ms: f64) -> CalibrationStatus {
        if self.started_at.is_none() {
            return CalibrationStatus::Idle;
        }
        let progress = self.progress(now_ms);
        if progress >= 1.0 {
            CalibrationStatus::Finished(self.finalize())
        } else {
            CalibrationStatus::Collecting { progress }
        }
    }

    /// Close the window now and compute the profile.
    pub fn finalize(&mut self) -> CalibrationProfile {
        let profile = compute_profile(&self.buffer, self.min_samples, self.min_force_range);
        if profile.is_valid {
            info!(
                "calibration done: {} samples, min {:.2} max {:.2} baseline {:.2}",
                profile.sample_count, profile.min_force, profile.max_force, profile.baseline_force
            );
        } else {
            info!(
                "calibration invalid: {} samples, range {:.3}",
                profile.sample_count, profile.force_range
            );
        }
        self.started_at = None;
        self.buffer.clear();
        self.last_profile = Some(profile);
        profile
    }

    /// Elapsed fraction of the window in `[0, 1]`; `0` when idle.
    pub fn progress(&self, now_ms: f64) -> f32 {
        let Some(start) = self.started_at else {
            return 0.0;
        };
        if self.duration_ms == 0 {
            return 1.0;
        }
        (((now_ms - start).max(0.0)) / self.duration_ms as f64).clamp(0.0, 1.0) as f32
    }

    /// Whole seconds left, rounded up, for the countdown display.
    pub fn seconds_remaining(&self, now_ms: f64) -> u64 {
        let Some(start) = self.started_at else {
            return 0;
        };
        let left_ms = self.duration_ms as f64 - (now_ms - start).max(0.0);
        if left_ms <= 0.0 {
            0
        } else {
            (left_ms / 1000.0).ceil() as u64
        }
    }
}
