//! Breath signal derivation: amplitude, phase, and rate.
//!
//! Every decoded reading is normalised against the active
//! [`CalibrationProfile`] into an amplitude in `[0, 1]`.  Phase comes from a
//! two-threshold hysteresis classifier; rate from counting local peaks over a
//! sliding window.  Amplitude changes on every sample; phase and rate change
//! rarely, and [`BreathUpdate`] flags when they do.

use std::collections::VecDeque;

use crate::config::PipelineConfig;
use crate::types::{BreathPhase, BreathState, CalibrationProfile, ForceReading};

/// Map a raw force onto `[0, 1]` relative to the calibration window.
///
/// A profile with a zero (or negative) range maps everything to `0`, as do
/// non-finite inputs.
pub fn normalize(value: f32, profile: &CalibrationProfile) -> f32 {
    if !value.is_finite() || !(profile.force_range > 0.0) {
        return 0.0;
    }
    ((value - profile.min_force) / profile.force_range).clamp(0.0, 1.0)
}

// ── Phase ─────────────────────────────────────────────────────────────────────

/// Hysteresis phase classifier.
///
/// Above `inhale_threshold` the phase is inhale, below `exhale_threshold`
/// exhale.  Between the two the previous phase is kept, so noise around a
/// single boundary cannot make it flap.  If the amplitude stays inside the
/// band for `pause_dwell_ms` the phase becomes pause.
#[derive(Debug, Clone)]
pub struct PhaseClassifier {
    inhale_threshold: f32,
    exhale_threshold: f32,
    pause_dwell_ms: f64,
    phase: BreathPhase,
    /// When the amplitude last entered the middle band.
    band_entered_at: Option<f64>,
}

impl PhaseClassifier {
    pub fn new(inhale_threshold: f32, exhale_threshold: f32, pause_dwell_ms: u64) -> Self {
        Self {
            inhale_threshold,
            exhale_threshold,
            pause_dwell_ms: pause_dwell_ms as f64,
            phase: BreathPhase::Pause,
            band_entered_at: None,
        }
    }

    pub fn from_config(config: &PipelineConfig) -> Self {
        Self::new(config.inhale_threshold, config.exhale_threshold, config.pause_dwell_ms)
    }

    pub fn phase(&self) -> BreathPhase {
        self.phase
    }

    pub fn reset(&mut self) {
        self.phase = BreathPhase::Pause;
        self.band_entered_at = None;
    }

    pub fn classify(&mut self, amplitude: f32, timestamp: f64) -> BreathPhase {
        if amplitude > self.inhale_threshold {
            self.band_entered_at = None;
            self.phase = BreathPhase::Inhale;
        } else if amplitude < self.exhale_threshold {
            self.band_entered_at = None;
            self.phase = BreathPhase::Exhale;
        } else {
            let entered = *self.band_entered_at.get_or_insert(timestamp);
            if timestamp - entered >= self.pause_dwell_ms {
                self.phase = BreathPhase::Pause;
            }
        }
        self.phase
    }
}

// ── Rate ──────────────────────────────────────────────────────────────────────

/// Breaths per minute from peak counting over a sliding time window.
#[derive(Debug, Clone)]
pub struct RateEstimator {
    window_ms: f64,
    neighborhood: usize,
    margin: f32,
    min_samples: usize,
    /// Amplitude of the calibration baseline; peaks must clear it by `margin`.
    baseline: f32,
    samples: VecDeque<(f64, f32)>,
    rate: u32,
}

impl RateEstimator {
    pub fn new(config: &PipelineConfig) -> Self {
        Self {
            window_ms: config.rate_window_ms as f64,
            neighborhood: config.peak_neighborhood.max(1),
            margin: config.peak_margin,
            min_samples: config.min_rate_samples,
            baseline: 0.5,
            samples: VecDeque::new(),
            rate: 0,
        }
    }

    /// Set the normalised baseline amplitude and clear the window.
    pub fn reset(&mut self, baseline: f32) {
        self.baseline = baseline;
        self.samples.clear();
        self.rate = 0;
    }

    pub fn rate(&self) -> u32 {
        self.rate
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Add one amplitude and return the current estimate.
    ///
    /// With fewer than `min_samples` in the window, or a window with no
    /// time span, the previous estimate is returned unchanged.
    pub fn push(&mut self, amplitude: f32, timestamp: f64) -> u32 {
        self.samples.push_back((timestamp, amplitude));
        while let Some(&(t, _)) = self.samples.front() {
            if timestamp - t > self.window_ms {
                self.samples.pop_front();
            } else {
                break;
            }
        }

        if self.samples.len() < self.min_samples.max(1) {
            return self.rate;
        }
        let (Some(&(first, _)), Some(&(last, _))) = (self.samples.front(), self.samples.back())
        else {
            return self.rate;
        };
        let span_secs = (last - first) / 1000.0;
        if span_secs <= 0.0 {
            return self.rate;
        }

        let peaks = self.count_peaks();
        self.rate = (peaks as f64 * 60.0 / span_secs).round() as u32;
        self.rate
    }

    /// Local maxima over ±`neighborhood` samples that clear the baseline.
    ///
    /// Only positions with a full neighbourhood on both sides are checked.
    /// A flat run is not a peak, and peaks closer than one neighbourhood to
    /// the previously counted one are merged into it.
    fn count_peaks(&self) -> usize {
        let n = self.neighborhood;
        let amps: Vec<f32> = self.samples.iter().map(|&(_, a)| a).collect();
        if amps.len() < 2 * n + 1 {
            return 0;
        }
        let threshold = self.baseline + self.margin;
        let mut count = 0;
        let mut last_peak: Option<usize> = None;
        for i in n..amps.len() - n {
            let a = amps[i];
            if a <= threshold {
                continue;
            }
            let around = &amps[i - n..=i + n];
            let dominates = around.iter().all(|&b| a >= b);
            let is_flat = around.iter().all(|&b| b >= a);
            if !dominates || is_flat {
                continue;
            }
            if last_peak.map_or(true, |p| i - p > n) {
                count += 1;
                last_peak = Some(i);
            }
        }
        count
    }
}

// ── Processor ─────────────────────────────────────────────────────────────────

/// Output of [`BreathProcessor::process`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BreathUpdate {
    pub state: BreathState,
    pub phase_changed: bool,
    pub rate_changed: bool,
}

/// Normalisation, phase, and rate behind one calibration profile.
pub struct BreathProcessor {
    profile: Option<CalibrationProfile>,
    phase: PhaseClassifier,
    rate: RateEstimator,
    state: BreathState,
}

impl BreathProcessor {
    pub fn new(config: &PipelineConfig) -> Self {
        Self {
            profile: None,
            phase: PhaseClassifier::from_config(config),
            rate: RateEstimator::new(config),
            state: BreathState::default(),
        }
    }

    /// Install a new profile, replacing the old one and resetting phase and
    /// rate history.  Invalid profiles are refused and leave the processor
    /// untouched.
    pub fn set_profile(&mut self, profile: CalibrationProfile) -> bool {
        if !profile.is_valid {
            return false;
        }
        self.phase.reset();
        self.rate.reset(normalize(profile.baseline_force, &profile));
        self.state = BreathState::default();
        self.profile = Some(profile);
        true
    }

    pub fn clear_profile(&mut self) {
        self.profile = None;
        self.phase.reset();
        self.state = BreathState::default();
    }

    pub fn profile(&self) -> Option<&CalibrationProfile> {
        self.profile.as_ref()
    }

    pub fn state(&self) -> BreathState {
        self.state
    }

    /// Derive the breath state for `reading`; `None` without a valid profile.
    pub fn process(&mut self, reading: ForceReading) -> Option<BreathUpdate> {
        let profile = self.profile?;
        let amplitude = normalize(reading.value, &profile);
        let phase = self.phase.classify(amplitude, reading.timestamp);
        let rate = self.rate.push(amplitude, reading.timestamp);

        let previous = self.state;
        self.state = BreathState { amplitude, phase, rate };
        Some(BreathUpdate {
            state: self.state,
            phase_changed: phase != previous.phase,
            rate_changed: rate != previous.rate,
        })
    }
}
