use serde::{Deserialize, Serialize};

/// One BLE notification exactly as it arrived from the response characteristic.
///
/// Retained only in a short ring buffer for diagnostics; the force decoder
/// consumes it immediately.
#[derive(Debug, Clone, PartialEq)]
pub struct RawSample {
    /// Notification payload.
    pub bytes: Vec<u8>,
    /// Arrival time in milliseconds since Unix epoch.
    pub received_at: f64,
}

/// A force value decoded from a [`RawSample`].
///
/// The unit is nominally Newtons, but because the packet layout is inferred
/// rather than documented the value should be treated as a relative signal.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ForceReading {
    pub value: f32,
    /// Milliseconds since Unix epoch, copied from the originating sample.
    pub timestamp: f64,
}

/// Statistics of a calibration window.
///
/// Created once per calibration run and never mutated; a new calibration
/// replaces the previous profile wholesale.  Callers must re-run calibration
/// when `is_valid` is `false` rather than feed readings through an invalid
/// profile.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CalibrationProfile {
    pub min_force: f32,
    pub max_force: f32,
    /// Mean force across the window; the resting point of the breath cycle.
    pub baseline_force: f32,
    /// Always `max_force − min_force`.
    pub force_range: f32,
    /// Number of readings the profile was computed from.
    pub sample_count: usize,
    /// Enough samples were collected and the range exceeds the noise floor.
    pub is_valid: bool,
}

impl CalibrationProfile {
    /// Profile returned when a window could not be evaluated.
    pub fn invalid(sample_count: usize) -> Self {
        Self {
            min_force: 0.0,
            max_force: 0.0,
            baseline_force: 0.0,
            force_range: 0.0,
            sample_count,
            is_valid: false,
        }
    }
}

/// Breathing phase derived from the normalised amplitude.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum BreathPhase {
    Inhale,
    Exhale,
    #[default]
    Pause,
}

impl std::fmt::Display for BreathPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            BreathPhase::Inhale => "inhale",
            BreathPhase::Exhale => "exhale",
            BreathPhase::Pause => "pause",
        };
        f.pad(s)
    }
}

/// The derived breathing signal consumed by presentation code.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
pub struct BreathState {
    /// Normalised chest expansion in `[0, 1]`.
    pub amplitude: f32,
    pub phase: BreathPhase,
    /// Breaths per minute over the rate window.
    pub rate: u32,
}

/// Why a link went down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectCause {
    /// [`crate::belt_client::BeltHandle::disconnect`] was called.
    Requested,
    /// The device or the platform stack dropped the link.
    LinkLost,
}

/// All events emitted by [`crate::belt_client::BeltClient`].
///
/// Consumers receive these through the [`crate::queue::EventReceiver`]
/// returned by [`crate::belt_client::BeltClient::connect`].
#[derive(Debug, Clone)]
pub enum BeltEvent {
    /// Link established and the notify characteristic subscribed.
    /// Carries the advertised device name.
    Connected(String),
    /// One notification.  `force` is `None` when no interpretation of the
    /// bytes produced a plausible value; that is normal and not an error.
    Sample {
        raw: RawSample,
        force: Option<ForceReading>,
    },
    /// Response to a device-info or sensor-list request, or any other
    /// command echo.  Carries the raw frame.
    CommandResponse(Vec<u8>),
    /// The link is gone; no further events follow.
    Disconnected(DisconnectCause),
}
