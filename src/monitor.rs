//! The owned breathing pipeline: belt events in, derived signal out.
//!
//! [`BreathMonitor`] routes decoded readings to the calibration engine while
//! a window is open and to the breath processor once a valid profile is
//! installed.  It holds no I/O; the caller pumps [`BeltEvent`]s into it and
//! reads [`SignalSnapshot`]s back.

use log::{info, warn};
use serde::Serialize;

use crate::breath::{BreathProcessor, BreathUpdate};
use crate::calibration::{CalibrationEngine, CalibrationStatus};
use crate::config::PipelineConfig;
use crate::types::{BeltEvent, BreathPhase, CalibrationProfile, DisconnectCause};

/// The derived signal consumed by presentation code.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SignalSnapshot {
    pub amplitude: f32,
    pub phase: BreathPhase,
    pub rate: u32,
    pub is_connected: bool,
    /// `0` when no calibration is running.
    pub calibration_progress: f32,
}

/// What a single event did to the pipeline.
#[derive(Debug, Clone, PartialEq)]
pub enum MonitorEvent {
    Connected(String),
    CalibrationProgress(f32),
    /// Check `is_valid`; an invalid profile means calibration must be re-run.
    CalibrationFinished(CalibrationProfile),
    Breath(BreathUpdate),
    DeviceResponse(Vec<u8>),
    /// The link dropped on its own.  The owner should finalise any session.
    LinkLost,
    Disconnected,
}

/// Running totals, mostly for the status line.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MonitorStats {
    pub packets: u64,
    pub decoded: u64,
}

pub struct BreathMonitor {
    calibration: CalibrationEngine,
    processor: BreathProcessor,
    connected: bool,
    device_name: Option<String>,
    last_now_ms: f64,
    stats: MonitorStats,
}

impl BreathMonitor {
    pub fn new(config: &PipelineConfig) -> Self {
        Self {
            calibration: CalibrationEngine::new(config),
            processor: BreathProcessor::new(config),
            connected: false,
            device_name: None,
            last_now_ms: 0.0,
            stats: MonitorStats::default(),
        }
    }

    /// Open a calibration window.  Readings stop driving the breath state
    /// until it closes.
    pub fn start_calibration(&mut self, now_ms: f64) {
        self.last_now_ms = now_ms;
        self.calibration.start(now_ms);
    }

    pub fn is_calibrating(&self) -> bool {
        self.calibration.is_calibrating()
    }

    pub fn calibration_seconds_remaining(&self, now_ms: f64) -> u64 {
        self.calibration.seconds_remaining(now_ms)
    }

    /// `true` once a valid profile drives the breath state.
    pub fn is_calibrated(&self) -> bool {
        self.processor.profile().is_some()
    }

    pub fn profile(&self) -> Option<&CalibrationProfile> {
        self.processor.profile()
    }

    pub fn device_name(&self) -> Option<&str> {
        self.device_name.as_deref()
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    pub fn stats(&self) -> MonitorStats {
        self.stats
    }

    /// Feed one event from the connection manager.
    pub fn handle_event(&mut self, event: BeltEvent) -> Option<MonitorEvent> {
        match event {
            BeltEvent::Connected(name) => {
                self.connected = true;
                self.device_name = Some(name.clone());
                Some(MonitorEvent::Connected(name))
            }
            BeltEvent::Sample { force, .. } => {
                self.stats.packets += 1;
                let reading = force?;
                self.stats.decoded += 1;
                self.last_now_ms = reading.timestamp;
                if self.calibration.is_calibrating() {
                    return match self.calibration.on_sample(reading) {
                        CalibrationStatus::Idle => None,
                        CalibrationStatus::Collecting { progress } => {
                            Some(MonitorEvent::CalibrationProgress(progress))
                        }
                        CalibrationStatus::Finished(profile) => Some(self.install(profile)),
                    };
                }
                self.processor.process(reading).map(MonitorEvent::Breath)
            }
            BeltEvent::CommandResponse(bytes) => Some(MonitorEvent::DeviceResponse(bytes)),
            BeltEvent::Disconnected(cause) => {
                self.connected = false;
                self.calibration.cancel();
                match cause {
                    DisconnectCause::LinkLost => {
                        warn!("belt link lost");
                        Some(MonitorEvent::LinkLost)
                    }
                    DisconnectCause::Requested => Some(MonitorEvent::Disconnected),
                }
            }
        }
    }

    /// Countdown tick; closes a calibration window that ran out of time.
    pub fn tick(&mut self, now_ms: f64) -> Option<MonitorEvent> {
        self.last_now_ms = now_ms;
        match self.calibration.tick(now_ms) {
            CalibrationStatus::Idle => None,
            CalibrationStatus::Collecting { progress } => {
                Some(MonitorEvent::CalibrationProgress(progress))
            }
            CalibrationStatus::Finished(profile) => Some(self.install(profile)),
        }
    }

    fn install(&mut self, profile: CalibrationProfile) -> MonitorEvent {
        if self.processor.set_profile(profile) {
            info!("calibration profile installed");
        } else if self.processor.profile().is_some() {
            info!("new calibration invalid; keeping the previous profile");
        }
        MonitorEvent::CalibrationFinished(profile)
    }

    /// Current derived signal.
    pub fn snapshot(&self) -> SignalSnapshot {
        let state = self.processor.state();
        SignalSnapshot {
            amplitude: state.amplitude,
            phase: state.phase,
            rate: state.rate,
            is_connected: self.connected,
            calibration_progress: self.calibration.progress(self.last_now_ms),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ForceReading, RawSample};

    fn sample(value: f32, timestamp: f64) -> BeltEvent {
        BeltEvent::Sample {
            raw: RawSample { bytes: vec![], received_at: timestamp },
            force: Some(ForceReading { value, timestamp }),
        }
    }

    #[test]
    fn calibrates_then_streams_breath() {
        let mut m = BreathMonitor::new(&PipelineConfig::default());
        assert!(matches!(
            m.handle_event(BeltEvent::Connected("GDX-RB 1".into())),
            Some(MonitorEvent::Connected(_))
        ));
        m.start_calibration(0.0);

        let mut finished = None;
        for i in 0..=200 {
            let v = 1.0 + (i % 20) as f32 / 20.0;
            if let Some(MonitorEvent::CalibrationFinished(p)) = m.handle_event(sample(v, i as f64 * 100.0)) {
                finished = Some(p);
                break;
            }
        }
        let p = finished.unwrap();
        assert!(p.is_valid);
        assert!(m.is_calibrated());
        assert_eq!(m.snapshot().calibration_progress, 0.0);

        match m.handle_event(sample(1.95, 21_000.0)) {
            Some(MonitorEvent::Breath(up)) => assert_eq!(up.state.phase, BreathPhase::Inhale),
            other => panic!("unexpected {other:?}"),
        }
        let snap = m.snapshot();
        assert!(snap.is_connected);
        assert!(snap.amplitude > 0.9);
    }

    #[test]
    fn undecodable_samples_are_counted_and_skipped() {
        let mut m = BreathMonitor::new(&PipelineConfig::default());
        let ev = BeltEvent::Sample {
            raw: RawSample { bytes: vec![0, 0], received_at: 0.0 },
            force: None,
        };
        assert_eq!(m.handle_event(ev), None);
        assert_eq!(m.stats(), MonitorStats { packets: 1, decoded: 0 });
    }

    #[test]
    fn link_loss_is_reported_and_cancels_calibration() {
        let mut m = BreathMonitor::new(&PipelineConfig::default());
        m.handle_event(BeltEvent::Connected("GDX-RB 1".into()));
        m.start_calibration(0.0);
        assert_eq!(
            m.handle_event(BeltEvent::Disconnected(DisconnectCause::LinkLost)),
            Some(MonitorEvent::LinkLost)
        );
        assert!(!m.is_connected());
        assert!(!m.is_calibrating());
    }

    #[test]
    fn snapshot_serialises_camel_case() {
        let m = BreathMonitor::new(&PipelineConfig::default());
        let json = serde_json::to_value(m.snapshot()).unwrap();
        assert_eq!(json["isConnected"], false);
        assert_eq!(json["phase"], "pause");
        assert!(json.get("calibrationProgress").is_some());
    }
}
