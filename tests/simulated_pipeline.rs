//! End-to-end run against the simulated belt: connect, calibrate, derive
//! breathing, then lose the link mid-session.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use chrono::{TimeZone, Utc};
use futures::future::BoxFuture;

use breathbelt_rs::belt_client::{now_ms, BeltClientConfig, LinkState};
use breathbelt_rs::config::{PipelineConfig, SessionConfig};
use breathbelt_rs::error::PersistenceError;
use breathbelt_rs::monitor::{BreathMonitor, MonitorEvent};
use breathbelt_rs::parse::ForceDecoder;
use breathbelt_rs::session::{
    ManualClock, MemoryStore, SessionPayload, SessionRecovery, SessionSink, SessionStore,
};
use breathbelt_rs::sim::{spawn_simulated_belt, SimConfig};
use breathbelt_rs::types::{BeltEvent, BreathPhase};

#[derive(Default)]
struct CollectingSink {
    saved: Mutex<Vec<SessionPayload>>,
}

impl SessionSink for CollectingSink {
    fn save<'a>(&'a self, payload: &'a SessionPayload) -> BoxFuture<'a, Result<(), PersistenceError>> {
        Box::pin(async move {
            self.saved.lock().unwrap().push(payload.clone());
            Ok(())
        })
    }
}

#[tokio::test(start_paused = true)]
async fn calibrates_and_tracks_twelve_breaths_per_minute() {
    let (mut rx, handle, link, task) = spawn_simulated_belt(
        BeltClientConfig::default(),
        SimConfig::default(),
        ForceDecoder::default(),
    );
    handle.start().await.unwrap();
    assert!(link.is_streaming());
    assert_eq!(handle.link_state(), LinkState::Streaming);

    let mut monitor = BreathMonitor::new(&PipelineConfig::default());
    monitor.start_calibration(now_ms());

    let mut calibrated_at = None;
    let mut phases = HashSet::new();
    let mut last_ts = 0.0;
    while let Some(event) = rx.recv().await {
        if let BeltEvent::Sample { raw, .. } = &event {
            last_ts = raw.received_at;
        }
        match monitor.handle_event(event) {
            Some(MonitorEvent::CalibrationFinished(profile)) => {
                assert!(profile.is_valid, "{profile:?}");
                assert!(profile.force_range > 1.5);
                calibrated_at = Some(last_ts);
            }
            Some(MonitorEvent::Breath(update)) => {
                phases.insert(update.state.phase);
            }
            _ => {}
        }
        if let Some(start) = calibrated_at {
            if last_ts - start >= 75_000.0 {
                break;
            }
        }
    }

    assert!(monitor.is_calibrated());
    let snap = monitor.snapshot();
    assert!((11..=13).contains(&snap.rate), "rate {}", snap.rate);
    assert!(snap.is_connected);
    assert!(phases.contains(&BreathPhase::Inhale));
    assert!(phases.contains(&BreathPhase::Exhale));
    assert!(monitor.stats().decoded > 900);

    handle.disconnect().await.unwrap();
    let mut closed = false;
    while let Some(event) = rx.recv().await {
        if let Some(MonitorEvent::Disconnected) = monitor.handle_event(event) {
            closed = true;
            break;
        }
    }
    assert!(closed);
    assert!(!monitor.is_connected());
    tokio::time::sleep(std::time::Duration::from_millis(300)).await;
    assert!(task.is_finished());
}

#[tokio::test(start_paused = true)]
async fn link_loss_finishes_the_running_session() {
    let store = Arc::new(MemoryStore::new());
    let sink = Arc::new(CollectingSink::default());
    let clock = ManualClock::new(Utc.with_ymd_and_hms(2026, 7, 1, 5, 45, 0).unwrap());
    let recovery = SessionRecovery::with_clock(
        store.clone(),
        sink.clone(),
        SessionConfig::default(),
        Arc::new(clock.clone()),
    );

    let (mut rx, handle, _link, task) = spawn_simulated_belt(
        BeltClientConfig::default(),
        SimConfig::default(),
        ForceDecoder::default(),
    );
    handle.start().await.unwrap();

    let mut monitor = BreathMonitor::new(&PipelineConfig::default());
    monitor.start_calibration(now_ms());

    let router = handle.router();
    let mut session_start = None;
    let mut last_ts = 0.0;
    let mut final_duration = None;
    while let Some(event) = rx.recv().await {
        if let BeltEvent::Sample { raw, .. } = &event {
            last_ts = raw.received_at;
        }
        match monitor.handle_event(event) {
            Some(MonitorEvent::CalibrationFinished(profile)) if profile.is_valid => {
                recovery.start_session("breath").unwrap();
                session_start = Some(last_ts);
            }
            Some(MonitorEvent::LinkLost) => {
                let start = session_start.unwrap();
                let secs = ((last_ts - start) / 1000.0) as u64;
                clock.advance(chrono::Duration::seconds(secs as i64));
                assert!(recovery.complete_session(secs).await);
                final_duration = Some(secs);
                break;
            }
            _ => {}
        }
        if let Some(start) = session_start {
            if last_ts - start >= 130_000.0 && router.is_open() {
                // Belt walks out of range.
                router.link_lost();
            }
        }
    }

    let secs = final_duration.expect("link loss was not reported");
    assert!((130..=131).contains(&secs), "{secs}");
    assert!(!recovery.is_active());
    assert!(store.load_active().unwrap().is_none());

    let saved = sink.saved.lock().unwrap().clone();
    assert_eq!(saved.len(), 1);
    assert_eq!(saved[0].duration, 120);
    assert_eq!(saved[0].kasina_type, "breath");

    assert!(!monitor.is_connected());
    tokio::time::sleep(std::time::Duration::from_millis(300)).await;
    assert!(task.is_finished());
}
