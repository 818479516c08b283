//! # breathbelt-rs
//!
//! Async Rust library and CLI that turns a Bluetooth LE respiration belt
//! into a live breathing signal, and keeps meditation session records safe
//! across crashes and network failures.
//!
//! The pipeline runs in three layers:
//!
//! 1. **Link**: [`belt_client`] scans for `GDX-RB` belts, subscribes to the
//!    response characteristic, sends the startup commands, and keeps the
//!    stream alive.  Notifications are decoded heuristically by [`parse`]
//!    and delivered through a bounded drop-oldest [`queue`].
//! 2. **Signal**: [`monitor::BreathMonitor`] runs a 20 s [`calibration`]
//!    window, then derives amplitude, phase, and rate with [`breath`].
//! 3. **Sessions**: [`session::SessionRecovery`] checkpoints the active
//!    session to disk, posts it on completion, and retries failed saves on
//!    the next start.
//!
//! ## Quick start
//!
//! ```no_run
//! use breathbelt_rs::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let pipeline = PipelineConfig::default();
//!     let client = BeltClient::new(BeltClientConfig::default());
//!     let (mut rx, handle) = client.connect().await?;
//!
//!     let mut monitor = BreathMonitor::new(&pipeline);
//!     monitor.start_calibration(now_ms());
//!
//!     while let Some(event) = rx.recv().await {
//!         match monitor.handle_event(event) {
//!             Some(MonitorEvent::Breath(update)) => println!("{:?}", update.state),
//!             Some(MonitorEvent::LinkLost) | Some(MonitorEvent::Disconnected) => break,
//!             _ => {}
//!         }
//!     }
//!     handle.disconnect().await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Module overview
//!
//! | Module | Purpose |
//! |---|---|
//! | [`prelude`] | One-line glob import of the common types |
//! | [`protocol`] | GATT UUIDs, command frames, device-name matching |
//! | [`parse`] | Strategy-list force decoding and packet classification |
//! | [`queue`] | Bounded drop-oldest event queue |
//! | [`belt_client`] | Scanning, connecting, heartbeat, teardown |
//! | [`calibration`] | Calibration window and profile |
//! | [`breath`] | Normalisation, phase hysteresis, rate estimation |
//! | [`monitor`] | Owned pipeline context and [`monitor::SignalSnapshot`] |
//! | [`session`] | Session lifecycle, durable records, retry queue |
//! | [`sim`] | Synthetic belt for running without hardware |
//! | [`config`] | All tunable thresholds with their defaults |
//! | [`error`] | Error types |

pub mod belt_client;
pub mod breath;
pub mod calibration;
pub mod config;
pub mod error;
pub mod monitor;
pub mod parse;
pub mod protocol;
pub mod queue;
pub mod session;
pub mod sim;
pub mod types;

// ── Prelude ───────────────────────────────────────────────────────────────────

/// Convenience re-exports for downstream crates.
pub mod prelude {
    // ── Link ──────────────────────────────────────────────────────────────────
    pub use crate::belt_client::{
        now_ms, BeltClient, BeltClientConfig, BeltDevice, BeltHandle, LinkState,
    };
    pub use crate::queue::EventReceiver;

    // ── Signal ────────────────────────────────────────────────────────────────
    pub use crate::breath::{normalize, BreathUpdate};
    pub use crate::config::{AppConfig, PipelineConfig, SessionConfig};
    pub use crate::monitor::{BreathMonitor, MonitorEvent, SignalSnapshot};
    pub use crate::types::{
        BeltEvent, BreathPhase, BreathState, CalibrationProfile, DisconnectCause, ForceReading,
        RawSample,
    };

    // ── Sessions ──────────────────────────────────────────────────────────────
    pub use crate::session::{
        HttpSessionSink, JsonFileStore, MemoryStore, RecoveryReport, SessionRecovery,
        SessionSink, SessionStore,
    };

    // ── Errors ────────────────────────────────────────────────────────────────
    pub use crate::error::{ConnectionError, PersistenceError, SessionError};
}
