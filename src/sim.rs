//! Synthetic respiration belt for running the pipeline without hardware.
//!
//! [`SimulatedLink`] answers commands the way a belt does (streaming starts
//! on start-measurement, stops on stop-measurement) and
//! [`spawn_simulated_belt`] feeds generated packets through the normal
//! notification router, so everything downstream of the BLE stack runs
//! unchanged.

use std::f64::consts::PI;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::BoxFuture;
use log::debug;
use tokio::task::JoinHandle;

use crate::belt_client::{now_ms, BeltClientConfig, BeltHandle, BeltLink};
use crate::error::ConnectionError;
use crate::parse::{ForceDecoder, INTEGER_SCALE};
use crate::protocol::{START_MEASUREMENT_COMMAND, STOP_MEASUREMENT_COMMAND};
use crate::queue::EventReceiver;
use crate::types::{BeltEvent, RawSample};

/// Shape of the generated breathing signal.
#[derive(Debug, Clone, PartialEq)]
pub struct SimConfig {
    pub breaths_per_minute: f64,
    /// Resting force (N).
    pub baseline_force: f32,
    /// Peak deviation from the baseline (N).
    pub depth: f32,
    /// Seconds of breath-hold after each exhale.
    pub hold_secs: f64,
    pub sample_period_ms: u64,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            breaths_per_minute: 12.0,
            baseline_force: 1.4,
            depth: 0.9,
            hold_secs: 0.0,
            sample_period_ms: 100,
        }
    }
}

/// Deterministic breathing waveform.
#[derive(Debug, Clone)]
pub struct BreathSimulator {
    config: SimConfig,
}

impl BreathSimulator {
    pub fn new(config: SimConfig) -> Self {
        Self { config }
    }

    /// Force at `t` seconds into the run.
    ///
    /// A sine at the configured rate plus a slow 0.05 Hz drift of 3 % of the
    /// depth, with an optional flat hold at the bottom of each cycle.
    pub fn force_at(&self, t: f64) -> f32 {
        let c = &self.config;
        let cycle = 60.0 / c.breaths_per_minute.max(0.1);
        let breathing = (cycle - c.hold_secs).max(0.1);
        let pos = t.rem_euclid(cycle);
        let wave = if pos < breathing {
            -(2.0 * PI * pos / breathing).cos()
        } else {
            -1.0
        };
        let drift = 0.03 * (2.0 * PI * 0.05 * t).sin();
        (c.baseline_force as f64 + c.depth as f64 * (wave + drift)) as f32
    }

    /// Encode `force` the way the belt's single-byte channel reports it:
    /// centi-Newtons at offset 1, zero padding around it.
    pub fn encode_packet(force: f32) -> Vec<u8> {
        let counts = (force * INTEGER_SCALE).round().clamp(1.0, 255.0) as u8;
        vec![0x00, counts, 0x00, 0x00]
    }
}

// ── SimulatedLink ─────────────────────────────────────────────────────────────

/// In-process stand-in for the belt's command characteristic.
#[derive(Default)]
pub struct SimulatedLink {
    streaming: AtomicBool,
    released: AtomicBool,
    writes: Mutex<Vec<Vec<u8>>>,
}

impl SimulatedLink {
    pub fn is_streaming(&self) -> bool {
        self.streaming.load(Ordering::SeqCst) && !self.released.load(Ordering::SeqCst)
    }

    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::SeqCst)
    }

    /// Every frame written so far.
    pub fn writes(&self) -> Vec<Vec<u8>> {
        match self.writes.lock() {
            Ok(w) => w.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

impl BeltLink for SimulatedLink {
    fn write(&self, frame: Vec<u8>) -> BoxFuture<'_, Result<(), ConnectionError>> {
        Box::pin(async move {
            if self.released.load(Ordering::SeqCst) {
                return Err(ConnectionError::LinkLost);
            }
            if frame == START_MEASUREMENT_COMMAND {
                self.streaming.store(true, Ordering::SeqCst);
            } else if frame == STOP_MEASUREMENT_COMMAND {
                self.streaming.store(false, Ordering::SeqCst);
            }
            match self.writes.lock() {
                Ok(mut w) => w.push(frame),
                Err(poisoned) => poisoned.into_inner().push(frame),
            }
            Ok(())
        })
    }

    fn release(&self) -> BoxFuture<'_, Result<(), ConnectionError>> {
        Box::pin(async move {
            self.released.store(true, Ordering::SeqCst);
            self.streaming.store(false, Ordering::SeqCst);
            Ok(())
        })
    }

    fn is_connected(&self) -> BoxFuture<'_, bool> {
        Box::pin(async move { !self.released.load(Ordering::SeqCst) })
    }
}

/// Create a simulated belt and its packet generator.
///
/// The returned handle behaves like a freshly subscribed BLE connection:
/// call [`BeltHandle::start`] to begin streaming.  The generator task exits
/// once the handle disconnects.
pub fn spawn_simulated_belt(
    config: BeltClientConfig,
    sim: SimConfig,
    decoder: ForceDecoder,
) -> (EventReceiver<BeltEvent>, BeltHandle, Arc<SimulatedLink>, JoinHandle<()>) {
    let link = Arc::new(SimulatedLink::default());
    let (rx, handle) = BeltHandle::from_link(link.clone(), config, decoder, "GDX-RB SIMULATED");
    let router = handle.router();
    let generator_link = Arc::clone(&link);
    let period = Duration::from_millis(sim.sample_period_ms.max(1));
    let simulator = BreathSimulator::new(sim);

    let task = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        let dt = period.as_secs_f64();
        // Packets carry simulated time, so the signal stays consistent even
        // when the runtime clock is paused or runs slow.
        let origin = now_ms();
        let mut t = 0.0_f64;
        let mut sent = 0u64;
        loop {
            ticker.tick().await;
            if !router.is_open() || generator_link.is_released() {
                break;
            }
            if !generator_link.is_streaming() {
                continue;
            }
            router.route_sample(RawSample {
                bytes: BreathSimulator::encode_packet(simulator.force_at(t)),
                received_at: origin + t * 1000.0,
            });
            t += dt;
            sent += 1;
        }
        debug!("simulator stopped after {sent} packets");
    });

    (rx, handle, link, task)
}
