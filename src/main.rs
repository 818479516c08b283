use std::io::{self, BufRead};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::Utc;
use log::{error, info, warn};

use breathbelt_rs::belt_client::{now_ms, BeltClient, BeltHandle};
use breathbelt_rs::config::AppConfig;
use breathbelt_rs::monitor::{BreathMonitor, MonitorEvent};
use breathbelt_rs::parse::ForceDecoder;
use breathbelt_rs::protocol::CommandKind;
use breathbelt_rs::queue::EventReceiver;
use breathbelt_rs::session::{
    HttpSessionSink, JsonFileStore, MemoryStore, SessionRecovery, SessionStore,
};
use breathbelt_rs::sim::{spawn_simulated_belt, SimConfig};
use breathbelt_rs::types::{BeltEvent, CalibrationProfile};

struct Args {
    simulate: bool,
    config: Option<PathBuf>,
    kasina: String,
}

fn parse_args() -> Result<Args> {
    let mut args = Args {
        simulate: false,
        config: None,
        kasina: "breath".into(),
    };
    let mut it = std::env::args().skip(1);
    while let Some(arg) = it.next() {
        match arg.as_str() {
            "--simulate" => args.simulate = true,
            "--config" => args.config = Some(it.next().context("--config needs a path")?.into()),
            "--kasina" => args.kasina = it.next().context("--kasina needs a name")?,
            "-h" | "--help" => {
                println!("usage: breathbelt [--simulate] [--config PATH] [--kasina NAME]");
                std::process::exit(0);
            }
            other => bail!("unknown argument '{other}'"),
        }
    }
    Ok(args)
}

/// Seconds since the active session started, if there is one.
fn session_elapsed(recovery: &SessionRecovery) -> Option<u64> {
    let active = recovery.status().active?;
    Some((Utc::now() - active.start_time).num_seconds().max(0) as u64)
}

async fn finish_session(recovery: &SessionRecovery) {
    if let Some(secs) = session_elapsed(recovery) {
        if recovery.complete_session(secs).await {
            info!("Session saved ({secs} s).");
        } else {
            info!("Session not saved to server ({secs} s); see log for details.");
        }
    }
}

/// Start a session after a good calibration; re-run a bad one.
fn on_calibrated(
    profile: CalibrationProfile,
    monitor: &mut BreathMonitor,
    recovery: &SessionRecovery,
    kasina: &str,
) {
    if !profile.is_valid {
        warn!(
            "Calibration failed ({} samples, range {:.3} N). Breathe deeper; restarting.",
            profile.sample_count, profile.force_range
        );
        monitor.start_calibration(now_ms());
        return;
    }
    info!(
        "Calibrated: {:.2}–{:.2} N over {} samples.",
        profile.min_force, profile.max_force, profile.sample_count
    );
    if !recovery.is_active() {
        match recovery.start_session(kasina) {
            Ok(id) => info!("Session {id} started."),
            Err(e) => warn!("{e}"),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // ── Logging ───────────────────────────────────────────────────────────────
    // RUST_LOG=breathbelt_rs=debug for per-packet output.
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = parse_args()?;
    let config = match &args.config {
        Some(path) => AppConfig::load(path)?,
        None => AppConfig::default(),
    };

    // ── Sessions ──────────────────────────────────────────────────────────────
    let store: Arc<dyn SessionStore> = match JsonFileStore::new(&config.storage_dir) {
        Ok(store) => Arc::new(store),
        Err(e) => {
            warn!(
                "Cannot use {} for session records ({e}); sessions will not survive a restart.",
                config.storage_dir.display()
            );
            Arc::new(MemoryStore::new())
        }
    };
    let sink = Arc::new(HttpSessionSink::new(&config.server_url)?);
    let recovery = SessionRecovery::new(store, sink, config.session.clone());
    let report = recovery.check_for_recovery().await;
    if report.retried > 0 || report.still_queued > 0 {
        info!(
            "Retry queue: {} saved, {} still waiting.",
            report.retried, report.still_queued
        );
    }

    // ── Connect ───────────────────────────────────────────────────────────────
    let decoder = ForceDecoder::new(
        config.pipeline.plausible_min_force,
        config.pipeline.plausible_max_force,
    );
    let (mut rx, handle): (EventReceiver<BeltEvent>, BeltHandle) = if args.simulate {
        info!("Running with a simulated belt.");
        let (rx, handle, _link, _task) =
            spawn_simulated_belt(config.belt.clone(), SimConfig::default(), decoder);
        handle.start().await?;
        handle.start_heartbeat();
        (rx, handle)
    } else {
        info!("Connecting to respiration belt …");
        let client = BeltClient::new(config.belt.clone()).with_decoder(decoder);
        match client.connect().await {
            Ok(pair) => pair,
            Err(e) => {
                error!("{}", e.user_message());
                return Err(e.into());
            }
        }
    };

    info!("Commands (type + Enter):");
    info!("  q  – quit (saves the session)");
    info!("  c  – recalibrate");
    info!("  s  – start a session");
    info!("  e  – end the session");
    info!("  i  – request device info");
    info!("  <command name> – send a raw device command, e.g. sensor-list\n");

    // ── Stdin ─────────────────────────────────────────────────────────────────
    // Read on an OS thread; StdinLock is not Send.
    let (line_tx, mut line_rx) = tokio::sync::mpsc::unbounded_channel::<String>();
    std::thread::spawn(move || {
        let stdin = io::stdin();
        for line in stdin.lock().lines() {
            match line {
                Ok(l) => {
                    if line_tx.send(l.trim().to_owned()).is_err() {
                        break;
                    }
                }
                Err(_) => break,
            }
        }
    });

    // ── Main loop ─────────────────────────────────────────────────────────────
    let mut monitor = BreathMonitor::new(&config.pipeline);
    monitor.start_calibration(now_ms());
    info!("Calibrating: breathe normally for {} s.", monitor.calibration_seconds_remaining(now_ms()));

    let mut ticker = tokio::time::interval(Duration::from_secs(1));
    loop {
        tokio::select! {
            event = rx.recv() => {
                let Some(event) = event else { break };
                match monitor.handle_event(event) {
                    Some(MonitorEvent::Connected(name)) => info!("Connected to: {name}"),
                    Some(MonitorEvent::CalibrationFinished(profile)) => {
                        on_calibrated(profile, &mut monitor, &recovery, &args.kasina);
                    }
                    Some(MonitorEvent::Breath(update)) => {
                        if update.phase_changed || update.rate_changed {
                            println!(
                                "[BREATH] phase={:6}  rate={:2} bpm  amplitude={:.2}",
                                update.state.phase, update.state.rate, update.state.amplitude
                            );
                        }
                    }
                    Some(MonitorEvent::DeviceResponse(bytes)) => {
                        println!("[DEVICE] {bytes:02x?}");
                    }
                    Some(MonitorEvent::LinkLost) => {
                        error!("{}", breathbelt_rs::error::ConnectionError::LinkLost.user_message());
                        finish_session(&recovery).await;
                        break;
                    }
                    Some(MonitorEvent::Disconnected) => break,
                    Some(MonitorEvent::CalibrationProgress(_)) | None => {}
                }
            }

            Some(line) = line_rx.recv() => {
                match line.as_str() {
                    "" => {}
                    "q" => {
                        info!("Quit requested.");
                        finish_session(&recovery).await;
                        break;
                    }
                    "c" => {
                        monitor.start_calibration(now_ms());
                        info!("Recalibrating …");
                    }
                    "s" => match recovery.start_session(&args.kasina) {
                        Ok(id) => info!("Session {id} started."),
                        Err(e) => warn!("{e}"),
                    },
                    "e" => {
                        if recovery.is_active() {
                            finish_session(&recovery).await;
                        } else {
                            warn!("No session is running.");
                        }
                    }
                    "i" => {
                        if let Err(e) = handle.request_device_info().await {
                            error!("Device info error: {}", e.user_message());
                        }
                    }
                    cmd => match CommandKind::from_name(cmd) {
                        Ok(kind) => {
                            if let Err(e) = handle.send_command(kind).await {
                                error!("Command error: {}", e.user_message());
                            }
                        }
                        Err(e) => warn!("{e}"),
                    },
                }
            }

            _ = ticker.tick() => {
                let now = now_ms();
                if monitor.is_calibrating() {
                    let left = monitor.calibration_seconds_remaining(now);
                    if left > 0 {
                        println!("[CALIBRATING] {left:2} s left");
                    }
                    if let Some(MonitorEvent::CalibrationFinished(profile)) = monitor.tick(now) {
                        on_calibrated(profile, &mut monitor, &recovery, &args.kasina);
                    }
                }
            }

            _ = tokio::signal::ctrl_c() => {
                warn!("Interrupted.");
                if recovery.is_active() {
                    if let Err(e) = recovery.emergency_checkpoint("interrupted") {
                        warn!("Emergency checkpoint failed: {e}");
                    }
                    finish_session(&recovery).await;
                }
                break;
            }
        }
    }

    handle.disconnect().await.ok();
    let snap = monitor.snapshot();
    info!(
        "Done. Last reading: phase={} rate={} bpm ({} packets, {} decoded).",
        snap.phase,
        snap.rate,
        monitor.stats().packets,
        monitor.stats().decoded
    );
    Ok(())
}
