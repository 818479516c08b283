//! Crash-safe meditation session tracking.
//!
//! [`SessionRecovery`] owns at most one active session.  The session is
//! written to durable storage as soon as it starts and refreshed by a
//! checkpoint task, so a crash leaves a record behind.  On completion the
//! rounded duration is sent through a [`SessionSink`]; if that fails the
//! session moves to a retry queue instead of being lost.
//!
//! ```text
//! Idle ──start──▶ Active ──complete──▶ Completing ──▶ Saved
//!                   │  ▲                          ├──▶ QueuedForRetry
//!                   └──┘ checkpoint               └──▶ Discarded (< 1 min)
//! ```
//!
//! [`SessionRecovery::check_for_recovery`] runs once at startup and deals
//! with whatever a previous process left behind.

pub mod sink;
pub mod store;

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::config::SessionConfig;
use crate::error::SessionError;

pub use sink::{HttpSessionSink, SessionSink};
pub use store::{JsonFileStore, MemoryStore, SessionStore};

// ── Records ───────────────────────────────────────────────────────────────────

/// The in-progress session as written to durable storage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActiveSession {
    pub session_id: String,
    pub kasina_type: String,
    pub start_time: DateTime<Utc>,
    pub last_update: DateTime<Utc>,
    pub duration_seconds: u64,
}

/// A completed session the server did not accept.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FailedSessionRecord {
    #[serde(flatten)]
    pub session: ActiveSession,
    pub failed_at: DateTime<Utc>,
}

/// Last-resort snapshot written right before a risky transition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EmergencyCheckpoint {
    pub session_id: String,
    pub kasina_type: String,
    /// Seconds meditated when the checkpoint was taken.
    pub duration: u64,
    pub timestamp: DateTime<Utc>,
    pub reason: String,
}

/// Body of `POST /sessions`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionPayload {
    pub kasina_type: String,
    /// Whole minutes, in seconds.
    pub duration: u64,
    pub timestamp: DateTime<Utc>,
}

/// Round `seconds` down to whole minutes; `None` when the session is shorter
/// than `min_secs` and must not be saved at all.
///
/// ```
/// # use breathbelt_rs::session::rounded_duration;
/// assert_eq!(rounded_duration(125, 60), Some(120));
/// assert_eq!(rounded_duration(59, 60), None);
/// ```
pub fn rounded_duration(seconds: u64, min_secs: u64) -> Option<u64> {
    if seconds < min_secs.max(1) {
        return None;
    }
    let whole = seconds - seconds % 60;
    (whole > 0).then_some(whole)
}

// ── Clock ─────────────────────────────────────────────────────────────────────

/// Source of wall-clock time for session records.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A clock that only moves when told to.
#[derive(Clone)]
pub struct ManualClock {
    now: Arc<Mutex<DateTime<Utc>>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self { now: Arc::new(Mutex::new(start)) }
    }

    pub fn advance(&self, by: chrono::Duration) {
        *lock(&self.now) += by;
    }

    pub fn set(&self, to: DateTime<Utc>) {
        *lock(&self.now) = to;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *lock(&self.now)
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    match m.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

// ── Status ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    Idle,
    Active,
    Completing,
    Saved,
    QueuedForRetry,
    /// Shorter than the minimum; nothing was stored.
    Discarded,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionStatus {
    pub phase: SessionPhase,
    pub active: Option<ActiveSession>,
    pub failed_queue_len: usize,
}

/// What one recovery step did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecoveryAction {
    NothingFound,
    Saved,
    Queued,
    /// Stale or too short; cleared without saving.
    Discarded,
    /// The record belongs to the session running in this process.
    Skipped,
    /// The step could not read its record.
    Failed(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecoveryReport {
    pub emergency: RecoveryAction,
    pub active: RecoveryAction,
    /// Queued sessions saved on this pass.
    pub retried: usize,
    /// Sessions still waiting in the queue.
    pub still_queued: usize,
    pub retry_error: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Saved,
    Queued,
    Discarded,
}

// ── SessionRecovery ───────────────────────────────────────────────────────────

struct Inner {
    active: Option<ActiveSession>,
    phase: SessionPhase,
    /// `update_session` has been called; checkpoints keep its duration.
    externally_driven: bool,
    checkpoint: Option<JoinHandle<()>>,
}

impl Inner {
    fn stop_checkpoint(&mut self) {
        if let Some(task) = self.checkpoint.take() {
            task.abort();
        }
    }
}

/// Owns the active session and its durable records.
pub struct SessionRecovery {
    store: Arc<dyn SessionStore>,
    sink: Arc<dyn SessionSink>,
    clock: Arc<dyn Clock>,
    config: SessionConfig,
    inner: Arc<Mutex<Inner>>,
}

impl SessionRecovery {
    pub fn new(store: Arc<dyn SessionStore>, sink: Arc<dyn SessionSink>, config: SessionConfig) -> Self {
        Self::with_clock(store, sink, config, Arc::new(SystemClock))
    }

    pub fn with_clock(
        store: Arc<dyn SessionStore>,
        sink: Arc<dyn SessionSink>,
        config: SessionConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            sink,
            clock,
            config,
            inner: Arc::new(Mutex::new(Inner {
                active: None,
                phase: SessionPhase::Idle,
                externally_driven: false,
                checkpoint: None,
            })),
        }
    }

    pub fn is_active(&self) -> bool {
        lock(&self.inner).active.is_some()
    }

    pub fn status(&self) -> SessionStatus {
        let inner = lock(&self.inner);
        SessionStatus {
            phase: inner.phase,
            active: inner.active.clone(),
            failed_queue_len: self.store.failed_list().map(|q| q.len()).unwrap_or(0),
        }
    }

    /// Begin a session and persist it immediately.
    ///
    /// Must be called inside a tokio runtime: the checkpoint task is spawned
    /// here.
    pub fn start_session(&self, kasina_type: &str) -> Result<String, SessionError> {
        let mut inner = lock(&self.inner);
        if let Some(active) = &inner.active {
            return Err(SessionError::AlreadyActive(active.session_id.clone()));
        }
        let now = self.clock.now();
        let session = ActiveSession {
            session_id: Uuid::new_v4().to_string(),
            kasina_type: kasina_type.to_owned(),
            start_time: now,
            last_update: now,
            duration_seconds: 0,
        };
        if let Err(e) = self.store.save_active(&session) {
            warn!("could not persist new session: {e}");
        }
        let id = session.session_id.clone();
        inner.active = Some(session);
        inner.phase = SessionPhase::Active;
        inner.externally_driven = false;
        inner.stop_checkpoint();
        inner.checkpoint = Some(self.spawn_checkpoint());
        info!("session {id} started ({kasina_type})");
        Ok(id)
    }

    fn spawn_checkpoint(&self) -> JoinHandle<()> {
        let inner = Arc::clone(&self.inner);
        let store = Arc::clone(&self.store);
        let clock = Arc::clone(&self.clock);
        let period = Duration::from_secs(self.config.checkpoint_interval_secs.max(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                // The lock is held across the write so a concurrent
                // completion cannot be overwritten by a stale checkpoint.
                let mut guard = lock(&inner);
                let driven = guard.externally_driven;
                let Some(active) = guard.active.as_mut() else {
                    break;
                };
                let now = clock.now();
                active.last_update = now;
                if !driven {
                    active.duration_seconds = elapsed_secs(active.start_time, now);
                }
                match store.save_active(active) {
                    Ok(()) => debug!("checkpoint {} at {}s", active.session_id, active.duration_seconds),
                    Err(e) => warn!("checkpoint write failed: {e}"),
                }
            }
        })
    }

    /// Refresh the duration between checkpoints.
    pub fn update_session(&self, duration_seconds: u64) -> Result<(), SessionError> {
        let mut guard = lock(&self.inner);
        let inner = &mut *guard;
        let active = inner.active.as_mut().ok_or(SessionError::NoActiveSession)?;
        inner.externally_driven = true;
        active.duration_seconds = duration_seconds;
        active.last_update = self.clock.now();
        if let Err(e) = self.store.save_active(active) {
            warn!("session update write failed: {e}");
        }
        Ok(())
    }

    /// Finish the active session.
    ///
    /// Returns `true` only when the session reached the server.  Sessions
    /// under the minimum length are discarded and return `false`, as do
    /// sessions that went to the retry queue.  The active record is cleared
    /// in every case.
    pub async fn complete_session(&self, final_duration_seconds: u64) -> bool {
        let session = {
            let mut inner = lock(&self.inner);
            inner.stop_checkpoint();
            let Some(mut session) = inner.active.take() else {
                warn!("complete_session called with no active session");
                return false;
            };
            inner.phase = SessionPhase::Completing;
            session.duration_seconds = final_duration_seconds;
            session.last_update = self.clock.now();
            session
        };

        let id = session.session_id.clone();
        let outcome = self.persist(session).await;
        self.clear_active_for(&id);
        self.clear_emergency_for(&id);
        let mut inner = lock(&self.inner);
        // A session started while the sink was busy owns the phase now.
        if inner.active.is_none() {
            inner.phase = match outcome {
                Outcome::Saved => SessionPhase::Saved,
                Outcome::Queued => SessionPhase::QueuedForRetry,
                Outcome::Discarded => SessionPhase::Discarded,
            };
        }
        outcome == Outcome::Saved
    }

    /// Drop the active session without saving it.
    pub fn abandon_session(&self) -> Result<ActiveSession, SessionError> {
        let session = {
            let mut inner = lock(&self.inner);
            inner.stop_checkpoint();
            let session = inner.active.take().ok_or(SessionError::NoActiveSession)?;
            inner.phase = SessionPhase::Idle;
            session
        };
        self.clear_active_for(&session.session_id);
        self.clear_emergency_for(&session.session_id);
        info!("session {} abandoned", session.session_id);
        Ok(session)
    }

    /// Synchronously write a single overwritable snapshot of the active
    /// session.
    pub fn emergency_checkpoint(&self, reason: &str) -> Result<(), SessionError> {
        let inner = lock(&self.inner);
        let active = inner.active.as_ref().ok_or(SessionError::NoActiveSession)?;
        let now = self.clock.now();
        let duration = if inner.externally_driven {
            active.duration_seconds
        } else {
            elapsed_secs(active.start_time, now)
        };
        let checkpoint = EmergencyCheckpoint {
            session_id: active.session_id.clone(),
            kasina_type: active.kasina_type.clone(),
            duration,
            timestamp: now,
            reason: reason.to_owned(),
        };
        self.store.save_emergency(&checkpoint)?;
        info!("emergency checkpoint ({reason}) at {duration}s");
        Ok(())
    }

    /// Remove the durable active record, but only while it still belongs to
    /// `session_id`; a newer session may have replaced it.
    fn clear_active_for(&self, session_id: &str) {
        match self.store.load_active() {
            Ok(Some(active)) if active.session_id != session_id => {
                debug!("active record now belongs to {}; kept", active.session_id);
            }
            Ok(_) => {
                if let Err(e) = self.store.clear_active() {
                    warn!("could not clear active session record: {e}");
                }
            }
            Err(e) => warn!("could not read active session record: {e}"),
        }
    }

    /// A finished session must not come back through its emergency record.
    fn clear_emergency_for(&self, session_id: &str) {
        match self.store.load_emergency() {
            Ok(Some(cp)) if cp.session_id == session_id => {
                if let Err(e) = self.store.clear_emergency() {
                    warn!("could not clear emergency checkpoint: {e}");
                }
            }
            Ok(_) => {}
            Err(e) => warn!("could not read emergency checkpoint: {e}"),
        }
    }

    /// Send a finished session, queueing it on failure.
    async fn persist(&self, session: ActiveSession) -> Outcome {
        let Some(duration) = rounded_duration(session.duration_seconds, self.config.min_session_secs)
        else {
            info!(
                "session {} too short ({}s); not saved",
                session.session_id, session.duration_seconds
            );
            return Outcome::Discarded;
        };
        let payload = SessionPayload {
            kasina_type: session.kasina_type.clone(),
            duration,
            timestamp: session.last_update,
        };
        match self.sink.save(&payload).await {
            Ok(()) => {
                info!("session {} saved ({}s)", session.session_id, duration);
                Outcome::Saved
            }
            Err(e) => {
                warn!("session {} not saved, queued for retry: {e}", session.session_id);
                let record = FailedSessionRecord {
                    session,
                    failed_at: self.clock.now(),
                };
                if let Err(e) = self.store.failed_insert(record, self.config.failed_queue_limit) {
                    warn!("could not queue failed session: {e}");
                }
                Outcome::Queued
            }
        }
    }

    // ── Recovery ──────────────────────────────────────────────────────────────

    /// Deal with records left by a previous process.
    ///
    /// The emergency checkpoint, the active-session record, and the retry
    /// queue are handled independently; a failure in one does not stop the
    /// others.  Sessions queued during this pass are not retried until the
    /// next one.
    pub async fn check_for_recovery(&self) -> RecoveryReport {
        let mut queued_now = HashSet::new();
        let emergency = self.recover_emergency(&mut queued_now).await;
        let active = self.recover_active(&mut queued_now).await;
        let (retried, still_queued, retry_error) = self.retry_failed(&queued_now).await;
        let report = RecoveryReport {
            emergency,
            active,
            retried,
            still_queued,
            retry_error,
        };
        info!("recovery: {report:?}");
        report
    }

    fn running_session_id(&self) -> Option<String> {
        lock(&self.inner).active.as_ref().map(|a| a.session_id.clone())
    }

    async fn recover_emergency(&self, queued_now: &mut HashSet<String>) -> RecoveryAction {
        let checkpoint = match self.store.load_emergency() {
            Ok(Some(c)) => c,
            Ok(None) => return RecoveryAction::NothingFound,
            Err(e) => return RecoveryAction::Failed(e.to_string()),
        };
        if self.running_session_id().as_deref() == Some(checkpoint.session_id.as_str()) {
            return RecoveryAction::Skipped;
        }

        let now = self.clock.now();
        let age = (now - checkpoint.timestamp).num_seconds();
        let action = if age > self.config.emergency_max_age_secs {
            info!("emergency checkpoint {age}s old; discarded");
            RecoveryAction::Discarded
        } else {
            // The active record for the same session would otherwise be
            // recovered a second time in the next step.
            if let Ok(Some(active)) = self.store.load_active() {
                if active.session_id == checkpoint.session_id {
                    if let Err(e) = self.store.clear_active() {
                        warn!("could not clear active record superseded by checkpoint: {e}");
                    }
                }
            }
            let session = ActiveSession {
                session_id: checkpoint.session_id.clone(),
                kasina_type: checkpoint.kasina_type.clone(),
                start_time: checkpoint.timestamp - chrono::Duration::seconds(checkpoint.duration as i64),
                last_update: checkpoint.timestamp,
                duration_seconds: checkpoint.duration,
            };
            self.outcome_action(session, queued_now).await
        };

        if let Err(e) = self.store.clear_emergency() {
            warn!("could not clear emergency checkpoint: {e}");
        }
        action
    }

    async fn recover_active(&self, queued_now: &mut HashSet<String>) -> RecoveryAction {
        let session = match self.store.load_active() {
            Ok(Some(s)) => s,
            Ok(None) => return RecoveryAction::NothingFound,
            Err(e) => return RecoveryAction::Failed(e.to_string()),
        };
        if self.running_session_id().as_deref() == Some(session.session_id.as_str()) {
            return RecoveryAction::Skipped;
        }

        let age = (self.clock.now() - session.last_update).num_seconds();
        let action = if age > self.config.active_stale_after_secs {
            info!("abandoned session {} is {age}s stale; cleared", session.session_id);
            RecoveryAction::Discarded
        } else {
            info!(
                "recovering session {} at {}s",
                session.session_id, session.duration_seconds
            );
            self.outcome_action(session, queued_now).await
        };

        if let Err(e) = self.store.clear_active() {
            warn!("could not clear recovered session: {e}");
        }
        action
    }

    async fn outcome_action(
        &self,
        session: ActiveSession,
        queued_now: &mut HashSet<String>,
    ) -> RecoveryAction {
        let id = session.session_id.clone();
        match self.persist(session).await {
            Outcome::Saved => RecoveryAction::Saved,
            Outcome::Queued => {
                queued_now.insert(id);
                RecoveryAction::Queued
            }
            Outcome::Discarded => RecoveryAction::Discarded,
        }
    }

    async fn retry_failed(&self, skip: &HashSet<String>) -> (usize, usize, Option<String>) {
        let records = match self.store.failed_list() {
            Ok(r) => r,
            Err(e) => return (0, 0, Some(e.to_string())),
        };
        let mut retried = 0;
        let mut remaining = 0;
        for record in records {
            let id = record.session.session_id.clone();
            if skip.contains(&id) {
                remaining += 1;
                continue;
            }
            let Some(duration) =
                rounded_duration(record.session.duration_seconds, self.config.min_session_secs)
            else {
                if let Err(e) = self.store.failed_remove(&id) {
                    warn!("could not drop too-short queued session {id}: {e}");
                }
                continue;
            };
            let payload = SessionPayload {
                kasina_type: record.session.kasina_type.clone(),
                duration,
                timestamp: record.session.last_update,
            };
            match self.sink.save(&payload).await {
                Ok(()) => {
                    info!("queued session {id} saved on retry");
                    retried += 1;
                    if let Err(e) = self.store.failed_remove(&id) {
                        warn!("saved {id} but could not remove it from the queue: {e}");
                    }
                }
                Err(e) => {
                    debug!("retry of {id} failed: {e}");
                    remaining += 1;
                }
            }
        }
        (retried, remaining, None)
    }
}

impl Drop for SessionRecovery {
    fn drop(&mut self) {
        lock(&self.inner).stop_checkpoint();
    }
}

fn elapsed_secs(start: DateTime<Utc>, now: DateTime<Utc>) -> u64 {
    (now - start).num_seconds().max(0) as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::PersistenceError;
    use chrono::TimeZone;
    use futures::future::BoxFuture;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    #[derive(Default)]
    struct RecordingSink {
        fail: AtomicBool,
        attempts: AtomicUsize,
        saved: Mutex<Vec<SessionPayload>>,
    }

    impl RecordingSink {
        fn saved(&self) -> Vec<SessionPayload> {
            lock(&self.saved).clone()
        }
    }

    impl SessionSink for RecordingSink {
        fn save<'a>(&'a self, payload: &'a SessionPayload) -> BoxFuture<'a, Result<(), PersistenceError>> {
            Box::pin(async move {
                self.attempts.fetch_add(1, Ordering::SeqCst);
                if self.fail.load(Ordering::SeqCst) {
                    return Err(PersistenceError::Server { status: 500 });
                }
                lock(&self.saved).push(payload.clone());
                Ok(())
            })
        }
    }

    struct Fixture {
        store: Arc<MemoryStore>,
        sink: Arc<RecordingSink>,
        clock: ManualClock,
        recovery: SessionRecovery,
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 5, 4, 6, 30, 0).unwrap()
    }

    fn fixture() -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let sink = Arc::new(RecordingSink::default());
        let clock = ManualClock::new(t0());
        let recovery = SessionRecovery::with_clock(
            store.clone(),
            sink.clone(),
            SessionConfig::default(),
            Arc::new(clock.clone()),
        );
        Fixture { store, sink, clock, recovery }
    }

    fn leftover(id: &str, duration: u64, last_update: DateTime<Utc>) -> ActiveSession {
        ActiveSession {
            session_id: id.into(),
            kasina_type: "earth".into(),
            start_time: last_update - chrono::Duration::seconds(duration as i64),
            last_update,
            duration_seconds: duration,
        }
    }

    #[test]
    fn rounding_rules() {
        assert_eq!(rounded_duration(0, 60), None);
        assert_eq!(rounded_duration(59, 60), None);
        assert_eq!(rounded_duration(60, 60), Some(60));
        assert_eq!(rounded_duration(125, 60), Some(120));
        assert_eq!(rounded_duration(3599, 60), Some(3540));
    }

    #[tokio::test]
    async fn short_session_never_reaches_sink() {
        let f = fixture();
        f.recovery.start_session("fire").unwrap();
        assert!(!f.recovery.complete_session(59).await);
        assert_eq!(f.sink.attempts.load(Ordering::SeqCst), 0);
        assert!(f.store.failed_list().unwrap().is_empty());
        assert!(f.store.load_active().unwrap().is_none());
        assert_eq!(f.recovery.status().phase, SessionPhase::Discarded);
    }

    #[tokio::test]
    async fn duration_is_rounded_down_to_minutes() {
        let f = fixture();
        f.recovery.start_session("fire").unwrap();
        assert!(f.recovery.complete_session(125).await);
        let saved = f.sink.saved();
        assert_eq!(saved.len(), 1);
        assert_eq!(saved[0].duration, 120);
        assert_eq!(saved[0].kasina_type, "fire");
        assert!(f.store.load_active().unwrap().is_none());
        assert_eq!(f.recovery.status().phase, SessionPhase::Saved);
    }

    #[tokio::test]
    async fn failed_save_is_queued_once_and_retried_once() {
        let f = fixture();
        f.sink.fail.store(true, Ordering::SeqCst);
        f.recovery.start_session("water").unwrap();
        assert!(!f.recovery.complete_session(300).await);

        let queue = f.store.failed_list().unwrap();
        assert_eq!(queue.len(), 1);
        assert_eq!(queue[0].session.duration_seconds, 300);
        assert!(f.store.load_active().unwrap().is_none());
        assert_eq!(f.recovery.status().phase, SessionPhase::QueuedForRetry);

        f.sink.fail.store(false, Ordering::SeqCst);
        let report = f.recovery.check_for_recovery().await;
        assert_eq!(report.retried, 1);
        assert_eq!(report.still_queued, 0);
        assert!(f.store.failed_list().unwrap().is_empty());

        let again = f.recovery.check_for_recovery().await;
        assert_eq!(again.retried, 0);
        assert_eq!(f.sink.saved().len(), 1);
        assert_eq!(f.sink.saved()[0].duration, 300);
    }

    #[tokio::test]
    async fn retry_keeps_entries_that_still_fail() {
        let f = fixture();
        f.sink.fail.store(true, Ordering::SeqCst);
        for _ in 0..2 {
            f.recovery.start_session("air").unwrap();
            f.recovery.complete_session(120).await;
        }
        let report = f.recovery.check_for_recovery().await;
        assert_eq!(report.retried, 0);
        assert_eq!(report.still_queued, 2);
        assert_eq!(f.store.failed_list().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn second_start_is_rejected() {
        let f = fixture();
        let id = f.recovery.start_session("fire").unwrap();
        match f.recovery.start_session("water") {
            Err(SessionError::AlreadyActive(active)) => assert_eq!(active, id),
            other => panic!("unexpected {other:?}"),
        }
        f.recovery.abandon_session().unwrap();
        assert!(f.store.load_active().unwrap().is_none());
        f.recovery.start_session("water").unwrap();
    }

    #[tokio::test]
    async fn stale_active_session_is_cleared_without_saving() {
        let f = fixture();
        f.store
            .save_active(&leftover("old", 600, t0() - chrono::Duration::seconds(121)))
            .unwrap();
        let report = f.recovery.check_for_recovery().await;
        assert_eq!(report.active, RecoveryAction::Discarded);
        assert_eq!(f.sink.attempts.load(Ordering::SeqCst), 0);
        assert!(f.store.load_active().unwrap().is_none());
    }

    #[tokio::test]
    async fn fresh_active_session_is_completed_once() {
        let f = fixture();
        f.store
            .save_active(&leftover("recent", 605, t0() - chrono::Duration::seconds(90)))
            .unwrap();
        let report = f.recovery.check_for_recovery().await;
        assert_eq!(report.active, RecoveryAction::Saved);
        assert_eq!(f.sink.attempts.load(Ordering::SeqCst), 1);
        assert_eq!(f.sink.saved()[0].duration, 600);
        assert!(f.store.load_active().unwrap().is_none());

        f.recovery.check_for_recovery().await;
        assert_eq!(f.sink.attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn old_emergency_checkpoint_is_discarded() {
        let f = fixture();
        f.store
            .save_emergency(&EmergencyCheckpoint {
                session_id: "e".into(),
                kasina_type: "fire".into(),
                duration: 900,
                timestamp: t0() - chrono::Duration::minutes(10),
                reason: "exit-fullscreen".into(),
            })
            .unwrap();
        let report = f.recovery.check_for_recovery().await;
        assert_eq!(report.emergency, RecoveryAction::Discarded);
        assert_eq!(f.sink.attempts.load(Ordering::SeqCst), 0);
        assert!(f.store.load_emergency().unwrap().is_none());
    }

    #[tokio::test]
    async fn recent_emergency_checkpoint_supersedes_active_record() {
        let f = fixture();
        let when = t0() - chrono::Duration::seconds(60);
        f.store.save_active(&leftover("s1", 240, when)).unwrap();
        f.store
            .save_emergency(&EmergencyCheckpoint {
                session_id: "s1".into(),
                kasina_type: "earth".into(),
                duration: 250,
                timestamp: when,
                reason: "exit-fullscreen".into(),
            })
            .unwrap();
        let report = f.recovery.check_for_recovery().await;
        assert_eq!(report.emergency, RecoveryAction::Saved);
        assert_eq!(report.active, RecoveryAction::NothingFound);
        assert_eq!(f.sink.saved().len(), 1);
        assert_eq!(f.sink.saved()[0].duration, 240);
    }

    #[tokio::test]
    async fn emergency_checkpoint_requires_a_session() {
        let f = fixture();
        assert!(matches!(
            f.recovery.emergency_checkpoint("exit-fullscreen"),
            Err(SessionError::NoActiveSession)
        ));
        f.recovery.start_session("fire").unwrap();
        f.clock.advance(chrono::Duration::seconds(95));
        f.recovery.emergency_checkpoint("exit-fullscreen").unwrap();
        let cp = f.store.load_emergency().unwrap().unwrap();
        assert_eq!(cp.duration, 95);
        assert_eq!(cp.reason, "exit-fullscreen");

        assert!(f.recovery.complete_session(95).await);
        assert!(f.store.load_emergency().unwrap().is_none());
        f.recovery.check_for_recovery().await;
        assert_eq!(f.sink.saved().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn checkpoint_task_refreshes_the_record() {
        let f = fixture();
        f.recovery.start_session("fire").unwrap();
        f.clock.advance(chrono::Duration::seconds(30));
        tokio::time::sleep(Duration::from_secs(31)).await;
        let stored = f.store.load_active().unwrap().unwrap();
        assert_eq!(stored.duration_seconds, 30);
        assert_eq!(stored.last_update, t0() + chrono::Duration::seconds(30));

        f.recovery.update_session(12).unwrap();
        f.clock.advance(chrono::Duration::seconds(30));
        tokio::time::sleep(Duration::from_secs(30)).await;
        let stored = f.store.load_active().unwrap().unwrap();
        assert_eq!(stored.duration_seconds, 12);
        assert_eq!(stored.last_update, t0() + chrono::Duration::seconds(60));
    }

    #[tokio::test(start_paused = true)]
    async fn storage_failures_do_not_stop_the_session() {
        let f = fixture();
        f.store.set_fail_writes(true);
        f.recovery.start_session("fire").unwrap();
        f.clock.advance(chrono::Duration::seconds(90));
        tokio::time::sleep(Duration::from_secs(95)).await;
        assert!(f.recovery.is_active());
        assert!(f.recovery.complete_session(90).await);
        assert_eq!(f.sink.saved()[0].duration, 60);
    }

    /// Holds every save until released.
    #[derive(Default)]
    struct GatedSink {
        entered: tokio::sync::Notify,
        release: tokio::sync::Notify,
    }

    impl SessionSink for GatedSink {
        fn save<'a>(&'a self, _payload: &'a SessionPayload) -> BoxFuture<'a, Result<(), PersistenceError>> {
            Box::pin(async move {
                self.entered.notify_one();
                self.release.notified().await;
                Ok(())
            })
        }
    }

    #[tokio::test]
    async fn session_started_during_completion_keeps_its_record() {
        let store = Arc::new(MemoryStore::new());
        let sink = Arc::new(GatedSink::default());
        let recovery = Arc::new(SessionRecovery::with_clock(
            store.clone(),
            sink.clone(),
            SessionConfig::default(),
            Arc::new(ManualClock::new(t0())),
        ));
        recovery.start_session("fire").unwrap();

        let finishing = {
            let recovery = Arc::clone(&recovery);
            tokio::spawn(async move { recovery.complete_session(300).await })
        };
        sink.entered.notified().await;

        let second = recovery.start_session("water").unwrap();
        assert_eq!(
            store.load_active().unwrap().map(|s| s.session_id),
            Some(second.clone())
        );
        sink.release.notify_one();
        assert!(finishing.await.unwrap());

        assert!(recovery.is_active());
        assert_eq!(recovery.status().phase, SessionPhase::Active);
        assert_eq!(
            store.load_active().unwrap().map(|s| s.session_id),
            Some(second)
        );
    }

    #[tokio::test]
    async fn too_short_queued_session_is_dropped_even_after_a_failed_removal() {
        let f = fixture();
        f.store
            .failed_insert(
                FailedSessionRecord {
                    session: leftover("short", 30, t0()),
                    failed_at: t0(),
                },
                50,
            )
            .unwrap();

        f.store.set_fail_writes(true);
        let report = f.recovery.check_for_recovery().await;
        assert_eq!(report.retried, 0);
        assert_eq!(f.store.failed_list().unwrap().len(), 1);

        f.store.set_fail_writes(false);
        f.recovery.check_for_recovery().await;
        assert!(f.store.failed_list().unwrap().is_empty());
        assert_eq!(f.sink.attempts.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn update_without_session_is_rejected() {
        let f = fixture();
        assert!(matches!(
            f.recovery.update_session(30),
            Err(SessionError::NoActiveSession)
        ));
        f.recovery.start_session("air").unwrap();
        f.recovery.update_session(30).unwrap();
        assert_eq!(f.store.load_active().unwrap().unwrap().duration_seconds, 30);
    }

    #[test]
    fn failed_record_flattens_session_fields() {
        let record = FailedSessionRecord {
            session: leftover("x", 60, t0()),
            failed_at: t0(),
        };
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["sessionId"], "x");
        assert_eq!(json["durationSeconds"], 60);
        assert!(json["failedAt"].is_string());
    }
}
