//! Durable local records for session recovery.
//!
//! Three records exist: the single active session, the single emergency
//! checkpoint, and the failed-save queue.  Implementations supply plain
//! load/store primitives; the queue operations on top of them are shared.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};

use serde::de::DeserializeOwned;
use serde::Serialize;

use super::{ActiveSession, EmergencyCheckpoint, FailedSessionRecord};
use crate::error::PersistenceError;

/// Storage-agnostic persistence for session records.
pub trait SessionStore: Send + Sync {
    fn load_active(&self) -> Result<Option<ActiveSession>, PersistenceError>;
    fn save_active(&self, session: &ActiveSession) -> Result<(), PersistenceError>;
    fn clear_active(&self) -> Result<(), PersistenceError>;

    fn load_emergency(&self) -> Result<Option<EmergencyCheckpoint>, PersistenceError>;
    fn save_emergency(&self, checkpoint: &EmergencyCheckpoint) -> Result<(), PersistenceError>;
    fn clear_emergency(&self) -> Result<(), PersistenceError>;

    /// The whole failed queue, oldest first.
    fn load_failed(&self) -> Result<Vec<FailedSessionRecord>, PersistenceError>;
    /// Replace the whole failed queue.
    fn store_failed(&self, records: &[FailedSessionRecord]) -> Result<(), PersistenceError>;

    /// Append `record`, dropping the oldest entries beyond `limit`.
    fn failed_insert(
        &self,
        record: FailedSessionRecord,
        limit: usize,
    ) -> Result<(), PersistenceError> {
        let mut records = self.load_failed()?;
        records.retain(|r| r.session.session_id != record.session.session_id);
        records.push(record);
        if records.len() > limit {
            let excess = records.len() - limit;
            records.drain(..excess);
        }
        self.store_failed(&records)
    }

    /// Oldest queued record.
    fn failed_peek(&self) -> Result<Option<FailedSessionRecord>, PersistenceError> {
        Ok(self.load_failed()?.into_iter().next())
    }

    /// Remove the record for `session_id`; `false` if it was not queued.
    fn failed_remove(&self, session_id: &str) -> Result<bool, PersistenceError> {
        let mut records = self.load_failed()?;
        let before = records.len();
        records.retain(|r| r.session.session_id != session_id);
        if records.len() == before {
            return Ok(false);
        }
        self.store_failed(&records)?;
        Ok(true)
    }

    fn failed_list(&self) -> Result<Vec<FailedSessionRecord>, PersistenceError> {
        self.load_failed()
    }
}

// ── MemoryStore ───────────────────────────────────────────────────────────────

#[derive(Default)]
struct MemoryState {
    active: Option<ActiveSession>,
    emergency: Option<EmergencyCheckpoint>,
    failed: Vec<FailedSessionRecord>,
}

/// In-process store.  Nothing survives a restart; used for tests and for
/// running without a writable storage directory.
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
    fail_writes: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent write fail with a storage error.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn check_writable(&self) -> Result<(), PersistenceError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(PersistenceError::Storage(std::io::Error::new(
                ErrorKind::Other,
                "memory store is read-only",
            )));
        }
        Ok(())
    }
}

impl SessionStore for MemoryStore {
    fn load_active(&self) -> Result<Option<ActiveSession>, PersistenceError> {
        Ok(self.lock().active.clone())
    }

    fn save_active(&self, session: &ActiveSession) -> Result<(), PersistenceError> {
        self.check_writable()?;
        self.lock().active = Some(session.clone());
        Ok(())
    }

    fn clear_active(&self) -> Result<(), PersistenceError> {
        self.check_writable()?;
        self.lock().active = None;
        Ok(())
    }

    fn load_emergency(&self) -> Result<Option<EmergencyCheckpoint>, PersistenceError> {
        Ok(self.lock().emergency.clone())
    }

    fn save_emergency(&self, checkpoint: &EmergencyCheckpoint) -> Result<(), PersistenceError> {
        self.check_writable()?;
        self.lock().emergency = Some(checkpoint.clone());
        Ok(())
    }

    fn clear_emergency(&self) -> Result<(), PersistenceError> {
        self.check_writable()?;
        self.lock().emergency = None;
        Ok(())
    }

    fn load_failed(&self) -> Result<Vec<FailedSessionRecord>, PersistenceError> {
        Ok(self.lock().failed.clone())
    }

    fn store_failed(&self, records: &[FailedSessionRecord]) -> Result<(), PersistenceError> {
        self.check_writable()?;
        self.lock().failed = records.to_vec();
        Ok(())
    }
}

// ── JsonFileStore ─────────────────────────────────────────────────────────────

const ACTIVE_FILE: &str = "activeSession.json";
const FAILED_FILE: &str = "failedSessionQueue.json";
const EMERGENCY_FILE: &str = "emergencyCheckpoint.json";

/// One pretty-printed JSON file per record inside a directory.
///
/// Writes go to a sibling `.tmp` file that is then renamed over the target,
/// so a crash mid-write leaves the previous version intact.  A file that no
/// longer parses is treated as absent.
pub struct JsonFileStore {
    dir: PathBuf,
}

impl JsonFileStore {
    /// Use `dir`, creating it if needed.
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self, PersistenceError> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn read<T: DeserializeOwned>(&self, name: &str) -> Result<Option<T>, PersistenceError> {
        let path = self.dir.join(name);
        let contents = match fs::read_to_string(&path) {
            Ok(c) => c,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        match serde_json::from_str(&contents) {
            Ok(value) => Ok(Some(value)),
            Err(e) => {
                log::warn!("ignoring unreadable {}: {e}", path.display());
                Ok(None)
            }
        }
    }

    fn write<T: Serialize + ?Sized>(&self, name: &str, value: &T) -> Result<(), PersistenceError> {
        let path = self.dir.join(name);
        let tmp = path.with_extension("json.tmp");
        let serialized = serde_json::to_string_pretty(value)?;
        fs::write(&tmp, serialized)?;
        fs::rename(&tmp, &path)?;
        Ok(())
    }

    fn remove(&self, name: &str) -> Result<(), PersistenceError> {
        match fs::remove_file(self.dir.join(name)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

impl SessionStore for JsonFileStore {
    fn load_active(&self) -> Result<Option<ActiveSession>, PersistenceError> {
        self.read(ACTIVE_FILE)
    }

    fn save_active(&self, session: &ActiveSession) -> Result<(), PersistenceError> {
        self.write(ACTIVE_FILE, session)
    }

    fn clear_active(&self) -> Result<(), PersistenceError> {
        self.remove(ACTIVE_FILE)
    }

    fn load_emergency(&self) -> Result<Option<EmergencyCheckpoint>, PersistenceError> {
        self.read(EMERGENCY_FILE)
    }

    fn save_emergency(&self, checkpoint: &EmergencyCheckpoint) -> Result<(), PersistenceError> {
        self.write(EMERGENCY_FILE, checkpoint)
    }

    fn clear_emergency(&self) -> Result<(), PersistenceError> {
        self.remove(EMERGENCY_FILE)
    }

    fn load_failed(&self) -> Result<Vec<FailedSessionRecord>, PersistenceError> {
        Ok(self.read(FAILED_FILE)?.unwrap_or_default())
    }

    fn store_failed(&self, records: &[FailedSessionRecord]) -> Result<(), PersistenceError> {
        if records.is_empty() {
            return self.remove(FAILED_FILE);
        }
        self.write(FAILED_FILE, records)
    }
}
