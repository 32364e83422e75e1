//! Per-session advisory locks.
//!
//! Acquisition never blocks: a held lock makes `try_acquire` return
//! `false` and the caller reports the session as busy.

use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{WorkflowError, WorkflowResult};

/// Holder metadata written into a lock, for diagnosing stuck locks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionLock {
    pub session_id: Uuid,
    pub holder_pid: u32,
    pub acquired_at: DateTime<Utc>,
}

impl SessionLock {
    fn current(session_id: Uuid) -> Self {
        Self { session_id, holder_pid: std::process::id(), acquired_at: Utc::now() }
    }
}

/// Exclusive, non-blocking session locks.
pub trait Locker: Send + Sync {
    /// Take the lock. `Ok(false)` means someone else holds it.
    fn try_acquire(&self, session_id: Uuid) -> WorkflowResult<bool>;

    /// Drop the lock. Releasing a lock that is not held is not an error.
    fn release(&self, session_id: Uuid) -> WorkflowResult<()>;

    fn is_locked(&self, session_id: Uuid) -> bool;

    /// Holder metadata, when readable.
    fn holder(&self, session_id: Uuid) -> Option<SessionLock>;

    /// Ids of all sessions that currently have a lock.
    fn locked_sessions(&self) -> Vec<Uuid>;
}

/// RAII guard that releases the lock when dropped.
pub struct SessionLockGuard<'a> {
    locker: &'a dyn Locker,
    session_id: Uuid,
}

impl<'a> SessionLockGuard<'a> {
    /// Acquire `session_id` or fail with [`WorkflowError::Lock`].
    pub fn acquire(locker: &'a dyn Locker, session_id: Uuid) -> WorkflowResult<Self> {
        if locker.try_acquire(session_id)? {
            tracing::debug!(session = %session_id, "lock acquired");
            Ok(Self { locker, session_id })
        } else {
            let holder_pid = locker.holder(session_id).map(|l| l.holder_pid).unwrap_or_default();
            Err(WorkflowError::Lock { session_id, holder_pid })
        }
    }

    pub fn session_id(&self) -> Uuid {
        self.session_id
    }
}

impl Drop for SessionLockGuard<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.locker.release(self.session_id) {
            tracing::warn!(session = %self.session_id, "failed to release lock: {e}");
        } else {
            tracing::debug!(session = %self.session_id, "lock released");
        }
    }
}

/// Lock files next to the session documents (`sessions/{id}.lock`).
#[derive(Debug, Clone)]
pub struct FileLocker {
    dir: PathBuf,
}

impl FileLocker {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn lock_path(&self, session_id: Uuid) -> PathBuf {
        self.dir.join(format!("{session_id}.lock"))
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

impl Locker for FileLocker {
    fn try_acquire(&self, session_id: Uuid) -> WorkflowResult<bool> {
        fs::create_dir_all(&self.dir).map_err(|e| WorkflowError::storage(&self.dir, e))?;

        let path = self.lock_path(session_id);
        // create_new is the atomic test-and-set.
        let mut file = match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::AlreadyExists => return Ok(false),
            Err(e) => return Err(WorkflowError::storage(&path, e)),
        };

        let content = serde_json::to_vec_pretty(&SessionLock::current(session_id))?;
        if let Err(e) = file.write_all(&content).and_then(|()| file.sync_all()) {
            let _ = fs::remove_file(&path);
            return Err(WorkflowError::storage(&path, e));
        }
        Ok(true)
    }

    fn release(&self, session_id: Uuid) -> WorkflowResult<()> {
        let path = self.lock_path(session_id);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(WorkflowError::storage(&path, e)),
        }
    }

    fn is_locked(&self, session_id: Uuid) -> bool {
        self.lock_path(session_id).exists()
    }

    fn holder(&self, session_id: Uuid) -> Option<SessionLock> {
        let content = fs::read_to_string(self.lock_path(session_id)).ok()?;
        serde_json::from_str(&content).ok()
    }

    fn locked_sessions(&self) -> Vec<Uuid> {
        let Ok(entries) = fs::read_dir(&self.dir) else {
            return Vec::new();
        };

        entries
            .filter_map(Result::ok)
            .map(|entry| entry.path())
            .filter(|path| path.extension().is_some_and(|ext| ext == "lock"))
            .filter_map(|path| {
                path.file_stem().and_then(|s| s.to_str()).and_then(|s| Uuid::parse_str(s).ok())
            })
            .collect()
    }
}

/// In-process locks, for tests and dry runs.
#[derive(Debug, Default)]
pub struct MemoryLocker {
    held: Mutex<HashMap<Uuid, SessionLock>>,
}

impl MemoryLocker {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Locker for MemoryLocker {
    fn try_acquire(&self, session_id: Uuid) -> WorkflowResult<bool> {
        let mut held = self.held.lock();
        if held.contains_key(&session_id) {
            return Ok(false);
        }
        held.insert(session_id, SessionLock::current(session_id));
        Ok(true)
    }

    fn release(&self, session_id: Uuid) -> WorkflowResult<()> {
        self.held.lock().remove(&session_id);
        Ok(())
    }

    fn is_locked(&self, session_id: Uuid) -> bool {
        self.held.lock().contains_key(&session_id)
    }

    fn holder(&self, session_id: Uuid) -> Option<SessionLock> {
        self.held.lock().get(&session_id).cloned()
    }

    fn locked_sessions(&self) -> Vec<Uuid> {
        self.held.lock().keys().copied().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn exercise(locker: &dyn Locker) {
        let id = Uuid::new_v4();
        assert!(!locker.is_locked(id));
        assert!(locker.try_acquire(id).unwrap());
        assert!(!locker.try_acquire(id).unwrap());
        assert!(locker.is_locked(id));
        assert_eq!(locker.holder(id).unwrap().holder_pid, std::process::id());
        assert_eq!(locker.locked_sessions(), vec![id]);

        locker.release(id).unwrap();
        assert!(!locker.is_locked(id));
        locker.release(id).unwrap();
        assert!(locker.try_acquire(id).unwrap());
    }

    #[test]
    fn test_file_locker_semantics() {
        let dir = tempdir().unwrap();
        exercise(&FileLocker::new(dir.path().join("sessions")));
    }

    #[test]
    fn test_memory_locker_semantics() {
        exercise(&MemoryLocker::new());
    }

    #[test]
    fn test_guard_releases_on_drop() {
        let locker = MemoryLocker::new();
        let id = Uuid::new_v4();
        {
            let guard = SessionLockGuard::acquire(&locker, id).unwrap();
            assert_eq!(guard.session_id(), id);
            assert!(locker.is_locked(id));

            let busy = SessionLockGuard::acquire(&locker, id).err().unwrap();
            assert!(matches!(busy, WorkflowError::Lock { holder_pid, .. } if holder_pid == std::process::id()));
        }
        assert!(!locker.is_locked(id));
    }

    #[test]
    fn test_file_lock_contains_holder_metadata() {
        let dir = tempdir().unwrap();
        let locker = FileLocker::new(dir.path());
        let id = Uuid::new_v4();
        locker.try_acquire(id).unwrap();

        let raw = fs::read_to_string(dir.path().join(format!("{id}.lock"))).unwrap();
        assert!(raw.contains("holder_pid"));
        assert!(raw.contains(&id.to_string()));
    }
}
