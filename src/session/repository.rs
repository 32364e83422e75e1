//! Crash-safe session storage.
//!
//! Layout under the data directory:
//!
//! ```text
//! sessions/{id}.json     session document
//! sessions/{id}.lock     lock marker (FileLocker)
//! branches/{name}.json   branch history
//! audit/{yyyy-mm}/{dd}.jsonl
//! ```
//!
//! Unreadable, schema-violating or expired documents are treated as absent.

use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use chrono::{Duration, Utc};
use tempfile::NamedTempFile;
use uuid::Uuid;

use super::{
    AuditLog, BranchHistory, FileLocker, Locker, SessionLock, SessionLockGuard, StateMachine,
    WorkflowSession,
};
use crate::error::{WorkflowError, WorkflowResult};

/// A creation lock held longer than this belongs to a dead process.
const INDEX_LOCK_STALE_SECS: i64 = 30;

/// Write `bytes` to a temp file in the target directory, fsync, then rename.
pub(crate) fn write_atomic(path: &Path, bytes: &[u8]) -> WorkflowResult<()> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let mut tmp = NamedTempFile::new_in(dir).map_err(|e| WorkflowError::storage(dir, e))?;
    tmp.write_all(bytes)
        .and_then(|()| tmp.as_file().sync_all())
        .map_err(|e| WorkflowError::storage(tmp.path(), e))?;
    tmp.persist(path).map_err(|e| WorkflowError::storage(path, e.error))?;
    Ok(())
}

/// Session store plus the locks, branch history and audit log beside it.
pub struct SessionRepository {
    root: PathBuf,
    sessions_dir: PathBuf,
    locker: Box<dyn Locker>,
    branches: BranchHistory,
    audit: AuditLog,
}

impl SessionRepository {
    /// Open a repository that locks with files next to the sessions.
    pub fn open(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let locker = FileLocker::new(root.join("sessions"));
        Self::with_locker(root, Box::new(locker))
    }

    /// Open a repository with a custom lock implementation.
    pub fn with_locker(root: impl Into<PathBuf>, locker: Box<dyn Locker>) -> Self {
        let root = root.into();
        Self {
            sessions_dir: root.join("sessions"),
            branches: BranchHistory::new(root.join("branches")),
            audit: AuditLog::new(root.join("audit")),
            locker,
            root,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn branches(&self) -> &BranchHistory {
        &self.branches
    }

    pub fn audit(&self) -> &AuditLog {
        &self.audit
    }

    fn session_path(&self, id: Uuid) -> PathBuf {
        self.sessions_dir.join(format!("{id}.json"))
    }

    /// Parse a session document, rejecting states outside its graph.
    fn read_session(path: &Path) -> Option<WorkflowSession> {
        let content = match fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == ErrorKind::NotFound => return None,
            Err(e) => {
                tracing::warn!(path = %path.display(), "unreadable session file: {e}");
                return None;
            }
        };

        let session: WorkflowSession = match serde_json::from_str(&content) {
            Ok(s) => s,
            Err(e) => {
                tracing::warn!(path = %path.display(), "ignoring corrupt session file: {e}");
                return None;
            }
        };

        if !StateMachine::for_workflow(session.workflow_type).contains(session.current_state) {
            tracing::warn!(
                path = %path.display(),
                state = %session.current_state,
                "ignoring session whose state is outside its workflow"
            );
            return None;
        }

        Some(session)
    }

    /// Every parseable session, expired ones included.
    fn load_all(&self) -> Vec<WorkflowSession> {
        let Ok(entries) = fs::read_dir(&self.sessions_dir) else {
            return Vec::new();
        };

        entries
            .filter_map(Result::ok)
            .map(|entry| entry.path())
            .filter(|path| path.extension().is_some_and(|ext| ext == "json"))
            .filter_map(|path| Self::read_session(&path))
            .collect()
    }

    fn write_session(&self, session: &WorkflowSession) -> WorkflowResult<()> {
        let machine = StateMachine::for_workflow(session.workflow_type);
        if !machine.contains(session.current_state) {
            return Err(WorkflowError::validation(
                format!(
                    "State {} is not part of the {} workflow",
                    session.current_state, session.workflow_type
                ),
                Vec::new(),
                Vec::new(),
            ));
        }

        fs::create_dir_all(&self.sessions_dir)
            .map_err(|e| WorkflowError::storage(&self.sessions_dir, e))?;
        write_atomic(&self.session_path(session.id), &serde_json::to_vec_pretty(session)?)
    }

    /// Persist a new session.
    ///
    /// Fails with [`WorkflowError::AlreadyExists`] when a live session
    /// already owns the branch.
    pub fn create(&self, session: &WorkflowSession) -> WorkflowResult<()> {
        // Serialize creators so the branch check and the write are atomic
        // with respect to other processes.
        let _index = self.lock_index()?;

        if let Some(existing) = self.active_for_branch(&session.branch_name) {
            return Err(WorkflowError::AlreadyExists {
                branch: session.branch_name.clone(),
                session_id: existing.id,
            });
        }
        if self.session_path(session.id).exists() {
            return Err(WorkflowError::AlreadyExists {
                branch: session.branch_name.clone(),
                session_id: session.id,
            });
        }

        self.write_session(session)?;
        tracing::info!(session = %session.id, branch = %session.branch_name, "session created");
        Ok(())
    }

    /// Live session by id.
    pub fn get(&self, id: Uuid) -> Option<WorkflowSession> {
        let session = Self::read_session(&self.session_path(id))?;
        if session.is_expired() {
            tracing::debug!(session = %id, "session expired, treating as absent");
            return None;
        }
        Some(session)
    }

    fn active_for_branch(&self, branch: &str) -> Option<WorkflowSession> {
        self.load_all()
            .into_iter()
            .find(|s| s.branch_name == branch && !s.is_expired() && !s.is_terminal())
    }

    /// Session for a branch: the live non-terminal one, else the most
    /// recently updated terminal one.
    pub fn get_by_branch(&self, branch: &str) -> Option<WorkflowSession> {
        let mut matches: Vec<_> = self
            .load_all()
            .into_iter()
            .filter(|s| s.branch_name == branch && !s.is_expired())
            .collect();

        matches.sort_by_key(|s| (!s.is_terminal(), s.updated_at));
        matches.pop()
    }

    /// Rewrite an existing session.
    pub fn update(&self, session: &WorkflowSession) -> WorkflowResult<()> {
        if !self.session_path(session.id).exists() {
            return Err(WorkflowError::NotFound(format!("session {}", session.id)));
        }
        self.write_session(session)?;
        tracing::debug!(session = %session.id, state = %session.current_state, "session updated");
        Ok(())
    }

    /// Remove a session document. Missing documents are not an error.
    pub fn delete(&self, id: Uuid) -> WorkflowResult<bool> {
        let path = self.session_path(id);
        match fs::remove_file(&path) {
            Ok(()) => {
                tracing::info!(session = %id, "session deleted");
                Ok(true)
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(WorkflowError::storage(path, e)),
        }
    }

    /// Live sessions, oldest first.
    pub fn list(&self, include_terminal: bool) -> Vec<WorkflowSession> {
        let mut sessions: Vec<_> = self
            .load_all()
            .into_iter()
            .filter(|s| !s.is_expired())
            .filter(|s| include_terminal || !s.is_terminal())
            .collect();
        sessions.sort_by_key(|s| s.created_at);
        sessions
    }

    pub fn acquire_lock(&self, id: Uuid) -> WorkflowResult<bool> {
        self.locker.try_acquire(id)
    }

    pub fn release_lock(&self, id: Uuid) -> WorkflowResult<()> {
        self.locker.release(id)
    }

    pub fn is_locked(&self, id: Uuid) -> bool {
        self.locker.is_locked(id)
    }

    pub fn lock_holder(&self, id: Uuid) -> Option<SessionLock> {
        self.locker.holder(id)
    }

    /// Take the session lock for the guard's lifetime.
    pub fn lock(&self, id: Uuid) -> WorkflowResult<SessionLockGuard<'_>> {
        SessionLockGuard::acquire(self.locker.as_ref(), id)
    }

    /// Delete sessions past `expires_at`, terminal or not.
    ///
    /// Sessions another invocation has locked are left for a later run.
    /// Returns the removed sessions, so callers can report stashes they
    /// still owned.
    pub fn cleanup_expired(&self) -> WorkflowResult<Vec<WorkflowSession>> {
        let mut removed = Vec::new();
        for session in self.load_all().into_iter().filter(WorkflowSession::is_expired) {
            let Ok(_guard) = self.lock(session.id) else {
                tracing::debug!(session = %session.id, "expired session is in use, skipped");
                continue;
            };
            if !self.delete(session.id)? {
                continue;
            }
            if let Some(stash) = &session.metadata.stash {
                tracing::warn!(
                    session = %session.id,
                    branch = %session.branch_name,
                    stash = %stash.stash_ref,
                    "expired session still owned a stash; it stays in 'git stash list'"
                );
            }
            tracing::info!(session = %session.id, branch = %session.branch_name, "expired session removed");
            removed.push(session);
        }
        Ok(removed)
    }

    /// Delete terminal sessions not touched for `retention_days`.
    pub fn cleanup_terminal(&self, retention_days: i64) -> WorkflowResult<usize> {
        let cutoff = Utc::now() - Duration::days(retention_days);
        let mut removed = 0;
        for session in self
            .load_all()
            .into_iter()
            .filter(|s| s.is_terminal() && s.updated_at < cutoff && !self.is_locked(s.id))
        {
            if self.delete(session.id)? {
                removed += 1;
            }
        }
        Ok(removed)
    }

    /// Take the creation lock, reclaiming it first if its holder died.
    fn lock_index(&self) -> WorkflowResult<SessionLockGuard<'_>> {
        match SessionLockGuard::acquire(self.locker.as_ref(), Uuid::nil()) {
            Err(WorkflowError::Lock { .. }) if self.reclaim_stale_index_lock() => {
                SessionLockGuard::acquire(self.locker.as_ref(), Uuid::nil())
            }
            other => other,
        }
    }

    /// Release the creation lock if it is unreadable or older than any
    /// `create` could take. Returns whether it was removed.
    fn reclaim_stale_index_lock(&self) -> bool {
        let index = Uuid::nil();
        if !self.locker.is_locked(index) {
            return false;
        }
        let stale = self.locker.holder(index).is_none_or(|lock| {
            Utc::now() - lock.acquired_at > Duration::seconds(INDEX_LOCK_STALE_SECS)
        });
        if !stale {
            return false;
        }
        match self.locker.release(index) {
            Ok(()) => {
                tracing::warn!("removed abandoned session creation lock");
                true
            }
            Err(e) => {
                tracing::warn!("could not remove abandoned session creation lock: {e}");
                false
            }
        }
    }

    /// Remove locks whose session document no longer exists, and an
    /// abandoned creation lock.
    pub fn cleanup_orphaned_locks(&self) -> WorkflowResult<usize> {
        let mut removed = 0;
        for id in self.locker.locked_sessions() {
            if id.is_nil() {
                removed += usize::from(self.reclaim_stale_index_lock());
                continue;
            }
            if self.session_path(id).exists() {
                continue;
            }
            self.locker.release(id)?;
            tracing::info!(session = %id, "orphaned lock removed");
            removed += 1;
        }
        Ok(removed)
    }
}
