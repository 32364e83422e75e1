//! Housekeeping for the session store.

use crate::error::WorkflowResult;

use super::Engine;

/// Counts of what [`Engine::cleanup`] removed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CleanupReport {
    pub expired: usize,
    pub terminal: usize,
    pub orphaned_locks: usize,
    /// Stashes still owned by removed expired sessions; left in git
    pub abandoned_stashes: Vec<String>,
}

impl CleanupReport {
    pub fn total(&self) -> usize {
        self.expired + self.terminal + self.orphaned_locks
    }
}

impl Engine {
    /// Remove expired sessions, old finished sessions and stale locks.
    pub fn cleanup(&self) -> WorkflowResult<CleanupReport> {
        let result = self.run_cleanup();
        if let Ok(report) = &result {
            tracing::info!(
                expired = report.expired,
                terminal = report.terminal,
                orphaned_locks = report.orphaned_locks,
                "cleanup finished"
            );
        }
        self.audit("cleanup", None, None, &result);
        result
    }

    fn run_cleanup(&self) -> WorkflowResult<CleanupReport> {
        let expired = self.repo.cleanup_expired()?;
        let abandoned_stashes = expired
            .iter()
            .filter_map(|s| s.metadata.stash.as_ref())
            .map(|record| record.stash_ref.clone())
            .collect();
        Ok(CleanupReport {
            expired: expired.len(),
            terminal: self.repo.cleanup_terminal(self.config.sessions.retention_days)?,
            orphaned_locks: self.repo.cleanup_orphaned_locks()?,
            abandoned_stashes,
        })
    }
}
