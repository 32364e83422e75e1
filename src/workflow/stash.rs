//! Auto-stashes owned by sessions.
//!
//! Names have the form `shipflow-auto/<purpose>/<session-id>/<unix-ts>`.
//! Stashes are always looked up by name at pop time.

use chrono::Utc;
use uuid::Uuid;

use crate::error::{WorkflowError, WorkflowResult};
use crate::git::{GitError, GitRunner};
use crate::session::{StashPurpose, StashRecord, WorkflowSession};

/// Prefix shared by every stash shipflow creates.
pub const STASH_PREFIX: &str = "shipflow-auto";

/// Name for a new auto-stash.
pub fn stash_name(purpose: &str, session_id: Uuid) -> String {
    format!("{STASH_PREFIX}/{purpose}/{session_id}/{}", Utc::now().timestamp())
}

/// Creates, restores and tracks session stashes.
pub struct StashCoordinator<'a> {
    git: &'a dyn GitRunner,
}

impl<'a> StashCoordinator<'a> {
    pub fn new(git: &'a dyn GitRunner) -> Self {
        Self { git }
    }

    /// Stash outstanding changes for `session` and record them on it.
    ///
    /// Returns `None` (and records nothing) when the tree was clean. The
    /// caller persists the session.
    pub fn stash_for(
        &self,
        session: &mut WorkflowSession,
        purpose: StashPurpose,
    ) -> WorkflowResult<Option<StashRecord>> {
        if let Some(existing) = &session.metadata.stash {
            tracing::warn!(
                session = %session.id,
                stash = %existing.stash_ref,
                "session already owns a stash; restore it before stashing again"
            );
            return Err(WorkflowError::validation(
                format!("Session for {} already has a saved stash", session.branch_name),
                vec![format!("existing stash: {}", existing.stash_ref)],
                vec![format!("shipflow swap {}", session.branch_name)],
            ));
        }

        let name = stash_name(&purpose.to_string(), session.id);
        if !self.git.stash_push(&name)? {
            return Ok(None);
        }

        let record = StashRecord {
            stash_ref: name,
            session_id: session.id,
            created_at: Utc::now(),
            purpose,
        };
        tracing::info!(session = %session.id, stash = %record.stash_ref, "stashed changes");
        session.metadata.stash = Some(record.clone());
        Ok(Some(record))
    }

    /// Pop the stash recorded on `session` and delete the record.
    ///
    /// A record whose stash no longer exists is dropped with a warning and
    /// `Ok(false)` is returned. On a failed pop the record is kept.
    pub fn restore(&self, session: &mut WorkflowSession) -> WorkflowResult<bool> {
        let Some(record) = session.metadata.stash.clone() else {
            return Ok(false);
        };

        match self.pop_named(&record.stash_ref) {
            Ok(()) => {
                session.metadata.stash = None;
                tracing::info!(session = %session.id, stash = %record.stash_ref, "restored stash");
                Ok(true)
            }
            Err(GitError::StashNotFound(_)) => {
                tracing::warn!(
                    session = %session.id,
                    stash = %record.stash_ref,
                    "recorded stash no longer exists; dropping the record"
                );
                session.metadata.stash = None;
                Ok(false)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Pop the stash pushed under `name`.
    pub fn pop_named(&self, name: &str) -> Result<(), GitError> {
        let entry = self.git.find_stash(name)?.ok_or_else(|| GitError::StashNotFound(name.to_string()))?;
        self.git.stash_pop(&entry.reference())
    }

    /// Whether a stash named `name` is still on the stack.
    pub fn exists(&self, name: &str) -> bool {
        self.git.find_stash(name).is_ok_and(|entry| entry.is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::WorkflowType;
    use crate::testing::FakeGit;

    fn session() -> WorkflowSession {
        WorkflowSession::new("feature/a", WorkflowType::Launch, "main", 30)
    }

    #[test]
    fn test_clean_tree_records_nothing() {
        let git = FakeGit::new("/repo");
        let coordinator = StashCoordinator::new(&git);
        let mut session = session();

        assert!(coordinator.stash_for(&mut session, StashPurpose::Swap).unwrap().is_none());
        assert!(session.metadata.stash.is_none());
    }

    #[test]
    fn test_stash_and_restore_by_name() {
        let git = FakeGit::new("/repo");
        git.write_file("src/lib.rs");
        let coordinator = StashCoordinator::new(&git);
        let mut session = session();

        let record = coordinator.stash_for(&mut session, StashPurpose::Swap).unwrap().unwrap();
        assert!(record.stash_ref.starts_with(&format!("shipflow-auto/swap/{}/", session.id)));
        assert!(git.dirty_files().is_empty());

        // Another stash on top shifts indices; lookup by name still works
        git.write_file("other.txt");
        git.stash_push("manual").unwrap();

        assert!(coordinator.restore(&mut session).unwrap());
        assert!(session.metadata.stash.is_none());
        assert_eq!(git.dirty_files(), vec!["src/lib.rs".to_string()]);
        assert_eq!(git.stash_messages().len(), 1);

        // Restoring twice never pops again
        assert!(!coordinator.restore(&mut session).unwrap());
    }

    #[test]
    fn test_missing_stash_drops_record() {
        let git = FakeGit::new("/repo");
        git.write_file("a.txt");
        let coordinator = StashCoordinator::new(&git);
        let mut session = session();
        let record = coordinator.stash_for(&mut session, StashPurpose::Switch).unwrap().unwrap();

        coordinator.pop_named(&record.stash_ref).unwrap();
        assert!(!coordinator.restore(&mut session).unwrap());
        assert!(session.metadata.stash.is_none());
    }

    #[test]
    fn test_second_stash_for_same_session_is_refused() {
        let git = FakeGit::new("/repo");
        git.write_file("a.txt");
        let coordinator = StashCoordinator::new(&git);
        let mut session = session();
        coordinator.stash_for(&mut session, StashPurpose::Swap).unwrap();

        git.write_file("b.txt");
        assert!(coordinator.stash_for(&mut session, StashPurpose::Swap).is_err());
    }
}
