//! Moving between sessions: swap parks the current work, switch carries it.

use crate::error::{WorkflowError, WorkflowResult};
use crate::session::{StashPurpose, WorkflowSession};

use super::{AbortOptions, Engine, LaunchReport, LaunchRequest};

/// Result of [`Engine::swap`].
#[derive(Debug, Clone)]
pub struct SwapReport {
    /// Session left behind, if the origin branch had one
    pub origin: Option<WorkflowSession>,
    pub target: WorkflowSession,
    /// Stash now owned by the origin session
    pub stashed: Option<String>,
    /// The target's own stash was popped
    pub restored: bool,
    /// The target had no session and was launched
    pub launched: bool,
}

/// Result of [`Engine::switch`].
#[derive(Debug, Clone)]
pub struct SwitchReport {
    /// Retired origin session
    pub origin: WorkflowSession,
    pub target: LaunchReport,
    /// Stash that carried the changes across
    pub carried: Option<String>,
}

impl Engine {
    /// Park the current session's changes and continue on `target`.
    ///
    /// The origin session stays active and gets its changes back on the
    /// next swap to it.
    pub fn swap(&self, target: &str) -> WorkflowResult<SwapReport> {
        let result = self.run_swap(target);
        let session_id = result.as_ref().ok().map(|r| r.target.id);
        self.audit("swap", session_id, Some(target), &result);
        result
    }

    fn run_swap(&self, target: &str) -> WorkflowResult<SwapReport> {
        let current = self.git.current_branch()?;
        if current == target {
            return Err(WorkflowError::validation(
                format!("Already on {target}"),
                Vec::new(),
                Vec::new(),
            ));
        }

        let mut origin = self.live_session(&current);
        if origin.is_none() && self.git.has_uncommitted_changes()? {
            return Err(WorkflowError::validation(
                format!("{current} has uncommitted changes and no session to keep them"),
                Vec::new(),
                vec![
                    "Commit or stash the changes yourself".to_string(),
                    format!("shipflow switch {target}"),
                ],
            ));
        }

        self.cancel.checkpoint("stash")?;
        let _origin_guard = match &origin {
            Some(session) => Some(self.repo.lock(session.id)?),
            None => None,
        };

        let mut stashed = None;
        if let Some(session) = origin.as_mut() {
            if let Some(record) = self.stashes().stash_for(session, StashPurpose::Swap)? {
                self.repo.update(session)?;
                stashed = Some(record.stash_ref);
            }
        }

        match self.enter_target(target) {
            Ok((target, restored, launched)) => {
                Ok(SwapReport { origin, target, stashed, restored, launched })
            }
            Err(e) => {
                self.restore_origin(&current, origin.as_mut());
                Err(e)
            }
        }
    }

    /// Check out `target`'s session (restoring its parked changes) or launch one.
    fn enter_target(&self, target: &str) -> WorkflowResult<(WorkflowSession, bool, bool)> {
        let Some(mut session) = self.live_session(target) else {
            let report = self.launch(LaunchRequest::launch().with_branch(Some(target.to_string())))?;
            return Ok((report.session, false, true));
        };

        let _guard = self.repo.lock(session.id)?;
        self.cancel.checkpoint("checkout")?;
        self.git.checkout(&session.branch_name)?;

        let parked = session.metadata.stash.as_ref().is_some_and(|s| s.purpose == StashPurpose::Swap);
        let restored = if parked {
            let popped = self.stashes().restore(&mut session)?;
            self.repo.update(&session)?;
            popped
        } else {
            false
        };
        tracing::info!(session = %session.short_id(), branch = target, restored, "swapped");
        Ok((session, restored, false))
    }

    /// Best-effort return to the origin branch with its changes.
    fn restore_origin(&self, branch: &str, session: Option<&mut WorkflowSession>) {
        let on_origin = self.git.current_branch().is_ok_and(|current| current == branch);
        if !on_origin {
            if let Err(e) = self.git.checkout(branch) {
                tracing::warn!(branch, "could not return to origin branch: {e}");
                return;
            }
        }

        let Some(session) = session else { return };
        match self.stashes().restore(session) {
            Ok(_) => {
                if let Err(e) = self.repo.update(session) {
                    tracing::warn!(session = %session.short_id(), "could not persist restored stash: {e}");
                }
            }
            Err(e) => tracing::warn!(
                session = %session.short_id(),
                "changes are still stashed; restore them with 'git stash pop': {e}"
            ),
        }
    }

    /// Carry the current changes onto a new branch and retire the current session.
    pub fn switch(&self, target: &str) -> WorkflowResult<SwitchReport> {
        let result = self.run_switch(target);
        let session_id = result.as_ref().ok().map(|r| r.target.session.id);
        self.audit("switch", session_id, Some(target), &result);
        result
    }

    fn run_switch(&self, target: &str) -> WorkflowResult<SwitchReport> {
        let current = self.git.current_branch()?;
        let mut origin = self
            .live_session(&current)
            .ok_or_else(|| WorkflowError::NotFound(format!("branch {current}")))?;
        if current == target {
            return Err(WorkflowError::validation(
                format!("Already on {target}"),
                Vec::new(),
                Vec::new(),
            ));
        }
        if self.live_session(target).is_some() {
            return Err(WorkflowError::validation(
                format!("{target} already has a session; switch only starts new ones"),
                Vec::new(),
                vec![format!("shipflow swap {target}")],
            ));
        }

        self.cancel.checkpoint("stash")?;
        let _guard = self.repo.lock(origin.id)?;
        let carried = self.stashes().stash_for(&mut origin, StashPurpose::Switch)?;
        if carried.is_some() {
            self.repo.update(&origin)?;
        }

        let mut request = LaunchRequest::launch().with_branch(Some(target.to_string()));
        request.carried_stash = carried.as_ref().map(|r| r.stash_ref.clone());
        let launched = match self.launch(request) {
            Ok(report) => report,
            Err(e) => {
                self.restore_origin(&current, Some(&mut origin));
                return Err(e);
            }
        };

        origin.metadata.stash = None;
        self.repo.update(&origin)?;
        let delete_branch = self.config.switch.delete_origin_branch;
        let retired =
            self.abort_locked(origin, &AbortOptions { branch: None, delete_branch, stash: false })?;

        Ok(SwitchReport {
            origin: retired.session,
            target: launched,
            carried: carried.map(|r| r.stash_ref),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Config;
    use crate::git::GitRunner;
    use crate::session::{MemoryLocker, SessionRepository, WorkflowState};
    use crate::testing::{FakeGit, FakePlatform};
    use tempfile::tempdir;

    fn engine(dir: &std::path::Path, git: &FakeGit) -> Engine {
        let repo = SessionRepository::with_locker(dir, Box::new(MemoryLocker::new()));
        Engine::new(Config::default(), repo, Box::new(git.clone()), Box::new(FakePlatform::new()))
    }

    fn launch(engine: &Engine, branch: &str) -> WorkflowSession {
        engine
            .launch(LaunchRequest::launch().with_branch(Some(branch.to_string())))
            .unwrap()
            .session
    }

    #[test]
    fn test_swap_round_trip_restores_changes() {
        let dir = tempdir().unwrap();
        let git = FakeGit::new("/repo");
        let engine = engine(dir.path(), &git);
        let a = launch(&engine, "feature/a");
        git.write_file("a.rs");

        let first = engine.swap("feature/b").unwrap();
        assert!(first.launched);
        assert!(first.stashed.is_some());
        assert!(git.dirty_files().is_empty());
        let parked = engine.repository().get(a.id).unwrap();
        assert!(parked.metadata.stash.is_some());
        assert_eq!(parked.current_state, WorkflowState::BranchReady);

        let back = engine.swap("feature/a").unwrap();
        assert!(back.restored);
        assert_eq!(git.current(), "feature/a");
        assert_eq!(git.dirty_files(), vec!["a.rs".to_string()]);
        assert!(engine.repository().get(a.id).unwrap().metadata.stash.is_none());
    }

    #[test]
    fn test_swap_failure_restores_origin() {
        let dir = tempdir().unwrap();
        let git = FakeGit::new("/repo");
        let engine = engine(dir.path(), &git);
        let a = launch(&engine, "feature/a");
        git.write_file("a.rs");
        git.fail_on("create_branch");

        assert!(engine.swap("feature/b").is_err());
        assert_eq!(git.current(), "feature/a");
        assert_eq!(git.dirty_files(), vec!["a.rs".to_string()]);
        assert!(engine.repository().get(a.id).unwrap().metadata.stash.is_none());
    }

    #[test]
    fn test_switch_carries_changes_and_retires_origin() {
        let dir = tempdir().unwrap();
        let git = FakeGit::new("/repo");
        let engine = engine(dir.path(), &git);
        let a = launch(&engine, "feature/a");
        git.write_file("a.rs");

        let report = engine.switch("feature/b").unwrap();

        assert!(report.carried.is_some());
        assert!(report.target.stash_applied);
        assert_eq!(git.current(), "feature/b");
        assert_eq!(git.dirty_files(), vec!["a.rs".to_string()]);
        assert_eq!(report.origin.current_state, WorkflowState::Aborted);
        assert!(engine.repository().get(a.id).is_none());
        assert!(git.has_local("feature/a"));
        assert!(git.stash_messages().is_empty());
    }

    #[test]
    fn test_switch_to_existing_session_is_refused() {
        let dir = tempdir().unwrap();
        let git = FakeGit::new("/repo");
        let engine = engine(dir.path(), &git);
        launch(&engine, "feature/b");
        git.checkout("main").unwrap();
        launch(&engine, "feature/a");

        let err = engine.switch("feature/b").unwrap_err();
        assert!(matches!(err, WorkflowError::Validation { .. }));
        assert_eq!(git.current(), "feature/a");
    }
}
