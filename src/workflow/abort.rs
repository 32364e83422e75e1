//! Abort: end a session without merging. Never commits anything.

use crate::error::{WorkflowError, WorkflowResult};
use crate::session::{StateMachine, TransitionMetadata, WorkflowSession, WorkflowState};

use super::{stash_name, Engine};

/// Options for [`Engine::abort`].
#[derive(Debug, Clone, Default)]
pub struct AbortOptions {
    /// Branch whose session to abort (default: current branch)
    pub branch: Option<String>,
    /// Force-delete the branch locally and on the remote
    pub delete_branch: bool,
    /// Stash uncommitted changes before leaving the branch
    pub stash: bool,
}

#[derive(Debug, Clone)]
pub struct AbortReport {
    /// Final state of the session before its document was removed
    pub session: WorkflowSession,
    /// Name of the stash holding the abandoned changes
    pub stash: Option<String>,
    pub branch_deleted: bool,
}

impl Engine {
    pub fn abort(&self, options: AbortOptions) -> WorkflowResult<AbortReport> {
        let branch = match &options.branch {
            Some(branch) => Ok(branch.clone()),
            None => self.git.current_branch().map_err(WorkflowError::from),
        };

        let mut session_id = None;
        let result = branch.and_then(|branch| {
            let session = self
                .live_session(&branch)
                .ok_or_else(|| WorkflowError::NotFound(format!("branch {branch}")))?;
            session_id = Some(session.id);
            let _guard = self.repo.lock(session.id)?;
            self.abort_locked(session, &options)
        });

        let branch = result.as_ref().ok().map(|r| r.session.branch_name.clone()).or(options.branch);
        self.audit("abort", session_id, branch.as_deref(), &result);
        result
    }

    /// Abort a session whose lock the caller already holds.
    pub(crate) fn abort_locked(
        &self,
        mut session: WorkflowSession,
        options: &AbortOptions,
    ) -> WorkflowResult<AbortReport> {
        let branch = session.branch_name.clone();
        let remote = self.config.general.remote.as_str();
        let base = self.config.general.protected_branch.as_str();
        let on_branch = self.git.current_branch().is_ok_and(|current| current == branch);

        if let Some(parked) = session.metadata.stash.clone() {
            if self.stashes().exists(&parked.stash_ref) {
                return Err(WorkflowError::validation(
                    format!("{branch} still has parked changes in stash '{}'", parked.stash_ref),
                    vec![format!("aborting would orphan the {} stash", parked.purpose)],
                    vec![format!("shipflow swap {branch}"), "shipflow abort --stash".to_string()],
                ));
            }
            tracing::warn!(
                session = %session.short_id(),
                stash = %parked.stash_ref,
                "recorded stash no longer exists; dropping the record"
            );
            session.metadata.stash = None;
        }

        let mut stash = None;
        if options.stash && on_branch {
            let name = stash_name("abort", session.id);
            if self.git.stash_push(&name)? {
                tracing::info!(session = %session.short_id(), stash = %name, "stashed abandoned changes");
                stash = Some(name);
            }
        }

        StateMachine::for_workflow(session.workflow_type).transition(
            &mut session,
            WorkflowState::Aborted,
            "abort",
            TransitionMetadata::new(),
        )?;
        self.repo.update(&session)?;
        self.repo.branches().update(&branch, |r| r.mark_aborted())?;

        if on_branch {
            self.git.checkout(base)?;
        }

        let mut branch_deleted = false;
        if options.delete_branch {
            let remote_exists = self.git.remote_branch_exists(remote, &branch)?;
            let local_exists = self.git.branch_exists(&branch)?;
            if local_exists || remote_exists {
                self.git.delete_branch(&branch, local_exists, remote_exists.then_some(remote))?;
            }
            session.metadata.local_branch_deleted = true;
            session.metadata.remote_branch_deleted = remote_exists;
            self.repo.branches().update(&branch, |r| r.mark_deleted(remote_exists))?;
            branch_deleted = true;
        }

        self.repo.delete(session.id)?;
        tracing::info!(session = %session.short_id(), branch = %branch, "session aborted");
        Ok(AbortReport { session, stash, branch_deleted })
    }
}
