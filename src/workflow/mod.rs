//! Workflow orchestrators.
//!
//! The [`Engine`] owns the collaborators (session store, git, remote
//! platform) and runs each user-facing operation as a sequence of
//! guarded steps:
//!
//! - `launch` / `hotfix` - validate a name, create the branch and session
//! - `ship` - commit, push, open the pull request, wait for checks, merge, clean up
//! - `swap` - park the current session's changes and move to another branch
//! - `switch` - carry the current changes onto a new branch and retire the old session
//! - `abort` - end a session without merging
//!
//! Every step that changes git or the platform is followed by a persisted
//! state transition, so an interrupted command resumes where it stopped.

mod abort;
mod cleanup;
mod context;
mod launch;
mod preflight;
mod ship;
mod stash;

use std::collections::BTreeSet;

use uuid::Uuid;

use crate::core::{CancelToken, Config};
use crate::error::{WorkflowError, WorkflowResult};
use crate::git::{GitRunner, HooksInspector};
use crate::platform::RemotePlatform;
use crate::session::{
    Action, AuditEntry, AuditOutcome, Milestone, SessionLock, SessionRepository, StateMachine,
    TransitionMetadata, WorkflowSession,
};
use crate::validation::BranchValidator;

pub use abort::{AbortOptions, AbortReport};
pub use cleanup::CleanupReport;
pub use context::{SwapReport, SwitchReport};
pub use launch::{LaunchReport, LaunchRequest};
pub use preflight::{CheckStatus, PreflightCheck, PreflightReport};
pub use ship::{ShipOptions, ShipReport, ShipStatus};
pub use stash::{stash_name, StashCoordinator, STASH_PREFIX};

/// A user-facing command.
#[derive(Debug, Clone)]
pub enum Operation {
    Launch { description: Option<String>, branch: Option<String> },
    Hotfix { description: Option<String>, branch: Option<String> },
    Ship(ShipOptions),
    Swap { branch: String },
    Switch { branch: String },
    Abort(AbortOptions),
    Sessions { all: bool },
    Cleanup,
}

/// What an [`Operation`] produced.
#[derive(Debug, Clone)]
pub enum Outcome {
    Launched(LaunchReport),
    Shipped(ShipReport),
    Swapped(SwapReport),
    Switched(SwitchReport),
    Aborted(AbortReport),
    Sessions(Vec<SessionSummary>),
    Cleaned(CleanupReport),
}

/// One row of the session listing.
#[derive(Debug, Clone)]
pub struct SessionSummary {
    pub session: WorkflowSession,
    /// Current holder, when another command is working on the session
    pub lock: Option<SessionLock>,
    pub allowed_actions: BTreeSet<Action>,
}

/// Runs operations against one repository.
pub struct Engine {
    config: Config,
    repo: SessionRepository,
    git: Box<dyn GitRunner>,
    platform: Box<dyn RemotePlatform>,
    hooks: Option<HooksInspector>,
    cancel: CancelToken,
    validator: BranchValidator,
}

impl Engine {
    pub fn new(
        config: Config,
        repo: SessionRepository,
        git: Box<dyn GitRunner>,
        platform: Box<dyn RemotePlatform>,
    ) -> Self {
        let validator = BranchValidator::new(config.branch_rules());
        Self { config, repo, git, platform, hooks: None, cancel: CancelToken::new(), validator }
    }

    /// Use a shared cancellation flag (normally wired to Ctrl-C).
    #[must_use]
    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Report missing git hooks during ship pre-flight.
    #[must_use]
    pub fn with_hooks(mut self, hooks: HooksInspector) -> Self {
        self.hooks = Some(hooks);
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn repository(&self) -> &SessionRepository {
        &self.repo
    }

    pub fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }

    /// Run one operation.
    pub fn execute(&self, operation: Operation) -> WorkflowResult<Outcome> {
        match operation {
            Operation::Launch { description, branch } => self
                .launch(LaunchRequest::launch().with_description(description).with_branch(branch))
                .map(Outcome::Launched),
            Operation::Hotfix { description, branch } => self
                .launch(LaunchRequest::hotfix().with_description(description).with_branch(branch))
                .map(Outcome::Launched),
            Operation::Ship(options) => self.ship(options).map(Outcome::Shipped),
            Operation::Swap { branch } => self.swap(&branch).map(Outcome::Swapped),
            Operation::Switch { branch } => self.switch(&branch).map(Outcome::Switched),
            Operation::Abort(options) => self.abort(options).map(Outcome::Aborted),
            Operation::Sessions { all } => Ok(Outcome::Sessions(self.sessions(all))),
            Operation::Cleanup => self.cleanup().map(Outcome::Cleaned),
        }
    }

    /// Live sessions with their lock holder and next actions.
    pub fn sessions(&self, include_terminal: bool) -> Vec<SessionSummary> {
        self.repo
            .list(include_terminal)
            .into_iter()
            .map(|session| {
                let machine = StateMachine::for_workflow(session.workflow_type);
                SessionSummary {
                    lock: self.repo.lock_holder(session.id),
                    allowed_actions: machine.allowed_actions(session.current_state),
                    session,
                }
            })
            .collect()
    }

    /// The non-terminal session that owns `branch`.
    fn live_session(&self, branch: &str) -> Option<WorkflowSession> {
        self.repo.get_by_branch(branch).filter(|s| !s.is_terminal())
    }

    fn stashes(&self) -> StashCoordinator<'_> {
        StashCoordinator::new(self.git.as_ref())
    }

    fn advance(
        &self,
        session: &mut WorkflowSession,
        milestone: Milestone,
        trigger: &str,
        rewalk: bool,
    ) -> WorkflowResult<bool> {
        self.advance_with(session, milestone, trigger, rewalk, TransitionMetadata::new())
    }

    /// Move `session` to the state its graph uses for `milestone` and persist.
    ///
    /// Only moves forward, so resumed sessions skip steps they already
    /// passed. With `rewalk` the session may also step back along a graph
    /// edge, which is how new commits re-enter the commit/push/PR path.
    /// Returns whether a transition happened.
    fn advance_with(
        &self,
        session: &mut WorkflowSession,
        milestone: Milestone,
        trigger: &str,
        rewalk: bool,
        metadata: TransitionMetadata,
    ) -> WorkflowResult<bool> {
        let machine = StateMachine::for_workflow(session.workflow_type);
        let Some(target) = machine.state_for(milestone) else {
            return Ok(false);
        };
        let current = session.current_state;
        if target == current {
            return Ok(false);
        }
        let forward = target.rank() > current.rank();
        if !forward && !(rewalk && machine.can_transition(current, target)) {
            return Ok(false);
        }

        machine.transition(session, target, trigger, metadata)?;
        self.repo.update(session)?;
        tracing::info!(
            session = %session.short_id(),
            branch = %session.branch_name,
            state = %target,
            "{trigger}"
        );
        Ok(true)
    }

    /// Append an audit entry for a finished operation.
    fn audit<T>(
        &self,
        action: &str,
        session_id: Option<Uuid>,
        branch: Option<&str>,
        result: &WorkflowResult<T>,
    ) {
        let outcome = match result {
            Ok(_) => AuditOutcome::Success,
            Err(
                WorkflowError::Validation { .. }
                | WorkflowError::Lock { .. }
                | WorkflowError::AlreadyExists { .. },
            ) => AuditOutcome::Blocked,
            Err(_) => AuditOutcome::Failure,
        };

        let mut entry = AuditEntry::new(action, outcome);
        if let Some(id) = session_id {
            entry = entry.session(id);
        }
        if let Some(branch) = branch {
            entry = entry.branch(branch);
        }
        if let Err(e) = result {
            tracing::warn!(action, "{e}");
            entry = entry.error(e);
        }
        self.repo.audit().record(&entry);
    }
}
