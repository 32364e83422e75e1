//! Launch and hotfix: validate a branch name, create the branch and its session.

use crate::error::{WorkflowError, WorkflowResult};
use crate::session::{Milestone, WorkflowSession, WorkflowType};
use crate::validation::{branch_name_from_description, BranchObservation};

use super::Engine;

/// Input for [`Engine::launch`].
#[derive(Debug, Clone)]
pub struct LaunchRequest {
    pub workflow: WorkflowType,
    /// Human description; also used to derive a name when none is given
    pub description: Option<String>,
    /// Explicit branch name
    pub branch_name: Option<String>,
    /// Stash popped onto the new branch once it exists
    pub(crate) carried_stash: Option<String>,
}

impl LaunchRequest {
    pub fn launch() -> Self {
        Self::new(WorkflowType::Launch)
    }

    pub fn hotfix() -> Self {
        Self::new(WorkflowType::Hotfix)
    }

    fn new(workflow: WorkflowType) -> Self {
        Self { workflow, description: None, branch_name: None, carried_stash: None }
    }

    #[must_use]
    pub fn with_description(mut self, description: Option<String>) -> Self {
        self.description = description.filter(|d| !d.trim().is_empty());
        self
    }

    #[must_use]
    pub fn with_branch(mut self, branch: Option<String>) -> Self {
        self.branch_name = branch.map(|b| b.trim().to_string()).filter(|b| !b.is_empty());
        self
    }

    fn action(&self) -> &'static str {
        if self.workflow.is_hotfix() {
            "hotfix"
        } else {
            "launch"
        }
    }
}

/// Result of a successful launch.
#[derive(Debug, Clone)]
pub struct LaunchReport {
    pub session: WorkflowSession,
    /// The branch did not exist before this launch
    pub branch_created: bool,
    /// A carried stash was applied to the new branch
    pub stash_applied: bool,
    pub warnings: Vec<String>,
}

impl Engine {
    /// Create a branch from the protected branch and start a session on it.
    pub fn launch(&self, request: LaunchRequest) -> WorkflowResult<LaunchReport> {
        let result = self.run_launch(&request);
        let branch = match &result {
            Ok(report) => Some(report.session.branch_name.clone()),
            Err(_) => request.branch_name.clone(),
        };
        let session_id = result.as_ref().ok().map(|r| r.session.id);
        self.audit(request.action(), session_id, branch.as_deref(), &result);
        result
    }

    fn run_launch(&self, request: &LaunchRequest) -> WorkflowResult<LaunchReport> {
        let rules = self.validator.rules();
        let workflow = request.workflow;
        let remote = self.config.general.remote.as_str();
        let base = self.config.general.protected_branch.as_str();

        let requested = match (&request.branch_name, &request.description) {
            (Some(name), _) => name.clone(),
            (None, Some(description)) => branch_name_from_description(
                description,
                rules.default_prefix(workflow),
                rules.max_length,
            ),
            (None, None) => {
                return Err(WorkflowError::validation(
                    "A branch name or a description is required",
                    Vec::new(),
                    vec![format!("shipflow {} \"short description\"", request.action())],
                ))
            }
        };

        let mut naming = self
            .validator
            .validate_name(&requested, workflow)
            .into_result(&format!("Invalid branch name '{requested}'"))?;
        let name = naming.normalized.take().unwrap_or(requested);

        self.cancel.checkpoint("fetch")?;
        self.git.fetch(remote)?;

        let observed = self.observe(&name)?;
        let history = self.repo.branches();
        let record = history.get(&name);
        let is_taken =
            |candidate: &str| history.contains(candidate) || self.git.branch_exists(candidate).unwrap_or(false);
        let verdict = self
            .validator
            .validate_launch(&name, workflow, record.as_ref(), observed, &is_taken)
            .into_result(&format!("Cannot launch '{name}'"))?;

        if let Some(existing) = self.live_session(&name) {
            return Err(WorkflowError::AlreadyExists { branch: name, session_id: existing.id });
        }

        self.cancel.checkpoint("sync")?;
        self.git.fast_forward(remote, base)?;

        let previous = self.git.current_branch().ok();
        let branch_created = if observed.local_exists {
            self.git.checkout(&name)?;
            false
        } else if observed.remote_exists {
            self.git.create_branch(&name, &format!("{remote}/{name}"))?;
            false
        } else {
            self.git.create_branch(&name, base)?;
            true
        };

        if record.as_ref().is_some_and(|r| r.deleted_at.is_some()) {
            history.update(&name, |r| r.mark_recreated())?;
        }

        let mut session =
            WorkflowSession::new(&name, workflow, base, self.config.sessions.expiry_days);
        session.metadata.description = request.description.clone();
        session.metadata.branch_created = branch_created;
        if let Err(e) = self.repo.create(&session) {
            self.rollback_branch(&name, branch_created, previous.as_deref());
            return Err(e);
        }

        let _guard = self.repo.lock(session.id)?;
        self.advance(&mut session, Milestone::Ready, request.action(), false)?;

        let stash_applied = match &request.carried_stash {
            Some(stash) => {
                self.stashes().pop_named(stash)?;
                true
            }
            None => false,
        };

        let mut warnings = naming.warnings;
        warnings.extend(verdict.warnings);
        tracing::info!(session = %session.short_id(), branch = %name, %workflow, "launched");
        Ok(LaunchReport { session, branch_created, stash_applied, warnings })
    }

    /// What git currently knows about `name`.
    fn observe(&self, name: &str) -> WorkflowResult<BranchObservation> {
        let local_exists = self.git.branch_exists(name)?;
        let remote_exists = self.git.remote_branch_exists(&self.config.general.remote, name)?;
        let merged_into_base =
            local_exists && self.git.is_branch_merged(name, &self.config.general.protected_branch)?;
        Ok(BranchObservation { local_exists, remote_exists, merged_into_base })
    }

    /// Undo a branch created by a launch that failed before its session existed.
    fn rollback_branch(&self, name: &str, created: bool, previous: Option<&str>) {
        if let Some(previous) = previous.filter(|p| *p != name) {
            if let Err(e) = self.git.checkout(previous) {
                tracing::warn!(branch = previous, "could not return to branch: {e}");
                return;
            }
        }
        if created {
            if let Err(e) = self.git.delete_branch(name, true, None) {
                tracing::warn!(branch = name, "could not remove branch after failed launch: {e}");
            }
        }
    }
}
