//! Ship: take the current branch from local changes to a merged pull
//! request and a clean protected branch.
//!
//! Each step is skipped when the session already passed it, so re-running
//! `ship` after a failure or an interrupt continues from the last persisted
//! state.

use crate::error::{WorkflowError, WorkflowResult};
use crate::platform::{CheckOutcome, MergeStrategy, PrUpdate, PullRequest};
use crate::session::{
    Milestone, PrState, PullRequestRecord, StateMachine, TransitionMetadata, WorkflowSession,
    WorkflowState, WorkflowType,
};
use crate::validation::{BranchObservation, PrDecision, PrValidator};

use super::{Engine, PreflightReport};

/// Options for [`Engine::ship`].
#[derive(Debug, Clone, Copy, Default)]
pub struct ShipOptions {
    /// Merge without stopping at the approval gate
    pub confirm: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShipStatus {
    /// Merged and cleaned up
    Completed,
    /// Checks passed; waiting for the user to confirm the merge
    AwaitingConfirmation,
}

/// Result of a ship run.
#[derive(Debug, Clone)]
pub struct ShipReport {
    pub session: WorkflowSession,
    pub status: ShipStatus,
    pub preflight: PreflightReport,
    pub pull_request: Option<PullRequestRecord>,
    /// The pull request was merged outside shipflow; only cleanup ran
    pub merged_externally: bool,
    /// Problems found when re-reading the final state
    pub postflight: Vec<String>,
}

/// What pre-flight learned about the remote side.
#[derive(Debug, Default)]
struct ShipPlan {
    decision: Option<PrDecision>,
    merged: Option<PullRequest>,
}

impl Engine {
    /// Ship the current branch.
    pub fn ship(&self, options: ShipOptions) -> WorkflowResult<ShipReport> {
        let branch = match self.git.current_branch() {
            Ok(branch) => branch,
            Err(e) => {
                let result = Err(e.into());
                self.audit("ship", None, None, &result);
                return result;
            }
        };

        let result = self.run_ship(&branch, options);
        let session_id = match &result {
            Ok(report) => Some(report.session.id),
            Err(_) => self.repo.get_by_branch(&branch).map(|s| s.id),
        };
        self.audit("ship", session_id, Some(&branch), &result);
        result
    }

    fn run_ship(&self, branch: &str, options: ShipOptions) -> WorkflowResult<ShipReport> {
        let existing = self.live_session(branch);
        let (preflight, plan) = self.ship_preflight(branch, existing.as_ref());
        preflight.ensure_passed("ship")?;

        let session = match existing {
            Some(session) => session,
            None => self.adopt(branch)?,
        };
        let _guard = self.repo.lock(session.id)?;
        let mut session = self
            .repo
            .get(session.id)
            .ok_or_else(|| WorkflowError::NotFound(format!("session {}", session.id)))?;

        let machine = StateMachine::for_workflow(session.workflow_type);
        if session.current_state == machine.initial_state() {
            self.advance(&mut session, Milestone::Ready, "adopt", false)?;
        }

        let mut report = ShipReport {
            session: session.clone(),
            status: ShipStatus::Completed,
            preflight,
            pull_request: None,
            merged_externally: false,
            postflight: Vec::new(),
        };

        if let Some(merged) = plan.merged {
            tracing::info!(pr = merged.number, branch, "pull request already merged; cleaning up");
            self.record_merge(&mut session, merged.record())?;
            report.merged_externally = true;
            self.finish_cleanup(&mut session)?;
        } else if session.current_state.rank() >= WorkflowState::Cleanup.rank() {
            self.finish_cleanup(&mut session)?;
        } else {
            let decision = plan.decision.unwrap_or(PrDecision::Create);
            let merged = self.deliver(&mut session, decision, options)?;
            if !merged {
                report.status = ShipStatus::AwaitingConfirmation;
                report.pull_request = session.metadata.pull_request.clone();
                report.session = session;
                return Ok(report);
            }
            self.finish_cleanup(&mut session)?;
        }

        report.postflight = self.postflight(&session);
        report.pull_request = session.metadata.pull_request.clone();
        report.session = session;
        Ok(report)
    }

    /// Read-only checks. Never fails; findings go into the report.
    fn ship_preflight(
        &self,
        branch: &str,
        session: Option<&WorkflowSession>,
    ) -> (PreflightReport, ShipPlan) {
        let mut report = PreflightReport::new();
        let mut plan = ShipPlan::default();
        let base = &self.config.general.protected_branch;

        if branch == base {
            report.fail(
                "protected branch",
                format!("'{base}' only changes through merged pull requests"),
                vec![
                    "shipflow launch \"short description\"".to_string(),
                    "shipflow swap <branch>".to_string(),
                ],
            );
            return (report, plan);
        }

        match session {
            Some(s) if s.first_invalid_transition().is_some() => report.fail(
                "session",
                format!("history of session {} does not match its workflow", s.short_id()),
                vec![format!("shipflow abort {branch}")],
            ),
            Some(s) => report.pass("session", format!("{branch} in {}", s.current_state)),
            None => {
                let naming = self.validator.validate_name(branch, WorkflowType::Ship);
                if naming.valid {
                    report.pass("session", format!("no session for {branch}; it will be adopted"));
                } else {
                    report.fail("branch name", naming.errors.join("; "), naming.suggestions);
                }
            }
        }

        if let Err(e) = self.platform.check_connection() {
            report.fail(
                "platform",
                format!("{} unreachable: {e}", self.platform.name()),
                vec!["Check GITHUB_TOKEN and network access".to_string()],
            );
            return (report, plan);
        }
        report.pass("platform", format!("{} reachable", self.platform.name()));

        let pull_requests = match self.platform.pull_requests_for_branch(branch) {
            Ok(prs) => prs,
            Err(e) => {
                report.fail("pull requests", format!("could not list pull requests: {e}"), Vec::new());
                return (report, plan);
            }
        };

        let recorded = session.and_then(|s| s.metadata.pull_request.as_ref());
        if let Some(record) = recorded {
            let current = pull_requests
                .iter()
                .find(|pr| pr.number == record.number)
                .cloned()
                .or_else(|| self.platform.pull_request(record.number).ok());
            if let Some(pr) = current.filter(|pr| pr.state == PrState::Merged) {
                report.pass("pull requests", format!("PR #{} already merged", pr.number));
                plan.merged = Some(pr);
                return (report, plan);
            }
        }

        let past_merge = session.is_some_and(|s| s.current_state.rank() >= WorkflowState::Merging.rank());
        if !past_merge {
            self.check_branch_reuse(branch, &mut report);
        }

        let (decision, verdict) = PrValidator::new().decide(&pull_requests);
        match &decision {
            PrDecision::Block { .. } => {
                report.fail("pull requests", verdict.errors.join("; "), verdict.suggestions);
            }
            PrDecision::Update { number } => {
                report.pass("pull requests", format!("PR #{number} will be updated"));
            }
            PrDecision::Create => report.pass("pull requests", "a new PR will be opened"),
        }
        for warning in verdict.warnings {
            report.warn("pull requests", warning);
        }
        plan.decision = Some(decision);

        if let Some(hooks) = &self.hooks {
            let missing = hooks.missing();
            if missing.is_empty() {
                report.pass("hooks", "git hooks installed");
            } else {
                report.warn("hooks", format!("missing git hooks: {}", missing.join(", ")));
            }
        }

        (report, plan)
    }

    fn check_branch_reuse(&self, branch: &str, report: &mut PreflightReport) {
        let remote_exists = self
            .git
            .remote_branch_exists(&self.config.general.remote, branch)
            .unwrap_or(false);
        let observed =
            BranchObservation { local_exists: true, remote_exists, merged_into_base: false };
        let history = self.repo.branches();
        let record = history.get(branch);
        let is_taken = |candidate: &str| history.contains(candidate);
        let verdict = self.validator.check_reuse(branch, record.as_ref(), observed, &is_taken);
        if verdict.valid {
            report.pass("branch history", format!("{branch} has not been merged before"));
        } else {
            report.fail("branch history", verdict.errors.join("; "), verdict.suggestions);
        }
    }

    /// Start a ship-workflow session for a branch created outside shipflow.
    fn adopt(&self, branch: &str) -> WorkflowResult<WorkflowSession> {
        let session = WorkflowSession::new(
            branch,
            WorkflowType::Ship,
            self.config.general.protected_branch.as_str(),
            self.config.sessions.expiry_days,
        );
        self.repo.create(&session)?;
        tracing::info!(session = %session.short_id(), branch, "adopted branch");
        Ok(session)
    }

    /// Commit, push, open the PR, wait for checks and merge.
    ///
    /// Returns `false` when it stopped at the confirmation gate.
    fn deliver(
        &self,
        session: &mut WorkflowSession,
        decision: PrDecision,
        options: ShipOptions,
    ) -> WorkflowResult<bool> {
        let branch = session.branch_name.clone();
        let remote = self.config.general.remote.as_str();
        let base = self.config.general.protected_branch.as_str();
        let machine = StateMachine::for_workflow(session.workflow_type);

        self.cancel.checkpoint("commit")?;
        let committed =
            self.git.has_uncommitted_changes()? && self.git.commit(&self.config.commit_message(&branch))?;
        if committed {
            self.advance(session, Milestone::Committed, "commit", true)?;
        }

        self.cancel.checkpoint("push")?;
        if committed || session.current_state.rank() < WorkflowState::Pushed.rank() {
            self.git.push(remote, &branch)?;
        }
        self.advance(session, Milestone::Pushed, "push", false)?;

        self.cancel.checkpoint("pull_request")?;
        let pr = match decision {
            PrDecision::Create => {
                let title = pr_title(session);
                let body = pr_body(session);
                self.platform.create_pull_request(&title, &body, &branch, base)?
            }
            PrDecision::Update { number } => {
                let update = PrUpdate { base: Some(base.to_string()), ..PrUpdate::default() };
                self.platform.update_pull_request(number, &update)?
            }
            PrDecision::Block { open } => {
                return Err(WorkflowError::validation(
                    format!("Branch {branch} has {} open pull requests", open.len()),
                    open.iter().map(|n| format!("#{n}")).collect(),
                    vec!["Close the duplicate pull requests and re-run 'shipflow ship'".to_string()],
                ));
            }
        };
        session.metadata.pull_request = Some(pr.record());
        self.repo.update(session)?;
        self.advance(session, Milestone::PrOpened, "pull_request", false)?;

        self.cancel.checkpoint("checks")?;
        let timeout = self.config.check_timeout();
        match self.platform.wait_for_checks(pr.number, timeout)? {
            CheckOutcome::Passed | CheckOutcome::NoChecks => {}
            CheckOutcome::Failed { failing } => {
                return Err(WorkflowError::validation(
                    format!("Checks failed on PR #{}: {}", pr.number, failing.join(", ")),
                    failing,
                    vec!["Fix the failing checks and re-run 'shipflow ship'".to_string()],
                ));
            }
            CheckOutcome::Pending | CheckOutcome::Timeout => {
                return Err(WorkflowError::Timeout {
                    number: pr.number,
                    timeout_secs: timeout.as_secs(),
                });
            }
        }
        self.advance(session, Milestone::AwaitingApproval, "checks_passed", false)?;

        if !options.confirm {
            tracing::info!(pr = pr.number, "checks passed; waiting for merge confirmation");
            return Ok(false);
        }

        let rebase = self.config.ship.rebase_before_merge
            && machine.state_for(Milestone::Rebased).is_some()
            && session.current_state.rank() < WorkflowState::Rebasing.rank();
        if rebase {
            self.cancel.checkpoint("rebase")?;
            self.git.fetch(remote)?;
            self.git.fast_forward(remote, base)?;
            self.git.rebase(base)?;
            self.git.force_push(remote, &branch)?;
            self.advance(session, Milestone::Rebased, "rebase", false)?;
        }

        self.cancel.checkpoint("merge")?;
        let mut confirmation = TransitionMetadata::new();
        confirmation.insert("confirmed".to_string(), serde_json::Value::Bool(true));
        self.advance_with(session, Milestone::Merging, "confirm_merge", false, confirmation)?;
        self.platform.merge_pull_request(pr.number, MergeStrategy::Squash)?;

        let mut merged = pr.record();
        merged.state = PrState::Merged;
        self.record_merge(session, merged)?;
        Ok(true)
    }

    /// Persist a merged PR and move the session to cleanup.
    fn record_merge(
        &self,
        session: &mut WorkflowSession,
        pull_request: PullRequestRecord,
    ) -> WorkflowResult<()> {
        let number = pull_request.number;
        session.metadata.pull_request = Some(pull_request);
        self.repo.update(session)?;
        self.repo.branches().update(&session.branch_name, |r| r.mark_merged(Some(number)))?;
        self.advance(session, Milestone::Cleanup, "merged", false)?;
        Ok(())
    }

    /// Sync the protected branch, delete the merged branch, complete.
    fn finish_cleanup(&self, session: &mut WorkflowSession) -> WorkflowResult<()> {
        let branch = session.branch_name.clone();
        let remote = self.config.general.remote.as_str();
        let base = self.config.general.protected_branch.as_str();

        self.cancel.checkpoint("sync")?;
        if !session.metadata.protected_synced {
            self.git.checkout(base)?;
            self.git.fetch(remote)?;
            self.git.fast_forward(remote, base)?;
            session.metadata.protected_synced = true;
            self.repo.update(session)?;
        }

        self.cancel.checkpoint("delete_branch")?;
        if !session.metadata.local_branch_deleted {
            let delete_remote = self.config.ship.delete_remote_branch
                && self.git.remote_branch_exists(remote, &branch)?;
            if self.git.branch_exists(&branch)? {
                self.git.delete_branch(&branch, true, delete_remote.then_some(remote))?;
            } else if delete_remote {
                self.git.delete_branch(&branch, false, Some(remote))?;
            }
            session.metadata.local_branch_deleted = true;
            session.metadata.remote_branch_deleted = delete_remote;
            self.repo.update(session)?;
            self.repo.branches().update(&branch, |r| r.mark_deleted(delete_remote))?;
        }

        self.advance(session, Milestone::Complete, "cleanup", false)?;
        Ok(())
    }

    /// Re-read everything ship claims to have done. Findings are warnings.
    fn postflight(&self, session: &WorkflowSession) -> Vec<String> {
        let mut issues = Vec::new();
        let branch = &session.branch_name;
        let remote = self.config.general.remote.as_str();
        let base = self.config.general.protected_branch.as_str();

        if let Some(record) = &session.metadata.pull_request {
            match self.platform.pull_request(record.number) {
                Ok(pr) if pr.state == PrState::Merged => {}
                Ok(pr) => issues.push(format!("PR #{} is {}", pr.number, pr.state)),
                Err(e) => issues.push(format!("could not verify PR #{}: {e}", record.number)),
            }
        }
        match self.git.branch_exists(branch) {
            Ok(false) => {}
            Ok(true) => issues.push(format!("local branch {branch} still exists")),
            Err(e) => issues.push(format!("could not check local branch: {e}")),
        }
        if session.metadata.remote_branch_deleted {
            match self.git.remote_branch_exists(remote, branch) {
                Ok(false) => {}
                Ok(true) => issues.push(format!("remote branch {remote}/{branch} still exists")),
                Err(e) => issues.push(format!("could not check remote branch: {e}")),
            }
        }
        match self.git.current_branch() {
            Ok(current) if current == base => {}
            Ok(current) => issues.push(format!("on {current}, expected {base}")),
            Err(e) => issues.push(format!("could not read current branch: {e}")),
        }
        if !session.is_terminal() {
            issues.push(format!("session is {}", session.current_state));
        }
        match self.git.has_uncommitted_changes() {
            Ok(false) => {}
            Ok(true) => issues.push("working tree has uncommitted changes".to_string()),
            Err(e) => issues.push(format!("could not read working tree: {e}")),
        }

        for issue in &issues {
            tracing::warn!(session = %session.short_id(), "post-flight: {issue}");
        }
        issues
    }
}

fn pr_title(session: &WorkflowSession) -> String {
    if let Some(description) = &session.metadata.description {
        return description.clone();
    }
    let slug = session.branch_name.rsplit('/').next().unwrap_or(&session.branch_name);
    let words = slug.replace(['-', '_'], " ");
    let mut chars = words.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => session.branch_name.clone(),
    }
}

fn pr_body(session: &WorkflowSession) -> String {
    format!(
        "Shipped with shipflow.\n\nWorkflow: {}\nSession: {}\n",
        session.workflow_type, session.id
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pr_title_from_branch() {
        let session = WorkflowSession::new("feature/add-oauth-login", WorkflowType::Launch, "main", 30);
        assert_eq!(pr_title(&session), "Add oauth login");

        let mut described = session.clone();
        described.metadata.description = Some("Add OAuth login".to_string());
        assert_eq!(pr_title(&described), "Add OAuth login");
    }
}
