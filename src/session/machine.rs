//! Per-workflow state graphs and the transition engine.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use thiserror::Error;

use super::{
    Action, Milestone, PrState, SessionMetadata, StateTransition, TransitionMetadata,
    WorkflowSession, WorkflowState, WorkflowType,
};

/// Pre-transition check. Returning `Err` aborts the transition.
pub type ValidationHook = fn(&WorkflowSession, &TransitionMetadata) -> Result<(), String>;

/// Exit/enter hook. Runs on a copy of the metadata that is only kept when
/// the transition succeeds.
pub type StateHook = fn(&mut SessionMetadata, DateTime<Utc>);

/// Errors returned by [`StateMachine::transition`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransitionError {
    /// Target is not reachable from the current state.
    #[error("Invalid transition {from} -> {to} for {workflow} workflow")]
    InvalidTransition { from: WorkflowState, to: WorkflowState, workflow: WorkflowType },

    /// Target state's validation hook rejected the transition.
    #[error("Transition {from} -> {to} rejected: {reason}")]
    ValidationFailed { from: WorkflowState, to: WorkflowState, reason: String },

    /// State does not belong to the workflow's graph.
    #[error("State {state} is not part of the {workflow} workflow")]
    UnknownState { state: WorkflowState, workflow: WorkflowType },
}

/// One node of a workflow graph.
#[derive(Debug, Clone)]
pub struct StateDefinition {
    pub state: WorkflowState,
    pub transitions: Vec<WorkflowState>,
    pub terminal: bool,
    pub requires_confirmation: bool,
    pub validate: Option<ValidationHook>,
    pub on_enter: Option<StateHook>,
    pub on_exit: Option<StateHook>,
}

impl StateDefinition {
    fn new(state: WorkflowState, transitions: &[WorkflowState]) -> Self {
        Self {
            state,
            transitions: transitions.to_vec(),
            terminal: false,
            requires_confirmation: false,
            validate: None,
            on_enter: None,
            on_exit: None,
        }
    }

    fn terminal(state: WorkflowState) -> Self {
        Self { terminal: true, ..Self::new(state, &[]) }
    }

    fn confirm(mut self) -> Self {
        self.requires_confirmation = true;
        self
    }

    fn validate(mut self, hook: ValidationHook) -> Self {
        self.validate = Some(hook);
        self
    }

    fn on_enter(mut self, hook: StateHook) -> Self {
        self.on_enter = Some(hook);
        self
    }

    fn on_exit(mut self, hook: StateHook) -> Self {
        self.on_exit = Some(hook);
        self
    }
}

/// A workflow's state graph.
#[derive(Debug)]
pub struct StateMachine {
    hotfix: bool,
    definitions: Vec<StateDefinition>,
}

static STANDARD: Lazy<StateMachine> = Lazy::new(StateMachine::standard);
static HOTFIX: Lazy<StateMachine> = Lazy::new(StateMachine::hotfix);

impl StateMachine {
    /// Graph for the given workflow type. Launch and ship share one graph.
    pub fn for_workflow(workflow: WorkflowType) -> &'static Self {
        if workflow.is_hotfix() {
            &HOTFIX
        } else {
            &STANDARD
        }
    }

    fn standard() -> Self {
        use WorkflowState::{
            BranchReady, ChangesCommitted, Cleanup, Complete, Init, Merging, PrCreated, Pushed,
            Rebasing, WaitingApproval,
        };

        Self::build(
            false,
            vec![
                StateDefinition::new(Init, &[BranchReady]),
                StateDefinition::new(BranchReady, &[ChangesCommitted, Pushed, Cleanup]),
                StateDefinition::new(ChangesCommitted, &[Pushed, Cleanup]),
                StateDefinition::new(Pushed, &[PrCreated, Cleanup]),
                StateDefinition::new(
                    PrCreated,
                    &[WaitingApproval, ChangesCommitted, Pushed, Cleanup],
                )
                .validate(require_open_pr),
                StateDefinition::new(
                    WaitingApproval,
                    &[Rebasing, Merging, ChangesCommitted, Pushed, Cleanup],
                )
                .confirm()
                .on_exit(stamp_approved),
                StateDefinition::new(Rebasing, &[Merging, ChangesCommitted, Cleanup]),
                StateDefinition::new(Merging, &[Cleanup]).confirm().validate(require_open_pr),
                StateDefinition::new(Cleanup, &[Complete]).validate(require_merged_pr),
                StateDefinition::terminal(Complete)
                    .validate(require_cleanup_done)
                    .on_enter(stamp_completed),
                StateDefinition::terminal(WorkflowState::Aborted).on_enter(stamp_aborted),
            ],
        )
    }

    fn hotfix() -> Self {
        use WorkflowState::{
            HotfixCleanup, HotfixCommitted, HotfixComplete, HotfixInit, HotfixMerging,
            HotfixPrCreated, HotfixPushed, HotfixReady,
        };

        Self::build(
            true,
            vec![
                StateDefinition::new(HotfixInit, &[HotfixReady]),
                StateDefinition::new(HotfixReady, &[HotfixCommitted, HotfixPushed, HotfixCleanup]),
                StateDefinition::new(HotfixCommitted, &[HotfixPushed, HotfixCleanup]),
                StateDefinition::new(HotfixPushed, &[HotfixPrCreated, HotfixCleanup]),
                StateDefinition::new(
                    HotfixPrCreated,
                    &[HotfixMerging, HotfixCommitted, HotfixPushed, HotfixCleanup],
                )
                .validate(require_open_pr),
                StateDefinition::new(HotfixMerging, &[HotfixCleanup])
                    .confirm()
                    .validate(require_open_pr),
                StateDefinition::new(HotfixCleanup, &[HotfixComplete]).validate(require_merged_pr),
                StateDefinition::terminal(HotfixComplete)
                    .validate(require_cleanup_done)
                    .on_enter(stamp_completed),
                StateDefinition::terminal(WorkflowState::Aborted).on_enter(stamp_aborted),
            ],
        )
    }

    /// Add the abort escape to every non-terminal state.
    fn build(hotfix: bool, mut definitions: Vec<StateDefinition>) -> Self {
        for def in definitions.iter_mut().filter(|d| !d.terminal) {
            def.transitions.push(WorkflowState::Aborted);
        }
        Self { hotfix, definitions }
    }

    /// Definition of a state in this graph.
    pub fn definition(&self, state: WorkflowState) -> Option<&StateDefinition> {
        self.definitions.iter().find(|d| d.state == state)
    }

    /// All states of this graph, in declaration order.
    pub fn states(&self) -> impl Iterator<Item = WorkflowState> + '_ {
        self.definitions.iter().map(|d| d.state)
    }

    /// Whether `state` belongs to this graph.
    pub fn contains(&self, state: WorkflowState) -> bool {
        self.definition(state).is_some()
    }

    pub fn initial_state(&self) -> WorkflowState {
        if self.hotfix {
            WorkflowState::HotfixInit
        } else {
            WorkflowState::Init
        }
    }

    pub fn is_terminal(&self, state: WorkflowState) -> bool {
        self.definition(state).is_some_and(|d| d.terminal)
    }

    pub fn requires_confirmation(&self, state: WorkflowState) -> bool {
        self.definition(state).is_some_and(|d| d.requires_confirmation)
    }

    /// True iff `to` is listed for `from` and `from` is not terminal.
    pub fn can_transition(&self, from: WorkflowState, to: WorkflowState) -> bool {
        self.definition(from).is_some_and(|d| !d.terminal && d.transitions.contains(&to))
    }

    /// The state this graph uses for a milestone, if it has one.
    pub fn state_for(&self, milestone: Milestone) -> Option<WorkflowState> {
        use WorkflowState as S;

        let state = match (self.hotfix, milestone) {
            (false, Milestone::Ready) => S::BranchReady,
            (false, Milestone::Committed) => S::ChangesCommitted,
            (false, Milestone::Pushed) => S::Pushed,
            (false, Milestone::PrOpened) => S::PrCreated,
            (false, Milestone::AwaitingApproval) => S::WaitingApproval,
            (false, Milestone::Rebased) => S::Rebasing,
            (false, Milestone::Merging) => S::Merging,
            (false, Milestone::Cleanup) => S::Cleanup,
            (false, Milestone::Complete) => S::Complete,
            (true, Milestone::Ready) => S::HotfixReady,
            (true, Milestone::Committed) => S::HotfixCommitted,
            (true, Milestone::Pushed) => S::HotfixPushed,
            (true, Milestone::PrOpened) => S::HotfixPrCreated,
            (true, Milestone::AwaitingApproval | Milestone::Rebased) => return None,
            (true, Milestone::Merging) => S::HotfixMerging,
            (true, Milestone::Cleanup) => S::HotfixCleanup,
            (true, Milestone::Complete) => S::HotfixComplete,
        };
        Some(state)
    }

    /// User-facing verbs available from `state`.
    pub fn allowed_actions(&self, state: WorkflowState) -> BTreeSet<Action> {
        match self.definition(state) {
            Some(def) if !def.terminal => {
                def.transitions.iter().map(|&to| Action::for_target(to)).collect()
            }
            _ => BTreeSet::new(),
        }
    }

    /// Move `session` to `to`, recording the transition.
    ///
    /// On error the session is left untouched.
    pub fn transition(
        &self,
        session: &mut WorkflowSession,
        to: WorkflowState,
        trigger: &str,
        metadata: TransitionMetadata,
    ) -> Result<StateTransition, TransitionError> {
        let from = session.current_state;
        let workflow = session.workflow_type;

        let source =
            self.definition(from).ok_or(TransitionError::UnknownState { state: from, workflow })?;
        let target =
            self.definition(to).ok_or(TransitionError::UnknownState { state: to, workflow })?;

        if !self.can_transition(from, to) {
            return Err(TransitionError::InvalidTransition { from, to, workflow });
        }

        if let Some(validate) = target.validate {
            validate(session, &metadata)
                .map_err(|reason| TransitionError::ValidationFailed { from, to, reason })?;
        }

        let now = Utc::now();
        let mut next_metadata = session.metadata.clone();
        if let Some(exit) = source.on_exit {
            exit(&mut next_metadata, now);
        }
        if let Some(enter) = target.on_enter {
            enter(&mut next_metadata, now);
        }

        let record =
            StateTransition { from, to, trigger: trigger.to_string(), timestamp: now, metadata };

        session.metadata = next_metadata;
        session.current_state = to;
        session.updated_at = now;
        session.state_history.push(record.clone());

        tracing::debug!(session = %session.id, %from, %to, trigger, "state transition");
        Ok(record)
    }
}

fn require_open_pr(session: &WorkflowSession, _: &TransitionMetadata) -> Result<(), String> {
    match &session.metadata.pull_request {
        Some(pr) if pr.state == PrState::Open => Ok(()),
        Some(pr) => Err(format!("pull request #{} is {}", pr.number, pr.state)),
        None => Err("no pull request recorded".to_string()),
    }
}

fn require_merged_pr(session: &WorkflowSession, _: &TransitionMetadata) -> Result<(), String> {
    match &session.metadata.pull_request {
        Some(pr) if pr.state == PrState::Merged => Ok(()),
        Some(pr) => Err(format!("pull request #{} is {}, not merged", pr.number, pr.state)),
        None => Err("no pull request recorded".to_string()),
    }
}

fn require_cleanup_done(session: &WorkflowSession, _: &TransitionMetadata) -> Result<(), String> {
    let meta = &session.metadata;
    if !meta.protected_synced {
        return Err(format!("{} has not been synced", meta.base_branch));
    }
    if !meta.local_branch_deleted {
        return Err(format!("local branch {} still exists", session.branch_name));
    }
    Ok(())
}

fn stamp_approved(meta: &mut SessionMetadata, now: DateTime<Utc>) {
    meta.approved_at.get_or_insert(now);
}

fn stamp_completed(meta: &mut SessionMetadata, now: DateTime<Utc>) {
    meta.completed_at = Some(now);
}

fn stamp_aborted(meta: &mut SessionMetadata, now: DateTime<Utc>) {
    meta.aborted_at = Some(now);
}
