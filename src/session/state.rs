//! Workflow kinds, states and user-facing actions.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Kind of workflow a session runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowType {
    /// Feature work started with `launch`
    Launch,
    /// Existing branch adopted by `ship`
    Ship,
    /// Expedited fix without an approval gate
    Hotfix,
}

impl WorkflowType {
    /// Whether this workflow runs on the hotfix graph.
    pub const fn is_hotfix(self) -> bool {
        matches!(self, Self::Hotfix)
    }
}

impl fmt::Display for WorkflowType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Launch => "launch",
            Self::Ship => "ship",
            Self::Hotfix => "hotfix",
        };
        write!(f, "{s}")
    }
}

/// Every state any workflow graph can be in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkflowState {
    Init,
    BranchReady,
    ChangesCommitted,
    Pushed,
    PrCreated,
    WaitingApproval,
    Rebasing,
    Merging,
    Cleanup,
    Complete,
    HotfixInit,
    HotfixReady,
    HotfixCommitted,
    HotfixPushed,
    HotfixPrCreated,
    HotfixMerging,
    HotfixCleanup,
    HotfixComplete,
    Aborted,
}

impl WorkflowState {
    /// Position along the happy path, shared by both graphs.
    ///
    /// Orchestrators use this to skip steps a resumed session already passed.
    pub const fn rank(self) -> u8 {
        match self {
            Self::Init | Self::HotfixInit => 0,
            Self::BranchReady | Self::HotfixReady => 1,
            Self::ChangesCommitted | Self::HotfixCommitted => 2,
            Self::Pushed | Self::HotfixPushed => 3,
            Self::PrCreated | Self::HotfixPrCreated => 4,
            Self::WaitingApproval => 5,
            Self::Rebasing => 6,
            Self::Merging | Self::HotfixMerging => 7,
            Self::Cleanup | Self::HotfixCleanup => 8,
            Self::Complete | Self::HotfixComplete => 9,
            Self::Aborted => 10,
        }
    }

    /// Wire name, as stored in session files.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Init => "INIT",
            Self::BranchReady => "BRANCH_READY",
            Self::ChangesCommitted => "CHANGES_COMMITTED",
            Self::Pushed => "PUSHED",
            Self::PrCreated => "PR_CREATED",
            Self::WaitingApproval => "WAITING_APPROVAL",
            Self::Rebasing => "REBASING",
            Self::Merging => "MERGING",
            Self::Cleanup => "CLEANUP",
            Self::Complete => "COMPLETE",
            Self::HotfixInit => "HOTFIX_INIT",
            Self::HotfixReady => "HOTFIX_READY",
            Self::HotfixCommitted => "HOTFIX_COMMITTED",
            Self::HotfixPushed => "HOTFIX_PUSHED",
            Self::HotfixPrCreated => "HOTFIX_PR_CREATED",
            Self::HotfixMerging => "HOTFIX_MERGING",
            Self::HotfixCleanup => "HOTFIX_CLEANUP",
            Self::HotfixComplete => "HOTFIX_COMPLETE",
            Self::Aborted => "ABORTED",
        }
    }
}

impl fmt::Display for WorkflowState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Graph-independent step names used by orchestrators.
///
/// Each workflow graph maps a milestone to its own state, or to nothing
/// when the graph has no such step (hotfix has no approval gate).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Milestone {
    Ready,
    Committed,
    Pushed,
    PrOpened,
    AwaitingApproval,
    Rebased,
    Merging,
    Cleanup,
    Complete,
}

/// User-facing verbs derived from outgoing transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    Start,
    Commit,
    Push,
    CreatePr,
    WaitApproval,
    Rebase,
    Merge,
    Cleanup,
    Complete,
    Abort,
}

impl Action {
    /// The verb reached by entering `state`.
    pub const fn for_target(state: WorkflowState) -> Self {
        match state {
            WorkflowState::Init
            | WorkflowState::HotfixInit
            | WorkflowState::BranchReady
            | WorkflowState::HotfixReady => Self::Start,
            WorkflowState::ChangesCommitted | WorkflowState::HotfixCommitted => Self::Commit,
            WorkflowState::Pushed | WorkflowState::HotfixPushed => Self::Push,
            WorkflowState::PrCreated | WorkflowState::HotfixPrCreated => Self::CreatePr,
            WorkflowState::WaitingApproval => Self::WaitApproval,
            WorkflowState::Rebasing => Self::Rebase,
            WorkflowState::Merging | WorkflowState::HotfixMerging => Self::Merge,
            WorkflowState::Cleanup | WorkflowState::HotfixCleanup => Self::Cleanup,
            WorkflowState::Complete | WorkflowState::HotfixComplete => Self::Complete,
            WorkflowState::Aborted => Self::Abort,
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Start => "start",
            Self::Commit => "commit",
            Self::Push => "push",
            Self::CreatePr => "create_pr",
            Self::WaitApproval => "wait_approval",
            Self::Rebase => "rebase",
            Self::Merge => "merge",
            Self::Cleanup => "cleanup",
            Self::Complete => "complete",
            Self::Abort => "abort",
        };
        write!(f, "{s}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_serializes_screaming_snake() {
        let json = serde_json::to_string(&WorkflowState::HotfixPrCreated).unwrap();
        assert_eq!(json, "\"HOTFIX_PR_CREATED\"");
        let back: WorkflowState = serde_json::from_str("\"WAITING_APPROVAL\"").unwrap();
        assert_eq!(back, WorkflowState::WaitingApproval);
    }

    #[test]
    fn test_display_matches_wire_name() {
        assert_eq!(WorkflowState::PrCreated.to_string(), "PR_CREATED");
        assert_eq!(WorkflowType::Hotfix.to_string(), "hotfix");
    }

    #[test]
    fn test_rank_is_shared_between_graphs() {
        assert_eq!(WorkflowState::Pushed.rank(), WorkflowState::HotfixPushed.rank());
        assert!(WorkflowState::Merging.rank() > WorkflowState::WaitingApproval.rank());
    }
}
