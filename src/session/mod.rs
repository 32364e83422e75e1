//! Workflow sessions.
//!
//! A session is the persistent record of one in-progress workflow bound to
//! one branch. Its state only changes through [`StateMachine::transition`],
//! and the [`SessionRepository`] persists it after every step.

mod audit;
mod branches;
mod lock;
mod machine;
mod repository;
mod state;

use std::collections::BTreeMap;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub use audit::{AuditEntry, AuditLog, AuditOutcome};
pub use branches::{BranchHistory, BranchRecord};
pub use lock::{FileLocker, Locker, MemoryLocker, SessionLock, SessionLockGuard};
pub use machine::{StateDefinition, StateMachine, TransitionError};
pub use repository::SessionRepository;
pub use state::{Action, Milestone, WorkflowState, WorkflowType};

/// Default session lifetime.
pub const DEFAULT_EXPIRY_DAYS: i64 = 30;

/// Free-form metadata attached to a single transition.
pub type TransitionMetadata = BTreeMap<String, serde_json::Value>;

/// One recorded state change. Never mutated after it is appended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateTransition {
    pub from: WorkflowState,
    pub to: WorkflowState,
    pub trigger: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: TransitionMetadata,
}

/// State of a pull request on the remote platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PrState {
    Open,
    Merged,
    Closed,
}

impl std::fmt::Display for PrState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Open => "open",
            Self::Merged => "merged",
            Self::Closed => "closed",
        };
        write!(f, "{s}")
    }
}

/// Pull request attached to a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PullRequestRecord {
    pub number: u64,
    pub state: PrState,
    pub url: String,
}

/// Why an auto-stash was created.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StashPurpose {
    Swap,
    Switch,
}

impl std::fmt::Display for StashPurpose {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Swap => write!(f, "swap"),
            Self::Switch => write!(f, "switch"),
        }
    }
}

/// An auto-stash owned by one session.
///
/// `stash_ref` is the stash message, not a `stash@{n}` index: indices shift
/// whenever another stash is pushed, so the coordinator resolves the
/// current index by name when popping.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StashRecord {
    pub stash_ref: String,
    pub session_id: Uuid,
    pub created_at: DateTime<Utc>,
    pub purpose: StashPurpose,
}

/// Branch lifecycle flags and references carried by a session.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionMetadata {
    /// Branch the work is based on and merges into
    pub base_branch: String,

    /// Human description given at launch
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub pull_request: Option<PullRequestRecord>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub stash: Option<StashRecord>,

    /// Branch was created by this session (as opposed to adopted)
    pub branch_created: bool,

    pub local_branch_deleted: bool,
    pub remote_branch_deleted: bool,

    /// Protected branch was fast-forwarded after merge
    pub protected_synced: bool,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub approved_at: Option<DateTime<Utc>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub aborted_at: Option<DateTime<Utc>>,
}

/// The persistent record of one workflow instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowSession {
    pub id: Uuid,
    pub branch_name: String,
    pub workflow_type: WorkflowType,
    pub current_state: WorkflowState,
    #[serde(default)]
    pub state_history: Vec<StateTransition>,
    #[serde(default)]
    pub metadata: SessionMetadata,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl WorkflowSession {
    /// Create a session in the initial state of its workflow graph.
    pub fn new(
        branch_name: impl Into<String>,
        workflow_type: WorkflowType,
        base_branch: impl Into<String>,
        expiry_days: i64,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            branch_name: branch_name.into(),
            workflow_type,
            current_state: StateMachine::for_workflow(workflow_type).initial_state(),
            state_history: Vec::new(),
            metadata: SessionMetadata { base_branch: base_branch.into(), ..Default::default() },
            created_at: now,
            updated_at: now,
            expires_at: now + Duration::days(expiry_days),
        }
    }

    /// Whether the session reached a terminal state.
    pub fn is_terminal(&self) -> bool {
        StateMachine::for_workflow(self.workflow_type).is_terminal(self.current_state)
    }

    /// Whether `expires_at` is in the past.
    pub fn is_expired(&self) -> bool {
        self.expires_at <= Utc::now()
    }

    /// Short id used in stash names and listings.
    pub fn short_id(&self) -> String {
        self.id.simple().to_string()[..8].to_string()
    }

    /// Last transition recorded, if any.
    pub fn last_transition(&self) -> Option<&StateTransition> {
        self.state_history.last()
    }

    /// Replay the history against the graph.
    ///
    /// Returns the index of the first transition the graph would have
    /// rejected, or `None` when the whole history is consistent.
    pub fn first_invalid_transition(&self) -> Option<usize> {
        let machine = StateMachine::for_workflow(self.workflow_type);
        let mut expected_from = machine.initial_state();
        for (idx, t) in self.state_history.iter().enumerate() {
            if t.from != expected_from || !machine.can_transition(t.from, t.to) {
                return Some(idx);
            }
            expected_from = t.to;
        }
        if expected_from == self.current_state {
            None
        } else {
            Some(self.state_history.len())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_session_starts_in_initial_state() {
        let session = WorkflowSession::new("feature/auth", WorkflowType::Launch, "main", 30);
        assert_eq!(session.current_state, WorkflowState::Init);
        assert!(session.state_history.is_empty());
        assert_eq!(session.metadata.base_branch, "main");
        assert!(!session.is_terminal());

        let hotfix = WorkflowSession::new("hotfix/crash", WorkflowType::Hotfix, "main", 30);
        assert_eq!(hotfix.current_state, WorkflowState::HotfixInit);
    }

    #[test]
    fn test_expiry_is_thirty_days_out() {
        let session =
            WorkflowSession::new("feature/a", WorkflowType::Launch, "main", DEFAULT_EXPIRY_DAYS);
        assert_eq!((session.expires_at - session.created_at).num_days(), 30);
        assert!(!session.is_expired());
    }

    #[test]
    fn test_history_replay_detects_tampering() {
        let machine = StateMachine::for_workflow(WorkflowType::Launch);
        let mut session = WorkflowSession::new("feature/a", WorkflowType::Launch, "main", 30);
        machine
            .transition(&mut session, WorkflowState::BranchReady, "launch", TransitionMetadata::new())
            .unwrap();
        assert_eq!(session.first_invalid_transition(), None);

        session.state_history.push(StateTransition {
            from: WorkflowState::BranchReady,
            to: WorkflowState::Complete,
            trigger: "forged".to_string(),
            timestamp: Utc::now(),
            metadata: TransitionMetadata::new(),
        });
        assert_eq!(session.first_invalid_transition(), Some(1));
    }

    #[test]
    fn test_session_json_round_trip_keeps_wire_names() {
        let session = WorkflowSession::new("feature/a", WorkflowType::Ship, "main", 30);
        let json = serde_json::to_string(&session).unwrap();
        assert!(json.contains("\"workflow_type\":\"ship\""));
        assert!(json.contains("\"current_state\":\"INIT\""));
        let back: WorkflowSession = serde_json::from_str(&json).unwrap();
        assert_eq!(back, session);
    }
}
