//! End-to-end workflow tests.
//!
//! Each test drives the engine against in-memory git and platform fakes and
//! a session store in a temporary directory.

use shipflow::core::Config;
use shipflow::git::GitRunner;
use shipflow::platform::CheckOutcome;
use shipflow::session::{PrState, SessionRepository, StashPurpose, WorkflowSession, WorkflowState};
use shipflow::testing::{FakeGit, FakePlatform};
use shipflow::workflow::{
    AbortOptions, Engine, LaunchRequest, Operation, Outcome, ShipOptions, ShipStatus,
};
use shipflow::WorkflowError;
use tempfile::TempDir;

struct Harness {
    _dir: TempDir,
    git: FakeGit,
    platform: FakePlatform,
    engine: Engine,
}

fn harness() -> Harness {
    harness_with(Config::default())
}

fn harness_with(config: Config) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let git = FakeGit::new(dir.path());
    let platform = FakePlatform::new();
    let repo = SessionRepository::open(dir.path().join("shipflow"));
    let engine = Engine::new(config, repo, Box::new(git.clone()), Box::new(platform.clone()));
    Harness { _dir: dir, git, platform, engine }
}

impl Harness {
    fn launch(&self, branch: &str) -> WorkflowSession {
        self.engine
            .launch(LaunchRequest::launch().with_branch(Some(branch.to_string())))
            .unwrap()
            .session
    }

    fn ship(&self, confirm: bool) -> Result<shipflow::workflow::ShipReport, WorkflowError> {
        self.engine.ship(ShipOptions { confirm })
    }

    fn session(&self, branch: &str) -> WorkflowSession {
        self.engine.repository().get_by_branch(branch).unwrap()
    }
}

fn visited(session: &WorkflowSession) -> Vec<WorkflowState> {
    session.state_history.iter().map(|t| t.to).collect()
}

// ============================================================================
// Scenarios
// ============================================================================

#[test]
fn test_launch_creates_ready_session() {
    let h = harness();

    let outcome = h
        .engine
        .execute(Operation::Launch { description: None, branch: Some("feature/auth".to_string()) })
        .unwrap();

    let Outcome::Launched(report) = outcome else { panic!("expected a launch") };
    assert_eq!(report.session.current_state, WorkflowState::BranchReady);
    assert!(h.git.has_local("feature/auth"));
    assert_eq!(h.git.current(), "feature/auth");
    assert_eq!(h.session("feature/auth").id, report.session.id);
}

#[test]
fn test_ship_runs_full_sequence() {
    let h = harness();
    h.launch("feature/auth");
    h.git.write_file("src/auth.rs");
    h.git.land_on_remote("main");

    let report = h.ship(true).unwrap();

    assert_eq!(report.status, ShipStatus::Completed);
    assert_eq!(
        visited(&report.session),
        vec![
            WorkflowState::BranchReady,
            WorkflowState::ChangesCommitted,
            WorkflowState::Pushed,
            WorkflowState::PrCreated,
            WorkflowState::WaitingApproval,
            WorkflowState::Merging,
            WorkflowState::Cleanup,
            WorkflowState::Complete,
        ]
    );
    assert!(!h.git.has_local("feature/auth"));
    assert!(!h.git.has_remote("feature/auth"));
    assert_eq!(h.git.current(), "main");
    assert!(h.git.in_sync("main"));
    assert_eq!(h.platform.pull_requests()[0].state, PrState::Merged);
    assert!(report.postflight.is_empty(), "{:?}", report.postflight);
    assert_eq!(report.session.first_invalid_transition(), None);
}

#[test]
fn test_ship_after_external_merge_only_cleans_up() {
    let h = harness();
    h.launch("feature/x");
    h.git.write_file("x.rs");
    let first = h.ship(false).unwrap();
    assert_eq!(first.status, ShipStatus::AwaitingConfirmation);
    let number = first.pull_request.unwrap().number;

    h.platform.set_state(number, PrState::Merged);
    let git_calls = h.git.calls().len();

    let report = h.ship(false).unwrap();

    assert!(report.merged_externally);
    assert_eq!(report.session.current_state, WorkflowState::Complete);
    let later: Vec<_> = h.git.calls()[git_calls..].to_vec();
    assert!(!later.iter().any(|c| c.starts_with("commit") || c.starts_with("push")));
    assert!(!h.platform.calls().iter().any(|c| c.starts_with("merge_pull_request")));
    assert!(!h.git.has_local("feature/x"));
}

#[test]
fn test_swap_round_trip_keeps_origin_session() {
    let h = harness();
    let a = h.launch("feature/a");
    h.git.write_file("a.rs");

    let out = h.engine.swap("feature/b").unwrap();
    assert!(out.launched);
    let parked = h.engine.repository().get(a.id).unwrap();
    let stash = parked.metadata.stash.clone().unwrap();
    assert_eq!(stash.purpose, StashPurpose::Swap);
    assert_eq!(stash.session_id, a.id);
    assert!(stash.stash_ref.contains(&a.id.to_string()));

    let back = h.engine.swap("feature/a").unwrap();
    assert!(back.restored);

    let a = h.engine.repository().get(a.id).unwrap();
    assert!(a.metadata.stash.is_none());
    assert!(!visited(&a).contains(&WorkflowState::Aborted));
    assert_eq!(h.git.dirty_files(), vec!["a.rs".to_string()]);
    assert!(h.git.stash_messages().is_empty());
    assert_eq!(h.engine.sessions(false).len(), 2);
}

#[test]
fn test_switch_moves_changes_and_deletes_origin() {
    let h = harness();
    let a = h.launch("feature/a");
    h.git.write_file("a.rs");

    let report = h.engine.switch("feature/b").unwrap();

    assert_eq!(report.target.session.current_state, WorkflowState::BranchReady);
    assert!(report.target.stash_applied);
    assert_eq!(h.git.current(), "feature/b");
    assert_eq!(h.git.dirty_files(), vec!["a.rs".to_string()]);
    assert!(h.engine.repository().get(a.id).is_none());
    assert_eq!(h.engine.sessions(false).len(), 1);
}

#[test]
fn test_relaunching_merged_name_is_retired() {
    let h = harness();
    h.launch("feature/auth");
    h.git.write_file("src/auth.rs");
    h.ship(true).unwrap();

    let err = h
        .engine
        .launch(LaunchRequest::launch().with_branch(Some("feature/auth".to_string())))
        .unwrap_err();

    match err {
        WorkflowError::Validation { message, suggestions, .. } => {
            assert!(message.to_lowercase().contains("name retired"), "{message}");
            assert!(!suggestions.is_empty());
            assert!(suggestions.iter().all(|s| s != "feature/auth"));
        }
        other => panic!("unexpected error: {other}"),
    }
    assert!(!h.git.has_local("feature/auth"));
    assert!(h.engine.sessions(false).is_empty());
}

// ============================================================================
// Invariants and recovery
// ============================================================================

#[test]
fn test_recreated_merged_branch_is_blocked() {
    let h = harness();
    h.launch("feature/auth");
    h.git.write_file("src/auth.rs");
    h.ship(true).unwrap();
    h.git.add_local_branch("feature/auth", "main");

    let err = h
        .engine
        .launch(LaunchRequest::launch().with_branch(Some("feature/auth".to_string())))
        .unwrap_err();
    assert!(err.to_string().contains("Improper reuse"), "{err}");
}

#[test]
fn test_aborted_branch_can_be_relaunched() {
    let h = harness();
    h.launch("feature/a");
    h.engine.abort(AbortOptions::default()).unwrap();

    let report = h
        .engine
        .launch(LaunchRequest::launch().with_branch(Some("feature/a".to_string())))
        .unwrap();

    assert!(!report.branch_created);
    assert!(!report.warnings.is_empty());
    assert_eq!(h.git.current(), "feature/a");
}

#[test]
fn test_one_live_session_per_branch() {
    let h = harness();
    h.launch("feature/a");

    let err = h
        .engine
        .launch(LaunchRequest::launch().with_branch(Some("feature/a".to_string())))
        .unwrap_err();
    assert!(matches!(err, WorkflowError::AlreadyExists { .. }));
    assert_eq!(h.engine.sessions(true).len(), 1);
}

#[test]
fn test_two_open_prs_block_ship() {
    let h = harness();
    h.launch("feature/a");
    h.platform.add_pull_request("feature/a", PrState::Open);
    h.platform.add_pull_request("feature/a", PrState::Open);
    h.git.write_file("a.rs");
    let git_calls = h.git.calls().len();

    let err = h.ship(true).unwrap_err();

    assert!(matches!(err, WorkflowError::Validation { .. }));
    assert_eq!(h.git.calls().len(), git_calls);
    assert!(!h.platform.calls().iter().any(|c| c.starts_with("create_pull_request")));
    assert_eq!(h.session("feature/a").current_state, WorkflowState::BranchReady);
}

#[test]
fn test_existing_open_pr_is_updated_not_duplicated() {
    let h = harness();
    h.launch("feature/a");
    let number = h.platform.add_pull_request("feature/a", PrState::Open);
    h.git.write_file("a.rs");

    let report = h.ship(true).unwrap();

    assert_eq!(report.pull_request.unwrap().number, number);
    assert!(h.platform.calls().contains(&format!("update_pull_request {number}")));
    assert!(!h.platform.calls().iter().any(|c| c.starts_with("create_pull_request")));
    assert_eq!(h.platform.pull_requests().len(), 1);
}

#[test]
fn test_failed_push_resumes_on_rerun() {
    let h = harness();
    h.launch("feature/a");
    h.git.write_file("a.rs");
    h.git.fail_on("push");

    assert!(h.ship(true).is_err());
    assert_eq!(h.session("feature/a").current_state, WorkflowState::ChangesCommitted);

    h.git.clear_failures();
    let report = h.ship(true).unwrap();

    assert_eq!(report.session.current_state, WorkflowState::Complete);
    assert_eq!(h.git.calls().iter().filter(|c| c.starts_with("commit")).count(), 1);
    assert_eq!(report.session.first_invalid_transition(), None);
}

#[test]
fn test_failing_checks_stop_before_merge() {
    let h = harness();
    h.launch("feature/a");
    h.git.write_file("a.rs");
    h.platform.set_default_checks(CheckOutcome::Failed { failing: vec!["ci/test".to_string()] });

    let err = h.ship(true).unwrap_err();

    assert!(err.to_string().contains("ci/test"), "{err}");
    assert_eq!(h.session("feature/a").current_state, WorkflowState::PrCreated);
    assert!(!h.platform.calls().iter().any(|c| c.starts_with("merge_pull_request")));
}

#[test]
fn test_pending_checks_time_out() {
    let mut config = Config::default();
    config.ship.check_timeout_secs = 0;
    let h = harness_with(config);
    h.launch("feature/a");
    h.git.write_file("a.rs");
    h.platform.set_default_checks(CheckOutcome::Pending);

    let err = h.ship(true).unwrap_err();
    assert!(matches!(err, WorkflowError::Timeout { number: 1, .. }));
    assert_eq!(h.session("feature/a").current_state, WorkflowState::PrCreated);
}

#[test]
fn test_new_commit_after_approval_rewalks_graph() {
    let h = harness();
    h.launch("feature/a");
    h.git.write_file("a.rs");
    h.ship(false).unwrap();

    h.git.write_file("b.rs");
    let report = h.ship(true).unwrap();

    assert_eq!(report.session.current_state, WorkflowState::Complete);
    let rewalked = report
        .session
        .state_history
        .iter()
        .any(|t| t.from == WorkflowState::WaitingApproval && t.to == WorkflowState::ChangesCommitted);
    assert!(rewalked);
    assert_eq!(h.platform.pull_requests().len(), 1);
}

#[test]
fn test_hotfix_skips_approval_state() {
    let h = harness();
    let session = h
        .engine
        .launch(LaunchRequest::hotfix().with_description(Some("crash on start".to_string())))
        .unwrap()
        .session;
    h.git.write_file("fix.rs");

    let first = h.ship(false).unwrap();
    assert_eq!(first.status, ShipStatus::AwaitingConfirmation);
    assert_eq!(first.session.current_state, WorkflowState::HotfixPrCreated);

    let report = h.ship(true).unwrap();
    assert_eq!(report.session.id, session.id);
    assert_eq!(report.session.current_state, WorkflowState::HotfixComplete);
    assert!(!visited(&report.session).contains(&WorkflowState::WaitingApproval));
}

#[test]
fn test_rebase_conflict_keeps_session_in_place() {
    let mut config = Config::default();
    config.ship.rebase_before_merge = true;
    let h = harness_with(config);
    h.launch("feature/a");
    h.git.write_file("a.rs");
    h.git.conflict_on_rebase(&["src/lib.rs"]);

    let err = h.ship(true).unwrap_err();

    assert!(matches!(err, WorkflowError::Conflict { ref files } if files == &["src/lib.rs".to_string()]));
    assert!(err.recovery_hint().is_some());
    assert_eq!(h.session("feature/a").current_state, WorkflowState::WaitingApproval);
    assert_eq!(h.platform.pull_requests()[0].state, PrState::Open);
}

#[test]
fn test_ship_refuses_protected_branch() {
    let h = harness();
    h.git.write_file("oops.rs");

    let err = h.ship(true).unwrap_err();

    assert!(matches!(err, WorkflowError::Validation { .. }));
    assert!(!h.git.calls().iter().any(|c| c.starts_with("commit")));
    assert!(h.engine.sessions(true).is_empty());
}

#[test]
fn test_ship_adopts_branch_without_session() {
    let h = harness();
    h.git.add_local_branch("fix/typo", "main");
    h.git.checkout("fix/typo").unwrap();

    let report = h.ship(true).unwrap();

    assert_eq!(report.session.workflow_type, shipflow::WorkflowType::Ship);
    assert_eq!(report.session.current_state, WorkflowState::Complete);
    assert_eq!(report.session.state_history[0].trigger, "adopt");
}

#[test]
fn test_ship_refuses_recreated_merged_branch_without_session() {
    let h = harness();
    h.launch("feature/auth");
    h.git.write_file("src/auth.rs");
    h.ship(true).unwrap();
    let pull_requests = h.platform.pull_requests().len();

    h.git.add_local_branch("feature/auth", "main");
    h.git.checkout("feature/auth").unwrap();
    let err = h.ship(true).unwrap_err();

    match err {
        WorkflowError::Validation { message, suggestions, .. } => {
            assert!(message.contains("branch history"), "{message}");
            assert!(message.contains("Improper reuse"), "{message}");
            assert!(!suggestions.is_empty());
        }
        other => panic!("unexpected error: {other}"),
    }
    assert!(h.engine.sessions(false).is_empty());
    assert!(!h.git.has_remote("feature/auth"));
    assert_eq!(h.platform.pull_requests().len(), pull_requests);
}

#[test]
fn test_merge_after_abort_and_relaunch_retires_name() {
    let h = harness();
    h.launch("feature/a");
    h.engine
        .abort(AbortOptions { delete_branch: true, ..AbortOptions::default() })
        .unwrap();
    h.launch("feature/a");
    h.git.write_file("a.rs");
    h.ship(true).unwrap();

    let err = h
        .engine
        .launch(LaunchRequest::launch().with_branch(Some("feature/a".to_string())))
        .unwrap_err();
    assert!(err.to_string().contains("Name retired"), "{err}");
}

#[test]
fn test_switch_failure_returns_changes_to_origin() {
    let h = harness();
    let a = h.launch("feature/a");
    h.git.write_file("a.rs");
    h.git.fail_on("create_branch");

    assert!(h.engine.switch("feature/b").is_err());

    assert_eq!(h.git.current(), "feature/a");
    assert_eq!(h.git.dirty_files(), vec!["a.rs".to_string()]);
    assert!(h.git.stash_messages().is_empty());
    let origin = h.engine.repository().get(a.id).unwrap();
    assert_eq!(origin.current_state, WorkflowState::BranchReady);
    assert!(origin.metadata.stash.is_none());
    assert!(h.engine.repository().get_by_branch("feature/b").is_none());
}

#[test]
fn test_unreachable_platform_blocks_ship() {
    let h = harness();
    h.launch("feature/a");
    h.git.write_file("a.rs");
    h.platform.set_reachable(false);

    let err = h.ship(true).unwrap_err();

    assert!(err.to_string().contains("platform"), "{err}");
    assert_eq!(h.git.dirty_files(), vec!["a.rs".to_string()]);
}

#[test]
fn test_locked_session_is_busy() {
    let h = harness();
    let session = h.launch("feature/a");
    assert!(h.engine.repository().acquire_lock(session.id).unwrap());

    let err = h.ship(true).unwrap_err();
    assert!(matches!(err, WorkflowError::Lock { .. }));
    assert!(h.engine.sessions(false)[0].lock.is_some());

    h.engine.repository().release_lock(session.id).unwrap();
    assert!(h.ship(true).is_ok());
}

#[test]
fn test_cancelled_ship_keeps_state() {
    let h = harness();
    h.launch("feature/a");
    h.git.write_file("a.rs");
    h.engine.cancel_token().cancel();

    let err = h.ship(true).unwrap_err();

    assert!(matches!(err, WorkflowError::Cancelled { .. }));
    assert_eq!(h.session("feature/a").current_state, WorkflowState::BranchReady);
    assert_eq!(h.git.dirty_files(), vec!["a.rs".to_string()]);
}

#[test]
fn test_operations_are_audited() {
    let h = harness();
    h.launch("feature/a");
    let _ = h.engine.launch(LaunchRequest::launch().with_branch(Some("main".to_string())));

    let entries = h.engine.repository().audit().entries_for(chrono::Utc::now().date_naive());
    assert!(entries.len() >= 2);
}
