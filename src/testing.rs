//! In-memory collaborators for tests.
//!
//! [`FakeGit`] models branches as lists of commit ids, the working tree as a
//! list of dirty files and the stash as a stack. [`FakePlatform`] keeps pull
//! requests and check results in memory. Both are cheap to clone; clones
//! share state, so a test can keep a handle while an engine owns another.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::DateTime;
use parking_lot::Mutex;

use crate::git::{GitError, GitResult, GitRunner, StashEntry};
use crate::platform::{
    CheckOutcome, MergeStrategy, PlatformError, PlatformResult, PrUpdate, PullRequest,
    RemotePlatform,
};
use crate::session::PrState;

#[derive(Debug, Default)]
struct GitState {
    root: PathBuf,
    current: String,
    local: BTreeMap<String, Vec<u64>>,
    remote: BTreeMap<String, Vec<u64>>,
    dirty: Vec<String>,
    /// Newest first, like `git stash list`
    stashes: Vec<(String, Vec<String>)>,
    next_commit: u64,
    failures: HashSet<String>,
    rebase_conflict: Option<Vec<String>>,
    calls: Vec<String>,
}

impl GitState {
    fn commit_id(&mut self) -> u64 {
        self.next_commit += 1;
        self.next_commit
    }
}

/// Scriptable [`GitRunner`].
#[derive(Debug, Clone)]
pub struct FakeGit {
    state: Arc<Mutex<GitState>>,
}

impl FakeGit {
    /// A repository with `main` checked out and pushed.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let mut state = GitState { root: root.into(), current: "main".to_string(), ..Default::default() };
        let initial = state.commit_id();
        state.local.insert("main".to_string(), vec![initial]);
        state.remote.insert("main".to_string(), vec![initial]);
        Self { state: Arc::new(Mutex::new(state)) }
    }

    pub fn root(&self) -> PathBuf {
        self.state.lock().root.clone()
    }

    /// Add an uncommitted file to the working tree.
    pub fn write_file(&self, name: &str) {
        let mut state = self.state.lock();
        if !state.dirty.iter().any(|f| f == name) {
            state.dirty.push(name.to_string());
        }
    }

    pub fn dirty_files(&self) -> Vec<String> {
        self.state.lock().dirty.clone()
    }

    pub fn current(&self) -> String {
        self.state.lock().current.clone()
    }

    pub fn has_local(&self, name: &str) -> bool {
        self.state.lock().local.contains_key(name)
    }

    pub fn has_remote(&self, name: &str) -> bool {
        self.state.lock().remote.contains_key(name)
    }

    /// Stash messages, newest first.
    pub fn stash_messages(&self) -> Vec<String> {
        self.state.lock().stashes.iter().map(|(m, _)| m.clone()).collect()
    }

    /// Create a local branch with one extra commit on top of `base`.
    pub fn add_local_branch(&self, name: &str, base: &str) {
        let mut state = self.state.lock();
        let mut commits = state.local.get(base).cloned().unwrap_or_default();
        let id = state.commit_id();
        commits.push(id);
        state.local.insert(name.to_string(), commits);
    }

    /// Mirror a local branch onto the remote.
    pub fn add_remote_branch(&self, name: &str) {
        let mut state = self.state.lock();
        let commits = state.local.get(name).cloned().unwrap_or_default();
        state.remote.insert(name.to_string(), commits);
    }

    /// Land `branch` on the remote copy of `into`, as a squash merge would.
    pub fn land_on_remote(&self, into: &str) {
        let mut state = self.state.lock();
        let id = state.commit_id();
        state.remote.entry(into.to_string()).or_default().push(id);
    }

    /// Make the named operation fail until [`FakeGit::clear_failures`].
    pub fn fail_on(&self, operation: &str) {
        self.state.lock().failures.insert(operation.to_string());
    }

    pub fn clear_failures(&self) {
        self.state.lock().failures.clear();
    }

    /// Make the next rebases stop on these files.
    pub fn conflict_on_rebase(&self, files: &[&str]) {
        self.state.lock().rebase_conflict = Some(files.iter().map(|f| f.to_string()).collect());
    }

    /// Whether the local and remote copies of `branch` hold the same commits.
    pub fn in_sync(&self, branch: &str) -> bool {
        let state = self.state.lock();
        state.local.get(branch).is_some_and(|local| state.remote.get(branch) == Some(local))
    }

    /// Mutating operations performed so far, e.g. `push feature/a`.
    pub fn calls(&self) -> Vec<String> {
        self.state.lock().calls.clone()
    }

    fn enter(&self, operation: &str, detail: &str) -> GitResult<parking_lot::MutexGuard<'_, GitState>> {
        let mut state = self.state.lock();
        if state.failures.contains(operation) {
            return Err(GitError::CommandFailed {
                command: format!("{operation} {detail}").trim().to_string(),
                stderr: "injected failure".to_string(),
            });
        }
        state.calls.push(format!("{operation} {detail}").trim().to_string());
        Ok(state)
    }
}

fn parse_stash_ref(stash_ref: &str) -> Option<usize> {
    stash_ref.strip_prefix("stash@{")?.strip_suffix('}')?.parse().ok()
}

impl GitRunner for FakeGit {
    fn current_branch(&self) -> GitResult<String> {
        Ok(self.state.lock().current.clone())
    }

    fn create_branch(&self, name: &str, base: &str) -> GitResult<()> {
        let mut state = self.enter("create_branch", name)?;
        if state.local.contains_key(name) {
            return Err(GitError::CommandFailed {
                command: format!("checkout -b {name}"),
                stderr: format!("a branch named '{name}' already exists"),
            });
        }
        // `origin/feature/x` style bases resolve against the remote
        let commits = state
            .local
            .get(base)
            .or_else(|| base.split_once('/').and_then(|(_, b)| state.remote.get(b)))
            .cloned()
            .ok_or_else(|| GitError::BranchNotFound(base.to_string()))?;
        state.local.insert(name.to_string(), commits);
        state.current = name.to_string();
        Ok(())
    }

    fn checkout(&self, branch: &str) -> GitResult<()> {
        let mut state = self.enter("checkout", branch)?;
        if !state.local.contains_key(branch) {
            return Err(GitError::BranchNotFound(branch.to_string()));
        }
        state.current = branch.to_string();
        Ok(())
    }

    fn has_uncommitted_changes(&self) -> GitResult<bool> {
        Ok(!self.state.lock().dirty.is_empty())
    }

    fn stash_push(&self, name: &str) -> GitResult<bool> {
        let mut state = self.enter("stash_push", name)?;
        if state.dirty.is_empty() {
            return Ok(false);
        }
        let files = std::mem::take(&mut state.dirty);
        let message = format!("On {}: {name}", state.current);
        state.stashes.insert(0, (message, files));
        Ok(true)
    }

    fn stash_pop(&self, stash_ref: &str) -> GitResult<()> {
        let mut state = self.enter("stash_pop", stash_ref)?;
        let idx = parse_stash_ref(stash_ref)
            .filter(|&i| i < state.stashes.len())
            .ok_or_else(|| GitError::StashNotFound(stash_ref.to_string()))?;
        let (_, files) = state.stashes.remove(idx);
        for file in files {
            if !state.dirty.contains(&file) {
                state.dirty.push(file);
            }
        }
        Ok(())
    }

    fn stash_list(&self) -> GitResult<Vec<StashEntry>> {
        let state = self.state.lock();
        Ok(state
            .stashes
            .iter()
            .enumerate()
            .map(|(index, (message, _))| StashEntry { index, message: message.clone() })
            .collect())
    }

    fn commit(&self, message: &str) -> GitResult<bool> {
        let mut state = self.enter("commit", message)?;
        if state.dirty.is_empty() {
            return Ok(false);
        }
        state.dirty.clear();
        let id = state.commit_id();
        let current = state.current.clone();
        state.local.entry(current).or_default().push(id);
        Ok(true)
    }

    fn push(&self, _remote: &str, branch: &str) -> GitResult<()> {
        let mut state = self.enter("push", branch)?;
        let commits =
            state.local.get(branch).cloned().ok_or_else(|| GitError::BranchNotFound(branch.to_string()))?;
        state.remote.insert(branch.to_string(), commits);
        Ok(())
    }

    fn force_push(&self, _remote: &str, branch: &str) -> GitResult<()> {
        let mut state = self.enter("force_push", branch)?;
        let commits =
            state.local.get(branch).cloned().ok_or_else(|| GitError::BranchNotFound(branch.to_string()))?;
        state.remote.insert(branch.to_string(), commits);
        Ok(())
    }

    fn rebase(&self, onto: &str) -> GitResult<()> {
        let mut state = self.enter("rebase", onto)?;
        if let Some(files) = state.rebase_conflict.clone() {
            return Err(GitError::Conflict { files });
        }
        let base = state.local.get(onto).cloned().ok_or_else(|| GitError::BranchNotFound(onto.to_string()))?;
        let current = state.current.clone();
        let own = state
            .local
            .get(&current)
            .map(|commits| commits.iter().filter(|c| !base.contains(c)).count())
            .unwrap_or_default();

        let mut rebased = base;
        for _ in 0..own {
            let id = state.commit_id();
            rebased.push(id);
        }
        state.local.insert(current, rebased);
        Ok(())
    }

    fn delete_branch(&self, name: &str, local: bool, remote: Option<&str>) -> GitResult<()> {
        let mut state = self.enter("delete_branch", name)?;
        if local {
            if state.current == name {
                return Err(GitError::CommandFailed {
                    command: format!("branch -D {name}"),
                    stderr: format!("cannot delete branch '{name}' checked out"),
                });
            }
            state.local.remove(name);
        }
        if remote.is_some() {
            state.remote.remove(name);
        }
        Ok(())
    }

    fn branch_exists(&self, name: &str) -> GitResult<bool> {
        Ok(self.state.lock().local.contains_key(name))
    }

    fn remote_branch_exists(&self, _remote: &str, name: &str) -> GitResult<bool> {
        Ok(self.state.lock().remote.contains_key(name))
    }

    fn is_branch_merged(&self, name: &str, into: &str) -> GitResult<bool> {
        let state = self.state.lock();
        let branch = state.local.get(name).ok_or_else(|| GitError::BranchNotFound(name.to_string()))?;
        let target = state.local.get(into).ok_or_else(|| GitError::BranchNotFound(into.to_string()))?;
        Ok(branch.iter().all(|c| target.contains(c)))
    }

    fn fetch(&self, remote: &str) -> GitResult<()> {
        drop(self.enter("fetch", remote)?);
        Ok(())
    }

    fn fast_forward(&self, _remote: &str, branch: &str) -> GitResult<()> {
        let mut state = self.enter("fast_forward", branch)?;
        if let Some(commits) = state.remote.get(branch).cloned() {
            state.local.insert(branch.to_string(), commits);
        }
        Ok(())
    }
}

#[derive(Debug)]
struct PlatformState {
    prs: Vec<PullRequest>,
    checks: HashMap<u64, CheckOutcome>,
    default_checks: CheckOutcome,
    reachable: bool,
    failures: HashSet<String>,
    calls: Vec<String>,
}

/// Scriptable [`RemotePlatform`].
#[derive(Debug, Clone)]
pub struct FakePlatform {
    state: Arc<Mutex<PlatformState>>,
}

impl Default for FakePlatform {
    fn default() -> Self {
        Self::new()
    }
}

impl FakePlatform {
    /// A reachable platform with no pull requests whose checks pass.
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(PlatformState {
                prs: Vec::new(),
                checks: HashMap::new(),
                default_checks: CheckOutcome::Passed,
                reachable: true,
                failures: HashSet::new(),
                calls: Vec::new(),
            })),
        }
    }

    /// Seed a pull request for `head` in the given state.
    pub fn add_pull_request(&self, head: &str, state: PrState) -> u64 {
        let mut s = self.state.lock();
        let number = s.prs.len() as u64 + 1;
        s.prs.push(Self::build(number, head, "main", head, state));
        number
    }

    pub fn set_state(&self, number: u64, state: PrState) {
        if let Some(pr) = self.state.lock().prs.iter_mut().find(|pr| pr.number == number) {
            pr.state = state;
        }
    }

    pub fn set_checks(&self, number: u64, outcome: CheckOutcome) {
        self.state.lock().checks.insert(number, outcome);
    }

    /// Outcome for pull requests without an explicit entry.
    pub fn set_default_checks(&self, outcome: CheckOutcome) {
        self.state.lock().default_checks = outcome;
    }

    pub fn set_reachable(&self, reachable: bool) {
        self.state.lock().reachable = reachable;
    }

    pub fn fail_on(&self, operation: &str) {
        self.state.lock().failures.insert(operation.to_string());
    }

    pub fn clear_failures(&self) {
        self.state.lock().failures.clear();
    }

    pub fn pull_requests(&self) -> Vec<PullRequest> {
        self.state.lock().prs.clone()
    }

    pub fn calls(&self) -> Vec<String> {
        self.state.lock().calls.clone()
    }

    fn build(number: u64, title: &str, base: &str, head: &str, state: PrState) -> PullRequest {
        let secs = 1_700_000_000 + i64::try_from(number).unwrap_or(0) * 60;
        PullRequest {
            number,
            state,
            url: format!("https://github.com/acme/app/pull/{number}"),
            head: head.to_string(),
            base: base.to_string(),
            title: title.to_string(),
            created_at: DateTime::from_timestamp(secs, 0).unwrap_or_default(),
        }
    }

    fn enter(&self, operation: &str, detail: &str) -> PlatformResult<parking_lot::MutexGuard<'_, PlatformState>> {
        let mut state = self.state.lock();
        if !state.reachable {
            return Err(PlatformError::Api { status: 503, message: "unreachable".to_string() });
        }
        if state.failures.contains(operation) {
            return Err(PlatformError::Api { status: 500, message: format!("injected failure in {operation}") });
        }
        state.calls.push(format!("{operation} {detail}").trim().to_string());
        Ok(state)
    }
}

impl RemotePlatform for FakePlatform {
    fn name(&self) -> &str {
        "fake"
    }

    fn check_connection(&self) -> PlatformResult<()> {
        drop(self.enter("check_connection", "")?);
        Ok(())
    }

    fn create_pull_request(
        &self,
        title: &str,
        _body: &str,
        head: &str,
        base: &str,
    ) -> PlatformResult<PullRequest> {
        let mut state = self.enter("create_pull_request", head)?;
        let number = state.prs.len() as u64 + 1;
        let pr = Self::build(number, title, base, head, PrState::Open);
        state.prs.push(pr.clone());
        Ok(pr)
    }

    fn update_pull_request(&self, number: u64, update: &PrUpdate) -> PlatformResult<PullRequest> {
        let mut state = self.enter("update_pull_request", &number.to_string())?;
        let pr = state
            .prs
            .iter_mut()
            .find(|pr| pr.number == number)
            .ok_or_else(|| PlatformError::NotFound(format!("PR #{number}")))?;
        if let Some(title) = &update.title {
            pr.title = title.clone();
        }
        if let Some(base) = &update.base {
            pr.base = base.clone();
        }
        Ok(pr.clone())
    }

    fn pull_requests_for_branch(&self, branch: &str) -> PlatformResult<Vec<PullRequest>> {
        let state = self.enter("list_pull_requests", branch)?;
        Ok(state.prs.iter().filter(|pr| pr.head == branch).cloned().collect())
    }

    fn pull_request(&self, number: u64) -> PlatformResult<PullRequest> {
        let state = self.enter("get_pull_request", &number.to_string())?;
        state
            .prs
            .iter()
            .find(|pr| pr.number == number)
            .cloned()
            .ok_or_else(|| PlatformError::NotFound(format!("PR #{number}")))
    }

    fn merge_pull_request(&self, number: u64, strategy: MergeStrategy) -> PlatformResult<()> {
        let mut state = self.enter("merge_pull_request", &format!("{number} {}", strategy.as_str()))?;
        let pr = state
            .prs
            .iter_mut()
            .find(|pr| pr.number == number)
            .ok_or_else(|| PlatformError::NotFound(format!("PR #{number}")))?;
        if pr.state != PrState::Open {
            return Err(PlatformError::NotMergeable { number, reason: format!("PR is {}", pr.state) });
        }
        pr.state = PrState::Merged;
        Ok(())
    }

    fn check_status(&self, number: u64) -> PlatformResult<CheckOutcome> {
        let state = self.enter("check_status", &number.to_string())?;
        Ok(state.checks.get(&number).cloned().unwrap_or_else(|| state.default_checks.clone()))
    }

    fn poll_interval(&self) -> Duration {
        Duration::from_millis(1)
    }
}
