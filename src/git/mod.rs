//! Git collaborator.
//!
//! All repository mutation goes through [`GitRunner`]. The production
//! implementation is [`CliGit`], which shells out to the `git` binary;
//! tests use [`FakeGit`](crate::testing::FakeGit).

mod cli;
pub mod hooks;
#[cfg(feature = "git")]
mod repository;

use std::path::PathBuf;

use thiserror::Error;

pub use cli::CliGit;
pub use hooks::HooksInspector;
#[cfg(feature = "git")]
pub use repository::GitRepository;

/// Result type for git operations.
pub type GitResult<T> = Result<T, GitError>;

/// Errors from git operations.
#[derive(Debug, Error)]
pub enum GitError {
    /// `git` exited non-zero.
    #[error("git {command} failed: {stderr}")]
    CommandFailed { command: String, stderr: String },

    /// Rebase stopped on conflicts. The rebase has already been aborted.
    #[error("Conflicts in: {}", files.join(", "))]
    Conflict { files: Vec<String> },

    #[error("Branch '{0}' not found")]
    BranchNotFound(String),

    #[error("No stash named '{0}'")]
    StashNotFound(String),

    #[error("HEAD is detached")]
    DetachedHead,

    #[error("Not inside a git repository")]
    NotARepository,

    /// The `git` binary could not be started.
    #[error("Failed to run git: {0}")]
    Io(#[from] std::io::Error),
}

/// One entry of `git stash list`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StashEntry {
    pub index: usize,
    /// Stash subject, e.g. `On feature/x: shipflow-auto/swap/...`
    pub message: String,
}

impl StashEntry {
    /// Current `stash@{n}` reference. Only valid until the next push or pop.
    pub fn reference(&self) -> String {
        format!("stash@{{{}}}", self.index)
    }

    /// Whether this entry was pushed with the given name.
    pub fn matches(&self, name: &str) -> bool {
        self.message == name || self.message.ends_with(&format!(": {name}"))
    }
}

/// Where a repository lives on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepoLocation {
    /// Working tree root
    pub root: PathBuf,
    /// Common `.git` directory (shared by worktrees)
    pub git_dir: PathBuf,
    pub remote_url: Option<String>,
}

/// Blocking git operations used by the orchestrators.
pub trait GitRunner: Send + Sync {
    fn current_branch(&self) -> GitResult<String>;

    /// Create `name` from `base` and check it out.
    fn create_branch(&self, name: &str, base: &str) -> GitResult<()>;

    fn checkout(&self, branch: &str) -> GitResult<()>;

    /// Staged, unstaged or untracked changes are present.
    fn has_uncommitted_changes(&self) -> GitResult<bool>;

    /// Stash everything (untracked included) under `name`.
    ///
    /// Returns `false` when there was nothing to stash.
    fn stash_push(&self, name: &str) -> GitResult<bool>;

    /// Pop a `stash@{n}` reference.
    fn stash_pop(&self, stash_ref: &str) -> GitResult<()>;

    fn stash_list(&self) -> GitResult<Vec<StashEntry>>;

    /// Stage everything and commit. Returns `false` when nothing was staged.
    fn commit(&self, message: &str) -> GitResult<bool>;

    fn push(&self, remote: &str, branch: &str) -> GitResult<()>;

    /// Push with lease after a rebase rewrote the branch.
    fn force_push(&self, remote: &str, branch: &str) -> GitResult<()>;

    /// Rebase the current branch onto `onto`.
    ///
    /// On conflict the rebase is aborted and [`GitError::Conflict`] lists the
    /// conflicted files, leaving the branch as it was.
    fn rebase(&self, onto: &str) -> GitResult<()>;

    /// Delete a branch locally and/or on `remote`.
    fn delete_branch(&self, name: &str, local: bool, remote: Option<&str>) -> GitResult<()>;

    fn branch_exists(&self, name: &str) -> GitResult<bool>;

    fn remote_branch_exists(&self, remote: &str, name: &str) -> GitResult<bool>;

    /// `name` is an ancestor of `into`.
    fn is_branch_merged(&self, name: &str, into: &str) -> GitResult<bool>;

    fn fetch(&self, remote: &str) -> GitResult<()>;

    /// Fast-forward local `branch` to `remote/branch`.
    fn fast_forward(&self, remote: &str, branch: &str) -> GitResult<()>;

    /// Find a stash by the name it was pushed with.
    fn find_stash(&self, name: &str) -> GitResult<Option<StashEntry>> {
        Ok(self.stash_list()?.into_iter().find(|entry| entry.matches(name)))
    }
}

/// Locate the repository containing `path`.
#[cfg(feature = "git")]
pub fn discover(path: &std::path::Path, remote: &str) -> GitResult<RepoLocation> {
    let repo = GitRepository::discover(path).ok_or(GitError::NotARepository)?;
    repo.location(remote)
}

/// Locate the repository containing `path`.
#[cfg(not(feature = "git"))]
pub fn discover(path: &std::path::Path, remote: &str) -> GitResult<RepoLocation> {
    CliGit::new(path).location(remote)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stash_entry_matching() {
        let entry = StashEntry {
            index: 2,
            message: "On feature/a: shipflow-auto/swap/abc/1700000000".to_string(),
        };
        assert_eq!(entry.reference(), "stash@{2}");
        assert!(entry.matches("shipflow-auto/swap/abc/1700000000"));
        assert!(!entry.matches("shipflow-auto/swap/abc"));
        assert!(!entry.matches("swap/abc/1700000000"));
    }
}
