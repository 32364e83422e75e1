//! [`GitRunner`] over the `git` binary.

use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use super::{GitError, GitResult, GitRunner, RepoLocation, StashEntry};

/// Runs `git` in a fixed working directory.
#[derive(Debug, Clone)]
pub struct CliGit {
    workdir: PathBuf,
}

impl CliGit {
    pub fn new(workdir: impl Into<PathBuf>) -> Self {
        Self { workdir: workdir.into() }
    }

    pub fn workdir(&self) -> &Path {
        &self.workdir
    }

    fn output(&self, args: &[&str]) -> GitResult<Output> {
        tracing::debug!(args = ?args, "git");
        Ok(Command::new("git").args(args).current_dir(&self.workdir).output()?)
    }

    /// Run and return trimmed stdout, failing on non-zero exit.
    fn run(&self, args: &[&str]) -> GitResult<String> {
        let output = self.output(args)?;
        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).trim_end().to_string())
        } else {
            Err(GitError::CommandFailed {
                command: args.join(" "),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            })
        }
    }

    /// Run a predicate command: exit 0 is true, exit 1 is false.
    fn check(&self, args: &[&str]) -> GitResult<bool> {
        let output = self.output(args)?;
        match output.status.code() {
            Some(0) => Ok(true),
            Some(1) => Ok(false),
            _ => Err(GitError::CommandFailed {
                command: args.join(" "),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            }),
        }
    }

    fn conflicted_files(&self) -> GitResult<Vec<String>> {
        let out = self.run(&["diff", "--name-only", "--diff-filter=U"])?;
        Ok(out.lines().map(str::to_string).filter(|l| !l.is_empty()).collect())
    }

    /// Resolve root, git dir and remote URL with plain `git` commands.
    pub fn location(&self, remote: &str) -> GitResult<RepoLocation> {
        let root = self.run(&["rev-parse", "--show-toplevel"]).map_err(|_| GitError::NotARepository)?;
        let git_dir = self.run(&["rev-parse", "--path-format=absolute", "--git-common-dir"])?;
        let remote_url = self.run(&["remote", "get-url", remote]).ok();
        Ok(RepoLocation { root: PathBuf::from(root), git_dir: PathBuf::from(git_dir), remote_url })
    }
}

impl GitRunner for CliGit {
    fn current_branch(&self) -> GitResult<String> {
        self.run(&["symbolic-ref", "--quiet", "--short", "HEAD"]).map_err(|_| GitError::DetachedHead)
    }

    fn create_branch(&self, name: &str, base: &str) -> GitResult<()> {
        self.run(&["checkout", "-b", name, base]).map(drop)
    }

    fn checkout(&self, branch: &str) -> GitResult<()> {
        if !self.branch_exists(branch)? {
            return Err(GitError::BranchNotFound(branch.to_string()));
        }
        self.run(&["checkout", branch]).map(drop)
    }

    fn has_uncommitted_changes(&self) -> GitResult<bool> {
        Ok(!self.run(&["status", "--porcelain"])?.is_empty())
    }

    fn stash_push(&self, name: &str) -> GitResult<bool> {
        if !self.has_uncommitted_changes()? {
            return Ok(false);
        }
        self.run(&["stash", "push", "--include-untracked", "-m", name])?;
        Ok(true)
    }

    fn stash_pop(&self, stash_ref: &str) -> GitResult<()> {
        self.run(&["stash", "pop", stash_ref]).map(drop)
    }

    fn stash_list(&self) -> GitResult<Vec<StashEntry>> {
        let out = self.run(&["stash", "list", "--format=%gs"])?;
        Ok(out
            .lines()
            .enumerate()
            .map(|(index, message)| StashEntry { index, message: message.to_string() })
            .collect())
    }

    fn commit(&self, message: &str) -> GitResult<bool> {
        self.run(&["add", "--all"])?;
        // exit 1 means something is staged
        if self.check(&["diff", "--cached", "--quiet"])? {
            return Ok(false);
        }
        self.run(&["commit", "-m", message])?;
        Ok(true)
    }

    fn push(&self, remote: &str, branch: &str) -> GitResult<()> {
        self.run(&["push", "--set-upstream", remote, branch]).map(drop)
    }

    fn force_push(&self, remote: &str, branch: &str) -> GitResult<()> {
        self.run(&["push", "--force-with-lease", remote, branch]).map(drop)
    }

    fn rebase(&self, onto: &str) -> GitResult<()> {
        match self.run(&["rebase", onto]) {
            Ok(_) => Ok(()),
            Err(err) => {
                let files = self.conflicted_files().unwrap_or_default();
                if let Err(abort_err) = self.run(&["rebase", "--abort"]) {
                    tracing::warn!("rebase --abort failed: {abort_err}");
                }
                if files.is_empty() {
                    Err(err)
                } else {
                    Err(GitError::Conflict { files })
                }
            }
        }
    }

    fn delete_branch(&self, name: &str, local: bool, remote: Option<&str>) -> GitResult<()> {
        if local && self.branch_exists(name)? {
            // Squash merges never look merged to git, so force is required
            self.run(&["branch", "-D", name])?;
        }
        if let Some(remote) = remote {
            if self.remote_branch_exists(remote, name)? {
                self.run(&["push", remote, "--delete", name])?;
            }
        }
        Ok(())
    }

    fn branch_exists(&self, name: &str) -> GitResult<bool> {
        self.check(&["show-ref", "--verify", "--quiet", &format!("refs/heads/{name}")])
    }

    fn remote_branch_exists(&self, remote: &str, name: &str) -> GitResult<bool> {
        self.check(&["show-ref", "--verify", "--quiet", &format!("refs/remotes/{remote}/{name}")])
    }

    fn is_branch_merged(&self, name: &str, into: &str) -> GitResult<bool> {
        self.check(&["merge-base", "--is-ancestor", name, into])
    }

    fn fetch(&self, remote: &str) -> GitResult<()> {
        self.run(&["fetch", "--prune", remote]).map(drop)
    }

    fn fast_forward(&self, remote: &str, branch: &str) -> GitResult<()> {
        let upstream = format!("{remote}/{branch}");
        if self.current_branch().ok().as_deref() == Some(branch) {
            self.run(&["merge", "--ff-only", &upstream]).map(drop)
        } else {
            // Updates the ref without touching the working tree; refuses non-ff
            self.run(&["fetch", remote, &format!("{branch}:{branch}")]).map(drop)
        }
    }
}
