//! Read-only repository inspection through libgit2.

use std::path::{Path, PathBuf};

use git2::{Repository, StatusOptions};

use super::{GitError, GitResult, RepoLocation};

/// Thin wrapper used for discovery and status, never for mutation.
pub struct GitRepository {
    repo: Repository,
}

impl GitRepository {
    /// Open the repository containing `path`, searching upwards.
    #[must_use]
    pub fn discover(path: impl AsRef<Path>) -> Option<Self> {
        Repository::discover(path.as_ref()).ok().map(|repo| Self { repo })
    }

    /// Working tree root (None for bare repositories).
    #[must_use]
    pub fn root(&self) -> Option<PathBuf> {
        self.repo.workdir().map(Path::to_path_buf)
    }

    /// Shared `.git` directory, the same for every worktree.
    #[must_use]
    pub fn common_dir(&self) -> PathBuf {
        self.repo.commondir().to_path_buf()
    }

    #[must_use]
    pub fn remote_url(&self, name: &str) -> Option<String> {
        self.repo.find_remote(name).ok().and_then(|r| r.url().map(String::from))
    }

    /// Counts of staged, unstaged and untracked entries.
    #[must_use]
    pub fn status_counts(&self) -> (usize, usize, usize) {
        let mut opts = StatusOptions::new();
        opts.include_untracked(true)
            .recurse_untracked_dirs(false)
            .include_ignored(false)
            .include_unmodified(false);

        let Ok(statuses) = self.repo.statuses(Some(&mut opts)) else {
            return (0, 0, 0);
        };

        let mut staged = 0;
        let mut unstaged = 0;
        let mut untracked = 0;
        for entry in statuses.iter() {
            let status = entry.status();
            if status.is_index_new()
                || status.is_index_modified()
                || status.is_index_deleted()
                || status.is_index_renamed()
                || status.is_index_typechange()
            {
                staged += 1;
            }
            if status.is_wt_modified()
                || status.is_wt_deleted()
                || status.is_wt_renamed()
                || status.is_wt_typechange()
            {
                unstaged += 1;
            }
            if status.is_wt_new() {
                untracked += 1;
            }
        }
        (staged, unstaged, untracked)
    }

    pub fn location(&self, remote: &str) -> GitResult<RepoLocation> {
        let root = self.root().ok_or(GitError::NotARepository)?;
        Ok(RepoLocation { root, git_dir: self.common_dir(), remote_url: self.remote_url(remote) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_discover_and_status() {
        let dir = tempdir().unwrap();
        Repository::init(dir.path()).unwrap();
        std::fs::write(dir.path().join("a.txt"), "a").unwrap();

        let nested = dir.path().join("src");
        std::fs::create_dir(&nested).unwrap();

        let repo = GitRepository::discover(&nested).unwrap();
        let location = repo.location("origin").unwrap();
        assert_eq!(
            location.root.canonicalize().unwrap(),
            dir.path().canonicalize().unwrap()
        );
        assert!(location.git_dir.ends_with(".git") || location.git_dir.ends_with(".git/"));
        assert!(location.remote_url.is_none());

        let (staged, unstaged, untracked) = repo.status_counts();
        assert_eq!((staged, unstaged), (0, 0));
        assert_eq!(untracked, 1);
    }

    #[test]
    fn test_discover_outside_repo() {
        let dir = tempdir().unwrap();
        // tempdir may itself live inside a repository on some machines
        if Repository::discover(dir.path()).is_err() {
            assert!(GitRepository::discover(dir.path()).is_none());
        }
    }
}
