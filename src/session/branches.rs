//! Per-branch lifecycle history.
//!
//! One document per branch under `branches/`, so updates for different
//! branches never race on a shared file.

use std::fs;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::repository::write_atomic;
use crate::error::{WorkflowError, WorkflowResult};

/// What happened to a branch name over time.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BranchRecord {
    pub name: String,
    pub merged: bool,
    pub merged_at: Option<DateTime<Utc>>,
    pub remote_deleted: bool,
    pub deleted_at: Option<DateTime<Utc>>,
    pub recreated: bool,
    pub recreated_at: Option<DateTime<Utc>>,
    pub aborted_at: Option<DateTime<Utc>>,
    pub pr_number: Option<u64>,
}

impl BranchRecord {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into(), ..Default::default() }
    }

    /// Record a squash-merge of this branch.
    ///
    /// A merge starts a new history for the name, so an earlier
    /// abort-and-relaunch no longer counts as a recreation.
    pub fn mark_merged(&mut self, pr_number: Option<u64>) {
        self.merged = true;
        self.merged_at = Some(Utc::now());
        self.recreated = false;
        self.recreated_at = None;
        if pr_number.is_some() {
            self.pr_number = pr_number;
        }
    }

    /// Record deletion after merge or abort.
    pub fn mark_deleted(&mut self, remote: bool) {
        self.deleted_at = Some(Utc::now());
        if remote {
            self.remote_deleted = true;
        }
    }

    /// Record that the name was created again after a deletion.
    pub fn mark_recreated(&mut self) {
        self.recreated = true;
        self.recreated_at = Some(Utc::now());
    }

    pub fn mark_aborted(&mut self) {
        self.aborted_at = Some(Utc::now());
    }
}

/// Directory-backed store of [`BranchRecord`]s.
#[derive(Debug, Clone)]
pub struct BranchHistory {
    dir: PathBuf,
}

impl BranchHistory {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn record_path(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{}.json", encode_branch(name)))
    }

    /// Record for `name`. Unreadable records count as absent.
    pub fn get(&self, name: &str) -> Option<BranchRecord> {
        let path = self.record_path(name);
        let content = fs::read_to_string(&path).ok()?;
        match serde_json::from_str(&content) {
            Ok(record) => Some(record),
            Err(e) => {
                tracing::warn!(path = %path.display(), "ignoring corrupt branch record: {e}");
                None
            }
        }
    }

    /// Whether any history exists for `name`.
    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// Apply `f` to the record (created on first use) and persist it.
    pub fn update(
        &self,
        name: &str,
        f: impl FnOnce(&mut BranchRecord),
    ) -> WorkflowResult<BranchRecord> {
        let mut record = self.get(name).unwrap_or_else(|| BranchRecord::new(name));
        f(&mut record);

        fs::create_dir_all(&self.dir).map_err(|e| WorkflowError::storage(&self.dir, e))?;
        write_atomic(&self.record_path(name), &serde_json::to_vec_pretty(&record)?)?;
        Ok(record)
    }

    /// All readable records.
    pub fn list(&self) -> Vec<BranchRecord> {
        let Ok(entries) = fs::read_dir(&self.dir) else {
            return Vec::new();
        };

        entries
            .filter_map(Result::ok)
            .filter_map(|entry| fs::read_to_string(entry.path()).ok())
            .filter_map(|content| serde_json::from_str(&content).ok())
            .collect()
    }
}

/// Encode a branch name into a single safe file name.
fn encode_branch(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    for c in name.chars() {
        match c {
            '%' => out.push_str("%25"),
            '/' => out.push_str("%2F"),
            '\\' => out.push_str("%5C"),
            _ => out.push(c),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_encode_branch_is_unambiguous() {
        assert_eq!(encode_branch("feature/auth"), "feature%2Fauth");
        assert_ne!(encode_branch("a/b"), encode_branch("a%2Fb"));
    }

    #[test]
    fn test_update_creates_and_persists() {
        let dir = tempdir().unwrap();
        let history = BranchHistory::new(dir.path());
        assert!(history.get("feature/auth").is_none());

        history.update("feature/auth", |r| r.mark_merged(Some(12))).unwrap();
        history.update("feature/auth", |r| r.mark_deleted(true)).unwrap();

        let record = history.get("feature/auth").unwrap();
        assert!(record.merged);
        assert!(record.remote_deleted);
        assert_eq!(record.pr_number, Some(12));
        assert!(!record.recreated);
        assert_eq!(history.list().len(), 1);
    }

    #[test]
    fn test_merge_clears_earlier_recreation() {
        let dir = tempdir().unwrap();
        let history = BranchHistory::new(dir.path());

        history.update("feature/auth", |r| r.mark_aborted()).unwrap();
        history.update("feature/auth", |r| r.mark_deleted(false)).unwrap();
        history.update("feature/auth", |r| r.mark_recreated()).unwrap();
        assert!(history.get("feature/auth").unwrap().recreated);

        history.update("feature/auth", |r| r.mark_merged(Some(3))).unwrap();
        let record = history.get("feature/auth").unwrap();
        assert!(record.merged);
        assert!(!record.recreated);
        assert!(record.recreated_at.is_none());
    }

    #[test]
    fn test_corrupt_record_is_absent() {
        let dir = tempdir().unwrap();
        let history = BranchHistory::new(dir.path());
        fs::write(dir.path().join("feature%2Fbroken.json"), "{not json").unwrap();
        assert!(history.get("feature/broken").is_none());
    }
}
