//! Append-only operation log (`audit/{yyyy-mm}/{dd}.jsonl`).

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::PathBuf;

use chrono::{DateTime, Datelike, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// How an audited operation ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditOutcome {
    Success,
    /// Stopped by a policy check before anything was mutated
    Blocked,
    Failure,
}

/// One line of the audit log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub timestamp: DateTime<Utc>,
    pub session_id: Option<Uuid>,
    pub action: String,
    pub result: AuditOutcome,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
}

impl AuditEntry {
    pub fn new(action: impl Into<String>, result: AuditOutcome) -> Self {
        Self {
            timestamp: Utc::now(),
            session_id: None,
            action: action.into(),
            result,
            error: None,
            branch: None,
        }
    }

    pub fn session(mut self, id: Uuid) -> Self {
        self.session_id = Some(id);
        self
    }

    pub fn branch(mut self, branch: impl Into<String>) -> Self {
        self.branch = Some(branch.into());
        self
    }

    pub fn error(mut self, error: impl ToString) -> Self {
        self.error = Some(error.to_string());
        self
    }
}

/// Writer for the daily audit files.
#[derive(Debug, Clone)]
pub struct AuditLog {
    dir: PathBuf,
}

impl AuditLog {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn day_path(&self, date: NaiveDate) -> PathBuf {
        self.dir
            .join(format!("{:04}-{:02}", date.year(), date.month()))
            .join(format!("{:02}.jsonl", date.day()))
    }

    /// Append an entry. Audit failures are logged, never propagated.
    pub fn record(&self, entry: &AuditEntry) {
        if let Err(e) = self.try_record(entry) {
            tracing::warn!(action = %entry.action, "failed to write audit entry: {e}");
        }
    }

    fn try_record(&self, entry: &AuditEntry) -> std::io::Result<()> {
        let path = self.day_path(entry.timestamp.date_naive());
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let mut line = serde_json::to_string(entry).map_err(std::io::Error::other)?;
        line.push('\n');

        let mut file = OpenOptions::new().create(true).append(true).open(path)?;
        file.write_all(line.as_bytes())
    }

    /// Entries written on `date`, skipping unreadable lines.
    pub fn entries_for(&self, date: NaiveDate) -> Vec<AuditEntry> {
        fs::read_to_string(self.day_path(date))
            .map(|content| {
                content.lines().filter_map(|line| serde_json::from_str(line).ok()).collect()
            })
            .unwrap_or_default()
    }
}
