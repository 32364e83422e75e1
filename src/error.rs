//! Workflow error taxonomy.
//!
//! Expected policy failures (bad branch names, reuse, PR conflicts) are
//! returned as [`ValidationResult`](crate::validation::ValidationResult)
//! values by the validators. Orchestrators lift a failed result into
//! [`WorkflowError::Validation`] only when they have to stop.

use std::path::PathBuf;

use thiserror::Error;
use uuid::Uuid;

use crate::git::GitError;
use crate::platform::PlatformError;
use crate::session::TransitionError;

/// Result type for workflow operations.
pub type WorkflowResult<T> = Result<T, WorkflowError>;

/// Errors surfaced by the session engine and orchestrators.
#[derive(Debug, Error)]
pub enum WorkflowError {
    /// A policy check failed (bad name, retired branch, PR conflict).
    #[error("{message}")]
    Validation {
        message: String,
        errors: Vec<String>,
        suggestions: Vec<String>,
    },

    /// A state transition was rejected by the state machine.
    #[error(transparent)]
    Transition(#[from] TransitionError),

    /// Another invocation holds the session lock.
    #[error("Session {session_id} is busy (locked by pid {holder_pid})")]
    Lock { session_id: Uuid, holder_pid: u32 },

    /// Rebase or merge stopped on conflicting files.
    #[error("Conflicts in {} file(s): {}", files.len(), files.join(", "))]
    Conflict { files: Vec<String> },

    /// Git command failed.
    #[error("Git error: {0}")]
    Git(GitError),

    /// Remote platform call failed.
    #[error("Platform error: {0}")]
    Platform(#[from] PlatformError),

    /// Session already exists for the branch.
    #[error("A session for branch '{branch}' already exists ({session_id})")]
    AlreadyExists { branch: String, session_id: Uuid },

    /// No live session matched.
    #[error("No active session found for {0}")]
    NotFound(String),

    /// Operation stopped at a step boundary after Ctrl-C.
    #[error("Cancelled before step '{step}'")]
    Cancelled { step: String },

    /// Remote checks did not finish within the configured timeout.
    #[error("Checks for PR #{number} did not finish within {timeout_secs}s")]
    Timeout { number: u64, timeout_secs: u64 },

    /// Session storage failed.
    #[error("Storage error at {path}: {source}")]
    Storage {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Session document could not be serialized.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl WorkflowError {
    /// Build a validation error with suggestions.
    pub fn validation(
        message: impl Into<String>,
        errors: Vec<String>,
        suggestions: Vec<String>,
    ) -> Self {
        Self::Validation { message: message.into(), errors, suggestions }
    }

    /// Wrap an I/O error with the path it happened at.
    pub fn storage(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Storage { path: path.into(), source }
    }

    /// Whether the caller can retry after fixing something locally.
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, Self::Storage { .. } | Self::Serialization(_))
    }

    /// Short guidance on how to get unstuck.
    pub fn recovery_hint(&self) -> Option<String> {
        match self {
            Self::Validation { suggestions, .. } if !suggestions.is_empty() => {
                Some(format!("Try: {}", suggestions.join(", ")))
            }
            Self::Validation { .. } | Self::Serialization(_) => None,
            Self::Transition(_) => {
                Some("Run 'shipflow sessions --verbose' to inspect the session state".to_string())
            }
            Self::Lock { .. } => Some(
                "Wait for the other command to finish, or run 'shipflow cleanup' if it crashed"
                    .to_string(),
            ),
            Self::Conflict { .. } => {
                Some("Resolve the conflicts locally and re-run 'shipflow ship'".to_string())
            }
            Self::Git(_) | Self::Platform(_) => {
                Some("Fix the underlying problem and re-run; the session kept its last state".to_string())
            }
            Self::AlreadyExists { branch, .. } => {
                Some(format!("Use 'shipflow swap {branch}' to resume the existing session"))
            }
            Self::NotFound(_) => {
                Some("Start a new session with 'shipflow launch'".to_string())
            }
            Self::Cancelled { .. } => Some("Re-run the command to resume".to_string()),
            Self::Timeout { .. } => {
                Some("Re-run 'shipflow ship' once the checks have finished".to_string())
            }
            Self::Storage { .. } => None,
        }
    }
}

impl From<GitError> for WorkflowError {
    fn from(err: GitError) -> Self {
        match err {
            GitError::Conflict { files } => Self::Conflict { files },
            other => Self::Git(other),
        }
    }
}
