//! Remote code-host collaborator.
//!
//! Orchestrators only talk to [`RemotePlatform`]. [`GitHubPlatform`] is the
//! production implementation; [`Unconfigured`] stands in when no token is
//! available so that purely local operations keep working.

#[cfg(feature = "github")]
mod github;

use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[cfg(feature = "github")]
pub use github::{parse_github_remote, GitHubPlatform};

use crate::session::{PrState, PullRequestRecord};

/// Result type for platform operations.
pub type PlatformResult<T> = Result<T, PlatformError>;

/// Errors from the remote platform.
#[derive(Debug, Error)]
pub enum PlatformError {
    /// HTTP request failed
    #[cfg(feature = "github")]
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// API returned an error
    #[error("API error: {message} (status: {status})")]
    Api { status: u16, message: String },

    /// Authentication failed
    #[error("Authentication failed: {0}")]
    Auth(String),

    /// Resource not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Rate limited
    #[error("Rate limited. Reset at: {reset_at}")]
    RateLimited { reset_at: String },

    /// Invalid response
    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    /// The platform refused to merge.
    #[error("PR #{number} cannot be merged: {reason}")]
    NotMergeable { number: u64, reason: String },

    /// No token or repository could be determined.
    #[error("Remote platform not configured: {0}")]
    NotConfigured(String),
}

/// A pull request as reported by the platform.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PullRequest {
    pub number: u64,
    pub state: PrState,
    pub url: String,
    /// Source branch
    pub head: String,
    /// Target branch
    pub base: String,
    pub title: String,
    pub created_at: DateTime<Utc>,
}

impl PullRequest {
    /// The reference stored in session metadata.
    pub fn record(&self) -> PullRequestRecord {
        PullRequestRecord { number: self.number, state: self.state, url: self.url.clone() }
    }
}

/// Fields to change on an existing pull request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PrUpdate {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base: Option<String>,
}

/// How a pull request is merged. Only squash keeps history linear.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum MergeStrategy {
    #[default]
    Squash,
}

impl MergeStrategy {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Squash => "squash",
        }
    }
}

/// Aggregate state of the checks on a pull request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CheckOutcome {
    Passed,
    Failed { failing: Vec<String> },
    /// Still running (only returned by a single status read)
    Pending,
    /// Still running when the wait deadline passed
    Timeout,
    /// The head commit has no checks configured
    NoChecks,
}

impl CheckOutcome {
    /// Whether shipping may continue.
    pub fn allows_merge(&self) -> bool {
        matches!(self, Self::Passed | Self::NoChecks)
    }
}

/// Blocking operations against the code host.
pub trait RemotePlatform: Send + Sync {
    /// Short name for messages ("github").
    fn name(&self) -> &str;

    /// Verify credentials and repository access.
    fn check_connection(&self) -> PlatformResult<()>;

    fn create_pull_request(
        &self,
        title: &str,
        body: &str,
        head: &str,
        base: &str,
    ) -> PlatformResult<PullRequest>;

    fn update_pull_request(&self, number: u64, update: &PrUpdate) -> PlatformResult<PullRequest>;

    /// Every pull request, in any state, whose head is `branch`.
    fn pull_requests_for_branch(&self, branch: &str) -> PlatformResult<Vec<PullRequest>>;

    fn pull_request(&self, number: u64) -> PlatformResult<PullRequest>;

    fn merge_pull_request(&self, number: u64, strategy: MergeStrategy) -> PlatformResult<()>;

    /// Current check state without waiting.
    fn check_status(&self, number: u64) -> PlatformResult<CheckOutcome>;

    /// Delay between check polls.
    fn poll_interval(&self) -> Duration {
        Duration::from_secs(10)
    }

    /// The open pull request for `branch`, else the most recent one.
    fn get_pull_request(&self, branch: &str) -> PlatformResult<Option<PullRequest>> {
        let mut prs = self.pull_requests_for_branch(branch)?;
        if let Some(idx) = prs.iter().position(|pr| pr.state == PrState::Open) {
            return Ok(Some(prs.swap_remove(idx)));
        }
        Ok(prs.into_iter().max_by_key(|pr| pr.created_at))
    }

    /// Poll checks until they settle or `timeout` elapses.
    fn wait_for_checks(&self, number: u64, timeout: Duration) -> PlatformResult<CheckOutcome> {
        let deadline = Instant::now() + timeout;
        loop {
            let outcome = self.check_status(number)?;
            if outcome != CheckOutcome::Pending {
                return Ok(outcome);
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(CheckOutcome::Timeout);
            }
            tracing::debug!(pr = number, "checks pending");
            std::thread::sleep(self.poll_interval().min(deadline - now));
        }
    }
}

/// Platform used when no credentials are available.
///
/// Every call fails with [`PlatformError::NotConfigured`].
#[derive(Debug, Clone)]
pub struct Unconfigured {
    reason: String,
}

impl Unconfigured {
    pub fn new(reason: impl Into<String>) -> Self {
        Self { reason: reason.into() }
    }

    fn fail<T>(&self) -> PlatformResult<T> {
        Err(PlatformError::NotConfigured(self.reason.clone()))
    }
}

impl RemotePlatform for Unconfigured {
    fn name(&self) -> &str {
        "unconfigured"
    }

    fn check_connection(&self) -> PlatformResult<()> {
        self.fail()
    }

    fn create_pull_request(&self, _: &str, _: &str, _: &str, _: &str) -> PlatformResult<PullRequest> {
        self.fail()
    }

    fn update_pull_request(&self, _: u64, _: &PrUpdate) -> PlatformResult<PullRequest> {
        self.fail()
    }

    fn pull_requests_for_branch(&self, _: &str) -> PlatformResult<Vec<PullRequest>> {
        self.fail()
    }

    fn pull_request(&self, _: u64) -> PlatformResult<PullRequest> {
        self.fail()
    }

    fn merge_pull_request(&self, _: u64, _: MergeStrategy) -> PlatformResult<()> {
        self.fail()
    }

    fn check_status(&self, _: u64) -> PlatformResult<CheckOutcome> {
        self.fail()
    }
}
