//! GitHub REST API implementation of [`RemotePlatform`].

use std::time::Duration;

use chrono::{DateTime, Utc};
use reqwest::blocking::{Client, RequestBuilder, Response};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use super::{
    CheckOutcome, MergeStrategy, PlatformError, PlatformResult, PrUpdate, PullRequest,
    RemotePlatform,
};
use crate::session::PrState;

const API_VERSION: &str = "2022-11-28";

/// GitHub API client bound to one repository.
pub struct GitHubPlatform {
    base_url: String,
    owner: String,
    repo: String,
    token: String,
    poll_interval: Duration,
    client: Client,
}

#[derive(Debug, Deserialize)]
struct ApiPullRequest {
    number: u64,
    state: String,
    merged_at: Option<DateTime<Utc>>,
    html_url: String,
    title: String,
    created_at: DateTime<Utc>,
    head: ApiRef,
    base: ApiRef,
}

#[derive(Debug, Deserialize)]
struct ApiRef {
    #[serde(rename = "ref")]
    name: String,
    sha: String,
}

impl From<ApiPullRequest> for PullRequest {
    fn from(pr: ApiPullRequest) -> Self {
        let state = match (pr.state.as_str(), pr.merged_at) {
            ("open", _) => PrState::Open,
            (_, Some(_)) => PrState::Merged,
            _ => PrState::Closed,
        };
        Self {
            number: pr.number,
            state,
            url: pr.html_url,
            head: pr.head.name,
            base: pr.base.name,
            title: pr.title,
            created_at: pr.created_at,
        }
    }
}

#[derive(Debug, Deserialize)]
struct CheckRunsResponse {
    check_runs: Vec<CheckRun>,
}

#[derive(Debug, Deserialize)]
struct CheckRun {
    name: String,
    status: String,
    conclusion: Option<String>,
}

#[derive(Serialize)]
struct CreatePullRequest<'a> {
    title: &'a str,
    body: &'a str,
    head: &'a str,
    base: &'a str,
}

#[derive(Serialize)]
struct MergeRequest {
    merge_method: &'static str,
}

impl GitHubPlatform {
    /// Create a client for `owner/repo`.
    pub fn new(
        owner: impl Into<String>,
        repo: impl Into<String>,
        token: impl Into<String>,
        request_timeout: Duration,
    ) -> PlatformResult<Self> {
        let client = Client::builder()
            .timeout(request_timeout)
            .user_agent(format!("shipflow/{}", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self {
            base_url: "https://api.github.com".to_string(),
            owner: owner.into(),
            repo: repo.into(),
            token: token.into(),
            poll_interval: Duration::from_secs(10),
            client,
        })
    }

    /// Create a client from the environment.
    ///
    /// Uses `GITHUB_TOKEN`, then `GITHUB_REPOSITORY` (`owner/repo`) or the
    /// given remote URL. `GITHUB_API_URL` overrides the API endpoint.
    pub fn from_env(remote_url: Option<&str>, request_timeout: Duration) -> PlatformResult<Self> {
        let token = std::env::var("GITHUB_TOKEN")
            .map_err(|_| PlatformError::NotConfigured("GITHUB_TOKEN is not set".to_string()))?;

        let (owner, repo) = std::env::var("GITHUB_REPOSITORY")
            .ok()
            .and_then(|s| s.split_once('/').map(|(o, r)| (o.to_string(), r.to_string())))
            .or_else(|| remote_url.and_then(parse_github_remote))
            .ok_or_else(|| {
                PlatformError::NotConfigured(
                    "cannot determine the GitHub repository (set GITHUB_REPOSITORY)".to_string(),
                )
            })?;

        let mut platform = Self::new(owner, repo, token, request_timeout)?;
        if let Ok(url) = std::env::var("GITHUB_API_URL") {
            platform.base_url = url.trim_end_matches('/').to_string();
        }
        Ok(platform)
    }

    #[must_use]
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    pub fn repo(&self) -> &str {
        &self.repo
    }

    fn repo_url(&self) -> String {
        format!("{}/repos/{}/{}", self.base_url, self.owner, self.repo)
    }

    fn authorized(&self, builder: RequestBuilder) -> RequestBuilder {
        builder
            .header("Authorization", format!("Bearer {}", self.token))
            .header("Accept", "application/vnd.github+json")
            .header("X-GitHub-Api-Version", API_VERSION)
    }

    fn get<T: DeserializeOwned>(&self, path: &str) -> PlatformResult<T> {
        let url = format!("{}{path}", self.repo_url());
        let response = self.authorized(self.client.get(&url)).send()?;
        Self::handle_response(response)
    }

    fn send_json<T: DeserializeOwned, B: Serialize>(
        &self,
        method: reqwest::Method,
        path: &str,
        body: &B,
    ) -> PlatformResult<T> {
        let url = format!("{}{path}", self.repo_url());
        let response = self.authorized(self.client.request(method, &url)).json(body).send()?;
        Self::handle_response(response)
    }

    fn handle_response<T: DeserializeOwned>(response: Response) -> PlatformResult<T> {
        let status = response.status();
        if status.is_success() {
            return response.json().map_err(|e| PlatformError::InvalidResponse(e.to_string()));
        }

        let rate_limited = response
            .headers()
            .get("x-ratelimit-remaining")
            .is_some_and(|v| v.as_bytes() == b"0");
        let reset_at = response
            .headers()
            .get("x-ratelimit-reset")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("unknown")
            .to_string();
        let message = response.text().unwrap_or_else(|_| "Unknown error".to_string());

        match status.as_u16() {
            401 => Err(PlatformError::Auth(message)),
            403 if rate_limited => Err(PlatformError::RateLimited { reset_at }),
            403 => Err(PlatformError::Auth(message)),
            404 => Err(PlatformError::NotFound(message)),
            code => Err(PlatformError::Api { status: code, message }),
        }
    }

    fn head_sha(&self, number: u64) -> PlatformResult<String> {
        let pr: ApiPullRequest = self.get(&format!("/pulls/{number}"))?;
        Ok(pr.head.sha)
    }
}

impl RemotePlatform for GitHubPlatform {
    fn name(&self) -> &str {
        "github"
    }

    fn check_connection(&self) -> PlatformResult<()> {
        let _: serde_json::Value = self.get("")?;
        Ok(())
    }

    fn create_pull_request(
        &self,
        title: &str,
        body: &str,
        head: &str,
        base: &str,
    ) -> PlatformResult<PullRequest> {
        let request = CreatePullRequest { title, body, head, base };
        let pr: ApiPullRequest = self.send_json(reqwest::Method::POST, "/pulls", &request)?;
        tracing::info!(number = pr.number, head, "created pull request");
        Ok(pr.into())
    }

    fn update_pull_request(&self, number: u64, update: &PrUpdate) -> PlatformResult<PullRequest> {
        let pr: ApiPullRequest =
            self.send_json(reqwest::Method::PATCH, &format!("/pulls/{number}"), update)?;
        Ok(pr.into())
    }

    fn pull_requests_for_branch(&self, branch: &str) -> PlatformResult<Vec<PullRequest>> {
        let path = format!("/pulls?state=all&per_page=100&head={}:{branch}", self.owner);
        let prs: Vec<ApiPullRequest> = self.get(&path)?;
        // The head filter is ignored for unknown owners; filter again locally
        Ok(prs.into_iter().filter(|pr| pr.head.name == branch).map(Into::into).collect())
    }

    fn pull_request(&self, number: u64) -> PlatformResult<PullRequest> {
        let pr: ApiPullRequest = self.get(&format!("/pulls/{number}"))?;
        Ok(pr.into())
    }

    fn merge_pull_request(&self, number: u64, strategy: MergeStrategy) -> PlatformResult<()> {
        let body = MergeRequest { merge_method: strategy.as_str() };
        let result: PlatformResult<serde_json::Value> =
            self.send_json(reqwest::Method::PUT, &format!("/pulls/{number}/merge"), &body);
        match result {
            Ok(_) => {
                tracing::info!(number, strategy = strategy.as_str(), "merged pull request");
                Ok(())
            }
            Err(PlatformError::Api { status: 405 | 409, message }) => {
                Err(PlatformError::NotMergeable { number, reason: message })
            }
            Err(e) => Err(e),
        }
    }

    fn check_status(&self, number: u64) -> PlatformResult<CheckOutcome> {
        let sha = self.head_sha(number)?;
        let runs: CheckRunsResponse = self.get(&format!("/commits/{sha}/check-runs?per_page=100"))?;
        Ok(summarize_checks(&runs.check_runs))
    }

    fn poll_interval(&self) -> Duration {
        self.poll_interval
    }
}

fn summarize_checks(runs: &[CheckRun]) -> CheckOutcome {
    if runs.is_empty() {
        return CheckOutcome::NoChecks;
    }
    if runs.iter().any(|run| run.status != "completed") {
        return CheckOutcome::Pending;
    }

    let failing: Vec<String> = runs
        .iter()
        .filter(|run| {
            matches!(
                run.conclusion.as_deref(),
                Some("failure" | "timed_out" | "cancelled" | "action_required" | "startup_failure")
            )
        })
        .map(|run| run.name.clone())
        .collect();

    if failing.is_empty() {
        CheckOutcome::Passed
    } else {
        CheckOutcome::Failed { failing }
    }
}

/// Extract `(owner, repo)` from a GitHub remote URL.
pub fn parse_github_remote(url: &str) -> Option<(String, String)> {
    let url = url.trim();
    let path = url
        .strip_prefix("git@github.com:")
        .or_else(|| url.strip_prefix("ssh://git@github.com/"))
        .or_else(|| url.strip_prefix("https://github.com/"))
        .or_else(|| url.strip_prefix("http://github.com/"))?;
    let path = path.strip_suffix(".git").unwrap_or(path).trim_end_matches('/');
    let (owner, repo) = path.split_once('/')?;
    if owner.is_empty() || repo.is_empty() || repo.contains('/') {
        return None;
    }
    Some((owner.to_string(), repo.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(name: &str, status: &str, conclusion: Option<&str>) -> CheckRun {
        CheckRun {
            name: name.to_string(),
            status: status.to_string(),
            conclusion: conclusion.map(String::from),
        }
    }

    #[test]
    fn test_parse_github_remote() {
        let expected = Some(("acme".to_string(), "app".to_string()));
        assert_eq!(parse_github_remote("git@github.com:acme/app.git"), expected);
        assert_eq!(parse_github_remote("https://github.com/acme/app"), expected);
        assert_eq!(parse_github_remote("https://github.com/acme/app.git\n"), expected);
        assert_eq!(parse_github_remote("ssh://git@github.com/acme/app.git"), expected);
        assert_eq!(parse_github_remote("https://gitlab.com/acme/app"), None);
        assert_eq!(parse_github_remote("https://github.com/acme"), None);
    }

    #[test]
    fn test_summarize_checks() {
        assert_eq!(summarize_checks(&[]), CheckOutcome::NoChecks);
        assert_eq!(
            summarize_checks(&[run("build", "completed", Some("success")), run("lint", "queued", None)]),
            CheckOutcome::Pending
        );
        assert_eq!(
            summarize_checks(&[
                run("build", "completed", Some("success")),
                run("test", "completed", Some("failure")),
                run("docs", "completed", Some("skipped")),
            ]),
            CheckOutcome::Failed { failing: vec!["test".to_string()] }
        );
        assert_eq!(
            summarize_checks(&[run("build", "completed", Some("neutral"))]),
            CheckOutcome::Passed
        );
    }

    #[test]
    fn test_pull_request_state_mapping() {
        let json = r#"{
            "number": 12,
            "state": "closed",
            "merged_at": "2024-05-01T10:00:00Z",
            "html_url": "https://github.com/acme/app/pull/12",
            "title": "Auth",
            "created_at": "2024-04-30T10:00:00Z",
            "head": {"ref": "feature/auth", "sha": "abc"},
            "base": {"ref": "main", "sha": "def"}
        }"#;
        let pr: PullRequest = serde_json::from_str::<ApiPullRequest>(json).unwrap().into();
        assert_eq!(pr.state, PrState::Merged);
        assert_eq!(pr.head, "feature/auth");
        assert_eq!(pr.base, "main");
    }
}
