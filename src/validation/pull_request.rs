//! One-open-PR-per-branch policy.

use super::{ValidationResult, ValidationSeverity};
use crate::platform::PullRequest;
use crate::session::PrState;

/// What `ship` should do about the pull request for a branch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PrDecision {
    /// No usable PR: open a new one.
    Create,
    /// Exactly one open PR: push updates to it.
    Update { number: u64 },
    /// More than one open PR: a human has to close the extras.
    Block { open: Vec<u64> },
}

/// Decides between creating, updating and blocking.
#[derive(Debug, Clone, Copy, Default)]
pub struct PrValidator;

impl PrValidator {
    pub fn new() -> Self {
        Self
    }

    /// Decide from every PR whose head is the branch.
    pub fn decide(&self, pull_requests: &[PullRequest]) -> (PrDecision, ValidationResult) {
        let mut open: Vec<&PullRequest> =
            pull_requests.iter().filter(|pr| pr.state == PrState::Open).collect();
        open.sort_by_key(|pr| pr.number);

        match open.as_slice() {
            [] => {}
            [only] => return (PrDecision::Update { number: only.number }, ValidationResult::ok()),
            many => {
                let numbers: Vec<u64> = many.iter().map(|pr| pr.number).collect();
                let listed =
                    numbers.iter().map(|n| format!("#{n}")).collect::<Vec<_>>().join(", ");
                let mut result = ValidationResult::error(
                    format!("Branch has {} open pull requests ({listed})", numbers.len()),
                    ValidationSeverity::High,
                );
                result.add_suggestion(format!(
                    "Close all but one of {listed} on the remote and re-run"
                ));
                return (PrDecision::Block { open: numbers }, result);
            }
        }

        let mut result = ValidationResult::ok();
        if let Some(latest) = pull_requests.iter().max_by_key(|pr| pr.created_at) {
            match latest.state {
                PrState::Merged => result.add_warning(format!(
                    "PR #{} for this branch was already merged; opening a new one",
                    latest.number
                )),
                PrState::Closed => result.add_warning(format!(
                    "PR #{} for this branch was closed; opening a new one",
                    latest.number
                )),
                PrState::Open => {}
            }
        }
        (PrDecision::Create, result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};

    fn pr(number: u64, state: PrState, age_days: i64) -> PullRequest {
        PullRequest {
            number,
            state,
            url: format!("https://github.com/acme/app/pull/{number}"),
            head: "feature/auth".to_string(),
            base: "main".to_string(),
            title: "Auth".to_string(),
            created_at: Utc::now() - Duration::days(age_days),
        }
    }

    #[test]
    fn test_no_prs_creates() {
        let (decision, result) = PrValidator::new().decide(&[]);
        assert_eq!(decision, PrDecision::Create);
        assert!(result.is_valid());
        assert!(result.warnings.is_empty());
    }

    #[test]
    fn test_single_open_updates() {
        let prs = [pr(3, PrState::Closed, 5), pr(7, PrState::Open, 1)];
        let (decision, result) = PrValidator::new().decide(&prs);
        assert_eq!(decision, PrDecision::Update { number: 7 });
        assert!(result.is_valid());
    }

    #[test]
    fn test_multiple_open_blocks() {
        let prs = [pr(9, PrState::Open, 1), pr(4, PrState::Open, 2)];
        let (decision, result) = PrValidator::new().decide(&prs);
        assert_eq!(decision, PrDecision::Block { open: vec![4, 9] });
        assert!(!result.is_valid());
        assert!(result.errors[0].contains("#4, #9"));
    }

    #[test]
    fn test_after_merge_creates_with_warning() {
        let prs = [pr(3, PrState::Closed, 5), pr(5, PrState::Merged, 1)];
        let (decision, result) = PrValidator::new().decide(&prs);
        assert_eq!(decision, PrDecision::Create);
        assert!(result.is_valid());
        assert!(result.warnings[0].contains("#5"));
    }
}
