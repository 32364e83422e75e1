//! Read-only checks run before an orchestrator mutates anything.

use std::fmt;

use crate::error::WorkflowError;

/// Result of one check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckStatus {
    Pass,
    /// Reported but does not stop the operation
    Warn,
    Fail,
}

impl CheckStatus {
    pub const fn icon(self) -> &'static str {
        match self {
            Self::Pass => "✓",
            Self::Warn => "⚠",
            Self::Fail => "✗",
        }
    }
}

/// One named check with its finding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreflightCheck {
    pub name: &'static str,
    pub status: CheckStatus,
    pub message: String,
    pub suggestions: Vec<String>,
}

impl fmt::Display for PreflightCheck {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}: {}", self.status.icon(), self.name, self.message)
    }
}

/// Every check an orchestrator ran, in order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PreflightReport {
    pub checks: Vec<PreflightCheck>,
}

impl PreflightReport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pass(&mut self, name: &'static str, message: impl Into<String>) {
        self.push(name, CheckStatus::Pass, message, Vec::new());
    }

    pub fn warn(&mut self, name: &'static str, message: impl Into<String>) {
        self.push(name, CheckStatus::Warn, message, Vec::new());
    }

    pub fn fail(&mut self, name: &'static str, message: impl Into<String>, suggestions: Vec<String>) {
        self.push(name, CheckStatus::Fail, message, suggestions);
    }

    fn push(
        &mut self,
        name: &'static str,
        status: CheckStatus,
        message: impl Into<String>,
        suggestions: Vec<String>,
    ) {
        let check = PreflightCheck { name, status, message: message.into(), suggestions };
        match status {
            CheckStatus::Pass => tracing::debug!("pre-flight {check}"),
            CheckStatus::Warn | CheckStatus::Fail => tracing::info!("pre-flight {check}"),
        }
        self.checks.push(check);
    }

    pub fn has_failures(&self) -> bool {
        self.checks.iter().any(|c| c.status == CheckStatus::Fail)
    }

    pub fn failures(&self) -> impl Iterator<Item = &PreflightCheck> {
        self.checks.iter().filter(|c| c.status == CheckStatus::Fail)
    }

    pub fn warnings(&self) -> impl Iterator<Item = &PreflightCheck> {
        self.checks.iter().filter(|c| c.status == CheckStatus::Warn)
    }

    /// `Err` with every failure and suggestion when any check failed.
    pub fn ensure_passed(&self, operation: &str) -> Result<(), WorkflowError> {
        if !self.has_failures() {
            return Ok(());
        }
        let errors: Vec<String> = self.failures().map(|c| format!("{}: {}", c.name, c.message)).collect();
        let suggestions: Vec<String> =
            self.failures().flat_map(|c| c.suggestions.iter().cloned()).collect();
        let message = format!("{operation} pre-flight failed: {}", errors.join("; "));
        Err(WorkflowError::validation(message, errors, suggestions))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_warnings_do_not_block() {
        let mut report = PreflightReport::new();
        report.pass("session", "feature/a in BRANCH_READY");
        report.warn("hooks", "no pre-push hook");
        assert!(!report.has_failures());
        assert!(report.ensure_passed("ship").is_ok());
        assert_eq!(report.warnings().count(), 1);
    }

    #[test]
    fn test_failures_collect_suggestions() {
        let mut report = PreflightReport::new();
        report.fail("protected branch", "on main", vec!["shipflow swap feature/a".to_string()]);
        report.fail("platform", "unreachable", Vec::new());

        let err = report.ensure_passed("ship").unwrap_err();
        match err {
            WorkflowError::Validation { errors, suggestions, message } => {
                assert_eq!(errors.len(), 2);
                assert_eq!(suggestions, vec!["shipflow swap feature/a".to_string()]);
                assert!(message.starts_with("ship pre-flight failed"));
            }
            other => panic!("unexpected: {other}"),
        }
    }
}
