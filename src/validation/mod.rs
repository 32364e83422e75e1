//! Policy validators.
//!
//! Validators never return `Err` for policy violations. They produce a
//! [`ValidationResult`] so callers can show every problem together with
//! suggestions for getting past it.

mod branch;
mod pull_request;

pub use branch::{branch_name_from_description, BranchObservation, BranchRules, BranchValidator};
pub use pull_request::{PrDecision, PrValidator};

use crate::error::WorkflowError;

/// Severity of the worst issue found.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum ValidationSeverity {
    #[default]
    None,
    /// Informational only
    Low,
    /// Blocks the operation
    High,
    /// Blocks the operation and indicates history was already damaged
    Critical,
}

impl ValidationSeverity {
    pub fn description(&self) -> &'static str {
        match self {
            Self::None => "No issues",
            Self::Low => "Warning",
            Self::High => "Blocked",
            Self::Critical => "Blocked (critical)",
        }
    }
}

/// Outcome of a policy check.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ValidationResult {
    pub valid: bool,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
    pub suggestions: Vec<String>,
    pub severity: ValidationSeverity,

    /// Name to use instead of the input (set when the input was truncated)
    pub normalized: Option<String>,
}

impl ValidationResult {
    /// A passing result with no remarks.
    pub fn ok() -> Self {
        Self { valid: true, ..Default::default() }
    }

    /// A failing result with one error.
    pub fn error(message: impl Into<String>, severity: ValidationSeverity) -> Self {
        Self { valid: false, errors: vec![message.into()], severity, ..Default::default() }
    }

    pub fn is_valid(&self) -> bool {
        self.valid
    }

    pub fn add_error(&mut self, message: impl Into<String>, severity: ValidationSeverity) {
        self.valid = false;
        self.errors.push(message.into());
        if severity > self.severity {
            self.severity = severity;
        }
    }

    pub fn add_warning(&mut self, message: impl Into<String>) {
        self.warnings.push(message.into());
        if self.severity == ValidationSeverity::None {
            self.severity = ValidationSeverity::Low;
        }
    }

    pub fn add_suggestion(&mut self, suggestion: impl Into<String>) {
        let suggestion = suggestion.into();
        if !self.suggestions.contains(&suggestion) {
            self.suggestions.push(suggestion);
        }
    }

    /// Fold another result into this one.
    pub fn merge(&mut self, other: Self) {
        if !other.valid {
            self.valid = false;
        }
        self.errors.extend(other.errors);
        self.warnings.extend(other.warnings);
        for s in other.suggestions {
            self.add_suggestion(s);
        }
        if other.severity > self.severity {
            self.severity = other.severity;
        }
        if other.normalized.is_some() {
            self.normalized = other.normalized;
        }
    }

    /// Turn a failed result into an error, `Ok(self)` otherwise.
    pub fn into_result(self, context: &str) -> Result<Self, WorkflowError> {
        if self.valid {
            return Ok(self);
        }
        let message = match self.errors.first() {
            Some(first) => format!("{context}: {first}"),
            None => context.to_string(),
        };
        Err(WorkflowError::validation(message, self.errors, self.suggestions))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_merge_keeps_worst_severity() {
        let mut result = ValidationResult::ok();
        result.add_warning("long name");
        assert!(result.is_valid());
        assert_eq!(result.severity, ValidationSeverity::Low);

        result.merge(ValidationResult::error("retired", ValidationSeverity::Critical));
        assert!(!result.is_valid());
        assert_eq!(result.severity, ValidationSeverity::Critical);
        assert_eq!(result.errors, vec!["retired".to_string()]);
    }

    #[test]
    fn test_suggestions_are_deduplicated() {
        let mut result = ValidationResult::ok();
        result.add_suggestion("feature/a-v2");
        result.add_suggestion("feature/a-v2");
        assert_eq!(result.suggestions.len(), 1);
    }

    #[test]
    fn test_into_result_carries_suggestions() {
        let mut result = ValidationResult::error("name retired", ValidationSeverity::High);
        result.add_suggestion("feature/auth-v2");
        let err = result.into_result("Cannot launch feature/auth").unwrap_err();
        assert_eq!(err.to_string(), "Cannot launch feature/auth: name retired");
        match err {
            WorkflowError::Validation { suggestions, .. } => {
                assert_eq!(suggestions, vec!["feature/auth-v2".to_string()]);
            }
            other => panic!("unexpected error: {other}"),
        }
    }
}
