//! Branch naming rules and the reuse-after-merge policy.

use chrono::Utc;
use once_cell::sync::Lazy;
use regex::Regex;

use super::{ValidationResult, ValidationSeverity};
use crate::session::{BranchRecord, WorkflowType};

static DESCRIPTION_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-z0-9]+(-[a-z0-9]+)*$").expect("valid regex"));

static NON_SLUG_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"[^a-z0-9]+").expect("valid regex"));

/// Characters git refuses in ref names.
const FORBIDDEN_REF_CHARS: &[char] = &[' ', '~', '^', ':', '?', '*', '[', '\\', '\t', '\n'];

/// Naming conventions, usually built from the `[branches]` config section.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BranchRules {
    pub prefixes: Vec<String>,
    pub hotfix_prefix: String,
    pub max_length: usize,
    pub protected_branch: String,
}

impl Default for BranchRules {
    fn default() -> Self {
        Self {
            prefixes: ["feature", "fix", "chore", "docs", "refactor", "test", "perf"]
                .into_iter()
                .map(String::from)
                .collect(),
            hotfix_prefix: "hotfix".to_string(),
            max_length: 50,
            protected_branch: "main".to_string(),
        }
    }
}

impl BranchRules {
    /// Prefixes allowed for a workflow type.
    pub fn prefixes_for(&self, workflow: WorkflowType) -> Vec<&str> {
        if workflow.is_hotfix() {
            vec![self.hotfix_prefix.as_str()]
        } else {
            self.prefixes.iter().map(String::as_str).collect()
        }
    }

    /// Prefix used when generating names.
    pub fn default_prefix(&self, workflow: WorkflowType) -> &str {
        self.prefixes_for(workflow).first().copied().unwrap_or("feature")
    }
}

/// What git currently says about a branch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BranchObservation {
    pub local_exists: bool,
    pub remote_exists: bool,
    /// Branch tip is already contained in the base branch
    pub merged_into_base: bool,
}

impl BranchObservation {
    pub fn exists(&self) -> bool {
        self.local_exists || self.remote_exists
    }
}

/// Turn free text into `<prefix>/<kebab-description>`.
pub fn branch_name_from_description(description: &str, prefix: &str, max_length: usize) -> String {
    let lowered = description.to_lowercase();
    let slug = NON_SLUG_RE.replace_all(&lowered, "-");
    let slug = slug.trim_matches('-');
    let slug = if slug.is_empty() { "work" } else { slug };

    let budget = max_length.saturating_sub(prefix.len() + 1).max(1);
    format!("{prefix}/{}", truncate_words(slug, budget))
}

/// Cut a kebab-case string to `budget` chars, preferring a word boundary.
fn truncate_words(slug: &str, budget: usize) -> String {
    if slug.len() <= budget {
        return slug.to_string();
    }

    let cut = &slug[..budget];
    let at_boundary = slug.as_bytes().get(budget) == Some(&b'-');
    let trimmed = if at_boundary {
        cut
    } else {
        match cut.rfind('-') {
            Some(idx) if idx > 0 => &cut[..idx],
            _ => cut,
        }
    };
    trimmed.trim_end_matches('-').to_string()
}

/// Validates names and decides whether a name may be (re)used.
#[derive(Debug, Clone, Default)]
pub struct BranchValidator {
    rules: BranchRules,
}

impl BranchValidator {
    pub fn new(rules: BranchRules) -> Self {
        Self { rules }
    }

    pub fn rules(&self) -> &BranchRules {
        &self.rules
    }

    /// Check naming conventions.
    ///
    /// Over-length names are truncated into `normalized` with a warning
    /// instead of being rejected.
    pub fn validate_name(&self, name: &str, workflow: WorkflowType) -> ValidationResult {
        let mut result = ValidationResult::ok();
        let prefixes = self.rules.prefixes_for(workflow);
        let default_prefix = self.rules.default_prefix(workflow);

        if name.trim().is_empty() {
            return ValidationResult::error("Branch name is empty", ValidationSeverity::High);
        }

        if name == self.rules.protected_branch {
            let mut result = ValidationResult::error(
                format!("'{name}' is the protected branch"),
                ValidationSeverity::High,
            );
            result.add_suggestion(format!("{default_prefix}/my-change"));
            return result;
        }

        if name.contains(FORBIDDEN_REF_CHARS)
            || name.contains("..")
            || name.contains("@{")
            || name.ends_with('/')
            || name.ends_with(".lock")
        {
            result.add_error(
                format!("'{name}' is not a valid git branch name"),
                ValidationSeverity::High,
            );
            let (prefix, description) = match name.split_once('/') {
                Some((p, d)) if prefixes.contains(&p) => (p, d),
                _ => (default_prefix, name),
            };
            result.add_suggestion(branch_name_from_description(
                description,
                prefix,
                self.rules.max_length,
            ));
            return result;
        }

        let Some((prefix, description)) = name.split_once('/') else {
            result.add_error(
                format!("'{name}' has no type prefix (expected one of: {})", prefixes.join(", ")),
                ValidationSeverity::High,
            );
            result.add_suggestion(branch_name_from_description(
                name,
                default_prefix,
                self.rules.max_length,
            ));
            return result;
        };

        if !prefixes.contains(&prefix) {
            result.add_error(
                format!(
                    "Prefix '{prefix}' is not allowed for {workflow} workflows (expected one of: {})",
                    prefixes.join(", ")
                ),
                ValidationSeverity::High,
            );
            result.add_suggestion(branch_name_from_description(
                description,
                default_prefix,
                self.rules.max_length,
            ));
        }

        if !DESCRIPTION_RE.is_match(description) {
            result.add_error(
                format!("Description '{description}' must be lowercase kebab-case"),
                ValidationSeverity::High,
            );
            let fixed_prefix = if prefixes.contains(&prefix) { prefix } else { default_prefix };
            result.add_suggestion(branch_name_from_description(
                description,
                fixed_prefix,
                self.rules.max_length,
            ));
        }

        if result.valid && name.len() > self.rules.max_length {
            let budget = self.rules.max_length.saturating_sub(prefix.len() + 1).max(1);
            let truncated = format!("{prefix}/{}", truncate_words(description, budget));
            result.add_warning(format!(
                "Branch name is {} characters (max {}), truncated to '{truncated}'",
                name.len(),
                self.rules.max_length
            ));
            result.add_suggestion(truncated.clone());
            result.normalized = Some(truncated);
        }

        result
    }

    /// Apply the reuse policy to a name's recorded history.
    ///
    /// `is_taken` reports names that already have history, so that
    /// suggested alternatives are themselves safe.
    pub fn check_reuse(
        &self,
        name: &str,
        record: Option<&BranchRecord>,
        observed: BranchObservation,
        is_taken: &dyn Fn(&str) -> bool,
    ) -> ValidationResult {
        let mut result = ValidationResult::ok();

        match record {
            Some(record) if record.merged => {
                let recreated =
                    record.recreated || (record.deleted_at.is_some() && observed.exists());
                if recreated {
                    result.add_error(
                        format!(
                            "Improper reuse: '{name}' was merged{} and has been recreated",
                            merged_suffix(record)
                        ),
                        ValidationSeverity::Critical,
                    );
                } else {
                    result.add_error(
                        format!("Name retired: '{name}' was already merged{}", merged_suffix(record)),
                        ValidationSeverity::High,
                    );
                }
                for alt in self.suggest_alternatives(name, is_taken) {
                    result.add_suggestion(alt);
                }
            }
            Some(record) if record.aborted_at.is_some() => {
                result.add_warning(format!(
                    "'{name}' was previously aborted without merging; reusing the name"
                ));
            }
            _ if observed.exists() => {
                result.add_warning(format!(
                    "'{name}' already exists and was never merged; continuing work on it"
                ));
                if observed.merged_into_base {
                    result.add_warning(format!(
                        "'{name}' has no commits beyond the base branch yet"
                    ));
                }
            }
            _ => {}
        }

        result
    }

    /// Names derived from `name` that have no history yet.
    pub fn suggest_alternatives(&self, name: &str, is_taken: &dyn Fn(&str) -> bool) -> Vec<String> {
        let (prefix, description) = name.split_once('/').unwrap_or(("feature", name));
        let date = Utc::now().format("%Y%m%d").to_string();

        let suffixes = ["v2".to_string(), "v3".to_string(), "v4".to_string(), date];
        let mut alternatives = Vec::new();
        for suffix in suffixes {
            let budget =
                self.rules.max_length.saturating_sub(prefix.len() + suffix.len() + 2).max(1);
            let candidate = format!("{prefix}/{}-{suffix}", truncate_words(description, budget));
            if !is_taken(&candidate) && !alternatives.contains(&candidate) {
                alternatives.push(candidate);
            }
            if alternatives.len() == 3 {
                break;
            }
        }
        alternatives
    }

    /// Naming plus reuse checks for a new launch.
    pub fn validate_launch(
        &self,
        name: &str,
        workflow: WorkflowType,
        record: Option<&BranchRecord>,
        observed: BranchObservation,
        is_taken: &dyn Fn(&str) -> bool,
    ) -> ValidationResult {
        let mut result = self.validate_name(name, workflow);
        if !result.valid {
            return result;
        }
        let effective = result.normalized.clone().unwrap_or_else(|| name.to_string());
        result.merge(self.check_reuse(&effective, record, observed, is_taken));
        result
    }
}

fn merged_suffix(record: &BranchRecord) -> String {
    match (record.pr_number, record.merged_at) {
        (Some(pr), Some(at)) => format!(" in PR #{pr} on {}", at.format("%Y-%m-%d")),
        (None, Some(at)) => format!(" on {}", at.format("%Y-%m-%d")),
        (Some(pr), None) => format!(" in PR #{pr}"),
        (None, None) => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn validator() -> BranchValidator {
        BranchValidator::default()
    }

    fn never_taken(_: &str) -> bool {
        false
    }

    fn merged_record(name: &str) -> BranchRecord {
        let mut record = BranchRecord::new(name);
        record.mark_merged(Some(42));
        record.mark_deleted(true);
        record
    }

    #[test]
    fn test_valid_names() {
        let v = validator();
        assert!(v.validate_name("feature/auth", WorkflowType::Launch).is_valid());
        assert!(v.validate_name("fix/login-redirect-loop", WorkflowType::Launch).is_valid());
        assert!(v.validate_name("hotfix/crash-on-start", WorkflowType::Hotfix).is_valid());
    }

    #[test]
    fn test_wrong_prefix_for_workflow() {
        let v = validator();
        let result = v.validate_name("feature/crash", WorkflowType::Hotfix);
        assert!(!result.is_valid());
        assert_eq!(result.suggestions, vec!["hotfix/crash".to_string()]);

        let result = v.validate_name("hotfix/crash", WorkflowType::Launch);
        assert!(!result.is_valid());
    }

    #[test]
    fn test_bad_description_gets_slug_suggestion() {
        let result = validator().validate_name("feature/Add_OAuth Login", WorkflowType::Launch);
        assert!(!result.is_valid());
        assert!(result.suggestions.contains(&"feature/add-oauth-login".to_string()));
    }

    #[test]
    fn test_missing_prefix() {
        let result = validator().validate_name("auth", WorkflowType::Launch);
        assert!(!result.is_valid());
        assert_eq!(result.suggestions, vec!["feature/auth".to_string()]);
    }

    #[test]
    fn test_protected_branch_rejected() {
        assert!(!validator().validate_name("main", WorkflowType::Launch).is_valid());
    }

    #[test]
    fn test_overlong_name_is_truncated_not_rejected() {
        let name = "feature/implement-the-new-authentication-flow-for-mobile-clients";
        let result = validator().validate_name(name, WorkflowType::Launch);
        assert!(result.is_valid());
        assert_eq!(result.warnings.len(), 1);

        let normalized = result.normalized.unwrap();
        assert!(normalized.len() <= 50, "{normalized}");
        assert!(normalized.starts_with("feature/implement-the-new"));
        assert!(!normalized.ends_with('-'));
        assert!(validator().validate_name(&normalized, WorkflowType::Launch).normalized.is_none());
    }

    #[test]
    fn test_branch_name_from_description() {
        assert_eq!(branch_name_from_description("Add OAuth login!", "feature", 50), "feature/add-oauth-login");
        assert_eq!(branch_name_from_description("   ", "fix", 50), "fix/work");
        let long = branch_name_from_description(
            "make the session repository survive power loss during writes",
            "feature",
            40,
        );
        assert!(long.len() <= 40);
        assert!(!long.ends_with('-'));
    }

    #[test]
    fn test_merged_not_recreated_is_retired() {
        let record = merged_record("feature/auth");
        let result = validator().check_reuse(
            "feature/auth",
            Some(&record),
            BranchObservation::default(),
            &never_taken,
        );
        assert!(!result.is_valid());
        assert_eq!(result.severity, ValidationSeverity::High);
        assert!(result.errors[0].contains("Name retired"));
        assert!(result.suggestions.contains(&"feature/auth-v2".to_string()));
    }

    #[test]
    fn test_merged_and_recreated_is_critical() {
        let mut record = merged_record("feature/auth");
        record.mark_recreated();
        let result = validator().check_reuse(
            "feature/auth",
            Some(&record),
            BranchObservation::default(),
            &never_taken,
        );
        assert!(!result.is_valid());
        assert_eq!(result.severity, ValidationSeverity::Critical);

        // Recreated outside the tool: record says deleted, git says it exists
        let record = merged_record("feature/auth");
        let observed = BranchObservation { local_exists: true, ..Default::default() };
        let result = validator().check_reuse("feature/auth", Some(&record), observed, &never_taken);
        assert_eq!(result.severity, ValidationSeverity::Critical);
    }

    #[test]
    fn test_aborted_branch_may_be_reused() {
        let mut record = BranchRecord::new("feature/auth");
        record.mark_aborted();
        record.mark_deleted(false);
        for observed in [
            BranchObservation::default(),
            BranchObservation { local_exists: true, ..Default::default() },
        ] {
            let result =
                validator().check_reuse("feature/auth", Some(&record), observed, &never_taken);
            assert!(result.is_valid());
        }
    }

    #[test]
    fn test_existing_unmerged_branch_allows_continued_work() {
        let observed = BranchObservation { local_exists: true, remote_exists: true, merged_into_base: false };
        let result = validator().check_reuse("feature/auth", None, observed, &never_taken);
        assert!(result.is_valid());
        assert_eq!(result.warnings.len(), 1);
    }

    #[test]
    fn test_alternatives_skip_taken_names() {
        let taken = |name: &str| name == "feature/auth-v2";
        let alts = validator().suggest_alternatives("feature/auth", &taken);
        assert!(!alts.contains(&"feature/auth-v2".to_string()));
        assert_eq!(alts[0], "feature/auth-v3");
        assert_eq!(alts.len(), 3);
    }

    #[test]
    fn test_validate_launch_combines_checks() {
        let record = merged_record("feature/auth");
        let result = validator().validate_launch(
            "feature/auth",
            WorkflowType::Launch,
            Some(&record),
            BranchObservation::default(),
            &never_taken,
        );
        assert!(!result.is_valid());
        assert!(!result.suggestions.is_empty());
    }
}
