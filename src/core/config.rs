//! Configuration management for shipflow.
//!
//! Handles loading configuration from TOML files and environment overrides.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::validation::BranchRules;

/// Application configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// General settings
    pub general: GeneralConfig,

    /// Branch naming rules
    pub branches: BranchesConfig,

    /// Session lifetime
    pub sessions: SessionsConfig,

    /// Ship behaviour
    pub ship: ShipConfig,

    /// Switch behaviour
    pub switch: SwitchConfig,
}

/// General settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// Branch that only changes through merged pull requests
    pub protected_branch: String,

    /// Remote to push to and sync from
    pub remote: String,

    /// Where sessions are stored (default: `<git dir>/shipflow`)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data_dir: Option<PathBuf>,

    /// Timeout for a single platform request
    pub request_timeout_secs: u64,
}

/// Branch naming rules.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BranchesConfig {
    /// Prefixes allowed for launch and ship
    pub prefixes: Vec<String>,

    /// Prefix required for hotfixes
    pub hotfix_prefix: String,

    /// Longer names are truncated
    pub max_length: usize,
}

/// Session lifetime settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionsConfig {
    /// Days until a session expires
    pub expiry_days: i64,

    /// Days a finished session is kept before cleanup removes it
    pub retention_days: i64,
}

/// Ship settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ShipConfig {
    /// Maximum time to wait for checks
    pub check_timeout_secs: u64,

    /// Delay between check polls
    pub poll_interval_secs: u64,

    /// Rebase onto the protected branch before merging
    pub rebase_before_merge: bool,

    /// Delete the remote branch during cleanup
    pub delete_remote_branch: bool,

    /// Message for the automatic commit; `{branch}` is replaced
    pub commit_message: String,
}

/// Switch settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SwitchConfig {
    /// Delete the origin branch when its session is retired
    pub delete_origin_branch: bool,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            protected_branch: "main".to_string(),
            remote: "origin".to_string(),
            data_dir: None,
            request_timeout_secs: 30,
        }
    }
}

impl Default for BranchesConfig {
    fn default() -> Self {
        let rules = BranchRules::default();
        Self {
            prefixes: rules.prefixes,
            hotfix_prefix: rules.hotfix_prefix,
            max_length: rules.max_length,
        }
    }
}

impl Default for SessionsConfig {
    fn default() -> Self {
        Self { expiry_days: crate::session::DEFAULT_EXPIRY_DAYS, retention_days: 7 }
    }
}

impl Default for ShipConfig {
    fn default() -> Self {
        Self {
            check_timeout_secs: 1800,
            poll_interval_secs: 15,
            rebase_before_merge: false,
            delete_remote_branch: true,
            commit_message: "chore: work in progress on {branch}".to_string(),
        }
    }
}

impl Default for SwitchConfig {
    fn default() -> Self {
        Self { delete_origin_branch: false }
    }
}

impl Config {
    /// Load configuration for the repository at `repo_root`.
    ///
    /// Looks for config in:
    /// 1. `.shipflow.toml` at the repository root
    /// 2. `~/.config/shipflow/config.toml`
    /// 3. Falls back to defaults
    ///
    /// Environment overrides are applied last.
    pub fn load(repo_root: &Path) -> anyhow::Result<Self> {
        let mut config = match Self::find_file(repo_root) {
            Some(path) => Self::load_from_file(&path)?,
            None => Self::default(),
        };
        config.apply_env_overrides();
        Ok(config)
    }

    /// The file `load` would read, if any.
    pub fn find_file(repo_root: &Path) -> Option<PathBuf> {
        let local = repo_root.join(".shipflow.toml");
        if local.exists() {
            return Some(local);
        }
        Self::config_dir().map(|d| d.join("config.toml")).filter(|p| p.exists())
    }

    /// Load configuration from a specific file.
    pub fn load_from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)
            .map_err(|e| anyhow::anyhow!("Invalid config {}: {e}", path.display()))?;
        Ok(config)
    }

    /// Apply `SHIPFLOW_*` environment variables.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(branch) = std::env::var("SHIPFLOW_PROTECTED_BRANCH") {
            if !branch.is_empty() {
                self.general.protected_branch = branch;
            }
        }
        if let Ok(remote) = std::env::var("SHIPFLOW_REMOTE") {
            if !remote.is_empty() {
                self.general.remote = remote;
            }
        }
        if let Some(dir) = std::env::var_os("SHIPFLOW_DATA_DIR") {
            if !dir.is_empty() {
                self.general.data_dir = Some(PathBuf::from(dir));
            }
        }
    }

    /// Get the global config directory path.
    pub fn config_dir() -> Option<PathBuf> {
        dirs::config_dir().map(|d| d.join("shipflow"))
    }

    /// Session storage directory for a repository whose git dir is `git_dir`.
    pub fn data_dir(&self, git_dir: &Path) -> PathBuf {
        self.general.data_dir.clone().unwrap_or_else(|| git_dir.join("shipflow"))
    }

    /// Branch validator rules.
    pub fn branch_rules(&self) -> BranchRules {
        BranchRules {
            prefixes: self.branches.prefixes.clone(),
            hotfix_prefix: self.branches.hotfix_prefix.clone(),
            max_length: self.branches.max_length,
            protected_branch: self.general.protected_branch.clone(),
        }
    }

    pub fn check_timeout(&self) -> Duration {
        Duration::from_secs(self.ship.check_timeout_secs)
    }

    /// Delay between check polls, never below one second.
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.ship.poll_interval_secs.max(1))
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.general.request_timeout_secs)
    }

    /// Commit message for automatic commits on `branch`.
    pub fn commit_message(&self, branch: &str) -> String {
        self.ship.commit_message.replace("{branch}", branch)
    }

    /// Effective configuration as TOML.
    pub fn to_toml(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use tempfile::tempdir;

    fn clear_env() {
        for key in ["SHIPFLOW_PROTECTED_BRANCH", "SHIPFLOW_REMOTE", "SHIPFLOW_DATA_DIR"] {
            std::env::remove_var(key);
        }
    }

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.general.protected_branch, "main");
        assert_eq!(config.general.remote, "origin");
        assert_eq!(config.sessions.expiry_days, 30);
        assert_eq!(config.sessions.retention_days, 7);
        assert_eq!(config.branches.max_length, 50);
        assert!(config.branches.prefixes.contains(&"feature".to_string()));
    }

    #[test]
    fn test_config_serialization() {
        let toml_str = Config::default().to_toml().unwrap();
        assert!(toml_str.contains("[general]"));
        assert!(toml_str.contains("[ship]"));
        assert!(!toml_str.contains("data_dir"));
    }

    #[test]
    fn test_partial_config_keeps_defaults() {
        let toml_str = r#"
            [general]
            protected_branch = "trunk"

            [ship]
            rebase_before_merge = true
        "#;

        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.general.protected_branch, "trunk");
        assert_eq!(config.general.remote, "origin");
        assert!(config.ship.rebase_before_merge);
        assert_eq!(config.ship.check_timeout_secs, 1800);
        assert_eq!(config.branch_rules().protected_branch, "trunk");
    }

    #[test]
    fn test_zero_poll_interval_is_clamped() {
        let config: Config = toml::from_str("[ship]\npoll_interval_secs = 0\n").unwrap();
        assert_eq!(config.poll_interval(), Duration::from_secs(1));
        assert_eq!(Config::default().poll_interval(), Duration::from_secs(15));
    }

    #[test]
    #[serial]
    fn test_local_file_and_env_overrides() {
        clear_env();
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join(".shipflow.toml"), "[general]\nremote = \"upstream\"\n")
            .unwrap();

        let config = Config::load(dir.path()).unwrap();
        assert_eq!(config.general.remote, "upstream");

        std::env::set_var("SHIPFLOW_REMOTE", "fork");
        std::env::set_var("SHIPFLOW_DATA_DIR", "/tmp/shipflow-data");
        let config = Config::load(dir.path()).unwrap();
        clear_env();

        assert_eq!(config.general.remote, "fork");
        assert_eq!(config.data_dir(Path::new("/repo/.git")), PathBuf::from("/tmp/shipflow-data"));
    }

    #[test]
    #[serial]
    fn test_invalid_file_is_an_error() {
        clear_env();
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join(".shipflow.toml"), "[general\n").unwrap();
        assert!(Config::load(dir.path()).is_err());
    }

    #[test]
    fn test_data_dir_defaults_under_git_dir() {
        let config = Config::default();
        assert_eq!(
            config.data_dir(Path::new("/repo/.git")),
            PathBuf::from("/repo/.git/shipflow")
        );
        assert_eq!(config.commit_message("feature/a"), "chore: work in progress on feature/a");
    }
}
