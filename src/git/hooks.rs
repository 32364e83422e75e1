//! Git hook inspection and the protected-branch guard.
//!
//! Ship pre-flight warns when the repository has no pre-commit or pre-push
//! hook. `shipflow hooks install` writes a pre-push hook that refuses direct
//! pushes to the protected branch.

use std::fs;
#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

/// Hooks whose absence ship pre-flight reports.
pub const CHECKED_HOOKS: &[&str] = &["pre-commit", "pre-push"];

const GUARD_MARKER: &str = "# Managed by shipflow";

/// Status of one hook file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HookInfo {
    pub name: String,
    pub path: PathBuf,
    pub is_executable: bool,
    pub is_managed: bool,
}

/// Reads and writes `<git dir>/hooks`.
#[derive(Debug, Clone)]
pub struct HooksInspector {
    hooks_dir: PathBuf,
}

impl HooksInspector {
    /// Inspector for the repository whose common git dir is `git_dir`.
    pub fn new(git_dir: impl AsRef<Path>) -> Self {
        Self { hooks_dir: git_dir.as_ref().join("hooks") }
    }

    pub fn hooks_dir(&self) -> &Path {
        &self.hooks_dir
    }

    /// Details for `name`, if a hook file exists.
    pub fn hook(&self, name: &str) -> Option<HookInfo> {
        let path = self.hooks_dir.join(name);
        if !path.is_file() {
            return None;
        }
        let is_managed = fs::read_to_string(&path).is_ok_and(|c| c.contains(GUARD_MARKER));
        Some(HookInfo { name: name.to_string(), is_executable: is_executable(&path), path, is_managed })
    }

    /// Whether `name` exists and git would run it.
    pub fn is_active(&self, name: &str) -> bool {
        self.hook(name).is_some_and(|h| h.is_executable)
    }

    /// Checked hooks that are missing or not executable.
    pub fn missing(&self) -> Vec<&'static str> {
        CHECKED_HOOKS.iter().copied().filter(|name| !self.is_active(name)).collect()
    }

    /// Install the pre-push guard for `protected_branch`.
    ///
    /// Refuses to replace a hook it did not write unless `force` is set.
    pub fn install_guard(&self, protected_branch: &str, force: bool) -> Result<PathBuf> {
        let path = self.hooks_dir.join("pre-push");
        if let Some(existing) = self.hook("pre-push") {
            if !existing.is_managed && !force {
                anyhow::bail!(
                    "Hook 'pre-push' already exists and is not managed by shipflow. Use --force to overwrite."
                );
            }
        }

        fs::create_dir_all(&self.hooks_dir).context("Failed to create hooks directory")?;
        fs::write(&path, guard_script(protected_branch)).context("Failed to write hook file")?;
        make_executable(&path)?;
        tracing::info!(path = %path.display(), "installed pre-push guard");
        Ok(path)
    }

    /// Remove the guard. Hooks not written by shipflow are left alone.
    pub fn uninstall_guard(&self) -> Result<bool> {
        match self.hook("pre-push") {
            Some(hook) if hook.is_managed => {
                fs::remove_file(&hook.path).context("Failed to remove hook file")?;
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

fn guard_script(protected_branch: &str) -> String {
    format!(
        r#"#!/bin/sh
{GUARD_MARKER} - do not edit manually
# Blocks direct pushes to {protected_branch}. Merge through a pull request instead.

if [ "$SHIPFLOW_ALLOW_PROTECTED_PUSH" = "1" ]; then
    exit 0
fi

while read local_ref local_sha remote_ref remote_sha; do
    if [ "$remote_ref" = "refs/heads/{protected_branch}" ]; then
        echo "shipflow: direct push to {protected_branch} is blocked; use 'shipflow ship'" >&2
        exit 1
    fi
done

exit 0
"#
    )
}

fn is_executable(path: &Path) -> bool {
    #[cfg(unix)]
    {
        fs::metadata(path).map(|m| m.permissions().mode() & 0o111 != 0).unwrap_or(false)
    }
    #[cfg(not(unix))]
    {
        path.exists()
    }
}

fn make_executable(path: &Path) -> Result<()> {
    #[cfg(unix)]
    {
        let mut perms = fs::metadata(path)?.permissions();
        perms.set_mode(perms.mode() | 0o755);
        fs::set_permissions(path, perms)?;
    }
    #[cfg(not(unix))]
    let _ = path;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn setup() -> (TempDir, HooksInspector) {
        let temp = TempDir::new().unwrap();
        let git_dir = temp.path().join(".git");
        fs::create_dir_all(git_dir.join("hooks")).unwrap();
        let inspector = HooksInspector::new(&git_dir);
        (temp, inspector)
    }

    #[test]
    fn test_missing_hooks_reported() {
        let (_temp, inspector) = setup();
        assert_eq!(inspector.missing(), vec!["pre-commit", "pre-push"]);
    }

    #[test]
    fn test_install_guard() {
        let (_temp, inspector) = setup();
        let path = inspector.install_guard("main", false).unwrap();

        let content = fs::read_to_string(&path).unwrap();
        assert!(content.contains("refs/heads/main"));

        let hook = inspector.hook("pre-push").unwrap();
        assert!(hook.is_managed);
        assert!(hook.is_executable);
        assert_eq!(inspector.missing(), vec!["pre-commit"]);

        // Reinstalling our own hook needs no force
        inspector.install_guard("trunk", false).unwrap();
        assert!(inspector.uninstall_guard().unwrap());
        assert!(inspector.hook("pre-push").is_none());
    }

    #[test]
    fn test_foreign_hook_needs_force() {
        let (_temp, inspector) = setup();
        let path = inspector.hooks_dir().join("pre-push");
        fs::write(&path, "#!/bin/sh\necho external\n").unwrap();

        assert!(inspector.install_guard("main", false).is_err());
        assert!(!inspector.uninstall_guard().unwrap());

        inspector.install_guard("main", true).unwrap();
        assert!(inspector.hook("pre-push").unwrap().is_managed);
    }
}
