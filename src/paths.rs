//! Where sandshell keeps its files.
//!
//! Three directories, each overridable by an absolute path in the
//! environment and otherwise taken from the platform's base directories
//! (XDG on Linux) through `etcetera`:
//!
//! | dir    | override               | holds                         |
//! |--------|------------------------|-------------------------------|
//! | config | `SANDSHELL_CONFIG_DIR` | `config.toml`                 |
//! | data   | `SANDSHELL_DATA_DIR`   | the default workspace mount   |
//! | state  | `SANDSHELL_STATE_DIR`  | the audit log                 |
//!
//! `SANDSHELL_WORKSPACE` moves the workspace out of the data dir.

use anyhow::{Context, Result};
use etcetera::BaseStrategy;
use std::path::{Path, PathBuf};

use crate::security::audit::audit_file_path;

const APP_DIR: &str = "sandshell";

type EnvLookup<'a> = &'a dyn Fn(&str) -> Option<String>;

#[derive(Debug, Clone)]
pub struct Paths {
    pub config_dir: PathBuf,
    pub data_dir: PathBuf,
    /// Host directory behind the default read-write mount.
    pub workspace: PathBuf,
    pub state_dir: PathBuf,
}

impl Paths {
    pub fn resolve() -> Result<Self> {
        Self::resolve_with_env(&|key| std::env::var(key).ok())
    }

    pub fn resolve_with_env(env: EnvLookup<'_>) -> Result<Self> {
        let base = etcetera::choose_base_strategy()
            .map_err(|e| anyhow::anyhow!("Failed to determine base directories: {e}"))?;

        let config_dir = override_or(env, "SANDSHELL_CONFIG_DIR", || {
            base.config_dir().join(APP_DIR)
        });
        let data_dir = override_or(env, "SANDSHELL_DATA_DIR", || base.data_dir().join(APP_DIR));
        // No separate state dir on some platforms; fall back to data.
        let state_dir = override_or(env, "SANDSHELL_STATE_DIR", || {
            base.state_dir()
                .unwrap_or_else(|| base.data_dir())
                .join(APP_DIR)
        });
        let workspace = override_or(env, "SANDSHELL_WORKSPACE", || data_dir.join("workspace"));

        Ok(Self {
            config_dir,
            data_dir,
            workspace,
            state_dir,
        })
    }

    pub fn config_file(&self) -> PathBuf {
        self.config_dir.join("config.toml")
    }

    pub fn audit_log(&self) -> PathBuf {
        audit_file_path(&self.state_dir)
    }

    /// Create the config, data and state directories, private to the user.
    pub fn ensure_dirs(&self) -> Result<()> {
        for dir in [&self.config_dir, &self.data_dir, &self.state_dir] {
            create_private_dir(dir)?;
        }
        Ok(())
    }
}

impl Default for Paths {
    /// Home-relative XDG layout, for when no base strategy resolves.
    fn default() -> Self {
        Self::resolve().unwrap_or_else(|_| {
            let home = etcetera::home_dir().unwrap_or_else(|_| PathBuf::from("."));
            let data_dir = home.join(".local/share").join(APP_DIR);
            Self {
                config_dir: home.join(".config").join(APP_DIR),
                workspace: data_dir.join("workspace"),
                data_dir,
                state_dir: home.join(".local/state").join(APP_DIR),
            }
        })
    }
}

/// An override counts only when it is a non-empty absolute path; `~` is
/// expanded first.
fn override_or(env: EnvLookup<'_>, var: &str, default: impl FnOnce() -> PathBuf) -> PathBuf {
    env(var)
        .map(|value| PathBuf::from(shellexpand::tilde(value.trim()).into_owned()))
        .filter(|path| path.is_absolute())
        .unwrap_or_else(default)
}

fn create_private_dir(path: &Path) -> Result<()> {
    std::fs::create_dir_all(path)
        .with_context(|| format!("Failed to create directory: {}", path.display()))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o700))
            .with_context(|| format!("Failed to set permissions on {}", path.display()))?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn resolve(vars: &[(&str, &str)]) -> Paths {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Paths::resolve_with_env(&|key| vars.get(key).cloned()).unwrap()
    }

    #[test]
    fn defaults_live_under_app_dir() {
        let paths = resolve(&[]);
        assert!(paths.config_dir.ends_with(APP_DIR));
        assert!(paths.data_dir.ends_with(APP_DIR));
        assert!(paths.state_dir.ends_with(APP_DIR));
        assert_eq!(paths.workspace, paths.data_dir.join("workspace"));
    }

    #[test]
    fn overrides_take_precedence() {
        let paths = resolve(&[
            ("SANDSHELL_CONFIG_DIR", "/custom/config"),
            ("SANDSHELL_DATA_DIR", "/custom/data"),
            ("SANDSHELL_STATE_DIR", "/custom/state"),
        ]);
        assert_eq!(paths.config_file(), PathBuf::from("/custom/config/config.toml"));
        assert_eq!(paths.workspace, PathBuf::from("/custom/data/workspace"));
        assert_eq!(
            paths.audit_log(),
            PathBuf::from("/custom/state/sandshell.audit.jsonl")
        );
    }

    #[test]
    fn relative_and_empty_overrides_are_ignored() {
        let paths = resolve(&[
            ("SANDSHELL_CONFIG_DIR", "relative/path"),
            ("SANDSHELL_STATE_DIR", ""),
        ]);
        assert!(paths.config_dir.is_absolute());
        assert!(paths.state_dir.ends_with(APP_DIR));
    }

    #[test]
    fn workspace_override_is_independent_of_data_dir() {
        let paths = resolve(&[("SANDSHELL_WORKSPACE", "/projects/scratch")]);
        assert_eq!(paths.workspace, PathBuf::from("/projects/scratch"));
        assert!(paths.data_dir.ends_with(APP_DIR));
    }

    #[test]
    fn ensure_dirs_creates_private_directories() {
        let tmp = tempfile::TempDir::new().unwrap();
        let root = tmp.path().display().to_string();
        let paths = resolve(&[
            ("SANDSHELL_CONFIG_DIR", format!("{root}/config").as_str()),
            ("SANDSHELL_DATA_DIR", format!("{root}/data").as_str()),
            ("SANDSHELL_STATE_DIR", format!("{root}/state").as_str()),
        ]);
        paths.ensure_dirs().unwrap();
        assert!(paths.config_dir.is_dir());
        assert!(paths.data_dir.is_dir());

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&paths.state_dir).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o700);
        }
    }
}
