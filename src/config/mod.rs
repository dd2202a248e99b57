use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::ConfigError;
use crate::paths::Paths;
use crate::sandbox::{BackendKind, LocalLimits, MountMode, MountSpec, MountTable};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Resolved XDG-compliant paths (not serialized)
    #[serde(skip)]
    pub paths: Paths,

    #[serde(default)]
    pub sandbox: SandboxConfig,

    /// Mount table. Empty means the default desktop, documents and
    /// downloads read-only mounts plus the read-write workspace.
    #[serde(default)]
    pub mounts: Vec<MountConfig>,

    #[serde(default)]
    pub audit: AuditConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxConfig {
    /// "container" or "local"
    #[serde(default = "default_backend")]
    pub backend: String,

    #[serde(default = "default_image")]
    pub image: String,

    #[serde(default = "default_container_name")]
    pub container_name: String,

    /// Working directory inside the sandbox; must lie inside a mount
    #[serde(default = "default_working_dir")]
    pub working_dir: String,

    /// What `~` and `$HOME` mean inside the sandbox
    #[serde(default = "default_sandbox_home")]
    pub sandbox_home: String,

    #[serde(default = "default_sandbox_user")]
    pub sandbox_user: String,

    /// Per-command wall-clock budget
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    /// Upper bound on container creation
    #[serde(default = "default_startup_timeout_secs")]
    pub startup_timeout_secs: u64,

    /// Cap per output stream
    #[serde(default = "default_max_output_bytes")]
    pub max_output_bytes: usize,

    #[serde(default = "default_memory")]
    pub memory: String,

    #[serde(default = "default_cpus")]
    pub cpus: String,

    #[serde(default = "default_pids_limit")]
    pub pids_limit: u32,

    /// The only environment variables commands see
    #[serde(default = "default_env")]
    pub env: BTreeMap<String, String>,

    /// Local backend: max file size a command may write (RLIMIT_FSIZE)
    #[serde(default = "default_max_file_size")]
    pub max_file_size_bytes: u64,

    /// Local backend: max open descriptors (RLIMIT_NOFILE)
    #[serde(default = "default_max_open_files")]
    pub max_open_files: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MountConfig {
    /// Host directory; `~` and `$VAR` are expanded
    pub host_path: String,
    pub sandbox_path: String,
    #[serde(default = "default_mount_mode")]
    pub mode: MountMode,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_backend() -> String {
    "container".to_string()
}
fn default_image() -> String {
    "sandshell-sandbox:latest".to_string()
}
fn default_container_name() -> String {
    "sandshell-sandbox".to_string()
}
fn default_working_dir() -> String {
    "/home/user/workspace".to_string()
}
fn default_sandbox_home() -> String {
    "/home/user".to_string()
}
fn default_sandbox_user() -> String {
    "user".to_string()
}
fn default_timeout_secs() -> u64 {
    30
}
fn default_startup_timeout_secs() -> u64 {
    60
}
fn default_max_output_bytes() -> usize {
    1024 * 1024 // 1MB
}
fn default_memory() -> String {
    "512m".to_string()
}
fn default_cpus() -> String {
    "0.5".to_string()
}
fn default_pids_limit() -> u32 {
    256
}
fn default_env() -> BTreeMap<String, String> {
    [
        ("HOME", "/home/user"),
        ("LANG", "C.UTF-8"),
        (
            "PATH",
            "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin",
        ),
        ("USER", "user"),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v.to_string()))
    .collect()
}
fn default_max_file_size() -> u64 {
    50 * 1024 * 1024 // 50MB
}
fn default_max_open_files() -> u64 {
    256
}
fn default_mount_mode() -> MountMode {
    MountMode::ReadOnly
}
fn default_true() -> bool {
    true
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            image: default_image(),
            container_name: default_container_name(),
            working_dir: default_working_dir(),
            sandbox_home: default_sandbox_home(),
            sandbox_user: default_sandbox_user(),
            timeout_secs: default_timeout_secs(),
            startup_timeout_secs: default_startup_timeout_secs(),
            max_output_bytes: default_max_output_bytes(),
            memory: default_memory(),
            cpus: default_cpus(),
            pids_limit: default_pids_limit(),
            env: default_env(),
            max_file_size_bytes: default_max_file_size(),
            max_open_files: default_max_open_files(),
        }
    }
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

impl SandboxConfig {
    pub fn backend_kind(&self) -> Result<BackendKind, ConfigError> {
        match self.backend.trim().to_ascii_lowercase().as_str() {
            "container" | "docker" => Ok(BackendKind::Container),
            "local" => Ok(BackendKind::Local),
            other => Err(ConfigError::UnknownBackend(other.to_string())),
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn startup_timeout(&self) -> Duration {
        Duration::from_secs(self.startup_timeout_secs)
    }

    pub fn local_limits(&self) -> LocalLimits {
        LocalLimits {
            max_file_size_bytes: self.max_file_size_bytes,
            max_open_files: self.max_open_files,
        }
    }

    pub fn env_pairs(&self) -> Vec<(String, String)> {
        self.env
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }
}

impl Config {
    /// Load from the resolved config path, creating the template on first run.
    pub fn load() -> Result<Self> {
        let paths = Paths::resolve()?;
        paths.ensure_dirs()?;
        Self::load_from(paths)
    }

    pub fn load_from(paths: Paths) -> Result<Self> {
        let path = paths.config_file();

        if !path.exists() {
            // Create default config file on first run
            let config = Config {
                paths,
                ..Config::default()
            };
            config.save_with_template()?;
            return Ok(config);
        }

        let content = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        let mut config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config {}", path.display()))?;
        config.paths = paths;
        Ok(config)
    }

    /// Save config with a helpful template (for first-time setup)
    pub fn save_with_template(&self) -> Result<()> {
        let path = self.paths.config_file();

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        fs::write(&path, DEFAULT_CONFIG_TEMPLATE)?;
        eprintln!("Created default config at {}", path.display());

        Ok(())
    }

    pub fn config_path() -> Result<PathBuf> {
        let paths = Paths::resolve()?;
        Ok(paths.config_file())
    }

    /// Host home directory, used to translate `~` in host-side paths.
    pub fn host_home(&self) -> PathBuf {
        etcetera::home_dir().unwrap_or_else(|_| PathBuf::from("/"))
    }

    /// Configured mounts with host paths expanded, or the defaults when none
    /// are configured.
    pub fn mount_specs(&self) -> Result<Vec<MountSpec>, ConfigError> {
        if self.mounts.is_empty() {
            return Ok(default_mounts(&self.paths.workspace, &self.sandbox.sandbox_home));
        }
        self.mounts
            .iter()
            .map(|m| {
                let host = shellexpand::full(&m.host_path).map_err(|e| {
                    ConfigError::PathExpansion {
                        path: m.host_path.clone(),
                        reason: e.to_string(),
                    }
                })?;
                Ok(MountSpec {
                    host_path: PathBuf::from(host.as_ref()),
                    sandbox_path: PathBuf::from(&m.sandbox_path),
                    mode: m.mode,
                })
            })
            .collect()
    }

    /// Build and check the mount table. Any error here is fatal at startup.
    pub fn mount_table(&self) -> Result<MountTable, ConfigError> {
        let table = MountTable::new(self.mount_specs()?)?;
        let working_dir = Path::new(&self.sandbox.working_dir);
        if table.resolve(working_dir).is_none() {
            return Err(ConfigError::WorkingDirOutsideMounts(
                self.sandbox.working_dir.clone(),
            ));
        }
        self.sandbox.backend_kind()?;
        Ok(table)
    }
}

/// Desktop, documents and downloads read-only, plus the workspace read-write.
/// User directories that do not exist on this machine are skipped.
pub fn default_mounts(workspace: &Path, sandbox_home: &str) -> Vec<MountSpec> {
    let home = PathBuf::from(sandbox_home);
    let mut mounts = Vec::new();
    if let Some(dirs) = directories::UserDirs::new() {
        for (dir, name) in [
            (dirs.desktop_dir(), "Desktop"),
            (dirs.document_dir(), "Documents"),
            (dirs.download_dir(), "Downloads"),
        ] {
            if let Some(dir) = dir.filter(|d| d.is_dir()) {
                mounts.push(MountSpec::read_only(dir, home.join(name)));
            }
        }
    }
    mounts.push(MountSpec::read_write(workspace, home.join("workspace")));
    mounts
}

/// Default config template with helpful comments (used for first-time setup)
pub const DEFAULT_CONFIG_TEMPLATE: &str = r#"# sandshell configuration
# Auto-created on first run. Edit as needed.

[sandbox]
# "container" runs commands in a Docker container (recommended).
# "local" runs them directly on the host with no isolation.
backend = "container"
image = "sandshell-sandbox:latest"
container_name = "sandshell-sandbox"
working_dir = "/home/user/workspace"
sandbox_home = "/home/user"
timeout_secs = 30
startup_timeout_secs = 60
max_output_bytes = 1048576            # 1MB per stream
memory = "512m"
cpus = "0.5"
pids_limit = 256

# Environment visible to commands. Nothing else is inherited.
# [sandbox.env]
# PATH = "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin"
# HOME = "/home/user"
# USER = "user"
# LANG = "C.UTF-8"

# Mount table. When no [[mounts]] are given, Desktop, Documents and
# Downloads are mounted read-only and the data-dir workspace read-write.
# Exactly the paths listed here are visible to commands.
#
# [[mounts]]
# host_path = "~/Documents"
# sandbox_path = "/home/user/Documents"
# mode = "ro"
#
# [[mounts]]
# host_path = "$HOME/.local/share/sandshell/workspace"
# sandbox_path = "/home/user/workspace"
# mode = "rw"

[audit]
enabled = true
"#;

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn paths_in(tmp: &TempDir) -> Paths {
        Paths {
            config_dir: tmp.path().join("config"),
            data_dir: tmp.path().join("data"),
            workspace: tmp.path().join("data/workspace"),
            state_dir: tmp.path().join("state"),
        }
    }

    #[test]
    fn template_parses_to_defaults() {
        let config: Config = toml::from_str(DEFAULT_CONFIG_TEMPLATE).unwrap();
        let defaults = SandboxConfig::default();
        assert_eq!(config.sandbox.backend, defaults.backend);
        assert_eq!(config.sandbox.timeout_secs, defaults.timeout_secs);
        assert_eq!(config.sandbox.max_output_bytes, defaults.max_output_bytes);
        assert_eq!(config.sandbox.env, defaults.env);
        assert!(config.mounts.is_empty());
        assert!(config.audit.enabled);
    }

    #[test]
    fn first_load_writes_template() {
        let tmp = TempDir::new().unwrap();
        let paths = paths_in(&tmp);
        let config_file = paths.config_file();

        let config = Config::load_from(paths.clone()).unwrap();
        assert!(config_file.exists());
        assert_eq!(config.sandbox.backend, "container");

        // Second load reads the file back.
        let again = Config::load_from(paths).unwrap();
        assert_eq!(again.sandbox.image, config.sandbox.image);
    }

    #[test]
    fn explicit_mounts_are_expanded() {
        let toml = r#"
            [[mounts]]
            host_path = "~/Documents"
            sandbox_path = "/home/user/Documents"

            [[mounts]]
            host_path = "/srv/ws"
            sandbox_path = "/home/user/workspace"
            mode = "rw"
        "#;
        let config: Config = toml::from_str(toml).unwrap();
        let specs = config.mount_specs().unwrap();
        assert_eq!(specs.len(), 2);
        assert!(specs[0].host_path.is_absolute());
        assert!(specs[0].host_path.ends_with("Documents"));
        assert_eq!(specs[0].mode, MountMode::ReadOnly);
        assert_eq!(specs[1].mode, MountMode::ReadWrite);
        assert!(config.mount_table().is_ok());
    }

    #[test]
    fn default_mounts_include_workspace() {
        let tmp = TempDir::new().unwrap();
        let config = Config {
            paths: paths_in(&tmp),
            ..Config::default()
        };
        let table = config.mount_table().unwrap();
        let workspace = table.workspace().unwrap();
        assert_eq!(workspace.host_path, tmp.path().join("data/workspace"));
        assert_eq!(workspace.sandbox_path, PathBuf::from("/home/user/workspace"));
    }

    #[test]
    fn malformed_mount_tables_are_fatal() {
        let relative = r#"
            [[mounts]]
            host_path = "relative/dir"
            sandbox_path = "/home/user/workspace"
            mode = "rw"
        "#;
        let config: Config = toml::from_str(relative).unwrap();
        assert!(matches!(
            config.mount_table(),
            Err(ConfigError::RelativeMountPath(_))
        ));

        let no_rw = r#"
            [[mounts]]
            host_path = "/srv/docs"
            sandbox_path = "/home/user/Documents"
        "#;
        let config: Config = toml::from_str(no_rw).unwrap();
        assert!(matches!(
            config.mount_table(),
            Err(ConfigError::NoWritableMount)
        ));

        let unset = r#"
            [[mounts]]
            host_path = "$SANDSHELL_TEST_SURELY_UNSET/ws"
            sandbox_path = "/home/user/workspace"
            mode = "rw"
        "#;
        let config: Config = toml::from_str(unset).unwrap();
        assert!(matches!(
            config.mount_table(),
            Err(ConfigError::PathExpansion { .. })
        ));
    }

    #[test]
    fn working_dir_must_be_mounted() {
        let toml = r#"
            [sandbox]
            working_dir = "/opt/app"

            [[mounts]]
            host_path = "/srv/ws"
            sandbox_path = "/home/user/workspace"
            mode = "rw"
        "#;
        let config: Config = toml::from_str(toml).unwrap();
        assert!(matches!(
            config.mount_table(),
            Err(ConfigError::WorkingDirOutsideMounts(_))
        ));
    }

    #[test]
    fn backend_names() {
        let mut sandbox = SandboxConfig::default();
        assert_eq!(sandbox.backend_kind().unwrap(), BackendKind::Container);
        sandbox.backend = "Local".into();
        assert_eq!(sandbox.backend_kind().unwrap(), BackendKind::Local);
        sandbox.backend = "firecracker".into();
        assert!(matches!(
            sandbox.backend_kind(),
            Err(ConfigError::UnknownBackend(_))
        ));
    }
}
