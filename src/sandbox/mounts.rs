//! The mount table: host directories bound into the sandbox.
//!
//! Built once at startup from configuration and never mutated. The same
//! table drives path translation, validator containment checks, and the
//! container's bind mounts, so read-only mounts are enforced both by policy
//! and by the container runtime.

use serde::{Deserialize, Serialize};
use std::path::{Component, Path, PathBuf};

use crate::error::ConfigError;

/// Access mode of a mount.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MountMode {
    #[serde(alias = "ro")]
    ReadOnly,
    #[serde(alias = "rw")]
    ReadWrite,
}

impl MountMode {
    pub fn is_read_only(self) -> bool {
        self == MountMode::ReadOnly
    }
}

/// One host directory bound at a sandbox path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MountSpec {
    pub host_path: PathBuf,
    pub sandbox_path: PathBuf,
    pub mode: MountMode,
}

impl MountSpec {
    pub fn read_only(host: impl Into<PathBuf>, sandbox: impl Into<PathBuf>) -> Self {
        Self {
            host_path: host.into(),
            sandbox_path: sandbox.into(),
            mode: MountMode::ReadOnly,
        }
    }

    pub fn read_write(host: impl Into<PathBuf>, sandbox: impl Into<PathBuf>) -> Self {
        Self {
            host_path: host.into(),
            sandbox_path: sandbox.into(),
            mode: MountMode::ReadWrite,
        }
    }

    /// Docker `--mount` argument for this binding.
    pub fn to_docker_arg(&self) -> String {
        let ro = if self.mode.is_read_only() {
            ",readonly"
        } else {
            ""
        };
        format!(
            "--mount=type=bind,source={},target={}{}",
            self.host_path.display(),
            self.sandbox_path.display(),
            ro
        )
    }

    /// Map a sandbox path under this mount to its host location.
    pub fn sandbox_to_host(&self, sandbox: &Path) -> Option<PathBuf> {
        sandbox
            .strip_prefix(&self.sandbox_path)
            .ok()
            .map(|rest| join_rest(&self.host_path, rest))
    }

    /// Last component of the sandbox path (`Documents` for `/home/user/Documents`).
    pub fn alias(&self) -> Option<&str> {
        self.sandbox_path.file_name().and_then(|n| n.to_str())
    }
}

fn join_rest(base: &Path, rest: &Path) -> PathBuf {
    if rest.as_os_str().is_empty() {
        base.to_path_buf()
    } else {
        base.join(rest)
    }
}

/// Validated, immutable set of mounts.
#[derive(Debug, Clone)]
pub struct MountTable {
    mounts: Vec<MountSpec>,
}

impl MountTable {
    /// Validate and build the table.
    ///
    /// Rejects empty tables, relative or root paths, paths `--mount` cannot
    /// express, overlapping sandbox prefixes, and tables without a
    /// read-write mount.
    pub fn new(mounts: Vec<MountSpec>) -> Result<Self, ConfigError> {
        if mounts.is_empty() {
            return Err(ConfigError::EmptyMountTable);
        }

        let mut normalized = Vec::with_capacity(mounts.len());
        for mount in mounts {
            for path in [&mount.host_path, &mount.sandbox_path] {
                if !path.is_absolute() {
                    return Err(ConfigError::RelativeMountPath(path.display().to_string()));
                }
                // `--mount` takes a CSV list of key=value fields.
                if path.to_string_lossy().contains([',', '"', '\n']) {
                    return Err(ConfigError::UnbindableMountPath(path.display().to_string()));
                }
            }
            let sandbox_path = normalize_lexical(&mount.sandbox_path);
            if sandbox_path.parent().is_none() {
                return Err(ConfigError::RootMount(
                    mount.sandbox_path.display().to_string(),
                ));
            }
            normalized.push(MountSpec {
                host_path: normalize_lexical(&mount.host_path),
                sandbox_path,
                mode: mount.mode,
            });
        }

        for (i, a) in normalized.iter().enumerate() {
            for b in &normalized[i + 1..] {
                if a.sandbox_path.starts_with(&b.sandbox_path)
                    || b.sandbox_path.starts_with(&a.sandbox_path)
                {
                    return Err(ConfigError::OverlappingMounts {
                        first: a.sandbox_path.display().to_string(),
                        second: b.sandbox_path.display().to_string(),
                    });
                }
                if let Some(alias) = a.alias()
                    && b.alias() == Some(alias)
                {
                    return Err(ConfigError::DuplicateAlias {
                        alias: alias.to_string(),
                        first: a.sandbox_path.display().to_string(),
                        second: b.sandbox_path.display().to_string(),
                    });
                }
            }
        }

        if !normalized.iter().any(|m| m.mode == MountMode::ReadWrite) {
            return Err(ConfigError::NoWritableMount);
        }

        Ok(Self { mounts: normalized })
    }

    pub fn iter(&self) -> impl Iterator<Item = &MountSpec> {
        self.mounts.iter()
    }

    pub fn len(&self) -> usize {
        self.mounts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.mounts.is_empty()
    }

    /// The first read-write mount (the workspace).
    pub fn workspace(&self) -> Option<&MountSpec> {
        self.mounts.iter().find(|m| m.mode == MountMode::ReadWrite)
    }

    /// Mount claiming a sandbox path, after lexical canonicalization.
    pub fn resolve(&self, sandbox_path: &Path) -> Option<&MountSpec> {
        let normalized = normalize_lexical(sandbox_path);
        self.mounts
            .iter()
            .find(|m| normalized.starts_with(&m.sandbox_path))
    }

    /// Mount addressed by a directory alias such as `Documents`.
    pub fn by_alias(&self, alias: &str) -> Option<&MountSpec> {
        self.mounts.iter().find(|m| m.alias() == Some(alias))
    }

    /// Whether deleting `sandbox_path` would take at least one mount root with it.
    pub fn is_ancestor_of_mount(&self, sandbox_path: &Path) -> bool {
        let normalized = normalize_lexical(sandbox_path);
        self.mounts
            .iter()
            .any(|m| m.sandbox_path.starts_with(&normalized))
    }
}

/// Resolve `.` and `..` components without touching the filesystem.
///
/// `..` at the root stays at the root. Symlinks are not followed; the bind
/// mounts themselves bound what a symlink inside a mount can reach.
pub fn normalize_lexical(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Prefix(prefix) => out.push(prefix.as_os_str()),
            Component::RootDir => out.push(Component::RootDir.as_os_str()),
            Component::CurDir => {}
            Component::ParentDir => {
                let at_root = out.has_root() && out.parent().is_none();
                let relative_escape = out.as_os_str().is_empty()
                    || matches!(out.components().next_back(), Some(Component::ParentDir));
                if at_root {
                    continue;
                } else if relative_escape {
                    out.push("..");
                } else {
                    out.pop();
                }
            }
            Component::Normal(part) => out.push(part),
        }
    }
    out
}

/// Three read-only user directories plus a workspace, as shipped by default.
#[cfg(test)]
pub(crate) fn test_table() -> MountTable {
    MountTable::new(vec![
        MountSpec::read_only("/Users/alice/Desktop", "/home/user/Desktop"),
        MountSpec::read_only("/Users/alice/Documents", "/home/user/Documents"),
        MountSpec::read_only("/Users/alice/Downloads", "/home/user/Downloads"),
        MountSpec::read_write("/Users/alice/.sandshell/workspace", "/home/user/workspace"),
    ])
    .unwrap()
}
