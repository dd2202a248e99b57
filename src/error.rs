//! Error types for sandshell.
//!
//! Library errors are `thiserror` enums; the CLI wraps them in `anyhow`.
//! Only [`ConfigError`] is fatal to the process. Everything raised while
//! serving a request is converted into a structured outcome by the pipeline.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

/// Malformed configuration detected at startup.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("mount table is empty")]
    EmptyMountTable,

    #[error("mount path must be absolute: {0}")]
    RelativeMountPath(String),

    #[error("mount path {0} contains ',', '\"' or a newline, which a bind mount cannot express")]
    UnbindableMountPath(String),

    #[error("mount {0} cannot claim the sandbox root")]
    RootMount(String),

    #[error("overlapping mounts: {first} and {second} claim the same sandbox prefix")]
    OverlappingMounts { first: String, second: String },

    #[error("mounts {first} and {second} share the directory alias '{alias}'")]
    DuplicateAlias {
        alias: String,
        first: String,
        second: String,
    },

    #[error("cannot expand mount path {path}: {reason}")]
    PathExpansion { path: String, reason: String },

    #[error("no read-write mount configured; one workspace mount is required")]
    NoWritableMount,

    #[error("sandbox working directory {0} is not inside any mount")]
    WorkingDirOutsideMounts(String),

    #[error("unknown sandbox backend '{0}' (expected \"container\" or \"local\")")]
    UnknownBackend(String),
}

/// Failures of the isolated-execution resource.
#[derive(Debug, Error)]
pub enum SandboxError {
    /// The runtime daemon is unreachable or the resource could not be created.
    #[error("sandbox backend unavailable: {0}")]
    BackendUnavailable(String),

    /// The resource exists but an exec call against it failed.
    #[error("sandbox exec failed: {0}")]
    Exec(String),

    #[error("sandbox I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Failure to append to the audit log. Never fatal to a request.
#[derive(Debug, Error)]
pub enum AuditError {
    #[error("failed to write audit log {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to serialize audit record: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Error taxonomy surfaced to callers alongside a pipeline result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Command denied by policy; never retried.
    ValidationBlocked,
    /// Command exceeded its wall-clock budget and was killed.
    ExecutionTimeout,
    /// The isolated-execution resource could not be created or reached.
    BackendUnavailable,
    /// The audit record could not be persisted.
    AuditWriteFailure,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_kind_serializes_snake_case() {
        let json = serde_json::to_string(&ErrorKind::BackendUnavailable).unwrap();
        assert_eq!(json, "\"backend_unavailable\"");
    }

    #[test]
    fn overlapping_mounts_message_names_both() {
        let err = ConfigError::OverlappingMounts {
            first: "/home/user/Documents".into(),
            second: "/home/user/Documents/work".into(),
        };
        let msg = err.to_string();
        assert!(msg.contains("/home/user/Documents"));
        assert!(msg.contains("/home/user/Documents/work"));
    }
}
