//! Sandbox module — isolated execution of validated commands.
//!
//! Commands run inside one long-lived container whose bind mounts mirror the
//! [`MountTable`] exactly, read-only mounts included. A host [`LocalExecutor`]
//! exists for machines without a container runtime and is only used when
//! configured explicitly.

pub mod executor;
pub mod local;
pub mod mounts;
pub mod runtime;

pub use executor::{
    BackendKind, BackendStatus, ContainerExecutor, ContainerHandle, ContainerState,
    ExecutionOutcome, SandboxBackend,
};
pub use local::{LocalExecutor, LocalLimits};
pub use mounts::{MountMode, MountSpec, MountTable};
pub use runtime::{ContainerRuntime, ContainerSpec, DockerCli, ExecOutput, ExecRequest};
