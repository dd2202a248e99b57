//! Container runtime seam.
//!
//! [`ContainerRuntime`] is the narrow interface the executor needs from a
//! container daemon. [`DockerCli`] implements it by driving the `docker`
//! binary through `tokio::process`; tests substitute mocks and fakes.

use async_trait::async_trait;
use std::path::PathBuf;
use std::process::{Output, Stdio};
use std::time::Duration;
use tracing::{debug, warn};

use super::mounts::MountSpec;
use crate::error::SandboxError;

/// How long a health probe may take before the container counts as unhealthy.
const HEALTH_PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Exit code `docker exec` uses when the CLI or daemon itself failed.
const DOCKER_EXEC_FAILED: i32 = 125;

/// Daemon messages meaning the exec never reached a running container.
const EXEC_REFUSED_MARKERS: &[&str] = &[
    "Error response from daemon",
    "No such container",
    "is not running",
    "Cannot connect to the Docker daemon",
];

/// Everything needed to create the long-lived sandbox container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    pub working_dir: PathBuf,
    pub mounts: Vec<MountSpec>,
    /// Docker memory limit (`512m`).
    pub memory: String,
    /// Docker CPU limit (`0.5`).
    pub cpus: String,
    pub pids_limit: u32,
}

impl ContainerSpec {
    /// Arguments for `docker run`, starting with `run`.
    pub fn to_run_args(&self) -> Vec<String> {
        let mut args = vec![
            "run".to_string(),
            "--detach".to_string(),
            format!("--name={}", self.name),
            "--label=sandshell.managed=true".to_string(),
            "--network=none".to_string(),
            format!("--memory={}", self.memory),
            format!("--cpus={}", self.cpus),
            format!("--pids-limit={}", self.pids_limit),
            "--security-opt=no-new-privileges".to_string(),
            "--cap-drop=ALL".to_string(),
            "--tmpfs=/tmp:rw,nosuid,nodev,size=64m".to_string(),
            format!("--workdir={}", self.working_dir.display()),
        ];
        args.extend(self.mounts.iter().map(MountSpec::to_docker_arg));
        args.push(self.image.clone());
        args.extend(["sleep".to_string(), "infinity".to_string()]);
        args
    }
}

/// One command to run inside an existing container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecRequest {
    pub command: String,
    pub working_dir: PathBuf,
    pub env: Vec<(String, String)>,
    /// Budget enforced inside the container with `timeout -s KILL`.
    pub timeout: Duration,
}

impl ExecRequest {
    /// Arguments for `docker exec`, starting with `exec`.
    pub fn to_exec_args(&self, container: &str) -> Vec<String> {
        let mut args = vec![
            "exec".to_string(),
            format!("--workdir={}", self.working_dir.display()),
        ];
        for (key, value) in &self.env {
            if is_valid_env_name(key) {
                args.push("--env".to_string());
                args.push(format!("{key}={value}"));
            } else {
                warn!(key = %key, "Skipping invalid environment variable name");
            }
        }
        // One second of grace so the client-side timeout normally fires first.
        let secs = self.timeout.as_secs_f64().ceil() as u64 + 1;
        args.extend([
            container.to_string(),
            "timeout".to_string(),
            "-s".to_string(),
            "KILL".to_string(),
            secs.to_string(),
            "bash".to_string(),
            "-c".to_string(),
            self.command.clone(),
        ]);
        args
    }
}

/// Raw result of an exec call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecOutput {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub exit_code: i32,
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Check that the daemon is reachable.
    async fn ping(&self) -> Result<(), SandboxError>;

    /// Force-remove a container by name. Succeeds if it does not exist.
    async fn remove(&self, name: &str) -> Result<(), SandboxError>;

    /// Create and start a detached container, returning its id.
    async fn run(&self, spec: &ContainerSpec) -> Result<String, SandboxError>;

    /// Run a command in a running container.
    async fn exec(&self, container: &str, request: &ExecRequest)
    -> Result<ExecOutput, SandboxError>;

    /// Whether the container is running and answers a trivial exec.
    async fn health_check(&self, container: &str) -> bool;
}

/// [`ContainerRuntime`] backed by the `docker` CLI.
#[derive(Debug, Clone)]
pub struct DockerCli {
    binary: String,
}

impl Default for DockerCli {
    fn default() -> Self {
        Self::new()
    }
}

impl DockerCli {
    pub fn new() -> Self {
        Self {
            binary: "docker".to_string(),
        }
    }

    /// Use a different client binary (`podman` speaks the same CLI).
    pub fn with_binary(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    async fn docker(&self, args: &[String]) -> Result<Output, SandboxError> {
        debug!(binary = %self.binary, args = ?args, "Invoking container CLI");
        tokio::process::Command::new(&self.binary)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| {
                if e.kind() == std::io::ErrorKind::NotFound {
                    SandboxError::BackendUnavailable(format!(
                        "'{}' not found on PATH; install Docker or set [sandbox] backend = \"local\"",
                        self.binary
                    ))
                } else {
                    SandboxError::Io(e)
                }
            })
    }
}

fn stderr_text(output: &Output) -> String {
    String::from_utf8_lossy(&output.stderr).trim().to_string()
}

#[async_trait]
impl ContainerRuntime for DockerCli {
    async fn ping(&self) -> Result<(), SandboxError> {
        let output = self
            .docker(&[
                "info".to_string(),
                "--format".to_string(),
                "{{.ServerVersion}}".to_string(),
            ])
            .await?;
        if output.status.success() {
            Ok(())
        } else {
            Err(SandboxError::BackendUnavailable(format!(
                "container daemon unreachable ({}); is Docker running?",
                stderr_text(&output)
            )))
        }
    }

    async fn remove(&self, name: &str) -> Result<(), SandboxError> {
        let output = self
            .docker(&["rm".to_string(), "--force".to_string(), name.to_string()])
            .await?;
        let stderr = stderr_text(&output);
        if output.status.success() || stderr.contains("No such container") {
            Ok(())
        } else {
            Err(SandboxError::BackendUnavailable(format!(
                "failed to remove container {name}: {stderr}"
            )))
        }
    }

    async fn run(&self, spec: &ContainerSpec) -> Result<String, SandboxError> {
        let output = self.docker(&spec.to_run_args()).await?;
        if !output.status.success() {
            return Err(SandboxError::BackendUnavailable(format!(
                "failed to start container from image {}: {}",
                spec.image,
                stderr_text(&output)
            )));
        }
        let id = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if id.is_empty() {
            return Err(SandboxError::BackendUnavailable(
                "container runtime returned no container id".to_string(),
            ));
        }
        Ok(id)
    }

    async fn exec(
        &self,
        container: &str,
        request: &ExecRequest,
    ) -> Result<ExecOutput, SandboxError> {
        let output = self.docker(&request.to_exec_args(container)).await?;
        if let Some(reason) = exec_refused(&output) {
            return Err(SandboxError::Exec(reason));
        }
        Ok(ExecOutput {
            exit_code: output.status.code().unwrap_or(-1),
            stdout: output.stdout,
            stderr: output.stderr,
        })
    }

    async fn health_check(&self, container: &str) -> bool {
        let probe = async {
            let inspect = self
                .docker(&[
                    "inspect".to_string(),
                    "--format".to_string(),
                    "{{.State.Running}}".to_string(),
                    container.to_string(),
                ])
                .await
                .ok()?;
            if String::from_utf8_lossy(&inspect.stdout).trim() != "true" {
                return Some(false);
            }
            let exec = self
                .docker(&["exec".to_string(), container.to_string(), "true".to_string()])
                .await
                .ok()?;
            Some(exec.status.success())
        };
        matches!(
            tokio::time::timeout(HEALTH_PROBE_TIMEOUT, probe).await,
            Ok(Some(true))
        )
    }
}

/// The daemon's reason when `docker exec` failed before running anything.
/// Exit codes from the command itself, 125 included, carry no daemon text.
fn exec_refused(output: &Output) -> Option<String> {
    if output.status.code() != Some(DOCKER_EXEC_FAILED) {
        return None;
    }
    let stderr = stderr_text(output);
    EXEC_REFUSED_MARKERS
        .iter()
        .any(|marker| stderr.contains(marker))
        .then_some(stderr)
}

/// Validate environment variable name
pub fn is_valid_env_name(name: &str) -> bool {
    !name.is_empty()
        && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
        && !name.chars().next().unwrap_or('0').is_ascii_digit()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec() -> ContainerSpec {
        ContainerSpec {
            name: "sandshell-sandbox".into(),
            image: "sandshell-sandbox:latest".into(),
            working_dir: "/home/user/workspace".into(),
            mounts: vec![
                MountSpec::read_only("/Users/alice/Documents", "/home/user/Documents"),
                MountSpec::read_write("/Users/alice/ws", "/home/user/workspace"),
            ],
            memory: "512m".into(),
            cpus: "0.5".into(),
            pids_limit: 128,
        }
    }

    #[test]
    fn run_args_isolate_the_container() {
        let args = spec().to_run_args();
        assert_eq!(args[0], "run");
        for expected in [
            "--network=none",
            "--cap-drop=ALL",
            "--security-opt=no-new-privileges",
            "--memory=512m",
            "--cpus=0.5",
            "--pids-limit=128",
            "--workdir=/home/user/workspace",
        ] {
            assert!(args.iter().any(|a| a == expected), "missing {expected}");
        }
        assert!(args.contains(
            &"--mount=type=bind,source=/Users/alice/Documents,target=/home/user/Documents,readonly"
                .to_string()
        ));
        assert!(args.contains(
            &"--mount=type=bind,source=/Users/alice/ws,target=/home/user/workspace".to_string()
        ));
        assert_eq!(&args[args.len() - 3..], ["sandshell-sandbox:latest", "sleep", "infinity"]);
    }

    #[test]
    fn exec_args_wrap_command_in_kill_timeout() {
        let request = ExecRequest {
            command: "ls -la | wc -l".into(),
            working_dir: "/home/user/workspace".into(),
            env: vec![
                ("PATH".into(), "/usr/bin:/bin".into()),
                ("BAD NAME".into(), "x".into()),
            ],
            timeout: Duration::from_millis(1500),
        };
        let args = request.to_exec_args("abc123");
        assert_eq!(
            args,
            vec![
                "exec",
                "--workdir=/home/user/workspace",
                "--env",
                "PATH=/usr/bin:/bin",
                "abc123",
                "timeout",
                "-s",
                "KILL",
                "3",
                "bash",
                "-c",
                "ls -la | wc -l",
            ]
        );
    }

    #[test]
    fn env_names() {
        assert!(is_valid_env_name("LANG"));
        assert!(is_valid_env_name("_X1"));
        assert!(!is_valid_env_name("1X"));
        assert!(!is_valid_env_name("A-B"));
        assert!(!is_valid_env_name(""));
    }

    #[cfg(unix)]
    fn output(code: i32, stderr: &str) -> Output {
        use std::os::unix::process::ExitStatusExt;
        Output {
            status: std::process::ExitStatus::from_raw(code << 8),
            stdout: Vec::new(),
            stderr: stderr.as_bytes().to_vec(),
        }
    }

    #[cfg(unix)]
    #[test]
    fn daemon_refusal_is_distinguished_from_command_failure() {
        let refused = output(
            125,
            "Error response from daemon: No such container: sandshell-sandbox\n",
        );
        assert_eq!(
            exec_refused(&refused).as_deref(),
            Some("Error response from daemon: No such container: sandshell-sandbox")
        );

        assert!(exec_refused(&output(125, "timeout: failed to run command")).is_none());
        assert!(exec_refused(&output(127, "bash: nope: command not found")).is_none());
        assert!(exec_refused(&output(1, "Error response from daemon")).is_none());
    }

    #[tokio::test]
    async fn missing_binary_is_backend_unavailable() {
        let cli = DockerCli::with_binary("sandshell-test-no-such-binary");
        let err = cli.ping().await.unwrap_err();
        assert!(matches!(err, SandboxError::BackendUnavailable(_)));
        assert!(!cli.health_check("anything").await);
    }
}
