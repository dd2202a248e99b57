//! Host execution backend.
//!
//! Runs the validated command directly on the host after translating sandbox
//! paths back to host paths. There is no mount isolation here; only the
//! validator, a scrubbed environment and resource limits stand between the
//! command and the user's files. Only selected by explicit configuration.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use super::executor::{BackendKind, ExecutionOutcome};
use super::runtime::ExecOutput;
use crate::error::SandboxError;
use crate::shell::{Direction, PathTranslator};

/// Resource limits applied to each host process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LocalLimits {
    pub max_file_size_bytes: u64,
    pub max_open_files: u64,
}

impl Default for LocalLimits {
    fn default() -> Self {
        Self {
            max_file_size_bytes: 50 * 1024 * 1024,
            max_open_files: 256,
        }
    }
}

pub struct LocalExecutor {
    translator: PathTranslator,
    working_dir: PathBuf,
    env: Vec<(String, String)>,
    limits: LocalLimits,
    max_output_bytes: usize,
}

impl LocalExecutor {
    pub fn new(
        translator: PathTranslator,
        working_dir: impl Into<PathBuf>,
        env: Vec<(String, String)>,
        limits: LocalLimits,
        max_output_bytes: usize,
    ) -> Self {
        let working_dir = working_dir.into();
        warn!(
            working_dir = %working_dir.display(),
            "Local backend selected: commands run on the host without container isolation"
        );
        Self {
            translator,
            working_dir,
            env,
            limits,
            max_output_bytes,
        }
    }

    pub fn working_dir(&self) -> &Path {
        &self.working_dir
    }

    pub async fn execute(
        &self,
        command: &str,
        timeout: Duration,
    ) -> Result<ExecutionOutcome, SandboxError> {
        let host_command = self.translator.translate(command, Direction::SandboxToHost);
        debug!(command = %host_command, "Running command on host");

        std::fs::create_dir_all(&self.working_dir)?;

        let mut cmd = tokio::process::Command::new("bash");
        cmd.arg("-c")
            .arg(&host_command)
            .current_dir(&self.working_dir)
            .env_clear()
            .envs(self.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        confine(&mut cmd, self.limits);

        let started = Instant::now();
        let child = cmd.spawn()?;
        let pid = child.id();

        match tokio::time::timeout(timeout, child.wait_with_output()).await {
            Ok(output) => {
                let output = output?;
                let outcome = ExecutionOutcome::from_output(
                    &ExecOutput {
                        exit_code: output.status.code().unwrap_or(-1),
                        stdout: output.stdout,
                        stderr: output.stderr,
                    },
                    started.elapsed(),
                    BackendKind::Local,
                    self.max_output_bytes,
                );
                info!(
                    exit_code = outcome.exit_code,
                    duration_ms = outcome.duration_ms,
                    "Local execution completed"
                );
                Ok(outcome)
            }
            Err(_) => {
                warn!(timeout_ms = timeout.as_millis() as u64, "Command timed out");
                #[cfg(unix)]
                if let Some(pid) = pid {
                    kill_group(pid);
                }
                #[cfg(not(unix))]
                let _ = pid;
                Ok(ExecutionOutcome::timed_out(
                    started.elapsed(),
                    timeout,
                    BackendKind::Local,
                ))
            }
        }
    }
}

/// Put the child in its own process group and cap its resources.
#[cfg(unix)]
fn confine(cmd: &mut tokio::process::Command, limits: LocalLimits) {
    cmd.process_group(0);
    // SAFETY: the closure only calls getrlimit/setrlimit, which are
    // async-signal-safe, and allocates nothing.
    unsafe {
        cmd.pre_exec(move || apply_rlimits(limits).map_err(std::io::Error::from));
    }
}

/// Apply resource limits using setrlimit.
#[cfg(unix)]
fn apply_rlimits(limits: LocalLimits) -> nix::Result<()> {
    use nix::sys::resource::{Resource, getrlimit, setrlimit};

    for (resource, wanted) in [
        (Resource::RLIMIT_FSIZE, limits.max_file_size_bytes),
        (Resource::RLIMIT_NOFILE, limits.max_open_files),
    ] {
        // Never try to raise the hard limit.
        let (_, hard) = getrlimit(resource)?;
        let value = wanted.min(hard);
        setrlimit(resource, value, value)?;
    }
    Ok(())
}

#[cfg(unix)]
fn kill_group(pid: u32) {
    use nix::sys::signal::{Signal, killpg};
    use nix::unistd::Pid;

    if let Err(e) = killpg(Pid::from_raw(pid as i32), Signal::SIGKILL) {
        // ESRCH: the group already exited.
        debug!(pid, error = %e, "Failed to kill process group");
    }
}
