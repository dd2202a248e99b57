use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, watch};
use tracing::{debug, info, instrument, warn};

use super::local::LocalExecutor;
use super::runtime::{ContainerRuntime, ContainerSpec, ExecOutput, ExecRequest};
use crate::error::SandboxError;

/// Exit code reported for commands killed by the wall-clock timeout.
pub const TIMEOUT_EXIT_CODE: i32 = 124;

/// Exit code of a process killed by `SIGKILL` inside the container.
const SIGKILL_EXIT_CODE: i32 = 137;

const HEALTH_CHECK_TIMEOUT: Duration = Duration::from_secs(10);

/// Which backend ran a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    Container,
    Local,
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BackendKind::Container => write!(f, "container"),
            BackendKind::Local => write!(f, "local"),
        }
    }
}

/// Result of running one command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionOutcome {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
    pub duration_ms: u64,
    pub backend: BackendKind,
    pub timed_out: bool,
}

impl ExecutionOutcome {
    pub(crate) fn from_output(
        output: &ExecOutput,
        elapsed: Duration,
        backend: BackendKind,
        max_output_bytes: usize,
    ) -> Self {
        Self {
            stdout: truncate_output(&output.stdout, max_output_bytes),
            stderr: truncate_output(&output.stderr, max_output_bytes),
            exit_code: output.exit_code,
            duration_ms: elapsed.as_millis() as u64,
            backend,
            timed_out: false,
        }
    }

    pub(crate) fn timed_out(elapsed: Duration, timeout: Duration, backend: BackendKind) -> Self {
        Self {
            stdout: String::new(),
            stderr: format!("Command timed out after {}ms", timeout.as_millis()),
            exit_code: TIMEOUT_EXIT_CODE,
            duration_ms: elapsed.as_millis() as u64,
            backend,
            timed_out: true,
        }
    }
}

/// Decode a stream lossily and cap it at `max_bytes` on a char boundary.
pub(crate) fn truncate_output(bytes: &[u8], max_bytes: usize) -> String {
    let text = String::from_utf8_lossy(bytes);
    if text.len() <= max_bytes {
        return text.into_owned();
    }
    let mut cut = max_bytes;
    while !text.is_char_boundary(cut) {
        cut -= 1;
    }
    format!(
        "{}\n\n[Output truncated, {} bytes total]",
        &text[..cut],
        text.len()
    )
}

/// A live container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerHandle {
    pub id: String,
    pub name: String,
    pub started_at: DateTime<Utc>,
}

/// Lifecycle of the shared container.
///
/// `Absent -> Starting -> Running -> Unhealthy -> Absent`. Transitions happen
/// only while the executor's lock is held.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContainerState {
    Absent,
    Starting,
    Running(ContainerHandle),
    Unhealthy,
}

impl ContainerState {
    pub fn label(&self) -> &'static str {
        match self {
            ContainerState::Absent => "absent",
            ContainerState::Starting => "starting",
            ContainerState::Running(_) => "running",
            ContainerState::Unhealthy => "unhealthy",
        }
    }
}

/// Point-in-time view of a backend, for status reporting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BackendStatus {
    pub backend: BackendKind,
    pub state: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub container_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
}

/// Runs commands inside one long-lived container.
///
/// All lifecycle work and every exec is serialized through `lock`, so
/// concurrent callers queue and never observe a half-created container.
pub struct ContainerExecutor {
    runtime: Arc<dyn ContainerRuntime>,
    spec: ContainerSpec,
    env: Vec<(String, String)>,
    startup_timeout: Duration,
    max_output_bytes: usize,
    lock: Mutex<()>,
    state: watch::Sender<ContainerState>,
}

impl ContainerExecutor {
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        spec: ContainerSpec,
        env: Vec<(String, String)>,
        startup_timeout: Duration,
        max_output_bytes: usize,
    ) -> Self {
        let (state, _) = watch::channel(ContainerState::Absent);
        Self {
            runtime,
            spec,
            env,
            startup_timeout,
            max_output_bytes,
            lock: Mutex::new(()),
            state,
        }
    }

    pub fn spec(&self) -> &ContainerSpec {
        &self.spec
    }

    pub fn state(&self) -> ContainerState {
        self.state.borrow().clone()
    }

    fn set_state(&self, next: ContainerState) {
        let previous = self.state.send_replace(next);
        debug!(
            from = previous.label(),
            to = self.state.borrow().label(),
            "Container state transition"
        );
    }

    /// Make sure the container is running, creating it if needed.
    ///
    /// Idempotent: a running container is returned as-is without touching
    /// the runtime.
    pub async fn ensure_running(&self) -> Result<ContainerHandle, SandboxError> {
        let _guard = self.lock.lock().await;
        self.ensure_running_locked().await
    }

    async fn ensure_running_locked(&self) -> Result<ContainerHandle, SandboxError> {
        match self.state() {
            ContainerState::Running(handle) => return Ok(handle),
            ContainerState::Unhealthy => self.tear_down().await,
            ContainerState::Absent | ContainerState::Starting => {}
        }

        self.set_state(ContainerState::Starting);
        match tokio::time::timeout(self.startup_timeout, self.start()).await {
            Ok(Ok(handle)) => {
                info!(
                    container = %handle.name,
                    id = %handle.id,
                    image = %self.spec.image,
                    "Sandbox container started"
                );
                self.set_state(ContainerState::Running(handle.clone()));
                Ok(handle)
            }
            Ok(Err(e)) => {
                self.set_state(ContainerState::Absent);
                Err(e)
            }
            Err(_) => {
                self.set_state(ContainerState::Absent);
                // Best effort; the next start removes it anyway.
                let _ = self.runtime.remove(&self.spec.name).await;
                Err(SandboxError::BackendUnavailable(format!(
                    "sandbox container did not start within {}s",
                    self.startup_timeout.as_secs()
                )))
            }
        }
    }

    async fn start(&self) -> Result<ContainerHandle, SandboxError> {
        self.runtime.ping().await?;
        // A stale container may carry an outdated mount table.
        self.runtime.remove(&self.spec.name).await?;
        let id = self.runtime.run(&self.spec).await?;
        Ok(ContainerHandle {
            id,
            name: self.spec.name.clone(),
            started_at: Utc::now(),
        })
    }

    async fn tear_down(&self) {
        if let Err(e) = self.runtime.remove(&self.spec.name).await {
            warn!(container = %self.spec.name, error = %e, "Failed to remove sandbox container");
        }
        self.set_state(ContainerState::Absent);
    }

    async fn is_healthy(&self, handle: &ContainerHandle) -> bool {
        tokio::time::timeout(HEALTH_CHECK_TIMEOUT, self.runtime.health_check(&handle.id))
            .await
            .unwrap_or(false)
    }

    /// Run `command` inside the container with a hard wall-clock timeout.
    #[instrument(skip(self, command), fields(container = %self.spec.name))]
    pub async fn execute(
        &self,
        command: &str,
        timeout: Duration,
    ) -> Result<ExecutionOutcome, SandboxError> {
        let _guard = self.lock.lock().await;
        let mut recreated = false;

        loop {
            let handle = self.ensure_running_locked().await?;
            let request = ExecRequest {
                command: command.to_string(),
                working_dir: self.spec.working_dir.clone(),
                env: self.env.clone(),
                timeout,
            };

            let started = Instant::now();
            let result =
                tokio::time::timeout(timeout, self.runtime.exec(&handle.id, &request)).await;
            let elapsed = started.elapsed();

            return match result {
                Ok(Ok(output)) => {
                    let mut outcome = ExecutionOutcome::from_output(
                        &output,
                        elapsed,
                        BackendKind::Container,
                        self.max_output_bytes,
                    );
                    // The in-container kill can beat the client-side timeout.
                    if output.exit_code == SIGKILL_EXIT_CODE && elapsed >= timeout {
                        outcome.timed_out = true;
                    }
                    info!(
                        exit_code = outcome.exit_code,
                        duration_ms = outcome.duration_ms,
                        "Sandbox execution completed"
                    );
                    Ok(outcome)
                }
                // The runtime refused the exec, so the command never started
                // and running it again on a fresh container is safe.
                Ok(Err(SandboxError::Exec(reason))) if !recreated => {
                    warn!(
                        container = %handle.name,
                        reason = %reason,
                        "Sandbox container unreachable, recreating"
                    );
                    self.set_state(ContainerState::Unhealthy);
                    self.tear_down().await;
                    recreated = true;
                    continue;
                }
                Ok(Err(e)) => {
                    warn!(error = %e, "Exec against sandbox container failed");
                    if !self.is_healthy(&handle).await {
                        self.set_state(ContainerState::Unhealthy);
                        self.tear_down().await;
                    }
                    Err(e)
                }
                Err(_) => {
                    warn!(timeout_ms = timeout.as_millis() as u64, "Command timed out");
                    if self.is_healthy(&handle).await {
                        debug!("Container healthy after timeout");
                    } else {
                        warn!(container = %handle.name, "Container unhealthy after timeout, tearing down");
                        self.set_state(ContainerState::Unhealthy);
                        self.tear_down().await;
                    }
                    Ok(ExecutionOutcome::timed_out(
                        elapsed,
                        timeout,
                        BackendKind::Container,
                    ))
                }
            };
        }
    }

    /// Remove the container if one exists.
    pub async fn shutdown(&self) -> Result<(), SandboxError> {
        let _guard = self.lock.lock().await;
        if self.state() == ContainerState::Absent {
            return Ok(());
        }
        self.runtime.remove(&self.spec.name).await?;
        self.set_state(ContainerState::Absent);
        info!(container = %self.spec.name, "Sandbox container removed");
        Ok(())
    }

    pub fn status(&self) -> BackendStatus {
        let state = self.state();
        let (container_id, started_at) = match &state {
            ContainerState::Running(handle) => (Some(handle.id.clone()), Some(handle.started_at)),
            _ => (None, None),
        };
        BackendStatus {
            backend: BackendKind::Container,
            state: state.label(),
            container_id,
            started_at,
        }
    }
}

/// The backend chosen once at startup.
///
/// There is no automatic fallback: `Local` is only ever built when the
/// configuration asks for it.
pub enum SandboxBackend {
    Container(ContainerExecutor),
    Local(LocalExecutor),
}

impl SandboxBackend {
    pub fn kind(&self) -> BackendKind {
        match self {
            SandboxBackend::Container(_) => BackendKind::Container,
            SandboxBackend::Local(_) => BackendKind::Local,
        }
    }

    pub async fn ensure_running(&self) -> Result<(), SandboxError> {
        match self {
            SandboxBackend::Container(executor) => executor.ensure_running().await.map(|_| ()),
            SandboxBackend::Local(_) => Ok(()),
        }
    }

    pub async fn execute(
        &self,
        command: &str,
        timeout: Duration,
    ) -> Result<ExecutionOutcome, SandboxError> {
        match self {
            SandboxBackend::Container(executor) => executor.execute(command, timeout).await,
            SandboxBackend::Local(executor) => executor.execute(command, timeout).await,
        }
    }

    pub async fn shutdown(&self) -> Result<(), SandboxError> {
        match self {
            SandboxBackend::Container(executor) => executor.shutdown().await,
            SandboxBackend::Local(_) => Ok(()),
        }
    }

    pub fn status(&self) -> BackendStatus {
        match self {
            SandboxBackend::Container(executor) => executor.status(),
            SandboxBackend::Local(_) => BackendStatus {
                backend: BackendKind::Local,
                state: "local",
                container_id: None,
                started_at: None,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::mounts::MountSpec;
    use crate::sandbox::runtime::MockContainerRuntime;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    fn spec() -> ContainerSpec {
        ContainerSpec {
            name: "sandshell-test".into(),
            image: "sandshell-sandbox:latest".into(),
            working_dir: "/home/user/workspace".into(),
            mounts: vec![MountSpec::read_write(
                "/Users/alice/.sandshell/workspace",
                "/home/user/workspace",
            )],
            memory: "512m".into(),
            cpus: "0.5".into(),
            pids_limit: 128,
        }
    }

    fn executor(runtime: impl ContainerRuntime + 'static) -> ContainerExecutor {
        ContainerExecutor::new(
            Arc::new(runtime),
            spec(),
            vec![("LANG".into(), "C.UTF-8".into())],
            Duration::from_secs(5),
            1024,
        )
    }

    /// Runtime that records lifecycle calls and simulates exec timing.
    #[derive(Default)]
    struct FakeRuntime {
        runs: AtomicUsize,
        removes: AtomicUsize,
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
        unhealthy: AtomicBool,
        start_delay: Duration,
        exec_delay: Duration,
    }

    #[async_trait]
    impl ContainerRuntime for FakeRuntime {
        async fn ping(&self) -> Result<(), SandboxError> {
            Ok(())
        }

        async fn remove(&self, _name: &str) -> Result<(), SandboxError> {
            self.removes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn run(&self, _spec: &ContainerSpec) -> Result<String, SandboxError> {
            tokio::time::sleep(self.start_delay).await;
            let n = self.runs.fetch_add(1, Ordering::SeqCst) + 1;
            self.unhealthy.store(false, Ordering::SeqCst);
            Ok(format!("container-{n}"))
        }

        async fn exec(
            &self,
            _container: &str,
            request: &ExecRequest,
        ) -> Result<ExecOutput, SandboxError> {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);
            if request.command.starts_with("sleep 10") {
                // A wedged process takes the container with it.
                self.unhealthy.store(true, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_secs(10)).await;
            } else {
                tokio::time::sleep(self.exec_delay).await;
            }
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            Ok(ExecOutput {
                stdout: request.command.clone().into_bytes(),
                stderr: Vec::new(),
                exit_code: 0,
            })
        }

        async fn health_check(&self, _container: &str) -> bool {
            !self.unhealthy.load(Ordering::SeqCst)
        }
    }

    #[tokio::test]
    async fn ensure_running_is_idempotent() {
        let mut runtime = MockContainerRuntime::new();
        runtime.expect_ping().times(1).returning(|| Ok(()));
        runtime.expect_remove().times(1).returning(|_| Ok(()));
        runtime
            .expect_run()
            .times(1)
            .returning(|_| Ok("abc123".to_string()));
        let executor = executor(runtime);

        let first = executor.ensure_running().await.unwrap();
        let second = executor.ensure_running().await.unwrap();
        assert_eq!(first, second);
        assert_eq!(first.id, "abc123");
        assert_eq!(executor.status().state, "running");
    }

    #[tokio::test]
    async fn unreachable_daemon_is_backend_unavailable() {
        let mut runtime = MockContainerRuntime::new();
        runtime.expect_ping().returning(|| {
            Err(SandboxError::BackendUnavailable(
                "container daemon unreachable".into(),
            ))
        });
        runtime.expect_run().never();
        let executor = executor(runtime);

        let err = executor
            .execute("ls", Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, SandboxError::BackendUnavailable(_)));
        assert_eq!(executor.state(), ContainerState::Absent);
    }

    #[tokio::test]
    async fn exec_uses_fixed_workdir_and_env() {
        let mut runtime = MockContainerRuntime::new();
        runtime.expect_ping().returning(|| Ok(()));
        runtime.expect_remove().returning(|_| Ok(()));
        runtime.expect_run().returning(|_| Ok("abc123".to_string()));
        runtime
            .expect_exec()
            .withf(|id, request| {
                id == "abc123"
                    && request.working_dir.to_str() == Some("/home/user/workspace")
                    && request.env == vec![("LANG".to_string(), "C.UTF-8".to_string())]
                    && request.command == "ls -la"
            })
            .times(1)
            .returning(|_, _| {
                Ok(ExecOutput {
                    stdout: b"total 0\n".to_vec(),
                    stderr: Vec::new(),
                    exit_code: 0,
                })
            });
        let executor = executor(runtime);

        let outcome = executor
            .execute("ls -la", Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(outcome.stdout, "total 0\n");
        assert_eq!(outcome.exit_code, 0);
        assert_eq!(outcome.backend, BackendKind::Container);
        assert!(!outcome.timed_out);
    }

    #[tokio::test]
    async fn startup_is_bounded() {
        let runtime = FakeRuntime {
            start_delay: Duration::from_secs(30),
            ..Default::default()
        };
        let executor = ContainerExecutor::new(
            Arc::new(runtime),
            spec(),
            Vec::new(),
            Duration::from_millis(50),
            1024,
        );

        let err = executor.ensure_running().await.unwrap_err();
        assert!(matches!(err, SandboxError::BackendUnavailable(_)));
        assert_eq!(executor.state(), ContainerState::Absent);
    }

    #[tokio::test]
    async fn timeout_tears_down_unhealthy_container_and_recreates() {
        let runtime = Arc::new(FakeRuntime::default());
        let executor = ContainerExecutor::new(
            runtime.clone(),
            spec(),
            Vec::new(),
            Duration::from_secs(5),
            1024,
        );

        let outcome = executor
            .execute("sleep 10", Duration::from_millis(100))
            .await
            .unwrap();
        assert!(outcome.timed_out);
        assert_eq!(outcome.exit_code, TIMEOUT_EXIT_CODE);
        assert_eq!(executor.state(), ContainerState::Absent);

        let handle = executor.ensure_running().await.unwrap();
        assert_eq!(handle.id, "container-2");
        assert_eq!(runtime.runs.load(Ordering::SeqCst), 2);

        let outcome = executor
            .execute("echo ok", Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(outcome.stdout, "echo ok");
    }

    #[tokio::test]
    async fn healthy_container_survives_timeout() {
        let runtime = Arc::new(FakeRuntime {
            exec_delay: Duration::from_secs(10),
            ..Default::default()
        });
        let executor = ContainerExecutor::new(
            runtime.clone(),
            spec(),
            Vec::new(),
            Duration::from_secs(5),
            1024,
        );

        let outcome = executor
            .execute("find / -name x", Duration::from_millis(50))
            .await
            .unwrap();
        assert!(outcome.timed_out);
        assert!(matches!(executor.state(), ContainerState::Running(_)));
        assert_eq!(runtime.runs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn concurrent_executions_are_serialized() {
        let runtime = Arc::new(FakeRuntime {
            exec_delay: Duration::from_millis(50),
            ..Default::default()
        });
        let executor = Arc::new(ContainerExecutor::new(
            runtime.clone(),
            spec(),
            Vec::new(),
            Duration::from_secs(5),
            1024,
        ));

        let started = Instant::now();
        let tasks: Vec<_> = (0..4)
            .map(|i| {
                let executor = executor.clone();
                tokio::spawn(async move {
                    let command = format!("echo {i}");
                    let outcome = executor
                        .execute(&command, Duration::from_secs(5))
                        .await
                        .unwrap();
                    (command, outcome)
                })
            })
            .collect();

        for task in futures::future::join_all(tasks).await {
            let (command, outcome) = task.unwrap();
            assert_eq!(outcome.stdout, command);
        }
        assert!(started.elapsed() >= Duration::from_millis(200));
        assert_eq!(runtime.max_in_flight.load(Ordering::SeqCst), 1);
        assert_eq!(runtime.runs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn container_removed_outside_a_timeout_is_recreated() {
        let mut runtime = MockContainerRuntime::new();
        runtime.expect_ping().returning(|| Ok(()));
        runtime.expect_remove().returning(|_| Ok(()));
        let mut runs = 0;
        runtime.expect_run().times(2).returning(move |_| {
            runs += 1;
            Ok(if runs == 1 { "first" } else { "second" }.to_string())
        });
        runtime
            .expect_exec()
            .withf(|id, _| id == "first")
            .times(1)
            .returning(|_, _| {
                Err(SandboxError::Exec(
                    "Error response from daemon: No such container: first".into(),
                ))
            });
        runtime
            .expect_exec()
            .withf(|id, _| id == "second")
            .times(1)
            .returning(|_, _| {
                Ok(ExecOutput {
                    stdout: b"ok\n".to_vec(),
                    stderr: Vec::new(),
                    exit_code: 0,
                })
            });
        let executor = executor(runtime);

        let outcome = executor
            .execute("echo ok", Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(outcome.stdout, "ok\n");
        match executor.state() {
            ContainerState::Running(handle) => assert_eq!(handle.id, "second"),
            other => panic!("unexpected state {}", other.label()),
        }
    }

    #[tokio::test]
    async fn persistent_runtime_failure_is_reported_after_one_recreation() {
        let mut runtime = MockContainerRuntime::new();
        runtime.expect_ping().returning(|| Ok(()));
        runtime.expect_remove().returning(|_| Ok(()));
        runtime
            .expect_run()
            .times(2)
            .returning(|_| Ok("abc".to_string()));
        runtime
            .expect_exec()
            .times(2)
            .returning(|_, _| Err(SandboxError::Exec("container is not running".into())));
        runtime.expect_health_check().returning(|_| false);
        let executor = executor(runtime);

        let err = executor
            .execute("ls", Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(err, SandboxError::Exec(_)));
        assert_eq!(executor.state(), ContainerState::Absent);
    }

    #[tokio::test]
    async fn shutdown_removes_container() {
        let runtime = Arc::new(FakeRuntime::default());
        let executor = ContainerExecutor::new(
            runtime.clone(),
            spec(),
            Vec::new(),
            Duration::from_secs(5),
            1024,
        );
        executor.ensure_running().await.unwrap();
        let removes_before = runtime.removes.load(Ordering::SeqCst);

        executor.shutdown().await.unwrap();
        assert_eq!(executor.state(), ContainerState::Absent);
        assert_eq!(runtime.removes.load(Ordering::SeqCst), removes_before + 1);

        // Nothing to remove the second time.
        executor.shutdown().await.unwrap();
        assert_eq!(runtime.removes.load(Ordering::SeqCst), removes_before + 1);
    }

    #[test]
    fn truncation_respects_char_boundaries() {
        let text = "héllo wörld".as_bytes();
        let out = truncate_output(text, 2);
        assert!(out.starts_with("h\n\n[Output truncated"));
        assert_eq!(truncate_output(b"short", 100), "short");
    }

    #[test]
    fn outcome_serializes_camel_case() {
        let outcome = ExecutionOutcome {
            stdout: String::new(),
            stderr: String::new(),
            exit_code: 0,
            duration_ms: 3,
            backend: BackendKind::Local,
            timed_out: false,
        };
        let json = serde_json::to_value(&outcome).unwrap();
        assert_eq!(json["exitCode"], 0);
        assert_eq!(json["durationMs"], 3);
        assert_eq!(json["timedOut"], false);
        assert_eq!(json["backend"], "local");
    }
}
