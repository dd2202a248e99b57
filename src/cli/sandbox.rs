use anyhow::Result;
use clap::{Args, Subcommand};
use std::time::Duration;

use crate::config::Config;
use crate::pipeline::Pipeline;
use crate::sandbox::{BackendKind, ContainerRuntime, DockerCli, ExecutionOutcome};

#[derive(Args)]
pub struct SandboxArgs {
    #[command(subcommand)]
    pub command: SandboxCommands,
}

#[derive(Subcommand)]
pub enum SandboxCommands {
    /// Show sandbox configuration and container state
    Status,

    /// Create the sandbox container and leave it running
    Start,

    /// Remove the sandbox container
    Stop,

    /// Run smoke tests to verify sandbox enforcement
    Test {
        /// Leave the container running afterwards
        #[arg(long)]
        keep: bool,
    },
}

pub async fn run(args: SandboxArgs) -> Result<()> {
    match args.command {
        SandboxCommands::Status => run_status().await,
        SandboxCommands::Start => run_start().await,
        SandboxCommands::Stop => run_stop().await,
        SandboxCommands::Test { keep } => run_test(keep).await,
    }
}

async fn run_status() -> Result<()> {
    let config = Config::load()?;
    let backend = config.sandbox.backend_kind()?;

    println!("Configuration:");
    println!("  Backend:     {}", backend);
    println!("  Image:       {}", config.sandbox.image);
    println!("  Container:   {}", config.sandbox.container_name);
    println!("  Working dir: {}", config.sandbox.working_dir);
    println!("  Timeout:     {}s", config.sandbox.timeout_secs);
    println!("  Max output:  {} bytes", config.sandbox.max_output_bytes);
    println!(
        "  Limits:      memory={} cpus={} pids={}",
        config.sandbox.memory, config.sandbox.cpus, config.sandbox.pids_limit
    );
    println!(
        "  Env:         {}",
        config.sandbox.env.keys().cloned().collect::<Vec<_>>().join(", ")
    );
    println!();

    println!("Mounts:");
    match config.mount_table() {
        Ok(table) => {
            for mount in table.iter() {
                println!(
                    "  {} {} -> {}",
                    if mount.mode.is_read_only() { "ro" } else { "rw" },
                    mount.host_path.display(),
                    mount.sandbox_path.display()
                );
            }
        }
        Err(e) => println!("  invalid: {}", e),
    }
    println!();

    if backend == BackendKind::Local {
        println!("Runtime:");
        println!("  Local backend: commands run on the host with no container isolation.");
        return Ok(());
    }

    let docker = DockerCli::new();
    println!("Runtime:");
    match docker.ping().await {
        Ok(()) => println!("  Daemon:      reachable"),
        Err(e) => {
            println!("  Daemon:      {}", e);
            return Ok(());
        }
    }
    let running = docker.health_check(&config.sandbox.container_name).await;
    println!(
        "  Container:   {}",
        if running { "running" } else { "not running" }
    );

    Ok(())
}

async fn run_start() -> Result<()> {
    let config = Config::load()?;
    let pipeline = Pipeline::from_config(&config)?;
    pipeline.backend().ensure_running().await?;

    let status = pipeline.backend().status();
    match status.container_id {
        Some(id) => println!("Sandbox container running: {}", id),
        None => println!("Sandbox ready ({})", status.backend),
    }
    Ok(())
}

async fn run_stop() -> Result<()> {
    let config = Config::load()?;
    if config.sandbox.backend_kind()? == BackendKind::Local {
        println!("Local backend has no container to stop.");
        return Ok(());
    }
    DockerCli::new()
        .remove(&config.sandbox.container_name)
        .await?;
    println!("Removed {}", config.sandbox.container_name);
    Ok(())
}

async fn run_test(keep: bool) -> Result<()> {
    let config = Config::load()?;
    let pipeline = Pipeline::from_config(&config)?;
    let backend = pipeline.backend();
    let table = pipeline.validator().translator().mounts().clone();
    let workspace = table
        .workspace()
        .map(|m| m.sandbox_path.display().to_string())
        .unwrap_or_else(|| config.sandbox.working_dir.clone());

    println!("Running sandbox smoke tests...");
    println!("  Backend: {}", backend.kind());
    println!();

    let mut passed = 0;
    let mut failed = 0;
    let mut tally = |ok: bool| {
        if ok {
            passed += 1;
        } else {
            failed += 1;
        }
    };
    let short = Duration::from_secs(20);

    // Commands below bypass the validator on purpose: they probe the boundary.

    print!("  [1/6] Echo command succeeds:        ");
    tally(report(backend.execute("echo hello", short).await, |o| {
        o.exit_code == 0 && o.stdout.contains("hello")
    }));

    print!("  [2/6] Workspace is writable:        ");
    let probe = format!("{}/.sandshell-probe", workspace);
    tally(report(
        backend
            .execute(&format!("touch '{probe}' && rm -f '{probe}'"), short)
            .await,
        |o| o.exit_code == 0,
    ));

    print!("  [3/6] Read-only mount rejects write:");
    match table.iter().find(|m| m.mode.is_read_only()) {
        Some(mount) if backend.kind() == BackendKind::Container => {
            let probe = format!("{}/.sandshell-probe", mount.sandbox_path.display());
            tally(report(
                backend.execute(&format!("touch '{probe}'"), short).await,
                |o| o.exit_code != 0,
            ));
        }
        Some(_) => {
            println!(" skipped (local backend has no mounts)");
            tally(true);
        }
        None => {
            println!(" skipped (no read-only mounts)");
            tally(true);
        }
    }

    print!("  [4/6] Network denied:               ");
    if backend.kind() == BackendKind::Container {
        tally(report(
            backend
                .execute("exec 3<>/dev/tcp/1.1.1.1/53", Duration::from_secs(10))
                .await,
            |o| o.exit_code != 0,
        ));
    } else {
        println!("skipped (local backend)");
        tally(true);
    }

    print!("  [5/6] Timeout enforcement:          ");
    tally(report(
        backend.execute("sleep 30", Duration::from_secs(2)).await,
        |o| o.timed_out,
    ));

    print!("  [6/6] Validator blocks rm -rf /:    ");
    let result = pipeline.validator().validate("rm -rf /");
    if result.allowed {
        println!("FAIL (allowed)");
        tally(false);
    } else {
        println!("blocked (ok)");
        tally(true);
    }

    if !keep && let Err(e) = pipeline.shutdown().await {
        println!("  warning: failed to remove container: {}", e);
    }

    println!();
    if failed == 0 {
        println!("All {} tests passed.", passed);
    } else {
        println!("{} passed, {} failed.", passed, failed);
    }

    Ok(())
}

/// Print one smoke-test line and return whether it passed.
fn report<E: std::fmt::Display>(
    result: std::result::Result<ExecutionOutcome, E>,
    check: impl Fn(&ExecutionOutcome) -> bool,
) -> bool {
    match result {
        Ok(outcome) if check(&outcome) => {
            println!("ok");
            true
        }
        Ok(outcome) => {
            let output = if outcome.stderr.is_empty() {
                &outcome.stdout
            } else {
                &outcome.stderr
            };
            println!(
                "FAIL (exit={}, output={})",
                outcome.exit_code,
                output.chars().take(100).collect::<String>()
            );
            false
        }
        Err(e) => {
            println!("FAIL ({})", e);
            false
        }
    }
}
