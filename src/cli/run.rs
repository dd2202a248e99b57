use anyhow::Result;
use clap::Args;
use std::time::Duration;

use crate::config::Config;
use crate::pipeline::{Pipeline, PipelineOutput};

#[derive(Args)]
pub struct RunArgs {
    /// Shell command to validate and run
    pub command: String,

    /// Natural-language request the command was generated for (audit only)
    #[arg(short, long, default_value = "")]
    pub query: String,

    /// Print the full result as JSON
    #[arg(long)]
    pub json: bool,

    /// Override the configured timeout, in seconds
    #[arg(short, long)]
    pub timeout: Option<u64>,

    /// Leave the sandbox container running afterwards
    #[arg(long)]
    pub keep: bool,
}

pub async fn run(args: RunArgs) -> Result<()> {
    let mut config = Config::load()?;
    if let Some(secs) = args.timeout {
        config.sandbox.timeout_secs = secs;
    }
    let pipeline = Pipeline::from_config(&config)?;

    let output = pipeline.process(&args.query, &args.command).await;

    if !args.keep
        && let Err(e) = pipeline.shutdown().await
    {
        tracing::warn!(error = %e, "Failed to stop sandbox container");
    }

    if args.json {
        println!("{}", serde_json::to_string_pretty(&output)?);
    } else {
        print_text(&output);
    }

    if output.exit_code != 0 {
        std::process::exit(exit_status(&output));
    }
    Ok(())
}

fn print_text(output: &PipelineOutput) {
    for warning in &output.warnings {
        eprintln!("warning: {}", warning);
    }
    if let Some(reason) = &output.blocked_reason {
        eprintln!("Blocked: {}", reason);
        return;
    }
    print!("{}", output.stdout);
    if !output.stderr.is_empty() {
        eprint!("{}", output.stderr);
        if !output.stderr.ends_with('\n') {
            eprintln!();
        }
    }
    if output.timed_out {
        eprintln!(
            "Timed out after {:?}",
            Duration::from_millis(output.timing_ms.execution)
        );
    }
}

/// Process exit status for a result: the command's own, or 1 when it never ran.
fn exit_status(output: &PipelineOutput) -> i32 {
    if output.exit_code < 0 { 1 } else { output.exit_code }
}
