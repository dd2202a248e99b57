use anyhow::Result;
use clap::{Args, Subcommand};

use crate::config::Config;
use crate::security::{AuditAction, AuditLogger, AuditRecord};

#[derive(Args)]
pub struct AuditArgs {
    #[command(subcommand)]
    pub command: AuditCommands,
}

#[derive(Subcommand)]
pub enum AuditCommands {
    /// Show recent audit records
    Show {
        /// Number of most recent records to show
        #[arg(short = 'n', long, default_value_t = 20)]
        limit: usize,

        /// Print records as JSON lines
        #[arg(long)]
        json: bool,
    },

    /// Verify the audit log hash chain
    Verify,
}

pub async fn run(args: AuditArgs) -> Result<()> {
    let config = Config::load()?;
    let logger = AuditLogger::new(&config.paths.state_dir);

    match args.command {
        AuditCommands::Show { limit, json } => show(&logger, limit, json),
        AuditCommands::Verify => verify(&logger),
    }
}

fn show(logger: &AuditLogger, limit: usize, json: bool) -> Result<()> {
    let records = logger.read_records(Some(limit))?;
    if records.is_empty() {
        println!("No audit records at {}", logger.path().display());
        return Ok(());
    }

    for record in &records {
        if json {
            println!("{}", serde_json::to_string(record)?);
        } else {
            println!("{}", summarize(record));
        }
    }
    Ok(())
}

fn summarize(record: &AuditRecord) -> String {
    let detail = match record.action {
        AuditAction::Executed => record
            .execution
            .as_ref()
            .map(|e| {
                if e.timed_out {
                    format!("timed out after {}ms", e.duration_ms)
                } else {
                    format!("exit={} {}ms", e.exit_code, e.duration_ms)
                }
            })
            .unwrap_or_default(),
        AuditAction::Blocked => record
            .validation
            .as_ref()
            .and_then(|v| v.blocked_reason.clone())
            .unwrap_or_default(),
        AuditAction::Failed | AuditAction::ChainRecovery => {
            record.error.clone().unwrap_or_default()
        }
    };
    format!(
        "{}  {:<14} {}  [{}]",
        record.ts,
        format!("{:?}", record.action).to_lowercase(),
        record.raw_command,
        detail
    )
}

fn verify(logger: &AuditLogger) -> Result<()> {
    let broken = logger.verify_chain()?;
    if broken.is_empty() {
        println!("Audit chain intact: {}", logger.path().display());
        return Ok(());
    }
    for line in &broken {
        println!("Broken link at line {}", line + 1);
    }
    anyhow::bail!("{} broken link(s) in {}", broken.len(), logger.path().display())
}
