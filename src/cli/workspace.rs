//! CLI subcommand: `sandshell workspace`
//!
//! Lists mounted directories from inside the sandbox. Each listing is an
//! ordinary request, so it is validated, executed and audited like any other.

use anyhow::{Result, bail};
use clap::Args;

use crate::config::Config;
use crate::pipeline::Pipeline;
use crate::sandbox::mounts::MountTable;
use crate::shell::translate::shell_quote;

#[derive(Args)]
pub struct WorkspaceArgs {
    /// List every mount, not just the read-write workspace
    #[arg(short, long)]
    pub all: bool,

    /// Leave the sandbox container running afterwards
    #[arg(long)]
    pub keep: bool,
}

pub async fn run(args: WorkspaceArgs) -> Result<()> {
    let config = Config::load()?;
    let pipeline = Pipeline::from_config(&config)?;

    let commands = listing_commands(pipeline.validator().translator().mounts(), args.all);
    if commands.is_empty() {
        bail!("No read-write workspace mount is configured");
    }

    let mut failed = false;
    for command in &commands {
        let output = pipeline.process("list workspace contents", command).await;
        println!("$ {}", output.sanitized_command);
        if let Some(reason) = &output.blocked_reason {
            eprintln!("Blocked: {}", reason);
            failed = true;
            continue;
        }
        print!("{}", output.stdout);
        if !output.stderr.is_empty() {
            eprint!("{}", output.stderr);
        }
        failed |= output.exit_code != 0;
        println!();
    }

    if !args.keep
        && let Err(e) = pipeline.shutdown().await
    {
        tracing::warn!(error = %e, "Failed to stop sandbox container");
    }

    if failed {
        std::process::exit(1);
    }
    Ok(())
}

/// One `ls -la` per listed mount, addressed by its sandbox path.
fn listing_commands(table: &MountTable, all: bool) -> Vec<String> {
    let listed: Vec<_> = if all {
        table.iter().collect()
    } else {
        table.workspace().into_iter().collect()
    };
    listed
        .into_iter()
        .map(|mount| {
            format!(
                "ls -la {}",
                shell_quote(&mount.sandbox_path.display().to_string())
            )
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::mounts::{MountSpec, test_table};
    use crate::security::validator::CommandValidator;
    use crate::shell::translate::PathTranslator;
    use std::sync::Arc;

    #[test]
    fn default_lists_only_the_workspace() {
        assert_eq!(
            listing_commands(&test_table(), false),
            vec!["ls -la /home/user/workspace".to_string()]
        );
    }

    #[test]
    fn all_lists_every_mount() {
        let commands = listing_commands(&test_table(), true);
        assert_eq!(commands.len(), 4);
        assert_eq!(commands[0], "ls -la /home/user/Desktop");
    }

    #[test]
    fn read_only_table_has_nothing_to_list_by_default() {
        let table =
            MountTable::new(vec![MountSpec::read_only("/srv/docs", "/home/user/docs")]).unwrap();
        assert!(listing_commands(&table, false).is_empty());
    }

    #[test]
    fn listings_pass_validation() {
        let translator = PathTranslator::new(Arc::new(test_table()), "/Users/alice", "/home/user");
        let validator = CommandValidator::new(translator, "/home/user/workspace", "user");
        for command in listing_commands(&test_table(), true) {
            let result = validator.validate(&command);
            assert!(result.allowed, "{command}: {:?}", result.blocked_reason);
        }
    }
}
