use anyhow::Result;
use clap::Args;

use crate::config::Config;
use crate::pipeline::validator_from_config;

#[derive(Args)]
pub struct CheckArgs {
    /// Shell command to validate
    pub command: String,

    /// Print the validation result as JSON
    #[arg(long)]
    pub json: bool,
}

pub async fn run(args: CheckArgs) -> Result<()> {
    let config = Config::load()?;
    let validator = validator_from_config(&config)?;
    let result = validator.validate(&args.command);

    if args.json {
        println!("{}", serde_json::to_string_pretty(&result)?);
    } else if result.allowed {
        println!("allowed: {}", result.sanitized_command);
        for warning in &result.warnings {
            println!("  warning: {}", warning);
        }
    } else {
        println!(
            "blocked: {}",
            result.blocked_reason.as_deref().unwrap_or("blocked")
        );
    }

    if !result.allowed {
        std::process::exit(1);
    }
    Ok(())
}
