use anyhow::Result;
use clap::Args;

use crate::config::Config;
use crate::pipeline::validator_from_config;
use crate::shell::Direction;

#[derive(Args)]
pub struct TranslateArgs {
    /// Command or path to translate
    pub text: String,

    /// Translate sandbox paths back to host paths
    #[arg(short, long)]
    pub reverse: bool,
}

pub async fn run(args: TranslateArgs) -> Result<()> {
    let config = Config::load()?;
    let validator = validator_from_config(&config)?;
    let direction = if args.reverse {
        Direction::SandboxToHost
    } else {
        Direction::HostToSandbox
    };
    println!("{}", validator.translator().translate(&args.text, direction));
    Ok(())
}
