use anyhow::Result;
use clap::Parser;

use sandshell::cli::{self, Cli, Commands};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Logs go to stderr so stdout stays machine-readable.
    let log_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Run(args) => cli::run::run(args).await,
        Commands::Check(args) => cli::check::run(args).await,
        Commands::Translate(args) => cli::translate::run(args).await,
        Commands::Pipe(args) => cli::pipe::run(args).await,
        Commands::Sandbox(args) => cli::sandbox::run(args).await,
        Commands::Workspace(args) => cli::workspace::run(args).await,
        Commands::Audit(args) => cli::audit::run(args).await,
        Commands::Config(args) => cli::config::run(args).await,
        Commands::Paths => cli::paths::run(),
    }
}
