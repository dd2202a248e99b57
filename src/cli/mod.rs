pub mod audit;
pub mod check;
pub mod config;
pub mod paths;
pub mod pipe;
pub mod run;
pub mod sandbox;
pub mod translate;
pub mod workspace;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "sandshell")]
#[command(
    author,
    version,
    about = "Validate and sandbox model-generated shell commands"
)]
#[command(propagate_version = true)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Validate, execute and audit one command
    Run(run::RunArgs),

    /// Validate a command without running it
    Check(check::CheckArgs),

    /// Translate paths between host and sandbox views
    Translate(translate::TranslateArgs),

    /// Process JSON-lines requests from stdin
    Pipe(pipe::PipeArgs),

    /// Sandbox container management
    Sandbox(sandbox::SandboxArgs),

    /// List mounted directories from inside the sandbox
    Workspace(workspace::WorkspaceArgs),

    /// Inspect the audit log
    Audit(audit::AuditArgs),

    /// Configuration management
    Config(config::ConfigArgs),

    /// Show resolved XDG directory paths
    Paths,
}
