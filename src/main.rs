mod commands;

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};

use crate::commands::{
    config::ConfigArgs, duplicates::DuplicateCommands, start::StartArgs, sync::SyncArgs,
    verify::VerifyArgs,
};

#[derive(Parser)]
#[command(author, version, about = "RosterDBX server CLI")]
struct Cli {
    /// Path to the configuration file. Defaults to ~/.config/rosterdbx/config.toml
    #[arg(long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the RosterDBX server
    Start(StartArgs),
    /// Update or display system configuration
    Config(ConfigArgs),
    /// Reconcile this replica with the server or an external registry
    Sync(SyncArgs),
    /// Inspect or resolve potential duplicates
    Duplicates {
        #[command(subcommand)]
        command: DuplicateCommands,
    },
    /// Replay an entity and check the log integrity digest
    Verify(VerifyArgs),
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match &cli.command {
        Commands::Start(_) => {
            let (config, _) = rosterdbx::config::load_or_default(cli.config.clone())?;
            rosterdbx::logging::init(Some(&config.log_dir()))?;
        }
        _ => rosterdbx::logging::init(None)?,
    }

    match cli.command {
        Commands::Start(args) => commands::start::execute(cli.config, args).await,
        Commands::Config(args) => commands::config::execute(cli.config, args),
        Commands::Sync(args) => commands::sync::execute(cli.config, args).await,
        Commands::Duplicates { command } => commands::duplicates::execute(cli.config, command),
        Commands::Verify(args) => commands::verify::execute(cli.config, args),
    }
}
