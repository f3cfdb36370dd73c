use std::path::PathBuf;

use anyhow::Result;
use clap::Args;

use rosterdbx::config::load_or_default;

#[derive(Args)]
pub struct StartArgs {
    /// Override the configured port
    #[arg(long)]
    pub port: Option<u16>,
}

pub async fn execute(config_path: Option<PathBuf>, args: StartArgs) -> Result<()> {
    let (mut config, _) = load_or_default(config_path)?;
    if let Some(port) = args.port {
        config.port = port;
    }
    rosterdbx::server::run(config).await?;
    Ok(())
}
