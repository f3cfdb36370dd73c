use std::path::PathBuf;

use anyhow::Result;
use clap::Args;

use rosterdbx::config::{ConfigUpdate, load_or_default};

#[derive(Args)]
pub struct ConfigArgs {
    #[arg(long)]
    pub port: Option<u16>,

    #[arg(long)]
    pub data_dir: Option<PathBuf>,

    #[arg(long)]
    pub replica_id: Option<u16>,

    #[arg(long)]
    pub page_size: Option<usize>,

    #[arg(long)]
    pub batch_size: Option<usize>,

    #[arg(long)]
    pub request_timeout_secs: Option<u64>,

    /// Print the effective configuration and exit
    #[arg(long)]
    pub show: bool,
}

pub fn execute(config_path: Option<PathBuf>, args: ConfigArgs) -> Result<()> {
    let (mut config, path) = load_or_default(config_path)?;

    if args.show {
        println!("{}", toml::to_string_pretty(&config)?);
        return Ok(());
    }

    let ConfigArgs {
        port,
        data_dir,
        replica_id,
        page_size,
        batch_size,
        request_timeout_secs,
        show: _,
    } = args;

    config.apply_update(ConfigUpdate {
        port,
        data_dir,
        replica_id,
        page_size,
        batch_size,
        request_timeout_secs,
    });

    config.ensure_data_dir()?;
    config.save(&path)?;

    tracing::info!("Configuration saved to {}", path.display());
    Ok(())
}
