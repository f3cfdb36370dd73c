use std::{path::PathBuf, sync::Arc};

use anyhow::{Result, anyhow};
use clap::Args;

use rosterdbx::sync::{
    external::{AdapterCredentials, AdapterRegistry, ExternalSync},
    internal::InternalSync,
};

use super::{load_config, open_engine};

#[derive(Args)]
pub struct SyncArgs {
    /// Push local events to the configured server
    #[arg(long)]
    pub push: bool,

    /// Pull new events from the configured server
    #[arg(long)]
    pub pull: bool,

    /// Also sync the audit trail
    #[arg(long)]
    pub audit: bool,

    /// Run one cycle against the named external target
    #[arg(long, value_name = "CONFIG_ID")]
    pub external: Option<String>,

    #[arg(long)]
    pub username: Option<String>,

    #[arg(long)]
    pub password: Option<String>,

    #[arg(long)]
    pub token: Option<String>,

    /// Acting user recorded on imported events
    #[arg(long, default_value = "sync-cli")]
    pub user: String,
}

pub async fn execute(config_path: Option<PathBuf>, args: SyncArgs) -> Result<()> {
    let config = load_config(config_path)?;
    let engine = open_engine(&config)?;

    if args.push || args.pull || args.audit {
        let remote = config
            .remote
            .clone()
            .ok_or_else(|| anyhow!("no [remote] server configured; run `rosterdbx config` first"))?;
        let internal = InternalSync::new(Arc::clone(&engine), remote, config.request_timeout())?;

        if args.push {
            let report = internal.push().await?;
            println!(
                "pushed {} events ({} skipped by the server)",
                report.applied(),
                report.failed()
            );
        }
        if args.pull {
            let report = internal.pull().await?;
            println!(
                "pulled {} pages, applied {} events ({} failed)",
                report.pages,
                report.report.applied(),
                report.report.failed()
            );
        }
        if args.audit {
            let pushed = internal.push_audit().await?;
            let pulled = internal.pull_audit().await?;
            println!("audit trail: pushed {pushed}, pulled {pulled}");
        }
    }

    if let Some(config_id) = args.external {
        let registry = Arc::new(AdapterRegistry::with_builtins());
        let external = ExternalSync::new(engine, registry, &config);
        let credentials = AdapterCredentials {
            username: args.username,
            password: args.password,
            token: args.token,
        };
        let report = external.run(&config_id, &credentials, &args.user).await?;
        println!(
            "external '{}': pushed {} events in {} batches, imported {} records ({} failed)",
            config_id,
            report.pushed,
            report.pushed_batches,
            report.imported.applied(),
            report.imported.failed()
        );
        if let Some(error) = report.push_error {
            println!("push stopped early: {error}");
        }
    }

    Ok(())
}
