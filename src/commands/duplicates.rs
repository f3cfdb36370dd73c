use std::path::PathBuf;

use anyhow::Result;
use clap::Subcommand;
use serde_json::json;

use rosterdbx::model::Event;

use super::{load_config, open_engine};

#[derive(Subcommand)]
pub enum DuplicateCommands {
    /// List pending potential duplicate pairs
    List,
    /// Resolve one pair, optionally discarding the duplicate entity
    Resolve {
        #[arg(long)]
        entity: String,

        #[arg(long)]
        duplicate: String,

        /// Cascade-delete the duplicate entity after clearing the flag
        #[arg(long)]
        delete: bool,

        #[arg(long, default_value = "cli")]
        user: String,
    },
}

pub fn execute(config_path: Option<PathBuf>, command: DuplicateCommands) -> Result<()> {
    let config = load_config(config_path)?;
    let engine = open_engine(&config)?;

    match command {
        DuplicateCommands::List => {
            let pairs = engine.entity_store().list_duplicates()?;
            if pairs.is_empty() {
                println!("no pending duplicates");
                return Ok(());
            }
            for pair in pairs {
                println!("{}  <->  {}", pair.entity_guid, pair.duplicate_guid);
            }
        }
        DuplicateCommands::Resolve {
            entity,
            duplicate,
            delete,
            user,
        } => {
            let event = Event::new(
                entity,
                "resolve-duplicate",
                json!({ "duplicateGuid": duplicate, "shouldDelete": delete }),
                user,
            );
            engine.submit_form(event)?;
            println!("pair resolved");
        }
    }
    Ok(())
}
