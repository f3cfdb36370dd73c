use std::path::PathBuf;

use anyhow::Result;
use clap::Args;

use super::{load_config, open_engine};

#[derive(Args)]
pub struct VerifyArgs {
    /// Entity guid to check
    pub guid: String,
}

pub fn execute(config_path: Option<PathBuf>, args: VerifyArgs) -> Result<()> {
    let config = load_config(config_path)?;
    let engine = open_engine(&config)?;
    let events = engine.event_store();

    println!("integrity root: {}", events.integrity_root()?);

    let stored = engine.entity_store().get(&args.guid)?;
    let replayed = engine.replay_entity(&args.guid)?;
    match (&stored, &replayed) {
        (Some(current), Some(folded)) if current == folded => {
            println!("replay: consistent at version {}", current.version);
        }
        (None, None) => println!("replay: entity unknown"),
        _ => println!("replay: MISMATCH between log fold and stored state"),
    }

    let history = events.events_for_entity(&args.guid)?;
    match history.last() {
        Some(latest) => {
            let valid = match events.membership_proof(&latest.event.guid)? {
                Some(proof) => events.verify(&latest.event, &proof)?,
                None => false,
            };
            println!(
                "latest event {}: membership proof {}",
                latest.event.guid,
                if valid { "valid" } else { "INVALID" }
            );
        }
        None => println!("no events recorded for this entity"),
    }

    Ok(())
}
