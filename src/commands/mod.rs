pub mod config;
pub mod duplicates;
pub mod start;
pub mod sync;
pub mod verify;

use std::{path::PathBuf, sync::Arc};

use anyhow::Result;
use rosterdbx::{
    config::{Config, load_or_default},
    engine::EventEngine,
    store::{EntityStore, EventStore},
};

/// Opens the stores at the configured data dir and wires the engine the way
/// the server does. Fails if another process holds the store locks.
pub(crate) fn open_engine(config: &Config) -> Result<Arc<EventEngine>> {
    config.ensure_data_dir()?;
    let events = Arc::new(EventStore::open(
        config.event_store_path(),
        config.replica_id,
    )?);
    let entities = Arc::new(EntityStore::open(config.entity_store_path())?);
    Ok(Arc::new(EventEngine::new(events, entities)))
}

pub(crate) fn load_config(path: Option<PathBuf>) -> Result<Config> {
    let (config, _) = load_or_default(path)?;
    Ok(config)
}
