pub mod entities;
pub mod events;

pub use entities::EntityStore;
pub use events::{AppendOutcome, EventStore, LogCursor, WatermarkKind};

use metrics::{counter, histogram};
use rocksdb::{DBWithThreadMode, MultiThreaded, Options};
use std::path::Path;

use crate::error::{RegistryError, Result};

pub(crate) const SEP: u8 = 0x1F;

pub(crate) fn open_db(path: &Path) -> Result<DBWithThreadMode<MultiThreaded>> {
    let mut options = Options::default();
    options.create_if_missing(true);
    DBWithThreadMode::<MultiThreaded>::open(&options, path)
        .map_err(|err| RegistryError::Storage(err.to_string()))
}

pub(crate) fn key_with_segments(parts: &[&str]) -> Vec<u8> {
    let mut key = Vec::new();
    let mut iter = parts.iter();
    if let Some(first) = iter.next() {
        key.extend_from_slice(first.as_bytes());
    }
    for part in iter {
        key.push(SEP);
        key.extend_from_slice(part.as_bytes());
    }
    key
}

pub(crate) fn record_store_op(operation: &'static str, status: &'static str, duration: f64) {
    let labels = [("operation", operation), ("status", status)];
    counter!("rosterdbx_store_operations_total", &labels).increment(1);
    histogram!("rosterdbx_store_operation_duration_seconds", &labels).record(duration);
}
