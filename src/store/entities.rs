use std::{collections::BTreeMap, collections::BTreeSet, path::PathBuf, time::Instant};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rocksdb::{DBWithThreadMode, Direction, IteratorMode, MultiThreaded, WriteBatch};
use serde::{Deserialize, Serialize};

use super::{key_with_segments, open_db, record_store_op};
use crate::{
    error::{RegistryError, Result, codes},
    model::{Entity, PotentialDuplicatePair, flatten_fields},
};

const PREFIX_ENTITY: &str = "ent";
const PREFIX_DUPLICATE: &str = "dup";

#[derive(Debug, Clone, Serialize, Deserialize)]
struct DuplicateRecord {
    pair: PotentialDuplicatePair,
    flagged_at: DateTime<Utc>,
}

/// Read side of the engine: current materialized state per entity, plus the
/// potential-duplicate flags.
pub struct EntityStore {
    db: DBWithThreadMode<MultiThreaded>,
    write_lock: Mutex<()>,
}

impl EntityStore {
    pub fn open(path: PathBuf) -> Result<Self> {
        Ok(Self {
            db: open_db(&path)?,
            write_lock: Mutex::new(()),
        })
    }

    pub fn get(&self, guid: &str) -> Result<Option<Entity>> {
        let value = self
            .db
            .get(entity_key(guid))
            .map_err(|err| RegistryError::Storage(err.to_string()))?;
        match value {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Writes the next state of an entity. The stored version must match the
    /// `previous` snapshot and `next` must advance it by exactly one; any
    /// other shape is a lost-update in progress and is refused.
    pub fn save(&self, previous: Option<&Entity>, next: &Entity) -> Result<()> {
        let _guard = self.write_lock.lock();

        let stored_version = self.get(&next.guid)?.map(|entity| entity.version);
        let expected = previous.map(|entity| entity.version);
        if stored_version != expected {
            return Err(RegistryError::domain(
                codes::VERSION_CONFLICT,
                format!(
                    "entity {} changed concurrently (stored {:?}, expected {:?})",
                    next.guid, stored_version, expected
                ),
            ));
        }
        if next.version != expected.unwrap_or(0) + 1 {
            return Err(RegistryError::domain(
                codes::VERSION_CONFLICT,
                format!(
                    "entity {} must advance version by one (got {}, had {:?})",
                    next.guid, next.version, expected
                ),
            ));
        }

        let start = Instant::now();
        let result = self
            .db
            .put(entity_key(&next.guid), serde_json::to_vec(next)?)
            .map_err(|err| RegistryError::Storage(err.to_string()));
        let duration = start.elapsed().as_secs_f64();
        record_store_op(
            "rocksdb_put_entity",
            if result.is_ok() { "ok" } else { "err" },
            duration,
        );
        result
    }

    pub fn delete(&self, guid: &str) -> Result<()> {
        let _guard = self.write_lock.lock();
        let start = Instant::now();
        let result = self
            .db
            .delete(entity_key(guid))
            .map_err(|err| RegistryError::Storage(err.to_string()));
        let duration = start.elapsed().as_secs_f64();
        record_store_op(
            "rocksdb_delete_entity",
            if result.is_ok() { "ok" } else { "err" },
            duration,
        );
        result
    }

    /// Conjunctive exact match over the dotted-path flattening of each
    /// entity's data. Empty criteria match nothing, not everything.
    pub fn search(&self, criteria: &BTreeMap<String, String>) -> Result<Vec<Entity>> {
        if criteria.is_empty() {
            return Ok(Vec::new());
        }
        self.scan_entities(|entity| {
            let fields = flatten_fields(&entity.data);
            criteria
                .iter()
                .all(|(path, expected)| fields.get(path) == Some(expected))
        })
    }

    pub fn find_by_external_id(&self, external_id: &str) -> Result<Option<Entity>> {
        let matches = self.scan_entities(|entity| {
            entity.external_id.as_deref() == Some(external_id)
        })?;
        Ok(matches.into_iter().next())
    }

    pub fn all(&self) -> Result<Vec<Entity>> {
        self.scan_entities(|_| true)
    }

    /// Persists candidate pairs in both directions so either side discovers
    /// the flag.
    pub fn flag_duplicates(&self, pairs: &[PotentialDuplicatePair]) -> Result<()> {
        if pairs.is_empty() {
            return Ok(());
        }
        let _guard = self.write_lock.lock();
        let flagged_at = Utc::now();
        let mut batch = WriteBatch::default();
        for pair in pairs {
            for direction in [pair.clone(), pair.reversed()] {
                let record = DuplicateRecord {
                    pair: direction.clone(),
                    flagged_at,
                };
                batch.put(
                    duplicate_key(&direction.entity_guid, &direction.duplicate_guid),
                    serde_json::to_vec(&record)?,
                );
            }
        }
        self.write_batch(batch, "rocksdb_flag_duplicates")
    }

    /// Clears flags in both directions. The only path that removes a pair.
    pub fn resolve_duplicates(&self, pairs: &[PotentialDuplicatePair]) -> Result<()> {
        if pairs.is_empty() {
            return Ok(());
        }
        let _guard = self.write_lock.lock();
        let mut batch = WriteBatch::default();
        for pair in pairs {
            batch.delete(duplicate_key(&pair.entity_guid, &pair.duplicate_guid));
            batch.delete(duplicate_key(&pair.duplicate_guid, &pair.entity_guid));
        }
        self.write_batch(batch, "rocksdb_resolve_duplicates")
    }

    /// Pending pairs, one row per unordered pair.
    pub fn list_duplicates(&self) -> Result<Vec<PotentialDuplicatePair>> {
        let mut seen = BTreeSet::new();
        let mut pairs = Vec::new();
        for record in self.scan_duplicates()? {
            let normalized = record.pair.normalized();
            if seen.insert(normalized.clone()) {
                pairs.push(PotentialDuplicatePair::new(normalized.0, normalized.1));
            }
        }
        Ok(pairs)
    }

    /// Pairs flagged against one entity, both directions included.
    pub fn duplicates_for(&self, guid: &str) -> Result<Vec<PotentialDuplicatePair>> {
        Ok(self
            .scan_duplicates()?
            .into_iter()
            .map(|record| record.pair)
            .filter(|pair| pair.entity_guid == guid)
            .collect())
    }

    pub fn has_unresolved_duplicates(&self) -> Result<bool> {
        let prefix = duplicate_prefix();
        let iter = self
            .db
            .iterator(IteratorMode::From(prefix.as_slice(), Direction::Forward));
        for item in iter {
            let (key, _) = item.map_err(|err| RegistryError::Storage(err.to_string()))?;
            return Ok(key.starts_with(prefix.as_slice()));
        }
        Ok(false)
    }

    fn scan_entities<F>(&self, mut keep: F) -> Result<Vec<Entity>>
    where
        F: FnMut(&Entity) -> bool,
    {
        let start = Instant::now();
        let result = (|| {
            let prefix = entity_prefix();
            let iter = self
                .db
                .iterator(IteratorMode::From(prefix.as_slice(), Direction::Forward));
            let mut entities = Vec::new();
            for item in iter {
                let (key, value) = item.map_err(|err| RegistryError::Storage(err.to_string()))?;
                if !key.starts_with(prefix.as_slice()) {
                    break;
                }
                let entity: Entity = serde_json::from_slice(&value)?;
                if keep(&entity) {
                    entities.push(entity);
                }
            }
            Ok(entities)
        })();
        let duration = start.elapsed().as_secs_f64();
        record_store_op(
            "rocksdb_scan_entities",
            if result.is_ok() { "ok" } else { "err" },
            duration,
        );
        result
    }

    fn scan_duplicates(&self) -> Result<Vec<DuplicateRecord>> {
        let prefix = duplicate_prefix();
        let iter = self
            .db
            .iterator(IteratorMode::From(prefix.as_slice(), Direction::Forward));
        let mut records = Vec::new();
        for item in iter {
            let (key, value) = item.map_err(|err| RegistryError::Storage(err.to_string()))?;
            if !key.starts_with(prefix.as_slice()) {
                break;
            }
            records.push(serde_json::from_slice(&value)?);
        }
        Ok(records)
    }

    fn write_batch(&self, batch: WriteBatch, metric: &'static str) -> Result<()> {
        let start = Instant::now();
        let result = self
            .db
            .write(batch)
            .map_err(|err| RegistryError::Storage(err.to_string()));
        let duration = start.elapsed().as_secs_f64();
        record_store_op(metric, if result.is_ok() { "ok" } else { "err" }, duration);
        result
    }
}

fn entity_prefix() -> Vec<u8> {
    let mut key = key_with_segments(&[PREFIX_ENTITY]);
    key.push(super::SEP);
    key
}

fn entity_key(guid: &str) -> Vec<u8> {
    key_with_segments(&[PREFIX_ENTITY, guid])
}

fn duplicate_prefix() -> Vec<u8> {
    let mut key = key_with_segments(&[PREFIX_DUPLICATE]);
    key.push(super::SEP);
    key
}

fn duplicate_key(entity_guid: &str, duplicate_guid: &str) -> Vec<u8> {
    key_with_segments(&[PREFIX_DUPLICATE, entity_guid, duplicate_guid])
}
