use std::{fmt, path::PathBuf, str::FromStr, time::Instant};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rocksdb::{DBWithThreadMode, Direction, IteratorMode, MultiThreaded, WriteBatch};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use super::{SEP, key_with_segments, open_db, record_store_op};
use crate::{
    error::{RegistryError, Result},
    merkle::{MerkleProof, compute_merkle_root, empty_root, membership_proof, verify_membership},
    model::{AuditLogEntry, Event, StoredEvent, SyncLevel, flatten_fields},
    sequence::{MAX_REPLICA_ID, SequenceGenerator, SequenceId},
};

const PREFIX_LOG: &str = "log";
const PREFIX_GUID: &str = "guid";
const PREFIX_AUDIT: &str = "audit";
const PREFIX_WATERMARK: &str = "wm";
const PREFIX_META: &str = "meta";
const META_HASHES: &str = "hashes";
const META_ROOT: &str = "root";

/// Named resume points for the sync coordinators. Each kind advances
/// independently.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatermarkKind {
    ExternalPush,
    ExternalPull,
    AuditPush,
    AuditPull,
}

impl WatermarkKind {
    pub fn as_str(self) -> &'static str {
        match self {
            WatermarkKind::ExternalPush => "external-push",
            WatermarkKind::ExternalPull => "external-pull",
            WatermarkKind::AuditPush => "audit-push",
            WatermarkKind::AuditPull => "audit-pull",
        }
    }
}

/// Resume position in the log: the `(timestamp, sequence)` pair of the last
/// event already seen. Round-trips as `"<millis>-<sequence>"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogCursor {
    pub timestamp_millis: i64,
    pub sequence: u64,
}

impl LogCursor {
    pub fn for_event(event: &StoredEvent) -> Self {
        Self {
            timestamp_millis: event.event.timestamp.timestamp_millis(),
            sequence: event.sequence.as_u64(),
        }
    }

    /// Cursor positioned past every event at or before `at`.
    pub fn after_timestamp(at: DateTime<Utc>) -> Self {
        Self {
            timestamp_millis: at.timestamp_millis(),
            sequence: u64::MAX,
        }
    }
}

impl fmt::Display for LogCursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.timestamp_millis, self.sequence)
    }
}

impl FromStr for LogCursor {
    type Err = RegistryError;

    fn from_str(value: &str) -> Result<Self> {
        let (millis, sequence) = value
            .split_once('-')
            .ok_or_else(|| RegistryError::InvalidCursor(value.to_string()))?;
        Ok(Self {
            timestamp_millis: millis
                .parse()
                .map_err(|_| RegistryError::InvalidCursor(value.to_string()))?,
            sequence: sequence
                .parse()
                .map_err(|_| RegistryError::InvalidCursor(value.to_string()))?,
        })
    }
}

/// Result of a durable append. `deduplicated` is set when the guid was
/// already in the log and nothing was written.
#[derive(Debug, Clone)]
pub struct AppendOutcome {
    pub sequence: SequenceId,
    pub position: u64,
    pub hash: String,
    pub deduplicated: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct EventPointer {
    timestamp_millis: i64,
    sequence: u64,
    position: u64,
    hash: String,
}

/// Append-only, timestamp-ordered event log plus the audit trail, sync
/// watermarks, and the integrity digest over the log.
pub struct EventStore {
    db: DBWithThreadMode<MultiThreaded>,
    write_lock: Mutex<()>,
    id_generator: Mutex<SequenceGenerator>,
}

impl EventStore {
    pub fn open(path: PathBuf, replica_id: u16) -> Result<Self> {
        if replica_id > MAX_REPLICA_ID {
            return Err(RegistryError::Config(format!(
                "replica id {} exceeds maximum {}",
                replica_id, MAX_REPLICA_ID
            )));
        }

        Ok(Self {
            db: open_db(&path)?,
            write_lock: Mutex::new(()),
            id_generator: Mutex::new(SequenceGenerator::new(replica_id)),
        })
    }

    /// Durably appends the event, keyed so iteration yields timestamp order
    /// with insertion order breaking ties. Appending a guid that is already
    /// logged is a no-op reporting `deduplicated`.
    pub fn append(&self, event: &Event) -> Result<AppendOutcome> {
        let _guard = self.write_lock.lock();

        if let Some(pointer) = self.load_pointer(&event.guid)? {
            return Ok(AppendOutcome {
                sequence: SequenceId::from_u64(pointer.sequence),
                position: pointer.position,
                hash: pointer.hash,
                deduplicated: true,
            });
        }

        let sequence = self.id_generator.lock().next_id();
        let hash = hash_event(event);
        let mut hashes = self.load_hashes()?;
        let position = hashes.len() as u64;
        hashes.push(hash.clone());
        let root = compute_merkle_root(&hashes);

        let stored = StoredEvent {
            sequence,
            position,
            hash: hash.clone(),
            event: event.clone(),
        };
        let pointer = EventPointer {
            timestamp_millis: event.timestamp.timestamp_millis(),
            sequence: sequence.as_u64(),
            position,
            hash: hash.clone(),
        };

        let mut batch = WriteBatch::default();
        batch.put(
            log_key(pointer.timestamp_millis, pointer.sequence),
            serde_json::to_vec(&stored)?,
        );
        batch.put(guid_key(&event.guid), serde_json::to_vec(&pointer)?);
        batch.put(meta_key(META_HASHES), serde_json::to_vec(&hashes)?);
        batch.put(meta_key(META_ROOT), root.into_bytes());
        self.write_batch(batch, "rocksdb_append_event")?;

        Ok(AppendOutcome {
            sequence,
            position,
            hash,
            deduplicated: false,
        })
    }

    pub fn contains(&self, guid: &str) -> Result<bool> {
        Ok(self.load_pointer(guid)?.is_some())
    }

    pub fn get(&self, guid: &str) -> Result<Option<StoredEvent>> {
        let Some(pointer) = self.load_pointer(guid)? else {
            return Ok(None);
        };
        let key = log_key(pointer.timestamp_millis, pointer.sequence);
        let value = self
            .db
            .get(key)
            .map_err(|err| RegistryError::Storage(err.to_string()))?;
        match value {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    /// One ascending page of the log strictly after `cursor`. The returned
    /// cursor is `None` once the log is exhausted.
    pub fn events_since(
        &self,
        cursor: Option<&LogCursor>,
        limit: usize,
    ) -> Result<(Vec<StoredEvent>, Option<LogCursor>)> {
        if limit == 0 {
            return Ok((Vec::new(), None));
        }

        let start = Instant::now();
        let result = (|| {
            let prefix = log_prefix();
            let start_key = match cursor {
                Some(cursor) => match cursor.sequence.checked_add(1) {
                    Some(sequence) => log_key(cursor.timestamp_millis, sequence),
                    None => log_key(cursor.timestamp_millis + 1, 0),
                },
                None => prefix.clone(),
            };
            let iter = self
                .db
                .iterator(IteratorMode::From(start_key.as_slice(), Direction::Forward));

            let mut events = Vec::new();
            for item in iter {
                let (key, value) = item.map_err(|err| RegistryError::Storage(err.to_string()))?;
                if !key.starts_with(prefix.as_slice()) {
                    break;
                }
                let record: StoredEvent = serde_json::from_slice(&value)?;
                events.push(record);
                if events.len() > limit {
                    break;
                }
            }

            let next = if events.len() > limit {
                events.truncate(limit);
                events.last().map(LogCursor::for_event)
            } else {
                None
            };
            Ok((events, next))
        })();
        let duration = start.elapsed().as_secs_f64();
        record_store_op(
            "rocksdb_iter_events",
            if result.is_ok() { "ok" } else { "err" },
            duration,
        );
        result
    }

    /// All events awaiting an internal push, in log order.
    pub fn pending_push(&self) -> Result<Vec<StoredEvent>> {
        self.scan_log(|record| record.event.sync_level == SyncLevel::Local)
    }

    /// Events of one subject, in log order. Input to the replay fold.
    pub fn events_for_entity(&self, entity_guid: &str) -> Result<Vec<StoredEvent>> {
        self.scan_log(|record| record.event.entity_guid == entity_guid)
    }

    pub fn log_count(&self) -> Result<u64> {
        Ok(self.load_hashes()?.len() as u64)
    }

    /// Upgrades the provenance tag of a logged event to server-accepted.
    /// The only mutation an event ever sees; the content hash does not cover
    /// the tag, so the integrity digest is unaffected.
    pub fn mark_synced(&self, guid: &str) -> Result<()> {
        let _guard = self.write_lock.lock();
        let Some(pointer) = self.load_pointer(guid)? else {
            return Err(RegistryError::Storage(format!(
                "event {guid} is not in the log"
            )));
        };
        let key = log_key(pointer.timestamp_millis, pointer.sequence);
        let value = self
            .db
            .get(&key)
            .map_err(|err| RegistryError::Storage(err.to_string()))?
            .ok_or_else(|| RegistryError::Storage(format!("log entry missing for {guid}")))?;
        let mut record: StoredEvent = serde_json::from_slice(&value)?;
        record.event.sync_level = SyncLevel::Synced;
        self.db
            .put(key, serde_json::to_vec(&record)?)
            .map_err(|err| RegistryError::Storage(err.to_string()))?;
        Ok(())
    }

    /// Current merkle root over the ordered event hashes.
    pub fn integrity_root(&self) -> Result<String> {
        let value = self
            .db
            .get(meta_key(META_ROOT))
            .map_err(|err| RegistryError::Storage(err.to_string()))?;
        match value {
            Some(bytes) => String::from_utf8(bytes)
                .map_err(|err| RegistryError::Storage(err.to_string())),
            None => Ok(empty_root()),
        }
    }

    pub fn membership_proof(&self, guid: &str) -> Result<Option<MerkleProof>> {
        let Some(pointer) = self.load_pointer(guid)? else {
            return Ok(None);
        };
        let hashes = self.load_hashes()?;
        Ok(membership_proof(&hashes, pointer.position as usize))
    }

    /// Proves `event` is a member of this log: the leaf hash must recompute
    /// from the event content and the sibling path must reach the current
    /// root.
    pub fn verify(&self, event: &Event, proof: &MerkleProof) -> Result<bool> {
        if hash_event(event) != proof.leaf {
            return Ok(false);
        }
        let root = self.integrity_root()?;
        Ok(verify_membership(&root, proof))
    }

    /// Records one audit entry. Keyed by timestamp and guid, so re-pushing
    /// the same entry during audit sync overwrites itself.
    pub fn append_audit(&self, entry: &AuditLogEntry) -> Result<()> {
        let start = Instant::now();
        let result = self
            .db
            .put(
                audit_key(entry.timestamp.timestamp_millis(), &entry.guid),
                serde_json::to_vec(entry)?,
            )
            .map_err(|err| RegistryError::Storage(err.to_string()));
        let duration = start.elapsed().as_secs_f64();
        record_store_op(
            "rocksdb_append_audit",
            if result.is_ok() { "ok" } else { "err" },
            duration,
        );
        result
    }

    /// Audit entries strictly after `since`, ascending, up to `limit`.
    pub fn audit_since(
        &self,
        since: Option<DateTime<Utc>>,
        limit: Option<usize>,
    ) -> Result<Vec<AuditLogEntry>> {
        let prefix = audit_prefix();
        let start_key = match since {
            Some(since) => {
                let mut key = prefix.clone();
                key.extend_from_slice(&encode_millis(since.timestamp_millis() + 1));
                key
            }
            None => prefix.clone(),
        };
        let iter = self
            .db
            .iterator(IteratorMode::From(start_key.as_slice(), Direction::Forward));

        let mut entries = Vec::new();
        for item in iter {
            let (key, value) = item.map_err(|err| RegistryError::Storage(err.to_string()))?;
            if !key.starts_with(prefix.as_slice()) {
                break;
            }
            entries.push(serde_json::from_slice(&value)?);
            if let Some(cap) = limit {
                if entries.len() >= cap {
                    break;
                }
            }
        }
        Ok(entries)
    }

    /// Resume cursor for internal pulls. The value is opaque to this
    /// replica: it names a position in the *server's* log.
    pub fn pull_cursor(&self) -> Result<Option<String>> {
        let value = self
            .db
            .get(key_with_segments(&[PREFIX_WATERMARK, "internal-pull"]))
            .map_err(|err| RegistryError::Storage(err.to_string()))?;
        match value {
            Some(bytes) => String::from_utf8(bytes)
                .map(Some)
                .map_err(|err| RegistryError::Storage(err.to_string())),
            None => Ok(None),
        }
    }

    pub fn set_pull_cursor(&self, cursor: &str) -> Result<()> {
        self.db
            .put(
                key_with_segments(&[PREFIX_WATERMARK, "internal-pull"]),
                cursor.as_bytes(),
            )
            .map_err(|err| RegistryError::Storage(err.to_string()))
    }

    pub fn watermark(&self, kind: WatermarkKind) -> Result<Option<DateTime<Utc>>> {
        let value = self
            .db
            .get(watermark_key(kind))
            .map_err(|err| RegistryError::Storage(err.to_string()))?;
        match value {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn set_watermark(&self, kind: WatermarkKind, at: DateTime<Utc>) -> Result<()> {
        self.db
            .put(watermark_key(kind), serde_json::to_vec(&at)?)
            .map_err(|err| RegistryError::Storage(err.to_string()))
    }

    fn scan_log<F>(&self, mut keep: F) -> Result<Vec<StoredEvent>>
    where
        F: FnMut(&StoredEvent) -> bool,
    {
        let start = Instant::now();
        let result = (|| {
            let prefix = log_prefix();
            let iter = self
                .db
                .iterator(IteratorMode::From(prefix.as_slice(), Direction::Forward));
            let mut events = Vec::new();
            for item in iter {
                let (key, value) = item.map_err(|err| RegistryError::Storage(err.to_string()))?;
                if !key.starts_with(prefix.as_slice()) {
                    break;
                }
                let record: StoredEvent = serde_json::from_slice(&value)?;
                if keep(&record) {
                    events.push(record);
                }
            }
            Ok(events)
        })();
        let duration = start.elapsed().as_secs_f64();
        record_store_op(
            "rocksdb_scan_log",
            if result.is_ok() { "ok" } else { "err" },
            duration,
        );
        result
    }

    fn load_pointer(&self, guid: &str) -> Result<Option<EventPointer>> {
        let value = self
            .db
            .get(guid_key(guid))
            .map_err(|err| RegistryError::Storage(err.to_string()))?;
        match value {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    fn load_hashes(&self) -> Result<Vec<String>> {
        let value = self
            .db
            .get(meta_key(META_HASHES))
            .map_err(|err| RegistryError::Storage(err.to_string()))?;
        match value {
            Some(bytes) => Ok(serde_json::from_slice(&bytes)?),
            None => Ok(Vec::new()),
        }
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

fn encode_millis(millis: i64) -> [u8; 8] {
    // Offset so negative timestamps still sort byte-wise ascending.
    ((millis as u64) ^ (1 << 63)).to_be_bytes()
}

fn log_prefix() -> Vec<u8> {
    let mut key = key_with_segments(&[PREFIX_LOG]);
    key.push(SEP);
    key
}

fn log_key(timestamp_millis: i64, sequence: u64) -> Vec<u8> {
    let mut key = log_prefix();
    key.extend_from_slice(&encode_millis(timestamp_millis));
    key.extend_from_slice(&sequence.to_be_bytes());
    key
}

fn guid_key(guid: &str) -> Vec<u8> {
    key_with_segments(&[PREFIX_GUID, guid])
}

fn audit_prefix() -> Vec<u8> {
    let mut key = key_with_segments(&[PREFIX_AUDIT]);
    key.push(SEP);
    key
}

fn audit_key(timestamp_millis: i64, guid: &str) -> Vec<u8> {
    let mut key = audit_prefix();
    key.extend_from_slice(&encode_millis(timestamp_millis));
    key.push(SEP);
    key.extend_from_slice(guid.as_bytes());
    key
}

fn watermark_key(kind: WatermarkKind) -> Vec<u8> {
    key_with_segments(&[PREFIX_WATERMARK, kind.as_str()])
}

fn meta_key(name: &str) -> Vec<u8> {
    key_with_segments(&[PREFIX_META, name])
}

/// Content hash of an event. Sequence and provenance are excluded so the
/// hash is identical on every replica that holds the event.
pub fn hash_event(event: &Event) -> String {
    let mut hasher = Sha256::new();
    hasher.update(event.guid.as_bytes());
    hasher.update(event.entity_guid.as_bytes());
    hasher.update(event.event_type.as_bytes());
    hasher.update(event.timestamp.timestamp_millis().to_be_bytes());
    for (key, value) in flatten_fields(&event.data) {
        hasher.update(key.as_bytes());
        hasher.update(value.as_bytes());
    }
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn store() -> (tempfile::TempDir, EventStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = EventStore::open(dir.path().join("events.db"), 0).unwrap();
        (dir, store)
    }

    fn sample(entity: &str) -> Event {
        Event::new(entity, "create-individual", json!({ "name": "Ada" }), "u-1")
    }

    #[test]
    fn append_assigns_positions_in_order() {
        let (_dir, store) = store();
        let first = store.append(&sample("e-1")).unwrap();
        let second = store.append(&sample("e-2")).unwrap();
        assert_eq!(first.position, 0);
        assert_eq!(second.position, 1);
        assert!(second.sequence > first.sequence);
        assert_eq!(store.log_count().unwrap(), 2);
    }

    #[test]
    fn append_is_idempotent_per_guid() {
        let (_dir, store) = store();
        let event = sample("e-1");
        let first = store.append(&event).unwrap();
        assert!(!first.deduplicated);
        let again = store.append(&event).unwrap();
        assert!(again.deduplicated);
        assert_eq!(again.position, first.position);
        assert_eq!(store.log_count().unwrap(), 1);
    }

    #[test]
    fn pagination_covers_the_log_without_repeats() {
        let (_dir, store) = store();
        for index in 0..25 {
            store.append(&sample(&format!("e-{index}"))).unwrap();
        }

        let mut seen = Vec::new();
        let mut cursor = None;
        let mut pages = Vec::new();
        loop {
            let (events, next) = store.events_since(cursor.as_ref(), 10).unwrap();
            pages.push(events.len());
            seen.extend(events.iter().map(|record| record.event.guid.clone()));
            match next {
                Some(next) => cursor = Some(next),
                None => break,
            }
        }

        assert_eq!(pages, vec![10, 10, 5]);
        assert_eq!(seen.len(), 25);
        let unique: std::collections::BTreeSet<_> = seen.iter().collect();
        assert_eq!(unique.len(), 25);
    }

    #[test]
    fn events_come_back_in_timestamp_order() {
        let (_dir, store) = store();
        let mut early = sample("e-early");
        early.timestamp = Utc::now() - chrono::Duration::minutes(5);
        let late = sample("e-late");
        store.append(&late).unwrap();
        store.append(&early).unwrap();

        let (events, _) = store.events_since(None, 10).unwrap();
        assert_eq!(events[0].event.entity_guid, "e-early");
        assert_eq!(events[1].event.entity_guid, "e-late");
    }

    #[test]
    fn proofs_verify_against_the_current_root() {
        let (_dir, store) = store();
        let event = sample("e-1");
        store.append(&event).unwrap();
        for index in 0..6 {
            store.append(&sample(&format!("more-{index}"))).unwrap();
        }

        let proof = store.membership_proof(&event.guid).unwrap().unwrap();
        assert!(store.verify(&event, &proof).unwrap());

        let mut forged = event.clone();
        forged.data = json!({ "name": "Mallory" });
        assert!(!store.verify(&forged, &proof).unwrap());
    }

    #[test]
    fn mark_synced_keeps_the_digest_stable(){
        let (_dir, store) = store();
        let event = sample("e-1");
        store.append(&event).unwrap();
        let root = store.integrity_root().unwrap();

        store.mark_synced(&event.guid).unwrap();
        let record = store.get(&event.guid).unwrap().unwrap();
        assert_eq!(record.event.sync_level, SyncLevel::Synced);
        assert_eq!(store.integrity_root().unwrap(), root);
        assert!(store.pending_push().unwrap().is_empty());
    }

    #[test]
    fn watermarks_are_independent() {
        let (_dir, store) = store();
        let now = Utc::now();
        store
            .set_watermark(WatermarkKind::ExternalPush, now)
            .unwrap();
        assert_eq!(store.watermark(WatermarkKind::ExternalPush).unwrap(), Some(now));
        assert_eq!(store.watermark(WatermarkKind::ExternalPull).unwrap(), None);
        assert_eq!(store.watermark(WatermarkKind::AuditPull).unwrap(), None);

        store.set_pull_cursor("1700000000000-42").unwrap();
        assert_eq!(
            store.pull_cursor().unwrap().as_deref(),
            Some("1700000000000-42")
        );
    }

    #[test]
    fn audit_since_filters_by_timestamp() {
        let (_dir, store) = store();
        let mut first = AuditLogEntry::new("u-1", "create-individual", "evt-1", "e-1", json!({}));
        first.timestamp = Utc::now() - chrono::Duration::minutes(10);
        let second = AuditLogEntry::new("u-1", "update-individual", "evt-2", "e-1", json!({}));
        store.append_audit(&first).unwrap();
        store.append_audit(&second).unwrap();

        let all = store.audit_since(None, None).unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].guid, first.guid);

        let recent = store.audit_since(Some(first.timestamp), None).unwrap();
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].guid, second.guid);
    }
}
