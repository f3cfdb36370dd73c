use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

use crate::sequence::SequenceId;

/// Provenance tag carried by every event. Controls what the sync
/// coordinators are allowed to do with it: `Local` events are candidates for
/// an internal push, `External` events are never re-exported.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncLevel {
    /// Created on this replica, not yet accepted by the server.
    Local,
    /// Accepted by (or received from) the server replica.
    Synced,
    /// Imported from a third-party registry.
    External,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityKind {
    Individual,
    Group,
}

impl EntityKind {
    pub fn as_str(self) -> &'static str {
        match self {
            EntityKind::Individual => "individual",
            EntityKind::Group => "group",
        }
    }
}

/// Immutable command record. Field names follow the wire contract
/// (camelCase JSON).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    pub guid: String,
    pub entity_guid: String,
    #[serde(rename = "type")]
    pub event_type: String,
    pub data: Value,
    pub timestamp: DateTime<Utc>,
    pub user_id: String,
    pub sync_level: SyncLevel,
}

impl Event {
    pub fn new(
        entity_guid: impl Into<String>,
        event_type: impl Into<String>,
        data: Value,
        user_id: impl Into<String>,
    ) -> Self {
        Self {
            guid: uuid::Uuid::new_v4().to_string(),
            entity_guid: entity_guid.into(),
            event_type: event_type.into(),
            data,
            timestamp: Utc::now(),
            user_id: user_id.into(),
            sync_level: SyncLevel::Local,
        }
    }
}

/// Log representation of an accepted event. `position` is the leaf index in
/// the integrity tree; `hash` is content-derived (guid, subject, type,
/// timestamp, flattened data) so it is stable across replicas even though
/// each replica assigns its own `sequence`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredEvent {
    pub sequence: SequenceId,
    pub position: u64,
    pub hash: String,
    #[serde(flatten)]
    pub event: Event,
}

/// Current materialized state of one subject.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Entity {
    pub id: u64,
    pub guid: String,
    #[serde(rename = "type")]
    pub kind: EntityKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub version: u64,
    pub data: Value,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub member_ids: Vec<String>,
    pub last_updated: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external_id: Option<String>,
}

impl Entity {
    pub fn new(id: u64, guid: impl Into<String>, kind: EntityKind, timestamp: DateTime<Utc>) -> Self {
        Self {
            id,
            guid: guid.into(),
            kind,
            name: None,
            version: 0,
            data: Value::Object(Map::new()),
            member_ids: Vec::new(),
            last_updated: timestamp,
            external_id: None,
        }
    }

    pub fn is_group(&self) -> bool {
        self.kind == EntityKind::Group
    }
}

/// Snapshot around one mutation. Never persisted; exists to compute the
/// audit diff.
#[derive(Debug, Clone)]
pub struct EntityPair {
    pub initial: Option<Entity>,
    pub modified: Option<Entity>,
}

impl EntityPair {
    /// Field-level diff of the flattened entity data, shaped
    /// `{ "<field>": { "from": ..., "to": ... } }`.
    pub fn changes(&self) -> Value {
        let before = self
            .initial
            .as_ref()
            .map(|entity| flatten_fields(&entity.data))
            .unwrap_or_default();
        let after = self
            .modified
            .as_ref()
            .map(|entity| flatten_fields(&entity.data))
            .unwrap_or_default();

        let mut changes = Map::new();
        for (field, value) in &after {
            match before.get(field) {
                Some(previous) if previous == value => {}
                Some(previous) => {
                    changes.insert(field.clone(), json!({ "from": previous, "to": value }));
                }
                None => {
                    changes.insert(field.clone(), json!({ "from": Value::Null, "to": value }));
                }
            }
        }
        for (field, value) in &before {
            if !after.contains_key(field) {
                changes.insert(field.clone(), json!({ "from": value, "to": Value::Null }));
            }
        }

        let members_before = self
            .initial
            .as_ref()
            .map(|entity| entity.member_ids.clone())
            .unwrap_or_default();
        let members_after = self
            .modified
            .as_ref()
            .map(|entity| entity.member_ids.clone())
            .unwrap_or_default();
        if members_before != members_after {
            changes.insert(
                "memberIds".to_string(),
                json!({ "from": members_before, "to": members_after }),
            );
        }

        Value::Object(changes)
    }
}

/// One audit record per accepted mutation. `signature` is reserved and
/// always empty.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditLogEntry {
    pub guid: String,
    pub timestamp: DateTime<Utc>,
    pub user_id: String,
    pub action: String,
    pub event_guid: String,
    pub entity_guid: String,
    pub changes: Value,
    #[serde(default)]
    pub signature: String,
}

impl AuditLogEntry {
    pub fn new(
        user_id: impl Into<String>,
        action: impl Into<String>,
        event_guid: impl Into<String>,
        entity_guid: impl Into<String>,
        changes: Value,
    ) -> Self {
        Self {
            guid: uuid::Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            user_id: user_id.into(),
            action: action.into(),
            event_guid: event_guid.into(),
            entity_guid: entity_guid.into(),
            changes,
            signature: String::new(),
        }
    }
}

/// Symmetric candidate flag produced by the duplicate detector, cleared only
/// by an explicit resolve event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PotentialDuplicatePair {
    pub entity_guid: String,
    pub duplicate_guid: String,
}

impl PotentialDuplicatePair {
    pub fn new(entity_guid: impl Into<String>, duplicate_guid: impl Into<String>) -> Self {
        Self {
            entity_guid: entity_guid.into(),
            duplicate_guid: duplicate_guid.into(),
        }
    }

    /// Direction-independent form, ordered lexicographically.
    pub fn normalized(&self) -> (String, String) {
        if self.entity_guid <= self.duplicate_guid {
            (self.entity_guid.clone(), self.duplicate_guid.clone())
        } else {
            (self.duplicate_guid.clone(), self.entity_guid.clone())
        }
    }

    pub fn reversed(&self) -> Self {
        Self {
            entity_guid: self.duplicate_guid.clone(),
            duplicate_guid: self.entity_guid.clone(),
        }
    }
}

/// Flattens free-form payload data into dotted-path -> scalar pairs.
/// Arrays and null/empty values are skipped; nested objects recurse.
pub fn flatten_fields(value: &Value) -> BTreeMap<String, String> {
    fn walk(prefix: &str, value: &Value, out: &mut BTreeMap<String, String>) {
        match value {
            Value::Object(map) => {
                for (key, nested) in map {
                    let path = if prefix.is_empty() {
                        key.clone()
                    } else {
                        format!("{prefix}.{key}")
                    };
                    walk(&path, nested, out);
                }
            }
            Value::Array(_) | Value::Null => {}
            Value::String(text) => {
                if !text.is_empty() && !prefix.is_empty() {
                    out.insert(prefix.to_string(), text.clone());
                }
            }
            other => {
                if !prefix.is_empty() {
                    out.insert(prefix.to_string(), other.to_string());
                }
            }
        }
    }

    let mut out = BTreeMap::new();
    walk("", value, &mut out);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flatten_skips_arrays_and_empty_values() {
        let data = json!({
            "name": "John Doe",
            "age": 30,
            "tags": ["a", "b"],
            "note": "",
            "missing": null,
            "contact": { "city": "Portland", "phones": [1, 2] }
        });

        let fields = flatten_fields(&data);
        assert_eq!(fields.get("name").map(String::as_str), Some("John Doe"));
        assert_eq!(fields.get("age").map(String::as_str), Some("30"));
        assert_eq!(
            fields.get("contact.city").map(String::as_str),
            Some("Portland")
        );
        assert!(!fields.contains_key("tags"));
        assert!(!fields.contains_key("note"));
        assert!(!fields.contains_key("missing"));
        assert!(!fields.contains_key("contact.phones"));
    }

    #[test]
    fn pair_changes_track_from_and_to() {
        let mut before = Entity::new(1, "e-1", EntityKind::Individual, Utc::now());
        before.data = json!({ "name": "Jane", "age": 30 });
        let mut after = before.clone();
        after.data = json!({ "name": "Jane", "age": 31, "city": "Salem" });

        let pair = EntityPair {
            initial: Some(before),
            modified: Some(after),
        };
        let changes = pair.changes();
        assert_eq!(changes["age"]["from"], "30");
        assert_eq!(changes["age"]["to"], "31");
        assert_eq!(changes["city"]["from"], Value::Null);
        assert!(changes.get("name").is_none());
    }

    #[test]
    fn event_round_trips_with_camel_case_names() {
        let event = Event::new("subject-1", "create-individual", json!({"name": "A"}), "user-1");
        let encoded = serde_json::to_value(&event).unwrap();
        assert!(encoded.get("entityGuid").is_some());
        assert!(encoded.get("syncLevel").is_some());
        assert!(encoded.get("userId").is_some());

        let decoded: Event = serde_json::from_value(encoded).unwrap();
        assert_eq!(decoded.guid, event.guid);
        assert_eq!(decoded.sync_level, SyncLevel::Local);
    }
}
