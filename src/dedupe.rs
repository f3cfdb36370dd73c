use std::sync::Arc;

use serde_json::{Map, Value, json};
use tracing::info;

use crate::{
    error::Result,
    model::{AuditLogEntry, Entity, Event, PotentialDuplicatePair, flatten_fields},
    store::{EntityStore, EventStore},
};

/// Runs after every accepted mutation. Deliberately a conjunctive,
/// exact-match heuristic over the flattened entity data: recall is traded
/// for zero-false-positive confidence, and resolution stays with a human via
/// the explicit resolve event.
pub struct DuplicateDetector {
    entities: Arc<EntityStore>,
    events: Arc<EventStore>,
}

impl DuplicateDetector {
    pub fn new(entities: Arc<EntityStore>, events: Arc<EventStore>) -> Self {
        Self { entities, events }
    }

    /// Flags every other entity whose flattened data matches all of the
    /// mutated entity's fields. One audit entry per flagged pair, recording
    /// which fields matched.
    pub fn scan(&self, entity: &Entity, trigger: &Event) -> Result<Vec<PotentialDuplicatePair>> {
        let criteria = flatten_fields(&entity.data);
        if criteria.is_empty() {
            return Ok(Vec::new());
        }

        let mut pairs = Vec::new();
        for candidate in self.entities.search(&criteria)? {
            if candidate.guid == entity.guid {
                continue;
            }
            pairs.push(PotentialDuplicatePair::new(&entity.guid, &candidate.guid));
        }
        if pairs.is_empty() {
            return Ok(pairs);
        }

        self.entities.flag_duplicates(&pairs)?;

        let matched: Map<String, Value> = criteria
            .iter()
            .map(|(path, value)| (path.clone(), Value::String(value.clone())))
            .collect();
        for pair in &pairs {
            let entry = AuditLogEntry::new(
                &trigger.user_id,
                "flag-duplicate",
                &trigger.guid,
                &pair.entity_guid,
                json!({
                    "duplicateGuid": pair.duplicate_guid,
                    "matchedFields": Value::Object(matched.clone()),
                }),
            );
            self.events.append_audit(&entry)?;
        }

        info!(
            entity = %entity.guid,
            flagged = pairs.len(),
            "potential duplicates flagged"
        );
        Ok(pairs)
    }
}
