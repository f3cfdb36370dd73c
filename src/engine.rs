use std::{
    collections::{BTreeSet, HashMap},
    sync::Arc,
};

use parking_lot::{Mutex, RwLock};
use serde_json::{Map, Value, json};
use tracing::{debug, warn};

use crate::{
    dedupe::DuplicateDetector,
    error::{RegistryError, Result, codes},
    model::{
        AuditLogEntry, Entity, EntityKind, EntityPair, Event, PotentialDuplicatePair, StoredEvent,
    },
    store::{EntityStore, EventStore},
};

/// Built-in event types, closed so the compiler checks the dispatch. Any
/// other type goes through the open handler registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BuiltinEvent {
    CreateGroup,
    UpdateGroup,
    CreateIndividual,
    UpdateIndividual,
    AddMember,
    RemoveMember,
    DeleteEntity,
    ResolveDuplicate,
}

impl BuiltinEvent {
    fn parse(event_type: &str) -> Option<Self> {
        match event_type {
            "create-group" => Some(Self::CreateGroup),
            "update-group" => Some(Self::UpdateGroup),
            "create-individual" => Some(Self::CreateIndividual),
            "update-individual" => Some(Self::UpdateIndividual),
            "add-member" => Some(Self::AddMember),
            "remove-member" => Some(Self::RemoveMember),
            "delete-entity" => Some(Self::DeleteEntity),
            "resolve-duplicate" => Some(Self::ResolveDuplicate),
            _ => None,
        }
    }
}

/// Read accessor and save-and-audit callback handed to custom handlers.
pub struct HandlerContext<'a> {
    engine: &'a EventEngine,
}

impl HandlerContext<'_> {
    pub fn entity(&self, guid: &str) -> Result<Option<Entity>> {
        self.engine.entities.get(guid)
    }

    /// Persists the next state (version must advance by one) and writes the
    /// audit entry for the triggering event.
    pub fn save_and_audit(
        &self,
        event: &Event,
        initial: Option<&Entity>,
        next: &Entity,
    ) -> Result<()> {
        self.engine.entities.save(initial, next)?;
        let pair = EntityPair {
            initial: initial.cloned(),
            modified: Some(next.clone()),
        };
        self.engine
            .write_audit(event, &next.guid, &event.event_type, pair.changes())
    }
}

/// Extension point for caller-registered event types.
pub trait CustomHandler: Send + Sync {
    fn apply(
        &self,
        ctx: &HandlerContext<'_>,
        current: Option<Entity>,
        event: &Event,
    ) -> Result<Option<Entity>>;
}

/// Turns one event into entity mutations, enforcing the group/member
/// invariants. Every caller (local mutation, internal sync, external import)
/// funnels through [`EventEngine::submit_form`].
pub struct EventEngine {
    events: Arc<EventStore>,
    entities: Arc<EntityStore>,
    detector: DuplicateDetector,
    handlers: RwLock<HashMap<String, Arc<dyn CustomHandler>>>,
    entity_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl EventEngine {
    pub fn new(events: Arc<EventStore>, entities: Arc<EntityStore>) -> Self {
        let detector = DuplicateDetector::new(Arc::clone(&entities), Arc::clone(&events));
        Self {
            events,
            entities,
            detector,
            handlers: RwLock::new(HashMap::new()),
            entity_locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn event_store(&self) -> Arc<EventStore> {
        Arc::clone(&self.events)
    }

    pub fn entity_store(&self) -> Arc<EntityStore> {
        Arc::clone(&self.entities)
    }

    pub fn register_handler(&self, event_type: impl Into<String>, handler: Arc<dyn CustomHandler>) {
        self.handlers.write().insert(event_type.into(), handler);
    }

    /// Single entry point for every mutation. Appends the event durably
    /// before attempting the mutation, then dispatches, audits, and runs
    /// duplicate detection. Idempotent per event guid: a guid already in the
    /// log returns the current entity state untouched.
    pub fn submit_form(&self, event: Event) -> Result<Option<Entity>> {
        validate(&event)?;

        let lock = self.lock_for(&event.entity_guid);
        let _guard = lock.lock();

        let outcome = self.events.append(&event)?;
        if outcome.deduplicated {
            debug!(event = %event.guid, "event already applied, skipping");
            return self.entities.get(&event.entity_guid);
        }

        self.apply(&event, outcome.sequence.as_u64())
    }

    /// Pure fold of an entity's event subsequence, in log order. Reproduces
    /// the materialized state without touching the log; cascade removals
    /// driven by another entity's event are outside the fold.
    pub fn replay_entity(&self, guid: &str) -> Result<Option<Entity>> {
        let mut current: Option<Entity> = None;
        for record in self.events.events_for_entity(guid)? {
            current = fold_transition(current, &record);
        }
        Ok(current)
    }

    fn apply(&self, event: &Event, sequence: u64) -> Result<Option<Entity>> {
        match BuiltinEvent::parse(&event.event_type) {
            Some(BuiltinEvent::CreateIndividual) | Some(BuiltinEvent::UpdateIndividual) => self
                .apply_upsert(event, sequence, EntityKind::Individual)
                .map(Some),
            Some(BuiltinEvent::CreateGroup) | Some(BuiltinEvent::UpdateGroup) => {
                self.apply_group_upsert(event, sequence).map(Some)
            }
            Some(BuiltinEvent::AddMember) => self.apply_add_member(event).map(Some),
            Some(BuiltinEvent::RemoveMember) => self.apply_remove_member(event).map(Some),
            Some(BuiltinEvent::DeleteEntity) => {
                self.apply_delete(event)?;
                Ok(None)
            }
            Some(BuiltinEvent::ResolveDuplicate) => {
                self.apply_resolve_duplicate(event)?;
                Ok(None)
            }
            None => self.apply_custom(event),
        }
    }

    fn apply_upsert(&self, event: &Event, sequence: u64, kind: EntityKind) -> Result<Entity> {
        let initial = self.entities.get(&event.entity_guid)?;
        if let Some(existing) = &initial {
            if existing.kind != kind {
                return Err(RegistryError::domain(
                    codes::KIND_MISMATCH,
                    format!(
                        "entity {} is a {}, not a {}",
                        event.entity_guid,
                        existing.kind.as_str(),
                        kind.as_str()
                    ),
                ));
            }
        }

        let mut next = initial
            .clone()
            .unwrap_or_else(|| Entity::new(sequence, &event.entity_guid, kind, event.timestamp));
        merge_payload(&mut next, &event.data);
        next.version += 1;
        next.last_updated = event.timestamp;

        self.entities.save(initial.as_ref(), &next)?;
        let pair = EntityPair {
            initial,
            modified: Some(next.clone()),
        };
        self.write_audit(event, &next.guid, &event.event_type, pair.changes())?;
        self.detector.scan(&next, event)?;
        Ok(next)
    }

    fn apply_group_upsert(&self, event: &Event, sequence: u64) -> Result<Entity> {
        let initial = self.entities.get(&event.entity_guid)?;
        if let Some(existing) = &initial {
            if !existing.is_group() {
                return Err(RegistryError::domain(
                    codes::NOT_A_GROUP,
                    format!("entity {} is not a group", event.entity_guid),
                ));
            }
        }

        let (payload, member_defs) = split_member_definitions(&event.data)?;

        let mut next = initial.clone().unwrap_or_else(|| {
            Entity::new(sequence, &event.entity_guid, EntityKind::Group, event.timestamp)
        });
        merge_payload(&mut next, &payload);

        // Members are materialized before their guid lands in the group, so
        // member_ids never references an unresolvable entity.
        for definition in &member_defs {
            let member_guid = self.materialize_member(event, definition)?;
            union_member(&mut next, &member_guid);
        }

        next.version += 1;
        next.last_updated = event.timestamp;
        self.entities.save(initial.as_ref(), &next)?;
        let pair = EntityPair {
            initial,
            modified: Some(next.clone()),
        };
        self.write_audit(event, &next.guid, &event.event_type, pair.changes())?;
        self.detector.scan(&next, event)?;
        Ok(next)
    }

    fn apply_add_member(&self, event: &Event) -> Result<Entity> {
        let initial = self
            .entities
            .get(&event.entity_guid)?
            .ok_or_else(|| entity_not_found(&event.entity_guid))?;
        if !initial.is_group() {
            return Err(RegistryError::domain(
                codes::NOT_A_GROUP,
                format!("entity {} is not a group", event.entity_guid),
            ));
        }

        let member_id = event
            .data
            .get("memberId")
            .and_then(Value::as_str)
            .filter(|value| !value.is_empty())
            .ok_or_else(|| {
                RegistryError::domain(codes::MISSING_MEMBER_ID, "memberId is required")
            })?
            .to_string();
        if member_id == event.entity_guid {
            return Err(RegistryError::domain(
                codes::SELF_REFERENCE,
                format!("group {} cannot contain itself", event.entity_guid),
            ));
        }

        if self.entities.get(&member_id)?.is_none() {
            match event.data.get("member") {
                Some(definition) => {
                    let mut definition = definition.clone();
                    if let Some(map) = definition.as_object_mut() {
                        map.insert("guid".to_string(), Value::String(member_id.clone()));
                    }
                    self.materialize_member(event, &definition)?;
                }
                None => return Err(entity_not_found(&member_id)),
            }
        }

        let mut next = initial.clone();
        union_member(&mut next, &member_id);
        next.version += 1;
        next.last_updated = event.timestamp;
        self.entities.save(Some(&initial), &next)?;
        let pair = EntityPair {
            initial: Some(initial),
            modified: Some(next.clone()),
        };
        self.write_audit(event, &next.guid, &event.event_type, pair.changes())?;
        self.detector.scan(&next, event)?;
        Ok(next)
    }

    fn apply_remove_member(&self, event: &Event) -> Result<Entity> {
        let initial = self
            .entities
            .get(&event.entity_guid)?
            .ok_or_else(|| entity_not_found(&event.entity_guid))?;
        if !initial.is_group() {
            return Err(RegistryError::domain(
                codes::NOT_A_GROUP,
                format!("entity {} is not a group", event.entity_guid),
            ));
        }

        let member_id = event
            .data
            .get("memberId")
            .and_then(Value::as_str)
            .filter(|value| !value.is_empty())
            .ok_or_else(|| {
                RegistryError::domain(codes::MISSING_MEMBER_ID, "memberId is required")
            })?
            .to_string();

        let mut next = initial.clone();
        next.member_ids.retain(|guid| guid != &member_id);
        next.version += 1;
        next.last_updated = event.timestamp;
        self.entities.save(Some(&initial), &next)?;
        let pair = EntityPair {
            initial: Some(initial),
            modified: Some(next.clone()),
        };
        self.write_audit(event, &next.guid, &event.event_type, pair.changes())?;

        // A removed subgroup does not survive detached from its parent.
        if let Some(removed) = self.entities.get(&member_id)? {
            if removed.is_group() {
                self.cascade_delete(&member_id, event)?;
            }
        }

        Ok(next)
    }

    fn apply_delete(&self, event: &Event) -> Result<()> {
        if self.entities.get(&event.entity_guid)?.is_none() {
            return Err(entity_not_found(&event.entity_guid));
        }
        self.cascade_delete(&event.entity_guid, event)?;
        Ok(())
    }

    fn apply_resolve_duplicate(&self, event: &Event) -> Result<()> {
        let duplicate_guid = event
            .data
            .get("duplicateGuid")
            .and_then(Value::as_str)
            .filter(|value| !value.is_empty())
            .ok_or_else(|| {
                RegistryError::domain(codes::MISSING_DUPLICATE_GUID, "duplicateGuid is required")
            })?
            .to_string();
        let should_delete = event
            .data
            .get("shouldDelete")
            .and_then(Value::as_bool)
            .unwrap_or(false);

        let pair = PotentialDuplicatePair::new(&event.entity_guid, &duplicate_guid);
        self.entities.resolve_duplicates(&[pair])?;

        let mut deleted = 0;
        if should_delete && self.entities.get(&duplicate_guid)?.is_some() {
            deleted = self.cascade_delete(&duplicate_guid, event)?;
        }

        self.write_audit(
            event,
            &event.entity_guid,
            "resolve-duplicate",
            json!({ "duplicateGuid": duplicate_guid, "deleted": deleted > 0 }),
        )
    }

    fn apply_custom(&self, event: &Event) -> Result<Option<Entity>> {
        let handler = self.handlers.read().get(&event.event_type).cloned();
        let Some(handler) = handler else {
            return Err(RegistryError::UnsupportedEvent(event.event_type.clone()));
        };

        let current = self.entities.get(&event.entity_guid)?;
        let ctx = HandlerContext { engine: self };
        let result = handler.apply(&ctx, current, event)?;
        if let Some(entity) = &result {
            self.detector.scan(entity, event)?;
        }
        Ok(result)
    }

    /// Creates the member described by an embedded definition, routed back
    /// through `submit_form` so the sub-event is logged, audited, and
    /// scanned like any other mutation. The acting user id is carried from
    /// the triggering event. Returns the member guid.
    fn materialize_member(&self, parent: &Event, definition: &Value) -> Result<String> {
        let map = definition.as_object().ok_or_else(|| {
            RegistryError::Validation("member definition must be a JSON object".to_string())
        })?;
        let guid = map
            .get("guid")
            .and_then(Value::as_str)
            .filter(|value| !value.is_empty())
            .ok_or_else(|| {
                RegistryError::domain(codes::MISSING_MEMBER_ID, "member definition needs a guid")
            })?
            .to_string();
        if guid == parent.entity_guid {
            return Err(RegistryError::domain(
                codes::SELF_REFERENCE,
                format!("group {} cannot contain itself", parent.entity_guid),
            ));
        }

        if self.entities.get(&guid)?.is_some() {
            return Ok(guid);
        }

        let mut data = map.clone();
        data.remove("guid");
        let event_type = match member_kind(map) {
            EntityKind::Group => "create-group",
            EntityKind::Individual => "create-individual",
        };
        if data.is_empty() {
            return Err(entity_not_found(&guid));
        }

        let sub_event = Event {
            guid: uuid::Uuid::new_v4().to_string(),
            entity_guid: guid.clone(),
            event_type: event_type.to_string(),
            data: Value::Object(data),
            timestamp: parent.timestamp,
            user_id: parent.user_id.clone(),
            sync_level: parent.sync_level,
        };
        self.submit_form(sub_event)?;
        Ok(guid)
    }

    /// Removes the entity and every entity transitively reachable through
    /// member_ids, deepest first, one audit entry per removal. Returns the
    /// number of entities removed.
    fn cascade_delete(&self, guid: &str, event: &Event) -> Result<usize> {
        let mut visited = BTreeSet::new();
        let mut closure = Vec::new();
        self.collect_closure(guid, &mut visited, &mut closure)?;

        let removed_guids: BTreeSet<String> = closure
            .iter()
            .map(|entity| entity.guid.clone())
            .collect();
        let removed = closure.len();
        for entity in closure {
            self.entities.delete(&entity.guid)?;
            let pair = EntityPair {
                initial: Some(entity.clone()),
                modified: None,
            };
            self.write_audit(event, &entity.guid, "delete-entity", pair.changes())?;
        }
        if removed > 1 {
            warn!(root = guid, removed, "cascade delete removed member closure");
        }
        self.detach_from_groups(&removed_guids, event)?;
        Ok(removed)
    }

    /// Strips the removed guids out of every surviving group so member_ids
    /// never references an unresolvable entity.
    fn detach_from_groups(&self, removed: &BTreeSet<String>, event: &Event) -> Result<()> {
        for entity in self.entities.all()? {
            if !entity.is_group()
                || !entity.member_ids.iter().any(|member| removed.contains(member))
            {
                continue;
            }
            let initial = entity.clone();
            let mut next = entity;
            next.member_ids.retain(|member| !removed.contains(member));
            next.version += 1;
            next.last_updated = event.timestamp;
            self.entities.save(Some(&initial), &next)?;
            let guid = next.guid.clone();
            let pair = EntityPair {
                initial: Some(initial),
                modified: Some(next),
            };
            self.write_audit(event, &guid, "remove-member", pair.changes())?;
        }
        Ok(())
    }

    fn collect_closure(
        &self,
        guid: &str,
        visited: &mut BTreeSet<String>,
        out: &mut Vec<Entity>,
    ) -> Result<()> {
        if !visited.insert(guid.to_string()) {
            return Ok(());
        }
        let Some(entity) = self.entities.get(guid)? else {
            return Ok(());
        };
        for member in &entity.member_ids {
            self.collect_closure(member, visited, out)?;
        }
        out.push(entity);
        Ok(())
    }

    fn write_audit(
        &self,
        event: &Event,
        entity_guid: &str,
        action: &str,
        changes: Value,
    ) -> Result<()> {
        let entry = AuditLogEntry::new(&event.user_id, action, &event.guid, entity_guid, changes);
        self.events.append_audit(&entry)
    }

    fn lock_for(&self, guid: &str) -> Arc<Mutex<()>> {
        let mut locks = self.entity_locks.lock();
        Arc::clone(
            locks
                .entry(guid.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(()))),
        )
    }
}

fn validate(event: &Event) -> Result<()> {
    if event.guid.trim().is_empty() {
        return Err(RegistryError::Validation("event guid is required".into()));
    }
    if event.event_type.trim().is_empty() {
        return Err(RegistryError::Validation("event type is required".into()));
    }
    if event.entity_guid.trim().is_empty() {
        return Err(RegistryError::Validation("entityGuid is required".into()));
    }
    match &event.data {
        Value::Null | Value::Object(_) => {}
        _ => {
            return Err(RegistryError::Validation(
                "event data must be a JSON object".into(),
            ));
        }
    }

    let needs_payload = matches!(
        BuiltinEvent::parse(&event.event_type),
        Some(BuiltinEvent::CreateGroup)
            | Some(BuiltinEvent::UpdateGroup)
            | Some(BuiltinEvent::CreateIndividual)
            | Some(BuiltinEvent::UpdateIndividual)
            | None
    );
    if needs_payload && event.data.as_object().map_or(true, Map::is_empty) {
        return Err(RegistryError::Validation(
            "event data must not be empty".into(),
        ));
    }
    Ok(())
}

fn entity_not_found(guid: &str) -> RegistryError {
    RegistryError::domain(codes::ENTITY_NOT_FOUND, format!("entity {guid} not found"))
}

/// Field-level last-writer-wins merge of a payload into the entity data,
/// mirroring `name` and `externalId` into the typed fields.
fn merge_payload(entity: &mut Entity, payload: &Value) {
    let Some(incoming) = payload.as_object() else {
        return;
    };
    if !entity.data.is_object() {
        entity.data = Value::Object(Map::new());
    }
    let data = entity
        .data
        .as_object_mut()
        .expect("entity data is an object");
    for (key, value) in incoming {
        data.insert(key.clone(), value.clone());
    }

    if let Some(name) = incoming.get("name").and_then(Value::as_str) {
        entity.name = Some(name.to_string());
    }
    if let Some(external) = incoming.get("externalId").and_then(Value::as_str) {
        entity.external_id = Some(external.to_string());
    }
}

/// Splits a group payload into the mergeable fields and the embedded member
/// definitions. Membership lives in member_ids, never in data.
fn split_member_definitions(data: &Value) -> Result<(Value, Vec<Value>)> {
    let map = data.as_object().ok_or_else(|| {
        RegistryError::Validation("group payload must be a JSON object".to_string())
    })?;
    let mut payload = map.clone();
    let members = match payload.remove("members") {
        None => Vec::new(),
        Some(Value::Array(defs)) => defs,
        Some(_) => {
            return Err(RegistryError::Validation(
                "members must be an array of member definitions".to_string(),
            ));
        }
    };
    Ok((Value::Object(payload), members))
}

fn member_kind(definition: &Map<String, Value>) -> EntityKind {
    match definition.get("type").and_then(Value::as_str) {
        Some("group") => EntityKind::Group,
        _ => EntityKind::Individual,
    }
}

fn union_member(entity: &mut Entity, guid: &str) {
    if !entity.member_ids.iter().any(|existing| existing == guid) {
        entity.member_ids.push(guid.to_string());
    }
}

/// Entity-local state transition used by the replay fold. Matches the live
/// mutation paths field for field, minus side effects.
fn fold_transition(current: Option<Entity>, record: &StoredEvent) -> Option<Entity> {
    let event = &record.event;
    match BuiltinEvent::parse(&event.event_type) {
        Some(BuiltinEvent::CreateIndividual) | Some(BuiltinEvent::UpdateIndividual) => {
            let mut next = current.unwrap_or_else(|| {
                Entity::new(
                    record.sequence.as_u64(),
                    &event.entity_guid,
                    EntityKind::Individual,
                    event.timestamp,
                )
            });
            merge_payload(&mut next, &event.data);
            next.version += 1;
            next.last_updated = event.timestamp;
            Some(next)
        }
        Some(BuiltinEvent::CreateGroup) | Some(BuiltinEvent::UpdateGroup) => {
            let Ok((payload, member_defs)) = split_member_definitions(&event.data) else {
                return current;
            };
            let mut next = current.unwrap_or_else(|| {
                Entity::new(
                    record.sequence.as_u64(),
                    &event.entity_guid,
                    EntityKind::Group,
                    event.timestamp,
                )
            });
            merge_payload(&mut next, &payload);
            for definition in &member_defs {
                if let Some(guid) = definition.get("guid").and_then(Value::as_str) {
                    if guid != event.entity_guid {
                        union_member(&mut next, guid);
                    }
                }
            }
            next.version += 1;
            next.last_updated = event.timestamp;
            Some(next)
        }
        Some(BuiltinEvent::AddMember) => {
            let mut next = current?;
            if let Some(member_id) = event.data.get("memberId").and_then(Value::as_str) {
                union_member(&mut next, member_id);
                next.version += 1;
                next.last_updated = event.timestamp;
            }
            Some(next)
        }
        Some(BuiltinEvent::RemoveMember) => {
            let mut next = current?;
            if let Some(member_id) = event.data.get("memberId").and_then(Value::as_str) {
                next.member_ids.retain(|guid| guid != member_id);
                next.version += 1;
                next.last_updated = event.timestamp;
            }
            Some(next)
        }
        Some(BuiltinEvent::DeleteEntity) => None,
        Some(BuiltinEvent::ResolveDuplicate) => current,
        None => current,
    }
}
