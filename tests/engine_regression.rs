use std::sync::Arc;

use serde_json::json;

use rosterdbx::{
    engine::{CustomHandler, EventEngine, HandlerContext},
    error::{RegistryError, Result, codes},
    model::{Entity, EntityKind, Event},
    store::{EntityStore, EventStore},
};

fn engine() -> (tempfile::TempDir, Arc<EventEngine>) {
    let dir = tempfile::tempdir().unwrap();
    let events = Arc::new(EventStore::open(dir.path().join("events.db"), 0).unwrap());
    let entities = Arc::new(EntityStore::open(dir.path().join("entities.db")).unwrap());
    (dir, Arc::new(EventEngine::new(events, entities)))
}

fn create_individual(engine: &EventEngine, guid: &str, data: serde_json::Value) -> Entity {
    engine
        .submit_form(Event::new(guid, "create-individual", data, "clerk-1"))
        .unwrap()
        .unwrap()
}

#[test]
fn create_individual_starts_at_version_one() {
    let (_dir, engine) = engine();
    let entity = create_individual(&engine, "p-1", json!({ "name": "John Doe", "age": 30 }));

    assert_eq!(entity.version, 1);
    assert_eq!(entity.kind, EntityKind::Individual);
    assert_eq!(entity.name.as_deref(), Some("John Doe"));
    assert_eq!(entity.data["age"], 30);
}

#[test]
fn group_members_are_deduplicated_on_repeated_guids() {
    let (_dir, engine) = engine();
    let group = engine
        .submit_form(Event::new(
            "g-1",
            "create-group",
            json!({
                "name": "Smith Family",
                "members": [
                    { "guid": "m1", "name": "Jane" },
                    { "guid": "m1", "name": "Jane" }
                ]
            }),
            "clerk-1",
        ))
        .unwrap()
        .unwrap();

    assert_eq!(group.member_ids, vec!["m1".to_string()]);
    assert_eq!(group.version, 1);
    // Membership lives in member_ids, not in the merged data.
    assert!(group.data.get("members").is_none());

    let member = engine.entity_store().get("m1").unwrap().unwrap();
    assert_eq!(member.kind, EntityKind::Individual);
    assert_eq!(member.name.as_deref(), Some("Jane"));
}

#[test]
fn matching_individuals_are_flagged_as_duplicates() {
    let (_dir, engine) = engine();
    create_individual(&engine, "a", json!({ "name": "John Doe" }));
    assert!(engine.entity_store().list_duplicates().unwrap().is_empty());

    create_individual(&engine, "b", json!({ "name": "John Doe" }));

    let pairs = engine.entity_store().list_duplicates().unwrap();
    assert_eq!(pairs.len(), 1);

    // Symmetric: discoverable from either side.
    assert_eq!(engine.entity_store().duplicates_for("a").unwrap().len(), 1);
    assert_eq!(engine.entity_store().duplicates_for("b").unwrap().len(), 1);

    // The audit trail records which fields matched.
    let audits = engine.event_store().audit_since(None, None).unwrap();
    let flag = audits
        .iter()
        .find(|entry| entry.action == "flag-duplicate")
        .expect("flag audit entry");
    assert_eq!(flag.changes["matchedFields"]["name"], "John Doe");
}

#[test]
fn partial_field_overlap_is_not_flagged() {
    let (_dir, engine) = engine();
    create_individual(&engine, "a", json!({ "name": "John Doe", "age": 30 }));
    create_individual(&engine, "b", json!({ "name": "John Doe", "age": 31 }));

    assert!(engine.entity_store().list_duplicates().unwrap().is_empty());
}

#[test]
fn deleting_a_group_removes_the_member_closure() {
    let (_dir, engine) = engine();
    engine
        .submit_form(Event::new(
            "g-top",
            "create-group",
            json!({
                "name": "Village",
                "members": [
                    {
                        "guid": "g-sub",
                        "type": "group",
                        "name": "Household",
                        "members": [{ "guid": "m-2", "name": "Sam" }]
                    },
                    { "guid": "m-1", "name": "Lee" }
                ]
            }),
            "clerk-1",
        ))
        .unwrap();

    let before = engine.event_store().audit_since(None, None).unwrap();
    let deletes_before = before
        .iter()
        .filter(|entry| entry.action == "delete-entity")
        .count();

    engine
        .submit_form(Event::new("g-top", "delete-entity", json!({}), "clerk-1"))
        .unwrap();

    let entities = engine.entity_store();
    for guid in ["g-top", "g-sub", "m-1", "m-2"] {
        assert!(entities.get(guid).unwrap().is_none(), "{guid} survived");
    }

    let after = engine.event_store().audit_since(None, None).unwrap();
    let deletes = after
        .iter()
        .filter(|entry| entry.action == "delete-entity")
        .count();
    assert_eq!(deletes - deletes_before, 4, "one audit entry per removal");
}

#[test]
fn removing_a_subgroup_member_cascades() {
    let (_dir, engine) = engine();
    engine
        .submit_form(Event::new(
            "g-1",
            "create-group",
            json!({
                "name": "Camp",
                "members": [{
                    "guid": "g-2",
                    "type": "group",
                    "name": "Tent",
                    "members": [{ "guid": "m-1", "name": "Kim" }]
                }]
            }),
            "clerk-1",
        ))
        .unwrap();

    let group = engine
        .submit_form(Event::new(
            "g-1",
            "remove-member",
            json!({ "memberId": "g-2" }),
            "clerk-1",
        ))
        .unwrap()
        .unwrap();

    assert!(group.member_ids.is_empty());
    assert!(engine.entity_store().get("g-2").unwrap().is_none());
    assert!(engine.entity_store().get("m-1").unwrap().is_none());
}

#[test]
fn add_member_materializes_unresolvable_members() {
    let (_dir, engine) = engine();
    engine
        .submit_form(Event::new(
            "g-1",
            "create-group",
            json!({ "name": "Clinic" }),
            "clerk-1",
        ))
        .unwrap();

    let group = engine
        .submit_form(Event::new(
            "g-1",
            "add-member",
            json!({ "memberId": "m-9", "member": { "name": "Noor" } }),
            "clerk-1",
        ))
        .unwrap()
        .unwrap();

    assert_eq!(group.member_ids, vec!["m-9".to_string()]);
    assert_eq!(group.version, 2);
    let member = engine.entity_store().get("m-9").unwrap().unwrap();
    assert_eq!(member.name.as_deref(), Some("Noor"));

    // Unresolvable and no definition supplied: refused.
    let err = engine
        .submit_form(Event::new(
            "g-1",
            "add-member",
            json!({ "memberId": "m-10" }),
            "clerk-1",
        ))
        .unwrap_err();
    assert_eq!(err.code(), codes::ENTITY_NOT_FOUND);
}

#[test]
fn add_member_requires_a_group_target() {
    let (_dir, engine) = engine();
    create_individual(&engine, "p-1", json!({ "name": "Ada" }));

    let err = engine
        .submit_form(Event::new(
            "p-1",
            "add-member",
            json!({ "memberId": "x" }),
            "clerk-1",
        ))
        .unwrap_err();
    assert_eq!(err.code(), codes::NOT_A_GROUP);
}

#[test]
fn resolve_duplicate_clears_the_pair_and_discards() {
    let (_dir, engine) = engine();
    create_individual(&engine, "a", json!({ "name": "John Doe" }));
    create_individual(&engine, "b", json!({ "name": "John Doe" }));
    assert_eq!(engine.entity_store().list_duplicates().unwrap().len(), 1);

    engine
        .submit_form(Event::new(
            "a",
            "resolve-duplicate",
            json!({ "duplicateGuid": "b", "shouldDelete": true }),
            "reviewer-1",
        ))
        .unwrap();

    assert!(engine.entity_store().get("b").unwrap().is_none());
    assert!(engine.entity_store().get("a").unwrap().is_some());
    assert!(engine.entity_store().list_duplicates().unwrap().is_empty());
}

#[test]
fn resubmitting_the_same_event_guid_is_idempotent() {
    let (_dir, engine) = engine();
    let event = Event::new("p-1", "create-individual", json!({ "name": "Ada" }), "u-1");

    engine.submit_form(event.clone()).unwrap();
    let audits_before = engine.event_store().audit_since(None, None).unwrap().len();

    let entity = engine.submit_form(event).unwrap().unwrap();
    assert_eq!(entity.version, 1, "version must not double-increment");
    assert_eq!(
        engine.event_store().audit_since(None, None).unwrap().len(),
        audits_before,
        "no duplicate audit entries"
    );
    assert_eq!(engine.event_store().log_count().unwrap(), 1);
}

#[test]
fn replay_reproduces_the_materialized_state() {
    let (_dir, engine) = engine();
    engine
        .submit_form(Event::new(
            "g-1",
            "create-group",
            json!({ "name": "Family", "members": [{ "guid": "m-1", "name": "Jane" }] }),
            "u-1",
        ))
        .unwrap();
    engine
        .submit_form(Event::new(
            "g-1",
            "update-group",
            json!({ "district": "north" }),
            "u-1",
        ))
        .unwrap();
    engine
        .submit_form(Event::new(
            "m-1",
            "update-individual",
            json!({ "age": 41 }),
            "u-1",
        ))
        .unwrap();

    for guid in ["g-1", "m-1"] {
        let stored = engine.entity_store().get(guid).unwrap().unwrap();
        let replayed = engine.replay_entity(guid).unwrap().unwrap();
        assert_eq!(stored, replayed, "fold diverged for {guid}");
    }
}

#[test]
fn deleting_a_member_detaches_it_from_surviving_groups() {
    let (_dir, engine) = engine();
    engine
        .submit_form(Event::new(
            "g-1",
            "create-group",
            json!({ "name": "Family", "members": [{ "guid": "m-1", "name": "Jane" }] }),
            "u-1",
        ))
        .unwrap();

    engine
        .submit_form(Event::new("m-1", "delete-entity", json!({}), "u-1"))
        .unwrap();

    assert!(engine.entity_store().get("m-1").unwrap().is_none());
    let group = engine.entity_store().get("g-1").unwrap().unwrap();
    assert!(group.member_ids.is_empty(), "dangling member reference");
    assert_eq!(group.version, 2);
}

#[test]
fn validation_rejects_malformed_events_before_persistence() {
    let (_dir, engine) = engine();

    let mut missing_type = Event::new("p-1", "", json!({ "name": "Ada" }), "u-1");
    missing_type.event_type = String::new();
    let guid = missing_type.guid.clone();
    assert!(matches!(
        engine.submit_form(missing_type),
        Err(RegistryError::Validation(_))
    ));
    assert!(!engine.event_store().contains(&guid).unwrap());

    let empty_payload = Event::new("p-1", "create-individual", json!({}), "u-1");
    assert!(matches!(
        engine.submit_form(empty_payload),
        Err(RegistryError::Validation(_))
    ));

    let missing_subject = Event::new("", "create-individual", json!({ "name": "Ada" }), "u-1");
    assert!(matches!(
        engine.submit_form(missing_subject),
        Err(RegistryError::Validation(_))
    ));
}

#[test]
fn deleting_an_unknown_entity_is_a_domain_error() {
    let (_dir, engine) = engine();
    let err = engine
        .submit_form(Event::new("ghost", "delete-entity", json!({}), "u-1"))
        .unwrap_err();
    assert_eq!(err.code(), codes::ENTITY_NOT_FOUND);
}

struct VisitHandler;

impl CustomHandler for VisitHandler {
    fn apply(
        &self,
        ctx: &HandlerContext<'_>,
        current: Option<Entity>,
        event: &Event,
    ) -> Result<Option<Entity>> {
        let initial = current.ok_or_else(|| {
            RegistryError::domain(codes::ENTITY_NOT_FOUND, "visit needs an existing entity")
        })?;
        let mut next = initial.clone();
        if let Some(data) = next.data.as_object_mut() {
            data.insert("lastVisit".to_string(), event.data["date"].clone());
        }
        next.version += 1;
        next.last_updated = event.timestamp;
        ctx.save_and_audit(event, Some(&initial), &next)?;
        Ok(Some(next))
    }
}

#[test]
fn custom_handlers_extend_the_engine() {
    let (_dir, engine) = engine();
    create_individual(&engine, "p-1", json!({ "name": "Ada" }));

    let unsupported = engine
        .submit_form(Event::new(
            "p-1",
            "record-visit",
            json!({ "date": "2026-08-01" }),
            "u-1",
        ))
        .unwrap_err();
    assert!(matches!(unsupported, RegistryError::UnsupportedEvent(_)));

    engine.register_handler("record-visit", Arc::new(VisitHandler));
    let entity = engine
        .submit_form(Event::new(
            "p-1",
            "record-visit",
            json!({ "date": "2026-08-01" }),
            "u-1",
        ))
        .unwrap()
        .unwrap();

    assert_eq!(entity.version, 2);
    assert_eq!(entity.data["lastVisit"], "2026-08-01");
}
