use std::sync::Arc;

use chrono::{Duration, Utc};
use serde_json::json;
use wiremock::{
    Mock, MockServer, ResponseTemplate,
    matchers::{method, path},
};

use rosterdbx::{
    config::{Config, ExternalTargetConfig},
    engine::EventEngine,
    model::{Event, SyncLevel},
    store::{EntityStore, EventStore, WatermarkKind},
    sync::external::{AdapterCredentials, AdapterRegistry, ExternalSync},
};

fn new_engine(dir: &tempfile::TempDir) -> Arc<EventEngine> {
    let events = Arc::new(EventStore::open(dir.path().join("events.db"), 1).unwrap());
    let entities = Arc::new(EntityStore::open(dir.path().join("entities.db")).unwrap());
    Arc::new(EventEngine::new(events, entities))
}

fn external(engine: Arc<EventEngine>, url: &str, batch_size: usize) -> ExternalSync {
    let mut config = Config::default();
    config.externals.insert(
        "ministry".to_string(),
        ExternalTargetConfig {
            adapter: "restapi".to_string(),
            url: url.to_string(),
            batch_size: Some(batch_size),
        },
    );
    ExternalSync::new(engine, Arc::new(AdapterRegistry::with_builtins()), &config)
}

async fn mount_auth(mock: &MockServer) {
    Mock::given(method("POST"))
        .and(path("/authenticate"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "token": "session-1" })))
        .mount(mock)
        .await;
}

async fn mount_empty_records(mock: &MockServer) {
    Mock::given(method("GET"))
        .and(path("/records"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
        .mount(mock)
        .await;
}

fn seed_events(engine: &EventEngine, count: usize) {
    for index in 0..count {
        engine
            .submit_form(Event::new(
                format!("p-{index}"),
                "create-individual",
                json!({ "name": format!("person-{index}") }),
                "clerk-1",
            ))
            .unwrap();
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn failed_batch_leaves_the_watermark_and_is_retried_in_full() {
    let mock = MockServer::start().await;
    mount_auth(&mock).await;
    mount_empty_records(&mock).await;

    let dir = tempfile::tempdir().unwrap();
    let engine = new_engine(&dir);
    seed_events(&engine, 5);
    let sync = external(Arc::clone(&engine), &mock.uri(), 100);
    let credentials = AdapterCredentials::default();

    let failing = Mock::given(method("POST"))
        .and(path("/records/batch"))
        .respond_with(ResponseTemplate::new(500))
        .mount_as_scoped(&mock)
        .await;

    let report = sync.run("ministry", &credentials, "sync-user").await.unwrap();
    assert_eq!(report.pushed, 0);
    assert!(report.push_error.is_some());
    assert_eq!(
        engine
            .event_store()
            .watermark(WatermarkKind::ExternalPush)
            .unwrap(),
        None,
        "watermark must stay at the prior boundary"
    );

    drop(failing);
    Mock::given(method("POST"))
        .and(path("/records/batch"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&mock)
        .await;

    let retry = sync.run("ministry", &credentials, "sync-user").await.unwrap();
    assert_eq!(retry.pushed, 5, "the failed batch is resent in full");
    assert!(retry.push_error.is_none());
    assert!(
        engine
            .event_store()
            .watermark(WatermarkKind::ExternalPush)
            .unwrap()
            .is_some()
    );

    // Acknowledged events are behind the watermark now.
    let third = sync.run("ministry", &credentials, "sync-user").await.unwrap();
    assert_eq!(third.pushed, 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn pushes_in_fixed_size_batches() {
    let mock = MockServer::start().await;
    mount_auth(&mock).await;
    mount_empty_records(&mock).await;
    Mock::given(method("POST"))
        .and(path("/records/batch"))
        .respond_with(ResponseTemplate::new(200))
        .expect(3)
        .mount(&mock)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let engine = new_engine(&dir);
    seed_events(&engine, 5);
    let sync = external(Arc::clone(&engine), &mock.uri(), 2);

    let report = sync
        .run("ministry", &AdapterCredentials::default(), "sync-user")
        .await
        .unwrap();
    assert_eq!(report.pushed, 5);
    assert_eq!(report.pushed_batches, 3, "5 events in batches of 2");
}

#[tokio::test(flavor = "multi_thread")]
async fn pull_imports_records_with_per_record_isolation() {
    let mock = MockServer::start().await;
    mount_auth(&mock).await;

    let now = Utc::now();
    let older = now - Duration::minutes(3);
    Mock::given(method("GET"))
        .and(path("/records"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([
            {
                "externalId": "ext-1",
                "type": "individual",
                "data": { "name": "Imported Person" },
                "updatedAt": older.to_rfc3339()
            },
            {
                "externalId": "ext-2",
                "type": "individual",
                "data": "not-an-object",
                "updatedAt": now.to_rfc3339()
            }
        ])))
        .mount(&mock)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let engine = new_engine(&dir);
    let sync = external(Arc::clone(&engine), &mock.uri(), 100);

    let report = sync
        .run("ministry", &AdapterCredentials::default(), "sync-user")
        .await
        .unwrap();
    assert_eq!(report.imported.applied(), 1);
    assert_eq!(report.imported.failed(), 1, "bad record is isolated");

    let imported = engine
        .entity_store()
        .find_by_external_id("ext-1")
        .unwrap()
        .unwrap();
    assert_eq!(imported.name.as_deref(), Some("Imported Person"));
    assert_eq!(imported.version, 1);

    // The synthetic event carries external provenance.
    let history = engine
        .event_store()
        .events_for_entity(&imported.guid)
        .unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].event.sync_level, SyncLevel::External);
    assert_eq!(history[0].event.user_id, "sync-user");

    // The pull watermark advanced to the newest record seen.
    let watermark = engine
        .event_store()
        .watermark(WatermarkKind::ExternalPull)
        .unwrap()
        .unwrap();
    assert_eq!(watermark.timestamp_millis(), now.timestamp_millis());
}

#[tokio::test(flavor = "multi_thread")]
async fn imported_data_is_never_exported_back() {
    let mock = MockServer::start().await;
    mount_auth(&mock).await;

    Mock::given(method("GET"))
        .and(path("/records"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([
            {
                "externalId": "ext-9",
                "type": "individual",
                "data": { "name": "Round Tripper" },
                "updatedAt": Utc::now().to_rfc3339()
            }
        ])))
        .mount(&mock)
        .await;
    // Zero batch posts expected: the only loggable event is external.
    Mock::given(method("POST"))
        .and(path("/records/batch"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&mock)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let engine = new_engine(&dir);
    let sync = external(Arc::clone(&engine), &mock.uri(), 100);
    let credentials = AdapterCredentials::default();

    let first = sync.run("ministry", &credentials, "sync-user").await.unwrap();
    assert_eq!(first.imported.applied(), 1);

    let second = sync.run("ministry", &credentials, "sync-user").await.unwrap();
    assert_eq!(second.pushed, 0, "external events are filtered from pushes");
}

#[tokio::test(flavor = "multi_thread")]
async fn unknown_targets_and_adapters_are_refused() {
    let dir = tempfile::tempdir().unwrap();
    let engine = new_engine(&dir);

    let sync = external(Arc::clone(&engine), "http://127.0.0.1:9", 100);
    let err = sync
        .run("nope", &AdapterCredentials::default(), "sync-user")
        .await
        .unwrap_err();
    assert_eq!(err.code(), "unknown-target");

    let mut config = Config::default();
    config.externals.insert(
        "weird".to_string(),
        ExternalTargetConfig {
            adapter: "carrier-pigeon".to_string(),
            url: "http://127.0.0.1:9".to_string(),
            batch_size: None,
        },
    );
    let sync = ExternalSync::new(engine, Arc::new(AdapterRegistry::with_builtins()), &config);
    let err = sync
        .run("weird", &AdapterCredentials::default(), "sync-user")
        .await
        .unwrap_err();
    assert_eq!(err.code(), "config");
}
