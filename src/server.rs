use std::{net::SocketAddr, str::FromStr, sync::Arc};

use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::HeaderMap,
    routing::{get, post},
};
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::{
    auth::{Authorizer, CallerClaims, StaticTokenAuthorizer},
    config::Config,
    engine::EventEngine,
    error::{RegistryError, Result, codes},
    model::{Entity, Event, PotentialDuplicatePair, SyncLevel},
    store::{EntityStore, EventStore, LogCursor},
    sync::{
        BatchReport,
        external::{AdapterCredentials, AdapterRegistry, ExternalSync, ExternalSyncReport},
        internal::{AuditBatch, PullResponse, PushRequest, PushResponse},
    },
};

#[derive(Clone)]
pub struct AppState {
    engine: Arc<EventEngine>,
    external: Arc<ExternalSync>,
    authorizer: Arc<dyn Authorizer>,
    page_size: usize,
}

impl AppState {
    pub fn new(
        engine: Arc<EventEngine>,
        external: Arc<ExternalSync>,
        authorizer: Arc<dyn Authorizer>,
        page_size: usize,
    ) -> Self {
        Self {
            engine,
            external,
            authorizer,
            page_size: page_size.max(1),
        }
    }

    pub fn engine(&self) -> Arc<EventEngine> {
        Arc::clone(&self.engine)
    }
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/sync/pull", get(sync_pull))
        .route("/sync/push", post(sync_push))
        .route("/sync/pull/audit-logs", get(audit_pull))
        .route("/sync/push/audit-logs", post(audit_push))
        .route("/sync/external", post(sync_external))
        .route("/potential-duplicates", get(list_duplicates))
        .route("/potential-duplicates/resolve", post(resolve_duplicate))
        .route("/events", post(submit_event))
        .route("/entities/{guid}", get(get_entity))
        .route("/entities/{guid}/verify", get(verify_entity))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Opens the stores, wires the engine and coordinators, and serves until
/// interrupted.
pub async fn run(config: Config) -> Result<()> {
    config.ensure_data_dir()?;

    let events = Arc::new(EventStore::open(
        config.event_store_path(),
        config.replica_id,
    )?);
    let entities = Arc::new(EntityStore::open(config.entity_store_path())?);
    let engine = Arc::new(EventEngine::new(events, entities));
    let registry = Arc::new(AdapterRegistry::with_builtins());
    let external = Arc::new(ExternalSync::new(Arc::clone(&engine), registry, &config));
    let authorizer: Arc<dyn Authorizer> = Arc::new(StaticTokenAuthorizer::from_config(&config.auth));

    let state = AppState::new(engine, external, authorizer, config.page_size);
    let app = build_router(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("listening on {}", listener.local_addr()?);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;
    Ok(())
}

fn authorize(state: &AppState, headers: &HeaderMap) -> Result<CallerClaims> {
    let bearer = headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .unwrap_or("");
    state.authorizer.authorize(bearer)
}

async fn healthz() -> &'static str {
    "ok"
}

#[derive(Debug, Deserialize)]
struct PullParams {
    since: Option<String>,
    #[serde(rename = "configId")]
    #[allow(dead_code)]
    config_id: Option<String>,
}

async fn sync_pull(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(params): Query<PullParams>,
) -> Result<Json<PullResponse>> {
    authorize(&state, &headers)?;

    // Serving more events while duplicate flags are outstanding compounds
    // ambiguity on the client, so the pull is refused with an in-band,
    // actionable signal instead of partial data.
    if state.engine.entity_store().has_unresolved_duplicates()? {
        return Ok(Json(PullResponse {
            events: Vec::new(),
            next_cursor: None,
            error: Some(
                "unresolved potential duplicates exist; resolve them before pulling".to_string(),
            ),
        }));
    }

    let cursor = params
        .since
        .as_deref()
        .map(LogCursor::from_str)
        .transpose()?;
    let (events, next) = state
        .engine
        .event_store()
        .events_since(cursor.as_ref(), state.page_size)?;
    Ok(Json(PullResponse {
        events,
        next_cursor: next.map(|cursor| cursor.to_string()),
        error: None,
    }))
}

async fn sync_push(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<PushRequest>,
) -> Result<Json<PushResponse>> {
    authorize(&state, &headers)?;

    let mut report = BatchReport::default();
    for event in request.events {
        let guid = event.guid.clone();
        match state.engine.submit_form(event) {
            Ok(_) => report.record_ok(guid),
            Err(err) => {
                warn!(event = %guid, error = %err, "pushed event skipped");
                report.record_error(guid, err);
            }
        }
    }

    Ok(Json(PushResponse {
        status: "success".to_string(),
        results: report.results,
    }))
}

#[derive(Debug, Deserialize)]
struct AuditParams {
    since: Option<i64>,
}

async fn audit_pull(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(params): Query<AuditParams>,
) -> Result<Json<AuditBatch>> {
    authorize(&state, &headers)?;

    let since = match params.since {
        Some(millis) => Some(parse_millis(millis)?),
        None => None,
    };
    let audit_logs = state.engine.event_store().audit_since(since, None)?;
    Ok(Json(AuditBatch { audit_logs }))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct AuditPushResponse {
    status: String,
    accepted: usize,
}

async fn audit_push(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(batch): Json<AuditBatch>,
) -> Result<Json<AuditPushResponse>> {
    authorize(&state, &headers)?;

    let events = state.engine.event_store();
    let accepted = batch.audit_logs.len();
    for entry in &batch.audit_logs {
        events.append_audit(entry)?;
    }
    Ok(Json(AuditPushResponse {
        status: "success".to_string(),
        accepted,
    }))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ExternalSyncRequest {
    config_id: String,
    #[serde(default)]
    credentials: AdapterCredentials,
}

async fn sync_external(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<ExternalSyncRequest>,
) -> Result<Json<ExternalSyncReport>> {
    let claims = authorize(&state, &headers)?;
    let report = state
        .external
        .run(&request.config_id, &request.credentials, &claims.user_id)
        .await?;
    Ok(Json(report))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct DuplicateList {
    duplicates: Vec<PotentialDuplicatePair>,
}

async fn list_duplicates(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<DuplicateList>> {
    authorize(&state, &headers)?;
    let duplicates = state.engine.entity_store().list_duplicates()?;
    Ok(Json(DuplicateList { duplicates }))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ResolveRequest {
    entity_guid: String,
    duplicate_guid: String,
    #[serde(default)]
    should_delete: bool,
}

#[derive(Debug, Serialize)]
struct StatusResponse {
    status: String,
}

async fn resolve_duplicate(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<ResolveRequest>,
) -> Result<Json<StatusResponse>> {
    let claims = authorize(&state, &headers)?;

    let event = Event::new(
        request.entity_guid,
        "resolve-duplicate",
        serde_json::json!({
            "duplicateGuid": request.duplicate_guid,
            "shouldDelete": request.should_delete,
        }),
        claims.user_id,
    );
    state.engine.submit_form(event)?;
    Ok(Json(StatusResponse {
        status: "success".to_string(),
    }))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SubmitEventRequest {
    entity_guid: String,
    #[serde(rename = "type")]
    event_type: String,
    #[serde(default)]
    data: Value,
    guid: Option<String>,
    timestamp: Option<DateTime<Utc>>,
}

async fn submit_event(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<SubmitEventRequest>,
) -> Result<Json<Option<Entity>>> {
    let claims = authorize(&state, &headers)?;

    let mut event = Event::new(
        request.entity_guid,
        request.event_type,
        request.data,
        claims.user_id,
    );
    if let Some(guid) = request.guid {
        event.guid = guid;
    }
    if let Some(timestamp) = request.timestamp {
        event.timestamp = timestamp;
    }
    event.sync_level = SyncLevel::Local;

    let entity = state.engine.submit_form(event)?;
    Ok(Json(entity))
}

async fn get_entity(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(guid): Path<String>,
) -> Result<Json<Entity>> {
    authorize(&state, &headers)?;
    let entity = state.engine.entity_store().get(&guid)?.ok_or_else(|| {
        RegistryError::domain(codes::ENTITY_NOT_FOUND, format!("entity {guid} not found"))
    })?;
    Ok(Json(entity))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct VerifyResponse {
    guid: String,
    root: String,
    consistent: bool,
    proof_valid: bool,
    version: Option<u64>,
}

/// Replays the entity from the log and checks the latest event's membership
/// proof against the current integrity digest.
async fn verify_entity(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(guid): Path<String>,
) -> Result<Json<VerifyResponse>> {
    authorize(&state, &headers)?;

    let events = state.engine.event_store();
    let stored = state.engine.entity_store().get(&guid)?;
    let replayed = state.engine.replay_entity(&guid)?;
    let consistent = match (&stored, &replayed) {
        (Some(current), Some(folded)) => current == folded,
        (None, None) => true,
        _ => false,
    };

    let history = events.events_for_entity(&guid)?;
    let proof_valid = match history.last() {
        Some(latest) => match events.membership_proof(&latest.event.guid)? {
            Some(proof) => events.verify(&latest.event, &proof)?,
            None => false,
        },
        None => stored.is_none(),
    };

    Ok(Json(VerifyResponse {
        guid,
        root: events.integrity_root()?,
        consistent,
        proof_valid,
        version: stored.map(|entity| entity.version),
    }))
}

fn parse_millis(millis: i64) -> Result<DateTime<Utc>> {
    Utc.timestamp_millis_opt(millis)
        .single()
        .ok_or_else(|| RegistryError::InvalidCursor(format!("bad timestamp {millis}")))
}
