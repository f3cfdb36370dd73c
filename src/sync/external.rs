use std::{collections::BTreeMap, sync::Arc, time::Duration};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{info, warn};

use super::BatchReport;
use crate::{
    config::{Config, ExternalTargetConfig},
    engine::EventEngine,
    error::{RegistryError, Result},
    model::{EntityKind, Event, StoredEvent, SyncLevel},
    store::{LogCursor, WatermarkKind},
};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AdapterCredentials {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdapterSession {
    pub token: String,
}

/// Raw record as a third-party registry reports it; the coordinator turns
/// each one into a synthetic event.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExternalRecord {
    pub external_id: String,
    #[serde(rename = "type")]
    pub kind: EntityKind,
    pub data: Value,
    pub updated_at: DateTime<Utc>,
}

/// Strategy implemented per third-party protocol. The coordinator only
/// orchestrates watermarks and batching around these three calls.
#[async_trait]
pub trait ExternalAdapter: Send + Sync {
    fn name(&self) -> &str;
    async fn authenticate(&self, credentials: &AdapterCredentials) -> Result<AdapterSession>;
    async fn push_data(&self, session: &AdapterSession, events: &[StoredEvent]) -> Result<()>;
    async fn pull_data(
        &self,
        session: &AdapterSession,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<ExternalRecord>>;
}

pub type AdapterFactory =
    Arc<dyn Fn(&ExternalTargetConfig, Duration) -> Result<Arc<dyn ExternalAdapter>> + Send + Sync>;

/// Adapter strategies keyed by the configured adapter name. Ships with the
/// generic REST adapter; callers may register more.
pub struct AdapterRegistry {
    factories: RwLock<BTreeMap<String, AdapterFactory>>,
}

impl AdapterRegistry {
    pub fn with_builtins() -> Self {
        let registry = Self {
            factories: RwLock::new(BTreeMap::new()),
        };
        registry.register(
            "restapi",
            Arc::new(|target, timeout| {
                Ok(Arc::new(RestAdapter::new(&target.url, timeout)?) as Arc<dyn ExternalAdapter>)
            }),
        );
        registry
    }

    pub fn register(&self, name: impl Into<String>, factory: AdapterFactory) {
        self.factories.write().insert(name.into(), factory);
    }

    pub fn resolve(
        &self,
        target: &ExternalTargetConfig,
        timeout: Duration,
    ) -> Result<Arc<dyn ExternalAdapter>> {
        let factory = self
            .factories
            .read()
            .get(&target.adapter)
            .cloned()
            .ok_or_else(|| {
                RegistryError::Config(format!("no adapter registered as '{}'", target.adapter))
            })?;
        factory(target, timeout)
    }
}

/// Built-in adapter for registries speaking plain REST+JSON:
/// `POST /authenticate`, `POST /records/batch`, `GET /records?since=`.
pub struct RestAdapter {
    base_url: String,
    http: reqwest::Client,
}

impl RestAdapter {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|err| RegistryError::Http(err.to_string()))?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            http,
        })
    }
}

#[derive(Debug, Deserialize)]
struct RestAuthResponse {
    token: String,
}

#[async_trait]
impl ExternalAdapter for RestAdapter {
    fn name(&self) -> &str {
        "restapi"
    }

    async fn authenticate(&self, credentials: &AdapterCredentials) -> Result<AdapterSession> {
        let response = self
            .http
            .post(format!("{}/authenticate", self.base_url))
            .json(credentials)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(RegistryError::Http(format!(
                "external authentication failed with status {}",
                response.status()
            )));
        }
        let body: RestAuthResponse = response.json().await?;
        Ok(AdapterSession { token: body.token })
    }

    async fn push_data(&self, session: &AdapterSession, events: &[StoredEvent]) -> Result<()> {
        let response = self
            .http
            .post(format!("{}/records/batch", self.base_url))
            .bearer_auth(&session.token)
            .json(&serde_json::json!({ "events": events }))
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(RegistryError::Http(format!(
                "external push failed with status {}",
                response.status()
            )));
        }
        Ok(())
    }

    async fn pull_data(
        &self,
        session: &AdapterSession,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<ExternalRecord>> {
        let mut request = self
            .http
            .get(format!("{}/records", self.base_url))
            .bearer_auth(&session.token);
        if let Some(since) = since {
            request = request.query(&[("since", since.to_rfc3339())]);
        }
        let response = request.send().await?;
        if !response.status().is_success() {
            return Err(RegistryError::Http(format!(
                "external pull failed with status {}",
                response.status()
            )));
        }
        Ok(response.json().await?)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExternalSyncReport {
    pub pushed: usize,
    pub pushed_batches: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub push_error: Option<String>,
    pub imported: BatchReport,
}

/// Reconciles the server replica with one configured third-party registry.
pub struct ExternalSync {
    engine: Arc<EventEngine>,
    registry: Arc<AdapterRegistry>,
    targets: BTreeMap<String, ExternalTargetConfig>,
    default_batch_size: usize,
    timeout: Duration,
}

impl ExternalSync {
    pub fn new(engine: Arc<EventEngine>, registry: Arc<AdapterRegistry>, config: &Config) -> Self {
        Self {
            engine,
            registry,
            targets: config.externals.clone(),
            default_batch_size: config.batch_size,
            timeout: config.request_timeout(),
        }
    }

    /// One authenticate + push + pull cycle against the named target. Push
    /// and pull failures are reported, not thrown, so a flaky registry
    /// cannot wedge the cycle halfway with state unaccounted for.
    pub async fn run(
        &self,
        config_id: &str,
        credentials: &AdapterCredentials,
        user_id: &str,
    ) -> Result<ExternalSyncReport> {
        let target = self
            .targets
            .get(config_id)
            .ok_or_else(|| RegistryError::UnknownTarget(config_id.to_string()))?;
        let adapter = self.registry.resolve(target, self.timeout)?;
        let session = adapter.authenticate(credentials).await?;

        let batch_size = target.batch_size.unwrap_or(self.default_batch_size).max(1);
        let mut report = ExternalSyncReport::default();
        self.push(adapter.as_ref(), &session, batch_size, &mut report)
            .await?;
        report.imported = self.pull(adapter.as_ref(), &session, user_id).await?;

        info!(
            target = config_id,
            adapter = adapter.name(),
            pushed = report.pushed,
            imported = report.imported.applied(),
            import_failures = report.imported.failed(),
            "external sync cycle finished"
        );
        Ok(report)
    }

    /// Sends events after the push watermark in fixed-size batches. The
    /// watermark advances to a batch's latest timestamp only once that batch
    /// is acknowledged: a mid-batch failure replays the whole batch on the
    /// next cycle, never skipping events.
    async fn push(
        &self,
        adapter: &dyn ExternalAdapter,
        session: &AdapterSession,
        batch_size: usize,
        report: &mut ExternalSyncReport,
    ) -> Result<()> {
        let events = self.engine.event_store();
        let since = events.watermark(WatermarkKind::ExternalPush)?;
        let cursor = since.map(LogCursor::after_timestamp);

        let mut pending = Vec::new();
        let mut page_cursor = cursor;
        loop {
            let (page, next) = events.events_since(page_cursor.as_ref(), 512)?;
            pending.extend(
                page.into_iter()
                    // Externally-imported data never flows back out.
                    .filter(|record| record.event.sync_level != SyncLevel::External),
            );
            match next {
                Some(next) => page_cursor = Some(next),
                None => break,
            }
        }

        for batch in pending.chunks(batch_size) {
            match adapter.push_data(session, batch).await {
                Ok(()) => {
                    let latest = batch
                        .iter()
                        .map(|record| record.event.timestamp)
                        .max()
                        .expect("non-empty batch");
                    events.set_watermark(WatermarkKind::ExternalPush, latest)?;
                    report.pushed += batch.len();
                    report.pushed_batches += 1;
                }
                Err(err) => {
                    warn!(
                        adapter = adapter.name(),
                        error = %err,
                        "external push batch failed; watermark stays at previous batch"
                    );
                    report.push_error = Some(err.to_string());
                    return Ok(());
                }
            }
        }
        Ok(())
    }

    /// Imports raw records since the pull watermark, one synthetic event per
    /// record, isolating failures per record.
    async fn pull(
        &self,
        adapter: &dyn ExternalAdapter,
        session: &AdapterSession,
        user_id: &str,
    ) -> Result<BatchReport> {
        let events = self.engine.event_store();
        let since = events.watermark(WatermarkKind::ExternalPull)?;
        let records = adapter.pull_data(session, since).await?;

        let mut report = BatchReport::default();
        let mut newest = since;
        for record in &records {
            newest = Some(newest.map_or(record.updated_at, |current| {
                current.max(record.updated_at)
            }));
            match self.import_record(record, user_id) {
                Ok(guid) => report.record_ok(guid),
                Err(err) => {
                    warn!(
                        external_id = %record.external_id,
                        error = %err,
                        "external record failed to import"
                    );
                    report.record_error(&record.external_id, err);
                }
            }
        }
        if let Some(newest) = newest {
            events.set_watermark(WatermarkKind::ExternalPull, newest)?;
        }
        Ok(report)
    }

    fn import_record(&self, record: &ExternalRecord, user_id: &str) -> Result<String> {
        let entities = self.engine.entity_store();
        let existing = entities.find_by_external_id(&record.external_id)?;

        let entity_guid = existing
            .as_ref()
            .map(|entity| entity.guid.clone())
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let event_type = match (existing.is_some(), record.kind) {
            (false, EntityKind::Individual) => "create-individual",
            (false, EntityKind::Group) => "create-group",
            (true, EntityKind::Individual) => "update-individual",
            (true, EntityKind::Group) => "update-group",
        };

        let mut data = match &record.data {
            Value::Object(map) => map.clone(),
            Value::Null => Map::new(),
            _ => {
                return Err(RegistryError::Validation(
                    "external record data must be a JSON object".to_string(),
                ));
            }
        };
        data.insert(
            "externalId".to_string(),
            Value::String(record.external_id.clone()),
        );

        let event = Event {
            guid: uuid::Uuid::new_v4().to_string(),
            entity_guid: entity_guid.clone(),
            event_type: event_type.to_string(),
            data: Value::Object(data),
            timestamp: record.updated_at,
            user_id: user_id.to_string(),
            sync_level: SyncLevel::External,
        };
        self.engine.submit_form(event)?;
        Ok(entity_guid)
    }
}
