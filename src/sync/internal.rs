use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::BatchReport;
use crate::{
    config::RemoteConfig,
    engine::EventEngine,
    error::{RegistryError, Result},
    model::{AuditLogEntry, Event, StoredEvent, SyncLevel},
    store::{LogCursor, WatermarkKind},
};

/// One page of the server's event log. `error` is populated in-band when
/// unresolved duplicates block the pull.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PullResponse {
    pub events: Vec<StoredEvent>,
    pub next_cursor: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PushRequest {
    pub events: Vec<Event>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PushResponse {
    pub status: String,
    #[serde(default)]
    pub results: Vec<super::RecordOutcome>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditBatch {
    pub audit_logs: Vec<AuditLogEntry>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PullReport {
    pub pages: usize,
    pub report: BatchReport,
}

/// Client half of the client <-> server reconciliation. The server half
/// lives in the HTTP surface; both funnel every applied event through
/// `submit_form`.
pub struct InternalSync {
    engine: Arc<EventEngine>,
    remote: RemoteConfig,
    http: reqwest::Client,
}

impl InternalSync {
    pub fn new(
        engine: Arc<EventEngine>,
        remote: RemoteConfig,
        timeout: std::time::Duration,
    ) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|err| RegistryError::Http(err.to_string()))?;
        Ok(Self {
            engine,
            remote,
            http,
        })
    }

    /// Pulls server pages strictly sequentially, applying each page in full
    /// before requesting the next or advancing the resume cursor. A
    /// duplicates-outstanding signal from the server aborts the pull with an
    /// actionable error instead of partial data.
    pub async fn pull(&self) -> Result<PullReport> {
        let events = self.engine.event_store();
        let mut cursor = events.pull_cursor()?;
        let mut report = PullReport::default();

        loop {
            let mut request = self
                .http
                .get(format!("{}/sync/pull", self.remote.url))
                .bearer_auth(&self.remote.token);
            if let Some(since) = &cursor {
                request = request.query(&[("since", since.as_str())]);
            }
            if let Some(config_id) = &self.remote.config_id {
                request = request.query(&[("configId", config_id.as_str())]);
            }

            let response = request.send().await?;
            if !response.status().is_success() {
                return Err(RegistryError::Http(format!(
                    "pull failed with status {}",
                    response.status()
                )));
            }
            let page: PullResponse = response.json().await?;
            if let Some(message) = page.error {
                return Err(RegistryError::SyncBlocked(message));
            }
            if page.events.is_empty() {
                break;
            }

            for record in &page.events {
                let mut event = record.event.clone();
                event.sync_level = SyncLevel::Synced;
                let guid = event.guid.clone();
                match self.engine.submit_form(event) {
                    Ok(_) => report.report.record_ok(guid),
                    Err(err) => {
                        warn!(event = %guid, error = %err, "pulled event failed to apply");
                        report.report.record_error(guid, err);
                    }
                }
            }
            report.pages += 1;

            // Advance only after the whole page applied.
            let resume = match &page.next_cursor {
                Some(next) => next.clone(),
                None => page
                    .events
                    .last()
                    .map(|record| LogCursor::for_event(record).to_string())
                    .unwrap_or_default(),
            };
            events.set_pull_cursor(&resume)?;

            match page.next_cursor {
                Some(next) => cursor = Some(next),
                None => break,
            }
        }

        info!(
            pages = report.pages,
            applied = report.report.applied(),
            failed = report.report.failed(),
            "internal pull finished"
        );
        Ok(report)
    }

    /// Pushes locally-created events in causal (timestamp) order, tagged as
    /// server-accepted before the wire. The server skips failing events
    /// rather than aborting the batch; every accepted guid is marked synced
    /// locally so it is never re-sent.
    pub async fn push(&self) -> Result<BatchReport> {
        let events = self.engine.event_store();
        let pending = events.pending_push()?;
        if pending.is_empty() {
            return Ok(BatchReport::default());
        }

        let outbound: Vec<Event> = pending
            .iter()
            .map(|record| {
                let mut event = record.event.clone();
                event.sync_level = SyncLevel::Synced;
                event
            })
            .collect();

        let response = self
            .http
            .post(format!("{}/sync/push", self.remote.url))
            .bearer_auth(&self.remote.token)
            .json(&PushRequest {
                events: outbound,
                config_id: self.remote.config_id.clone(),
            })
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(RegistryError::Http(format!(
                "push failed with status {}",
                response.status()
            )));
        }

        let body: PushResponse = response.json().await?;
        let report = BatchReport {
            results: body.results,
        };
        for outcome in &report.results {
            match outcome.status {
                super::OutcomeStatus::Ok => events.mark_synced(&outcome.guid)?,
                super::OutcomeStatus::Error => warn!(
                    event = %outcome.guid,
                    error = outcome.error.as_deref().unwrap_or("unknown"),
                    "server skipped pushed event"
                ),
            }
        }

        info!(
            pushed = report.applied(),
            skipped = report.failed(),
            "internal push finished"
        );
        Ok(report)
    }

    /// One-directional audit trail pull, keyed purely on timestamps. No
    /// duplicate gate.
    pub async fn pull_audit(&self) -> Result<usize> {
        let events = self.engine.event_store();
        let since = events.watermark(WatermarkKind::AuditPull)?;

        let mut request = self
            .http
            .get(format!("{}/sync/pull/audit-logs", self.remote.url))
            .bearer_auth(&self.remote.token);
        if let Some(since) = since {
            request = request.query(&[("since", since.timestamp_millis().to_string())]);
        }
        let response = request.send().await?;
        if !response.status().is_success() {
            return Err(RegistryError::Http(format!(
                "audit pull failed with status {}",
                response.status()
            )));
        }

        let batch: AuditBatch = response.json().await?;
        let mut newest: Option<DateTime<Utc>> = since;
        for entry in &batch.audit_logs {
            events.append_audit(entry)?;
            newest = Some(newest.map_or(entry.timestamp, |current| current.max(entry.timestamp)));
        }
        if let Some(newest) = newest {
            events.set_watermark(WatermarkKind::AuditPull, newest)?;
        }
        Ok(batch.audit_logs.len())
    }

    pub async fn push_audit(&self) -> Result<usize> {
        let events = self.engine.event_store();
        let since = events.watermark(WatermarkKind::AuditPush)?;
        let entries = events.audit_since(since, None)?;
        if entries.is_empty() {
            return Ok(0);
        }
        let newest = entries
            .iter()
            .map(|entry| entry.timestamp)
            .max()
            .expect("non-empty audit batch");

        let response = self
            .http
            .post(format!("{}/sync/push/audit-logs", self.remote.url))
            .bearer_auth(&self.remote.token)
            .json(&AuditBatch {
                audit_logs: entries.clone(),
            })
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(RegistryError::Http(format!(
                "audit push failed with status {}",
                response.status()
            )));
        }

        events.set_watermark(WatermarkKind::AuditPush, newest)?;
        Ok(entries.len())
    }
}
