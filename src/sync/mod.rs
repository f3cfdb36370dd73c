pub mod external;
pub mod internal;

use serde::{Deserialize, Serialize};

/// Per-record result collected while applying a batch. Sync surfaces report
/// these to the caller instead of burying failures in logs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordOutcome {
    pub guid: String,
    pub status: OutcomeStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutcomeStatus {
    Ok,
    Error,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchReport {
    #[serde(default)]
    pub results: Vec<RecordOutcome>,
}

impl BatchReport {
    pub fn record_ok(&mut self, guid: impl Into<String>) {
        self.results.push(RecordOutcome {
            guid: guid.into(),
            status: OutcomeStatus::Ok,
            error: None,
        });
    }

    pub fn record_error(&mut self, guid: impl Into<String>, error: impl ToString) {
        self.results.push(RecordOutcome {
            guid: guid.into(),
            status: OutcomeStatus::Error,
            error: Some(error.to_string()),
        });
    }

    pub fn applied(&self) -> usize {
        self.results
            .iter()
            .filter(|outcome| outcome.status == OutcomeStatus::Ok)
            .count()
    }

    pub fn failed(&self) -> usize {
        self.results.len() - self.applied()
    }
}
