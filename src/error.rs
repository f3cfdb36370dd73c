use std::io;

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, RegistryError>;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("configuration error: {0}")]
    Config(String),
    #[error("unauthorized")]
    Unauthorized,
    #[error("invalid event: {0}")]
    Validation(String),
    #[error("{message}")]
    Domain { code: &'static str, message: String },
    #[error("unsupported event type '{0}'")]
    UnsupportedEvent(String),
    #[error("log integrity violation: {0}")]
    Integrity(String),
    #[error("sync blocked: {0}")]
    SyncBlocked(String),
    #[error("invalid cursor: {0}")]
    InvalidCursor(String),
    #[error("remote request failed: {0}")]
    Http(String),
    #[error("unknown sync target '{0}'")]
    UnknownTarget(String),
    #[error("storage error: {0}")]
    Storage(String),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl RegistryError {
    pub fn domain(code: &'static str, message: impl Into<String>) -> Self {
        Self::Domain {
            code,
            message: message.into(),
        }
    }

    /// Stable machine-readable code, used in HTTP bodies and per-record
    /// sync reports.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Config(_) => "config",
            Self::Unauthorized => "unauthorized",
            Self::Validation(_) => "validation",
            Self::Domain { code, .. } => *code,
            Self::UnsupportedEvent(_) => "unsupported-event-type",
            Self::Integrity(_) => "integrity",
            Self::SyncBlocked(_) => "sync-blocked",
            Self::InvalidCursor(_) => "invalid-cursor",
            Self::Http(_) => "remote-request",
            Self::UnknownTarget(_) => "unknown-target",
            Self::Storage(_) => "storage",
            Self::Io(_) => "io",
            Self::Serialization(_) => "serialization",
        }
    }
}

pub mod codes {
    pub const ENTITY_NOT_FOUND: &str = "entity-not-found";
    pub const NOT_A_GROUP: &str = "not-a-group";
    pub const KIND_MISMATCH: &str = "kind-mismatch";
    pub const MISSING_MEMBER_ID: &str = "missing-member-id";
    pub const MISSING_DUPLICATE_GUID: &str = "missing-duplicate-guid";
    pub const SELF_REFERENCE: &str = "self-reference";
    pub const VERSION_CONFLICT: &str = "version-conflict";
}

impl From<toml::de::Error> for RegistryError {
    fn from(err: toml::de::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<toml::ser::Error> for RegistryError {
    fn from(err: toml::ser::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<serde_json::Error> for RegistryError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<reqwest::Error> for RegistryError {
    fn from(err: reqwest::Error) -> Self {
        Self::Http(err.to_string())
    }
}

#[derive(Serialize)]
struct ErrorBody<'a> {
    code: &'a str,
    message: &'a str,
}

impl IntoResponse for RegistryError {
    fn into_response(self) -> Response {
        let status = match &self {
            Self::Config(_) => StatusCode::BAD_REQUEST,
            Self::Unauthorized => StatusCode::UNAUTHORIZED,
            Self::Validation(_) | Self::UnsupportedEvent(_) | Self::InvalidCursor(_) => {
                StatusCode::BAD_REQUEST
            }
            Self::Domain { code, .. } if *code == codes::ENTITY_NOT_FOUND => StatusCode::NOT_FOUND,
            Self::Domain { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            Self::Integrity(_) | Self::SyncBlocked(_) => StatusCode::CONFLICT,
            Self::UnknownTarget(_) => StatusCode::NOT_FOUND,
            Self::Http(_) => StatusCode::BAD_GATEWAY,
            Self::Storage(_) | Self::Io(_) | Self::Serialization(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };

        let code = self.code();
        let message = self.to_string();
        (
            status,
            Json(ErrorBody {
                code,
                message: &message,
            }),
        )
            .into_response()
    }
}
