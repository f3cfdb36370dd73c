use std::{
    collections::BTreeMap,
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use serde::{Deserialize, Serialize};

use crate::error::{RegistryError, Result};

pub const DEFAULT_PORT: u16 = 7171;
pub const DEFAULT_PAGE_SIZE: usize = 10;
pub const DEFAULT_BATCH_SIZE: usize = 100;
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_page_size() -> usize {
    DEFAULT_PAGE_SIZE
}

fn default_batch_size() -> usize {
    DEFAULT_BATCH_SIZE
}

fn default_request_timeout_secs() -> u64 {
    DEFAULT_REQUEST_TIMEOUT_SECS
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub data_dir: Option<PathBuf>,
    /// Distinguishes this replica's sequence ids from every other replica's.
    #[serde(default)]
    pub replica_id: u16,
    /// Server-controlled page size for internal pulls.
    #[serde(default = "default_page_size")]
    pub page_size: usize,
    /// Batch size for external pushes.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    #[serde(default)]
    pub auth: AuthConfig,
    /// The server replica this client reconciles with.
    #[serde(default)]
    pub remote: Option<RemoteConfig>,
    /// Third-party registries, keyed by the configId callers pass.
    #[serde(default)]
    pub externals: BTreeMap<String, ExternalTargetConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            data_dir: None,
            replica_id: 0,
            page_size: DEFAULT_PAGE_SIZE,
            batch_size: DEFAULT_BATCH_SIZE,
            request_timeout_secs: DEFAULT_REQUEST_TIMEOUT_SECS,
            auth: AuthConfig::default(),
            remote: None,
            externals: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuthConfig {
    /// Accept unauthenticated callers as user "anonymous". Local
    /// development only.
    #[serde(default)]
    pub allow_anonymous: bool,
    #[serde(default)]
    pub tokens: Vec<AuthTokenConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthTokenConfig {
    /// Hex sha-256 of the accepted bearer token.
    pub sha256: String,
    pub user_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteConfig {
    pub url: String,
    #[serde(default)]
    pub token: String,
    #[serde(default)]
    pub config_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExternalTargetConfig {
    /// Adapter strategy name, e.g. "restapi".
    pub adapter: String,
    pub url: String,
    #[serde(default)]
    pub batch_size: Option<usize>,
}

impl Config {
    pub fn data_dir(&self) -> PathBuf {
        match &self.data_dir {
            Some(dir) => dir.clone(),
            None => dirs::data_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("rosterdbx"),
        }
    }

    pub fn event_store_path(&self) -> PathBuf {
        self.data_dir().join("events.db")
    }

    pub fn entity_store_path(&self) -> PathBuf {
        self.data_dir().join("entities.db")
    }

    pub fn log_dir(&self) -> PathBuf {
        self.data_dir().join("logs")
    }

    pub fn ensure_data_dir(&self) -> Result<()> {
        fs::create_dir_all(self.data_dir())?;
        Ok(())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn external_batch_size(&self, target: &ExternalTargetConfig) -> usize {
        target.batch_size.unwrap_or(self.batch_size)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let rendered = toml::to_string_pretty(self)?;
        fs::write(path, rendered)?;
        Ok(())
    }

    pub fn apply_update(&mut self, update: ConfigUpdate) {
        let ConfigUpdate {
            port,
            data_dir,
            replica_id,
            page_size,
            batch_size,
            request_timeout_secs,
        } = update;

        if let Some(port) = port {
            self.port = port;
        }
        if let Some(data_dir) = data_dir {
            self.data_dir = Some(data_dir);
        }
        if let Some(replica_id) = replica_id {
            self.replica_id = replica_id;
        }
        if let Some(page_size) = page_size {
            self.page_size = page_size.max(1);
        }
        if let Some(batch_size) = batch_size {
            self.batch_size = batch_size.max(1);
        }
        if let Some(timeout) = request_timeout_secs {
            self.request_timeout_secs = timeout.max(1);
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ConfigUpdate {
    pub port: Option<u16>,
    pub data_dir: Option<PathBuf>,
    pub replica_id: Option<u16>,
    pub page_size: Option<usize>,
    pub batch_size: Option<usize>,
    pub request_timeout_secs: Option<u64>,
}

pub fn default_config_path() -> Result<PathBuf> {
    let base = dirs::config_dir()
        .ok_or_else(|| RegistryError::Config("cannot determine config directory".to_string()))?;
    Ok(base.join("rosterdbx").join("config.toml"))
}

/// Loads the config file, falling back to defaults when it does not exist
/// yet. Returns the path the config should be saved back to.
pub fn load_or_default(path: Option<PathBuf>) -> Result<(Config, PathBuf)> {
    let path = match path {
        Some(path) => path,
        None => default_config_path()?,
    };

    if path.exists() {
        let contents = fs::read_to_string(&path)?;
        let config = toml::from_str(&contents)?;
        Ok((config, path))
    } else {
        Ok((Config::default(), path))
    }
}
