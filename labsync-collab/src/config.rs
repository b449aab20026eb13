//! Process configuration: an optional JSON file plus environment overrides.
//!
//! ```json
//! {
//!   "server":    { "bind_addr": "0.0.0.0:9090" },
//!   "storage":   { "data_dir": "/var/lib/labsync" },
//!   "history":   { "max_history": 50 },
//!   "gateway":   { "timeout_ms": 15000 },
//!   "scheduler": { "default_document": "1" }
//! }
//! ```
//!
//! Every section and field is optional. Environment variables win over the
//! file: `LABSYNC_BIND`, `LABSYNC_DATA_DIR`, `LABSYNC_MAX_HISTORY`,
//! `LABSYNC_RPC_TIMEOUT_MS`.

use std::path::{Path, PathBuf};
use std::time::Duration;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use labsync_core::DEFAULT_MAX_HISTORY;

use crate::gateway::DEFAULT_RPC_TIMEOUT;
use crate::scheduler::SchedulerConfig;
use crate::server::ServerConfig;

pub const ENV_BIND: &str = "LABSYNC_BIND";
pub const ENV_DATA_DIR: &str = "LABSYNC_DATA_DIR";
pub const ENV_MAX_HISTORY: &str = "LABSYNC_MAX_HISTORY";
pub const ENV_RPC_TIMEOUT_MS: &str = "LABSYNC_RPC_TIMEOUT_MS";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Cannot read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Cannot parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("Invalid value for {key}: {value}")]
    Invalid { key: String, value: String },
}

/// Storage location. `None` keeps everything in memory.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub data_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HistoryConfig {
    /// Undo depth; the stack holds one more entry than this.
    pub max_history: usize,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            max_history: DEFAULT_MAX_HISTORY,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub timeout_ms: u64,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            timeout_ms: DEFAULT_RPC_TIMEOUT.as_millis() as u64,
        }
    }
}

impl GatewayConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Whole-process configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LabConfig {
    pub server: ServerConfig,
    pub storage: StorageConfig,
    pub history: HistoryConfig,
    pub gateway: GatewayConfig,
    pub scheduler: SchedulerConfig,
}

impl LabConfig {
    /// Load from `path` (if given), then apply the process environment.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Apply overrides from `lookup`, usually the environment.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<(), ConfigError> {
        if let Some(bind) = lookup(ENV_BIND) {
            self.server.bind_addr = bind;
        }
        if let Some(dir) = lookup(ENV_DATA_DIR) {
            self.storage.data_dir = (!dir.trim().is_empty()).then(|| PathBuf::from(dir));
        }
        if let Some(raw) = lookup(ENV_MAX_HISTORY) {
            self.history.max_history = parse_number(ENV_MAX_HISTORY, &raw)?;
        }
        if let Some(raw) = lookup(ENV_RPC_TIMEOUT_MS) {
            self.gateway.timeout_ms = parse_number(ENV_RPC_TIMEOUT_MS, &raw)?;
        }
        self.validate()
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.server.bind_addr.trim().is_empty() {
            return Err(invalid("server.bind_addr", &self.server.bind_addr));
        }
        if self.gateway.timeout_ms == 0 {
            return Err(invalid("gateway.timeout_ms", "0"));
        }
        if self.server.broadcast_capacity == 0 {
            return Err(invalid("server.broadcast_capacity", "0"));
        }
        Ok(())
    }
}

fn parse_number<T: std::str::FromStr>(key: &str, raw: &str) -> Result<T, ConfigError> {
    raw.trim().parse().map_err(|_| invalid(key, raw))
}

fn invalid(key: &str, value: &str) -> ConfigError {
    ConfigError::Invalid {
        key: key.to_string(),
        value: value.to_string(),
    }
}
