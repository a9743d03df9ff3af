// Node and coordinator configuration
//
// Sources, lowest precedence first: built-in defaults, optional TOML file,
// environment variables prefixed TXCOORD__ (nested keys separated by "__").
// Binaries apply their own CLI overrides on top.

use serde::{Serialize, Deserialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::ids::ShardId;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Tunables for coordinator retry loops and bookkeeping
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    /// First backoff after a transient RPC or store failure
    pub retry_initial_backoff_ms: u64,

    /// Backoff ceiling (doubling stops here)
    pub retry_max_backoff_ms: u64,

    /// Abort if votes are not all collected within this window
    pub prepare_deadline_ms: Option<u64>,

    /// How long a finished coordinator stays cached for retried commits
    pub completed_retention_ms: u64,

    /// Coordinations at least this slow get a summary log line
    pub slow_op_threshold_ms: u64,

    /// Per-attempt timeout for participant RPCs
    pub rpc_timeout_ms: u64,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        CoordinatorConfig {
            retry_initial_backoff_ms: 10,
            retry_max_backoff_ms: 1_000,
            prepare_deadline_ms: None,
            completed_retention_ms: 30_000,
            slow_op_threshold_ms: 100,
            rpc_timeout_ms: 10_000,
        }
    }
}

impl CoordinatorConfig {
    pub fn retry_initial_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_initial_backoff_ms)
    }

    pub fn retry_max_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_max_backoff_ms.max(self.retry_initial_backoff_ms))
    }

    pub fn prepare_deadline(&self) -> Option<Duration> {
        self.prepare_deadline_ms.map(Duration::from_millis)
    }

    pub fn completed_retention(&self) -> Duration {
        Duration::from_millis(self.completed_retention_ms)
    }

    pub fn slow_op_threshold(&self) -> Duration {
        Duration::from_millis(self.slow_op_threshold_ms)
    }

    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_millis(self.rpc_timeout_ms)
    }

    /// Backoff to wait before attempt number `attempt` (0-based)
    pub fn backoff_for_attempt(&self, attempt: u32) -> Duration {
        let base = self.retry_initial_backoff();
        let factor = 1u32.checked_shl(attempt.min(16)).unwrap_or(u32::MAX);
        base.saturating_mul(factor).min(self.retry_max_backoff())
    }
}

/// Configuration of one node (one shard hosting a coordinator)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    pub shard_id: String,
    pub listen_addr: String,
    /// sled directory for coordinator documents; in-memory when absent
    pub data_dir: Option<PathBuf>,
    /// Shard id -> base URL of that shard's command endpoint
    pub shards: BTreeMap<String, String>,
    pub coordinator: CoordinatorConfig,
}

impl Default for NodeConfig {
    fn default() -> Self {
        NodeConfig {
            shard_id: "shard0".to_string(),
            listen_addr: "127.0.0.1:27100".to_string(),
            data_dir: None,
            shards: BTreeMap::new(),
            coordinator: CoordinatorConfig::default(),
        }
    }
}

impl NodeConfig {
    /// Load from an optional file plus TXCOORD__* environment variables
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }
        builder = builder.add_source(
            config::Environment::with_prefix("TXCOORD")
                .prefix_separator("__")
                .separator("__"),
        );

        let loaded: NodeConfig = builder.build()?.try_deserialize()?;
        loaded.validate()?;
        Ok(loaded)
    }

    pub fn shard(&self) -> ShardId {
        ShardId::new(self.shard_id.clone())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.shard_id.trim().is_empty() {
            return Err(ConfigError::Invalid("shard_id must not be empty".to_string()));
        }
        if self.coordinator.retry_initial_backoff_ms == 0 {
            return Err(ConfigError::Invalid(
                "coordinator.retry_initial_backoff_ms must be positive".to_string(),
            ));
        }
        if self.coordinator.rpc_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "coordinator.rpc_timeout_ms must be positive".to_string(),
            ));
        }
        for (shard, url) in &self.shards {
            if !(url.starts_with("http://") || url.starts_with("https://")) {
                return Err(ConfigError::Invalid(format!(
                    "shard {} has non-http endpoint {}",
                    shard, url
                )));
            }
        }
        Ok(())
    }
}
