use crate::retry::RetryPolicy;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Storage section of the server and agent configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Database DSN; when set, metrics live in the relational backend.
    #[serde(default)]
    pub database_dsn: Option<String>,
    /// Snapshot file; when set (and no DSN is), metrics are snapshotted here.
    #[serde(default)]
    pub file_storage_path: Option<PathBuf>,
    /// Seconds between snapshots; 0 writes on every update.
    #[serde(default = "default_store_interval_secs")]
    pub store_interval_secs: u64,
    /// Load the snapshot file at startup.
    #[serde(default = "default_restore")]
    pub restore: bool,
    #[serde(default = "default_ping_timeout_ms")]
    pub ping_timeout_ms: u64,
    #[serde(default)]
    pub retry: RetryConfig,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            database_dsn: None,
            file_storage_path: None,
            store_interval_secs: default_store_interval_secs(),
            restore: default_restore(),
            ping_timeout_ms: default_ping_timeout_ms(),
            retry: RetryConfig::default(),
        }
    }
}

impl StorageConfig {
    pub fn store_interval(&self) -> Duration {
        Duration::from_secs(self.store_interval_secs)
    }

    pub fn ping_timeout(&self) -> Duration {
        Duration::from_millis(self.ping_timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            base_delay_ms: default_base_delay_ms(),
        }
    }
}

impl RetryConfig {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.max_retries, Duration::from_millis(self.base_delay_ms))
    }
}

fn default_store_interval_secs() -> u64 {
    300
}

fn default_restore() -> bool {
    true
}

fn default_ping_timeout_ms() -> u64 {
    2000
}

fn default_max_retries() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    1000
}
