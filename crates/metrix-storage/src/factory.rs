use crate::config::StorageConfig;
use crate::context::Context;
use crate::error::Result;
use crate::file::{FileStore, FileStoreOptions};
use crate::memory::MemoryStore;
use crate::relational::RelationalStore;
use crate::Collector;
use std::path::PathBuf;
use std::sync::Arc;

/// Backend chosen for a [`StorageConfig`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Backend {
    Relational { dsn: String },
    File { path: PathBuf },
    Memory,
}

/// A DSN wins over a file path; with neither, metrics stay in memory.
/// Blank values count as unset.
pub fn select_backend(config: &StorageConfig) -> Backend {
    if let Some(dsn) = config.database_dsn.as_deref().map(str::trim) {
        if !dsn.is_empty() {
            return Backend::Relational {
                dsn: dsn.to_string(),
            };
        }
    }
    match &config.file_storage_path {
        Some(path) if !path.as_os_str().is_empty() => Backend::File { path: path.clone() },
        _ => Backend::Memory,
    }
}

/// Builds the collector described by `config`.
///
/// `ctx` bounds construction; for the file backend, cancelling it also stops
/// the periodic snapshot task.
pub async fn open_collector(ctx: &Context, config: &StorageConfig) -> Result<Arc<dyn Collector>> {
    let collector: Arc<dyn Collector> = match select_backend(config) {
        Backend::Relational { dsn } => {
            tracing::info!("Using relational metric storage");
            Arc::new(
                RelationalStore::connect(ctx, &dsn, config.retry.policy(), config.ping_timeout())
                    .await?,
            )
        }
        Backend::File { path } => {
            tracing::info!(path = %path.display(), "Using file metric storage");
            let options = FileStoreOptions {
                path,
                store_interval: config.store_interval(),
                restore: config.restore,
            };
            Arc::new(FileStore::open(ctx, options).await?)
        }
        Backend::Memory => {
            tracing::info!("Using in-memory metric storage");
            Arc::new(MemoryStore::new())
        }
    };
    Ok(collector)
}

#[cfg(test)]
mod tests {
    use super::*;
    use metrix_common::MetricValue;
    use tempfile::TempDir;

    #[test]
    fn dsn_takes_precedence() {
        let config = StorageConfig {
            database_dsn: Some("postgres://localhost/metrics".into()),
            file_storage_path: Some("/tmp/metrics.json".into()),
            ..Default::default()
        };
        assert_eq!(
            select_backend(&config),
            Backend::Relational {
                dsn: "postgres://localhost/metrics".into()
            }
        );
    }

    #[test]
    fn blank_values_fall_through_to_memory() {
        let config = StorageConfig {
            database_dsn: Some("  ".into()),
            file_storage_path: Some(PathBuf::new()),
            ..Default::default()
        };
        assert_eq!(select_backend(&config), Backend::Memory);
    }

    #[test]
    fn path_selects_file_backend() {
        let config = StorageConfig {
            file_storage_path: Some("/var/lib/metrix/metrics.json".into()),
            ..Default::default()
        };
        assert_eq!(
            select_backend(&config),
            Backend::File {
                path: "/var/lib/metrix/metrics.json".into()
            }
        );
    }

    #[tokio::test]
    async fn opens_file_backend_from_config() {
        let dir = TempDir::new().unwrap();
        let config = StorageConfig {
            file_storage_path: Some(dir.path().join("metrics.json")),
            store_interval_secs: 0,
            ..Default::default()
        };
        let ctx = Context::background();
        let collector = open_collector(&ctx, &config).await.unwrap();
        collector
            .update_metric(&ctx, "gauge", "Alloc", MetricValue::Gauge(1.0))
            .await
            .unwrap();
        collector.close().await.unwrap();
        assert!(dir.path().join("metrics.json").exists());
    }

    #[tokio::test]
    async fn opens_relational_backend_from_sqlite_dsn() {
        let dir = TempDir::new().unwrap();
        let config = StorageConfig {
            database_dsn: Some(format!(
                "sqlite://{}?mode=rwc",
                dir.path().join("metrics.db").display()
            )),
            ..Default::default()
        };
        let ctx = Context::background();
        let collector = open_collector(&ctx, &config).await.unwrap();
        collector.ping(&ctx).await.unwrap();
        collector.close().await.unwrap();
    }
}
