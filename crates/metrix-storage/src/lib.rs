//! Metric storage for the metrix server and agent.
//!
//! Every backend implements [`Collector`]. [`memory::MemoryStore`] keeps
//! metrics in process, [`file::FileStore`] adds JSON snapshots on disk on top
//! of a memory store, and [`relational::RelationalStore`] keeps them in a
//! single database table. [`factory::open_collector`] picks one from a
//! [`config::StorageConfig`].

pub mod config;
pub mod context;
pub mod error;
pub mod factory;
pub mod file;
pub mod memory;
pub mod relational;
pub mod retry;
pub mod snapshot;


pub use config::StorageConfig;
pub use context::Context;
pub use error::{ErrorKind, Result, StorageError};
pub use factory::{open_collector, Backend};

use async_trait::async_trait;
use metrix_common::{Metric, MetricValue};

/// Storage contract shared by every metric backend.
///
/// Implementations are shared between HTTP handlers, RPC handlers and
/// background tasks, so they must be `Send + Sync` and safe under concurrent
/// readers and writers.
#[async_trait]
pub trait Collector: Send + Sync {
    /// Returns the metric `name` of kind `kind`.
    ///
    /// # Errors
    ///
    /// [`StorageError::InvalidMetricsType`] for an unknown kind,
    /// [`StorageError::MetricNotFound`] when no such metric exists.
    async fn get_metric(&self, ctx: &Context, kind: &str, name: &str) -> Result<Metric>;

    /// Returns a copy of every stored metric, in no particular order.
    async fn get_all_metrics(&self, ctx: &Context) -> Result<Vec<Metric>>;

    /// Creates the metric if needed, then applies `value`: gauges are
    /// replaced, counters are added to.
    ///
    /// # Errors
    ///
    /// [`StorageError::InvalidMetricsType`] for an unknown kind,
    /// [`StorageError::InvalidValueType`] when `value` is of the other kind,
    /// [`StorageError::MetricNotFound`] for an empty name. A failed update
    /// leaves the store untouched.
    async fn update_metric(
        &self,
        ctx: &Context,
        kind: &str,
        name: &str,
        value: MetricValue,
    ) -> Result<()>;

    /// Applies `metrics` in order, one update each. The first failure stops
    /// the batch and is returned; updates before it stay applied.
    async fn update_metric_list(&self, ctx: &Context, metrics: &[Metric]) -> Result<()> {
        for metric in metrics {
            self.update_metric(ctx, metric.kind().as_str(), &metric.name, metric.value)
                .await?;
        }
        Ok(())
    }

    /// Health check. Only the relational backend does real work here.
    async fn ping(&self, ctx: &Context) -> Result<()>;

    /// Releases background tasks and connections. Safe to call more than
    /// once; waits for in-flight persistence to finish.
    async fn close(&self) -> Result<()>;
}
