use crate::context::Context;
use crate::error::{Result, StorageError};
use crate::Collector;
use async_trait::async_trait;
use metrix_common::{Metric, MetricKind, MetricValue};
use std::collections::HashMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

type MetricMap = HashMap<MetricKind, HashMap<String, MetricValue>>;

/// In-process metric store: kind → name → value behind one reader/writer
/// lock.
///
/// An update holds the write lock for its whole lookup-or-create and apply
/// step, so concurrent increments of one counter never lose updates.
#[derive(Debug, Default)]
pub struct MemoryStore {
    metrics: RwLock<MetricMap>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a store by replaying `metrics` as updates on an empty store.
    /// Counters therefore start from exactly their recorded sum.
    pub fn from_metrics(metrics: impl IntoIterator<Item = Metric>) -> Result<Self> {
        let store = Self::new();
        for metric in metrics {
            store.update(metric.kind().as_str(), &metric.name, metric.value)?;
        }
        Ok(store)
    }

    /// Lock for reading, recovering from a poisoned lock.
    fn read(&self) -> RwLockReadGuard<'_, MetricMap> {
        self.metrics
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, MetricMap> {
        self.metrics
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn len(&self) -> usize {
        self.read().values().map(HashMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, kind: &str, name: &str) -> Result<Metric> {
        let kind: MetricKind = kind.parse()?;
        let metrics = self.read();
        metrics
            .get(&kind)
            .and_then(|by_name| by_name.get(name))
            .map(|value| Metric::new(name, *value))
            .ok_or_else(|| StorageError::not_found(kind, name))
    }

    /// Copies every metric out from under the read lock.
    pub fn snapshot(&self) -> Vec<Metric> {
        let metrics = self.read();
        metrics
            .values()
            .flat_map(|by_name| {
                by_name
                    .iter()
                    .map(|(name, value)| Metric::new(name.clone(), *value))
            })
            .collect()
    }

    /// Checks an update against the model without touching any state.
    ///
    /// Gauges must be finite: NaN and infinities have no snapshot form.
    pub fn validate(kind: &str, name: &str, value: MetricValue) -> Result<MetricKind> {
        let kind: MetricKind = kind.parse()?;
        if name.is_empty() {
            return Err(StorageError::not_found(kind, name));
        }
        if value.kind() != kind || !value.is_finite() {
            return Err(StorageError::InvalidValueType {
                kind,
                name: name.to_string(),
            });
        }
        Ok(kind)
    }

    pub fn update(&self, kind: &str, name: &str, value: MetricValue) -> Result<()> {
        let kind = Self::validate(kind, name, value)?;

        let mut metrics = self.write();
        let current = metrics
            .entry(kind)
            .or_default()
            .entry(name.to_string())
            .or_insert_with(|| MetricValue::zero(kind));
        // kinds were checked above, so this cannot fail
        current.apply(value);
        Ok(())
    }

    /// Independent copy of the current state.
    pub(crate) fn fork(&self) -> MemoryStore {
        MemoryStore {
            metrics: RwLock::new(self.read().clone()),
        }
    }

    /// Replaces the whole state with `other`'s.
    pub(crate) fn replace(&self, other: MemoryStore) {
        let next = other
            .metrics
            .into_inner()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *self.write() = next;
    }
}

#[async_trait]
impl Collector for MemoryStore {
    async fn get_metric(&self, ctx: &Context, kind: &str, name: &str) -> Result<Metric> {
        ctx.check()?;
        self.get(kind, name)
    }

    async fn get_all_metrics(&self, ctx: &Context) -> Result<Vec<Metric>> {
        ctx.check()?;
        Ok(self.snapshot())
    }

    async fn update_metric(
        &self,
        ctx: &Context,
        kind: &str,
        name: &str,
        value: MetricValue,
    ) -> Result<()> {
        ctx.check()?;
        self.update(kind, name, value)
    }

    async fn ping(&self, _ctx: &Context) -> Result<()> {
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}
