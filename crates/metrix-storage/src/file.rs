use crate::context::Context;
use crate::error::{Result, StorageError};
use crate::memory::MemoryStore;
use crate::{snapshot, Collector};
use async_trait::async_trait;
use metrix_common::{Metric, MetricValue};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard, RwLock as AsyncRwLock};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

/// Settings for [`FileStore::open`].
#[derive(Debug, Clone)]
pub struct FileStoreOptions {
    pub path: PathBuf,
    /// Zero writes a snapshot on every update before it returns; anything
    /// else writes one per interval from a background task.
    pub store_interval: Duration,
    /// Load the existing snapshot, if any, before serving.
    pub restore: bool,
}

/// A [`MemoryStore`] that is snapshotted to a JSON file.
///
/// Lock order is `write_lock`, then `state_lock`, then the memory store's own
/// lock. `write_lock` is held from snapshot capture until the file is in
/// place, so snapshot writes never overlap.
///
/// In periodic mode updates hold `state_lock` shared and capturing a snapshot
/// holds it exclusively, so a snapshot never sees half of an update batch and
/// updates never wait on the disk. In synchronous mode an update takes
/// `write_lock`, applies itself to a copy of the state, writes that copy and
/// only then swaps it in: a failed or cancelled write leaves memory as it
/// was.
pub struct FileStore {
    shared: Arc<Shared>,
    synchronous: bool,
    shutdown: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

struct Shared {
    store: MemoryStore,
    path: PathBuf,
    state_lock: AsyncRwLock<()>,
    write_lock: Arc<AsyncMutex<()>>,
}

impl FileStore {
    /// Opens the store, restoring the snapshot first if asked to.
    ///
    /// A missing snapshot file is an empty store; an unreadable or malformed
    /// one fails construction. In periodic mode the snapshot task is started
    /// and this returns straight away; the task stops when `ctx` is cancelled
    /// or on [`Collector::close`], writing one last snapshot on the way out.
    pub async fn open(ctx: &Context, options: FileStoreOptions) -> Result<Self> {
        let store = if options.restore {
            let path = options.path.clone();
            let load = tokio::task::spawn_blocking(move || snapshot::load(&path));
            let metrics = ctx.run(join(load)).await?;
            let count = metrics.len();
            let store =
                MemoryStore::from_metrics(metrics).map_err(|e| StorageError::Restore {
                    path: options.path.clone(),
                    source: Box::new(e),
                })?;
            tracing::info!(path = %options.path.display(), count, "Restored metrics snapshot");
            store
        } else {
            MemoryStore::new()
        };
        let shared = Arc::new(Shared {
            store,
            path: options.path,
            state_lock: AsyncRwLock::new(()),
            write_lock: Arc::new(AsyncMutex::new(())),
        });
        let shutdown = ctx.token().child_token();
        let synchronous = options.store_interval.is_zero();

        let task = if synchronous {
            None
        } else {
            Some(tokio::spawn(run_periodic(
                shared.clone(),
                options.store_interval,
                shutdown.clone(),
            )))
        };

        tracing::info!(
            path = %shared.path.display(),
            synchronous,
            interval_secs = options.store_interval.as_secs(),
            "File store opened"
        );

        Ok(Self {
            shared,
            synchronous,
            shutdown,
            task: Mutex::new(task),
        })
    }

    pub fn path(&self) -> &Path {
        &self.shared.path
    }

    pub fn is_synchronous(&self) -> bool {
        self.synchronous
    }

    /// Writes a snapshot of the current state now.
    pub async fn save_now(&self, ctx: &Context) -> Result<()> {
        self.shared.persist(ctx).await
    }
}

impl Shared {
    async fn lock_writes(&self, ctx: &Context) -> Result<OwnedMutexGuard<()>> {
        let lock = self.write_lock.clone();
        ctx.run(async move { Ok::<_, StorageError>(lock.lock_owned().await) })
            .await
    }

    /// Writes a snapshot of the current state.
    async fn persist(self: &Arc<Self>, ctx: &Context) -> Result<()> {
        let guard = self.lock_writes(ctx).await?;
        let metrics = {
            let _state = self.state_lock.write().await;
            self.store.snapshot()
        };
        self.write(ctx, guard, metrics, None).await
    }

    /// Applies `metrics` in order to a copy of the state, stopping at the
    /// first failure, and commits whatever applied once it is on disk.
    async fn apply_durably(self: &Arc<Self>, ctx: &Context, metrics: &[Metric]) -> Result<()> {
        let guard = self.lock_writes(ctx).await?;
        let staged = self.store.fork();
        let mut applied = 0;
        let mut outcome = Ok(());
        for metric in metrics {
            if let Err(e) = staged.update(metric.kind().as_str(), &metric.name, metric.value) {
                outcome = Err(e);
                break;
            }
            applied += 1;
        }
        if applied == 0 {
            return outcome;
        }
        let snapshot = staged.snapshot();
        self.write(ctx, guard, snapshot, Some(staged)).await?;
        outcome
    }

    /// Writes `metrics` on the blocking pool, then swaps `commit` into memory.
    ///
    /// The context is checked again right before the file is replaced; past
    /// that point the write and the commit both happen even if the caller
    /// has gone away. `guard` travels with the write so the next one starts
    /// only after it.
    async fn write(
        self: &Arc<Self>,
        ctx: &Context,
        guard: OwnedMutexGuard<()>,
        metrics: Vec<Metric>,
        commit: Option<MemoryStore>,
    ) -> Result<()> {
        let shared = Arc::clone(self);
        let ctx = ctx.clone();
        let count = metrics.len();
        let write = tokio::task::spawn_blocking(move || -> Result<()> {
            let _guard = guard;
            snapshot::save_checked(&shared.path, &metrics, || ctx.check())?;
            if let Some(staged) = commit {
                shared.store.replace(staged);
            }
            Ok(())
        });
        join(write).await?;
        tracing::debug!(path = %self.path.display(), count, "Snapshot written");
        Ok(())
    }
}

async fn join<T>(handle: JoinHandle<Result<T>>) -> Result<T> {
    match handle.await {
        Ok(res) => res,
        Err(e) => Err(StorageError::Task(e)),
    }
}

async fn run_periodic(shared: Arc<Shared>, every: Duration, shutdown: CancellationToken) {
    let mut tick = tokio::time::interval(every);
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // the first tick fires immediately
    tick.tick().await;

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = tick.tick() => {
                if let Err(e) = shared.persist(&Context::background()).await {
                    tracing::error!(
                        path = %shared.path.display(),
                        error = %e,
                        "Periodic snapshot failed"
                    );
                }
            }
        }
    }

    match shared.persist(&Context::background()).await {
        Ok(()) => tracing::info!(path = %shared.path.display(), "Final snapshot written"),
        Err(e) => {
            tracing::error!(path = %shared.path.display(), error = %e, "Final snapshot failed")
        }
    }
}

#[async_trait]
impl Collector for FileStore {
    async fn get_metric(&self, ctx: &Context, kind: &str, name: &str) -> Result<Metric> {
        self.shared.store.get_metric(ctx, kind, name).await
    }

    async fn get_all_metrics(&self, ctx: &Context) -> Result<Vec<Metric>> {
        self.shared.store.get_all_metrics(ctx).await
    }

    async fn update_metric(
        &self,
        ctx: &Context,
        kind: &str,
        name: &str,
        value: MetricValue,
    ) -> Result<()> {
        ctx.check()?;
        if self.synchronous {
            MemoryStore::validate(kind, name, value)?;
            return self
                .shared
                .apply_durably(ctx, &[Metric::new(name, value)])
                .await;
        }
        let _state = self.shared.state_lock.read().await;
        self.shared.store.update(kind, name, value)
    }

    async fn update_metric_list(&self, ctx: &Context, metrics: &[Metric]) -> Result<()> {
        ctx.check()?;
        if self.synchronous {
            return self.shared.apply_durably(ctx, metrics).await;
        }
        let _state = self.shared.state_lock.read().await;
        metrics.iter().try_for_each(|metric| {
            self.shared
                .store
                .update(metric.kind().as_str(), &metric.name, metric.value)
        })
    }

    async fn ping(&self, ctx: &Context) -> Result<()> {
        self.shared.store.ping(ctx).await
    }

    async fn close(&self) -> Result<()> {
        self.shutdown.cancel();
        let task = self
            .task
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(task) = task {
            task.await?;
        }
        // a write abandoned by a dropped caller still holds the lock
        let _drained = self.shared.write_lock.lock().await;
        tracing::info!(path = %self.shared.path.display(), "File store closed");
        Ok(())
    }
}

impl Drop for FileStore {
    fn drop(&mut self) {
        // lets a detached periodic task drain and exit
        self.shutdown.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use tempfile::TempDir;

    fn options(dir: &TempDir, interval: Duration, restore: bool) -> FileStoreOptions {
        FileStoreOptions {
            path: dir.path().join("metrics.json"),
            store_interval: interval,
            restore,
        }
    }

    #[tokio::test]
    async fn synchronous_mode_writes_before_returning() {
        let dir = TempDir::new().unwrap();
        let ctx = Context::background();
        let store = FileStore::open(&ctx, options(&dir, Duration::ZERO, false))
            .await
            .unwrap();
        assert!(store.is_synchronous());

        store
            .update_metric(&ctx, "counter", "PollCount", MetricValue::Counter(5))
            .await
            .unwrap();
        let on_disk = snapshot::load(store.path()).unwrap();
        assert_eq!(on_disk, vec![Metric::counter("PollCount", 5)]);
    }

    #[tokio::test]
    async fn rejected_update_is_not_persisted() {
        let dir = TempDir::new().unwrap();
        let ctx = Context::background();
        let store = FileStore::open(&ctx, options(&dir, Duration::ZERO, false))
            .await
            .unwrap();
        let err = store
            .update_metric(&ctx, "gauge", "Alloc", MetricValue::Counter(1))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidValueType);
        assert!(!store.path().exists());
    }

    #[tokio::test]
    async fn batch_stops_at_first_error_and_keeps_earlier_items() {
        let dir = TempDir::new().unwrap();
        let ctx = Context::background();
        let store = FileStore::open(&ctx, options(&dir, Duration::ZERO, false))
            .await
            .unwrap();
        let batch = vec![
            Metric::gauge("Alloc", 1.0),
            Metric::counter("", 1),
            Metric::gauge("Frees", 2.0),
        ];
        let err = store.update_metric_list(&ctx, &batch).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::MetricNotFound);

        let on_disk = snapshot::load(store.path()).unwrap();
        assert_eq!(on_disk, vec![Metric::gauge("Alloc", 1.0)]);
    }

    #[tokio::test]
    async fn periodic_mode_writes_final_snapshot_on_close() {
        let dir = TempDir::new().unwrap();
        let ctx = Context::background();
        let store = FileStore::open(&ctx, options(&dir, Duration::from_secs(3600), false))
            .await
            .unwrap();
        store
            .update_metric(&ctx, "gauge", "Alloc", MetricValue::Gauge(3.5))
            .await
            .unwrap();
        assert!(!store.path().exists());

        store.close().await.unwrap();
        assert_eq!(
            snapshot::load(store.path()).unwrap(),
            vec![Metric::gauge("Alloc", 3.5)]
        );
        // closing twice is fine
        store.close().await.unwrap();
    }

    #[tokio::test]
    async fn cancelling_parent_context_drains_the_task() {
        let dir = TempDir::new().unwrap();
        let root = Context::background();
        let store = FileStore::open(&root, options(&dir, Duration::from_secs(3600), false))
            .await
            .unwrap();
        store
            .update_metric(&root.with_cancel(), "counter", "c", MetricValue::Counter(2))
            .await
            .unwrap();

        root.cancel();
        store.close().await.unwrap();
        assert_eq!(snapshot::load(store.path()).unwrap(), vec![Metric::counter("c", 2)]);
    }

    #[tokio::test]
    async fn periodic_task_writes_on_each_interval() {
        let dir = TempDir::new().unwrap();
        let ctx = Context::background();
        let store = FileStore::open(&ctx, options(&dir, Duration::from_millis(50), false))
            .await
            .unwrap();
        store
            .update_metric(&ctx, "counter", "c", MetricValue::Counter(1))
            .await
            .unwrap();

        let path = store.path().to_path_buf();
        let mut written = false;
        for _ in 0..250 {
            tokio::time::sleep(Duration::from_millis(20)).await;
            if path.exists() {
                written = true;
                break;
            }
        }
        assert!(written, "snapshot should appear after one interval");
        store.close().await.unwrap();
    }

    #[tokio::test]
    async fn restore_replays_counters_once() {
        let dir = TempDir::new().unwrap();
        let ctx = Context::background();
        let path = dir.path().join("metrics.json");
        snapshot::save(&path, &[Metric::counter("PollCount", 42), Metric::gauge("Alloc", 9.0)])
            .unwrap();

        let store = FileStore::open(&ctx, options(&dir, Duration::ZERO, true))
            .await
            .unwrap();
        store
            .update_metric(&ctx, "counter", "PollCount", MetricValue::Counter(1))
            .await
            .unwrap();
        assert_eq!(
            store.get_metric(&ctx, "counter", "PollCount").await.unwrap(),
            Metric::counter("PollCount", 43)
        );
    }

    #[tokio::test]
    async fn restore_disabled_ignores_existing_file() {
        let dir = TempDir::new().unwrap();
        let ctx = Context::background();
        snapshot::save(&dir.path().join("metrics.json"), &[Metric::gauge("Alloc", 9.0)]).unwrap();

        let store = FileStore::open(&ctx, options(&dir, Duration::ZERO, false))
            .await
            .unwrap();
        assert!(store.get_all_metrics(&ctx).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn malformed_snapshot_fails_open() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("metrics.json"), "{not json").unwrap();
        let res =
            FileStore::open(&Context::background(), options(&dir, Duration::ZERO, true)).await;
        assert_eq!(res.err().map(|e| e.kind()), Some(ErrorKind::FatalStorage));
    }

    #[tokio::test]
    async fn non_finite_gauge_never_reaches_the_snapshot() {
        let dir = TempDir::new().unwrap();
        let ctx = Context::background();
        let store = FileStore::open(&ctx, options(&dir, Duration::ZERO, false))
            .await
            .unwrap();
        store
            .update_metric(&ctx, "gauge", "g", MetricValue::Gauge(1.0))
            .await
            .unwrap();
        for v in [f64::NAN, f64::INFINITY, f64::NEG_INFINITY] {
            let err = store
                .update_metric(&ctx, "gauge", "g", MetricValue::Gauge(v))
                .await
                .unwrap_err();
            assert_eq!(err.kind(), ErrorKind::InvalidValueType);
        }
        store.close().await.unwrap();

        let reopened = FileStore::open(&ctx, options(&dir, Duration::ZERO, true))
            .await
            .unwrap();
        assert_eq!(
            reopened.get_all_metrics(&ctx).await.unwrap(),
            vec![Metric::gauge("g", 1.0)]
        );
    }

    #[tokio::test]
    async fn failed_write_leaves_memory_unchanged() {
        let dir = TempDir::new().unwrap();
        let ctx = Context::background();
        let sub = dir.path().join("sub");
        let store = FileStore::open(
            &ctx,
            FileStoreOptions {
                path: sub.join("metrics.json"),
                store_interval: Duration::ZERO,
                restore: false,
            },
        )
        .await
        .unwrap();
        store
            .update_metric(&ctx, "counter", "c", MetricValue::Counter(5))
            .await
            .unwrap();

        // a regular file where the directory was makes every write fail
        std::fs::remove_dir_all(&sub).unwrap();
        std::fs::write(&sub, "").unwrap();
        for _ in 0..2 {
            let err = store
                .update_metric(&ctx, "counter", "c", MetricValue::Counter(5))
                .await
                .unwrap_err();
            assert_eq!(err.kind(), ErrorKind::FatalStorage);
        }
        let err = store
            .update_metric_list(&ctx, &[Metric::gauge("Alloc", 1.0)])
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::FatalStorage);

        assert_eq!(
            store.get_all_metrics(&ctx).await.unwrap(),
            vec![Metric::counter("c", 5)]
        );
    }

    #[tokio::test]
    async fn cancelled_context_aborts_synchronous_writes() {
        let dir = TempDir::new().unwrap();
        let store = FileStore::open(&Context::background(), options(&dir, Duration::ZERO, false))
            .await
            .unwrap();
        let ctx = Context::background();
        ctx.cancel();

        let err = store
            .update_metric(&ctx, "counter", "c", MetricValue::Counter(1))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Cancelled);
        let err = store.save_now(&ctx).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Cancelled);

        assert!(store.shared.store.is_empty());
        assert!(!store.path().exists());
    }

    #[tokio::test]
    async fn expired_deadline_aborts_snapshot() {
        let dir = TempDir::new().unwrap();
        let store = FileStore::open(
            &Context::background(),
            options(&dir, Duration::from_secs(3600), false),
        )
        .await
        .unwrap();
        let ctx = Context::background().with_timeout(Duration::ZERO);
        let err = store.save_now(&ctx).await.unwrap_err();
        assert!(matches!(err, StorageError::DeadlineExceeded));
        assert!(!store.path().exists());
        store.close().await.unwrap();
    }

    #[tokio::test]
    async fn close_waits_for_an_inflight_write() {
        let dir = TempDir::new().unwrap();
        let store = FileStore::open(&Context::background(), options(&dir, Duration::ZERO, false))
            .await
            .unwrap();
        let guard = store.shared.write_lock.clone().lock_owned().await;
        let released = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let flag = released.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            flag.store(true, std::sync::atomic::Ordering::SeqCst);
            drop(guard);
        });

        store.close().await.unwrap();
        assert!(released.load(std::sync::atomic::Ordering::SeqCst));
    }

    #[tokio::test]
    async fn snapshot_with_empty_id_fails_open() {
        let dir = TempDir::new().unwrap();
        std::fs::write(
            dir.path().join("metrics.json"),
            r#"[{"id":"","type":"counter","delta":3}]"#,
        )
        .unwrap();
        let res =
            FileStore::open(&Context::background(), options(&dir, Duration::ZERO, true)).await;
        assert_eq!(res.err().map(|e| e.kind()), Some(ErrorKind::FatalStorage));
    }
}
