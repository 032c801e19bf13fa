//! Metrics in a single relational table, keyed by metric name.
//!
//! Works against PostgreSQL in production; SQLite DSNs are accepted too and
//! back the test-suite. Upserts add counter deltas with the database's own
//! arithmetic, so concurrent writers from several processes stay additive.

use crate::context::Context;
use crate::error::{Result, StorageError};
use crate::retry::RetryPolicy;
use crate::Collector;
use async_trait::async_trait;
use metrix_common::{Metric, MetricKind, MetricValue};
use sea_orm::sqlx;
use sea_orm::{
    ConnectOptions, ConnectionTrait, Database, DatabaseConnection, DbErr, QueryResult, RuntimeErr,
    Statement, TransactionTrait, Value,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

const CREATE_TABLE: &str = "CREATE TABLE IF NOT EXISTS collector (
    id    VARCHAR(250) PRIMARY KEY,
    type  TEXT,
    delta BIGINT,
    value DOUBLE PRECISION
)";

// The WHERE clause turns a kind change into a no-op, reported as zero rows.
const UPSERT_GAUGE: &str = "INSERT INTO collector (id, type, delta, value)
    VALUES ($1, $2, NULL, $3)
    ON CONFLICT (id) DO UPDATE SET value = EXCLUDED.value
    WHERE collector.type = EXCLUDED.type";

const UPSERT_COUNTER: &str = "INSERT INTO collector (id, type, delta, value)
    VALUES ($1, $2, $3, NULL)
    ON CONFLICT (id) DO UPDATE SET delta = COALESCE(collector.delta, 0) + EXCLUDED.delta
    WHERE collector.type = EXCLUDED.type";

const SELECT_ONE: &str = "SELECT id, type, delta, value FROM collector WHERE id = $1 AND type = $2";

const SELECT_ALL: &str = "SELECT id, type, delta, value FROM collector";

/// Lower and upper bound for the health probe timeout.
pub const PING_TIMEOUT_RANGE: (Duration, Duration) =
    (Duration::from_secs(1), Duration::from_secs(3));

pub struct RelationalStore {
    db: DatabaseConnection,
    retry: RetryPolicy,
    ping_timeout: Duration,
    closed: AtomicBool,
}

impl RelationalStore {
    /// Connects to `dsn` and creates the `collector` table if it is missing.
    pub async fn connect(
        ctx: &Context,
        dsn: &str,
        retry: RetryPolicy,
        ping_timeout: Duration,
    ) -> Result<Self> {
        let mut options = ConnectOptions::new(dsn.to_owned());
        options.sqlx_logging(false);

        let db = retry
            .run(ctx, "connect", || {
                let options = options.clone();
                async move { Database::connect(options).await.map_err(StorageError::from) }
            })
            .await?;

        let conn = &db;
        retry
            .run(ctx, "create_table", move || async move {
                conn.execute_unprepared(CREATE_TABLE)
                    .await
                    .map(|_| ())
                    .map_err(StorageError::from)
            })
            .await?;

        let (min, max) = PING_TIMEOUT_RANGE;
        tracing::info!(backend = ?db.get_database_backend(), "Relational store connected");
        Ok(Self {
            db,
            retry,
            ping_timeout: ping_timeout.clamp(min, max),
            closed: AtomicBool::new(false),
        })
    }

    fn statement(&self, sql: &str, values: Vec<Value>) -> Statement {
        Statement::from_sql_and_values(self.db.get_database_backend(), sql, values)
    }

    async fn upsert(&self, stmt: Statement, kind: MetricKind, name: &str) -> Result<()> {
        let txn = self.db.begin().await?;
        match txn.execute(stmt).await {
            Ok(res) if res.rows_affected() > 0 => {
                txn.commit().await?;
                Ok(())
            }
            Ok(_) => {
                txn.rollback().await?;
                Err(StorageError::InvalidValueType {
                    kind,
                    name: name.to_string(),
                })
            }
            Err(e) => {
                if let Err(rollback) = txn.rollback().await {
                    tracing::warn!(error = %rollback, "Rollback after failed upsert failed");
                }
                Err(e.into())
            }
        }
    }
}

#[async_trait]
impl Collector for RelationalStore {
    async fn get_metric(&self, ctx: &Context, kind: &str, name: &str) -> Result<Metric> {
        let kind: MetricKind = kind.parse()?;
        let stmt = self.statement(SELECT_ONE, vec![name.into(), kind.as_str().into()]);
        let (db, stmt) = (&self.db, &stmt);
        let row = self
            .retry
            .run(ctx, "get_metric", move || async move {
                db.query_one(stmt.clone()).await.map_err(StorageError::from)
            })
            .await?
            .ok_or_else(|| StorageError::not_found(kind, name))?;
        row_to_metric(&row)
    }

    async fn get_all_metrics(&self, ctx: &Context) -> Result<Vec<Metric>> {
        let stmt = self.statement(SELECT_ALL, Vec::new());
        let (db, stmt) = (&self.db, &stmt);
        let rows = self
            .retry
            .run(ctx, "get_all_metrics", move || async move {
                db.query_all(stmt.clone()).await.map_err(StorageError::from)
            })
            .await?;
        rows.iter().map(row_to_metric).collect()
    }

    async fn update_metric(
        &self,
        ctx: &Context,
        kind: &str,
        name: &str,
        value: MetricValue,
    ) -> Result<()> {
        let kind: MetricKind = kind.parse()?;
        if name.is_empty() {
            return Err(StorageError::not_found(kind, name));
        }
        let stmt = match (kind, value) {
            (MetricKind::Gauge, MetricValue::Gauge(v)) if v.is_finite() => {
                self.statement(UPSERT_GAUGE, vec![name.into(), kind.as_str().into(), v.into()])
            }
            (MetricKind::Counter, MetricValue::Counter(d)) => {
                self.statement(UPSERT_COUNTER, vec![name.into(), kind.as_str().into(), d.into()])
            }
            _ => {
                return Err(StorageError::InvalidValueType {
                    kind,
                    name: name.to_string(),
                })
            }
        };
        let stmt = &stmt;
        self.retry
            .run(ctx, "update_metric", move || {
                self.upsert(stmt.clone(), kind, name)
            })
            .await
    }

    async fn ping(&self, ctx: &Context) -> Result<()> {
        ctx.with_timeout(self.ping_timeout)
            .run(async { self.db.ping().await.map_err(StorageError::from) })
            .await
    }

    async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.db.clone().close().await.map_err(StorageError::Database)?;
        tracing::info!("Relational store closed");
        Ok(())
    }
}

/// Rebuilds a metric from a `collector` row. The column that is populated
/// must be the one the row's type calls for.
fn row_to_metric(row: &QueryResult) -> Result<Metric> {
    let id: String = row.try_get("", "id")?;
    let kind: Option<String> = row.try_get("", "type")?;
    let delta: Option<i64> = row.try_get("", "delta")?;
    let value: Option<f64> = row.try_get("", "value")?;

    let kind: MetricKind = kind.unwrap_or_default().parse()?;
    let value = match (kind, delta, value) {
        (MetricKind::Gauge, _, Some(v)) => MetricValue::Gauge(v),
        (MetricKind::Counter, Some(d), _) => MetricValue::Counter(d),
        (_, None, None) => return Err(StorageError::InvalidValueType { kind, name: id }),
        _ => return Err(StorageError::InvalidMetricsType(kind.to_string())),
    };
    Ok(Metric::new(id, value))
}

/// Whether a database error is worth retrying: connection trouble,
/// serialization failures, deadlocks, administrative shutdown, exhausted
/// resources and SQLite lock contention.
pub(crate) fn is_transient(err: &DbErr) -> bool {
    match err {
        DbErr::ConnectionAcquire(_) => true,
        DbErr::Conn(RuntimeErr::SqlxError(e))
        | DbErr::Exec(RuntimeErr::SqlxError(e))
        | DbErr::Query(RuntimeErr::SqlxError(e)) => match e {
            sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut => true,
            sqlx::Error::Database(db) => db.code().is_some_and(|code| is_transient_code(&code)),
            _ => false,
        },
        _ => false,
    }
}

/// Classifies a PostgreSQL SQLSTATE or a SQLite result code.
pub fn is_transient_code(code: &str) -> bool {
    if code.len() == 5 {
        return code.starts_with("08")
            || code.starts_with("53")
            || matches!(code, "40001" | "40P01" | "57P01");
    }
    // SQLITE_BUSY, SQLITE_LOCKED and their extended codes
    matches!(code, "5" | "6" | "261" | "262" | "517")
}
