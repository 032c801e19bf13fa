use metrix_common::{MetricKind, ModelError};
use std::fmt;

/// Errors returned by every [`Collector`](crate::Collector) backend.
///
/// Transport layers map [`StorageError::kind`] onto their own status codes;
/// the variants themselves keep the detail needed for logging.
///
/// # Examples
///
/// ```rust
/// use metrix_storage::error::{ErrorKind, StorageError};
///
/// let err = StorageError::MetricNotFound {
///     kind: "gauge".to_string(),
///     name: "Alloc".to_string(),
/// };
/// assert_eq!(err.kind(), ErrorKind::MetricNotFound);
/// assert!(err.to_string().contains("Alloc"));
/// ```
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// The type string is not a known metric kind, or a stored row's kind
    /// differs from the one requested.
    #[error("Storage: invalid metric type '{0}'")]
    InvalidMetricsType(String),

    /// The value's shape does not match the metric's kind, or a stored row
    /// carries no value for its kind.
    #[error("Storage: invalid value for {kind} metric '{name}'")]
    InvalidValueType { kind: MetricKind, name: String },

    /// No metric with that name exists for the kind, or the name is empty.
    #[error("Storage: metric {kind}/{name} not found")]
    MetricNotFound { kind: String, name: String },

    /// A database failure worth retrying, surfaced once the retry budget is
    /// spent.
    #[error("Storage: transient database error: {0}")]
    Transient(#[source] sea_orm::DbErr),

    /// A database failure that retrying will not fix.
    #[error("Storage: database error: {0}")]
    Database(#[source] sea_orm::DbErr),

    /// Disk I/O failure while reading or writing a snapshot.
    #[error("Storage: snapshot I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The snapshot file is not valid JSON in the expected shape.
    #[error("Storage: malformed snapshot: {0}")]
    Snapshot(#[from] serde_json::Error),

    /// A snapshot record could not be turned into a metric.
    #[error("Storage: malformed snapshot record: {0}")]
    Record(#[source] ModelError),

    /// A snapshot decoded but holds a metric the store would not accept.
    #[error("Storage: snapshot {path} cannot be restored: {source}")]
    Restore {
        path: std::path::PathBuf,
        #[source]
        source: Box<StorageError>,
    },

    /// The background task that owned a write panicked or was aborted.
    #[error("Storage: background task failed: {0}")]
    Task(#[from] tokio::task::JoinError),

    #[error("Storage: operation cancelled")]
    Cancelled,

    #[error("Storage: deadline exceeded")]
    DeadlineExceeded,
}

/// Coarse classification of a [`StorageError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    InvalidMetricsType,
    InvalidValueType,
    MetricNotFound,
    TransientStorage,
    FatalStorage,
    Cancelled,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::InvalidMetricsType => "invalid metrics type",
            ErrorKind::InvalidValueType => "invalid value type",
            ErrorKind::MetricNotFound => "metric not found",
            ErrorKind::TransientStorage => "transient storage error",
            ErrorKind::FatalStorage => "fatal storage error",
            ErrorKind::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

impl StorageError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            StorageError::InvalidMetricsType(_) => ErrorKind::InvalidMetricsType,
            StorageError::InvalidValueType { .. } => ErrorKind::InvalidValueType,
            StorageError::MetricNotFound { .. } => ErrorKind::MetricNotFound,
            StorageError::Transient(_) => ErrorKind::TransientStorage,
            StorageError::Database(_)
            | StorageError::Io(_)
            | StorageError::Snapshot(_)
            | StorageError::Record(_)
            | StorageError::Restore { .. }
            | StorageError::Task(_) => ErrorKind::FatalStorage,
            StorageError::Cancelled | StorageError::DeadlineExceeded => ErrorKind::Cancelled,
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, StorageError::Transient(_))
    }

    pub(crate) fn not_found(kind: impl fmt::Display, name: &str) -> Self {
        StorageError::MetricNotFound {
            kind: kind.to_string(),
            name: name.to_string(),
        }
    }
}

impl From<ModelError> for StorageError {
    fn from(err: ModelError) -> Self {
        match err {
            ModelError::UnknownKind(kind) => StorageError::InvalidMetricsType(kind),
            other => StorageError::Record(other),
        }
    }
}

impl From<sea_orm::DbErr> for StorageError {
    fn from(err: sea_orm::DbErr) -> Self {
        if crate::relational::is_transient(&err) {
            StorageError::Transient(err)
        } else {
            StorageError::Database(err)
        }
    }
}

/// Convenience `Result` alias for storage operations.
pub type Result<T> = std::result::Result<T, StorageError>;
