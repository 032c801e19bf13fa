use serde::{Deserialize, Serialize};
use std::fmt;

/// Errors raised while converting wire or snapshot data into the model.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ModelError {
    /// The type string is neither `gauge` nor `counter`.
    #[error("unknown metric type: {0}")]
    UnknownKind(String),

    /// The record does not carry exactly the one value field its type requires.
    #[error("metric '{id}' of type {kind} must carry exactly one '{field}' field")]
    MalformedRecord {
        id: String,
        kind: MetricKind,
        field: &'static str,
    },

    #[error("metric of type {kind} has an empty id")]
    EmptyId { kind: MetricKind },
}

/// Kind of a metric. Fixed when the metric is first created.
///
/// # Examples
///
/// ```
/// use metrix_common::types::MetricKind;
///
/// let kind: MetricKind = "counter".parse().unwrap();
/// assert_eq!(kind, MetricKind::Counter);
/// assert_eq!(kind.to_string(), "counter");
/// assert!("histogram".parse::<MetricKind>().is_err());
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MetricKind {
    Gauge,
    Counter,
}

impl MetricKind {
    pub const ALL: [MetricKind; 2] = [MetricKind::Gauge, MetricKind::Counter];

    pub fn as_str(&self) -> &'static str {
        match self {
            MetricKind::Gauge => "gauge",
            MetricKind::Counter => "counter",
        }
    }
}

impl fmt::Display for MetricKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for MetricKind {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "gauge" => Ok(MetricKind::Gauge),
            "counter" => Ok(MetricKind::Counter),
            _ => Err(ModelError::UnknownKind(s.to_string())),
        }
    }
}

/// Current value of a metric, or an update to be applied to one.
///
/// Gauges are absolute and last-write-wins; counters are cumulative and
/// every update is added to the running sum.
///
/// # Examples
///
/// ```
/// use metrix_common::types::MetricValue;
///
/// let mut hits = MetricValue::Counter(5);
/// assert!(hits.apply(MetricValue::Counter(5)));
/// assert_eq!(hits, MetricValue::Counter(10));
///
/// // a gauge-shaped update never lands on a counter
/// assert!(!hits.apply(MetricValue::Gauge(1.5)));
/// assert_eq!(hits, MetricValue::Counter(10));
/// ```
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum MetricValue {
    Gauge(f64),
    Counter(i64),
}

impl MetricValue {
    /// Value a metric starts from before its first update is applied.
    pub fn zero(kind: MetricKind) -> Self {
        match kind {
            MetricKind::Gauge => MetricValue::Gauge(0.0),
            MetricKind::Counter => MetricValue::Counter(0),
        }
    }

    pub fn kind(&self) -> MetricKind {
        match self {
            MetricValue::Gauge(_) => MetricKind::Gauge,
            MetricValue::Counter(_) => MetricKind::Counter,
        }
    }

    /// Applies `update` in place. Returns `false`, leaving `self` untouched,
    /// when the update is of the other kind.
    ///
    /// Counter sums wrap on overflow, matching 64-bit integer arithmetic.
    pub fn apply(&mut self, update: MetricValue) -> bool {
        match (self, update) {
            (MetricValue::Gauge(current), MetricValue::Gauge(next)) => {
                *current = next;
                true
            }
            (MetricValue::Counter(sum), MetricValue::Counter(delta)) => {
                *sum = sum.wrapping_add(delta);
                true
            }
            _ => false,
        }
    }

    /// False for NaN and infinite gauges, which have no JSON form.
    pub fn is_finite(&self) -> bool {
        match self {
            MetricValue::Gauge(v) => v.is_finite(),
            MetricValue::Counter(_) => true,
        }
    }

    pub fn as_gauge(&self) -> Option<f64> {
        match self {
            MetricValue::Gauge(v) => Some(*v),
            MetricValue::Counter(_) => None,
        }
    }

    pub fn as_counter(&self) -> Option<i64> {
        match self {
            MetricValue::Counter(d) => Some(*d),
            MetricValue::Gauge(_) => None,
        }
    }
}

impl fmt::Display for MetricValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MetricValue::Gauge(v) => write!(f, "{v}"),
            MetricValue::Counter(d) => write!(f, "{d}"),
        }
    }
}

/// One named measurement. Identity is `(kind, name)`; the kind is carried by
/// the value variant.
#[derive(Debug, Clone, PartialEq)]
pub struct Metric {
    pub name: String,
    pub value: MetricValue,
}

impl Metric {
    pub fn new(name: impl Into<String>, value: MetricValue) -> Self {
        Self {
            name: name.into(),
            value,
        }
    }

    pub fn gauge(name: impl Into<String>, value: f64) -> Self {
        Self::new(name, MetricValue::Gauge(value))
    }

    pub fn counter(name: impl Into<String>, delta: i64) -> Self {
        Self::new(name, MetricValue::Counter(delta))
    }

    pub fn kind(&self) -> MetricKind {
        self.value.kind()
    }
}

/// Serialized form of a [`Metric`], used in snapshot files and JSON bodies.
///
/// Exactly one of `delta` (counter) or `value` (gauge) is present. The type
/// is kept as a raw string so unknown types survive decoding and are rejected
/// by the storage layer with a typed error.
///
/// # Examples
///
/// ```
/// use metrix_common::types::{Metric, MetricRecord};
///
/// let record = MetricRecord::from(&Metric::counter("PollCount", 42));
/// let json = serde_json::to_string(&record).unwrap();
/// assert_eq!(json, r#"{"id":"PollCount","type":"counter","delta":42}"#);
///
/// let back = Metric::try_from(record).unwrap();
/// assert_eq!(back, Metric::counter("PollCount", 42));
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricRecord {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delta: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<f64>,
}

impl From<&Metric> for MetricRecord {
    fn from(metric: &Metric) -> Self {
        let (delta, value) = match metric.value {
            MetricValue::Gauge(v) => (None, Some(v)),
            MetricValue::Counter(d) => (Some(d), None),
        };
        Self {
            id: metric.name.clone(),
            kind: metric.kind().to_string(),
            delta,
            value,
        }
    }
}

impl TryFrom<MetricRecord> for Metric {
    type Error = ModelError;

    fn try_from(record: MetricRecord) -> Result<Self, Self::Error> {
        let kind: MetricKind = record.kind.parse()?;
        if record.id.is_empty() {
            return Err(ModelError::EmptyId { kind });
        }
        let value = match (kind, record.delta, record.value) {
            (MetricKind::Gauge, None, Some(v)) => MetricValue::Gauge(v),
            (MetricKind::Counter, Some(d), None) => MetricValue::Counter(d),
            (MetricKind::Gauge, _, _) => {
                return Err(ModelError::MalformedRecord {
                    id: record.id,
                    kind,
                    field: "value",
                })
            }
            (MetricKind::Counter, _, _) => {
                return Err(ModelError::MalformedRecord {
                    id: record.id,
                    kind,
                    field: "delta",
                })
            }
        };
        Ok(Metric {
            name: record.id,
            value,
        })
    }
}
