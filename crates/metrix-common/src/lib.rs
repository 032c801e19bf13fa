//! Metric data model shared by the metrix agent, server and storage layers.
//!
//! A metric is identified by its kind and name. [`types::MetricValue`] is a
//! tagged union, so a gauge can never hold a counter's delta and vice versa.
//! [`types::MetricRecord`] is the JSON shape used on the wire and in snapshot
//! files.

pub mod types;

pub use types::{Metric, MetricKind, MetricRecord, MetricValue, ModelError};
