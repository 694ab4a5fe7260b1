//! Usage metering side channel.
//!
//! Request handlers hand a finished [`UsageRecord`] to the [`TelemetrySink`] and move on. A single
//! [`TelemetryWorker`] task owns the receiving end of the channel and turns every record into
//!
//! 1. one JSON entry in the caller's daily log stream (`{developer}/{YYYY}/{MM}/{DD}`), and
//! 2. for successful calls, one batch of four metric samples.
//!
//! ```text
//! Handler → TelemetrySink::record (try_send) → Channel → TelemetryWorker
//!                                                             ↓
//!                                              LogStore::ensure_stream + put_entry
//!                                                             ↓
//!                                              MetricsSink::put_metrics (success only)
//! ```
//!
//! Metering is best effort. Backend failures are logged and counted in
//! `tokmeter_telemetry_errors_total`, and a full channel drops the record. Nothing here can fail
//! or delay a client response.

mod file_store;
mod prometheus;
mod worker;

pub use file_store::FileLogStore;
pub use prometheus::{PrometheusMetricsSink, install_prometheus_recorder};
pub use worker::{TelemetrySink, TelemetryWorker};

use async_trait::async_trait;
use chrono::NaiveDate;
use serde::Serialize;
use std::fmt;
use thiserror::Error;

use crate::usage::{MetricSample, UsageRecord};

/// Counter of swallowed metering failures, labelled by `operation`
pub const TELEMETRY_ERRORS_METRIC: &str = "tokmeter_telemetry_errors_total";

#[derive(Debug, Error)]
pub enum TelemetryError {
    /// The log stream is already present; callers treat this as success
    #[error("log stream already exists")]
    StreamAlreadyExists,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("telemetry backend error: {0}")]
    Backend(String),
}

/// Identifies one append-only log stream: one developer, one UTC day.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StreamKey {
    pub developer: String,
    pub date: NaiveDate,
}

impl StreamKey {
    pub fn for_record(record: &UsageRecord) -> Self {
        Self {
            developer: record.developer.to_string(),
            date: record.timestamp.date_naive(),
        }
    }
}

impl fmt::Display for StreamKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.developer, self.date.format("%Y/%m/%d"))
    }
}

/// A single log entry: the record plus its time in epoch milliseconds.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LogEntry {
    pub timestamp: i64,
    pub message: serde_json::Value,
}

impl LogEntry {
    pub fn from_record(record: &UsageRecord) -> Result<Self, TelemetryError> {
        Ok(Self {
            timestamp: record.timestamp.timestamp_millis(),
            message: serde_json::to_value(record)?,
        })
    }
}

/// Destination of per-call log entries.
#[async_trait]
pub trait LogStore: Send + Sync {
    /// Create `stream` if needed. Returns [`TelemetryError::StreamAlreadyExists`] if it was there.
    async fn ensure_stream(&self, stream: &StreamKey) -> Result<(), TelemetryError>;

    /// Append one entry to an existing stream.
    async fn put_entry(&self, stream: &StreamKey, entry: &LogEntry) -> Result<(), TelemetryError>;
}

/// Destination of aggregate metric samples.
#[async_trait]
pub trait MetricsSink: Send + Sync {
    /// Publish one batch of samples under `namespace`.
    async fn put_metrics(&self, namespace: &str, samples: &[MetricSample]) -> Result<(), TelemetryError>;
}
