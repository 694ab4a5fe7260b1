use futures::FutureExt;
use metrics::counter;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{LogEntry, LogStore, MetricsSink, StreamKey, TELEMETRY_ERRORS_METRIC, TelemetryError};
use crate::config::TelemetryConfig;
use crate::usage::UsageRecord;

/// Handle used by request handlers to submit usage records.
///
/// Cloning is cheap; all clones feed the same worker.
#[derive(Debug, Clone)]
pub struct TelemetrySink {
    sender: mpsc::Sender<UsageRecord>,
}

impl TelemetrySink {
    /// Queue a record for the background worker without waiting.
    ///
    /// If the queue is full or the worker has stopped the record is dropped.
    pub fn record(&self, record: UsageRecord) {
        match self.sender.try_send(record) {
            Ok(()) => {}
            Err(TrySendError::Full(record)) => {
                warn!(developer = %record.developer, "Telemetry channel full, dropping usage record");
                counter!(TELEMETRY_ERRORS_METRIC, "operation" => "enqueue").increment(1);
            }
            Err(TrySendError::Closed(record)) => {
                warn!(developer = %record.developer, "Telemetry worker stopped, dropping usage record");
                counter!(TELEMETRY_ERRORS_METRIC, "operation" => "enqueue").increment(1);
            }
        }
    }
}

/// Background task writing usage records to the log store and metrics sink.
pub struct TelemetryWorker {
    log_store: Arc<dyn LogStore>,
    metrics_sink: Arc<dyn MetricsSink>,
    project: String,
    namespace: String,
    receiver: mpsc::Receiver<UsageRecord>,
}

impl TelemetryWorker {
    /// Creates a worker and the sink that feeds it.
    pub fn new(
        config: &TelemetryConfig,
        log_store: Arc<dyn LogStore>,
        metrics_sink: Arc<dyn MetricsSink>,
    ) -> (Self, TelemetrySink) {
        let (sender, receiver) = mpsc::channel(config.channel_capacity);

        let worker = Self {
            log_store,
            metrics_sink,
            project: config.project.clone(),
            namespace: config.metrics_namespace.clone(),
            receiver,
        };

        (worker, TelemetrySink { sender })
    }

    /// Process records until cancelled or until every sink is dropped.
    ///
    /// On cancellation the channel is closed and whatever is still queued is written before
    /// returning.
    pub async fn run(mut self, shutdown_token: CancellationToken) {
        info!(project = %self.project, namespace = %self.namespace, "Telemetry worker started");

        loop {
            tokio::select! {
                biased;

                _ = shutdown_token.cancelled() => {
                    info!("Shutdown signal received, draining telemetry channel");
                    self.receiver.close();
                    while let Some(record) = self.receiver.recv().await {
                        self.process_guarded(record).await;
                    }
                    info!("Telemetry worker shutdown complete");
                    break;
                }

                maybe_record = self.receiver.recv() => {
                    match maybe_record {
                        Some(record) => self.process_guarded(record).await,
                        None => {
                            info!("Telemetry channel closed, shutting down worker");
                            break;
                        }
                    }
                }
            }
        }
    }

    /// [`process`](Self::process), but a panicking backend costs only the current record.
    async fn process_guarded(&self, record: UsageRecord) {
        let developer = record.developer;
        if AssertUnwindSafe(self.process(record)).catch_unwind().await.is_err() {
            error!(developer = %developer, "Telemetry backend panicked, usage record skipped");
            counter!(TELEMETRY_ERRORS_METRIC, "operation" => "panic").increment(1);
        }
    }

    /// Write one record. Failures are logged and counted, never returned.
    async fn process(&self, record: UsageRecord) {
        match self.write_log_entry(&record).await {
            Ok(()) => {
                info!(
                    developer = %record.developer,
                    model = record.model.as_deref().unwrap_or("-"),
                    total_tokens = record.total_tokens,
                    cost_usd = %record.cost_usd,
                    status = ?record.status,
                    "Logged usage"
                );
            }
            Err(e) => {
                error!(error = %e, developer = %record.developer, "Failed to write usage log entry");
                counter!(TELEMETRY_ERRORS_METRIC, "operation" => "log").increment(1);
            }
        }

        let samples = record.metric_samples(&self.project);
        if samples.is_empty() {
            return;
        }

        if let Err(e) = self.metrics_sink.put_metrics(&self.namespace, &samples).await {
            error!(error = %e, developer = %record.developer, "Failed to publish usage metrics");
            counter!(TELEMETRY_ERRORS_METRIC, "operation" => "metrics").increment(1);
        }
    }

    async fn write_log_entry(&self, record: &UsageRecord) -> Result<(), TelemetryError> {
        let stream = StreamKey::for_record(record);

        match self.log_store.ensure_stream(&stream).await {
            Ok(()) => debug!(stream = %stream, "Created log stream"),
            Err(TelemetryError::StreamAlreadyExists) => {}
            Err(e) => return Err(e),
        }

        let entry = LogEntry::from_record(record)?;
        self.log_store.put_entry(&stream, &entry).await
    }
}
