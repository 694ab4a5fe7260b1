//! Metric samples exported through the `metrics` facade.
//!
//! With the process-wide Prometheus recorder installed, a call by `dev3` to opus shows up as
//!
//! ```text
//! claude_api_input_tokens_total{developer="dev3",model="claude-3-opus-20240229",project="code-server-multi-dev"} 100
//! claude_api_output_tokens_total{developer="dev3",model="claude-3-opus-20240229",project="code-server-multi-dev"} 50
//! claude_api_cost_usd{developer="dev3",model="claude-3-opus-20240229",project="code-server-multi-dev"} 0.00525
//! claude_api_api_calls_total{developer="dev3",project="code-server-multi-dev"} 1
//! ```
//!
//! Cost is a monotonically increasing gauge because counters only accept integers.

use async_trait::async_trait;
use metrics::{Label, counter, describe_counter, describe_gauge, gauge};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::sync::OnceLock;
use tracing::warn;

use super::{MetricsSink, TELEMETRY_ERRORS_METRIC, TelemetryError};
use crate::usage::{MetricName, MetricSample};

static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Install the process-wide Prometheus recorder once and return its handle.
///
/// If some other global recorder is already installed the handle still renders, but only what
/// was recorded through it.
pub fn install_prometheus_recorder() -> PrometheusHandle {
    PROMETHEUS_HANDLE
        .get_or_init(|| {
            let recorder = PrometheusBuilder::new().build_recorder();
            let handle = recorder.handle();
            if let Err(e) = metrics::set_global_recorder(recorder) {
                warn!(error = %e, "Global metrics recorder already installed");
            }
            describe_counter!(TELEMETRY_ERRORS_METRIC, "Metering operations that failed and were skipped");
            handle
        })
        .clone()
}

/// Emits samples as Prometheus series named `{namespace}_{metric}`.
#[derive(Debug, Clone, Default)]
pub struct PrometheusMetricsSink;

impl PrometheusMetricsSink {
    pub fn new() -> Self {
        Self
    }

    /// Record `samples` on the current recorder.
    pub fn emit(&self, namespace: &str, samples: &[MetricSample]) {
        for sample in samples {
            let labels: Vec<Label> = sample
                .dimensions
                .iter()
                .map(|(key, value)| Label::new(key.to_ascii_lowercase(), value.clone()))
                .collect();

            match sample.name {
                MetricName::InputTokens => {
                    let name = format!("{namespace}_input_tokens_total");
                    describe_counter!(name.clone(), "Input tokens sent upstream");
                    counter!(name, labels).increment(sample.value as u64);
                }
                MetricName::OutputTokens => {
                    let name = format!("{namespace}_output_tokens_total");
                    describe_counter!(name.clone(), "Output tokens returned by upstream");
                    counter!(name, labels).increment(sample.value as u64);
                }
                MetricName::TotalCost => {
                    let name = format!("{namespace}_cost_usd");
                    describe_gauge!(name.clone(), "Accumulated cost of metered calls in USD");
                    gauge!(name, labels).increment(sample.value);
                }
                MetricName::ApiCall => {
                    let name = format!("{namespace}_api_calls_total");
                    describe_counter!(name.clone(), "Successful upstream calls");
                    counter!(name, labels).increment(sample.value as u64);
                }
            }
        }
    }
}

#[async_trait]
impl MetricsSink for PrometheusMetricsSink {
    async fn put_metrics(&self, namespace: &str, samples: &[MetricSample]) -> Result<(), TelemetryError> {
        self.emit(namespace, samples);
        Ok(())
    }
}
