//! Usage extraction and the records handed to the metering sink.
//!
//! A successful upstream response carries its token counters in the JSON body:
//!
//! ```json
//! { "model": "claude-3-opus-20240229", "usage": { "input_tokens": 100, "output_tokens": 50 } }
//! ```
//!
//! Extraction is deliberately forgiving. The client always receives the raw upstream bytes, so a
//! body that is not JSON or does not have this shape just produces zero counts and the model
//! `"unknown"`.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use rust_decimal::prelude::ToPrimitive;
use serde::Serialize;
use serde_json::Value;
use std::time::Duration;

use crate::identity::CallerIdentity;

/// Model name used when the upstream body does not report one
pub const UNKNOWN_MODEL: &str = "unknown";

/// Token counters read from an upstream response body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UsageCounts {
    pub model: String,
    pub input_tokens: u64,
    pub output_tokens: u64,
}

impl Default for UsageCounts {
    fn default() -> Self {
        Self {
            model: UNKNOWN_MODEL.to_string(),
            input_tokens: 0,
            output_tokens: 0,
        }
    }
}

impl UsageCounts {
    /// Extract usage from a raw response body. Never fails.
    pub fn extract(body: &[u8]) -> Self {
        let Ok(value) = serde_json::from_slice::<Value>(body) else {
            return Self::default();
        };

        let usage = value.get("usage");
        let count = |field: &str| usage.and_then(|u| u.get(field)).and_then(Value::as_u64).unwrap_or(0);

        Self {
            model: value
                .get("model")
                .and_then(Value::as_str)
                .unwrap_or(UNKNOWN_MODEL)
                .to_string(),
            input_tokens: count("input_tokens"),
            output_tokens: count("output_tokens"),
        }
    }

    pub fn total_tokens(&self) -> u64 {
        self.input_tokens.saturating_add(self.output_tokens)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum UsageStatus {
    Success,
    Error,
}

/// One proxied call, as written to the usage log.
///
/// The serialized field names are the log entry format consumed downstream.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UsageRecord {
    pub timestamp: DateTime<Utc>,
    pub developer: CallerIdentity,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub total_tokens: u64,
    #[serde(with = "rust_decimal::serde::float")]
    pub cost_usd: Decimal,
    pub response_time_seconds: f64,
    pub status: UsageStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

fn round_seconds(elapsed: Duration) -> f64 {
    (elapsed.as_secs_f64() * 100.0).round() / 100.0
}

impl UsageRecord {
    /// Record for a call the upstream answered with 200.
    pub fn success(developer: CallerIdentity, usage: UsageCounts, cost: Decimal, elapsed: Duration) -> Self {
        let total_tokens = usage.total_tokens();
        Self {
            timestamp: Utc::now(),
            developer,
            model: Some(usage.model),
            input_tokens: usage.input_tokens,
            output_tokens: usage.output_tokens,
            total_tokens,
            cost_usd: cost.max(Decimal::ZERO).round_dp(6),
            response_time_seconds: round_seconds(elapsed),
            status: UsageStatus::Success,
            error: None,
        }
    }

    /// Record for a call that never produced an upstream response.
    pub fn failure(developer: CallerIdentity, error: impl Into<String>, elapsed: Duration) -> Self {
        Self {
            timestamp: Utc::now(),
            developer,
            model: None,
            input_tokens: 0,
            output_tokens: 0,
            total_tokens: 0,
            cost_usd: Decimal::ZERO,
            response_time_seconds: round_seconds(elapsed),
            status: UsageStatus::Error,
            error: Some(error.into()),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == UsageStatus::Success
    }

    /// The metric samples describing this call, tagged with `project`.
    ///
    /// Only successful calls produce samples.
    pub fn metric_samples(&self, project: &str) -> Vec<MetricSample> {
        if !self.is_success() {
            return Vec::new();
        }

        let developer = self.developer.to_string();
        let model = self.model.clone().unwrap_or_else(|| UNKNOWN_MODEL.to_string());
        let with_model = vec![
            (DIMENSION_DEVELOPER, developer.clone()),
            (DIMENSION_MODEL, model),
            (DIMENSION_PROJECT, project.to_string()),
        ];
        let sample = |name, value, unit, dimensions| MetricSample {
            name,
            value,
            unit,
            timestamp: self.timestamp,
            dimensions,
        };

        vec![
            sample(MetricName::InputTokens, self.input_tokens as f64, MetricUnit::Count, with_model.clone()),
            sample(MetricName::OutputTokens, self.output_tokens as f64, MetricUnit::Count, with_model.clone()),
            sample(
                MetricName::TotalCost,
                self.cost_usd.to_f64().unwrap_or(0.0),
                MetricUnit::None,
                with_model,
            ),
            sample(
                MetricName::ApiCall,
                1.0,
                MetricUnit::Count,
                vec![(DIMENSION_DEVELOPER, developer), (DIMENSION_PROJECT, project.to_string())],
            ),
        ]
    }
}

pub const DIMENSION_DEVELOPER: &str = "Developer";
pub const DIMENSION_MODEL: &str = "Model";
pub const DIMENSION_PROJECT: &str = "Project";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MetricName {
    InputTokens,
    OutputTokens,
    TotalCost,
    ApiCall,
}

impl MetricName {
    pub fn as_str(&self) -> &'static str {
        match self {
            MetricName::InputTokens => "InputTokens",
            MetricName::OutputTokens => "OutputTokens",
            MetricName::TotalCost => "TotalCost",
            MetricName::ApiCall => "APICall",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricUnit {
    Count,
    None,
}

/// A single numeric sample destined for the metrics backend.
#[derive(Debug, Clone, PartialEq)]
pub struct MetricSample {
    pub name: MetricName,
    pub value: f64,
    pub unit: MetricUnit,
    pub timestamp: DateTime<Utc>,
    pub dimensions: Vec<(&'static str, String)>,
}

impl MetricSample {
    pub fn dimension(&self, name: &str) -> Option<&str> {
        self.dimensions.iter().find(|(key, _)| *key == name).map(|(_, value)| value.as_str())
    }
}
