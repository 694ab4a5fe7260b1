//! Application configuration management.
//!
//! Configuration is loaded from a YAML file with environment variable overrides. The configuration
//! file path defaults to `config.yaml` but can be specified via `-f` flag or `TOKMETER_CONFIG`
//! environment variable.
//!
//! ## Loading Priority
//!
//! Configuration sources are merged in the following order (later sources override earlier ones):
//!
//! 1. **YAML config file** - Base configuration (default: `config.yaml`)
//! 2. **Environment variables** - Variables prefixed with `TOKMETER_` override YAML values
//!
//! For nested config values, use double underscores in environment variables. For example,
//! `TOKMETER_UPSTREAM__TIMEOUT=30s` sets the `upstream.timeout` field.
//!
//! A missing config file is not an error: every field has a default, so the proxy can run from
//! environment variables alone.
//!
//! ## Credentials
//!
//! Developer API keys are deliberately *not* part of this configuration. They are read from the
//! `DEV1_CLAUDE_KEY` .. `DEV8_CLAUDE_KEY` environment variables at startup, see
//! [`crate::identity::CredentialMap::from_env`].
//!
//! ## Usage
//!
//! ```no_run
//! use clap::Parser;
//! use tokmeter::config::{Args, Config};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let args = Args::parse();
//! let config = Config::load(&args)?;
//!
//! println!("Proxy will bind to {}", config.bind_address());
//! # Ok(())
//! # }
//! ```
//!
//! ## Configuration Structure
//!
//! - **Server**: `host`, `port`, `service_name`
//! - **Upstream**: `upstream.base_url`, `upstream.timeout`, `upstream.default_version`
//! - **Pricing**: `pricing.default_family`, `pricing.families` - USD per million tokens
//! - **Telemetry**: `telemetry.project`, `telemetry.log_group`, `telemetry.log_dir`,
//!   `telemetry.metrics_namespace`, `telemetry.channel_capacity`
//! - **Features**: `enable_metrics`, `enable_otel_export`
//!
//! ## Environment Variable Examples
//!
//! ```bash
//! TOKMETER_PORT=8080
//! TOKMETER_UPSTREAM__BASE_URL="http://localhost:9000"
//! TOKMETER_TELEMETRY__PROJECT="research-cluster"
//! TOKMETER_ENABLE_METRICS=true
//! ```

use clap::Parser;
use figment::{
    Figment,
    providers::{Env, Format, Yaml},
};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, path::PathBuf, time::Duration};
use url::Url;

use crate::errors::Error;

/// Simple CLI args - just for specifying config file
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Path to configuration file
    #[arg(short = 'f', long, env = "TOKMETER_CONFIG", default_value = "config.yaml")]
    pub config: String,

    /// Validate configuration and exit without starting the server.
    #[arg(long)]
    pub validate: bool,
}

/// Main application configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// HTTP server host to bind to (e.g., "0.0.0.0" for all interfaces)
    pub host: String,
    /// HTTP server port to bind to
    pub port: u16,
    /// Name reported by the health endpoint
    pub service_name: String,
    /// Expose the Prometheus exposition at `/internal/metrics`
    pub enable_metrics: bool,
    /// Export traces over OTLP (configured through the standard `OTEL_*` variables)
    pub enable_otel_export: bool,
    pub upstream: UpstreamConfig,
    pub pricing: PricingConfig,
    pub telemetry: TelemetryConfig,
}

/// Where requests are forwarded to.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct UpstreamConfig {
    /// Base URL of the messages API. Requests go to `{base_url}/v1/messages`.
    pub base_url: Url,
    /// Bound on the whole upstream exchange, including reading the body
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
    /// `anthropic-version` sent when the client does not provide one
    pub default_version: String,
}

/// Prices per model family, quoted in USD per million tokens.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct PricingConfig {
    /// Family used for models whose family has no entry
    pub default_family: String,
    pub families: BTreeMap<String, FamilyPrice>,
}

#[derive(Debug, Clone, Copy, PartialEq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct FamilyPrice {
    pub input_per_million: Decimal,
    pub output_per_million: Decimal,
}

/// Usage logging and metric emission.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct TelemetryConfig {
    /// Value of the `Project` dimension on every metric sample
    pub project: String,
    /// Log group the per-developer streams live under
    pub log_group: String,
    /// Root directory of the file log store
    pub log_dir: PathBuf,
    /// Prefix of the emitted metric names
    pub metrics_namespace: String,
    /// Records buffered for the background worker before new ones are dropped
    pub channel_capacity: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8000,
            service_name: "claude-proxy".to_string(),
            enable_metrics: true,
            enable_otel_export: false,
            upstream: UpstreamConfig::default(),
            pricing: PricingConfig::default(),
            telemetry: TelemetryConfig::default(),
        }
    }
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            base_url: Url::parse("https://api.anthropic.com").expect("default upstream URL is valid"),
            timeout: Duration::from_secs(300),
            default_version: "2023-06-01".to_string(),
        }
    }
}

impl Default for PricingConfig {
    fn default() -> Self {
        let family = |input: i64, input_scale: u32, output: i64, output_scale: u32| FamilyPrice {
            input_per_million: Decimal::new(input, input_scale),
            output_per_million: Decimal::new(output, output_scale),
        };

        Self {
            default_family: "claude-3-sonnet".to_string(),
            families: BTreeMap::from([
                ("claude-3-sonnet".to_string(), family(3, 0, 15, 0)),
                ("claude-3-haiku".to_string(), family(25, 2, 125, 2)),
                ("claude-3-opus".to_string(), family(15, 0, 75, 0)),
            ]),
        }
    }
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            project: "code-server-multi-dev".to_string(),
            log_group: "claude-api".to_string(),
            log_dir: PathBuf::from("./usage-logs"),
            metrics_namespace: "claude_api".to_string(),
            channel_capacity: 10_000,
        }
    }
}

impl UpstreamConfig {
    /// Full URL of the upstream messages endpoint.
    pub fn messages_url(&self) -> String {
        format!("{}/v1/messages", self.base_url.as_str().trim_end_matches('/'))
    }
}

impl Config {
    #[allow(clippy::result_large_err)]
    pub fn load(args: &Args) -> Result<Self, figment::Error> {
        let config: Self = Self::figment(args).extract()?;
        config.validate().map_err(|e| figment::Error::from(e.to_string()))?;
        Ok(config)
    }

    /// Validate the configuration for consistency and required fields
    pub fn validate(&self) -> Result<(), Error> {
        let invalid = |message: String| Error::Internal {
            operation: format!("validate config: {message}"),
        };

        if !matches!(self.upstream.base_url.scheme(), "http" | "https") {
            return Err(invalid(format!(
                "upstream.base_url must use http or https, got '{}'",
                self.upstream.base_url.scheme()
            )));
        }

        if self.upstream.timeout.is_zero() {
            return Err(invalid("upstream.timeout must be greater than zero".to_string()));
        }

        if self.telemetry.channel_capacity == 0 {
            return Err(invalid("telemetry.channel_capacity must be greater than zero".to_string()));
        }

        if self.telemetry.project.trim().is_empty() {
            return Err(invalid("telemetry.project cannot be empty".to_string()));
        }

        if !self.pricing.families.contains_key(&self.pricing.default_family) {
            return Err(invalid(format!(
                "pricing.default_family '{}' has no entry in pricing.families",
                self.pricing.default_family
            )));
        }

        if let Some((family, _)) = self
            .pricing
            .families
            .iter()
            .find(|(_, price)| price.input_per_million.is_sign_negative() || price.output_per_million.is_sign_negative())
        {
            return Err(invalid(format!("pricing for '{family}' cannot be negative")));
        }

        Ok(())
    }

    pub fn figment(args: &Args) -> Figment {
        Figment::new()
            .merge(Yaml::file(&args.config))
            // TOKMETER_CONFIG names the file itself and is consumed by clap
            .merge(Env::prefixed("TOKMETER_").ignore(&["config"]).split("__"))
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}
