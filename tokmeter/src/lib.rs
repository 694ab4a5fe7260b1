//! # tokmeter: metering reverse proxy for the Anthropic Messages API
//!
//! `tokmeter` sits between a team's tooling and the upstream messages API. Every developer is
//! handed their own upstream API key; the proxy forwards their calls untouched, attributes each
//! call to the developer whose key was presented, prices the token usage the upstream reports,
//! and records it twice: as a per-call JSON log entry and as aggregate metrics.
//!
//! ## Request Flow
//!
//! A client calls `POST /v1/messages` exactly as it would call the upstream API.
//!
//! 1. The `x-api-key` header is looked up in the [`identity::CredentialMap`] loaded from
//!    `DEV1_CLAUDE_KEY` .. `DEV8_CLAUDE_KEY`. Unknown keys are attributed to `unknown`, not
//!    rejected; only a missing key is refused with 401.
//! 2. The [`upstream::Forwarder`] sends the raw body upstream with just the key, the API version
//!    and a JSON content type, bounded by a single timeout.
//! 3. For a 200 response, [`usage::UsageCounts::extract`] reads the token counters and
//!    [`pricing::CostTable`] prices them.
//! 4. The resulting [`usage::UsageRecord`] is queued on the [`metering::TelemetrySink`] and the
//!    upstream response is relayed unchanged.
//!
//! Transport failures produce a 500 with the error text and an error record. Any other upstream
//! status is relayed unchanged and not metered.
//!
//! ## Metering
//!
//! A background [`metering::TelemetryWorker`] drains the queue. Each record is appended to the
//! developer's daily log stream and, for successful calls, published as four metric samples.
//! Backend failures are logged and counted, never surfaced to clients.
//!
//! ## Quick Start
//!
//! ```no_run
//! use clap::Parser;
//! use tokmeter::{Application, Config};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let args = tokmeter::config::Args::parse();
//!     let config = Config::load(&args)?;
//!
//!     tokmeter::telemetry::init_telemetry(config.enable_otel_export)?;
//!
//!     let app = Application::new(config).await?;
//!     app.serve(async {
//!         tokio::signal::ctrl_c().await.expect("Failed to listen for Ctrl+C");
//!     })
//!     .await?;
//!
//!     Ok(())
//! }
//! ```
//!
//! ## Configuration
//!
//! See the [`config`] module for configuration options.

pub mod api;
pub mod config;
pub mod errors;
pub mod identity;
pub mod metering;
pub mod pricing;
pub mod telemetry;
pub mod upstream;
pub mod usage;


#[cfg(test)]
mod test;

use axum::{
    Router,
    extract::DefaultBodyLimit,
    routing::{get, post},
};
use bon::Builder;
pub use config::Config;
use metrics_exporter_prometheus::PrometheusHandle;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::{CancellationToken, DropGuard};
use tower_http::trace::{DefaultMakeSpan, DefaultOnRequest, DefaultOnResponse, TraceLayer};
use tracing::{Level, debug, info};

use crate::{
    identity::CredentialMap,
    metering::{FileLogStore, LogStore, MetricsSink, PrometheusMetricsSink, TelemetrySink, TelemetryWorker},
    pricing::CostTable,
    upstream::Forwarder,
};

/// Largest request body accepted on `/v1/messages`, matching the upstream request size limit
const MAX_REQUEST_BODY_BYTES: usize = 32 * 1024 * 1024;

/// Application state shared across all request handlers.
///
/// Everything in here is read-only after startup.
///
/// # Example
///
/// ```ignore
/// let state = AppState::builder()
///     .config(config)
///     .identities(Arc::new(CredentialMap::from_env()))
///     .pricing(Arc::new(cost_table))
///     .forwarder(forwarder)
///     .sink(sink)
///     .build();
/// ```
#[derive(Clone, Builder)]
pub struct AppState {
    pub config: Config,
    pub identities: Arc<CredentialMap>,
    pub pricing: Arc<CostTable>,
    pub forwarder: Forwarder,
    pub sink: TelemetrySink,
    /// Present when `enable_metrics` is set
    pub metrics_handle: Option<PrometheusHandle>,
}

/// Build the application router.
pub fn build_router(state: AppState) -> Router {
    let mut router = Router::new()
        .route(
            "/v1/messages",
            post(api::handlers::messages::proxy_messages).layer(DefaultBodyLimit::max(MAX_REQUEST_BODY_BYTES)),
        )
        .route("/health", get(api::handlers::health::health));

    if let Some(handle) = state.metrics_handle.clone() {
        router = router.route("/internal/metrics", get(move || async move { handle.render() }));
    }

    router.with_state(state).layer(
        TraceLayer::new_for_http()
            .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
            .on_request(DefaultOnRequest::new().level(Level::INFO))
            .on_response(DefaultOnResponse::new().level(Level::INFO)),
    )
}

/// Container for background services and their lifecycle management.
///
/// Currently this is the telemetry worker. When dropped, the `drop_guard` cancels the shutdown
/// token so the worker drains and stops even without an explicit
/// [`shutdown`](BackgroundServices::shutdown).
pub struct BackgroundServices {
    background_tasks: Vec<tokio::task::JoinHandle<()>>,
    shutdown_token: CancellationToken,
    // Pub so that we can disarm it if we want to
    pub drop_guard: Option<DropGuard>,
}

impl BackgroundServices {
    /// Gracefully shutdown all background tasks
    pub async fn shutdown(self) {
        self.shutdown_token.cancel();

        for handle in self.background_tasks {
            let _ = handle.await;
        }
    }
}

/// Start the telemetry worker and return the sink feeding it.
fn setup_background_services(
    config: &Config,
    log_store: Arc<dyn LogStore>,
    metrics_sink: Arc<dyn MetricsSink>,
) -> (BackgroundServices, TelemetrySink) {
    let shutdown_token = CancellationToken::new();
    let drop_guard = shutdown_token.clone().drop_guard();

    let (worker, sink) = TelemetryWorker::new(&config.telemetry, log_store, metrics_sink);
    let handle = tokio::spawn(worker.run(shutdown_token.clone()));

    let services = BackgroundServices {
        background_tasks: vec![handle],
        shutdown_token,
        drop_guard: Some(drop_guard),
    };
    (services, sink)
}

/// Main application struct that owns all resources and lifecycle.
///
/// # Lifecycle
///
/// 1. **Create**: [`Application::new`] reads the credential slots, builds the cost table and the
///    upstream client, and starts the telemetry worker
/// 2. **Serve**: [`Application::serve`] binds to a TCP port and starts handling requests
/// 3. **Shutdown**: when the shutdown future resolves, in-flight requests finish, then the
///    telemetry worker drains its queue
pub struct Application {
    router: Router,
    config: Config,
    bg_services: BackgroundServices,
}

impl Application {
    /// Create the application with credentials from the environment, a file log store under
    /// `telemetry.log_dir` and Prometheus metrics.
    ///
    /// The Prometheus recorder is installed whether or not `enable_metrics` exposes it, since
    /// [`PrometheusMetricsSink`] writes to the global recorder.
    pub async fn new(config: Config) -> anyhow::Result<Self> {
        let identities = CredentialMap::from_env();
        let log_store = Arc::new(FileLogStore::new(&config.telemetry.log_dir, &config.telemetry.log_group));
        metering::install_prometheus_recorder();
        Self::new_with_backends(config, identities, log_store, Arc::new(PrometheusMetricsSink::new())).await
    }

    /// Create the application with explicit credentials and telemetry backends.
    pub async fn new_with_backends(
        config: Config,
        identities: CredentialMap,
        log_store: Arc<dyn LogStore>,
        metrics_sink: Arc<dyn MetricsSink>,
    ) -> anyhow::Result<Self> {
        debug!("Starting proxy with configuration: {:#?}", config);

        info!(
            configured_slots = identities.configured_slots(),
            "Loaded developer credentials"
        );
        if identities.configured_slots() == 0 {
            tracing::warn!("No DEV*_CLAUDE_KEY credentials configured, every call will be attributed to 'unknown'");
        }

        let forwarder = Forwarder::new(&config.upstream)?;

        let metrics_handle = config.enable_metrics.then(metering::install_prometheus_recorder);

        let (bg_services, sink) = setup_background_services(&config, log_store, metrics_sink);

        let state = AppState::builder()
            .config(config.clone())
            .identities(Arc::new(identities))
            .pricing(Arc::new(CostTable::from_config(&config.pricing)))
            .forwarder(forwarder)
            .sink(sink)
            .maybe_metrics_handle(metrics_handle)
            .build();

        let router = build_router(state);

        Ok(Self {
            router,
            config,
            bg_services,
        })
    }

    /// Convert application into a test server (for tests)
    #[cfg(test)]
    pub fn into_test_server(self) -> (axum_test::TestServer, BackgroundServices) {
        let server = axum_test::TestServer::new(self.router.into_make_service()).expect("Failed to create test server");
        (server, self.bg_services)
    }

    /// Start serving the application
    pub async fn serve<F>(self, shutdown: F) -> anyhow::Result<()>
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let bind_addr = self.config.bind_address();
        let listener = TcpListener::bind(&bind_addr).await?;
        info!(
            "Proxy listening on http://{}, available at http://localhost:{}",
            bind_addr, self.config.port
        );

        axum::serve(listener, self.router.into_make_service())
            .with_graceful_shutdown(shutdown)
            .await?;

        info!("Draining telemetry...");
        self.bg_services.shutdown().await;

        info!("Shutting down tracing...");
        telemetry::shutdown_telemetry();

        Ok(())
    }
}
