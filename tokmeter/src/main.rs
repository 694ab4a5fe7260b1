use clap::Parser;
use tokmeter::{Application, Config, identity::CredentialMap, telemetry};

/// Wait for shutdown signal (SIGTERM or Ctrl+C)
async fn shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        signal::ctrl_c().await.expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, shutting down gracefully...");
        },
        _ = terminate => {
            tracing::info!("Received SIGTERM, shutting down gracefully...");
        },
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Install rustls crypto provider before anything else that might build a TLS client
    rustls::crypto::aws_lc_rs::default_provider()
        .install_default()
        .expect("Failed to install rustls crypto provider");

    let args = tokmeter::config::Args::parse();
    let config = Config::load(&args)?;

    if args.validate {
        println!(
            "Configuration is valid: forwarding to {} with {} developer key(s) set.",
            config.upstream.messages_url(),
            CredentialMap::from_env().configured_slots()
        );
        return Ok(());
    }

    telemetry::init_telemetry(config.enable_otel_export)?;

    tracing::debug!("{:?}", args);
    tracing::info!(
        upstream = %config.upstream.messages_url(),
        timeout = ?config.upstream.timeout,
        log_dir = %config.telemetry.log_dir.join(&config.telemetry.log_group).display(),
        metrics_namespace = %config.telemetry.metrics_namespace,
        "Starting tokmeter"
    );

    let shutdown = shutdown_signal();
    Application::new(config).await?.serve(shutdown).await
}
