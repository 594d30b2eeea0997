//! SpanStore -- S3-compatible multi-backend data gateway.

use std::sync::Arc;

use clap::Parser;
use tracing::info;

/// Command-line arguments for the SpanStore server.
#[derive(Parser, Debug)]
#[command(
    name = "spanstore",
    version,
    about = "S3-compatible multi-backend data gateway"
)]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(short, long, default_value = "spanstore.yaml")]
    config: String,

    /// Override the bind address (host:port).
    #[arg(short, long)]
    bind: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = spanstore::config::load_config(&cli.config)?;

    // Logging per the config's level/format, overridable via RUST_LOG.
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(config.logging.level.clone()));
    if config.logging.format == "json" {
        tracing_subscriber::fmt().with_env_filter(env_filter).json().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(env_filter).init();
    }
    info!("configuration loaded from {}", cli.config);

    if config.observability.metrics {
        spanstore::metrics::init_metrics();
        spanstore::metrics::describe_metrics();
        info!("Prometheus metrics initialized");
    }

    let bind_addr = cli
        .bind
        .unwrap_or_else(|| format!("{}:{}", config.server.host, config.server.port));

    // One backend client per configured location; built once, never
    // mutated at runtime.
    let registry = spanstore::location::LocationRegistry::from_config(&config).await?;
    let gateway = Arc::new(spanstore::gateway::MultiBackendGateway::new(Arc::new(
        registry,
    )));

    let kms: Arc<dyn spanstore::kms::KeyManager> =
        Arc::new(spanstore::kms::MemoryKeyManager::new());
    let data = Arc::new(spanstore::data::DataWrapper::new(gateway, kms));

    let metadata: Arc<dyn spanstore::metadata::store::MetadataStore> =
        Arc::new(spanstore::metadata::memory::MemoryMetadataStore::new());

    let shutdown_timeout = config.server.shutdown_timeout;
    let state = Arc::new(spanstore::AppState {
        config,
        metadata,
        data,
    });

    let app = spanstore::server::app(state);

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    info!("SpanStore listening on {}", bind_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(shutdown_timeout))
        .await?;

    info!("shutdown complete");
    Ok(())
}

/// Resolve on SIGTERM/SIGINT, then give in-flight requests a bounded
/// window to drain.
async fn shutdown_signal(timeout_secs: u64) {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install ctrl-c handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!(
        "shutdown signal received, draining for up to {}s",
        timeout_secs
    );
    // Hard exit if in-flight requests do not drain within the window.
    tokio::spawn(async move {
        tokio::time::sleep(std::time::Duration::from_secs(timeout_secs)).await;
        tracing::warn!("drain window expired, exiting");
        std::process::exit(0);
    });
}
