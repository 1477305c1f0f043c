//! bleepmeta -- replicated cluster metadata server.
//!
//! On SIGTERM/SIGINT the HTTP server stops accepting connections, in-flight
//! requests drain, and the store shuts its consensus module down.

use clap::Parser;
use tracing::info;

/// Command-line arguments for the meta server.
#[derive(Parser, Debug)]
#[command(name = "bleepmeta", version, about = "Replicated cluster metadata server")]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(short, long, default_value = "bleepmeta.example.yaml")]
    config: String,

    /// Override the consensus bind address (host:port).
    #[arg(long)]
    bind: Option<String>,

    /// Override the HTTP bind address (host:port).
    #[arg(long)]
    http_bind: Option<String>,

    /// HTTP address of an existing meta server to join. Repeatable.
    #[arg(long = "join")]
    join: Vec<String>,

    /// Override the data directory.
    #[arg(long)]
    dir: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = if std::path::Path::new(&cli.config).exists() {
        bleepmeta::config::load_config(&cli.config)?
    } else {
        bleepmeta::config::Config::default()
    };
    if let Some(bind) = cli.bind {
        config.meta.bind_address = bind;
    }
    if let Some(http_bind) = cli.http_bind {
        config.meta.http_bind_address = http_bind;
    }
    if let Some(dir) = cli.dir {
        config.meta.dir = dir;
    }
    if !cli.join.is_empty() {
        config.meta.join_peers = cli.join;
    }

    // Initialize tracing / logging.
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.logging.level));
    if config.logging.format == "json" {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
    info!("Loaded configuration from {}", cli.config);

    if config.observability.metrics {
        bleepmeta::metrics::init_metrics()?;
        bleepmeta::metrics::describe_metrics();
        info!("Prometheus metrics initialized");
    }

    let mut service = bleepmeta::service::Service::new(config);
    service.bind().await?;
    if let Some(addr) = service.raft_addr() {
        info!("Consensus listener bound to {}", addr);
    }

    // Opening blocks until a leader is known; a signal during that wait
    // aborts the open.
    let store = service.store().clone();
    tokio::select! {
        res = service.open() => res?,
        _ = shutdown_signal() => {
            store.close().await?;
            return Ok(());
        }
    }

    shutdown_signal().await;
    service.close().await?;
    info!("bleepmeta shut down");

    Ok(())
}

/// Wait for SIGTERM or SIGINT (Ctrl+C).
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
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
        _ = ctrl_c => {
            tracing::info!("Received SIGINT, shutting down");
        },
        _ = terminate => {
            tracing::info!("Received SIGTERM, shutting down");
        },
    }
}
