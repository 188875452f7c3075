use std::net::SocketAddr;
use std::sync::Arc;

use clap::Parser;
use tokio::signal;
use tracing::info;
use tracing_subscriber::EnvFilter;

use abuseguard::config::GuardConfig;
use abuseguard::gate::{Gate, GateServer};

/// Adaptive rate limiting and abuse detection gate.
#[derive(Debug, Parser)]
#[command(version, about)]
struct Args {
    /// YAML configuration file
    #[arg(short, long)]
    config: Option<String>,

    /// Override the listen address
    #[arg(long)]
    listen: Option<SocketAddr>,

    /// Override the Redis URL
    #[arg(long)]
    redis_url: Option<String>,

    /// Emit logs as JSON
    #[arg(long)]
    json_logs: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize tracing
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true);
    if args.json_logs {
        subscriber.json().init();
    } else {
        subscriber.init();
    }

    info!("Starting Abuseguard");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let mut config = GuardConfig::load(args.config.as_deref())?;
    if let Some(listen) = args.listen {
        config.server.listen_addr = listen;
    }
    if let Some(url) = args.redis_url {
        config.redis.url = Some(url);
    }
    info!(
        listen_addr = %config.server.listen_addr,
        redis = config.redis.url.is_some(),
        bypass = config.bypass,
        "Configuration loaded"
    );

    let gate = Arc::new(Gate::from_config(&config)?);
    let maintenance = gate.spawn_maintenance();
    info!(
        distributed = gate.limiter().is_distributed(),
        tasks = maintenance.len(),
        "Gate initialized"
    );

    GateServer::new(config.server.listen_addr, gate)
        .serve_with_shutdown(shutdown_signal())
        .await?;

    for task in maintenance {
        task.abort();
    }

    info!("Abuseguard stopped");
    Ok(())
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
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
            info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown");
        }
    }
}
