use std::sync::Arc;

use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use worker_rpc::{WorkerBridge, WorkerConfig};

use gateway::{
    config::GatewayConfig,
    http,
    state::{build_gateway, AppState},
    store::Store,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = GatewayConfig::from_env();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_new(&config.log_filter).unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let store = Store::open(&config.database_path())?;

    let mut worker_config = WorkerConfig::new(&config.worker_binary);
    worker_config.args = config.worker_args.clone();
    let bridge = Arc::new(WorkerBridge::new(worker_config));
    if let Err(err) = bridge.start().await {
        // Degraded start: /health reports it, handlers fail fast.
        warn!("worker bridge failed to start: {err}");
    }

    let state = build_gateway(config.clone(), store, bridge).await?;

    let listener = tokio::net::TcpListener::bind(config.bind_addr()).await?;
    info!("gateway listening on http://{}", config.bind_addr());

    let app = http::router(state.clone());
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(state.clone()))
        .await?;

    state.bridge.shutdown().await;
    info!("gateway stopped");
    Ok(())
}

/// Ctrl-C: destroy the terminal mux (killing all PTYs) before the HTTP
/// listener stops accepting.
async fn shutdown_signal(state: AppState) {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!("failed to listen for shutdown signal: {err}");
        return;
    }
    info!("shutting down");
    state.terminals.destroy_all().await;
}
