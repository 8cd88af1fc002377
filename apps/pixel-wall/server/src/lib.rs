//! Realtime shared pixel grid.
//!
//! Clients trade a one-time token for a WebSocket. Every text frame they send
//! paints the next slot of a fixed-size grid, and every connected client gets
//! the whole grid back after each change.

pub mod broadcast;
pub mod config;
pub mod liveness;
pub mod registry;
pub mod retention;
pub mod routes;
pub mod session;
pub mod state;
pub mod telemetry;

#[cfg(test)]
mod test_support;

use std::{future::Future, sync::Arc};

use anyhow::{Context, Result};
use metrics_exporter_prometheus::PrometheusHandle;
use tokio::net::TcpListener;
use tracing::info;

use crate::{config::ServerConfig, state::AppState};

pub async fn run(config: ServerConfig, metrics: Option<PrometheusHandle>) -> Result<()> {
    let listener = TcpListener::bind(config.listen_addr)
        .await
        .context("failed to bind listener")?;
    let state = AppState::new(config, metrics)?;
    info!(
        listen_addr = %state.config.listen_addr,
        slot_count = state.config.slot_count,
        "pixel-wall listening"
    );
    serve(listener, state, shutdown_signal()).await
}

/// Serves on an already-bound listener until `shutdown` resolves, then stops
/// the background sweepers and waits out the grace period.
pub async fn serve<F>(listener: TcpListener, state: Arc<AppState>, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let background = state.spawn_background();
    let router = routes::build_router(Arc::clone(&state));

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown)
        .await
        .context("server shutdown with error")?;

    info!(
        grace_seconds = state.config.shutdown_grace.as_secs(),
        "shutdown signal received; sleeping for graceful period"
    );
    background.abort();
    tokio::time::sleep(state.config.shutdown_grace).await;
    info!("graceful shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
