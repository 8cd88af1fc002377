use std::sync::Arc;

use anyhow::{Context, Result};
use metrics_exporter_prometheus::PrometheusHandle;
use pixel_wall_core::{GridState, OtpStore};
use serde::Serialize;
use tokio::task::JoinHandle;

use crate::{
    broadcast::Broadcaster, config::ServerConfig, liveness::spawn_liveness,
    registry::ClientRegistry, retention::spawn_retention,
};

/// Everything the HTTP handlers and background tasks share. Each piece has
/// its own lock; none of them is ever held while taking another.
pub struct AppState {
    pub config: ServerConfig,
    pub grid: Arc<GridState>,
    pub tokens: Arc<OtpStore>,
    pub registry: ClientRegistry,
    pub broadcaster: Broadcaster,
    token_retention: time::Duration,
    metrics: Option<PrometheusHandle>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatsResponse {
    pub active_clients: usize,
    pub outstanding_tokens: usize,
    pub slot_count: usize,
    pub cursor: usize,
    pub next_pixel: usize,
}

/// Handles to the periodic sweepers.
pub struct BackgroundTasks {
    liveness: JoinHandle<()>,
    retention: JoinHandle<()>,
}

impl BackgroundTasks {
    pub fn abort(&self) {
        self.liveness.abort();
        self.retention.abort();
    }
}

impl AppState {
    pub fn new(config: ServerConfig, metrics: Option<PrometheusHandle>) -> Result<Arc<Self>> {
        let grid = Arc::new(GridState::new(config.slot_count).context("invalid grid size")?);
        let token_ttl =
            time::Duration::try_from(config.token_ttl).context("token ttl out of range")?;
        let token_retention = time::Duration::try_from(config.token_retention)
            .context("token retention out of range")?;
        let registry = ClientRegistry::new(config.write_timeout);
        let broadcaster = Broadcaster::new(Arc::clone(&grid), registry.clone());

        Ok(Arc::new(Self {
            config,
            grid,
            tokens: Arc::new(OtpStore::new(token_ttl)),
            registry,
            broadcaster,
            token_retention,
            metrics,
        }))
    }

    pub fn spawn_background(&self) -> BackgroundTasks {
        BackgroundTasks {
            liveness: spawn_liveness(
                self.registry.clone(),
                self.config.liveness_interval,
                self.config.idle_timeout,
            ),
            retention: spawn_retention(
                Arc::clone(&self.tokens),
                self.token_retention,
                self.config.retention_interval,
            ),
        }
    }

    pub fn stats(&self) -> StatsResponse {
        let grid = self.grid.snapshot();
        StatsResponse {
            active_clients: self.registry.len(),
            outstanding_tokens: self.tokens.len(),
            slot_count: grid.slot_count,
            cursor: grid.cursor,
            next_pixel: grid.next_pixel(),
        }
    }

    pub fn render_metrics(&self) -> String {
        self.metrics
            .as_ref()
            .map(PrometheusHandle::render)
            .unwrap_or_default()
    }
}
