use std::{panic::AssertUnwindSafe, sync::Arc};

use axum::extract::ws::Message;
use futures_util::FutureExt;
use metrics::counter;
use pixel_wall_core::{GridState, GridUpdate};
use tokio::task::JoinSet;
use tracing::{debug, warn};

use crate::registry::{ClientHandle, ClientRegistry, SendError};

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BroadcastMetrics {
    pub recipients: usize,
    pub delivered: usize,
    pub failed: usize,
}

/// Pushes the current grid to every registered client.
#[derive(Clone)]
pub struct Broadcaster {
    grid: Arc<GridState>,
    registry: ClientRegistry,
}

impl Broadcaster {
    pub fn new(grid: Arc<GridState>, registry: ClientRegistry) -> Self {
        Self { grid, registry }
    }

    /// Fans the grid out to a snapshot of the registry, one task per client.
    ///
    /// The registry lock is only held while the snapshot is copied; each send
    /// then takes just that client's connection lock. A client whose send
    /// fails (or whose task panics) is removed, and nothing about it reaches
    /// the caller. Returns once every send has been attempted.
    pub async fn broadcast_grid(&self) -> BroadcastMetrics {
        let clients = self.registry.snapshot();
        let mut metrics = BroadcastMetrics {
            recipients: clients.len(),
            ..BroadcastMetrics::default()
        };
        if clients.is_empty() {
            return metrics;
        }

        let update = GridUpdate::from(self.grid.snapshot());
        let payload: Arc<str> = match serde_json::to_string(&update) {
            Ok(json) => json.into(),
            Err(err) => {
                warn!(error = %err, "failed to encode grid update");
                metrics.failed = metrics.recipients;
                return metrics;
            }
        };

        let mut tasks = JoinSet::new();
        for client in clients {
            let registry = self.registry.clone();
            let payload = Arc::clone(&payload);
            tasks.spawn(deliver_isolated(registry, client, payload));
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(true) => metrics.delivered += 1,
                Ok(false) => metrics.failed += 1,
                Err(err) => {
                    metrics.failed += 1;
                    warn!(error = %err, "broadcast task did not complete");
                }
            }
        }

        debug!(
            recipients = metrics.recipients,
            delivered = metrics.delivered,
            failed = metrics.failed,
            "grid broadcast finished"
        );
        metrics
    }
}

async fn deliver_isolated(
    registry: ClientRegistry,
    client: Arc<ClientHandle>,
    payload: Arc<str>,
) -> bool {
    let id = client.id();
    let attempt = AssertUnwindSafe(deliver(&registry, &client, &payload)).catch_unwind();
    match attempt.await {
        Ok(delivered) => delivered,
        Err(_) => {
            warn!(client_id = %id, "grid delivery panicked; dropping client");
            counter!("pixel_wall_broadcast_sends_total", 1, "outcome" => "failed");
            registry.remove(id).await;
            false
        }
    }
}

async fn deliver(registry: &ClientRegistry, client: &ClientHandle, payload: &str) -> bool {
    match client.send(Message::Text(payload.to_owned())).await {
        Ok(()) => {
            counter!("pixel_wall_broadcast_sends_total", 1, "outcome" => "delivered");
            true
        }
        Err(err) => {
            counter!("pixel_wall_broadcast_sends_total", 1, "outcome" => "failed");
            if matches!(err, SendError::Detached) {
                debug!(client_id = %client.id(), "skipping closed client");
            } else {
                warn!(
                    client_id = %client.id(),
                    user_id = client.user_id().unwrap_or("anonymous"),
                    reason = err.metric_label(),
                    error = %err,
                    "failed to deliver grid update"
                );
            }
            registry.remove(client.id()).await;
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::test_support::{channel_sink, drain_text, failing_sink, panicking_sink, stalled_sink};
    use test_timeout::tokio_timeout_test;

    fn setup(slots: usize, write_timeout: Duration) -> (Arc<GridState>, ClientRegistry, Broadcaster) {
        let grid = Arc::new(GridState::new(slots).unwrap());
        let registry = ClientRegistry::new(write_timeout);
        let broadcaster = Broadcaster::new(Arc::clone(&grid), registry.clone());
        (grid, registry, broadcaster)
    }

    fn decode(frame: &str) -> GridUpdate {
        serde_json::from_str(frame).unwrap()
    }

    #[tokio_timeout_test(5)]
    async fn empty_registry_is_a_noop() {
        let (_grid, _registry, broadcaster) = setup(3, Duration::from_secs(1));
        assert_eq!(broadcaster.broadcast_grid().await, BroadcastMetrics::default());
    }

    #[tokio_timeout_test(5)]
    async fn every_client_sees_the_paint() {
        let (grid, registry, broadcaster) = setup(3, Duration::from_secs(1));
        let mut receivers = Vec::new();
        for _ in 0..4 {
            let (sink, rx) = channel_sink();
            registry.register(sink, None);
            receivers.push(rx);
        }

        grid.paint("#FF0000");
        let metrics = broadcaster.broadcast_grid().await;
        assert_eq!(metrics.recipients, 4);
        assert_eq!(metrics.delivered, 4);

        for rx in &mut receivers {
            let frames = drain_text(rx);
            assert_eq!(frames.len(), 1);
            let update = decode(&frames[0]);
            assert_eq!(update.grid.get(&0).map(String::as_str), Some("#FF0000"));
            assert_eq!(update.next_pixel, 2);
        }
    }

    #[tokio_timeout_test(5)]
    async fn failing_client_is_removed_without_affecting_others() {
        let (grid, registry, broadcaster) = setup(3, Duration::from_secs(1));
        let (sink, mut healthy_rx) = channel_sink();
        let healthy = registry.register(sink, Some("u1".into()));
        let broken = registry.register(failing_sink(), Some("u2".into()));

        grid.paint("#00FF00");
        let metrics = broadcaster.broadcast_grid().await;

        assert_eq!(metrics.delivered, 1);
        assert_eq!(metrics.failed, 1);
        assert!(registry.contains(healthy.id()));
        assert!(!registry.contains(broken.id()));
        assert!(broken.is_closed());
        assert_eq!(drain_text(&mut healthy_rx).len(), 1);
    }

    #[tokio_timeout_test(10)]
    async fn stalled_client_does_not_delay_others() {
        let (grid, registry, broadcaster) = setup(3, Duration::from_secs(2));
        let (sink, mut healthy_rx) = channel_sink();
        registry.register(sink, None);
        let stalled = registry.register(stalled_sink(), None);

        grid.paint("#0000FF");
        let running = tokio::spawn(async move { broadcaster.broadcast_grid().await });

        let first = tokio::time::timeout(Duration::from_millis(500), healthy_rx.recv())
            .await
            .expect("healthy client served before the stalled write times out")
            .expect("frame");
        assert!(matches!(first, Message::Text(_)));

        let metrics = running.await.unwrap();
        assert_eq!(metrics.delivered, 1);
        assert_eq!(metrics.failed, 1);
        assert!(!registry.contains(stalled.id()));
    }

    #[tokio_timeout_test(5)]
    async fn panicking_send_is_contained() {
        let (grid, registry, broadcaster) = setup(3, Duration::from_secs(1));
        let (sink, mut healthy_rx) = channel_sink();
        registry.register(sink, None);
        let faulty = registry.register(panicking_sink(), None);

        grid.paint("#123456");
        let metrics = broadcaster.broadcast_grid().await;

        assert_eq!(metrics.delivered, 1);
        assert_eq!(metrics.failed, 1);
        assert!(!registry.contains(faulty.id()));
        assert_eq!(drain_text(&mut healthy_rx).len(), 1);
    }

    #[tokio_timeout_test(5)]
    async fn concurrent_paints_keep_snapshots_consistent() {
        let (grid, registry, broadcaster) = setup(5, Duration::from_secs(1));
        let (sink, mut rx) = channel_sink();
        registry.register(sink, None);

        let mut tasks = JoinSet::new();
        for i in 0..5 {
            let grid = Arc::clone(&grid);
            let broadcaster = broadcaster.clone();
            tasks.spawn(async move {
                grid.paint(&format!("c{i}"));
                broadcaster.broadcast_grid().await
            });
        }
        while tasks.join_next().await.is_some() {}

        let frames = drain_text(&mut rx);
        assert_eq!(frames.len(), 5);
        for frame in frames {
            let update = decode(&frame);
            // a grid with k entries was produced after exactly k paints
            assert_eq!(update.next_pixel, update.grid.len() % 5 + 1);
        }
        assert_eq!(grid.snapshot().colors.len(), 5);
    }
}
