use std::{sync::Arc, time::Duration};

use metrics::counter;
use pixel_wall_core::OtpStore;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Periodically drops tokens older than `retention` so unconsumed ones do not
/// accumulate. Expiry at verify time is governed by the store's own TTL.
pub fn spawn_retention(
    tokens: Arc<OtpStore>,
    retention: time::Duration,
    interval: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            let pass = tokio::spawn({
                let tokens = Arc::clone(&tokens);
                async move { tokens.sweep(retention) }
            });
            match pass.await {
                Ok(0) => {}
                Ok(swept) => {
                    counter!("pixel_wall_tokens_swept_total", swept as u64);
                    debug!(swept, remaining = tokens.len(), "swept stale tokens");
                }
                Err(err) => warn!(error = %err, "token sweep aborted"),
            }
        }
    })
}
