use std::{sync::Arc, time::Duration};

use futures_util::future::join_all;
use metrics::counter;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::registry::{ClientHandle, ClientRegistry};

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct LivenessReport {
    pub probed: usize,
    pub pruned: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Verdict {
    Alive,
    Detached,
    Idle,
    ProbeFailed,
}

impl Verdict {
    fn label(self) -> &'static str {
        match self {
            Verdict::Alive => "alive",
            Verdict::Detached => "detached",
            Verdict::Idle => "idle",
            Verdict::ProbeFailed => "send_failed",
        }
    }
}

/// Probes every registered client once and drops the ones that fail.
///
/// A client without a connection is dropped without probing. When
/// `idle_timeout` is set, clients that have sent nothing (pongs included)
/// for longer than that are dropped too.
pub async fn sweep_once(registry: &ClientRegistry, idle_timeout: Option<Duration>) -> LivenessReport {
    let clients = registry.snapshot();
    let verdicts = join_all(clients.iter().map(|client| judge(client, idle_timeout))).await;

    let mut report = LivenessReport {
        probed: clients.len(),
        pruned: 0,
    };
    for (client, verdict) in clients.iter().zip(verdicts) {
        if verdict == Verdict::Alive {
            continue;
        }
        if registry.remove(client.id()).await {
            report.pruned += 1;
            counter!("pixel_wall_liveness_pruned_total", 1, "reason" => verdict.label());
            info!(
                client_id = %client.id(),
                reason = verdict.label(),
                "dropping unresponsive client"
            );
        }
    }
    report
}

async fn judge(client: &Arc<ClientHandle>, idle_timeout: Option<Duration>) -> Verdict {
    if !client.is_attached().await {
        return Verdict::Detached;
    }
    if idle_timeout.is_some_and(|limit| client.idle_for() > limit) {
        return Verdict::Idle;
    }
    match client.ping().await {
        Ok(()) => Verdict::Alive,
        Err(err) => {
            debug!(client_id = %client.id(), error = %err, "liveness probe failed");
            Verdict::ProbeFailed
        }
    }
}

/// Runs [`sweep_once`] on a fixed interval for the life of the process.
///
/// Each pass runs in its own task so a fault in one pass is logged and the
/// next tick still happens.
pub fn spawn_liveness(
    registry: ClientRegistry,
    interval: Duration,
    idle_timeout: Option<Duration>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            let pass = tokio::spawn({
                let registry = registry.clone();
                async move { sweep_once(&registry, idle_timeout).await }
            });
            match pass.await {
                Ok(report) if report.pruned > 0 => {
                    info!(
                        probed = report.probed,
                        pruned = report.pruned,
                        "liveness sweep pruned clients"
                    );
                }
                Ok(report) => debug!(probed = report.probed, "liveness sweep finished"),
                Err(err) => warn!(error = %err, "liveness sweep aborted"),
            }
        }
    })
}
