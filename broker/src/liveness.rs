//! Connection liveness: worker expiry and relay ping/pong.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};

use workpool_common::SessionFrame;

use crate::gateway::WorkerRegistry;
use crate::rpc::Relay;

/// Periodically drop workers that stopped heartbeating.
///
/// Removal closes each worker, which fails its pending requests and ends its
/// connection task.
pub fn spawn_worker_pruner(registry: Arc<WorkerRegistry>, every: Duration, expiry: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval(every.max(Duration::from_millis(10)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let removed = registry.prune_expired(expiry).await;
            if !removed.is_empty() {
                tracing::info!(count = removed.len(), "Pruned expired workers");
            }
        }
    })
}

/// Ping a relay every `every`; close it once nothing has been heard for longer
/// than `dead_after`. Returns when the relay is declared dead.
pub async fn relay_ping_loop(relay: Arc<Relay>, every: Duration, dead_after: Duration) {
    let mut ticker = interval(every.max(Duration::from_millis(10)));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.tick().await;
    loop {
        ticker.tick().await;
        let silent = relay.last_seen_age();
        if silent > dead_after {
            tracing::warn!(
                client_id = %relay.id,
                silent_ms = silent.as_millis() as u64,
                "Relay unresponsive, closing"
            );
            relay.close();
            return;
        }
        if let Err(e) = relay.send(SessionFrame::Ping) {
            tracing::debug!(client_id = %relay.id, "Ping not queued: {}", e);
        }
    }
}
