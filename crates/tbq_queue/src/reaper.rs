//! Periodic reaping of dead workers' leases.

use std::sync::Arc;
use std::time::Duration;

use tbq_utils::shutdown::ShutdownReceiver;
use tokio::{task::JoinHandle, time::MissedTickBehavior};

use crate::service::QueueService;

/// Reaps `service` every `interval` until shutdown is signalled.
pub fn spawn_reaper(
    service: Arc<QueueService>,
    interval: Duration,
    mut shutdown: ShutdownReceiver,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticks = tokio::time::interval(interval);
        ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = shutdown.recv_shutdown() => {
                    tracing::debug!("reaper exiting on shutdown");
                    return;
                }
                _ = ticks.tick() => {
                    let requeued = service.reap_dead_workers();
                    if !requeued.is_empty() {
                        tracing::info!(?requeued, "reaper requeued buckets");
                    }
                }
            }
        }
    })
}
