//! Proactive background lease refresh
//!
//! Spawns a periodic task that runs `PoolManager::refresh_all`, so requests
//! almost never find a credential without a live lease. The task runs
//! independently of the request path and stops when its token is cancelled.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::pool::PoolManager;

/// Spawn a background task that refreshes expiring leases every `interval`.
///
/// The first pass happens one full `interval` after spawning; the caller runs
/// the startup pass itself. Returns a `JoinHandle` that completes once
/// `cancel` fires.
pub fn spawn_refresh_task(
    pool: Arc<PoolManager>,
    interval: Duration,
    cancel: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // Skip the immediate first tick
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("refresh task stopped");
                    break;
                }
                _ = ticker.tick() => {
                    debug!("refresh cycle starting");
                    pool.refresh_all().await;
                }
            }
        }
    })
}
