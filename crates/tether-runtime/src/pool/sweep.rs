//! Idle-entry sweep task.

use std::sync::Weak;
use std::time::Duration;

use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::PoolInner;

/// Shortest interval between sweeps.
const MIN_INTERVAL: Duration = Duration::from_millis(1);

/// Run sweeps every `interval` until cancelled or the pool is dropped.
pub(super) async fn run(pool: Weak<PoolInner>, token: CancellationToken, interval: Duration) {
    let interval = interval.max(MIN_INTERVAL);
    let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    debug!(interval_secs = interval.as_secs(), "sweep task started");

    loop {
        tokio::select! {
            biased;
            () = token.cancelled() => break,
            _ = ticker.tick() => {}
        }
        let Some(inner) = pool.upgrade() else {
            break;
        };
        let evicted = inner.sweep().await;
        if !evicted.is_empty() {
            info!(evicted = evicted.len(), remaining = inner.entries.len(), "swept idle sessions");
        }
    }

    debug!("sweep task stopped");
}
