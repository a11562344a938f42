//! Proactive expiry sweep.
//!
//! Lazy expiry alone leaves never-read keys resident until LRU pressure
//! pushes them out. The sweep task purges them on a fixed interval and stops
//! when the shutdown signal flips.

use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::{interval, MissedTickBehavior};

use crate::hot_cache::HotCache;

/// Anything with expired entries to purge.
pub trait Sweepable: Send + Sync {
    fn name(&self) -> &str;

    /// Remove expired entries, returning how many were removed.
    fn purge_expired(&self) -> usize;
}

impl<K, V> Sweepable for HotCache<K, V>
where
    K: Hash + Eq + Clone + Send,
    V: Clone + Send,
{
    fn name(&self) -> &str {
        HotCache::name(self)
    }

    fn purge_expired(&self) -> usize {
        HotCache::purge_expired(self)
    }
}

/// Sweep every cache in `caches` once. Returns the total purged.
pub fn sweep_all(caches: &[Arc<dyn Sweepable>]) -> usize {
    caches
        .iter()
        .map(|cache| {
            let purged = cache.purge_expired();
            if purged > 0 {
                tracing::debug!(cache = cache.name(), purged, "Purged expired cache entries");
            }
            purged
        })
        .sum()
}

/// Background task that purges expired entries from `caches` every
/// `sweep_interval` until shutdown. Returns the total number purged.
pub async fn expiry_sweep_task(
    caches: Vec<Arc<dyn Sweepable>>,
    sweep_interval: Duration,
    mut shutdown_rx: watch::Receiver<bool>,
) -> u64 {
    let mut ticker = interval(sweep_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    // The first tick completes immediately; nothing has expired yet.
    ticker.tick().await;

    tracing::info!(
        caches = caches.len(),
        sweep_interval_ms = sweep_interval.as_millis() as u64,
        "Cache expiry sweep started"
    );

    let mut total: u64 = 0;
    loop {
        tokio::select! {
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    break;
                }
            }
            _ = ticker.tick() => {
                total += sweep_all(&caches) as u64;
            }
        }
    }

    tracing::info!(purged_total = total, "Cache expiry sweep stopped");
    total
}
