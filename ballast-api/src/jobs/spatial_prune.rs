//! Spatial Prune Background Task
//!
//! Suppliers report their position every few seconds while online. One that
//! goes offline without saying so would otherwise keep showing up in nearby
//! queries forever. This task removes entries whose last update is older
//! than `max_age`.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use ballast_geo::SpatialIndex;
use tokio::sync::watch;
use tokio::time::{interval, MissedTickBehavior};

use crate::config::DEFAULT_SPATIAL_STALE_AFTER_SECS;

/// Default period between prune passes.
pub const DEFAULT_SPATIAL_PRUNE_INTERVAL_SECS: u64 = 30;

// ============================================================================
// CONFIGURATION
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpatialPruneConfig {
    /// How often to look for stale entries (default: 30 seconds)
    pub check_interval: Duration,

    /// Entries not updated for longer than this are removed
    /// (default: 5 minutes)
    pub max_age: Duration,
}

impl Default for SpatialPruneConfig {
    fn default() -> Self {
        Self {
            check_interval: Duration::from_secs(DEFAULT_SPATIAL_PRUNE_INTERVAL_SECS),
            max_age: Duration::from_secs(DEFAULT_SPATIAL_STALE_AFTER_SECS),
        }
    }
}

impl SpatialPruneConfig {
    /// Prune every `max_age / 10`, bounded to [1s, 30s].
    pub fn for_max_age(max_age: Duration) -> Self {
        let check_interval = (max_age / 10).clamp(
            Duration::from_secs(1),
            Duration::from_secs(DEFAULT_SPATIAL_PRUNE_INTERVAL_SECS),
        );
        Self {
            check_interval,
            max_age,
        }
    }
}

// ============================================================================
// METRICS
// ============================================================================

#[derive(Debug, Default)]
pub struct SpatialPruneMetrics {
    /// Entries removed since startup
    pub entries_pruned: AtomicU64,

    /// Prune passes completed
    pub prune_cycles: AtomicU64,
}

impl SpatialPruneMetrics {
    pub fn new() -> Self {
        Self::default()
    }
}

// ============================================================================
// BACKGROUND TASK
// ============================================================================

/// Run prune passes over `index` until the shutdown signal flips.
///
/// Returns the metrics collected during the task's lifetime.
pub async fn spatial_prune_task(
    index: Arc<SpatialIndex>,
    config: SpatialPruneConfig,
    mut shutdown_rx: watch::Receiver<bool>,
) -> Arc<SpatialPruneMetrics> {
    let metrics = Arc::new(SpatialPruneMetrics::new());

    let mut prune_interval = interval(config.check_interval);
    prune_interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

    tracing::info!(
        index = index.name(),
        check_interval_secs = config.check_interval.as_secs(),
        max_age_secs = config.max_age.as_secs(),
        "Spatial prune task started"
    );

    loop {
        if *shutdown_rx.borrow() {
            break;
        }
        tokio::select! {
            changed = shutdown_rx.changed() => {
                if changed.is_err() {
                    break;
                }
            }
            _ = prune_interval.tick() => {
                prune_once(&index, &config, &metrics);
            }
        }
    }

    tracing::info!(
        entries_pruned = metrics.entries_pruned.load(Ordering::Relaxed),
        prune_cycles = metrics.prune_cycles.load(Ordering::Relaxed),
        "Spatial prune task completed"
    );

    metrics
}

fn prune_once(index: &SpatialIndex, config: &SpatialPruneConfig, metrics: &SpatialPruneMetrics) {
    metrics.prune_cycles.fetch_add(1, Ordering::Relaxed);
    let pruned = index.prune_stale(config.max_age);
    if pruned > 0 {
        metrics
            .entries_pruned
            .fetch_add(pruned as u64, Ordering::Relaxed);
        tracing::info!(index = index.name(), pruned, remaining = index.size(), "Pruned stale positions");
    } else {
        tracing::trace!(index = index.name(), "Spatial prune cycle found nothing stale");
    }
}
