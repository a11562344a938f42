//! Application context.
//!
//! Every layer component is constructed exactly once here and shared by
//! handle. The context also owns the background timers and runs the
//! graceful shutdown sequence.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use ballast_cache::{expiry_sweep_task, CacheStats, HotCache, Sweepable};
use ballast_core::{
    lock_unpoisoned, system_clock, CircuitState, Dependency, DocumentKey, FieldPatch,
    HealthCheck, HealthStatus, SharedClock,
};
use ballast_geo::{NearbyEntity, SpatialIndex, SpatialStats};
use ballast_resilience::{AdmissionControl, AdmissionStats, BreakerRegistry, BreakerSnapshot};
use ballast_writes::{
    BatchWriter, BatchWriterStats, CoalescerStats, DocumentStore, WriteCoalescer, WriteQueue,
    WriteQueueStats, WriteRouter,
};
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::config::LayerConfig;
use crate::error::{ApiError, ApiResult};
use crate::events::{AnalyticsEvent, StoreEventSink};
use crate::jobs::{spatial_prune_task, SpatialPruneConfig};
use crate::telemetry::LayerMetrics;

/// Cache of nearby-supplier query results, keyed by rounded query.
pub type NearbyCache = HotCache<String, Vec<NearbyEntity>>;

// ============================================================================
// SNAPSHOTS AND REPORTS
// ============================================================================

/// Stats of every component at one point in time.
#[derive(Debug, Clone, Serialize)]
pub struct LayerSnapshot {
    pub uptime_secs: u64,
    pub admission: AdmissionStats,
    pub breakers: Vec<BreakerSnapshot>,
    pub caches: Vec<CacheStats>,
    pub coalescer: CoalescerStats,
    pub batch_writer: BatchWriterStats,
    pub queues: Vec<WriteQueueStats>,
    pub spatial: SpatialStats,
}

/// Folded component health.
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub uptime_secs: u64,
    pub checks: Vec<HealthCheck>,
}

/// What the shutdown sequence managed to do.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ShutdownReport {
    /// Coalesced writes handed to the batch writer
    pub coalesced_writes: usize,
    /// Operations committed by the final batch writer flush
    pub ops_committed: usize,
    /// Operations the final batch writer flush could not commit
    pub ops_failed: usize,
    /// Events processed by the final queue drain
    pub events_processed: usize,
    /// Events dead-lettered by the final queue drain
    pub events_failed: usize,
    /// The drain did not finish within the timeout
    pub timed_out: bool,
    /// Background tasks that had to be aborted
    pub aborted_tasks: usize,
    pub elapsed_ms: u64,
}

struct BackgroundTask {
    name: &'static str,
    handle: JoinHandle<()>,
}

// ============================================================================
// CONTEXT
// ============================================================================

pub struct AppContext {
    pub config: LayerConfig,
    pub clock: SharedClock,
    pub admission: AdmissionControl,
    pub breakers: BreakerRegistry,
    pub store: Arc<dyn DocumentStore>,
    /// Read-through cache of store documents
    pub documents: Arc<HotCache<DocumentKey, FieldPatch>>,
    pub nearby: Arc<NearbyCache>,
    pub coalescer: Arc<WriteCoalescer>,
    pub batch_writer: Arc<BatchWriter>,
    pub writes: WriteRouter,
    pub events: Arc<WriteQueue<AnalyticsEvent>>,
    /// Live supplier positions
    pub suppliers: Arc<SpatialIndex>,
    pub metrics: LayerMetrics,
    shutdown_tx: watch::Sender<bool>,
    tasks: Mutex<Vec<BackgroundTask>>,
    shutting_down: AtomicBool,
    started_at: Instant,
}

impl AppContext {
    /// Build the layer over `store` on the system clock.
    pub fn new(config: LayerConfig, store: Arc<dyn DocumentStore>) -> ApiResult<Arc<Self>> {
        Self::with_clock(config, store, system_clock())
    }

    /// Build the layer reading time from `clock`.
    pub fn with_clock(
        config: LayerConfig,
        store: Arc<dyn DocumentStore>,
        clock: SharedClock,
    ) -> ApiResult<Arc<Self>> {
        config
            .validate()
            .map_err(|e| ApiError::internal_error(format!("Invalid configuration: {}", e)))?;

        let admission = AdmissionControl::with_clock(config.admission.clone(), clock.clone());
        let breakers = BreakerRegistry::with_clock(|dep| config.breaker(dep), clock.clone());
        let store_breaker = breakers.get(Dependency::BackingStore);

        let documents = Arc::new(HotCache::with_clock("documents", &config.cache, clock.clone()));
        let nearby = Arc::new(HotCache::with_clock(
            "nearby_suppliers",
            &config.nearby_cache,
            clock.clone(),
        ));

        let coalescer = Arc::new(WriteCoalescer::with_clock(
            "documents",
            config.coalescer.clone(),
            clock.clone(),
        ));
        let batch_writer = Arc::new(BatchWriter::new(
            config.batch_writer.clone(),
            Arc::clone(&store),
            Arc::clone(&store_breaker),
        ));
        coalescer.on_flush(batch_writer.clone());
        let committed = Arc::clone(&documents);
        batch_writer.on_commit(move |ops| {
            for op in ops {
                committed.delete(&op.key);
            }
        });

        let writes = WriteRouter::new(
            Arc::clone(&store),
            Arc::clone(&store_breaker),
            Arc::clone(&coalescer),
        );

        let events = Arc::new(WriteQueue::with_clock(
            "analytics_events",
            config.events_queue.clone(),
            clock.clone(),
        ));
        events.on_process(StoreEventSink::new(Arc::clone(&store), store_breaker));
        events.on_dead_letter(|event: AnalyticsEvent, err| {
            tracing::warn!(
                event_id = %event.id,
                event_name = %event.name,
                error = %err,
                "Analytics event dropped after retries"
            );
        });

        let suppliers = Arc::new(SpatialIndex::with_clock(
            "suppliers",
            config.spatial.clone(),
            clock.clone(),
        )?);

        let metrics = LayerMetrics::new()?;
        let (shutdown_tx, _) = watch::channel(false);

        Ok(Arc::new(Self {
            config,
            clock,
            admission,
            breakers,
            store,
            documents,
            nearby,
            coalescer,
            batch_writer,
            writes,
            events,
            suppliers,
            metrics,
            shutdown_tx,
            tasks: Mutex::new(Vec::new()),
            shutting_down: AtomicBool::new(false),
            started_at: Instant::now(),
        }))
    }

    pub fn uptime(&self) -> Duration {
        self.started_at.elapsed()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::Acquire)
    }

    // ------------------------------------------------------------------------
    // Background tasks
    // ------------------------------------------------------------------------

    /// Spawn every background timer. Calling it again is a no-op.
    pub fn start(&self) {
        let mut tasks = lock_unpoisoned(&self.tasks);
        if !tasks.is_empty() {
            return;
        }

        tasks.push(BackgroundTask {
            name: "coalescer",
            handle: tokio::spawn(Arc::clone(&self.coalescer).run()),
        });
        tasks.push(BackgroundTask {
            name: "batch_writer",
            handle: tokio::spawn(Arc::clone(&self.batch_writer).run()),
        });
        tasks.push(BackgroundTask {
            name: "events_queue",
            handle: tokio::spawn(Arc::clone(&self.events).run()),
        });

        let documents: Arc<dyn Sweepable> = self.documents.clone();
        let nearby: Arc<dyn Sweepable> = self.nearby.clone();
        let sweep = expiry_sweep_task(
            vec![documents, nearby],
            self.config.cache.sweep_interval,
            self.shutdown_tx.subscribe(),
        );
        tasks.push(BackgroundTask {
            name: "cache_sweep",
            handle: tokio::spawn(async move {
                let purged = sweep.await;
                tracing::debug!(purged, "Cache sweep finished");
            }),
        });

        let prune = spatial_prune_task(
            Arc::clone(&self.suppliers),
            SpatialPruneConfig::for_max_age(self.config.spatial_stale_after),
            self.shutdown_tx.subscribe(),
        );
        tasks.push(BackgroundTask {
            name: "spatial_prune",
            handle: tokio::spawn(async move {
                prune.await;
            }),
        });

        tracing::info!(tasks = tasks.len(), "Background tasks started");
    }

    fn stop_timers(&self) {
        self.coalescer.stop();
        self.batch_writer.stop();
        self.events.stop();
        self.shutdown_tx.send_replace(true);
    }

    // ------------------------------------------------------------------------
    // Observability
    // ------------------------------------------------------------------------

    pub fn snapshot(&self) -> LayerSnapshot {
        LayerSnapshot {
            uptime_secs: self.uptime().as_secs(),
            admission: self.admission.stats(),
            breakers: self.breakers.snapshots(),
            caches: vec![self.documents.stats(), self.nearby.stats()],
            coalescer: self.coalescer.stats(),
            batch_writer: self.batch_writer.stats(),
            queues: vec![self.events.stats()],
            spatial: self.suppliers.stats(),
        }
    }

    /// Fold component state into a health report.
    ///
    /// An open store breaker makes the layer unhealthy; any other open or
    /// probing breaker, or a full queue, only degrades it.
    pub fn health(&self) -> HealthReport {
        let mut checks = Vec::new();

        for (dependency, breaker) in self.breakers.iter() {
            let state = breaker.state();
            let check = match (state, dependency) {
                (CircuitState::Closed, _) => HealthCheck::healthy(dependency.as_str()),
                (CircuitState::Open, Dependency::BackingStore) => {
                    HealthCheck::unhealthy(dependency.as_str(), "circuit open")
                }
                (CircuitState::Open, _) => HealthCheck::degraded(dependency.as_str(), "circuit open"),
                (CircuitState::HalfOpen, _) => {
                    HealthCheck::degraded(dependency.as_str(), "circuit probing recovery")
                }
            };
            checks.push(check.with_metadata("state", serde_json::json!(state.as_str())));
        }

        let queue = self.events.stats();
        let queue_check = if queue.depth + queue.in_flight >= queue.max_size {
            HealthCheck::degraded(queue.name.clone(), "queue full")
        } else {
            HealthCheck::healthy(queue.name.clone())
        };
        checks.push(queue_check.with_metadata("depth", serde_json::json!(queue.depth)));

        if self.is_shutting_down() {
            checks.push(HealthCheck::unhealthy("lifecycle", "shutting down"));
        }

        let status = checks
            .iter()
            .fold(HealthStatus::Healthy, |acc, check| acc.worst(check.status));

        HealthReport {
            status,
            uptime_secs: self.uptime().as_secs(),
            checks,
        }
    }

    // ------------------------------------------------------------------------
    // Shutdown
    // ------------------------------------------------------------------------

    /// Drain buffered writes, then stop every timer.
    ///
    /// Order: coalescer, batch writer, queues, timers. A timer may be holding
    /// a batch while the first drain runs, so once the timers have exited the
    /// drain runs again to pick up anything they handed back. Both passes are
    /// bounded by `timeout`; whatever is still running after it is aborted.
    pub async fn shutdown(&self, timeout: Duration) -> ShutdownReport {
        self.shutting_down.store(true, Ordering::Release);
        let started = Instant::now();
        let deadline = tokio::time::Instant::now() + timeout;
        let mut report = ShutdownReport::default();

        tracing::info!(timeout_ms = timeout.as_millis() as u64, "Shutdown started");

        let drained = tokio::time::timeout_at(deadline, self.drain(&mut report)).await;
        report.timed_out = drained.is_err();
        if report.timed_out {
            tracing::error!("Shutdown drain timed out, forcing exit");
        }

        self.stop_timers();

        let tasks = std::mem::take(&mut *lock_unpoisoned(&self.tasks));
        for task in tasks {
            let BackgroundTask { name, mut handle } = task;
            match tokio::time::timeout_at(deadline, &mut handle).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    tracing::error!(task = name, error = %e, "Background task ended abnormally");
                }
                Err(_) => {
                    handle.abort();
                    report.aborted_tasks += 1;
                    tracing::warn!(task = name, "Background task aborted");
                }
            }
        }

        if !report.timed_out {
            let settled = tokio::time::timeout_at(deadline, self.drain(&mut report)).await;
            if settled.is_err() {
                report.timed_out = true;
                tracing::error!("Final drain after timer stop timed out");
            }
        }

        report.elapsed_ms = started.elapsed().as_millis() as u64;
        tracing::info!(
            coalesced_writes = report.coalesced_writes,
            ops_committed = report.ops_committed,
            ops_failed = report.ops_failed,
            events_processed = report.events_processed,
            events_failed = report.events_failed,
            timed_out = report.timed_out,
            aborted_tasks = report.aborted_tasks,
            elapsed_ms = report.elapsed_ms,
            "Shutdown complete"
        );
        report
    }

    async fn drain(&self, report: &mut ShutdownReport) {
        match self.coalescer.flush_all().await {
            Ok(flushed) => report.coalesced_writes += flushed,
            Err(e) => tracing::error!(error = %e, "Final coalescer flush failed"),
        }

        let summary = self.batch_writer.flush().await;
        report.ops_committed += summary.committed;
        report.ops_failed += summary.failed;

        let outcome = self.events.flush().await;
        report.events_processed += outcome.processed;
        report.events_failed += outcome.failed;
    }
}

impl std::fmt::Debug for AppContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppContext")
            .field("coalescer", &self.coalescer)
            .field("batch_writer", &self.batch_writer)
            .field("events", &self.events)
            .field("suppliers", &self.suppliers)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ballast_core::ManualClock;
    use ballast_test_utils::FlakyStore;
    use ballast_writes::InMemoryStore;
    use chrono::Utc;
    use serde_json::json;

    fn context_over(store: Arc<dyn DocumentStore>) -> Arc<AppContext> {
        AppContext::with_clock(LayerConfig::default(), store, ManualClock::shared())
            .expect("context")
    }

    #[tokio::test]
    async fn test_shutdown_drains_coalesced_writes_to_store() {
        let store = Arc::new(InMemoryStore::new());
        let ctx = context_over(store.clone());

        let key = DocumentKey::new("suppliers", "s-1");
        ctx.coalescer.write_key(key.clone(), FieldPatch::new().with("lat", 1.0));
        ctx.coalescer.write_key(key.clone(), FieldPatch::new().with("lng", 2.0));
        assert!(ctx.events.enqueue(AnalyticsEvent::new("opened", json!({}), Utc::now())));

        let report = ctx.shutdown(Duration::from_secs(5)).await;

        assert!(!report.timed_out);
        assert_eq!(report.coalesced_writes, 1);
        assert_eq!(report.ops_committed, 1);
        assert_eq!(report.events_processed, 1);
        let doc = store.document(&key).expect("persisted");
        assert_eq!(doc.get("lat"), Some(&json!(1.0)));
        assert_eq!(doc.get("lng"), Some(&json!(2.0)));
        assert_eq!(ctx.events.depth(), 0);
    }

    #[tokio::test]
    async fn test_shutdown_stops_background_tasks() {
        let ctx = context_over(Arc::new(InMemoryStore::new()));
        ctx.start();
        ctx.start();
        assert_eq!(lock_unpoisoned(&ctx.tasks).len(), 5);

        let report = ctx.shutdown(Duration::from_secs(5)).await;
        assert_eq!(report.aborted_tasks, 0);
        assert!(lock_unpoisoned(&ctx.tasks).is_empty());
    }

    #[tokio::test]
    async fn test_shutdown_settles_batch_held_by_queue_timer() {
        let store = Arc::new(FlakyStore::new());
        store.set_latency(Duration::from_millis(200));
        store.fail_next(1);
        let mut config = LayerConfig::default();
        config.events_queue = config
            .events_queue
            .clone()
            .with_flush_interval(Duration::from_millis(20));
        let ctx = AppContext::new(config, store.clone()).expect("context");
        assert!(ctx.events.enqueue(AnalyticsEvent::new("opened", json!({}), Utc::now())));

        ctx.start();
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(ctx.events.in_flight(), 1);

        let report = ctx.shutdown(Duration::from_secs(5)).await;

        assert!(!report.timed_out);
        assert_eq!(report.events_processed + report.events_failed, 1);
        assert_eq!(ctx.events.depth(), 0);
        assert_eq!(ctx.events.in_flight(), 0);
        assert_eq!(store.inner().len(), 1);
    }

    #[tokio::test]
    async fn test_shutdown_is_bounded_by_timeout() {
        let store = Arc::new(FlakyStore::new());
        store.set_latency(Duration::from_secs(30));
        let mut config = LayerConfig::default();
        config.breakers.insert(
            Dependency::BackingStore,
            ballast_resilience::CircuitBreakerConfig::default()
                .with_call_timeout(Duration::from_secs(60)),
        );
        let ctx = AppContext::new(config, store).expect("context");
        ctx.batch_writer
            .update("orders", "o-1", FieldPatch::new().with("status", "packed"));

        let started = Instant::now();
        let report = ctx.shutdown(Duration::from_millis(100)).await;

        assert!(report.timed_out);
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_health_reflects_store_breaker() {
        let mut config = LayerConfig::default();
        config.breakers.insert(
            Dependency::BackingStore,
            ballast_resilience::CircuitBreakerConfig::default().with_failure_threshold(1),
        );
        let store = Arc::new(FlakyStore::new());
        store.set_down(true);
        let ctx = AppContext::with_clock(config, store, ManualClock::shared()).expect("context");
        assert_eq!(ctx.health().status, HealthStatus::Healthy);

        let key = DocumentKey::new("orders", "o-1");
        let _ = ctx.writes.read_direct(&key).await;

        let report = ctx.health();
        assert_eq!(report.status, HealthStatus::Unhealthy);
        assert!(report
            .checks
            .iter()
            .any(|c| c.component == "backing_store" && c.status == HealthStatus::Unhealthy));
    }

    #[tokio::test]
    async fn test_open_payment_breaker_only_degrades() {
        let ctx = context_over(Arc::new(InMemoryStore::new()));
        let breaker = ctx.breakers.get(Dependency::PaymentGateway);
        for _ in 0..breaker.config().failure_threshold {
            let _: Result<(), ballast_core::BallastError> = breaker
                .execute(|| async { Err(ballast_core::BallastError::call_failed("payment_gateway", "declined")) })
                .await;
        }
        assert_eq!(ctx.health().status, HealthStatus::Degraded);
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let mut config = LayerConfig::default();
        config.cache.max_size = 0;
        let result = AppContext::new(config, Arc::new(InMemoryStore::new()));
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_snapshot_covers_every_component() {
        let ctx = context_over(Arc::new(InMemoryStore::new()));
        let snapshot = ctx.snapshot();
        assert_eq!(snapshot.breakers.len(), Dependency::ALL.len());
        assert_eq!(snapshot.caches.len(), 2);
        assert_eq!(snapshot.queues.len(), 1);
        assert_eq!(snapshot.spatial.name, "suppliers");
    }
}
