//! Batched submission of write operations.
//!
//! `set`/`update` only buffer. The buffer is submitted in chunks of at most
//! `max_batch_size` operations when it fills up or when the flush timer
//! fires, through the store's circuit breaker and an optional store-wide
//! write throttle. Submission failures are logged and counted; they never
//! reach the code that buffered the write. A registered commit hook sees
//! every chunk the store accepted.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use ballast_core::constants::{
    DEFAULT_BATCH_FLUSH_INTERVAL_MS, DEFAULT_STORE_WRITES_PER_SEC, STORE_MAX_BATCH_OPS,
    STORE_THROTTLE_KEY,
};
use ballast_core::{lock_unpoisoned, BallastResult, DocumentKey, FieldPatch, WriteOp};
use ballast_resilience::{CircuitBreaker, RateLimiter, RateLimiterConfig};
use serde::Serialize;
use tokio::sync::{watch, Notify};
use tokio::time::{interval, MissedTickBehavior};

use crate::coalescer::{FlushHandler, PendingWrite};
use crate::store::DocumentStore;

// ============================================================================
// CONFIGURATION
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub struct BatchWriterConfig {
    /// Operations per submitted batch, clamped to the store ceiling
    pub max_batch_size: usize,
    pub flush_interval: Duration,
    /// Store operations per second; `None` disables the throttle
    pub store_writes_per_sec: Option<f64>,
}

impl Default for BatchWriterConfig {
    fn default() -> Self {
        Self {
            max_batch_size: STORE_MAX_BATCH_OPS,
            flush_interval: Duration::from_millis(DEFAULT_BATCH_FLUSH_INTERVAL_MS),
            store_writes_per_sec: Some(DEFAULT_STORE_WRITES_PER_SEC),
        }
    }
}

impl BatchWriterConfig {
    /// # Environment Variables
    /// - `BALLAST_BATCH_MAX_SIZE`: Operations per batch (default: 500)
    /// - `BALLAST_BATCH_FLUSH_INTERVAL_MS`: Flush timer (default: 1000)
    /// - `BALLAST_STORE_WRITES_PER_SEC`: Store write ceiling, `0` disables (default: 1000)
    pub fn from_env() -> Self {
        let max_batch_size = std::env::var("BALLAST_BATCH_MAX_SIZE")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(STORE_MAX_BATCH_OPS);

        let flush_interval = Duration::from_millis(
            std::env::var("BALLAST_BATCH_FLUSH_INTERVAL_MS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(DEFAULT_BATCH_FLUSH_INTERVAL_MS),
        );

        let store_writes_per_sec = std::env::var("BALLAST_STORE_WRITES_PER_SEC")
            .ok()
            .and_then(|s| s.parse::<f64>().ok())
            .unwrap_or(DEFAULT_STORE_WRITES_PER_SEC);

        Self {
            max_batch_size,
            flush_interval,
            store_writes_per_sec: (store_writes_per_sec > 0.0).then_some(store_writes_per_sec),
        }
    }

    pub fn with_max_batch_size(mut self, size: usize) -> Self {
        self.max_batch_size = size;
        self
    }

    pub fn with_flush_interval(mut self, interval: Duration) -> Self {
        self.flush_interval = interval;
        self
    }

    pub fn with_store_writes_per_sec(mut self, rate: Option<f64>) -> Self {
        self.store_writes_per_sec = rate;
        self
    }
}

/// Receives each chunk of operations once the store has committed it.
pub type CommitHook = Arc<dyn Fn(&[WriteOp]) + Send + Sync>;

// ============================================================================
// STATS
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BatchWriterStats {
    pub buffered: usize,
    pub batches_committed: u64,
    pub ops_committed: u64,
    pub ops_failed: u64,
}

/// Result of one `flush`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushSummary {
    pub batches: usize,
    pub committed: usize,
    pub failed: usize,
}

// ============================================================================
// WRITER
// ============================================================================

pub struct BatchWriter {
    config: BatchWriterConfig,
    batch_size: usize,
    store: Arc<dyn DocumentStore>,
    breaker: Arc<CircuitBreaker>,
    throttle: Option<RateLimiter>,
    buffer: Mutex<Vec<WriteOp>>,
    on_commit: RwLock<Option<CommitHook>>,
    full: Notify,
    stop_tx: watch::Sender<bool>,
    batches_committed: AtomicU64,
    ops_committed: AtomicU64,
    ops_failed: AtomicU64,
}

impl BatchWriter {
    pub fn new(
        config: BatchWriterConfig,
        store: Arc<dyn DocumentStore>,
        breaker: Arc<CircuitBreaker>,
    ) -> Self {
        let batch_size = config
            .max_batch_size
            .clamp(1, store.max_batch_ops().max(1));

        // Bucket capacity of one full batch keeps a whole chunk chargeable
        let throttle = config.store_writes_per_sec.map(|rate| {
            RateLimiter::new(
                "store_writes",
                RateLimiterConfig::new(batch_size as u32, rate).with_max_clients(1),
            )
        });

        let (stop_tx, _) = watch::channel(false);
        Self {
            config,
            batch_size,
            store,
            breaker,
            throttle,
            buffer: Mutex::new(Vec::new()),
            on_commit: RwLock::new(None),
            full: Notify::new(),
            stop_tx,
            batches_committed: AtomicU64::new(0),
            ops_committed: AtomicU64::new(0),
            ops_failed: AtomicU64::new(0),
        }
    }

    /// Register the hook called after each committed chunk.
    pub fn on_commit<F>(&self, hook: F)
    where
        F: Fn(&[WriteOp]) + Send + Sync + 'static,
    {
        let mut slot = self.on_commit.write().unwrap_or_else(|e| e.into_inner());
        *slot = Some(Arc::new(hook));
    }

    /// Buffer a field merge into `collection/id`.
    pub fn update(&self, collection: &str, id: &str, data: FieldPatch) {
        self.enqueue(WriteOp::update(DocumentKey::new(collection, id), data));
    }

    /// Buffer a full replacement of `collection/id`.
    pub fn set(&self, collection: &str, id: &str, data: FieldPatch) {
        self.enqueue(WriteOp::set(DocumentKey::new(collection, id), data));
    }

    pub fn enqueue(&self, op: WriteOp) {
        let buffered = {
            let mut buffer = lock_unpoisoned(&self.buffer);
            buffer.push(op);
            buffer.len()
        };
        if buffered >= self.batch_size {
            self.full.notify_one();
        }
    }

    pub fn buffered(&self) -> usize {
        lock_unpoisoned(&self.buffer).len()
    }

    /// Submit everything buffered right now and wait for it.
    pub async fn flush(&self) -> FlushSummary {
        let ops = std::mem::take(&mut *lock_unpoisoned(&self.buffer));
        let mut summary = FlushSummary::default();
        let hook = self
            .on_commit
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone();

        for chunk in ops.chunks(self.batch_size) {
            self.wait_for_store_capacity(chunk.len()).await;

            let result: BallastResult<()> = self
                .breaker
                .execute(|| self.store.commit_batch(chunk))
                .await;

            summary.batches += 1;
            match result {
                Ok(()) => {
                    summary.committed += chunk.len();
                    self.batches_committed.fetch_add(1, Ordering::Relaxed);
                    self.ops_committed
                        .fetch_add(chunk.len() as u64, Ordering::Relaxed);
                    if let Some(hook) = &hook {
                        hook(chunk);
                    }
                }
                Err(e) => {
                    summary.failed += chunk.len();
                    self.ops_failed
                        .fetch_add(chunk.len() as u64, Ordering::Relaxed);
                    tracing::error!(
                        ops = chunk.len(),
                        error = %e,
                        "Batch commit failed, dropping batch"
                    );
                }
            }
        }

        if summary.batches > 0 {
            tracing::debug!(
                batches = summary.batches,
                committed = summary.committed,
                failed = summary.failed,
                "Batch writer flushed"
            );
        }
        summary
    }

    async fn wait_for_store_capacity(&self, ops: usize) {
        let Some(throttle) = &self.throttle else {
            return;
        };
        loop {
            let decision = throttle.consume_n(STORE_THROTTLE_KEY, ops as u32);
            if decision.allowed {
                return;
            }
            tracing::trace!(
                retry_after_ms = decision.retry_after_ms,
                "Store write ceiling reached, delaying batch"
            );
            tokio::time::sleep(Duration::from_millis(decision.retry_after_ms.max(1))).await;
        }
    }

    pub fn stats(&self) -> BatchWriterStats {
        BatchWriterStats {
            buffered: self.buffered(),
            batches_committed: self.batches_committed.load(Ordering::Relaxed),
            ops_committed: self.ops_committed.load(Ordering::Relaxed),
            ops_failed: self.ops_failed.load(Ordering::Relaxed),
        }
    }

    /// Run the flush timer until [`BatchWriter::stop`] is called. Also
    /// flushes as soon as the buffer reaches a full batch.
    pub async fn run(self: Arc<Self>) {
        let mut stop_rx = self.stop_tx.subscribe();
        let mut ticker = interval(self.config.flush_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        tracing::info!(
            max_batch_size = self.batch_size,
            flush_interval_ms = self.config.flush_interval.as_millis() as u64,
            store_writes_per_sec = ?self.config.store_writes_per_sec,
            "Batch writer started"
        );

        loop {
            if *stop_rx.borrow() {
                break;
            }
            tokio::select! {
                changed = stop_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                _ = ticker.tick() => {
                    self.flush().await;
                }
                _ = self.full.notified() => {
                    self.flush().await;
                }
            }
        }

        let stats = self.stats();
        tracing::info!(
            buffered = stats.buffered,
            batches_committed = stats.batches_committed,
            ops_committed = stats.ops_committed,
            ops_failed = stats.ops_failed,
            "Batch writer stopped"
        );
    }

    /// Halt the flush timer. Buffered writes stay until `flush`.
    pub fn stop(&self) {
        self.stop_tx.send_replace(true);
    }
}

impl std::fmt::Debug for BatchWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatchWriter")
            .field("batch_size", &self.batch_size)
            .field("buffered", &self.buffered())
            .finish()
    }
}

/// Coalesced writes become buffered updates.
#[async_trait]
impl FlushHandler for BatchWriter {
    async fn flush(&self, writes: Vec<PendingWrite>) -> BallastResult<()> {
        for write in writes {
            self.enqueue(WriteOp::update(write.key, write.data));
        }
        Ok(())
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryStore;
    use ballast_core::{BallastError, StoreError};
    use ballast_resilience::CircuitBreakerConfig;
    use serde_json::json;

    struct DownStore;

    #[async_trait]
    impl DocumentStore for DownStore {
        async fn get(&self, _key: &DocumentKey) -> BallastResult<Option<FieldPatch>> {
            Ok(None)
        }
        async fn write(&self, _op: &WriteOp) -> BallastResult<()> {
            Err(StoreError::Unavailable { reason: "down".into() }.into())
        }
        async fn commit_batch(&self, _ops: &[WriteOp]) -> BallastResult<()> {
            Err(BallastError::Store(StoreError::Unavailable {
                reason: "down".into(),
            }))
        }
    }

    fn writer(store: Arc<dyn DocumentStore>, config: BatchWriterConfig) -> BatchWriter {
        let breaker = Arc::new(CircuitBreaker::new(
            "backing_store",
            CircuitBreakerConfig::default(),
        ));
        BatchWriter::new(config, store, breaker)
    }

    #[tokio::test]
    async fn test_flush_splits_into_store_sized_batches() {
        let store = Arc::new(InMemoryStore::new());
        let writer = writer(
            store.clone(),
            BatchWriterConfig::default().with_store_writes_per_sec(None),
        );

        for i in 0..1_200 {
            writer.set("events", &i.to_string(), FieldPatch::new().with("n", i));
        }
        let summary = writer.flush().await;

        assert_eq!(summary.batches, 3);
        assert_eq!(summary.committed, 1_200);
        assert_eq!(store.batches(), 3);
        assert_eq!(store.len(), 1_200);
        assert_eq!(writer.buffered(), 0);
    }

    #[tokio::test]
    async fn test_commit_hook_sees_only_committed_chunks() {
        let store = Arc::new(InMemoryStore::new());
        let writer = writer(
            store.clone(),
            BatchWriterConfig::default()
                .with_max_batch_size(2)
                .with_store_writes_per_sec(None),
        );
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        writer.on_commit(move |ops| {
            lock_unpoisoned(&sink).extend(ops.iter().map(|op| op.key.clone()));
        });

        for i in 0..3 {
            writer.update("orders", &i.to_string(), FieldPatch::new().with("n", i));
        }
        writer.flush().await;
        assert_eq!(lock_unpoisoned(&seen).len(), 3);

        let down = writer_over_down_store();
        let failed = Arc::new(Mutex::new(Vec::new()));
        let sink = failed.clone();
        down.on_commit(move |ops| lock_unpoisoned(&sink).extend(ops.iter().cloned()));
        down.update("orders", "o-1", FieldPatch::new().with("n", 1));
        assert_eq!(down.flush().await.failed, 1);
        assert!(lock_unpoisoned(&failed).is_empty());
    }

    fn writer_over_down_store() -> BatchWriter {
        writer(
            Arc::new(DownStore),
            BatchWriterConfig::default().with_store_writes_per_sec(None),
        )
    }

    #[tokio::test]
    async fn test_oversized_config_is_clamped_to_store_limit() {
        let store = Arc::new(InMemoryStore::new());
        let writer = writer(
            store.clone(),
            BatchWriterConfig::default()
                .with_max_batch_size(10_000)
                .with_store_writes_per_sec(None),
        );
        for i in 0..501 {
            writer.update("c", &i.to_string(), FieldPatch::new().with("x", 1));
        }
        assert_eq!(writer.flush().await.failed, 0);
        assert_eq!(store.batches(), 2);
    }

    #[tokio::test]
    async fn test_update_merges_into_existing_document() {
        let store = Arc::new(InMemoryStore::new());
        let writer = writer(store.clone(), BatchWriterConfig::default());

        writer.set("orders", "o1", FieldPatch::new().with("status", "new").with("total", 5));
        writer.update("orders", "o1", FieldPatch::new().with("status", "paid"));
        writer.flush().await;

        let doc = store.document(&DocumentKey::new("orders", "o1")).expect("doc");
        assert_eq!(doc.get("status"), Some(&json!("paid")));
        assert_eq!(doc.get("total"), Some(&json!(5)));
    }

    #[tokio::test]
    async fn test_failures_are_counted_not_thrown() {
        let writer = writer(Arc::new(DownStore), BatchWriterConfig::default());
        writer.update("c", "1", FieldPatch::new().with("x", 1));
        writer.update("c", "2", FieldPatch::new().with("x", 2));

        let summary = writer.flush().await;
        assert_eq!(summary.failed, 2);
        assert_eq!(writer.stats().ops_failed, 2);
        assert_eq!(writer.buffered(), 0);
    }

    #[tokio::test]
    async fn test_throttle_delays_second_batch() {
        let store = Arc::new(InMemoryStore::new());
        let writer = writer(
            store.clone(),
            BatchWriterConfig::default()
                .with_max_batch_size(10)
                .with_store_writes_per_sec(Some(200.0)),
        );
        for i in 0..20 {
            writer.update("c", &i.to_string(), FieldPatch::new().with("x", 1));
        }

        let started = std::time::Instant::now();
        let summary = writer.flush().await;
        // Second chunk of 10 needs 10 tokens at 200/s
        assert!(started.elapsed() >= Duration::from_millis(45));
        assert_eq!(summary.committed, 20);
    }

    #[tokio::test]
    async fn test_full_buffer_triggers_flush_before_timer() {
        let store = Arc::new(InMemoryStore::new());
        let writer = Arc::new(writer(
            store.clone(),
            BatchWriterConfig::default()
                .with_max_batch_size(5)
                .with_flush_interval(Duration::from_secs(3600))
                .with_store_writes_per_sec(None),
        ));
        let handle = tokio::spawn(Arc::clone(&writer).run());
        // Let the first immediate tick pass
        tokio::time::sleep(Duration::from_millis(20)).await;

        for i in 0..5 {
            writer.update("c", &i.to_string(), FieldPatch::new().with("x", i));
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(store.len(), 5);

        writer.stop();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("stops")
            .expect("no panic");
    }

    #[tokio::test]
    async fn test_acts_as_coalescer_flush_handler() {
        use crate::coalescer::{CoalescerConfig, WriteCoalescer};

        let store = Arc::new(InMemoryStore::new());
        let writer = Arc::new(writer(store.clone(), BatchWriterConfig::default()));
        let coalescer = WriteCoalescer::new("docs", CoalescerConfig::default());
        coalescer.on_flush(writer.clone());

        coalescer.write("suppliers", "s1", FieldPatch::new().with("lat", 1.0));
        coalescer.write("suppliers", "s1", FieldPatch::new().with("lat", 2.0));
        coalescer.flush_all().await.expect("flush");
        writer.flush().await;

        assert_eq!(store.physical_writes(), 1);
        let doc = store.document(&DocumentKey::new("suppliers", "s1")).expect("doc");
        assert_eq!(doc.get("lat"), Some(&json!(2.0)));
    }
}
