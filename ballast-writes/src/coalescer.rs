//! Write coalescing.
//!
//! Logical writes to the same `(collection, doc_id)` are merged field by
//! field, newest value winning, until the entry has been pending for at least
//! the merge window. The window starts at the first write into an entry, so a
//! document under constant churn is still flushed once per window.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use ballast_core::constants::{DEFAULT_COALESCE_FLUSH_INTERVAL_MS, DEFAULT_COALESCE_WINDOW_MS};
use ballast_core::{lock_unpoisoned, system_clock, BallastResult, DocumentKey, FieldPatch, SharedClock};
use serde::Serialize;
use tokio::sync::watch;
use tokio::time::{interval, MissedTickBehavior};

// ============================================================================
// CONFIGURATION
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoalescerConfig {
    /// Minimum age of a pending entry before it is flushed
    pub window: Duration,
    /// Timer period of the flush loop
    pub flush_interval: Duration,
}

impl Default for CoalescerConfig {
    fn default() -> Self {
        Self {
            window: Duration::from_millis(DEFAULT_COALESCE_WINDOW_MS),
            flush_interval: Duration::from_millis(DEFAULT_COALESCE_FLUSH_INTERVAL_MS),
        }
    }
}

impl CoalescerConfig {
    /// # Environment Variables
    /// - `BALLAST_COALESCE_WINDOW_MS`: Merge window (default: 2000)
    /// - `BALLAST_COALESCE_FLUSH_INTERVAL_MS`: Flush timer (default: 1000)
    pub fn from_env() -> Self {
        let window = Duration::from_millis(
            std::env::var("BALLAST_COALESCE_WINDOW_MS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(DEFAULT_COALESCE_WINDOW_MS),
        );

        let flush_interval = Duration::from_millis(
            std::env::var("BALLAST_COALESCE_FLUSH_INTERVAL_MS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(DEFAULT_COALESCE_FLUSH_INTERVAL_MS),
        );

        Self {
            window,
            flush_interval,
        }
    }

    pub fn with_window(mut self, window: Duration) -> Self {
        self.window = window;
        self
    }

    pub fn with_flush_interval(mut self, interval: Duration) -> Self {
        self.flush_interval = interval;
        self
    }
}

// ============================================================================
// TYPES
// ============================================================================

/// A merged, not yet persisted write.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingWrite {
    pub key: DocumentKey,
    pub data: FieldPatch,
    /// When the first write of this entry arrived
    pub merged_at: Instant,
    /// Logical writes folded into this entry
    pub write_count: u32,
}

/// Receives merged writes once their window has elapsed.
#[async_trait]
pub trait FlushHandler: Send + Sync {
    async fn flush(&self, writes: Vec<PendingWrite>) -> BallastResult<()>;
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CoalescerStats {
    pub name: String,
    pub pending: usize,
    pub total_received: u64,
    pub total_flushed: u64,
    pub total_coalesced: u64,
    /// `total_coalesced / total_received`
    pub coalescing_ratio: f64,
    pub flush_failures: u64,
}

// ============================================================================
// COALESCER
// ============================================================================

pub struct WriteCoalescer {
    name: String,
    config: CoalescerConfig,
    pending: Mutex<HashMap<DocumentKey, PendingWrite>>,
    handler: RwLock<Option<Arc<dyn FlushHandler>>>,
    clock: SharedClock,
    stop_tx: watch::Sender<bool>,
    total_received: AtomicU64,
    total_flushed: AtomicU64,
    total_coalesced: AtomicU64,
    flush_failures: AtomicU64,
}

impl WriteCoalescer {
    pub fn new(name: impl Into<String>, config: CoalescerConfig) -> Self {
        Self::with_clock(name, config, system_clock())
    }

    pub fn with_clock(name: impl Into<String>, config: CoalescerConfig, clock: SharedClock) -> Self {
        let (stop_tx, _) = watch::channel(false);
        Self {
            name: name.into(),
            config,
            pending: Mutex::new(HashMap::new()),
            handler: RwLock::new(None),
            clock,
            stop_tx,
            total_received: AtomicU64::new(0),
            total_flushed: AtomicU64::new(0),
            total_coalesced: AtomicU64::new(0),
            flush_failures: AtomicU64::new(0),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Register the handler that receives flushed writes.
    pub fn on_flush(&self, handler: Arc<dyn FlushHandler>) {
        let mut slot = self.handler.write().unwrap_or_else(|e| e.into_inner());
        *slot = Some(handler);
    }

    /// Merge `data` into the pending write for `collection/doc_id`.
    pub fn write(&self, collection: &str, doc_id: &str, data: FieldPatch) {
        self.write_key(DocumentKey::new(collection, doc_id), data);
    }

    pub fn write_key(&self, key: DocumentKey, data: FieldPatch) {
        let now = self.clock.now();
        self.total_received.fetch_add(1, Ordering::Relaxed);

        let mut pending = lock_unpoisoned(&self.pending);
        match pending.get_mut(&key) {
            Some(entry) => {
                entry.data.merge_newer(data);
                entry.write_count = entry.write_count.saturating_add(1);
                self.total_coalesced.fetch_add(1, Ordering::Relaxed);
            }
            None => {
                pending.insert(
                    key.clone(),
                    PendingWrite {
                        key,
                        data,
                        merged_at: now,
                        write_count: 1,
                    },
                );
            }
        }
    }

    /// Flush entries at least one window old. Returns how many were handed
    /// to the handler.
    pub async fn flush(&self) -> BallastResult<usize> {
        let now = self.clock.now();
        let window = self.config.window;
        let due = self.take(|entry| now.saturating_duration_since(entry.merged_at) >= window);
        self.hand_off(due).await
    }

    /// Flush every pending entry regardless of age.
    pub async fn flush_all(&self) -> BallastResult<usize> {
        let all = self.take(|_| true);
        self.hand_off(all).await
    }

    fn take<P>(&self, mut due: P) -> Vec<PendingWrite>
    where
        P: FnMut(&PendingWrite) -> bool,
    {
        let mut pending = lock_unpoisoned(&self.pending);
        let keys: Vec<DocumentKey> = pending
            .values()
            .filter(|entry| due(entry))
            .map(|entry| entry.key.clone())
            .collect();
        keys.iter().filter_map(|key| pending.remove(key)).collect()
    }

    async fn hand_off(&self, writes: Vec<PendingWrite>) -> BallastResult<usize> {
        if writes.is_empty() {
            return Ok(0);
        }

        let handler = self
            .handler
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        let Some(handler) = handler else {
            tracing::warn!(
                coalescer = %self.name,
                count = writes.len(),
                "No flush handler registered, keeping writes pending"
            );
            self.requeue(writes);
            return Ok(0);
        };

        let count = writes.len();
        match handler.flush(writes.clone()).await {
            Ok(()) => {
                self.total_flushed.fetch_add(count as u64, Ordering::Relaxed);
                tracing::debug!(coalescer = %self.name, count, "Flushed coalesced writes");
                Ok(count)
            }
            Err(e) => {
                self.flush_failures.fetch_add(1, Ordering::Relaxed);
                tracing::error!(
                    coalescer = %self.name,
                    count,
                    error = %e,
                    "Flush handler failed, requeueing writes"
                );
                self.requeue(writes);
                Err(e)
            }
        }
    }

    /// Put writes back, underneath anything that arrived in the meantime.
    fn requeue(&self, writes: Vec<PendingWrite>) {
        let mut pending = lock_unpoisoned(&self.pending);
        for write in writes {
            match pending.get_mut(&write.key) {
                Some(newer) => {
                    newer.data.merge_older(write.data);
                    newer.write_count = newer.write_count.saturating_add(write.write_count);
                    newer.merged_at = newer.merged_at.min(write.merged_at);
                }
                None => {
                    pending.insert(write.key.clone(), write);
                }
            }
        }
    }

    pub fn pending_len(&self) -> usize {
        lock_unpoisoned(&self.pending).len()
    }

    /// Snapshot of one pending entry.
    pub fn pending(&self, key: &DocumentKey) -> Option<PendingWrite> {
        lock_unpoisoned(&self.pending).get(key).cloned()
    }

    pub fn coalescing_ratio(&self) -> f64 {
        let received = self.total_received.load(Ordering::Relaxed);
        if received == 0 {
            0.0
        } else {
            self.total_coalesced.load(Ordering::Relaxed) as f64 / received as f64
        }
    }

    pub fn stats(&self) -> CoalescerStats {
        CoalescerStats {
            name: self.name.clone(),
            pending: self.pending_len(),
            total_received: self.total_received.load(Ordering::Relaxed),
            total_flushed: self.total_flushed.load(Ordering::Relaxed),
            total_coalesced: self.total_coalesced.load(Ordering::Relaxed),
            coalescing_ratio: self.coalescing_ratio(),
            flush_failures: self.flush_failures.load(Ordering::Relaxed),
        }
    }

    // ------------------------------------------------------------------------
    // Timer
    // ------------------------------------------------------------------------

    /// Run the flush timer until [`WriteCoalescer::stop`] is called.
    pub async fn run(self: Arc<Self>) {
        let mut stop_rx = self.stop_tx.subscribe();
        let mut ticker = interval(self.config.flush_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        tracing::info!(
            coalescer = %self.name,
            window_ms = self.config.window.as_millis() as u64,
            flush_interval_ms = self.config.flush_interval.as_millis() as u64,
            "Write coalescer started"
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
                    // Failures are logged and requeued inside flush
                    let _ = self.flush().await;
                }
            }
        }

        tracing::info!(coalescer = %self.name, pending = self.pending_len(), "Write coalescer stopped");
    }

    /// Halt the flush timer. Pending writes stay until `flush_all`.
    pub fn stop(&self) {
        self.stop_tx.send_replace(true);
    }
}

impl std::fmt::Debug for WriteCoalescer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WriteCoalescer")
            .field("name", &self.name)
            .field("config", &self.config)
            .field("pending", &self.pending_len())
            .finish()
    }
}

// ============================================================================
// TESTS
// ============================================================================
