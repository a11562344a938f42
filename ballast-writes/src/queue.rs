//! Bounded, backpressured write queue with retry.
//!
//! `enqueue` refuses new items at `max_size` instead of growing or dropping.
//! A registered processor receives batches of up to `batch_size` items on a
//! timer. A failed batch sends each of its items to the back of the queue
//! with exponential backoff; once an item has been retried `max_retries`
//! times it is counted as failed and handed to the dead-letter hook.
//!
//! A batch handed to the processor still holds its slots until it settles,
//! so capacity counts queued plus in-flight items.

use std::collections::VecDeque;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use ballast_core::constants::{
    DEFAULT_QUEUE_BATCH_SIZE, DEFAULT_QUEUE_FLUSH_INTERVAL_MS, DEFAULT_QUEUE_MAX_RETRIES,
    DEFAULT_QUEUE_MAX_SIZE, DEFAULT_QUEUE_RETRY_BACKOFF_MS,
};
use ballast_core::{
    lock_unpoisoned, system_clock, BallastError, BallastResult, CapacityError, SharedClock,
};
use serde::Serialize;
use tokio::sync::watch;
use tokio::time::{interval, MissedTickBehavior};

// ============================================================================
// CONFIGURATION
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteQueueConfig {
    pub max_size: usize,
    pub batch_size: usize,
    pub flush_interval: Duration,
    /// Retries after the first attempt before an item is failed
    pub max_retries: u32,
    /// Base delay; attempt `n` waits `retry_backoff * 2^(n-1)`
    pub retry_backoff: Duration,
}

impl Default for WriteQueueConfig {
    fn default() -> Self {
        Self {
            max_size: DEFAULT_QUEUE_MAX_SIZE,
            batch_size: DEFAULT_QUEUE_BATCH_SIZE,
            flush_interval: Duration::from_millis(DEFAULT_QUEUE_FLUSH_INTERVAL_MS),
            max_retries: DEFAULT_QUEUE_MAX_RETRIES,
            retry_backoff: Duration::from_millis(DEFAULT_QUEUE_RETRY_BACKOFF_MS),
        }
    }
}

impl WriteQueueConfig {
    /// # Environment Variables
    /// - `BALLAST_QUEUE_MAX_SIZE`: Capacity (default: 10000)
    /// - `BALLAST_QUEUE_BATCH_SIZE`: Items per processor call (default: 100)
    /// - `BALLAST_QUEUE_FLUSH_INTERVAL_MS`: Processing timer (default: 1000)
    /// - `BALLAST_QUEUE_MAX_RETRIES`: Retries before failing an item (default: 3)
    /// - `BALLAST_QUEUE_RETRY_BACKOFF_MS`: Base retry backoff (default: 500)
    pub fn from_env() -> Self {
        let max_size = std::env::var("BALLAST_QUEUE_MAX_SIZE")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(DEFAULT_QUEUE_MAX_SIZE);

        let batch_size = std::env::var("BALLAST_QUEUE_BATCH_SIZE")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(DEFAULT_QUEUE_BATCH_SIZE);

        let flush_interval = Duration::from_millis(
            std::env::var("BALLAST_QUEUE_FLUSH_INTERVAL_MS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(DEFAULT_QUEUE_FLUSH_INTERVAL_MS),
        );

        let max_retries = std::env::var("BALLAST_QUEUE_MAX_RETRIES")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(DEFAULT_QUEUE_MAX_RETRIES);

        let retry_backoff = Duration::from_millis(
            std::env::var("BALLAST_QUEUE_RETRY_BACKOFF_MS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(DEFAULT_QUEUE_RETRY_BACKOFF_MS),
        );

        Self {
            max_size,
            batch_size,
            flush_interval,
            max_retries,
            retry_backoff,
        }
    }

    pub fn with_max_size(mut self, max_size: usize) -> Self {
        self.max_size = max_size;
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_flush_interval(mut self, interval: Duration) -> Self {
        self.flush_interval = interval;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_retry_backoff(mut self, backoff: Duration) -> Self {
        self.retry_backoff = backoff;
        self
    }

    /// Delay before retry number `retries` (1-based).
    pub fn backoff_for(&self, retries: u32) -> Duration {
        let exponent = retries.saturating_sub(1).min(16);
        self.retry_backoff.saturating_mul(1u32 << exponent)
    }
}

// ============================================================================
// PROCESSOR
// ============================================================================

/// Consumes a batch of queued items. An `Err` fails the whole batch.
#[async_trait]
pub trait QueueProcessor<T>: Send + Sync {
    async fn process(&self, batch: Vec<T>) -> BallastResult<()>;
}

#[async_trait]
impl<T, F, Fut> QueueProcessor<T> for F
where
    T: Send + 'static,
    F: Fn(Vec<T>) -> Fut + Send + Sync,
    Fut: Future<Output = BallastResult<()>> + Send + 'static,
{
    async fn process(&self, batch: Vec<T>) -> BallastResult<()> {
        (self)(batch).await
    }
}

/// Receives items that exhausted their retries.
pub type DeadLetterHook<T> = Arc<dyn Fn(T, &BallastError) + Send + Sync>;

// ============================================================================
// QUEUE
// ============================================================================

#[derive(Debug, Clone)]
struct QueueItem<T> {
    payload: T,
    enqueued_at: Instant,
    retries: u32,
    next_attempt_at: Instant,
}

struct QueueState<T> {
    items: VecDeque<QueueItem<T>>,
    /// Items taken by a cycle whose processor call has not settled
    in_flight: usize,
}

impl<T> QueueState<T> {
    fn occupied(&self) -> usize {
        self.items.len() + self.in_flight
    }
}

/// Capacity held by a batch while the processor works on it. Dropping it
/// returns the slots, including when the cycle future is cancelled.
struct InFlight<'a, T> {
    state: &'a Mutex<QueueState<T>>,
    count: usize,
}

impl<T> InFlight<'_, T> {
    fn release(&mut self, state: &mut QueueState<T>) {
        state.in_flight = state.in_flight.saturating_sub(self.count);
        self.count = 0;
    }
}

impl<T> Drop for InFlight<'_, T> {
    fn drop(&mut self) {
        if self.count > 0 {
            let mut state = lock_unpoisoned(self.state);
            state.in_flight = state.in_flight.saturating_sub(self.count);
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WriteQueueStats {
    pub name: String,
    pub depth: usize,
    pub in_flight: usize,
    pub max_size: usize,
    pub enqueued: u64,
    pub processed: u64,
    pub rejected: u64,
    pub retried: u64,
    pub failed: u64,
}

/// Result of one processing cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleOutcome {
    pub processed: usize,
    pub retried: usize,
    pub failed: usize,
}

pub struct WriteQueue<T> {
    name: String,
    config: WriteQueueConfig,
    state: Mutex<QueueState<T>>,
    processor: RwLock<Option<Arc<dyn QueueProcessor<T>>>>,
    dead_letter: RwLock<Option<DeadLetterHook<T>>>,
    clock: SharedClock,
    stop_tx: watch::Sender<bool>,
    enqueued: AtomicU64,
    processed: AtomicU64,
    rejected: AtomicU64,
    retried: AtomicU64,
    failed: AtomicU64,
}

impl<T> WriteQueue<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub fn new(name: impl Into<String>, config: WriteQueueConfig) -> Self {
        Self::with_clock(name, config, system_clock())
    }

    pub fn with_clock(name: impl Into<String>, config: WriteQueueConfig, clock: SharedClock) -> Self {
        let (stop_tx, _) = watch::channel(false);
        Self {
            name: name.into(),
            config,
            state: Mutex::new(QueueState {
                items: VecDeque::new(),
                in_flight: 0,
            }),
            processor: RwLock::new(None),
            dead_letter: RwLock::new(None),
            clock,
            stop_tx,
            enqueued: AtomicU64::new(0),
            processed: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
            retried: AtomicU64::new(0),
            failed: AtomicU64::new(0),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Register the batch processor.
    pub fn on_process<P>(&self, processor: P)
    where
        P: QueueProcessor<T> + 'static,
    {
        let mut slot = self.processor.write().unwrap_or_else(|e| e.into_inner());
        *slot = Some(Arc::new(processor));
    }

    /// Register the hook that receives permanently failed items.
    pub fn on_dead_letter<F>(&self, hook: F)
    where
        F: Fn(T, &BallastError) + Send + Sync + 'static,
    {
        let mut slot = self.dead_letter.write().unwrap_or_else(|e| e.into_inner());
        *slot = Some(Arc::new(hook));
    }

    /// Append an item. Returns `false`, and keeps nothing, when queued plus
    /// in-flight items already fill the queue.
    pub fn enqueue(&self, item: T) -> bool {
        let now = self.clock.now();
        let mut state = lock_unpoisoned(&self.state);
        if state.occupied() >= self.config.max_size {
            drop(state);
            self.rejected.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(queue = %self.name, max_size = self.config.max_size, "Queue full, rejecting item");
            return false;
        }
        state.items.push_back(QueueItem {
            payload: item,
            enqueued_at: now,
            retries: 0,
            next_attempt_at: now,
        });
        drop(state);
        self.enqueued.fetch_add(1, Ordering::Relaxed);
        true
    }

    /// [`WriteQueue::enqueue`] as a typed error.
    pub fn try_enqueue(&self, item: T) -> Result<(), CapacityError> {
        if self.enqueue(item) {
            Ok(())
        } else {
            Err(CapacityError::QueueFull {
                queue: self.name.clone(),
                max_size: self.config.max_size,
            })
        }
    }

    /// Items waiting in the queue.
    pub fn depth(&self) -> usize {
        lock_unpoisoned(&self.state).items.len()
    }

    /// Items currently with the processor.
    pub fn in_flight(&self) -> usize {
        lock_unpoisoned(&self.state).in_flight
    }

    /// Age of the oldest queued item.
    pub fn oldest_age(&self) -> Option<Duration> {
        let now = self.clock.now();
        lock_unpoisoned(&self.state)
            .items
            .front()
            .map(|item| now.saturating_duration_since(item.enqueued_at))
    }

    /// Process one batch of items whose backoff has elapsed.
    pub async fn process_once(&self) -> CycleOutcome {
        self.cycle(true).await
    }

    /// Drain the queue for shutdown, ignoring retry backoff. Items that keep
    /// failing end up dead-lettered, so this terminates.
    pub async fn flush(&self) -> CycleOutcome {
        let mut total = CycleOutcome::default();
        loop {
            let outcome = self.cycle(false).await;
            total.processed += outcome.processed;
            total.retried += outcome.retried;
            total.failed += outcome.failed;

            if outcome == CycleOutcome::default() || self.depth() == 0 {
                break;
            }
        }
        total
    }

    async fn cycle(&self, respect_backoff: bool) -> CycleOutcome {
        let processor = self
            .processor
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        let Some(processor) = processor else {
            return CycleOutcome::default();
        };

        let (batch, mut reservation) = self.take_batch(respect_backoff);
        if batch.is_empty() {
            return CycleOutcome::default();
        }

        let payloads: Vec<T> = batch.iter().map(|item| item.payload.clone()).collect();
        match processor.process(payloads).await {
            Ok(()) => {
                self.processed
                    .fetch_add(batch.len() as u64, Ordering::Relaxed);
                CycleOutcome {
                    processed: batch.len(),
                    ..CycleOutcome::default()
                }
            }
            Err(e) => {
                tracing::warn!(
                    queue = %self.name,
                    batch = batch.len(),
                    error = %e,
                    "Queue batch failed"
                );
                self.retry_or_fail(batch, &mut reservation, &e)
            }
        }
    }

    fn take_batch(&self, respect_backoff: bool) -> (Vec<QueueItem<T>>, InFlight<'_, T>) {
        let now = self.clock.now();
        let mut state = lock_unpoisoned(&self.state);
        let items = &mut state.items;
        let mut batch = Vec::with_capacity(self.config.batch_size.min(items.len()));
        let mut deferred = Vec::new();

        while batch.len() < self.config.batch_size.max(1) {
            let Some(item) = items.pop_front() else {
                break;
            };
            if !respect_backoff || item.next_attempt_at <= now {
                batch.push(item);
            } else {
                deferred.push(item);
            }
        }
        for item in deferred.into_iter().rev() {
            items.push_front(item);
        }
        state.in_flight += batch.len();
        let reservation = InFlight {
            state: &self.state,
            count: batch.len(),
        };
        (batch, reservation)
    }

    fn retry_or_fail(
        &self,
        batch: Vec<QueueItem<T>>,
        reservation: &mut InFlight<'_, T>,
        error: &BallastError,
    ) -> CycleOutcome {
        let now = self.clock.now();
        let mut outcome = CycleOutcome::default();
        let mut dead = Vec::new();

        {
            let mut state = lock_unpoisoned(&self.state);
            reservation.release(&mut state);
            for mut item in batch {
                item.retries += 1;
                if item.retries > self.config.max_retries {
                    dead.push(item.payload);
                } else {
                    item.next_attempt_at = now + self.config.backoff_for(item.retries);
                    state.items.push_back(item);
                    outcome.retried += 1;
                }
            }
        }

        outcome.failed = dead.len();
        self.retried
            .fetch_add(outcome.retried as u64, Ordering::Relaxed);
        self.failed.fetch_add(outcome.failed as u64, Ordering::Relaxed);

        if !dead.is_empty() {
            tracing::error!(
                queue = %self.name,
                count = dead.len(),
                max_retries = self.config.max_retries,
                error = %error,
                "Items failed permanently"
            );
            let hook = self
                .dead_letter
                .read()
                .unwrap_or_else(|e| e.into_inner())
                .clone();
            if let Some(hook) = hook {
                for payload in dead {
                    hook(payload, error);
                }
            }
        }
        outcome
    }

    pub fn stats(&self) -> WriteQueueStats {
        WriteQueueStats {
            name: self.name.clone(),
            depth: self.depth(),
            in_flight: self.in_flight(),
            max_size: self.config.max_size,
            enqueued: self.enqueued.load(Ordering::Relaxed),
            processed: self.processed.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            retried: self.retried.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
        }
    }

    /// Run the processing timer until [`WriteQueue::stop`] is called.
    pub async fn run(self: Arc<Self>) {
        let mut stop_rx = self.stop_tx.subscribe();
        let mut ticker = interval(self.config.flush_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        tracing::info!(
            queue = %self.name,
            max_size = self.config.max_size,
            batch_size = self.config.batch_size,
            flush_interval_ms = self.config.flush_interval.as_millis() as u64,
            "Write queue started"
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
                    self.process_once().await;
                }
            }
        }

        tracing::info!(queue = %self.name, depth = self.depth(), "Write queue stopped");
    }

    /// Halt the processing timer. Queued items stay until `flush`.
    pub fn stop(&self) {
        self.stop_tx.send_replace(true);
    }
}

impl<T> std::fmt::Debug for WriteQueue<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WriteQueue")
            .field("name", &self.name)
            .field("config", &self.config)
            .field("depth", &lock_unpoisoned(&self.state).items.len())
            .finish()
    }
}

// ============================================================================
// TESTS
// ============================================================================
