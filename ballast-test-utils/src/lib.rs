//! BALLAST Test Utilities
//!
//! Shared test infrastructure for the BALLAST workspace:
//! - Fault-injecting store and recording handlers
//! - Proptest generators for keys, patches and coordinates
//! - Fixtures for common scenarios
//! - Assertions for BALLAST error variants

pub use ballast_core::{
    BallastError, BallastResult, CapacityError, DocumentKey, FieldPatch, ManualClock,
    RemoteError, StoreError, WriteKind, WriteOp,
};
pub use ballast_writes::{DocumentStore, FlushHandler, InMemoryStore, PendingWrite, QueueProcessor};

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use ballast_core::lock_unpoisoned;

// ============================================================================
// FAULT-INJECTING STORE
// ============================================================================

/// An [`InMemoryStore`] that can be told to fail or slow down.
///
/// Failures are `StoreError::Unavailable`, the same shape a real store
/// reports when its quota or connection is gone.
#[derive(Debug, Default)]
pub struct FlakyStore {
    inner: InMemoryStore,
    down: AtomicBool,
    fail_next: AtomicU32,
    latency_ms: AtomicU64,
    calls: AtomicU64,
    failures: AtomicU64,
}

impl FlakyStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail every call until [`FlakyStore::set_down`] is called with `false`.
    pub fn set_down(&self, down: bool) {
        self.down.store(down, Ordering::SeqCst);
    }

    /// Fail the next `n` calls, then recover.
    pub fn fail_next(&self, n: u32) {
        self.fail_next.store(n, Ordering::SeqCst);
    }

    /// Delay every call by `latency`.
    pub fn set_latency(&self, latency: Duration) {
        self.latency_ms
            .store(latency.as_millis() as u64, Ordering::SeqCst);
    }

    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::SeqCst)
    }

    /// The backing in-memory store, for inspecting what landed.
    pub fn inner(&self) -> &InMemoryStore {
        &self.inner
    }

    async fn enter(&self) -> BallastResult<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);

        let latency = self.latency_ms.load(Ordering::SeqCst);
        if latency > 0 {
            tokio::time::sleep(Duration::from_millis(latency)).await;
        }

        let injected = self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected || self.down.load(Ordering::SeqCst) {
            self.failures.fetch_add(1, Ordering::SeqCst);
            return Err(StoreError::Unavailable {
                reason: "injected fault".to_string(),
            }
            .into());
        }
        Ok(())
    }
}

#[async_trait]
impl DocumentStore for FlakyStore {
    async fn get(&self, key: &DocumentKey) -> BallastResult<Option<FieldPatch>> {
        self.enter().await?;
        self.inner.get(key).await
    }

    async fn write(&self, op: &WriteOp) -> BallastResult<()> {
        self.enter().await?;
        self.inner.write(op).await
    }

    async fn commit_batch(&self, ops: &[WriteOp]) -> BallastResult<()> {
        self.enter().await?;
        self.inner.commit_batch(ops).await
    }
}

// ============================================================================
// RECORDING HANDLERS
// ============================================================================

/// Coalescer flush handler that records every flushed batch.
#[derive(Debug, Default)]
pub struct RecordingFlushHandler {
    batches: Mutex<Vec<Vec<PendingWrite>>>,
    failing: AtomicBool,
}

impl RecordingFlushHandler {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn batches(&self) -> Vec<Vec<PendingWrite>> {
        lock_unpoisoned(&self.batches).clone()
    }

    /// Every write flushed so far, in flush order.
    pub fn writes(&self) -> Vec<PendingWrite> {
        lock_unpoisoned(&self.batches).iter().flatten().cloned().collect()
    }
}

#[async_trait]
impl FlushHandler for RecordingFlushHandler {
    async fn flush(&self, writes: Vec<PendingWrite>) -> BallastResult<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(BallastError::call_failed("flush_handler", "injected fault"));
        }
        lock_unpoisoned(&self.batches).push(writes);
        Ok(())
    }
}

/// Queue processor that records every batch it is handed.
///
/// Clones share state, so keep one clone for inspection and hand the other
/// to `WriteQueue::on_process`.
#[derive(Debug)]
pub struct RecordingProcessor<T> {
    batches: Arc<Mutex<Vec<Vec<T>>>>,
    fail_next: Arc<AtomicU32>,
    failing: Arc<AtomicBool>,
}

impl<T> Clone for RecordingProcessor<T> {
    fn clone(&self) -> Self {
        Self {
            batches: Arc::clone(&self.batches),
            fail_next: Arc::clone(&self.fail_next),
            failing: Arc::clone(&self.failing),
        }
    }
}

impl<T> Default for RecordingProcessor<T> {
    fn default() -> Self {
        Self {
            batches: Arc::new(Mutex::new(Vec::new())),
            fail_next: Arc::new(AtomicU32::new(0)),
            failing: Arc::new(AtomicBool::new(false)),
        }
    }
}

impl<T: Clone> RecordingProcessor<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `n` batches.
    pub fn fail_next(&self, n: u32) {
        self.fail_next.store(n, Ordering::SeqCst);
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn batches(&self) -> Vec<Vec<T>> {
        lock_unpoisoned(&self.batches).clone()
    }

    /// Every item processed successfully, in processing order.
    pub fn items(&self) -> Vec<T> {
        lock_unpoisoned(&self.batches).iter().flatten().cloned().collect()
    }
}

#[async_trait]
impl<T> QueueProcessor<T> for RecordingProcessor<T>
where
    T: Send + 'static,
{
    async fn process(&self, batch: Vec<T>) -> BallastResult<()> {
        let injected = self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected || self.failing.load(Ordering::SeqCst) {
            return Err(BallastError::call_failed("queue_processor", "injected fault"));
        }
        lock_unpoisoned(&self.batches).push(batch);
        Ok(())
    }
}

// ============================================================================
// PROPTEST GENERATORS
// ============================================================================

pub mod generators {
    //! Proptest strategies for BALLAST types.

    use super::*;
    use proptest::prelude::*;

    /// A key from a small space, so collisions (and therefore merges) happen.
    pub fn arb_document_key() -> impl Strategy<Value = DocumentKey> {
        (
            prop_oneof![Just("suppliers"), Just("orders"), Just("payments")],
            0u8..8,
        )
            .prop_map(|(collection, n)| DocumentKey::new(collection, format!("doc-{n}")))
    }

    pub fn arb_field_value() -> impl Strategy<Value = serde_json::Value> {
        prop_oneof![
            any::<i64>().prop_map(serde_json::Value::from),
            any::<bool>().prop_map(serde_json::Value::from),
            "[a-z]{0,12}".prop_map(serde_json::Value::from),
        ]
    }

    /// A patch over fields `f0`..`f5`.
    pub fn arb_field_patch() -> impl Strategy<Value = FieldPatch> {
        prop::collection::btree_map(
            (0u8..6).prop_map(|n| format!("f{n}")),
            arb_field_value(),
            0..4,
        )
        .prop_map(FieldPatch::from)
    }

    pub fn arb_write_op() -> impl Strategy<Value = WriteOp> {
        (any::<bool>(), arb_document_key(), arb_field_patch()).prop_map(|(set, key, patch)| {
            if set {
                WriteOp::set(key, patch)
            } else {
                WriteOp::update(key, patch)
            }
        })
    }

    /// A latitude/longitude pair away from the poles.
    pub fn arb_coordinate() -> impl Strategy<Value = (f64, f64)> {
        (-85.0f64..85.0, -180.0f64..=180.0)
    }

    /// A client identifier as the rate-limit middleware would see it.
    pub fn arb_client_key() -> impl Strategy<Value = String> {
        (1u8..=254, 0u8..=255).prop_map(|(a, b)| format!("10.0.{a}.{b}"))
    }
}

// ============================================================================
// TEST FIXTURES
// ============================================================================

pub mod fixtures {
    //! Ready-made values for common scenarios.

    use super::*;

    pub fn supplier_key(id: &str) -> DocumentKey {
        DocumentKey::new("suppliers", id)
    }

    pub fn location_patch(lat: f64, lng: f64) -> FieldPatch {
        FieldPatch::new().with("lat", lat).with("lng", lng)
    }

    pub fn payment_confirmation(amount: i64) -> FieldPatch {
        FieldPatch::new()
            .with("status", "confirmed")
            .with("amount", amount)
    }

    /// `n` update ops against distinct documents in one collection.
    pub fn update_ops(collection: &str, n: usize) -> Vec<WriteOp> {
        (0..n)
            .map(|i| {
                WriteOp::update(
                    DocumentKey::new(collection, format!("doc-{i}")),
                    FieldPatch::new().with("seq", i as u64),
                )
            })
            .collect()
    }

    /// Bengaluru city centre, used as the default query point.
    pub const CITY_CENTER: (f64, f64) = (12.9716, 77.5946);
}

// ============================================================================
// CUSTOM ASSERTIONS
// ============================================================================

pub mod assertions {
    //! Assertions for BALLAST error variants.

    use super::*;

    #[track_caller]
    pub fn assert_circuit_open<T: std::fmt::Debug>(result: &BallastResult<T>) {
        match result {
            Err(BallastError::Remote(RemoteError::CircuitOpen { .. })) => {}
            other => panic!("Expected CircuitOpen, got: {:?}", other),
        }
    }

    #[track_caller]
    pub fn assert_timeout<T: std::fmt::Debug>(result: &BallastResult<T>) {
        match result {
            Err(BallastError::Remote(RemoteError::Timeout { .. })) => {}
            other => panic!("Expected Timeout, got: {:?}", other),
        }
    }

    /// Assert a rate-limit denial and return its `retry_after_ms`.
    #[track_caller]
    pub fn assert_rate_limited<T: std::fmt::Debug>(result: &BallastResult<T>) -> u64 {
        match result {
            Err(err @ BallastError::Admission(_)) => err.retry_after_ms().unwrap_or_default(),
            other => panic!("Expected RateLimited, got: {:?}", other),
        }
    }

    #[track_caller]
    pub fn assert_store_unavailable<T: std::fmt::Debug>(result: &BallastResult<T>) {
        match result {
            Err(BallastError::Store(StoreError::Unavailable { .. })) => {}
            other => panic!("Expected store Unavailable, got: {:?}", other),
        }
    }

    #[track_caller]
    pub fn assert_queue_full<T: std::fmt::Debug>(result: &BallastResult<T>) {
        match result {
            Err(BallastError::Capacity(CapacityError::QueueFull { .. })) => {}
            other => panic!("Expected QueueFull, got: {:?}", other),
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================
