//! Analytics Events
//!
//! Client analytics events are not critical: they go through a bounded
//! write queue and reach the store in batches. A full queue is reported to
//! the client as backpressure instead of blocking the request.

use std::sync::Arc;

use async_trait::async_trait;
use ballast_core::{BallastResult, DocumentKey, FieldPatch, Timestamp, WriteOp};
use ballast_resilience::CircuitBreaker;
use ballast_writes::{DocumentStore, QueueProcessor};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Collection analytics events are persisted into.
pub const EVENTS_COLLECTION: &str = "analytics_events";

/// One analytics event accepted from a client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalyticsEvent {
    pub id: Uuid,
    pub name: String,
    #[serde(default)]
    pub payload: serde_json::Value,
    pub received_at: Timestamp,
}

impl AnalyticsEvent {
    pub fn new(name: impl Into<String>, payload: serde_json::Value, received_at: Timestamp) -> Self {
        Self {
            id: Uuid::now_v7(),
            name: name.into(),
            payload,
            received_at,
        }
    }

    /// The store write for this event. Keyed by event id, so replays after
    /// a failed batch overwrite rather than duplicate.
    pub fn to_write_op(&self) -> WriteOp {
        WriteOp::set(
            DocumentKey::new(EVENTS_COLLECTION, self.id.to_string()),
            FieldPatch::new()
                .with("name", self.name.clone())
                .with("payload", self.payload.clone())
                .with("received_at", self.received_at.to_rfc3339()),
        )
    }
}

/// Queue processor committing event batches to the store through its
/// breaker.
pub struct StoreEventSink {
    store: Arc<dyn DocumentStore>,
    breaker: Arc<CircuitBreaker>,
}

impl StoreEventSink {
    pub fn new(store: Arc<dyn DocumentStore>, breaker: Arc<CircuitBreaker>) -> Self {
        Self { store, breaker }
    }
}

#[async_trait]
impl QueueProcessor<AnalyticsEvent> for StoreEventSink {
    async fn process(&self, batch: Vec<AnalyticsEvent>) -> BallastResult<()> {
        let ops: Vec<WriteOp> = batch.iter().map(AnalyticsEvent::to_write_op).collect();
        let chunk_size = self.store.max_batch_ops().max(1);

        for chunk in ops.chunks(chunk_size) {
            self.breaker
                .execute(|| self.store.commit_batch(chunk))
                .await?;
        }

        tracing::debug!(events = ops.len(), "Committed analytics events");
        Ok(())
    }
}
