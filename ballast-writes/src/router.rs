//! Consistency-aware write routing.
//!
//! Every write declares its consistency. `Critical` writes (payment
//! confirmations and the like) are awaited against the store through its
//! breaker; `BestEffort` writes go to the coalescer and return immediately.

use std::sync::Arc;

use ballast_core::{BallastResult, Consistency, DocumentKey, FieldPatch, WriteOp};
use ballast_resilience::CircuitBreaker;

use crate::coalescer::WriteCoalescer;
use crate::store::DocumentStore;

/// Where a write ended up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PersistOutcome {
    /// Applied to the store before returning
    Committed,
    /// Accepted for asynchronous persistence
    Buffered,
}

#[derive(Clone)]
pub struct WriteRouter {
    store: Arc<dyn DocumentStore>,
    breaker: Arc<CircuitBreaker>,
    coalescer: Arc<WriteCoalescer>,
}

impl WriteRouter {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        breaker: Arc<CircuitBreaker>,
        coalescer: Arc<WriteCoalescer>,
    ) -> Self {
        Self {
            store,
            breaker,
            coalescer,
        }
    }

    pub async fn persist(
        &self,
        key: DocumentKey,
        patch: FieldPatch,
        consistency: Consistency,
    ) -> BallastResult<PersistOutcome> {
        match consistency {
            Consistency::Critical => {
                let op = WriteOp::update(key, patch);
                self.breaker.execute(|| self.store.write(&op)).await?;
                tracing::debug!(key = %op.key, "Critical write committed");
                Ok(PersistOutcome::Committed)
            }
            Consistency::BestEffort => {
                self.coalescer.write_key(key, patch);
                Ok(PersistOutcome::Buffered)
            }
        }
    }

    /// Read straight from the store, bypassing every cache.
    pub async fn read_direct(&self, key: &DocumentKey) -> BallastResult<Option<FieldPatch>> {
        self.breaker.execute(|| self.store.get(key)).await
    }

    pub fn coalescer(&self) -> &Arc<WriteCoalescer> {
        &self.coalescer
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coalescer::CoalescerConfig;
    use crate::store::InMemoryStore;
    use ballast_core::{BallastError, RemoteError};
    use ballast_resilience::CircuitBreakerConfig;
    use serde_json::json;

    fn router(threshold: u32) -> (WriteRouter, Arc<InMemoryStore>) {
        let store = Arc::new(InMemoryStore::new());
        let breaker = Arc::new(CircuitBreaker::new(
            "backing_store",
            CircuitBreakerConfig::default().with_failure_threshold(threshold),
        ));
        let coalescer = Arc::new(WriteCoalescer::new("docs", CoalescerConfig::default()));
        (WriteRouter::new(store.clone(), breaker, coalescer), store)
    }

    #[tokio::test]
    async fn test_critical_write_is_visible_on_return() {
        let (router, store) = router(5);
        let key = DocumentKey::new("payments", "p-1");

        let outcome = router
            .persist(
                key.clone(),
                FieldPatch::new().with("status", "confirmed"),
                Consistency::Critical,
            )
            .await
            .expect("persist");

        assert_eq!(outcome, PersistOutcome::Committed);
        let doc = store.document(&key).expect("written");
        assert_eq!(doc.get("status"), Some(&json!("confirmed")));
        assert_eq!(router.coalescer().pending_len(), 0);
    }

    #[tokio::test]
    async fn test_best_effort_write_is_buffered() {
        let (router, store) = router(5);
        let key = DocumentKey::new("suppliers", "s-1");

        let outcome = router
            .persist(key.clone(), FieldPatch::new().with("lat", 1.0), Consistency::BestEffort)
            .await
            .expect("persist");

        assert_eq!(outcome, PersistOutcome::Buffered);
        assert!(store.document(&key).is_none());
        assert_eq!(router.coalescer().pending_len(), 1);
    }

    #[tokio::test]
    async fn test_critical_write_surfaces_open_circuit() {
        let (router, _store) = router(1);
        // Trip the shared store breaker
        let _: BallastResult<()> = router
            .breaker
            .execute(|| async { Err(BallastError::call_failed("backing_store", "down")) })
            .await;

        let err = router
            .persist(
                DocumentKey::new("payments", "p-2"),
                FieldPatch::new().with("status", "confirmed"),
                Consistency::Critical,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, BallastError::Remote(RemoteError::CircuitOpen { .. })));
    }
}
