//! Backing document store abstraction.
//!
//! The real store is a remote, quota-limited document database. This layer
//! only needs three things from it: point reads, single writes and bounded
//! atomic batches. Every call from request-handling code goes through the
//! store's circuit breaker.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use ballast_core::constants::STORE_MAX_BATCH_OPS;
use ballast_core::{
    lock_unpoisoned, BallastResult, DocumentKey, FieldPatch, StoreError, WriteKind, WriteOp,
};

/// Async document store.
///
/// Writes are idempotent per `(collection, doc_id)`: replaying a `Set` or an
/// `Update` yields the same document.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Read a document, `None` if it does not exist.
    async fn get(&self, key: &DocumentKey) -> BallastResult<Option<FieldPatch>>;

    /// Apply one write.
    async fn write(&self, op: &WriteOp) -> BallastResult<()>;

    /// Apply up to [`DocumentStore::max_batch_ops`] writes atomically.
    async fn commit_batch(&self, ops: &[WriteOp]) -> BallastResult<()>;

    /// Hard per-batch operation ceiling.
    fn max_batch_ops(&self) -> usize {
        STORE_MAX_BATCH_OPS
    }
}

fn apply(documents: &mut HashMap<DocumentKey, FieldPatch>, op: &WriteOp) {
    match op.kind {
        WriteKind::Set => {
            documents.insert(op.key.clone(), op.data.clone());
        }
        WriteKind::Update => {
            documents
                .entry(op.key.clone())
                .or_default()
                .merge_newer(op.data.clone());
        }
    }
}

/// Process-local store used by the demo binary and tests.
#[derive(Debug, Default)]
pub struct InMemoryStore {
    documents: Mutex<HashMap<DocumentKey, FieldPatch>>,
    physical_writes: AtomicU64,
    batches: AtomicU64,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current contents of one document.
    pub fn document(&self, key: &DocumentKey) -> Option<FieldPatch> {
        lock_unpoisoned(&self.documents).get(key).cloned()
    }

    pub fn len(&self) -> usize {
        lock_unpoisoned(&self.documents).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Operations applied so far, counting each op inside a batch.
    pub fn physical_writes(&self) -> u64 {
        self.physical_writes.load(Ordering::Relaxed)
    }

    pub fn batches(&self) -> u64 {
        self.batches.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl DocumentStore for InMemoryStore {
    async fn get(&self, key: &DocumentKey) -> BallastResult<Option<FieldPatch>> {
        Ok(self.document(key))
    }

    async fn write(&self, op: &WriteOp) -> BallastResult<()> {
        apply(&mut lock_unpoisoned(&self.documents), op);
        self.physical_writes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn commit_batch(&self, ops: &[WriteOp]) -> BallastResult<()> {
        if ops.len() > self.max_batch_ops() {
            return Err(StoreError::BatchTooLarge {
                size: ops.len(),
                max: self.max_batch_ops(),
            }
            .into());
        }

        let mut documents = lock_unpoisoned(&self.documents);
        for op in ops {
            apply(&mut documents, op);
        }
        self.physical_writes
            .fetch_add(ops.len() as u64, Ordering::Relaxed);
        self.batches.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ballast_core::BallastError;
    use serde_json::json;

    #[tokio::test]
    async fn test_set_replaces_update_merges() {
        let store = InMemoryStore::new();
        let key = DocumentKey::new("orders", "o-1");

        store
            .write(&WriteOp::set(
                key.clone(),
                FieldPatch::new().with("status", "new").with("total", 10),
            ))
            .await
            .expect("set");
        store
            .write(&WriteOp::update(key.clone(), FieldPatch::new().with("status", "paid")))
            .await
            .expect("update");

        let doc = store.get(&key).await.expect("get").expect("exists");
        assert_eq!(doc.get("status"), Some(&json!("paid")));
        assert_eq!(doc.get("total"), Some(&json!(10)));

        store
            .write(&WriteOp::set(key.clone(), FieldPatch::new().with("status", "void")))
            .await
            .expect("set");
        let doc = store.document(&key).expect("exists");
        assert!(!doc.contains("total"));
    }

    #[tokio::test]
    async fn test_batch_over_limit_is_rejected_whole() {
        let store = InMemoryStore::new();
        let ops: Vec<WriteOp> = (0..STORE_MAX_BATCH_OPS + 1)
            .map(|i| WriteOp::set(DocumentKey::new("c", i.to_string()), FieldPatch::new()))
            .collect();

        let err = store.commit_batch(&ops).await.unwrap_err();
        assert!(matches!(
            err,
            BallastError::Store(StoreError::BatchTooLarge { size: 501, max: 500 })
        ));
        assert!(store.is_empty());
        assert_eq!(store.batches(), 0);
    }

    #[tokio::test]
    async fn test_missing_document_is_none() {
        let store = InMemoryStore::new();
        assert_eq!(store.get(&DocumentKey::new("c", "nope")).await, Ok(None));
    }
}
