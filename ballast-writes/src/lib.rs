//! BALLAST Writes - Write amplification control
//!
//! Coalescing of bursty updates per document, batched commits under the
//! store's per-batch ceiling and write rate, a bounded retrying queue for
//! non-critical work, and routing by declared consistency.

pub mod batch_writer;
pub mod coalescer;
pub mod queue;
pub mod router;
pub mod store;

pub use batch_writer::{
    BatchWriter, BatchWriterConfig, BatchWriterStats, CommitHook, FlushSummary,
};
pub use coalescer::{CoalescerConfig, CoalescerStats, FlushHandler, PendingWrite, WriteCoalescer};
pub use queue::{
    CycleOutcome, DeadLetterHook, QueueProcessor, WriteQueue, WriteQueueConfig, WriteQueueStats,
};
pub use router::{PersistOutcome, WriteRouter};
pub use store::{DocumentStore, InMemoryStore};
