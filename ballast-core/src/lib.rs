//! BALLAST Core - Shared Types
//!
//! Data types, error taxonomy and time sources used by every other crate.
//! This crate contains no I/O and no background work.

pub mod circuit;
pub mod clock;
pub mod constants;
pub mod error;
pub mod health;
pub mod patch;
pub mod sync;

pub use circuit::CircuitState;
pub use clock::{system_clock, Clock, ManualClock, SharedClock, SystemClock};
pub use error::{
    AdmissionError, BallastError, BallastResult, CapacityError, ConfigError, GeoError,
    RemoteError, StoreError,
};
pub use health::{HealthCheck, HealthStatus};
pub use patch::FieldPatch;
pub use sync::lock_unpoisoned;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

// ============================================================================
// IDENTITY TYPES
// ============================================================================

/// Timestamp type using UTC timezone.
pub type Timestamp = DateTime<Utc>;

/// Identity of a document in the backing store.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DocumentKey {
    pub collection: String,
    pub doc_id: String,
}

impl DocumentKey {
    pub fn new(collection: impl Into<String>, doc_id: impl Into<String>) -> Self {
        Self {
            collection: collection.into(),
            doc_id: doc_id.into(),
        }
    }
}

impl fmt::Display for DocumentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.collection, self.doc_id)
    }
}

// ============================================================================
// WRITE OPERATIONS
// ============================================================================

/// How a write applies to an existing document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WriteKind {
    /// Replace the whole document (create if missing)
    Set,
    /// Merge fields into the document (create if missing)
    Update,
}

/// A single physical write against the backing store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WriteOp {
    pub kind: WriteKind,
    pub key: DocumentKey,
    pub data: FieldPatch,
}

impl WriteOp {
    pub fn set(key: DocumentKey, data: FieldPatch) -> Self {
        Self {
            kind: WriteKind::Set,
            key,
            data,
        }
    }

    pub fn update(key: DocumentKey, data: FieldPatch) -> Self {
        Self {
            kind: WriteKind::Update,
            key,
            data,
        }
    }
}

/// Consistency requested for a single write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Consistency {
    /// Awaited direct write through the circuit breaker (e.g. payments)
    Critical,
    /// Coalesced/batched asynchronous write
    #[default]
    BestEffort,
}

// ============================================================================
// REMOTE DEPENDENCIES
// ============================================================================

/// The remote collaborators this layer protects. One breaker exists per
/// dependency for the process lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Dependency {
    BackingStore,
    PaymentGateway,
    Maps,
    GenerativeAi,
}

impl Dependency {
    pub const ALL: [Dependency; 4] = [
        Dependency::BackingStore,
        Dependency::PaymentGateway,
        Dependency::Maps,
        Dependency::GenerativeAi,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::BackingStore => "backing_store",
            Self::PaymentGateway => "payment_gateway",
            Self::Maps => "maps",
            Self::GenerativeAi => "generative_ai",
        }
    }

    /// Upper-case suffix used for per-dependency environment variables.
    pub fn env_suffix(&self) -> &'static str {
        match self {
            Self::BackingStore => "STORE",
            Self::PaymentGateway => "PAYMENTS",
            Self::Maps => "MAPS",
            Self::GenerativeAi => "AI",
        }
    }
}

impl fmt::Display for Dependency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
