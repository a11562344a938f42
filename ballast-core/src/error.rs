//! Error types for BALLAST operations

use thiserror::Error;

/// Admission errors. Surfaced to the caller immediately, never retried
/// internally.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AdmissionError {
    #[error("Rate limit exceeded for {key}, retry after {retry_after_ms}ms")]
    RateLimited { key: String, retry_after_ms: u64 },
}

/// Failures of a call to a remote dependency (store, payments, maps, AI).
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RemoteError {
    #[error("Circuit open for {dependency}, call rejected")]
    CircuitOpen { dependency: String },

    #[error("Call to {dependency} timed out after {timeout_ms}ms")]
    Timeout { dependency: String, timeout_ms: u64 },

    #[error("Call to {dependency} failed: {reason}")]
    CallFailed { dependency: String, reason: String },
}

/// Capacity errors: a bounded buffer refused new work.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CapacityError {
    #[error("Queue {queue} is full ({max_size} items)")]
    QueueFull { queue: String, max_size: usize },
}

/// Errors reported by the backing document store.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("Document not found: {collection}/{doc_id}")]
    NotFound { collection: String, doc_id: String },

    #[error("Write rejected for {collection}/{doc_id}: {reason}")]
    WriteRejected {
        collection: String,
        doc_id: String,
        reason: String,
    },

    #[error("Batch of {size} operations exceeds the store limit of {max}")]
    BatchTooLarge { size: usize, max: usize },

    #[error("Store unavailable: {reason}")]
    Unavailable { reason: String },
}

/// Configuration errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid value for {field}: {value} - {reason}")]
    InvalidValue {
        field: String,
        value: String,
        reason: String,
    },
}

/// Geospatial errors.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum GeoError {
    #[error("Invalid coordinate: lat {lat}, lng {lng}")]
    InvalidCoordinate { lat: f64, lng: f64 },

    #[error("Invalid radius: {radius_km}km")]
    InvalidRadius { radius_km: f64 },

    #[error("Geohash precision {precision} outside 1..=12")]
    InvalidPrecision { precision: usize },

    #[error("Invalid geohash: {hash}")]
    InvalidGeohash { hash: String },
}

/// Master error type for all BALLAST errors.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum BallastError {
    #[error("Admission error: {0}")]
    Admission(#[from] AdmissionError),

    #[error("Remote error: {0}")]
    Remote(#[from] RemoteError),

    #[error("Capacity error: {0}")]
    Capacity(#[from] CapacityError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    #[error("Geo error: {0}")]
    Geo(#[from] GeoError),
}

impl BallastError {
    /// Whether the caller may sensibly retry the same operation later.
    pub fn is_retryable(&self) -> bool {
        match self {
            BallastError::Admission(_) | BallastError::Capacity(_) => true,
            BallastError::Remote(_) => true,
            BallastError::Store(StoreError::Unavailable { .. }) => true,
            BallastError::Store(_) | BallastError::Config(_) | BallastError::Geo(_) => false,
        }
    }

    /// Retry guidance carried by admission errors.
    pub fn retry_after_ms(&self) -> Option<u64> {
        match self {
            BallastError::Admission(AdmissionError::RateLimited { retry_after_ms, .. }) => {
                Some(*retry_after_ms)
            }
            _ => None,
        }
    }

    /// Shorthand for a failed remote call.
    pub fn call_failed(dependency: impl Into<String>, reason: impl Into<String>) -> Self {
        BallastError::Remote(RemoteError::CallFailed {
            dependency: dependency.into(),
            reason: reason.into(),
        })
    }
}

/// Result type alias for BALLAST operations.
pub type BallastResult<T> = Result<T, BallastError>;

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rate_limited_display_carries_retry_hint() {
        let err = AdmissionError::RateLimited {
            key: "10.0.0.1".to_string(),
            retry_after_ms: 20,
        };
        let msg = format!("{}", err);
        assert!(msg.contains("10.0.0.1"));
        assert!(msg.contains("20ms"));
    }

    #[test]
    fn test_master_error_from_conversions() {
        let err: BallastError = CapacityError::QueueFull {
            queue: "analytics".to_string(),
            max_size: 10,
        }
        .into();
        assert!(matches!(err, BallastError::Capacity(_)));
        assert!(err.is_retryable());

        let err: BallastError = StoreError::BatchTooLarge { size: 600, max: 500 }.into();
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_retry_after_only_for_admission() {
        let limited: BallastError = AdmissionError::RateLimited {
            key: "k".to_string(),
            retry_after_ms: 150,
        }
        .into();
        assert_eq!(limited.retry_after_ms(), Some(150));

        let remote = BallastError::call_failed("maps", "connection reset");
        assert_eq!(remote.retry_after_ms(), None);
        assert!(remote.to_string().contains("maps"));
    }
}
