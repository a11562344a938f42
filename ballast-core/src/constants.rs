//! Default values shared across BALLAST crates.
//!
//! Centralizing defaults keeps `Default` impls and `from_env` fallbacks in
//! agreement.

// ============================================================================
// RATE LIMITING
// ============================================================================

/// Per-client burst size
pub const DEFAULT_RATE_LIMIT_MAX_TOKENS: u32 = 100;

/// Per-client refill rate (tokens per second)
pub const DEFAULT_RATE_LIMIT_REFILL_PER_SEC: f64 = 50.0;

/// Ceiling on tracked clients before least-recently-refilled eviction
pub const DEFAULT_RATE_LIMIT_MAX_CLIENTS: usize = 10_000;

/// Global admission burst size
pub const DEFAULT_GLOBAL_MAX_TOKENS: u32 = 20_000;

/// Global admission refill rate (tokens per second)
pub const DEFAULT_GLOBAL_REFILL_PER_SEC: f64 = 10_000.0;

/// Synthetic key charged by the global admission limiter
pub const GLOBAL_ADMISSION_KEY: &str = "__global__";

// ============================================================================
// CIRCUIT BREAKER
// ============================================================================

/// Consecutive failures before the circuit opens
pub const DEFAULT_CIRCUIT_FAILURE_THRESHOLD: u32 = 5;

/// Time the circuit stays open before a trial call (seconds)
pub const DEFAULT_CIRCUIT_RECOVERY_TIMEOUT_SECS: u64 = 30;

/// Upper bound on a single wrapped call (milliseconds)
pub const DEFAULT_CIRCUIT_CALL_TIMEOUT_MS: u64 = 10_000;

// ============================================================================
// HOT CACHE
// ============================================================================

/// Maximum entries per cache instance
pub const DEFAULT_CACHE_MAX_SIZE: usize = 1_000;

/// Entry TTL when the caller does not pick one (seconds)
pub const DEFAULT_CACHE_TTL_SECS: u64 = 300;

/// Interval of the proactive expiry sweep (seconds)
pub const DEFAULT_CACHE_SWEEP_INTERVAL_SECS: u64 = 60;

// ============================================================================
// WRITE COALESCER
// ============================================================================

/// Merge window before a pending write becomes eligible to flush (ms)
pub const DEFAULT_COALESCE_WINDOW_MS: u64 = 2_000;

/// How often the coalescer checks for eligible writes (ms)
pub const DEFAULT_COALESCE_FLUSH_INTERVAL_MS: u64 = 1_000;

// ============================================================================
// BATCH WRITER
// ============================================================================

/// Hard per-batch operation ceiling imposed by the document store
pub const STORE_MAX_BATCH_OPS: usize = 500;

/// Batch writer timer (ms)
pub const DEFAULT_BATCH_FLUSH_INTERVAL_MS: u64 = 1_000;

/// Store write ceiling (operations per second)
pub const DEFAULT_STORE_WRITES_PER_SEC: f64 = 1_000.0;

/// Key charged on the store throttle
pub const STORE_THROTTLE_KEY: &str = "__store_writes__";

// ============================================================================
// WRITE QUEUE
// ============================================================================

/// Maximum queued items before enqueue reports backpressure
pub const DEFAULT_QUEUE_MAX_SIZE: usize = 10_000;

/// Items handed to the processor per cycle
pub const DEFAULT_QUEUE_BATCH_SIZE: usize = 100;

/// Queue processing timer (ms)
pub const DEFAULT_QUEUE_FLUSH_INTERVAL_MS: u64 = 1_000;

/// Attempts after the first before an item is reported as failed
pub const DEFAULT_QUEUE_MAX_RETRIES: u32 = 3;

/// Base delay for exponential retry backoff (ms)
pub const DEFAULT_QUEUE_RETRY_BACKOFF_MS: u64 = 500;

// ============================================================================
// SPATIAL INDEX
// ============================================================================

/// Geohash precision for index cells (~1.2km x 0.6km)
pub const DEFAULT_GEOHASH_PRECISION: usize = 6;

/// Neighbour rings searched before falling back to a full scan
pub const DEFAULT_MAX_SEARCH_RINGS: u32 = 8;

/// Mean Earth radius used by the haversine formula (km)
pub const EARTH_RADIUS_KM: f64 = 6371.0;

// ============================================================================
// LIFECYCLE
// ============================================================================

/// Upper bound on the graceful shutdown sequence (seconds)
pub const DEFAULT_SHUTDOWN_TIMEOUT_SECS: u64 = 10;
