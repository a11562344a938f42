//! BALLAST Resilience - Admission and fault isolation
//!
//! Token-bucket rate limiting (per client and global) and circuit breakers
//! wrapping every call to a remote dependency.

pub mod admission;
pub mod circuit_breaker;
pub mod rate_limiter;
pub mod registry;

pub use admission::{AdmissionConfig, AdmissionControl, AdmissionStats};
pub use circuit_breaker::{BreakerSnapshot, CircuitBreaker, CircuitBreakerConfig};
pub use rate_limiter::{
    replenished_tokens, retry_after_ms, RateLimitDecision, RateLimiter, RateLimiterConfig,
    RateLimiterStats,
};
pub use registry::BreakerRegistry;
