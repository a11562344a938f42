//! Token-bucket rate limiting.
//!
//! One bucket per client key, created full on first sight and refilled
//! lazily inside `consume`. The bucket table is an LRU bounded at
//! `max_clients`; every `consume` refills and promotes its key, so the entry
//! evicted at the ceiling is always the least-recently-refilled one.

use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Instant;

use ballast_core::constants::{
    DEFAULT_GLOBAL_MAX_TOKENS, DEFAULT_GLOBAL_REFILL_PER_SEC, DEFAULT_RATE_LIMIT_MAX_CLIENTS,
    DEFAULT_RATE_LIMIT_MAX_TOKENS, DEFAULT_RATE_LIMIT_REFILL_PER_SEC,
};
use ballast_core::{lock_unpoisoned, system_clock, SharedClock};
use lru::LruCache;
use serde::Serialize;

// ============================================================================
// TOKEN MATH
// ============================================================================

/// Tokens available after `elapsed_secs` idle, capped at `capacity`.
#[inline]
pub fn replenished_tokens(
    current: f64,
    elapsed_secs: f64,
    refill_per_sec: f64,
    capacity: f64,
) -> f64 {
    (current + elapsed_secs.max(0.0) * refill_per_sec).min(capacity)
}

/// Milliseconds until `cost` tokens are available, rounded up.
#[inline]
pub fn retry_after_ms(available: f64, cost: f64, refill_per_sec: f64) -> u64 {
    let deficit = cost - available;
    if deficit <= 0.0 {
        return 0;
    }
    if refill_per_sec <= 0.0 {
        return u64::MAX;
    }
    (deficit * 1000.0 / refill_per_sec).ceil() as u64
}

// ============================================================================
// CONFIGURATION
// ============================================================================

/// Configuration for one token-bucket limiter.
#[derive(Debug, Clone, PartialEq)]
pub struct RateLimiterConfig {
    /// Bucket capacity (burst size)
    pub max_tokens: u32,
    /// Tokens added per second
    pub refill_per_sec: f64,
    /// Ceiling on tracked keys
    pub max_clients: usize,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            max_tokens: DEFAULT_RATE_LIMIT_MAX_TOKENS,
            refill_per_sec: DEFAULT_RATE_LIMIT_REFILL_PER_SEC,
            max_clients: DEFAULT_RATE_LIMIT_MAX_CLIENTS,
        }
    }
}

impl RateLimiterConfig {
    pub fn new(max_tokens: u32, refill_per_sec: f64) -> Self {
        Self {
            max_tokens,
            refill_per_sec,
            ..Self::default()
        }
    }

    /// A single-key limiter used as a process-wide ceiling.
    pub fn global() -> Self {
        Self {
            max_tokens: DEFAULT_GLOBAL_MAX_TOKENS,
            refill_per_sec: DEFAULT_GLOBAL_REFILL_PER_SEC,
            max_clients: 1,
        }
    }

    pub fn with_max_clients(mut self, max_clients: usize) -> Self {
        self.max_clients = max_clients;
        self
    }

    /// Per-client limiter configuration from environment variables.
    ///
    /// # Environment Variables
    /// - `BALLAST_RATE_LIMIT_MAX_TOKENS`: Burst size per client (default: 100)
    /// - `BALLAST_RATE_LIMIT_REFILL_PER_SEC`: Refill rate per client (default: 50)
    /// - `BALLAST_RATE_LIMIT_MAX_CLIENTS`: Tracked client ceiling (default: 10000)
    pub fn from_env() -> Self {
        let max_tokens = std::env::var("BALLAST_RATE_LIMIT_MAX_TOKENS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(DEFAULT_RATE_LIMIT_MAX_TOKENS);

        let refill_per_sec = std::env::var("BALLAST_RATE_LIMIT_REFILL_PER_SEC")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(DEFAULT_RATE_LIMIT_REFILL_PER_SEC);

        let max_clients = std::env::var("BALLAST_RATE_LIMIT_MAX_CLIENTS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(DEFAULT_RATE_LIMIT_MAX_CLIENTS);

        Self {
            max_tokens,
            refill_per_sec,
            max_clients,
        }
    }

    /// Global ceiling configuration from environment variables.
    ///
    /// # Environment Variables
    /// - `BALLAST_GLOBAL_RATE_MAX_TOKENS`: Global burst size (default: 20000)
    /// - `BALLAST_GLOBAL_RATE_REFILL_PER_SEC`: Global refill rate (default: 10000)
    pub fn global_from_env() -> Self {
        let max_tokens = std::env::var("BALLAST_GLOBAL_RATE_MAX_TOKENS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(DEFAULT_GLOBAL_MAX_TOKENS);

        let refill_per_sec = std::env::var("BALLAST_GLOBAL_RATE_REFILL_PER_SEC")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(DEFAULT_GLOBAL_REFILL_PER_SEC);

        Self {
            max_tokens,
            refill_per_sec,
            max_clients: 1,
        }
    }
}

// ============================================================================
// LIMITER
// ============================================================================

/// Outcome of a single `consume`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RateLimitDecision {
    pub allowed: bool,
    /// Whole tokens left in the bucket after this call
    pub remaining: u32,
    /// Zero when allowed
    pub retry_after_ms: u64,
}

#[derive(Debug, Clone, Copy)]
struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

/// Counters and table size for one limiter.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RateLimiterStats {
    pub name: String,
    pub tracked_clients: usize,
    pub max_clients: usize,
    pub allowed: u64,
    pub denied: u64,
}

/// Per-key token buckets with a bounded key table.
pub struct RateLimiter {
    name: String,
    config: RateLimiterConfig,
    buckets: Mutex<LruCache<String, BucketState>>,
    clock: SharedClock,
    allowed: AtomicU64,
    denied: AtomicU64,
}

impl RateLimiter {
    pub fn new(name: impl Into<String>, config: RateLimiterConfig) -> Self {
        Self::with_clock(name, config, system_clock())
    }

    pub fn with_clock(
        name: impl Into<String>,
        config: RateLimiterConfig,
        clock: SharedClock,
    ) -> Self {
        let capacity = NonZeroUsize::new(config.max_clients).unwrap_or(NonZeroUsize::MIN);
        Self {
            name: name.into(),
            config,
            buckets: Mutex::new(LruCache::new(capacity)),
            clock,
            allowed: AtomicU64::new(0),
            denied: AtomicU64::new(0),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &RateLimiterConfig {
        &self.config
    }

    /// Take one token for `key`.
    pub fn consume(&self, key: &str) -> RateLimitDecision {
        self.consume_n(key, 1)
    }

    /// Take `cost` tokens for `key` atomically. A cost above `max_tokens`
    /// can never be satisfied; callers charging batches should clamp it.
    pub fn consume_n(&self, key: &str, cost: u32) -> RateLimitDecision {
        let now = self.clock.now();
        let capacity = f64::from(self.config.max_tokens);
        let rate = self.config.refill_per_sec;
        let cost = f64::from(cost);

        let mut buckets = lock_unpoisoned(&self.buckets);
        // Re-pushing moves the key to the most-recently-refilled end.
        let mut bucket = buckets.pop(key).unwrap_or(BucketState {
            tokens: capacity,
            last_refill: now,
        });

        let elapsed = now.saturating_duration_since(bucket.last_refill).as_secs_f64();
        bucket.tokens = replenished_tokens(bucket.tokens, elapsed, rate, capacity);
        bucket.last_refill = now;

        let decision = if bucket.tokens >= cost {
            bucket.tokens -= cost;
            self.allowed.fetch_add(1, Ordering::Relaxed);
            RateLimitDecision {
                allowed: true,
                remaining: bucket.tokens.floor() as u32,
                retry_after_ms: 0,
            }
        } else {
            self.denied.fetch_add(1, Ordering::Relaxed);
            RateLimitDecision {
                allowed: false,
                remaining: bucket.tokens.floor() as u32,
                retry_after_ms: retry_after_ms(bucket.tokens, cost, rate),
            }
        };

        buckets.push(key.to_string(), bucket);
        decision
    }

    /// Tokens `key` would have right now, without consuming or promoting.
    /// Unknown keys report a full bucket.
    pub fn available(&self, key: &str) -> f64 {
        let now = self.clock.now();
        let capacity = f64::from(self.config.max_tokens);
        let buckets = lock_unpoisoned(&self.buckets);
        match buckets.peek(key) {
            Some(bucket) => {
                let elapsed = now.saturating_duration_since(bucket.last_refill).as_secs_f64();
                replenished_tokens(bucket.tokens, elapsed, self.config.refill_per_sec, capacity)
            }
            None => capacity,
        }
    }

    /// Forget a key; its next request starts with a full bucket.
    pub fn reset(&self, key: &str) -> bool {
        lock_unpoisoned(&self.buckets).pop(key).is_some()
    }

    pub fn tracked_clients(&self) -> usize {
        lock_unpoisoned(&self.buckets).len()
    }

    pub fn stats(&self) -> RateLimiterStats {
        RateLimiterStats {
            name: self.name.clone(),
            tracked_clients: self.tracked_clients(),
            max_clients: self.config.max_clients,
            allowed: self.allowed.load(Ordering::Relaxed),
            denied: self.denied.load(Ordering::Relaxed),
        }
    }
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("name", &self.name)
            .field("config", &self.config)
            .field("tracked_clients", &self.tracked_clients())
            .finish()
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use ballast_core::ManualClock;
    use proptest::prelude::*;
    use std::sync::Arc;
    use std::time::Duration;

    fn limiter(max_tokens: u32, rate: f64) -> (RateLimiter, Arc<ManualClock>) {
        let clock = ManualClock::shared();
        let limiter =
            RateLimiter::with_clock("test", RateLimiterConfig::new(max_tokens, rate), clock.clone());
        (limiter, clock)
    }

    #[test]
    fn test_burst_of_100_then_denied() {
        let (limiter, _clock) = limiter(100, 50.0);

        for i in 0..100 {
            let decision = limiter.consume("client-a");
            assert!(decision.allowed, "call {} should be allowed", i);
            assert_eq!(decision.remaining, 99 - i);
        }

        let denied = limiter.consume("client-a");
        assert!(!denied.allowed);
        assert!(denied.retry_after_ms > 0);
        // One token at 50/s takes 20ms
        assert_eq!(denied.retry_after_ms, 20);
    }

    #[test]
    fn test_keys_are_independent() {
        let (limiter, _clock) = limiter(1, 1.0);
        assert!(limiter.consume("a").allowed);
        assert!(!limiter.consume("a").allowed);
        assert!(limiter.consume("b").allowed);
    }

    #[test]
    fn test_refill_after_idle() {
        let (limiter, clock) = limiter(10, 2.0);
        for _ in 0..10 {
            limiter.consume("k");
        }
        assert!(!limiter.consume("k").allowed);

        clock.advance(Duration::from_secs(1));
        // 1s * 2/s = 2 tokens
        assert!(limiter.consume("k").allowed);
        assert!(limiter.consume("k").allowed);
        assert!(!limiter.consume("k").allowed);
    }

    #[test]
    fn test_refill_is_capped() {
        let (limiter, clock) = limiter(10, 100.0);
        limiter.consume("k");
        clock.advance(Duration::from_secs(60));
        assert_eq!(limiter.available("k"), 10.0);
    }

    #[test]
    fn test_max_clients_evicts_least_recently_refilled() {
        let clock = ManualClock::shared();
        let config = RateLimiterConfig::new(5, 1.0).with_max_clients(2);
        let limiter = RateLimiter::with_clock("test", config, clock);

        limiter.consume("a");
        limiter.consume("b");
        limiter.consume("a");
        limiter.consume("c");

        assert_eq!(limiter.tracked_clients(), 2);
        // b was touched least recently, so it was dropped and starts full again
        assert_eq!(limiter.available("b"), 5.0);
        assert_eq!(limiter.available("a"), 3.0);
    }

    #[test]
    fn test_consume_n_charges_batch_cost() {
        let (limiter, _clock) = limiter(500, 1000.0);
        assert!(limiter.consume_n("store", 500).allowed);
        let denied = limiter.consume_n("store", 100);
        assert!(!denied.allowed);
        assert_eq!(denied.retry_after_ms, 100);
    }

    #[test]
    fn test_stats_count_decisions() {
        let (limiter, _clock) = limiter(1, 1.0);
        limiter.consume("a");
        limiter.consume("a");
        let stats = limiter.stats();
        assert_eq!(stats.allowed, 1);
        assert_eq!(stats.denied, 1);
        assert_eq!(stats.tracked_clients, 1);
    }

    #[test]
    fn test_retry_after_rounds_up() {
        assert_eq!(retry_after_ms(0.0, 1.0, 3.0), 334);
        assert_eq!(retry_after_ms(0.5, 1.0, 1.0), 500);
        assert_eq!(retry_after_ms(2.0, 1.0, 1.0), 0);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        /// A fresh bucket admits exactly `max_tokens` immediate calls.
        #[test]
        fn prop_fresh_bucket_admits_exactly_capacity(max_tokens in 1u32..300) {
            let (limiter, _clock) = limiter(max_tokens, 10.0);
            let allowed = (0..max_tokens + 5)
                .filter(|_| limiter.consume("k").allowed)
                .count();
            prop_assert_eq!(allowed as u32, max_tokens);
        }

        /// Tokens after idle time follow min(cap, before + elapsed * rate).
        #[test]
        fn prop_refill_law(
            max_tokens in 1u32..1_000,
            rate in 0.5f64..500.0,
            spent in 0u32..1_000,
            idle_ms in 0u64..10_000,
        ) {
            let spent = spent.min(max_tokens);
            let (limiter, clock) = limiter(max_tokens, rate);
            if spent > 0 {
                prop_assert!(limiter.consume_n("k", spent).allowed);
            }
            let before = f64::from(max_tokens - spent);

            clock.advance_ms(idle_ms);
            let expected = (before + idle_ms as f64 / 1000.0 * rate).min(f64::from(max_tokens));
            let actual = limiter.available("k");
            prop_assert!((actual - expected).abs() < 1e-6, "expected {} got {}", expected, actual);
            prop_assert!(actual >= 0.0 && actual <= f64::from(max_tokens));
        }
    }
}
