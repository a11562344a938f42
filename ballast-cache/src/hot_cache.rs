//! Capacity-bounded LRU cache with per-entry TTL.
//!
//! All operations take one short critical section and never await, so a
//! cache call is atomic with respect to every other logical operation.
//!
//! Expiry is enforced twice: lazily on `get`/`has`, and proactively by
//! [`HotCache::purge_expired`], which the background sweep calls on a fixed
//! interval so never-read keys do not pin memory.

use std::hash::Hash;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use ballast_core::constants::{
    DEFAULT_CACHE_MAX_SIZE, DEFAULT_CACHE_SWEEP_INTERVAL_SECS, DEFAULT_CACHE_TTL_SECS,
};
use ballast_core::{lock_unpoisoned, system_clock, SharedClock};
use lru::LruCache;
use serde::Serialize;

// ============================================================================
// CONFIGURATION
// ============================================================================

/// Configuration for a hot cache instance.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Maximum number of live entries.
    pub max_size: usize,
    /// TTL applied by [`HotCache::insert`].
    pub default_ttl: Duration,
    /// Interval of the background expiry sweep.
    pub sweep_interval: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_size: DEFAULT_CACHE_MAX_SIZE,
            default_ttl: Duration::from_secs(DEFAULT_CACHE_TTL_SECS),
            sweep_interval: Duration::from_secs(DEFAULT_CACHE_SWEEP_INTERVAL_SECS),
        }
    }
}

impl CacheConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create CacheConfig from environment variables.
    ///
    /// # Environment Variables
    /// - `BALLAST_CACHE_MAX_SIZE`: Maximum entries per cache (default: 1000)
    /// - `BALLAST_CACHE_TTL_SECS`: Default entry TTL (default: 300)
    /// - `BALLAST_CACHE_SWEEP_INTERVAL_SECS`: Expiry sweep interval (default: 60)
    pub fn from_env() -> Self {
        let max_size = std::env::var("BALLAST_CACHE_MAX_SIZE")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(DEFAULT_CACHE_MAX_SIZE);

        let default_ttl = Duration::from_secs(
            std::env::var("BALLAST_CACHE_TTL_SECS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(DEFAULT_CACHE_TTL_SECS),
        );

        let sweep_interval = Duration::from_secs(
            std::env::var("BALLAST_CACHE_SWEEP_INTERVAL_SECS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(DEFAULT_CACHE_SWEEP_INTERVAL_SECS),
        );

        Self {
            max_size,
            default_ttl,
            sweep_interval,
        }
    }

    /// Set the maximum size.
    pub fn with_max_size(mut self, max_size: usize) -> Self {
        self.max_size = max_size;
        self
    }

    /// Set the default TTL.
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.default_ttl = ttl;
        self
    }

    /// Set the sweep interval.
    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }
}

// ============================================================================
// STATS
// ============================================================================

/// Statistics about cache usage.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CacheStats {
    /// Cache instance name.
    pub name: String,
    /// Number of entries currently held (may include not-yet-swept expired entries).
    pub size: usize,
    /// Capacity.
    pub max_size: usize,
    /// Number of cache hits.
    pub hits: u64,
    /// Number of cache misses.
    pub misses: u64,
    /// `hits / (hits + misses)`, or 0.0 before any lookup.
    pub hit_rate: f64,
    /// Entries dropped to make room.
    pub evictions: u64,
    /// Entries dropped because their TTL passed.
    pub expirations: u64,
}

fn compute_hit_rate(hits: u64, misses: u64) -> f64 {
    let total = hits + misses;
    if total == 0 {
        0.0
    } else {
        hits as f64 / total as f64
    }
}

// ============================================================================
// CACHE
// ============================================================================

struct CacheEntry<V> {
    value: V,
    /// `None` when the TTL reaches past what `Instant` can represent
    expires_at: Option<Instant>,
}

impl<V> CacheEntry<V> {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| now > at)
    }
}

/// Bounded LRU + TTL cache.
pub struct HotCache<K, V>
where
    K: Hash + Eq,
{
    name: String,
    entries: Mutex<LruCache<K, CacheEntry<V>>>,
    max_size: usize,
    default_ttl: Duration,
    clock: SharedClock,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    expirations: AtomicU64,
}

impl<K, V> HotCache<K, V>
where
    K: Hash + Eq + Clone,
    V: Clone,
{
    /// Create a cache on the system clock.
    pub fn new(name: impl Into<String>, config: &CacheConfig) -> Self {
        Self::with_clock(name, config, system_clock())
    }

    /// Create a cache reading time from `clock`.
    pub fn with_clock(name: impl Into<String>, config: &CacheConfig, clock: SharedClock) -> Self {
        let capacity = NonZeroUsize::new(config.max_size).unwrap_or(NonZeroUsize::MIN);
        Self {
            name: name.into(),
            entries: Mutex::new(LruCache::new(capacity)),
            max_size: capacity.get(),
            default_ttl: config.default_ttl,
            clock,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            expirations: AtomicU64::new(0),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn default_ttl(&self) -> Duration {
        self.default_ttl
    }

    /// Look up a key, promoting it to most-recently-used.
    ///
    /// An expired entry is treated as absent and removed.
    pub fn get(&self, key: &K) -> Option<V> {
        let now = self.clock.now();
        let mut entries = lock_unpoisoned(&self.entries);

        let expired = match entries.peek(key) {
            Some(entry) => entry.is_expired(now),
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                return None;
            }
        };

        if expired {
            entries.pop(key);
            self.expirations.fetch_add(1, Ordering::Relaxed);
            self.misses.fetch_add(1, Ordering::Relaxed);
            return None;
        }

        self.hits.fetch_add(1, Ordering::Relaxed);
        entries.get(key).map(|entry| entry.value.clone())
    }

    /// Insert with an explicit TTL. The key becomes most-recently-used; at
    /// capacity the least-recently-used entry is evicted. A TTL too large to
    /// add to the clock never expires.
    pub fn set(&self, key: K, value: V, ttl: Duration) {
        let expires_at = self.clock.now().checked_add(ttl);
        let mut entries = lock_unpoisoned(&self.entries);

        let replaced_same_key = entries.contains(&key);
        let displaced = entries.push(key, CacheEntry { value, expires_at });

        if displaced.is_some() && !replaced_same_key {
            self.evictions.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Insert with the configured default TTL.
    pub fn insert(&self, key: K, value: V) {
        self.set(key, value, self.default_ttl);
    }

    /// Remove a key. Returns whether a live or expired entry was present.
    pub fn delete(&self, key: &K) -> bool {
        lock_unpoisoned(&self.entries).pop(key).is_some()
    }

    /// Whether a non-expired entry exists. Does not promote the key and does
    /// not count as a hit or miss.
    pub fn has(&self, key: &K) -> bool {
        let now = self.clock.now();
        let mut entries = lock_unpoisoned(&self.entries);

        match entries.peek(key).map(|entry| entry.is_expired(now)) {
            Some(false) => true,
            Some(true) => {
                entries.pop(key);
                self.expirations.fetch_add(1, Ordering::Relaxed);
                false
            }
            None => false,
        }
    }

    /// Remove every expired entry. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = self.clock.now();
        let mut entries = lock_unpoisoned(&self.entries);

        let expired: Vec<K> = entries
            .iter()
            .filter(|(_, entry)| entry.is_expired(now))
            .map(|(key, _)| key.clone())
            .collect();

        for key in &expired {
            entries.pop(key);
        }

        self.expirations
            .fetch_add(expired.len() as u64, Ordering::Relaxed);
        expired.len()
    }

    /// Number of held entries, including expired ones not yet swept.
    pub fn len(&self) -> usize {
        lock_unpoisoned(&self.entries).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        lock_unpoisoned(&self.entries).clear();
    }

    pub fn stats(&self) -> CacheStats {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        CacheStats {
            name: self.name.clone(),
            size: self.len(),
            max_size: self.max_size,
            hits,
            misses,
            hit_rate: compute_hit_rate(hits, misses),
            evictions: self.evictions.load(Ordering::Relaxed),
            expirations: self.expirations.load(Ordering::Relaxed),
        }
    }

    pub fn hit_rate(&self) -> f64 {
        compute_hit_rate(
            self.hits.load(Ordering::Relaxed),
            self.misses.load(Ordering::Relaxed),
        )
    }
}

impl<K, V> std::fmt::Debug for HotCache<K, V>
where
    K: Hash + Eq,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HotCache")
            .field("name", &self.name)
            .field("max_size", &self.max_size)
            .field("default_ttl", &self.default_ttl)
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

    fn cache_with_clock(max_size: usize) -> (HotCache<String, i32>, Arc<ManualClock>) {
        let clock = ManualClock::shared();
        let config = CacheConfig::new()
            .with_max_size(max_size)
            .with_ttl(Duration::from_secs(60));
        (HotCache::with_clock("test", &config, clock.clone()), clock)
    }

    #[test]
    fn test_capacity_two_evicts_oldest() {
        let (cache, _clock) = cache_with_clock(2);
        cache.insert("a".to_string(), 1);
        cache.insert("b".to_string(), 2);
        cache.insert("c".to_string(), 3);

        assert!(!cache.has(&"a".to_string()));
        assert!(cache.has(&"b".to_string()));
        assert!(cache.has(&"c".to_string()));
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.stats().evictions, 1);
    }

    #[test]
    fn test_get_promotes_to_most_recently_used() {
        let (cache, _clock) = cache_with_clock(2);
        cache.insert("a".to_string(), 1);
        cache.insert("b".to_string(), 2);

        // Touch a so b becomes the eviction candidate
        assert_eq!(cache.get(&"a".to_string()), Some(1));
        cache.insert("c".to_string(), 3);

        assert!(cache.has(&"a".to_string()));
        assert!(!cache.has(&"b".to_string()));
    }

    #[test]
    fn test_overwrite_same_key_is_not_an_eviction() {
        let (cache, _clock) = cache_with_clock(2);
        cache.insert("a".to_string(), 1);
        cache.insert("a".to_string(), 10);

        assert_eq!(cache.get(&"a".to_string()), Some(10));
        assert_eq!(cache.stats().evictions, 0);
    }

    #[test]
    fn test_expired_entry_is_absent_and_removed() {
        let (cache, clock) = cache_with_clock(10);
        cache.set("k".to_string(), 7, Duration::from_secs(5));

        clock.advance(Duration::from_secs(5));
        assert_eq!(cache.get(&"k".to_string()), Some(7), "valid until strictly past expiry");

        clock.advance(Duration::from_millis(1));
        assert_eq!(cache.get(&"k".to_string()), None);
        assert_eq!(cache.len(), 0);
        assert_eq!(cache.stats().expirations, 1);
    }

    #[test]
    fn test_unbounded_ttl_never_expires() {
        let (cache, clock) = cache_with_clock(10);
        cache.set("k".to_string(), 7, Duration::MAX);

        clock.advance(Duration::from_secs(10 * 365 * 24 * 3600));
        assert_eq!(cache.get(&"k".to_string()), Some(7));
        assert_eq!(cache.purge_expired(), 0);
        assert_eq!(cache.stats().expirations, 0);
    }

    #[test]
    fn test_purge_expired_removes_unread_keys() {
        let (cache, clock) = cache_with_clock(10);
        cache.set("short".to_string(), 1, Duration::from_secs(1));
        cache.set("long".to_string(), 2, Duration::from_secs(100));

        clock.advance(Duration::from_secs(2));
        assert_eq!(cache.purge_expired(), 1);
        assert_eq!(cache.len(), 1);
        assert!(cache.has(&"long".to_string()));
    }

    #[test]
    fn test_hit_rate() {
        let (cache, _clock) = cache_with_clock(10);
        assert_eq!(cache.hit_rate(), 0.0);

        cache.insert("a".to_string(), 1);
        cache.get(&"a".to_string());
        cache.get(&"a".to_string());
        cache.get(&"a".to_string());
        cache.get(&"missing".to_string());

        let stats = cache.stats();
        assert_eq!(stats.hits, 3);
        assert_eq!(stats.misses, 1);
        assert!((stats.hit_rate - 0.75).abs() < f64::EPSILON);
    }

    #[test]
    fn test_delete_and_clear() {
        let (cache, _clock) = cache_with_clock(10);
        cache.insert("a".to_string(), 1);
        cache.insert("b".to_string(), 2);

        assert!(cache.delete(&"a".to_string()));
        assert!(!cache.delete(&"a".to_string()));
        cache.clear();
        assert!(cache.is_empty());
    }

    #[test]
    fn test_zero_capacity_is_clamped_to_one() {
        let (cache, _clock) = cache_with_clock(0);
        cache.insert("a".to_string(), 1);
        cache.insert("b".to_string(), 2);
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.stats().max_size, 1);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        /// Inserting distinct keys into a cache of capacity N leaves exactly
        /// the last N keys present.
        #[test]
        fn prop_lru_keeps_most_recent_keys(
            capacity in 1usize..16,
            count in 1usize..64,
        ) {
            let (cache, _clock) = cache_with_clock(capacity);
            for i in 0..count {
                cache.insert(format!("k{}", i), i as i32);
            }

            let kept = count.min(capacity);
            prop_assert_eq!(cache.len(), kept);
            for i in 0..count {
                let present = cache.has(&format!("k{}", i));
                prop_assert_eq!(present, i >= count - kept);
            }
        }

        /// No value is ever returned once its TTL has strictly elapsed.
        #[test]
        fn prop_get_never_returns_expired(
            ttl_ms in 0u64..1_000,
            advance_ms in 0u64..2_000,
        ) {
            let (cache, clock) = cache_with_clock(4);
            cache.set("k".to_string(), 1, Duration::from_millis(ttl_ms));
            clock.advance_ms(advance_ms);

            let got = cache.get(&"k".to_string());
            if advance_ms > ttl_ms {
                prop_assert_eq!(got, None);
            } else {
                prop_assert_eq!(got, Some(1));
            }
        }
    }
}
