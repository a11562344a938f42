//! BALLAST Cache - Hot-path caching
//!
//! Capacity-bounded LRU caches with per-entry TTL, a cache-aside helper, and
//! the background sweep that purges expired entries nobody reads.

pub mod hot_cache;
pub mod read_through;
pub mod sweep;

pub use hot_cache::{CacheConfig, CacheStats, HotCache};
pub use read_through::cache_aside;
pub use sweep::{expiry_sweep_task, sweep_all, Sweepable};
