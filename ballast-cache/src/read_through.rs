//! Cache-aside reads.
//!
//! A miss calls the fetcher, caches a `Some` result and returns it. `None`
//! results are not cached and errors propagate unchanged. The cache lock is
//! never held while the fetcher runs, so two concurrent misses on one key may
//! both fetch; the later `set` wins.

use std::future::Future;
use std::hash::Hash;
use std::time::Duration;

use crate::hot_cache::HotCache;

/// Look `key` up in `cache`, falling back to `fetch` on a miss.
pub async fn cache_aside<K, V, E, F, Fut>(
    cache: &HotCache<K, V>,
    key: K,
    ttl: Duration,
    fetch: F,
) -> Result<Option<V>, E>
where
    K: Hash + Eq + Clone,
    V: Clone,
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<Option<V>, E>>,
{
    if let Some(hit) = cache.get(&key) {
        return Ok(Some(hit));
    }

    let fetched = fetch().await?;
    if let Some(value) = &fetched {
        cache.set(key, value.clone(), ttl);
    }
    Ok(fetched)
}
