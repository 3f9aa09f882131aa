//! Model cache.
//!
//! Time-bounded cache in front of the metadata store and serving backend,
//! holding one snapshot per key (the active set of a model family, or its single
//! active model). Snapshots are immutable and shared as `Arc`s; a refresh swaps
//! the whole entry, so concurrent readers never see a partial one.
//!
//! Empty snapshots are never cached: an empty active set is an unhealthy
//! condition that must be retried on the next read.

use crate::error::{CanariaError, Result};
use lru::LruCache;
use metrics::counter;
use std::future::Future;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::{debug, info};

/// Default time-to-live of an entry.
pub const DEFAULT_TTL: Duration = Duration::from_secs(600);
/// Default number of entries.
pub const DEFAULT_CAPACITY: usize = 10;

/// Values that can tell whether they are worth caching.
pub trait Cacheable {
    fn is_empty(&self) -> bool;
}

impl<T> Cacheable for Vec<T> {
    fn is_empty(&self) -> bool {
        Vec::is_empty(self)
    }
}

impl<T> Cacheable for Option<T> {
    fn is_empty(&self) -> bool {
        self.is_none()
    }
}

/// Cache statistics.
#[derive(Debug, Clone, Default)]
pub struct CacheStats {
    /// Total number of cache hits.
    pub hits: u64,
    /// Total number of cache misses.
    pub misses: u64,
    /// Fetches that returned nothing cacheable.
    pub empty_fetches: u64,
    /// Explicit invalidations.
    pub invalidations: u64,
    /// Current number of cached entries.
    pub entries: usize,
}

impl CacheStats {
    /// Calculate hit ratio.
    pub fn hit_ratio(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            return 0.0;
        }
        self.hits as f64 / total as f64
    }
}

struct CacheEntry<V> {
    value: Arc<V>,
    cached_at: Instant,
}

impl<V> CacheEntry<V> {
    fn age(&self) -> Duration {
        self.cached_at.elapsed()
    }
}

/// TTL cache of immutable snapshots.
pub struct ModelCache<V> {
    entries: RwLock<LruCache<String, CacheEntry<V>>>,
    ttl: Duration,
    /// Bumped on every invalidation; fetches started before a bump are not stored.
    epoch: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
    empty_fetches: AtomicU64,
    invalidations: AtomicU64,
}

impl<V: Cacheable> ModelCache<V> {
    pub fn new(ttl: Duration, capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: RwLock::new(LruCache::new(capacity)),
            ttl,
            epoch: AtomicU64::new(0),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            empty_fetches: AtomicU64::new(0),
            invalidations: AtomicU64::new(0),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Returns the entry for `key` if present and younger than the TTL.
    pub async fn get(&self, key: &str) -> Option<Arc<V>> {
        {
            let entries = self.entries.read().await;
            match entries.peek(key) {
                Some(entry) if entry.age() < self.ttl => {
                    self.hits.fetch_add(1, Ordering::Relaxed);
                    counter!("canaria_cache_hits_total").increment(1);
                    return Some(Arc::clone(&entry.value));
                }
                Some(_) => {}
                None => {
                    self.record_miss(key);
                    return None;
                }
            }
        }

        // Expired: drop it unless another reader already refreshed it.
        let mut entries = self.entries.write().await;
        if let Some(entry) = entries.peek(key) {
            if entry.age() < self.ttl {
                self.hits.fetch_add(1, Ordering::Relaxed);
                return Some(Arc::clone(&entry.value));
            }
            entries.pop(key);
            debug!(key, "Cache entry expired");
        }
        self.record_miss(key);
        None
    }

    /// Returns the cached value, or fetches, stores and returns a fresh one.
    ///
    /// An empty fetch result is `UnhealthyState` and leaves the cache untouched.
    pub async fn get_or_fetch<F, Fut>(&self, key: &str, fetch: F) -> Result<Arc<V>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V>>,
    {
        if let Some(value) = self.get(key).await {
            return Ok(value);
        }

        let epoch = self.epoch.load(Ordering::SeqCst);
        let value = fetch().await?;
        if value.is_empty() {
            self.empty_fetches.fetch_add(1, Ordering::Relaxed);
            counter!("canaria_cache_empty_fetches_total").increment(1);
            return Err(CanariaError::UnhealthyState(format!(
                "no active models available for '{}'",
                key
            )));
        }

        let value = Arc::new(value);
        let mut entries = self.entries.write().await;
        if self.epoch.load(Ordering::SeqCst) == epoch {
            entries.put(
                key.to_string(),
                CacheEntry {
                    value: Arc::clone(&value),
                    cached_at: Instant::now(),
                },
            );
            debug!(key, ttl_secs = self.ttl.as_secs(), "Cache entry refreshed");
        } else {
            debug!(key, "Cache invalidated during fetch, not storing");
        }
        Ok(value)
    }

    /// Drops the entry for `key`. Returns true if one was present.
    pub async fn invalidate(&self, key: &str) -> bool {
        self.epoch.fetch_add(1, Ordering::SeqCst);
        self.invalidations.fetch_add(1, Ordering::Relaxed);
        let removed = self.entries.write().await.pop(key).is_some();
        info!(key, removed, "Cache entry invalidated");
        removed
    }

    /// Drops every entry. Returns the number removed.
    pub async fn invalidate_all(&self) -> usize {
        self.epoch.fetch_add(1, Ordering::SeqCst);
        self.invalidations.fetch_add(1, Ordering::Relaxed);
        let mut entries = self.entries.write().await;
        let removed = entries.len();
        entries.clear();
        info!(removed, "Cache cleared");
        removed
    }

    pub async fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            empty_fetches: self.empty_fetches.load(Ordering::Relaxed),
            invalidations: self.invalidations.load(Ordering::Relaxed),
            entries: self.entries.read().await.len(),
        }
    }

    fn record_miss(&self, key: &str) {
        self.misses.fetch_add(1, Ordering::Relaxed);
        counter!("canaria_cache_misses_total").increment(1);
        debug!(key, "Cache miss");
    }
}

impl<V: Cacheable> Default for ModelCache<V> {
    fn default() -> Self {
        Self::new(DEFAULT_TTL, DEFAULT_CAPACITY)
    }
}
