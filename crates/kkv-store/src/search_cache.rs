//! Process-wide cache of lookup results keyed by a 64-bit cache key.
//!
//! Entries live in one of two pools chosen by [CachePriority]. High
//! priority entries only compete with each other for space.
use std::{
    any::Any,
    ops::Deref,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use quick_cache::{sync::Cache, Weighter};
use tracing::trace;

use crate::config::CachePriority;

/// Anything stored in the [SearchCache].
pub trait CacheItem: Any + Send + Sync {
    /// Approximate heap footprint, used for eviction.
    fn weight(&self) -> u64;
}

#[derive(Clone)]
struct CacheEntry {
    item: Arc<dyn Any + Send + Sync>,
    weight: u64,
}

#[derive(Debug, Clone, Copy, Default)]
struct EntryWeighter;

impl Weighter<u64, CacheEntry> for EntryWeighter {
    fn weight(&self, _key: &u64, val: &CacheEntry) -> u64 {
        val.weight.max(1)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SearchCacheConfig {
    pub capacity_bytes: u64,
    pub estimated_items: usize,
    /// Share of `capacity_bytes` given to the high priority pool.
    pub high_priority_ratio: f64,
}

impl Default for SearchCacheConfig {
    fn default() -> Self {
        Self {
            capacity_bytes: 64 << 20,
            estimated_items: 16 * 1024,
            high_priority_ratio: 0.5,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SearchCacheStats {
    pub hits: u64,
    pub misses: u64,
    pub puts: u64,
}

/// Pins a cache entry. The entry stays readable for as long as the guard
/// lives, even if the cache evicts or replaces it meanwhile.
#[derive(Debug)]
pub struct CacheItemGuard<T> {
    item: Arc<T>,
}

impl<T> CacheItemGuard<T> {
    pub fn arc(&self) -> &Arc<T> {
        &self.item
    }
}

impl<T> Clone for CacheItemGuard<T> {
    fn clone(&self) -> Self {
        Self {
            item: self.item.clone(),
        }
    }
}

impl<T> Deref for CacheItemGuard<T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        &self.item
    }
}

pub struct SearchCache {
    high: Cache<u64, CacheEntry, EntryWeighter>,
    low: Cache<u64, CacheEntry, EntryWeighter>,
    hits: AtomicU64,
    misses: AtomicU64,
    puts: AtomicU64,
}

impl std::fmt::Debug for SearchCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SearchCache")
            .field("high_len", &self.high.len())
            .field("low_len", &self.low.len())
            .field("stats", &self.stats())
            .finish()
    }
}

impl Default for SearchCache {
    fn default() -> Self {
        Self::new(SearchCacheConfig::default())
    }
}

impl SearchCache {
    pub fn new(config: SearchCacheConfig) -> Self {
        let ratio = config.high_priority_ratio.clamp(0.0, 1.0);
        let high_bytes = (config.capacity_bytes as f64 * ratio) as u64;
        let low_bytes = config.capacity_bytes.saturating_sub(high_bytes);
        let high_items = ((config.estimated_items as f64 * ratio) as usize).max(1);
        let low_items = config.estimated_items.saturating_sub(high_items).max(1);
        Self {
            high: Cache::with_weighter(high_items, high_bytes.max(1), EntryWeighter),
            low: Cache::with_weighter(low_items, low_bytes.max(1), EntryWeighter),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            puts: AtomicU64::new(0),
        }
    }

    fn pool(&self, priority: CachePriority) -> &Cache<u64, CacheEntry, EntryWeighter> {
        match priority {
            CachePriority::High => &self.high,
            CachePriority::Low => &self.low,
        }
    }

    /// An entry of another type under the same key counts as a miss.
    pub fn get<T: CacheItem>(&self, key: u64) -> Option<CacheItemGuard<T>> {
        let entry = self.high.get(&key).or_else(|| self.low.get(&key));
        let item = entry.and_then(|e| e.item.downcast::<T>().ok());
        match item {
            Some(item) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(CacheItemGuard { item })
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Inserts or replaces the entry at `key`.
    pub fn put<T: CacheItem>(&self, key: u64, item: Arc<T>, priority: CachePriority) {
        let weight = item.weight();
        trace!("search cache put key={:#x} weight={} {:?}", key, weight, priority);
        let other = match priority {
            CachePriority::High => CachePriority::Low,
            CachePriority::Low => CachePriority::High,
        };
        self.pool(other).remove(&key);
        self.pool(priority).insert(key, CacheEntry { item, weight });
        self.puts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn remove(&self, key: u64) -> bool {
        let high = self.high.remove(&key).is_some();
        let low = self.low.remove(&key).is_some();
        high || low
    }

    pub fn len(&self) -> usize {
        self.high.len() + self.low.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> SearchCacheStats {
        SearchCacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            puts: self.puts.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq)]
    struct Blob(Vec<u8>);

    impl CacheItem for Blob {
        fn weight(&self) -> u64 {
            self.0.len() as u64
        }
    }

    #[derive(Debug)]
    struct Other;

    impl CacheItem for Other {
        fn weight(&self) -> u64 {
            0
        }
    }

    #[test]
    fn put_get_remove() {
        let cache = SearchCache::default();
        assert!(cache.get::<Blob>(1).is_none());
        cache.put(1, Arc::new(Blob(vec![1, 2, 3])), CachePriority::Low);
        let guard = cache.get::<Blob>(1).unwrap();
        assert_eq!(guard.0, vec![1, 2, 3]);
        assert!(cache.get::<Other>(1).is_none());
        assert!(cache.remove(1));
        assert!(cache.get::<Blob>(1).is_none());
        // pinned entry outlives removal
        assert_eq!(guard.0.len(), 3);
        assert_eq!(
            cache.stats(),
            SearchCacheStats {
                hits: 1,
                misses: 3,
                puts: 1
            }
        );
    }

    #[test]
    fn priority_moves_entry() {
        let cache = SearchCache::default();
        cache.put(7, Arc::new(Blob(vec![1])), CachePriority::Low);
        cache.put(7, Arc::new(Blob(vec![2])), CachePriority::High);
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.get::<Blob>(7).unwrap().0, vec![2]);
    }

    #[test]
    fn evicts_by_weight() {
        let cache = SearchCache::new(SearchCacheConfig {
            capacity_bytes: 1024,
            estimated_items: 16,
            high_priority_ratio: 0.0,
        });
        for key in 0..64u64 {
            cache.put(key, Arc::new(Blob(vec![0; 256])), CachePriority::Low);
        }
        assert!(cache.len() < 64);
    }
}
