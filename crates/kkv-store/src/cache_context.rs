use std::sync::Arc;

use kkv_common::{hash::KKV_HASH_SEED, PKeyType};
use smallvec::SmallVec;
use xxhash_rust::xxh64::Xxh64;

use crate::{
    cache_item::KkvCacheItem,
    config::CachePriority,
    metrics::KkvMetricsCollector,
    search_cache::{CacheItemGuard, SearchCache},
    types::SKeyType,
};

/// Cache key of a lookup.
///
/// A lookup bounded to a set of skeys gets its own slot: an entry built for
/// `{10}` must not answer a lookup for `{10, 20}` and the other way round.
/// The set is order-insensitive and duplicates are ignored.
pub fn compute_cache_key<S: SKeyType>(pkey: PKeyType, skeys: Option<&[S]>) -> u64 {
    let mut hasher = Xxh64::new(KKV_HASH_SEED);
    hasher.update(&pkey.to_le_bytes());
    if let Some(skeys) = skeys.filter(|s| !s.is_empty()) {
        let mut hashes: SmallVec<[u64; 16]> = skeys.iter().map(|s| s.to_hash()).collect();
        hashes.sort_unstable();
        hashes.dedup();
        for h in hashes {
            hasher.update(&h.to_le_bytes());
        }
    }
    hasher.digest()
}

/// Cache access scoped to one lookup.
///
/// Holds the pinned entry, if any, until the lookup is done.
pub struct SearchCacheContext<S: SKeyType> {
    cache: Arc<SearchCache>,
    cache_key: u64,
    guard: Option<CacheItemGuard<KkvCacheItem<S>>>,
    only_cache: bool,
    priority: CachePriority,
}

impl<S: SKeyType> std::fmt::Debug for SearchCacheContext<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SearchCacheContext")
            .field("cache_key", &format_args!("{:#x}", self.cache_key))
            .field("pinned", &self.guard.is_some())
            .field("only_cache", &self.only_cache)
            .finish()
    }
}

impl<S: SKeyType> SearchCacheContext<S> {
    pub fn new(
        cache: Arc<SearchCache>,
        pkey: PKeyType,
        skeys: Option<&[S]>,
        only_cache: bool,
        priority: CachePriority,
        metrics: &KkvMetricsCollector,
    ) -> Self {
        let cache_key = compute_cache_key(pkey, skeys);
        let guard = cache
            .get::<KkvCacheItem<S>>(cache_key)
            .filter(|item| item.is_cache_item_valid());
        if guard.is_some() {
            metrics.inc_cache_hit(1);
        } else {
            metrics.inc_cache_miss(1);
        }
        Self {
            cache,
            cache_key,
            guard,
            only_cache,
            priority,
        }
    }

    pub fn cache_key(&self) -> u64 {
        self.cache_key
    }

    pub fn only_cache(&self) -> bool {
        self.only_cache
    }

    pub fn get_cache_item(&self) -> Option<&KkvCacheItem<S>> {
        self.guard.as_deref()
    }

    /// Replaces whatever is stored at this lookup's key. The previously
    /// pinned entry stays readable through this context.
    pub fn put_cache_item(&self, item: KkvCacheItem<S>) {
        self.cache.put(self.cache_key, Arc::new(item), self.priority);
    }
}
