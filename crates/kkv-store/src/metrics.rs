use std::sync::{
    atomic::{AtomicBool, AtomicU64, Ordering},
    Arc,
};

/// Per-query counters. Shared between the search and the iterator it feeds.
#[derive(Debug, Default)]
pub struct KkvMetricsCollector {
    cache_hit: AtomicU64,
    cache_miss: AtomicU64,
    building_docs_read: AtomicU64,
    built_docs_read: AtomicU64,
    cache_docs_read: AtomicU64,
    segments_searched: AtomicU64,
    result_count: AtomicU64,
    timed_out: AtomicBool,
    finished: AtomicBool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct KkvMetrics {
    pub cache_hit: u64,
    pub cache_miss: u64,
    pub building_docs_read: u64,
    pub built_docs_read: u64,
    pub cache_docs_read: u64,
    pub segments_searched: u64,
    pub result_count: u64,
    pub timed_out: bool,
    pub finished: bool,
}

macro_rules! counter {
    ($inc:ident, $field:ident) => {
        pub fn $inc(&self, n: u64) {
            self.$field.fetch_add(n, Ordering::Relaxed);
        }
    };
}

impl KkvMetricsCollector {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    counter!(inc_cache_hit, cache_hit);
    counter!(inc_cache_miss, cache_miss);
    counter!(inc_building_docs_read, building_docs_read);
    counter!(inc_built_docs_read, built_docs_read);
    counter!(inc_cache_docs_read, cache_docs_read);
    counter!(inc_segments_searched, segments_searched);
    counter!(inc_result_count, result_count);

    pub fn mark_timed_out(&self) {
        self.timed_out.store(true, Ordering::Relaxed);
    }

    /// Returns whether this call was the one that finished the query.
    pub fn finish(&self) -> bool {
        !self.finished.swap(true, Ordering::AcqRel)
    }

    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::Acquire)
    }

    pub fn snapshot(&self) -> KkvMetrics {
        KkvMetrics {
            cache_hit: self.cache_hit.load(Ordering::Relaxed),
            cache_miss: self.cache_miss.load(Ordering::Relaxed),
            building_docs_read: self.building_docs_read.load(Ordering::Relaxed),
            built_docs_read: self.built_docs_read.load(Ordering::Relaxed),
            cache_docs_read: self.cache_docs_read.load(Ordering::Relaxed),
            segments_searched: self.segments_searched.load(Ordering::Relaxed),
            result_count: self.result_count.load(Ordering::Relaxed),
            timed_out: self.timed_out.load(Ordering::Relaxed),
            finished: self.is_finished(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finish_is_idempotent() {
        let m = KkvMetricsCollector::new();
        m.inc_cache_hit(1);
        m.inc_result_count(3);
        assert!(m.finish());
        assert!(!m.finish());
        let s = m.snapshot();
        assert!(s.finished);
        assert_eq!(s.cache_hit, 1);
        assert_eq!(s.result_count, 3);
    }
}
