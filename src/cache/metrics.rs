use std::sync::atomic::{AtomicU64, Ordering};

/// Counters for observing cache behavior.
#[derive(Default)]
pub struct CacheMetrics {
    pub hits: AtomicU64,
    pub misses: AtomicU64,
    pub inserts: AtomicU64,
    pub invalidations: AtomicU64,
    pub ttl_evictions: AtomicU64,
    pub lru_evictions: AtomicU64,
    /// Inserts refused because the namespace was cleared while the value was being fetched.
    pub stale_rejections: AtomicU64,
    pub total_get_ns: AtomicU64,
    pub total_insert_ns: AtomicU64,
}

impl CacheMetrics {
    pub fn snapshot(&self) -> CacheMetricsSnapshot {
        CacheMetricsSnapshot {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            inserts: self.inserts.load(Ordering::Relaxed),
            invalidations: self.invalidations.load(Ordering::Relaxed),
            ttl_evictions: self.ttl_evictions.load(Ordering::Relaxed),
            lru_evictions: self.lru_evictions.load(Ordering::Relaxed),
            stale_rejections: self.stale_rejections.load(Ordering::Relaxed),
            total_get_ns: self.total_get_ns.load(Ordering::Relaxed),
            total_insert_ns: self.total_insert_ns.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheMetricsSnapshot {
    pub hits: u64,
    pub misses: u64,
    pub inserts: u64,
    pub invalidations: u64,
    pub ttl_evictions: u64,
    pub lru_evictions: u64,
    pub stale_rejections: u64,
    pub total_get_ns: u64,
    pub total_insert_ns: u64,
}
