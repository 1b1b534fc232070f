use crate::cache::config::ResultCacheConfig;
use crate::cache::metrics::{CacheMetrics, CacheMetricsSnapshot};
use crate::cache::{CachedValue, MAP_NAMESPACE, QueryCache};
use crate::entity::{CacheSettings, EntityMeta};
use crate::utils::num::{u128_to_u64_saturating, usize_to_u64};
use lru::LruCache;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};

struct Entry {
    value: CachedValue,
    stored_at: Instant,
    ttl: Option<Duration>,
}

impl Entry {
    fn is_expired(&self) -> bool {
        self.ttl.is_some_and(|ttl| self.stored_at.elapsed() >= ttl)
    }
}

#[derive(Default)]
struct State {
    namespaces: HashMap<String, LruCache<String, Entry>>,
    generations: HashMap<String, u64>,
    /// Bumped by `clear_all`.
    epoch: u64,
}

impl State {
    fn generation(&self, type_name: &str) -> u64 {
        self.epoch.wrapping_add(self.generations.get(type_name).copied().unwrap_or(0))
    }

    fn bump(&mut self, type_name: &str) {
        let g = self.generations.entry(type_name.to_string()).or_insert(0);
        *g = g.wrapping_add(1);
    }
}

/// Thread-safe read-through result cache: one LRU namespace per type, TTL per entry.
#[derive(Clone)]
pub struct ResultCache {
    config: ResultCacheConfig,
    state: Arc<Mutex<State>>,
    metrics: Arc<CacheMetrics>,
}

impl Default for ResultCache {
    fn default() -> Self {
        Self::new(ResultCacheConfig::default())
    }
}

impl ResultCache {
    #[must_use]
    pub fn new(config: ResultCacheConfig) -> Self {
        Self { config, state: Arc::new(Mutex::new(State::default())), metrics: Arc::new(CacheMetrics::default()) }
    }

    fn capacity_for(&self, settings: &CacheSettings) -> NonZeroUsize {
        let wanted = if settings.max_entries == 0 { self.config.max_entries } else { settings.max_entries };
        NonZeroUsize::new(wanted.max(1)).unwrap_or(NonZeroUsize::MIN)
    }

    /// Drop every expired entry now. Returns number evicted.
    pub fn purge_expired_now(&self) -> usize {
        let mut guard = self.state.lock();
        let mut evicted = 0usize;
        for ns in guard.namespaces.values_mut() {
            let expired: Vec<String> = ns.iter().filter(|(_, e)| e.is_expired()).map(|(k, _)| k.clone()).collect();
            for k in expired {
                ns.pop(&k);
                evicted += 1;
            }
        }
        if evicted > 0 {
            self.metrics.ttl_evictions.fetch_add(usize_to_u64(evicted), Ordering::Relaxed);
            crate::dev6!("cache", op = "ttl_purge", evicted = evicted);
        }
        evicted
    }

    #[must_use]
    pub fn len_for(&self, type_name: &str) -> usize {
        self.state.lock().namespaces.get(type_name).map_or(0, LruCache::len)
    }

    #[must_use]
    pub fn metrics_snapshot(&self) -> CacheMetricsSnapshot {
        self.metrics.snapshot()
    }
}

impl QueryCache for ResultCache {
    fn is_cached(&self, type_name: &str, key: &str) -> bool {
        self.state
            .lock()
            .namespaces
            .get(type_name)
            .and_then(|ns| ns.peek(key))
            .is_some_and(|e| !e.is_expired())
    }

    fn get_from_cache(&self, type_name: &str, key: &str) -> Option<CachedValue> {
        let start = Instant::now();
        let mut guard = self.state.lock();
        let found = match guard.namespaces.get_mut(type_name) {
            Some(ns) => match ns.get(key) {
                Some(e) if e.is_expired() => {
                    // Lazy eviction on access
                    ns.pop(key);
                    self.metrics.ttl_evictions.fetch_add(1, Ordering::Relaxed);
                    None
                }
                Some(e) => Some(e.value.clone()),
                None => None,
            },
            None => None,
        };
        let counter = if found.is_some() { &self.metrics.hits } else { &self.metrics.misses };
        counter.fetch_add(1, Ordering::Relaxed);
        self.metrics
            .total_get_ns
            .fetch_add(u128_to_u64_saturating(start.elapsed().as_nanos()), Ordering::Relaxed);
        found
    }

    fn generation(&self, type_name: &str) -> u64 {
        self.state.lock().generation(type_name)
    }

    fn add_to_cache(
        &self,
        key: &str,
        type_name: &str,
        value: CachedValue,
        settings: &CacheSettings,
        generation: u64,
    ) -> bool {
        let start = Instant::now();
        let ttl_ms = if settings.ttl_ms == 0 { self.config.ttl_ms } else { settings.ttl_ms };
        let entry = Entry {
            value,
            stored_at: Instant::now(),
            ttl: (ttl_ms > 0).then(|| Duration::from_millis(ttl_ms)),
        };
        let cap = self.capacity_for(settings);
        let mut guard = self.state.lock();
        if guard.generation(type_name) != generation {
            drop(guard);
            self.metrics.stale_rejections.fetch_add(1, Ordering::Relaxed);
            return false;
        }
        let ns = guard.namespaces.entry(type_name.to_string()).or_insert_with(|| LruCache::new(cap));
        if let Some((evicted_key, _)) = ns.push(key.to_string(), entry)
            && evicted_key != key
        {
            self.metrics.lru_evictions.fetch_add(1, Ordering::Relaxed);
        }
        self.metrics.inserts.fetch_add(1, Ordering::Relaxed);
        self.metrics
            .total_insert_ns
            .fetch_add(u128_to_u64_saturating(start.elapsed().as_nanos()), Ordering::Relaxed);
        true
    }

    fn clear_cache_if_necessary(&self, meta: &EntityMeta) {
        let Some(settings) = &meta.cache else {
            return;
        };
        if !settings.clear_on_write {
            return;
        }
        let mut guard = self.state.lock();
        let mut cleared = 0usize;
        for ns in [meta.type_name, MAP_NAMESPACE] {
            guard.bump(ns);
            if let Some(entries) = guard.namespaces.get_mut(ns) {
                cleared += entries.len();
                entries.clear();
            }
        }
        drop(guard);
        self.metrics.invalidations.fetch_add(1, Ordering::Relaxed);
        log::debug!("cache cleared for {} ({cleared} entries)", meta.type_name);
    }

    fn clear_all(&self) {
        let mut guard = self.state.lock();
        guard.namespaces.clear();
        guard.epoch = guard.epoch.wrapping_add(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::any::TypeId;

    fn meta(cache: Option<CacheSettings>) -> EntityMeta {
        EntityMeta {
            type_id: TypeId::of::<u8>(),
            type_name: "t::Thing",
            collection: "thing".into(),
            id_field: "_id",
            declared_fields: vec![],
            last_access_fields: vec![],
            cache,
            write_buffer: None,
        }
    }

    fn value(v: Vec<i32>) -> CachedValue {
        Arc::new(v)
    }

    #[test]
    fn hit_after_add_and_typed_downcast() {
        let c = ResultCache::default();
        c.add_to_cache("k", "t::Thing", value(vec![1, 2]), &CacheSettings::default(), 0);
        assert!(c.is_cached("t::Thing", "k"));
        let got = c.get_from_cache("t::Thing", "k").unwrap();
        assert_eq!(got.downcast_ref::<Vec<i32>>(), Some(&vec![1, 2]));
        assert!(c.get_from_cache("other", "k").is_none());
        let m = c.metrics_snapshot();
        assert_eq!((m.hits, m.misses, m.inserts), (1, 1, 1));
    }

    #[test]
    fn lru_bound_per_namespace() {
        let c = ResultCache::default();
        let s = CacheSettings { max_entries: 2, ..Default::default() };
        for k in ["a", "b", "c"] {
            c.add_to_cache(k, "t::Thing", value(vec![]), &s, 0);
        }
        assert_eq!(c.len_for("t::Thing"), 2);
        assert!(!c.is_cached("t::Thing", "a"));
        assert_eq!(c.metrics_snapshot().lru_evictions, 1);
    }

    #[test]
    fn ttl_expiry_is_lazy_and_purgeable() {
        let c = ResultCache::default();
        let s = CacheSettings { ttl_ms: 20, ..Default::default() };
        c.add_to_cache("a", "t::Thing", value(vec![]), &s, 0);
        c.add_to_cache("b", "t::Thing", value(vec![]), &s, 0);
        std::thread::sleep(Duration::from_millis(40));
        assert!(c.get_from_cache("t::Thing", "a").is_none());
        assert_eq!(c.purge_expired_now(), 1);
        assert_eq!(c.metrics_snapshot().ttl_evictions, 2);
    }

    #[test]
    fn invalidation_clears_type_and_map_namespaces() {
        let c = ResultCache::default();
        let s = CacheSettings::default();
        c.add_to_cache("a", "t::Thing", value(vec![]), &s, 0);
        c.add_to_cache("a", MAP_NAMESPACE, value(vec![]), &s, 0);
        c.add_to_cache("a", "t::Other", value(vec![]), &s, 0);
        c.clear_cache_if_necessary(&meta(Some(s)));
        assert_eq!(c.len_for("t::Thing"), 0);
        assert_eq!(c.len_for(MAP_NAMESPACE), 0);
        assert_eq!(c.len_for("t::Other"), 1);
    }

    #[test]
    fn insert_after_invalidation_is_refused() {
        let c = ResultCache::default();
        let s = CacheSettings::default();
        let before = c.generation("t::Thing");
        c.clear_cache_if_necessary(&meta(Some(s.clone())));
        assert!(!c.add_to_cache("a", "t::Thing", value(vec![1]), &s, before));
        assert!(!c.is_cached("t::Thing", "a"));
        assert_eq!(c.metrics_snapshot().stale_rejections, 1);

        let map_before = c.generation(MAP_NAMESPACE);
        let other_before = c.generation("t::Other");
        c.clear_cache_if_necessary(&meta(Some(s.clone())));
        assert!(!c.add_to_cache("a", MAP_NAMESPACE, value(vec![]), &s, map_before));
        assert!(c.add_to_cache("a", "t::Other", value(vec![]), &s, other_before));

        let current = c.generation("t::Thing");
        assert!(c.add_to_cache("a", "t::Thing", value(vec![2]), &s, current));
        c.clear_all();
        assert!(!c.add_to_cache("b", "t::Thing", value(vec![]), &s, current));
    }

    #[test]
    fn uncached_types_are_left_alone() {
        let c = ResultCache::default();
        c.add_to_cache("a", "t::Thing", value(vec![]), &CacheSettings::default(), 0);
        c.clear_cache_if_necessary(&meta(None));
        assert_eq!(c.len_for("t::Thing"), 1);
    }
}
