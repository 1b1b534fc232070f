//! Runtime counters and profiling hooks.
//!
//! Every terminal read bumps `reads` plus exactly one of `cache_hits`, `cache_misses` or
//! `uncached_reads`, then fires a [`ReadAccess`] event at the registered listeners.

use crate::buffer::WriteKind;
use crate::utils::logger::METRICS_TARGET;
use crate::utils::num::duration_ms;
use parking_lot::RwLock;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReadAccessKind {
    Get,
    AsList,
    AsMapList,
    IdList,
    Count,
    Distinct,
    FindAndModify,
    Iterate,
}

impl ReadAccessKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Get => "get",
            Self::AsList => "as_list",
            Self::AsMapList => "as_map_list",
            Self::IdList => "id_list",
            Self::Count => "count",
            Self::Distinct => "distinct",
            Self::FindAndModify => "find_and_modify",
            Self::Iterate => "iterate",
        }
    }
}

/// Where a read was answered from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadSource {
    CacheHit,
    /// Cacheable, not cached yet: went to the server.
    CacheMiss,
    /// The type or the operation does not cache.
    Uncached,
}

#[derive(Debug, Clone)]
pub struct ReadAccess {
    pub type_name: &'static str,
    pub collection: String,
    pub kind: ReadAccessKind,
    pub source: ReadSource,
    pub elapsed: Duration,
    pub results: usize,
    /// sha256 of the canonical filter, so logs never carry filter values.
    pub filter_hash: String,
    pub at: chrono::DateTime<chrono::Utc>,
}

#[derive(Debug, Clone)]
pub struct WriteAccess {
    pub type_name: &'static str,
    pub collection: String,
    pub kind: WriteKind,
    pub buffered: bool,
    pub elapsed: Duration,
    pub at: chrono::DateTime<chrono::Utc>,
}

/// Receives profiling events synchronously on the calling thread; keep it cheap.
pub trait ProfilingListener: Send + Sync {
    fn read_access(&self, event: &ReadAccess);

    fn write_access(&self, _event: &WriteAccess) {}
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub reads: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub uncached_reads: u64,
    pub slow_reads: u64,
    pub writes: u64,
    pub buffered_writes: u64,
    pub bulk_executions: u64,
    pub overflow_events: u64,
    pub requeued: u64,
}

#[derive(Default)]
pub struct Stats {
    reads: AtomicU64,
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
    uncached_reads: AtomicU64,
    slow_reads: AtomicU64,
    writes: AtomicU64,
    buffered_writes: AtomicU64,
    bulk_executions: AtomicU64,
    overflow_events: AtomicU64,
    requeued: AtomicU64,
    slow_read_ms: AtomicU64,
    listeners: RwLock<Vec<Arc<dyn ProfilingListener>>>,
}

pub(crate) fn sha256_hex(input: &str) -> String {
    use sha2::{Digest, Sha256};
    let mut h = Sha256::new();
    h.update(input.as_bytes());
    hex::encode(h.finalize())
}

impl Stats {
    #[must_use]
    pub fn new(slow_read_ms: u64) -> Self {
        let s = Self::default();
        s.slow_read_ms.store(slow_read_ms, Ordering::Relaxed);
        s
    }

    pub fn set_slow_read_ms(&self, ms: u64) {
        self.slow_read_ms.store(ms, Ordering::Relaxed);
    }

    pub fn add_listener(&self, listener: Arc<dyn ProfilingListener>) {
        self.listeners.write().push(listener);
    }

    pub fn clear_listeners(&self) {
        self.listeners.write().clear();
    }

    pub fn record_read(&self, event: &ReadAccess) {
        self.reads.fetch_add(1, Ordering::Relaxed);
        let counter = match event.source {
            ReadSource::CacheHit => &self.cache_hits,
            ReadSource::CacheMiss => &self.cache_misses,
            ReadSource::Uncached => &self.uncached_reads,
        };
        counter.fetch_add(1, Ordering::Relaxed);

        let ms = duration_ms(event.elapsed);
        crate::dev6!(
            "read",
            kind = event.kind.as_str(),
            type_name = event.type_name,
            source = format!("{:?}", event.source),
            duration_ms = ms,
            results = event.results,
        );
        if ms >= self.slow_read_ms.load(Ordering::Relaxed) {
            self.slow_reads.fetch_add(1, Ordering::Relaxed);
            let line = serde_json::json!({
                "ts": event.at.to_rfc3339_opts(chrono::SecondsFormat::Millis, true),
                "type": event.type_name,
                "collection": event.collection,
                "kind": event.kind.as_str(),
                "filter_hash": event.filter_hash,
                "duration_ms": ms,
                "results": event.results,
            });
            log::warn!(target: METRICS_TARGET, "slow read {line}");
        }
        for l in self.listeners.read().iter() {
            l.read_access(event);
        }
    }

    pub fn record_write(&self, event: &WriteAccess) {
        self.writes.fetch_add(1, Ordering::Relaxed);
        if event.buffered {
            self.buffered_writes.fetch_add(1, Ordering::Relaxed);
        }
        for l in self.listeners.read().iter() {
            l.write_access(event);
        }
    }

    pub(crate) fn record_bulk_execution(&self) {
        self.bulk_executions.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_overflow(&self) {
        self.overflow_events.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_requeued(&self, n: u64) {
        self.requeued.fetch_add(n, Ordering::Relaxed);
    }

    #[must_use]
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            reads: self.reads.load(Ordering::Relaxed),
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            cache_misses: self.cache_misses.load(Ordering::Relaxed),
            uncached_reads: self.uncached_reads.load(Ordering::Relaxed),
            slow_reads: self.slow_reads.load(Ordering::Relaxed),
            writes: self.writes.load(Ordering::Relaxed),
            buffered_writes: self.buffered_writes.load(Ordering::Relaxed),
            bulk_executions: self.bulk_executions.load(Ordering::Relaxed),
            overflow_events: self.overflow_events.load(Ordering::Relaxed),
            requeued: self.requeued.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct Capture(Mutex<Vec<ReadAccessKind>>);

    impl ProfilingListener for Capture {
        fn read_access(&self, event: &ReadAccess) {
            self.0.lock().push(event.kind);
        }
    }

    fn read(kind: ReadAccessKind, source: ReadSource, elapsed: Duration) -> ReadAccess {
        ReadAccess {
            type_name: "t::Thing",
            collection: "thing".into(),
            kind,
            source,
            elapsed,
            results: 1,
            filter_hash: sha256_hex("{}"),
            at: chrono::Utc::now(),
        }
    }

    #[test]
    fn counters_split_by_source() {
        let s = Stats::new(10_000);
        s.record_read(&read(ReadAccessKind::AsList, ReadSource::CacheMiss, Duration::ZERO));
        s.record_read(&read(ReadAccessKind::AsList, ReadSource::CacheHit, Duration::ZERO));
        s.record_read(&read(ReadAccessKind::Count, ReadSource::Uncached, Duration::ZERO));
        let snap = s.snapshot();
        assert_eq!((snap.reads, snap.cache_hits, snap.cache_misses, snap.uncached_reads), (3, 1, 1, 1));
        assert_eq!(snap.slow_reads, 0);
    }

    #[test]
    fn listeners_and_slow_reads() {
        let s = Stats::new(5);
        let cap = Arc::new(Capture::default());
        s.add_listener(cap.clone());
        s.record_read(&read(ReadAccessKind::Get, ReadSource::Uncached, Duration::from_millis(6)));
        assert_eq!(cap.0.lock().as_slice(), &[ReadAccessKind::Get]);
        assert_eq!(s.snapshot().slow_reads, 1);
    }

    #[test]
    fn read_emits_bench_line() {
        let _g = crate::utils::devlog::capture();
        let s = Stats::new(10_000);
        s.record_read(&read(ReadAccessKind::IdList, ReadSource::CacheHit, Duration::ZERO));
        let lines = crate::utils::devlog::captured("read");
        assert_eq!(lines.len(), 1);
        assert_eq!(lines[0].get("kind").and_then(|v| v.as_str()), Some("id_list"));
        assert_eq!(lines[0].get("source").and_then(|v| v.as_str()), Some("CacheHit"));
    }

    #[test]
    fn filter_hash_is_hex_sha256() {
        assert_eq!(sha256_hex("").len(), 64);
    }
}
