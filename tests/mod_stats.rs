mod common;

use common::{Event, Person, Visitor, manual_config, runtime, runtime_with, seed_people};
use nexus_odm::stats::{ReadAccess, ReadAccessKind, ReadSource, WriteAccess};
use nexus_odm::{OdmConfig, OverflowPolicy, ProfilingListener, WriteBufferSettings, WriteKind};
use parking_lot::Mutex;
use std::sync::Arc;

#[derive(Default)]
struct Recorder {
    reads: Mutex<Vec<(ReadAccessKind, ReadSource, usize)>>,
    writes: Mutex<Vec<(WriteKind, bool)>>,
}

impl ProfilingListener for Recorder {
    fn read_access(&self, event: &ReadAccess) {
        assert_eq!(event.filter_hash.len(), 64);
        self.reads.lock().push((event.kind, event.source, event.results));
    }

    fn write_access(&self, event: &WriteAccess) {
        self.writes.lock().push((event.kind, event.buffered));
    }
}

#[test]
fn miss_then_hit() {
    let (odm, driver) = runtime();
    seed_people(&driver, 4);
    let q = odm.query::<Person>();
    q.as_list().unwrap();
    q.as_list().unwrap();
    let s = odm.stats();
    assert_eq!(s.reads, 2);
    assert_eq!(s.cache_misses, 1);
    assert_eq!(s.cache_hits, 1);
    assert_eq!(s.uncached_reads, 0);
}

#[test]
fn uncached_types_and_counts_are_uncached_reads() {
    let (odm, driver) = runtime();
    seed_people(&driver, 2);
    odm.query::<Visitor>().as_list().unwrap();
    odm.query::<Person>().count_all().unwrap();
    let s = odm.stats();
    assert_eq!(s.reads, 2);
    assert_eq!(s.uncached_reads, 2);
    assert_eq!(s.cache_hits + s.cache_misses, 0);
}

#[test]
fn listeners_see_every_terminal_call() {
    let (odm, driver) = runtime();
    seed_people(&driver, 3);
    let rec = Arc::new(Recorder::default());
    odm.add_profiling_listener(rec.clone());

    let q = odm.query::<Person>();
    q.get().unwrap();
    q.as_list().unwrap();
    q.as_list().unwrap();
    q.id_list().unwrap();
    q.distinct("age").unwrap();
    for p in q.as_iterable() {
        p.unwrap();
    }

    let reads = rec.reads.lock().clone();
    assert_eq!(
        reads,
        vec![
            (ReadAccessKind::Get, ReadSource::CacheMiss, 1),
            (ReadAccessKind::AsList, ReadSource::CacheMiss, 3),
            (ReadAccessKind::AsList, ReadSource::CacheHit, 3),
            (ReadAccessKind::IdList, ReadSource::CacheMiss, 3),
            (ReadAccessKind::Distinct, ReadSource::CacheMiss, 3),
            (ReadAccessKind::Iterate, ReadSource::Uncached, 3),
        ]
    );
}

#[test]
fn zero_threshold_marks_every_read_slow() {
    let (odm, driver) = runtime_with(OdmConfig { slow_read_ms: 0, ..manual_config() });
    seed_people(&driver, 1);
    odm.query::<Person>().as_list().unwrap();
    odm.query::<Person>().as_list().unwrap();
    assert_eq!(odm.stats().slow_reads, 2);
}

#[test]
fn writes_are_counted_with_their_mode() {
    let (odm, _driver) = runtime();
    let rec = Arc::new(Recorder::default());
    odm.add_profiling_listener(rec.clone());
    odm.store(&mut Person { id: 1, name: "a".into(), ..Person::default() }).unwrap();
    odm.store(&mut Event { id: None, seq: 1 }).unwrap();
    odm.inc(&Person { id: 1, ..Person::default() }, "age", 1).unwrap();

    let s = odm.stats();
    assert_eq!(s.writes, 3);
    assert_eq!(s.buffered_writes, 1);
    assert_eq!(
        rec.writes.lock().clone(),
        vec![(WriteKind::Store, false), (WriteKind::Store, true), (WriteKind::Inc, false)]
    );
}

#[test]
fn dropped_writes_are_not_counted() {
    let (odm, _driver) = runtime();
    odm.registry().set_write_buffer::<Event>(Some(WriteBufferSettings {
        max_size: 1,
        timeout_ms: -1,
        policy: OverflowPolicy::IgnoreNew,
        ..WriteBufferSettings::default()
    }));
    for seq in 0..3 {
        odm.store(&mut Event { id: None, seq }).unwrap();
    }
    let s = odm.stats();
    assert_eq!((s.writes, s.buffered_writes, s.overflow_events), (1, 1, 2));
}

#[test]
fn writes_that_bypass_a_full_buffer_count_as_direct() {
    let (odm, _driver) = runtime();
    odm.registry().set_write_buffer::<Event>(Some(WriteBufferSettings {
        max_size: 1,
        timeout_ms: -1,
        policy: OverflowPolicy::WriteNew,
        ..WriteBufferSettings::default()
    }));
    odm.store(&mut Event { id: None, seq: 0 }).unwrap();
    odm.store(&mut Event { id: None, seq: 1 }).unwrap();
    let s = odm.stats();
    assert_eq!((s.writes, s.buffered_writes), (2, 1));
}
