mod common;

use common::{Person, runtime, seed_people};
use nexus_odm::query::CursorState;
use nexus_odm::{OdmError, field};
use std::collections::BTreeSet;
use std::sync::Arc;

#[test]
fn windowed_iteration_matches_as_list() {
    let (odm, driver) = runtime();
    seed_people(&driver, 2500);
    let q = odm.query::<Person>().and(field("age").lt(40)).unwrap().desc("age").asc("_id");
    let expected: Vec<i64> = q.as_list().unwrap().iter().map(|p| p.id).collect();
    assert_eq!(expected.len(), 2000);

    for window in [1usize, 7, 1000] {
        let ids: Vec<i64> = q.as_iterable_with(window).map(|r| r.unwrap().id).collect();
        assert_eq!(ids, expected, "window {window}");

        let prefetched: Vec<i64> = q.as_prefetch_iterable(window, 3).unwrap().map(|r| r.unwrap().id).collect();
        assert_eq!(prefetched, expected, "prefetch window {window}");
    }
    assert_eq!(driver.open_cursors(), 0);
    let c = driver.counters();
    assert_eq!(c.cursor_opens, 6);
    assert_eq!(c.cursor_closes, 6);
}

#[test]
fn position_counts_every_next_across_batches() {
    let (odm, driver) = runtime();
    seed_people(&driver, 10);
    let mut it = odm.query::<Person>().as_iterable_with(3);
    assert_eq!(it.state(), CursorState::Uninitialized);
    for expected in 1..=10u64 {
        let p = it.next_entity().unwrap().unwrap();
        assert!(p.loaded);
        assert_eq!(it.position(), expected);
    }
    assert!(!it.has_next().unwrap());
    assert!(!it.has_next().unwrap());
    assert_eq!(it.state(), CursorState::Exhausted);
    let c = driver.counters();
    assert_eq!((c.cursor_opens, c.cursor_fetches, c.cursor_closes), (1, 3, 1));
}

#[test]
fn back_is_bounded_by_the_current_batch() {
    let (odm, driver) = runtime();
    seed_people(&driver, 10);
    let mut it = odm.query::<Person>().as_iterable_with(4);
    for _ in 0..3 {
        it.next_entity().unwrap();
    }
    it.back(2).unwrap();
    assert_eq!(it.position(), 1);
    assert_eq!(it.next_entity().unwrap().unwrap().id, 1);
    assert!(matches!(it.back(3), Err(OdmError::CursorBoundary(_))));
    assert_eq!(it.position(), 2, "a rejected back must not move the cursor");

    // Into the second batch, where only ids 4 and 5 have been consumed.
    it.ahead(3).unwrap();
    assert_eq!(it.next_entity().unwrap().unwrap().id, 5);
    assert!(matches!(it.back(3), Err(OdmError::CursorBoundary(_))));
    it.back(1).unwrap();
    assert_eq!(it.next_entity().unwrap().unwrap().id, 5);
}

#[test]
fn ahead_crosses_batches_and_stops_at_the_end() {
    let (odm, driver) = runtime();
    seed_people(&driver, 10);
    let mut it = odm.query::<Person>().as_iterable_with(3);
    it.ahead(7).unwrap();
    assert_eq!(it.position(), 7);
    assert_eq!(it.next_entity().unwrap().unwrap().id, 7);
    assert!(matches!(it.ahead(5), Err(OdmError::CursorBoundary(_))));
    assert_eq!(it.state(), CursorState::Exhausted);
    assert!(it.back(1).is_err());
}

#[test]
fn iteration_is_isolated_from_later_query_changes() {
    let (odm, driver) = runtime();
    seed_people(&driver, 5);
    let q = odm.query::<Person>();
    let it = q.as_iterable_with(2);
    let q = q.limit(1);
    assert_eq!(q.get_limit(), 1);
    assert_eq!(it.count(), 5);
}

#[test]
fn abandoned_cursors_close_exactly_once() {
    let (odm, driver) = runtime();
    seed_people(&driver, 10);
    {
        let mut it = odm.query::<Person>().as_iterable_with(2);
        it.next_entity().unwrap();
        assert_eq!(driver.open_cursors(), 1);
        it.close().unwrap();
        it.close().unwrap();
        assert_eq!(it.state(), CursorState::Closed);
        assert!(it.next_entity().unwrap().is_none());
    }
    {
        let mut it = odm.query::<Person>().as_iterable_with(2);
        it.next_entity().unwrap();
    }
    {
        let mut never_opened = odm.query::<Person>().as_iterable_with(2);
        never_opened.close().unwrap();
    }
    assert_eq!(driver.open_cursors(), 0);
    assert_eq!(driver.counters().cursor_closes, 2);
}

#[test]
fn shared_iterator_hands_out_each_element_once() {
    let (odm, driver) = runtime();
    seed_people(&driver, 500);
    let it = Arc::new(odm.query::<Person>().as_shared_iterable(7));
    let handles: Vec<_> = (0..4)
        .map(|_| {
            let it = Arc::clone(&it);
            std::thread::spawn(move || {
                let mut seen = Vec::new();
                while let Some(p) = it.next_entity().unwrap() {
                    seen.push(p.id);
                }
                seen
            })
        })
        .collect();
    let mut all = Vec::new();
    for h in handles {
        all.extend(h.join().unwrap());
    }
    assert_eq!(all.len(), 500);
    let unique: BTreeSet<i64> = all.into_iter().collect();
    assert_eq!(unique.len(), 500);
    assert!(!it.has_next().unwrap());
    assert_eq!(it.position(), 500);
}

#[test]
fn prefetch_stops_early_without_leaking_the_cursor() {
    let (odm, driver) = runtime();
    seed_people(&driver, 100);
    {
        let mut it = odm.query::<Person>().as_prefetch_iterable(5, 2).unwrap();
        assert_eq!(it.next().unwrap().unwrap().id, 0);
        assert_eq!(it.position(), 1);
    }
    assert_eq!(driver.open_cursors(), 0);
}

#[test]
fn iteration_errors_surface_through_the_iterator() {
    let (odm, driver) = runtime();
    seed_people(&driver, 3);
    driver.set_failing("person", true);
    let mut it = odm.query::<Person>().as_iterable();
    assert!(matches!(it.next(), Some(Err(OdmError::Transport(_)))));
    assert!(it.next().is_none());
}
