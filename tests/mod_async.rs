mod common;

use common::{Person, manual_config, runtime, runtime_with, seed_people, wait_until};
use nexus_odm::{OdmConfig, OdmError};
use std::sync::mpsc;
use std::time::Duration;

const WAIT: Duration = Duration::from_secs(5);

#[test]
fn async_terminal_calls_deliver_results() {
    let (odm, driver) = runtime();
    seed_people(&driver, 10);
    let q = odm.query::<Person>().eq("age", 3).unwrap();

    let (tx, rx) = mpsc::channel();
    q.as_list_async(move |r| tx.send(r).unwrap()).unwrap();
    let people = rx.recv_timeout(WAIT).unwrap().unwrap();
    assert_eq!(people.len(), 1);
    assert_eq!(people[0].id, 3);

    let (tx, rx) = mpsc::channel();
    q.get_async(move |r| tx.send(r).unwrap()).unwrap();
    assert_eq!(rx.recv_timeout(WAIT).unwrap().unwrap().map(|p| p.id), Some(3));

    let (tx, rx) = mpsc::channel();
    odm.query::<Person>().count_all_async(move |r| tx.send(r).unwrap()).unwrap();
    assert_eq!(rx.recv_timeout(WAIT).unwrap().unwrap(), 10);

    let (tx, rx) = mpsc::channel();
    q.id_list_async(move |r| tx.send(r).unwrap()).unwrap();
    assert_eq!(rx.recv_timeout(WAIT).unwrap().unwrap(), vec![bson::Bson::Int64(3)]);
}

#[test]
fn async_errors_reach_the_callback() {
    let (odm, driver) = runtime();
    driver.set_failing("person", true);
    let (tx, rx) = mpsc::channel();
    odm.query::<Person>().as_list_async(move |r| tx.send(r).unwrap()).unwrap();
    let err = rx.recv_timeout(WAIT).unwrap().unwrap_err();
    assert!(matches!(err, OdmError::Transport(_)));
}

#[test]
fn saturated_pool_still_delivers_every_callback() {
    let (odm, driver) = runtime_with(OdmConfig { max_async_pending: 1, ..manual_config() });
    seed_people(&driver, 3);
    driver.set_latency(Duration::from_millis(300));

    let (tx, rx) = mpsc::channel();
    odm.query::<Person>().as_list_async(move |r| tx.send(r).unwrap()).unwrap();
    let caller = std::thread::current().id();
    let (count_tx, count_rx) = mpsc::channel();
    odm.query::<Person>()
        .count_all_async(move |r| count_tx.send((std::thread::current().id(), r)).unwrap())
        .unwrap();

    // The overflowing call ran on this thread, so its result is already there.
    let (ran_on, count) = count_rx.try_recv().unwrap();
    assert_eq!(ran_on, caller);
    assert_eq!(count.unwrap(), 3);
    assert_eq!(rx.recv_timeout(WAIT).unwrap().unwrap().len(), 3);
    assert!(wait_until(WAIT, || odm.async_in_flight() == 0));
}

#[test]
fn submissions_after_shutdown_fail() {
    let (odm, _driver) = runtime();
    let q = odm.query::<Person>();
    odm.shutdown();
    let err = q.as_list_async(|_| {}).unwrap_err();
    assert!(matches!(err, OdmError::Shutdown));
}
