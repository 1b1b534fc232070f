//! Iteration with batches fetched ahead on a background thread.
//!
//! One fetcher thread walks the server cursor and hands batches over a bounded channel, so
//! at most `prefetch_windows` batches wait while the consumer decodes. Delivery order is
//! the server's order.

use super::exec::decode;
use super::model::Query;
use crate::entity::Entity;
use crate::errors::OdmError;
use crate::stats::{ReadAccessKind, ReadSource};
use bson::Document;
use log::debug;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{Receiver, sync_channel};
use std::thread::{self, JoinHandle};
use std::time::Instant;

type Batch = Result<Vec<Document>, OdmError>;

pub struct PrefetchIterator<T: Entity> {
    query: Query<T>,
    rx: Option<Receiver<Batch>>,
    stop: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
    buffered: VecDeque<Document>,
    position: u64,
    done: bool,
    started: Instant,
}

impl<T: Entity> PrefetchIterator<T> {
    pub(crate) fn start(query: Query<T>, window: usize, prefetch_windows: usize) -> Result<Self, OdmError> {
        let window = window.max(1);
        let (tx, rx) = sync_channel::<Batch>(prefetch_windows.max(1));
        let stop = Arc::new(AtomicBool::new(false));
        let driver = Arc::clone(&query.core.driver);
        let request = query.find_request(query.limit, window);
        let stop_flag = Arc::clone(&stop);
        let worker = thread::Builder::new().name("nexus-odm-prefetch".into()).spawn(move || {
            let first = match driver.init_iteration(&request) {
                Ok(b) => b,
                Err(e) => {
                    let _ = tx.send(Err(e));
                    return;
                }
            };
            let id = first.cursor_id;
            let mut more = first.has_more;
            if tx.send(Ok(first.documents)).is_ok() {
                while more && !stop_flag.load(Ordering::SeqCst) {
                    match driver.next_iteration(id, window) {
                        Ok(b) => {
                            more = b.has_more;
                            if tx.send(Ok(b.documents)).is_err() {
                                break;
                            }
                        }
                        Err(e) => {
                            let _ = tx.send(Err(e));
                            break;
                        }
                    }
                }
            }
            if let Err(e) = driver.close_iteration(id) {
                debug!("closing prefetch cursor {id} failed: {e}");
            }
        })?;
        Ok(Self {
            query,
            rx: Some(rx),
            stop,
            worker: Some(worker),
            buffered: VecDeque::new(),
            position: 0,
            done: false,
            started: Instant::now(),
        })
    }

    #[must_use]
    pub fn position(&self) -> u64 {
        self.position
    }

    fn finish(&mut self) {
        if !self.done {
            self.done = true;
            self.query.record_read(
                ReadAccessKind::Iterate,
                ReadSource::Uncached,
                self.started,
                crate::utils::num::u64_to_usize(self.position).unwrap_or(usize::MAX),
            );
        }
    }
}

impl<T: Entity> Iterator for PrefetchIterator<T> {
    type Item = Result<T, OdmError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(doc) = self.buffered.pop_front() {
                self.position += 1;
                return Some(decode::<T>(doc));
            }
            if self.done {
                return None;
            }
            let received = self.rx.as_ref().map(Receiver::recv);
            match received {
                Some(Ok(Ok(docs))) => self.buffered.extend(docs),
                Some(Ok(Err(e))) => {
                    self.finish();
                    return Some(Err(e));
                }
                Some(Err(_)) | None => self.finish(),
            }
        }
    }
}

impl<T: Entity> Drop for PrefetchIterator<T> {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        drop(self.rx.take());
        if let Some(worker) = self.worker.take()
            && worker.join().is_err()
        {
            debug!("prefetch thread panicked");
        }
    }
}
