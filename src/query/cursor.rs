//! Lazy iteration over a query's server-side cursor.
//!
//! States: `Uninitialized` until the first `has_next`, `HasBatch` while documents are
//! buffered or the server has more, `Exhausted` once the server cursor was closed at the
//! end of the result set, `Closed` after an explicit close. No state leads back.

use super::exec::decode;
use super::model::Query;
use crate::driver::CursorId;
use crate::entity::Entity;
use crate::errors::OdmError;
use crate::stats::{ReadAccessKind, ReadSource};
use bson::Document;
use log::debug;
use parking_lot::Mutex;
use std::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CursorState {
    Uninitialized,
    HasBatch,
    Exhausted,
    Closed,
}

pub struct QueryIterator<T: Entity> {
    query: Query<T>,
    window: usize,
    state: CursorState,
    cursor: Option<CursorId>,
    server_has_more: bool,
    batch: Vec<Document>,
    in_batch: usize,
    position: u64,
    opened_at: Option<Instant>,
}

impl<T: Entity> QueryIterator<T> {
    /// `query` must already be a private clone; later changes to the caller's query do not
    /// reach a running iteration.
    pub(crate) fn new(query: Query<T>, window: usize) -> Self {
        Self {
            query,
            window: window.max(1),
            state: CursorState::Uninitialized,
            cursor: None,
            server_has_more: false,
            batch: Vec::new(),
            in_batch: 0,
            position: 0,
            opened_at: None,
        }
    }

    #[must_use]
    pub fn state(&self) -> CursorState {
        self.state
    }

    /// Elements handed out by `next` so far, net of `ahead`/`back`.
    #[must_use]
    pub fn position(&self) -> u64 {
        self.position
    }

    #[must_use]
    pub fn window(&self) -> usize {
        self.window
    }

    fn open(&mut self) -> Result<(), OdmError> {
        self.opened_at = Some(Instant::now());
        let request = self.query.find_request(self.query.limit, self.window);
        let first = self.query.core.driver.init_iteration(&request)?;
        debug!("opened cursor {} on {} ({} documents)", first.cursor_id, request.collection, first.documents.len());
        self.cursor = Some(first.cursor_id);
        self.server_has_more = first.has_more;
        self.batch = first.documents;
        self.in_batch = 0;
        self.state = CursorState::HasBatch;
        Ok(())
    }

    fn fetch_next(&mut self) -> Result<(), OdmError> {
        let Some(id) = self.cursor else {
            self.server_has_more = false;
            return Ok(());
        };
        let next = self.query.core.driver.next_iteration(id, self.window)?;
        self.server_has_more = next.has_more;
        self.batch = next.documents;
        self.in_batch = 0;
        Ok(())
    }

    fn release(&mut self) -> Result<(), OdmError> {
        let Some(id) = self.cursor.take() else {
            return Ok(());
        };
        if let Some(started) = self.opened_at {
            self.query.record_read(
                ReadAccessKind::Iterate,
                ReadSource::Uncached,
                started,
                crate::utils::num::u64_to_usize(self.position).unwrap_or(usize::MAX),
            );
        }
        self.query.core.driver.close_iteration(id)
    }

    /// True when another element is available, fetching as needed. Closes the server
    /// cursor the first time the result set runs out.
    ///
    /// # Errors
    /// `Transport` or `CursorNotFound` from the driver.
    pub fn has_next(&mut self) -> Result<bool, OdmError> {
        loop {
            match self.state {
                CursorState::Exhausted | CursorState::Closed => return Ok(false),
                CursorState::Uninitialized => self.open()?,
                CursorState::HasBatch => {
                    if self.in_batch < self.batch.len() {
                        return Ok(true);
                    }
                    if self.server_has_more {
                        self.fetch_next()?;
                        continue;
                    }
                    self.state = CursorState::Exhausted;
                    self.release()?;
                    return Ok(false);
                }
            }
        }
    }

    /// Decode the next element and run its post-load hook.
    ///
    /// # Errors
    /// Driver errors, or `Decode` on a malformed document.
    pub fn next_entity(&mut self) -> Result<Option<T>, OdmError> {
        if !self.has_next()? {
            return Ok(None);
        }
        let doc = self.batch[self.in_batch].clone();
        self.in_batch += 1;
        self.position += 1;
        decode::<T>(doc).map(Some)
    }

    /// Skip `n` elements, fetching further batches as needed.
    ///
    /// # Errors
    /// `CursorBoundary` when the result set ends first; the iterator is then exhausted.
    pub fn ahead(&mut self, n: usize) -> Result<(), OdmError> {
        let mut left = n;
        while left > 0 {
            if !self.has_next()? {
                return Err(OdmError::CursorBoundary(format!(
                    "ahead({n}) ran past the end of the result set at position {}",
                    self.position
                )));
            }
            let step = left.min(self.batch.len() - self.in_batch);
            self.in_batch += step;
            self.position += crate::utils::num::usize_to_u64(step);
            left -= step;
        }
        Ok(())
    }

    /// Step back `n` elements inside the batch currently held in memory.
    ///
    /// # Errors
    /// `CursorBoundary` when that would cross the start of the batch, or the iterator is
    /// no longer live; nothing moves in that case.
    pub fn back(&mut self, n: usize) -> Result<(), OdmError> {
        if self.state != CursorState::HasBatch {
            return Err(OdmError::CursorBoundary(format!("back({n}) on a {:?} cursor", self.state)));
        }
        if n > self.in_batch {
            return Err(OdmError::CursorBoundary(format!(
                "back({n}) crosses the start of the current batch ({} consumed in it)",
                self.in_batch
            )));
        }
        self.in_batch -= n;
        self.position -= crate::utils::num::usize_to_u64(n);
        Ok(())
    }

    /// Abandon the iteration, closing the server cursor if still open.
    ///
    /// # Errors
    /// `CursorNotFound` when the server no longer knows the cursor.
    pub fn close(&mut self) -> Result<(), OdmError> {
        if self.state == CursorState::Closed {
            return Ok(());
        }
        self.state = CursorState::Closed;
        self.batch.clear();
        self.in_batch = 0;
        self.release()
    }
}

impl<T: Entity> Iterator for QueryIterator<T> {
    type Item = Result<T, OdmError>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.next_entity() {
            Ok(Some(e)) => Some(Ok(e)),
            Ok(None) => None,
            Err(e) => {
                if let Err(close_err) = self.close() {
                    debug!("closing cursor after error failed: {close_err}");
                }
                Some(Err(e))
            }
        }
    }
}

impl<T: Entity> Drop for QueryIterator<T> {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            debug!("closing abandoned cursor failed: {e}");
        }
    }
}

/// A [`QueryIterator`] behind a lock, for consumers on several threads. At most one batch
/// fetch is in flight at a time.
pub struct SharedQueryIterator<T: Entity> {
    inner: Mutex<QueryIterator<T>>,
}

impl<T: Entity> SharedQueryIterator<T> {
    pub(crate) fn new(query: Query<T>, window: usize) -> Self {
        Self { inner: Mutex::new(QueryIterator::new(query, window)) }
    }

    /// # Errors
    /// As [`QueryIterator::has_next`].
    pub fn has_next(&self) -> Result<bool, OdmError> {
        self.inner.lock().has_next()
    }

    /// Check and take in one step, so concurrent consumers never race between the two.
    ///
    /// # Errors
    /// As [`QueryIterator::next_entity`].
    pub fn next_entity(&self) -> Result<Option<T>, OdmError> {
        self.inner.lock().next_entity()
    }

    #[must_use]
    pub fn position(&self) -> u64 {
        self.inner.lock().position()
    }

    /// # Errors
    /// As [`QueryIterator::close`].
    pub fn close(&self) -> Result<(), OdmError> {
        self.inner.lock().close()
    }
}

impl<T: Entity> Iterator for &SharedQueryIterator<T> {
    type Item = Result<T, OdmError>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_entity().transpose()
    }
}
