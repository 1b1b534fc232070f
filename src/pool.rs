//! Caller-facing pool for the asynchronous terminal calls.
//!
//! Jobs are blocking closures run on a tokio runtime's blocking threads. Results go to a
//! callback; nothing hands a future back to the caller. A saturated pool pushes back by
//! running the job on the submitting thread instead of refusing it.

use crate::errors::OdmError;
use log::{debug, warn};
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::runtime::{Builder, Runtime};

pub struct AsyncPool {
    runtime: Mutex<Option<Runtime>>,
    in_flight: Arc<AtomicUsize>,
    max_pending: usize,
}

struct InFlight(Arc<AtomicUsize>);

impl Drop for InFlight {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl AsyncPool {
    /// # Errors
    /// `Io` when the runtime cannot be built.
    pub fn new(threads: usize, max_pending: usize) -> Result<Self, OdmError> {
        let threads = threads.max(1);
        let runtime = Builder::new_multi_thread()
            .worker_threads(1)
            .max_blocking_threads(threads)
            .thread_name("nexus-odm-async")
            .enable_time()
            .build()?;
        Ok(Self { runtime: Mutex::new(Some(runtime)), in_flight: Arc::new(AtomicUsize::new(0)), max_pending })
    }

    /// Jobs submitted and not yet finished.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Run `job` on a pool thread, or on the calling thread once `max_pending` jobs are
    /// already in flight.
    ///
    /// # Errors
    /// `Shutdown` after [`Self::shutdown`].
    pub fn submit<F>(&self, job: F) -> Result<(), OdmError>
    where
        F: FnOnce() + Send + 'static,
    {
        let guard = self.runtime.lock();
        let Some(rt) = guard.as_ref() else {
            return Err(OdmError::Shutdown);
        };
        let prev = self.in_flight.fetch_add(1, Ordering::SeqCst);
        if prev >= self.max_pending {
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            drop(guard);
            warn!("async pool saturated: {prev} jobs in flight, running on the caller");
            job();
            return Ok(());
        }
        let token = InFlight(Arc::clone(&self.in_flight));
        rt.spawn_blocking(move || {
            let _token = token;
            job();
        });
        Ok(())
    }

    /// Wait up to `timeout` for running jobs, then drop the runtime.
    pub fn shutdown(&self, timeout: Duration) {
        let rt = self.runtime.lock().take();
        if let Some(rt) = rt {
            debug!("async pool shutting down with {} jobs in flight", self.in_flight());
            rt.shutdown_timeout(timeout);
        }
    }
}

impl Drop for AsyncPool {
    fn drop(&mut self) {
        self.shutdown(Duration::from_secs(5));
    }
}
