//! Per-type write queues drained into per-collection bulk contexts.
//!
//! Lock discipline: the queue map is the only lock. Overflow decisions and queue surgery
//! happen under it; every driver call happens after it is released.

use super::ops::{PendingOperation, oldest_index};
use crate::cache::QueryCache;
use crate::driver::{BulkOutcome, Driver};
use crate::entity::{EntityRegistry, OverflowPolicy, WriteBufferSettings};
use crate::errors::OdmError;
use crate::stats::Stats;
use crate::utils::logger::METRICS_TARGET;
use crate::utils::num::{duration_ms, i64_to_u64_saturating_nonnegative};
use log::{debug, error, warn};
use parking_lot::Mutex;
use std::any::TypeId;
use std::collections::{BTreeMap, HashMap};
use std::ops::Range;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// What `enqueue` did with an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    Queued,
    /// Queue was full under `JUST_WARN`; accepted anyway.
    QueuedWithWarning,
    /// Queue was full under `IGNORE_NEW`; the operation will never run.
    Dropped,
    /// Queue was full under `WRITE_NEW`; executed alone.
    WrittenDirectly,
    /// Queue was full under `WRITE_OLD`; the oldest operation was executed alone.
    QueuedAfterWritingOldest,
    /// Queue was full under `DEL_OLD`; the oldest operation was discarded.
    QueuedAfterDiscardingOldest,
}

struct TypeQueue {
    type_name: &'static str,
    ops: Vec<PendingOperation>,
    last_flush: Instant,
}

impl TypeQueue {
    fn new(type_name: &'static str) -> Self {
        Self { type_name, ops: Vec::new(), last_flush: Instant::now() }
    }
}

/// A type's queue taken out of the map for flushing.
struct Drained {
    type_id: TypeId,
    type_name: &'static str,
    settings: WriteBufferSettings,
    ops: Vec<PendingOperation>,
}

fn due(settings: &WriteBufferSettings, len: usize, since_flush: Duration) -> bool {
    if settings.timeout_ms < 0 {
        return len >= settings.max_size;
    }
    duration_ms(since_flush) >= i64_to_u64_saturating_nonnegative(settings.timeout_ms)
}

struct Shared {
    database: String,
    driver: Arc<dyn Driver>,
    cache: Arc<dyn QueryCache>,
    registry: Arc<EntityRegistry>,
    stats: Arc<Stats>,
    queues: Mutex<HashMap<TypeId, TypeQueue>>,
    accepting: AtomicBool,
}

impl Shared {
    fn settings_for(&self, type_id: TypeId) -> WriteBufferSettings {
        self.registry.get(type_id).and_then(|m| m.write_buffer.clone()).unwrap_or_default()
    }

    fn invalidate(&self, type_id: TypeId) {
        if let Some(meta) = self.registry.get(type_id) {
            self.cache.clear_cache_if_necessary(&meta);
        }
    }

    fn requeue(&self, type_id: TypeId, type_name: &'static str, mut ops: Vec<PendingOperation>) {
        if ops.is_empty() {
            return;
        }
        self.stats.record_requeued(crate::utils::num::usize_to_u64(ops.len()));
        let mut queues = self.queues.lock();
        let q = queues.entry(type_id).or_insert_with(|| TypeQueue::new(type_name));
        q.ops.append(&mut ops);
        q.ops.sort_by_key(PendingOperation::age_key);
    }

    /// Run one operation through its own bulk context.
    fn execute_single(&self, mut op: PendingOperation, settings: &WriteBufferSettings) -> Result<BulkOutcome, OdmError> {
        let mut ctx =
            self.driver.create_bulk_context(&self.database, &op.collection, settings.ordered, settings.write_concern.as_ref());
        if let Err(e) = op.append_to(ctx.as_mut()) {
            if e.is_submission_rejection() {
                debug!("re-queueing {op}: {e}");
                let (type_id, type_name) = (op.type_id, op.type_name);
                self.requeue(type_id, type_name, vec![op]);
                return Ok(BulkOutcome::default());
            }
            return Err(e);
        }
        op.complete(false);
        self.stats.record_bulk_execution();
        let outcome = ctx.execute();
        self.invalidate(op.type_id);
        let outcome = outcome?;
        for f in &outcome.failures {
            error!("{op} failed: {}", f.message);
        }
        Ok(outcome)
    }

    /// Snapshot and swap out every queue that is due (or every non-empty one when forced).
    fn take_due(&self, force: bool) -> Vec<Drained> {
        let now = Instant::now();
        let mut queues = self.queues.lock();
        let mut out = Vec::new();
        for (type_id, q) in queues.iter_mut() {
            if q.ops.is_empty() {
                continue;
            }
            let settings = self.settings_for(*type_id);
            if !force && !due(&settings, q.ops.len(), now.saturating_duration_since(q.last_flush)) {
                continue;
            }
            q.last_flush = now;
            out.push(Drained {
                type_id: *type_id,
                type_name: q.type_name,
                settings,
                ops: std::mem::take(&mut q.ops),
            });
        }
        out
    }

    fn run_cycle(&self, force: bool) -> usize {
        self.take_due(force).into_iter().map(|d| self.flush_type(d)).sum()
    }

    /// Returns how many operations were handed to a bulk context.
    fn flush_type(&self, drained: Drained) -> usize {
        let started = Instant::now();
        let Drained { type_id, type_name, settings, ops } = drained;
        let mut groups: BTreeMap<String, Vec<PendingOperation>> = BTreeMap::new();
        for op in ops {
            groups.entry(op.collection.clone()).or_default().push(op);
        }

        let mut handed = 0usize;
        let mut executions = 0usize;
        let mut rejected = Vec::new();
        for (collection, ops) in groups {
            let mut ctx =
                self.driver.create_bulk_context(&self.database, &collection, settings.ordered, settings.write_concern.as_ref());
            let mut spans: Vec<(Range<usize>, String)> = Vec::with_capacity(ops.len());
            for mut op in ops {
                // Once the context refuses, later operations wait too so queue order holds.
                if !rejected.is_empty() && rejected.iter().any(|r: &PendingOperation| r.collection == collection) {
                    rejected.push(op);
                    continue;
                }
                let start = ctx.len();
                match op.append_to(ctx.as_mut()) {
                    Ok(()) => {
                        op.complete(true);
                        spans.push((start..ctx.len(), op.to_string()));
                        handed += 1;
                    }
                    Err(e) if e.is_submission_rejection() => {
                        debug!("re-queueing {op}: {e}");
                        rejected.push(op);
                    }
                    Err(e) => error!("could not translate {op}: {e}"),
                }
            }
            if ctx.is_empty() {
                continue;
            }
            let requests = ctx.len();
            executions += 1;
            self.stats.record_bulk_execution();
            match ctx.execute() {
                Ok(outcome) => {
                    for f in &outcome.failures {
                        let owner = spans
                            .iter()
                            .find(|(r, _)| r.contains(&f.index))
                            .map_or("unknown operation", |(_, name)| name.as_str());
                        error!("bulk request {} on {collection} ({owner}) failed: {}", f.index, f.message);
                    }
                }
                Err(e) => error!("bulk execution of {requests} requests on {collection} failed: {e}"),
            }
        }

        if executions > 0 {
            self.invalidate(type_id);
        }
        let requeued = rejected.len();
        self.requeue(type_id, type_name, rejected);

        let ms = duration_ms(started.elapsed());
        debug!(target: METRICS_TARGET, "flushed {handed} operations of {type_name} in {executions} bulk calls ({requeued} re-queued, {ms} ms)");
        crate::dev6!(
            "flush",
            type_name = type_name,
            operations = handed,
            executions = executions,
            requeued = requeued,
            duration_ms = ms,
        );
        handed
    }
}

/// Buffers mutations per entity type and flushes them from one housekeeping thread.
pub struct WriteBufferManager {
    shared: Arc<Shared>,
    stop: Mutex<Option<Sender<()>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    shut_down: AtomicBool,
}

impl WriteBufferManager {
    #[must_use]
    pub fn new(
        database: impl Into<String>,
        driver: Arc<dyn Driver>,
        cache: Arc<dyn QueryCache>,
        registry: Arc<EntityRegistry>,
        stats: Arc<Stats>,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                database: database.into(),
                driver,
                cache,
                registry,
                stats,
                queues: Mutex::new(HashMap::new()),
                accepting: AtomicBool::new(true),
            }),
            stop: Mutex::new(None),
            worker: Mutex::new(None),
            shut_down: AtomicBool::new(false),
        }
    }

    /// Start the housekeeping thread. A second call is a no-op.
    ///
    /// # Errors
    /// `Io` when the thread cannot be spawned.
    pub fn start(&self, granularity: Duration) -> Result<(), OdmError> {
        let mut stop = self.stop.lock();
        if stop.is_some() || self.shut_down.load(Ordering::SeqCst) {
            return Ok(());
        }
        let (tx, rx) = mpsc::channel::<()>();
        let shared = Arc::clone(&self.shared);
        let handle = thread::Builder::new().name("nexus-odm-housekeeping".into()).spawn(move || {
            loop {
                match rx.recv_timeout(granularity) {
                    Err(RecvTimeoutError::Timeout) => {
                        shared.run_cycle(false);
                    }
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                }
            }
        })?;
        *stop = Some(tx);
        *self.worker.lock() = Some(handle);
        Ok(())
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.stop.lock().is_some()
    }

    /// Queue `op` on its type's queue, applying the type's overflow policy when full.
    ///
    /// # Errors
    /// `Shutdown` after [`Self::shutdown`]; `Transport` when an overflow branch executes
    /// an operation synchronously and the driver fails.
    pub fn enqueue(&self, op: PendingOperation) -> Result<EnqueueOutcome, OdmError> {
        if !self.shared.accepting.load(Ordering::SeqCst) {
            return Err(OdmError::Shutdown);
        }
        let settings = self.shared.settings_for(op.type_id);
        let (direct, outcome) = {
            let mut queues = self.shared.queues.lock();
            let q = queues.entry(op.type_id).or_insert_with(|| TypeQueue::new(op.type_name));
            let full = settings.max_size > 0 && q.ops.len() >= settings.max_size;
            if !full {
                q.ops.push(op);
                return Ok(EnqueueOutcome::Queued);
            }
            self.shared.stats.record_overflow();
            crate::dev6!(
                "overflow",
                type_name = q.type_name,
                policy = format!("{:?}", settings.policy),
                max_size = settings.max_size,
                queued = q.ops.len(),
            );
            match settings.policy {
                OverflowPolicy::JustWarn => {
                    warn!(
                        "write buffer of {} exceeds its maximum of {} ({} queued), accepting {op}",
                        q.type_name,
                        settings.max_size,
                        q.ops.len()
                    );
                    q.ops.push(op);
                    return Ok(EnqueueOutcome::QueuedWithWarning);
                }
                OverflowPolicy::IgnoreNew => {
                    debug!("write buffer of {} full, dropping {op}", q.type_name);
                    return Ok(EnqueueOutcome::Dropped);
                }
                OverflowPolicy::DelOld => {
                    if let Some(i) = oldest_index(&q.ops) {
                        let old = q.ops.remove(i);
                        debug!("write buffer of {} full, discarding {old}", q.type_name);
                    }
                    q.ops.push(op);
                    return Ok(EnqueueOutcome::QueuedAfterDiscardingOldest);
                }
                OverflowPolicy::WriteNew => (op, EnqueueOutcome::WrittenDirectly),
                OverflowPolicy::WriteOld => match oldest_index(&q.ops) {
                    Some(i) => {
                        let old = q.ops.remove(i);
                        q.ops.push(op);
                        (old, EnqueueOutcome::QueuedAfterWritingOldest)
                    }
                    None => (op, EnqueueOutcome::WrittenDirectly),
                },
            }
        };
        debug!("write buffer full, executing {direct} synchronously");
        self.shared.execute_single(direct, &settings)?;
        Ok(outcome)
    }

    /// Execute `op` now through a fresh bulk context, bypassing the queue.
    ///
    /// # Errors
    /// `Transport` from the driver. Local rejections re-queue the operation instead.
    pub fn execute_direct(&self, op: PendingOperation) -> Result<BulkOutcome, OdmError> {
        let settings = self.shared.settings_for(op.type_id);
        self.shared.execute_single(op, &settings)
    }

    /// Flush every non-empty queue now. Returns the number of operations handed to bulk
    /// contexts; a second call with nothing enqueued in between returns 0 and executes nothing.
    pub fn flush(&self) -> usize {
        self.shared.run_cycle(true)
    }

    /// One housekeeping pass honoring each type's size and timeout.
    pub fn run_housekeeping_cycle(&self) -> usize {
        self.shared.run_cycle(false)
    }

    /// Operations currently queued. Operations swapped out for a running flush are not counted.
    #[must_use]
    pub fn write_buffer_count(&self) -> usize {
        self.shared.queues.lock().values().map(|q| q.ops.len()).sum()
    }

    #[must_use]
    pub fn queue_len(&self, type_id: TypeId) -> usize {
        self.shared.queues.lock().get(&type_id).map_or(0, |q| q.ops.len())
    }

    /// Stop accepting, stop the housekeeping thread and flush what is left. Idempotent.
    pub fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }
        self.shared.accepting.store(false, Ordering::SeqCst);
        if let Some(tx) = self.stop.lock().take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.worker.lock().take()
            && handle.join().is_err()
        {
            error!("housekeeping thread panicked");
        }
        // Re-queued rejections get further passes; no thread will drain them later.
        let mut flushed = 0usize;
        loop {
            let handed = self.shared.run_cycle(true);
            flushed += handed;
            if handed == 0 || self.write_buffer_count() == 0 {
                break;
            }
        }
        let stranded = self.write_buffer_count();
        if stranded > 0 {
            error!("write buffer shut down with {stranded} operations the driver would not accept");
        }
        debug!("write buffer shut down after flushing {flushed} operations");
    }
}

impl Drop for WriteBufferManager {
    fn drop(&mut self) {
        self.shutdown();
    }
}
