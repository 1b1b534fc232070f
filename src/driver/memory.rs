//! In-process driver: collections held in memory, evaluated with [`super::eval`].
//!
//! Besides serving the runtime it records what happened on the "wire" (round trips,
//! cursor lifecycle, bulk executions) so callers can observe the runtime's behavior.

use super::eval::{apply_update, compare_docs, eval_filter, parse_filter, project, upsert_seed};
use super::{
    BulkContext, BulkFailure, BulkOutcome, BulkRequest, CountRequest, CursorBatch, CursorId,
    DistinctRequest, Driver, FindAndModifyRequest, FindRequest, WriteConcern,
};
use crate::errors::OdmError;
use crate::query::ReadPreference;
use crate::utils::num::u64_to_usize;
use bson::oid::ObjectId;
use bson::{Bson, Document};
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

#[derive(Default)]
struct Counters {
    finds: AtomicU64,
    counts: AtomicU64,
    estimated_counts: AtomicU64,
    distincts: AtomicU64,
    find_and_modify: AtomicU64,
    cursor_opens: AtomicU64,
    cursor_fetches: AtomicU64,
    cursor_closes: AtomicU64,
    bulk_executions: AtomicU64,
}

/// Round-trip counters of a [`MemoryDriver`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DriverCounters {
    pub finds: u64,
    pub counts: u64,
    pub estimated_counts: u64,
    pub distincts: u64,
    pub find_and_modify: u64,
    pub cursor_opens: u64,
    pub cursor_fetches: u64,
    pub cursor_closes: u64,
    pub bulk_executions: u64,
}

/// One executed bulk context.
#[derive(Debug, Clone, PartialEq)]
pub struct BulkExecution {
    pub database: String,
    pub collection: String,
    pub ordered: bool,
    pub write_concern: Option<WriteConcern>,
    pub requests: Vec<BulkRequest>,
}

struct OpenCursor {
    remaining: VecDeque<Document>,
}

struct Inner {
    collections: RwLock<HashMap<String, Vec<Document>>>,
    cursors: Mutex<HashMap<CursorId, OpenCursor>>,
    next_cursor: AtomicU64,
    transaction: AtomicBool,
    bulk_capacity: RwLock<Option<usize>>,
    failing: RwLock<HashSet<String>>,
    latency: RwLock<Duration>,
    counters: Counters,
    executions: Mutex<Vec<BulkExecution>>,
    last_read_preference: Mutex<Option<ReadPreference>>,
}

/// Thread-safe in-memory implementation of [`Driver`]. Clones share state.
#[derive(Clone)]
pub struct MemoryDriver {
    inner: Arc<Inner>,
}

impl Default for MemoryDriver {
    fn default() -> Self {
        Self::new()
    }
}

fn ns(database: &str, collection: &str) -> String {
    format!("{database}.{collection}")
}

impl MemoryDriver {
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                collections: RwLock::new(HashMap::new()),
                cursors: Mutex::new(HashMap::new()),
                next_cursor: AtomicU64::new(1),
                transaction: AtomicBool::new(false),
                bulk_capacity: RwLock::new(None),
                failing: RwLock::new(HashSet::new()),
                latency: RwLock::new(Duration::ZERO),
                counters: Counters::default(),
                executions: Mutex::new(Vec::new()),
                last_read_preference: Mutex::new(None),
            }),
        }
    }

    /// Seed documents directly, bypassing the runtime.
    pub fn insert_raw(&self, database: &str, collection: &str, docs: impl IntoIterator<Item = Document>) {
        let mut cols = self.inner.collections.write();
        let col = cols.entry(ns(database, collection)).or_default();
        for mut d in docs {
            if !d.contains_key("_id") {
                d.insert("_id", ObjectId::new());
            }
            col.push(d);
        }
    }

    #[must_use]
    pub fn documents(&self, database: &str, collection: &str) -> Vec<Document> {
        self.inner.collections.read().get(&ns(database, collection)).cloned().unwrap_or_default()
    }

    #[must_use]
    pub fn collection_len(&self, database: &str, collection: &str) -> usize {
        self.inner.collections.read().get(&ns(database, collection)).map_or(0, Vec::len)
    }

    pub fn set_transaction_active(&self, active: bool) {
        self.inner.transaction.store(active, Ordering::SeqCst);
    }

    /// Bound every bulk context to `capacity` requests; further appends are rejected locally.
    pub fn set_bulk_capacity(&self, capacity: Option<usize>) {
        *self.inner.bulk_capacity.write() = capacity;
    }

    /// Make every round trip touching `collection` fail with a transport error.
    pub fn set_failing(&self, collection: &str, failing: bool) {
        let mut f = self.inner.failing.write();
        if failing {
            f.insert(collection.to_string());
        } else {
            f.remove(collection);
        }
    }

    /// Simulated network latency per round trip.
    pub fn set_latency(&self, latency: Duration) {
        *self.inner.latency.write() = latency;
    }

    #[must_use]
    pub fn counters(&self) -> DriverCounters {
        let c = &self.inner.counters;
        DriverCounters {
            finds: c.finds.load(Ordering::Relaxed),
            counts: c.counts.load(Ordering::Relaxed),
            estimated_counts: c.estimated_counts.load(Ordering::Relaxed),
            distincts: c.distincts.load(Ordering::Relaxed),
            find_and_modify: c.find_and_modify.load(Ordering::Relaxed),
            cursor_opens: c.cursor_opens.load(Ordering::Relaxed),
            cursor_fetches: c.cursor_fetches.load(Ordering::Relaxed),
            cursor_closes: c.cursor_closes.load(Ordering::Relaxed),
            bulk_executions: c.bulk_executions.load(Ordering::Relaxed),
        }
    }

    #[must_use]
    pub fn executions(&self) -> Vec<BulkExecution> {
        self.inner.executions.lock().clone()
    }

    #[must_use]
    pub fn open_cursors(&self) -> usize {
        self.inner.cursors.lock().len()
    }

    #[must_use]
    pub fn last_read_preference(&self) -> Option<ReadPreference> {
        *self.inner.last_read_preference.lock()
    }

    fn round_trip(&self, collection: &str) -> Result<(), OdmError> {
        let latency = *self.inner.latency.read();
        if !latency.is_zero() {
            std::thread::sleep(latency);
        }
        if self.inner.failing.read().contains(collection) {
            return Err(OdmError::Transport(format!("connection reset while talking to {collection}")));
        }
        Ok(())
    }

    fn select(&self, request: &FindRequest) -> Result<Vec<Document>, OdmError> {
        let matcher = parse_filter(&request.filter)?;
        *self.inner.last_read_preference.lock() = request.read_preference;
        let mut docs: Vec<Document> = self
            .inner
            .collections
            .read()
            .get(&ns(&request.database, &request.collection))
            .map(|c| c.iter().filter(|d| eval_filter(d, &matcher)).cloned().collect())
            .unwrap_or_default();
        if !request.sort.is_empty() {
            docs.sort_by(|a, b| compare_docs(a, b, &request.sort));
        }
        let skip = u64_to_usize(request.skip).unwrap_or(usize::MAX);
        let limit = if request.limit == 0 { usize::MAX } else { u64_to_usize(request.limit).unwrap_or(usize::MAX) };
        let mut docs: Vec<Document> = docs.into_iter().skip(skip).take(limit).collect();
        if let Some(p) = &request.projection {
            for d in &mut docs {
                *d = project(d, p);
            }
        }
        Ok(docs)
    }

    fn take_batch(cursor: &mut OpenCursor, batch_size: usize) -> Vec<Document> {
        let n = batch_size.max(1).min(cursor.remaining.len());
        cursor.remaining.drain(..n).collect()
    }

    fn find_and_modify(&self, request: &FindAndModifyRequest) -> Result<Option<Document>, OdmError> {
        self.inner.counters.find_and_modify.fetch_add(1, Ordering::Relaxed);
        self.round_trip(&request.collection)?;
        let matcher = parse_filter(&request.filter)?;
        let mut cols = self.inner.collections.write();
        let col = cols.entry(ns(&request.database, &request.collection)).or_default();
        let mut candidates: Vec<usize> = (0..col.len()).filter(|i| eval_filter(&col[*i], &matcher)).collect();
        if !request.sort.is_empty() {
            candidates.sort_by(|a, b| compare_docs(&col[*a], &col[*b], &request.sort));
        }
        let Some(&idx) = candidates.first() else {
            if let (Some(update), true) = (&request.update, request.upsert) {
                let mut seed = upsert_seed(&request.filter);
                apply_update(&mut seed, update)?;
                if !seed.contains_key("_id") {
                    seed.insert("_id", ObjectId::new());
                }
                col.push(seed.clone());
                return Ok(request.return_new.then_some(seed));
            }
            return Ok(None);
        };
        match &request.update {
            None => Ok(Some(col.remove(idx))),
            Some(update) => {
                let before = col[idx].clone();
                apply_update(&mut col[idx], update)?;
                Ok(Some(if request.return_new { col[idx].clone() } else { before }))
            }
        }
    }
}

impl Driver for MemoryDriver {
    fn find(&self, request: &FindRequest) -> Result<Vec<Document>, OdmError> {
        self.inner.counters.finds.fetch_add(1, Ordering::Relaxed);
        self.round_trip(&request.collection)?;
        self.select(request)
    }

    fn init_iteration(&self, request: &FindRequest) -> Result<CursorBatch, OdmError> {
        self.inner.counters.cursor_opens.fetch_add(1, Ordering::Relaxed);
        self.round_trip(&request.collection)?;
        let mut cursor = OpenCursor { remaining: self.select(request)?.into() };
        let documents = Self::take_batch(&mut cursor, request.batch_size);
        let has_more = !cursor.remaining.is_empty();
        let cursor_id = self.inner.next_cursor.fetch_add(1, Ordering::Relaxed);
        self.inner.cursors.lock().insert(cursor_id, cursor);
        Ok(CursorBatch { cursor_id, documents, has_more })
    }

    fn next_iteration(&self, cursor: CursorId, batch_size: usize) -> Result<CursorBatch, OdmError> {
        self.inner.counters.cursor_fetches.fetch_add(1, Ordering::Relaxed);
        let latency = *self.inner.latency.read();
        if !latency.is_zero() {
            std::thread::sleep(latency);
        }
        let mut cursors = self.inner.cursors.lock();
        let open = cursors.get_mut(&cursor).ok_or(OdmError::CursorNotFound(cursor))?;
        let documents = Self::take_batch(open, batch_size);
        Ok(CursorBatch { cursor_id: cursor, documents, has_more: !open.remaining.is_empty() })
    }

    fn close_iteration(&self, cursor: CursorId) -> Result<(), OdmError> {
        self.inner.counters.cursor_closes.fetch_add(1, Ordering::Relaxed);
        self.inner.cursors.lock().remove(&cursor).map(|_| ()).ok_or(OdmError::CursorNotFound(cursor))
    }

    fn count(&self, request: &CountRequest) -> Result<u64, OdmError> {
        self.inner.counters.counts.fetch_add(1, Ordering::Relaxed);
        self.round_trip(&request.collection)?;
        let matcher = parse_filter(&request.filter)?;
        if matcher.contains_where() {
            return Err(OdmError::Transport("$where is not allowed in count".into()));
        }
        let n = self
            .inner
            .collections
            .read()
            .get(&ns(&request.database, &request.collection))
            .map_or(0, |c| c.iter().filter(|d| eval_filter(d, &matcher)).count());
        Ok(crate::utils::num::usize_to_u64(n))
    }

    fn estimated_document_count(
        &self,
        database: &str,
        collection: &str,
        read_preference: Option<ReadPreference>,
    ) -> Result<u64, OdmError> {
        self.inner.counters.estimated_counts.fetch_add(1, Ordering::Relaxed);
        self.round_trip(collection)?;
        *self.inner.last_read_preference.lock() = read_preference;
        Ok(crate::utils::num::usize_to_u64(self.collection_len(database, collection)))
    }

    fn distinct(&self, request: &DistinctRequest) -> Result<Vec<Bson>, OdmError> {
        self.inner.counters.distincts.fetch_add(1, Ordering::Relaxed);
        self.round_trip(&request.collection)?;
        let docs = self.select(&FindRequest {
            database: request.database.clone(),
            collection: request.collection.clone(),
            filter: request.filter.clone(),
            ..Default::default()
        })?;
        let mut out: Vec<Bson> = Vec::new();
        for d in &docs {
            if let Some(v) = super::eval::get_path(d, &request.field)
                && !out.iter().any(|x| super::eval::values_equal(x, v))
            {
                out.push(v.clone());
            }
        }
        Ok(out)
    }

    fn find_one_and_delete(&self, request: &FindAndModifyRequest) -> Result<Option<Document>, OdmError> {
        let mut request = request.clone();
        request.update = None;
        self.find_and_modify(&request)
    }

    fn find_one_and_update(&self, request: &FindAndModifyRequest) -> Result<Option<Document>, OdmError> {
        if request.update.is_none() {
            return Err(OdmError::InvalidQuery("find_one_and_update without update".into()));
        }
        self.find_and_modify(request)
    }

    fn create_bulk_context(
        &self,
        database: &str,
        collection: &str,
        ordered: bool,
        write_concern: Option<&WriteConcern>,
    ) -> Box<dyn BulkContext> {
        Box::new(MemoryBulkContext {
            driver: self.clone(),
            capacity: *self.inner.bulk_capacity.read(),
            execution: BulkExecution {
                database: database.to_string(),
                collection: collection.to_string(),
                ordered,
                write_concern: write_concern.cloned(),
                requests: Vec::new(),
            },
        })
    }

    fn is_transaction_active(&self) -> bool {
        self.inner.transaction.load(Ordering::SeqCst)
    }
}

struct MemoryBulkContext {
    driver: MemoryDriver,
    capacity: Option<usize>,
    execution: BulkExecution,
}

fn apply_request(col: &mut Vec<Document>, request: &BulkRequest, out: &mut BulkOutcome) -> Result<(), String> {
    match request {
        BulkRequest::Insert { document } => {
            let mut d = document.clone();
            if !d.contains_key("_id") {
                d.insert("_id", ObjectId::new());
            }
            if let Some(id) = d.get("_id")
                && col.iter().any(|x| x.get("_id") == Some(id))
            {
                return Err(format!("duplicate key: _id {id}"));
            }
            col.push(d);
            out.inserted += 1;
        }
        BulkRequest::Update { filter, update, upsert, multi } => {
            let m = parse_filter(filter).map_err(|e| e.to_string())?;
            let mut matched = 0u64;
            for d in col.iter_mut().filter(|d| eval_filter(d, &m)) {
                matched += 1;
                if apply_update(d, update).map_err(|e| e.to_string())? {
                    out.modified += 1;
                }
                if !*multi {
                    break;
                }
            }
            out.matched += matched;
            if matched == 0 && *upsert {
                let mut seed = upsert_seed(filter);
                apply_update(&mut seed, update).map_err(|e| e.to_string())?;
                if !seed.contains_key("_id") {
                    seed.insert("_id", ObjectId::new());
                }
                col.push(seed);
                out.upserted += 1;
            }
        }
        BulkRequest::Replace { filter, replacement, upsert } => {
            let m = parse_filter(filter).map_err(|e| e.to_string())?;
            if let Some(d) = col.iter_mut().find(|d| eval_filter(d, &m)) {
                out.matched += 1;
                if apply_update(d, replacement).map_err(|e| e.to_string())? {
                    out.modified += 1;
                }
            } else if *upsert {
                let mut seed = upsert_seed(filter);
                for (k, v) in replacement {
                    seed.insert(k.clone(), v.clone());
                }
                col.push(seed);
                out.upserted += 1;
            }
        }
        BulkRequest::Delete { filter, multi } => {
            let m = parse_filter(filter).map_err(|e| e.to_string())?;
            let before = col.len();
            if *multi {
                col.retain(|d| !eval_filter(d, &m));
            } else if let Some(pos) = col.iter().position(|d| eval_filter(d, &m)) {
                col.remove(pos);
            }
            out.deleted += crate::utils::num::usize_to_u64(before - col.len());
        }
    }
    Ok(())
}

impl BulkContext for MemoryBulkContext {
    fn collection(&self) -> &str {
        &self.execution.collection
    }

    fn add_request(&mut self, request: BulkRequest) -> Result<(), OdmError> {
        if self.remaining_capacity() == Some(0) {
            return Err(OdmError::SubmissionRejected(format!(
                "bulk context for {} is full",
                self.execution.collection
            )));
        }
        self.execution.requests.push(request);
        Ok(())
    }

    fn remaining_capacity(&self) -> Option<usize> {
        self.capacity.map(|c| c.saturating_sub(self.execution.requests.len()))
    }

    fn len(&self) -> usize {
        self.execution.requests.len()
    }

    fn execute(self: Box<Self>) -> Result<BulkOutcome, OdmError> {
        let MemoryBulkContext { driver, execution, .. } = *self;
        driver.inner.counters.bulk_executions.fetch_add(1, Ordering::Relaxed);
        driver.round_trip(&execution.collection)?;
        let mut out = BulkOutcome::default();
        {
            let mut cols = driver.inner.collections.write();
            let col = cols.entry(ns(&execution.database, &execution.collection)).or_default();
            for (index, request) in execution.requests.iter().enumerate() {
                if let Err(message) = apply_request(col, request, &mut out) {
                    out.failures.push(BulkFailure { index, message });
                    if execution.ordered {
                        break;
                    }
                }
            }
        }
        driver.inner.executions.lock().push(execution);
        Ok(out)
    }
}
