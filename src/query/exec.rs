//! Terminal calls: cache lookup, one logical fetch, decode, cache population, profiling.

use super::cursor::{QueryIterator, SharedQueryIterator};
use super::model::Query;
use super::prefetch::PrefetchIterator;
use crate::buffer::WriteKind;
use crate::cache::{MAP_NAMESPACE, canonical_document};
use crate::driver::{BulkContext, BulkRequest, DistinctRequest, FindAndModifyRequest};
use crate::entity::Entity;
use crate::errors::OdmError;
use crate::odm::{id_filter, operator_update};
use crate::stats::{ReadAccess, ReadAccessKind, ReadSource, sha256_hex};
use bson::{Bson, Document, doc};
use log::{debug, warn};
use std::sync::Arc;
use std::time::Instant;

pub(crate) fn decode<T: Entity>(doc: Document) -> Result<T, OdmError> {
    let mut entity: T = bson::deserialize_from_document(doc).map_err(|e| OdmError::Decode(e.to_string()))?;
    entity.post_load();
    Ok(entity)
}

impl<T: Entity> Query<T> {
    pub(crate) fn record_read(&self, kind: ReadAccessKind, source: ReadSource, started: Instant, results: usize) {
        self.core.stats.record_read(&ReadAccess {
            type_name: self.meta.type_name,
            collection: self.collection_name().to_string(),
            kind,
            source,
            elapsed: started.elapsed(),
            results,
            filter_hash: sha256_hex(&canonical_document(&self.to_query_object())),
            at: chrono::Utc::now(),
        });
    }

    /// Read through the cache when the type caches, straight from the driver otherwise.
    fn cached_read<V>(
        &self,
        kind: ReadAccessKind,
        namespace: &str,
        key: impl FnOnce() -> String,
        fetch: impl FnOnce() -> Result<V, OdmError>,
        len: impl Fn(&V) -> usize,
    ) -> Result<V, OdmError>
    where
        V: Clone + Send + Sync + 'static,
    {
        let started = Instant::now();
        let Some(settings) = self.meta.cache.as_ref() else {
            let v = fetch()?;
            self.record_read(kind, ReadSource::Uncached, started, len(&v));
            return Ok(v);
        };
        let key = key();
        // Read before the fetch: a write clearing the namespace meanwhile voids the insert.
        let generation = self.core.cache.generation(namespace);
        if let Some(hit) = self.core.cache.get_from_cache(namespace, &key)
            && let Some(v) = (*hit).downcast_ref::<V>()
        {
            debug!("cache hit {key}");
            let v = v.clone();
            self.record_read(kind, ReadSource::CacheHit, started, len(&v));
            crate::dev6!("cache", decision = "hit", key = key);
            return Ok(v);
        }
        debug!("cache miss {key}");
        let v = fetch()?;
        if !self.core.cache.add_to_cache(&key, namespace, Arc::new(v.clone()), settings, generation) {
            debug!("not caching {key}: invalidated while fetching");
        }
        self.record_read(kind, ReadSource::CacheMiss, started, len(&v));
        crate::dev6!("cache", decision = "miss", key = key);
        Ok(v)
    }

    fn fetch_raw(&self, limit: u64) -> Result<Vec<Document>, OdmError> {
        self.core.driver.find(&self.find_request(limit, self.core.config.cursor_batch_size))
    }

    fn fetch_entities(&self, limit: u64) -> Result<Vec<T>, OdmError> {
        self.fetch_raw(limit)?.into_iter().map(decode::<T>).collect()
    }

    /// First match, fetched with limit 1. A miss is cached as an empty result.
    ///
    /// # Errors
    /// `Transport` from the driver, `Decode` on malformed documents.
    pub fn get(&self) -> Result<Option<T>, OdmError> {
        let type_name = self.meta.type_name;
        let items = self.cached_read(
            ReadAccessKind::Get,
            type_name,
            || self.cache_key_with(type_name, 1, None),
            || self.fetch_entities(1),
            Vec::len,
        )?;
        Ok(items.into_iter().next())
    }

    /// Every match. Types with last-access fields get those fields refreshed server-side.
    ///
    /// # Errors
    /// `Transport` from the driver, `Decode` on malformed documents.
    pub fn as_list(&self) -> Result<Vec<T>, OdmError> {
        let items = self.cached_read(
            ReadAccessKind::AsList,
            self.meta.type_name,
            || self.cache_key(),
            || self.fetch_entities(self.limit),
            Vec::len,
        )?;
        self.touch_last_access(&items);
        Ok(items)
    }

    /// Undecoded documents, cached in the shared map namespace.
    ///
    /// # Errors
    /// `Transport` from the driver.
    pub fn as_map_list(&self) -> Result<Vec<Document>, OdmError> {
        self.cached_read(
            ReadAccessKind::AsMapList,
            MAP_NAMESPACE,
            || self.cache_key_with(MAP_NAMESPACE, self.limit, None),
            || self.fetch_raw(self.limit),
            Vec::len,
        )
    }

    /// Identifiers of every match.
    ///
    /// # Errors
    /// `Transport` from the driver.
    pub fn id_list(&self) -> Result<Vec<Bson>, OdmError> {
        let id_field = self.meta.id_field;
        self.cached_read(
            ReadAccessKind::IdList,
            self.meta.type_name,
            || self.cache_key_with(self.meta.type_name, self.limit, Some("idlist")),
            || {
                let mut ids_only = self.clone();
                ids_only.projection = super::types::Projection::default();
                ids_only.projection.include(id_field)?;
                Ok(ids_only.fetch_raw(self.limit)?.into_iter().filter_map(|d| d.get(id_field).cloned()).collect())
            },
            Vec::len,
        )
    }

    /// Distinct values of `field` among the matches.
    ///
    /// # Errors
    /// `Transport` from the driver.
    pub fn distinct(&self, field: &str) -> Result<Vec<Bson>, OdmError> {
        let suffix = format!("distinct:{field}");
        self.cached_read(
            ReadAccessKind::Distinct,
            self.meta.type_name,
            || self.cache_key_with(self.meta.type_name, self.limit, Some(&suffix)),
            || {
                self.core.driver.distinct(&DistinctRequest {
                    database: self.core.config.database.clone(),
                    collection: self.collection_name().to_string(),
                    field: field.to_string(),
                    filter: self.to_query_object(),
                    collation: self.collation_ref().cloned(),
                    read_preference: Some(self.effective_read_preference()),
                })
            },
            Vec::len,
        )
    }

    /// Number of matches. Unfiltered queries use the estimated count outside transactions;
    /// where-clause queries are counted client-side over an id-only fetch.
    ///
    /// # Errors
    /// `Transport` from the driver.
    pub fn count_all(&self) -> Result<u64, OdmError> {
        let started = Instant::now();
        let count = if self.has_where() {
            let mut ids_only = self.clone();
            ids_only.projection = super::types::Projection::default();
            ids_only.projection.include(self.meta.id_field)?;
            ids_only.skip = 0;
            ids_only.limit = 0;
            crate::utils::num::usize_to_u64(ids_only.fetch_raw(0)?.len())
        } else if !self.has_filter() && !self.core.driver.is_transaction_active() {
            self.core.driver.estimated_document_count(
                &self.core.config.database,
                self.collection_name(),
                Some(self.effective_read_preference()),
            )?
        } else {
            self.core.driver.count(&self.count_request())?
        };
        self.record_read(ReadAccessKind::Count, ReadSource::Uncached, started, 1);
        Ok(count)
    }

    fn find_and_modify_request(&self, update: Option<Document>, return_new: bool) -> FindAndModifyRequest {
        FindAndModifyRequest {
            database: self.core.config.database.clone(),
            collection: self.collection_name().to_string(),
            filter: self.to_query_object(),
            sort: self.sort_document(),
            update,
            return_new,
            upsert: false,
            collation: self.collation_ref().cloned(),
        }
    }

    /// Delete the first match server-side and return it. Always a server round trip, even
    /// when the match is cached; the type's cache is cleared before and after.
    ///
    /// # Errors
    /// `Transport` from the driver, `Decode` on a malformed document.
    pub fn find_one_and_delete(&self) -> Result<Option<T>, OdmError> {
        let started = Instant::now();
        self.core.cache.clear_cache_if_necessary(&self.meta);
        let found = self.core.driver.find_one_and_delete(&self.find_and_modify_request(None, false))?;
        self.core.cache.clear_cache_if_necessary(&self.meta);
        let out = found.map(decode::<T>).transpose()?;
        self.record_read(ReadAccessKind::FindAndModify, ReadSource::Uncached, started, usize::from(out.is_some()));
        Ok(out)
    }

    /// Apply `update` to the first match server-side; returns the document before or after.
    ///
    /// # Errors
    /// `Transport` from the driver, `Decode` on a malformed document.
    pub fn find_one_and_update(&self, update: Document, return_new: bool) -> Result<Option<T>, OdmError> {
        let started = Instant::now();
        self.core.cache.clear_cache_if_necessary(&self.meta);
        let found = self.core.driver.find_one_and_update(&self.find_and_modify_request(Some(update), return_new))?;
        self.core.cache.clear_cache_if_necessary(&self.meta);
        let out = found.map(decode::<T>).transpose()?;
        self.record_read(ReadAccessKind::FindAndModify, ReadSource::Uncached, started, usize::from(out.is_some()));
        Ok(out)
    }

    /// Lazy iterator with the configured cursor batch size. Never cached.
    #[must_use]
    pub fn as_iterable(&self) -> QueryIterator<T> {
        QueryIterator::new(self.clone(), self.core.config.cursor_batch_size)
    }

    #[must_use]
    pub fn as_iterable_with(&self, window: usize) -> QueryIterator<T> {
        QueryIterator::new(self.clone(), window)
    }

    /// Iterator safe to share between threads.
    #[must_use]
    pub fn as_shared_iterable(&self, window: usize) -> SharedQueryIterator<T> {
        SharedQueryIterator::new(self.clone(), window)
    }

    /// Iterator that keeps up to `prefetch_windows` batches in flight.
    ///
    /// # Errors
    /// `Io` when the fetcher thread cannot start.
    pub fn as_prefetch_iterable(&self, window: usize, prefetch_windows: usize) -> Result<PrefetchIterator<T>, OdmError> {
        PrefetchIterator::start(self.clone(), window, prefetch_windows)
    }

    fn submit_async(&self, job: impl FnOnce() + Send + 'static) -> Result<(), OdmError> {
        let pool = self.pool.upgrade().ok_or(OdmError::Shutdown)?;
        pool.submit(job)
    }

    /// [`Self::as_list`] on the async pool.
    ///
    /// # Errors
    /// `Shutdown` after shutdown. A saturated pool runs the call on the calling thread.
    pub fn as_list_async<F>(&self, callback: F) -> Result<(), OdmError>
    where
        F: FnOnce(Result<Vec<T>, OdmError>) + Send + 'static,
    {
        let q = self.clone();
        self.submit_async(move || callback(q.as_list()))
    }

    /// # Errors
    /// As [`Self::as_list_async`].
    pub fn get_async<F>(&self, callback: F) -> Result<(), OdmError>
    where
        F: FnOnce(Result<Option<T>, OdmError>) + Send + 'static,
    {
        let q = self.clone();
        self.submit_async(move || callback(q.get()))
    }

    /// # Errors
    /// As [`Self::as_list_async`].
    pub fn count_all_async<F>(&self, callback: F) -> Result<(), OdmError>
    where
        F: FnOnce(Result<u64, OdmError>) + Send + 'static,
    {
        let q = self.clone();
        self.submit_async(move || callback(q.count_all()))
    }

    /// # Errors
    /// As [`Self::as_list_async`].
    pub fn id_list_async<F>(&self, callback: F) -> Result<(), OdmError>
    where
        F: FnOnce(Result<Vec<Bson>, OdmError>) + Send + 'static,
    {
        let q = self.clone();
        self.submit_async(move || callback(q.id_list()))
    }

    fn new_context(&self) -> Box<dyn BulkContext> {
        self.core.driver.create_bulk_context(&self.core.config.database, self.collection_name(), false, None)
    }

    fn run_touch(&self, ctx: Box<dyn BulkContext>) {
        match ctx.execute() {
            Ok(outcome) => {
                for f in outcome.failures {
                    warn!("last-access update {} on {} failed: {}", f.index, self.collection_name(), f.message);
                }
            }
            Err(e) => warn!("last-access update on {} failed: {e}", self.collection_name()),
        }
    }

    /// `$set` the type's last-access fields to now, outside the buffer and the cache.
    fn touch_last_access(&self, items: &[T]) {
        let fields = &self.meta.last_access_fields;
        if fields.is_empty() || items.is_empty() {
            return;
        }
        let now = Bson::DateTime(bson::DateTime::now());
        let mut set = Document::new();
        for f in fields {
            set.insert(f.clone(), now.clone());
        }
        let update = doc! { "$set": set };
        let mut ctx = self.new_context();
        for item in items {
            let Some(id) = item.id() else { continue };
            if ctx.remaining_capacity() == Some(0) && !ctx.is_empty() {
                let full = std::mem::replace(&mut ctx, self.new_context());
                self.run_touch(full);
            }
            let request =
                BulkRequest::Update { filter: id_filter(&self.meta, id), update: update.clone(), upsert: false, multi: false };
            if let Err(e) = ctx.add_request(request) {
                warn!("skipping last-access update on {}: {e}", self.collection_name());
            }
        }
        if !ctx.is_empty() {
            self.run_touch(ctx);
        }
    }

    fn write_matching(&self, kind: WriteKind, update: Option<Document>, multi: bool) -> Result<(), OdmError> {
        if self.has_where() {
            return Err(OdmError::InvalidQuery(format!("{kind} cannot be addressed by a where-clause")));
        }
        let filter = self.to_query_object();
        let request = match update {
            Some(update) => BulkRequest::Update { filter, update, upsert: false, multi },
            None => BulkRequest::Delete { filter, multi },
        };
        self.core.submit_write(&self.meta, self.collection_name(), kind, vec![request], None)
    }

    /// `$set` on the first match, or every match when `multi`.
    ///
    /// # Errors
    /// `InvalidQuery` for where-clause queries, `Shutdown`, or `Transport` for unbuffered types.
    pub fn set(&self, field: &str, value: impl Into<Bson>, multi: bool) -> Result<(), OdmError> {
        self.write_matching(WriteKind::Set, Some(operator_update("$set", field, value.into())), multi)
    }

    /// # Errors
    /// As [`Self::set`].
    pub fn inc(&self, field: &str, amount: impl Into<Bson>, multi: bool) -> Result<(), OdmError> {
        self.write_matching(WriteKind::Inc, Some(operator_update("$inc", field, amount.into())), multi)
    }

    /// # Errors
    /// As [`Self::set`].
    pub fn push(&self, field: &str, value: impl Into<Bson>, multi: bool) -> Result<(), OdmError> {
        self.write_matching(WriteKind::Push, Some(operator_update("$push", field, value.into())), multi)
    }

    /// # Errors
    /// As [`Self::set`].
    pub fn pull(&self, field: &str, value: impl Into<Bson>, multi: bool) -> Result<(), OdmError> {
        self.write_matching(WriteKind::Pull, Some(operator_update("$pull", field, value.into())), multi)
    }

    /// # Errors
    /// As [`Self::set`].
    pub fn unset(&self, field: &str, multi: bool) -> Result<(), OdmError> {
        self.write_matching(WriteKind::Unset, Some(operator_update("$unset", field, Bson::String(String::new()))), multi)
    }

    /// # Errors
    /// As [`Self::set`].
    pub fn delete(&self, multi: bool) -> Result<(), OdmError> {
        self.write_matching(WriteKind::Delete, None, multi)
    }
}
