//! The runtime handle: owns the driver, cache, registry, write buffer and async pool.

use crate::buffer::{EnqueueOutcome, PendingOperation, WriteBufferManager, WriteCallback, WriteKind};
use crate::cache::{QueryCache, ResultCache};
use crate::config::OdmConfig;
use crate::driver::{BulkRequest, Driver};
use crate::entity::{Entity, EntityMeta, EntityRegistry};
use crate::errors::OdmError;
use crate::pool::AsyncPool;
use crate::query::Query;
use crate::stats::{ProfilingListener, Stats, StatsSnapshot, WriteAccess};
use bson::{Bson, Document};
use log::info;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// State shared by the runtime handle and every query built from it.
pub(crate) struct OdmCore {
    pub(crate) config: OdmConfig,
    pub(crate) driver: Arc<dyn Driver>,
    pub(crate) cache: Arc<dyn QueryCache>,
    pub(crate) registry: Arc<EntityRegistry>,
    pub(crate) stats: Arc<Stats>,
    pub(crate) buffer: WriteBufferManager,
}

pub(crate) fn id_filter(meta: &EntityMeta, id: Bson) -> Document {
    let mut d = Document::new();
    d.insert(meta.id_field, id);
    d
}

/// `{op: {field: value}}`.
pub(crate) fn operator_update(op: &str, field: &str, value: Bson) -> Document {
    let mut inner = Document::new();
    inner.insert(field, value);
    let mut d = Document::new();
    d.insert(op, inner);
    d
}

pub(crate) fn encode<T: Entity>(entity: &T) -> Result<Document, OdmError> {
    bson::serialize_to_document(entity).map_err(|e| OdmError::Encode(e.to_string()))
}

impl OdmCore {
    /// Invalidate, then buffer or execute. The cache is cleared before the write can land.
    pub(crate) fn submit_write(
        &self,
        meta: &EntityMeta,
        collection: &str,
        kind: WriteKind,
        requests: Vec<BulkRequest>,
        callback: Option<WriteCallback>,
    ) -> Result<(), OdmError> {
        if requests.is_empty() {
            return Ok(());
        }
        let started = Instant::now();
        self.cache.clear_cache_if_necessary(meta);
        let mut op = PendingOperation::new(meta, collection, kind, requests);
        if let Some(cb) = callback {
            op = op.with_callback(cb);
        }
        let buffered = if meta.write_buffer.is_some() {
            match self.buffer.enqueue(op)? {
                EnqueueOutcome::Dropped => return Ok(()),
                EnqueueOutcome::WrittenDirectly => false,
                _ => true,
            }
        } else {
            let outcome = self.buffer.execute_direct(op)?;
            if let Some(f) = outcome.failures.first() {
                return Err(OdmError::Transport(format!(
                    "{kind} on {collection} failed at request {}: {}",
                    f.index, f.message
                )));
            }
            false
        };
        self.stats.record_write(&WriteAccess {
            type_name: meta.type_name,
            collection: collection.to_string(),
            kind,
            buffered,
            elapsed: started.elapsed(),
            at: chrono::Utc::now(),
        });
        Ok(())
    }

    fn store_request<T: Entity>(meta: &EntityMeta, entity: &mut T) -> Result<BulkRequest, OdmError> {
        match entity.id() {
            Some(id) => {
                let mut replacement = encode(entity)?;
                replacement.insert(meta.id_field, id.clone());
                Ok(BulkRequest::Replace { filter: id_filter(meta, id), replacement, upsert: true })
            }
            None => {
                let id = Bson::ObjectId(bson::oid::ObjectId::new());
                entity.set_id(id.clone());
                let mut document = encode(entity)?;
                document.insert(meta.id_field, id);
                Ok(BulkRequest::Insert { document })
            }
        }
    }
}

/// Handle to one database through one driver. Dropping it flushes buffered writes.
pub struct Odm {
    core: Arc<OdmCore>,
    pool: Arc<AsyncPool>,
}

impl Odm {
    /// Runtime with the in-process [`ResultCache`].
    ///
    /// # Errors
    /// `Io` when the housekeeping thread or async pool cannot start.
    pub fn new(config: OdmConfig, driver: Arc<dyn Driver>) -> Result<Self, OdmError> {
        let cache = Arc::new(ResultCache::new(config.cache.clone()));
        Self::with_cache(config, driver, cache)
    }

    /// # Errors
    /// `Io` when the housekeeping thread or async pool cannot start.
    pub fn with_cache(config: OdmConfig, driver: Arc<dyn Driver>, cache: Arc<dyn QueryCache>) -> Result<Self, OdmError> {
        let registry = Arc::new(EntityRegistry::new());
        let stats = Arc::new(Stats::new(config.slow_read_ms));
        let buffer = WriteBufferManager::new(
            config.database.clone(),
            Arc::clone(&driver),
            Arc::clone(&cache),
            Arc::clone(&registry),
            Arc::clone(&stats),
        );
        buffer.start(config.housekeeping_granularity())?;
        let pool = Arc::new(AsyncPool::new(config.async_threads, config.max_async_pending)?);
        info!(
            "runtime started for database {} (housekeeping every {} ms, {} async threads)",
            config.database, config.housekeeping_granularity_ms, config.async_threads
        );
        Ok(Self { core: Arc::new(OdmCore { config, driver, cache, registry, stats, buffer }), pool })
    }

    #[must_use]
    pub fn config(&self) -> &OdmConfig {
        &self.core.config
    }

    #[must_use]
    pub fn registry(&self) -> &EntityRegistry {
        &self.core.registry
    }

    pub fn register<T: Entity>(&self) -> Arc<EntityMeta> {
        self.core.registry.register::<T>()
    }

    #[must_use]
    pub fn cache(&self) -> &dyn QueryCache {
        self.core.cache.as_ref()
    }

    /// A fresh query over `T`'s collection.
    #[must_use]
    pub fn query<T: Entity>(&self) -> Query<T> {
        Query::new(Arc::clone(&self.core), Arc::downgrade(&self.pool), self.core.registry.meta::<T>())
    }

    /// Insert `entity`, or replace it by id when it has one. Entities without an id get a
    /// generated `ObjectId` through [`Entity::set_id`].
    ///
    /// # Errors
    /// `Encode`, `Shutdown`, or `Transport` for unbuffered types.
    pub fn store<T: Entity>(&self, entity: &mut T) -> Result<(), OdmError> {
        let meta = self.core.registry.meta::<T>();
        let request = OdmCore::store_request(&meta, entity)?;
        self.core.submit_write(&meta, &meta.collection, WriteKind::Store, vec![request], None)
    }

    /// Like [`Self::store`]; `callback` runs once the write is handed to a bulk context.
    ///
    /// # Errors
    /// As [`Self::store`].
    pub fn store_with_callback<T: Entity>(&self, entity: &mut T, callback: WriteCallback) -> Result<(), OdmError> {
        let meta = self.core.registry.meta::<T>();
        let request = OdmCore::store_request(&meta, entity)?;
        self.core.submit_write(&meta, &meta.collection, WriteKind::Store, vec![request], Some(callback))
    }

    /// Store every entity as one pending operation.
    ///
    /// # Errors
    /// As [`Self::store`].
    pub fn store_list<T: Entity>(&self, entities: &mut [T]) -> Result<(), OdmError> {
        let meta = self.core.registry.meta::<T>();
        let requests = entities
            .iter_mut()
            .map(|e| OdmCore::store_request(&meta, e))
            .collect::<Result<Vec<_>, _>>()?;
        self.core.submit_write(&meta, &meta.collection, WriteKind::Store, requests, None)
    }

    fn by_id<T: Entity>(&self, entity: &T, kind: WriteKind, update: Option<Document>) -> Result<(), OdmError> {
        let meta = self.core.registry.meta::<T>();
        let Some(id) = entity.id() else {
            return Err(OdmError::InvalidQuery(format!("{kind} needs an entity with an id")));
        };
        let filter = id_filter(&meta, id);
        let request = match update {
            Some(update) => BulkRequest::Update { filter, update, upsert: false, multi: false },
            None => BulkRequest::Delete { filter, multi: false },
        };
        self.core.submit_write(&meta, &meta.collection, kind, vec![request], None)
    }

    /// # Errors
    /// `InvalidQuery` when the entity has no id; otherwise as [`Self::store`].
    pub fn delete<T: Entity>(&self, entity: &T) -> Result<(), OdmError> {
        self.by_id(entity, WriteKind::Delete, None)
    }

    /// `$set` one field of a stored entity.
    ///
    /// # Errors
    /// `InvalidQuery` when the entity has no id; otherwise as [`Self::store`].
    pub fn set<T: Entity>(&self, entity: &T, field: &str, value: impl Into<Bson>) -> Result<(), OdmError> {
        self.by_id(entity, WriteKind::Set, Some(operator_update("$set", field, value.into())))
    }

    /// # Errors
    /// As [`Self::set`].
    pub fn inc<T: Entity>(&self, entity: &T, field: &str, amount: impl Into<Bson>) -> Result<(), OdmError> {
        self.by_id(entity, WriteKind::Inc, Some(operator_update("$inc", field, amount.into())))
    }

    /// # Errors
    /// As [`Self::set`].
    pub fn push<T: Entity>(&self, entity: &T, field: &str, value: impl Into<Bson>) -> Result<(), OdmError> {
        self.by_id(entity, WriteKind::Push, Some(operator_update("$push", field, value.into())))
    }

    /// # Errors
    /// As [`Self::set`].
    pub fn pull<T: Entity>(&self, entity: &T, field: &str, value: impl Into<Bson>) -> Result<(), OdmError> {
        self.by_id(entity, WriteKind::Pull, Some(operator_update("$pull", field, value.into())))
    }

    /// # Errors
    /// As [`Self::set`].
    pub fn unset<T: Entity>(&self, entity: &T, field: &str) -> Result<(), OdmError> {
        self.by_id(entity, WriteKind::Unset, Some(operator_update("$unset", field, Bson::String(String::new()))))
    }

    /// Flush every write queue now; returns the number of operations handed to the driver.
    pub fn flush(&self) -> usize {
        self.core.buffer.flush()
    }

    #[must_use]
    pub fn write_buffer_count(&self) -> usize {
        self.core.buffer.write_buffer_count()
    }

    /// Queued operations of `T`.
    #[must_use]
    pub fn write_buffer_count_for<T: Entity>(&self) -> usize {
        self.core.buffer.queue_len(std::any::TypeId::of::<T>())
    }

    #[must_use]
    pub fn stats(&self) -> StatsSnapshot {
        self.core.stats.snapshot()
    }

    pub fn add_profiling_listener(&self, listener: Arc<dyn ProfilingListener>) {
        self.core.stats.add_listener(listener);
    }

    /// Asynchronous calls submitted and not finished yet.
    #[must_use]
    pub fn async_in_flight(&self) -> usize {
        self.pool.in_flight()
    }

    /// Stop housekeeping, flush what is queued and stop the async pool. Idempotent.
    pub fn shutdown(&self) {
        self.core.buffer.shutdown();
        self.pool.shutdown(Duration::from_secs(5));
    }
}

impl Drop for Odm {
    fn drop(&mut self) {
        self.shutdown();
    }
}
