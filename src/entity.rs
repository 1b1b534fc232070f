//! Entity metadata: the per-type policy a runtime needs to read, cache and buffer a type.
//!
//! Types describe themselves through [`Entity`]. The [`EntityRegistry`] turns that into a
//! read-mostly [`EntityMeta`] keyed by `TypeId`, so the housekeeping loop can resolve
//! policies without generics.

use crate::driver::WriteConcern;
use bson::Bson;
use parking_lot::RwLock;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::any::TypeId;
use std::collections::HashMap;
use std::sync::Arc;

/// What to do when a type's write queue is at its configured maximum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OverflowPolicy {
    /// Accept anyway and log a warning.
    JustWarn,
    /// Drop the new operation.
    IgnoreNew,
    /// Execute the new operation alone, bypassing the queue.
    #[default]
    WriteNew,
    /// Execute the oldest queued operation alone, then enqueue the new one.
    WriteOld,
    /// Discard the oldest queued operation unwritten, then enqueue the new one.
    DelOld,
}

/// Write-buffer policy of one entity type.
#[derive(Debug, Clone, PartialEq)]
pub struct WriteBufferSettings {
    /// 0 = unbounded.
    pub max_size: usize,
    /// -1 = flushed once `max_size` is reached; with an unbounded queue, every cycle.
    pub timeout_ms: i64,
    pub policy: OverflowPolicy,
    pub ordered: bool,
    pub write_concern: Option<WriteConcern>,
}

impl Default for WriteBufferSettings {
    fn default() -> Self {
        Self { max_size: 0, timeout_ms: 1_000, policy: OverflowPolicy::WriteNew, ordered: false, write_concern: None }
    }
}

/// Read-cache policy of one entity type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheSettings {
    pub max_entries: usize,
    pub ttl_ms: u64,
    /// Invalidate the type's cached results on every mutation.
    pub clear_on_write: bool,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self { max_entries: 10_000, ttl_ms: 60_000, clear_on_write: true }
    }
}

/// A mapped document type.
pub trait Entity: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    fn collection_name() -> &'static str;

    fn id_field() -> &'static str {
        "_id"
    }

    /// Every stored field; a projection equal to this set is no projection at all.
    fn declared_fields() -> &'static [&'static str];

    fn id(&self) -> Option<Bson>;

    /// Called by `store` when a new id was generated for an entity without one.
    fn set_id(&mut self, _id: Bson) {}

    /// Fields refreshed with the current time whenever the entity is read by `as_list`.
    fn last_access_fields() -> &'static [&'static str] {
        &[]
    }

    fn cache_settings() -> Option<CacheSettings> {
        None
    }

    fn write_buffer_settings() -> Option<WriteBufferSettings> {
        None
    }

    /// Runs after every decode of a server document, before the result is cached.
    fn post_load(&mut self) {}
}

/// Resolved metadata of one registered type.
#[derive(Debug, Clone)]
pub struct EntityMeta {
    pub type_id: TypeId,
    pub type_name: &'static str,
    pub collection: String,
    pub id_field: &'static str,
    pub declared_fields: Vec<String>,
    pub last_access_fields: Vec<String>,
    pub cache: Option<CacheSettings>,
    pub write_buffer: Option<WriteBufferSettings>,
}

impl EntityMeta {
    #[must_use]
    pub fn of<T: Entity>() -> Self {
        Self {
            type_id: TypeId::of::<T>(),
            type_name: std::any::type_name::<T>(),
            collection: T::collection_name().to_string(),
            id_field: T::id_field(),
            declared_fields: T::declared_fields().iter().map(|f| (*f).to_string()).collect(),
            last_access_fields: T::last_access_fields().iter().map(|f| (*f).to_string()).collect(),
            cache: T::cache_settings(),
            write_buffer: T::write_buffer_settings(),
        }
    }
}

/// Start-up populated map from type identity to policy.
#[derive(Default)]
pub struct EntityRegistry {
    metas: RwLock<HashMap<TypeId, Arc<EntityMeta>>>,
}

impl EntityRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `T`, keeping an existing registration (and its overrides) if present.
    pub fn register<T: Entity>(&self) -> Arc<EntityMeta> {
        if let Some(m) = self.metas.read().get(&TypeId::of::<T>()) {
            return m.clone();
        }
        let mut w = self.metas.write();
        w.entry(TypeId::of::<T>()).or_insert_with(|| Arc::new(EntityMeta::of::<T>())).clone()
    }

    /// Metadata of `T`; unknown types are registered on first use.
    pub fn meta<T: Entity>(&self) -> Arc<EntityMeta> {
        self.register::<T>()
    }

    #[must_use]
    pub fn get(&self, type_id: TypeId) -> Option<Arc<EntityMeta>> {
        self.metas.read().get(&type_id).cloned()
    }

    pub fn set_write_buffer<T: Entity>(&self, settings: Option<WriteBufferSettings>) {
        self.update::<T>(|m| m.write_buffer = settings);
    }

    pub fn set_cache<T: Entity>(&self, settings: Option<CacheSettings>) {
        self.update::<T>(|m| m.cache = settings);
    }

    pub fn set_collection<T: Entity>(&self, collection: impl Into<String>) {
        let collection = collection.into();
        self.update::<T>(|m| m.collection = collection);
    }

    fn update<T: Entity>(&self, f: impl FnOnce(&mut EntityMeta)) {
        let current = self.register::<T>();
        let mut next = (*current).clone();
        f(&mut next);
        self.metas.write().insert(TypeId::of::<T>(), Arc::new(next));
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.metas.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.metas.read().is_empty()
    }
}
