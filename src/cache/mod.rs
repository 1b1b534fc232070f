//! Read-through result cache.
//!
//! The runtime talks to the cache through [`QueryCache`] so deployments can plug in a
//! shared or distributed cache; [`ResultCache`] is the in-process default.

pub mod config;
pub mod core;
pub mod key;
pub mod metrics;

use crate::entity::{CacheSettings, EntityMeta};
use std::any::Any;
use std::sync::Arc;

pub use config::ResultCacheConfig;
pub use self::core::ResultCache;
pub use key::{CacheKeyParts, cache_key, canonical_document};
pub use metrics::{CacheMetrics, CacheMetricsSnapshot};

/// Decoded results as stored in the cache; readers downcast to the shape they cached.
pub type CachedValue = Arc<dyn Any + Send + Sync>;

/// Namespace of raw map results, shared by every type.
pub const MAP_NAMESPACE: &str = "bson::Document";

/// Cache facade consumed by the query layer. Implementations must be thread-safe.
pub trait QueryCache: Send + Sync {
    fn is_cached(&self, type_name: &str, key: &str) -> bool;

    fn get_from_cache(&self, type_name: &str, key: &str) -> Option<CachedValue>;

    /// Invalidation generation of a namespace. Changes every time the namespace is cleared.
    fn generation(&self, type_name: &str) -> u64;

    /// Store `value` unless the namespace was cleared after `generation` was read, so a
    /// fetch that raced a write never repopulates the cache with pre-write results.
    /// Returns whether the value was stored.
    fn add_to_cache(
        &self,
        key: &str,
        type_name: &str,
        value: CachedValue,
        settings: &CacheSettings,
        generation: u64,
    ) -> bool;

    /// Invalidate what a mutation of `meta`'s type may have made stale. Must complete
    /// before the mutation is considered applied.
    fn clear_cache_if_necessary(&self, meta: &EntityMeta);

    fn clear_all(&self);
}
