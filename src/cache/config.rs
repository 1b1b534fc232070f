use serde::Deserialize;

/// Defaults for the result cache; per-type [`crate::entity::CacheSettings`] take precedence.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ResultCacheConfig {
    /// LRU bound per type namespace.
    pub max_entries: usize,
    /// Entry lifetime; 0 keeps entries until evicted or invalidated.
    pub ttl_ms: u64,
}

impl Default for ResultCacheConfig {
    fn default() -> Self {
        Self { max_entries: 10_000, ttl_ms: 60_000 }
    }
}
