//! Runtime configuration: defaults, an optional TOML file, `NEXUS_ODM_*` overrides.

use crate::cache::ResultCacheConfig;
use crate::errors::OdmError;
use crate::query::ReadPreference;
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default)]
pub struct OdmConfig {
    pub database: String,
    /// Default window of a cursor iterator.
    pub cursor_batch_size: usize,
    /// Sleep between housekeeping passes.
    pub housekeeping_granularity_ms: u64,
    pub async_threads: usize,
    pub max_async_pending: usize,
    pub slow_read_ms: u64,
    pub default_read_preference: ReadPreference,
    pub cache: ResultCacheConfig,
}

impl Default for OdmConfig {
    fn default() -> Self {
        Self {
            database: "nexus".to_string(),
            cursor_batch_size: 1000,
            housekeeping_granularity_ms: 100,
            async_threads: 4,
            max_async_pending: 1024,
            slow_read_ms: 500,
            default_read_preference: ReadPreference::Primary,
            cache: ResultCacheConfig::default(),
        }
    }
}

fn parse_env<V: std::str::FromStr>(key: &str, raw: &str) -> Result<V, OdmError> {
    raw.trim().parse::<V>().map_err(|_| OdmError::Config(format!("{key}: cannot parse '{raw}'")))
}

impl OdmConfig {
    /// # Errors
    /// `Toml` on malformed input; `Config` when a value is out of range.
    pub fn from_toml_str(s: &str) -> Result<Self, OdmError> {
        let cfg: Self = toml::from_str(s)?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// # Errors
    /// `Io` when the file cannot be read, otherwise as [`Self::from_toml_str`].
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, OdmError> {
        let s = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml_str(&s)
    }

    /// Override fields from the process environment.
    ///
    /// # Errors
    /// `Config` when a variable is set but unparsable.
    pub fn apply_env(self) -> Result<Self, OdmError> {
        self.apply_env_from(|k| std::env::var(k).ok())
    }

    /// Override fields from `lookup`, keyed like the environment (`NEXUS_ODM_DATABASE`, ...).
    ///
    /// # Errors
    /// `Config` when a value is set but unparsable.
    pub fn apply_env_from(mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<Self, OdmError> {
        if let Some(v) = lookup("NEXUS_ODM_DATABASE") {
            self.database = v;
        }
        if let Some(v) = lookup("NEXUS_ODM_CURSOR_BATCH_SIZE") {
            self.cursor_batch_size = parse_env("NEXUS_ODM_CURSOR_BATCH_SIZE", &v)?;
        }
        if let Some(v) = lookup("NEXUS_ODM_HOUSEKEEPING_MS") {
            self.housekeeping_granularity_ms = parse_env("NEXUS_ODM_HOUSEKEEPING_MS", &v)?;
        }
        if let Some(v) = lookup("NEXUS_ODM_ASYNC_THREADS") {
            self.async_threads = parse_env("NEXUS_ODM_ASYNC_THREADS", &v)?;
        }
        if let Some(v) = lookup("NEXUS_ODM_MAX_ASYNC_PENDING") {
            self.max_async_pending = parse_env("NEXUS_ODM_MAX_ASYNC_PENDING", &v)?;
        }
        if let Some(v) = lookup("NEXUS_ODM_SLOW_READ_MS") {
            self.slow_read_ms = parse_env("NEXUS_ODM_SLOW_READ_MS", &v)?;
        }
        if let Some(v) = lookup("NEXUS_ODM_CACHE_TTL_MS") {
            self.cache.ttl_ms = parse_env("NEXUS_ODM_CACHE_TTL_MS", &v)?;
        }
        self.validate()?;
        Ok(self)
    }

    fn validate(&self) -> Result<(), OdmError> {
        if self.cursor_batch_size == 0 {
            return Err(OdmError::Config("cursor_batch_size must be at least 1".into()));
        }
        if self.housekeeping_granularity_ms == 0 {
            return Err(OdmError::Config("housekeeping_granularity_ms must be at least 1".into()));
        }
        if self.cache.max_entries == 0 {
            return Err(OdmError::Config("cache.max_entries must be at least 1".into()));
        }
        Ok(())
    }

    #[must_use]
    pub fn housekeeping_granularity(&self) -> Duration {
        Duration::from_millis(self.housekeeping_granularity_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    #[test]
    fn partial_toml_keeps_defaults() {
        let cfg = OdmConfig::from_toml_str(
            r#"
            database = "inventory"
            default_read_preference = "secondary_preferred"

            [cache]
            ttl_ms = 5000
            "#,
        )
        .unwrap();
        assert_eq!(cfg.database, "inventory");
        assert_eq!(cfg.default_read_preference, ReadPreference::SecondaryPreferred);
        assert_eq!(cfg.cache.ttl_ms, 5000);
        assert_eq!(cfg.cache.max_entries, 10_000);
        assert_eq!(cfg.cursor_batch_size, 1000);
    }

    #[test]
    fn from_file_reads_toml() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        writeln!(f, "cursor_batch_size = 7").unwrap();
        let cfg = OdmConfig::from_file(f.path()).unwrap();
        assert_eq!(cfg.cursor_batch_size, 7);
    }

    #[test]
    fn env_overrides_file() {
        let env: HashMap<&str, &str> = [("NEXUS_ODM_DATABASE", "env_db"), ("NEXUS_ODM_SLOW_READ_MS", "25")].into();
        let cfg = OdmConfig::from_toml_str("database = \"file_db\"")
            .unwrap()
            .apply_env_from(|k| env.get(k).map(|v| (*v).to_string()))
            .unwrap();
        assert_eq!(cfg.database, "env_db");
        assert_eq!(cfg.slow_read_ms, 25);
    }

    #[test]
    fn bad_values_are_config_errors() {
        let err = OdmConfig::default().apply_env_from(|k| (k == "NEXUS_ODM_ASYNC_THREADS").then(|| "many".to_string()));
        assert!(matches!(err, Err(OdmError::Config(_))));
        assert!(matches!(OdmConfig::from_toml_str("cursor_batch_size = 0"), Err(OdmError::Config(_))));
        assert!(matches!(OdmConfig::from_toml_str("cursor_batch_size = \"x\""), Err(OdmError::Toml(_))));
    }
}
