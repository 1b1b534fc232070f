#![allow(dead_code)]

use bson::{Bson, doc};
use nexus_odm::driver::MemoryDriver;
use nexus_odm::{CacheSettings, Entity, Odm, OdmConfig, WriteBufferSettings};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};

pub const DB: &str = "nexus";

/// Cached, written directly.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Person {
    #[serde(rename = "_id")]
    pub id: i64,
    pub name: String,
    pub age: i32,
    pub tags: Vec<String>,
    #[serde(skip)]
    pub loaded: bool,
}

impl Entity for Person {
    fn collection_name() -> &'static str {
        "person"
    }
    fn declared_fields() -> &'static [&'static str] {
        &["_id", "name", "age", "tags"]
    }
    fn id(&self) -> Option<Bson> {
        Some(Bson::Int64(self.id))
    }
    fn cache_settings() -> Option<CacheSettings> {
        Some(CacheSettings::default())
    }
    fn post_load(&mut self) {
        self.loaded = true;
    }
}

/// Buffered and cached; ids generated on store.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Event {
    #[serde(rename = "_id", skip_serializing_if = "Option::is_none")]
    pub id: Option<bson::oid::ObjectId>,
    pub seq: i64,
}

impl Entity for Event {
    fn collection_name() -> &'static str {
        "event"
    }
    fn declared_fields() -> &'static [&'static str] {
        &["_id", "seq"]
    }
    fn id(&self) -> Option<Bson> {
        self.id.map(Bson::ObjectId)
    }
    fn set_id(&mut self, id: Bson) {
        if let Bson::ObjectId(oid) = id {
            self.id = Some(oid);
        }
    }
    fn cache_settings() -> Option<CacheSettings> {
        Some(CacheSettings::default())
    }
    fn write_buffer_settings() -> Option<WriteBufferSettings> {
        Some(WriteBufferSettings::default())
    }
}

/// Uncached; reads refresh `last_seen`.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Visitor {
    #[serde(rename = "_id")]
    pub id: i64,
    pub name: String,
    pub last_seen: Option<bson::DateTime>,
}

impl Entity for Visitor {
    fn collection_name() -> &'static str {
        "visitor"
    }
    fn declared_fields() -> &'static [&'static str] {
        &["_id", "name", "last_seen"]
    }
    fn id(&self) -> Option<Bson> {
        Some(Bson::Int64(self.id))
    }
    fn last_access_fields() -> &'static [&'static str] {
        &["last_seen"]
    }
}

/// Housekeeping effectively off: nothing flushes unless a test asks for it.
pub fn manual_config() -> OdmConfig {
    OdmConfig { housekeeping_granularity_ms: 3_600_000, ..OdmConfig::default() }
}

pub fn runtime_with(config: OdmConfig) -> (Odm, MemoryDriver) {
    let driver = MemoryDriver::new();
    let odm = Odm::new(config, Arc::new(driver.clone())).unwrap();
    (odm, driver)
}

pub fn runtime() -> (Odm, MemoryDriver) {
    runtime_with(manual_config())
}

pub fn seed_people(driver: &MemoryDriver, n: i64) {
    driver.insert_raw(
        DB,
        "person",
        (0..n).map(|i| doc! {"_id": i, "name": format!("p{i}"), "age": i32::try_from(i % 50).unwrap(), "tags": ["t"]}),
    );
}

pub fn event_seqs(driver: &MemoryDriver) -> Vec<i64> {
    driver.documents(DB, "event").iter().filter_map(|d| d.get_i64("seq").ok()).collect()
}

pub fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    cond()
}
