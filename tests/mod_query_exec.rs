mod common;

use bson::{Bson, doc};
use common::{DB, Person, Visitor, manual_config, runtime, runtime_with, seed_people};
use nexus_odm::query::ReadPreference;
use nexus_odm::{OdmConfig, OdmError, Order, field};

#[test]
fn raw_and_structured_filters_are_exclusive() {
    let (odm, _driver) = runtime();
    let err = odm.query::<Person>().eq("name", "a").unwrap().filter(doc! {"age": 3}).unwrap_err();
    assert!(matches!(err, OdmError::InvalidQuery(_)));
    let err = odm.query::<Person>().filter(doc! {"age": 3}).unwrap().and(field("name").eq("a")).unwrap_err();
    assert!(matches!(err, OdmError::InvalidQuery(_)));
    assert!(odm.query::<Person>().filter(doc! {}).unwrap().where_clause("true").is_err());
}

#[test]
fn as_list_sorts_skips_and_limits() {
    let (odm, driver) = runtime();
    seed_people(&driver, 20);
    let people = odm.query::<Person>().sort("_id", Order::Desc).skip(2).limit(3).as_list().unwrap();
    let ids: Vec<i64> = people.iter().map(|p| p.id).collect();
    assert_eq!(ids, vec![17, 16, 15]);
    assert!(people.iter().all(|p| p.loaded));
}

#[test]
fn get_fetches_one_and_leaves_limit_alone() {
    let (odm, driver) = runtime();
    seed_people(&driver, 5);
    let q = odm.query::<Person>().asc("_id").limit(4);
    let first = q.get().unwrap().unwrap();
    assert_eq!(first.id, 0);
    assert_eq!(q.get_limit(), 4);
    assert_eq!(q.as_list().unwrap().len(), 4);
    let finds = driver.counters().finds;
    q.get().unwrap();
    assert_eq!(driver.counters().finds, finds, "second get must come from the cache");
}

#[test]
fn empty_get_is_cached() {
    let (odm, driver) = runtime();
    let q = odm.query::<Person>().eq("name", "nobody").unwrap();
    assert!(q.get().unwrap().is_none());
    assert!(q.get().unwrap().is_none());
    assert_eq!(driver.counters().finds, 1);
}

#[test]
fn result_shapes_use_separate_keys() {
    let (odm, driver) = runtime();
    seed_people(&driver, 6);
    let q = odm.query::<Person>().and(field("age").lt(3)).unwrap();
    assert_eq!(q.as_list().unwrap().len(), 3);
    assert_eq!(q.as_map_list().unwrap().len(), 3);
    let ids = q.id_list().unwrap();
    assert_eq!(ids, vec![Bson::Int64(0), Bson::Int64(1), Bson::Int64(2)]);
    assert_eq!(driver.counters().finds, 3);

    q.as_list().unwrap();
    q.as_map_list().unwrap();
    q.id_list().unwrap();
    assert_eq!(driver.counters().finds, 3);
}

#[test]
fn distinct_values() {
    let (odm, driver) = runtime();
    driver.insert_raw(DB, "person", [doc! {"_id": 1i64, "age": 3}, doc! {"_id": 2i64, "age": 3}, doc! {"_id": 3i64, "age": 4}]);
    let ages = odm.query::<Person>().distinct("age").unwrap();
    assert_eq!(ages, vec![Bson::Int32(3), Bson::Int32(4)]);
}

#[test]
fn unfiltered_count_uses_estimate_outside_transactions() {
    let (odm, driver) = runtime();
    seed_people(&driver, 12);
    let unfiltered = odm.query::<Person>().count_all().unwrap();
    let always_true = odm.query::<Person>().and(field("age").gte(0)).unwrap().count_all().unwrap();
    assert_eq!(unfiltered, 12);
    assert_eq!(always_true, unfiltered);
    let c = driver.counters();
    assert_eq!((c.estimated_counts, c.counts), (1, 1));

    driver.set_transaction_active(true);
    assert_eq!(odm.query::<Person>().count_all().unwrap(), 12);
    let c = driver.counters();
    assert_eq!((c.estimated_counts, c.counts), (1, 2));
}

#[test]
fn where_clause_counts_client_side() {
    let (odm, driver) = runtime();
    seed_people(&driver, 9);
    let q = odm.query::<Person>().where_clause("this.age >= 0").unwrap().skip(4).limit(2);
    assert_eq!(q.count_all().unwrap(), 9);
    assert_eq!(q.get_skip(), 4);
    assert_eq!(q.get_limit(), 2);
    let c = driver.counters();
    assert_eq!(c.counts, 0);
    assert_eq!(c.finds, 1);
}

#[test]
fn find_one_and_delete_reaches_the_server_after_a_cached_read() {
    let (odm, driver) = runtime();
    seed_people(&driver, 3);
    let q = odm.query::<Person>().eq("_id", 1i64).unwrap();
    assert_eq!(q.as_list().unwrap().len(), 1);
    let deleted = q.find_one_and_delete().unwrap().unwrap();
    assert_eq!(deleted.id, 1);
    assert_eq!(driver.collection_len(DB, "person"), 2);
    assert_eq!(driver.counters().find_and_modify, 1);
    assert!(q.as_list().unwrap().is_empty(), "cached result must not survive the delete");
}

#[test]
fn find_one_and_update_returns_old_or_new() {
    let (odm, driver) = runtime();
    seed_people(&driver, 2);
    let q = odm.query::<Person>().eq("_id", 0i64).unwrap();
    let before = q.find_one_and_update(doc! {"$inc": {"age": 10}}, false).unwrap().unwrap();
    assert_eq!(before.age, 0);
    let after = q.find_one_and_update(doc! {"$inc": {"age": 10}}, true).unwrap().unwrap();
    assert_eq!(after.age, 20);
}

#[test]
fn direct_writes_invalidate_cached_reads() {
    let (odm, driver) = runtime();
    seed_people(&driver, 2);
    let q = odm.query::<Person>().asc("_id");
    let mut people = q.as_list().unwrap();
    odm.set(&people[0], "age", 41).unwrap();
    assert_eq!(q.as_list().unwrap()[0].age, 41);

    people[1].name = "renamed".into();
    odm.store(&mut people[1]).unwrap();
    assert_eq!(q.as_list().unwrap()[1].name, "renamed");

    odm.push(&people[1], "tags", "u").unwrap();
    odm.pull(&people[1], "tags", "t").unwrap();
    assert_eq!(q.as_list().unwrap()[1].tags, vec!["u".to_string()]);

    odm.delete(&people[0]).unwrap();
    assert_eq!(q.as_list().unwrap().len(), 1);
}

#[test]
fn query_addressed_writes() {
    let (odm, driver) = runtime();
    seed_people(&driver, 6);
    let young = odm.query::<Person>().and(field("age").lt(3)).unwrap();
    young.inc("age", 100, true).unwrap();
    assert_eq!(odm.query::<Person>().and(field("age").gte(100)).unwrap().count_all().unwrap(), 3);
    odm.query::<Person>().eq("_id", 5i64).unwrap().unset("name", false).unwrap();
    let doc = driver.documents(DB, "person").into_iter().find(|d| d.get_i64("_id").ok() == Some(5)).unwrap();
    assert!(!doc.contains_key("name"));
    odm.query::<Person>().and(field("age").gte(100)).unwrap().delete(true).unwrap();
    assert_eq!(driver.collection_len(DB, "person"), 3);
    assert!(odm.query::<Person>().where_clause("x").unwrap().delete(true).is_err());
}

#[test]
fn last_access_fields_refresh_on_as_list() {
    let (odm, driver) = runtime();
    driver.insert_raw(DB, "visitor", [doc! {"_id": 1i64, "name": "a"}, doc! {"_id": 2i64, "name": "b"}]);
    let visitors = odm.query::<Visitor>().as_list().unwrap();
    assert_eq!(visitors.len(), 2);
    let stored = driver.documents(DB, "visitor");
    assert!(stored.iter().all(|d| matches!(d.get("last_seen"), Some(Bson::DateTime(_)))));
    let exec = driver.executions();
    assert_eq!(exec.len(), 1);
    assert_eq!(exec[0].requests.len(), 2);
    assert_eq!(odm.write_buffer_count(), 0);
}

#[test]
fn projection_reaches_the_driver_unless_it_covers_every_field() {
    let (odm, driver) = runtime();
    seed_people(&driver, 1);
    let partial = odm.query::<Person>().project("name").unwrap().as_map_list().unwrap();
    assert_eq!(partial[0].keys().collect::<Vec<_>>(), ["_id", "name"]);
    let mut full = odm.query::<Person>();
    for f in ["tags", "age", "name", "_id"] {
        full = full.project(f).unwrap();
    }
    assert!(full.effective_projection().is_none());
    assert!(odm.query::<Person>().project("a").unwrap().exclude("b").is_err());
}

#[test]
fn read_preference_defaults_from_config() {
    let (odm, driver) = runtime_with(OdmConfig { default_read_preference: ReadPreference::Nearest, ..manual_config() });
    odm.query::<Person>().count_all().unwrap();
    assert_eq!(driver.last_read_preference(), Some(ReadPreference::Nearest));
    odm.query::<Person>().read_preference(ReadPreference::Secondary).as_list().unwrap();
    assert_eq!(driver.last_read_preference(), Some(ReadPreference::Secondary));
}

#[test]
fn transport_failures_surface_once() {
    let (odm, driver) = runtime();
    driver.set_failing("person", true);
    assert!(matches!(odm.query::<Person>().as_list(), Err(OdmError::Transport(_))));
    assert!(matches!(odm.query::<Person>().count_all(), Err(OdmError::Transport(_))));
    let mut p = Person { id: 1, ..Default::default() };
    assert!(matches!(odm.store(&mut p), Err(OdmError::Transport(_))));
}

#[test]
fn collection_override() {
    let (odm, driver) = runtime();
    driver.insert_raw(DB, "person_archive", [doc! {"_id": 9i64, "name": "old"}]);
    let q = odm.query::<Person>().collection("person_archive");
    assert_eq!(q.as_list().unwrap()[0].name, "old");
    assert!(odm.query::<Person>().as_list().unwrap().is_empty());
}

/// Cached type whose decode is slow enough for a write to land mid-read.
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
#[serde(default)]
struct Slow {
    #[serde(rename = "_id")]
    id: i64,
    v: i32,
}

impl nexus_odm::Entity for Slow {
    fn collection_name() -> &'static str {
        "slow"
    }
    fn declared_fields() -> &'static [&'static str] {
        &["_id", "v"]
    }
    fn id(&self) -> Option<Bson> {
        Some(Bson::Int64(self.id))
    }
    fn cache_settings() -> Option<nexus_odm::CacheSettings> {
        Some(nexus_odm::CacheSettings::default())
    }
    fn post_load(&mut self) {
        std::thread::sleep(std::time::Duration::from_millis(300));
    }
}

#[test]
fn read_racing_a_write_does_not_repopulate_the_cache() {
    let (odm, driver) = runtime();
    driver.insert_raw(DB, "slow", [doc! {"_id": 1_i64, "v": 1}]);
    let q = odm.query::<Slow>();
    let reader = std::thread::spawn(move || q.as_list().unwrap());
    std::thread::sleep(std::time::Duration::from_millis(100));
    odm.set(&Slow { id: 1, v: 1 }, "v", 2).unwrap();
    assert_eq!(driver.documents(DB, "slow")[0].get_i32("v").ok(), Some(2));

    let raced = reader.join().unwrap();
    assert_eq!(raced[0].v, 1);
    let after = odm.query::<Slow>().as_list().unwrap();
    assert_eq!(after[0].v, 2);
}
