//! Cold start from a durable snapshot, then network takeover.

use chrono::Utc;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use vitrine_cache::{
    CacheStore, DurableStore, EntrySource, FetchCompletion, FetchMode, JsonFileStore,
    PersistedBlob, PersistentCacheBridge, StoreConfig,
};
use vitrine_test_utils::assertions::assert_ids;
use vitrine_test_utils::fixtures::sample_orders;

fn fetch_into(store: &CacheStore, key: &str, value: serde_json::Value) {
    let ticket = store
        .begin_fetch(key, FetchMode::Forced)
        .expect("fetch slot should be free");
    assert!(matches!(
        store.complete_fetch(ticket, Ok(value)),
        FetchCompletion::Applied { .. }
    ));
}

#[test]
fn test_restart_seeds_then_fetch_replaces() {
    let dir = tempfile::tempdir().expect("tempdir should be created");
    let durable: Arc<dyn DurableStore> =
        Arc::new(JsonFileStore::new(dir.path()).expect("json store should open"));

    // First session: fetch and persist.
    let first = Arc::new(CacheStore::new(StoreConfig::default()));
    fetch_into(&first, "orders", sample_orders());
    let bridge = PersistentCacheBridge::new(first.clone(), durable.clone());
    assert!(bridge.persist("orders").expect("persist should succeed"));

    // Second session: the snapshot shows before any network work.
    let second = Arc::new(CacheStore::new(StoreConfig::default()));
    let bridge = PersistentCacheBridge::new(second.clone(), durable.clone());
    let report = bridge.seed_all();
    assert_eq!(report.seeded, 1);

    let seeded = second.get("orders");
    assert_eq!(seeded.source, EntrySource::Seeded);
    assert!(seeded.stale);
    assert!(seeded.is_loading());
    assert_ids(seeded.value.as_ref().expect("seeded value"), &["o3", "o2", "o1"]);

    fetch_into(&second, "orders", json!([{"id": "o9", "status": "paid"}]));
    let fetched = second.get("orders");
    assert_eq!(fetched.source, EntrySource::Fetched);
    assert!(!fetched.stale);
    assert_ids(fetched.value.as_ref().expect("fetched value"), &["o9"]);

    // A second seed after the network answered changes nothing.
    assert!(!bridge.seed("orders"));
}

#[test]
fn test_expired_snapshot_is_not_seeded() {
    let dir = tempfile::tempdir().expect("tempdir should be created");
    let durable: Arc<dyn DurableStore> =
        Arc::new(JsonFileStore::new(dir.path()).expect("json store should open"));
    let old = Utc::now() - chrono::Duration::hours(2);
    durable
        .write("orders", &PersistedBlob::new(old, sample_orders()))
        .expect("write should succeed");

    let store = Arc::new(CacheStore::new(StoreConfig::default()));
    let bridge = PersistentCacheBridge::new(store.clone(), durable)
        .with_max_age(Some(Duration::from_secs(3600)));

    let report = bridge.seed_all();
    assert_eq!(report.expired, 1);
    assert_eq!(report.seeded, 0);
    assert!(store.get("orders").value.is_none());
}

#[test]
fn test_optimistic_value_is_not_persisted() {
    let dir = tempfile::tempdir().expect("tempdir should be created");
    let durable: Arc<dyn DurableStore> =
        Arc::new(JsonFileStore::new(dir.path()).expect("json store should open"));
    let store = Arc::new(CacheStore::new(StoreConfig::default()));
    fetch_into(&store, "orders", sample_orders());

    let _ticket = store.begin_optimistic("orders", |_| Some(json!([])));
    let bridge = PersistentCacheBridge::new(store, durable.clone());
    assert!(!bridge.persist("orders").expect("persist should not fail"));
    assert!(durable.read("orders").expect("read should succeed").is_none());
}
