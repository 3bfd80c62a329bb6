//! Best-effort durable snapshot of the cache for instant display.
//!
//! Persisted blobs only seed the store before the first network response;
//! they are never authoritative. Every failure here is logged and skipped.

use crate::entry::CacheEntry;
use crate::store::CacheStore;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use vitrine_core::{Timestamp, VitrineError};

/// One persisted logical key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistedBlob {
    pub fetched_at: Timestamp,
    pub payload: Value,
}

impl PersistedBlob {
    pub fn new(fetched_at: Timestamp, payload: Value) -> Self {
        Self {
            fetched_at,
            payload,
        }
    }

    pub fn age(&self) -> Duration {
        (Utc::now() - self.fetched_at)
            .to_std()
            .unwrap_or(Duration::ZERO)
    }

    fn from_entry(entry: &CacheEntry) -> Option<Self> {
        Some(Self::new(entry.fetched_at?, entry.value.clone()?))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PersistError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("Durable store backend error: {0}")]
    Backend(String),
}

impl From<PersistError> for VitrineError {
    fn from(e: PersistError) -> Self {
        VitrineError::Persist {
            reason: e.to_string(),
        }
    }
}

/// Local key-value store holding JSON blobs.
pub trait DurableStore: Send + Sync {
    fn read(&self, key: &str) -> Result<Option<PersistedBlob>, PersistError>;
    fn write(&self, key: &str, blob: &PersistedBlob) -> Result<(), PersistError>;
    fn remove(&self, key: &str) -> Result<(), PersistError>;
    fn keys(&self) -> Result<Vec<String>, PersistError>;
}

// ============================================================================
// JSON FILE STORE
// ============================================================================

/// One JSON file per key under a directory.
///
/// File names are the hex-encoded key so any cache key maps to a valid name.
#[derive(Debug, Clone)]
pub struct JsonFileStore {
    dir: PathBuf,
}

impl JsonFileStore {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self, PersistError> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{}.json", hex::encode(key)))
    }
}

impl DurableStore for JsonFileStore {
    fn read(&self, key: &str) -> Result<Option<PersistedBlob>, PersistError> {
        let path = self.path_for(key);
        if !path.exists() {
            return Ok(None);
        }
        let contents = std::fs::read_to_string(path)?;
        Ok(Some(serde_json::from_str(&contents)?))
    }

    fn write(&self, key: &str, blob: &PersistedBlob) -> Result<(), PersistError> {
        let path = self.path_for(key);
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, serde_json::to_vec(blob)?)?;
        std::fs::rename(tmp, path)?;
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), PersistError> {
        match std::fs::remove_file(self.path_for(key)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn keys(&self) -> Result<Vec<String>, PersistError> {
        let mut keys = Vec::new();
        for dir_entry in std::fs::read_dir(&self.dir)? {
            let path = dir_entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            match hex::decode(stem).ok().and_then(|b| String::from_utf8(b).ok()) {
                Some(key) => keys.push(key),
                None => debug!(path = %path.display(), "Skipping foreign file in cache dir"),
            }
        }
        keys.sort();
        Ok(keys)
    }
}

// ============================================================================
// MEMORY STORE
// ============================================================================

/// In-process durable store for tests and hosts without local storage.
#[derive(Debug, Default)]
pub struct MemoryDurableStore {
    blobs: RwLock<HashMap<String, PersistedBlob>>,
}

impl MemoryDurableStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn poisoned<T>(_: T) -> PersistError {
    PersistError::Backend("memory store lock poisoned".to_string())
}

impl DurableStore for MemoryDurableStore {
    fn read(&self, key: &str) -> Result<Option<PersistedBlob>, PersistError> {
        Ok(self.blobs.read().map_err(poisoned)?.get(key).cloned())
    }

    fn write(&self, key: &str, blob: &PersistedBlob) -> Result<(), PersistError> {
        self.blobs
            .write()
            .map_err(poisoned)?
            .insert(key.to_string(), blob.clone());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), PersistError> {
        self.blobs.write().map_err(poisoned)?.remove(key);
        Ok(())
    }

    fn keys(&self) -> Result<Vec<String>, PersistError> {
        let mut keys: Vec<String> = self.blobs.read().map_err(poisoned)?.keys().cloned().collect();
        keys.sort();
        Ok(keys)
    }
}

// ============================================================================
// BRIDGE
// ============================================================================

/// Counts from a seeding pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SeedReport {
    pub seeded: usize,
    pub expired: usize,
    pub skipped: usize,
    pub failed: usize,
}

/// Moves snapshots between the cache and a durable store.
#[derive(Clone)]
pub struct PersistentCacheBridge {
    store: Arc<CacheStore>,
    durable: Arc<dyn DurableStore>,
    max_age: Option<Duration>,
}

impl PersistentCacheBridge {
    pub fn new(store: Arc<CacheStore>, durable: Arc<dyn DurableStore>) -> Self {
        Self {
            store,
            durable,
            max_age: None,
        }
    }

    /// Ignore blobs older than `max_age` when seeding.
    pub fn with_max_age(mut self, max_age: Option<Duration>) -> Self {
        self.max_age = max_age;
        self
    }

    /// Seed every persisted key; runs before the first fetch.
    pub fn seed_all(&self) -> SeedReport {
        let keys = match self.durable.keys() {
            Ok(keys) => keys,
            Err(e) => {
                warn!(error = %e, "Durable store unreadable, starting cold");
                return SeedReport {
                    failed: 1,
                    ..SeedReport::default()
                };
            }
        };

        let mut report = SeedReport::default();
        for key in keys {
            match self.durable.read(&key) {
                Ok(Some(blob)) => {
                    if self.max_age.is_some_and(|max| blob.age() > max) {
                        report.expired += 1;
                    } else if self.store.seed(&key, blob.payload, blob.fetched_at) {
                        report.seeded += 1;
                    } else {
                        report.skipped += 1;
                    }
                }
                Ok(None) => report.skipped += 1,
                Err(e) => {
                    warn!(key = %key, error = %e, "Failed to read persisted blob");
                    report.failed += 1;
                }
            }
        }
        debug!(?report, "Cache seeded from durable store");
        report
    }

    /// Seed a single key.
    pub fn seed(&self, key: &str) -> bool {
        match self.durable.read(key) {
            Ok(Some(blob)) if !self.max_age.is_some_and(|max| blob.age() > max) => {
                self.store.seed(key, blob.payload, blob.fetched_at)
            }
            Ok(_) => false,
            Err(e) => {
                warn!(key = %key, error = %e, "Failed to read persisted blob");
                false
            }
        }
    }

    /// Write the current value of `key` if it came from the network.
    pub fn persist(&self, key: &str) -> Result<bool, PersistError> {
        let entry = self.store.get(key);
        persist_entry(self.durable.as_ref(), &entry)
    }

    /// Persist every eligible entry; returns how many were written.
    pub fn persist_all(&self) -> usize {
        let mut written = 0;
        for entry in self.store.snapshot_all() {
            match persist_entry(self.durable.as_ref(), &entry) {
                Ok(true) => written += 1,
                Ok(false) => {}
                Err(e) => warn!(key = %entry.key, error = %e, "Failed to persist cache entry"),
            }
        }
        written
    }

    /// Follow `key` and persist every network-sourced change.
    pub fn spawn_writer(&self, key: &str) -> JoinHandle<()> {
        let mut rx = self.store.subscribe(key);
        let durable = self.durable.clone();
        let key = key.to_string();
        tokio::spawn(async move {
            while rx.changed().await.is_ok() {
                let entry = rx.borrow_and_update().clone();
                let durable = durable.clone();
                let written =
                    tokio::task::spawn_blocking(move || persist_entry(durable.as_ref(), &entry))
                        .await;
                match written {
                    Ok(Ok(_)) => {}
                    Ok(Err(e)) => warn!(key = %key, error = %e, "Failed to persist cache entry"),
                    Err(e) => warn!(key = %key, error = %e, "Persist task failed"),
                }
            }
        })
    }
}

fn persist_entry(durable: &dyn DurableStore, entry: &CacheEntry) -> Result<bool, PersistError> {
    if !entry.source.is_persistable() || entry.is_validating {
        return Ok(false);
    }
    match PersistedBlob::from_entry(entry) {
        Some(blob) => {
            durable.write(&entry.key, &blob)?;
            Ok(true)
        }
        None => Ok(false),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{FetchMode, StoreConfig};
    use crate::EntrySource;
    use chrono::Duration as ChronoDuration;
    use serde_json::json;

    fn fetched_store(key: &str, value: Value) -> Arc<CacheStore> {
        let store = Arc::new(CacheStore::new(StoreConfig::default()));
        let ticket = store
            .begin_fetch(key, FetchMode::Forced)
            .expect("fetch should start");
        store.complete_fetch(ticket, Ok(value));
        store
    }

    #[test]
    fn test_blob_uses_camel_case_schema() {
        let blob = PersistedBlob::new(Utc::now(), json!([1]));
        let value = serde_json::to_value(&blob).expect("blob should serialize");
        assert!(value.get("fetchedAt").is_some());
        assert_eq!(value["payload"], json!([1]));
    }

    #[test]
    fn test_json_file_store_round_trip_and_keys() {
        let dir = tempfile::tempdir().expect("tempdir should be created");
        let durable = JsonFileStore::new(dir.path()).expect("store should open");

        let blob = PersistedBlob::new(Utc::now(), json!([{"id": "a"}]));
        durable
            .write("orders:cus_1/open", &blob)
            .expect("write should succeed");

        assert_eq!(
            durable.read("orders:cus_1/open").expect("read should succeed"),
            Some(blob)
        );
        assert_eq!(
            durable.keys().expect("keys should list"),
            vec!["orders:cus_1/open".to_string()]
        );
        assert_eq!(durable.read("missing").expect("read should succeed"), None);

        durable
            .remove("orders:cus_1/open")
            .expect("remove should succeed");
        durable.remove("orders:cus_1/open").expect("remove is idempotent");
        assert!(durable.keys().expect("keys should list").is_empty());
    }

    #[test]
    fn test_corrupt_file_is_reported_and_skipped() {
        let dir = tempfile::tempdir().expect("tempdir should be created");
        let durable = Arc::new(JsonFileStore::new(dir.path()).expect("store should open"));
        std::fs::write(
            dir.path().join(format!("{}.json", hex::encode("orders"))),
            b"{not json",
        )
        .expect("write should succeed");

        let store = Arc::new(CacheStore::default());
        let report = PersistentCacheBridge::new(store.clone(), durable).seed_all();
        assert_eq!(report.failed, 1);
        assert!(store.get("orders").value.is_none());
    }

    #[test]
    fn test_persist_then_seed_fresh_store() {
        let durable: Arc<dyn DurableStore> = Arc::new(MemoryDurableStore::new());
        let source = fetched_store("orders", json!([{"id": "a"}]));
        let bridge = PersistentCacheBridge::new(source, durable.clone());
        assert_eq!(bridge.persist_all(), 1);

        let fresh = Arc::new(CacheStore::default());
        let report = PersistentCacheBridge::new(fresh.clone(), durable).seed_all();
        assert_eq!(report.seeded, 1);

        let entry = fresh.get("orders");
        assert_eq!(entry.value, Some(json!([{"id": "a"}])));
        assert_eq!(entry.source, EntrySource::Seeded);
        assert!(entry.is_loading());
    }

    #[test]
    fn test_seed_skips_expired_blobs() {
        let durable = Arc::new(MemoryDurableStore::new());
        durable
            .write(
                "orders",
                &PersistedBlob::new(Utc::now() - ChronoDuration::days(3), json!([])),
            )
            .expect("write should succeed");

        let store = Arc::new(CacheStore::default());
        let report = PersistentCacheBridge::new(store.clone(), durable)
            .with_max_age(Some(Duration::from_secs(86_400)))
            .seed_all();
        assert_eq!(report.expired, 1);
        assert!(store.get("orders").value.is_none());
    }

    #[test]
    fn test_seeded_and_optimistic_values_are_not_persisted() {
        let durable = Arc::new(MemoryDurableStore::new());
        let store = Arc::new(CacheStore::default());
        store.seed("orders", json!([1]), Utc::now());
        let bridge = PersistentCacheBridge::new(store.clone(), durable.clone());
        assert!(!bridge.persist("orders").expect("persist should succeed"));

        let store = fetched_store("orders", json!([1]));
        let _ticket = store.begin_optimistic("orders", |_| Some(json!([2])));
        let bridge = PersistentCacheBridge::new(store, durable.clone());
        assert!(!bridge.persist("orders").expect("persist should succeed"));
        assert!(durable.keys().expect("keys should list").is_empty());
    }

    #[tokio::test]
    async fn test_writer_persists_fetched_values() {
        let durable = Arc::new(MemoryDurableStore::new());
        let store = Arc::new(CacheStore::default());
        let bridge = PersistentCacheBridge::new(store.clone(), durable.clone());
        let writer = bridge.spawn_writer("orders");

        let ticket = store
            .begin_fetch("orders", FetchMode::Forced)
            .expect("fetch should start");
        store.complete_fetch(ticket, Ok(json!([{"id": "z"}])));

        let mut persisted = None;
        for _ in 0..50 {
            persisted = durable.read("orders").expect("read should succeed");
            if persisted.is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        writer.abort();
        assert_eq!(
            persisted.map(|blob| blob.payload),
            Some(json!([{"id": "z"}]))
        );
    }
}
