//! In-memory keyed cache with watch-based reader notification.
//!
//! Each key owns a slot in a [`DashMap`]. Every write runs while holding that
//! key's shard lock, so fetch completion, reconciliation, optimistic apply and
//! rollback for one key are serialized even on a multi-threaded runtime.
//! Readers hold a [`watch::Receiver`] and are notified before the write
//! returns.
//!
//! Updaters passed to the store run under the key lock and must not call back
//! into the store.

use crate::entry::{CacheEntry, EntrySource};
use crate::reconcile::{merge_entity, reconcile_in_place, ReconcileOutcome};
use crate::watermark::{KeyJournal, LogicalClock, Watermark};
use chrono::Utc;
use dashmap::mapref::one::RefMut;
use dashmap::DashMap;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Notify};
use tokio::time::Instant;
use tracing::{debug, trace};
use vitrine_core::{ChangeEvent, FetchError, PollingConfig, Timestamp, DEFAULT_IDENTITY_FIELD};

/// Store tuning.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Triggers within this window after a fetch started collapse into it.
    pub dedup_window: Duration,
    /// Field carrying entity identity inside cached JSON.
    pub identity_field: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            dedup_window: Duration::from_secs(2),
            identity_field: DEFAULT_IDENTITY_FIELD.to_string(),
        }
    }
}

impl StoreConfig {
    pub fn from_polling(polling: &PollingConfig) -> Self {
        Self {
            dedup_window: polling.dedup_window(),
            ..Self::default()
        }
    }
}

/// How a fetch trigger interacts with the dedup window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchMode {
    /// Skip if a fetch started within the dedup window.
    Deduped,
    /// Skip only if a fetch is currently in flight.
    Forced,
}

/// Options for [`CacheStore::invalidate`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InvalidateOptions {
    /// Keep the value, mark it stale and wake the owning poller.
    pub refetch: bool,
}

/// Proof that the caller owns the in-flight fetch for a key.
#[derive(Debug)]
pub struct FetchTicket {
    key: String,
    id: u64,
    started: Watermark,
}

impl FetchTicket {
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn started(&self) -> Watermark {
        self.started
    }
}

/// What happened when a fetch completed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchCompletion {
    /// Fetched value stored, journaled events replayed on top.
    Applied { replayed: usize },
    /// A local or optimistic write after the fetch began kept its value.
    Superseded,
    /// Fetch failed; previous value kept and the error surfaced.
    Failed,
    /// The ticket no longer owns the slot.
    Ignored,
}

/// Snapshot captured before an optimistic write.
#[derive(Debug)]
pub struct OptimisticTicket {
    key: String,
    snapshot: Option<Value>,
    version: Watermark,
}

impl OptimisticTicket {
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Value held before the optimistic write.
    pub fn snapshot(&self) -> Option<&Value> {
        self.snapshot.as_ref()
    }

    pub fn version(&self) -> Watermark {
        self.version
    }
}

/// How to finish an optimistic write.
#[derive(Debug, Clone, PartialEq)]
pub enum Settlement {
    /// Remote call confirmed; keep the optimistic value.
    Keep,
    /// Remote call returned the authoritative entity; merge it by identity.
    MergeEntity(Value),
    /// Remote call failed; put the snapshot back.
    Restore,
}

/// Counters for health reporting.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreStats {
    pub entries: u64,
    pub hits: u64,
    pub misses: u64,
    pub writes: u64,
    pub fetches_started: u64,
    pub fetches_deduplicated: u64,
}

impl StoreStats {
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

#[derive(Debug, Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    writes: AtomicU64,
    fetches_started: AtomicU64,
    fetches_deduplicated: AtomicU64,
}

#[derive(Debug, Clone, Copy)]
struct Inflight {
    id: u64,
    started: Watermark,
}

#[derive(Debug)]
struct Slot {
    tx: watch::Sender<CacheEntry>,
    inflight: Option<Inflight>,
    last_fetch_started: Option<Instant>,
    pending_mutations: usize,
    journal: KeyJournal,
    last_local_write: Watermark,
    revalidate: Arc<Notify>,
}

impl Slot {
    fn new(key: &str) -> Self {
        let (tx, _rx) = watch::channel(CacheEntry::empty(key));
        Self {
            tx,
            inflight: None,
            last_fetch_started: None,
            pending_mutations: 0,
            journal: KeyJournal::default(),
            last_local_write: Watermark::zero(),
            revalidate: Arc::new(Notify::new()),
        }
    }

    fn is_validating(&self) -> bool {
        self.inflight.is_some() || self.pending_mutations > 0
    }

    /// Write and notify every reader of this key.
    fn publish(&self, f: impl FnOnce(&mut CacheEntry)) {
        let validating = self.is_validating();
        self.tx.send_modify(|entry| {
            f(entry);
            entry.is_validating = validating;
        });
    }

    fn current_value(&self) -> Option<Value> {
        self.tx.borrow().value.clone()
    }
}

/// Shared revalidating cache.
#[derive(Debug)]
pub struct CacheStore {
    slots: DashMap<String, Slot>,
    clock: LogicalClock,
    config: StoreConfig,
    counters: Counters,
    next_ticket: AtomicU64,
}

impl Default for CacheStore {
    fn default() -> Self {
        Self::new(StoreConfig::default())
    }
}

impl CacheStore {
    pub fn new(config: StoreConfig) -> Self {
        Self {
            slots: DashMap::new(),
            clock: LogicalClock::new(),
            config,
            counters: Counters::default(),
            next_ticket: AtomicU64::new(1),
        }
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    pub fn identity_field(&self) -> &str {
        &self.config.identity_field
    }

    fn slot_mut(&self, key: &str) -> RefMut<'_, String, Slot> {
        self.slots
            .entry(key.to_string())
            .or_insert_with(|| Slot::new(key))
    }

    fn bump_writes(&self) {
        self.counters.writes.fetch_add(1, Ordering::Relaxed);
    }

    // ------------------------------------------------------------------
    // Reads
    // ------------------------------------------------------------------

    /// Current entry for `key`; never waits on network work.
    pub fn get(&self, key: &str) -> CacheEntry {
        let entry = self
            .slots
            .get(key)
            .map(|slot| slot.tx.borrow().clone())
            .unwrap_or_else(|| CacheEntry::empty(key));
        if entry.value.is_some() {
            self.counters.hits.fetch_add(1, Ordering::Relaxed);
        } else {
            self.counters.misses.fetch_add(1, Ordering::Relaxed);
        }
        entry
    }

    /// Typed view of the current entry.
    pub fn get_as<T: DeserializeOwned>(&self, key: &str) -> Result<CacheEntry<T>, FetchError> {
        self.get(key).decode()
    }

    /// Register a reader; the receiver sees every subsequent write.
    pub fn subscribe(&self, key: &str) -> watch::Receiver<CacheEntry> {
        self.slot_mut(key).tx.subscribe()
    }

    /// Number of readers currently registered for `key`.
    pub fn reader_count(&self, key: &str) -> usize {
        self.slots
            .get(key)
            .map(|slot| slot.tx.receiver_count())
            .unwrap_or(0)
    }

    /// Signal a poller waits on for forced revalidation of `key`.
    pub fn revalidate_signal(&self, key: &str) -> Arc<Notify> {
        self.slot_mut(key).revalidate.clone()
    }

    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.slots.iter().map(|s| s.key().clone()).collect();
        keys.sort();
        keys
    }

    /// Entries currently holding a value.
    pub fn snapshot_all(&self) -> Vec<CacheEntry> {
        let mut entries: Vec<CacheEntry> = self
            .slots
            .iter()
            .map(|slot| slot.tx.borrow().clone())
            .filter(|entry| entry.value.is_some())
            .collect();
        entries.sort_by(|a, b| a.key.cmp(&b.key));
        entries
    }

    pub fn stats(&self) -> StoreStats {
        StoreStats {
            entries: self.slots.len() as u64,
            hits: self.counters.hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            writes: self.counters.writes.load(Ordering::Relaxed),
            fetches_started: self.counters.fetches_started.load(Ordering::Relaxed),
            fetches_deduplicated: self.counters.fetches_deduplicated.load(Ordering::Relaxed),
        }
    }

    // ------------------------------------------------------------------
    // Writes
    // ------------------------------------------------------------------

    /// Replace the value of `key` with `updater(previous)`.
    ///
    /// Supersedes any fetch already in flight for the key.
    pub fn set<F>(&self, key: &str, updater: F) -> Watermark
    where
        F: FnOnce(Option<&Value>) -> Option<Value>,
    {
        let mut slot = self.slot_mut(key);
        let version = self.clock.tick();
        slot.last_local_write = version;
        slot.publish(|entry| {
            entry.value = updater(entry.value.as_ref());
            entry.version = version;
            entry.source = EntrySource::Local;
        });
        self.bump_writes();
        version
    }

    /// Pre-populate `key` from durable storage.
    ///
    /// Ignored once the key holds a value or the network has answered.
    pub fn seed(&self, key: &str, value: Value, fetched_at: Timestamp) -> bool {
        let slot = self.slot_mut(key);
        let occupied = {
            let current = slot.tx.borrow();
            current.value.is_some() || current.confirmed
        };
        if occupied {
            return false;
        }
        let version = self.clock.tick();
        slot.publish(|entry| {
            entry.value = Some(value);
            entry.fetched_at = Some(fetched_at);
            entry.version = version;
            entry.source = EntrySource::Seeded;
            entry.stale = true;
        });
        self.bump_writes();
        true
    }

    /// Apply a change event under the key lock.
    ///
    /// While a fetch is in flight the event is journaled so it can be
    /// replayed on top of the fetch result.
    pub fn apply_event(&self, key: &str, event: &ChangeEvent) -> ReconcileOutcome {
        let Some(mut slot) = self.slots.get_mut(key) else {
            return ReconcileOutcome::CollectionAbsent;
        };
        let version = self.clock.tick();
        if slot.inflight.is_some() {
            slot.journal.record(version, event.clone());
        }

        let identity_field = self.config.identity_field.as_str();
        let validating = slot.is_validating();
        let mut outcome = ReconcileOutcome::CollectionAbsent;
        slot.tx.send_if_modified(|entry| {
            outcome = reconcile_in_place(&mut entry.value, event, identity_field);
            if outcome.changed() {
                entry.version = version;
                entry.source = EntrySource::Pushed;
                entry.is_validating = validating;
            }
            outcome.changed()
        });
        if outcome.changed() {
            self.bump_writes();
        }
        outcome
    }

    /// Drop or mark stale the value of `key`.
    pub fn invalidate(&self, key: &str, options: InvalidateOptions) {
        let slot = self.slot_mut(key);
        let version = self.clock.tick();
        if options.refetch {
            slot.publish(|entry| {
                entry.stale = true;
                entry.version = version;
            });
            slot.revalidate.notify_one();
        } else {
            slot.publish(|entry| {
                entry.value = None;
                entry.fetched_at = None;
                entry.error = None;
                entry.stale = true;
                entry.confirmed = false;
                entry.version = version;
                entry.source = EntrySource::Empty;
            });
        }
        self.bump_writes();
        debug!(key = %key, refetch = options.refetch, "Cache key invalidated");
    }

    /// Drop every key; used on scope teardown.
    pub fn clear(&self) {
        self.slots.clear();
    }

    // ------------------------------------------------------------------
    // Fetch lifecycle
    // ------------------------------------------------------------------

    /// Claim the in-flight fetch slot for `key`.
    ///
    /// Returns `None` when the trigger is deduplicated.
    pub fn begin_fetch(&self, key: &str, mode: FetchMode) -> Option<FetchTicket> {
        let mut slot = self.slot_mut(key);
        let now = Instant::now();

        let recently_started = slot
            .last_fetch_started
            .is_some_and(|at| now.saturating_duration_since(at) < self.config.dedup_window);
        if slot.inflight.is_some() || (mode == FetchMode::Deduped && recently_started) {
            self.counters
                .fetches_deduplicated
                .fetch_add(1, Ordering::Relaxed);
            trace!(key = %key, ?mode, "Fetch deduplicated");
            return None;
        }

        let id = self.next_ticket.fetch_add(1, Ordering::Relaxed);
        let started = self.clock.tick();
        slot.inflight = Some(Inflight { id, started });
        slot.last_fetch_started = Some(now);
        slot.journal.clear();
        slot.publish(|_| {});
        self.counters.fetches_started.fetch_add(1, Ordering::Relaxed);

        Some(FetchTicket {
            key: key.to_string(),
            id,
            started,
        })
    }

    /// Land a fetch result.
    ///
    /// The fetched snapshot becomes the base and every change event applied
    /// since the fetch began is replayed on top. A direct or optimistic write
    /// made after the fetch began wins over the fetched payload.
    pub fn complete_fetch(
        &self,
        ticket: FetchTicket,
        result: Result<Value, FetchError>,
    ) -> FetchCompletion {
        let Some(mut slot) = self.slots.get_mut(&ticket.key) else {
            return FetchCompletion::Ignored;
        };
        if slot.inflight.map(|i| i.id) != Some(ticket.id) {
            return FetchCompletion::Ignored;
        }
        slot.inflight = None;

        let completion = match result {
            Ok(fetched) => {
                if slot.last_local_write.is_newer_than(&ticket.started) {
                    slot.publish(|entry| {
                        entry.error = None;
                        entry.confirmed = true;
                    });
                    FetchCompletion::Superseded
                } else {
                    let identity_field = self.config.identity_field.as_str();
                    let mut value = Some(fetched);
                    let mut replayed = 0;
                    for event in slot.journal.since(ticket.started) {
                        reconcile_in_place(&mut value, event, identity_field);
                        replayed += 1;
                    }
                    let version = self.clock.tick();
                    slot.publish(|entry| {
                        entry.value = value;
                        entry.fetched_at = Some(Utc::now());
                        entry.error = None;
                        entry.stale = false;
                        entry.confirmed = true;
                        entry.version = version;
                        entry.source = EntrySource::Fetched;
                    });
                    FetchCompletion::Applied { replayed }
                }
            }
            Err(error) => {
                slot.publish(|entry| entry.error = Some(error));
                FetchCompletion::Failed
            }
        };
        slot.journal.clear();
        self.bump_writes();
        completion
    }

    /// Release a fetch without writing a result.
    pub fn abort_fetch(&self, ticket: FetchTicket) {
        if let Some(mut slot) = self.slots.get_mut(&ticket.key) {
            if slot.inflight.map(|i| i.id) == Some(ticket.id) {
                slot.inflight = None;
                slot.journal.clear();
                slot.publish(|_| {});
            }
        }
    }

    // ------------------------------------------------------------------
    // Optimistic writes
    // ------------------------------------------------------------------

    /// Snapshot `key` and apply `updater` in one step.
    pub fn begin_optimistic<F>(&self, key: &str, updater: F) -> OptimisticTicket
    where
        F: FnOnce(Option<&Value>) -> Option<Value>,
    {
        let mut slot = self.slot_mut(key);
        let snapshot = slot.current_value();
        let version = self.clock.tick();
        slot.pending_mutations += 1;
        slot.last_local_write = version;
        slot.publish(|entry| {
            entry.value = updater(entry.value.as_ref());
            entry.version = version;
            entry.source = EntrySource::Optimistic;
        });
        self.bump_writes();
        OptimisticTicket {
            key: key.to_string(),
            snapshot,
            version,
        }
    }

    /// Finish an optimistic write.
    pub fn settle_optimistic(&self, ticket: OptimisticTicket, settlement: Settlement) -> Watermark {
        let mut slot = self.slot_mut(&ticket.key);
        slot.pending_mutations = slot.pending_mutations.saturating_sub(1);
        let version = self.clock.tick();
        let identity_field = self.config.identity_field.as_str();
        match settlement {
            Settlement::Keep => slot.publish(|entry| {
                entry.version = version;
            }),
            Settlement::MergeEntity(entity) => {
                slot.last_local_write = version;
                slot.publish(|entry| {
                    if !merge_entity(&mut entry.value, &entity, identity_field) {
                        trace!(key = %ticket.key, "Authoritative entity not in cached value");
                    }
                    entry.version = version;
                })
            }
            Settlement::Restore => {
                slot.last_local_write = version;
                let snapshot = ticket.snapshot;
                slot.publish(|entry| {
                    entry.value = snapshot;
                    entry.version = version;
                    entry.source = EntrySource::Restored;
                })
            }
        }
        self.bump_writes();
        version
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use vitrine_core::EntityType;

    fn store() -> CacheStore {
        CacheStore::new(StoreConfig::default())
    }

    fn fetch_error() -> FetchError {
        FetchError::Network {
            key: "orders".to_string(),
            reason: "connection reset".to_string(),
        }
    }

    #[test]
    fn test_get_missing_key_is_empty() {
        let store = store();
        let entry = store.get("orders");
        assert_eq!(entry.key, "orders");
        assert!(entry.value.is_none());
        assert!(entry.is_loading());
        assert_eq!(store.stats().misses, 1);
    }

    #[test]
    fn test_set_notifies_readers_synchronously() {
        let store = store();
        let mut rx = store.subscribe("orders");
        assert!(!rx.has_changed().expect("sender alive"));

        store.set("orders", |_| Some(json!([{"id": "a"}])));

        assert!(rx.has_changed().expect("sender alive"));
        let entry = rx.borrow_and_update().clone();
        assert_eq!(entry.value, Some(json!([{"id": "a"}])));
        assert_eq!(entry.source, EntrySource::Local);
    }

    #[test]
    fn test_set_updater_sees_previous_value() {
        let store = store();
        store.set("count", |_| Some(json!(1)));
        store.set("count", |prev| {
            let n = prev.and_then(Value::as_i64).unwrap_or(0);
            Some(json!(n + 1))
        });
        assert_eq!(store.get("count").value, Some(json!(2)));
    }

    #[tokio::test]
    async fn test_begin_fetch_deduplicates_within_window() {
        tokio::time::pause();
        let store = store();

        let ticket = store
            .begin_fetch("orders", FetchMode::Deduped)
            .expect("first fetch should start");
        assert!(store.get("orders").is_validating);
        assert!(store.begin_fetch("orders", FetchMode::Forced).is_none());

        store.complete_fetch(ticket, Ok(json!([])));
        assert!(!store.get("orders").is_validating);

        // Still inside the window.
        assert!(store.begin_fetch("orders", FetchMode::Deduped).is_none());
        let forced = store
            .begin_fetch("orders", FetchMode::Forced)
            .expect("forced fetch ignores the window");
        store.abort_fetch(forced);

        tokio::time::advance(Duration::from_secs(3)).await;
        assert!(store.begin_fetch("orders", FetchMode::Deduped).is_some());
        assert_eq!(store.stats().fetches_deduplicated, 2);
    }

    #[test]
    fn test_complete_fetch_marks_confirmed() {
        let store = store();
        let ticket = store
            .begin_fetch("orders", FetchMode::Forced)
            .expect("fetch should start");
        let completion = store.complete_fetch(ticket, Ok(json!([{"id": "a"}])));
        assert_eq!(completion, FetchCompletion::Applied { replayed: 0 });

        let entry = store.get("orders");
        assert!(entry.confirmed);
        assert!(!entry.is_loading());
        assert!(entry.fetched_at.is_some());
        assert_eq!(entry.source, EntrySource::Fetched);
    }

    #[test]
    fn test_events_during_fetch_replay_on_result() {
        let store = store();
        store.set("orders", |_| Some(json!([{"id": "a", "status": "paid"}])));

        // Let the local write fall before the fetch start.
        let ticket = store
            .begin_fetch("orders", FetchMode::Forced)
            .expect("fetch should start");
        store.apply_event(
            "orders",
            &ChangeEvent::insert(EntityType::Order, "b", json!({"id": "b", "status": "pending"})),
        );
        store.apply_event(
            "orders",
            &ChangeEvent::update(EntityType::Order, "a", json!({"status": "shipped"})),
        );

        // Snapshot was taken server-side before either event.
        let completion =
            store.complete_fetch(ticket, Ok(json!([{"id": "a", "status": "paid"}])));
        assert_eq!(completion, FetchCompletion::Applied { replayed: 2 });
        assert_eq!(
            store.get("orders").value,
            Some(json!([
                {"id": "b", "status": "pending"},
                {"id": "a", "status": "shipped"}
            ]))
        );
    }

    #[test]
    fn test_local_write_during_fetch_supersedes_result() {
        let store = store();
        let ticket = store
            .begin_fetch("orders", FetchMode::Forced)
            .expect("fetch should start");
        store.set("orders", |_| Some(json!(["local"])));

        let completion = store.complete_fetch(ticket, Ok(json!(["remote"])));
        assert_eq!(completion, FetchCompletion::Superseded);
        let entry = store.get("orders");
        assert_eq!(entry.value, Some(json!(["local"])));
        assert!(entry.confirmed);
    }

    #[test]
    fn test_failed_fetch_keeps_value_and_surfaces_error() {
        let store = store();
        store.set("orders", |_| Some(json!([{"id": "a"}])));
        let ticket = store
            .begin_fetch("orders", FetchMode::Forced)
            .expect("fetch should start");

        assert_eq!(
            store.complete_fetch(ticket, Err(fetch_error())),
            FetchCompletion::Failed
        );
        let entry = store.get("orders");
        assert_eq!(entry.value, Some(json!([{"id": "a"}])));
        assert_eq!(entry.error, Some(fetch_error()));
        assert!(!entry.is_validating);
    }

    #[test]
    fn test_stale_ticket_is_ignored() {
        let store = store();
        let ticket = store
            .begin_fetch("orders", FetchMode::Forced)
            .expect("fetch should start");
        let duplicate = FetchTicket {
            key: ticket.key.clone(),
            id: ticket.id + 100,
            started: ticket.started,
        };
        assert_eq!(
            store.complete_fetch(duplicate, Ok(json!([]))),
            FetchCompletion::Ignored
        );
        assert!(store.get("orders").is_validating);
        store.abort_fetch(ticket);
        assert!(!store.get("orders").is_validating);
    }

    #[test]
    fn test_seed_is_not_authoritative() {
        let store = store();
        let fetched_at = Utc::now();
        assert!(store.seed("orders", json!([{"id": "a"}]), fetched_at));

        let entry = store.get("orders");
        assert_eq!(entry.source, EntrySource::Seeded);
        assert!(entry.is_loading());
        assert_eq!(entry.fetched_at, Some(fetched_at));

        // Second seed is ignored.
        assert!(!store.seed("orders", json!([]), fetched_at));

        let ticket = store
            .begin_fetch("orders", FetchMode::Forced)
            .expect("fetch should start");
        store.complete_fetch(ticket, Ok(json!([{"id": "b"}])));
        let entry = store.get("orders");
        assert_eq!(entry.value, Some(json!([{"id": "b"}])));
        assert!(!entry.is_loading());
    }

    #[test]
    fn test_invalidate_without_refetch_drops_value() {
        let store = store();
        store.set("orders", |_| Some(json!([1])));
        store.invalidate("orders", InvalidateOptions { refetch: false });
        let entry = store.get("orders");
        assert!(entry.value.is_none());
        assert!(entry.stale);
        assert!(entry.is_loading());
    }

    #[tokio::test]
    async fn test_invalidate_with_refetch_signals_poller() {
        let store = store();
        store.set("orders", |_| Some(json!([1])));
        let signal = store.revalidate_signal("orders");

        store.invalidate("orders", InvalidateOptions { refetch: true });

        let entry = store.get("orders");
        assert_eq!(entry.value, Some(json!([1])));
        assert!(entry.stale);
        // Permit is stored even though nobody was waiting yet.
        tokio::time::timeout(Duration::from_millis(50), signal.notified())
            .await
            .expect("revalidate signal should fire");
    }

    #[test]
    fn test_optimistic_restore_is_exact() {
        let store = store();
        let original = json!([{"id": "a", "status": "paid", "notes": null}]);
        store.set("orders", |_| Some(original.clone()));

        let ticket = store.begin_optimistic("orders", |_| Some(json!([{"id": "a", "status": "cancelled"}])));
        assert!(store.get("orders").is_validating);
        assert_eq!(ticket.snapshot(), Some(&original));

        store.settle_optimistic(ticket, Settlement::Restore);
        let entry = store.get("orders");
        assert_eq!(entry.value, Some(original));
        assert_eq!(entry.source, EntrySource::Restored);
        assert!(!entry.is_validating);
    }

    #[test]
    fn test_optimistic_merge_entity() {
        let store = store();
        store.set("orders", |_| Some(json!([{"id": "a", "status": "paid"}])));
        let ticket = store.begin_optimistic("orders", |prev| {
            let mut next = prev.cloned().unwrap_or(Value::Null);
            next[0]["status"] = json!("shipped");
            Some(next)
        });
        store.settle_optimistic(
            ticket,
            Settlement::MergeEntity(json!({"id": "a", "status": "shipped", "tracking_number": "1Z9"})),
        );
        assert_eq!(
            store.get("orders").value,
            Some(json!([{"id": "a", "status": "shipped", "tracking_number": "1Z9"}]))
        );
    }

    #[test]
    fn test_apply_event_on_unknown_key_creates_nothing() {
        let store = store();
        let outcome = store.apply_event("orders", &ChangeEvent::delete(EntityType::Order, "a"));
        assert_eq!(outcome, ReconcileOutcome::CollectionAbsent);
        assert!(store.keys().is_empty());
    }

    #[test]
    fn test_snapshot_all_and_stats() {
        let store = store();
        store.set("b", |_| Some(json!(2)));
        store.set("a", |_| Some(json!(1)));
        let _rx = store.subscribe("empty");

        let keys: Vec<_> = store.snapshot_all().into_iter().map(|e| e.key).collect();
        assert_eq!(keys, vec!["a", "b"]);
        assert_eq!(store.keys(), vec!["a", "b", "empty"]);

        store.get("a");
        let stats = store.stats();
        assert_eq!(stats.entries, 3);
        assert_eq!(stats.writes, 2);
        assert_eq!(stats.hits, 1);
        assert!(stats.hit_rate() > 0.99);
    }
}
