//! Vitrine Cache - Revalidating Client Cache
//!
//! The shared mutable heart of a Vitrine client:
//! - [`CacheStore`]: keyed entries with watch-based notification
//! - [`PollingScheduler`]: health-adaptive interval refresh
//! - [`ReconciliationEngine`]: push change events merged without refetch
//! - [`OptimisticMutationManager`]: local-first writes with rollback
//! - [`PersistentCacheBridge`]: durable seeding for instant display
//!
//! Every writer goes through the store so readers see each change.

pub mod entry;
pub mod lmdb_backend;
pub mod optimistic;
pub mod persist;
pub mod polling;
pub mod reconcile;
pub mod store;
pub mod watermark;

pub use entry::{CacheEntry, EntrySource};
pub use lmdb_backend::{LmdbDurableStore, LmdbStoreError};
pub use optimistic::{
    BatchMode, MutationCall, MutationEndpoint, MutationOutcome, MutationRequest,
    OptimisticMutationManager,
};
pub use persist::{
    DurableStore, JsonFileStore, MemoryDurableStore, PersistError, PersistedBlob,
    PersistentCacheBridge, SeedReport,
};
pub use polling::{CollectionFetcher, PollingHandle, PollingPolicy, PollingScheduler, Revalidate};
pub use reconcile::{
    merge_entity, merge_fields, reconcile_in_place, ReconcileOutcome, ReconciliationEngine,
    RoutedChange,
};
pub use store::{
    CacheStore, FetchCompletion, FetchMode, FetchTicket, InvalidateOptions, OptimisticTicket,
    Settlement, StoreConfig, StoreStats,
};
pub use watermark::{KeyJournal, LogicalClock, Watermark};
