//! Runtime wiring: one store, one push subscriber, one reconciliation driver.
//!
//! ```text
//! durable store --seed--> CacheStore <--fetch-- PollingScheduler
//!                            ^   ^
//!         ReconciliationEngine   OptimisticMutationManager
//!                            ^
//!                     PushSubscriber
//! ```

use crate::collection::{Collection, CollectionSpec};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::de::DeserializeOwned;
use serde_json::json;
use std::sync::{Arc, Weak};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info};
use vitrine_cache::{
    CacheStore, CollectionFetcher, DurableStore, JsonFileStore, LmdbDurableStore,
    MemoryDurableStore, MutationEndpoint, OptimisticMutationManager, PersistError,
    PersistentCacheBridge, PollingHandle, PollingPolicy, PollingScheduler, ReconcileOutcome,
    ReconciliationEngine, Revalidate, RoutedChange, StoreConfig,
};
use vitrine_chat::ChatService;
use vitrine_core::{
    ChangeEvent, ConfigError, HealthCheck, HealthReport, Order, PersistenceBackend,
    PersistenceConfig, SyncConfig, VitrineError, VitrineResult,
};
use vitrine_realtime::{
    select_hasher, PushSubscriber, RestClient, ScopeHasher, SubscriptionHandle, TransportFactory,
    WsPushTransport,
};
use vitrine_tracking::{summarize, Carrier, CarrierError, RawTrackingEvent, TrackingReport, TrackingSummary};

const LMDB_MAP_SIZE_MB: usize = 64;

pub fn tracking_key(order: &Order) -> String {
    format!("tracking:{}", order.id)
}

/// Shared machinery behind every [`Collection`] with the same key.
pub struct Mount {
    key: String,
    poller: PollingHandle,
    subscription: Option<SubscriptionHandle>,
    /// Pins the poller's health at `false` for polling-only collections.
    _polling_only: Option<watch::Sender<bool>>,
    writer: Option<JoinHandle<()>>,
}

impl Mount {
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn is_push_backed(&self) -> bool {
        self.subscription.is_some()
    }

    pub fn is_polling(&self) -> bool {
        self.poller.is_running()
    }

    pub(crate) fn revalidate(&self, trigger: Revalidate) {
        self.poller.revalidate(trigger);
    }

    /// Stop polling and persisting even while consumers still hold the mount.
    fn stop(&self) {
        self.poller.cancel();
        if let Some(writer) = &self.writer {
            writer.abort();
        }
    }
}

impl Drop for Mount {
    fn drop(&mut self) {
        self.stop();
        debug!(key = %self.key, "Last consumer unmounted");
    }
}

/// Builds a [`SyncRuntime`]; network collaborators default to the REST and
/// WebSocket clients from the config.
pub struct SyncRuntimeBuilder {
    config: SyncConfig,
    fetcher: Option<Arc<dyn CollectionFetcher>>,
    endpoint: Option<Arc<dyn MutationEndpoint>>,
    transport: Option<TransportFactory>,
    hasher: Option<Arc<dyn ScopeHasher>>,
    durable: Option<Arc<dyn DurableStore>>,
}

impl SyncRuntimeBuilder {
    pub fn fetcher(mut self, fetcher: Arc<dyn CollectionFetcher>) -> Self {
        self.fetcher = Some(fetcher);
        self
    }

    pub fn endpoint(mut self, endpoint: Arc<dyn MutationEndpoint>) -> Self {
        self.endpoint = Some(endpoint);
        self
    }

    pub fn transport(mut self, factory: TransportFactory) -> Self {
        self.transport = Some(factory);
        self
    }

    pub fn hasher(mut self, hasher: Arc<dyn ScopeHasher>) -> Self {
        self.hasher = Some(hasher);
        self
    }

    /// Use this durable store instead of the configured backend.
    pub fn durable(mut self, durable: Arc<dyn DurableStore>) -> Self {
        self.durable = Some(durable);
        self
    }

    /// Validate the config, seed the cache and start the reconciliation driver.
    ///
    /// Must be called inside a tokio runtime.
    pub fn build(self) -> VitrineResult<SyncRuntime> {
        let config = self.config;
        config.validate()?;

        let store = Arc::new(CacheStore::new(StoreConfig::from_polling(&config.polling)));

        let (fetcher, endpoint) = match (self.fetcher, self.endpoint) {
            (Some(fetcher), Some(endpoint)) => (fetcher, endpoint),
            (fetcher, endpoint) => {
                let rest = Arc::new(RestClient::new(&config.api)?);
                (
                    fetcher.unwrap_or_else(|| rest.clone() as Arc<dyn CollectionFetcher>),
                    endpoint.unwrap_or_else(|| rest as Arc<dyn MutationEndpoint>),
                )
            }
        };

        let transport = self
            .transport
            .unwrap_or_else(|| WsPushTransport::factory(config.api.clone()));
        let hasher = self.hasher.unwrap_or_else(|| select_hasher(config.hasher));
        let subscriber = PushSubscriber::new(transport, hasher, config.reconnect.clone());

        let durable = match self.durable {
            Some(durable) => Some(durable),
            None => open_durable(&config.persistence)?,
        };
        let bridge = durable.map(|durable| {
            PersistentCacheBridge::new(store.clone(), durable)
                .with_max_age(config.persistence.max_age())
        });
        if let Some(bridge) = &bridge {
            let report = bridge.seed_all();
            info!(
                seeded = report.seeded,
                expired = report.expired,
                failed = report.failed,
                "Cache seeded"
            );
        }

        let engine = ReconciliationEngine::new(store.clone());
        let (changes, rx) = mpsc::unbounded_channel();
        let driver = engine.clone().spawn_driver(rx);

        let scheduler = PollingScheduler::new(store.clone(), PollingPolicy::from(&config.polling));
        let mutations = OptimisticMutationManager::new(store.clone(), config.mutation.timeout());

        info!(
            base_url = %config.api.base_url,
            backend = ?config.persistence.backend,
            "Sync runtime started"
        );

        Ok(SyncRuntime {
            inner: Arc::new(RuntimeInner {
                config,
                store,
                engine,
                changes,
                driver,
                scheduler,
                subscriber,
                fetcher,
                endpoint,
                mutations,
                bridge,
                mounts: DashMap::new(),
            }),
        })
    }
}

fn open_durable(config: &PersistenceConfig) -> VitrineResult<Option<Arc<dyn DurableStore>>> {
    let require_path = || {
        config.path.clone().ok_or_else(|| {
            VitrineError::Config(ConfigError::InvalidValue {
                field: "persistence.path",
                reason: "required for file-backed persistence".to_string(),
            })
        })
    };
    let durable: Arc<dyn DurableStore> = match config.backend {
        PersistenceBackend::Disabled => return Ok(None),
        PersistenceBackend::Memory => Arc::new(MemoryDurableStore::new()),
        PersistenceBackend::JsonFile => Arc::new(JsonFileStore::new(require_path()?)?),
        PersistenceBackend::Lmdb => Arc::new(
            LmdbDurableStore::open(require_path()?, LMDB_MAP_SIZE_MB).map_err(PersistError::from)?,
        ),
    };
    Ok(Some(durable))
}

struct RuntimeInner {
    config: SyncConfig,
    store: Arc<CacheStore>,
    engine: ReconciliationEngine,
    changes: mpsc::UnboundedSender<RoutedChange>,
    driver: JoinHandle<()>,
    scheduler: PollingScheduler,
    subscriber: PushSubscriber,
    fetcher: Arc<dyn CollectionFetcher>,
    endpoint: Arc<dyn MutationEndpoint>,
    mutations: OptimisticMutationManager,
    bridge: Option<PersistentCacheBridge>,
    mounts: DashMap<String, Weak<Mount>>,
}

impl RuntimeInner {
    fn start_mount(&self, spec: &CollectionSpec) -> Mount {
        let subscription = spec.push.as_ref().and_then(|(entity_type, scope)| {
            self.subscriber
                .open(*entity_type, scope, spec.key.clone(), self.changes.clone())
        });
        // Each poller follows its own channel; without one it stays on the short interval.
        let (health, polling_only) = match &subscription {
            Some(handle) => (handle.health_watch(), None),
            None => {
                let (tx, rx) = watch::channel(false);
                (rx, Some(tx))
            }
        };
        let poller = self
            .scheduler
            .start(spec.key.clone(), self.fetcher.clone(), health);
        let writer = match (&self.bridge, spec.persist) {
            (Some(bridge), true) => Some(bridge.spawn_writer(&spec.key)),
            _ => None,
        };
        info!(
            key = %spec.key,
            push = subscription.is_some(),
            persist = writer.is_some(),
            "Collection mounted"
        );
        Mount {
            key: spec.key.clone(),
            poller,
            subscription,
            _polling_only: polling_only,
            writer,
        }
    }
}

impl Drop for RuntimeInner {
    fn drop(&mut self) {
        self.driver.abort();
    }
}

/// Entry point for hosts: mounts collections and reports health.
#[derive(Clone)]
pub struct SyncRuntime {
    inner: Arc<RuntimeInner>,
}

impl SyncRuntime {
    pub fn builder(config: SyncConfig) -> SyncRuntimeBuilder {
        SyncRuntimeBuilder {
            config,
            fetcher: None,
            endpoint: None,
            transport: None,
            hasher: None,
            durable: None,
        }
    }

    pub fn config(&self) -> &SyncConfig {
        &self.inner.config
    }

    pub fn store(&self) -> &Arc<CacheStore> {
        &self.inner.store
    }

    pub fn subscriber(&self) -> &PushSubscriber {
        &self.inner.subscriber
    }

    /// Mount a collection. Consumers of the same key share one poller and
    /// one push subscription.
    pub fn mount<T: DeserializeOwned>(&self, spec: CollectionSpec) -> Collection<T> {
        self.inner.mounts.retain(|_, mount| mount.strong_count() > 0);
        let mount = match self.inner.mounts.entry(spec.key.clone()) {
            Entry::Occupied(mut occupied) => match occupied.get().upgrade() {
                Some(mount) => mount,
                None => {
                    let mount = Arc::new(self.inner.start_mount(&spec));
                    occupied.insert(Arc::downgrade(&mount));
                    mount
                }
            },
            Entry::Vacant(vacant) => {
                let mount = Arc::new(self.inner.start_mount(&spec));
                vacant.insert(Arc::downgrade(&mount));
                mount
            }
        };
        Collection::new(mount, self.inner.mutations.clone())
    }

    pub fn mounted_count(&self) -> usize {
        self.inner
            .mounts
            .iter()
            .filter(|mount| mount.strong_count() > 0)
            .count()
    }

    /// Apply a change event to a cached collection without refetching.
    pub fn apply_push_event(&self, collection_key: &str, event: &ChangeEvent) -> ReconcileOutcome {
        self.inner.engine.apply(collection_key, event)
    }

    pub fn is_channel_healthy(&self) -> bool {
        self.inner.subscriber.is_healthy()
    }

    /// Revalidate every mounted collection; a reconnect also re-opens push channels.
    pub fn revalidate_all(&self, trigger: Revalidate) -> usize {
        if trigger == Revalidate::Reconnect {
            self.inner.subscriber.resubscribe_all();
        }
        self.inner.scheduler.revalidate_all(trigger)
    }

    pub fn chat(&self, scope: impl Into<String>) -> ChatService {
        ChatService::new(
            self.inner.store.clone(),
            self.inner.endpoint.clone(),
            scope,
            self.inner.config.mutation.timeout(),
        )
    }

    /// Summarize a carrier refresh for `order`, falling back to the last
    /// cached status when the carrier fails.
    pub fn track(
        &self,
        order: &Order,
        result: Result<Vec<RawTrackingEvent>, CarrierError>,
    ) -> TrackingReport {
        let key = tracking_key(order);
        let last_cached = self
            .inner
            .store
            .get_as::<TrackingSummary>(&key)
            .ok()
            .and_then(|entry| entry.value)
            .map(|summary| summary.status);

        let report = summarize(Carrier::for_order(order), result, last_cached);
        if report.error.is_none() {
            if let Ok(summary) = serde_json::to_value(&report.summary) {
                self.inner.store.set(&key, |_| Some(summary));
            }
        }
        report
    }

    pub fn health(&self) -> HealthReport {
        let stats = self.inner.store.stats();
        let cache = HealthCheck::healthy("cache")
            .with_metadata("entries", json!(stats.entries))
            .with_metadata("hit_rate", json!(stats.hit_rate()))
            .with_metadata("mounted", json!(self.mounted_count()));
        let persistence = match &self.inner.bridge {
            Some(_) => HealthCheck::healthy("persistence"),
            None => HealthCheck::degraded("persistence", "no durable store, cold start every launch"),
        }
        .with_metadata(
            "backend",
            json!(format!("{:?}", self.inner.config.persistence.backend).to_lowercase()),
        );
        HealthReport::from_checks(vec![self.inner.subscriber.health_check(), cache, persistence])
    }

    /// Persist what can be persisted, then stop every poller, writer and channel.
    ///
    /// Collections still held by consumers keep their last value but no
    /// longer refresh. Returns how many entries were written to the durable store.
    pub fn shutdown(&self) -> usize {
        let written = self
            .inner
            .bridge
            .as_ref()
            .map(PersistentCacheBridge::persist_all)
            .unwrap_or(0);
        for mount in self.inner.mounts.iter() {
            if let Some(mount) = mount.upgrade() {
                mount.stop();
            }
        }
        self.inner.subscriber.close_all();
        self.inner.mounts.clear();
        info!(persisted = written, "Sync runtime shut down");
        written
    }
}

impl std::fmt::Debug for SyncRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncRuntime")
            .field("base_url", &self.inner.config.api.base_url)
            .field("mounted", &self.mounted_count())
            .finish_non_exhaustive()
    }
}
