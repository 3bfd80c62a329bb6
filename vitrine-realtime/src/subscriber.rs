//! Ref-counted push channel subscriptions with reconnect.
//!
//! One channel is open per `(entity_type, scope)` pair no matter how many
//! consumers mount it. Each channel runs in its own task that reconnects with
//! jittered exponential backoff and never replays missed events; the polling
//! safety net covers gaps. Translated change events are pushed into the
//! consumers' mpsc sinks in delivery order.

use crate::hasher::ScopeHasher;
use crate::transport::{PushTransport, RawChange, SubscriptionStatus, TransportFactory, TransportFrame};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use once_cell::sync::OnceCell;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::{mpsc, watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};
use vitrine_cache::RoutedChange;
use vitrine_core::{EntityType, HealthCheck, ReconnectConfig, DEFAULT_IDENTITY_FIELD};

/// Identifies one logical channel.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ScopeKey {
    pub entity_type: EntityType,
    pub scope: String,
}

struct SinkRef {
    tx: mpsc::UnboundedSender<RoutedChange>,
    refs: usize,
}

struct Subscription {
    generation: u64,
    channel_name: String,
    status: SubscriptionStatus,
    refs: usize,
    sinks: HashMap<String, SinkRef>,
    /// True while this channel is `Subscribed`.
    health: watch::Sender<bool>,
    resubscribe: Arc<Notify>,
    task: JoinHandle<()>,
}

impl Subscription {
    fn shut_down(self) {
        self.health.send_replace(false);
        self.task.abort();
        debug!(channel = %self.channel_name, "Push subscription closed");
    }
}

struct Inner {
    factory: TransportFactory,
    transport: OnceCell<Option<Arc<dyn PushTransport>>>,
    hasher: Arc<dyn ScopeHasher>,
    reconnect: ReconnectConfig,
    identity_field: String,
    registry: DashMap<ScopeKey, Subscription>,
    health: watch::Sender<bool>,
    degraded: AtomicBool,
    next_generation: AtomicU64,
}

impl Drop for Inner {
    fn drop(&mut self) {
        for entry in self.registry.iter() {
            entry.task.abort();
        }
    }
}

/// Owns every push channel of a runtime.
#[derive(Clone)]
pub struct PushSubscriber {
    inner: Arc<Inner>,
}

impl fmt::Debug for PushSubscriber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PushSubscriber")
            .field("hasher", &self.inner.hasher.name())
            .field("subscriptions", &self.inner.registry.len())
            .field("degraded", &self.is_degraded())
            .finish()
    }
}

impl PushSubscriber {
    /// `factory` runs once, on the first `open` with a non-empty scope.
    pub fn new(
        factory: TransportFactory,
        hasher: Arc<dyn ScopeHasher>,
        reconnect: ReconnectConfig,
    ) -> Self {
        let (health, _) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                factory,
                transport: OnceCell::new(),
                hasher,
                reconnect,
                identity_field: DEFAULT_IDENTITY_FIELD.to_string(),
                registry: DashMap::new(),
                health,
                degraded: AtomicBool::new(false),
                next_generation: AtomicU64::new(1),
            }),
        }
    }

    /// Channel name for a scope: `<entity prefix>:<hashed scope>`.
    pub fn channel_name(&self, entity_type: EntityType, scope: &str) -> String {
        self.inner.channel_name(entity_type, scope)
    }

    /// Subscribe `collection_key` to changes of `entity_type` within `scope`.
    ///
    /// Returns `None` for an empty scope or when push is unavailable; the
    /// caller then relies on polling alone.
    pub fn open(
        &self,
        entity_type: EntityType,
        scope: &str,
        collection_key: impl Into<String>,
        sink: mpsc::UnboundedSender<RoutedChange>,
    ) -> Option<SubscriptionHandle> {
        let scope = scope.trim();
        if scope.is_empty() {
            trace!(entity = %entity_type, "Empty scope, no push subscription");
            return None;
        }
        let transport = self.inner.transport()?;
        let key = ScopeKey {
            entity_type,
            scope: scope.to_string(),
        };
        let collection_key = collection_key.into();

        let (generation, channel_name, health) = match self.inner.registry.entry(key.clone()) {
            Entry::Occupied(mut occupied) => {
                let sub = occupied.get_mut();
                sub.refs += 1;
                sub.sinks
                    .entry(collection_key.clone())
                    .and_modify(|s| s.refs += 1)
                    .or_insert(SinkRef { tx: sink, refs: 1 });
                debug!(channel = %sub.channel_name, refs = sub.refs, "Reusing push subscription");
                (sub.generation, sub.channel_name.clone(), sub.health.subscribe())
            }
            Entry::Vacant(vacant) => {
                let generation = self.inner.next_generation.fetch_add(1, Ordering::Relaxed);
                let channel_name = self.inner.channel_name(entity_type, scope);
                let resubscribe = Arc::new(Notify::new());
                let (health, health_rx) = watch::channel(false);
                let task = tokio::spawn(run_channel(ChannelTask {
                    inner: Arc::downgrade(&self.inner),
                    key: key.clone(),
                    generation,
                    channel: channel_name.clone(),
                    transport,
                    resubscribe: resubscribe.clone(),
                    reconnect: self.inner.reconnect.clone(),
                }));
                let mut sinks = HashMap::new();
                sinks.insert(collection_key.clone(), SinkRef { tx: sink, refs: 1 });
                vacant.insert(Subscription {
                    generation,
                    channel_name: channel_name.clone(),
                    status: SubscriptionStatus::Connecting,
                    refs: 1,
                    sinks,
                    health,
                    resubscribe,
                    task,
                });
                info!(channel = %channel_name, entity = %entity_type, "Push subscription opened");
                (generation, channel_name, health_rx)
            }
        };
        self.inner.refresh_health();

        Some(SubscriptionHandle {
            inner: self.inner.clone(),
            key,
            generation,
            collection_key,
            channel_name,
            health,
        })
    }

    /// Release a handle explicitly; equivalent to dropping it.
    pub fn close(&self, handle: SubscriptionHandle) {
        drop(handle);
    }

    /// Tear down every channel (logout, scope teardown).
    pub fn close_all(&self) {
        let keys: Vec<ScopeKey> = self.inner.registry.iter().map(|e| e.key().clone()).collect();
        for key in keys {
            if let Some((_, sub)) = self.inner.registry.remove(&key) {
                sub.shut_down();
            }
        }
        self.inner.refresh_health();
    }

    /// Reconnect every channel now, resetting backoff.
    pub fn resubscribe_all(&self) -> usize {
        let mut count = 0;
        for entry in self.inner.registry.iter() {
            entry.resubscribe.notify_one();
            count += 1;
        }
        count
    }

    /// True while at least one channel is subscribed and none is failing.
    ///
    /// Pollers follow [`SubscriptionHandle::health_watch`] instead, so one
    /// failing channel does not shorten the interval of healthy ones.
    pub fn is_healthy(&self) -> bool {
        *self.inner.health.borrow()
    }

    pub fn health_watch(&self) -> watch::Receiver<bool> {
        self.inner.health.subscribe()
    }

    /// The transport could not be built; push stays unhealthy for good.
    pub fn is_degraded(&self) -> bool {
        self.inner.degraded.load(Ordering::SeqCst)
    }

    pub fn active_count(&self) -> usize {
        self.inner.registry.len()
    }

    pub fn status(&self, entity_type: EntityType, scope: &str) -> Option<SubscriptionStatus> {
        let key = ScopeKey {
            entity_type,
            scope: scope.trim().to_string(),
        };
        self.inner.registry.get(&key).map(|sub| sub.status)
    }

    pub fn health_check(&self) -> HealthCheck {
        let check = if self.is_degraded() {
            HealthCheck::degraded("push_channel", "transport unavailable, polling only")
        } else if self.is_healthy() {
            HealthCheck::healthy("push_channel")
        } else {
            HealthCheck::degraded("push_channel", "no subscribed channel, polling at short interval")
        };
        check
            .with_metadata("subscriptions", serde_json::json!(self.active_count()))
            .with_metadata("hasher", serde_json::json!(self.inner.hasher.name()))
    }
}

impl Inner {
    fn channel_name(&self, entity_type: EntityType, scope: &str) -> String {
        format!("{}:{}", entity_type.channel_prefix(), self.hasher.hash(scope.trim()))
    }

    fn transport(&self) -> Option<Arc<dyn PushTransport>> {
        self.transport
            .get_or_init(|| match (self.factory)() {
                Ok(transport) => Some(transport),
                Err(e) => {
                    warn!(error = %e, "Push transport unavailable, falling back to polling");
                    self.degraded.store(true, Ordering::SeqCst);
                    None
                }
            })
            .clone()
    }

    fn refresh_health(&self) {
        let healthy = !self.degraded.load(Ordering::SeqCst)
            && !self.registry.is_empty()
            && self
                .registry
                .iter()
                .all(|sub| sub.status == SubscriptionStatus::Subscribed);
        self.health.send_if_modified(|current| {
            if *current == healthy {
                false
            } else {
                *current = healthy;
                true
            }
        });
    }

    /// Record `status`; false once the subscription is gone.
    fn set_status(&self, key: &ScopeKey, generation: u64, status: SubscriptionStatus) -> bool {
        let live = match self.registry.get_mut(key) {
            Some(mut sub) if sub.generation == generation => {
                sub.status = status;
                let subscribed = status == SubscriptionStatus::Subscribed;
                sub.health.send_if_modified(|current| {
                    let changed = *current != subscribed;
                    *current = subscribed;
                    changed
                });
                true
            }
            _ => false,
        };
        if live {
            self.refresh_health();
        }
        live
    }

    fn dispatch(&self, key: &ScopeKey, channel: &str, raw: RawChange) {
        let event = match raw.into_change_event(channel, key.entity_type, &self.identity_field) {
            Ok(event) => event,
            Err(e) => {
                warn!(channel = %channel, error = %e, "Dropping undecodable change");
                return;
            }
        };
        let sinks: Vec<(String, mpsc::UnboundedSender<RoutedChange>)> = self
            .registry
            .get(key)
            .map(|sub| {
                sub.sinks
                    .iter()
                    .map(|(collection_key, sink)| (collection_key.clone(), sink.tx.clone()))
                    .collect()
            })
            .unwrap_or_default();
        for (collection_key, tx) in sinks {
            if tx.send(RoutedChange::new(collection_key, event.clone())).is_err() {
                debug!(channel = %channel, "Change sink closed");
            }
        }
    }

    fn release(&self, key: &ScopeKey, generation: u64, collection_key: &str) {
        let closed = match self.registry.entry(key.clone()) {
            Entry::Occupied(mut occupied) if occupied.get().generation == generation => {
                let sub = occupied.get_mut();
                let sink_drained = match sub.sinks.get_mut(collection_key) {
                    Some(sink) => {
                        sink.refs = sink.refs.saturating_sub(1);
                        sink.refs == 0
                    }
                    None => false,
                };
                if sink_drained {
                    sub.sinks.remove(collection_key);
                }
                sub.refs = sub.refs.saturating_sub(1);
                if sub.refs == 0 {
                    occupied.remove().shut_down();
                    true
                } else {
                    false
                }
            }
            _ => false,
        };
        if closed {
            self.refresh_health();
        }
    }
}

/// A consumer's claim on a channel; dropping it releases the claim.
pub struct SubscriptionHandle {
    inner: Arc<Inner>,
    key: ScopeKey,
    generation: u64,
    collection_key: String,
    channel_name: String,
    health: watch::Receiver<bool>,
}

impl SubscriptionHandle {
    pub fn channel_name(&self) -> &str {
        &self.channel_name
    }

    pub fn collection_key(&self) -> &str {
        &self.collection_key
    }

    pub fn scope(&self) -> &ScopeKey {
        &self.key
    }

    /// Health of this channel alone; closes when the channel is torn down.
    pub fn health_watch(&self) -> watch::Receiver<bool> {
        self.health.clone()
    }

    pub fn is_subscribed(&self) -> bool {
        *self.health.borrow()
    }
}

impl fmt::Debug for SubscriptionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriptionHandle")
            .field("channel", &self.channel_name)
            .field("collection_key", &self.collection_key)
            .finish()
    }
}

impl Drop for SubscriptionHandle {
    fn drop(&mut self) {
        self.inner
            .release(&self.key, self.generation, &self.collection_key);
    }
}

// ============================================================================
// CHANNEL TASK
// ============================================================================

struct ChannelTask {
    inner: Weak<Inner>,
    key: ScopeKey,
    generation: u64,
    channel: String,
    transport: Arc<dyn PushTransport>,
    resubscribe: Arc<Notify>,
    reconnect: ReconnectConfig,
}

impl ChannelTask {
    fn set_status(&self, status: SubscriptionStatus) -> bool {
        self.inner
            .upgrade()
            .is_some_and(|inner| inner.set_status(&self.key, self.generation, status))
    }
}

async fn run_channel(task: ChannelTask) {
    let mut backoff = task.reconnect.initial_ms;
    loop {
        if !task.set_status(SubscriptionStatus::Connecting) {
            return;
        }

        let mut immediate = false;
        match task.transport.open(&task.channel, &task.key.scope).await {
            Ok(mut frames) => loop {
                tokio::select! {
                    frame = frames.recv() => match frame {
                        Some(TransportFrame::Status(status)) => {
                            if !task.set_status(status) {
                                return;
                            }
                            match status {
                                SubscriptionStatus::Subscribed => {
                                    backoff = task.reconnect.initial_ms;
                                    debug!(channel = %task.channel, "Channel subscribed");
                                }
                                SubscriptionStatus::Error | SubscriptionStatus::Closed => {
                                    warn!(channel = %task.channel, %status, "Channel reported failure");
                                    break;
                                }
                                SubscriptionStatus::Connecting => {}
                            }
                        }
                        Some(TransportFrame::Change(raw)) => match task.inner.upgrade() {
                            Some(inner) => inner.dispatch(&task.key, &task.channel, raw),
                            None => return,
                        },
                        None => {
                            debug!(channel = %task.channel, "Channel stream ended");
                            break;
                        }
                    },
                    _ = task.resubscribe.notified() => {
                        debug!(channel = %task.channel, "Manual resubscribe");
                        immediate = true;
                        break;
                    }
                }
            },
            Err(e) => {
                warn!(channel = %task.channel, error = %e, "Failed to open channel");
            }
        }

        if !task.set_status(SubscriptionStatus::Error) {
            return;
        }
        if immediate {
            backoff = task.reconnect.initial_ms;
            continue;
        }

        let delay = jittered_backoff(backoff, task.reconnect.jitter_ms);
        tokio::select! {
            _ = tokio::time::sleep(Duration::from_millis(delay)) => {
                let next = (backoff as f64 * task.reconnect.multiplier) as u64;
                backoff = next.min(task.reconnect.max_ms);
            }
            _ = task.resubscribe.notified() => {
                backoff = task.reconnect.initial_ms;
            }
        }
    }
}

fn jittered_backoff(base_ms: u64, jitter_ms: u64) -> u64 {
    if jitter_ms == 0 {
        return base_ms;
    }
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_else(|_| Duration::from_nanos(0))
        .subsec_nanos() as u64;
    let jitter = nanos % jitter_ms;
    base_ms.saturating_add(jitter)
}
