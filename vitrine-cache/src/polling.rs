//! Interval polling that adapts to push-channel health.
//!
//! While push is healthy the poller runs on a long safety-net interval; while
//! it is not, polling is the primary refresh path and runs on a short one.
//! All triggers (timer, focus, reconnect, manual, invalidate) go through the
//! store's fetch gate, so triggers landing inside the dedup window collapse
//! into a single network call.

use crate::store::{CacheStore, FetchMode, FetchTicket};
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep, sleep_until, Instant};
use tracing::{debug, info, warn};
use vitrine_core::{FetchError, PollingConfig};

/// Source of collection snapshots.
#[async_trait]
pub trait CollectionFetcher: Send + Sync {
    async fn fetch(&self, key: &str) -> Result<Value, FetchError>;
}

/// Why a revalidation was requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Revalidate {
    /// Host regained foreground visibility.
    Focus,
    /// Network connectivity came back.
    Reconnect,
    /// Explicit refresh from a consumer; bypasses the dedup window.
    Manual,
}

impl Revalidate {
    fn mode(self) -> FetchMode {
        match self {
            Revalidate::Focus | Revalidate::Reconnect => FetchMode::Deduped,
            Revalidate::Manual => FetchMode::Forced,
        }
    }
}

/// Interval and retry settings.
#[derive(Debug, Clone)]
pub struct PollingPolicy {
    pub healthy_interval: Duration,
    pub unhealthy_interval: Duration,
    pub error_retry_count: u32,
    pub error_retry_base: Duration,
}

impl Default for PollingPolicy {
    fn default() -> Self {
        Self {
            healthy_interval: Duration::from_secs(300),
            unhealthy_interval: Duration::from_secs(15),
            error_retry_count: 3,
            error_retry_base: Duration::from_secs(1),
        }
    }
}

impl From<&PollingConfig> for PollingPolicy {
    fn from(config: &PollingConfig) -> Self {
        Self {
            healthy_interval: config.healthy_interval(),
            unhealthy_interval: config.unhealthy_interval(),
            error_retry_count: config.error_retry_count,
            error_retry_base: config.error_retry_base(),
        }
    }
}

impl PollingPolicy {
    pub fn interval_for(&self, push_healthy: bool) -> Duration {
        if push_healthy {
            self.healthy_interval
        } else {
            self.unhealthy_interval
        }
    }

    fn retry_delay(&self, attempt: u32) -> Duration {
        self.error_retry_base
            .saturating_mul(1u32 << attempt.min(16))
    }
}

/// Starts pollers and fans out global revalidation triggers.
#[derive(Clone)]
pub struct PollingScheduler {
    store: Arc<CacheStore>,
    policy: PollingPolicy,
    broadcast: broadcast::Sender<Revalidate>,
}

impl PollingScheduler {
    pub fn new(store: Arc<CacheStore>, policy: PollingPolicy) -> Self {
        let (broadcast, _) = broadcast::channel(16);
        Self {
            store,
            policy,
            broadcast,
        }
    }

    pub fn policy(&self) -> &PollingPolicy {
        &self.policy
    }

    /// Revalidate every running poller (focus regained, network back).
    pub fn revalidate_all(&self, trigger: Revalidate) -> usize {
        self.broadcast.send(trigger).unwrap_or(0)
    }

    /// Poll `key` until the returned handle is stopped or dropped.
    ///
    /// Fetches once immediately, then on the interval selected by `health`.
    pub fn start(
        &self,
        key: impl Into<String>,
        fetcher: Arc<dyn CollectionFetcher>,
        health: watch::Receiver<bool>,
    ) -> PollingHandle {
        let key = key.into();
        let (trigger_tx, trigger_rx) = mpsc::unbounded_channel();
        let task = PollTask {
            key: key.clone(),
            store: self.store.clone(),
            fetcher,
            policy: self.policy.clone(),
        };
        let broadcast_rx = self.broadcast.subscribe();
        let handle = tokio::spawn(task.run(health, trigger_rx, broadcast_rx));
        PollingHandle {
            key,
            triggers: trigger_tx,
            task: handle,
        }
    }
}

/// Owns a running poller; dropping it cancels the task and its timers.
#[derive(Debug)]
pub struct PollingHandle {
    key: String,
    triggers: mpsc::UnboundedSender<Revalidate>,
    task: JoinHandle<()>,
}

impl PollingHandle {
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn revalidate(&self, trigger: Revalidate) {
        if self.triggers.send(trigger).is_err() {
            debug!(key = %self.key, "Poller already stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        !self.task.is_finished()
    }

    pub fn stop(self) {
        drop(self);
    }

    /// Cancel the task while the handle stays shared with other owners.
    pub fn cancel(&self) {
        self.task.abort();
    }
}

impl Drop for PollingHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Releases the fetch slot if the poller is cancelled mid-fetch.
struct InflightFetch<'a> {
    store: &'a CacheStore,
    ticket: Option<FetchTicket>,
}

impl Drop for InflightFetch<'_> {
    fn drop(&mut self) {
        if let Some(ticket) = self.ticket.take() {
            self.store.abort_fetch(ticket);
        }
    }
}

struct PollTask {
    key: String,
    store: Arc<CacheStore>,
    fetcher: Arc<dyn CollectionFetcher>,
    policy: PollingPolicy,
}

impl PollTask {
    async fn run(
        self,
        mut health: watch::Receiver<bool>,
        mut triggers: mpsc::UnboundedReceiver<Revalidate>,
        mut broadcast_rx: broadcast::Receiver<Revalidate>,
    ) {
        let revalidate = self.store.revalidate_signal(&self.key);
        let mut healthy = *health.borrow_and_update();
        let mut health_open = true;
        let mut broadcast_open = true;

        info!(key = %self.key, push_healthy = healthy, "Poller started");
        let mut last_poll = self.poll(FetchMode::Deduped).await;

        loop {
            let next_tick = last_poll + self.policy.interval_for(healthy);
            tokio::select! {
                _ = sleep_until(next_tick) => {
                    last_poll = self.poll(FetchMode::Deduped).await;
                }
                changed = health.changed(), if health_open => {
                    let was_healthy = healthy;
                    match changed {
                        Ok(()) => healthy = *health.borrow_and_update(),
                        Err(_) => {
                            health_open = false;
                            healthy = false;
                        }
                    }
                    if healthy != was_healthy {
                        debug!(
                            key = %self.key,
                            push_healthy = healthy,
                            interval_ms = self.policy.interval_for(healthy).as_millis() as u64,
                            "Poll interval re-armed"
                        );
                    }
                    // Events missed during the outage are never replayed.
                    if healthy && !was_healthy {
                        last_poll = self.poll(FetchMode::Deduped).await;
                    }
                }
                trigger = triggers.recv() => match trigger {
                    Some(trigger) => {
                        debug!(key = %self.key, ?trigger, "Revalidation requested");
                        last_poll = self.poll(trigger.mode()).await;
                    }
                    None => break,
                },
                received = broadcast_rx.recv(), if broadcast_open => match received {
                    Ok(trigger) => last_poll = self.poll(trigger.mode()).await,
                    Err(broadcast::error::RecvError::Lagged(_)) => {
                        last_poll = self.poll(FetchMode::Deduped).await;
                    }
                    Err(broadcast::error::RecvError::Closed) => broadcast_open = false,
                },
                _ = revalidate.notified() => {
                    last_poll = self.poll(FetchMode::Forced).await;
                }
            }
        }
        debug!(key = %self.key, "Poller stopped");
    }

    /// Run one fetch through the store gate; returns when it was attempted.
    async fn poll(&self, mode: FetchMode) -> Instant {
        let attempted_at = Instant::now();
        let Some(ticket) = self.store.begin_fetch(&self.key, mode) else {
            return attempted_at;
        };
        let mut inflight = InflightFetch {
            store: &self.store,
            ticket: Some(ticket),
        };

        let result = self.fetch_with_retry().await;
        if let Err(error) = &result {
            warn!(key = %self.key, error = %error, "Fetch failed");
        }
        if let Some(ticket) = inflight.ticket.take() {
            self.store.complete_fetch(ticket, result);
        }
        attempted_at
    }

    async fn fetch_with_retry(&self) -> Result<Value, FetchError> {
        let mut attempt = 0;
        loop {
            match self.fetcher.fetch(&self.key).await {
                Ok(value) => return Ok(value),
                Err(error) if error.is_transient() && attempt < self.policy.error_retry_count => {
                    let delay = self.policy.retry_delay(attempt);
                    debug!(
                        key = %self.key,
                        attempt = attempt + 1,
                        delay_ms = delay.as_millis() as u64,
                        error = %error,
                        "Transient fetch error, retrying"
                    );
                    sleep(delay).await;
                    attempt += 1;
                }
                Err(error) => return Err(error),
            }
        }
    }
}
