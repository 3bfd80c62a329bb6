//! Push transport abstraction and wire frames.

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use vitrine_core::{identity_of, ChangeEvent, ChangeOp, ChannelError, EntityType};

/// Frames buffered per open channel before the transport applies backpressure.
pub const FRAME_BUFFER: usize = 64;

/// Lifecycle of one channel subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    Connecting,
    Subscribed,
    Error,
    Closed,
}

impl SubscriptionStatus {
    pub fn as_db_str(&self) -> &'static str {
        match self {
            SubscriptionStatus::Connecting => "connecting",
            SubscriptionStatus::Subscribed => "subscribed",
            SubscriptionStatus::Error => "error",
            SubscriptionStatus::Closed => "closed",
        }
    }
}

impl fmt::Display for SubscriptionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_db_str())
    }
}

/// Row change as the backing store reports it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawChange {
    #[serde(alias = "eventType")]
    pub event_type: String,
    #[serde(default)]
    pub new: Option<Value>,
    #[serde(default)]
    pub old: Option<Value>,
}

impl RawChange {
    pub fn new(event_type: impl Into<String>, new: Option<Value>, old: Option<Value>) -> Self {
        Self {
            event_type: event_type.into(),
            new,
            old,
        }
    }

    /// Translate into a [`ChangeEvent`] for `entity_type`.
    ///
    /// Deletes carry the old row; inserts and updates carry the new one. The
    /// identity is read from whichever row is present.
    pub fn into_change_event(
        self,
        channel: &str,
        entity_type: EntityType,
        identity_field: &str,
    ) -> Result<ChangeEvent, ChannelError> {
        let decode = |reason: String| ChannelError::Decode {
            channel: channel.to_string(),
            reason,
        };
        let op: ChangeOp = self
            .event_type
            .parse()
            .map_err(|e: vitrine_core::ChangeOpParseError| decode(e.to_string()))?;

        let key = self
            .new
            .as_ref()
            .and_then(|row| identity_of(row, identity_field))
            .or_else(|| {
                self.old
                    .as_ref()
                    .and_then(|row| identity_of(row, identity_field))
            })
            .ok_or_else(|| decode(format!("change carries no `{}` field", identity_field)))?;

        let payload = match op {
            ChangeOp::Delete => self.old.unwrap_or(Value::Null),
            ChangeOp::Insert | ChangeOp::Update => self.new.unwrap_or(Value::Null),
        };
        let source_timestamp = payload
            .get("updated_at")
            .and_then(|v| v.as_str())
            .and_then(|s| chrono::DateTime::parse_from_rfc3339(s).ok())
            .map(|dt| dt.with_timezone(&chrono::Utc))
            .unwrap_or_else(chrono::Utc::now);

        Ok(ChangeEvent::new(entity_type, key, op, payload, source_timestamp))
    }
}

/// One message from an open channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum TransportFrame {
    Status(SubscriptionStatus),
    Change(RawChange),
}

/// Opens filtered change channels against the backing store.
#[async_trait]
pub trait PushTransport: Send + Sync {
    /// Open `channel` restricted to rows matching `filter`.
    ///
    /// The receiver ends when the connection drops.
    async fn open(
        &self,
        channel: &str,
        filter: &str,
    ) -> Result<mpsc::Receiver<TransportFrame>, ChannelError>;
}

/// Builds the transport the first time a subscription is opened.
pub type TransportFactory =
    Box<dyn Fn() -> Result<Arc<dyn PushTransport>, ChannelError> + Send + Sync>;

// ============================================================================
// IN-MEMORY TRANSPORT
// ============================================================================

/// In-process transport driven by the caller.
///
/// Every `open` acknowledges with [`SubscriptionStatus::Subscribed`] unless
/// opens are set to fail.
#[derive(Debug, Default)]
pub struct MemoryPushTransport {
    channels: DashMap<String, Vec<mpsc::Sender<TransportFrame>>>,
    opens: DashMap<String, usize>,
    total_opens: AtomicUsize,
    failing_opens: AtomicUsize,
}

impl MemoryPushTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total `open` calls, successful or not.
    pub fn open_count(&self) -> usize {
        self.total_opens.load(Ordering::SeqCst)
    }

    pub fn open_count_for(&self, channel: &str) -> usize {
        self.opens.get(channel).map(|n| *n).unwrap_or(0)
    }

    /// Channels with at least one live receiver.
    pub fn live_channels(&self) -> Vec<String> {
        let mut live: Vec<String> = self
            .channels
            .iter()
            .filter(|entry| entry.value().iter().any(|tx| !tx.is_closed()))
            .map(|entry| entry.key().clone())
            .collect();
        live.sort();
        live
    }

    /// Make the next `n` opens fail.
    pub fn fail_next_opens(&self, n: usize) {
        self.failing_opens.store(n, Ordering::SeqCst);
    }

    /// Deliver `frame` to every receiver of `channel`; returns how many got it.
    pub fn emit(&self, channel: &str, frame: TransportFrame) -> usize {
        let senders = self
            .channels
            .get(channel)
            .map(|list| list.clone())
            .unwrap_or_default();
        senders
            .iter()
            .filter(|tx| tx.try_send(frame.clone()).is_ok())
            .count()
    }

    /// Drop every connection on `channel`, as a network failure would.
    pub fn disconnect(&self, channel: &str) {
        self.channels.remove(channel);
    }
}

#[async_trait]
impl PushTransport for MemoryPushTransport {
    async fn open(
        &self,
        channel: &str,
        _filter: &str,
    ) -> Result<mpsc::Receiver<TransportFrame>, ChannelError> {
        self.total_opens.fetch_add(1, Ordering::SeqCst);
        *self.opens.entry(channel.to_string()).or_insert(0) += 1;

        let failing = self
            .failing_opens
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(ChannelError::Connect {
                channel: channel.to_string(),
                reason: "simulated connect failure".to_string(),
            });
        }

        let (tx, rx) = mpsc::channel(FRAME_BUFFER);
        let _ = tx.try_send(TransportFrame::Status(SubscriptionStatus::Subscribed));
        self.channels.entry(channel.to_string()).or_default().push(tx);
        Ok(rx)
    }
}
