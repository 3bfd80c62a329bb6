//! Typing indicator side channel.
//!
//! Typing flags never go through the cache. The typist's [`TypingNotifier`]
//! publishes `true` on keystrokes and `false` after a quiet period; the other
//! side's [`TypingWatcher`] polls the channel and treats a flag older than the
//! quiet period as expired, so a lost stop signal cannot stick.

use crate::session::ChatSide;
use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::debug;
use vitrine_core::ChannelError;

/// Last published typing flag and how long ago it was written.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TypingSignal {
    pub typing: bool,
    pub age: Duration,
}

#[async_trait]
pub trait TypingChannel: Send + Sync {
    async fn publish(&self, session_id: &str, side: ChatSide, typing: bool)
        -> Result<(), ChannelError>;

    async fn read(&self, session_id: &str, side: ChatSide)
        -> Result<Option<TypingSignal>, ChannelError>;
}

/// Process-local typing channel.
#[derive(Debug, Default)]
pub struct MemoryTypingChannel {
    flags: DashMap<(String, ChatSide), (bool, Instant)>,
}

impl MemoryTypingChannel {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TypingChannel for MemoryTypingChannel {
    async fn publish(
        &self,
        session_id: &str,
        side: ChatSide,
        typing: bool,
    ) -> Result<(), ChannelError> {
        self.flags
            .insert((session_id.to_string(), side), (typing, Instant::now()));
        Ok(())
    }

    async fn read(
        &self,
        session_id: &str,
        side: ChatSide,
    ) -> Result<Option<TypingSignal>, ChannelError> {
        Ok(self
            .flags
            .get(&(session_id.to_string(), side))
            .map(|flag| TypingSignal {
                typing: flag.0,
                age: flag.1.elapsed(),
            }))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TypingInput {
    Keystroke,
    Stop,
}

/// Publishes this side's typing state with a debounced stop.
#[derive(Debug)]
pub struct TypingNotifier {
    input: mpsc::UnboundedSender<TypingInput>,
    task: JoinHandle<()>,
}

impl TypingNotifier {
    pub fn spawn(
        channel: Arc<dyn TypingChannel>,
        session_id: impl Into<String>,
        side: ChatSide,
        quiet_period: Duration,
    ) -> Self {
        let (input, rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(run_notifier(channel, session_id.into(), side, quiet_period, rx));
        Self { input, task }
    }

    /// A key was pressed.
    pub fn keystroke(&self) {
        let _ = self.input.send(TypingInput::Keystroke);
    }

    /// Stop immediately, e.g. after the message was sent.
    pub fn stop(&self) {
        let _ = self.input.send(TypingInput::Stop);
    }
}

impl Drop for TypingNotifier {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn publish(channel: &dyn TypingChannel, session_id: &str, side: ChatSide, typing: bool) {
    if let Err(e) = channel.publish(session_id, side, typing).await {
        debug!(session_id = %session_id, error = %e, "Typing publish failed");
    }
}

async fn run_notifier(
    channel: Arc<dyn TypingChannel>,
    session_id: String,
    side: ChatSide,
    quiet_period: Duration,
    mut rx: mpsc::UnboundedReceiver<TypingInput>,
) {
    // Idle: wait for the first keystroke.
    while let Some(input) = rx.recv().await {
        if input == TypingInput::Stop {
            continue;
        }
        publish(channel.as_ref(), &session_id, side, true).await;

        // Typing: every keystroke refreshes the flag and pushes the stop out.
        let mut deadline = Instant::now() + quiet_period;
        loop {
            tokio::select! {
                input = rx.recv() => match input {
                    Some(TypingInput::Keystroke) => {
                        publish(channel.as_ref(), &session_id, side, true).await;
                        deadline = Instant::now() + quiet_period;
                    }
                    Some(TypingInput::Stop) => break,
                    None => {
                        publish(channel.as_ref(), &session_id, side, false).await;
                        return;
                    }
                },
                _ = tokio::time::sleep_until(deadline) => break,
            }
        }
        publish(channel.as_ref(), &session_id, side, false).await;
    }
}

/// Watches the other side's typing flag.
#[derive(Debug)]
pub struct TypingWatcher {
    state: watch::Receiver<bool>,
    task: JoinHandle<()>,
}

impl TypingWatcher {
    pub fn spawn(
        channel: Arc<dyn TypingChannel>,
        session_id: impl Into<String>,
        watched: ChatSide,
        poll_interval: Duration,
        quiet_period: Duration,
    ) -> Self {
        let session_id = session_id.into();
        let (tx, state) = watch::channel(false);
        let task = tokio::spawn(async move {
            let mut interval = tokio::time::interval(poll_interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                let typing = match channel.read(&session_id, watched).await {
                    Ok(Some(signal)) => signal.typing && signal.age < quiet_period,
                    Ok(None) => false,
                    Err(e) => {
                        debug!(session_id = %session_id, error = %e, "Typing read failed");
                        false
                    }
                };
                tx.send_if_modified(|current| {
                    let changed = *current != typing;
                    *current = typing;
                    changed
                });
            }
        });
        Self { state, task }
    }

    pub fn is_typing(&self) -> bool {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.state.clone()
    }
}

impl Drop for TypingWatcher {
    fn drop(&mut self) {
        self.task.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const QUIET: Duration = Duration::from_secs(3);

    async fn flag(channel: &MemoryTypingChannel) -> Option<bool> {
        channel
            .read("s1", ChatSide::Customer)
            .await
            .expect("memory read should succeed")
            .map(|s| s.typing)
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_is_debounced_after_last_keystroke() {
        let channel = Arc::new(MemoryTypingChannel::new());
        let notifier = TypingNotifier::spawn(channel.clone(), "s1", ChatSide::Customer, QUIET);

        notifier.keystroke();
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(flag(&channel).await, Some(true));

        notifier.keystroke();
        tokio::time::sleep(Duration::from_secs(2)).await;
        // 4 s after the first keystroke but only 2 s after the last one.
        assert_eq!(flag(&channel).await, Some(true));

        tokio::time::sleep(Duration::from_millis(1_500)).await;
        assert_eq!(flag(&channel).await, Some(false));
    }

    #[tokio::test(start_paused = true)]
    async fn test_explicit_stop_publishes_false() {
        let channel = Arc::new(MemoryTypingChannel::new());
        let notifier = TypingNotifier::spawn(channel.clone(), "s1", ChatSide::Customer, QUIET);

        notifier.keystroke();
        tokio::time::sleep(Duration::from_millis(100)).await;
        notifier.stop();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(flag(&channel).await, Some(false));
    }

    #[tokio::test(start_paused = true)]
    async fn test_watcher_expires_stale_flag() {
        let channel = Arc::new(MemoryTypingChannel::new());
        channel
            .publish("s1", ChatSide::Customer, true)
            .await
            .expect("publish should succeed");

        let watcher = TypingWatcher::spawn(
            channel.clone(),
            "s1",
            ChatSide::Customer,
            Duration::from_secs(1),
            QUIET,
        );
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(watcher.is_typing());

        // The stop signal is lost; the flag still expires.
        tokio::time::sleep(Duration::from_secs(4)).await;
        assert!(!watcher.is_typing());
    }

    #[tokio::test(start_paused = true)]
    async fn test_watcher_ignores_own_side() {
        let channel = Arc::new(MemoryTypingChannel::new());
        channel
            .publish("s1", ChatSide::Admin, true)
            .await
            .expect("publish should succeed");
        let watcher = TypingWatcher::spawn(
            channel,
            "s1",
            ChatSide::Customer,
            Duration::from_secs(1),
            QUIET,
        );
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(!watcher.is_typing());
    }
}
