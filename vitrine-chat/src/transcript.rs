//! Message transcripts and read receipts.
//!
//! Messages are only marked read through a [`ViewingGuard`], which exists
//! only while a participant is looking at an open session. Previews and
//! notification badges read the transcript without touching receipts.

use crate::session::{ChatSession, ChatSide};
use serde::{Deserialize, Serialize};
use vitrine_core::{ChatError, Timestamp};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Sender {
    Customer,
    Admin,
    System,
}

impl Sender {
    /// Side whose read receipt this message waits for.
    ///
    /// System notices are addressed to the customer.
    pub fn recipient(&self) -> ChatSide {
        match self {
            Sender::Customer => ChatSide::Admin,
            Sender::Admin | Sender::System => ChatSide::Customer,
        }
    }
}

impl From<ChatSide> for Sender {
    fn from(side: ChatSide) -> Self {
        match side {
            ChatSide::Customer => Sender::Customer,
            ChatSide::Admin => Sender::Admin,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub session_id: String,
    pub sender: Sender,
    pub body: String,
    pub created_at: Timestamp,
    #[serde(default)]
    pub is_read: bool,
    #[serde(default)]
    pub read_at: Option<Timestamp>,
}

impl Message {
    pub fn new(
        id: impl Into<String>,
        session_id: impl Into<String>,
        sender: Sender,
        body: impl Into<String>,
        created_at: Timestamp,
    ) -> Self {
        Self {
            id: id.into(),
            session_id: session_id.into(),
            sender,
            body: body.into(),
            created_at,
            is_read: false,
            read_at: None,
        }
    }

    fn is_unread_for(&self, side: ChatSide) -> bool {
        !self.is_read && self.sender.recipient() == side
    }
}

/// Messages of one session, oldest first.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Transcript {
    session_id: String,
    messages: Vec<Message>,
}

impl Transcript {
    pub fn new(session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            messages: Vec::new(),
        }
    }

    /// Build from stored messages in any order.
    ///
    /// Stored rows may share a timestamp (second-precision backends, system
    /// notices); ties are ordered by id. Only [`Transcript::append`] enforces
    /// strictly increasing timestamps.
    pub fn from_messages(
        session_id: impl Into<String>,
        mut messages: Vec<Message>,
    ) -> Result<Self, ChatError> {
        let session_id = session_id.into();
        if let Some(stray) = messages.iter().find(|m| m.session_id != session_id) {
            return Err(ChatError::SessionNotFound {
                session_id: stray.session_id.clone(),
            });
        }
        messages.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(Self {
            session_id,
            messages,
        })
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn last_created_at(&self) -> Option<Timestamp> {
        self.messages.last().map(|m| m.created_at)
    }

    /// Append a message strictly after the current last one.
    pub fn append(&mut self, message: Message) -> Result<(), ChatError> {
        if message.session_id != self.session_id {
            return Err(ChatError::SessionNotFound {
                session_id: message.session_id,
            });
        }
        if self
            .last_created_at()
            .is_some_and(|last| message.created_at <= last)
        {
            return Err(ChatError::OutOfOrder {
                session_id: self.session_id.clone(),
            });
        }
        self.messages.push(message);
        Ok(())
    }

    /// Last `limit` messages, for list previews. Never marks anything read.
    pub fn preview(&self, limit: usize) -> &[Message] {
        let start = self.messages.len().saturating_sub(limit);
        &self.messages[start..]
    }

    pub fn unread_count(&self, side: ChatSide) -> usize {
        self.messages
            .iter()
            .filter(|m| m.is_unread_for(side))
            .count()
    }

    /// Start viewing as `side`; refused for closed sessions.
    pub fn begin_viewing<'a>(
        &'a mut self,
        session: &ChatSession,
        side: ChatSide,
    ) -> Result<ViewingGuard<'a>, ChatError> {
        if session.id != self.session_id {
            return Err(ChatError::SessionNotFound {
                session_id: session.id.clone(),
            });
        }
        session.ensure_writable()?;
        Ok(ViewingGuard {
            transcript: self,
            side,
        })
    }
}

/// Proof that `side` is actively viewing the session.
#[derive(Debug)]
pub struct ViewingGuard<'a> {
    transcript: &'a mut Transcript,
    side: ChatSide,
}

impl ViewingGuard<'_> {
    pub fn side(&self) -> ChatSide {
        self.side
    }

    /// Ids of messages this side has not read yet.
    pub fn unread_ids(&self) -> Vec<String> {
        self.transcript
            .messages
            .iter()
            .filter(|m| m.is_unread_for(self.side))
            .map(|m| m.id.clone())
            .collect()
    }

    /// Mark every message addressed to this side read; returns how many changed.
    pub fn mark_all_read(&mut self, at: Timestamp) -> usize {
        let side = self.side;
        let mut marked = 0;
        for message in self
            .transcript
            .messages
            .iter_mut()
            .filter(|m| m.is_unread_for(side))
        {
            message.is_read = true;
            message.read_at = Some(at);
            marked += 1;
        }
        marked
    }
}
