//! Chat session lifecycle.
//!
//! ```text
//! Pending --accept--> Active --close--> Closed (+ one rating)
//!    \------------------close-----------^
//! ```

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use vitrine_core::{ChatError, Timestamp};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChatStatus {
    Pending,
    Active,
    Closed,
}

impl ChatStatus {
    pub fn as_db_str(&self) -> &'static str {
        match self {
            ChatStatus::Pending => "pending",
            ChatStatus::Active => "active",
            ChatStatus::Closed => "closed",
        }
    }

    pub fn from_db_str(s: &str) -> Result<Self, ChatStatusParseError> {
        match s.to_lowercase().as_str() {
            "pending" | "waiting" => Ok(ChatStatus::Pending),
            "active" => Ok(ChatStatus::Active),
            "closed" => Ok(ChatStatus::Closed),
            _ => Err(ChatStatusParseError(s.to_string())),
        }
    }

    /// Whether `self -> next` is a legal transition.
    pub fn can_transition_to(&self, next: ChatStatus) -> bool {
        matches!(
            (self, next),
            (ChatStatus::Pending, ChatStatus::Active)
                | (ChatStatus::Pending, ChatStatus::Closed)
                | (ChatStatus::Active, ChatStatus::Closed)
        )
    }
}

impl fmt::Display for ChatStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_db_str())
    }
}

impl FromStr for ChatStatus {
    type Err = ChatStatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_db_str(s)
    }
}

/// Error when parsing an unknown chat status.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatStatusParseError(pub String);

impl fmt::Display for ChatStatusParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Invalid chat status: {}", self.0)
    }
}

impl std::error::Error for ChatStatusParseError {}

/// Which participant is acting or viewing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChatSide {
    Customer,
    Admin,
}

impl ChatSide {
    pub fn as_db_str(&self) -> &'static str {
        match self {
            ChatSide::Customer => "customer",
            ChatSide::Admin => "admin",
        }
    }

    pub fn other(&self) -> ChatSide {
        match self {
            ChatSide::Customer => ChatSide::Admin,
            ChatSide::Admin => ChatSide::Customer,
        }
    }
}

/// Result of attaching a rating to a closed session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RatingOutcome {
    Attached,
    /// A rating was already attached; nothing changed.
    AlreadyRated,
}

pub const MIN_RATING: u8 = 1;
pub const MAX_RATING: u8 = 5;

/// A support conversation between one customer and at most one admin.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatSession {
    pub id: String,
    pub customer_ref: String,
    pub status: ChatStatus,
    /// Assigned admin, set on accept.
    #[serde(default)]
    pub participant_ref: Option<String>,
    #[serde(default)]
    pub last_message_at: Option<Timestamp>,
    #[serde(default)]
    pub unread_customer: u32,
    #[serde(default)]
    pub unread_admin: u32,
    #[serde(default)]
    pub rating: Option<u8>,
    pub created_at: Timestamp,
    #[serde(default)]
    pub closed_at: Option<Timestamp>,
}

impl ChatSession {
    pub fn new(id: impl Into<String>, customer_ref: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            customer_ref: customer_ref.into(),
            status: ChatStatus::Pending,
            participant_ref: None,
            last_message_at: None,
            unread_customer: 0,
            unread_admin: 0,
            rating: None,
            created_at: Utc::now(),
            closed_at: None,
        }
    }

    fn invalid(&self, to: ChatStatus) -> ChatError {
        ChatError::InvalidTransition {
            from: self.status.to_string(),
            to: to.to_string(),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.status == ChatStatus::Closed
    }

    /// Assign `admin_ref` and activate.
    ///
    /// Re-accepting by the same admin is a no-op; a different admin is
    /// rejected while one is assigned.
    pub fn accept(&mut self, admin_ref: &str) -> Result<(), ChatError> {
        match self.status {
            ChatStatus::Pending => {
                self.status = ChatStatus::Active;
                self.participant_ref = Some(admin_ref.to_string());
                Ok(())
            }
            ChatStatus::Active => match self.participant_ref.as_deref() {
                Some(current) if current == admin_ref => Ok(()),
                Some(current) => Err(ChatError::AlreadyAssigned {
                    session_id: self.id.clone(),
                    assigned: current.to_string(),
                }),
                None => {
                    self.participant_ref = Some(admin_ref.to_string());
                    Ok(())
                }
            },
            ChatStatus::Closed => Err(self.invalid(ChatStatus::Active)),
        }
    }

    pub fn close(&mut self) -> Result<(), ChatError> {
        if !self.status.can_transition_to(ChatStatus::Closed) {
            return Err(ChatError::SessionClosed {
                session_id: self.id.clone(),
            });
        }
        self.status = ChatStatus::Closed;
        self.closed_at = Some(Utc::now());
        Ok(())
    }

    /// Attach the customer's rating; only once, only after close.
    pub fn attach_rating(&mut self, rating: u8) -> Result<RatingOutcome, ChatError> {
        if !(MIN_RATING..=MAX_RATING).contains(&rating) {
            return Err(ChatError::InvalidRating { rating });
        }
        if !self.is_closed() {
            return Err(ChatError::InvalidTransition {
                from: self.status.to_string(),
                to: "rated".to_string(),
            });
        }
        if self.rating.is_some() {
            return Ok(RatingOutcome::AlreadyRated);
        }
        self.rating = Some(rating);
        Ok(RatingOutcome::Attached)
    }

    /// Whether `side` may post a message now.
    pub fn ensure_writable(&self) -> Result<(), ChatError> {
        if self.is_closed() {
            return Err(ChatError::SessionClosed {
                session_id: self.id.clone(),
            });
        }
        Ok(())
    }

    /// Account for a new message sent by `from` at `at`.
    pub fn record_message(&mut self, from: ChatSide, at: Timestamp) {
        self.last_message_at = Some(at);
        match from.other() {
            ChatSide::Customer => self.unread_customer += 1,
            ChatSide::Admin => self.unread_admin += 1,
        }
    }

    pub fn unread_for(&self, side: ChatSide) -> u32 {
        match side {
            ChatSide::Customer => self.unread_customer,
            ChatSide::Admin => self.unread_admin,
        }
    }

    pub fn clear_unread(&mut self, side: ChatSide) {
        match side {
            ChatSide::Customer => self.unread_customer = 0,
            ChatSide::Admin => self.unread_admin = 0,
        }
    }
}
