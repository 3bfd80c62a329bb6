//! Error types for Vitrine operations
//!
//! Each class of failure has its own recovery policy:
//! - [`FetchError`] is retried by the poller and only surfaced as a soft flag.
//! - [`MutationError`] is always surfaced to the caller after rollback.
//! - [`ChannelError`] triggers reconnect and degrades to polling.
//! - [`ChatError`] rejects invalid session transitions.

use crate::config::ConfigError;
use std::time::Duration;
use thiserror::Error;

/// Snapshot fetch errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FetchError {
    #[error("Network error fetching {key}: {reason}")]
    Network { key: String, reason: String },

    #[error("Fetching {key} failed with status {status}: {body}")]
    Status {
        key: String,
        status: u16,
        body: String,
    },

    #[error("Invalid snapshot payload for {key}: {reason}")]
    Decode { key: String, reason: String },

    #[error("Fetch for {key} timed out after {after:?}")]
    Timeout { key: String, after: Duration },
}

impl FetchError {
    /// Whether the poller should retry this failure before surfacing it.
    pub fn is_transient(&self) -> bool {
        match self {
            FetchError::Network { .. } | FetchError::Timeout { .. } => true,
            FetchError::Status { status, .. } => *status >= 500 || *status == 429,
            FetchError::Decode { .. } => false,
        }
    }
}

/// Remote mutation errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum MutationError {
    #[error("Mutation rejected with status {status}: {message}")]
    Rejected { status: u16, message: String },

    #[error("Mutation timed out after {after:?}")]
    Timeout { after: Duration },

    #[error("Mutation transport failed: {reason}")]
    Transport { reason: String },

    #[error("Mutation rolled back because another mutation in the batch failed")]
    BatchAborted,

    #[error("Key {key} appears more than once in an independent batch")]
    DuplicateKey { key: String },
}

/// Push channel errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ChannelError {
    #[error("Push transport unavailable: {reason}")]
    Unavailable { reason: String },

    #[error("Failed to connect channel {channel}: {reason}")]
    Connect { channel: String, reason: String },

    #[error("Channel {channel} closed: {reason}")]
    Closed { channel: String, reason: String },

    #[error("Undecodable frame on channel {channel}: {reason}")]
    Decode { channel: String, reason: String },
}

/// Support chat errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ChatError {
    #[error("Invalid chat transition from {from} to {to}")]
    InvalidTransition { from: String, to: String },

    #[error("Chat session {session_id} is closed")]
    SessionClosed { session_id: String },

    #[error("Chat session {session_id} is already assigned to {assigned}")]
    AlreadyAssigned {
        session_id: String,
        assigned: String,
    },

    #[error("Chat session {session_id} not found")]
    SessionNotFound { session_id: String },

    #[error("Message in session {session_id} is not after the previous message")]
    OutOfOrder { session_id: String },

    #[error("Invalid rating {rating}: must be between 1 and 5")]
    InvalidRating { rating: u8 },

    #[error("Chat payload could not be encoded: {reason}")]
    Encode { reason: String },

    #[error("Chat mutation failed: {0}")]
    Mutation(#[from] MutationError),
}

/// Master error type for all Vitrine errors.
#[derive(Debug, Error)]
pub enum VitrineError {
    #[error("Fetch error: {0}")]
    Fetch(#[from] FetchError),

    #[error("Mutation error: {0}")]
    Mutation(#[from] MutationError),

    #[error("Channel error: {0}")]
    Channel(#[from] ChannelError),

    #[error("Chat error: {0}")]
    Chat(#[from] ChatError),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    #[error("Persistence error: {reason}")]
    Persist { reason: String },

    #[error("Transport setup error: {reason}")]
    Transport { reason: String },

    #[error("Telemetry error: {reason}")]
    Telemetry { reason: String },
}

/// Result type alias for Vitrine operations.
pub type VitrineResult<T> = Result<T, VitrineError>;

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fetch_error_transient_classification() {
        let network = FetchError::Network {
            key: "orders".to_string(),
            reason: "connection reset".to_string(),
        };
        assert!(network.is_transient());

        let server = FetchError::Status {
            key: "orders".to_string(),
            status: 503,
            body: String::new(),
        };
        assert!(server.is_transient());

        let throttled = FetchError::Status {
            key: "orders".to_string(),
            status: 429,
            body: String::new(),
        };
        assert!(throttled.is_transient());

        let forbidden = FetchError::Status {
            key: "orders".to_string(),
            status: 403,
            body: "forbidden".to_string(),
        };
        assert!(!forbidden.is_transient());

        let decode = FetchError::Decode {
            key: "orders".to_string(),
            reason: "expected array".to_string(),
        };
        assert!(!decode.is_transient());
    }

    #[test]
    fn test_mutation_error_display() {
        let err = MutationError::Rejected {
            status: 409,
            message: "order already shipped".to_string(),
        };
        let msg = format!("{}", err);
        assert!(msg.contains("409"));
        assert!(msg.contains("order already shipped"));

        let timeout = MutationError::Timeout {
            after: Duration::from_secs(10),
        };
        assert!(format!("{}", timeout).contains("timed out"));
    }

    #[test]
    fn test_chat_error_display_invalid_transition() {
        let err = ChatError::InvalidTransition {
            from: "Closed".to_string(),
            to: "Active".to_string(),
        };
        let msg = format!("{}", err);
        assert!(msg.contains("Closed"));
        assert!(msg.contains("Active"));
    }

    #[test]
    fn test_vitrine_error_from_variants() {
        let fetch = VitrineError::from(FetchError::Decode {
            key: "k".to_string(),
            reason: "bad".to_string(),
        });
        assert!(matches!(fetch, VitrineError::Fetch(_)));

        let mutation = VitrineError::from(MutationError::BatchAborted);
        assert!(matches!(mutation, VitrineError::Mutation(_)));

        let channel = VitrineError::from(ChannelError::Unavailable {
            reason: "no credentials".to_string(),
        });
        assert!(matches!(channel, VitrineError::Channel(_)));

        let chat = VitrineError::from(ChatError::InvalidRating { rating: 9 });
        assert!(matches!(chat, VitrineError::Chat(_)));
    }

    #[test]
    fn test_chat_error_wraps_mutation_error() {
        let err: ChatError = MutationError::Transport {
            reason: "offline".to_string(),
        }
        .into();
        assert!(matches!(err, ChatError::Mutation(_)));
    }
}
