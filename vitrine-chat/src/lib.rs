//! Vitrine Chat - Support Chat Sessions
//!
//! - [`ChatSession`]: Pending -> Active -> Closed lifecycle with a one-shot rating
//! - [`Transcript`]: strictly ordered messages, read only through a [`ViewingGuard`]
//! - [`TypingNotifier`] / [`TypingWatcher`]: debounced typing side channel
//! - [`ChatService`]: optimistic transitions through the shared cache

pub mod service;
pub mod session;
pub mod transcript;
pub mod typing;

pub use service::{messages_key, sessions_key, ChatService, ChatViewer};
pub use session::{
    ChatSession, ChatSide, ChatStatus, ChatStatusParseError, RatingOutcome, MAX_RATING, MIN_RATING,
};
pub use transcript::{Message, Sender, Transcript, ViewingGuard};
pub use typing::{MemoryTypingChannel, TypingChannel, TypingNotifier, TypingSignal, TypingWatcher};
