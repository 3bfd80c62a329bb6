//! Vitrine Core - Shared Types
//!
//! Data types shared by every Vitrine crate: entity identity, domain records,
//! change events, the error taxonomy and client configuration.
//! This crate contains no I/O beyond config file loading.

pub mod config;
pub mod entities;
pub mod error;
pub mod event;
pub mod health;
pub mod identity;

pub use config::{
    ApiConfig, AuthConfig, ChatConfig, ConfigError, HasherPreference, MutationConfig,
    PersistenceBackend, PersistenceConfig, PollingConfig, ReconnectConfig, SyncConfig,
};
pub use entities::{EntityType, Order, OrderStatus, OrderStatusParseError};
pub use error::{
    ChannelError, ChatError, FetchError, MutationError, VitrineError, VitrineResult,
};
pub use event::{ChangeEvent, ChangeOp, ChangeOpParseError};
pub use health::{HealthCheck, HealthReport, HealthStatus};
pub use identity::{identity_of, new_entity_id, EntityId, Timestamp, DEFAULT_IDENTITY_FIELD};
