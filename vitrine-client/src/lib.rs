//! Vitrine Client - Consumer Facade
//!
//! Hosts build one [`SyncRuntime`] from a [`vitrine_core::SyncConfig`] and
//! mount typed [`Collection`]s on it. The runtime owns the cache, the push
//! subscriber, the pollers and the durable snapshot bridge.

pub mod collection;
pub mod runtime;
pub mod telemetry;

pub use collection::{Collection, CollectionSpec};
pub use runtime::{tracking_key, Mount, SyncRuntime, SyncRuntimeBuilder};
pub use telemetry::{init_tracing, TelemetryConfig};

pub use vitrine_cache::{MutationOutcome, Revalidate};
pub use vitrine_core::{SyncConfig, VitrineError, VitrineResult};
