//! Vitrine Realtime - Push Channels and Network Collaborators
//!
//! - [`PushSubscriber`]: one ref-counted channel per `(entity_type, scope)`
//! - [`PushTransport`]: pluggable transport ([`WsPushTransport`], [`MemoryPushTransport`])
//! - [`ScopeHasher`]: channel-name hashing strategy
//! - [`RestClient`]: snapshot fetcher and mutation endpoint over HTTP

pub mod hasher;
pub mod http;
pub mod subscriber;
pub mod transport;
pub mod ws;

pub use hasher::{select_hasher, Fnv1aScopeHasher, ScopeHasher, Sha256ScopeHasher};
pub use http::{collection_path, HttpClientError, RestClient};
pub use subscriber::{PushSubscriber, ScopeKey, SubscriptionHandle};
pub use transport::{
    MemoryPushTransport, PushTransport, RawChange, SubscriptionStatus, TransportFactory,
    TransportFrame,
};
pub use ws::WsPushTransport;
