//! Typed, mounted view of one cache key.

use crate::runtime::Mount;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::debug;
use vitrine_cache::{CacheEntry, MutationOutcome, OptimisticMutationManager, Revalidate};
use vitrine_core::{EntityType, FetchError, MutationError};

/// What to keep in sync under a cache key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollectionSpec {
    pub key: String,
    /// `(entity_type, scope)` for the push channel; polling only when absent.
    pub push: Option<(EntityType, String)>,
    /// Follow this key into the durable store.
    pub persist: bool,
}

impl CollectionSpec {
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            push: None,
            persist: true,
        }
    }

    pub fn with_push(mut self, entity_type: EntityType, scope: impl Into<String>) -> Self {
        self.push = Some((entity_type, scope.into()));
        self
    }

    pub fn without_persistence(mut self) -> Self {
        self.persist = false;
        self
    }
}

/// A consumer's handle on a synchronized collection.
///
/// Every consumer mounting the same key shares one poller and one push
/// subscription; both stop when the last `Collection` is dropped.
pub struct Collection<T> {
    mount: Arc<Mount>,
    rx: watch::Receiver<CacheEntry>,
    mutations: OptimisticMutationManager,
    _marker: PhantomData<fn() -> T>,
}

impl<T: DeserializeOwned> Collection<T> {
    pub(crate) fn new(mount: Arc<Mount>, mutations: OptimisticMutationManager) -> Self {
        let rx = mutations.store().subscribe(mount.key());
        Self {
            mount,
            rx,
            mutations,
            _marker: PhantomData,
        }
    }

    pub fn key(&self) -> &str {
        self.mount.key()
    }

    /// Current raw entry.
    pub fn entry(&self) -> CacheEntry {
        self.rx.borrow().clone()
    }

    /// Decoded value, `None` while nothing is cached or the payload does not decode.
    pub fn data(&self) -> Option<T> {
        let entry = self.rx.borrow();
        let value = entry.value.clone()?;
        match serde_json::from_value(value) {
            Ok(decoded) => Some(decoded),
            Err(e) => {
                debug!(key = %entry.key, error = %e, "Cached value does not decode");
                None
            }
        }
    }

    /// True until the network has answered once, even with seeded data shown.
    pub fn is_loading(&self) -> bool {
        self.rx.borrow().is_loading()
    }

    pub fn is_validating(&self) -> bool {
        self.rx.borrow().is_validating
    }

    pub fn error(&self) -> Option<FetchError> {
        self.rx.borrow().error.clone()
    }

    pub fn is_push_backed(&self) -> bool {
        self.mount.is_push_backed()
    }

    /// False once the runtime has shut down.
    pub fn is_polling(&self) -> bool {
        self.mount.is_polling()
    }

    /// Revalidate now, bypassing the dedup window.
    pub fn refresh(&self) {
        self.mount.revalidate(Revalidate::Manual);
    }

    /// Apply `updater` locally, then confirm with `remote` or roll back.
    pub async fn mutate<U, F>(&self, updater: U, remote: F) -> Result<MutationOutcome, MutationError>
    where
        U: FnOnce(Option<&Value>) -> Option<Value>,
        F: Future<Output = Result<Option<Value>, MutationError>>,
    {
        self.mutations.mutate(self.mount.key(), updater, remote).await
    }

    /// Wait for the next write to this key; `false` once the store is gone.
    pub async fn changed(&mut self) -> bool {
        self.rx.changed().await.is_ok()
    }
}

impl<T> std::fmt::Debug for Collection<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Collection")
            .field("key", &self.mount.key())
            .finish_non_exhaustive()
    }
}
