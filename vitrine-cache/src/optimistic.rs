//! Optimistic mutations with snapshot rollback.
//!
//! The local updater is applied to the store before the remote call is
//! issued. On success the optimistic value stays (or the server's entity is
//! merged in); on failure or timeout the captured snapshot is put back as a
//! full replacement. Dropping a mutation future mid-flight also rolls back.

use crate::store::{CacheStore, OptimisticTicket, Settlement};
use async_trait::async_trait;
use futures_util::future::{join_all, BoxFuture};
use serde_json::Value;
use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};
use vitrine_core::MutationError;

/// A single mutation request for the remote endpoint.
#[derive(Debug, Clone, PartialEq)]
pub struct MutationCall {
    /// Endpoint path relative to the API base, e.g. `orders/<id>/status`.
    pub path: String,
    pub body: Value,
}

impl MutationCall {
    pub fn new(path: impl Into<String>, body: Value) -> Self {
        Self {
            path: path.into(),
            body,
        }
    }
}

/// Remote endpoint accepting mutations.
///
/// Returns the authoritative updated entity when the server provides one.
#[async_trait]
pub trait MutationEndpoint: Send + Sync {
    async fn submit(&self, call: MutationCall) -> Result<Option<Value>, MutationError>;
}

/// Successful mutation result.
#[derive(Debug, Clone, PartialEq)]
pub enum MutationOutcome {
    /// Optimistic value kept as-is.
    Confirmed,
    /// Server entity merged into the cached value.
    Merged(Value),
}

/// Batch failure policy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum BatchMode {
    /// Roll back only the entries whose calls failed.
    #[default]
    Independent,
    /// Roll back every entry if any call fails.
    AllOrNothing,
}

type Updater = Box<dyn FnOnce(Option<&Value>) -> Option<Value> + Send>;
type RemoteCall = BoxFuture<'static, Result<Option<Value>, MutationError>>;

/// One element of a batch mutation.
pub struct MutationRequest {
    pub key: String,
    pub updater: Updater,
    pub remote: RemoteCall,
}

impl MutationRequest {
    pub fn new<U, F>(key: impl Into<String>, updater: U, remote: F) -> Self
    where
        U: FnOnce(Option<&Value>) -> Option<Value> + Send + 'static,
        F: Future<Output = Result<Option<Value>, MutationError>> + Send + 'static,
    {
        Self {
            key: key.into(),
            updater: Box::new(updater),
            remote: Box::pin(remote),
        }
    }
}

impl std::fmt::Debug for MutationRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MutationRequest")
            .field("key", &self.key)
            .finish_non_exhaustive()
    }
}

/// Rolls back on drop unless settled.
struct PendingMutation<'a> {
    store: &'a CacheStore,
    ticket: Option<OptimisticTicket>,
}

impl<'a> PendingMutation<'a> {
    fn begin<F>(store: &'a CacheStore, key: &str, updater: F) -> Self
    where
        F: FnOnce(Option<&Value>) -> Option<Value>,
    {
        Self {
            store,
            ticket: Some(store.begin_optimistic(key, updater)),
        }
    }

    fn settle(mut self, settlement: Settlement) {
        if let Some(ticket) = self.ticket.take() {
            self.store.settle_optimistic(ticket, settlement);
        }
    }

    fn settle_result(
        self,
        result: Result<Option<Value>, MutationError>,
    ) -> Result<MutationOutcome, MutationError> {
        match result {
            Ok(None) => {
                self.settle(Settlement::Keep);
                Ok(MutationOutcome::Confirmed)
            }
            Ok(Some(entity)) => {
                self.settle(Settlement::MergeEntity(entity.clone()));
                Ok(MutationOutcome::Merged(entity))
            }
            Err(error) => {
                self.settle(Settlement::Restore);
                Err(error)
            }
        }
    }

    fn key(&self) -> &str {
        self.ticket.as_ref().map(|t| t.key()).unwrap_or_default()
    }
}

impl Drop for PendingMutation<'_> {
    fn drop(&mut self) {
        if let Some(ticket) = self.ticket.take() {
            debug!(key = %ticket.key(), "Optimistic mutation dropped, restoring snapshot");
            self.store.settle_optimistic(ticket, Settlement::Restore);
        }
    }
}

/// Applies local mutations ahead of remote confirmation.
#[derive(Clone)]
pub struct OptimisticMutationManager {
    store: Arc<CacheStore>,
    timeout: Duration,
}

impl OptimisticMutationManager {
    pub fn new(store: Arc<CacheStore>, timeout: Duration) -> Self {
        Self { store, timeout }
    }

    pub fn store(&self) -> &Arc<CacheStore> {
        &self.store
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    async fn call_with_timeout<F>(&self, remote: F) -> Result<Option<Value>, MutationError>
    where
        F: Future<Output = Result<Option<Value>, MutationError>>,
    {
        match tokio::time::timeout(self.timeout, remote).await {
            Ok(result) => result,
            Err(_) => Err(MutationError::Timeout {
                after: self.timeout,
            }),
        }
    }

    /// Apply `updater` to `key` now, then confirm or roll back on `remote`.
    pub async fn mutate<U, F>(
        &self,
        key: &str,
        updater: U,
        remote: F,
    ) -> Result<MutationOutcome, MutationError>
    where
        U: FnOnce(Option<&Value>) -> Option<Value>,
        F: Future<Output = Result<Option<Value>, MutationError>>,
    {
        let pending = PendingMutation::begin(&self.store, key, updater);
        let result = self.call_with_timeout(remote).await;
        if let Err(error) = &result {
            warn!(key = %key, error = %error, "Mutation failed, rolled back");
        }
        pending.settle_result(result)
    }

    /// Apply every optimistic update up front, then issue all calls
    /// concurrently. Results are returned in request order.
    ///
    /// In [`BatchMode::Independent`] each key may appear once: a repeated key
    /// would let an earlier failure restore its snapshot over a later
    /// success. Repeats fail with [`MutationError::DuplicateKey`] without
    /// touching the store or issuing their call.
    pub async fn mutate_batch(
        &self,
        requests: Vec<MutationRequest>,
        mode: BatchMode,
    ) -> Vec<Result<MutationOutcome, MutationError>> {
        if mode == BatchMode::Independent {
            return self.mutate_independent(requests).await;
        }

        let mut pending = Vec::with_capacity(requests.len());
        let mut calls = Vec::with_capacity(requests.len());
        for request in requests {
            pending.push(PendingMutation::begin(
                &self.store,
                &request.key,
                request.updater,
            ));
            calls.push(self.call_with_timeout(request.remote));
        }

        let results = join_all(calls).await;
        let any_failed = results.iter().any(Result::is_err);

        match mode {
            BatchMode::AllOrNothing if any_failed => {
                warn!(
                    failed = results.iter().filter(|r| r.is_err()).count(),
                    total = results.len(),
                    "Batch mutation aborted, rolling back every entry"
                );
                // Reverse order so overlapping keys unwind to the first snapshot.
                for guard in pending.into_iter().rev() {
                    guard.settle(Settlement::Restore);
                }
                results
                    .into_iter()
                    .map(|result| match result {
                        Ok(_) => Err(MutationError::BatchAborted),
                        Err(error) => Err(error),
                    })
                    .collect()
            }
            _ => pending
                .into_iter()
                .zip(results)
                .map(|(guard, result)| settle_entry(guard, result))
                .collect(),
        }
    }

    async fn mutate_independent(
        &self,
        requests: Vec<MutationRequest>,
    ) -> Vec<Result<MutationOutcome, MutationError>> {
        let mut seen = HashSet::with_capacity(requests.len());
        let mut slots = Vec::with_capacity(requests.len());
        let mut calls = Vec::with_capacity(requests.len());
        for request in requests {
            if !seen.insert(request.key.clone()) {
                warn!(key = %request.key, "Duplicate key in independent batch, entry skipped");
                slots.push(Err(request.key));
                continue;
            }
            slots.push(Ok(PendingMutation::begin(
                &self.store,
                &request.key,
                request.updater,
            )));
            calls.push(self.call_with_timeout(request.remote));
        }

        let mut results = join_all(calls).await.into_iter();
        slots
            .into_iter()
            .map(|slot| match slot {
                Ok(guard) => match results.next() {
                    Some(result) => settle_entry(guard, result),
                    None => guard.settle_result(Err(MutationError::BatchAborted)),
                },
                Err(key) => Err(MutationError::DuplicateKey { key }),
            })
            .collect()
    }
}

fn settle_entry(
    guard: PendingMutation<'_>,
    result: Result<Option<Value>, MutationError>,
) -> Result<MutationOutcome, MutationError> {
    if let Err(error) = &result {
        warn!(key = %guard.key(), error = %error, "Batch entry failed, rolled back");
    }
    guard.settle_result(result)
}
