//! Reconciliation of push change events into cached collections.
//!
//! Events are merged straight into the cached value without a refetch:
//! inserts prepend, updates shallow-merge, deletes remove. Every operation
//! is idempotent so duplicate delivery is harmless. Events that reference
//! entities we do not hold are logged and dropped; the next poll fixes them.

use crate::store::CacheStore;
use serde_json::{Map, Value};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace};
use vitrine_core::{identity_of, ChangeEvent, ChangeOp};

/// Result of applying one change event to a cached value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileOutcome {
    Inserted,
    Updated,
    Deleted,
    /// Insert for an identity already present.
    DuplicateInsert,
    /// Update for an entity we do not hold.
    MissingForUpdate,
    /// Delete for an entity already gone.
    MissingForDelete,
    /// Nothing cached under the collection key yet.
    CollectionAbsent,
    /// Cached value is neither a collection nor an entity.
    UnsupportedShape,
}

impl ReconcileOutcome {
    /// Whether the cached value was modified.
    pub fn changed(&self) -> bool {
        matches!(
            self,
            ReconcileOutcome::Inserted | ReconcileOutcome::Updated | ReconcileOutcome::Deleted
        )
    }

    pub fn is_noop(&self) -> bool {
        !self.changed()
    }
}

/// Apply `event` to `value` in place.
///
/// Arrays are treated as collections of entities keyed by `identity_field`.
/// Objects are treated as a single entity; a delete leaves `Value::Null`.
pub fn reconcile_in_place(
    value: &mut Option<Value>,
    event: &ChangeEvent,
    identity_field: &str,
) -> ReconcileOutcome {
    let Some(current) = value.as_mut() else {
        return ReconcileOutcome::CollectionAbsent;
    };

    match current {
        Value::Array(items) => reconcile_collection(items, event, identity_field),
        Value::Object(_) => reconcile_entity(current, event, identity_field),
        Value::Null => match event.op {
            ChangeOp::Insert => {
                *current = entity_with_identity(event, identity_field);
                ReconcileOutcome::Inserted
            }
            ChangeOp::Update => ReconcileOutcome::MissingForUpdate,
            ChangeOp::Delete => ReconcileOutcome::MissingForDelete,
        },
        _ => ReconcileOutcome::UnsupportedShape,
    }
}

fn reconcile_collection(
    items: &mut Vec<Value>,
    event: &ChangeEvent,
    identity_field: &str,
) -> ReconcileOutcome {
    let position = items
        .iter()
        .position(|item| identity_of(item, identity_field).as_deref() == Some(event.key.as_str()));

    match (event.op, position) {
        (ChangeOp::Insert, None) => {
            items.insert(0, entity_with_identity(event, identity_field));
            ReconcileOutcome::Inserted
        }
        (ChangeOp::Insert, Some(_)) => ReconcileOutcome::DuplicateInsert,
        (ChangeOp::Update, Some(idx)) => {
            merge_fields(&mut items[idx], &event.payload);
            ReconcileOutcome::Updated
        }
        (ChangeOp::Update, None) => ReconcileOutcome::MissingForUpdate,
        (ChangeOp::Delete, Some(idx)) => {
            items.remove(idx);
            ReconcileOutcome::Deleted
        }
        (ChangeOp::Delete, None) => ReconcileOutcome::MissingForDelete,
    }
}

fn reconcile_entity(entity: &mut Value, event: &ChangeEvent, identity_field: &str) -> ReconcileOutcome {
    let matches = identity_of(entity, identity_field).as_deref() == Some(event.key.as_str());
    match (event.op, matches) {
        (ChangeOp::Insert, true) => ReconcileOutcome::DuplicateInsert,
        (ChangeOp::Insert, false) => ReconcileOutcome::UnsupportedShape,
        (ChangeOp::Update, true) => {
            merge_fields(entity, &event.payload);
            ReconcileOutcome::Updated
        }
        (ChangeOp::Update, false) => ReconcileOutcome::MissingForUpdate,
        (ChangeOp::Delete, true) => {
            *entity = Value::Null;
            ReconcileOutcome::Deleted
        }
        (ChangeOp::Delete, false) => ReconcileOutcome::MissingForDelete,
    }
}

/// Shallow merge: fields present in `patch` overwrite, absent fields stay.
pub fn merge_fields(target: &mut Value, patch: &Value) {
    match (target.as_object_mut(), patch.as_object()) {
        (Some(target), Some(patch)) => {
            for (field, value) in patch {
                target.insert(field.clone(), value.clone());
            }
        }
        _ => *target = patch.clone(),
    }
}

/// Merge an authoritative entity into a cached value by identity.
///
/// Used when a mutation endpoint returns the updated row. Returns false when
/// the entity has no identity or is not present in a collection.
pub fn merge_entity(value: &mut Option<Value>, entity: &Value, identity_field: &str) -> bool {
    let Some(id) = identity_of(entity, identity_field) else {
        return false;
    };
    match value {
        None => {
            *value = Some(entity.clone());
            true
        }
        Some(Value::Array(items)) => match items
            .iter_mut()
            .find(|item| identity_of(item, identity_field).as_deref() == Some(id.as_str()))
        {
            Some(item) => {
                merge_fields(item, entity);
                true
            }
            None => false,
        },
        Some(current @ Value::Object(_)) => {
            if identity_of(current, identity_field).as_deref() == Some(id.as_str()) {
                merge_fields(current, entity);
                true
            } else {
                false
            }
        }
        Some(_) => false,
    }
}

fn entity_with_identity(event: &ChangeEvent, identity_field: &str) -> Value {
    match &event.payload {
        Value::Object(fields) if fields.contains_key(identity_field) => event.payload.clone(),
        Value::Object(fields) => {
            let mut fields = fields.clone();
            fields.insert(identity_field.to_string(), Value::String(event.key.clone()));
            Value::Object(fields)
        }
        _ => {
            let mut fields = Map::new();
            fields.insert(identity_field.to_string(), Value::String(event.key.clone()));
            Value::Object(fields)
        }
    }
}

// ============================================================================
// ENGINE
// ============================================================================

/// A change event addressed to a cached collection.
#[derive(Debug, Clone, PartialEq)]
pub struct RoutedChange {
    pub collection_key: String,
    pub event: ChangeEvent,
}

impl RoutedChange {
    pub fn new(collection_key: impl Into<String>, event: ChangeEvent) -> Self {
        Self {
            collection_key: collection_key.into(),
            event,
        }
    }
}

/// Applies change events to the store through its serialized write path.
#[derive(Clone)]
pub struct ReconciliationEngine {
    store: Arc<CacheStore>,
}

impl ReconciliationEngine {
    pub fn new(store: Arc<CacheStore>) -> Self {
        Self { store }
    }

    /// Apply one event; never triggers a refetch.
    pub fn apply(&self, collection_key: &str, event: &ChangeEvent) -> ReconcileOutcome {
        let outcome = self.store.apply_event(collection_key, event);
        if outcome.is_noop() {
            debug!(
                key = %collection_key,
                entity = %event.key,
                op = %event.op,
                ?outcome,
                "Reconciliation no-op"
            );
        } else {
            trace!(key = %collection_key, entity = %event.key, op = %event.op, "Reconciled change");
        }
        outcome
    }

    /// Drain a change queue in delivery order until every sender is dropped.
    pub fn spawn_driver(self, mut rx: mpsc::UnboundedReceiver<RoutedChange>) -> JoinHandle<()> {
        tokio::spawn(async move {
            while let Some(change) = rx.recv().await {
                self.apply(&change.collection_key, &change.event);
            }
            debug!("Reconciliation driver stopped");
        })
    }
}
