//! Vitrine Test Utilities
//!
//! Shared test infrastructure for the Vitrine workspace:
//! - Proptest generators for entities and change events
//! - A reference collection model for reconciliation properties
//! - Fixtures for common scenarios
//! - Assertions for cache values

pub use vitrine_core::{
    ChangeEvent, ChangeOp, EntityType, Order, OrderStatus, SyncConfig, Timestamp,
};

use chrono::Utc;
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use uuid::Uuid;

// ============================================================================
// PROPTEST GENERATORS
// ============================================================================

pub mod generators {
    //! Proptest strategies for Vitrine types.

    use super::*;
    use proptest::prelude::*;

    /// Generate a random UUID.
    pub fn arb_uuid() -> impl Strategy<Value = Uuid> {
        any::<[u8; 16]>().prop_map(Uuid::from_bytes)
    }

    /// Generate a Timestamp within 2020-2030.
    pub fn arb_timestamp() -> impl Strategy<Value = Timestamp> {
        (1577836800i64..1893456000i64).prop_map(|secs| {
            chrono::DateTime::from_timestamp(secs, 0).unwrap_or_else(Utc::now)
        })
    }

    pub fn arb_entity_type() -> impl Strategy<Value = EntityType> {
        prop_oneof![
            Just(EntityType::Order),
            Just(EntityType::ChatSession),
            Just(EntityType::ChatMessage),
            Just(EntityType::Shipment),
        ]
    }

    pub fn arb_order_status() -> impl Strategy<Value = OrderStatus> {
        prop_oneof![
            Just(OrderStatus::Pending),
            Just(OrderStatus::Paid),
            Just(OrderStatus::Shipped),
            Just(OrderStatus::Delivered),
            Just(OrderStatus::Cancelled),
            Just(OrderStatus::Refunded),
        ]
    }

    pub fn arb_change_op() -> impl Strategy<Value = ChangeOp> {
        prop_oneof![
            Just(ChangeOp::Insert),
            Just(ChangeOp::Update),
            Just(ChangeOp::Delete),
        ]
    }

    pub fn arb_order() -> impl Strategy<Value = Order> {
        (
            arb_uuid(),
            "cus_[a-z0-9]{4}",
            arb_order_status(),
            0i64..1_000_000,
            prop_oneof![Just("EUR"), Just("USD"), Just("GBP")],
            proptest::option::of("1Z[0-9A-Z]{8}"),
            arb_timestamp(),
        )
            .prop_map(
                |(id, customer_ref, status, total_cents, currency, tracking_number, updated_at)| {
                    Order {
                        id,
                        customer_ref,
                        status,
                        total_cents,
                        currency: currency.to_string(),
                        carrier: tracking_number.as_ref().map(|_| "ups".to_string()),
                        tracking_number,
                        updated_at,
                    }
                },
            )
    }

    /// Entity identity drawn from a small pool so events collide often.
    pub fn arb_pooled_id(pool: usize) -> impl Strategy<Value = String> {
        (0..pool.max(1)).prop_map(|i| format!("e{}", i))
    }

    /// Partial row with a few mutable fields (never the identity field).
    pub fn arb_patch() -> impl Strategy<Value = Value> {
        (
            proptest::option::of(arb_order_status()),
            proptest::option::of(0i64..10_000),
            proptest::option::of("[a-z]{0,6}"),
        )
            .prop_map(|(status, total, note)| {
                let mut fields = Map::new();
                if let Some(status) = status {
                    fields.insert("status".to_string(), json!(status.as_db_str()));
                }
                if let Some(total) = total {
                    fields.insert("total_cents".to_string(), json!(total));
                }
                if let Some(note) = note {
                    fields.insert("note".to_string(), json!(note));
                }
                Value::Object(fields)
            })
    }

    /// Change event over pooled identities. Inserts carry the identity field.
    pub fn arb_change_event(pool: usize) -> impl Strategy<Value = ChangeEvent> {
        (arb_change_op(), arb_pooled_id(pool), arb_patch(), arb_timestamp()).prop_map(
            |(op, key, patch, at)| {
                let payload = match op {
                    ChangeOp::Insert => {
                        let mut row = patch;
                        if let Some(fields) = row.as_object_mut() {
                            fields.insert("id".to_string(), json!(key));
                        }
                        row
                    }
                    ChangeOp::Update => patch,
                    ChangeOp::Delete => json!({ "id": key }),
                };
                ChangeEvent::new(EntityType::Order, key, op, payload, at)
            },
        )
    }

    pub fn arb_change_events(pool: usize, max_len: usize) -> impl Strategy<Value = Vec<ChangeEvent>> {
        prop::collection::vec(arb_change_event(pool), 0..max_len)
    }
}

// ============================================================================
// REFERENCE MODEL
// ============================================================================

/// Ordered list of entities keyed by identity.
///
/// Independent model of collection semantics: inserts go to the front
/// unless present, updates merge fields into present rows, deletes remove.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReferenceCollection {
    order: Vec<String>,
    rows: HashMap<String, Map<String, Value>>,
}

impl ReferenceCollection {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn apply(&mut self, event: &ChangeEvent) {
        match event.op {
            ChangeOp::Insert => {
                if self.rows.contains_key(&event.key) {
                    return;
                }
                let mut row = event.payload.as_object().cloned().unwrap_or_default();
                row.entry("id".to_string())
                    .or_insert_with(|| json!(event.key));
                self.order.insert(0, event.key.clone());
                self.rows.insert(event.key.clone(), row);
            }
            ChangeOp::Update => {
                if let (Some(row), Some(patch)) =
                    (self.rows.get_mut(&event.key), event.payload.as_object())
                {
                    row.extend(patch.clone());
                }
            }
            ChangeOp::Delete => {
                if self.rows.remove(&event.key).is_some() {
                    self.order.retain(|id| id != &event.key);
                }
            }
        }
    }

    pub fn apply_all<'a>(&mut self, events: impl IntoIterator<Item = &'a ChangeEvent>) {
        for event in events {
            self.apply(event);
        }
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.rows.contains_key(id)
    }

    /// JSON array in display order.
    pub fn to_value(&self) -> Value {
        Value::Array(
            self.order
                .iter()
                .filter_map(|id| self.rows.get(id))
                .map(|row| Value::Object(row.clone()))
                .collect(),
        )
    }
}

// ============================================================================
// FIXTURES
// ============================================================================

pub mod fixtures {
    //! Pre-built test fixtures.

    use super::*;

    /// Order row as the collection endpoint returns it.
    pub fn order_json(id: &str, status: OrderStatus) -> Value {
        json!({
            "id": id,
            "customer_ref": "cus_test",
            "status": status.as_db_str(),
            "total_cents": 4200,
            "currency": "EUR",
            "updated_at": Utc::now(),
        })
    }

    /// A small order collection, newest first.
    pub fn sample_orders() -> Value {
        json!([
            order_json("o3", OrderStatus::Pending),
            order_json("o2", OrderStatus::Paid),
            order_json("o1", OrderStatus::Shipped),
        ])
    }

    /// Typed order with a fresh v7 identity.
    pub fn order(status: OrderStatus) -> Order {
        Order {
            id: Uuid::now_v7(),
            customer_ref: "cus_test".to_string(),
            status,
            total_cents: 4200,
            currency: "EUR".to_string(),
            tracking_number: None,
            carrier: None,
            updated_at: Utc::now(),
        }
    }

    /// Client config with short intervals for timer tests.
    pub fn test_config() -> SyncConfig {
        let mut config = SyncConfig::default_client("http://localhost:0", "ws://localhost:0");
        config.polling.healthy_interval_ms = 120_000;
        config.polling.unhealthy_interval_ms = 15_000;
        config.polling.dedup_window_ms = 2_000;
        config.polling.error_retry_count = 2;
        config.polling.error_retry_base_ms = 1_000;
        config.reconnect.initial_ms = 100;
        config.reconnect.max_ms = 1_000;
        config.reconnect.jitter_ms = 0;
        config.mutation.timeout_ms = 1_000;
        config
    }
}

// ============================================================================
// ASSERTIONS
// ============================================================================

pub mod assertions {
    //! Assertions for cached JSON values.

    use super::*;

    /// Assert two optional values serialize to identical bytes.
    #[track_caller]
    pub fn assert_json_bytes_eq(left: &Option<Value>, right: &Option<Value>) {
        let left_bytes = serde_json::to_vec(left).unwrap_or_default();
        let right_bytes = serde_json::to_vec(right).unwrap_or_default();
        assert!(
            left_bytes == right_bytes,
            "JSON differs:\n left: {}\nright: {}",
            String::from_utf8_lossy(&left_bytes),
            String::from_utf8_lossy(&right_bytes)
        );
    }

    /// Identities of a cached collection, in order.
    pub fn ids(value: &Value) -> Vec<String> {
        value
            .as_array()
            .map(|items| {
                items
                    .iter()
                    .filter_map(|item| vitrine_core::identity_of(item, "id"))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Assert a cached collection holds exactly `expected` ids, in order.
    #[track_caller]
    pub fn assert_ids(value: &Value, expected: &[&str]) {
        let actual = ids(value);
        assert_eq!(actual, expected, "unexpected collection ids");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reference_collection_semantics() {
        let mut model = ReferenceCollection::new();
        model.apply(&ChangeEvent::insert(EntityType::Order, "a", json!({"id": "a", "n": 1})));
        model.apply(&ChangeEvent::insert(EntityType::Order, "b", json!({"id": "b"})));
        model.apply(&ChangeEvent::insert(EntityType::Order, "a", json!({"id": "a", "n": 9})));
        model.apply(&ChangeEvent::update(EntityType::Order, "a", json!({"n": 2})));
        model.apply(&ChangeEvent::update(EntityType::Order, "zz", json!({"n": 3})));
        model.apply(&ChangeEvent::delete(EntityType::Order, "b"));

        assert_eq!(model.len(), 1);
        assert_eq!(model.to_value(), json!([{"id": "a", "n": 2}]));
    }

    #[test]
    fn test_sample_orders_ids() {
        assertions::assert_ids(&fixtures::sample_orders(), &["o3", "o2", "o1"]);
    }

    #[test]
    fn test_config_fixture_validates() {
        fixtures::test_config()
            .validate()
            .expect("test config should validate");
    }
}
