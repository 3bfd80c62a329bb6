//! Change events delivered by the push channel.
//!
//! A change event describes one row-level mutation in the backing store.
//! Events for the same entity key must be applied in delivery order; events
//! for different keys are independent.

use crate::{EntityType, Timestamp};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

/// Kind of row-level mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChangeOp {
    Insert,
    Update,
    Delete,
}

impl ChangeOp {
    /// Wire representation used by the push transport (`INSERT`, ...).
    pub fn as_wire_str(&self) -> &'static str {
        match self {
            ChangeOp::Insert => "INSERT",
            ChangeOp::Update => "UPDATE",
            ChangeOp::Delete => "DELETE",
        }
    }
}

impl fmt::Display for ChangeOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_wire_str())
    }
}

impl FromStr for ChangeOp {
    type Err = ChangeOpParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "INSERT" => Ok(ChangeOp::Insert),
            "UPDATE" => Ok(ChangeOp::Update),
            "DELETE" => Ok(ChangeOp::Delete),
            _ => Err(ChangeOpParseError(s.to_string())),
        }
    }
}

/// Error when parsing an unknown change operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeOpParseError(pub String);

impl fmt::Display for ChangeOpParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Invalid change operation: {}", self.0)
    }
}

impl std::error::Error for ChangeOpParseError {}

/// A single change notification for one entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    /// Type of the changed entity.
    pub entity_type: EntityType,
    /// Identity of the changed entity.
    pub key: String,
    /// Mutation kind.
    pub op: ChangeOp,
    /// New row for inserts and updates (possibly partial for updates),
    /// old row for deletes.
    pub payload: Value,
    /// Commit time reported by the source.
    pub source_timestamp: Timestamp,
}

impl ChangeEvent {
    pub fn new(
        entity_type: EntityType,
        key: impl Into<String>,
        op: ChangeOp,
        payload: Value,
        source_timestamp: Timestamp,
    ) -> Self {
        Self {
            entity_type,
            key: key.into(),
            op,
            payload,
            source_timestamp,
        }
    }

    pub fn insert(entity_type: EntityType, key: impl Into<String>, payload: Value) -> Self {
        Self::new(entity_type, key, ChangeOp::Insert, payload, Utc::now())
    }

    pub fn update(entity_type: EntityType, key: impl Into<String>, payload: Value) -> Self {
        Self::new(entity_type, key, ChangeOp::Update, payload, Utc::now())
    }

    pub fn delete(entity_type: EntityType, key: impl Into<String>) -> Self {
        Self::new(entity_type, key, ChangeOp::Delete, Value::Null, Utc::now())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_change_op_parse_is_case_insensitive() {
        assert_eq!("insert".parse::<ChangeOp>(), Ok(ChangeOp::Insert));
        assert_eq!("UPDATE".parse::<ChangeOp>(), Ok(ChangeOp::Update));
        assert_eq!("Delete".parse::<ChangeOp>(), Ok(ChangeOp::Delete));
        assert!("UPSERT".parse::<ChangeOp>().is_err());
    }

    #[test]
    fn test_change_event_constructors() {
        let insert = ChangeEvent::insert(EntityType::Order, "o1", json!({"id": "o1"}));
        assert_eq!(insert.op, ChangeOp::Insert);
        assert_eq!(insert.key, "o1");

        let delete = ChangeEvent::delete(EntityType::Order, "o1");
        assert_eq!(delete.op, ChangeOp::Delete);
        assert!(delete.payload.is_null());
    }
}
