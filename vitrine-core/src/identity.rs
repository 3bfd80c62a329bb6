//! Identity types for Vitrine entities

use chrono::{DateTime, Utc};
use serde_json::Value;
use uuid::Uuid;

/// Entity identifier using UUIDv7 for timestamp-sortable IDs.
pub type EntityId = Uuid;

/// Timestamp type using UTC timezone.
pub type Timestamp = DateTime<Utc>;

/// Field that carries entity identity inside JSON payloads.
pub const DEFAULT_IDENTITY_FIELD: &str = "id";

/// Generate a new UUIDv7 EntityId (timestamp-sortable).
pub fn new_entity_id() -> EntityId {
    Uuid::now_v7()
}

/// Extract the identity of a JSON entity as a string.
///
/// String and numeric identities are both accepted so that collections keyed
/// by integer primary keys reconcile the same way as UUID-keyed ones.
pub fn identity_of(entity: &Value, identity_field: &str) -> Option<String> {
    match entity.get(identity_field)? {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_identity_of_string_and_number() {
        assert_eq!(
            identity_of(&json!({"id": "abc"}), DEFAULT_IDENTITY_FIELD),
            Some("abc".to_string())
        );
        assert_eq!(
            identity_of(&json!({"id": 42}), DEFAULT_IDENTITY_FIELD),
            Some("42".to_string())
        );
    }

    #[test]
    fn test_identity_of_missing_or_unsupported() {
        assert_eq!(identity_of(&json!({"name": "x"}), "id"), None);
        assert_eq!(identity_of(&json!({"id": [1, 2]}), "id"), None);
        assert_eq!(identity_of(&json!("plain"), "id"), None);
    }

    #[test]
    fn test_new_entity_id_is_v7() {
        assert_eq!(new_entity_id().get_version_num(), 7);
    }
}
