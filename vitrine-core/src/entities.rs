//! Entity types carried through the sync cache.

use crate::{EntityId, Timestamp};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

// ============================================================================
// ENTITY TYPE
// ============================================================================

/// Entity type discriminator for collections and push channels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    Order,
    ChatSession,
    ChatMessage,
    Shipment,
}

impl EntityType {
    /// Prefix used when naming push channels and cache keys.
    pub fn channel_prefix(&self) -> &'static str {
        match self {
            EntityType::Order => "orders",
            EntityType::ChatSession => "chat_sessions",
            EntityType::ChatMessage => "chat_messages",
            EntityType::Shipment => "shipments",
        }
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.channel_prefix())
    }
}

// ============================================================================
// ORDER STATUS
// ============================================================================

/// Lifecycle status of a storefront order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    Pending,
    Paid,
    Shipped,
    Delivered,
    Cancelled,
    Refunded,
}

impl OrderStatus {
    /// Convert to the wire string representation.
    pub fn as_db_str(&self) -> &'static str {
        match self {
            OrderStatus::Pending => "pending",
            OrderStatus::Paid => "paid",
            OrderStatus::Shipped => "shipped",
            OrderStatus::Delivered => "delivered",
            OrderStatus::Cancelled => "cancelled",
            OrderStatus::Refunded => "refunded",
        }
    }

    /// Parse from the wire string representation.
    pub fn from_db_str(s: &str) -> Result<Self, OrderStatusParseError> {
        match s.to_lowercase().as_str() {
            "pending" => Ok(OrderStatus::Pending),
            "paid" => Ok(OrderStatus::Paid),
            "shipped" => Ok(OrderStatus::Shipped),
            "delivered" => Ok(OrderStatus::Delivered),
            "cancelled" | "canceled" => Ok(OrderStatus::Cancelled),
            "refunded" => Ok(OrderStatus::Refunded),
            _ => Err(OrderStatusParseError(s.to_string())),
        }
    }

    /// Check if this is a terminal state (no further transitions possible).
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OrderStatus::Delivered | OrderStatus::Cancelled | OrderStatus::Refunded
        )
    }
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_db_str())
    }
}

impl FromStr for OrderStatus {
    type Err = OrderStatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_db_str(s)
    }
}

/// Error when parsing an invalid order status string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderStatusParseError(pub String);

impl fmt::Display for OrderStatusParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Invalid order status: {}", self.0)
    }
}

impl std::error::Error for OrderStatusParseError {}

// ============================================================================
// ORDER
// ============================================================================

/// A storefront order as returned by the collection endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
    pub id: EntityId,
    pub customer_ref: String,
    pub status: OrderStatus,
    pub total_cents: i64,
    pub currency: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tracking_number: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub carrier: Option<String>,
    pub updated_at: Timestamp,
}

impl Order {
    /// Whether a tracking number has been assigned.
    pub fn is_trackable(&self) -> bool {
        self.tracking_number
            .as_deref()
            .map(|n| !n.trim().is_empty())
            .unwrap_or(false)
    }
}
