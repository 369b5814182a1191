//! Database model types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Order record, the business entity tracked by the outbox.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
    pub id: i64,
    pub total_amount: f64,
    pub status: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Order {
    /// Aggregate id under which this order's events are written.
    pub fn aggregate_id(&self) -> String {
        order_aggregate_id(self.id)
    }
}

/// Aggregate id for an order: `order-<id>`.
pub fn order_aggregate_id(order_id: i64) -> String {
    format!("order-{order_id}")
}

/// Result of the order placement transaction.
#[derive(Debug, Clone)]
pub struct PlacedOrder {
    pub order: Order,
    pub outbox_id: i64,
}

/// Outbox row as stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboxRow {
    pub id: i64,
    pub aggregate_id: String,
    /// Opaque JSON text, decoded by the relay.
    pub payload: String,
    pub status: OutboxStatus,
    pub created_at: DateTime<Utc>,
    pub published_at: Option<DateTime<Utc>>,
    pub attempts: i64,
    pub last_error: Option<String>,
}

/// Outbox row status.
///
/// Transitions are `Pending -> Published` and `Pending -> Failed`, never back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutboxStatus {
    #[default]
    Pending,
    Published,
    Failed,
}

impl OutboxStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Published => "published",
            Self::Failed => "failed",
        }
    }

    /// Parse a stored status. Unknown values yield `None`.
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "pending" => Some(Self::Pending),
            "published" => Some(Self::Published),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending)
    }
}

impl std::fmt::Display for OutboxStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
