//! Event envelope codec.
//!
//! The outbox `payload` column is opaque JSON written by the producer. The
//! relay only needs the correlation key out of it (`id`, the order id); the
//! status it delivers comes from configuration.

use outbox_database::Order;
use serde::{Deserialize, Serialize};

/// Payload written to the outbox when an order is placed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderEvent {
    pub id: i64,
    pub total_amount: f64,
    pub status: String,
}

impl From<&Order> for OrderEvent {
    fn from(order: &Order) -> Self {
        Self {
            id: order.id,
            total_amount: order.total_amount,
            status: order.status.clone(),
        }
    }
}

/// What one delivery attempt sends.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub correlation_key: i64,
    pub status_to_apply: String,
}

/// Outcome of decoding a payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decoded {
    Valid(Envelope),
    /// Structurally unusable payload, with a human readable reason.
    Invalid(String),
}

/// Serialize an order into its outbox payload.
pub fn encode_order(order: &Order) -> serde_json::Result<String> {
    serde_json::to_string(&OrderEvent::from(order))
}

/// Decode a payload into an envelope.
///
/// Never panics: anything other than a JSON object with an integral `id`
/// is `Invalid`.
pub fn decode(payload: &str, status_to_apply: &str) -> Decoded {
    let value: serde_json::Value = match serde_json::from_str(payload) {
        Ok(value) => value,
        Err(e) => return Decoded::Invalid(format!("payload is not JSON: {e}")),
    };

    let Some(object) = value.as_object() else {
        return Decoded::Invalid("payload is not a JSON object".to_string());
    };

    let Some(id) = object.get("id") else {
        return Decoded::Invalid("payload is missing \"id\"".to_string());
    };

    match integral(id) {
        Some(correlation_key) => Decoded::Valid(Envelope {
            correlation_key,
            status_to_apply: status_to_apply.to_string(),
        }),
        None => Decoded::Invalid(format!("payload \"id\" is not an integer: {id}")),
    }
}

/// Accept `42` and `42.0`; reject fractions, strings and out of range values.
pub(crate) fn integral(value: &serde_json::Value) -> Option<i64> {
    if let Some(n) = value.as_i64() {
        return Some(n);
    }
    let f = value.as_f64()?;
    if f.fract() == 0.0 && f >= i64::MIN as f64 && f < i64::MAX as f64 {
        Some(f as i64)
    } else {
        None
    }
}
