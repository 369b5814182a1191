//! Debezium change event parsing.
//!
//! Accepts the plain event `{"op","before","after","source","ts_ms"}` and
//! the same event wrapped by the JSON converter as
//! `{"schema": {...}, "payload": {...}}`.

use super::{ChangeOp, ChangeRecord, RowImage};
use crate::envelope::integral;
use chrono::{DateTime, TimeZone, Utc};
use outbox_database::{OutboxRow, OutboxStatus};
use serde_json::{Map, Value};

/// Parse one raw change event. Never fails: unparseable input becomes a
/// record tagged [`ChangeOp::Unreadable`].
pub fn parse_change_event(raw: &str, checkpoint: Option<String>) -> ChangeRecord {
    match serde_json::from_str::<Value>(raw) {
        Ok(value) => parse_change_value(value, checkpoint),
        Err(e) => ChangeRecord::unreadable(checkpoint, format!("invalid json: {e}")),
    }
}

/// Parse an already decoded change event.
pub fn parse_change_value(value: Value, checkpoint: Option<String>) -> ChangeRecord {
    let event = unwrap_envelope(value);

    let Some(event) = event.as_object() else {
        return ChangeRecord::unreadable(checkpoint, "change event is not a JSON object");
    };

    let op = ChangeOp::from_code(event.get("op").and_then(Value::as_str).unwrap_or(""));

    let source_ts = event
        .get("source")
        .and_then(|source| source.get("ts_ms"))
        .or_else(|| event.get("ts_ms"))
        .and_then(millis_to_datetime);

    let after = match event.get("after") {
        None | Some(Value::Null) => None,
        Some(Value::Object(after)) => Some(match extract_row(after, source_ts) {
            Ok(row) => RowImage::Row(row),
            Err(reason) => RowImage::Malformed(reason),
        }),
        Some(other) => Some(RowImage::Malformed(format!(
            "after image is not an object: {other}"
        ))),
    };

    let before_status = event
        .get("before")
        .and_then(|before| before.get("status"))
        .and_then(Value::as_str)
        .and_then(OutboxStatus::parse);

    ChangeRecord {
        op,
        after,
        before_status,
        source_ts,
        checkpoint,
    }
}

fn unwrap_envelope(value: Value) -> Value {
    match value {
        Value::Object(mut map) if map.contains_key("schema") && map.contains_key("payload") => {
            map.remove("payload").unwrap_or(Value::Null)
        }
        other => other,
    }
}

/// Build an outbox row from an after image.
///
/// `id`, `aggregate_id`, `payload` and `status` are required. A missing or
/// unparseable `created_at` falls back to the source timestamp.
pub fn extract_row(
    after: &Map<String, Value>,
    source_ts: Option<DateTime<Utc>>,
) -> Result<OutboxRow, String> {
    let id = after
        .get("id")
        .and_then(integral)
        .ok_or_else(|| "missing or invalid id".to_string())?;

    let aggregate_id = after
        .get("aggregate_id")
        .and_then(Value::as_str)
        .ok_or_else(|| "missing or invalid aggregate_id".to_string())?
        .to_string();

    // Text columns arrive as strings; a JSON column may arrive decoded.
    let payload = match after.get("payload") {
        Some(Value::String(s)) => s.clone(),
        Some(value @ (Value::Object(_) | Value::Array(_))) => value.to_string(),
        _ => return Err("missing or invalid payload".to_string()),
    };

    let status = after
        .get("status")
        .and_then(Value::as_str)
        .ok_or_else(|| "missing or invalid status".to_string())?;
    let status =
        OutboxStatus::parse(status).ok_or_else(|| format!("unknown status: {status}"))?;

    let created_at = after
        .get("created_at")
        .and_then(timestamp)
        .or(source_ts)
        .unwrap_or_else(Utc::now);

    Ok(OutboxRow {
        id,
        aggregate_id,
        payload,
        status,
        created_at,
        published_at: after.get("published_at").and_then(timestamp),
        attempts: after.get("attempts").and_then(Value::as_i64).unwrap_or(0),
        last_error: after
            .get("last_error")
            .and_then(Value::as_str)
            .map(str::to_string),
    })
}

/// Epoch milliseconds (number) or RFC 3339 (string).
fn timestamp(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::String(s) => DateTime::parse_from_rfc3339(s)
            .ok()
            .map(|dt| dt.with_timezone(&Utc)),
        other => millis_to_datetime(other),
    }
}

fn millis_to_datetime(value: &Value) -> Option<DateTime<Utc>> {
    let ms = integral(value)?;
    Utc.timestamp_millis_opt(ms).single()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn outbox_after(id: i64, status: &str) -> Value {
        json!({
            "id": id,
            "aggregate_id": format!("order-{id}"),
            "payload": format!(r#"{{"id":{id},"total_amount":10.0,"status":"pending"}}"#),
            "status": status,
            "created_at": 1_700_000_000_000_i64,
            "published_at": null
        })
    }

    #[test]
    fn test_parse_create_event() {
        let raw = json!({
            "op": "c",
            "before": null,
            "after": outbox_after(42, "pending"),
            "source": {"ts_ms": 1_700_000_000_500_i64, "table": "outbox"},
            "ts_ms": 1_700_000_000_900_i64
        })
        .to_string();

        let record = parse_change_event(&raw, Some("1-0".to_string()));
        assert_eq!(record.op, ChangeOp::Create);
        assert_eq!(record.checkpoint.as_deref(), Some("1-0"));
        assert_eq!(
            record.source_ts.unwrap().timestamp_millis(),
            1_700_000_000_500
        );

        let row = record.row().unwrap();
        assert_eq!(row.id, 42);
        assert_eq!(row.aggregate_id, "order-42");
        assert_eq!(row.status, OutboxStatus::Pending);
        assert_eq!(row.created_at.timestamp_millis(), 1_700_000_000_000);
        assert!(row.published_at.is_none());
    }

    #[test]
    fn test_parse_wrapped_event() {
        let raw = json!({
            "schema": {"type": "struct"},
            "payload": {"op": "u", "after": outbox_after(7, "pending")}
        })
        .to_string();

        let record = parse_change_event(&raw, None);
        assert_eq!(record.op, ChangeOp::Update);
        assert_eq!(record.row().unwrap().id, 7);
    }

    #[test]
    fn test_rfc3339_created_at() {
        let mut after = outbox_after(3, "pending");
        after["created_at"] = json!("2024-01-15T10:30:00Z");
        let raw = json!({"op": "c", "after": after}).to_string();

        let row = parse_change_event(&raw, None).row().cloned().unwrap();
        assert_eq!(row.created_at.to_rfc3339(), "2024-01-15T10:30:00+00:00");
    }

    #[test]
    fn test_missing_created_at_uses_source_ts() {
        let mut after = outbox_after(3, "pending");
        after.as_object_mut().unwrap().remove("created_at");
        let raw = json!({"op": "c", "after": after, "source": {"ts_ms": 1_000}}).to_string();

        let row = parse_change_event(&raw, None).row().cloned().unwrap();
        assert_eq!(row.created_at.timestamp_millis(), 1_000);
    }

    #[test]
    fn test_delete_without_after() {
        let raw = json!({"op": "d", "before": outbox_after(1, "pending"), "after": null})
            .to_string();

        let record = parse_change_event(&raw, None);
        assert_eq!(record.op, ChangeOp::Delete);
        assert!(record.after.is_none());
        assert_eq!(record.before_status, Some(OutboxStatus::Pending));
    }

    #[test]
    fn test_before_status() {
        let raw = json!({
            "op": "u",
            "before": outbox_after(9, "pending"),
            "after": outbox_after(9, "published")
        })
        .to_string();
        assert_eq!(
            parse_change_event(&raw, None).before_status,
            Some(OutboxStatus::Pending)
        );

        let raw = json!({"op": "c", "before": null, "after": outbox_after(9, "pending")}).to_string();
        assert!(parse_change_event(&raw, None).before_status.is_none());
    }

    #[test]
    fn test_missing_required_fields_are_malformed() {
        for field in ["id", "aggregate_id", "payload", "status"] {
            let mut after = outbox_after(5, "pending");
            after.as_object_mut().unwrap().remove(field);
            let raw = json!({"op": "c", "after": after}).to_string();

            match parse_change_event(&raw, None).after {
                Some(RowImage::Malformed(reason)) => assert!(reason.contains(field)),
                other => panic!("expected malformed image without {field}, got {other:?}"),
            }
        }
    }

    #[test]
    fn test_unknown_status_is_malformed() {
        let raw = json!({"op": "c", "after": outbox_after(5, "sent")}).to_string();
        assert!(matches!(
            parse_change_event(&raw, None).after,
            Some(RowImage::Malformed(_))
        ));
    }

    #[test]
    fn test_unparseable_event() {
        let record = parse_change_event("not json", Some("9-0".to_string()));
        assert!(matches!(record.op, ChangeOp::Unreadable(_)));
        assert_eq!(record.checkpoint.as_deref(), Some("9-0"));

        let record = parse_change_event("[1,2]", None);
        assert!(matches!(record.op, ChangeOp::Unreadable(_)));
    }

    #[test]
    fn test_missing_op_is_other() {
        let raw = json!({"after": outbox_after(1, "pending")}).to_string();
        assert_eq!(
            parse_change_event(&raw, None).op,
            ChangeOp::Other(String::new())
        );
    }
}
