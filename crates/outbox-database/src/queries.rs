//! Standalone query functions that work with any Connection.
//!
//! Each function takes a `&Connection` as its first parameter, so it can run
//! on a plain connection or inside a `rusqlite::Transaction` (which derefs to
//! one).

use crate::{DatabaseResult, Order, OutboxRow, OutboxStatus};
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension};
use tracing::{debug, warn};

// ==========================================
// Orders
// ==========================================

/// Insert a new order with status `pending`.
pub fn insert_order(conn: &Connection, total_amount: f64) -> DatabaseResult<Order> {
    let now = Utc::now();
    let stamp = format_datetime(&now);
    conn.execute(
        "INSERT INTO orders (total_amount, status, created_at, updated_at)
         VALUES (?1, 'pending', ?2, ?2)",
        params![total_amount, stamp],
    )?;

    Ok(Order {
        id: conn.last_insert_rowid(),
        total_amount,
        status: "pending".to_string(),
        created_at: now,
        updated_at: now,
    })
}

/// Get an order by ID.
pub fn get_order(conn: &Connection, id: i64) -> DatabaseResult<Option<Order>> {
    let mut stmt = conn.prepare_cached(
        "SELECT id, total_amount, status, created_at, updated_at FROM orders WHERE id = ?1",
    )?;

    let order = stmt
        .query_row(params![id], |row| {
            Ok(Order {
                id: row.get(0)?,
                total_amount: row.get(1)?,
                status: row.get(2)?,
                created_at: datetime_column(row, 3)?,
                updated_at: datetime_column(row, 4)?,
            })
        })
        .optional()?;

    Ok(order)
}

// ==========================================
// Outbox
// ==========================================

const OUTBOX_COLUMNS: &str =
    "id, aggregate_id, payload, status, created_at, published_at, attempts, last_error";

fn map_outbox_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<OutboxRow> {
    Ok(OutboxRow {
        id: row.get(0)?,
        aggregate_id: row.get(1)?,
        payload: row.get(2)?,
        status: status_column(row, 3)?,
        created_at: datetime_column(row, 4)?,
        published_at: match row.get::<_, Option<String>>(5)? {
            Some(s) => Some(parse_datetime(5, &s)?),
            None => None,
        },
        attempts: row.get(6)?,
        last_error: row.get(7)?,
    })
}

/// Append a `pending` outbox row and return its id.
///
/// Must be called with the same connection (transaction) that performs the
/// business mutation; a failed insert fails that transaction.
pub fn write_outbox_row(
    conn: &Connection,
    aggregate_id: &str,
    payload: &str,
) -> DatabaseResult<i64> {
    conn.execute(
        "INSERT INTO outbox (aggregate_id, payload, status, created_at)
         VALUES (?1, ?2, 'pending', ?3)",
        params![aggregate_id, payload, format_datetime(&Utc::now())],
    )?;
    let id = conn.last_insert_rowid();
    debug!(outbox_id = id, aggregate_id, "Outbox row written");
    Ok(id)
}

/// Get an outbox row by ID.
pub fn get_outbox_row(conn: &Connection, id: i64) -> DatabaseResult<Option<OutboxRow>> {
    let mut stmt = conn.prepare_cached(&format!(
        "SELECT {OUTBOX_COLUMNS} FROM outbox WHERE id = ?1"
    ))?;
    let row = stmt.query_row(params![id], map_outbox_row).optional()?;
    Ok(row)
}

/// Oldest pending rows, ordered by `(created_at, id)`.
pub fn pending_outbox_rows(conn: &Connection, limit: usize) -> DatabaseResult<Vec<OutboxRow>> {
    let mut stmt = conn.prepare_cached(&format!(
        "SELECT {OUTBOX_COLUMNS} FROM outbox
         WHERE status = 'pending'
         ORDER BY created_at ASC, id ASC
         LIMIT ?1"
    ))?;

    let rows = stmt
        .query_map(params![limit as i64], map_outbox_row)?
        .collect::<Result<Vec<_>, _>>()?;

    Ok(rows)
}

/// Transition a row `pending -> published` and stamp `published_at`.
///
/// Returns the number of rows affected: `0` when the row was already
/// terminal (or does not exist), `1` on success.
pub fn mark_outbox_published(conn: &Connection, id: i64) -> DatabaseResult<usize> {
    let count = conn.execute(
        "UPDATE outbox SET status = 'published', published_at = ?1
         WHERE id = ?2 AND status = 'pending'",
        params![format_datetime(&Utc::now()), id],
    )?;
    Ok(count)
}

/// Transition a row `pending -> failed`, keeping the reason in `last_error`.
pub fn mark_outbox_failed(conn: &Connection, id: i64, reason: &str) -> DatabaseResult<usize> {
    let count = conn.execute(
        "UPDATE outbox SET status = 'failed', last_error = ?1, attempts = attempts + 1
         WHERE id = ?2 AND status = 'pending'",
        params![reason, id],
    )?;
    if count == 0 {
        warn!(outbox_id = id, "Outbox row was not pending, failure not recorded");
    }
    Ok(count)
}

/// Count a failed delivery attempt on a row that stays pending.
pub fn record_outbox_attempt_failure(
    conn: &Connection,
    id: i64,
    reason: &str,
) -> DatabaseResult<usize> {
    let count = conn.execute(
        "UPDATE outbox SET attempts = attempts + 1, last_error = ?1
         WHERE id = ?2 AND status = 'pending'",
        params![reason, id],
    )?;
    Ok(count)
}

/// Number of outbox rows in the given status.
pub fn count_outbox_rows(conn: &Connection, status: OutboxStatus) -> DatabaseResult<i64> {
    let count = conn.query_row(
        "SELECT COUNT(*) FROM outbox WHERE status = ?1",
        params![status.as_str()],
        |row| row.get(0),
    )?;
    Ok(count)
}

// ==========================================
// Helpers
// ==========================================

/// Fixed-width UTC timestamp so that text ordering matches time ordering.
pub fn format_datetime(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Parse an RFC3339 datetime string, falling back to current time on error.
fn parse_datetime(idx: usize, s: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn datetime_column(row: &rusqlite::Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    parse_datetime(idx, &row.get::<_, String>(idx)?)
}

// A stored status outside the known set is corruption, not `pending`.
fn status_column(row: &rusqlite::Row<'_>, idx: usize) -> rusqlite::Result<OutboxStatus> {
    let status = row.get::<_, String>(idx)?;
    OutboxStatus::parse(&status).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            idx,
            Type::Text,
            format!("unknown outbox status: {status}").into(),
        )
    })
}
