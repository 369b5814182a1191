//! Database migrations.
//!
//! Migrations are run in order and tracked in the `migrations` table.

use crate::DatabaseResult;
use rusqlite::Connection;
use tracing::{debug, info};

/// Current schema version.
pub const CURRENT_VERSION: i32 = 2;

/// Run all pending migrations.
pub fn run_migrations(conn: &Connection) -> DatabaseResult<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS migrations (
            version INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        )",
        [],
    )?;

    let current_version = schema_version(conn)?;

    info!(current_version, target_version = CURRENT_VERSION, "Running migrations");

    if current_version < 1 {
        migrate_v1_orders(conn)?;
    }
    if current_version < 2 {
        migrate_v2_outbox(conn)?;
    }

    info!("Migrations complete");
    Ok(())
}

/// Highest applied migration version, `0` for a fresh database.
pub fn schema_version(conn: &Connection) -> DatabaseResult<i32> {
    let version = conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM migrations",
        [],
        |row| row.get(0),
    )?;
    Ok(version)
}

fn record_migration(conn: &Connection, version: i32, name: &str) -> DatabaseResult<()> {
    conn.execute(
        "INSERT INTO migrations (version, name) VALUES (?1, ?2)",
        rusqlite::params![version, name],
    )?;
    debug!(version, name, "Migration applied");
    Ok(())
}

/// V1: orders, the business entity whose changes produce outbox events.
fn migrate_v1_orders(conn: &Connection) -> DatabaseResult<()> {
    info!("Applying migration v1: orders");

    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS orders (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            total_amount REAL NOT NULL,
            status TEXT NOT NULL DEFAULT 'pending',
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );
        ",
    )?;

    record_migration(conn, 1, "orders")?;
    Ok(())
}

/// V2: the transactional outbox.
///
/// `id` is AUTOINCREMENT so ids are never reused and order writes within
/// one aggregate. The partial index keeps the polling scan cheap once most
/// rows are published.
fn migrate_v2_outbox(conn: &Connection) -> DatabaseResult<()> {
    info!("Applying migration v2: outbox");

    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS outbox (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            aggregate_id TEXT NOT NULL,
            payload TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'pending'
                CHECK (status IN ('pending', 'published', 'failed')),
            created_at TEXT NOT NULL,
            published_at TEXT,
            attempts INTEGER NOT NULL DEFAULT 0,
            last_error TEXT
        );

        CREATE INDEX IF NOT EXISTS idx_outbox_pending
            ON outbox(status, created_at) WHERE status = 'pending';
        CREATE INDEX IF NOT EXISTS idx_outbox_aggregate
            ON outbox(aggregate_id, created_at);
        ",
    )?;

    record_migration(conn, 2, "outbox")?;
    Ok(())
}
