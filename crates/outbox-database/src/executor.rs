//! Async SQLite executor using a dedicated background thread.
//!
//! All SQL runs on one thread fed by a channel, which keeps the Tokio
//! runtime free for webhook deliveries and the HTTP surface.
//!
//! # Example
//!
//! ```ignore
//! let db = AsyncDatabase::open(path).await?;
//!
//! let rows = db.call(|conn| queries::pending_outbox_rows(conn, 100)).await?;
//!
//! let outbox_id = db.transaction(move |tx| {
//!     let order = queries::insert_order(tx, 10.0)?;
//!     queries::write_outbox_row(tx, &order.aggregate_id(), &payload)
//! }).await?;
//! ```

use crate::{migrations, DatabaseError, DatabaseResult};
use std::path::Path;
use tokio_rusqlite::Connection;
use tracing::{debug, info};

const PRAGMAS: &str = "
    PRAGMA journal_mode = WAL;
    PRAGMA synchronous = NORMAL;
    PRAGMA foreign_keys = ON;
    PRAGMA temp_store = MEMORY;
    PRAGMA busy_timeout = 5000;
";

/// Convert a tokio_rusqlite::Error to DatabaseError.
fn from_tokio_rusqlite(e: tokio_rusqlite::Error) -> DatabaseError {
    match e {
        tokio_rusqlite::Error::Rusqlite(e) => DatabaseError::Sqlite(e),
        tokio_rusqlite::Error::Close(_) => DatabaseError::Connection("Connection closed".to_string()),
        other => DatabaseError::Connection(other.to_string()),
    }
}

/// Async SQLite database with a dedicated executor thread.
///
/// Cloning is cheap; all clones share the same thread and queue.
#[derive(Clone)]
pub struct AsyncDatabase {
    conn: Connection,
    path: String,
}

impl AsyncDatabase {
    /// Open a database at the given path.
    ///
    /// Creates the file and parent directory if needed, applies pragmas and
    /// runs pending migrations.
    pub async fn open(path: &Path) -> DatabaseResult<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let path_str = path.to_string_lossy().to_string();
        info!(path = %path_str, "Opening database");

        let conn = Connection::open(path)
            .await
            .map_err(|e| DatabaseError::Connection(e.to_string()))?;

        Self::initialize(conn, path_str).await
    }

    /// Open a private in-memory database, mainly for tests.
    pub async fn open_in_memory() -> DatabaseResult<Self> {
        let conn = Connection::open_in_memory()
            .await
            .map_err(|e| DatabaseError::Connection(e.to_string()))?;

        Self::initialize(conn, ":memory:".to_string()).await
    }

    async fn initialize(conn: Connection, path: String) -> DatabaseResult<Self> {
        let db = Self { conn, path };

        db.call_sqlite(|conn| conn.execute_batch(PRAGMAS)).await?;
        db.call(|conn| migrations::run_migrations(conn))
            .await
            .map_err(|e| DatabaseError::Migration(e.to_string()))?;

        info!(path = %db.path, "Database ready");
        Ok(db)
    }

    /// Execute a closure on the database connection.
    ///
    /// The closure runs on the dedicated SQLite thread. Only SQL and light
    /// row mapping belong here; never a network call.
    pub async fn call<F, T>(&self, f: F) -> DatabaseResult<T>
    where
        F: FnOnce(&rusqlite::Connection) -> DatabaseResult<T> + Send + 'static,
        T: Send + 'static,
    {
        // The inner DatabaseResult rides inside tokio_rusqlite's Ok variant.
        let outer = self.conn.call(move |conn| Ok(f(conn))).await;

        match outer {
            Ok(inner) => inner,
            Err(e) => Err(from_tokio_rusqlite(e)),
        }
    }

    /// Execute a closure that returns a rusqlite::Result.
    pub async fn call_sqlite<F, T>(&self, f: F) -> DatabaseResult<T>
    where
        F: FnOnce(&rusqlite::Connection) -> rusqlite::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        self.conn
            .call(move |conn| Ok(f(conn)?))
            .await
            .map_err(from_tokio_rusqlite)
    }

    /// Execute a closure inside one transaction.
    ///
    /// Commits when the closure returns `Ok`, rolls back otherwise.
    pub async fn transaction<F, T>(&self, f: F) -> DatabaseResult<T>
    where
        F: FnOnce(&rusqlite::Transaction<'_>) -> DatabaseResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let outer = self
            .conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                match f(&tx) {
                    Ok(value) => {
                        tx.commit()?;
                        Ok(Ok(value))
                    }
                    // Dropping the transaction rolls it back.
                    Err(e) => Ok(Err(e)),
                }
            })
            .await;

        match outer {
            Ok(inner) => inner,
            Err(e) => Err(from_tokio_rusqlite(e)),
        }
    }

    /// Get the database file path.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Check if the database answers a trivial query.
    pub async fn health_check(&self) -> DatabaseResult<()> {
        self.call_sqlite(|conn| conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0)))
            .await?;
        debug!("Database health check passed");
        Ok(())
    }

    /// Close the database connection once queued operations finish.
    pub async fn close(self) -> DatabaseResult<()> {
        self.conn
            .close()
            .await
            .map_err(|e| DatabaseError::Connection(format!("Failed to close database: {:?}", e)))?;
        info!(path = %self.path, "Database closed");
        Ok(())
    }
}
