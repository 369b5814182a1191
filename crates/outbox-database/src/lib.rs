//! SQLite persistence for the outbox relay.
//!
//! This crate provides:
//! - Async SQLite executor with a dedicated thread
//! - Versioned schema migrations (`orders`, `outbox`)
//! - Model types for both tables
//! - Query helpers, including the conditional status updates the relay
//!   relies on for idempotent acknowledgement
//!
//! # Architecture
//!
//! The `AsyncDatabase` uses a single dedicated thread for all SQLite
//! operations. Queries are sent through a channel and executed in FIFO order.
//!
//! ```ignore
//! let db = AsyncDatabase::open(path).await?;
//! let rows = db.call(|conn| queries::pending_outbox_rows(conn, 100)).await?;
//! ```
//!
//! **Important**: Only SQL operations should run inside `db.call()`.
//! Network calls in particular must happen outside, so that no transaction
//! is ever held open across a webhook delivery.

mod error;
mod executor;
mod migrations;
mod models;
pub mod queries;

pub use error::{DatabaseError, DatabaseResult};
pub use executor::AsyncDatabase;
pub use migrations::{run_migrations, schema_version, CURRENT_VERSION};
pub use models::*;
