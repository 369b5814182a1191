//! Change sources: where the dispatcher gets outbox records from.
//!
//! Two variants produce the same [`ChangeRecord`] batches:
//!
//! - [`PollingSource`] queries the outbox table for pending rows. Nothing
//!   needs committing; an undelivered row is simply found again.
//! - [`StreamingSource`] consumes Debezium change events from a Redis
//!   stream through a consumer group. A record's checkpoint (its stream
//!   entry id) is acknowledged only once the dispatcher is done with it.

pub mod debezium;
mod polling;
mod redis_stream;
mod streaming;

use crate::config::SourceKind;
use crate::error::RelayResult;
use chrono::{DateTime, Utc};
use outbox_database::{OutboxRow, OutboxStatus};

pub use polling::PollingSource;
pub use redis_stream::RedisChangeStream;
pub use streaming::{ChangeStream, StreamEntry, StreamingSource};

/// Operation tag of a change record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChangeOp {
    Create,
    Update,
    Delete,
    /// Snapshot read.
    Read,
    /// Any other operation code, kept for logging.
    Other(String),
    /// The event itself could not be parsed.
    Unreadable(String),
}

impl ChangeOp {
    /// Map a Debezium `op` code.
    pub fn from_code(code: &str) -> Self {
        match code {
            "c" => Self::Create,
            "u" => Self::Update,
            "d" => Self::Delete,
            "r" => Self::Read,
            other => Self::Other(other.to_string()),
        }
    }

    /// Only inserts and updates can carry a deliverable row.
    pub fn is_deliverable(&self) -> bool {
        matches!(self, Self::Create | Self::Update)
    }
}

/// After image of a change record.
#[derive(Debug, Clone, PartialEq)]
pub enum RowImage {
    Row(OutboxRow),
    /// Present but missing or mistyping a required column.
    Malformed(String),
}

/// One observed outbox row mutation.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeRecord {
    pub op: ChangeOp,
    pub after: Option<RowImage>,
    /// `status` column of the before image, when the event carries one.
    pub before_status: Option<OutboxStatus>,
    pub source_ts: Option<DateTime<Utc>>,
    /// Stream entry id to acknowledge once processed; `None` for polling.
    pub checkpoint: Option<String>,
}

impl ChangeRecord {
    /// A row found by polling. A pending row is still in its inserted
    /// state, so it is tagged as a create.
    pub fn polled(row: OutboxRow) -> Self {
        Self {
            op: ChangeOp::Create,
            source_ts: Some(row.created_at),
            after: Some(RowImage::Row(row)),
            before_status: None,
            checkpoint: None,
        }
    }

    /// An event that could not be parsed.
    pub fn unreadable(checkpoint: Option<String>, reason: impl Into<String>) -> Self {
        Self {
            op: ChangeOp::Unreadable(reason.into()),
            after: None,
            before_status: None,
            source_ts: None,
            checkpoint,
        }
    }

    /// The row image, when well-formed.
    pub fn row(&self) -> Option<&OutboxRow> {
        match &self.after {
            Some(RowImage::Row(row)) => Some(row),
            _ => None,
        }
    }
}

/// The configured change source.
pub enum ChangeSource {
    Polling(PollingSource),
    Streaming(StreamingSource),
}

impl ChangeSource {
    pub fn kind(&self) -> SourceKind {
        match self {
            Self::Polling(_) => SourceKind::Polling,
            Self::Streaming(_) => SourceKind::Streaming,
        }
    }

    /// Next batch of records. May be empty.
    pub async fn next_batch(&mut self) -> RelayResult<Vec<ChangeRecord>> {
        match self {
            Self::Polling(source) => source.next_batch().await,
            Self::Streaming(source) => source.next_batch().await,
        }
    }

    /// Acknowledge fully processed checkpoints.
    pub async fn commit(&mut self, checkpoints: &[String]) -> RelayResult<()> {
        match self {
            Self::Polling(_) => Ok(()),
            Self::Streaming(source) => source.commit(checkpoints).await,
        }
    }

    /// Rows the dispatcher rejected. Streamed entries are acknowledged
    /// instead, so only polling needs to remember them.
    pub fn remember_rejected(&mut self, ids: &[i64]) {
        if let Self::Polling(source) = self {
            source.remember_rejected(ids);
        }
    }

    /// Re-establish the underlying connection after an error.
    pub async fn recover(&mut self) -> RelayResult<()> {
        match self {
            Self::Polling(_) => Ok(()),
            Self::Streaming(source) => source.reconnect().await,
        }
    }
}
