//! Status store seam between the dispatcher and the outbox table.

use crate::error::RelayResult;
use async_trait::async_trait;
use outbox_database::{queries, AsyncDatabase, OutboxRow};

/// Outbox status operations used by the relay.
///
/// Every write is a single conditional update guarded by
/// `status = 'pending'`, which is the only concurrency control needed
/// between relay instances.
#[async_trait]
pub trait OutboxStore: Send + Sync {
    /// Oldest pending rows, ordered by `(created_at, id)`.
    async fn pending_rows(&self, limit: usize) -> RelayResult<Vec<OutboxRow>>;

    /// `pending -> published`. Returns rows affected.
    async fn mark_published(&self, id: i64) -> RelayResult<usize>;

    /// `pending -> failed`. Returns rows affected.
    async fn mark_failed(&self, id: i64, reason: &str) -> RelayResult<usize>;

    /// Bump the attempt counter of a row that stays pending.
    async fn record_attempt_failure(&self, id: i64, reason: &str) -> RelayResult<()>;

    /// Liveness check.
    async fn ping(&self) -> RelayResult<()>;
}

/// [`OutboxStore`] backed by the SQLite executor.
#[derive(Clone)]
pub struct SqliteOutboxStore {
    db: AsyncDatabase,
}

impl SqliteOutboxStore {
    pub fn new(db: AsyncDatabase) -> Self {
        Self { db }
    }

    pub fn database(&self) -> &AsyncDatabase {
        &self.db
    }
}

#[async_trait]
impl OutboxStore for SqliteOutboxStore {
    async fn pending_rows(&self, limit: usize) -> RelayResult<Vec<OutboxRow>> {
        Ok(self
            .db
            .call(move |conn| queries::pending_outbox_rows(conn, limit))
            .await?)
    }

    async fn mark_published(&self, id: i64) -> RelayResult<usize> {
        Ok(self
            .db
            .call(move |conn| queries::mark_outbox_published(conn, id))
            .await?)
    }

    async fn mark_failed(&self, id: i64, reason: &str) -> RelayResult<usize> {
        let reason = reason.to_string();
        Ok(self
            .db
            .call(move |conn| queries::mark_outbox_failed(conn, id, &reason))
            .await?)
    }

    async fn record_attempt_failure(&self, id: i64, reason: &str) -> RelayResult<()> {
        let reason = reason.to_string();
        self.db
            .call(move |conn| queries::record_outbox_attempt_failure(conn, id, &reason))
            .await?;
        Ok(())
    }

    async fn ping(&self) -> RelayResult<()> {
        Ok(self.db.health_check().await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use outbox_database::OutboxStatus;

    #[tokio::test]
    async fn test_sqlite_store_roundtrip() {
        let db = AsyncDatabase::open_in_memory().await.unwrap();
        let store = SqliteOutboxStore::new(db.clone());

        let id = db
            .call(|conn| queries::write_outbox_row(conn, "order-42", r#"{"id":42}"#))
            .await
            .unwrap();

        let pending = store.pending_rows(10).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, id);

        store.record_attempt_failure(id, "HTTP 500").await.unwrap();
        assert_eq!(store.mark_published(id).await.unwrap(), 1);
        assert_eq!(store.mark_published(id).await.unwrap(), 0);
        assert_eq!(store.mark_failed(id, "late").await.unwrap(), 0);

        let row = db
            .call(move |conn| queries::get_outbox_row(conn, id))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(row.status, OutboxStatus::Published);
        assert_eq!(row.attempts, 1);
        assert!(store.pending_rows(10).await.unwrap().is_empty());
        assert!(store.ping().await.is_ok());
    }
}
