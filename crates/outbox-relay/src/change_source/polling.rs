//! Polling change source.

use super::ChangeRecord;
use crate::error::RelayResult;
use crate::store::OutboxStore;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::debug;

/// Reads the oldest pending rows on every cycle.
///
/// A row that was not published is returned again by the next poll, which
/// is what makes restarts safe. Rows rejected without a status change
/// (poison payloads, `leave-pending` rejections) are remembered for the
/// life of the process and skipped, so they cannot fill every batch.
pub struct PollingSource {
    store: Arc<dyn OutboxStore>,
    batch_size: usize,
    rejected: HashSet<i64>,
}

impl PollingSource {
    pub fn new(store: Arc<dyn OutboxStore>, batch_size: usize) -> Self {
        Self {
            store,
            batch_size: batch_size.max(1),
            rejected: HashSet::new(),
        }
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub async fn next_batch(&mut self) -> RelayResult<Vec<ChangeRecord>> {
        // Over-fetch by the number of skipped rows to still fill a batch.
        let limit = self.batch_size + self.rejected.len();
        let rows = self.store.pending_rows(limit).await?;

        if rows.len() < limit {
            // Every pending row was returned; forget the ones that left.
            self.rejected.retain(|id| rows.iter().any(|row| row.id == *id));
        }

        let rejected = &self.rejected;
        let batch: Vec<ChangeRecord> = rows
            .into_iter()
            .filter(|row| !rejected.contains(&row.id))
            .take(self.batch_size)
            .map(ChangeRecord::polled)
            .collect();

        debug!(
            count = batch.len(),
            skipped = self.rejected.len(),
            "Polled pending outbox rows"
        );
        Ok(batch)
    }

    /// Skip these rows on later polls.
    pub fn remember_rejected(&mut self, ids: &[i64]) {
        self.rejected.extend(ids.iter().copied());
    }
}
