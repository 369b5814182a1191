//! Dispatcher: drives each change record through
//! `RECEIVED -> VALIDATED -> DELIVERING -> {ACKED | RETRY | REJECTED}`.
//!
//! A batch is split into per-aggregate lanes. Records within a lane run
//! strictly one after another in `(created_at, id)` order, and a RETRY stops
//! the lane for the rest of the cycle so a later event never overtakes an
//! earlier one. Lanes of different aggregates run concurrently, bounded by a
//! semaphore of `worker_count` permits. An aggregate is held by at most one
//! lane at a time, so pushed events and the dispatch loop never deliver two
//! events of the same aggregate concurrently.
//!
//! No database transaction is held while a webhook call is in flight: the
//! only writes are single conditional updates issued after delivery.

use crate::change_source::{ChangeOp, ChangeRecord, RowImage};
use crate::config::{FailurePolicy, RelayConfig, SourceKind};
use crate::envelope::{self, Decoded, Envelope};
use crate::sink::{deliver_with_retry, DeliveryResult, DeliverySink, RetryPolicy};
use crate::store::OutboxStore;
use outbox_database::{OutboxRow, OutboxStatus};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::{watch, Mutex as AsyncMutex, OwnedMutexGuard, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, error, info, trace, warn};

/// Processing state of one record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchState {
    Received,
    Validated,
    Delivering,
    Acked,
    Retry,
    Rejected,
}

/// Why a record was rejected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Rejection {
    /// The record or its payload can never be processed.
    Poison(String),
    /// The sink refused the request itself.
    Permanent { status: u16, detail: String },
}

/// Final outcome of one record in one cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Delivered; `rows_affected` is what the publish update reported.
    Acked { outbox_id: i64, rows_affected: usize },
    /// Left pending (or unacknowledged) for a later cycle.
    Retry { outbox_id: i64, reason: String },
    Rejected(Rejection),
    /// Not a deliverable event (delete, snapshot read, no after image,
    /// row no longer pending).
    Skipped(&'static str),
    /// Not attempted because an earlier record of the same aggregate is
    /// being retried, or shutdown was requested.
    Deferred,
}

impl Outcome {
    pub fn state(&self) -> Option<DispatchState> {
        match self {
            Self::Acked { .. } => Some(DispatchState::Acked),
            Self::Retry { .. } => Some(DispatchState::Retry),
            Self::Rejected(_) => Some(DispatchState::Rejected),
            Self::Skipped(_) | Self::Deferred => None,
        }
    }

    /// Whether the record's checkpoint may be acknowledged.
    pub fn is_final(&self) -> bool {
        !matches!(self, Self::Retry { .. } | Self::Deferred)
    }
}

/// Per-cycle statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CycleReport {
    pub received: usize,
    pub acked: usize,
    /// Delivered, but another relay had already published the row.
    pub already_published: usize,
    pub retried: usize,
    pub rejected_poison: usize,
    pub rejected_permanent: usize,
    pub skipped: usize,
    pub deferred: usize,
}

impl CycleReport {
    pub fn record(&mut self, outcome: &Outcome) {
        match outcome {
            Outcome::Acked { rows_affected: 0, .. } => self.already_published += 1,
            Outcome::Acked { .. } => self.acked += 1,
            Outcome::Retry { .. } => self.retried += 1,
            Outcome::Rejected(Rejection::Poison(_)) => self.rejected_poison += 1,
            Outcome::Rejected(Rejection::Permanent { .. }) => self.rejected_permanent += 1,
            Outcome::Skipped(_) => self.skipped += 1,
            Outcome::Deferred => self.deferred += 1,
        }
    }

    /// Whether anything was left for a later cycle.
    pub fn has_leftovers(&self) -> bool {
        self.retried > 0 || self.deferred > 0
    }

    /// Whether any row left the pending state through a delivery.
    pub fn made_progress(&self) -> bool {
        self.acked > 0 || self.already_published > 0
    }
}

/// Result of dispatching one batch.
#[derive(Debug, Default)]
pub struct BatchResult {
    pub report: CycleReport,
    /// Checkpoints of records that reached a final outcome, in input order.
    pub commit: Vec<String>,
    /// Outcome of every input record, in input order.
    pub outcomes: Vec<Outcome>,
    /// Outbox ids of rejected rows. Poison rows, and permanent rejections
    /// under `leave-pending`, are still pending afterwards.
    pub rejected_ids: Vec<i64>,
}

/// Dispatcher settings derived from [`RelayConfig`].
#[derive(Debug, Clone)]
pub struct DispatchSettings {
    pub status_to_apply: String,
    pub failure_policy: FailurePolicy,
    pub retry: RetryPolicy,
    pub worker_count: usize,
    /// Write `attempts`/`last_error` after a transient failure. Off for the
    /// streaming source, where each such write comes back as a change event.
    pub record_attempts: bool,
}

impl From<&RelayConfig> for DispatchSettings {
    fn from(config: &RelayConfig) -> Self {
        Self {
            status_to_apply: config.status_to_apply.clone(),
            failure_policy: config.failure_policy,
            retry: config.retry.clone(),
            worker_count: config.worker_count,
            record_attempts: config.source == SourceKind::Polling,
        }
    }
}

/// One async lock per aggregate currently being dispatched.
#[derive(Default)]
struct AggregateLocks {
    locks: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl AggregateLocks {
    async fn acquire(&self, aggregate_id: &str) -> OwnedMutexGuard<()> {
        let lock = self
            .locks
            .lock()
            .entry(aggregate_id.to_string())
            .or_default()
            .clone();
        lock.lock_owned().await
    }

    /// Drop the entry once nobody else holds or waits on it.
    fn release(&self, aggregate_id: &str, guard: OwnedMutexGuard<()>) {
        let mut locks = self.locks.lock();
        drop(guard);
        if let Some(lock) = locks.get(aggregate_id) {
            if Arc::strong_count(lock) == 1 {
                locks.remove(aggregate_id);
            }
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.locks.lock().len()
    }
}

/// Delivers change records and records their status. Cheap to clone.
#[derive(Clone)]
pub struct Dispatcher {
    store: Arc<dyn OutboxStore>,
    sink: Arc<dyn DeliverySink>,
    settings: Arc<DispatchSettings>,
    permits: Arc<Semaphore>,
    aggregates: Arc<AggregateLocks>,
    shutdown: watch::Receiver<bool>,
}

impl Dispatcher {
    pub fn new(
        store: Arc<dyn OutboxStore>,
        sink: Arc<dyn DeliverySink>,
        settings: DispatchSettings,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        let permits = Arc::new(Semaphore::new(settings.worker_count.max(1)));
        Self {
            store,
            sink,
            settings: Arc::new(settings),
            permits,
            aggregates: Arc::default(),
            shutdown,
        }
    }

    pub fn settings(&self) -> &DispatchSettings {
        &self.settings
    }

    fn stopping(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Dispatch one pushed record through the same lanes and permits as a
    /// batch.
    pub async fn dispatch_one(&self, record: ChangeRecord) -> Outcome {
        self.dispatch_batch(vec![record])
            .await
            .outcomes
            .pop()
            .unwrap_or(Outcome::Deferred)
    }

    /// Dispatch a batch, preserving per-aggregate order.
    pub async fn dispatch_batch(&self, records: Vec<ChangeRecord>) -> BatchResult {
        let mut outcomes: Vec<Option<Outcome>> = vec![None; records.len()];
        let mut lanes: BTreeMap<String, Vec<(usize, ChangeRecord)>> = BTreeMap::new();

        for (index, record) in records.iter().enumerate() {
            match record.row() {
                // Records without a usable row never reach the sink.
                Some(row) if record.op.is_deliverable() => lanes
                    .entry(row.aggregate_id.clone())
                    .or_default()
                    .push((index, record.clone())),
                _ => outcomes[index] = Some(self.process_record(record).await),
            }
        }

        let mut tasks = JoinSet::new();
        for (aggregate_id, mut lane) in lanes {
            lane.sort_by(|(_, a), (_, b)| lane_key(a).cmp(&lane_key(b)));
            let dispatcher = self.clone();
            tasks.spawn(async move { dispatcher.run_lane(aggregate_id, lane).await });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(lane_outcomes) => {
                    for (index, outcome) in lane_outcomes {
                        outcomes[index] = Some(outcome);
                    }
                }
                Err(e) => error!(error = %e, "Dispatch lane task failed"),
            }
        }

        let mut result = BatchResult {
            report: CycleReport {
                received: records.len(),
                ..Default::default()
            },
            ..Default::default()
        };

        for (record, outcome) in records.into_iter().zip(outcomes) {
            // A lane that panicked leaves its records for the next cycle.
            let outcome = outcome.unwrap_or(Outcome::Deferred);
            result.report.record(&outcome);
            if let (Outcome::Rejected(_), Some(row)) = (&outcome, record.row()) {
                result.rejected_ids.push(row.id);
            }
            if outcome.is_final() {
                if let Some(checkpoint) = record.checkpoint {
                    result.commit.push(checkpoint);
                }
            }
            result.outcomes.push(outcome);
        }

        result
    }

    async fn run_lane(
        &self,
        aggregate_id: String,
        lane: Vec<(usize, ChangeRecord)>,
    ) -> Vec<(usize, Outcome)> {
        let mut results = Vec::with_capacity(lane.len());

        // Aggregate first, then permit: a permit is never held while waiting.
        let guard = self.aggregates.acquire(&aggregate_id).await;
        let permit = match self.permits.clone().acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => {
                self.aggregates.release(&aggregate_id, guard);
                return lane
                    .into_iter()
                    .map(|(index, _)| (index, Outcome::Deferred))
                    .collect();
            }
        };

        let mut halted = false;
        for (index, record) in lane {
            if halted || self.stopping() {
                results.push((index, Outcome::Deferred));
                continue;
            }

            let outcome = self.process_record(&record).await;
            if matches!(outcome, Outcome::Retry { .. }) {
                debug!(aggregate_id = %aggregate_id, "Lane halted until next cycle");
                halted = true;
            }
            results.push((index, outcome));
        }

        drop(permit);
        self.aggregates.release(&aggregate_id, guard);
        results
    }

    /// Process a single record to its outcome.
    pub async fn process_record(&self, record: &ChangeRecord) -> Outcome {
        trace!(state = ?DispatchState::Received, op = ?record.op, "Record received");

        match &record.op {
            ChangeOp::Unreadable(reason) => return self.reject_poison(None, reason.clone()),
            op if !op.is_deliverable() => {
                debug!(op = ?op, "Skipping non-insert/update change");
                return Outcome::Skipped("operation");
            }
            _ => {}
        }

        let row = match &record.after {
            None => {
                debug!("No after image in change, skipping");
                return Outcome::Skipped("no after image");
            }
            Some(RowImage::Malformed(reason)) => {
                return self.reject_poison(None, format!("malformed after image: {reason}"))
            }
            Some(RowImage::Row(row)) => row,
        };

        // The relay's own published/failed updates come back through CDC.
        if row.status != OutboxStatus::Pending {
            debug!(outbox_id = row.id, status = %row.status, "Row no longer pending, skipping");
            return Outcome::Skipped("not pending");
        }

        // Only attempt bookkeeping changed; the original event is still owed.
        if record.op == ChangeOp::Update && record.before_status == Some(OutboxStatus::Pending) {
            debug!(outbox_id = row.id, "Pending row touched while pending, skipping");
            return Outcome::Skipped("still pending");
        }

        let envelope = match envelope::decode(&row.payload, &self.settings.status_to_apply) {
            Decoded::Valid(envelope) => envelope,
            Decoded::Invalid(reason) => return self.reject_poison(Some(row), reason),
        };
        trace!(
            state = ?DispatchState::Validated,
            outbox_id = row.id,
            correlation_key = envelope.correlation_key,
            "Envelope decoded"
        );

        self.deliver(row, &envelope).await
    }

    async fn deliver(&self, row: &OutboxRow, envelope: &Envelope) -> Outcome {
        trace!(state = ?DispatchState::Delivering, outbox_id = row.id, "Delivering");

        let result = deliver_with_retry(
            self.sink.as_ref(),
            &self.settings.retry,
            envelope.correlation_key,
            &envelope.status_to_apply,
        )
        .await;

        if result.is_success() {
            return self.acknowledge(row).await;
        }

        let reason = result.describe();

        if result.is_retryable() {
            warn!(
                outbox_id = row.id,
                aggregate_id = %row.aggregate_id,
                error = %reason,
                "Delivery failed, row stays pending"
            );
            if self.settings.record_attempts {
                if let Err(e) = self.store.record_attempt_failure(row.id, &reason).await {
                    warn!(outbox_id = row.id, error = %e, "Failed to record delivery attempt");
                }
            }
            return Outcome::Retry {
                outbox_id: row.id,
                reason,
            };
        }

        self.reject_permanent(row, result, reason).await
    }

    async fn acknowledge(&self, row: &OutboxRow) -> Outcome {
        match self.store.mark_published(row.id).await {
            Ok(0) => {
                debug!(outbox_id = row.id, "Row already published, nothing to do");
                Outcome::Acked {
                    outbox_id: row.id,
                    rows_affected: 0,
                }
            }
            Ok(rows_affected) => {
                if rows_affected > 1 {
                    // `id` is the primary key; more than one row means the
                    // table is corrupt. The delivery itself happened.
                    error!(
                        outbox_id = row.id,
                        rows_affected, "Integrity violation: publish updated more than one row"
                    );
                }
                info!(
                    outbox_id = row.id,
                    aggregate_id = %row.aggregate_id,
                    "Outbox row marked as published"
                );
                Outcome::Acked {
                    outbox_id: row.id,
                    rows_affected,
                }
            }
            Err(e) => {
                // Delivered but not recorded: the row is redelivered later,
                // which an idempotent consumer absorbs.
                warn!(outbox_id = row.id, error = %e, "Failed to mark row published");
                Outcome::Retry {
                    outbox_id: row.id,
                    reason: format!("mark published: {e}"),
                }
            }
        }
    }

    async fn reject_permanent(
        &self,
        row: &OutboxRow,
        result: DeliveryResult,
        reason: String,
    ) -> Outcome {
        let status = match result {
            DeliveryResult::Failure { status, .. } => status,
            _ => 0,
        };

        error!(
            outbox_id = row.id,
            aggregate_id = %row.aggregate_id,
            http_status = status,
            error = %reason,
            policy = ?self.settings.failure_policy,
            "Delivery permanently rejected"
        );

        if self.settings.failure_policy == FailurePolicy::MarkFailed {
            match self.store.mark_failed(row.id, &reason).await {
                Ok(_) => {}
                Err(e) => {
                    // Not recorded; the row is attempted again next cycle.
                    warn!(outbox_id = row.id, error = %e, "Failed to mark row failed");
                    return Outcome::Retry {
                        outbox_id: row.id,
                        reason: format!("mark failed: {e}"),
                    };
                }
            }
        }

        Outcome::Rejected(Rejection::Permanent {
            status,
            detail: reason,
        })
    }

    fn reject_poison(&self, row: Option<&OutboxRow>, reason: String) -> Outcome {
        error!(
            outbox_id = row.map(|r| r.id),
            aggregate_id = row.map(|r| r.aggregate_id.as_str()),
            reason = %reason,
            "Rejecting poison record"
        );
        Outcome::Rejected(Rejection::Poison(reason))
    }
}

fn lane_key(record: &ChangeRecord) -> (chrono::DateTime<chrono::Utc>, i64) {
    match record.row() {
        Some(row) => (row.created_at, row.id),
        None => (chrono::DateTime::<chrono::Utc>::MIN_UTC, 0),
    }
}
