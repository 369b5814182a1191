//! Permanent (non-retryable 4xx) delivery failures.

use super::harness::{default_settings, order_payload, SinkResponse, TestHarness};
use crate::config::FailurePolicy;
use crate::dispatcher::{DispatchSettings, Outcome, Rejection};
use outbox_database::OutboxStatus;

#[tokio::test]
async fn client_error_marks_row_failed() {
    let h = TestHarness::new().await;
    let id = h.insert_event("order-1", &order_payload(1)).await;
    h.sink.queue_for(1, SinkResponse::Status(422));

    let batch = h.poll_once().await;

    assert_eq!(batch.report.rejected_permanent, 1);
    assert!(matches!(
        &batch.outcomes[0],
        Outcome::Rejected(Rejection::Permanent { status: 422, .. })
    ));

    let row = h.row(id).await;
    assert_eq!(row.status, OutboxStatus::Failed);
    assert_eq!(row.attempts, 1);
    assert!(row.last_error.as_deref().unwrap_or("").contains("422"));

    // Terminal: never picked up again.
    let again = h.poll_once().await;
    assert_eq!(again.report.received, 0);
    assert_eq!(h.sink.delivery_count(), 1);
}

#[tokio::test]
async fn leave_pending_policy_keeps_row_for_a_later_run() {
    let h = TestHarness::with_settings(DispatchSettings {
        failure_policy: FailurePolicy::LeavePending,
        ..default_settings()
    })
    .await;
    let id = h.insert_event("order-2", &order_payload(2)).await;
    h.sink.queue_for(2, SinkResponse::Status(404));

    let first = h.poll_once().await;
    assert_eq!(first.report.rejected_permanent, 1);
    assert_eq!(h.row(id).await.status, OutboxStatus::Pending);

    let second = h.poll_once().await;
    assert_eq!(second.report.acked, 1);
    assert_eq!(h.row(id).await.status, OutboxStatus::Published);
}

#[tokio::test]
async fn permanent_failure_does_not_halt_its_aggregate() {
    let h = TestHarness::new().await;
    let rejected = h.insert_event_at("order-1", &order_payload(1), 0).await;
    let next = h.insert_event_at("order-1", &order_payload(2), 1).await;
    h.sink.queue_for(1, SinkResponse::Status(400));

    let batch = h.poll_once().await;

    assert_eq!(batch.report.rejected_permanent, 1);
    assert_eq!(batch.report.acked, 1);
    assert_eq!(h.row(rejected).await.status, OutboxStatus::Failed);
    assert_eq!(h.row(next).await.status, OutboxStatus::Published);
}

#[tokio::test]
async fn leave_pending_rejection_is_not_resent_by_the_same_relay() {
    let h = TestHarness::with_settings(DispatchSettings {
        failure_policy: FailurePolicy::LeavePending,
        ..default_settings()
    })
    .await;
    let id = h.insert_event("order-3", &order_payload(3)).await;
    h.sink.queue_for(3, SinkResponse::Status(422));

    let mut relay = h.relay(h.polling_source(10));
    let first = relay.run_cycle().await.unwrap();
    let second = relay.run_cycle().await.unwrap();

    assert_eq!(first.rejected_permanent, 1);
    assert_eq!(second.received, 0);
    assert_eq!(h.sink.delivery_count(), 1);
    assert_eq!(h.row(id).await.status, OutboxStatus::Pending);
}
