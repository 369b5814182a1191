//! HTTP surface: health check and Debezium push ingestion.
//!
//! - `GET /health`: `200 {"status":"ok"}` when the database answers and the
//!   dispatch loop heartbeated recently, `503` otherwise.
//! - `POST /debezium`: one Debezium change event, processed synchronously
//!   through the dispatcher's lanes, so it shares the worker permits and
//!   per-aggregate ordering with the dispatch loop. `200` when processed, skipped or rejected by the sink; `400` for an
//!   unparseable event or poison payload; `500` when the event should be
//!   sent again; `503` while shutting down.

use crate::change_source::debezium::parse_change_event;
use crate::dispatcher::{Dispatcher, Outcome, Rejection};
use crate::error::RelayResult;
use crate::relay::Heartbeat;
use crate::store::OutboxStore;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::json;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::{debug, info, warn};

/// Shared state of the HTTP handlers.
#[derive(Clone)]
pub struct HttpState {
    pub store: Arc<dyn OutboxStore>,
    pub dispatcher: Dispatcher,
    pub heartbeat: Heartbeat,
    pub staleness: Duration,
}

pub fn router(state: HttpState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/debezium", post(debezium))
        .with_state(state)
}

/// Bind the listener. Failing to bind is a start-up error.
pub async fn bind(addr: SocketAddr) -> RelayResult<TcpListener> {
    let listener = TcpListener::bind(addr).await?;
    info!(addr = %listener.local_addr()?, "HTTP listener bound");
    Ok(listener)
}

/// Serve until `shutdown` resolves.
pub async fn serve(
    listener: TcpListener,
    state: HttpState,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> RelayResult<()> {
    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}

async fn health(State(state): State<HttpState>) -> Response {
    if let Err(e) = state.store.ping().await {
        warn!(error = %e, "Health check: database unavailable");
        return unavailable(format!("database: {e}"));
    }

    if !state.heartbeat.is_fresh(state.staleness) {
        let age = state.heartbeat.age().map(|a| a.as_secs());
        warn!(heartbeat_age_secs = age, "Health check: dispatch loop stale");
        return unavailable("dispatch loop heartbeat is stale".to_string());
    }

    (StatusCode::OK, Json(json!({"status": "ok"}))).into_response()
}

fn unavailable(reason: String) -> Response {
    (
        StatusCode::SERVICE_UNAVAILABLE,
        Json(json!({"status": "unavailable", "reason": reason})),
    )
        .into_response()
}

async fn debezium(State(state): State<HttpState>, body: String) -> Response {
    debug!(bytes = body.len(), "Received debezium event");

    let record = parse_change_event(&body, None);
    let outcome = state.dispatcher.dispatch_one(record).await;

    let (status, body) = match &outcome {
        Outcome::Acked {
            outbox_id,
            rows_affected,
        } => (
            StatusCode::OK,
            json!({"status": "processed", "outbox_id": outbox_id, "rows_affected": rows_affected}),
        ),
        Outcome::Skipped(reason) => (StatusCode::OK, json!({"status": "skipped", "reason": reason})),
        Outcome::Rejected(Rejection::Permanent { status, detail }) => (
            StatusCode::OK,
            json!({"status": "rejected", "http_status": status, "error": detail}),
        ),
        Outcome::Rejected(Rejection::Poison(reason)) => (
            StatusCode::BAD_REQUEST,
            json!({"status": "invalid", "error": reason}),
        ),
        Outcome::Retry { outbox_id, reason } => (
            StatusCode::INTERNAL_SERVER_ERROR,
            json!({"status": "retry", "outbox_id": outbox_id, "error": reason}),
        ),
        Outcome::Deferred => (
            StatusCode::SERVICE_UNAVAILABLE,
            json!({"status": "deferred"}),
        ),
    };

    (status, Json(body)).into_response()
}
