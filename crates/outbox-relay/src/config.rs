//! Configuration for the relay.
//!
//! Built once at start-up from command-line arguments and environment
//! variables, then passed by value to the components that need it.

use crate::error::{RelayError, RelayResult};
use crate::sink::RetryPolicy;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Where pending outbox records are discovered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum SourceKind {
    /// Periodically query the outbox table.
    #[default]
    Polling,
    /// Consume CDC events from a Redis stream.
    Streaming,
}

impl SourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Polling => "polling",
            Self::Streaming => "streaming",
        }
    }
}

/// What to do with a row after a permanent (non-retryable 4xx) failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum FailurePolicy {
    /// Set `status = 'failed'` so the row is never attempted again.
    #[default]
    MarkFailed,
    /// Leave the row pending; it is retried on every cycle.
    LeavePending,
}

/// Relay configuration.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// SQLite database holding the `orders` and `outbox` tables
    pub database_path: PathBuf,

    /// Webhook that receives `{"order_id", "status"}` deliveries
    pub webhook_url: String,

    /// Change source variant
    pub source: SourceKind,

    /// Wait between polling cycles, and after a cycle that left retries
    pub poll_interval: Duration,

    /// Maximum records pulled per cycle
    pub batch_size: usize,

    /// Aggregates delivered concurrently
    pub worker_count: usize,

    /// Per-request webhook timeout
    pub delivery_timeout: Duration,

    /// Status value sent to the webhook for every event
    pub status_to_apply: String,

    /// Handling of permanent delivery failures
    pub failure_policy: FailurePolicy,

    /// Immediate in-process retries before falling back to the next cycle
    pub retry: RetryPolicy,

    /// Redis connection URL (streaming source)
    pub redis_url: String,

    /// Redis stream carrying CDC events for the outbox table
    pub stream_key: String,

    /// Consumer group name
    pub consumer_group: String,

    /// Consumer name (unique per instance)
    pub consumer_name: String,

    /// XREADGROUP block timeout in milliseconds
    pub block_timeout_ms: u64,

    /// Address for `/health` and `/debezium`
    pub listen_addr: SocketAddr,

    /// Heartbeat age beyond which `/health` reports unavailable
    pub health_staleness: Duration,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            database_path: PathBuf::from("outbox.db"),
            webhook_url: "http://webhook-consumer:8082/orders/finish".to_string(),
            source: SourceKind::Polling,
            poll_interval: Duration::from_millis(1000),
            batch_size: 100,
            worker_count: 4,
            delivery_timeout: Duration::from_secs(5),
            status_to_apply: "finished".to_string(),
            failure_policy: FailurePolicy::MarkFailed,
            retry: RetryPolicy::default(),
            redis_url: "redis://127.0.0.1:6379".to_string(),
            stream_key: "outbox.events".to_string(),
            consumer_group: "outbox-relay".to_string(),
            consumer_name: format!("outbox-relay-{}", uuid::Uuid::new_v4()),
            block_timeout_ms: 5000,
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 8081)),
            health_staleness: Duration::from_secs(60),
        }
    }
}

impl RelayConfig {
    /// Reject settings the relay cannot run with.
    pub fn validate(&self) -> RelayResult<()> {
        if self.webhook_url.trim().is_empty() {
            return Err(RelayError::Config("webhook URL must not be empty".to_string()));
        }
        if !self.webhook_url.starts_with("http://") && !self.webhook_url.starts_with("https://") {
            return Err(RelayError::Config(format!(
                "webhook URL must be http(s): {}",
                self.webhook_url
            )));
        }
        if self.batch_size == 0 {
            return Err(RelayError::Config("batch size must be at least 1".to_string()));
        }
        if self.worker_count == 0 {
            return Err(RelayError::Config("worker count must be at least 1".to_string()));
        }
        if self.delivery_timeout.is_zero() {
            return Err(RelayError::Config("delivery timeout must be positive".to_string()));
        }
        if self.status_to_apply.trim().is_empty() {
            return Err(RelayError::Config("status to apply must not be empty".to_string()));
        }
        if self.source == SourceKind::Streaming && self.stream_key.is_empty() {
            return Err(RelayError::Config("stream key must not be empty".to_string()));
        }
        Ok(())
    }
}
