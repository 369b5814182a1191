//! Delivery sink: the webhook call that applies an event downstream.

use crate::error::RelayResult;
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Serialize;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Response bodies kept for diagnostics are cut to this many bytes.
const MAX_BODY_BYTES: usize = 512;

/// Result of one delivery attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryResult {
    /// 2xx response.
    Success { status: u16 },
    /// Any other HTTP response.
    Failure { status: u16, body: String },
    /// No response within the request timeout.
    Timeout,
    /// Connection refused, DNS failure, reset, ...
    Transport(String),
}

impl DeliveryResult {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }

    /// Failures worth another attempt: 5xx, 408, 429, timeouts and
    /// transport errors.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Success { .. } => false,
            Self::Failure { status, .. } => {
                *status >= 500
                    || *status == StatusCode::REQUEST_TIMEOUT.as_u16()
                    || *status == StatusCode::TOO_MANY_REQUESTS.as_u16()
            }
            Self::Timeout | Self::Transport(_) => true,
        }
    }

    /// Failures that will not succeed on retry (the remaining 4xx, and
    /// anything else outside 2xx that is not retryable).
    pub fn is_permanent(&self) -> bool {
        !self.is_success() && !self.is_retryable()
    }

    /// Short description for logs and `last_error`.
    pub fn describe(&self) -> String {
        match self {
            Self::Success { status } => format!("HTTP {status}"),
            Self::Failure { status, body } if body.is_empty() => format!("HTTP {status}"),
            Self::Failure { status, body } => format!("HTTP {status}: {body}"),
            Self::Timeout => "timeout".to_string(),
            Self::Transport(e) => format!("transport: {e}"),
        }
    }
}

/// Downstream consumer of envelopes.
#[async_trait]
pub trait DeliverySink: Send + Sync {
    /// Apply `status` to the entity identified by `correlation_key`.
    async fn deliver(&self, correlation_key: i64, status: &str) -> DeliveryResult;
}

/// Bounded immediate retries with capped exponential backoff.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Extra attempts after the first one (0 disables immediate retry).
    pub immediate_retries: u32,
    /// Delay before the first retry in milliseconds.
    pub initial_retry_delay_ms: u64,
    /// Maximum delay between retries in milliseconds.
    pub max_retry_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            immediate_retries: 0,
            initial_retry_delay_ms: 200,
            max_retry_delay_ms: 5000,
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `retry` (1-based).
    pub fn delay_for(&self, retry: u32) -> Duration {
        let exp = retry.saturating_sub(1).min(20);
        let delay = self.initial_retry_delay_ms.saturating_mul(1u64 << exp);
        Duration::from_millis(delay.min(self.max_retry_delay_ms))
    }
}

/// Deliver once, then retry retryable failures up to `policy.immediate_retries`
/// times. Returns the last result.
pub async fn deliver_with_retry(
    sink: &dyn DeliverySink,
    policy: &RetryPolicy,
    correlation_key: i64,
    status: &str,
) -> DeliveryResult {
    let mut attempt = 0;

    loop {
        attempt += 1;
        let result = sink.deliver(correlation_key, status).await;

        if !result.is_retryable() || attempt > policy.immediate_retries {
            return result;
        }

        let delay = policy.delay_for(attempt);
        warn!(
            correlation_key,
            attempt,
            delay_ms = delay.as_millis() as u64,
            error = %result.describe(),
            "Delivery failed, retrying"
        );
        tokio::time::sleep(delay).await;
    }
}

/// Request body sent to the webhook.
#[derive(Debug, Serialize)]
struct FinishRequest<'a> {
    order_id: i64,
    status: &'a str,
}

/// Webhook sink posting JSON with reqwest.
pub struct WebhookSink {
    client: Client,
    url: String,
}

impl WebhookSink {
    /// Create a sink with a fixed per-request timeout.
    pub fn new(url: impl Into<String>, timeout: Duration) -> RelayResult<Self> {
        let client = Client::builder().timeout(timeout).build()?;

        Ok(Self {
            client,
            url: url.into(),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl DeliverySink for WebhookSink {
    async fn deliver(&self, correlation_key: i64, status: &str) -> DeliveryResult {
        debug!(url = %self.url, correlation_key, status, "Sending webhook");

        let response = self
            .client
            .post(&self.url)
            .json(&FinishRequest {
                order_id: correlation_key,
                status,
            })
            .send()
            .await;

        match response {
            Ok(resp) => {
                let code = resp.status();
                if code.is_success() {
                    info!(correlation_key, status = code.as_u16(), "Webhook accepted");
                    DeliveryResult::Success {
                        status: code.as_u16(),
                    }
                } else {
                    let body = resp.text().await.unwrap_or_default();
                    DeliveryResult::Failure {
                        status: code.as_u16(),
                        body: truncate(body),
                    }
                }
            }
            Err(e) if e.is_timeout() => DeliveryResult::Timeout,
            Err(e) => DeliveryResult::Transport(e.to_string()),
        }
    }
}

fn truncate(mut body: String) -> String {
    if body.len() > MAX_BODY_BYTES {
        let mut cut = MAX_BODY_BYTES;
        while !body.is_char_boundary(cut) {
            cut -= 1;
        }
        body.truncate(cut);
    }
    body
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn failure(status: u16) -> DeliveryResult {
        DeliveryResult::Failure {
            status,
            body: String::new(),
        }
    }

    #[test]
    fn test_classification() {
        assert!(DeliveryResult::Success { status: 204 }.is_success());

        for status in [500, 502, 503, 408, 429] {
            assert!(failure(status).is_retryable(), "{status} should be retryable");
        }
        for status in [400, 404, 409, 422] {
            assert!(failure(status).is_permanent(), "{status} should be permanent");
        }
        assert!(DeliveryResult::Timeout.is_retryable());
        assert!(DeliveryResult::Transport("refused".into()).is_retryable());
        assert!(!DeliveryResult::Success { status: 200 }.is_permanent());
    }

    #[test]
    fn test_backoff_is_capped() {
        let policy = RetryPolicy {
            immediate_retries: 10,
            initial_retry_delay_ms: 1000,
            max_retry_delay_ms: 60000,
        };

        let delays: Vec<u64> = (1..=8)
            .map(|n| policy.delay_for(n).as_millis() as u64)
            .collect();
        assert_eq!(
            delays,
            vec![1000, 2000, 4000, 8000, 16000, 32000, 60000, 60000]
        );
        assert_eq!(policy.delay_for(u32::MAX), Duration::from_millis(60000));
    }

    #[test]
    fn test_truncate_respects_char_boundaries() {
        let body = "é".repeat(MAX_BODY_BYTES);
        let cut = truncate(body);
        assert!(cut.len() <= MAX_BODY_BYTES);
        assert!(cut.chars().all(|c| c == 'é'));
    }

    struct Scripted {
        results: std::sync::Mutex<Vec<DeliveryResult>>,
        calls: AtomicU32,
    }

    #[async_trait]
    impl DeliverySink for Scripted {
        async fn deliver(&self, _key: i64, _status: &str) -> DeliveryResult {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.results.lock().unwrap().remove(0)
        }
    }

    #[tokio::test]
    async fn test_immediate_retry_until_success() {
        let sink = Scripted {
            results: std::sync::Mutex::new(vec![
                failure(503),
                DeliveryResult::Timeout,
                DeliveryResult::Success { status: 200 },
            ]),
            calls: AtomicU32::new(0),
        };
        let policy = RetryPolicy {
            immediate_retries: 2,
            initial_retry_delay_ms: 1,
            max_retry_delay_ms: 2,
        };

        let result = deliver_with_retry(&sink, &policy, 42, "finished").await;
        assert!(result.is_success());
        assert_eq!(sink.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_no_retry_for_permanent_failure() {
        let sink = Scripted {
            results: std::sync::Mutex::new(vec![failure(422), failure(422)]),
            calls: AtomicU32::new(0),
        };
        let policy = RetryPolicy {
            immediate_retries: 3,
            initial_retry_delay_ms: 1,
            max_retry_delay_ms: 1,
        };

        let result = deliver_with_retry(&sink, &policy, 42, "finished").await;
        assert!(result.is_permanent());
        assert_eq!(sink.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_default_policy_attempts_once() {
        let sink = Scripted {
            results: std::sync::Mutex::new(vec![failure(500), failure(500)]),
            calls: AtomicU32::new(0),
        };

        let result = deliver_with_retry(&sink, &RetryPolicy::default(), 43, "finished").await;
        assert_eq!(result, failure(500));
        assert_eq!(sink.calls.load(Ordering::SeqCst), 1);
    }
}
