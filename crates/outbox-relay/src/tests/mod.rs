//! Integration tests for the outbox relay.
//!
//! - `harness.rs`      - Mock sink, mock change stream, webhook receiver
//! - `delivery.rs`     - Publish after delivery, retryable failures
//! - `poison.rs`       - Malformed records are isolated
//! - `ordering.rs`     - Per-aggregate order, lane halting, worker limit
//! - `idempotency.rs`  - Conditional status updates, competing relays
//! - `crash_safety.rs` - Re-discovery after crashes, atomic writes
//! - `permanent.rs`    - 4xx handling under both failure policies
//! - `streaming.rs`    - Consumer group acknowledgement rules
//! - `http_surface.rs` - `/health` and `/debezium`
//! - `webhook.rs`      - Webhook sink against a real HTTP receiver
//! - `run_loop.rs`     - Relay loop lifecycle and recovery

mod permanent;
