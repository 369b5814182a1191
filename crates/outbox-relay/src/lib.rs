//! Outbox relay: delivers transactional outbox events to a webhook.
//!
//! Producers write an outbox row in the same transaction as the business
//! change. The relay discovers pending rows, delivers each one at least once
//! and only then marks it published.
//!
//! # Guarantees
//!
//! 1. **Publish after delivery**: a row becomes `published` only after a 2xx
//!    from the webhook, through a conditional `WHERE status = 'pending'`
//!    update.
//! 2. **Per-aggregate order**: events of one aggregate are delivered one at a
//!    time in `(created_at, id)` order.
//! 3. **Restart safe**: anything not marked (or not acknowledged on the
//!    stream) is found again by the next cycle.
//! 4. **Poison isolation**: a record that cannot be decoded is logged and
//!    dropped without blocking the others.
//!
//! # Architecture
//!
//! ```text
//! outbox table --(poll | CDC stream)--> Dispatcher --POST--> webhook
//!      ^                                    |
//!      |______ UPDATE ... published <______|
//! ```

pub mod change_source;
pub mod config;
pub mod dispatcher;
pub mod envelope;
pub mod error;
pub mod http;
pub mod orders;
pub mod relay;
pub mod sink;
pub mod store;

#[cfg(test)]
mod tests;

pub use change_source::{ChangeOp, ChangeRecord, ChangeSource, PollingSource, StreamingSource};
pub use config::{FailurePolicy, RelayConfig, SourceKind};
pub use dispatcher::{CycleReport, DispatchSettings, Dispatcher, Outcome, Rejection};
pub use envelope::{Decoded, Envelope};
pub use error::{RelayError, RelayResult};
pub use relay::{Heartbeat, LoopSettings, Relay, Shutdown};
pub use sink::{DeliveryResult, DeliverySink, RetryPolicy, WebhookSink};
pub use store::{OutboxStore, SqliteOutboxStore};
