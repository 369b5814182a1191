//! Streaming (CDC) change source.

use super::debezium::parse_change_event;
use super::ChangeRecord;
use crate::error::RelayResult;
use async_trait::async_trait;
use tracing::{debug, info};

/// A raw entry read from the change stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamEntry {
    /// Stream entry id (e.g., "1700000000000-0").
    pub id: String,
    /// The change event JSON; `None` when the entry was trimmed from the
    /// stream while still pending.
    pub value: Option<String>,
}

/// Consumer-group access to a durable stream.
#[async_trait]
pub trait ChangeStream: Send {
    /// Entries delivered to this consumer earlier but never acknowledged.
    async fn read_pending(&mut self, count: usize) -> RelayResult<Vec<StreamEntry>>;

    /// Entries never delivered to any consumer of the group. Blocks up to
    /// `block_ms` when given and nothing is available.
    async fn read_new(&mut self, count: usize, block_ms: Option<u64>)
        -> RelayResult<Vec<StreamEntry>>;

    /// Acknowledge entries, removing them from the pending entries list.
    async fn ack(&mut self, ids: &[String]) -> RelayResult<usize>;

    async fn reconnect(&mut self) -> RelayResult<()>;
}

/// Turns stream entries into change records.
///
/// Each cycle first re-reads this consumer's unacknowledged entries (the
/// retries and deferred records of earlier cycles), then tops the batch up
/// with new entries. It only blocks on the stream when nothing is pending,
/// so retried records are never starved by new traffic. Pending entries have
/// lower ids than new ones, which keeps per-aggregate order.
pub struct StreamingSource {
    stream: Box<dyn ChangeStream>,
    batch_size: usize,
    block_timeout_ms: u64,
}

impl StreamingSource {
    pub fn new(stream: Box<dyn ChangeStream>, batch_size: usize, block_timeout_ms: u64) -> Self {
        Self {
            stream,
            batch_size: batch_size.max(1),
            block_timeout_ms,
        }
    }

    pub async fn next_batch(&mut self) -> RelayResult<Vec<ChangeRecord>> {
        let mut entries = self.stream.read_pending(self.batch_size).await?;
        let pending = entries.len();

        let room = self.batch_size.saturating_sub(pending);
        if room > 0 {
            let block = (pending == 0).then_some(self.block_timeout_ms);
            entries.extend(self.stream.read_new(room, block).await?);
        }

        if !entries.is_empty() {
            debug!(
                pending,
                new = entries.len() - pending,
                "Read change stream entries"
            );
        }

        Ok(entries.into_iter().map(entry_to_record).collect())
    }

    pub async fn commit(&mut self, checkpoints: &[String]) -> RelayResult<()> {
        if checkpoints.is_empty() {
            return Ok(());
        }
        let acked = self.stream.ack(checkpoints).await?;
        debug!(requested = checkpoints.len(), acked, "Committed stream checkpoints");
        Ok(())
    }

    pub async fn reconnect(&mut self) -> RelayResult<()> {
        info!("Reconnecting change stream...");
        self.stream.reconnect().await
    }
}

fn entry_to_record(entry: StreamEntry) -> ChangeRecord {
    match entry.value {
        Some(raw) => parse_change_event(&raw, Some(entry.id)),
        None => ChangeRecord::unreadable(Some(entry.id), "stream entry has no value"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::change_source::ChangeOp;
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};

    #[derive(Default)]
    struct Recorded {
        new: VecDeque<StreamEntry>,
        pending: Vec<StreamEntry>,
        blocks: Vec<Option<u64>>,
        acked: Vec<String>,
    }

    struct FakeStream(Arc<Mutex<Recorded>>);

    #[async_trait]
    impl ChangeStream for FakeStream {
        async fn read_pending(&mut self, count: usize) -> RelayResult<Vec<StreamEntry>> {
            let state = self.0.lock().unwrap();
            Ok(state.pending.iter().take(count).cloned().collect())
        }

        async fn read_new(
            &mut self,
            count: usize,
            block_ms: Option<u64>,
        ) -> RelayResult<Vec<StreamEntry>> {
            let mut state = self.0.lock().unwrap();
            state.blocks.push(block_ms);
            let mut out = Vec::new();
            while out.len() < count {
                let Some(entry) = state.new.pop_front() else {
                    break;
                };
                state.pending.push(entry.clone());
                out.push(entry);
            }
            Ok(out)
        }

        async fn ack(&mut self, ids: &[String]) -> RelayResult<usize> {
            let mut state = self.0.lock().unwrap();
            let before = state.pending.len();
            state.pending.retain(|e| !ids.contains(&e.id));
            state.acked.extend(ids.iter().cloned());
            Ok(before - state.pending.len())
        }

        async fn reconnect(&mut self) -> RelayResult<()> {
            Ok(())
        }
    }

    fn entry(id: &str, value: Option<&str>) -> StreamEntry {
        StreamEntry {
            id: id.to_string(),
            value: value.map(str::to_string),
        }
    }

    #[tokio::test]
    async fn test_unacked_entries_are_reread_first() {
        let state = Arc::new(Mutex::new(Recorded::default()));
        {
            let mut s = state.lock().unwrap();
            s.new.push_back(entry("1-0", Some(r#"{"op":"d"}"#)));
            s.new.push_back(entry("2-0", Some(r#"{"op":"d"}"#)));
        }
        let mut source = StreamingSource::new(Box::new(FakeStream(state.clone())), 1, 250);

        let first = source.next_batch().await.unwrap();
        assert_eq!(first[0].checkpoint.as_deref(), Some("1-0"));

        // Not committed: the same entry comes back, without blocking.
        let again = source.next_batch().await.unwrap();
        assert_eq!(again.len(), 1);
        assert_eq!(again[0].checkpoint.as_deref(), Some("1-0"));

        source.commit(&["1-0".to_string()]).await.unwrap();
        let next = source.next_batch().await.unwrap();
        assert_eq!(next[0].checkpoint.as_deref(), Some("2-0"));

        let s = state.lock().unwrap();
        assert_eq!(s.blocks, vec![Some(250), Some(250)]);
        assert_eq!(s.acked, vec!["1-0".to_string()]);
    }

    #[tokio::test]
    async fn test_pending_entries_do_not_block() {
        let state = Arc::new(Mutex::new(Recorded::default()));
        state.lock().unwrap().pending.push(entry("1-0", Some(r#"{"op":"r"}"#)));
        state.lock().unwrap().new.push_back(entry("2-0", Some(r#"{"op":"r"}"#)));

        let mut source = StreamingSource::new(Box::new(FakeStream(state.clone())), 10, 5000);
        let batch = source.next_batch().await.unwrap();

        let ids: Vec<_> = batch.iter().filter_map(|r| r.checkpoint.clone()).collect();
        assert_eq!(ids, vec!["1-0".to_string(), "2-0".to_string()]);
        assert_eq!(state.lock().unwrap().blocks, vec![None]);
    }

    #[tokio::test]
    async fn test_trimmed_entry_is_unreadable() {
        let state = Arc::new(Mutex::new(Recorded::default()));
        state.lock().unwrap().new.push_back(entry("3-0", None));

        let mut source = StreamingSource::new(Box::new(FakeStream(state)), 10, 0);
        let batch = source.next_batch().await.unwrap();
        assert!(matches!(batch[0].op, ChangeOp::Unreadable(_)));
    }

    #[tokio::test]
    async fn test_empty_commit_is_noop() {
        let state = Arc::new(Mutex::new(Recorded::default()));
        let mut source = StreamingSource::new(Box::new(FakeStream(state.clone())), 10, 0);
        source.commit(&[]).await.unwrap();
        assert!(state.lock().unwrap().acked.is_empty());
    }
}
