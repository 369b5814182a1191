//! Redis Streams change stream.
//!
//! Handles XGROUP, XREADGROUP and XACK against the stream a CDC connector
//! (e.g. Debezium Server's Redis sink) writes outbox change events to.

use super::streaming::{ChangeStream, StreamEntry};
use crate::config::RelayConfig;
use crate::error::{RelayError, RelayResult};
use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::{AsyncCommands, Client, RedisResult, Value};
use tracing::{debug, info, warn};

/// Consumer-group reader for one Redis stream.
pub struct RedisChangeStream {
    client: Client,
    conn: MultiplexedConnection,
    stream_key: String,
    consumer_group: String,
    consumer_name: String,
}

impl RedisChangeStream {
    /// Connect and make sure the consumer group exists.
    pub async fn connect(config: &RelayConfig) -> RelayResult<Self> {
        let client = Client::open(config.redis_url.as_str())?;
        let conn = client.get_multiplexed_async_connection().await?;

        let stream = Self {
            client,
            conn,
            stream_key: config.stream_key.clone(),
            consumer_group: config.consumer_group.clone(),
            consumer_name: config.consumer_name.clone(),
        };

        stream.ensure_consumer_group().await?;

        Ok(stream)
    }

    /// Create the consumer group if necessary.
    ///
    /// A new group starts at `0` so that events written before the relay's
    /// first start are still delivered.
    async fn ensure_consumer_group(&self) -> RelayResult<()> {
        let result: RedisResult<()> = redis::cmd("XGROUP")
            .arg("CREATE")
            .arg(&self.stream_key)
            .arg(&self.consumer_group)
            .arg("0")
            .arg("MKSTREAM")
            .query_async(&mut self.conn.clone())
            .await;

        match result {
            Ok(()) => {
                info!(
                    stream = %self.stream_key,
                    group = %self.consumer_group,
                    "Created consumer group"
                );
            }
            // BUSYGROUP: the group already exists.
            Err(e) if e.to_string().contains("BUSYGROUP") => {
                debug!(
                    stream = %self.stream_key,
                    group = %self.consumer_group,
                    "Consumer group already exists"
                );
            }
            Err(e) => return Err(e.into()),
        }

        Ok(())
    }

    async fn read_group(
        &mut self,
        count: usize,
        block_ms: Option<u64>,
        cursor: &str,
    ) -> RelayResult<Vec<StreamEntry>> {
        let mut cmd = redis::cmd("XREADGROUP");
        cmd.arg("GROUP")
            .arg(&self.consumer_group)
            .arg(&self.consumer_name)
            .arg("COUNT")
            .arg(count);
        if let Some(block_ms) = block_ms {
            cmd.arg("BLOCK").arg(block_ms);
        }
        cmd.arg("STREAMS").arg(&self.stream_key).arg(cursor);

        let value: Value = cmd.query_async(&mut self.conn).await?;
        parse_xreadgroup_response(value)
    }
}

#[async_trait]
impl ChangeStream for RedisChangeStream {
    async fn read_pending(&mut self, count: usize) -> RelayResult<Vec<StreamEntry>> {
        // "0" replays this consumer's pending entries list.
        self.read_group(count, None, "0").await
    }

    async fn read_new(
        &mut self,
        count: usize,
        block_ms: Option<u64>,
    ) -> RelayResult<Vec<StreamEntry>> {
        self.read_group(count, block_ms, ">").await
    }

    async fn ack(&mut self, ids: &[String]) -> RelayResult<usize> {
        if ids.is_empty() {
            return Ok(0);
        }

        let acked: usize = self
            .conn
            .xack(&self.stream_key, &self.consumer_group, ids)
            .await?;

        if acked != ids.len() {
            warn!(
                stream = %self.stream_key,
                requested = ids.len(),
                acked,
                "XACK acknowledged fewer entries than requested"
            );
        }

        Ok(acked)
    }

    async fn reconnect(&mut self) -> RelayResult<()> {
        info!("Reconnecting to Redis...");
        self.conn = self.client.get_multiplexed_async_connection().await?;
        self.ensure_consumer_group().await?;
        Ok(())
    }
}

/// Parse an XREADGROUP reply:
/// `[[stream_key, [[entry_id, [field, value, ...]], ...]]]`, or nil on
/// block timeout.
pub(crate) fn parse_xreadgroup_response(value: Value) -> RelayResult<Vec<StreamEntry>> {
    let streams = match value {
        Value::Nil => return Ok(Vec::new()),
        Value::Array(streams) => streams,
        other => {
            return Err(RelayError::Protocol(format!(
                "Unexpected XREADGROUP response type: {other:?}"
            )))
        }
    };

    let mut entries = Vec::new();

    for stream in streams {
        let Value::Array(stream) = stream else {
            return Err(RelayError::Protocol(
                "Expected array for stream entry".to_string(),
            ));
        };
        let Some(Value::Array(messages)) = stream.into_iter().nth(1) else {
            return Err(RelayError::Protocol(
                "Expected array for messages".to_string(),
            ));
        };

        for message in messages {
            entries.push(parse_entry(message)?);
        }
    }

    Ok(entries)
}

fn parse_entry(message: Value) -> RelayResult<StreamEntry> {
    let Value::Array(mut parts) = message else {
        return Err(RelayError::Protocol("Expected array for message".to_string()));
    };
    if parts.is_empty() {
        return Err(RelayError::Protocol("Message entry too short".to_string()));
    }

    let fields = if parts.len() > 1 { parts.remove(1) } else { Value::Nil };
    let id = as_string(&parts[0]).ok_or_else(|| {
        RelayError::Protocol(format!("Expected string for message ID, got {:?}", parts[0]))
    })?;

    // Entries deleted from the stream while pending come back with nil fields.
    let value = match fields {
        Value::Array(fields) => select_value(&fields),
        _ => None,
    };

    Ok(StreamEntry { id, value })
}

/// The event is the `value` field if present, otherwise the value of the
/// first field/value pair (Debezium writes `<record key> <record value>`).
fn select_value(fields: &[Value]) -> Option<String> {
    let pairs: Vec<(Option<String>, Option<String>)> = fields
        .chunks_exact(2)
        .map(|pair| (as_string(&pair[0]), as_string(&pair[1])))
        .collect();

    pairs
        .iter()
        .find(|(name, _)| name.as_deref() == Some("value"))
        .or_else(|| pairs.first())
        .and_then(|(_, value)| value.clone())
}

fn as_string(value: &Value) -> Option<String> {
    match value {
        Value::BulkString(bytes) => Some(String::from_utf8_lossy(bytes).to_string()),
        Value::SimpleString(s) => Some(s.clone()),
        _ => None,
    }
}
