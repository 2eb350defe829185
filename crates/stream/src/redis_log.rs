//! Redis backends: a stream read through XREADGROUP and history lists read
//! through LRANGE.

use async_trait::async_trait;
use kblocks_core::Position;
use redis::aio::MultiplexedConnection;
use redis::streams::{StreamId, StreamReadOptions, StreamReadReply};
use redis::AsyncCommands;
use tracing::{debug, info};

use crate::history::HistoryStore;
use crate::{EventLog, LogEntry, LogError, ReadSpec};

/// Stream field holding the JSON event.
pub const PAYLOAD_FIELD: &str = "data";

impl From<redis::RedisError> for LogError {
    fn from(e: redis::RedisError) -> Self {
        match e.code() {
            Some("BUSYGROUP") => LogError::GroupExists(e.to_string()),
            Some("NOGROUP") => LogError::NoGroup(e.to_string()),
            _ => LogError::Transport(e.to_string()),
        }
    }
}

pub async fn connect(url: &str) -> Result<MultiplexedConnection, LogError> {
    let client = redis::Client::open(url)?;
    let con = client.get_multiplexed_tokio_connection().await?;
    info!(url = %url, "redis: connected");
    Ok(con)
}

/// One Redis stream consumed through a consumer group. Blocking reads hold the
/// connection, so give each consumer its own.
pub struct RedisStream {
    con: MultiplexedConnection,
    key: String,
}

impl RedisStream {
    pub fn new(con: MultiplexedConnection, key: impl Into<String>) -> Self { Self { con, key: key.into() } }

    pub async fn connect(url: &str, key: impl Into<String>) -> Result<Self, LogError> {
        Ok(Self::new(connect(url).await?, key))
    }
}

fn entry_from(id: StreamId) -> LogEntry {
    // Without the payload field the entry is empty and fails to decode.
    let payload = id.get::<Vec<u8>>(PAYLOAD_FIELD).unwrap_or_default();
    LogEntry { id: id.id, payload }
}

#[async_trait]
impl EventLog for RedisStream {
    async fn ensure_group(&mut self, group: &str) -> Result<(), LogError> {
        let res: redis::RedisResult<()> = self.con.xgroup_create_mkstream(&self.key, group, "0").await;
        match res.map_err(LogError::from) {
            Ok(()) => {
                info!(stream = %self.key, group = %group, "redis: consumer group created");
                Ok(())
            }
            Err(LogError::GroupExists(_)) => {
                debug!(stream = %self.key, group = %group, "redis: consumer group exists");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn read_next(&mut self, spec: &ReadSpec) -> Result<Option<LogEntry>, LogError> {
        let opts = StreamReadOptions::default()
            .group(&spec.group, &spec.consumer)
            .count(1)
            .block(spec.block_ms as usize)
            .noack();
        let keys = [self.key.as_str()];
        let reply: Option<StreamReadReply> = self.con.xread_options(&keys, &[">"], &opts).await?;
        let entry = reply
            .into_iter()
            .flat_map(|r| r.keys)
            .flat_map(|k| k.ids)
            .next()
            .map(entry_from);
        Ok(entry)
    }
}

/// Per-object history kept in Redis lists, oldest first.
#[derive(Clone)]
pub struct RedisHistory {
    con: MultiplexedConnection,
}

impl RedisHistory {
    pub fn new(con: MultiplexedConnection) -> Self { Self { con } }
}

#[async_trait]
impl HistoryStore for RedisHistory {
    async fn len(&self, key: &str) -> Result<u64, LogError> {
        let mut con = self.con.clone();
        let n: u64 = con.llen(key).await?;
        Ok(n)
    }

    async fn range(&self, key: &str, pos: Position) -> Result<Vec<String>, LogError> {
        let mut con = self.con.clone();
        let items: Vec<String> = con.lrange(key, pos.start as isize, pos.end as isize).await?;
        Ok(items)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    use redis::{ErrorKind, RedisError, Value};

    fn server_error(code: &'static str) -> RedisError {
        RedisError::from((ErrorKind::ExtensionError, code, "from server".to_string()))
    }

    #[test]
    fn server_error_codes_map_to_log_errors() {
        assert!(matches!(LogError::from(server_error("BUSYGROUP")), LogError::GroupExists(_)));
        assert!(matches!(LogError::from(server_error("NOGROUP")), LogError::NoGroup(_)));
        let io = RedisError::from(std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset"));
        assert!(matches!(LogError::from(io), LogError::Transport(_)));
    }

    #[test]
    fn payload_comes_from_the_data_field_only() {
        let mut map = HashMap::new();
        map.insert("other".to_string(), Value::Data(b"ignored".to_vec()));
        map.insert(PAYLOAD_FIELD.to_string(), Value::Data(b"{}".to_vec()));
        let entry = entry_from(StreamId { id: "1-0".into(), map });
        assert_eq!(entry, LogEntry { id: "1-0".into(), payload: b"{}".to_vec() });

        let mut map = HashMap::new();
        map.insert("other".to_string(), Value::Data(b"{}".to_vec()));
        let entry = entry_from(StreamId { id: "2-0".into(), map });
        assert!(entry.payload.is_empty());
    }
}
