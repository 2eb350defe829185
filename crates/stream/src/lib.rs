//! kblocks stream consumer: reads the shared event log through a named
//! consumer group, decodes envelopes and hands them to a handler one at a time.

#![forbid(unsafe_code)]

use std::time::Duration;

use async_trait::async_trait;
use kblocks_core::{DecodeError, Event};
use metrics::counter;
use tokio::sync::watch;
use tracing::{debug, info, trace, warn};

pub mod history;
pub mod memory;
pub mod redis_log;

pub use history::{read_latest_page, read_page, HistoryPage, HistoryStore};
pub use memory::{MemoryHistory, MemoryStream};
pub use redis_log::{RedisHistory, RedisStream};

/// One raw entry as stored in the log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    pub id: String,
    pub payload: Vec<u8>,
}

/// Event-log transport failures.
#[derive(Debug, thiserror::Error)]
pub enum LogError {
    #[error("consumer group already exists: {0}")]
    GroupExists(String),
    #[error("no such consumer group: {0}")]
    NoGroup(String),
    #[error("event log closed")]
    Closed,
    #[error("transport: {0}")]
    Transport(String),
}

/// Parameters of a consumer-group read: new entries only (`>`), one at a time,
/// without ack bookkeeping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadSpec {
    pub group: String,
    pub consumer: String,
    /// 0 blocks until an entry arrives.
    pub block_ms: u64,
}

impl ReadSpec {
    pub fn new(group: impl Into<String>, consumer: impl Into<String>) -> Self {
        Self { group: group.into(), consumer: consumer.into(), block_ms: 0 }
    }

    pub fn with_block_ms(mut self, block_ms: u64) -> Self {
        self.block_ms = block_ms;
        self
    }
}

/// Append-only log readable through consumer groups.
#[async_trait]
pub trait EventLog: Send {
    /// Create `group` at the start of the log unless it already exists.
    async fn ensure_group(&mut self, group: &str) -> Result<(), LogError>;

    /// Next undelivered entry for the group. `Ok(None)` when the block time
    /// elapsed without new entries.
    async fn read_next(&mut self, spec: &ReadSpec) -> Result<Option<LogEntry>, LogError>;
}

#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    #[error("handler rejected event: {0}")]
    Rejected(String),
}

/// Receives each decoded event, synchronously and in log order.
pub trait EventHandler: Send + Sync {
    fn handle(&self, event: &Event) -> Result<(), HandlerError>;
}

impl<F> EventHandler for F
where
    F: Fn(&Event) -> Result<(), HandlerError> + Send + Sync,
{
    fn handle(&self, event: &Event) -> Result<(), HandlerError> { self(event) }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConsumerStats {
    pub entries: u64,
    pub handled: u64,
    pub decode_errors: u64,
    pub handler_errors: u64,
    pub read_errors: u64,
}

/// Single logical consumer of one event stream.
pub struct Consumer<L> {
    log: L,
    spec: ReadSpec,
    backoff_max: Duration,
    stats: ConsumerStats,
}

const BACKOFF_START: Duration = Duration::from_millis(100);

impl<L: EventLog> Consumer<L> {
    pub fn new(log: L, spec: ReadSpec) -> Self {
        Self { log, spec, backoff_max: Duration::from_secs(30), stats: ConsumerStats::default() }
    }

    pub fn with_backoff_max(mut self, max: Duration) -> Self {
        self.backoff_max = max.max(BACKOFF_START);
        self
    }

    pub fn stats(&self) -> ConsumerStats { self.stats }

    /// Consume until `shutdown` reads `true` (checked between reads) or the
    /// log reports itself closed. Only group setup failures are returned.
    pub async fn run<H>(mut self, handler: &H, mut shutdown: watch::Receiver<bool>) -> Result<ConsumerStats, LogError>
    where
        H: EventHandler + ?Sized,
    {
        match self.log.ensure_group(&self.spec.group).await {
            Ok(()) | Err(LogError::GroupExists(_)) => {}
            Err(e) => return Err(e),
        }
        info!(group = %self.spec.group, consumer = %self.spec.consumer, block_ms = self.spec.block_ms, "consumer: started");

        let mut backoff = BACKOFF_START;
        loop {
            let stop = *shutdown.borrow();
            if stop {
                debug!("consumer: shutdown flag observed");
                break;
            }
            match self.log.read_next(&self.spec).await {
                Ok(None) => trace!("consumer: empty read"),
                Ok(Some(entry)) => {
                    backoff = BACKOFF_START;
                    self.process(entry, handler);
                }
                Err(LogError::Closed) => {
                    debug!("consumer: log closed");
                    break;
                }
                Err(e) => {
                    self.stats.read_errors += 1;
                    counter!("stream_read_errors_total", 1u64);
                    warn!(error = %e, backoff_ms = backoff.as_millis() as u64, "consumer: read failed; retrying");
                    tokio::select! {
                        _ = tokio::time::sleep(backoff) => {}
                        changed = shutdown.changed() => {
                            if changed.is_err() {
                                tokio::time::sleep(backoff).await;
                            }
                        }
                    }
                    backoff = (backoff * 2).min(self.backoff_max);
                }
            }
        }
        let stats = self.stats;
        info!(entries = stats.entries, handled = stats.handled, decode_errors = stats.decode_errors, handler_errors = stats.handler_errors, "consumer: stopped");
        Ok(stats)
    }

    fn process<H: EventHandler + ?Sized>(&mut self, entry: LogEntry, handler: &H) {
        self.stats.entries += 1;
        counter!("stream_entries_total", 1u64);
        let event = match decode(&entry) {
            Ok(ev) => ev,
            Err(e) => {
                self.stats.decode_errors += 1;
                counter!("stream_decode_errors_total", 1u64);
                warn!(id = %entry.id, error = %e, "consumer: skipping undecodable entry");
                return;
            }
        };
        match handler.handle(&event) {
            Ok(()) => {
                self.stats.handled += 1;
                trace!(id = %entry.id, kind = event.kind().as_str(), obj = %event.obj_uri(), "consumer: handled");
            }
            Err(e) => {
                self.stats.handler_errors += 1;
                counter!("stream_handler_errors_total", 1u64);
                warn!(id = %entry.id, obj = %event.obj_uri(), error = %e, "consumer: handler failed; skipping entry");
            }
        }
    }
}

pub fn decode(entry: &LogEntry) -> Result<Event, DecodeError> { Event::from_json(&entry.payload) }

/// Shutdown flag for [`Consumer::run`]; send `true` to stop.
pub fn shutdown_flag() -> (watch::Sender<bool>, watch::Receiver<bool>) { watch::channel(false) }
