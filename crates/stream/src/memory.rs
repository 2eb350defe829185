//! In-process event log and history lists.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use kblocks_core::Position;
use tokio::sync::Notify;

use crate::history::HistoryStore;
use crate::{EventLog, LogEntry, LogError, ReadSpec};

#[derive(Default)]
struct StreamState {
    entries: Vec<LogEntry>,
    /// Next undelivered index per consumer group.
    groups: HashMap<String, usize>,
    closed: bool,
}

#[derive(Default)]
struct Shared {
    state: Mutex<StreamState>,
    notify: Notify,
}

/// Consumer-group log kept in memory. Clones share the same log, so a test can
/// append from one handle while a consumer reads from another.
#[derive(Clone, Default)]
pub struct MemoryStream {
    shared: Arc<Shared>,
}

impl MemoryStream {
    pub fn new() -> Self { Self::default() }

    fn lock(&self) -> MutexGuard<'_, StreamState> {
        self.shared.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Append a payload and return its entry id.
    pub fn append(&self, payload: impl Into<Vec<u8>>) -> String {
        let id = {
            let mut st = self.lock();
            let id = format!("{}-0", st.entries.len() + 1);
            st.entries.push(LogEntry { id: id.clone(), payload: payload.into() });
            id
        };
        self.shared.notify.notify_waiters();
        id
    }

    pub fn len(&self) -> usize { self.lock().entries.len() }

    pub fn is_empty(&self) -> bool { self.len() == 0 }

    /// Once a group has read every entry, its reads fail with [`LogError::Closed`].
    pub fn close(&self) {
        self.lock().closed = true;
        self.shared.notify.notify_waiters();
    }
}

#[async_trait]
impl EventLog for MemoryStream {
    async fn ensure_group(&mut self, group: &str) -> Result<(), LogError> {
        self.lock().groups.entry(group.to_string()).or_insert(0);
        Ok(())
    }

    async fn read_next(&mut self, spec: &ReadSpec) -> Result<Option<LogEntry>, LogError> {
        let shared = Arc::clone(&self.shared);
        loop {
            // Registered before the check so an append in between is not missed.
            let notified = shared.notify.notified();
            {
                let mut st = shared.state.lock().unwrap_or_else(|p| p.into_inner());
                let len = st.entries.len();
                let closed = st.closed;
                let pos = st.groups.get_mut(&spec.group).ok_or_else(|| LogError::NoGroup(spec.group.clone()))?;
                if *pos < len {
                    let idx = *pos;
                    *pos += 1;
                    return Ok(Some(st.entries[idx].clone()));
                }
                if closed {
                    return Err(LogError::Closed);
                }
            }
            if spec.block_ms == 0 {
                notified.await;
            } else if tokio::time::timeout(Duration::from_millis(spec.block_ms), notified).await.is_err() {
                return Ok(None);
            }
        }
    }
}

/// Append-only lists keyed by name, mirroring a Redis list.
#[derive(Clone, Default)]
pub struct MemoryHistory {
    lists: Arc<Mutex<HashMap<String, Vec<String>>>>,
}

impl MemoryHistory {
    pub fn new() -> Self { Self::default() }

    pub fn push(&self, key: &str, payload: impl Into<String>) {
        let mut lists = self.lists.lock().unwrap_or_else(|p| p.into_inner());
        lists.entry(key.to_string()).or_default().push(payload.into());
    }
}

#[async_trait]
impl HistoryStore for MemoryHistory {
    async fn len(&self, key: &str) -> Result<u64, LogError> {
        let lists = self.lists.lock().unwrap_or_else(|p| p.into_inner());
        Ok(lists.get(key).map(|l| l.len() as u64).unwrap_or(0))
    }

    async fn range(&self, key: &str, pos: Position) -> Result<Vec<String>, LogError> {
        let lists = self.lists.lock().unwrap_or_else(|p| p.into_inner());
        let Some(list) = lists.get(key) else { return Ok(Vec::new()) };
        let start = pos.start as usize;
        if start >= list.len() {
            return Ok(Vec::new());
        }
        let end = (pos.end as usize).min(list.len() - 1);
        Ok(list[start..=end].to_vec())
    }
}
