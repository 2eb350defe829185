//! Paged reads over an object's stored history list.

use std::time::Instant;

use async_trait::async_trait;
use kblocks_core::{latest_cursor, position_from_cursor, Cursor, Event, Position};
use metrics::histogram;
use serde::Serialize;
use tracing::{debug, warn};

use crate::LogError;

/// Ordered list store holding historical events, oldest first.
#[async_trait]
pub trait HistoryStore: Send + Sync {
    async fn len(&self, key: &str) -> Result<u64, LogError>;

    /// Items in the inclusive range; indices past the end are ignored.
    async fn range(&self, key: &str, pos: Position) -> Result<Vec<String>, LogError>;
}

#[derive(Debug, Clone, Serialize)]
pub struct HistoryPage {
    pub cursor: Cursor,
    /// Range actually read, already intersected with the list length.
    pub position: Option<Position>,
    pub total: u64,
    pub events: Vec<Event>,
    /// Stored items that failed to decode.
    pub skipped: usize,
}

/// Most recent page of `key`.
pub async fn read_latest_page<S>(store: &S, key: &str, page_size: u64) -> Result<HistoryPage, LogError>
where
    S: HistoryStore + ?Sized,
{
    let total = store.len(key).await?;
    read_at(store, key, latest_cursor(total, page_size), page_size, total).await
}

/// Page addressed by an explicit cursor.
pub async fn read_page<S>(store: &S, key: &str, cursor: Cursor, page_size: u64) -> Result<HistoryPage, LogError>
where
    S: HistoryStore + ?Sized,
{
    let total = store.len(key).await?;
    read_at(store, key, cursor, page_size, total).await
}

async fn read_at<S>(store: &S, key: &str, cursor: Cursor, page_size: u64, total: u64) -> Result<HistoryPage, LogError>
where
    S: HistoryStore + ?Sized,
{
    let started = Instant::now();
    let position = position_from_cursor(cursor, page_size).within(total);
    let raw = match position {
        Some(pos) => store.range(key, pos).await?,
        None => Vec::new(),
    };
    let mut events = Vec::with_capacity(raw.len());
    let mut skipped = 0usize;
    for item in raw {
        match Event::from_json(item.as_bytes()) {
            Ok(ev) => events.push(ev),
            Err(e) => {
                skipped += 1;
                warn!(key = %key, error = %e, "history: skipping undecodable item");
            }
        }
    }
    histogram!("history_read_ms", started.elapsed().as_secs_f64() * 1000.0);
    debug!(key = %key, page = cursor.page, offset = cursor.offset, total, read = events.len(), skipped, "history: page read");
    Ok(HistoryPage { cursor, position, total, events, skipped })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MemoryHistory;

    fn log_line(i: usize) -> String {
        serde_json::json!({
            "type": "LOG",
            "objUri": "kblocks://acme.com/v1/queues/dev/default/q1",
            "objType": "acme.com/v1/queues",
            "timestamp": "2024-05-01T10:00:00Z",
            "requestId": "r",
            "level": 1,
            "message": format!("line {}", i),
        })
        .to_string()
    }

    fn message(ev: &Event) -> String {
        match ev {
            Event::Log(l) => l.message.clone(),
            other => panic!("unexpected {:?}", other.kind()),
        }
    }

    #[tokio::test]
    async fn latest_page_ends_at_newest_line() {
        let h = MemoryHistory::new();
        for i in 0..8 {
            h.push("k", log_line(i));
        }
        let page = read_latest_page(&h, "k", 3).await.unwrap();
        assert_eq!(page.cursor, Cursor { page: 3, offset: 1 });
        assert_eq!(page.position, Some(Position { start: 5, end: 7 }));
        let msgs: Vec<String> = page.events.iter().map(message).collect();
        assert_eq!(msgs, vec!["line 5", "line 6", "line 7"]);
    }

    #[tokio::test]
    async fn short_history_is_clamped_and_bad_items_skipped() {
        let h = MemoryHistory::new();
        h.push("k", log_line(0));
        h.push("k", "garbage");
        h.push("k", log_line(2));
        let page = read_latest_page(&h, "k", 100).await.unwrap();
        assert_eq!(page.position, Some(Position { start: 0, end: 2 }));
        assert_eq!(page.events.len(), 2);
        assert_eq!(page.skipped, 1);
    }

    #[tokio::test]
    async fn empty_history_reads_nothing() {
        let h = MemoryHistory::new();
        let page = read_latest_page(&h, "nothing", 10).await.unwrap();
        assert_eq!(page.total, 0);
        assert!(page.position.is_none());
        assert!(page.events.is_empty());
    }

    #[tokio::test]
    async fn explicit_cursor_reads_older_window() {
        let h = MemoryHistory::new();
        for i in 0..30 {
            h.push("k", log_line(i));
        }
        let page = read_page(&h, "k", Cursor { page: 2, offset: 14 }, 20).await.unwrap();
        assert_eq!(page.position, Some(Position { start: 6, end: 25 }));
        assert_eq!(message(&page.events[0]), "line 6");
        assert_eq!(page.events.len(), 20);
    }
}
