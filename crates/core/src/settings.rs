//! Runtime settings read from `KBLOCKS_*` environment variables.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Settings {
    pub redis_url: String,
    /// Shared event stream every cluster writes to.
    pub events_stream: String,
    pub consumer_group: String,
    pub consumer_name: String,
    /// Read block time in milliseconds; 0 blocks until an entry arrives.
    pub block_ms: u64,
    pub read_backoff_max_secs: u64,
    pub queue_cap: usize,
    /// Key prefix of the per-object history lists.
    pub history_prefix: String,
    pub page_size: u64,
    pub system_id: String,
    pub orphan_grace_ms: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            redis_url: "redis://127.0.0.1:6379".to_string(),
            events_stream: "kblocks-events".to_string(),
            consumer_group: "kblocks-dashboard".to_string(),
            consumer_name: default_consumer_name(),
            block_ms: 0,
            read_backoff_max_secs: 30,
            queue_cap: 2048,
            history_prefix: "kblocks-logs:".to_string(),
            page_size: 100,
            system_id: "default".to_string(),
            orphan_grace_ms: 0,
        }
    }
}

impl Settings {
    pub fn from_env() -> Self { Self::from_lookup(|k| std::env::var(k).ok()) }

    /// Build from an arbitrary key lookup; unparseable numbers keep the default.
    pub fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Self {
        let d = Settings::default();
        let num = |k: &str| get(k).and_then(|s| s.trim().parse::<u64>().ok());
        Self {
            redis_url: get("KBLOCKS_REDIS_URL").unwrap_or(d.redis_url),
            events_stream: get("KBLOCKS_EVENTS_STREAM").unwrap_or(d.events_stream),
            consumer_group: get("KBLOCKS_CONSUMER_GROUP").unwrap_or(d.consumer_group),
            consumer_name: get("KBLOCKS_CONSUMER_NAME").unwrap_or(d.consumer_name),
            block_ms: num("KBLOCKS_BLOCK_MS").unwrap_or(d.block_ms),
            read_backoff_max_secs: num("KBLOCKS_READ_BACKOFF_MAX_SECS").unwrap_or(d.read_backoff_max_secs),
            queue_cap: num("KBLOCKS_QUEUE_CAP").map(|n| n as usize).unwrap_or(d.queue_cap),
            history_prefix: get("KBLOCKS_HISTORY_PREFIX").unwrap_or(d.history_prefix),
            page_size: num("KBLOCKS_PAGE_SIZE").filter(|n| *n > 0).unwrap_or(d.page_size),
            system_id: get("KBLOCKS_SYSTEM_ID").unwrap_or(d.system_id),
            orphan_grace_ms: num("KBLOCKS_ORPHAN_GRACE_MS").unwrap_or(d.orphan_grace_ms),
        }
    }

    /// History list key for one object.
    pub fn history_key(&self, obj_uri: &str) -> String { format!("{}{}", self.history_prefix, obj_uri) }
}

pub fn default_consumer_name() -> String { format!("kblocks-{}", uuid::Uuid::new_v4()) }

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn lookup_overrides_and_falls_back() {
        let env: HashMap<&str, &str> = [
            ("KBLOCKS_EVENTS_STREAM", "events"),
            ("KBLOCKS_CONSUMER_NAME", "c1"),
            ("KBLOCKS_BLOCK_MS", "250"),
            ("KBLOCKS_QUEUE_CAP", "not-a-number"),
            ("KBLOCKS_PAGE_SIZE", "0"),
        ]
        .into_iter()
        .collect();
        let s = Settings::from_lookup(|k| env.get(k).map(|v| v.to_string()));
        assert_eq!(s.events_stream, "events");
        assert_eq!(s.consumer_name, "c1");
        assert_eq!(s.block_ms, 250);
        assert_eq!(s.queue_cap, 2048);
        assert_eq!(s.page_size, 100);
        assert_eq!(s.consumer_group, "kblocks-dashboard");
        assert_eq!(s.history_key("kblocks://g/v1/p/s/-/n"), "kblocks-logs:kblocks://g/v1/p/s/-/n");
    }

    #[test]
    fn default_consumer_names_are_unique() {
        assert_ne!(default_consumer_name(), default_consumer_name());
    }
}
