//! Rebuilds nested log output from flat `logId`/`parentLogId` references.

use std::time::{Duration, Instant};

use kblocks_core::LogEvent;
use rustc_hash::{FxHashMap, FxHashSet};
use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LogNode {
    pub event: LogEvent,
    /// Arrival order.
    pub children: Vec<LogNode>,
}

struct Held {
    event: LogEvent,
    arrived: Instant,
}

/// Logs of one object in arrival order.
///
/// A log whose parent has not arrived is an orphan: hidden for the grace
/// period, then shown as a root. Once the parent shows up the orphan is
/// nested under it again.
pub struct LogTree {
    entries: Vec<Held>,
    by_id: FxHashMap<String, usize>,
    grace: Duration,
}

impl Default for LogTree {
    fn default() -> Self { Self::new() }
}

impl LogTree {
    pub fn new() -> Self { Self::with_orphan_grace(Duration::ZERO) }

    pub fn with_orphan_grace(grace: Duration) -> Self {
        Self { entries: Vec::new(), by_id: FxHashMap::default(), grace }
    }

    pub fn len(&self) -> usize { self.entries.len() }

    pub fn is_empty(&self) -> bool { self.entries.is_empty() }

    /// Returns false for a redelivered log (same `logId`, same content).
    pub fn push(&mut self, event: LogEvent) -> bool { self.push_at(event, Instant::now()) }

    pub fn push_at(&mut self, event: LogEvent, arrived: Instant) -> bool {
        if let Some(id) = event.log_id.as_deref() {
            if let Some(&idx) = self.by_id.get(id) {
                if self.entries[idx].event == event {
                    return false;
                }
            } else {
                self.by_id.insert(id.to_string(), self.entries.len());
            }
        }
        self.entries.push(Held { event, arrived });
        true
    }

    /// Logs still waiting for their parent.
    pub fn orphans(&self) -> impl Iterator<Item = &LogEvent> + '_ {
        (0..self.entries.len()).filter(|&i| self.parent_state(i) == Parent::Missing).map(|i| &self.entries[i].event)
    }

    pub fn forest(&self) -> Vec<LogNode> { self.forest_at(Instant::now()) }

    pub fn forest_at(&self, now: Instant) -> Vec<LogNode> {
        let n = self.entries.len();
        let mut children: Vec<Vec<usize>> = vec![Vec::new(); n];
        let mut roots: Vec<usize> = Vec::new();
        let mut hidden: FxHashSet<usize> = FxHashSet::default();
        for i in 0..n {
            match self.parent_state(i) {
                Parent::None => roots.push(i),
                Parent::Found(p) => children[p].push(i),
                Parent::Missing => {
                    if now.saturating_duration_since(self.entries[i].arrived) >= self.grace {
                        roots.push(i);
                    } else {
                        hidden.insert(i);
                    }
                }
            }
        }

        let mut visited = vec![false; n];
        let mut out: Vec<LogNode> = Vec::with_capacity(roots.len());
        for &r in &roots {
            out.push(self.build(r, &children, &mut visited));
        }
        // Parent chains that loop back on themselves never reach a root;
        // surface their first member so nothing silently disappears.
        for i in 0..n {
            if !visited[i] && !self.held_under(i, &hidden) {
                out.push(self.build(i, &children, &mut visited));
            }
        }
        out
    }

    fn parent_state(&self, i: usize) -> Parent {
        match self.entries[i].event.parent_log_id.as_deref() {
            None => Parent::None,
            Some(pid) => match self.by_id.get(pid) {
                Some(&p) if p != i => Parent::Found(p),
                Some(_) => Parent::None,
                None => Parent::Missing,
            },
        }
    }

    /// Whether `i` sits below a hidden orphan.
    fn held_under(&self, mut i: usize, hidden: &FxHashSet<usize>) -> bool {
        for _ in 0..=self.entries.len() {
            if hidden.contains(&i) {
                return true;
            }
            match self.parent_state(i) {
                Parent::Found(p) => i = p,
                _ => return false,
            }
        }
        false
    }

    fn build(&self, i: usize, children: &[Vec<usize>], visited: &mut [bool]) -> LogNode {
        visited[i] = true;
        let mut node = LogNode { event: self.entries[i].event.clone(), children: Vec::new() };
        for &c in &children[i] {
            if !visited[c] {
                node.children.push(self.build(c, children, visited));
            }
        }
        node
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Parent {
    None,
    Found(usize),
    Missing,
}

/// Log trees for every object seen in a session.
pub struct LogHierarchy {
    trees: FxHashMap<String, LogTree>,
    grace: Duration,
}

impl LogHierarchy {
    pub fn new(grace: Duration) -> Self { Self { trees: FxHashMap::default(), grace } }

    pub fn push(&mut self, event: LogEvent) -> bool {
        let grace = self.grace;
        self.trees
            .entry(event.envelope.obj_uri.clone())
            .or_insert_with(|| LogTree::with_orphan_grace(grace))
            .push(event)
    }

    pub fn tree(&self, obj_uri: &str) -> Option<&LogTree> { self.trees.get(obj_uri) }

    pub fn forest(&self, obj_uri: &str) -> Vec<LogNode> { self.trees.get(obj_uri).map(LogTree::forest).unwrap_or_default() }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use kblocks_core::{Envelope, LogLevel};

    fn log(id: Option<&str>, parent: Option<&str>, msg: &str) -> LogEvent {
        LogEvent {
            envelope: Envelope {
                obj_uri: "kblocks://acme.com/v1/queues/dev/default/q1".into(),
                obj_type: "acme.com/v1/queues".into(),
                timestamp: chrono::Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 0).unwrap(),
                request_id: "r".into(),
            },
            level: LogLevel::Info,
            message: msg.into(),
            log_id: id.map(String::from),
            parent_log_id: parent.map(String::from),
        }
    }

    fn shape(nodes: &[LogNode]) -> Vec<(String, Vec<String>)> {
        nodes
            .iter()
            .map(|n| (n.event.message.clone(), n.children.iter().map(|c| c.event.message.clone()).collect()))
            .collect()
    }

    #[test]
    fn two_roots_one_child() {
        let mut t = LogTree::new();
        t.push(log(Some("1"), None, "1"));
        t.push(log(Some("2"), Some("1"), "2"));
        t.push(log(Some("3"), None, "3"));
        let f = t.forest();
        assert_eq!(shape(&f), vec![("1".to_string(), vec!["2".to_string()]), ("3".to_string(), vec![])]);
    }

    #[test]
    fn siblings_keep_arrival_order_and_nest_deeply() {
        let mut t = LogTree::new();
        t.push(log(Some("root"), None, "root"));
        t.push(log(Some("b"), Some("root"), "b"));
        t.push(log(Some("a"), Some("root"), "a"));
        t.push(log(Some("a1"), Some("a"), "a1"));
        t.push(log(None, Some("root"), "anon"));
        let f = t.forest();
        assert_eq!(f.len(), 1);
        let kids: Vec<&str> = f[0].children.iter().map(|c| c.event.message.as_str()).collect();
        assert_eq!(kids, vec!["b", "a", "anon"]);
        assert_eq!(f[0].children[1].children[0].event.message, "a1");
    }

    #[test]
    fn orphan_surfaces_then_reattaches() {
        let mut t = LogTree::new();
        t.push(log(Some("c"), Some("p"), "child"));
        assert_eq!(t.orphans().count(), 1);
        assert_eq!(shape(&t.forest()), vec![("child".to_string(), vec![])]);
        t.push(log(Some("p"), None, "parent"));
        assert_eq!(t.orphans().count(), 0);
        assert_eq!(shape(&t.forest()), vec![("parent".to_string(), vec!["child".to_string()])]);
    }

    #[test]
    fn orphan_hidden_during_grace() {
        let t0 = Instant::now();
        let mut t = LogTree::with_orphan_grace(Duration::from_secs(5));
        t.push_at(log(Some("1"), None, "root"), t0);
        t.push_at(log(Some("c"), Some("missing"), "orphan"), t0);
        t.push_at(log(Some("cc"), Some("c"), "grandchild"), t0);
        assert_eq!(shape(&t.forest_at(t0 + Duration::from_secs(1))), vec![("root".to_string(), vec![])]);
        let later = t.forest_at(t0 + Duration::from_secs(6));
        assert_eq!(shape(&later), vec![("root".to_string(), vec![]), ("orphan".to_string(), vec!["grandchild".to_string()])]);
    }

    #[test]
    fn redelivered_log_is_ignored_and_cycles_still_render() {
        let mut t = LogTree::new();
        assert!(t.push(log(Some("x"), Some("y"), "x")));
        assert!(t.push(log(Some("y"), Some("x"), "y")));
        assert!(!t.push(log(Some("x"), Some("y"), "x")));
        assert_eq!(t.len(), 2);
        let f = t.forest();
        assert_eq!(shape(&f), vec![("x".to_string(), vec!["y".to_string()])]);
    }

    #[test]
    fn hierarchy_separates_objects() {
        let mut h = LogHierarchy::new(Duration::ZERO);
        h.push(log(Some("1"), None, "a"));
        let mut other = log(Some("1"), None, "b");
        other.envelope.obj_uri = "kblocks://acme.com/v1/queues/dev/default/q2".into();
        h.push(other);
        assert_eq!(h.forest("kblocks://acme.com/v1/queues/dev/default/q1").len(), 1);
        assert_eq!(h.forest("kblocks://acme.com/v1/queues/dev/default/q2")[0].event.message, "b");
        assert!(h.forest("kblocks://nope/v1/x/dev/-/n").is_empty());
    }
}
