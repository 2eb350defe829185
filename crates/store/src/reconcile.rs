//! Folds object and lifecycle events into per-resource state.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use kblocks_core::{Event, LifecycleEvent, LifecyclePhase, ObjectEvent, ObjectReason};
use metrics::counter;
use once_cell::sync::Lazy;
use regex::Regex;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use tracing::{debug, trace};

/// `${ref://<target>/<field>}` pointers embedded in string values.
static REF_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\$\{\s*ref://([^}\s]+)\s*\}").expect("valid ref regex"));

/// Directed edge from a resource to something its body references.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Edge {
    /// `ref://<target>` without the trailing field.
    pub target: String,
    /// Referenced field, e.g. `queueUrl`.
    pub label: String,
    /// Dotted path of the value holding the reference.
    pub path: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lifecycle {
    pub phase: LifecyclePhase,
    pub timestamp: DateTime<Utc>,
    pub request_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceEntry {
    pub obj_uri: String,
    pub obj_type: String,
    /// Absent when only lifecycle events have been seen so far.
    pub object: Option<serde_json::Value>,
    pub object_ts: Option<DateTime<Utc>>,
    pub reason: Option<ObjectReason>,
    pub lifecycle: Option<Lifecycle>,
    /// Newest READ observation.
    pub last_read: Option<DateTime<Utc>>,
    pub edges: SmallVec<[Edge; 4]>,
}

impl ResourceEntry {
    fn empty(obj_uri: &str, obj_type: &str) -> Self {
        Self {
            obj_uri: obj_uri.to_string(),
            obj_type: obj_type.to_string(),
            object: None,
            object_ts: None,
            reason: None,
            lifecycle: None,
            last_read: None,
            edges: SmallVec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ignored {
    /// Older than the stored state.
    Stale,
    /// Object was deleted and no newer CREATE has arrived since.
    Deleted,
    /// READ for an object with no state.
    Unknown,
    /// Not an object or lifecycle event.
    NotApplicable,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Upserted,
    Removed,
    /// Only auxiliary metadata changed.
    Touched,
    Ignored(Ignored),
}

impl Outcome {
    pub fn changed(self) -> bool { !matches!(self, Outcome::Ignored(_)) }
}

/// Immutable view handed to readers.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResourceSnapshot {
    pub epoch: u64,
    pub resources: BTreeMap<String, Arc<ResourceEntry>>,
}

impl ResourceSnapshot {
    pub fn get(&self, obj_uri: &str) -> Option<&ResourceEntry> { self.resources.get(obj_uri).map(|e| e.as_ref()) }

    pub fn len(&self) -> usize { self.resources.len() }

    pub fn is_empty(&self) -> bool { self.resources.is_empty() }

    /// Resources with an edge pointing at `target`.
    pub fn referrers<'a>(&'a self, target: &'a str) -> impl Iterator<Item = (&'a str, &'a Edge)> + 'a {
        self.resources
            .iter()
            .flat_map(move |(uri, e)| e.edges.iter().filter(move |edge| edge.target == target).map(move |edge| (uri.as_str(), edge)))
    }
}

/// Canonical resource state keyed by object URI.
///
/// Bodies and lifecycles follow last-writer-wins by event timestamp (ties go
/// to the incoming event). DELETE always removes and leaves a tombstone that
/// only a CREATE stamped at or after the delete lifts.
#[derive(Default)]
pub struct Reconciler {
    resources: FxHashMap<String, Arc<ResourceEntry>>,
    tombstones: FxHashMap<String, DateTime<Utc>>,
    epoch: u64,
}

impl Reconciler {
    pub fn new() -> Self { Self::default() }

    pub fn epoch(&self) -> u64 { self.epoch }

    pub fn len(&self) -> usize { self.resources.len() }

    pub fn is_empty(&self) -> bool { self.resources.is_empty() }

    pub fn get(&self, obj_uri: &str) -> Option<&ResourceEntry> { self.resources.get(obj_uri).map(|e| e.as_ref()) }

    pub fn is_deleted(&self, obj_uri: &str) -> bool { self.tombstones.contains_key(obj_uri) }

    pub fn apply(&mut self, event: &Event) -> Outcome {
        let out = match event {
            Event::Object(ev) => self.apply_object(ev),
            Event::Lifecycle(ev) => self.apply_lifecycle(ev),
            Event::Log(_) | Event::Error(_) => return Outcome::Ignored(Ignored::NotApplicable),
        };
        if out.changed() {
            self.epoch = self.epoch.saturating_add(1);
            counter!("reconcile_applied_total", 1u64);
        } else {
            counter!("reconcile_ignored_total", 1u64);
        }
        trace!(obj = %event.obj_uri(), outcome = ?out, "reconcile: applied");
        out
    }

    fn apply_object(&mut self, ev: &ObjectEvent) -> Outcome {
        let env = &ev.envelope;
        let uri = env.obj_uri.as_str();
        match ev.reason {
            ObjectReason::Delete => {
                self.resources.remove(uri);
                let at = self.tombstones.entry(uri.to_string()).or_insert(env.timestamp);
                *at = (*at).max(env.timestamp);
                debug!(obj = %uri, "reconcile: deleted");
                Outcome::Removed
            }
            ObjectReason::Read => match self.resources.get_mut(uri) {
                Some(entry) => {
                    let entry = Arc::make_mut(entry);
                    if entry.last_read.map_or(true, |t| env.timestamp >= t) {
                        entry.last_read = Some(env.timestamp);
                        Outcome::Touched
                    } else {
                        Outcome::Ignored(Ignored::Stale)
                    }
                }
                None => Outcome::Ignored(Ignored::Unknown),
            },
            ObjectReason::Create | ObjectReason::Update | ObjectReason::Sync => {
                match self.tombstones.get(uri) {
                    // Only a CREATE at or after the delete lifts the tombstone;
                    // an older one is a redelivery.
                    Some(&deleted_at) if ev.reason == ObjectReason::Create && env.timestamp >= deleted_at => {
                        self.tombstones.remove(uri);
                    }
                    Some(_) => return Outcome::Ignored(Ignored::Deleted),
                    None => {}
                }
                let entry = self.resources.entry(uri.to_string()).or_insert_with(|| Arc::new(ResourceEntry::empty(uri, &env.obj_type)));
                if entry.object_ts.map_or(false, |t| env.timestamp < t) {
                    return Outcome::Ignored(Ignored::Stale);
                }
                let entry = Arc::make_mut(entry);
                entry.obj_type = env.obj_type.clone();
                entry.object = Some(ev.object.clone());
                entry.object_ts = Some(env.timestamp);
                entry.reason = Some(ev.reason);
                entry.edges = extract_edges(&ev.object);
                Outcome::Upserted
            }
        }
    }

    fn apply_lifecycle(&mut self, ev: &LifecycleEvent) -> Outcome {
        let env = &ev.envelope;
        let uri = env.obj_uri.as_str();
        if self.tombstones.contains_key(uri) {
            return Outcome::Ignored(Ignored::Deleted);
        }
        let entry = self.resources.entry(uri.to_string()).or_insert_with(|| Arc::new(ResourceEntry::empty(uri, &env.obj_type)));
        if entry.lifecycle.as_ref().map_or(false, |l| env.timestamp < l.timestamp) {
            return Outcome::Ignored(Ignored::Stale);
        }
        Arc::make_mut(entry).lifecycle =
            Some(Lifecycle { phase: ev.event.clone(), timestamp: env.timestamp, request_id: env.request_id.clone() });
        Outcome::Upserted
    }

    pub fn freeze(&self) -> Arc<ResourceSnapshot> {
        let resources = self.resources.iter().map(|(k, v)| (k.clone(), Arc::clone(v))).collect();
        Arc::new(ResourceSnapshot { epoch: self.epoch, resources })
    }
}

/// Scan every string in `body` for `${ref://...}` pointers.
pub fn extract_edges(body: &serde_json::Value) -> SmallVec<[Edge; 4]> {
    let mut out: SmallVec<[Edge; 4]> = SmallVec::new();
    let mut stack: Vec<(String, &serde_json::Value)> = vec![(String::new(), body)];
    while let Some((path, v)) = stack.pop() {
        match v {
            serde_json::Value::String(s) => {
                for cap in REF_RE.captures_iter(s) {
                    let pointer = &cap[1];
                    let (target, label) = match pointer.rsplit_once('/') {
                        Some((t, l)) => (t, l),
                        None => (pointer, ""),
                    };
                    let edge = Edge { target: format!("ref://{}", target), label: label.to_string(), path: path.clone() };
                    if !out.contains(&edge) {
                        out.push(edge);
                    }
                }
            }
            serde_json::Value::Array(items) => {
                for (i, item) in items.iter().enumerate().rev() {
                    stack.push((join(&path, &i.to_string()), item));
                }
            }
            serde_json::Value::Object(map) => {
                let mut fields: Vec<_> = map.iter().collect();
                fields.sort_by(|a, b| b.0.cmp(a.0));
                for (k, item) in fields {
                    stack.push((join(&path, k), item));
                }
            }
            _ => {}
        }
    }
    out
}

fn join(path: &str, seg: &str) -> String {
    if path.is_empty() {
        seg.to_string()
    } else {
        format!("{}.{}", path, seg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn finds_refs_in_nested_strings() {
        let body = json!({
            "spec": {
                "queueUrl": "${ref://queues.acme.com/orders/queueUrl}",
                "env": [ { "value": "x=${ref://buckets.acme.com/assets/arn} y=${ref://buckets.acme.com/assets/arn}" } ],
                "plain": "no refs here",
                "broken": "${ref://}"
            }
        });
        let edges = extract_edges(&body);
        assert_eq!(edges.len(), 2);
        assert_eq!(edges[0], Edge { target: "ref://buckets.acme.com/assets".into(), label: "arn".into(), path: "spec.env.0.value".into() });
        assert_eq!(edges[1], Edge { target: "ref://queues.acme.com/orders".into(), label: "queueUrl".into(), path: "spec.queueUrl".into() });
    }

    #[test]
    fn no_body_no_edges() {
        assert!(extract_edges(&serde_json::Value::Null).is_empty());
    }
}
