//! kblocks session store: folds the fan-out stream into resource state and
//! log trees, and publishes snapshots to readers.

#![forbid(unsafe_code)]

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use arc_swap::ArcSwap;
use kblocks_core::{ErrorEvent, Event};
use kblocks_fanout::{EventSink, SinkError};
use rustc_hash::FxHashMap;
use tokio::sync::watch;
use tracing::{debug, info};

pub mod logtree;
pub mod reconcile;

pub use logtree::{LogHierarchy, LogNode, LogTree};
pub use reconcile::{extract_edges, Edge, Ignored, Lifecycle, Outcome, Reconciler, ResourceEntry, ResourceSnapshot};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionOptions {
    pub orphan_grace: Duration,
    /// Recent error events kept per object.
    pub errors_per_object: usize,
}

impl Default for SessionOptions {
    fn default() -> Self { Self { orphan_grace: Duration::ZERO, errors_per_object: 20 } }
}

struct SessionState {
    reconciler: Reconciler,
    logs: LogHierarchy,
    errors: FxHashMap<String, VecDeque<ErrorEvent>>,
    epoch: u64,
}

/// State of one presentation session. Registered with the fan-out as a sink;
/// every event is applied synchronously on the delivery path.
pub struct Session {
    state: Mutex<SessionState>,
    opts: SessionOptions,
    snap: Arc<ArcSwap<ResourceSnapshot>>,
    epoch_tx: watch::Sender<u64>,
}

/// Handle for readers to access the current snapshot and subscribe to changes.
///
/// The watch epoch advances on every observable change. A snapshot carries the
/// epoch at which the resource map last changed.
#[derive(Clone)]
pub struct SessionHandle {
    snap: Arc<ArcSwap<ResourceSnapshot>>,
    epoch_rx: watch::Receiver<u64>,
}

impl SessionHandle {
    pub fn current(&self) -> Arc<ResourceSnapshot> { self.snap.load_full() }
    pub fn subscribe_epoch(&self) -> watch::Receiver<u64> { self.epoch_rx.clone() }
}

impl Session {
    pub fn new(opts: SessionOptions) -> (Arc<Self>, SessionHandle) {
        let snap = Arc::new(ArcSwap::from_pointee(ResourceSnapshot::default()));
        let (epoch_tx, epoch_rx) = watch::channel(0u64);
        let state = SessionState {
            reconciler: Reconciler::new(),
            logs: LogHierarchy::new(opts.orphan_grace),
            errors: FxHashMap::default(),
            epoch: 0,
        };
        let session = Arc::new(Self { state: Mutex::new(state), opts, snap: Arc::clone(&snap), epoch_tx });
        (session, SessionHandle { snap, epoch_rx })
    }

    fn lock(&self) -> MutexGuard<'_, SessionState> { self.state.lock().unwrap_or_else(|p| p.into_inner()) }

    /// Apply one event; returns whether anything observable changed.
    pub fn apply(&self, event: &Event) -> bool {
        let mut st = self.lock();
        let mut resources_changed = false;
        let changed = match event {
            Event::Object(_) | Event::Lifecycle(_) => {
                resources_changed = st.reconciler.apply(event).changed();
                resources_changed
            }
            Event::Log(log) => st.logs.push(log.clone()),
            Event::Error(err) => {
                let cap = self.opts.errors_per_object.max(1);
                let list = st.errors.entry(err.envelope.obj_uri.clone()).or_default();
                if list.len() >= cap {
                    list.pop_front();
                }
                list.push_back(err.clone());
                true
            }
        };
        if changed {
            st.epoch = st.epoch.saturating_add(1);
            // Logs and errors leave the resource map alone; keep the last snapshot.
            if resources_changed {
                let mut next = st.reconciler.freeze();
                Arc::make_mut(&mut next).epoch = st.epoch;
                self.snap.store(next);
            }
            let _ = self.epoch_tx.send(st.epoch);
        }
        changed
    }

    /// Bulk-apply events read at session start (typically SYNC objects).
    pub fn prime<'a>(&self, events: impl IntoIterator<Item = &'a Event>) -> usize {
        let applied = events.into_iter().filter(|ev| self.apply(ev)).count();
        info!(applied, "session: primed");
        applied
    }

    pub fn log_forest(&self, obj_uri: &str) -> Vec<LogNode> { self.lock().logs.forest(obj_uri) }

    pub fn errors(&self, obj_uri: &str) -> Vec<ErrorEvent> {
        self.lock().errors.get(obj_uri).map(|l| l.iter().cloned().collect()).unwrap_or_default()
    }

    pub fn epoch(&self) -> u64 { self.lock().epoch }
}

impl EventSink for Session {
    fn deliver(&self, event: &Event) -> Result<(), SinkError> {
        if !self.apply(event) {
            debug!(obj = %event.obj_uri(), kind = event.kind().as_str(), "session: event had no effect");
        }
        Ok(())
    }
}
