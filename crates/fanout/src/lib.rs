//! kblocks fan-out: delivers every consumed event to each registered sink,
//! in consumption order, isolating sink failures from each other.

#![forbid(unsafe_code)]

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwap;
use kblocks_core::Event;
use kblocks_stream::{EventHandler, HandlerError};
use metrics::counter;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    #[error("sink is full")]
    Full,
    /// The receiving side is gone; the sink is unregistered.
    #[error("sink is closed")]
    Closed,
    #[error("sink failed: {0}")]
    Failed(String),
}

/// Downstream receiver of events, typically one presentation session.
pub trait EventSink: Send + Sync {
    fn deliver(&self, event: &Event) -> Result<(), SinkError>;
}

/// Adapts a closure into a sink.
pub struct FnSink<F>(pub F);

impl<F> EventSink for FnSink<F>
where
    F: Fn(&Event) -> Result<(), SinkError> + Send + Sync,
{
    fn deliver(&self, event: &Event) -> Result<(), SinkError> { (self.0)(event) }
}

/// Bounded channel sink. A full channel drops the event for this sink only.
pub struct ChannelSink {
    tx: mpsc::Sender<Event>,
}

impl ChannelSink {
    pub fn new(cap: usize) -> (Self, mpsc::Receiver<Event>) {
        let (tx, rx) = mpsc::channel(cap.max(1));
        (Self { tx }, rx)
    }
}

impl EventSink for ChannelSink {
    fn deliver(&self, event: &Event) -> Result<(), SinkError> {
        self.tx.try_send(event.clone()).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => SinkError::Full,
            mpsc::error::TrySendError::Closed(_) => SinkError::Closed,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SinkId(u64);

struct Registered {
    id: SinkId,
    name: String,
    sink: Arc<dyn EventSink>,
}

/// Outcome of publishing one event.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Delivery {
    pub delivered: usize,
    pub failed: usize,
    pub removed: usize,
}

/// Registry of live sinks. Registration order is delivery order; a sink that
/// joins late only sees events published after it registered.
pub struct FanOut {
    sinks: ArcSwap<Vec<Arc<Registered>>>,
    next_id: AtomicU64,
}

impl Default for FanOut {
    fn default() -> Self { Self::new() }
}

impl FanOut {
    pub fn new() -> Self { Self { sinks: ArcSwap::from_pointee(Vec::new()), next_id: AtomicU64::new(1) } }

    pub fn register(&self, name: impl Into<String>, sink: Arc<dyn EventSink>) -> SinkId {
        let id = SinkId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let reg = Arc::new(Registered { id, name: name.into(), sink });
        info!(sink = %reg.name, id = id.0, "fanout: sink registered");
        self.sinks.rcu(|cur| {
            let mut next = Vec::with_capacity(cur.len() + 1);
            next.extend(cur.iter().cloned());
            next.push(Arc::clone(&reg));
            next
        });
        id
    }

    /// Returns whether the sink was registered.
    pub fn unregister(&self, id: SinkId) -> bool {
        let before = self.sinks.load().len();
        self.remove(&[id]);
        let removed = self.sinks.load().len() < before;
        if removed {
            info!(id = id.0, "fanout: sink unregistered");
        }
        removed
    }

    pub fn len(&self) -> usize { self.sinks.load().len() }

    pub fn is_empty(&self) -> bool { self.len() == 0 }

    /// Deliver `event` to every sink registered at call time.
    pub fn publish(&self, event: &Event) -> Delivery {
        let sinks = self.sinks.load_full();
        let mut out = Delivery::default();
        let mut closed: Vec<SinkId> = Vec::new();
        for reg in sinks.iter() {
            let res = catch_unwind(AssertUnwindSafe(|| reg.sink.deliver(event)))
                .unwrap_or_else(|_| Err(SinkError::Failed("sink panicked".to_string())));
            match res {
                Ok(()) => out.delivered += 1,
                Err(SinkError::Closed) => {
                    debug!(sink = %reg.name, "fanout: sink closed");
                    closed.push(reg.id);
                }
                Err(e) => {
                    out.failed += 1;
                    counter!("fanout_sink_errors_total", 1u64);
                    warn!(sink = %reg.name, obj = %event.obj_uri(), error = %e, "fanout: delivery failed");
                }
            }
        }
        counter!("fanout_deliveries_total", out.delivered as u64);
        if !closed.is_empty() {
            self.remove(&closed);
            out.removed = closed.len();
            info!(count = closed.len(), "fanout: removed closed sinks");
        }
        out
    }

    fn remove(&self, ids: &[SinkId]) {
        self.sinks.rcu(|cur| cur.iter().filter(|r| !ids.contains(&r.id)).cloned().collect::<Vec<_>>());
    }
}

impl EventHandler for FanOut {
    fn handle(&self, event: &Event) -> Result<(), HandlerError> {
        self.publish(event);
        Ok(())
    }
}
