//! Change notifications.
//!
//! Every table owns an [`Emitter`] that fans [`TableEvent`]s out to any number
//! of [`Subscription`]s over a broadcast channel. When a throttle interval is
//! configured, `Change` notifications are batched: keys accumulate in a set
//! and are delivered once per interval as a single sorted notification.

use crate::reconcile::Conflict;
use crate::{Record, RecordKey};
use parking_lot::Mutex;
use std::collections::{BTreeSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

/// Capacity of the per-table event channel. Slow subscribers lose the oldest
/// events beyond this.
pub const CHANNEL_CAPACITY: usize = 256;

/// An event observed on a synchronized table.
#[derive(Debug, Clone, PartialEq)]
pub enum TableEvent {
    /// Snapshot applied and changefeed live
    Connected,
    /// Transport lost
    Disconnected,
    /// Local state is about to change
    BeforeChange,
    /// Local values of these keys changed. Empty on a first load of an empty
    /// table.
    Change(Vec<RecordKey>),
    /// Local edits disagree with a server update
    Conflict(Conflict),
    /// These records were written to the server
    Saved(Vec<Record>),
    /// The table was closed; no further events follow
    Closed,
}

struct EmitterState {
    sender: Option<broadcast::Sender<TableEvent>>,
    throttle: Option<Duration>,
    /// Keys waiting for the next throttled flush. `Some` while a flush is
    /// scheduled, even if no key has been added yet.
    pending: Option<BTreeSet<RecordKey>>,
    flush: Option<JoinHandle<()>>,
}

/// Fans table events out to subscribers.
#[derive(Clone)]
pub struct Emitter {
    state: Arc<Mutex<EmitterState>>,
}

impl Emitter {
    pub fn new(throttle: Option<Duration>) -> Self {
        let (sender, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            state: Arc::new(Mutex::new(EmitterState {
                sender: Some(sender),
                throttle: throttle.filter(|t| !t.is_zero()),
                pending: None,
                flush: None,
            })),
        }
    }

    pub fn throttle(&self) -> Option<Duration> {
        self.state.lock().throttle
    }

    /// Send an event to every current subscriber.
    pub fn emit(&self, event: TableEvent) {
        let state = self.state.lock();
        if let Some(sender) = &state.sender {
            // no receivers is fine
            let _ = sender.send(event);
        }
    }

    /// Announce changed keys, batching them if throttled.
    pub fn change(&self, keys: Vec<RecordKey>) {
        let mut state = self.state.lock();
        let Some(sender) = state.sender.clone() else {
            return;
        };
        let Some(interval) = state.throttle else {
            let _ = sender.send(TableEvent::Change(keys));
            return;
        };

        if let Some(pending) = &mut state.pending {
            pending.extend(keys);
            return;
        }

        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            let _ = sender.send(TableEvent::Change(keys));
            return;
        };
        state.pending = Some(keys.into_iter().collect());
        let shared = Arc::clone(&self.state);
        state.flush = Some(runtime.spawn(async move {
            tokio::time::sleep(interval).await;
            let mut state = shared.lock();
            state.flush = None;
            let keys = state.pending.take().unwrap_or_default();
            if let Some(sender) = &state.sender {
                tracing::debug!(keys = keys.len(), "Flushing throttled changes");
                let _ = sender.send(TableEvent::Change(keys.into_iter().collect()));
            }
        }));
    }

    /// Subscribe to future events. `None` once closed.
    pub fn subscribe(&self) -> Option<Subscription> {
        let state = self.state.lock();
        state.sender.as_ref().map(|s| Subscription::new(s.subscribe()))
    }

    pub fn subscriber_count(&self) -> usize {
        let state = self.state.lock();
        state.sender.as_ref().map_or(0, |s| s.receiver_count())
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().sender.is_none()
    }

    /// Send [`TableEvent::Closed`] and detach every subscriber. Pending
    /// throttled changes are discarded.
    pub fn close(&self) {
        let mut state = self.state.lock();
        if let Some(flush) = state.flush.take() {
            flush.abort();
        }
        state.pending = None;
        if let Some(sender) = state.sender.take() {
            let _ = sender.send(TableEvent::Closed);
        }
    }
}

impl std::fmt::Debug for Emitter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("Emitter")
            .field("closed", &state.sender.is_none())
            .field("throttle", &state.throttle)
            .finish()
    }
}

/// A stream of events from one table.
///
/// Dropping the subscription unsubscribes.
#[derive(Debug)]
pub struct Subscription {
    /// Events delivered before anything from the channel
    queued: VecDeque<TableEvent>,
    rx: broadcast::Receiver<TableEvent>,
}

impl Subscription {
    fn new(rx: broadcast::Receiver<TableEvent>) -> Self {
        Self {
            queued: VecDeque::new(),
            rx,
        }
    }

    /// Queue an event ahead of the live ones.
    pub fn push_front(&mut self, event: TableEvent) {
        self.queued.push_front(event);
    }

    /// Wait for the next event. Returns `None` once the table is closed and
    /// every event has been consumed.
    pub async fn recv(&mut self) -> Option<TableEvent> {
        if let Some(event) = self.queued.pop_front() {
            return Some(event);
        }
        loop {
            match self.rx.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "Subscriber lagged behind table events");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Next event if one is ready.
    pub fn try_recv(&mut self) -> Option<TableEvent> {
        if let Some(event) = self.queued.pop_front() {
            return Some(event);
        }
        loop {
            match self.rx.try_recv() {
                Ok(event) => return Some(event),
                Err(broadcast::error::TryRecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "Subscriber lagged behind table events");
                }
                Err(_) => return None,
            }
        }
    }

    /// Drain every ready event.
    pub fn drain(&mut self) -> Vec<TableEvent> {
        std::iter::from_fn(|| self.try_recv()).collect()
    }
}
