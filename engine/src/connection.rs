//! Connection lifecycle.
//!
//! ```text
//! Connecting ──► Connected ──► Disconnected ──► Reconnecting ──► Connected
//!      │                            ▲                 │
//!      └────────────────────────────┴─────────────────┘
//!
//! any state ──► Closed (terminal)
//! ```

use serde::{Deserialize, Serialize};

/// State of a synchronized table's connection to the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    /// Waiting for the first snapshot
    Connecting,
    /// Snapshot applied, changefeed live
    Connected,
    /// Transport lost; local edits are kept
    Disconnected,
    /// Transport back; saving and resubscribing
    Reconnecting,
    /// Terminal
    Closed,
}

impl ConnectionState {
    pub fn is_closed(&self) -> bool {
        matches!(self, ConnectionState::Closed)
    }

    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }

    /// Whether the table may talk to the transport in this state.
    pub fn can_save(&self) -> bool {
        matches!(
            self,
            ConnectionState::Connected | ConnectionState::Reconnecting
        )
    }

    /// Whether moving to `next` is a valid transition.
    pub fn can_transition_to(&self, next: ConnectionState) -> bool {
        use ConnectionState::*;
        match (self, next) {
            (Closed, _) => false,
            (_, Closed) => true,
            (Connecting, Connected)
            | (Connecting, Disconnected)
            | (Connected, Disconnected)
            | (Disconnected, Reconnecting)
            | (Reconnecting, Connected)
            | (Reconnecting, Disconnected) => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionState::Connecting => write!(f, "connecting"),
            ConnectionState::Connected => write!(f, "connected"),
            ConnectionState::Disconnected => write!(f, "disconnected"),
            ConnectionState::Reconnecting => write!(f, "reconnecting"),
            ConnectionState::Closed => write!(f, "closed"),
        }
    }
}

/// How the initial snapshot and the changefeed are acquired.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubscribeStrategy {
    /// One changefeed query delivers the snapshot and the feed, so no update
    /// can fall between them.
    Strict,
    /// A one-shot read races the changefeed query. Lower latency, but updates
    /// landing between the two may be missed until the next resync.
    Standby,
}

impl SubscribeStrategy {
    pub fn for_standby(standby: bool) -> Self {
        if standby {
            SubscribeStrategy::Standby
        } else {
            SubscribeStrategy::Strict
        }
    }
}

/// Connection bookkeeping for one table.
#[derive(Debug, Clone)]
pub struct Connection {
    state: ConnectionState,
    /// Id of the live changefeed, if any
    feed_id: Option<String>,
    /// Bumped whenever the current subscription is abandoned, so events from
    /// an old feed can be recognised and dropped
    generation: u64,
}

impl Default for Connection {
    fn default() -> Self {
        Self::new()
    }
}

impl Connection {
    pub fn new() -> Self {
        Self {
            state: ConnectionState::Connecting,
            feed_id: None,
            generation: 0,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn feed_id(&self) -> Option<&str> {
        self.feed_id.as_deref()
    }

    /// Move to `next` if the transition is valid. Returns whether it happened.
    pub fn transition(&mut self, next: ConnectionState) -> bool {
        if self.state == next {
            return false;
        }
        if !self.state.can_transition_to(next) {
            tracing::debug!(from = %self.state, to = %next, "Ignoring invalid transition");
            return false;
        }
        tracing::info!(from = %self.state, to = %next, "Connection state changed");
        self.state = next;
        true
    }

    /// Start a new subscription attempt, invalidating any previous one.
    pub fn begin_subscription(&mut self) -> u64 {
        self.generation += 1;
        self.generation
    }

    /// Record the feed of the subscription started with `generation`.
    /// Returns false if that subscription has been superseded.
    pub fn attach_feed(&mut self, generation: u64, feed_id: Option<String>) -> bool {
        if self.generation != generation || self.state.is_closed() {
            return false;
        }
        self.feed_id = feed_id;
        true
    }

    pub fn is_current(&self, generation: u64) -> bool {
        self.generation == generation && !self.state.is_closed()
    }

    /// The transport went away. The far side has already dropped the feed, so
    /// it is forgotten rather than cancelled.
    pub fn lost(&mut self) -> bool {
        if !self.transition(ConnectionState::Disconnected) {
            return false;
        }
        self.feed_id = None;
        self.generation += 1;
        true
    }

    /// The server ended the feed while the transport stayed up.
    pub fn feed_ended(&mut self) {
        self.feed_id = None;
        self.generation += 1;
    }

    /// Close for good. Returns the feed that should be cancelled, if any.
    pub fn close(&mut self) -> Option<String> {
        self.state = ConnectionState::Closed;
        self.generation += 1;
        self.feed_id.take()
    }
}
