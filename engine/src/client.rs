//! Transport boundary.
//!
//! The engine never talks to the network itself. Everything it needs from the
//! backend goes through the [`Client`] trait: one-shot reads, changefeed
//! subscriptions, writes, cancellation and connection signals.
//!
//! [`MockClient`] is an in-memory implementation used by the tests and
//! benchmarks.

use crate::record::into_record;
use crate::{Error, Record};
use futures::future::BoxFuture;
use futures::stream::BoxStream;
use futures::{FutureExt, StreamExt};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch};

/// Reserved marker identifying errors that must not be retried.
pub const FATAL_MARKER: &str = "FATAL";

/// Marker identifying errors caused by a skewed client clock.
pub const CLOCK_SKEW_MARKER: &str = "clock skew";

/// An error reported by the transport.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct ClientError {
    pub message: String,
}

impl ClientError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    /// Whether the message carries the fatal marker and matches none of the
    /// given exceptions.
    pub fn is_fatal(&self, exceptions: &[String]) -> bool {
        self.message.contains(FATAL_MARKER)
            && !exceptions.iter().any(|e| self.message.contains(e.as_str()))
    }

    pub fn is_clock_skew(&self) -> bool {
        self.message.to_lowercase().contains(CLOCK_SKEW_MARKER)
    }
}

/// A query sent to the transport.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryRequest {
    /// `{table: [template]}` for reads, `{table: [records]}` for writes
    pub query: Value,
    /// Whether to open a changefeed along with the initial read
    pub changes: bool,
    pub timeout: Duration,
    pub options: Vec<Value>,
}

impl QueryRequest {
    /// A one-shot read.
    pub fn read(query: Value, timeout: Duration, options: Vec<Value>) -> Self {
        Self {
            query,
            changes: false,
            timeout,
            options,
        }
    }

    /// A read that also opens a changefeed.
    pub fn changefeed(query: Value, timeout: Duration, options: Vec<Value>) -> Self {
        Self {
            query,
            changes: true,
            timeout,
            options,
        }
    }

    /// A write of the given records.
    pub fn write(table: &str, records: Vec<Record>, timeout: Duration) -> Self {
        let records: Vec<Value> = records.into_iter().map(Value::Object).collect();
        Self {
            query: json!({ table: records }),
            changes: false,
            timeout,
            options: vec![json!({"set": true})],
        }
    }

    pub fn is_write(&self) -> bool {
        self.options
            .iter()
            .any(|o| o.get("set").and_then(Value::as_bool).unwrap_or(false))
    }

    /// Records carried by a write request.
    pub fn records(&self) -> Vec<Record> {
        match &self.query {
            Value::Object(obj) => obj
                .values()
                .filter_map(Value::as_array)
                .flatten()
                .filter_map(|v| into_record(v.clone()))
                .collect(),
            _ => Vec::new(),
        }
    }
}

/// An incremental event on a changefeed.
#[derive(Debug, Clone, PartialEq)]
pub enum FeedEvent {
    /// A record changed. `new_val` is absent for deletes; `old_val` is the
    /// prior value when the server reports it.
    Change {
        new_val: Option<Record>,
        old_val: Option<Record>,
    },
    /// The server ended the subscription.
    Cancelled,
}

pub type Changefeed = BoxStream<'static, Result<FeedEvent, ClientError>>;

/// Response to a [`QueryRequest`].
pub struct QueryResponse {
    /// Subscription id, present when a changefeed was opened
    pub id: Option<String>,
    /// `{table: records | record}`
    pub payload: Value,
    /// Incremental events following the initial read
    pub feed: Option<Changefeed>,
}

impl std::fmt::Debug for QueryResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryResponse")
            .field("id", &self.id)
            .field("payload", &self.payload)
            .field("feed", &self.feed.is_some())
            .finish()
    }
}

impl QueryResponse {
    /// Records for `table` in the payload. A single object counts as one row.
    pub fn rows(&self, table: &str) -> crate::Result<Vec<Record>> {
        match self.payload.get(table) {
            None | Some(Value::Null) => Ok(Vec::new()),
            Some(Value::Array(items)) => items
                .iter()
                .map(|v| {
                    into_record(v.clone())
                        .ok_or_else(|| Error::InvalidRecord(format!("expected object, got {v}")))
                })
                .collect(),
            Some(Value::Object(obj)) => Ok(vec![obj.clone()]),
            Some(other) => Err(Error::InvalidRecord(format!(
                "expected records for {table}, got {other}"
            ))),
        }
    }
}

/// Connection signals emitted by the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientSignal {
    Connected,
    Disconnected,
}

/// The transport capability the engine runs on.
pub trait Client: Send + Sync + 'static {
    /// Execute a query; see [`QueryRequest`].
    fn query(&self, request: QueryRequest) -> BoxFuture<'_, Result<QueryResponse, ClientError>>;

    /// Best-effort cancellation of a changefeed.
    fn query_cancel(&self, id: &str) -> BoxFuture<'_, Result<(), ClientError>>;

    /// Subscribe to connection signals.
    fn signals(&self) -> broadcast::Receiver<ClientSignal>;

    /// Show a persistent warning to the user.
    fn alert(&self, _message: &str) {}
}

type FeedSender = futures::channel::mpsc::UnboundedSender<Result<FeedEvent, ClientError>>;

#[derive(Default)]
struct MockState {
    rows: Vec<Record>,
    next_id: u64,
    feeds: Vec<(String, FeedSender)>,
    /// Feeds orphaned by a disconnect; kept alive so their streams never end
    orphaned: Vec<(String, FeedSender)>,
    reads: usize,
    changefeeds: usize,
    writes: Vec<Vec<Record>>,
    write_errors: VecDeque<ClientError>,
    query_errors: VecDeque<ClientError>,
    cancels: Vec<String>,
    alerts: Vec<String>,
}

/// An in-memory client for tests.
pub struct MockClient {
    state: Mutex<MockState>,
    signals: broadcast::Sender<ClientSignal>,
    write_gate: watch::Sender<bool>,
}

impl Default for MockClient {
    fn default() -> Self {
        Self::new()
    }
}

impl MockClient {
    pub fn new() -> Self {
        let (signals, _) = broadcast::channel(16);
        let (write_gate, _) = watch::channel(true);
        Self {
            state: Mutex::new(MockState::default()),
            signals,
            write_gate,
        }
    }

    pub fn new_shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Set the rows returned by reads.
    pub fn set_rows(&self, rows: Vec<Value>) {
        self.state.lock().rows = rows.into_iter().filter_map(into_record).collect();
    }

    /// Push a change to every open changefeed.
    pub fn push_change(&self, new_val: Option<Value>, old_val: Option<Value>) {
        let event = FeedEvent::Change {
            new_val: new_val.and_then(into_record),
            old_val: old_val.and_then(into_record),
        };
        self.push_event(Ok(event));
    }

    pub fn push_event(&self, event: Result<FeedEvent, ClientError>) {
        let state = self.state.lock();
        for (_, feed) in &state.feeds {
            let _ = feed.unbounded_send(event.clone());
        }
    }

    /// Simulate a transport disconnect. Open feeds go silent.
    pub fn disconnect(&self) {
        {
            let mut state = self.state.lock();
            let feeds = std::mem::take(&mut state.feeds);
            state.orphaned.extend(feeds);
        }
        let _ = self.signals.send(ClientSignal::Disconnected);
    }

    pub fn reconnect(&self) {
        let _ = self.signals.send(ClientSignal::Connected);
    }

    /// Block writes until [`MockClient::release_writes`] is called.
    pub fn hold_writes(&self) {
        self.write_gate.send_replace(false);
    }

    pub fn release_writes(&self) {
        self.write_gate.send_replace(true);
    }

    /// Fail the next write with the given message.
    pub fn fail_next_write(&self, message: &str) {
        self.state
            .lock()
            .write_errors
            .push_back(ClientError::new(message));
    }

    /// Fail the next read or changefeed query with the given message.
    pub fn fail_next_query(&self, message: &str) {
        self.state
            .lock()
            .query_errors
            .push_back(ClientError::new(message));
    }

    /// Number of write calls received, including failed ones.
    pub fn write_count(&self) -> usize {
        self.state.lock().writes.len()
    }

    pub fn writes(&self) -> Vec<Vec<Record>> {
        self.state.lock().writes.clone()
    }

    pub fn read_count(&self) -> usize {
        self.state.lock().reads
    }

    pub fn changefeed_count(&self) -> usize {
        self.state.lock().changefeeds
    }

    pub fn open_feeds(&self) -> usize {
        self.state.lock().feeds.len()
    }

    pub fn cancels(&self) -> Vec<String> {
        self.state.lock().cancels.clone()
    }

    pub fn alerts(&self) -> Vec<String> {
        self.state.lock().alerts.clone()
    }

    async fn handle(&self, request: QueryRequest) -> Result<QueryResponse, ClientError> {
        let table = match &request.query {
            Value::Object(obj) => obj.keys().next().cloned().unwrap_or_default(),
            _ => String::new(),
        };

        if request.is_write() {
            let error = {
                let mut state = self.state.lock();
                state.writes.push(request.records());
                state.write_errors.pop_front()
            };
            let mut gate = self.write_gate.subscribe();
            let _ = gate.wait_for(|open| *open).await;
            return match error {
                Some(err) => Err(err),
                None => Ok(QueryResponse {
                    id: None,
                    payload: json!({}),
                    feed: None,
                }),
            };
        }

        let mut state = self.state.lock();
        if let Some(err) = state.query_errors.pop_front() {
            return Err(err);
        }
        let rows: Vec<Value> = state.rows.iter().cloned().map(Value::Object).collect();
        let payload = json!({ table: rows });

        if !request.changes {
            state.reads += 1;
            return Ok(QueryResponse {
                id: None,
                payload,
                feed: None,
            });
        }

        state.changefeeds += 1;
        state.next_id += 1;
        let id = format!("feed-{}", state.next_id);
        let (tx, rx) = futures::channel::mpsc::unbounded();
        state.feeds.push((id.clone(), tx));
        Ok(QueryResponse {
            id: Some(id),
            payload,
            feed: Some(rx.boxed()),
        })
    }
}

impl Client for MockClient {
    fn query(&self, request: QueryRequest) -> BoxFuture<'_, Result<QueryResponse, ClientError>> {
        self.handle(request).boxed()
    }

    fn query_cancel(&self, id: &str) -> BoxFuture<'_, Result<(), ClientError>> {
        let mut state = self.state.lock();
        state.cancels.push(id.to_string());
        state.feeds.retain(|(feed_id, _)| feed_id != id);
        futures::future::ready(Ok(())).boxed()
    }

    fn signals(&self) -> broadcast::Receiver<ClientSignal> {
        self.signals.subscribe()
    }

    fn alert(&self, message: &str) {
        self.state.lock().alerts.push(message.to_string());
    }
}
