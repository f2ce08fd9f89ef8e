//! The synchronized table engine.
//!
//! A [`SyncTable`] keeps a local mirror of one server table. It subscribes
//! through a [`Client`], reconciles every snapshot and changefeed event into
//! its [`DualState`], and writes local edits back with a debounced,
//! single-flight, retrying save.
//!
//! All state lives behind one mutex that is never held across an `.await`.
//! Background work (signal handling, the changefeed pump, connection retries,
//! debounced saves) runs on spawned tokio tasks, so a table must be opened
//! from within a tokio runtime.

use crate::client::{Changefeed, Client, ClientError, ClientSignal, FeedEvent, QueryRequest};
use crate::config::TableOptions;
use crate::connection::{Connection, ConnectionState, SubscribeStrategy};
use crate::mutation::plan_set;
use crate::notify::{Emitter, Subscription, TableEvent};
use crate::reconcile::{ReconcileResult, Reconciler};
use crate::record::{compound_key, into_record, scalar_key};
use crate::save::SavePlan;
use crate::store::{DualState, Snapshot};
use crate::{Error, MergeMode, Record, RecordKey, Result, Schema, TableQuery};
use futures::future::{BoxFuture, Shared};
use futures::{FutureExt, StreamExt};
use parking_lot::Mutex;
use serde_json::Value;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::Instant;

type SaveFuture = Shared<BoxFuture<'static, Result<()>>>;

struct TableState {
    connection: Connection,
    data: DualState,
    /// A write is in flight
    saving: bool,
    /// Outcome of the save scheduled for the end of the current debounce
    /// window
    pending_save: Option<SaveFuture>,
    signal_task: Option<JoinHandle<()>>,
    connect_task: Option<JoinHandle<()>>,
    pump_task: Option<JoinHandle<()>>,
}

impl TableState {
    fn ensure_loaded(&self) -> Result<()> {
        if self.connection.state().is_closed() {
            return Err(Error::Closed);
        }
        if !self.data.is_loaded() {
            return Err(Error::NotConnected);
        }
        Ok(())
    }

    fn take_tasks(&mut self) -> Vec<JoinHandle<()>> {
        [
            self.signal_task.take(),
            self.connect_task.take(),
            self.pump_task.take(),
        ]
        .into_iter()
        .flatten()
        .collect()
    }
}

struct Inner {
    client: Arc<dyn Client>,
    query: TableQuery,
    options: TableOptions,
    strategy: SubscribeStrategy,
    state: Mutex<TableState>,
    emitter: Emitter,
}

impl Drop for Inner {
    fn drop(&mut self) {
        for task in self.state.get_mut().take_tasks() {
            task.abort();
        }
    }
}

/// Clears the in-flight flag if a save attempt's future is dropped mid-write.
/// A completed write clears it through [`SavingGuard::finish`] instead.
struct SavingGuard<'a>(Option<&'a Inner>);

impl SavingGuard<'_> {
    /// Clear the flag under an already held lock.
    fn finish(mut self, state: &mut TableState) {
        state.saving = false;
        self.0 = None;
    }
}

impl Drop for SavingGuard<'_> {
    fn drop(&mut self) {
        if let Some(inner) = self.0 {
            inner.state.lock().saving = false;
        }
    }
}

/// A locally mirrored, continuously synchronized server table.
///
/// Cloning is cheap and every clone drives the same table.
#[derive(Clone)]
pub struct SyncTable {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for SyncTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("SyncTable")
            .field("table", &self.inner.query.table())
            .field("state", &state.connection.state())
            .field("records", &state.data.len())
            .finish()
    }
}

impl SyncTable {
    /// Parse `query` against `schema` and start synchronizing.
    pub fn open(
        client: Arc<dyn Client>,
        schema: &Schema,
        query: &Value,
        options: TableOptions,
    ) -> Result<Self> {
        let query = TableQuery::parse(query, schema)?;
        Ok(Self::with_query(client, query, options))
    }

    /// Start synchronizing an already parsed query.
    pub fn with_query(client: Arc<dyn Client>, query: TableQuery, options: TableOptions) -> Self {
        let throttle = options.throttle.or(query.schema().throttle);
        let strategy = SubscribeStrategy::for_standby(query.schema().standby);
        // subscribe before connecting so no signal is missed
        let signals = client.signals();

        tracing::info!(
            table = %query.table(),
            strategy = ?strategy,
            "Opening synchronized table"
        );

        let table = Self {
            inner: Arc::new(Inner {
                client,
                query,
                options,
                strategy,
                state: Mutex::new(TableState {
                    connection: Connection::new(),
                    data: DualState::new(),
                    saving: false,
                    pending_save: None,
                    signal_task: None,
                    connect_task: None,
                    pump_task: None,
                }),
                emitter: Emitter::new(throttle),
            }),
        };

        let listener = tokio::spawn(listen(Arc::downgrade(&table.inner), signals));
        table.inner.state.lock().signal_task = Some(listener);
        table.spawn_connect(false);
        table
    }

    fn upgrade(weak: &Weak<Inner>) -> Option<Self> {
        weak.upgrade().map(|inner| Self { inner })
    }

    fn downgrade(&self) -> Weak<Inner> {
        Arc::downgrade(&self.inner)
    }

    // ----- reads -----

    pub fn query(&self) -> &TableQuery {
        &self.inner.query
    }

    pub fn options(&self) -> &TableOptions {
        &self.inner.options
    }

    pub fn table_name(&self) -> &str {
        self.inner.query.table()
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.state.lock().connection.state()
    }

    pub fn is_closed(&self) -> bool {
        self.state().is_closed()
    }

    /// Whether a first snapshot has been applied.
    pub fn is_loaded(&self) -> bool {
        self.inner.state.lock().data.is_loaded()
    }

    fn read<R>(&self, f: impl FnOnce(&DualState) -> R) -> Result<R> {
        let state = self.inner.state.lock();
        state.ensure_loaded()?;
        Ok(f(&state.data))
    }

    /// Local value of the record with canonical key `key`.
    pub fn get(&self, key: &str) -> Result<Option<Record>> {
        self.read(|data| data.get_local(key).cloned())
    }

    /// Look a record up by primary key value: a scalar for single keys, an
    /// array of values in key order for compound keys.
    pub fn lookup(&self, pk: &Value) -> Result<Option<Record>> {
        let key = match pk {
            Value::Array(values) if self.inner.query.has_compound_key() => {
                compound_key(&values.iter().collect::<Vec<_>>())
            }
            other => scalar_key(other),
        };
        match key {
            Some(key) => self.get(&key),
            None => Ok(None),
        }
    }

    /// The first record in key order. Convenient for single-record tables.
    pub fn get_one(&self) -> Result<Option<Record>> {
        self.read(|data| data.local().values().next().cloned())
    }

    /// Snapshot of the whole local state.
    pub fn all(&self) -> Result<Snapshot> {
        self.read(DualState::local)
    }

    pub fn keys(&self) -> Result<Vec<RecordKey>> {
        self.read(|data| data.local().keys().cloned().collect())
    }

    pub fn len(&self) -> Result<usize> {
        self.read(DualState::len)
    }

    pub fn is_empty(&self) -> Result<bool> {
        self.read(DualState::is_empty)
    }

    /// Whether any local edit has not been confirmed by the server.
    pub fn has_uncommitted_changes(&self) -> Result<bool> {
        self.read(DualState::has_uncommitted_changes)
    }

    pub fn dirty_keys(&self) -> Result<Vec<RecordKey>> {
        self.read(DualState::dirty_keys)
    }

    /// Subscribe to table events.
    pub fn subscribe(&self) -> Result<Subscription> {
        if self.is_closed() {
            return Err(Error::Closed);
        }
        self.inner.emitter.subscribe().ok_or(Error::Closed)
    }

    /// Subscribe, starting with a [`TableEvent::Connected`] if the table is
    /// already connected. Used by late joiners of a shared table.
    pub fn join(&self) -> Result<Subscription> {
        let state = self.inner.state.lock();
        let current = state.connection.state();
        if current.is_closed() {
            return Err(Error::Closed);
        }
        let mut events = self.inner.emitter.subscribe().ok_or(Error::Closed)?;
        if current.is_connected() {
            events.push_front(TableEvent::Connected);
        }
        Ok(events)
    }

    /// Whether both handles drive the same table.
    pub fn same_table(&self, other: &SyncTable) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.emitter.subscriber_count()
    }

    // ----- local mutation -----

    /// Apply a local change.
    ///
    /// `changes` must be an object of settable fields. Returns the key of the
    /// changed record, or `None` if the change left it as it was. A save is
    /// scheduled for the end of the debounce window.
    pub fn set(&self, changes: Value, mode: MergeMode) -> Result<Option<RecordKey>> {
        let changes = into_record(changes)
            .ok_or_else(|| Error::InvalidRecord("changes must be an object".into()))?;

        let key = {
            let mut state = self.inner.state.lock();
            state.ensure_loaded()?;
            let Some(planned) = plan_set(&self.inner.query, &state.data, &changes, mode)? else {
                return Ok(None);
            };
            self.inner.emitter.emit(TableEvent::BeforeChange);
            state.data.set_local(planned.key.clone(), planned.record);
            self.inner.emitter.change(vec![planned.key.clone()]);
            planned.key
        };

        tracing::debug!(table = %self.table_name(), key = %key, "Local change");
        self.schedule_save();
        Ok(Some(key))
    }

    // ----- saving -----

    /// Save now if nothing is in flight.
    ///
    /// Fails with [`Error::AlreadySaving`] rather than waiting for a running
    /// save. If local state changes while the write is in flight, the new
    /// changes are written before returning.
    pub async fn save_attempt(&self) -> Result<()> {
        loop {
            let plan = {
                let mut state = self.inner.state.lock();
                if state.connection.state().is_closed() {
                    return Err(Error::Closed);
                }
                if state.saving {
                    return Err(Error::AlreadySaving);
                }
                if !state.connection.state().can_save() || !state.data.is_loaded() {
                    return Err(Error::NotConnected);
                }
                if !self.inner.query.is_writable() {
                    return Ok(());
                }
                let plan = SavePlan::build(&self.inner.query, &state.data);
                if plan.is_empty() {
                    return Ok(());
                }
                state.saving = true;
                plan
            };

            let guard = SavingGuard(Some(&self.inner));
            let records = plan.records();
            tracing::debug!(
                table = %self.table_name(),
                records = records.len(),
                "Saving local changes"
            );
            let request = QueryRequest::write(
                self.table_name(),
                records.clone(),
                self.inner.options.query_timeout,
            );
            let result = self.inner.client.query(request).await;

            // `saving` clears in the same critical section as the acknowledgement
            let outcome = {
                let mut state = self.inner.state.lock();
                guard.finish(&mut state);
                match result {
                    Err(err) => Err(err),
                    Ok(_) if state.connection.state().is_closed() => return Err(Error::Closed),
                    Ok(_) => {
                        let again = plan.acknowledge(&mut state.data);
                        self.inner.emitter.emit(TableEvent::Saved(records));
                        Ok(again)
                    }
                }
            };
            let again = outcome.map_err(|err| self.save_failed(&err))?;
            if !again {
                return Ok(());
            }
            tracing::debug!(table = %self.table_name(), "Local state changed during save");
        }
    }

    fn save_failed(&self, err: &ClientError) -> Error {
        if self.is_closed() {
            return Error::Closed;
        }
        if err.is_clock_skew() {
            tracing::error!(
                table = %self.table_name(),
                error = %err,
                "Save rejected because of clock skew"
            );
            self.inner.client.alert(&format!(
                "Your computer's clock is out of sync; changes to {} cannot be saved: {}",
                self.table_name(),
                err
            ));
        }

        let error = Error::from_client(err, &self.inner.options.fatal_exceptions);
        if matches!(error, Error::Fatal(_)) {
            tracing::error!(table = %self.table_name(), error = %err, "Fatal error while saving");
            self.shutdown(true);
        } else {
            tracing::warn!(table = %self.table_name(), error = %err, "Save failed");
        }
        error
    }

    /// Save local changes.
    ///
    /// Requests are coalesced over the debounce window and share one outcome.
    /// Transient failures are retried with backoff.
    pub async fn save(&self) -> Result<()> {
        if self.is_closed() {
            return Err(Error::Closed);
        }
        self.request_save().await
    }

    /// Start the debounce window without waiting for its outcome.
    fn schedule_save(&self) {
        drop(self.request_save());
    }

    fn request_save(&self) -> SaveFuture {
        let mut state = self.inner.state.lock();
        if let Some(pending) = &state.pending_save {
            return pending.clone();
        }

        let table = self.clone();
        let debounce = self.inner.options.debounce;
        let task = tokio::spawn(async move {
            tokio::time::sleep(debounce).await;
            table.inner.state.lock().pending_save = None;
            table.save_with_retry().await
        });
        let outcome: BoxFuture<'static, Result<()>> = async move {
            // the task only fails if the runtime is shutting down
            task.await.unwrap_or(Err(Error::Closed))
        }
        .boxed();
        let shared = outcome.shared();
        state.pending_save = Some(shared.clone());
        shared
    }

    async fn save_with_retry(&self) -> Result<()> {
        let retry = &self.inner.options.save_retry;
        let started = Instant::now();
        let mut attempt = 0;
        loop {
            let err = match self.save_attempt().await {
                Ok(()) => return Ok(()),
                Err(err) if err.is_retryable() => err,
                Err(err) => return Err(err),
            };
            let delay = retry.delay_for(attempt);
            if !retry.allows(started.elapsed(), delay) {
                tracing::warn!(
                    table = %self.table_name(),
                    attempts = attempt + 1,
                    error = %err,
                    "Giving up on save"
                );
                return Err(err);
            }
            tracing::debug!(
                table = %self.table_name(),
                attempt,
                delay_ms = delay.as_millis() as u64,
                "Retrying save"
            );
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }

    // ----- connection -----

    fn spawn_connect(&self, reconnect: bool) {
        let weak = self.downgrade();
        let task = tokio::spawn(async move {
            if reconnect {
                let Some(table) = Self::upgrade(&weak) else {
                    return;
                };
                let proceed = table.begin_reconnect().await;
                drop(table);
                if !proceed {
                    return;
                }
            }
            connect_with_retry(weak).await;
        });
        let mut state = self.inner.state.lock();
        if state.connection.state().is_closed() {
            task.abort();
            return;
        }
        if let Some(old) = state.connect_task.replace(task) {
            old.abort();
        }
    }

    /// Move to `Reconnecting` and flush offline edits. Returns false if the
    /// table was not disconnected.
    async fn begin_reconnect(&self) -> bool {
        let dirty = {
            let mut state = self.inner.state.lock();
            if !state.connection.transition(ConnectionState::Reconnecting) {
                return false;
            }
            state.data.is_loaded() && state.data.has_uncommitted_changes()
        };
        if dirty {
            if let Err(err) = self.save_attempt().await {
                tracing::warn!(
                    table = %self.table_name(),
                    error = %err,
                    "Saving before resubscribe failed"
                );
            }
        }
        !self.is_closed()
    }

    /// Acquire a snapshot and changefeed and apply them.
    async fn establish(&self) -> Result<()> {
        let generation = {
            let mut state = self.inner.state.lock();
            if state.connection.state().is_closed() {
                return Err(Error::Closed);
            }
            state.connection.begin_subscription()
        };

        let table = self.table_name();
        let query = self.inner.query.to_value();
        let timeout = self.inner.options.query_timeout;
        let options = self.inner.options.query_options.clone();
        let client = &self.inner.client;
        let fatal_exceptions = &self.inner.options.fatal_exceptions;
        let map_err = |err: ClientError| Error::from_client(&err, fatal_exceptions);

        // once the changefeed query succeeds, every failure must cancel it
        let (rows, response) = match self.inner.strategy {
            SubscribeStrategy::Strict => {
                let request = QueryRequest::changefeed(query, timeout, options);
                let response = client.query(request).await.map_err(map_err)?;
                (response.rows(table), response)
            }
            SubscribeStrategy::Standby => {
                let read = client.query(QueryRequest::read(query.clone(), timeout, options.clone()));
                let feed = client.query(QueryRequest::changefeed(query, timeout, options));
                let (read, response) = futures::future::join(read, feed).await;
                let response = response.map_err(map_err)?;
                let rows = read.map_err(map_err).and_then(|read| read.rows(table));
                (rows, response)
            }
        };
        let rows = match rows {
            Ok(rows) => rows,
            Err(err) => {
                self.cancel_feed(response.id).await;
                return Err(err);
            }
        };

        let feed_id = response.id.clone();
        let established = {
            let mut state = self.inner.state.lock();
            if state.connection.attach_feed(generation, feed_id.clone()) {
                state.connection.transition(ConnectionState::Connected);
                let result =
                    Reconciler::new(&self.inner.query, &mut state.data).apply_snapshot(rows);
                if let Some(feed) = response.feed {
                    let pump = tokio::spawn(pump(self.downgrade(), generation, feed));
                    if let Some(old) = state.pump_task.replace(pump) {
                        old.abort();
                    }
                }
                self.publish(&result);
                self.inner.emitter.emit(TableEvent::Connected);
                let needs_save = result.needs_save || state.data.has_uncommitted_changes();
                Some((result.first_load, state.data.len(), needs_save))
            } else {
                None
            }
        };

        let Some((first_load, records, needs_save)) = established else {
            tracing::debug!(table = %table, "Dropping superseded subscription");
            let state = self.state();
            if state != ConnectionState::Disconnected {
                self.cancel_feed(feed_id).await;
            }
            return if state.is_closed() { Err(Error::Closed) } else { Ok(()) };
        };

        tracing::info!(table = %table, records, first_load, "Subscription established");
        if needs_save {
            self.schedule_save();
        }
        Ok(())
    }

    /// Best-effort cancellation of a feed this table will not consume.
    async fn cancel_feed(&self, id: Option<String>) {
        let Some(id) = id else {
            return;
        };
        if let Err(err) = self.inner.client.query_cancel(&id).await {
            tracing::debug!(
                table = %self.table_name(),
                feed = %id,
                error = %err,
                "Cancelling changefeed failed"
            );
        }
    }

    /// Emit the notifications for a reconcile result. Called with the state
    /// lock held, so no reader sees the change before `BeforeChange`.
    fn publish(&self, result: &ReconcileResult) {
        if result.should_notify() {
            self.inner.emitter.emit(TableEvent::BeforeChange);
            self.inner.emitter.change(result.changed.clone());
        }
        for conflict in &result.conflicts {
            self.inner.emitter.emit(TableEvent::Conflict(conflict.clone()));
        }
    }

    /// The transport was lost. Local edits are kept and the changefeed is
    /// forgotten without cancelling it.
    pub fn handle_disconnect(&self) {
        let tasks = {
            let mut state = self.inner.state.lock();
            if !state.connection.lost() {
                return;
            }
            [state.pump_task.take(), state.connect_task.take()]
        };
        for task in tasks.into_iter().flatten() {
            task.abort();
        }
        tracing::info!(table = %self.table_name(), "Disconnected");
        self.inner.emitter.emit(TableEvent::Disconnected);
    }

    /// The transport is back. Unsaved edits are written first, then the
    /// subscription is re-established.
    pub async fn handle_reconnect(&self) -> Result<()> {
        if self.is_closed() {
            return Err(Error::Closed);
        }
        if !self.begin_reconnect().await {
            return if self.is_closed() { Err(Error::Closed) } else { Ok(()) };
        }
        self.establish().await
    }

    /// Apply one changefeed record. Returns the keys whose local value
    /// changed.
    pub fn handle_change(
        &self,
        new_val: Option<Record>,
        old_val: Option<Record>,
    ) -> Result<Vec<RecordKey>> {
        let generation = {
            let state = self.inner.state.lock();
            state.ensure_loaded()?;
            state.connection.generation()
        };
        Ok(self.apply_feed_change(generation, new_val, old_val))
    }

    fn apply_feed_change(
        &self,
        generation: u64,
        new_val: Option<Record>,
        old_val: Option<Record>,
    ) -> Vec<RecordKey> {
        let (result, needs_save) = {
            let mut state = self.inner.state.lock();
            if !state.connection.is_current(generation) || !state.data.is_loaded() {
                tracing::debug!(table = %self.table_name(), "Ignoring stale changefeed event");
                return Vec::new();
            }
            let result =
                Reconciler::new(&self.inner.query, &mut state.data).apply_update(new_val, old_val);
            self.publish(&result);
            let needs_save = result.needs_save;
            (result, needs_save)
        };
        if needs_save {
            self.schedule_save();
        }
        result.changed
    }

    /// The feed ended while the transport stayed up. Subscribe again.
    fn handle_feed_end(&self, generation: u64) {
        {
            let mut state = self.inner.state.lock();
            if !state.connection.is_current(generation) {
                return;
            }
            state.connection.feed_ended();
        }
        tracing::info!(table = %self.table_name(), "Changefeed ended, resubscribing");
        self.spawn_connect(false);
    }

    // ----- waiting -----

    /// Wait until `until` returns a value.
    ///
    /// The predicate is evaluated immediately and again after every table
    /// event. A zero `timeout` waits forever.
    pub async fn wait_until<T, F>(&self, mut until: F, timeout: Duration) -> Result<T>
    where
        F: FnMut(&SyncTable) -> Option<T>,
    {
        let mut events = self.subscribe()?;
        let wait = async {
            loop {
                if let Some(value) = until(self) {
                    return Ok(value);
                }
                match events.recv().await {
                    Some(TableEvent::Closed) | None => return Err(Error::Closed),
                    Some(_) => {}
                }
            }
        };
        if timeout.is_zero() {
            return wait.await;
        }
        tokio::time::timeout(timeout, wait)
            .await
            .unwrap_or(Err(Error::Timeout))
    }

    // ----- closing -----

    /// Close the table. Idempotent.
    ///
    /// The changefeed is cancelled and, unless a save is in flight, unsaved
    /// changes are flushed in the background. Subscribers receive
    /// [`TableEvent::Closed`].
    pub fn close(&self) {
        self.shutdown(false);
    }

    fn shutdown(&self, fatal: bool) {
        let (feed, flush, tasks) = {
            let mut state = self.inner.state.lock();
            let prior = state.connection.state();
            if prior.is_closed() {
                return;
            }
            let flush = if !fatal
                && !state.saving
                && prior.can_save()
                && state.data.is_loaded()
                && self.inner.query.is_writable()
            {
                let plan = SavePlan::build(&self.inner.query, &state.data);
                (!plan.is_empty()).then(|| plan.records())
            } else {
                None
            };
            let feed = state.connection.close();
            state.data.clear();
            state.pending_save = None;
            (feed, flush, state.take_tasks())
        };

        for task in tasks {
            task.abort();
        }
        self.inner.emitter.close();
        tracing::info!(table = %self.table_name(), fatal, "Closed synchronized table");

        if feed.is_none() && flush.is_none() {
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let client = Arc::clone(&self.inner.client);
        let table = self.table_name().to_string();
        let timeout = self.inner.options.query_timeout;
        runtime.spawn(async move {
            if let Some(id) = feed {
                if let Err(err) = client.query_cancel(&id).await {
                    tracing::debug!(table = %table, error = %err, "Cancelling changefeed failed");
                }
            }
            if let Some(records) = flush {
                let count = records.len();
                match client.query(QueryRequest::write(&table, records, timeout)).await {
                    Ok(_) => tracing::debug!(table = %table, records = count, "Flushed on close"),
                    Err(err) => {
                        tracing::warn!(table = %table, error = %err, "Flush on close failed")
                    }
                }
            }
        });
    }
}

async fn listen(weak: Weak<Inner>, mut signals: broadcast::Receiver<ClientSignal>) {
    loop {
        let signal = match signals.recv().await {
            Ok(signal) => signal,
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::warn!(skipped, "Missed connection signals");
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => return,
        };
        let Some(table) = SyncTable::upgrade(&weak) else {
            return;
        };
        match signal {
            ClientSignal::Disconnected => table.handle_disconnect(),
            ClientSignal::Connected if table.state() == ConnectionState::Disconnected => {
                table.spawn_connect(true)
            }
            ClientSignal::Connected => {}
        }
    }
}

async fn connect_with_retry(weak: Weak<Inner>) {
    let started = Instant::now();
    let mut attempt = 0;
    loop {
        let Some(table) = SyncTable::upgrade(&weak) else {
            return;
        };
        let err = match table.establish().await {
            Ok(()) | Err(Error::Closed) => return,
            Err(err) => err,
        };
        if matches!(err, Error::Fatal(_)) {
            tracing::error!(table = %table.table_name(), error = %err, "Fatal error while subscribing");
            table.shutdown(true);
            return;
        }

        let retry = &table.inner.options.connect_retry;
        let delay = retry.delay_for(attempt);
        if !retry.allows(started.elapsed(), delay) {
            tracing::warn!(table = %table.table_name(), error = %err, "Giving up on subscribing");
            return;
        }
        tracing::warn!(
            table = %table.table_name(),
            attempt,
            error = %err,
            "Subscribing failed, retrying"
        );
        drop(table);
        tokio::time::sleep(delay).await;
        attempt += 1;
    }
}

async fn pump(weak: Weak<Inner>, generation: u64, mut feed: Changefeed) {
    while let Some(event) = feed.next().await {
        let Some(table) = SyncTable::upgrade(&weak) else {
            return;
        };
        match event {
            Ok(FeedEvent::Change { new_val, old_val }) => {
                table.apply_feed_change(generation, new_val, old_val);
            }
            Ok(FeedEvent::Cancelled) => {
                tracing::info!(table = %table.table_name(), "Changefeed cancelled by server");
                break;
            }
            Err(err) => {
                let error = Error::from_client(&err, &table.inner.options.fatal_exceptions);
                if matches!(error, Error::Fatal(_)) {
                    tracing::error!(table = %table.table_name(), error = %err, "Fatal changefeed error");
                    table.shutdown(true);
                    return;
                }
                tracing::warn!(table = %table.table_name(), error = %err, "Changefeed error");
                break;
            }
        }
    }
    if let Some(table) = SyncTable::upgrade(&weak) {
        table.handle_feed_end(generation);
    }
}
