//! Dual-state store.
//!
//! The store holds two snapshots of the table: `local`, the view the
//! application reads and writes (including edits the server has not
//! confirmed), and `server`, the last state confirmed by the backend. A key
//! whose two values differ is *dirty*.
//!
//! Snapshots are copy-on-write: handing one out is an `Arc` clone and the
//! first mutation after that copies the map once.

use crate::{Record, RecordKey};
use std::collections::BTreeMap;
use std::sync::Arc;

/// An immutable point-in-time view of one side of the store.
pub type Snapshot = Arc<BTreeMap<RecordKey, Record>>;

/// Local and server state for one synchronized table.
#[derive(Debug, Clone, Default)]
pub struct DualState {
    local: Snapshot,
    server: Snapshot,
    /// Whether a first snapshot has been adopted
    loaded: bool,
    /// Incremented on every change to `local`
    local_version: u64,
}

impl DualState {
    /// Create an empty, unloaded store.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_loaded(&self) -> bool {
        self.loaded
    }

    pub fn local_version(&self) -> u64 {
        self.local_version
    }

    /// Snapshot of the local side.
    pub fn local(&self) -> Snapshot {
        Arc::clone(&self.local)
    }

    /// Snapshot of the server side.
    pub fn server(&self) -> Snapshot {
        Arc::clone(&self.server)
    }

    pub fn get_local(&self, key: &str) -> Option<&Record> {
        self.local.get(key)
    }

    pub fn get_server(&self, key: &str) -> Option<&Record> {
        self.server.get(key)
    }

    pub fn len(&self) -> usize {
        self.local.len()
    }

    pub fn is_empty(&self) -> bool {
        self.local.is_empty()
    }

    /// Adopt the first snapshot ever seen as both local and server state.
    pub fn adopt(&mut self, records: BTreeMap<RecordKey, Record>) {
        let snapshot = Arc::new(records);
        self.local = Arc::clone(&snapshot);
        self.server = snapshot;
        self.loaded = true;
        self.local_version += 1;
    }

    pub fn set_local(&mut self, key: RecordKey, record: Record) {
        Arc::make_mut(&mut self.local).insert(key, record);
        self.local_version += 1;
    }

    pub fn remove_local(&mut self, key: &str) -> Option<Record> {
        let removed = Arc::make_mut(&mut self.local).remove(key);
        if removed.is_some() {
            self.local_version += 1;
        }
        removed
    }

    pub fn set_server(&mut self, key: RecordKey, record: Record) {
        Arc::make_mut(&mut self.server).insert(key, record);
    }

    pub fn remove_server(&mut self, key: &str) -> Option<Record> {
        Arc::make_mut(&mut self.server).remove(key)
    }

    /// Replace the whole server side with a fresh snapshot.
    pub fn replace_server(&mut self, records: BTreeMap<RecordKey, Record>) {
        self.server = Arc::new(records);
    }

    /// Whether the local value of `key` differs from the server value.
    pub fn is_dirty(&self, key: &str) -> bool {
        self.local.get(key) != self.server.get(key)
    }

    /// Keys whose local value differs from the server value, in
    /// lexicographic order. Keys only present on the server are not included.
    pub fn dirty_keys(&self) -> Vec<RecordKey> {
        self.local
            .iter()
            .filter(|(key, record)| self.server.get(*key) != Some(*record))
            .map(|(key, _)| key.clone())
            .collect()
    }

    pub fn has_uncommitted_changes(&self) -> bool {
        self.local != self.server
    }

    /// Drop both sides. Used when the table closes.
    pub fn clear(&mut self) {
        self.local = Snapshot::default();
        self.server = Snapshot::default();
        self.loaded = false;
    }
}
