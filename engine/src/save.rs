//! Save planning.
//!
//! A save sends every dirty key to the server. The plan is computed from a
//! snapshot of both sides taken when the save starts, so edits arriving while
//! the write is in flight are left for the next save.

use crate::store::{DualState, Snapshot};
use crate::{Record, RecordKey, TableQuery};
use serde_json::Value;

/// Writes for one save attempt and the state they were computed from.
#[derive(Debug, Clone)]
pub struct SavePlan {
    /// One write per dirty key, in key order
    pub writes: Vec<(RecordKey, Record)>,
    local_at_start: Snapshot,
    server_at_start: Snapshot,
    local_version: u64,
}

impl SavePlan {
    /// Compute the writes needed to bring the server up to date.
    pub fn build(query: &TableQuery, state: &DualState) -> Self {
        let local = state.local();
        let server = state.server();

        let writes = state
            .dirty_keys()
            .into_iter()
            .filter_map(|key| {
                let record = local.get(&key)?;
                let write = build_write(query, &key, record, server.get(&key));
                Some((key, write))
            })
            .collect();

        Self {
            writes,
            local_at_start: local,
            server_at_start: server,
            local_version: state.local_version(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.writes.is_empty()
    }

    pub fn records(&self) -> Vec<Record> {
        self.writes.iter().map(|(_, r)| r.clone()).collect()
    }

    /// Record a successful save in `state`.
    ///
    /// A key's server value advances to the saved local value only if no
    /// server update for that key arrived while the save was in flight.
    /// Returns true if local state changed in the meantime and another save
    /// is needed.
    pub fn acknowledge(&self, state: &mut DualState) -> bool {
        for (key, _) in &self.writes {
            if state.get_server(key) != self.server_at_start.get(key) {
                tracing::debug!(key = %key, "Server value moved during save");
                continue;
            }
            if let Some(saved) = self.local_at_start.get(key) {
                state.set_server(key.clone(), saved.clone());
            }
        }
        state.local_version() != self.local_version
    }
}

/// Build the write for one record: primary key, required fields and
/// every field that differs from the server copy. Fields removed locally are
/// sent as `null`.
fn build_write(query: &TableQuery, key: &str, local: &Record, server: Option<&Record>) -> Record {
    let mut write = query.pk_values(key, Some(local));

    for (field, value) in local {
        let unchanged = server.and_then(|s| s.get(field)) == Some(value);
        if query.required().contains(field) || !unchanged {
            write.insert(field.clone(), value.clone());
        }
    }

    if let Some(server) = server {
        for field in server.keys() {
            if !local.contains_key(field) {
                write.insert(field.clone(), Value::Null);
            }
        }
    }

    write
}
