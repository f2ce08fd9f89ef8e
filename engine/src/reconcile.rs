//! Reconciliation of server data with the dual-state store.
//!
//! The reconciler has two entry points: [`Reconciler::apply_snapshot`] for a
//! complete result set received on (re)connect, and
//! [`Reconciler::apply_update`] for a single changefeed record.
//!
//! # 3-way merge
//!
//! For a key with a new server value `new`, the current local value `local`
//! and the previously recorded server value `last`:
//!
//! 1. No local value: adopt `new`.
//! 2. Replay the upstream delta (`new` relative to `last`) onto `local`, field
//!    by field. Fields the local copy has edited itself keep the local value.
//! 3. If the merged value differs from `local`, the key changed.
//! 4. If the merged value differs from `new`, local edits are still pending:
//!    report a conflict and request a save.
//! 5. Record `new` as the server value.

use crate::store::DualState;
use crate::{Record, RecordKey, TableQuery};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Local edits and upstream changes disagree on a record after a merge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Conflict {
    /// Key of the conflicting record
    pub key: RecordKey,
    /// Value just received from the server
    pub new_val: Record,
    /// Local value after the merge, which will be saved again
    pub old_val: Record,
}

/// Result of reconciliation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReconcileResult {
    /// Keys whose local value changed, sorted and deduplicated
    pub changed: Vec<RecordKey>,
    /// Detected conflicts
    pub conflicts: Vec<Conflict>,
    /// Whether a save should be forced
    pub needs_save: bool,
    /// Whether this was the first snapshot ever applied
    pub first_load: bool,
}

impl ReconcileResult {
    /// Whether subscribers should be told about this result.
    pub fn should_notify(&self) -> bool {
        self.first_load || !self.changed.is_empty()
    }
}

#[derive(Debug, Default)]
struct Tracker {
    changed: BTreeSet<RecordKey>,
    conflicts: Vec<Conflict>,
    needs_save: bool,
}

impl Tracker {
    fn finish(self, first_load: bool) -> ReconcileResult {
        ReconcileResult {
            changed: self.changed.into_iter().collect(),
            conflicts: self.conflicts,
            needs_save: self.needs_save,
            first_load,
        }
    }
}

/// Applies server data to a [`DualState`].
pub struct Reconciler<'a> {
    query: &'a TableQuery,
    state: &'a mut DualState,
}

impl<'a> Reconciler<'a> {
    /// Create a new reconciler.
    pub fn new(query: &'a TableQuery, state: &'a mut DualState) -> Self {
        Self { query, state }
    }

    /// Restructure rows into a key-to-record map, skipping rows without a key.
    pub fn index_rows(&self, rows: Vec<Record>) -> BTreeMap<RecordKey, Record> {
        let mut out = BTreeMap::new();
        for row in rows {
            match self.query.key_of(&row) {
                Some(key) => {
                    out.insert(key, row);
                }
                None => {
                    tracing::warn!(
                        table = %self.query.table(),
                        "Ignoring row without primary key"
                    );
                }
            }
        }
        out
    }

    /// Merge a complete server snapshot.
    pub fn apply_snapshot(&mut self, rows: Vec<Record>) -> ReconcileResult {
        let incoming = self.index_rows(rows);

        if !self.state.is_loaded() {
            let changed = incoming.keys().cloned().collect();
            self.state.adopt(incoming);
            return ReconcileResult {
                changed,
                first_load: true,
                ..Default::default()
            };
        }

        let mut tracker = Tracker::default();
        let local_keys: Vec<RecordKey> = self.state.local().keys().cloned().collect();

        for key in &local_keys {
            match incoming.get(key) {
                Some(new_val) => self.merge_key(key, new_val.clone(), &mut tracker),
                None => self.drop_unreported(key, &mut tracker),
            }
        }

        for (key, record) in &incoming {
            if self.state.get_local(key).is_none() {
                self.state.set_local(key.clone(), record.clone());
                tracker.changed.insert(key.clone());
            }
        }

        self.state.replace_server(incoming);

        let result = tracker.finish(false);
        tracing::debug!(
            table = %self.query.table(),
            changed = result.changed.len(),
            conflicts = result.conflicts.len(),
            "Applied snapshot"
        );
        result
    }

    /// Merge one changefeed record.
    ///
    /// `old_val` is the server's prior value; when `new_val` is absent or has
    /// a different key, the record under the old key was deleted.
    pub fn apply_update(
        &mut self,
        new_val: Option<Record>,
        old_val: Option<Record>,
    ) -> ReconcileResult {
        let mut tracker = Tracker::default();
        let new_key = new_val.as_ref().and_then(|r| self.query.key_of(r));
        let old_key = old_val.as_ref().and_then(|r| self.query.key_of(r));

        if let Some(old_key) = &old_key {
            if new_key.as_ref() != Some(old_key) {
                self.drop_unreported(old_key, &mut tracker);
                self.state.remove_server(old_key);
            }
        }

        if let (Some(key), Some(record)) = (&new_key, new_val) {
            self.merge_key(key, record, &mut tracker);
        }

        tracker.finish(false)
    }

    /// The server no longer reports `key`. Delete it locally unless the local
    /// copy has changes the server has not seen.
    fn drop_unreported(&mut self, key: &str, tracker: &mut Tracker) {
        let Some(local) = self.state.get_local(key) else {
            return;
        };
        if Some(local) == self.state.get_server(key) {
            self.state.remove_local(key);
            tracker.changed.insert(key.to_string());
        } else {
            tracing::debug!(
                table = %self.query.table(),
                key = %key,
                "Keeping unsaved record the server no longer reports"
            );
            tracker.needs_save = true;
        }
    }

    fn merge_key(&mut self, key: &str, new_val: Record, tracker: &mut Tracker) {
        let outcome = merge_values(
            &new_val,
            self.state.get_local(key),
            self.state.get_server(key),
        );

        if outcome.changed {
            self.state.set_local(key.to_string(), outcome.merged.clone());
            tracker.changed.insert(key.to_string());
        }
        if outcome.conflict {
            tracing::warn!(
                table = %self.query.table(),
                key = %key,
                "Local and upstream values differ after merge"
            );
            tracker.conflicts.push(Conflict {
                key: key.to_string(),
                new_val: new_val.clone(),
                old_val: outcome.merged,
            });
            tracker.needs_save = true;
        }
        self.state.set_server(key.to_string(), new_val);
    }
}

/// Outcome of merging one key.
#[derive(Debug, Clone, PartialEq)]
pub struct MergeOutcome {
    pub merged: Record,
    pub changed: bool,
    pub conflict: bool,
}

/// 3-way merge of a single record.
pub fn merge_values(
    new_val: &Record,
    local: Option<&Record>,
    last_server: Option<&Record>,
) -> MergeOutcome {
    let Some(local) = local else {
        return MergeOutcome {
            merged: new_val.clone(),
            changed: true,
            conflict: false,
        };
    };

    let mut merged = local.clone();

    for (field, value) in new_val {
        let last = last_server.and_then(|r| r.get(field));
        if last == Some(value) {
            continue;
        }
        let locally_edited = local.get(field) != last;
        if !locally_edited {
            merged.insert(field.clone(), value.clone());
        }
    }

    if let Some(last_server) = last_server {
        for (field, last) in last_server {
            if new_val.contains_key(field) {
                continue;
            }
            if local.get(field) == Some(last) {
                merged.remove(field);
            }
        }
    }

    let changed = &merged != local;
    let conflict = &merged != new_val;
    MergeOutcome {
        merged,
        changed,
        conflict,
    }
}
