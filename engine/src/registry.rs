//! Table registry.
//!
//! Opens each distinct query once per process and shares the engine between
//! every consumer of that query. Entries are keyed by a canonical signature of
//! the query and its options and are reference counted.

use crate::client::Client;
use crate::config::TableOptions;
use crate::notify::Subscription;
use crate::table::SyncTable;
use crate::{Result, Schema, TableQuery};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde_json::{json, Value};
use std::sync::Arc;

/// A consumer's claim on a shared table.
#[derive(Debug)]
pub struct TableHandle {
    pub table: SyncTable,
    pub signature: String,
    /// Events for this consumer
    pub events: Subscription,
}

#[derive(Debug)]
struct Registered {
    table: SyncTable,
    refs: usize,
}

/// Process-wide cache of synchronized tables.
///
/// Thread-safe and can be shared via `Arc`.
pub struct TableRegistry {
    client: Arc<dyn Client>,
    schema: Schema,
    tables: DashMap<String, Registered>,
}

impl std::fmt::Debug for TableRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TableRegistry")
            .field("tables", &self.tables.len())
            .finish()
    }
}

/// Canonical identity of a query and the options that change its behavior.
pub fn signature(query: &TableQuery, options: &TableOptions) -> String {
    json!({
        "query": query.to_value(),
        "options": options.query_options,
        "debounce_ms": options.debounce.as_millis() as u64,
        "throttle_ms": options.throttle.map(|t| t.as_millis() as u64),
    })
    .to_string()
}

impl TableRegistry {
    pub fn new(client: Arc<dyn Client>, schema: Schema) -> Self {
        Self {
            client,
            schema,
            tables: DashMap::new(),
        }
    }

    pub fn new_shared(client: Arc<dyn Client>, schema: Schema) -> Arc<Self> {
        Arc::new(Self::new(client, schema))
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    /// Get the shared table for `query`, opening it if needed.
    ///
    /// A consumer joining a table that is already connected receives a
    /// [`crate::TableEvent::Connected`] first on its subscription.
    pub fn acquire(&self, query: &Value, options: TableOptions) -> Result<TableHandle> {
        let parsed = TableQuery::parse(query, &self.schema)?;
        let signature = signature(&parsed, &options);

        let (table, refs) = match self.tables.entry(signature.clone()) {
            Entry::Occupied(mut entry) => {
                let registered = entry.get_mut();
                if registered.table.is_closed() {
                    tracing::debug!(table = %parsed.table(), "Replacing closed table");
                    registered.table =
                        SyncTable::with_query(Arc::clone(&self.client), parsed, options);
                    registered.refs = 1;
                } else {
                    registered.refs += 1;
                }
                (registered.table.clone(), registered.refs)
            }
            Entry::Vacant(entry) => {
                let table = SyncTable::with_query(Arc::clone(&self.client), parsed, options);
                entry.insert(Registered {
                    table: table.clone(),
                    refs: 1,
                });
                (table, 1)
            }
        };

        tracing::debug!(table = %table.table_name(), refs, "Acquired table");
        let events = table.join()?;
        Ok(TableHandle {
            table,
            signature,
            events,
        })
    }

    /// Give a handle back.
    ///
    /// When the last handle for a table is released the table is evicted and
    /// returned so the caller can close it.
    pub fn release(&self, handle: TableHandle) -> Option<SyncTable> {
        let TableHandle {
            table, signature, ..
        } = handle;

        let remaining = {
            let mut registered = self.tables.get_mut(&signature)?;
            if !registered.table.same_table(&table) {
                // the entry was replaced; this handle's table is already gone
                return None;
            }
            registered.refs = registered.refs.saturating_sub(1);
            registered.refs
        };

        tracing::debug!(table = %table.table_name(), refs = remaining, "Released table");
        if remaining > 0 {
            return None;
        }
        self.tables
            .remove_if(&signature, |_, registered| registered.refs == 0)
            .map(|(_, registered)| {
                tracing::info!(table = %registered.table.table_name(), "Evicted table");
                registered.table
            })
    }

    /// Number of live handles for `signature`.
    pub fn refcount(&self, signature: &str) -> usize {
        self.tables.get(signature).map_or(0, |r| r.refs)
    }

    pub fn len(&self) -> usize {
        self.tables.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }
}
