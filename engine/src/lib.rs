//! # Tablesync Engine
//!
//! A continuously synchronized local mirror of a server-held table.
//!
//! This crate is the client half of an optimistic, eventually consistent
//! replication protocol. It keeps a local copy of a table up to date from a
//! server changefeed and writes local edits back, without losing edits made
//! while offline.
//!
//! ## Core Concepts
//!
//! ### Dual state
//!
//! Every table keeps two maps of records (see [`store::DualState`]): the
//! *local* state the application reads and writes, and the *server* state last
//! confirmed by the backend. A key whose two values differ has unsaved
//! changes.
//!
//! ### Reconciliation
//!
//! The [`Reconciler`] applies snapshots and changefeed records with a 3-way
//! merge of the new server value, the local value and the last server value.
//! Upstream changes replay onto the local copy, local edits survive, and a
//! [`Conflict`] is reported whenever the two still disagree.
//!
//! ### Saving
//!
//! Local changes made with [`SyncTable::set`] are saved after a debounce
//! window. At most one write is in flight per table; transient failures are
//! retried with exponential backoff and fatal ones close the table.
//!
//! ### Lifecycle
//!
//! A table moves through [`ConnectionState`]s as the transport comes and
//! goes. On reconnect, unsaved edits are written before subscribing again.
//! `Closed` is terminal.
//!
//! ## Quick Start
//!
//! ```no_run
//! use serde_json::json;
//! use tablesync_engine::{
//!     FieldDef, FieldType, MergeMode, MockClient, Schema, SyncTable, TableOptions, TableSchema,
//! };
//!
//! #[tokio::main]
//! async fn main() -> tablesync_engine::Result<()> {
//!     // 1. Describe the table
//!     let schema = Schema::new().with_table(
//!         TableSchema::new("accounts", ["account_id"])
//!             .with_field(FieldDef::new("name", FieldType::String))
//!             .settable(["account_id", "name"]),
//!     );
//!
//!     // 2. Open it over a transport
//!     let client = MockClient::new_shared();
//!     let table = SyncTable::open(client, &schema, &json!("accounts"), TableOptions::default())?;
//!
//!     // 3. Wait for the first snapshot, then edit
//!     table
//!         .wait_until(|t| t.is_loaded().then_some(()), std::time::Duration::ZERO)
//!         .await?;
//!     table.set(json!({"account_id": "a1", "name": "Ann"}), MergeMode::Deep)?;
//!     table.save().await?;
//!
//!     table.close();
//!     Ok(())
//! }
//! ```

pub mod client;
pub mod config;
pub mod connection;
pub mod error;
pub mod mutation;
pub mod notify;
pub mod query;
pub mod reconcile;
pub mod record;
pub mod registry;
pub mod save;
pub mod schema;
pub mod store;
pub mod table;

// Re-export main types at crate root
pub use client::{
    Changefeed, Client, ClientError, ClientSignal, FeedEvent, MockClient, QueryRequest,
    QueryResponse,
};
pub use config::{RetryConfig, TableOptions};
pub use connection::{ConnectionState, SubscribeStrategy};
pub use error::{Error, Result};
pub use notify::{Subscription, TableEvent};
pub use query::TableQuery;
pub use reconcile::{Conflict, ReconcileResult, Reconciler};
pub use record::{MergeMode, Record};
pub use registry::{TableHandle, TableRegistry};
pub use schema::{FieldDef, FieldType, Schema, TableSchema};
pub use store::{DualState, Snapshot};
pub use table::SyncTable;

/// Type aliases for clarity
pub type RecordKey = String;
pub type TableName = String;
