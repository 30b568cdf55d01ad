//! SQLite storage layer.
//!
//! [`flow_store::SqliteFlowStore`] implements the flow storage ports over a
//! split read/write [`pool::DatabasePool`].

pub mod flow_store;
pub mod pool;
