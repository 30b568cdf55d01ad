//! Infrastructure layer for flowkeel.
//!
//! Implements the storage ports from `flowkeel-core` over SQLite, guards
//! webhook triggers with HMAC-SHA256 or bearer authentication, and loads
//! engine configuration from TOML.

pub mod config;
pub mod sqlite;
pub mod webhook;

pub use sqlite::flow_store::SqliteFlowStore;
pub use sqlite::pool::DatabasePool;
