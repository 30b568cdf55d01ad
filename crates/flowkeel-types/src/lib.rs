//! Shared plan, trace, and cursor types for flowkeel.
//!
//! Plain data only: everything here is serializable and free of behaviour
//! that touches the runtime. Zero infrastructure dependencies -- only serde,
//! uuid, chrono, thiserror.

pub mod config;
pub mod cursor;
pub mod error;
pub mod event;
pub mod flow;
pub mod run;
pub mod trace;
