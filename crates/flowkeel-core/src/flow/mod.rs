//! Declarative flow definitions and their execution.
//!
//! - [`builder`] / [`compiler`]: operation list to frozen [`plan::Flow`]
//! - [`engine`]: walks a plan over a [`substrate::DurableSubstrate`]
//! - [`state`] / [`cursor`]: per-run state and persisted cursors
//! - [`worker`] / [`scheduler`]: trigger routing and cron ticks

pub mod builder;
pub mod checkpoint;
pub mod compiler;
pub mod cursor;
pub mod engine;
pub mod expression;
pub mod node;
pub mod plan;
pub mod retry;
pub mod scheduler;
pub mod state;
pub mod substrate;
pub mod worker;
