//! Flow compiler and execution engine for flowkeel.
//!
//! Defines the storage ports (`repository`), the builder/compiler that turns
//! an operation list into a frozen [`flow::plan::Flow`], and the engine that
//! walks a plan on top of a [`flow::substrate::DurableSubstrate`]. Concrete
//! storage backends live in `flowkeel-infra`.

pub mod event;
pub mod flow;
pub mod repository;
