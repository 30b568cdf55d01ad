pub mod flow;
pub mod memory;

pub use flow::{CursorRepository, FlowStore, RunRepository, StepCommit};
pub use memory::InMemoryFlowStore;
