//! Events published on the flow event bus.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::run::RunStatus;
use crate::trace::TraceEntry;

/// Observable events emitted by the execution engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FlowEvent {
    RunStarted {
        run_id: Uuid,
        flow_name: String,
        trigger_kind: String,
        resumed: bool,
    },
    Trace {
        run_id: Uuid,
        entry: TraceEntry,
    },
    RunFinished {
        run_id: Uuid,
        flow_name: String,
        status: RunStatus,
        duration_ms: u64,
    },
}

impl FlowEvent {
    pub fn run_id(&self) -> Uuid {
        match self {
            FlowEvent::RunStarted { run_id, .. }
            | FlowEvent::Trace { run_id, .. }
            | FlowEvent::RunFinished { run_id, .. } => *run_id,
        }
    }
}
