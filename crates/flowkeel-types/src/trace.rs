//! Execution trace: the ordered record of step transitions within a run.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::run::{NodeState, RunStatus};

/// One entry of a run's execution trace.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraceEntry {
    /// Position in the trace, starting at 0.
    pub sequence: u64,
    pub at: DateTime<Utc>,
    pub event: TraceEvent,
}

/// What happened at a trace position.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum TraceEvent {
    /// A node instance changed state.
    Node {
        step: String,
        state: NodeState,
        attempt: u32,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    /// A step's output was committed to the execution state.
    StateWritten { step: String },
    /// A committed step was restored from the store instead of dispatched.
    Replayed { step: String },
    /// A conditional block evaluated its predicate.
    BranchDecision { block: String, taken: bool },
    /// A loop block started an iteration.
    LoopIteration { block: String, iteration: u32 },
    /// A parallel branch was never started because the block had already failed.
    BranchSkipped { block: String, branch: usize },
    TimerScheduled { step: String, wake_at: DateTime<Utc> },
    TimerFired { step: String },
    SignalReceived { step: String, signal: String },
    CursorAdvanced { source_id: String, position: String },
    CursorRolledBack {
        source_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        position: Option<String>,
    },
    CompensationStarted { step: String, task: String },
    CompensationSucceeded { step: String },
    CompensationFailed { step: String, error: String },
    RunFinished {
        status: RunStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
}

impl TraceEvent {
    /// The step name the event refers to, if any.
    pub fn step(&self) -> Option<&str> {
        match self {
            TraceEvent::Node { step, .. }
            | TraceEvent::StateWritten { step }
            | TraceEvent::Replayed { step }
            | TraceEvent::TimerScheduled { step, .. }
            | TraceEvent::TimerFired { step }
            | TraceEvent::SignalReceived { step, .. }
            | TraceEvent::CompensationStarted { step, .. }
            | TraceEvent::CompensationSucceeded { step }
            | TraceEvent::CompensationFailed { step, .. } => Some(step),
            _ => None,
        }
    }
}
