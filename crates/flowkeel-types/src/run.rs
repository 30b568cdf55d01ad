//! Run-level records: terminal statuses, node states, and persisted
//! completion records used for crash recovery.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Status enums
// ---------------------------------------------------------------------------

/// Overall status of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Completed,
    Failed,
    /// Failed, and the compensation cascade ran.
    Compensated,
    TimedOut,
    Cancelled,
}

impl RunStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, RunStatus::Running)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RunStatus::Running => "running",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
            RunStatus::Compensated => "compensated",
            RunStatus::TimedOut => "timed_out",
            RunStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "running" => RunStatus::Running,
            "completed" => RunStatus::Completed,
            "failed" => RunStatus::Failed,
            "compensated" => RunStatus::Compensated,
            "timed_out" => RunStatus::TimedOut,
            "cancelled" => RunStatus::Cancelled,
            _ => return None,
        })
    }
}

/// Lifecycle of a single node instance within a run.
///
/// `Pending -> Running -> Succeeded`, or
/// `Running -> Failed -> Retrying -> Running` until attempts run out, then
/// `Failed -> Compensating -> CompensationSucceeded | CompensationFailed`
/// when an error handler is present.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeState {
    Pending,
    Running,
    Succeeded,
    Failed,
    Retrying,
    Compensating,
    CompensationSucceeded,
    CompensationFailed,
}

// ---------------------------------------------------------------------------
// Persisted records
// ---------------------------------------------------------------------------

/// A single run of a flow. Used for query results and resume.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRecord {
    pub id: Uuid,
    pub flow_name: String,
    /// Trigger kind that started the run ("manual", "schedule", ...).
    pub trigger_kind: String,
    /// Initial payload handed to the run.
    pub payload: serde_json::Value,
    pub status: RunStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

/// Durable completion record of one step, written exactly once per state key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepRecord {
    pub run_id: Uuid,
    /// State key (step name, or `name@i` inside loop bodies).
    pub key: String,
    /// Input the step was dispatched with (kept for compensation on resume).
    pub input: serde_json::Value,
    pub output: serde_json::Value,
    pub completed_at: DateTime<Utc>,
}

/// Durable wait token for a timer step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimerToken {
    pub run_id: Uuid,
    pub key: String,
    pub wake_at: DateTime<Utc>,
}
