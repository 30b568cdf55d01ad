//! Durable checkpoints for flow runs.
//!
//! Wraps a [`FlowStore`] with the run-level operations the engine needs:
//! run creation, atomic step commits, trace appends, timer tokens, and the
//! journal a resumed run is rebuilt from.

use std::sync::Arc;

use flowkeel_types::error::RepositoryError;
use flowkeel_types::run::{RunRecord, RunStatus, StepRecord, TimerToken};
use flowkeel_types::trace::TraceEntry;
use uuid::Uuid;

use crate::repository::{FlowStore, StepCommit};

/// Everything persisted about a run, as loaded for resume.
#[derive(Debug, Clone)]
pub struct RunJournal {
    pub run: RunRecord,
    /// Committed steps in commit order.
    pub steps: Vec<StepRecord>,
    pub trace: Vec<TraceEntry>,
}

// ---------------------------------------------------------------------------
// CheckpointManager
// ---------------------------------------------------------------------------

/// Generic over `R: FlowStore` so it works with any storage backend
/// (SQLite, in-memory, etc.).
pub struct CheckpointManager<R: FlowStore> {
    repo: Arc<R>,
}

impl<R: FlowStore> CheckpointManager<R> {
    pub fn new(repo: Arc<R>) -> Self {
        Self { repo }
    }

    pub fn repo(&self) -> &Arc<R> {
        &self.repo
    }

    // -----------------------------------------------------------------------
    // Run-level checkpoints
    // -----------------------------------------------------------------------

    pub async fn checkpoint_run_start(&self, run: &RunRecord) -> Result<(), CheckpointError> {
        self.repo
            .create_run(run)
            .await
            .map_err(|e| CheckpointError::Repository(e.to_string()))?;
        tracing::debug!(run_id = %run.id, flow = %run.flow_name, "checkpointed run start");
        Ok(())
    }

    pub async fn checkpoint_run_status(
        &self,
        run_id: Uuid,
        status: RunStatus,
        error: Option<&str>,
    ) -> Result<(), CheckpointError> {
        self.repo
            .update_run_status(&run_id, status, error)
            .await
            .map_err(|e| CheckpointError::Repository(e.to_string()))?;
        tracing::debug!(run_id = %run_id, status = status.as_str(), "checkpointed run status");
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Step-level checkpoints
    // -----------------------------------------------------------------------

    /// Make a step completion (and its cursor advance) durable.
    pub async fn checkpoint_step_complete(&self, commit: &StepCommit) -> Result<(), CheckpointError> {
        self.repo.commit_step(commit).await.map_err(|e| match e {
            RepositoryError::CursorRegressed {
                source_id,
                current,
                proposed,
            } => CheckpointError::CursorRegressed {
                source_id,
                current,
                proposed,
            },
            other => CheckpointError::Repository(other.to_string()),
        })?;
        tracing::debug!(
            run_id = %commit.record.run_id,
            step = %commit.record.key,
            cursor = commit.cursor.as_ref().map(|c| c.source_id.as_str()),
            "checkpointed step complete"
        );
        Ok(())
    }

    pub async fn checkpoint_trace(
        &self,
        run_id: Uuid,
        entries: &[TraceEntry],
    ) -> Result<(), CheckpointError> {
        if entries.is_empty() {
            return Ok(());
        }
        self.repo
            .append_trace(&run_id, entries)
            .await
            .map_err(|e| CheckpointError::Repository(e.to_string()))
    }

    // -----------------------------------------------------------------------
    // Timers
    // -----------------------------------------------------------------------

    /// Persist a timer token, keeping the earlier one if it exists.
    pub async fn checkpoint_timer(&self, token: &TimerToken) -> Result<TimerToken, CheckpointError> {
        let stored = self
            .repo
            .save_timer(token)
            .await
            .map_err(|e| CheckpointError::Repository(e.to_string()))?;
        tracing::debug!(run_id = %stored.run_id, step = %stored.key, wake_at = %stored.wake_at, "checkpointed timer");
        Ok(stored)
    }

    pub async fn clear_timer(&self, run_id: Uuid, key: &str) -> Result<(), CheckpointError> {
        self.repo
            .delete_timer(&run_id, key)
            .await
            .map_err(|e| CheckpointError::Repository(e.to_string()))
    }

    // -----------------------------------------------------------------------
    // Recovery helpers
    // -----------------------------------------------------------------------

    pub async fn restore(&self, run_id: Uuid) -> Result<RunJournal, CheckpointError> {
        let run = self
            .repo
            .get_run(&run_id)
            .await
            .map_err(|e| CheckpointError::Repository(e.to_string()))?
            .ok_or(CheckpointError::RunNotFound(run_id))?;
        let steps = self
            .repo
            .list_step_records(&run_id)
            .await
            .map_err(|e| CheckpointError::Repository(e.to_string()))?;
        let trace = self.trace(run_id).await?;
        Ok(RunJournal { run, steps, trace })
    }

    pub async fn trace(&self, run_id: Uuid) -> Result<Vec<TraceEntry>, CheckpointError> {
        self.repo
            .list_trace(&run_id)
            .await
            .map_err(|e| CheckpointError::Repository(e.to_string()))
    }

    pub async fn run(&self, run_id: Uuid) -> Result<Option<RunRecord>, CheckpointError> {
        self.repo
            .get_run(&run_id)
            .await
            .map_err(|e| CheckpointError::Repository(e.to_string()))
    }
}

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum CheckpointError {
    #[error("checkpoint repository error: {0}")]
    Repository(String),

    #[error("flow run not found: {0}")]
    RunNotFound(Uuid),

    /// The store refused a cursor write that would move it backwards.
    #[error("cursor '{source_id}' cannot move backwards from '{current}' to '{proposed}'")]
    CursorRegressed {
        source_id: String,
        current: String,
        proposed: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::{CursorRepository, InMemoryFlowStore};
    use chrono::Utc;
    use flowkeel_types::cursor::CursorRecord;
    use serde_json::json;

    fn record() -> RunRecord {
        RunRecord {
            id: Uuid::now_v7(),
            flow_name: "etl".to_string(),
            trigger_kind: "manual".to_string(),
            payload: json!({ "day": "2024-01-01" }),
            status: RunStatus::Running,
            error: None,
            started_at: Utc::now(),
            completed_at: None,
        }
    }

    #[tokio::test]
    async fn restore_returns_run_steps_and_trace() {
        let checkpoints = CheckpointManager::new(Arc::new(InMemoryFlowStore::new()));
        let run = record();
        checkpoints.checkpoint_run_start(&run).await.unwrap();
        checkpoints
            .checkpoint_step_complete(&StepCommit {
                record: StepRecord {
                    run_id: run.id,
                    key: "extract".to_string(),
                    input: json!(null),
                    output: json!(12),
                    completed_at: Utc::now(),
                },
                cursor: Some(CursorRecord::new("rows", "12")),
            })
            .await
            .unwrap();

        let journal = checkpoints.restore(run.id).await.unwrap();
        assert_eq!(journal.run.payload["day"], "2024-01-01");
        assert_eq!(journal.steps.len(), 1);
        assert!(journal.trace.is_empty());
    }

    #[tokio::test]
    async fn restore_unknown_run() {
        let checkpoints = CheckpointManager::new(Arc::new(InMemoryFlowStore::new()));
        let id = Uuid::now_v7();
        assert!(matches!(
            checkpoints.restore(id).await,
            Err(CheckpointError::RunNotFound(missing)) if missing == id
        ));
    }

    #[tokio::test]
    async fn commit_failure_maps_to_repository_error() {
        let store = Arc::new(InMemoryFlowStore::new());
        store.fail_next_commit();
        let checkpoints = CheckpointManager::new(store);
        let err = checkpoints
            .checkpoint_step_complete(&StepCommit {
                record: StepRecord {
                    run_id: Uuid::now_v7(),
                    key: "x".to_string(),
                    input: json!(null),
                    output: json!(null),
                    completed_at: Utc::now(),
                },
                cursor: None,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, CheckpointError::Repository(_)));
    }

    #[tokio::test]
    async fn regressing_cursor_commit_is_reported_distinctly() {
        let store = Arc::new(InMemoryFlowStore::new());
        store.put_cursor(&CursorRecord::new("rows", "50")).await.unwrap();
        let checkpoints = CheckpointManager::new(store);

        let err = checkpoints
            .checkpoint_step_complete(&StepCommit {
                record: StepRecord {
                    run_id: Uuid::now_v7(),
                    key: "extract".to_string(),
                    input: json!(null),
                    output: json!(20),
                    completed_at: Utc::now(),
                },
                cursor: Some(CursorRecord::new("rows", "20")),
            })
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            CheckpointError::CursorRegressed { current, proposed, .. }
                if current == "50" && proposed == "20"
        ));
    }
}
