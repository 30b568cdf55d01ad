//! In-process [`FlowStore`] backed by hash maps behind a tokio mutex.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::Utc;
use flowkeel_types::cursor::CursorRecord;
use flowkeel_types::error::RepositoryError;
use flowkeel_types::run::{RunRecord, RunStatus, StepRecord, TimerToken};
use flowkeel_types::trace::TraceEntry;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::flow::cursor::check_commit_advance;

use super::flow::{CursorRepository, FlowStore, RunRepository, StepCommit};

#[derive(Default)]
struct MemoryInner {
    runs: HashMap<Uuid, RunRecord>,
    steps: HashMap<Uuid, Vec<StepRecord>>,
    trace: HashMap<Uuid, Vec<TraceEntry>>,
    cursors: HashMap<String, CursorRecord>,
    timers: HashMap<(Uuid, String), TimerToken>,
}

/// Volatile store for tests and single-process embedding.
///
/// Every operation holds one lock, so `commit_step` is atomic with respect
/// to every reader. [`InMemoryFlowStore::fail_next_commit`] makes the next
/// commit fail without applying anything, which is how tests simulate a
/// process dying between a handler returning and its result becoming durable.
#[derive(Default)]
pub struct InMemoryFlowStore {
    inner: Mutex<MemoryInner>,
    fail_next_commit: AtomicBool,
}

impl InMemoryFlowStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `commit_step` fail with `RepositoryError::Connection`.
    pub fn fail_next_commit(&self) {
        self.fail_next_commit.store(true, Ordering::SeqCst);
    }

    /// Number of pending timer tokens across all runs.
    pub async fn pending_timers(&self) -> usize {
        self.inner.lock().await.timers.len()
    }
}

impl RunRepository for InMemoryFlowStore {
    async fn create_run(&self, run: &RunRecord) -> Result<(), RepositoryError> {
        let mut inner = self.inner.lock().await;
        if inner.runs.contains_key(&run.id) {
            return Err(RepositoryError::Conflict(format!("run {} exists", run.id)));
        }
        inner.runs.insert(run.id, run.clone());
        Ok(())
    }

    async fn update_run_status(
        &self,
        run_id: &Uuid,
        status: RunStatus,
        error: Option<&str>,
    ) -> Result<(), RepositoryError> {
        let mut inner = self.inner.lock().await;
        let run = inner.runs.get_mut(run_id).ok_or(RepositoryError::NotFound)?;
        run.status = status;
        run.error = error.map(str::to_string);
        run.completed_at = status.is_terminal().then(Utc::now);
        Ok(())
    }

    async fn get_run(&self, run_id: &Uuid) -> Result<Option<RunRecord>, RepositoryError> {
        Ok(self.inner.lock().await.runs.get(run_id).cloned())
    }

    async fn list_runs(
        &self,
        flow_name: &str,
        limit: u32,
    ) -> Result<Vec<RunRecord>, RepositoryError> {
        let inner = self.inner.lock().await;
        let mut runs: Vec<RunRecord> = inner
            .runs
            .values()
            .filter(|r| r.flow_name == flow_name)
            .cloned()
            .collect();
        runs.sort_by(|a, b| b.started_at.cmp(&a.started_at).then(b.id.cmp(&a.id)));
        runs.truncate(limit as usize);
        Ok(runs)
    }

    async fn list_step_records(&self, run_id: &Uuid) -> Result<Vec<StepRecord>, RepositoryError> {
        Ok(self
            .inner
            .lock()
            .await
            .steps
            .get(run_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn append_trace(
        &self,
        run_id: &Uuid,
        entries: &[TraceEntry],
    ) -> Result<(), RepositoryError> {
        self.inner
            .lock()
            .await
            .trace
            .entry(*run_id)
            .or_default()
            .extend_from_slice(entries);
        Ok(())
    }

    async fn list_trace(&self, run_id: &Uuid) -> Result<Vec<TraceEntry>, RepositoryError> {
        Ok(self
            .inner
            .lock()
            .await
            .trace
            .get(run_id)
            .cloned()
            .unwrap_or_default())
    }
}

impl CursorRepository for InMemoryFlowStore {
    async fn get_cursor(&self, source_id: &str) -> Result<Option<CursorRecord>, RepositoryError> {
        Ok(self.inner.lock().await.cursors.get(source_id).cloned())
    }

    async fn put_cursor(&self, record: &CursorRecord) -> Result<(), RepositoryError> {
        self.inner
            .lock()
            .await
            .cursors
            .insert(record.source_id.clone(), record.clone());
        Ok(())
    }

    async fn delete_cursor(&self, source_id: &str) -> Result<bool, RepositoryError> {
        Ok(self.inner.lock().await.cursors.remove(source_id).is_some())
    }
}

impl FlowStore for InMemoryFlowStore {
    async fn commit_step(&self, commit: &StepCommit) -> Result<(), RepositoryError> {
        let mut inner = self.inner.lock().await;
        if self.fail_next_commit.swap(false, Ordering::SeqCst) {
            return Err(RepositoryError::Connection);
        }

        let duplicate = inner
            .steps
            .get(&commit.record.run_id)
            .is_some_and(|steps| steps.iter().any(|s| s.key == commit.record.key));
        if duplicate {
            return Err(RepositoryError::Conflict(format!(
                "step '{}' already committed",
                commit.record.key
            )));
        }
        if let Some(cursor) = &commit.cursor {
            check_commit_advance(inner.cursors.get(&cursor.source_id), cursor)?;
        }

        inner
            .steps
            .entry(commit.record.run_id)
            .or_default()
            .push(commit.record.clone());
        if let Some(cursor) = &commit.cursor {
            inner.cursors.insert(cursor.source_id.clone(), cursor.clone());
        }
        Ok(())
    }

    async fn save_timer(&self, token: &TimerToken) -> Result<TimerToken, RepositoryError> {
        let mut inner = self.inner.lock().await;
        let stored = inner
            .timers
            .entry((token.run_id, token.key.clone()))
            .or_insert_with(|| token.clone());
        Ok(stored.clone())
    }

    async fn get_timer(&self, run_id: &Uuid, key: &str) -> Result<Option<TimerToken>, RepositoryError> {
        Ok(self
            .inner
            .lock()
            .await
            .timers
            .get(&(*run_id, key.to_string()))
            .cloned())
    }

    async fn delete_timer(&self, run_id: &Uuid, key: &str) -> Result<(), RepositoryError> {
        self.inner
            .lock()
            .await
            .timers
            .remove(&(*run_id, key.to_string()));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn step(run_id: Uuid, key: &str) -> StepRecord {
        StepRecord {
            run_id,
            key: key.to_string(),
            input: json!(null),
            output: json!({ "ok": true }),
            completed_at: Utc::now(),
        }
    }

    fn run(flow: &str) -> RunRecord {
        RunRecord {
            id: Uuid::now_v7(),
            flow_name: flow.to_string(),
            trigger_kind: "manual".to_string(),
            payload: json!({}),
            status: RunStatus::Running,
            error: None,
            started_at: Utc::now(),
            completed_at: None,
        }
    }

    #[tokio::test]
    async fn commit_step_persists_record_and_cursor_together() {
        let store = InMemoryFlowStore::new();
        let run_id = Uuid::now_v7();
        let commit = StepCommit {
            record: step(run_id, "fetch"),
            cursor: Some(CursorRecord::new("orders", "42")),
        };

        store.commit_step(&commit).await.unwrap();

        assert_eq!(store.list_step_records(&run_id).await.unwrap().len(), 1);
        let cursor = store.get_cursor("orders").await.unwrap().unwrap();
        assert_eq!(cursor.position, "42");
    }

    #[tokio::test]
    async fn failed_commit_applies_nothing() {
        let store = InMemoryFlowStore::new();
        let run_id = Uuid::now_v7();
        store.fail_next_commit();

        let result = store
            .commit_step(&StepCommit {
                record: step(run_id, "fetch"),
                cursor: Some(CursorRecord::new("orders", "42")),
            })
            .await;

        assert!(matches!(result, Err(RepositoryError::Connection)));
        assert!(store.list_step_records(&run_id).await.unwrap().is_empty());
        assert!(store.get_cursor("orders").await.unwrap().is_none());

        // Only the next commit fails.
        store
            .commit_step(&StepCommit {
                record: step(run_id, "fetch"),
                cursor: None,
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn duplicate_step_commit_conflicts() {
        let store = InMemoryFlowStore::new();
        let run_id = Uuid::now_v7();
        let commit = StepCommit {
            record: step(run_id, "fetch"),
            cursor: None,
        };
        store.commit_step(&commit).await.unwrap();

        let err = store.commit_step(&commit).await.unwrap_err();
        assert!(matches!(err, RepositoryError::Conflict(_)));
    }

    #[tokio::test]
    async fn regressing_cursor_commit_applies_nothing() {
        let store = InMemoryFlowStore::new();
        let run_id = Uuid::now_v7();
        store.put_cursor(&CursorRecord::new("src", "50")).await.unwrap();

        let err = store
            .commit_step(&StepCommit {
                record: step(run_id, "fetch"),
                cursor: Some(CursorRecord::new("src", "20")),
            })
            .await
            .unwrap_err();

        assert!(matches!(err, RepositoryError::CursorRegressed { .. }));
        assert!(store.list_step_records(&run_id).await.unwrap().is_empty());
        assert_eq!(store.get_cursor("src").await.unwrap().unwrap().position, "50");
    }

    #[tokio::test]
    async fn update_status_stamps_completion_for_terminal_states() {
        let store = InMemoryFlowStore::new();
        let record = run("etl");
        store.create_run(&record).await.unwrap();

        store
            .update_run_status(&record.id, RunStatus::Failed, Some("boom"))
            .await
            .unwrap();

        let stored = store.get_run(&record.id).await.unwrap().unwrap();
        assert_eq!(stored.status, RunStatus::Failed);
        assert_eq!(stored.error.as_deref(), Some("boom"));
        assert!(stored.completed_at.is_some());
    }

    #[tokio::test]
    async fn update_status_of_missing_run_is_not_found() {
        let store = InMemoryFlowStore::new();
        let err = store
            .update_run_status(&Uuid::now_v7(), RunStatus::Completed, None)
            .await
            .unwrap_err();
        assert!(matches!(err, RepositoryError::NotFound));
    }

    #[tokio::test]
    async fn list_runs_filters_by_flow_and_limits() {
        let store = InMemoryFlowStore::new();
        for _ in 0..3 {
            store.create_run(&run("etl")).await.unwrap();
        }
        store.create_run(&run("other")).await.unwrap();

        assert_eq!(store.list_runs("etl", 2).await.unwrap().len(), 2);
        assert_eq!(store.list_runs("other", 10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn save_timer_keeps_first_token() {
        let store = InMemoryFlowStore::new();
        let run_id = Uuid::now_v7();
        let first = TimerToken {
            run_id,
            key: "cool-down".to_string(),
            wake_at: Utc::now(),
        };
        let later = TimerToken {
            wake_at: first.wake_at + chrono::Duration::seconds(60),
            ..first.clone()
        };

        store.save_timer(&first).await.unwrap();
        let stored = store.save_timer(&later).await.unwrap();

        assert_eq!(stored.wake_at, first.wake_at);
        assert_eq!(store.pending_timers().await, 1);
        store.delete_timer(&run_id, "cool-down").await.unwrap();
        assert!(store.get_timer(&run_id, "cool-down").await.unwrap().is_none());
    }
}
