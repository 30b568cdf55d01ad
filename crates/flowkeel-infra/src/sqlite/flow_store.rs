//! SQLite flow store.
//!
//! Implements `RunRepository`, `CursorRepository`, and `FlowStore` from
//! `flowkeel-core`. Payloads, outputs, and trace events are stored as JSON
//! text; timestamps as RFC 3339. A step record and its cursor advance are
//! written in one transaction on the writer pool.

use chrono::{DateTime, Utc};
use flowkeel_core::flow::cursor::check_commit_advance;
use flowkeel_core::repository::{CursorRepository, FlowStore, RunRepository, StepCommit};
use flowkeel_types::cursor::CursorRecord;
use flowkeel_types::error::RepositoryError;
use flowkeel_types::run::{RunRecord, RunStatus, StepRecord, TimerToken};
use flowkeel_types::trace::{TraceEntry, TraceEvent};
use sqlx::Row;
use uuid::Uuid;

use super::pool::DatabasePool;

/// SQLite-backed implementation of the flow storage ports.
pub struct SqliteFlowStore {
    pool: DatabasePool,
}

impl SqliteFlowStore {
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &DatabasePool {
        &self.pool
    }

    /// Runs still marked running, oldest first. After a restart these are
    /// the candidates for `FlowEngine::resume`.
    pub async fn list_unfinished_runs(&self) -> Result<Vec<RunRecord>, RepositoryError> {
        let rows = sqlx::query("SELECT * FROM runs WHERE status = 'running' ORDER BY started_at ASC")
            .fetch_all(&self.pool.reader)
            .await
            .map_err(query_error)?;

        rows.iter()
            .map(|row| RunRow::from_row(row).map_err(query_error)?.into_run())
            .collect()
    }

    /// Pending timers of a run.
    pub async fn list_timers(&self, run_id: &Uuid) -> Result<Vec<TimerToken>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT run_id, step_key, wake_at FROM timer_tokens WHERE run_id = ? ORDER BY wake_at ASC",
        )
        .bind(run_id.to_string())
        .fetch_all(&self.pool.reader)
        .await
        .map_err(query_error)?;

        rows.iter().map(timer_from_row).collect()
    }
}

// ---------------------------------------------------------------------------
// Internal row types
// ---------------------------------------------------------------------------

struct RunRow {
    id: String,
    flow_name: String,
    trigger_kind: String,
    payload: String,
    status: String,
    error: Option<String>,
    started_at: String,
    completed_at: Option<String>,
}

impl RunRow {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            flow_name: row.try_get("flow_name")?,
            trigger_kind: row.try_get("trigger_kind")?,
            payload: row.try_get("payload")?,
            status: row.try_get("status")?,
            error: row.try_get("error")?,
            started_at: row.try_get("started_at")?,
            completed_at: row.try_get("completed_at")?,
        })
    }

    fn into_run(self) -> Result<RunRecord, RepositoryError> {
        let status = RunStatus::parse(&self.status)
            .ok_or_else(|| RepositoryError::Query(format!("invalid run status: {}", self.status)))?;

        Ok(RunRecord {
            id: parse_uuid(&self.id)?,
            flow_name: self.flow_name,
            trigger_kind: self.trigger_kind,
            payload: parse_json(&self.payload, "payload")?,
            status,
            error: self.error,
            started_at: parse_datetime(&self.started_at)?,
            completed_at: self.completed_at.as_deref().map(parse_datetime).transpose()?,
        })
    }
}

struct StepRow {
    run_id: String,
    step_key: String,
    input: String,
    output: String,
    completed_at: String,
}

impl StepRow {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            run_id: row.try_get("run_id")?,
            step_key: row.try_get("step_key")?,
            input: row.try_get("input")?,
            output: row.try_get("output")?,
            completed_at: row.try_get("completed_at")?,
        })
    }

    fn into_record(self) -> Result<StepRecord, RepositoryError> {
        Ok(StepRecord {
            run_id: parse_uuid(&self.run_id)?,
            key: self.step_key,
            input: parse_json(&self.input, "step input")?,
            output: parse_json(&self.output, "step output")?,
            completed_at: parse_datetime(&self.completed_at)?,
        })
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn query_error(e: sqlx::Error) -> RepositoryError {
    RepositoryError::Query(e.to_string())
}

fn is_unique_violation(e: &sqlx::Error) -> bool {
    matches!(e, sqlx::Error::Database(db) if db.message().contains("UNIQUE"))
}

fn parse_uuid(s: &str) -> Result<Uuid, RepositoryError> {
    s.parse::<Uuid>()
        .map_err(|e| RepositoryError::Query(format!("invalid UUID: {e}")))
}

fn parse_datetime(s: &str) -> Result<DateTime<Utc>, RepositoryError> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| RepositoryError::Query(format!("invalid datetime: {e}")))
}

fn format_datetime(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339()
}

fn parse_json<T: serde::de::DeserializeOwned>(s: &str, what: &str) -> Result<T, RepositoryError> {
    serde_json::from_str(s).map_err(|e| RepositoryError::Query(format!("invalid {what} JSON: {e}")))
}

fn to_json<T: serde::Serialize>(value: &T) -> Result<String, RepositoryError> {
    serde_json::to_string(value).map_err(|e| RepositoryError::Query(e.to_string()))
}

fn cursor_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<CursorRecord, RepositoryError> {
    Ok(CursorRecord {
        source_id: row.try_get("source_id").map_err(query_error)?,
        position: row.try_get("position").map_err(query_error)?,
        format: row.try_get("format").map_err(query_error)?,
    })
}

fn timer_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<TimerToken, RepositoryError> {
    let run_id: String = row.try_get("run_id").map_err(query_error)?;
    let wake_at: String = row.try_get("wake_at").map_err(query_error)?;
    Ok(TimerToken {
        run_id: parse_uuid(&run_id)?,
        key: row.try_get("step_key").map_err(query_error)?,
        wake_at: parse_datetime(&wake_at)?,
    })
}

// ---------------------------------------------------------------------------
// RunRepository impl
// ---------------------------------------------------------------------------

impl RunRepository for SqliteFlowStore {
    async fn create_run(&self, run: &RunRecord) -> Result<(), RepositoryError> {
        sqlx::query(
            r#"INSERT INTO runs
               (id, flow_name, trigger_kind, payload, status, error, started_at, completed_at)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(run.id.to_string())
        .bind(&run.flow_name)
        .bind(&run.trigger_kind)
        .bind(to_json(&run.payload)?)
        .bind(run.status.as_str())
        .bind(&run.error)
        .bind(format_datetime(&run.started_at))
        .bind(run.completed_at.as_ref().map(format_datetime))
        .execute(&self.pool.writer)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                return RepositoryError::Conflict(format!("run {} exists", run.id));
            }
            query_error(e)
        })?;

        Ok(())
    }

    async fn update_run_status(
        &self,
        run_id: &Uuid,
        status: RunStatus,
        error: Option<&str>,
    ) -> Result<(), RepositoryError> {
        let completed_at = status.is_terminal().then(|| format_datetime(&Utc::now()));

        let result = sqlx::query("UPDATE runs SET status = ?, error = ?, completed_at = ? WHERE id = ?")
            .bind(status.as_str())
            .bind(error)
            .bind(&completed_at)
            .bind(run_id.to_string())
            .execute(&self.pool.writer)
            .await
            .map_err(query_error)?;

        if result.rows_affected() == 0 {
            return Err(RepositoryError::NotFound);
        }
        Ok(())
    }

    async fn get_run(&self, run_id: &Uuid) -> Result<Option<RunRecord>, RepositoryError> {
        let row = sqlx::query("SELECT * FROM runs WHERE id = ?")
            .bind(run_id.to_string())
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(query_error)?;

        match row {
            Some(row) => Ok(Some(RunRow::from_row(&row).map_err(query_error)?.into_run()?)),
            None => Ok(None),
        }
    }

    async fn list_runs(
        &self,
        flow_name: &str,
        limit: u32,
    ) -> Result<Vec<RunRecord>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT * FROM runs WHERE flow_name = ? ORDER BY started_at DESC, id DESC LIMIT ?",
        )
        .bind(flow_name)
        .bind(limit as i64)
        .fetch_all(&self.pool.reader)
        .await
        .map_err(query_error)?;

        let mut runs = Vec::with_capacity(rows.len());
        for row in &rows {
            runs.push(RunRow::from_row(row).map_err(query_error)?.into_run()?);
        }
        Ok(runs)
    }

    async fn list_step_records(&self, run_id: &Uuid) -> Result<Vec<StepRecord>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT run_id, step_key, input, output, completed_at FROM step_records WHERE run_id = ? ORDER BY seq ASC",
        )
        .bind(run_id.to_string())
        .fetch_all(&self.pool.reader)
        .await
        .map_err(query_error)?;

        let mut records = Vec::with_capacity(rows.len());
        for row in &rows {
            records.push(StepRow::from_row(row).map_err(query_error)?.into_record()?);
        }
        Ok(records)
    }

    async fn append_trace(
        &self,
        run_id: &Uuid,
        entries: &[TraceEntry],
    ) -> Result<(), RepositoryError> {
        if entries.is_empty() {
            return Ok(());
        }
        let mut tx = self.pool.writer.begin().await.map_err(query_error)?;

        for entry in entries {
            sqlx::query("INSERT INTO trace_entries (run_id, sequence, at, event) VALUES (?, ?, ?, ?)")
                .bind(run_id.to_string())
                .bind(entry.sequence as i64)
                .bind(format_datetime(&entry.at))
                .bind(to_json(&entry.event)?)
                .execute(&mut *tx)
                .await
                .map_err(|e| {
                    if is_unique_violation(&e) {
                        return RepositoryError::Conflict(format!(
                            "trace sequence {} already recorded for run {run_id}",
                            entry.sequence
                        ));
                    }
                    query_error(e)
                })?;
        }

        tx.commit().await.map_err(query_error)?;
        Ok(())
    }

    async fn list_trace(&self, run_id: &Uuid) -> Result<Vec<TraceEntry>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT sequence, at, event FROM trace_entries WHERE run_id = ? ORDER BY sequence ASC",
        )
        .bind(run_id.to_string())
        .fetch_all(&self.pool.reader)
        .await
        .map_err(query_error)?;

        let mut entries = Vec::with_capacity(rows.len());
        for row in &rows {
            let sequence: i64 = row.try_get("sequence").map_err(query_error)?;
            let at: String = row.try_get("at").map_err(query_error)?;
            let event: String = row.try_get("event").map_err(query_error)?;
            entries.push(TraceEntry {
                sequence: sequence as u64,
                at: parse_datetime(&at)?,
                event: parse_json::<TraceEvent>(&event, "trace event")?,
            });
        }
        Ok(entries)
    }
}

// ---------------------------------------------------------------------------
// CursorRepository impl
// ---------------------------------------------------------------------------

const UPSERT_CURSOR: &str = r#"INSERT INTO cursors (source_id, position, format, updated_at)
   VALUES (?, ?, ?, ?)
   ON CONFLICT(source_id) DO UPDATE SET
     position = excluded.position,
     format = excluded.format,
     updated_at = excluded.updated_at"#;

impl CursorRepository for SqliteFlowStore {
    async fn get_cursor(&self, source_id: &str) -> Result<Option<CursorRecord>, RepositoryError> {
        let row = sqlx::query("SELECT source_id, position, format FROM cursors WHERE source_id = ?")
            .bind(source_id)
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(query_error)?;

        row.as_ref().map(cursor_from_row).transpose()
    }

    async fn put_cursor(&self, record: &CursorRecord) -> Result<(), RepositoryError> {
        sqlx::query(UPSERT_CURSOR)
            .bind(&record.source_id)
            .bind(&record.position)
            .bind(&record.format)
            .bind(format_datetime(&Utc::now()))
            .execute(&self.pool.writer)
            .await
            .map_err(query_error)?;
        Ok(())
    }

    async fn delete_cursor(&self, source_id: &str) -> Result<bool, RepositoryError> {
        let result = sqlx::query("DELETE FROM cursors WHERE source_id = ?")
            .bind(source_id)
            .execute(&self.pool.writer)
            .await
            .map_err(query_error)?;
        Ok(result.rows_affected() > 0)
    }
}

// ---------------------------------------------------------------------------
// FlowStore impl
// ---------------------------------------------------------------------------

impl FlowStore for SqliteFlowStore {
    async fn commit_step(&self, commit: &StepCommit) -> Result<(), RepositoryError> {
        let record = &commit.record;
        let mut tx = self.pool.writer.begin().await.map_err(query_error)?;

        sqlx::query(
            r#"INSERT INTO step_records (run_id, step_key, input, output, completed_at)
               VALUES (?, ?, ?, ?, ?)"#,
        )
        .bind(record.run_id.to_string())
        .bind(&record.key)
        .bind(to_json(&record.input)?)
        .bind(to_json(&record.output)?)
        .bind(format_datetime(&record.completed_at))
        .execute(&mut *tx)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                return RepositoryError::Conflict(format!(
                    "step '{}' already committed for run {}",
                    record.key, record.run_id
                ));
            }
            query_error(e)
        })?;

        if let Some(cursor) = &commit.cursor {
            // The single writer connection serializes this read with the
            // upsert below.
            let stored = sqlx::query(
                "SELECT source_id, position, format FROM cursors WHERE source_id = ?",
            )
            .bind(&cursor.source_id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(query_error)?;
            let stored = stored.as_ref().map(cursor_from_row).transpose()?;
            check_commit_advance(stored.as_ref(), cursor)?;

            sqlx::query(UPSERT_CURSOR)
                .bind(&cursor.source_id)
                .bind(&cursor.position)
                .bind(&cursor.format)
                .bind(format_datetime(&Utc::now()))
                .execute(&mut *tx)
                .await
                .map_err(query_error)?;
        }

        // Dropping `tx` on any error above rolls everything back.
        tx.commit().await.map_err(query_error)?;
        Ok(())
    }

    async fn save_timer(&self, token: &TimerToken) -> Result<TimerToken, RepositoryError> {
        let mut tx = self.pool.writer.begin().await.map_err(query_error)?;

        sqlx::query(
            "INSERT INTO timer_tokens (run_id, step_key, wake_at) VALUES (?, ?, ?) ON CONFLICT(run_id, step_key) DO NOTHING",
        )
        .bind(token.run_id.to_string())
        .bind(&token.key)
        .bind(format_datetime(&token.wake_at))
        .execute(&mut *tx)
        .await
        .map_err(query_error)?;

        let row = sqlx::query(
            "SELECT run_id, step_key, wake_at FROM timer_tokens WHERE run_id = ? AND step_key = ?",
        )
        .bind(token.run_id.to_string())
        .bind(&token.key)
        .fetch_one(&mut *tx)
        .await
        .map_err(query_error)?;
        let stored = timer_from_row(&row)?;

        tx.commit().await.map_err(query_error)?;
        Ok(stored)
    }

    async fn get_timer(&self, run_id: &Uuid, key: &str) -> Result<Option<TimerToken>, RepositoryError> {
        let row = sqlx::query(
            "SELECT run_id, step_key, wake_at FROM timer_tokens WHERE run_id = ? AND step_key = ?",
        )
        .bind(run_id.to_string())
        .bind(key)
        .fetch_optional(&self.pool.reader)
        .await
        .map_err(query_error)?;

        row.as_ref().map(timer_from_row).transpose()
    }

    async fn delete_timer(&self, run_id: &Uuid, key: &str) -> Result<(), RepositoryError> {
        sqlx::query("DELETE FROM timer_tokens WHERE run_id = ? AND step_key = ?")
            .bind(run_id.to_string())
            .bind(key)
            .execute(&self.pool.writer)
            .await
            .map_err(query_error)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use flowkeel_types::run::NodeState;
    use serde_json::json;

    async fn test_store() -> (SqliteFlowStore, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite://{}?mode=rwc", dir.path().join("flow.db").display());
        let pool = DatabasePool::new(&url).await.unwrap();
        (SqliteFlowStore::new(pool), dir)
    }

    fn sample_run(flow_name: &str) -> RunRecord {
        RunRecord {
            id: Uuid::now_v7(),
            flow_name: flow_name.to_string(),
            trigger_kind: "manual".to_string(),
            payload: json!({ "user": "test" }),
            status: RunStatus::Running,
            error: None,
            started_at: Utc::now(),
            completed_at: None,
        }
    }

    fn step(run_id: Uuid, key: &str, output: serde_json::Value) -> StepRecord {
        StepRecord {
            run_id,
            key: key.to_string(),
            input: json!(null),
            output,
            completed_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_run_round_trip_and_status_update() {
        let (store, _dir) = test_store().await;
        let run = sample_run("digest");
        store.create_run(&run).await.unwrap();

        let loaded = store.get_run(&run.id).await.unwrap().unwrap();
        assert_eq!(loaded.flow_name, "digest");
        assert_eq!(loaded.payload, json!({ "user": "test" }));
        assert_eq!(loaded.status, RunStatus::Running);
        assert!(loaded.completed_at.is_none());

        store
            .update_run_status(&run.id, RunStatus::Failed, Some("boom"))
            .await
            .unwrap();
        let loaded = store.get_run(&run.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, RunStatus::Failed);
        assert_eq!(loaded.error.as_deref(), Some("boom"));
        assert!(loaded.completed_at.is_some());

        assert!(matches!(
            store.create_run(&run).await,
            Err(RepositoryError::Conflict(_))
        ));
        assert!(matches!(
            store
                .update_run_status(&Uuid::now_v7(), RunStatus::Completed, None)
                .await,
            Err(RepositoryError::NotFound)
        ));
    }

    #[tokio::test]
    async fn test_list_runs_and_unfinished() {
        let (store, _dir) = test_store().await;
        let mut older = sample_run("digest");
        older.started_at = Utc::now() - Duration::minutes(5);
        let newer = sample_run("digest");
        store.create_run(&older).await.unwrap();
        store.create_run(&newer).await.unwrap();
        store.create_run(&sample_run("other")).await.unwrap();
        store
            .update_run_status(&newer.id, RunStatus::Completed, None)
            .await
            .unwrap();

        let runs = store.list_runs("digest", 10).await.unwrap();
        let ids: Vec<Uuid> = runs.iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![newer.id, older.id]);
        assert_eq!(store.list_runs("digest", 1).await.unwrap().len(), 1);

        let unfinished = store.list_unfinished_runs().await.unwrap();
        assert_eq!(unfinished.len(), 2);
        assert_eq!(unfinished[0].id, older.id);
    }

    #[tokio::test]
    async fn test_commit_step_writes_cursor_atomically() {
        let (store, _dir) = test_store().await;
        let run = sample_run("sync");
        store.create_run(&run).await.unwrap();

        let commit = StepCommit {
            record: step(run.id, "fetch", json!("2024-02-01")),
            cursor: Some(CursorRecord::new("feed", "2024-02-01")),
        };
        store.commit_step(&commit).await.unwrap();
        assert_eq!(
            store.get_cursor("feed").await.unwrap().unwrap().position,
            "2024-02-01"
        );

        // A duplicate commit conflicts and leaves the cursor untouched.
        let again = StepCommit {
            record: step(run.id, "fetch", json!("2024-03-01")),
            cursor: Some(CursorRecord::new("feed", "2024-03-01")),
        };
        assert!(matches!(
            store.commit_step(&again).await,
            Err(RepositoryError::Conflict(_))
        ));
        assert_eq!(
            store.get_cursor("feed").await.unwrap().unwrap().position,
            "2024-02-01"
        );

        let records = store.list_step_records(&run.id).await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].output, json!("2024-02-01"));
    }

    #[tokio::test]
    async fn test_commit_step_rejects_regressing_cursor() {
        let (store, _dir) = test_store().await;
        let run = sample_run("sync");
        store.create_run(&run).await.unwrap();
        store
            .put_cursor(&CursorRecord::new("src", "50"))
            .await
            .unwrap();

        let stale = StepCommit {
            record: step(run.id, "fetch", json!(20)),
            cursor: Some(CursorRecord::new("src", "20")),
        };
        assert!(matches!(
            store.commit_step(&stale).await,
            Err(RepositoryError::CursorRegressed { .. })
        ));

        // The transaction rolled back: no step record, cursor unchanged.
        assert!(store.list_step_records(&run.id).await.unwrap().is_empty());
        assert_eq!(store.get_cursor("src").await.unwrap().unwrap().position, "50");
    }

    #[tokio::test]
    async fn test_step_records_keep_commit_order() {
        let (store, _dir) = test_store().await;
        let run = sample_run("order");
        store.create_run(&run).await.unwrap();
        for key in ["b", "a", "loop@0", "loop@1"] {
            store
                .commit_step(&StepCommit {
                    record: step(run.id, key, json!(key)),
                    cursor: None,
                })
                .await
                .unwrap();
        }

        let keys: Vec<String> = store
            .list_step_records(&run.id)
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.key)
            .collect();
        assert_eq!(keys, vec!["b", "a", "loop@0", "loop@1"]);
    }

    #[tokio::test]
    async fn test_trace_append_and_order() {
        let (store, _dir) = test_store().await;
        let run = sample_run("traced");
        store.create_run(&run).await.unwrap();

        let entries: Vec<TraceEntry> = (0..3)
            .map(|i| TraceEntry {
                sequence: i,
                at: Utc::now(),
                event: TraceEvent::Node {
                    step: format!("s{i}"),
                    state: NodeState::Running,
                    attempt: 1,
                    error: None,
                },
            })
            .collect();
        store.append_trace(&run.id, &entries[..2]).await.unwrap();
        store.append_trace(&run.id, &entries[2..]).await.unwrap();
        store.append_trace(&run.id, &[]).await.unwrap();

        let loaded = store.list_trace(&run.id).await.unwrap();
        assert_eq!(loaded.len(), 3);
        assert_eq!(loaded[2].event, entries[2].event);
        assert!(matches!(
            store.append_trace(&run.id, &entries[..1]).await,
            Err(RepositoryError::Conflict(_))
        ));
    }

    #[tokio::test]
    async fn test_cursor_put_get_delete() {
        let (store, _dir) = test_store().await;
        assert!(store.get_cursor("users").await.unwrap().is_none());

        let record = CursorRecord::new("users", "2024-01-01T00:00:00Z").with_format("%Y-%m-%dT%H:%M:%SZ");
        store.put_cursor(&record).await.unwrap();
        assert_eq!(store.get_cursor("users").await.unwrap(), Some(record));

        store.put_cursor(&CursorRecord::new("users", "")).await.unwrap();
        assert!(store.get_cursor("users").await.unwrap().unwrap().is_empty());

        assert!(store.delete_cursor("users").await.unwrap());
        assert!(!store.delete_cursor("users").await.unwrap());
    }

    #[tokio::test]
    async fn test_save_timer_keeps_first_token() {
        let (store, _dir) = test_store().await;
        let run = sample_run("sleepy");
        store.create_run(&run).await.unwrap();

        let first = TimerToken {
            run_id: run.id,
            key: "wait".to_string(),
            wake_at: Utc::now() + Duration::hours(1),
        };
        let stored = store.save_timer(&first).await.unwrap();
        assert_eq!(stored, first);

        let later = TimerToken {
            wake_at: first.wake_at + Duration::hours(1),
            ..first.clone()
        };
        assert_eq!(store.save_timer(&later).await.unwrap(), first);
        assert_eq!(store.get_timer(&run.id, "wait").await.unwrap(), Some(first));
        assert_eq!(store.list_timers(&run.id).await.unwrap().len(), 1);

        store.delete_timer(&run.id, "wait").await.unwrap();
        assert!(store.get_timer(&run.id, "wait").await.unwrap().is_none());
    }
}
