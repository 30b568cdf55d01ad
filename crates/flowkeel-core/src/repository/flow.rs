//! Storage ports for runs, step records, trace entries, cursors, and timers.
//!
//! The engine depends only on these traits. `flowkeel-infra` implements
//! them over SQLite; [`super::InMemoryFlowStore`] implements them for tests
//! and embedded use.
//!
//! Uses native async fn in traits (Rust 2024 edition, no async_trait macro).

use flowkeel_types::cursor::CursorRecord;
use flowkeel_types::error::RepositoryError;
use flowkeel_types::run::{RunRecord, RunStatus, StepRecord, TimerToken};
use flowkeel_types::trace::TraceEntry;
use uuid::Uuid;

/// Persistence for run records, committed step outputs, and run traces.
pub trait RunRepository: Send + Sync {
    // -----------------------------------------------------------------------
    // Runs
    // -----------------------------------------------------------------------

    fn create_run(
        &self,
        run: &RunRecord,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Update a run's status. Terminal statuses also stamp `completed_at`.
    fn update_run_status(
        &self,
        run_id: &Uuid,
        status: RunStatus,
        error: Option<&str>,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    fn get_run(
        &self,
        run_id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Option<RunRecord>, RepositoryError>> + Send;

    /// Most recent runs of a flow, newest first.
    fn list_runs(
        &self,
        flow_name: &str,
        limit: u32,
    ) -> impl std::future::Future<Output = Result<Vec<RunRecord>, RepositoryError>> + Send;

    // -----------------------------------------------------------------------
    // Steps and trace
    // -----------------------------------------------------------------------

    /// Committed step records of a run, in commit order.
    fn list_step_records(
        &self,
        run_id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Vec<StepRecord>, RepositoryError>> + Send;

    fn append_trace(
        &self,
        run_id: &Uuid,
        entries: &[TraceEntry],
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Trace entries of a run ordered by sequence number.
    fn list_trace(
        &self,
        run_id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Vec<TraceEntry>, RepositoryError>> + Send;
}

/// Persistence for incremental-processing cursors, keyed by source id.
pub trait CursorRepository: Send + Sync {
    fn get_cursor(
        &self,
        source_id: &str,
    ) -> impl std::future::Future<Output = Result<Option<CursorRecord>, RepositoryError>> + Send;

    /// Insert or replace a cursor. Performs no monotonicity check.
    fn put_cursor(
        &self,
        record: &CursorRecord,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Remove a cursor. Returns `true` if it existed.
    fn delete_cursor(
        &self,
        source_id: &str,
    ) -> impl std::future::Future<Output = Result<bool, RepositoryError>> + Send;
}

/// A step completion together with the cursor advance it carries.
#[derive(Debug, Clone)]
pub struct StepCommit {
    pub record: StepRecord,
    pub cursor: Option<CursorRecord>,
}

/// The full store the engine runs against.
pub trait FlowStore: RunRepository + CursorRepository {
    /// Atomically persist a step record and its cursor advance.
    ///
    /// Either both become visible or neither does. A second commit for the
    /// same `(run_id, key)` fails with `RepositoryError::Conflict`.
    fn commit_step(
        &self,
        commit: &StepCommit,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Persist a pending timer. Returns the stored token, which is the
    /// existing one if a token for the same step was saved earlier.
    fn save_timer(
        &self,
        token: &TimerToken,
    ) -> impl std::future::Future<Output = Result<TimerToken, RepositoryError>> + Send;

    fn get_timer(
        &self,
        run_id: &Uuid,
        key: &str,
    ) -> impl std::future::Future<Output = Result<Option<TimerToken>, RepositoryError>> + Send;

    fn delete_timer(
        &self,
        run_id: &Uuid,
        key: &str,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;
}
