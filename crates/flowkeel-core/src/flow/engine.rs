//! Flow engine: walks a compiled plan on top of a durable substrate.
//!
//! A run is a single logical timeline. Nodes dispatch through the
//! substrate, every success is committed (together with its cursor
//! advance) before the next step starts, and the trace is appended as the
//! root sequence advances. Parallel branches execute concurrently against
//! buffered scopes that are folded back in declaration order, so the trace
//! and the state of a run never depend on real completion order.
//!
//! # Execution flow
//!
//! 1. Create the run record (or load the journal for resume).
//! 2. Walk the plan depth first; committed steps found in the journal are
//!    replayed instead of dispatched.
//! 3. On an unrecovered failure, cancellation, or deadline, run the
//!    compensation cascade over completed compensable steps (LIFO). A
//!    deadline cancels the run token and lets the walk unwind, so work
//!    committed inside parallel branches is still seen by the cascade.
//! 4. Record the terminal status and return a [`RunOutcome`].
//!
//! A storage failure while checkpointing is treated as a crash: the run is
//! left `Running` so it can be resumed, and the error is returned.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use flowkeel_types::config::EngineConfig;
use flowkeel_types::cursor::CursorRecord;
use flowkeel_types::event::FlowEvent;
use flowkeel_types::flow::TimerSpec;
use flowkeel_types::run::{NodeState, RunRecord, RunStatus, StepRecord, TimerToken};
use flowkeel_types::trace::{TraceEntry, TraceEvent};
use futures_util::future::{BoxFuture, join_all};
use serde_json::{Value, json};
use tokio::sync::{Mutex, Semaphore, broadcast};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::event::bus::EventBus;
use crate::repository::{FlowStore, StepCommit};

use super::checkpoint::{CheckpointError, CheckpointManager, RunJournal};
use super::cursor::{CursorError, CursorHandle, CursorManager};
use super::expression::PredicateEvaluator;
use super::node::{Dispatch, ErrorHandler, Node, NodeError, dispatch_with_retry, node_event};
use super::plan::{Flow, Predicate, PredicateError, Step};
use super::state::{ExecutionState, StateError, state_key};
use super::substrate::{DurableSubstrate, SignalError, TaskRequest, TimerRequest, wake_after};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error(transparent)]
    Node(#[from] NodeError),

    #[error("state access failed: {0}")]
    State(#[from] StateError),

    #[error(transparent)]
    Cursor(#[from] CursorError),

    #[error("predicate of '{block}' failed: {source}")]
    Predicate {
        block: String,
        #[source]
        source: PredicateError,
    },

    #[error("signal step '{step}' failed: {source}")]
    Signal {
        step: String,
        #[source]
        source: SignalError,
    },

    #[error("loop '{label}' exceeded {limit} iteration(s)")]
    LoopLimitExceeded { label: String, limit: u32 },

    #[error("timer '{step}' duration {duration:?} is out of range")]
    TimerOutOfRange { step: String, duration: Duration },

    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),

    #[error("run was cancelled")]
    Cancelled,

    #[error("run exceeded its deadline of {0:?}")]
    TimedOut(Duration),

    #[error("flow run not found: {0}")]
    RunNotFound(Uuid),

    #[error("run {run_id} belongs to flow '{found}', not '{expected}'")]
    FlowMismatch {
        run_id: Uuid,
        expected: String,
        found: String,
    },

    #[error("run {run_id} already finished with status {status:?}")]
    AlreadyFinished { run_id: Uuid, status: RunStatus },

    #[error("run {0} is already executing")]
    AlreadyRunning(Uuid),

    #[error("run {0} is not executing")]
    NotRunning(Uuid),
}

impl EngineError {
    /// Step or block the error is attributed to, if any.
    pub fn step(&self) -> Option<&str> {
        match self {
            EngineError::Node(e) => Some(e.step()),
            EngineError::Predicate { block, .. } => Some(block),
            EngineError::Signal { step, .. } => Some(step),
            EngineError::LoopLimitExceeded { label, .. } => Some(label),
            EngineError::TimerOutOfRange { step, .. } => Some(step),
            _ => None,
        }
    }

    /// Short machine-readable kind.
    pub fn kind(&self) -> &'static str {
        match self {
            EngineError::Node(NodeError::Execution { .. }) => "node_execution",
            EngineError::Node(NodeError::Timeout { .. }) => "timeout",
            EngineError::Node(NodeError::RetryExhausted { .. }) => "retry_exhausted",
            EngineError::Node(NodeError::UnknownTask { .. }) => "unknown_task",
            EngineError::Node(NodeError::Cancelled { .. }) | EngineError::Cancelled => "cancelled",
            EngineError::Node(NodeError::DelayOutOfRange { .. }) => "delay_out_of_range",
            EngineError::State(_) => "state_access",
            EngineError::Cursor(_) => "cursor",
            EngineError::Predicate { .. } => "predicate",
            EngineError::Signal { .. } => "signal",
            EngineError::LoopLimitExceeded { .. } => "loop_limit_exceeded",
            EngineError::TimerOutOfRange { .. } => "timer_out_of_range",
            EngineError::Checkpoint(_) => "checkpoint",
            EngineError::TimedOut(_) => "timed_out",
            EngineError::RunNotFound(_)
            | EngineError::FlowMismatch { .. }
            | EngineError::AlreadyFinished { .. }
            | EngineError::AlreadyRunning(_)
            | EngineError::NotRunning(_) => "run_lookup",
        }
    }
}

// ---------------------------------------------------------------------------
// Outcome
// ---------------------------------------------------------------------------

/// First unrecovered error of a run.
#[derive(Debug, Clone, PartialEq)]
pub struct RunError {
    pub step: Option<String>,
    pub kind: &'static str,
    pub message: String,
}

impl From<&EngineError> for RunError {
    fn from(error: &EngineError) -> Self {
        Self {
            step: error.step().map(str::to_string),
            kind: error.kind(),
            message: error.to_string(),
        }
    }
}

/// A compensation handler that failed during the cascade.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("compensation '{task}' for step '{step}' failed: {message}")]
pub struct CompensationFailure {
    pub step: String,
    pub task: String,
    pub message: String,
}

/// One compensation handler invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct CompensationReport {
    pub step: String,
    pub task: String,
    pub failure: Option<CompensationFailure>,
}

impl CompensationReport {
    pub fn succeeded(&self) -> bool {
        self.failure.is_none()
    }
}

/// User-visible result of a run.
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub run_id: Uuid,
    pub flow_name: String,
    pub status: RunStatus,
    pub state: ExecutionState,
    /// Full trace, including entries written before a resume.
    pub trace: Vec<TraceEntry>,
    pub error: Option<RunError>,
    /// Cascade invocations in the order they ran.
    pub compensations: Vec<CompensationReport>,
}

impl RunOutcome {
    /// Trace events only, in sequence order.
    pub fn events(&self) -> impl Iterator<Item = &TraceEvent> {
        self.trace.iter().map(|entry| &entry.event)
    }

    /// Number of attempts the trace records for a step key.
    pub fn attempts(&self, key: &str) -> usize {
        self.events()
            .filter(|ev| {
                matches!(ev, TraceEvent::Node { step, state: NodeState::Running, .. } if step == key)
            })
            .count()
    }
}

// ---------------------------------------------------------------------------
// Run-scoped bookkeeping
// ---------------------------------------------------------------------------

struct TraceLog {
    next_sequence: u64,
    entries: Vec<TraceEntry>,
}

/// Shared, read-mostly context of one run.
struct RunContext<R: FlowStore> {
    run_id: Uuid,
    flow_name: String,
    cancel: CancellationToken,
    cursors: CursorManager<R>,
    /// Steps committed before this execution started, keyed by state key.
    journal: HashMap<String, StepRecord>,
    trace: Mutex<TraceLog>,
    step_timeout: Duration,
}

/// A completed compensable step awaiting a possible cascade.
#[derive(Debug, Clone)]
struct Compensable {
    key: String,
    task: String,
    input: Value,
    output: Value,
    timeout: Option<Duration>,
}

/// Mutable view of a sequence being executed. The root scope flushes its
/// events to the store as it goes; branch scopes buffer until merged.
struct Scope {
    state: ExecutionState,
    events: Vec<TraceEvent>,
    writes: Vec<(String, Value)>,
    compensables: Vec<Compensable>,
    iterations: Vec<u32>,
    buffered: bool,
}

impl Scope {
    fn root(state: ExecutionState) -> Self {
        Self {
            state,
            events: Vec::new(),
            writes: Vec::new(),
            compensables: Vec::new(),
            iterations: Vec::new(),
            buffered: false,
        }
    }

    fn fork(&self) -> Self {
        Self {
            state: self.state.clone(),
            events: Vec::new(),
            writes: Vec::new(),
            compensables: Vec::new(),
            iterations: self.iterations.clone(),
            buffered: true,
        }
    }

    /// Fold a finished branch into this scope.
    fn absorb(&mut self, branch: Scope) -> Result<(), StateError> {
        for (key, value) in branch.writes {
            self.state.set(&key, value.clone())?;
            self.writes.push((key, value));
        }
        self.events.extend(branch.events);
        self.compensables.extend(branch.compensables);
        Ok(())
    }

    fn emit(&mut self, event: TraceEvent) {
        self.events.push(event);
    }

    fn key(&self, name: &str) -> String {
        state_key(name, &self.iterations)
    }

    /// Attempt number of the latest `Running` transition for `key`.
    fn last_attempt(&self, key: &str) -> u32 {
        self.events
            .iter()
            .rev()
            .find_map(|ev| match ev {
                TraceEvent::Node {
                    step,
                    state: NodeState::Running,
                    attempt,
                    ..
                } if step == key => Some(*attempt),
                _ => None,
            })
            .unwrap_or(1)
    }
}

enum BranchRun {
    Ran(Result<(), EngineError>),
    Skipped,
}

// ---------------------------------------------------------------------------
// FlowEngine
// ---------------------------------------------------------------------------

/// Interprets compiled flows against a substrate and a durable store.
pub struct FlowEngine<S: DurableSubstrate, R: FlowStore> {
    substrate: Arc<S>,
    store: Arc<R>,
    checkpoint: CheckpointManager<R>,
    evaluator: PredicateEvaluator,
    config: EngineConfig,
    event_bus: EventBus,
    /// Cancellation tokens keyed by run_id.
    cancellation_tokens: DashMap<Uuid, CancellationToken>,
}

impl<S: DurableSubstrate, R: FlowStore + 'static> FlowEngine<S, R> {
    pub fn new(substrate: Arc<S>, store: Arc<R>, config: EngineConfig) -> Self {
        let event_bus = EventBus::new(config.event_bus_capacity);
        Self::with_event_bus(substrate, store, config, event_bus)
    }

    /// Create an engine publishing on an existing bus.
    pub fn with_event_bus(
        substrate: Arc<S>,
        store: Arc<R>,
        config: EngineConfig,
        event_bus: EventBus,
    ) -> Self {
        Self {
            substrate,
            checkpoint: CheckpointManager::new(Arc::clone(&store)),
            store,
            evaluator: PredicateEvaluator::new(),
            config,
            event_bus,
            cancellation_tokens: DashMap::new(),
        }
    }

    pub fn substrate(&self) -> &Arc<S> {
        &self.substrate
    }

    pub fn store(&self) -> &Arc<R> {
        &self.store
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn event_bus(&self) -> &EventBus {
        &self.event_bus
    }

    pub fn subscribe(&self) -> broadcast::Receiver<FlowEvent> {
        self.event_bus.subscribe()
    }

    pub fn is_running(&self, run_id: Uuid) -> bool {
        self.cancellation_tokens.contains_key(&run_id)
    }

    // -----------------------------------------------------------------------
    // Run lifecycle
    // -----------------------------------------------------------------------

    /// Start a new run of `flow` and drive it to a terminal status.
    pub async fn start(
        &self,
        flow: &Flow,
        trigger_kind: &str,
        payload: Value,
    ) -> Result<RunOutcome, EngineError> {
        self.start_with_id(flow, Uuid::now_v7(), trigger_kind, payload)
            .await
    }

    /// Like [`FlowEngine::start`] with a caller-chosen run id, so signals
    /// can be queued for the run before it begins.
    pub async fn start_with_id(
        &self,
        flow: &Flow,
        run_id: Uuid,
        trigger_kind: &str,
        payload: Value,
    ) -> Result<RunOutcome, EngineError> {
        let cancel = self.claim(run_id)?;
        let run = RunRecord {
            id: run_id,
            flow_name: flow.name().to_string(),
            trigger_kind: trigger_kind.to_string(),
            payload,
            status: RunStatus::Running,
            error: None,
            started_at: Utc::now(),
            completed_at: None,
        };
        if let Err(e) = self.checkpoint.checkpoint_run_start(&run).await {
            self.cancellation_tokens.remove(&run_id);
            return Err(e.into());
        }

        self.event_bus.publish(FlowEvent::RunStarted {
            run_id,
            flow_name: run.flow_name.clone(),
            trigger_kind: run.trigger_kind.clone(),
            resumed: false,
        });
        tracing::info!(
            run_id = %run_id,
            flow = flow.name(),
            trigger = trigger_kind,
            "starting flow run"
        );

        self.drive(flow, run, cancel, Vec::new(), Vec::new()).await
    }

    /// Continue a run that stopped before reaching a terminal status.
    ///
    /// Committed steps are restored rather than re-dispatched, predicates
    /// re-evaluate against the restored state, and pending timers wait only
    /// for what remains of their persisted wake-up.
    pub async fn resume(&self, flow: &Flow, run_id: Uuid) -> Result<RunOutcome, EngineError> {
        let cancel = self.claim(run_id)?;
        let journal = match self.load_resumable(flow, run_id).await {
            Ok(journal) => journal,
            Err(e) => {
                self.cancellation_tokens.remove(&run_id);
                return Err(e);
            }
        };

        self.event_bus.publish(FlowEvent::RunStarted {
            run_id,
            flow_name: journal.run.flow_name.clone(),
            trigger_kind: journal.run.trigger_kind.clone(),
            resumed: true,
        });
        tracing::info!(
            run_id = %run_id,
            flow = flow.name(),
            committed_steps = journal.steps.len(),
            "resuming flow run"
        );

        self.drive(flow, journal.run, cancel, journal.steps, journal.trace)
            .await
    }

    async fn load_resumable(&self, flow: &Flow, run_id: Uuid) -> Result<RunJournal, EngineError> {
        let journal = self.checkpoint.restore(run_id).await.map_err(|e| match e {
            CheckpointError::RunNotFound(id) => EngineError::RunNotFound(id),
            other => EngineError::Checkpoint(other),
        })?;
        if journal.run.flow_name != flow.name() {
            return Err(EngineError::FlowMismatch {
                run_id,
                expected: flow.name().to_string(),
                found: journal.run.flow_name,
            });
        }
        if journal.run.status.is_terminal() {
            return Err(EngineError::AlreadyFinished {
                run_id,
                status: journal.run.status,
            });
        }
        Ok(journal)
    }

    /// Register a run as executing and hand out its cancellation token.
    fn claim(&self, run_id: Uuid) -> Result<CancellationToken, EngineError> {
        match self.cancellation_tokens.entry(run_id) {
            Entry::Occupied(_) => Err(EngineError::AlreadyRunning(run_id)),
            Entry::Vacant(slot) => {
                let token = CancellationToken::new();
                slot.insert(token.clone());
                Ok(token)
            }
        }
    }

    /// Signal a running run to stop. In-flight dispatches observe the token;
    /// completed compensable steps are compensated.
    pub fn cancel(&self, run_id: Uuid) -> Result<(), EngineError> {
        let token = self
            .cancellation_tokens
            .get(&run_id)
            .ok_or(EngineError::NotRunning(run_id))?;
        token.cancel();
        tracing::info!(run_id = %run_id, "flow run cancellation requested");
        Ok(())
    }

    /// Persisted trace of a run.
    pub async fn trace(&self, run_id: Uuid) -> Result<Vec<TraceEntry>, EngineError> {
        if self.checkpoint.run(run_id).await?.is_none() {
            return Err(EngineError::RunNotFound(run_id));
        }
        Ok(self.checkpoint.trace(run_id).await?)
    }

    pub async fn run_record(&self, run_id: Uuid) -> Result<Option<RunRecord>, EngineError> {
        Ok(self.checkpoint.run(run_id).await?)
    }

    /// Clear a cursor so the next run reprocesses from its default.
    pub async fn reset_cursor(&self, source_id: &str) -> Result<(), EngineError> {
        CursorManager::new(Arc::clone(&self.store))
            .reset(source_id)
            .await?;
        Ok(())
    }

    /// Current handle for a cursor source, outside any run.
    pub async fn cursor(&self, source_id: &str) -> Result<CursorHandle, EngineError> {
        Ok(CursorManager::new(Arc::clone(&self.store))
            .handle_for(source_id)
            .await?)
    }

    async fn drive(
        &self,
        flow: &Flow,
        run: RunRecord,
        cancel: CancellationToken,
        committed: Vec<StepRecord>,
        prior_trace: Vec<TraceEntry>,
    ) -> Result<RunOutcome, EngineError> {
        let ctx = RunContext {
            run_id: run.id,
            flow_name: run.flow_name.clone(),
            cancel,
            cursors: CursorManager::new(Arc::clone(&self.store)),
            journal: committed
                .into_iter()
                .map(|record| (record.key.clone(), record))
                .collect(),
            trace: Mutex::new(TraceLog {
                next_sequence: prior_trace.last().map_or(0, |e| e.sequence + 1),
                entries: prior_trace,
            }),
            step_timeout: Duration::from_secs(self.config.default_step_timeout_secs),
        };
        let state = ExecutionState::new(run.payload.clone()).with_schema(Arc::clone(flow.schema()));
        let mut scope = Scope::root(state);

        let deadline = flow
            .timeout()
            .or(self.config.run_timeout_secs.map(Duration::from_secs));
        let started = tokio::time::Instant::now();

        // The deadline cancels the run token instead of dropping the walk, so
        // branches that already committed unwind and fold their compensable
        // steps back into the root scope.
        let walked = CancellationToken::new();
        let walk = async {
            let result = self.exec_steps(&ctx, &mut scope, flow.steps()).await;
            walked.cancel();
            result
        };
        let watchdog = async {
            let Some(deadline) = deadline else {
                return None;
            };
            tokio::select! {
                _ = tokio::time::sleep(deadline) => {
                    tracing::warn!(run_id = %run.id, ?deadline, "run deadline reached, cancelling");
                    ctx.cancel.cancel();
                    Some(deadline)
                }
                _ = walked.cancelled() => None,
            }
        };
        let (result, expired) = tokio::join!(walk, watchdog);
        let result = match (result, expired) {
            (Err(EngineError::Checkpoint(e)), _) => Err(EngineError::Checkpoint(e)),
            (Err(_), Some(deadline)) => Err(EngineError::TimedOut(deadline)),
            (result, _) => result,
        };

        let outcome = self.finish(&ctx, scope, result, started).await;

        self.cancellation_tokens.remove(&run.id);
        self.substrate.release_run(run.id);
        outcome
    }

    async fn finish(
        &self,
        ctx: &RunContext<R>,
        mut scope: Scope,
        result: Result<(), EngineError>,
        started: tokio::time::Instant,
    ) -> Result<RunOutcome, EngineError> {
        let (status, error, compensations) = match result {
            Ok(()) => (RunStatus::Completed, None, Vec::new()),
            Err(EngineError::Checkpoint(e)) => {
                tracing::error!(
                    run_id = %ctx.run_id,
                    error = %e,
                    "checkpoint failed, run left resumable"
                );
                return Err(EngineError::Checkpoint(e));
            }
            Err(e) => {
                let failed = match e {
                    EngineError::Cancelled | EngineError::Node(NodeError::Cancelled { .. }) => {
                        RunStatus::Cancelled
                    }
                    EngineError::TimedOut(_) => RunStatus::TimedOut,
                    _ => RunStatus::Failed,
                };
                tracing::warn!(
                    run_id = %ctx.run_id,
                    status = failed.as_str(),
                    error = %e,
                    "flow run did not complete"
                );
                let compensations = self.compensate(ctx, &mut scope).await;
                let status = if failed == RunStatus::Failed && !compensations.is_empty() {
                    RunStatus::Compensated
                } else {
                    failed
                };
                (status, Some(RunError::from(&e)), compensations)
            }
        };

        scope.emit(TraceEvent::RunFinished {
            status,
            error: error.as_ref().map(|e| e.message.clone()),
        });
        self.flush(ctx, &mut scope).await?;
        self.checkpoint
            .checkpoint_run_status(ctx.run_id, status, error.as_ref().map(|e| e.message.as_str()))
            .await?;

        let duration_ms = started.elapsed().as_millis() as u64;
        self.event_bus.publish(FlowEvent::RunFinished {
            run_id: ctx.run_id,
            flow_name: ctx.flow_name.clone(),
            status,
            duration_ms,
        });
        tracing::info!(
            run_id = %ctx.run_id,
            flow = ctx.flow_name.as_str(),
            status = status.as_str(),
            duration_ms,
            "flow run finished"
        );

        let trace = std::mem::take(&mut ctx.trace.lock().await.entries);
        Ok(RunOutcome {
            run_id: ctx.run_id,
            flow_name: ctx.flow_name.clone(),
            status,
            state: scope.state,
            trace,
            error,
            compensations,
        })
    }

    // -----------------------------------------------------------------------
    // Trace
    // -----------------------------------------------------------------------

    /// Append the root scope's pending events to the durable trace.
    async fn flush(&self, ctx: &RunContext<R>, scope: &mut Scope) -> Result<(), EngineError> {
        if scope.buffered || scope.events.is_empty() {
            return Ok(());
        }
        let mut log = ctx.trace.lock().await;
        let now = Utc::now();
        let entries: Vec<TraceEntry> = scope
            .events
            .drain(..)
            .enumerate()
            .map(|(offset, event)| TraceEntry {
                sequence: log.next_sequence + offset as u64,
                at: now,
                event,
            })
            .collect();
        self.checkpoint.checkpoint_trace(ctx.run_id, &entries).await?;

        log.next_sequence += entries.len() as u64;
        for entry in &entries {
            self.event_bus.publish(FlowEvent::Trace {
                run_id: ctx.run_id,
                entry: entry.clone(),
            });
        }
        log.entries.extend(entries);
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Plan walk
    // -----------------------------------------------------------------------

    fn exec_steps<'a>(
        &'a self,
        ctx: &'a RunContext<R>,
        scope: &'a mut Scope,
        steps: &'a [Step],
    ) -> BoxFuture<'a, Result<(), EngineError>> {
        Box::pin(async move {
            for step in steps {
                if ctx.cancel.is_cancelled() {
                    return Err(EngineError::Cancelled);
                }
                let result = self.exec_step(ctx, scope, step).await;
                self.flush(ctx, scope).await?;
                result?;
            }
            Ok(())
        })
    }

    async fn exec_step(
        &self,
        ctx: &RunContext<R>,
        scope: &mut Scope,
        step: &Step,
    ) -> Result<(), EngineError> {
        match step {
            Step::Node(node) => self.exec_node(ctx, scope, node).await,
            Step::Conditional {
                label,
                predicate,
                body,
                otherwise,
            } => {
                let block = scope.key(label);
                let taken = self.evaluate(predicate, &block, &scope.state)?;
                tracing::debug!(run_id = %ctx.run_id, block = block.as_str(), taken, "branch decision");
                scope.emit(TraceEvent::BranchDecision { block, taken });
                let chosen = if taken { body } else { otherwise };
                self.exec_steps(ctx, scope, chosen).await
            }
            Step::Loop {
                label,
                predicate,
                body,
                max_iterations,
            } => {
                self.exec_loop(ctx, scope, label, predicate, body, *max_iterations)
                    .await
            }
            Step::Parallel { label, branches } => {
                self.exec_parallel(ctx, scope, label, branches).await
            }
            Step::Timer { name, spec } => self.exec_timer(ctx, scope, name, spec).await,
            Step::Signal {
                name,
                signal,
                timeout,
            } => {
                self.exec_signal(ctx, scope, name, signal, *timeout)
                    .await
            }
        }
    }

    fn evaluate(
        &self,
        predicate: &Predicate,
        block: &str,
        state: &ExecutionState,
    ) -> Result<bool, EngineError> {
        predicate
            .evaluate(state, &self.evaluator)
            .map_err(|source| EngineError::Predicate {
                block: block.to_string(),
                source,
            })
    }

    async fn exec_loop(
        &self,
        ctx: &RunContext<R>,
        scope: &mut Scope,
        label: &str,
        predicate: &Predicate,
        body: &[Step],
        max_iterations: Option<u32>,
    ) -> Result<(), EngineError> {
        let block = scope.key(label);
        let limit = max_iterations.or(self.config.loop_iteration_limit);
        let mut iteration = 0u32;

        loop {
            if ctx.cancel.is_cancelled() {
                return Err(EngineError::Cancelled);
            }
            if !self.evaluate(predicate, &block, &scope.state)? {
                break;
            }
            if let Some(limit) = limit {
                if iteration >= limit {
                    return Err(EngineError::LoopLimitExceeded {
                        label: block,
                        limit,
                    });
                }
            }
            iteration += 1;
            scope.emit(TraceEvent::LoopIteration {
                block: block.clone(),
                iteration,
            });

            scope.iterations.push(iteration);
            let result = self.exec_steps(ctx, scope, body).await;
            scope.iterations.pop();
            result?;
        }

        tracing::debug!(run_id = %ctx.run_id, block = block.as_str(), iterations = iteration, "loop finished");
        Ok(())
    }

    async fn exec_parallel(
        &self,
        ctx: &RunContext<R>,
        scope: &mut Scope,
        label: &str,
        branches: &[Vec<Step>],
    ) -> Result<(), EngineError> {
        let block = scope.key(label);
        let semaphore = Semaphore::new(self.config.max_parallelism.max(1));
        let failed = AtomicBool::new(false);

        let forks: Vec<Scope> = branches.iter().map(|_| scope.fork()).collect();
        let runs = branches.iter().zip(forks).map(|(steps, mut branch)| {
            let semaphore = &semaphore;
            let failed = &failed;
            async move {
                let Ok(_permit) = semaphore.acquire().await else {
                    return (branch, BranchRun::Skipped);
                };
                if failed.load(Ordering::SeqCst) || ctx.cancel.is_cancelled() {
                    return (branch, BranchRun::Skipped);
                }
                let result = self.exec_steps(ctx, &mut branch, steps).await;
                if result.is_err() {
                    failed.store(true, Ordering::SeqCst);
                }
                (branch, BranchRun::Ran(result))
            }
        });
        let finished = join_all(runs).await;

        let mut first_error = None;
        for (index, (branch, run)) in finished.into_iter().enumerate() {
            match run {
                BranchRun::Skipped => {
                    tracing::debug!(run_id = %ctx.run_id, block = block.as_str(), branch = index, "branch skipped");
                    scope.emit(TraceEvent::BranchSkipped {
                        block: block.clone(),
                        branch: index,
                    });
                }
                BranchRun::Ran(result) => {
                    scope.absorb(branch)?;
                    if let Err(e) = result {
                        first_error.get_or_insert(e);
                    }
                }
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    // -----------------------------------------------------------------------
    // Leaf steps
    // -----------------------------------------------------------------------

    /// Restore a committed step from the journal. Returns `false` when the
    /// key has not been committed.
    fn replay(&self, ctx: &RunContext<R>, scope: &mut Scope, key: &str) -> Result<bool, EngineError> {
        let Some(record) = ctx.journal.get(key) else {
            return Ok(false);
        };
        scope.state.set(key, record.output.clone())?;
        scope.writes.push((key.to_string(), record.output.clone()));
        scope.emit(TraceEvent::Replayed {
            step: key.to_string(),
        });
        tracing::debug!(run_id = %ctx.run_id, step = key, "replayed committed step");
        Ok(true)
    }

    /// Write a step output to state and durably commit it.
    async fn commit(
        &self,
        ctx: &RunContext<R>,
        scope: &mut Scope,
        key: &str,
        input: Value,
        output: Value,
        cursor: Option<CursorRecord>,
    ) -> Result<(), EngineError> {
        scope.state.check_write(key, &output)?;
        let commit = StepCommit {
            record: StepRecord {
                run_id: ctx.run_id,
                key: key.to_string(),
                input,
                output: output.clone(),
                completed_at: Utc::now(),
            },
            cursor,
        };
        self.checkpoint
            .checkpoint_step_complete(&commit)
            .await
            .map_err(|e| match e {
                CheckpointError::CursorRegressed {
                    source_id,
                    current,
                    proposed,
                } => EngineError::Cursor(CursorError::NonMonotonic {
                    source_id,
                    current,
                    proposed,
                }),
                other => EngineError::Checkpoint(other),
            })?;

        scope.state.set(key, output.clone())?;
        scope.writes.push((key.to_string(), output));
        scope.emit(TraceEvent::StateWritten {
            step: key.to_string(),
        });
        if let Some(advance) = commit.cursor {
            scope.emit(TraceEvent::CursorAdvanced {
                source_id: advance.source_id,
                position: advance.position,
            });
        }
        Ok(())
    }

    async fn exec_node(
        &self,
        ctx: &RunContext<R>,
        scope: &mut Scope,
        node: &Node,
    ) -> Result<(), EngineError> {
        let key = scope.key(&node.name);
        if self.replay(ctx, scope, &key)? {
            if let (Some(task), Some(record)) = (&node.compensation, ctx.journal.get(&key)) {
                scope.compensables.push(Compensable {
                    key: key.clone(),
                    task: task.clone(),
                    input: record.input.clone(),
                    output: record.output.clone(),
                    timeout: node.timeout,
                });
            }
            return Ok(());
        }

        let resolved = node.input.resolve(&scope.state)?;
        let handle = match &node.cursor {
            Some(binding) => Some(ctx.cursors.handle(binding).await?),
            None => None,
        };
        let input = ctx
            .cursors
            .substitute_input(&resolved, handle.as_ref())
            .await?;

        scope.emit(node_event(&key, NodeState::Pending, 0, None));
        let dispatch = Dispatch {
            run_id: ctx.run_id,
            flow_name: &ctx.flow_name,
            key: &key,
            timeout: node.timeout.unwrap_or(ctx.step_timeout),
            cancel: &ctx.cancel,
        };
        let result =
            dispatch_with_retry(self.substrate.as_ref(), node, &input, &dispatch, &mut scope.events)
                .await;

        let output = match result {
            Ok(output) => output,
            Err(NodeError::Cancelled { .. }) => return Err(EngineError::Cancelled),
            Err(error) => {
                self.handle_failure(ctx, scope, node, &key, &input, error)
                    .await?
            }
        };

        let advance = match (&node.cursor, &handle) {
            (Some(binding), Some(handle)) => ctx.cursors.prepare_advance(binding, handle, &output)?,
            _ => None,
        };
        let attempt = scope.last_attempt(&key);
        self.commit(ctx, scope, &key, input.clone(), output.clone(), advance)
            .await?;
        scope.emit(node_event(&key, NodeState::Succeeded, attempt, None));
        tracing::debug!(run_id = %ctx.run_id, step = key.as_str(), attempt, "step succeeded");

        if let Some(task) = &node.compensation {
            scope.compensables.push(Compensable {
                key,
                task: task.clone(),
                input,
                output,
                timeout: node.timeout,
            });
        }
        Ok(())
    }

    /// Route an exhausted node through its error handler. Returns the
    /// replacement output when a fallback recovered the step.
    async fn handle_failure(
        &self,
        ctx: &RunContext<R>,
        scope: &mut Scope,
        node: &Node,
        key: &str,
        input: &Value,
        error: NodeError,
    ) -> Result<Value, EngineError> {
        let Some(handler) = &node.error_handler else {
            return Err(error.into());
        };
        let attempt = scope.last_attempt(key);
        scope.emit(node_event(key, NodeState::Compensating, attempt, None));
        tracing::warn!(
            run_id = %ctx.run_id,
            step = key,
            handler = ?handler,
            error = %error,
            "step failed, invoking error handler"
        );

        let handled = match handler {
            ErrorHandler::Fallback(task) => {
                self.run_once(ctx, key, task, input.clone(), node.timeout, ctx.cancel.clone())
                    .await
            }
            ErrorHandler::Compensate(task) => {
                let payload = json!({ "input": input, "error": error.to_string() });
                self.run_once(ctx, key, task, payload, node.timeout, ctx.cancel.clone())
                    .await
            }
            ErrorHandler::RollbackCursor => match &node.cursor {
                Some(binding) => ctx
                    .cursors
                    .rollback(&binding.source_id)
                    .await
                    .map(|position| {
                        scope.emit(TraceEvent::CursorRolledBack {
                            source_id: binding.source_id.clone(),
                            position: position.clone(),
                        });
                        json!(position)
                    })
                    .map_err(|e| e.to_string()),
                None => Err("no cursor bound to the step".to_string()),
            },
        };

        match handled {
            Ok(output) => {
                scope.emit(node_event(key, NodeState::CompensationSucceeded, attempt, None));
                match handler {
                    ErrorHandler::Fallback(_) => Ok(output),
                    _ => Err(error.into()),
                }
            }
            Err(message) => {
                tracing::warn!(run_id = %ctx.run_id, step = key, error = %message, "error handler failed");
                scope.emit(node_event(
                    key,
                    NodeState::CompensationFailed,
                    attempt,
                    Some(message),
                ));
                Err(error.into())
            }
        }
    }

    /// One attempt of a task outside the retry loop.
    async fn run_once(
        &self,
        ctx: &RunContext<R>,
        key: &str,
        task: &str,
        input: Value,
        timeout: Option<Duration>,
        cancel: CancellationToken,
    ) -> Result<Value, String> {
        self.substrate
            .execute_task(TaskRequest {
                run_id: ctx.run_id,
                flow_name: ctx.flow_name.clone(),
                step: key.to_string(),
                task: task.to_string(),
                input,
                attempt: 1,
                timeout: timeout.unwrap_or(ctx.step_timeout),
                cancel,
            })
            .await
            .map_err(|e| e.to_string())
    }

    async fn exec_timer(
        &self,
        ctx: &RunContext<R>,
        scope: &mut Scope,
        name: &str,
        spec: &TimerSpec,
    ) -> Result<(), EngineError> {
        let key = scope.key(name);
        if self.replay(ctx, scope, &key)? {
            return Ok(());
        }

        let wake_at = match spec {
            TimerSpec::Duration(d) => wake_after(*d).ok_or_else(|| EngineError::TimerOutOfRange {
                step: key.clone(),
                duration: *d,
            })?,
            TimerSpec::Deadline(at) => *at,
        };
        let token = self
            .checkpoint
            .checkpoint_timer(&TimerToken {
                run_id: ctx.run_id,
                key: key.clone(),
                wake_at,
            })
            .await?;
        scope.emit(TraceEvent::TimerScheduled {
            step: key.clone(),
            wake_at: token.wake_at,
        });
        self.flush(ctx, scope).await?;

        self.substrate
            .start_timer(TimerRequest {
                run_id: ctx.run_id,
                key: key.clone(),
                wake_at: token.wake_at,
                cancel: ctx.cancel.clone(),
            })
            .await
            .map_err(|_| EngineError::Cancelled)?;
        scope.emit(TraceEvent::TimerFired { step: key.clone() });

        self.commit(ctx, scope, &key, Value::Null, json!({ "wake_at": token.wake_at }), None)
            .await?;
        self.checkpoint.clear_timer(ctx.run_id, &key).await?;
        Ok(())
    }

    async fn exec_signal(
        &self,
        ctx: &RunContext<R>,
        scope: &mut Scope,
        name: &str,
        signal: &str,
        timeout: Option<Duration>,
    ) -> Result<(), EngineError> {
        let key = scope.key(name);
        if self.replay(ctx, scope, &key)? {
            return Ok(());
        }
        self.flush(ctx, scope).await?;

        let payload = self
            .substrate
            .receive_signal(ctx.run_id, signal, timeout, &ctx.cancel)
            .await
            .map_err(|source| match source {
                SignalError::Cancelled(_) => EngineError::Cancelled,
                other => EngineError::Signal {
                    step: key.clone(),
                    source: other,
                },
            })?;
        scope.emit(TraceEvent::SignalReceived {
            step: key.clone(),
            signal: signal.to_string(),
        });
        tracing::debug!(run_id = %ctx.run_id, step = key.as_str(), signal, "signal received");

        self.commit(ctx, scope, &key, Value::Null, payload, None)
            .await
    }

    // -----------------------------------------------------------------------
    // Compensation
    // -----------------------------------------------------------------------

    /// Invoke the undo task of every completed compensable step, most
    /// recent first. Failures are recorded and the cascade continues.
    async fn compensate(&self, ctx: &RunContext<R>, scope: &mut Scope) -> Vec<CompensationReport> {
        // The run token may already be cancelled; the cascade must still run.
        let cancel = CancellationToken::new();
        let mut reports = Vec::new();

        while let Some(done) = scope.compensables.pop() {
            scope.emit(TraceEvent::CompensationStarted {
                step: done.key.clone(),
                task: done.task.clone(),
            });
            let payload = json!({ "input": done.input, "output": done.output });
            let result = self
                .run_once(ctx, &done.key, &done.task, payload, done.timeout, cancel.clone())
                .await;

            let failure = match result {
                Ok(_) => {
                    tracing::debug!(run_id = %ctx.run_id, step = done.key.as_str(), task = done.task.as_str(), "compensated step");
                    scope.emit(TraceEvent::CompensationSucceeded {
                        step: done.key.clone(),
                    });
                    None
                }
                Err(message) => {
                    tracing::warn!(
                        run_id = %ctx.run_id,
                        step = done.key.as_str(),
                        task = done.task.as_str(),
                        error = %message,
                        "compensation failed, continuing cascade"
                    );
                    scope.emit(TraceEvent::CompensationFailed {
                        step: done.key.clone(),
                        error: message.clone(),
                    });
                    Some(CompensationFailure {
                        step: done.key.clone(),
                        task: done.task.clone(),
                        message,
                    })
                }
            };
            reports.push(CompensationReport {
                step: done.key,
                task: done.task,
                failure,
            });
        }
        reports
    }
}
