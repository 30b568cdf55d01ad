//! Node wrapper: typed handlers, per-node execution policy, and the
//! attempt/retry loop that dispatches a node through the substrate.

use std::future::Future;
use std::marker::PhantomData;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use flowkeel_types::flow::RetryPolicy;
use flowkeel_types::run::NodeState;
use flowkeel_types::trace::TraceEvent;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::cursor::CursorBinding;
use super::retry::RetryHandler;
use super::state::{ExecutionState, StateError};
use super::substrate::{DurableSubstrate, TaskError, TaskRequest, TimerRequest, wake_after};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Failure returned by a handler body.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("{message}")]
pub struct HandlerError {
    pub message: String,
    /// `false` skips the remaining retry budget.
    pub retryable: bool,
}

impl HandlerError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: true,
        }
    }

    pub fn non_retryable(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: false,
        }
    }
}

impl From<String> for HandlerError {
    fn from(message: String) -> Self {
        Self::new(message)
    }
}

impl From<&str> for HandlerError {
    fn from(message: &str) -> Self {
        Self::new(message)
    }
}

/// Node-level failure after the wrapper has applied its policy.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum NodeError {
    #[error("step '{step}' failed: {message}")]
    Execution {
        step: String,
        message: String,
        retryable: bool,
    },

    #[error("step '{step}' timed out after {timeout:?}")]
    Timeout { step: String, timeout: Duration },

    #[error("step '{step}' gave up after {attempts} attempt(s): {last}")]
    RetryExhausted {
        step: String,
        attempts: u32,
        last: Box<NodeError>,
    },

    #[error("task '{task}' used by step '{step}' is not registered")]
    UnknownTask { step: String, task: String },

    #[error("step '{step}' was cancelled")]
    Cancelled { step: String },

    #[error("retry delay {delay:?} of step '{step}' is out of range")]
    DelayOutOfRange { step: String, delay: Duration },
}

impl NodeError {
    pub fn step(&self) -> &str {
        match self {
            NodeError::Execution { step, .. }
            | NodeError::Timeout { step, .. }
            | NodeError::RetryExhausted { step, .. }
            | NodeError::UnknownTask { step, .. }
            | NodeError::Cancelled { step }
            | NodeError::DelayOutOfRange { step, .. } => step,
        }
    }

    /// Whether the retry loop may try again after this error.
    pub fn is_retryable(&self) -> bool {
        match self {
            NodeError::Execution { retryable, .. } => *retryable,
            NodeError::Timeout { .. } => true,
            _ => false,
        }
    }

    fn from_task(step: &str, error: TaskError) -> Self {
        let step = step.to_string();
        match error {
            TaskError::Failed(e) => NodeError::Execution {
                step,
                message: e.message,
                retryable: e.retryable,
            },
            TaskError::Panicked(message) => NodeError::Execution {
                step,
                message: format!("handler panicked: {message}"),
                retryable: true,
            },
            TaskError::TimedOut(timeout) => NodeError::Timeout { step, timeout },
            TaskError::UnknownTask(task) => NodeError::UnknownTask { step, task },
            TaskError::Cancelled => NodeError::Cancelled { step },
        }
    }
}

// ---------------------------------------------------------------------------
// Context and handlers
// ---------------------------------------------------------------------------

/// What a handler knows about the invocation it serves.
#[derive(Debug, Clone)]
pub struct NodeContext {
    pub run_id: Uuid,
    pub flow_name: String,
    /// State key of the step (`name` or `name@i` inside loops).
    pub step: String,
    /// 1-based attempt number.
    pub attempt: u32,
    pub cancel: CancellationToken,
}

impl NodeContext {
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

/// A typed unit of work registered under a task name.
///
/// Uses native async fn in traits (Rust 2024 edition, no async_trait macro).
pub trait NodeHandler: Send + Sync + 'static {
    type Input: DeserializeOwned + Send;
    type Output: Serialize + Send;

    fn handle(
        &self,
        ctx: &NodeContext,
        input: Self::Input,
    ) -> impl Future<Output = Result<Self::Output, HandlerError>> + Send;
}

/// Object-safe version of [`NodeHandler`] over JSON values.
///
/// A blanket implementation is provided for all types implementing
/// `NodeHandler`; input decoding failures are non-retryable.
pub trait NodeHandlerDyn: Send + Sync {
    fn handle_boxed<'a>(
        &'a self,
        ctx: &'a NodeContext,
        input: Value,
    ) -> Pin<Box<dyn Future<Output = Result<Value, HandlerError>> + Send + 'a>>;
}

impl<T: NodeHandler> NodeHandlerDyn for T {
    fn handle_boxed<'a>(
        &'a self,
        ctx: &'a NodeContext,
        input: Value,
    ) -> Pin<Box<dyn Future<Output = Result<Value, HandlerError>> + Send + 'a>> {
        Box::pin(async move {
            let typed: T::Input = serde_json::from_value(input)
                .map_err(|e| HandlerError::non_retryable(format!("invalid input: {e}")))?;
            let output = self.handle(ctx, typed).await?;
            serde_json::to_value(output)
                .map_err(|e| HandlerError::non_retryable(format!("unserializable output: {e}")))
        })
    }
}

/// Type-erased, cheaply cloneable node handler.
#[derive(Clone)]
pub struct BoxNodeHandler {
    inner: Arc<dyn NodeHandlerDyn>,
}

impl BoxNodeHandler {
    pub fn new<T: NodeHandler>(handler: T) -> Self {
        Self {
            inner: Arc::new(handler),
        }
    }

    pub async fn handle(&self, ctx: &NodeContext, input: Value) -> Result<Value, HandlerError> {
        self.inner.handle_boxed(ctx, input).await
    }
}

impl std::fmt::Debug for BoxNodeHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BoxNodeHandler").finish_non_exhaustive()
    }
}

/// Handler built from an async closure. See [`handler_fn`].
pub struct FnHandler<F, I, O> {
    f: F,
    _types: PhantomData<fn(I) -> O>,
}

/// Wrap an async closure `(NodeContext, Input) -> Result<Output, HandlerError>`
/// as a [`NodeHandler`].
pub fn handler_fn<F, Fut, I, O>(f: F) -> FnHandler<F, I, O>
where
    F: Fn(NodeContext, I) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<O, HandlerError>> + Send + 'static,
    I: DeserializeOwned + Send + 'static,
    O: Serialize + Send + 'static,
{
    FnHandler {
        f,
        _types: PhantomData,
    }
}

impl<F, Fut, I, O> NodeHandler for FnHandler<F, I, O>
where
    F: Fn(NodeContext, I) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<O, HandlerError>> + Send + 'static,
    I: DeserializeOwned + Send + 'static,
    O: Serialize + Send + 'static,
{
    type Input = I;
    type Output = O;

    fn handle(
        &self,
        ctx: &NodeContext,
        input: I,
    ) -> impl Future<Output = Result<O, HandlerError>> + Send {
        (self.f)(ctx.clone(), input)
    }
}

// ---------------------------------------------------------------------------
// Node definition
// ---------------------------------------------------------------------------

type ResolverFn = dyn Fn(&ExecutionState) -> Result<Value, StateError> + Send + Sync;

/// Where a node's input comes from. Evaluated immediately before dispatch
/// and again on replay, so resolvers must be pure functions of state.
#[derive(Clone, Default)]
pub enum Input {
    /// `null`.
    #[default]
    None,
    Static(Value),
    /// Dotted path into state, e.g. `fetch.rows` or `trigger.user_id`.
    Path(String),
    Resolver(Arc<ResolverFn>),
}

impl Input {
    pub fn resolve(&self, state: &ExecutionState) -> Result<Value, StateError> {
        match self {
            Input::None => Ok(Value::Null),
            Input::Static(value) => Ok(value.clone()),
            Input::Path(path) => state.resolve_path(path).cloned(),
            Input::Resolver(f) => f(state),
        }
    }
}

impl std::fmt::Debug for Input {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Input::None => f.write_str("None"),
            Input::Static(v) => f.debug_tuple("Static").field(v).finish(),
            Input::Path(p) => f.debug_tuple("Path").field(p).finish(),
            Input::Resolver(_) => f.write_str("Resolver(..)"),
        }
    }
}

/// What happens once a node's retry budget is spent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "task", rename_all = "snake_case")]
pub enum ErrorHandler {
    /// Run an alternate task with the same input; on success its output
    /// becomes the step output and the enclosing block continues.
    Fallback(String),
    /// Run a cleanup task with `{ "input", "error" }`; the failure still
    /// propagates.
    Compensate(String),
    /// Restore the node's cursor to its run-start position; the failure
    /// still propagates.
    RollbackCursor,
}

impl ErrorHandler {
    pub fn task(&self) -> Option<&str> {
        match self {
            ErrorHandler::Fallback(task) | ErrorHandler::Compensate(task) => Some(task),
            ErrorHandler::RollbackCursor => None,
        }
    }
}

/// A named unit of work plus its execution policy.
#[derive(Debug, Clone)]
pub struct Node {
    pub name: String,
    /// Registered task that performs the work. Defaults to `name`.
    pub task: String,
    pub timeout: Option<Duration>,
    pub retry: RetryPolicy,
    pub input: Input,
    pub error_handler: Option<ErrorHandler>,
    /// Saga undo task, invoked during the compensation cascade.
    pub compensation: Option<String>,
    pub cursor: Option<CursorBinding>,
}

impl Node {
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            task: name.clone(),
            name,
            timeout: None,
            retry: RetryPolicy::default(),
            input: Input::None,
            error_handler: None,
            compensation: None,
            cursor: None,
        }
    }

    pub fn task(mut self, task: impl Into<String>) -> Self {
        self.task = task.into();
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn retry(mut self, policy: RetryPolicy) -> Self {
        self.retry = policy;
        self
    }

    pub fn input(mut self, input: Input) -> Self {
        self.input = input;
        self
    }

    pub fn input_static(self, value: Value) -> Self {
        self.input(Input::Static(value))
    }

    pub fn input_path(self, path: impl Into<String>) -> Self {
        self.input(Input::Path(path.into()))
    }

    pub fn resolve_input<F>(self, f: F) -> Self
    where
        F: Fn(&ExecutionState) -> Result<Value, StateError> + Send + Sync + 'static,
    {
        self.input(Input::Resolver(Arc::new(f)))
    }

    pub fn on_error(mut self, handler: ErrorHandler) -> Self {
        self.error_handler = Some(handler);
        self
    }

    pub fn compensate_with(mut self, task: impl Into<String>) -> Self {
        self.compensation = Some(task.into());
        self
    }

    pub fn cursor(mut self, binding: CursorBinding) -> Self {
        self.cursor = Some(binding);
        self
    }

    pub fn is_compensable(&self) -> bool {
        self.compensation.is_some()
    }

    /// Every task name this node may dispatch.
    pub fn task_names(&self) -> impl Iterator<Item = &str> {
        std::iter::once(self.task.as_str())
            .chain(self.error_handler.as_ref().and_then(ErrorHandler::task))
            .chain(self.compensation.as_deref())
    }
}

// ---------------------------------------------------------------------------
// Attempt loop
// ---------------------------------------------------------------------------

/// Identity of one node dispatch within a run.
pub(crate) struct Dispatch<'a> {
    pub run_id: Uuid,
    pub flow_name: &'a str,
    pub key: &'a str,
    pub timeout: Duration,
    pub cancel: &'a CancellationToken,
}

/// Run `node` through the substrate until it succeeds, fails with a
/// non-retryable error, or exhausts its retry budget.
///
/// Every transition is appended to `events`. Backoff waits go through the
/// substrate timer so they are cancellable.
pub(crate) async fn dispatch_with_retry<S: DurableSubstrate>(
    substrate: &S,
    node: &Node,
    input: &Value,
    dispatch: &Dispatch<'_>,
    events: &mut Vec<TraceEvent>,
) -> Result<Value, NodeError> {
    let mut attempt = 1;
    loop {
        events.push(node_event(dispatch.key, NodeState::Running, attempt, None));
        tracing::debug!(run_id = %dispatch.run_id, step = dispatch.key, attempt, "dispatching node");

        let request = TaskRequest {
            run_id: dispatch.run_id,
            flow_name: dispatch.flow_name.to_string(),
            step: dispatch.key.to_string(),
            task: node.task.clone(),
            input: input.clone(),
            attempt,
            timeout: dispatch.timeout,
            cancel: dispatch.cancel.clone(),
        };
        let error = match substrate.execute_task(request).await {
            Ok(output) => return Ok(output),
            Err(e) => NodeError::from_task(dispatch.key, e),
        };

        events.push(node_event(
            dispatch.key,
            NodeState::Failed,
            attempt,
            Some(error.to_string()),
        ));
        if !error.is_retryable() {
            return Err(error);
        }
        if !RetryHandler::should_retry(&node.retry, attempt) {
            return Err(NodeError::RetryExhausted {
                step: dispatch.key.to_string(),
                attempts: attempt,
                last: Box::new(error),
            });
        }

        let delay = RetryHandler::backoff(&node.retry, attempt);
        tracing::warn!(
            run_id = %dispatch.run_id,
            step = dispatch.key,
            attempt,
            max_attempts = node.retry.maximum_attempts,
            delay_ms = delay.as_millis() as u64,
            error = %error,
            "node attempt failed, retrying"
        );
        events.push(node_event(dispatch.key, NodeState::Retrying, attempt, None));

        let wake_at = wake_after(delay).ok_or_else(|| NodeError::DelayOutOfRange {
            step: dispatch.key.to_string(),
            delay,
        })?;
        substrate
            .start_timer(TimerRequest {
                run_id: dispatch.run_id,
                key: format!("{}#retry-{attempt}", dispatch.key),
                wake_at,
                cancel: dispatch.cancel.clone(),
            })
            .await
            .map_err(|e| NodeError::from_task(dispatch.key, e))?;
        attempt += 1;
    }
}

pub(crate) fn node_event(
    step: &str,
    state: NodeState,
    attempt: u32,
    error: Option<String>,
) -> TraceEvent {
    TraceEvent::Node {
        step: step.to_string(),
        state,
        attempt,
        error,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ctx() -> NodeContext {
        NodeContext {
            run_id: Uuid::now_v7(),
            flow_name: "f".to_string(),
            step: "s".to_string(),
            attempt: 1,
            cancel: CancellationToken::new(),
        }
    }

    #[derive(serde::Deserialize)]
    struct AddInput {
        a: i64,
        b: i64,
    }

    struct Add;

    impl NodeHandler for Add {
        type Input = AddInput;
        type Output = i64;

        async fn handle(&self, _ctx: &NodeContext, input: AddInput) -> Result<i64, HandlerError> {
            Ok(input.a + input.b)
        }
    }

    #[tokio::test]
    async fn typed_handler_through_box() {
        let boxed = BoxNodeHandler::new(Add);
        let out = boxed.handle(&ctx(), json!({ "a": 2, "b": 3 })).await.unwrap();
        assert_eq!(out, json!(5));
    }

    #[tokio::test]
    async fn bad_input_is_non_retryable() {
        let boxed = BoxNodeHandler::new(Add);
        let err = boxed.handle(&ctx(), json!("nope")).await.unwrap_err();
        assert!(!err.retryable);
        assert!(err.message.starts_with("invalid input"));
    }

    #[tokio::test]
    async fn closure_handler_sees_context() {
        let boxed = BoxNodeHandler::new(handler_fn(|ctx: NodeContext, name: String| async move {
            Ok::<_, HandlerError>(format!("{}:{}:{name}", ctx.step, ctx.attempt))
        }));
        let out = boxed.handle(&ctx(), json!("bob")).await.unwrap();
        assert_eq!(out, json!("s:1:bob"));
    }

    #[test]
    fn input_sources_resolve_against_state() {
        let mut state = ExecutionState::new(json!({ "id": 9 }));
        state.set("fetch", json!({ "rows": [1, 2] })).unwrap();

        assert_eq!(Input::None.resolve(&state).unwrap(), Value::Null);
        assert_eq!(Input::Path("trigger.id".into()).resolve(&state).unwrap(), json!(9));
        let resolver = Input::Resolver(Arc::new(|s: &ExecutionState| -> Result<Value, StateError> {
            let rows: Vec<i64> = s.resolve_as("fetch.rows")?;
            Ok(json!(rows.len()))
        }));
        assert_eq!(resolver.resolve(&state).unwrap(), json!(2));
        assert!(matches!(
            Input::Path("missing.x".into()).resolve(&state),
            Err(StateError::KeyNotFound(_))
        ));
    }

    #[test]
    fn task_names_cover_handlers() {
        let node = Node::new("charge")
            .task("payments.charge")
            .on_error(ErrorHandler::Fallback("payments.charge_backup".into()))
            .compensate_with("payments.refund");
        let names: Vec<&str> = node.task_names().collect();
        assert_eq!(
            names,
            vec!["payments.charge", "payments.charge_backup", "payments.refund"]
        );
        assert!(node.is_compensable());
        assert_eq!(Node::new("x").task_names().collect::<Vec<_>>(), vec!["x"]);
    }

    #[test]
    fn retryability() {
        let exec = |retryable| NodeError::Execution {
            step: "s".into(),
            message: "m".into(),
            retryable,
        };
        assert!(exec(true).is_retryable());
        assert!(!exec(false).is_retryable());
        assert!(NodeError::Timeout { step: "s".into(), timeout: Duration::from_secs(1) }.is_retryable());
        assert!(!NodeError::Cancelled { step: "s".into() }.is_retryable());
    }
}
