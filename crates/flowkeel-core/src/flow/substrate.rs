//! Durable substrate contract and the in-process implementation.
//!
//! The engine never runs handlers itself: every attempt, timer, and signal
//! wait goes through a [`DurableSubstrate`]. [`LocalSubstrate`] runs
//! handlers from a [`NodeRegistry`] on the tokio worker pool.

use std::collections::VecDeque;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::{Mutex, Notify};
use tokio::task::AbortHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::node::{HandlerError, NodeContext};
use super::worker::NodeRegistry;

/// One attempt of one task.
#[derive(Debug, Clone)]
pub struct TaskRequest {
    pub run_id: Uuid,
    pub flow_name: String,
    /// State key of the step being executed.
    pub step: String,
    pub task: String,
    pub input: Value,
    /// 1-based attempt number.
    pub attempt: u32,
    pub timeout: Duration,
    pub cancel: CancellationToken,
}

/// The instant `delay` from now, or `None` when it falls outside the range
/// chrono can represent.
pub fn wake_after(delay: Duration) -> Option<DateTime<Utc>> {
    chrono::Duration::from_std(delay)
        .ok()
        .and_then(|delay| Utc::now().checked_add_signed(delay))
}

/// A one-shot wake-up at an absolute instant.
#[derive(Debug, Clone)]
pub struct TimerRequest {
    pub run_id: Uuid,
    pub key: String,
    pub wake_at: DateTime<Utc>,
    pub cancel: CancellationToken,
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum TaskError {
    #[error("task '{0}' is not registered")]
    UnknownTask(String),

    #[error("{0}")]
    Failed(HandlerError),

    #[error("attempt timed out after {0:?}")]
    TimedOut(Duration),

    #[error("handler panicked: {0}")]
    Panicked(String),

    #[error("cancelled")]
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SignalError {
    #[error("no '{signal}' signal arrived within {timeout:?}")]
    Timeout { signal: String, timeout: Duration },

    #[error("cancelled while waiting for '{0}'")]
    Cancelled(String),
}

/// The execution substrate a flow engine runs against.
///
/// Uses native async fn in traits (Rust 2024 edition, no async_trait macro).
pub trait DurableSubstrate: Send + Sync + 'static {
    /// Execute one attempt of a task, bounded by `request.timeout`.
    fn execute_task(
        &self,
        request: TaskRequest,
    ) -> impl Future<Output = Result<Value, TaskError>> + Send;

    /// Resolve once `wake_at` has passed. Fails only on cancellation.
    fn start_timer(&self, timer: TimerRequest) -> impl Future<Output = Result<(), TaskError>> + Send;

    /// Queue a signal for a run. Signals of the same name are delivered in
    /// send order; a run need not exist yet.
    fn send_signal(
        &self,
        run_id: Uuid,
        name: &str,
        payload: Value,
    ) -> impl Future<Output = ()> + Send;

    /// Take the next queued signal of `name` for a run, waiting up to
    /// `timeout` (forever when `None`).
    fn receive_signal(
        &self,
        run_id: Uuid,
        name: &str,
        timeout: Option<Duration>,
        cancel: &CancellationToken,
    ) -> impl Future<Output = Result<Value, SignalError>> + Send;

    /// Whether a task name can be dispatched.
    fn has_task(&self, task: &str) -> bool;

    /// Drop per-run bookkeeping once a run has finished.
    fn release_run(&self, _run_id: Uuid) {}
}

// ---------------------------------------------------------------------------
// LocalSubstrate
// ---------------------------------------------------------------------------

#[derive(Default)]
struct SignalQueue {
    items: Mutex<VecDeque<Value>>,
    notify: Notify,
}

/// Aborts the spawned handler when the awaiting future goes away.
struct AbortOnDrop(AbortHandle);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// In-process substrate: handlers run on `tokio::spawn`, timers on
/// `tokio::time`, signals in per-run FIFO queues.
pub struct LocalSubstrate {
    registry: NodeRegistry,
    signals: DashMap<(Uuid, String), Arc<SignalQueue>>,
}

impl LocalSubstrate {
    pub fn new(registry: NodeRegistry) -> Self {
        Self {
            registry,
            signals: DashMap::new(),
        }
    }

    pub fn registry(&self) -> &NodeRegistry {
        &self.registry
    }

    fn queue(&self, run_id: Uuid, name: &str) -> Arc<SignalQueue> {
        self.signals
            .entry((run_id, name.to_string()))
            .or_default()
            .clone()
    }

    /// Number of undelivered signals of `name` for a run.
    pub async fn pending_signals(&self, run_id: Uuid, name: &str) -> usize {
        let queue = self
            .signals
            .get(&(run_id, name.to_string()))
            .map(|q| Arc::clone(q.value()));
        match queue {
            Some(queue) => queue.items.lock().await.len(),
            None => 0,
        }
    }
}

impl DurableSubstrate for LocalSubstrate {
    async fn execute_task(&self, request: TaskRequest) -> Result<Value, TaskError> {
        let handler = self
            .registry
            .get(&request.task)
            .ok_or_else(|| TaskError::UnknownTask(request.task.clone()))?;

        let ctx = NodeContext {
            run_id: request.run_id,
            flow_name: request.flow_name,
            step: request.step,
            attempt: request.attempt,
            cancel: request.cancel.clone(),
        };
        let input = request.input;
        let handle = tokio::spawn(async move { handler.handle(&ctx, input).await });
        let _guard = AbortOnDrop(handle.abort_handle());

        tokio::select! {
            joined = tokio::time::timeout(request.timeout, handle) => match joined {
                Err(_) => Err(TaskError::TimedOut(request.timeout)),
                Ok(Err(join_err)) => Err(TaskError::Panicked(join_err.to_string())),
                Ok(Ok(result)) => result.map_err(TaskError::Failed),
            },
            _ = request.cancel.cancelled() => Err(TaskError::Cancelled),
        }
    }

    async fn start_timer(&self, timer: TimerRequest) -> Result<(), TaskError> {
        let remaining = (timer.wake_at - Utc::now()).to_std().unwrap_or(Duration::ZERO);
        tokio::select! {
            _ = tokio::time::sleep(remaining) => Ok(()),
            _ = timer.cancel.cancelled() => Err(TaskError::Cancelled),
        }
    }

    async fn send_signal(&self, run_id: Uuid, name: &str, payload: Value) {
        let queue = self.queue(run_id, name);
        queue.items.lock().await.push_back(payload);
        queue.notify.notify_one();
        tracing::debug!(run_id = %run_id, signal = name, "signal queued");
    }

    async fn receive_signal(
        &self,
        run_id: Uuid,
        name: &str,
        timeout: Option<Duration>,
        cancel: &CancellationToken,
    ) -> Result<Value, SignalError> {
        let queue = self.queue(run_id, name);
        let deadline = timeout.map(|t| tokio::time::Instant::now() + t);

        loop {
            if let Some(payload) = queue.items.lock().await.pop_front() {
                return Ok(payload);
            }
            let expired = async {
                match deadline {
                    Some(at) => tokio::time::sleep_until(at).await,
                    None => std::future::pending::<()>().await,
                }
            };
            tokio::select! {
                _ = queue.notify.notified() => continue,
                _ = cancel.cancelled() => return Err(SignalError::Cancelled(name.to_string())),
                _ = expired => {
                    return Err(SignalError::Timeout {
                        signal: name.to_string(),
                        timeout: timeout.unwrap_or_default(),
                    });
                }
            }
        }
    }

    fn has_task(&self, task: &str) -> bool {
        self.registry.contains(task)
    }

    fn release_run(&self, run_id: Uuid) {
        self.signals.retain(|(id, _), _| *id != run_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow::node::handler_fn;
    use serde_json::json;

    fn request(task: &str, timeout: Duration) -> TaskRequest {
        TaskRequest {
            run_id: Uuid::now_v7(),
            flow_name: "f".to_string(),
            step: "s".to_string(),
            task: task.to_string(),
            input: json!(2),
            attempt: 1,
            timeout,
            cancel: CancellationToken::new(),
        }
    }

    fn substrate() -> LocalSubstrate {
        let mut registry = NodeRegistry::new();
        registry
            .register("double", handler_fn(|_ctx, n: i64| async move { Ok::<_, HandlerError>(n * 2) }))
            .unwrap();
        registry
            .register(
                "slow",
                handler_fn(|_ctx, _: Value| async move {
                    tokio::time::sleep(Duration::from_secs(60)).await;
                    Ok::<_, HandlerError>(json!(null))
                }),
            )
            .unwrap();
        registry
            .register(
                "panics",
                handler_fn(|_ctx, _: Value| async move {
                    if true {
                        panic!("boom");
                    }
                    Ok::<_, HandlerError>(json!(null))
                }),
            )
            .unwrap();
        LocalSubstrate::new(registry)
    }

    #[test]
    fn wake_after_rejects_unrepresentable_delays() {
        let soon = wake_after(Duration::from_secs(60)).unwrap();
        assert!(soon > Utc::now());
        assert!(wake_after(Duration::MAX).is_none());
    }

    #[tokio::test]
    async fn executes_registered_task() {
        let out = substrate()
            .execute_task(request("double", Duration::from_secs(1)))
            .await
            .unwrap();
        assert_eq!(out, json!(4));
    }

    #[tokio::test]
    async fn unknown_task() {
        let err = substrate()
            .execute_task(request("missing", Duration::from_secs(1)))
            .await
            .unwrap_err();
        assert_eq!(err, TaskError::UnknownTask("missing".to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn attempt_times_out() {
        let err = substrate()
            .execute_task(request("slow", Duration::from_secs(5)))
            .await
            .unwrap_err();
        assert_eq!(err, TaskError::TimedOut(Duration::from_secs(5)));
    }

    #[tokio::test]
    async fn panic_becomes_task_error() {
        let err = substrate()
            .execute_task(request("panics", Duration::from_secs(1)))
            .await
            .unwrap_err();
        assert!(matches!(err, TaskError::Panicked(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_interrupts_attempt() {
        let substrate = substrate();
        let req = request("slow", Duration::from_secs(600));
        let cancel = req.cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            cancel.cancel();
        });
        assert_eq!(
            substrate.execute_task(req).await.unwrap_err(),
            TaskError::Cancelled
        );
    }

    #[tokio::test(start_paused = true)]
    async fn timer_fires_after_deadline_and_can_be_cancelled() {
        let substrate = substrate();
        let run_id = Uuid::now_v7();
        let started = tokio::time::Instant::now();
        substrate
            .start_timer(TimerRequest {
                run_id,
                key: "wait".to_string(),
                wake_at: Utc::now() + chrono::Duration::seconds(30),
                cancel: CancellationToken::new(),
            })
            .await
            .unwrap();
        assert!(started.elapsed() >= Duration::from_secs(29));

        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = substrate
            .start_timer(TimerRequest {
                run_id,
                key: "wait-2".to_string(),
                wake_at: Utc::now() + chrono::Duration::hours(1),
                cancel,
            })
            .await
            .unwrap_err();
        assert_eq!(err, TaskError::Cancelled);
    }

    #[tokio::test]
    async fn signals_queue_in_delivery_order() {
        let substrate = substrate();
        let run_id = Uuid::now_v7();
        let cancel = CancellationToken::new();
        substrate.send_signal(run_id, "approve", json!(1)).await;
        substrate.send_signal(run_id, "approve", json!(2)).await;
        substrate.send_signal(Uuid::now_v7(), "approve", json!(99)).await;

        assert_eq!(substrate.pending_signals(run_id, "approve").await, 2);
        let first = substrate.receive_signal(run_id, "approve", None, &cancel).await.unwrap();
        let second = substrate.receive_signal(run_id, "approve", None, &cancel).await.unwrap();
        assert_eq!((first, second), (json!(1), json!(2)));
    }

    #[tokio::test]
    async fn receive_waits_for_later_signal() {
        let substrate = Arc::new(substrate());
        let run_id = Uuid::now_v7();
        let sender = substrate.clone();
        tokio::spawn(async move {
            tokio::task::yield_now().await;
            sender.send_signal(run_id, "go", json!("now")).await;
        });

        let got = substrate
            .receive_signal(run_id, "go", Some(Duration::from_secs(5)), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(got, json!("now"));
    }

    #[tokio::test(start_paused = true)]
    async fn receive_times_out() {
        let err = substrate()
            .receive_signal(
                Uuid::now_v7(),
                "never",
                Some(Duration::from_secs(10)),
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, SignalError::Timeout { .. }));
    }

    #[tokio::test]
    async fn release_run_drops_queues() {
        let substrate = substrate();
        let run_id = Uuid::now_v7();
        substrate.send_signal(run_id, "x", json!(1)).await;
        substrate.release_run(run_id);
        assert_eq!(substrate.pending_signals(run_id, "x").await, 0);
    }
}
