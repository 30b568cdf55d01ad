//! Worker/trigger adapter: binds compiled flows to their triggers.
//!
//! The [`NodeRegistry`] is an explicit object handed to the substrate; the
//! [`WorkerAdapter`] checks every flow against it at registration time and
//! routes manual starts, cron ticks, webhook requests, and signals to the
//! engine.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures_util::future::BoxFuture;
use flowkeel_types::flow::Trigger;
use serde_json::{Value, json};
use uuid::Uuid;

use crate::repository::FlowStore;

use super::engine::{EngineError, FlowEngine, RunOutcome};
use super::node::{BoxNodeHandler, NodeHandler};
use super::plan::Flow;
use super::scheduler::{self, CronCallback, CronScheduler, SchedulerError};
use super::substrate::DurableSubstrate;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum RegistrationError {
    #[error("task name must not be empty")]
    EmptyTaskName,

    #[error("task '{0}' is already registered")]
    DuplicateTask(String),

    #[error("flow '{flow}' uses unregistered task '{task}'")]
    UnknownTask { flow: String, task: String },

    #[error("flow '{0}' is already registered")]
    DuplicateFlow(String),

    #[error("{kind} trigger '{trigger_source}' is already bound to flow '{existing}'")]
    TriggerConflict {
        kind: &'static str,
        trigger_source: String,
        existing: String,
    },

    #[error(transparent)]
    Scheduler(#[from] SchedulerError),
}

#[derive(Debug, thiserror::Error)]
pub enum TriggerError {
    #[error("no flow is bound to {kind} trigger '{trigger_source}'")]
    UnknownTrigger {
        kind: &'static str,
        trigger_source: String,
    },

    #[error("flow '{0}' is not registered")]
    FlowNotRegistered(String),

    #[error("run {0} is not executing")]
    RunNotRunning(Uuid),

    #[error(transparent)]
    Scheduler(#[from] SchedulerError),

    #[error(transparent)]
    Engine(#[from] EngineError),
}

// ---------------------------------------------------------------------------
// NodeRegistry
// ---------------------------------------------------------------------------

/// Named node implementations available to a worker.
#[derive(Debug, Clone, Default)]
pub struct NodeRegistry {
    handlers: HashMap<String, BoxNodeHandler>,
}

impl NodeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler under a unique task name.
    pub fn register<H: NodeHandler>(
        &mut self,
        name: impl Into<String>,
        handler: H,
    ) -> Result<(), RegistrationError> {
        self.register_boxed(name, BoxNodeHandler::new(handler))
    }

    pub fn register_boxed(
        &mut self,
        name: impl Into<String>,
        handler: BoxNodeHandler,
    ) -> Result<(), RegistrationError> {
        let name = name.into();
        if name.trim().is_empty() {
            return Err(RegistrationError::EmptyTaskName);
        }
        if self.handlers.contains_key(&name) {
            return Err(RegistrationError::DuplicateTask(name));
        }
        tracing::debug!(task = name.as_str(), "registered node handler");
        self.handlers.insert(name, handler);
        Ok(())
    }

    /// Builder-style [`NodeRegistry::register`].
    pub fn with<H: NodeHandler>(
        mut self,
        name: impl Into<String>,
        handler: H,
    ) -> Result<Self, RegistrationError> {
        self.register(name, handler)?;
        Ok(self)
    }

    pub fn get(&self, name: &str) -> Option<BoxNodeHandler> {
        self.handlers.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    /// Registered task names, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

// ---------------------------------------------------------------------------
// WorkerAdapter
// ---------------------------------------------------------------------------

/// Result of delivering a signal.
#[derive(Debug)]
pub enum SignalDelivery {
    /// Queued for an executing run.
    Delivered(Uuid),
    /// No run was addressed; a new run of the bound flow was started with
    /// the signal queued for it.
    Started(Box<RunOutcome>),
}

/// Routes triggers to registered flows.
///
/// Indexes are keyed by trigger source: manual name, webhook path, and
/// signal name map to a flow name; scheduled flows map to their cron
/// expression.
pub struct WorkerAdapter<S: DurableSubstrate, R: FlowStore + 'static> {
    engine: Arc<FlowEngine<S, R>>,
    flows: DashMap<String, Flow>,
    manual: DashMap<String, String>,
    webhooks: DashMap<String, String>,
    signals: DashMap<String, String>,
    schedules: DashMap<String, String>,
    scheduler: CronScheduler,
    this: Weak<Self>,
}

impl<S: DurableSubstrate, R: FlowStore + 'static> WorkerAdapter<S, R> {
    pub fn new(engine: Arc<FlowEngine<S, R>>) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            engine,
            flows: DashMap::new(),
            manual: DashMap::new(),
            webhooks: DashMap::new(),
            signals: DashMap::new(),
            schedules: DashMap::new(),
            scheduler: CronScheduler::new(),
            this: this.clone(),
        })
    }

    pub fn engine(&self) -> &Arc<FlowEngine<S, R>> {
        &self.engine
    }

    pub fn flow(&self, name: &str) -> Option<Flow> {
        self.flows.get(name).map(|f| f.clone())
    }

    pub fn flow_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.flows.iter().map(|f| f.key().clone()).collect();
        names.sort();
        names
    }

    // -----------------------------------------------------------------------
    // Registration
    // -----------------------------------------------------------------------

    /// Register a compiled flow and bind its trigger.
    ///
    /// Every check runs before any index is touched, so a rejected flow
    /// leaves the adapter unchanged.
    pub async fn register_flow(&self, flow: Flow) -> Result<(), RegistrationError> {
        let name = flow.name().to_string();
        if self.flows.contains_key(&name) {
            return Err(RegistrationError::DuplicateFlow(name));
        }
        let substrate = self.engine.substrate();
        if let Some(task) = flow.task_names().into_iter().find(|t| !substrate.has_task(t)) {
            return Err(RegistrationError::UnknownTask { flow: name, task });
        }

        let trigger = flow.trigger().clone();
        if let Some(index) = self.index_for(&trigger) {
            if let Some(existing) = index.get(trigger.source()) {
                return Err(RegistrationError::TriggerConflict {
                    kind: trigger.kind(),
                    trigger_source: trigger.source().to_string(),
                    existing: existing.clone(),
                });
            }
        }
        if let Trigger::Schedule { cron } = &trigger {
            let expr = scheduler::normalize_schedule(cron)?;
            if self.scheduler.is_running().await {
                self.scheduler
                    .schedule_flow(&name, &expr, self.schedule_callback())
                    .await?;
            }
            self.schedules.insert(name.clone(), expr);
        }
        if let Some(index) = self.index_for(&trigger) {
            index.insert(trigger.source().to_string(), name.clone());
        }
        self.flows.insert(name.clone(), flow);

        tracing::info!(
            flow = name.as_str(),
            trigger = trigger.kind(),
            source = trigger.source(),
            "flow registered"
        );
        Ok(())
    }

    /// Remove a flow and its trigger binding. Returns `false` when the flow
    /// was not registered.
    pub async fn unregister_flow(&self, name: &str) -> bool {
        let Some((_, flow)) = self.flows.remove(name) else {
            return false;
        };
        let trigger = flow.trigger();
        if let Some(index) = self.index_for(trigger) {
            index.remove(trigger.source());
        }
        if self.schedules.remove(name).is_some() {
            if let Err(e) = self.scheduler.unschedule_flow(name).await {
                tracing::debug!(flow = name, error = %e, "no cron job to remove");
            }
        }
        tracing::info!(flow = name, "flow unregistered");
        true
    }

    fn index_for(&self, trigger: &Trigger) -> Option<&DashMap<String, String>> {
        match trigger {
            Trigger::Manual { .. } => Some(&self.manual),
            Trigger::Webhook { .. } => Some(&self.webhooks),
            Trigger::Signal { .. } => Some(&self.signals),
            Trigger::Schedule { .. } => None,
        }
    }

    fn bound_flow(
        &self,
        index: &DashMap<String, String>,
        kind: &'static str,
        source: &str,
    ) -> Result<Flow, TriggerError> {
        let flow_name = index
            .get(source)
            .map(|f| f.clone())
            .ok_or_else(|| TriggerError::UnknownTrigger {
                kind,
                trigger_source: source.to_string(),
            })?;
        self.flow(&flow_name)
            .ok_or(TriggerError::FlowNotRegistered(flow_name))
    }

    // -----------------------------------------------------------------------
    // Trigger entry points
    // -----------------------------------------------------------------------

    /// Start the flow bound to a manual trigger name.
    pub async fn start_manual(&self, name: &str, payload: Value) -> Result<RunOutcome, TriggerError> {
        let flow = self.bound_flow(&self.manual, "manual", name)?;
        Ok(self.engine.start(&flow, "manual", payload).await?)
    }

    /// Start one run for a schedule tick. Ticks are at-least-once; the
    /// flow is expected to be idempotent per tick (e.g. through cursors).
    pub async fn fire_schedule(
        &self,
        flow_name: &str,
        at: DateTime<Utc>,
    ) -> Result<RunOutcome, TriggerError> {
        let cron = self
            .schedules
            .get(flow_name)
            .map(|c| c.clone())
            .ok_or_else(|| TriggerError::UnknownTrigger {
                kind: "schedule",
                trigger_source: flow_name.to_string(),
            })?;
        let flow = self
            .flow(flow_name)
            .ok_or_else(|| TriggerError::FlowNotRegistered(flow_name.to_string()))?;

        self.scheduler.record_fire(flow_name, at).await;
        let payload = json!({ "scheduled_at": at.to_rfc3339(), "cron": cron });
        Ok(self.engine.start(&flow, "schedule", payload).await?)
    }

    /// Start one run with an accepted request body as the payload.
    /// Authentication happens before this call.
    pub async fn handle_webhook(&self, path: &str, body: Value) -> Result<RunOutcome, TriggerError> {
        let flow = self.bound_flow(&self.webhooks, "webhook", path)?;
        Ok(self.engine.start(&flow, "webhook", body).await?)
    }

    /// Deliver a named signal.
    ///
    /// With a run id the payload is queued for that executing run. Without
    /// one, the flow bound to the signal name is started with the payload as
    /// its trigger, and the signal is queued for the new run before it
    /// begins so a waiting step sees it first.
    pub async fn signal(
        &self,
        name: &str,
        payload: Value,
        run_id: Option<Uuid>,
    ) -> Result<SignalDelivery, TriggerError> {
        let substrate = self.engine.substrate();
        if let Some(run_id) = run_id {
            if !self.engine.is_running(run_id) {
                return Err(TriggerError::RunNotRunning(run_id));
            }
            substrate.send_signal(run_id, name, payload).await;
            return Ok(SignalDelivery::Delivered(run_id));
        }

        let flow = self.bound_flow(&self.signals, "signal", name)?;
        let run_id = Uuid::now_v7();
        substrate.send_signal(run_id, name, payload.clone()).await;
        let outcome = self
            .engine
            .start_with_id(&flow, run_id, "signal", payload)
            .await?;
        Ok(SignalDelivery::Started(Box::new(outcome)))
    }

    // -----------------------------------------------------------------------
    // Scheduler
    // -----------------------------------------------------------------------

    fn schedule_callback(&self) -> CronCallback {
        let this = self.this.clone();
        Arc::new(move |flow_name: String, at: DateTime<Utc>| -> BoxFuture<'static, ()> {
            let this = this.clone();
            Box::pin(async move {
                let Some(adapter) = this.upgrade() else {
                    return;
                };
                match adapter.fire_schedule(&flow_name, at).await {
                    Ok(outcome) => tracing::debug!(
                        flow = flow_name.as_str(),
                        run_id = %outcome.run_id,
                        status = outcome.status.as_str(),
                        "scheduled run finished"
                    ),
                    Err(e) => tracing::warn!(
                        flow = flow_name.as_str(),
                        error = %e,
                        "scheduled run failed to start"
                    ),
                }
            })
        })
    }

    /// Start the cron scheduler and add a job for every scheduled flow.
    pub async fn start_scheduler(&self) -> Result<(), TriggerError> {
        self.scheduler.start().await?;
        let scheduled: Vec<(String, String)> = self
            .schedules
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();
        for (flow_name, expr) in scheduled {
            self.scheduler
                .schedule_flow(&flow_name, &expr, self.schedule_callback())
                .await?;
        }
        Ok(())
    }

    pub async fn stop_scheduler(&self) -> Result<(), TriggerError> {
        Ok(self.scheduler.stop().await?)
    }

    pub async fn scheduler_running(&self) -> bool {
        self.scheduler.is_running().await
    }

    /// Ticks of a scheduled flow that fell between its last fire and now.
    ///
    /// `last_fired` overrides the scheduler's own record; with neither, no
    /// ticks are reported.
    pub async fn missed_ticks(
        &self,
        flow_name: &str,
        last_fired: Option<DateTime<Utc>>,
    ) -> Result<Vec<DateTime<Utc>>, TriggerError> {
        let cron = self
            .schedules
            .get(flow_name)
            .map(|c| c.clone())
            .ok_or_else(|| TriggerError::UnknownTrigger {
                kind: "schedule",
                trigger_source: flow_name.to_string(),
            })?;
        let since = match last_fired {
            Some(at) => Some(at),
            None => self.scheduler.last_fired(flow_name).await,
        };
        Ok(since
            .map(|since| scheduler::missed_ticks(&cron, since, Utc::now()))
            .unwrap_or_default())
    }

    /// Fire every missed tick in order, one run per tick.
    pub async fn catch_up(
        &self,
        flow_name: &str,
        last_fired: Option<DateTime<Utc>>,
    ) -> Result<Vec<RunOutcome>, TriggerError> {
        let ticks = self.missed_ticks(flow_name, last_fired).await?;
        if !ticks.is_empty() {
            tracing::info!(flow = flow_name, missed = ticks.len(), "catching up missed ticks");
        }
        let mut outcomes = Vec::with_capacity(ticks.len());
        for at in ticks {
            outcomes.push(self.fire_schedule(flow_name, at).await?);
        }
        Ok(outcomes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow::builder::FlowBuilder;
    use crate::flow::node::{HandlerError, Node, handler_fn};
    use crate::flow::substrate::LocalSubstrate;
    use crate::repository::InMemoryFlowStore;
    use chrono::TimeZone;
    use flowkeel_types::config::EngineConfig;
    use flowkeel_types::event::FlowEvent;
    use flowkeel_types::run::RunStatus;

    type Adapter = WorkerAdapter<LocalSubstrate, InMemoryFlowStore>;

    fn registry() -> NodeRegistry {
        NodeRegistry::new()
            .with(
                "echo",
                handler_fn(|_ctx, input: Value| async move { Ok::<_, HandlerError>(input) }),
            )
            .unwrap()
            .with(
                "noop",
                handler_fn(|_ctx, _: Value| async move { Ok::<_, HandlerError>(json!(null)) }),
            )
            .unwrap()
    }

    fn adapter() -> Arc<Adapter> {
        let engine = FlowEngine::new(
            Arc::new(LocalSubstrate::new(registry())),
            Arc::new(InMemoryFlowStore::new()),
            EngineConfig::default(),
        );
        WorkerAdapter::new(Arc::new(engine))
    }

    fn echo_flow(name: &str, builder: FlowBuilder) -> Flow {
        builder
            .step(Node::new("echo").input_path("trigger"))
            .build()
            .unwrap_or_else(|e| panic!("flow {name} failed to compile: {e}"))
    }

    // -------------------------------------------------------------------
    // Registry
    // -------------------------------------------------------------------

    #[test]
    fn registry_rejects_duplicates_and_empty_names() {
        let mut registry = registry();
        let dup = registry.register(
            "echo",
            handler_fn(|_ctx, v: Value| async move { Ok::<_, HandlerError>(v) }),
        );
        assert!(matches!(dup, Err(RegistrationError::DuplicateTask(name)) if name == "echo"));
        let empty = registry.register(
            " ",
            handler_fn(|_ctx, v: Value| async move { Ok::<_, HandlerError>(v) }),
        );
        assert!(matches!(empty, Err(RegistrationError::EmptyTaskName)));
        assert_eq!(registry.names(), vec!["echo", "noop"]);
        assert!(registry.get("echo").is_some());
        assert!(!registry.contains("missing"));
    }

    // -------------------------------------------------------------------
    // Registration
    // -------------------------------------------------------------------

    #[tokio::test]
    async fn unknown_task_fails_fast_without_binding() {
        let adapter = adapter();
        let flow = FlowBuilder::new("broken")
            .manual("broken")
            .step(Node::new("echo"))
            .step(Node::new("ship").compensate_with("unship"))
            .build()
            .unwrap();

        let err = adapter.register_flow(flow).await.unwrap_err();
        assert!(matches!(
            err,
            RegistrationError::UnknownTask { ref task, .. } if task == "ship"
        ));
        assert!(adapter.flow_names().is_empty());
        assert!(matches!(
            adapter.start_manual("broken", json!({})).await,
            Err(TriggerError::UnknownTrigger { kind: "manual", ref trigger_source })
                if trigger_source == "broken"
        ));
    }

    #[tokio::test]
    async fn conflicting_trigger_is_rejected() {
        let adapter = adapter();
        adapter
            .register_flow(echo_flow("a", FlowBuilder::new("a").webhook("/hooks/in")))
            .await
            .unwrap();
        let err = adapter
            .register_flow(echo_flow("b", FlowBuilder::new("b").webhook("/hooks/in")))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            RegistrationError::TriggerConflict { kind: "webhook", ref existing, .. } if existing == "a"
        ));
        assert_eq!(
            err.to_string(),
            "webhook trigger '/hooks/in' is already bound to flow 'a'"
        );
        assert!(matches!(
            adapter
                .register_flow(echo_flow("a", FlowBuilder::new("a").manual("other")))
                .await,
            Err(RegistrationError::DuplicateFlow(_))
        ));
    }

    #[tokio::test]
    async fn unregister_frees_the_trigger() {
        let adapter = adapter();
        adapter
            .register_flow(echo_flow("m", FlowBuilder::new("m").manual("go")))
            .await
            .unwrap();
        assert!(adapter.unregister_flow("m").await);
        assert!(!adapter.unregister_flow("m").await);
        adapter
            .register_flow(echo_flow("n", FlowBuilder::new("n").manual("go")))
            .await
            .unwrap();
        assert_eq!(adapter.flow_names(), vec!["n".to_string()]);
    }

    // -------------------------------------------------------------------
    // Triggers
    // -------------------------------------------------------------------

    #[tokio::test]
    async fn manual_and_webhook_payloads_become_trigger() {
        let adapter = adapter();
        adapter
            .register_flow(echo_flow("m", FlowBuilder::new("m").manual("go")))
            .await
            .unwrap();
        adapter
            .register_flow(echo_flow("w", FlowBuilder::new("w").webhook("/hooks/sync")))
            .await
            .unwrap();

        let outcome = adapter.start_manual("go", json!({ "user": 7 })).await.unwrap();
        assert_eq!(outcome.status, RunStatus::Completed);
        assert_eq!(outcome.state.get_value("echo").unwrap()["user"], 7);

        let outcome = adapter
            .handle_webhook("/hooks/sync", json!({ "action": "opened" }))
            .await
            .unwrap();
        assert_eq!(outcome.flow_name, "w");
        assert_eq!(outcome.state.get_value("echo").unwrap()["action"], "opened");

        assert!(matches!(
            adapter.handle_webhook("/hooks/none", json!({})).await,
            Err(TriggerError::UnknownTrigger { kind: "webhook", .. })
        ));
    }

    #[tokio::test]
    async fn fire_schedule_passes_tick_metadata() {
        let adapter = adapter();
        adapter
            .register_flow(echo_flow("nightly", FlowBuilder::new("nightly").schedule("0 2 * * *")))
            .await
            .unwrap();
        let at = Utc.with_ymd_and_hms(2024, 3, 1, 2, 0, 0).unwrap();

        let outcome = adapter.fire_schedule("nightly", at).await.unwrap();
        let payload = outcome.state.get_value("echo").unwrap();
        assert_eq!(payload["scheduled_at"], at.to_rfc3339());
        assert!(payload["cron"].as_str().unwrap().contains("0 2 * * *"));
        assert!(matches!(
            adapter.fire_schedule("unknown", at).await,
            Err(TriggerError::UnknownTrigger { kind: "schedule", .. })
        ));
    }

    #[tokio::test]
    async fn missed_ticks_between_last_fire_and_now() {
        let adapter = adapter();
        adapter
            .register_flow(echo_flow("hourly", FlowBuilder::new("hourly").schedule("hourly")))
            .await
            .unwrap();
        assert!(adapter.missed_ticks("hourly", None).await.unwrap().is_empty());

        let since = Utc::now() - chrono::Duration::minutes(150);
        let ticks = adapter.missed_ticks("hourly", Some(since)).await.unwrap();
        assert!((2..=3).contains(&ticks.len()));
        assert!(ticks.windows(2).all(|w| w[0] < w[1]));
    }

    #[tokio::test]
    async fn signal_with_start_queues_signal_for_new_run() {
        let adapter = adapter();
        let flow = FlowBuilder::new("orders")
            .on_signal("order-placed")
            .wait_for_signal("order", "order-placed", None)
            .step(Node::new("echo").input_path("order.id"))
            .build()
            .unwrap();
        adapter.register_flow(flow).await.unwrap();

        let delivery = adapter
            .signal("order-placed", json!({ "id": 42 }), None)
            .await
            .unwrap();
        let SignalDelivery::Started(outcome) = delivery else {
            panic!("expected a new run");
        };
        assert_eq!(outcome.status, RunStatus::Completed);
        assert_eq!(outcome.state.get::<i64>("echo").unwrap(), 42);
    }

    #[tokio::test]
    async fn signal_reaches_running_run() {
        let adapter = adapter();
        let flow = FlowBuilder::new("approval")
            .manual("approval")
            .wait_for_signal("decision", "approve", None)
            .build()
            .unwrap();
        adapter.register_flow(flow).await.unwrap();
        let mut events = adapter.engine().subscribe();

        let runner = Arc::clone(&adapter);
        let run = tokio::spawn(async move { runner.start_manual("approval", json!({})).await });

        let run_id = loop {
            if let FlowEvent::RunStarted { run_id, .. } = events.recv().await.unwrap() {
                break run_id;
            }
        };
        let delivery = adapter
            .signal("approve", json!({ "by": "ops" }), Some(run_id))
            .await
            .unwrap();
        assert!(matches!(delivery, SignalDelivery::Delivered(id) if id == run_id));

        let outcome = run.await.unwrap().unwrap();
        assert_eq!(outcome.state.get_value("decision").unwrap()["by"], "ops");
        assert!(matches!(
            adapter.signal("approve", json!({}), Some(run_id)).await,
            Err(TriggerError::RunNotRunning(_))
        ));
    }
}
