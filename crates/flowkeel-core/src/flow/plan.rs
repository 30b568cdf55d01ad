//! The compiled plan: an immutable tree of control steps.
//!
//! A [`Flow`] can only be obtained from the compiler, so every instance has
//! passed validation and its control-flow tree never changes afterwards.

use std::sync::Arc;
use std::time::Duration;

use flowkeel_types::flow::{TimerSpec, Trigger};
use serde::{Deserialize, Serialize};

use super::expression::{ExpressionError, PredicateEvaluator};
use super::node::Node;
use super::state::{ExecutionState, StateError};

// ---------------------------------------------------------------------------
// Predicate
// ---------------------------------------------------------------------------

type PredicateFn = dyn Fn(&ExecutionState) -> Result<bool, StateError> + Send + Sync;

#[derive(Debug, thiserror::Error)]
pub enum PredicateError {
    #[error(transparent)]
    State(#[from] StateError),

    #[error(transparent)]
    Expression(#[from] ExpressionError),
}

/// Guard for conditional and loop blocks.
///
/// Evaluated on every visit, including replays, so it must depend on
/// execution state only: no I/O, no clock reads.
#[derive(Clone)]
pub enum Predicate {
    /// Injected pure function.
    Function(Arc<PredicateFn>),
    /// JEXL expression over `steps.<name>.output` and `trigger`.
    Expression(String),
}

impl Predicate {
    pub fn function<F>(f: F) -> Self
    where
        F: Fn(&ExecutionState) -> Result<bool, StateError> + Send + Sync + 'static,
    {
        Predicate::Function(Arc::new(f))
    }

    pub fn expression(expr: impl Into<String>) -> Self {
        Predicate::Expression(expr.into())
    }

    pub fn evaluate(
        &self,
        state: &ExecutionState,
        evaluator: &PredicateEvaluator,
    ) -> Result<bool, PredicateError> {
        match self {
            Predicate::Function(f) => Ok(f(state)?),
            Predicate::Expression(expr) => Ok(evaluator.evaluate_in_state(expr, state)?),
        }
    }

    /// Printable form for outlines and logs.
    pub fn describe(&self) -> String {
        match self {
            Predicate::Function(_) => "<function>".to_string(),
            Predicate::Expression(expr) => expr.clone(),
        }
    }
}

impl std::fmt::Debug for Predicate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Predicate::Function(_) => f.write_str("Function(..)"),
            Predicate::Expression(expr) => f.debug_tuple("Expression").field(expr).finish(),
        }
    }
}

// ---------------------------------------------------------------------------
// Step
// ---------------------------------------------------------------------------

/// One element of a compiled plan.
#[derive(Debug, Clone)]
pub enum Step {
    Node(Node),
    Conditional {
        label: String,
        predicate: Predicate,
        body: Vec<Step>,
        otherwise: Vec<Step>,
    },
    Parallel {
        label: String,
        branches: Vec<Vec<Step>>,
    },
    Loop {
        label: String,
        predicate: Predicate,
        body: Vec<Step>,
        /// Per-block iteration cap, overriding the engine default.
        max_iterations: Option<u32>,
    },
    Timer {
        name: String,
        spec: TimerSpec,
    },
    /// Wait for the next signal of `signal` delivered to the run.
    Signal {
        name: String,
        signal: String,
        timeout: Option<Duration>,
    },
}

impl Step {
    /// Step name, or block label.
    pub fn name(&self) -> &str {
        match self {
            Step::Node(node) => &node.name,
            Step::Conditional { label, .. }
            | Step::Parallel { label, .. }
            | Step::Loop { label, .. } => label,
            Step::Timer { name, .. } | Step::Signal { name, .. } => name,
        }
    }

    fn outline(&self) -> OutlineStep {
        match self {
            Step::Node(node) => OutlineStep::Node {
                name: node.name.clone(),
                task: node.task.clone(),
                compensable: node.is_compensable(),
                cursor: node.cursor.as_ref().map(|c| c.source_id.clone()),
            },
            Step::Conditional {
                label,
                predicate,
                body,
                otherwise,
            } => OutlineStep::Conditional {
                label: label.clone(),
                predicate: predicate.describe(),
                body: outline_all(body),
                otherwise: outline_all(otherwise),
            },
            Step::Parallel { label, branches } => OutlineStep::Parallel {
                label: label.clone(),
                branches: branches.iter().map(|b| outline_all(b)).collect(),
            },
            Step::Loop {
                label,
                predicate,
                body,
                max_iterations,
            } => OutlineStep::Loop {
                label: label.clone(),
                predicate: predicate.describe(),
                max_iterations: *max_iterations,
                body: outline_all(body),
            },
            Step::Timer { name, spec } => OutlineStep::Timer {
                name: name.clone(),
                spec: spec.clone(),
            },
            Step::Signal {
                name,
                signal,
                timeout,
            } => OutlineStep::Signal {
                name: name.clone(),
                signal: signal.clone(),
                timeout_ms: timeout.map(|t| t.as_millis() as u64),
            },
        }
    }

    fn visit_nodes<'a>(&'a self, out: &mut Vec<&'a Node>) {
        match self {
            Step::Node(node) => out.push(node),
            Step::Conditional {
                body, otherwise, ..
            } => body.iter().chain(otherwise).for_each(|s| s.visit_nodes(out)),
            Step::Parallel { branches, .. } => branches
                .iter()
                .flatten()
                .for_each(|s| s.visit_nodes(out)),
            Step::Loop { body, .. } => body.iter().for_each(|s| s.visit_nodes(out)),
            Step::Timer { .. } | Step::Signal { .. } => {}
        }
    }
}

fn outline_all(steps: &[Step]) -> Vec<OutlineStep> {
    steps.iter().map(Step::outline).collect()
}

// ---------------------------------------------------------------------------
// Flow
// ---------------------------------------------------------------------------

pub(crate) struct FlowInner {
    pub name: String,
    pub trigger: Trigger,
    pub steps: Vec<Step>,
    pub schema: Arc<super::state::StateSchema>,
    pub timeout: Option<Duration>,
}

/// A compiled, frozen flow. Cloning is cheap and shares the plan.
#[derive(Clone)]
pub struct Flow {
    inner: Arc<FlowInner>,
}

impl Flow {
    pub(crate) fn from_parts(inner: FlowInner) -> Self {
        Self {
            inner: Arc::new(inner),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn trigger(&self) -> &Trigger {
        &self.inner.trigger
    }

    pub fn steps(&self) -> &[Step] {
        &self.inner.steps
    }

    pub fn schema(&self) -> &Arc<super::state::StateSchema> {
        &self.inner.schema
    }

    /// Run deadline declared by the flow, overriding the engine default.
    pub fn timeout(&self) -> Option<Duration> {
        self.inner.timeout
    }

    /// Every node in the plan, depth first in declaration order.
    pub fn nodes(&self) -> Vec<&Node> {
        let mut out = Vec::new();
        self.inner.steps.iter().for_each(|s| s.visit_nodes(&mut out));
        out
    }

    /// Every task name the flow may dispatch, deduplicated and sorted.
    pub fn task_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .nodes()
            .into_iter()
            .flat_map(|n| n.task_names().map(str::to_string).collect::<Vec<_>>())
            .collect();
        names.sort();
        names.dedup();
        names
    }

    pub fn outline(&self) -> PlanOutline {
        PlanOutline {
            name: self.inner.name.clone(),
            trigger: self.inner.trigger.clone(),
            steps: self.inner.steps.iter().map(Step::outline).collect(),
        }
    }
}

impl std::fmt::Debug for Flow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Flow")
            .field("name", &self.inner.name)
            .field("trigger", &self.inner.trigger)
            .field("steps", &self.inner.steps.len())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Outline
// ---------------------------------------------------------------------------

/// Serializable shape of a compiled flow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanOutline {
    pub name: String,
    pub trigger: Trigger,
    pub steps: Vec<OutlineStep>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum OutlineStep {
    Node {
        name: String,
        task: String,
        compensable: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        cursor: Option<String>,
    },
    Conditional {
        label: String,
        predicate: String,
        body: Vec<OutlineStep>,
        otherwise: Vec<OutlineStep>,
    },
    Parallel {
        label: String,
        branches: Vec<Vec<OutlineStep>>,
    },
    Loop {
        label: String,
        predicate: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        max_iterations: Option<u32>,
        body: Vec<OutlineStep>,
    },
    Timer {
        name: String,
        spec: TimerSpec,
    },
    Signal {
        name: String,
        signal: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timeout_ms: Option<u64>,
    },
}
