//! Fluent sugar over [`BuilderOp`] lists.
//!
//! The builder only records operations; all validation happens in
//! [`compile`] when [`FlowBuilder::build`] is called.

use std::time::Duration;

use chrono::{DateTime, Utc};
use flowkeel_types::flow::{TimerSpec, Trigger};

use super::compiler::{BuilderOp, ValidationError, compile};
use super::node::Node;
use super::plan::{Flow, Predicate};
use super::state::StateSchema;

/// Records builder calls for one flow.
#[derive(Debug, Clone)]
pub struct FlowBuilder {
    name: String,
    ops: Vec<BuilderOp>,
}

impl FlowBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ops: Vec::new(),
        }
    }

    fn op(mut self, op: BuilderOp) -> Self {
        self.ops.push(op);
        self
    }

    // -----------------------------------------------------------------------
    // Triggers
    // -----------------------------------------------------------------------

    pub fn trigger(self, trigger: Trigger) -> Self {
        self.op(BuilderOp::Trigger(trigger))
    }

    pub fn manual(self, name: impl Into<String>) -> Self {
        self.trigger(Trigger::Manual { name: name.into() })
    }

    pub fn schedule(self, cron: impl Into<String>) -> Self {
        self.trigger(Trigger::Schedule { cron: cron.into() })
    }

    pub fn webhook(self, path: impl Into<String>) -> Self {
        self.trigger(Trigger::Webhook { path: path.into() })
    }

    pub fn on_signal(self, name: impl Into<String>) -> Self {
        self.trigger(Trigger::Signal { name: name.into() })
    }

    // -----------------------------------------------------------------------
    // Steps
    // -----------------------------------------------------------------------

    pub fn step(self, node: Node) -> Self {
        self.op(BuilderOp::Step(node))
    }

    pub fn sleep(self, name: impl Into<String>, duration: Duration) -> Self {
        self.op(BuilderOp::Timer {
            name: name.into(),
            spec: TimerSpec::Duration(duration),
        })
    }

    pub fn sleep_until(self, name: impl Into<String>, deadline: DateTime<Utc>) -> Self {
        self.op(BuilderOp::Timer {
            name: name.into(),
            spec: TimerSpec::Deadline(deadline),
        })
    }

    pub fn wait_for_signal(
        self,
        name: impl Into<String>,
        signal: impl Into<String>,
        timeout: Option<Duration>,
    ) -> Self {
        self.op(BuilderOp::WaitSignal {
            name: name.into(),
            signal: signal.into(),
            timeout,
        })
    }

    // -----------------------------------------------------------------------
    // Blocks
    // -----------------------------------------------------------------------

    pub fn when(self, predicate: Predicate) -> Self {
        self.op(BuilderOp::If {
            label: None,
            predicate,
        })
    }

    pub fn when_labeled(self, label: impl Into<String>, predicate: Predicate) -> Self {
        self.op(BuilderOp::If {
            label: Some(label.into()),
            predicate,
        })
    }

    pub fn otherwise(self) -> Self {
        self.op(BuilderOp::Otherwise)
    }

    pub fn parallel(self) -> Self {
        self.op(BuilderOp::Parallel { label: None })
    }

    pub fn parallel_labeled(self, label: impl Into<String>) -> Self {
        self.op(BuilderOp::Parallel {
            label: Some(label.into()),
        })
    }

    pub fn branch(self) -> Self {
        self.op(BuilderOp::Branch)
    }

    pub fn repeat_while(self, predicate: Predicate) -> Self {
        self.op(BuilderOp::Loop {
            label: None,
            predicate,
            max_iterations: None,
        })
    }

    pub fn repeat_while_at_most(self, predicate: Predicate, max_iterations: u32) -> Self {
        self.op(BuilderOp::Loop {
            label: None,
            predicate,
            max_iterations: Some(max_iterations),
        })
    }

    pub fn end(self) -> Self {
        self.op(BuilderOp::End)
    }

    // -----------------------------------------------------------------------
    // Flow-level settings
    // -----------------------------------------------------------------------

    pub fn schema(self, schema: StateSchema) -> Self {
        self.op(BuilderOp::Schema(schema))
    }

    pub fn timeout(self, timeout: Duration) -> Self {
        self.op(BuilderOp::Timeout(timeout))
    }

    pub fn ops(&self) -> &[BuilderOp] {
        &self.ops
    }

    pub fn build(self) -> Result<Flow, ValidationError> {
        compile(&self.name, self.ops)
    }
}
