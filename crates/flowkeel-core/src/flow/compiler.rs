//! Flow compiler: an ordered list of builder operations to a frozen plan.
//!
//! Blocks open with `If`/`Parallel`/`Loop` and close with `End`; the
//! compiler keeps a stack of open frames and folds each closed frame into
//! its parent. Every check runs before a [`Flow`] exists, so a flow that
//! compiled can always be registered and executed.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use flowkeel_types::flow::{TimerSpec, Trigger};

use super::node::{ErrorHandler, Node};
use super::plan::{Flow, FlowInner, Predicate, Step};
use super::retry::RetryHandler;
use super::scheduler::normalize_schedule;
use super::state::{ITERATION_SEPARATOR, StateSchema, TRIGGER_ROOT};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ValidationError {
    #[error("invalid flow name '{0}' (alphanumeric, '-' and '_' only)")]
    InvalidFlowName(String),

    #[error("flow declares no trigger")]
    MissingTrigger,

    #[error("flow declares more than one trigger")]
    MultipleTriggers,

    #[error("invalid trigger: {0}")]
    InvalidTrigger(String),

    #[error("flow has no steps")]
    EmptyFlow,

    #[error("invalid step name '{0}' (alphanumeric, '-' and '_' only)")]
    InvalidStepName(String),

    #[error("'{0}' is reserved and cannot name a step")]
    ReservedName(String),

    #[error("duplicate step name '{0}'")]
    DuplicateName(String),

    #[error("invalid retry policy on '{step}': {reason}")]
    InvalidRetryPolicy { step: String, reason: String },

    #[error("timeout of '{0}' must be greater than zero")]
    InvalidTimeout(String),

    #[error("invalid cursor binding on '{step}': {reason}")]
    InvalidCursor { step: String, reason: String },

    #[error("block '{0}' has an empty body")]
    EmptyBlock(String),

    #[error("branch {index} of parallel block '{label}' is empty")]
    EmptyBranch { label: String, index: usize },

    #[error("block '{0}' is never closed")]
    UnclosedBlock(String),

    #[error("'end' without an open block")]
    UnmatchedEnd,

    #[error("'otherwise' outside a conditional block")]
    MisplacedOtherwise,

    #[error("conditional block '{0}' has more than one 'otherwise'")]
    DuplicateOtherwise(String),

    #[error("'branch' outside a parallel block")]
    MisplacedBranch,

    #[error("parallel block '{0}' needs 'branch' before its first step")]
    StepOutsideBranch(String),

    #[error("loop '{0}' must allow at least one iteration")]
    InvalidLoopLimit(String),

    #[error("block '{0}' has an empty predicate expression")]
    EmptyPredicate(String),

    #[error("schema entry '{0}' does not name a step")]
    UnknownSchemaStep(String),

    #[error("timer '{step}' is invalid: {reason}")]
    InvalidTimer { step: String, reason: String },
}

// ---------------------------------------------------------------------------
// Operations
// ---------------------------------------------------------------------------

/// One builder call. A flow is an ordered list of these.
#[derive(Debug, Clone)]
pub enum BuilderOp {
    Trigger(Trigger),
    Step(Node),
    If {
        label: Option<String>,
        predicate: Predicate,
    },
    Otherwise,
    Parallel {
        label: Option<String>,
    },
    Branch,
    Loop {
        label: Option<String>,
        predicate: Predicate,
        max_iterations: Option<u32>,
    },
    End,
    Timer {
        name: String,
        spec: TimerSpec,
    },
    WaitSignal {
        name: String,
        signal: String,
        timeout: Option<Duration>,
    },
    Schema(StateSchema),
    Timeout(Duration),
}

// ---------------------------------------------------------------------------
// Frames
// ---------------------------------------------------------------------------

enum Frame {
    Root(Vec<Step>),
    Conditional {
        label: String,
        predicate: Predicate,
        body: Vec<Step>,
        otherwise: Option<Vec<Step>>,
    },
    Parallel {
        label: String,
        branches: Vec<Vec<Step>>,
    },
    Loop {
        label: String,
        predicate: Predicate,
        max_iterations: Option<u32>,
        body: Vec<Step>,
    },
}

impl Frame {
    fn label(&self) -> &str {
        match self {
            Frame::Root(_) => "<root>",
            Frame::Conditional { label, .. }
            | Frame::Parallel { label, .. }
            | Frame::Loop { label, .. } => label,
        }
    }

    fn push(&mut self, step: Step) -> Result<(), ValidationError> {
        match self {
            Frame::Root(steps) => steps.push(step),
            Frame::Conditional {
                otherwise: Some(otherwise),
                ..
            } => otherwise.push(step),
            Frame::Conditional { body, .. } | Frame::Loop { body, .. } => body.push(step),
            Frame::Parallel { label, branches } => branches
                .last_mut()
                .ok_or_else(|| ValidationError::StepOutsideBranch(label.clone()))?
                .push(step),
        }
        Ok(())
    }

    fn close(self) -> Result<Step, ValidationError> {
        match self {
            Frame::Root(_) => Err(ValidationError::UnmatchedEnd),
            Frame::Conditional {
                label,
                predicate,
                body,
                otherwise,
            } => {
                if body.is_empty() {
                    return Err(ValidationError::EmptyBlock(label));
                }
                Ok(Step::Conditional {
                    label,
                    predicate,
                    body,
                    otherwise: otherwise.unwrap_or_default(),
                })
            }
            Frame::Parallel { label, branches } => {
                if branches.is_empty() {
                    return Err(ValidationError::EmptyBlock(label));
                }
                if let Some(index) = branches.iter().position(Vec::is_empty) {
                    return Err(ValidationError::EmptyBranch { label, index });
                }
                Ok(Step::Parallel { label, branches })
            }
            Frame::Loop {
                label,
                predicate,
                max_iterations,
                body,
            } => {
                if body.is_empty() {
                    return Err(ValidationError::EmptyBlock(label));
                }
                Ok(Step::Loop {
                    label,
                    predicate,
                    body,
                    max_iterations,
                })
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Compiler
// ---------------------------------------------------------------------------

#[derive(Default)]
struct Names {
    seen: HashSet<String>,
    auto_labels: u32,
}

impl Names {
    fn claim(&mut self, name: &str) -> Result<(), ValidationError> {
        validate_step_name(name)?;
        if !self.seen.insert(name.to_string()) {
            return Err(ValidationError::DuplicateName(name.to_string()));
        }
        Ok(())
    }

    /// Claim an explicit label, or generate `kind#n` (never a valid step name).
    fn label(&mut self, kind: &str, label: Option<String>) -> Result<String, ValidationError> {
        match label {
            Some(label) => {
                self.claim(&label)?;
                Ok(label)
            }
            None => {
                self.auto_labels += 1;
                Ok(format!("{kind}#{}", self.auto_labels))
            }
        }
    }
}

fn is_name_char(c: char) -> bool {
    c.is_alphanumeric() || c == '-' || c == '_'
}

fn validate_step_name(name: &str) -> Result<(), ValidationError> {
    if name == TRIGGER_ROOT {
        return Err(ValidationError::ReservedName(name.to_string()));
    }
    if name.is_empty() || name.contains(ITERATION_SEPARATOR) || !name.chars().all(is_name_char) {
        return Err(ValidationError::InvalidStepName(name.to_string()));
    }
    Ok(())
}

fn validate_trigger(trigger: &Trigger) -> Result<Trigger, ValidationError> {
    match trigger {
        Trigger::Manual { name } | Trigger::Signal { name } if name.trim().is_empty() => Err(
            ValidationError::InvalidTrigger(format!("{} trigger needs a name", trigger.kind())),
        ),
        Trigger::Webhook { path } if !path.starts_with('/') => Err(
            ValidationError::InvalidTrigger(format!("webhook path '{path}' must start with '/'")),
        ),
        Trigger::Schedule { cron } => normalize_schedule(cron)
            .map(|_| trigger.clone())
            .map_err(|e| ValidationError::InvalidTrigger(e.to_string())),
        _ => Ok(trigger.clone()),
    }
}

fn validate_predicate(label: &str, predicate: &Predicate) -> Result<(), ValidationError> {
    match predicate {
        Predicate::Expression(expr) if expr.trim().is_empty() => {
            Err(ValidationError::EmptyPredicate(label.to_string()))
        }
        _ => Ok(()),
    }
}

fn validate_node(node: &Node) -> Result<(), ValidationError> {
    RetryHandler::validate(&node.retry).map_err(|reason| ValidationError::InvalidRetryPolicy {
        step: node.name.clone(),
        reason,
    })?;
    if node.timeout.is_some_and(|t| t.is_zero()) {
        return Err(ValidationError::InvalidTimeout(node.name.clone()));
    }
    if let Some(binding) = &node.cursor {
        let invalid = |reason: &str| ValidationError::InvalidCursor {
            step: node.name.clone(),
            reason: reason.to_string(),
        };
        if binding.source_id.trim().is_empty() {
            return Err(invalid("source id is empty"));
        }
        if binding.format.as_deref().is_some_and(|f| f.trim().is_empty()) {
            return Err(invalid("format layout is empty"));
        }
    } else if node.error_handler == Some(ErrorHandler::RollbackCursor) {
        return Err(ValidationError::InvalidCursor {
            step: node.name.clone(),
            reason: "rollback_cursor handler needs a cursor binding".to_string(),
        });
    }
    Ok(())
}

fn validate_timer(name: &str, spec: &TimerSpec) -> Result<(), ValidationError> {
    match spec {
        TimerSpec::Duration(d) if d.is_zero() => Err(ValidationError::InvalidTimer {
            step: name.to_string(),
            reason: "duration must be greater than zero".to_string(),
        }),
        TimerSpec::Duration(d) if chrono::Duration::from_std(*d).is_err() => {
            Err(ValidationError::InvalidTimer {
                step: name.to_string(),
                reason: format!("duration {d:?} is out of range"),
            })
        }
        // A deadline already in the past fires immediately.
        _ => Ok(()),
    }
}

/// Validate `ops` and freeze them into a [`Flow`].
pub fn compile(name: &str, ops: Vec<BuilderOp>) -> Result<Flow, ValidationError> {
    if name.is_empty() || !name.chars().all(is_name_char) {
        return Err(ValidationError::InvalidFlowName(name.to_string()));
    }

    let mut names = Names::default();
    let mut stack = vec![Frame::Root(Vec::new())];
    let mut trigger: Option<Trigger> = None;
    let mut schema = StateSchema::new();
    let mut timeout = None;

    for op in ops {
        match op {
            BuilderOp::Trigger(t) => {
                if trigger.is_some() {
                    return Err(ValidationError::MultipleTriggers);
                }
                trigger = Some(validate_trigger(&t)?);
            }
            BuilderOp::Step(node) => {
                names.claim(&node.name)?;
                validate_node(&node)?;
                current(&mut stack).push(Step::Node(node))?;
            }
            BuilderOp::Timer { name, spec } => {
                names.claim(&name)?;
                validate_timer(&name, &spec)?;
                current(&mut stack).push(Step::Timer { name, spec })?;
            }
            BuilderOp::WaitSignal {
                name,
                signal,
                timeout,
            } => {
                names.claim(&name)?;
                if signal.trim().is_empty() {
                    return Err(ValidationError::InvalidTrigger(format!(
                        "signal step '{name}' waits for an unnamed signal"
                    )));
                }
                if timeout.is_some_and(|t| t.is_zero()) {
                    return Err(ValidationError::InvalidTimeout(name));
                }
                current(&mut stack).push(Step::Signal {
                    name,
                    signal,
                    timeout,
                })?;
            }
            BuilderOp::If { label, predicate } => {
                let label = names.label("conditional", label)?;
                validate_predicate(&label, &predicate)?;
                stack.push(Frame::Conditional {
                    label,
                    predicate,
                    body: Vec::new(),
                    otherwise: None,
                });
            }
            BuilderOp::Otherwise => match stack.last_mut() {
                Some(Frame::Conditional {
                    label, otherwise, ..
                }) => {
                    if otherwise.is_some() {
                        return Err(ValidationError::DuplicateOtherwise(label.clone()));
                    }
                    *otherwise = Some(Vec::new());
                }
                _ => return Err(ValidationError::MisplacedOtherwise),
            },
            BuilderOp::Parallel { label } => {
                let label = names.label("parallel", label)?;
                stack.push(Frame::Parallel {
                    label,
                    branches: Vec::new(),
                });
            }
            BuilderOp::Branch => match stack.last_mut() {
                Some(Frame::Parallel { branches, .. }) => branches.push(Vec::new()),
                _ => return Err(ValidationError::MisplacedBranch),
            },
            BuilderOp::Loop {
                label,
                predicate,
                max_iterations,
            } => {
                let label = names.label("loop", label)?;
                validate_predicate(&label, &predicate)?;
                if max_iterations == Some(0) {
                    return Err(ValidationError::InvalidLoopLimit(label));
                }
                stack.push(Frame::Loop {
                    label,
                    predicate,
                    max_iterations,
                    body: Vec::new(),
                });
            }
            BuilderOp::End => {
                if stack.len() == 1 {
                    return Err(ValidationError::UnmatchedEnd);
                }
                let closed = stack.pop().ok_or(ValidationError::UnmatchedEnd)?.close()?;
                current(&mut stack).push(closed)?;
            }
            BuilderOp::Schema(s) => schema = s,
            BuilderOp::Timeout(t) => {
                if t.is_zero() {
                    return Err(ValidationError::InvalidTimeout(name.to_string()));
                }
                timeout = Some(t);
            }
        }
    }

    if stack.len() > 1 {
        let innermost = stack.last().map(Frame::label).unwrap_or_default();
        return Err(ValidationError::UnclosedBlock(innermost.to_string()));
    }
    let steps = match stack.pop() {
        Some(Frame::Root(steps)) => steps,
        _ => return Err(ValidationError::UnmatchedEnd),
    };
    if steps.is_empty() {
        return Err(ValidationError::EmptyFlow);
    }
    let trigger = trigger.ok_or(ValidationError::MissingTrigger)?;

    if let Some(unknown) = schema.names().find(|n| !names.seen.contains(*n)) {
        return Err(ValidationError::UnknownSchemaStep(unknown.to_string()));
    }

    tracing::debug!(flow = name, steps = steps.len(), "flow compiled");
    Ok(Flow::from_parts(FlowInner {
        name: name.to_string(),
        trigger,
        steps,
        schema: Arc::new(schema),
        timeout,
    }))
}

fn current(stack: &mut [Frame]) -> &mut Frame {
    // The root frame is never popped while operations remain.
    let last = stack.len() - 1;
    &mut stack[last]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow::plan::OutlineStep;
    use crate::flow::state::TypeTag;
    use flowkeel_types::flow::RetryPolicy;

    fn manual() -> BuilderOp {
        BuilderOp::Trigger(Trigger::Manual {
            name: "go".to_string(),
        })
    }

    fn step(name: &str) -> BuilderOp {
        BuilderOp::Step(Node::new(name))
    }

    fn always() -> Predicate {
        Predicate::function(|_| Ok(true))
    }

    #[test]
    fn test_compiles_nested_blocks() {
        let flow = compile(
            "nested",
            vec![
                manual(),
                step("a"),
                BuilderOp::Parallel { label: None },
                BuilderOp::Branch,
                step("b1"),
                BuilderOp::Branch,
                BuilderOp::If {
                    label: Some("gate".into()),
                    predicate: always(),
                },
                step("b2"),
                BuilderOp::Otherwise,
                step("b3"),
                BuilderOp::End,
                BuilderOp::End,
                step("z"),
            ],
        )
        .unwrap();

        let outline = flow.outline();
        assert_eq!(outline.steps.len(), 3);
        match &outline.steps[1] {
            OutlineStep::Parallel { label, branches } => {
                assert_eq!(label, "parallel#1");
                assert_eq!(branches.len(), 2);
                assert!(matches!(
                    &branches[1][0],
                    OutlineStep::Conditional { body, otherwise, .. }
                        if body.len() == 1 && otherwise.len() == 1
                ));
            }
            other => panic!("expected parallel, got {other:?}"),
        }
        assert_eq!(flow.nodes().len(), 5);
    }

    #[test]
    fn test_rejects_duplicate_names_across_blocks() {
        let err = compile(
            "dup",
            vec![
                manual(),
                step("a"),
                BuilderOp::Loop {
                    label: None,
                    predicate: always(),
                    max_iterations: None,
                },
                step("a"),
                BuilderOp::End,
            ],
        )
        .unwrap_err();
        assert_eq!(err, ValidationError::DuplicateName("a".to_string()));
    }

    #[test]
    fn test_trigger_count() {
        assert_eq!(
            compile("t", vec![step("a")]).unwrap_err(),
            ValidationError::MissingTrigger
        );
        assert_eq!(
            compile("t", vec![manual(), manual(), step("a")]).unwrap_err(),
            ValidationError::MultipleTriggers
        );
    }

    #[test]
    fn test_unbalanced_blocks() {
        let unclosed = compile(
            "u",
            vec![
                manual(),
                BuilderOp::If {
                    label: None,
                    predicate: always(),
                },
                step("a"),
            ],
        )
        .unwrap_err();
        assert_eq!(unclosed, ValidationError::UnclosedBlock("conditional#1".into()));

        let extra_end = compile("u", vec![manual(), step("a"), BuilderOp::End]).unwrap_err();
        assert_eq!(extra_end, ValidationError::UnmatchedEnd);
    }

    #[test]
    fn test_misplaced_structure_ops() {
        assert_eq!(
            compile("m", vec![manual(), BuilderOp::Otherwise]).unwrap_err(),
            ValidationError::MisplacedOtherwise
        );
        assert_eq!(
            compile("m", vec![manual(), BuilderOp::Branch]).unwrap_err(),
            ValidationError::MisplacedBranch
        );
        assert_eq!(
            compile(
                "m",
                vec![manual(), BuilderOp::Parallel { label: None }, step("a")]
            )
            .unwrap_err(),
            ValidationError::StepOutsideBranch("parallel#1".into())
        );
    }

    #[test]
    fn test_empty_blocks_and_branches() {
        let empty_branch = compile(
            "e",
            vec![
                manual(),
                BuilderOp::Parallel { label: None },
                BuilderOp::Branch,
                step("a"),
                BuilderOp::Branch,
                BuilderOp::End,
            ],
        )
        .unwrap_err();
        assert!(matches!(empty_branch, ValidationError::EmptyBranch { index: 1, .. }));

        assert_eq!(compile("e", vec![manual()]).unwrap_err(), ValidationError::EmptyFlow);
    }

    #[test]
    fn test_rejects_invalid_retry_policy() {
        let node = Node::new("a").retry(RetryPolicy::default().with_maximum_attempts(0));
        let err = compile("r", vec![manual(), BuilderOp::Step(node)]).unwrap_err();
        assert!(matches!(err, ValidationError::InvalidRetryPolicy { .. }));

        let node = Node::new("a").retry(RetryPolicy::default().with_backoff_coefficient(0.9));
        assert!(compile("r", vec![manual(), BuilderOp::Step(node)]).is_err());
    }

    #[test]
    fn test_names_are_checked() {
        assert_eq!(
            compile("n", vec![manual(), step("trigger")]).unwrap_err(),
            ValidationError::ReservedName("trigger".into())
        );
        assert_eq!(
            compile("n", vec![manual(), step("a@1")]).unwrap_err(),
            ValidationError::InvalidStepName("a@1".into())
        );
        assert_eq!(
            compile("bad name", vec![manual(), step("a")]).unwrap_err(),
            ValidationError::InvalidFlowName("bad name".into())
        );
    }

    #[test]
    fn test_trigger_validation() {
        let webhook = BuilderOp::Trigger(Trigger::Webhook {
            path: "hooks/in".into(),
        });
        assert!(matches!(
            compile("w", vec![webhook, step("a")]).unwrap_err(),
            ValidationError::InvalidTrigger(_)
        ));

        let cron = BuilderOp::Trigger(Trigger::Schedule {
            cron: "whenever you like".into(),
        });
        assert!(matches!(
            compile("c", vec![cron, step("a")]).unwrap_err(),
            ValidationError::InvalidTrigger(_)
        ));

        let cron_shaped = BuilderOp::Trigger(Trigger::Schedule {
            cron: "foo bar baz qux quux".into(),
        });
        assert!(matches!(
            compile("c", vec![cron_shaped, step("a")]).unwrap_err(),
            ValidationError::InvalidTrigger(_)
        ));

        let hourly = BuilderOp::Trigger(Trigger::Schedule {
            cron: "hourly".into(),
        });
        assert!(compile("c", vec![hourly, step("a")]).is_ok());
    }

    #[test]
    fn test_schema_must_name_steps() {
        let schema = StateSchema::new().with("ghost", TypeTag::Number);
        let err = compile("s", vec![manual(), step("a"), BuilderOp::Schema(schema)]).unwrap_err();
        assert_eq!(err, ValidationError::UnknownSchemaStep("ghost".into()));
    }

    #[test]
    fn test_zero_limits_rejected() {
        let err = compile(
            "l",
            vec![
                manual(),
                BuilderOp::Loop {
                    label: Some("pages".into()),
                    predicate: always(),
                    max_iterations: Some(0),
                },
                step("a"),
                BuilderOp::End,
            ],
        )
        .unwrap_err();
        assert_eq!(err, ValidationError::InvalidLoopLimit("pages".into()));

        let timer = BuilderOp::Timer {
            name: "nap".into(),
            spec: TimerSpec::Duration(Duration::ZERO),
        };
        assert!(matches!(
            compile("l", vec![manual(), timer]).unwrap_err(),
            ValidationError::InvalidTimer { .. }
        ));

        let forever = BuilderOp::Timer {
            name: "forever".into(),
            spec: TimerSpec::Duration(Duration::MAX),
        };
        assert!(matches!(
            compile("l", vec![manual(), forever]).unwrap_err(),
            ValidationError::InvalidTimer { ref reason, .. } if reason.contains("out of range")
        ));
    }

    #[test]
    fn test_task_names_include_handlers() {
        let node = Node::new("charge").compensate_with("refund");
        let flow = compile("t", vec![manual(), BuilderOp::Step(node), step("notify")]).unwrap();
        assert_eq!(flow.task_names(), vec!["charge", "notify", "refund"]);
    }

    #[test]
    fn test_rollback_handler_needs_cursor() {
        let node = Node::new("load").on_error(ErrorHandler::RollbackCursor);
        let err = compile("r", vec![manual(), BuilderOp::Step(node)]).unwrap_err();
        assert!(matches!(err, ValidationError::InvalidCursor { ref step, .. } if step == "load"));
    }
}
