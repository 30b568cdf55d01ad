//! JEXL evaluator for serializable flow predicates.
//!
//! Expressions see the state store's expression context:
//! `steps.<name>.output` and `trigger`. State values are always passed as
//! context, never interpolated into expression text.

use serde_json::{Value, json};

use super::state::ExecutionState;

#[derive(Debug, thiserror::Error)]
pub enum ExpressionError {
    #[error("expression evaluation failed: {0}")]
    EvalFailed(String),

    #[error("invalid context: {0}")]
    InvalidContext(String),
}

/// JEXL evaluator with a small set of pure transforms registered.
pub struct PredicateEvaluator {
    evaluator: jexl_eval::Evaluator<'static>,
}

fn str_arg(args: &[Value], index: usize) -> &str {
    args.get(index).and_then(Value::as_str).unwrap_or("")
}

impl PredicateEvaluator {
    pub fn new() -> Self {
        let evaluator = jexl_eval::Evaluator::new()
            .with_transform("lower", |args: &[Value]| Ok(json!(str_arg(args, 0).to_lowercase())))
            .with_transform("upper", |args: &[Value]| Ok(json!(str_arg(args, 0).to_uppercase())))
            .with_transform("trim", |args: &[Value]| Ok(json!(str_arg(args, 0).trim())))
            .with_transform("contains", |args: &[Value]| {
                Ok(json!(str_arg(args, 0).contains(str_arg(args, 1))))
            })
            .with_transform("startsWith", |args: &[Value]| {
                Ok(json!(str_arg(args, 0).starts_with(str_arg(args, 1))))
            })
            .with_transform("not", |args: &[Value]| {
                Ok(json!(!truthy(args.first().unwrap_or(&Value::Null))))
            })
            // Works on strings, arrays, and objects.
            .with_transform("length", |args: &[Value]| {
                let len = match args.first() {
                    Some(Value::String(s)) => s.chars().count(),
                    Some(Value::Array(a)) => a.len(),
                    Some(Value::Object(o)) => o.len(),
                    _ => 0,
                };
                Ok(json!(len as f64))
            });

        Self { evaluator }
    }

    /// Evaluate to a boolean using JavaScript-like truthiness.
    pub fn evaluate_bool(&self, expression: &str, context: &Value) -> Result<bool, ExpressionError> {
        Ok(truthy(&self.evaluate_value(expression, context)?))
    }

    pub fn evaluate_value(&self, expression: &str, context: &Value) -> Result<Value, ExpressionError> {
        if !context.is_object() {
            return Err(ExpressionError::InvalidContext(
                "context must be a JSON object".to_string(),
            ));
        }
        self.evaluator
            .eval_in_context(expression, context)
            .map_err(|e| ExpressionError::EvalFailed(e.to_string()))
    }

    pub fn evaluate_in_state(
        &self,
        expression: &str,
        state: &ExecutionState,
    ) -> Result<bool, ExpressionError> {
        self.evaluate_bool(expression, &state.to_expression_context())
    }
}

impl Default for PredicateEvaluator {
    fn default() -> Self {
        Self::new()
    }
}

fn truthy(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::Null => false,
        Value::Number(n) => n.as_f64().unwrap_or(0.0) != 0.0,
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state_with_count(count: i64) -> ExecutionState {
        let mut state = ExecutionState::new(json!({ "env": "Prod" }));
        state.set("check", json!({ "count": count, "items": ["a", "b"] })).unwrap();
        state
    }

    #[test]
    fn comparison_over_step_output() {
        let eval = PredicateEvaluator::new();
        let expr = "steps.check.output.count > 0";
        assert!(!eval.evaluate_in_state(expr, &state_with_count(0)).unwrap());
        assert!(eval.evaluate_in_state(expr, &state_with_count(4)).unwrap());
    }

    #[test]
    fn transforms_and_trigger_access() {
        let eval = PredicateEvaluator::new();
        let state = state_with_count(1);
        assert!(eval.evaluate_in_state("trigger.env|lower == 'prod'", &state).unwrap());
        assert!(eval.evaluate_in_state("steps.check.output.items|length == 2", &state).unwrap());
    }

    #[test]
    fn truthiness_of_non_boolean_results() {
        let eval = PredicateEvaluator::new();
        let ctx = json!({ "s": "", "n": 3, "z": null });
        assert!(!eval.evaluate_bool("s", &ctx).unwrap());
        assert!(eval.evaluate_bool("n", &ctx).unwrap());
        assert!(!eval.evaluate_bool("z", &ctx).unwrap());
    }

    #[test]
    fn non_object_context_is_rejected() {
        let eval = PredicateEvaluator::new();
        assert!(matches!(
            eval.evaluate_bool("true", &json!([1])),
            Err(ExpressionError::InvalidContext(_))
        ));
    }

    #[test]
    fn syntax_error_is_reported() {
        let eval = PredicateEvaluator::new();
        assert!(matches!(
            eval.evaluate_bool("steps.check.output.count >", &json!({})),
            Err(ExpressionError::EvalFailed(_))
        ));
    }
}
