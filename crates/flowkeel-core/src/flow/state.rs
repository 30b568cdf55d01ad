//! Per-run execution state: write-once step outputs plus the trigger payload.
//!
//! Every node output is stored under its state key. Inside loop bodies the
//! key carries the iteration path (`fetch@2`, `fetch@2:0` for nested loops);
//! reading by bare name resolves to the most recently committed iteration.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Path root that addresses the trigger payload instead of a step output.
pub const TRIGGER_ROOT: &str = "trigger";

/// Separator between a step name and its loop iteration path.
pub const ITERATION_SEPARATOR: char = '@';

/// Errors from reading or writing execution state.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum StateError {
    #[error("step '{0}' has already written its output")]
    DuplicateWrite(String),

    #[error("no output recorded for '{0}'")]
    KeyNotFound(String),

    #[error("type mismatch for '{key}': expected {expected}: {detail}")]
    TypeMismatch {
        key: String,
        expected: String,
        detail: String,
    },

    #[error("cannot resolve '{path}': segment '{segment}' not found")]
    PathResolution { path: String, segment: String },
}

// ---------------------------------------------------------------------------
// Schema
// ---------------------------------------------------------------------------

/// Coarse JSON type declared for a step output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TypeTag {
    Any,
    Null,
    Bool,
    Number,
    String,
    Array,
    Object,
}

impl TypeTag {
    pub fn matches(self, value: &Value) -> bool {
        self == TypeTag::Any || self == TypeTag::of(value)
    }

    pub fn of(value: &Value) -> TypeTag {
        match value {
            Value::Null => TypeTag::Null,
            Value::Bool(_) => TypeTag::Bool,
            Value::Number(_) => TypeTag::Number,
            Value::String(_) => TypeTag::String,
            Value::Array(_) => TypeTag::Array,
            Value::Object(_) => TypeTag::Object,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TypeTag::Any => "any",
            TypeTag::Null => "null",
            TypeTag::Bool => "bool",
            TypeTag::Number => "number",
            TypeTag::String => "string",
            TypeTag::Array => "array",
            TypeTag::Object => "object",
        }
    }
}

/// Declared output types by step name. Checked when the flow is compiled
/// (every entry must name a step) and on every write.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StateSchema {
    entries: BTreeMap<String, TypeTag>,
}

impl StateSchema {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, step: impl Into<String>, tag: TypeTag) -> Self {
        self.entries.insert(step.into(), tag);
        self
    }

    pub fn get(&self, step: &str) -> Option<TypeTag> {
        self.entries.get(step).copied()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Keys
// ---------------------------------------------------------------------------

/// Build the state key for `name` at the given loop iteration path.
pub fn state_key(name: &str, iterations: &[u32]) -> String {
    if iterations.is_empty() {
        return name.to_string();
    }
    let path: Vec<String> = iterations.iter().map(u32::to_string).collect();
    format!("{name}{ITERATION_SEPARATOR}{}", path.join(":"))
}

/// The step name part of a state key.
pub fn base_name(key: &str) -> &str {
    key.split(ITERATION_SEPARATOR).next().unwrap_or(key)
}

// ---------------------------------------------------------------------------
// ExecutionState
// ---------------------------------------------------------------------------

/// Write-once map from state key to step output, scoped to one run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExecutionState {
    trigger: Value,
    outputs: HashMap<String, Value>,
    /// Keys in commit order.
    order: Vec<String>,
    /// Bare step name to its latest committed key.
    latest: HashMap<String, String>,
    #[serde(skip)]
    schema: Option<Arc<StateSchema>>,
}

impl ExecutionState {
    pub fn new(trigger: Value) -> Self {
        Self {
            trigger,
            ..Self::default()
        }
    }

    pub fn with_schema(mut self, schema: Arc<StateSchema>) -> Self {
        self.schema = (!schema.is_empty()).then_some(schema);
        self
    }

    /// The payload the run was started with.
    pub fn trigger(&self) -> &Value {
        &self.trigger
    }

    /// Record a step output. Fails if `key` already holds a value or the
    /// output violates the declared schema type.
    pub fn set(&mut self, key: &str, output: Value) -> Result<(), StateError> {
        self.check_write(key, &output)?;
        let name = base_name(key);
        self.outputs.insert(key.to_string(), output);
        self.order.push(key.to_string());
        self.latest.insert(name.to_string(), key.to_string());
        Ok(())
    }

    /// The checks [`ExecutionState::set`] applies, without writing.
    pub fn check_write(&self, key: &str, output: &Value) -> Result<(), StateError> {
        if self.outputs.contains_key(key) {
            return Err(StateError::DuplicateWrite(key.to_string()));
        }
        let name = base_name(key);
        if let Some(tag) = self.schema.as_ref().and_then(|s| s.get(name)) {
            if !tag.matches(output) {
                return Err(StateError::TypeMismatch {
                    key: key.to_string(),
                    expected: tag.as_str().to_string(),
                    detail: format!("got {}", TypeTag::of(output).as_str()),
                });
            }
        }
        Ok(())
    }

    pub fn contains(&self, key: &str) -> bool {
        self.outputs.contains_key(key)
    }

    /// Raw output by exact key, or by bare name (latest iteration).
    pub fn get_value(&self, name: &str) -> Result<&Value, StateError> {
        if let Some(value) = self.outputs.get(name) {
            return Ok(value);
        }
        self.latest
            .get(name)
            .and_then(|key| self.outputs.get(key))
            .ok_or_else(|| StateError::KeyNotFound(name.to_string()))
    }

    /// Typed output by exact key or bare name.
    pub fn get<T: DeserializeOwned>(&self, name: &str) -> Result<T, StateError> {
        let value = self.get_value(name)?;
        decode(name, value)
    }

    /// Resolve a dotted path. The first segment names a step (or
    /// [`TRIGGER_ROOT`]); later segments index objects by field and arrays
    /// by position.
    pub fn resolve_path(&self, path: &str) -> Result<&Value, StateError> {
        let mut segments = path.split('.');
        let head = segments.next().unwrap_or_default();
        let mut current = if head == TRIGGER_ROOT {
            &self.trigger
        } else {
            self.get_value(head)?
        };

        for segment in segments {
            let next = match current {
                Value::Object(map) => map.get(segment),
                Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
                _ => None,
            };
            current = next.ok_or_else(|| StateError::PathResolution {
                path: path.to_string(),
                segment: segment.to_string(),
            })?;
        }
        Ok(current)
    }

    /// Typed value at a dotted path.
    pub fn resolve_as<T: DeserializeOwned>(&self, path: &str) -> Result<T, StateError> {
        let value = self.resolve_path(path)?;
        decode(path, value)
    }

    /// Committed keys in commit order.
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.order.iter().map(String::as_str)
    }

    /// `(key, output)` pairs in commit order.
    pub fn entries(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.order
            .iter()
            .filter_map(|k| self.outputs.get(k).map(|v| (k.as_str(), v)))
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// JSON context for predicate expressions:
    /// `{ "steps": { "<name>": { "output": ... } }, "trigger": ... }`.
    ///
    /// Bare names point at the latest iteration; iteration keys are also
    /// present verbatim.
    pub fn to_expression_context(&self) -> Value {
        let mut steps = serde_json::Map::new();
        for (key, output) in self.entries() {
            steps.insert(key.to_string(), serde_json::json!({ "output": output }));
        }
        for (name, key) in &self.latest {
            if let Some(output) = self.outputs.get(key) {
                steps.insert(name.clone(), serde_json::json!({ "output": output }));
            }
        }
        serde_json::json!({
            "steps": steps,
            "trigger": self.trigger,
        })
    }
}

fn decode<T: DeserializeOwned>(key: &str, value: &Value) -> Result<T, StateError> {
    serde_json::from_value(value.clone()).map_err(|e| StateError::TypeMismatch {
        key: key.to_string(),
        expected: std::any::type_name::<T>().to_string(),
        detail: e.to_string(),
    })
}
