use serde::{Deserialize, Serialize};

/// Persisted incremental-sync position for one source, durable for the
/// lifetime of the deployment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CursorRecord {
    pub source_id: String,
    /// Empty string means "no position" (full reprocessing).
    pub position: String,
    /// Optional layout for string <-> time conversion of `position`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub format: Option<String>,
}

impl CursorRecord {
    pub fn new(source_id: impl Into<String>, position: impl Into<String>) -> Self {
        Self {
            source_id: source_id.into(),
            position: position.into(),
            format: None,
        }
    }

    pub fn with_format(mut self, format: impl Into<String>) -> Self {
        self.format = Some(format.into());
        self
    }

    pub fn is_empty(&self) -> bool {
        self.position.is_empty()
    }
}
