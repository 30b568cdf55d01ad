//! Persisted incremental-processing cursors.
//!
//! A node bound to a cursor source reads the last committed position before
//! it runs, sees it substituted into `{{ cursor }}` placeholders in its
//! input, and advances it with its output. The advance is handed to the
//! store together with the step record so both commit atomically.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use flowkeel_types::cursor::CursorRecord;
use flowkeel_types::error::RepositoryError;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Mutex;

use crate::repository::CursorRepository;

/// Layout name that selects RFC 3339 parsing instead of a strftime pattern.
pub const RFC3339_FORMAT: &str = "rfc3339";

#[derive(Debug, thiserror::Error)]
pub enum CursorError {
    #[error("cursor position '{position}' does not match layout '{format}': {reason}")]
    MalformedPosition {
        position: String,
        format: String,
        reason: String,
    },

    #[error("cursor '{source_id}' cannot move backwards from '{current}' to '{proposed}'")]
    NonMonotonic {
        source_id: String,
        current: String,
        proposed: String,
    },

    #[error("cursor store error: {0}")]
    Store(#[from] RepositoryError),
}

// ---------------------------------------------------------------------------
// Binding and handle
// ---------------------------------------------------------------------------

/// Declares that a node reads and advances the cursor of `source_id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CursorBinding {
    pub source_id: String,
    /// Position used when nothing has been committed yet.
    #[serde(default)]
    pub default: Option<String>,
    /// Timestamp layout (`strftime` pattern or `"rfc3339"`). Without one,
    /// positions compare as integers when both parse, else lexicographically.
    #[serde(default)]
    pub format: Option<String>,
    /// Dotted path into the node output holding the new position. `None`
    /// means the whole output is the position.
    #[serde(default)]
    pub advance_path: Option<String>,
}

impl CursorBinding {
    pub fn new(source_id: impl Into<String>) -> Self {
        Self {
            source_id: source_id.into(),
            default: None,
            format: None,
            advance_path: None,
        }
    }

    pub fn with_default(mut self, position: impl Into<String>) -> Self {
        self.default = Some(position.into());
        self
    }

    pub fn with_format(mut self, format: impl Into<String>) -> Self {
        self.format = Some(format.into());
        self
    }

    pub fn advance_from(mut self, path: impl Into<String>) -> Self {
        self.advance_path = Some(path.into());
        self
    }
}

/// Read view of a cursor at the moment a node is about to run.
#[derive(Debug, Clone, PartialEq)]
pub struct CursorHandle {
    source_id: String,
    stored: Option<String>,
    default: Option<String>,
    format: Option<String>,
}

impl CursorHandle {
    pub fn source_id(&self) -> &str {
        &self.source_id
    }

    /// Committed position, or the default when nothing is committed.
    pub fn position(&self) -> Option<&str> {
        self.stored.as_deref().or(self.default.as_deref())
    }

    pub fn position_or(&self, fallback: &str) -> String {
        self.position().unwrap_or(fallback).to_string()
    }

    /// Whether a position has been committed for this source.
    pub fn is_set(&self) -> bool {
        self.stored.is_some()
    }

    pub fn format(&self) -> Option<&str> {
        self.format.as_deref()
    }

    /// The position parsed with the handle's timestamp layout.
    pub fn as_time(&self) -> Result<Option<DateTime<Utc>>, CursorError> {
        match (self.position(), self.format()) {
            (Some(position), Some(format)) => parse_position_time(position, format).map(Some),
            _ => Ok(None),
        }
    }
}

// ---------------------------------------------------------------------------
// Position helpers
// ---------------------------------------------------------------------------

/// Parse a position with a timestamp layout.
pub fn parse_position_time(position: &str, format: &str) -> Result<DateTime<Utc>, CursorError> {
    let malformed = |reason: String| CursorError::MalformedPosition {
        position: position.to_string(),
        format: format.to_string(),
        reason,
    };

    if format == RFC3339_FORMAT {
        return DateTime::parse_from_rfc3339(position)
            .map(|t| t.with_timezone(&Utc))
            .map_err(|e| malformed(e.to_string()));
    }
    match NaiveDateTime::parse_from_str(position, format) {
        Ok(t) => Ok(t.and_utc()),
        Err(datetime_err) => NaiveDate::parse_from_str(position, format)
            .ok()
            .and_then(|d| d.and_hms_opt(0, 0, 0))
            .map(|t| t.and_utc())
            .ok_or_else(|| malformed(datetime_err.to_string())),
    }
}

/// Render a timestamp in a cursor layout.
pub fn format_position_time(time: &DateTime<Utc>, format: &str) -> String {
    if format == RFC3339_FORMAT {
        time.to_rfc3339()
    } else {
        time.format(format).to_string()
    }
}

/// Order `proposed` relative to `current`.
pub fn compare_positions(
    current: &str,
    proposed: &str,
    format: Option<&str>,
) -> Result<Ordering, CursorError> {
    if let Some(format) = format {
        let current = parse_position_time(current, format)?;
        let proposed = parse_position_time(proposed, format)?;
        return Ok(proposed.cmp(&current));
    }
    match (current.parse::<i128>(), proposed.parse::<i128>()) {
        (Ok(c), Ok(p)) => Ok(p.cmp(&c)),
        _ => Ok(proposed.cmp(current)),
    }
}

/// Check a cursor write against the position currently stored for its
/// source. Stores call this inside the commit that applies the write, so
/// two runs racing on one source cannot move it backwards.
pub fn check_commit_advance(
    stored: Option<&CursorRecord>,
    proposed: &CursorRecord,
) -> Result<(), RepositoryError> {
    let Some(stored) = stored.filter(|r| !r.is_empty()) else {
        return Ok(());
    };
    let format = proposed.format.as_deref().or(stored.format.as_deref());
    let ordering = compare_positions(&stored.position, &proposed.position, format)
        .map_err(|e| RepositoryError::Conflict(e.to_string()))?;
    if ordering == Ordering::Less {
        return Err(RepositoryError::CursorRegressed {
            source_id: proposed.source_id.clone(),
            current: stored.position.clone(),
            proposed: proposed.position.clone(),
        });
    }
    Ok(())
}

/// Replace `{{ cursor }}` with `own` and `{{ cursor.<id> }}` with the
/// matching handle, in every string of `value`. Unknown cursors render
/// as an empty string.
pub fn substitute(
    value: &Value,
    own: Option<&CursorHandle>,
    others: &HashMap<String, CursorHandle>,
) -> Value {
    match value {
        Value::String(s) => Value::String(substitute_str(s, own, others)),
        Value::Array(items) => Value::Array(
            items
                .iter()
                .map(|v| substitute(v, own, others))
                .collect(),
        ),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), substitute(v, own, others)))
                .collect(),
        ),
        other => other.clone(),
    }
}

enum Placeholder<'a> {
    Own,
    Source(&'a str),
}

fn parse_placeholder(inner: &str) -> Option<Placeholder<'_>> {
    let inner = inner.trim();
    if inner == "cursor" {
        Some(Placeholder::Own)
    } else {
        inner
            .strip_prefix("cursor.")
            .filter(|id| !id.is_empty())
            .map(Placeholder::Source)
    }
}

/// Visit each placeholder in `text`, letting `render` replace it.
fn rewrite_placeholders(text: &str, mut render: impl FnMut(Placeholder<'_>) -> String) -> String {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(start) = rest.find("{{") {
        let Some(len) = rest[start + 2..].find("}}") else {
            break;
        };
        let inner = &rest[start + 2..start + 2 + len];
        out.push_str(&rest[..start]);
        match parse_placeholder(inner) {
            Some(placeholder) => out.push_str(&render(placeholder)),
            None => out.push_str(&rest[start..start + 4 + len]),
        }
        rest = &rest[start + 4 + len..];
    }
    out.push_str(rest);
    out
}

fn substitute_str(
    text: &str,
    own: Option<&CursorHandle>,
    others: &HashMap<String, CursorHandle>,
) -> String {
    rewrite_placeholders(text, |placeholder| match placeholder {
        Placeholder::Own => own.map(|h| h.position_or("")).unwrap_or_default(),
        Placeholder::Source(id) => others
            .get(id)
            .map(|h| h.position_or(""))
            .unwrap_or_default(),
    })
}

/// Source ids referenced through `{{ cursor.<id> }}` anywhere in `value`.
pub fn referenced_sources(value: &Value) -> Vec<String> {
    let mut found = Vec::new();
    collect_sources(value, &mut found);
    found.sort();
    found.dedup();
    found
}

fn collect_sources(value: &Value, found: &mut Vec<String>) {
    match value {
        Value::String(s) => {
            rewrite_placeholders(s, |placeholder| {
                if let Placeholder::Source(id) = placeholder {
                    found.push(id.to_string());
                }
                String::new()
            });
        }
        Value::Array(items) => items.iter().for_each(|v| collect_sources(v, found)),
        Value::Object(map) => map.values().for_each(|v| collect_sources(v, found)),
        _ => {}
    }
}

/// Extract the new position from a node output.
fn position_from_output(output: &Value, path: Option<&str>) -> Option<String> {
    let mut current = output;
    if let Some(path) = path {
        for segment in path.split('.') {
            current = match current {
                Value::Object(map) => map.get(segment)?,
                Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
                _ => return None,
            };
        }
    }
    match current {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        other => Some(other.to_string()),
    }
}

// ---------------------------------------------------------------------------
// CursorManager
// ---------------------------------------------------------------------------

/// Run-scoped access to the cursor store.
///
/// Remembers each source's position at the first read of the run, which is
/// what [`CursorManager::rollback`] restores.
pub struct CursorManager<R: CursorRepository> {
    repo: Arc<R>,
    run_start: Mutex<HashMap<String, Option<CursorRecord>>>,
}

impl<R: CursorRepository> CursorManager<R> {
    pub fn new(repo: Arc<R>) -> Self {
        Self {
            repo,
            run_start: Mutex::new(HashMap::new()),
        }
    }

    async fn load(&self, source_id: &str) -> Result<Option<CursorRecord>, CursorError> {
        let stored = self.repo.get_cursor(source_id).await?;
        self.run_start
            .lock()
            .await
            .entry(source_id.to_string())
            .or_insert_with(|| stored.clone());
        Ok(stored)
    }

    /// Current handle for a binding.
    pub async fn handle(&self, binding: &CursorBinding) -> Result<CursorHandle, CursorError> {
        let stored = self.load(&binding.source_id).await?;
        Ok(CursorHandle {
            source_id: binding.source_id.clone(),
            format: binding
                .format
                .clone()
                .or_else(|| stored.as_ref().and_then(|r| r.format.clone())),
            stored: stored.filter(|r| !r.is_empty()).map(|r| r.position),
            default: binding.default.clone(),
        })
    }

    /// Handle for an arbitrary source id, without a default.
    pub async fn handle_for(&self, source_id: &str) -> Result<CursorHandle, CursorError> {
        self.handle(&CursorBinding::new(source_id)).await
    }

    /// Resolve all cursor placeholders in a node input.
    pub async fn substitute_input(
        &self,
        input: &Value,
        own: Option<&CursorHandle>,
    ) -> Result<Value, CursorError> {
        let mut others = HashMap::new();
        for source_id in referenced_sources(input) {
            let handle = self.handle_for(&source_id).await?;
            others.insert(source_id, handle);
        }
        Ok(substitute(input, own, &others))
    }

    /// Validate the advance carried by `output` against the position the
    /// node read. Returns the record to commit with the step, or `None`
    /// when the output carries no position.
    pub fn prepare_advance(
        &self,
        binding: &CursorBinding,
        handle: &CursorHandle,
        output: &Value,
    ) -> Result<Option<CursorRecord>, CursorError> {
        let Some(proposed) = position_from_output(output, binding.advance_path.as_deref()) else {
            return Ok(None);
        };
        let format = handle.format();
        if let Some(format) = format {
            parse_position_time(&proposed, format)?;
        }
        if let Some(current) = handle.stored.as_deref() {
            if compare_positions(current, &proposed, format)? == Ordering::Less {
                return Err(CursorError::NonMonotonic {
                    source_id: binding.source_id.clone(),
                    current: current.to_string(),
                    proposed,
                });
            }
        }

        let mut record = CursorRecord::new(binding.source_id.clone(), proposed);
        record.format = format.map(str::to_string);
        Ok(Some(record))
    }

    /// Clear a cursor so the next read yields its default. The only
    /// operation allowed to move a cursor backwards besides rollback.
    pub async fn reset(&self, source_id: &str) -> Result<(), CursorError> {
        let format = self
            .repo
            .get_cursor(source_id)
            .await?
            .and_then(|r| r.format);
        let mut cleared = CursorRecord::new(source_id, "");
        cleared.format = format;
        self.repo.put_cursor(&cleared).await?;
        tracing::info!(source_id, "cursor reset");
        Ok(())
    }

    /// Restore the position the cursor held when this run first read it.
    /// Returns the restored position.
    pub async fn rollback(&self, source_id: &str) -> Result<Option<String>, CursorError> {
        let snapshot = self.run_start.lock().await.get(source_id).cloned();
        let Some(snapshot) = snapshot else {
            let current = self.load(source_id).await?;
            return Ok(current.filter(|r| !r.is_empty()).map(|r| r.position));
        };

        match &snapshot {
            Some(record) => self.repo.put_cursor(record).await?,
            None => {
                self.repo.delete_cursor(source_id).await?;
            }
        }
        let restored = snapshot.filter(|r| !r.is_empty()).map(|r| r.position);
        tracing::info!(source_id, position = ?restored, "cursor rolled back");
        Ok(restored)
    }
}
