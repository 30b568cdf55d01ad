//! Flow-level configuration types: triggers, retry policies, timer specs.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Trigger
// ---------------------------------------------------------------------------

/// The event class that starts a run. Exactly one per flow.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Trigger {
    /// Started externally by name with an arbitrary keyed payload.
    Manual { name: String },
    /// Started on every tick of a cron-style schedule.
    Schedule { cron: String },
    /// Started once per accepted inbound request on `path`.
    Webhook { path: String },
    /// Started (or fed) by an external named event.
    Signal { name: String },
}

impl Trigger {
    /// Short lowercase kind label used in run records and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Trigger::Manual { .. } => "manual",
            Trigger::Schedule { .. } => "schedule",
            Trigger::Webhook { .. } => "webhook",
            Trigger::Signal { .. } => "signal",
        }
    }

    /// The addressing value of the trigger (name, cron expression, or path).
    pub fn source(&self) -> &str {
        match self {
            Trigger::Manual { name } | Trigger::Signal { name } => name,
            Trigger::Schedule { cron } => cron,
            Trigger::Webhook { path } => path,
        }
    }
}

// ---------------------------------------------------------------------------
// RetryPolicy
// ---------------------------------------------------------------------------

/// Exponential backoff retry policy for a node.
///
/// Attempt `n` (1-based) that fails waits
/// `min(initial_interval * backoff_coefficient^(n-1), maximum_interval)`
/// before attempt `n + 1`, until `maximum_attempts` have been made.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    #[serde(default = "default_initial_interval")]
    pub initial_interval: Duration,
    #[serde(default = "default_backoff_coefficient")]
    pub backoff_coefficient: f64,
    #[serde(default = "default_maximum_interval")]
    pub maximum_interval: Duration,
    #[serde(default = "default_maximum_attempts")]
    pub maximum_attempts: u32,
}

fn default_initial_interval() -> Duration {
    Duration::from_secs(1)
}

fn default_backoff_coefficient() -> f64 {
    2.0
}

fn default_maximum_interval() -> Duration {
    Duration::from_secs(100)
}

fn default_maximum_attempts() -> u32 {
    3
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_interval: default_initial_interval(),
            backoff_coefficient: default_backoff_coefficient(),
            maximum_interval: default_maximum_interval(),
            maximum_attempts: default_maximum_attempts(),
        }
    }
}

impl RetryPolicy {
    /// A policy that makes exactly one attempt.
    pub fn no_retry() -> Self {
        Self {
            maximum_attempts: 1,
            ..Self::default()
        }
    }

    pub fn with_maximum_attempts(mut self, attempts: u32) -> Self {
        self.maximum_attempts = attempts;
        self
    }

    pub fn with_initial_interval(mut self, interval: Duration) -> Self {
        self.initial_interval = interval;
        self
    }

    pub fn with_backoff_coefficient(mut self, coefficient: f64) -> Self {
        self.backoff_coefficient = coefficient;
        self
    }

    pub fn with_maximum_interval(mut self, interval: Duration) -> Self {
        self.maximum_interval = interval;
        self
    }
}

// ---------------------------------------------------------------------------
// TimerSpec
// ---------------------------------------------------------------------------

/// When a timer step wakes up.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimerSpec {
    /// Relative to the first time the step is reached in a run.
    Duration(Duration),
    /// An absolute wall-clock instant.
    Deadline(DateTime<Utc>),
}
