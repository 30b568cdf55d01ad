//! Engine configuration.
//!
//! Loaded from `flowkeel.toml` by the infra layer. Every field has a default,
//! so an empty file (or no file) is a valid configuration.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Maximum number of parallel-block branches in flight at once.
    #[serde(default = "default_max_parallelism")]
    pub max_parallelism: usize,

    /// Per-attempt timeout for nodes that do not set one.
    #[serde(default = "default_step_timeout_secs")]
    pub default_step_timeout_secs: u64,

    /// Run-level deadline for flows that do not set their own; exceeding it
    /// ends the run `TimedOut`. The deadline measures wall time, including
    /// timer and signal waits, so it is off unless configured.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_timeout_secs: Option<u64>,

    /// Optional cap on loop iterations for every loop block. `None` leaves
    /// termination to the flow author.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub loop_iteration_limit: Option<u32>,

    /// Capacity of the broadcast event bus.
    #[serde(default = "default_event_bus_capacity")]
    pub event_bus_capacity: usize,

    /// SQLite URL for the durable store.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub database_url: Option<String>,
}

fn default_max_parallelism() -> usize {
    8
}

fn default_step_timeout_secs() -> u64 {
    300
}

fn default_event_bus_capacity() -> usize {
    1024
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_parallelism: default_max_parallelism(),
            default_step_timeout_secs: default_step_timeout_secs(),
            run_timeout_secs: None,
            loop_iteration_limit: None,
            event_bus_capacity: default_event_bus_capacity(),
            database_url: None,
        }
    }
}

impl EngineConfig {
    /// Reject configurations the engine cannot run with.
    pub fn validate(&self) -> Result<(), String> {
        if self.max_parallelism == 0 {
            return Err("max_parallelism must be >= 1".to_string());
        }
        if self.default_step_timeout_secs == 0 {
            return Err("default_step_timeout_secs must be > 0".to_string());
        }
        if self.run_timeout_secs == Some(0) {
            return Err("run_timeout_secs must be > 0".to_string());
        }
        if self.event_bus_capacity == 0 {
            return Err("event_bus_capacity must be >= 1".to_string());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_engine_config_default_values() {
        let config = EngineConfig::default();
        assert_eq!(config.max_parallelism, 8);
        assert!(config.run_timeout_secs.is_none());
        assert!(config.loop_iteration_limit.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_engine_config_partial_json_uses_defaults() {
        let config: EngineConfig =
            serde_json::from_str(r#"{"max_parallelism": 2, "loop_iteration_limit": 50}"#).unwrap();
        assert_eq!(config.max_parallelism, 2);
        assert_eq!(config.loop_iteration_limit, Some(50));
        assert_eq!(config.default_step_timeout_secs, 300);
    }

    #[test]
    fn test_engine_config_rejects_zero_parallelism() {
        let config = EngineConfig {
            max_parallelism: 0,
            ..EngineConfig::default()
        };
        assert!(config.validate().unwrap_err().contains("max_parallelism"));
    }

    #[test]
    fn test_engine_config_rejects_zero_run_timeout() {
        let config: EngineConfig = serde_json::from_str(r#"{"run_timeout_secs": 0}"#).unwrap();
        assert!(config.validate().unwrap_err().contains("run_timeout_secs"));

        let config: EngineConfig = serde_json::from_str(r#"{"run_timeout_secs": 60}"#).unwrap();
        assert_eq!(config.run_timeout_secs, Some(60));
        assert!(config.validate().is_ok());
    }
}
