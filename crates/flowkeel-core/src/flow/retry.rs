//! Exponential-backoff retry decisions for node attempts.

use std::time::Duration;

use flowkeel_types::flow::RetryPolicy;

// ---------------------------------------------------------------------------
// RetryHandler
// ---------------------------------------------------------------------------

/// Stateless retry handler. All logic lives in associated functions that
/// take the policy as a parameter.
pub struct RetryHandler;

impl RetryHandler {
    /// Whether another attempt may follow `attempt` (1-based).
    pub fn should_retry(policy: &RetryPolicy, attempt: u32) -> bool {
        attempt < policy.maximum_attempts
    }

    /// Delay before the attempt that follows failed attempt `attempt`.
    ///
    /// `min(initial_interval * backoff_coefficient^(attempt-1), maximum_interval)`.
    pub fn backoff(policy: &RetryPolicy, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let secs = policy.initial_interval.as_secs_f64() * policy.backoff_coefficient.powi(exponent);
        let cap = policy.maximum_interval.as_secs_f64();
        if !secs.is_finite() || secs >= cap {
            policy.maximum_interval
        } else {
            Duration::from_secs_f64(secs.max(0.0))
        }
    }

    /// The full sequence of waits a policy produces when every attempt fails.
    pub fn schedule(policy: &RetryPolicy) -> Vec<Duration> {
        (1..policy.maximum_attempts)
            .map(|attempt| Self::backoff(policy, attempt))
            .collect()
    }

    /// Check a policy for values that make no sense at run time.
    pub fn validate(policy: &RetryPolicy) -> Result<(), String> {
        if policy.maximum_attempts == 0 {
            return Err("maximum_attempts must be at least 1".to_string());
        }
        if !policy.backoff_coefficient.is_finite() || policy.backoff_coefficient < 1.0 {
            return Err(format!(
                "backoff_coefficient must be a finite number >= 1.0, got {}",
                policy.backoff_coefficient
            ));
        }
        if chrono::Duration::from_std(policy.maximum_interval).is_err() {
            return Err(format!(
                "maximum_interval ({:?}) is out of range",
                policy.maximum_interval
            ));
        }
        if policy.maximum_interval < policy.initial_interval {
            return Err(format!(
                "maximum_interval ({:?}) is shorter than initial_interval ({:?})",
                policy.maximum_interval, policy.initial_interval
            ));
        }
        Ok(())
    }
}
