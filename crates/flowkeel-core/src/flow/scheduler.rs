//! Cron ticks for schedule-triggered flows.
//!
//! Wraps `tokio-cron-scheduler` with per-flow job bookkeeping, accepts
//! 5-field, 6-field, and a few human-readable schedules, and computes missed
//! ticks with `croner` so a restarted worker can catch up.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use tokio_cron_scheduler::{Job, JobScheduler};
use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error("scheduler error: {0}")]
    Job(String),

    #[error("invalid schedule: {0}")]
    InvalidSchedule(String),

    #[error("flow '{0}' is not scheduled")]
    NotScheduled(String),

    #[error("scheduler is not running")]
    NotRunning,
}

// ---------------------------------------------------------------------------
// Schedule normalization
// ---------------------------------------------------------------------------

fn is_cron_field(field: &str) -> bool {
    field
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '*' | '/' | ',' | '-' | '?' | '#'))
}

/// Normalize a schedule string to a 6-field (seconds-first) cron expression.
///
/// Accepted, case-insensitive:
/// - 5-field cron (a `0` seconds field is prepended) and 6-field cron
/// - "every N seconds|minutes|hours", "every minute|hour|day"
/// - "minutely", "hourly", "daily"
/// - "every day at HH:MM"
///
/// The result is parsed with `croner`, so field values out of range or
/// unknown names are rejected here rather than when the job is created.
pub fn normalize_schedule(input: &str) -> Result<String, SchedulerError> {
    let expr = to_cron_expression(input)?;
    expr.parse::<croner::Cron>()
        .map_err(|e| SchedulerError::InvalidSchedule(format!("'{}': {e}", input.trim())))?;
    Ok(expr)
}

fn to_cron_expression(input: &str) -> Result<String, SchedulerError> {
    let trimmed = input.trim();
    let invalid = || SchedulerError::InvalidSchedule(input.to_string());

    let fields: Vec<&str> = trimmed.split_whitespace().collect();
    if (fields.len() == 5 || fields.len() == 6) && fields.iter().all(|f| is_cron_field(f)) {
        let joined = fields.join(" ");
        return Ok(if fields.len() == 5 {
            format!("0 {joined}")
        } else {
            joined
        });
    }

    let lower = trimmed.to_lowercase();
    match lower.as_str() {
        "every minute" | "minutely" => return Ok("0 * * * * *".to_string()),
        "every hour" | "hourly" => return Ok("0 0 * * * *".to_string()),
        "every day" | "daily" => return Ok("0 0 0 * * *".to_string()),
        _ => {}
    }

    let Some(rest) = lower.strip_prefix("every ") else {
        return Err(SchedulerError::InvalidSchedule(format!(
            "unrecognized schedule format: '{trimmed}'"
        )));
    };

    if let Some(at) = rest.strip_prefix("day at ") {
        let (hour, minute) = at.split_once(':').ok_or_else(invalid)?;
        let hour: u32 = hour.trim().parse().map_err(|_| invalid())?;
        let minute: u32 = minute.trim().parse().map_err(|_| invalid())?;
        if hour >= 24 || minute >= 60 {
            return Err(invalid());
        }
        return Ok(format!("0 {minute} {hour} * * *"));
    }

    let words: Vec<&str> = rest.split_whitespace().collect();
    let [count, unit] = words.as_slice() else {
        return Err(invalid());
    };
    let n: u32 = count.parse().map_err(|_| invalid())?;
    if n == 0 {
        return Err(SchedulerError::InvalidSchedule(
            "interval must be > 0".to_string(),
        ));
    }
    match unit.trim_end_matches('s') {
        "second" => Ok(format!("*/{n} * * * * *")),
        "minute" => Ok(format!("0 */{n} * * * *")),
        "hour" => Ok(format!("0 0 */{n} * * *")),
        _ => Err(invalid()),
    }
}

/// Ticks of `schedule` strictly after `since` and strictly before `now`.
///
/// Unparseable schedules yield no ticks.
pub fn missed_ticks(
    schedule: &str,
    since: DateTime<Utc>,
    now: DateTime<Utc>,
) -> Vec<DateTime<Utc>> {
    let Ok(cron) = normalize_schedule(schedule).and_then(|expr| {
        expr.parse::<croner::Cron>()
            .map_err(|e| SchedulerError::InvalidSchedule(e.to_string()))
    }) else {
        return Vec::new();
    };
    cron.iter_after(since).take_while(|t| *t < now).collect()
}

// ---------------------------------------------------------------------------
// CronScheduler
// ---------------------------------------------------------------------------

/// Invoked with the flow name and fire time each time a job ticks.
pub type CronCallback =
    Arc<dyn Fn(String, DateTime<Utc>) -> futures_util::future::BoxFuture<'static, ()> + Send + Sync>;

struct ScheduledFlow {
    job_id: Uuid,
    cron_expr: String,
    last_fired: Option<DateTime<Utc>>,
}

/// Per-flow cron jobs on top of `tokio_cron_scheduler::JobScheduler`.
pub struct CronScheduler {
    inner: Arc<RwLock<Option<JobScheduler>>>,
    flows: Arc<RwLock<HashMap<String, ScheduledFlow>>>,
}

impl CronScheduler {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RwLock::new(None)),
            flows: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub async fn start(&self) -> Result<(), SchedulerError> {
        let scheduler = JobScheduler::new()
            .await
            .map_err(|e| SchedulerError::Job(e.to_string()))?;
        scheduler
            .start()
            .await
            .map_err(|e| SchedulerError::Job(e.to_string()))?;

        *self.inner.write().await = Some(scheduler);
        tracing::info!("cron scheduler started");
        Ok(())
    }

    pub async fn is_running(&self) -> bool {
        self.inner.read().await.is_some()
    }

    /// Stop the scheduler and forget every job.
    pub async fn stop(&self) -> Result<(), SchedulerError> {
        if let Some(mut scheduler) = self.inner.write().await.take() {
            scheduler
                .shutdown()
                .await
                .map_err(|e| SchedulerError::Job(e.to_string()))?;
            tracing::info!("cron scheduler stopped");
        }
        self.flows.write().await.clear();
        Ok(())
    }

    /// Add a job that calls `callback` on every tick of `schedule`.
    /// Replaces an existing job for the same flow.
    pub async fn schedule_flow(
        &self,
        flow_name: &str,
        schedule: &str,
        callback: CronCallback,
    ) -> Result<(), SchedulerError> {
        let cron_expr = normalize_schedule(schedule)?;
        if self.flows.read().await.contains_key(flow_name) {
            self.unschedule_flow(flow_name).await?;
        }

        let inner = self.inner.read().await;
        let scheduler = inner.as_ref().ok_or(SchedulerError::NotRunning)?;

        let name = flow_name.to_string();
        let job = Job::new_async(cron_expr.as_str(), move |_uuid, _lock| {
            let cb = callback.clone();
            let name = name.clone();
            Box::pin(async move {
                let now = Utc::now();
                tracing::debug!(flow = %name, %now, "cron tick");
                cb(name, now).await;
            })
        })
        .map_err(|e| SchedulerError::InvalidSchedule(e.to_string()))?;

        let job_id = job.guid();
        scheduler
            .add(job)
            .await
            .map_err(|e| SchedulerError::Job(e.to_string()))?;

        self.flows.write().await.insert(
            flow_name.to_string(),
            ScheduledFlow {
                job_id,
                cron_expr: cron_expr.clone(),
                last_fired: None,
            },
        );
        tracing::info!(flow = flow_name, cron = %cron_expr, %job_id, "flow scheduled");
        Ok(())
    }

    pub async fn unschedule_flow(&self, flow_name: &str) -> Result<(), SchedulerError> {
        let entry = self
            .flows
            .write()
            .await
            .remove(flow_name)
            .ok_or_else(|| SchedulerError::NotScheduled(flow_name.to_string()))?;

        if let Some(scheduler) = self.inner.read().await.as_ref() {
            scheduler
                .remove(&entry.job_id)
                .await
                .map_err(|e| SchedulerError::Job(e.to_string()))?;
        }
        tracing::info!(flow = flow_name, "flow unscheduled");
        Ok(())
    }

    /// Remember that a flow's tick was handled, for missed-tick detection.
    pub async fn record_fire(&self, flow_name: &str, at: DateTime<Utc>) {
        if let Some(entry) = self.flows.write().await.get_mut(flow_name) {
            entry.last_fired = Some(at);
        }
    }

    pub async fn last_fired(&self, flow_name: &str) -> Option<DateTime<Utc>> {
        self.flows
            .read()
            .await
            .get(flow_name)
            .and_then(|f| f.last_fired)
    }

    pub async fn cron_expr(&self, flow_name: &str) -> Option<String> {
        self.flows
            .read()
            .await
            .get(flow_name)
            .map(|f| f.cron_expr.clone())
    }

    pub async fn flow_count(&self) -> usize {
        self.flows.read().await.len()
    }
}

impl Default for CronScheduler {
    fn default() -> Self {
        Self::new()
    }
}
