//! Scheduler types.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::SchedulerError;

const MS_PER_MINUTE: f64 = 60_000.0;
const MS_PER_HOUR: f64 = 3_600_000.0;
const MS_PER_DAY: f64 = 86_400_000.0;

/// A relative delay. Absent fields count as zero.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct DelaySpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub minutes: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hours: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub days: Option<f64>,
}

impl DelaySpec {
    /// No delay at all.
    pub fn immediate() -> Self {
        Self::default()
    }

    pub fn minutes(minutes: f64) -> Self {
        Self {
            minutes: Some(minutes),
            ..Self::default()
        }
    }

    pub fn hours(hours: f64) -> Self {
        Self {
            hours: Some(hours),
            ..Self::default()
        }
    }

    pub fn days(days: f64) -> Self {
        Self {
            days: Some(days),
            ..Self::default()
        }
    }

    /// The delay in milliseconds, rounded to the nearest millisecond.
    pub fn delay_ms(&self) -> i64 {
        let ms = self.minutes.unwrap_or(0.0) * MS_PER_MINUTE
            + self.hours.unwrap_or(0.0) * MS_PER_HOUR
            + self.days.unwrap_or(0.0) * MS_PER_DAY;
        ms.round() as i64
    }

    /// Reject delays that are negative or not finite.
    pub fn validate(&self) -> Result<(), SchedulerError> {
        for (field, value) in [
            ("minutes", self.minutes),
            ("hours", self.hours),
            ("days", self.days),
        ] {
            if let Some(v) = value
                && (!v.is_finite() || v < 0.0)
            {
                return Err(SchedulerError::InvalidTask(format!(
                    "{} must be a non-negative number, got {}",
                    field, v
                )));
            }
        }
        Ok(())
    }

    /// The absolute time this delay ends at when started from `now`,
    /// at millisecond precision.
    pub fn due_from(&self, now: DateTime<Utc>) -> Result<DateTime<Utc>, SchedulerError> {
        self.validate()?;
        now.timestamp_millis()
            .checked_add(self.delay_ms())
            .and_then(DateTime::from_timestamp_millis)
            .ok_or_else(|| SchedulerError::InvalidTask(format!("delay out of range: {:?}", self)))
    }
}

/// Input for a new durable task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskSpec {
    /// Instructions for the agent.
    #[serde(rename = "task")]
    pub description: String,
    /// Page the task should be performed on.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    /// How long from now the task should run.
    #[serde(rename = "scheduleExecutionIn", default)]
    pub delay: DelaySpec,
}

impl TaskSpec {
    pub fn new(description: impl Into<String>, delay: DelaySpec) -> Self {
        Self {
            description: description.into(),
            url: None,
            delay,
        }
    }

    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }
}

/// A persisted task, executed by delegating to the agent.
///
/// `scheduled_at` is fixed when the task is stored and never recomputed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DurableTask {
    #[serde(rename = "task")]
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(rename = "scheduleExecutionIn", default)]
    pub delay: DelaySpec,
    #[serde(
        rename = "scheduledTimestamp",
        with = "chrono::serde::ts_milliseconds"
    )]
    pub scheduled_at: DateTime<Utc>,
}

impl DurableTask {
    /// Stamp a spec with its absolute due time.
    pub fn from_spec(spec: TaskSpec, now: DateTime<Utc>) -> Result<Self, SchedulerError> {
        let scheduled_at = spec.delay.due_from(now)?;
        Ok(Self {
            description: spec.description,
            url: spec.url,
            delay: spec.delay,
            scheduled_at,
        })
    }
}

/// Retry bookkeeping carried by an ephemeral task.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetrySpec {
    /// Retries left after the current attempt.
    pub remaining: u32,
    /// 1-based attempt counter.
    pub attempt: u32,
    /// Delay before the next retry, in minutes.
    pub backoff_minutes: f64,
}

impl RetrySpec {
    /// Retry spec for a freshly scheduled task, or `None` when `retries` is 0.
    pub fn initial(retries: u32) -> Option<Self> {
        (retries > 0).then_some(Self {
            remaining: retries,
            attempt: 1,
            backoff_minutes: 1.0,
        })
    }
}

/// Future returned by a task action.
pub type TaskFuture = Pin<Box<dyn Future<Output = Result<(), SchedulerError>> + Send>>;

/// The work an ephemeral task performs. Callable again on retry.
pub type TaskAction = Arc<dyn Fn() -> TaskFuture + Send + Sync>;

/// Wrap an async closure as a [`TaskAction`].
pub fn task_action<F, Fut>(f: F) -> TaskAction
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), SchedulerError>> + Send + 'static,
{
    Arc::new(move || Box::pin(f()))
}

/// An in-memory task carrying its own action. Lost on restart.
#[derive(Clone)]
pub struct EphemeralTask {
    pub(crate) id: u64,
    pub name: String,
    pub scheduled_at: DateTime<Utc>,
    pub action: TaskAction,
    pub retry: Option<RetrySpec>,
}

impl EphemeralTask {
    pub fn new(name: impl Into<String>, scheduled_at: DateTime<Utc>, action: TaskAction) -> Self {
        Self {
            id: 0,
            name: name.into(),
            scheduled_at,
            action,
            retry: None,
        }
    }

    pub fn with_retry(mut self, retry: Option<RetrySpec>) -> Self {
        self.retry = retry;
        self
    }
}

impl fmt::Debug for EphemeralTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EphemeralTask")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("scheduled_at", &self.scheduled_at)
            .field("retry", &self.retry)
            .finish_non_exhaustive()
    }
}

/// Where a due task came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskSource {
    Ephemeral,
    Durable,
}

impl fmt::Display for TaskSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskSource::Ephemeral => write!(f, "ephemeral"),
            TaskSource::Durable => write!(f, "durable"),
        }
    }
}

/// A candidate for execution on a tick.
#[derive(Debug, Clone)]
pub enum DueTask {
    Ephemeral(EphemeralTask),
    Durable(DurableTask),
}

impl DueTask {
    pub fn scheduled_at(&self) -> DateTime<Utc> {
        match self {
            DueTask::Ephemeral(task) => task.scheduled_at,
            DueTask::Durable(task) => task.scheduled_at,
        }
    }

    pub fn source(&self) -> TaskSource {
        match self {
            DueTask::Ephemeral(_) => TaskSource::Ephemeral,
            DueTask::Durable(_) => TaskSource::Durable,
        }
    }

    /// Human-readable label for logs.
    pub fn label(&self) -> &str {
        match self {
            DueTask::Ephemeral(task) => &task.name,
            DueTask::Durable(task) => &task.description,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;

    #[test]
    fn test_delay_ms_minutes() {
        assert_eq!(DelaySpec::minutes(90.0).delay_ms(), 5_400_000);
    }

    #[test]
    fn test_delay_ms_hours_and_days() {
        let delay = DelaySpec {
            hours: Some(1.0),
            days: Some(1.0),
            ..DelaySpec::default()
        };
        assert_eq!(delay.delay_ms(), 90_000_000);
    }

    #[test]
    fn test_delay_ms_defaults_to_zero() {
        assert_eq!(DelaySpec::immediate().delay_ms(), 0);
    }

    #[test]
    fn test_validate_rejects_negative_and_nan() {
        assert!(DelaySpec::minutes(-1.0).validate().is_err());
        assert!(DelaySpec::hours(f64::NAN).validate().is_err());
        assert!(DelaySpec::days(f64::INFINITY).validate().is_err());
        assert!(DelaySpec::minutes(0.5).validate().is_ok());
    }

    #[test]
    fn test_due_from_adds_delay() {
        let now = DateTime::from_timestamp_millis(1_700_000_000_000).unwrap();
        let due = DelaySpec::hours(2.0).due_from(now).unwrap();
        assert_eq!(due - now, chrono::TimeDelta::hours(2));
    }

    #[test]
    fn test_due_from_rejects_overflow() {
        let now = Utc::now();
        assert!(DelaySpec::days(1e300).due_from(now).is_err());
    }

    #[test]
    fn test_retry_spec_initial() {
        assert_eq!(RetrySpec::initial(0), None);
        assert_eq!(
            RetrySpec::initial(2),
            Some(RetrySpec {
                remaining: 2,
                attempt: 1,
                backoff_minutes: 1.0,
            })
        );
    }

    #[test]
    fn test_durable_task_document_layout() {
        let json = serde_json::json!({
            "task": "Reply to the buyer",
            "url": "https://example.com/chat/1",
            "scheduleExecutionIn": { "hours": 1 },
            "scheduledTimestamp": 1_700_000_000_000i64,
        });

        let task: DurableTask = serde_json::from_value(json.clone()).unwrap();
        assert_eq!(task.description, "Reply to the buyer");
        assert_eq!(task.url.as_deref(), Some("https://example.com/chat/1"));
        assert_eq!(task.delay, DelaySpec::hours(1.0));
        assert_eq!(task.scheduled_at.timestamp_millis(), 1_700_000_000_000);

        let back = serde_json::to_value(&task).unwrap();
        assert_eq!(back["task"], json["task"]);
        assert_eq!(back["scheduledTimestamp"], json["scheduledTimestamp"]);
        assert_eq!(back["scheduleExecutionIn"]["hours"], 1.0);
        assert!(back["scheduleExecutionIn"].get("minutes").is_none());
    }

    #[test]
    fn test_task_spec_without_delay_or_url() {
        let spec: TaskSpec = serde_json::from_str(r#"{"task":"Check inbox"}"#).unwrap();
        assert_eq!(spec, TaskSpec::new("Check inbox", DelaySpec::immediate()));
    }

    #[test]
    fn test_due_task_accessors() {
        let now = DateTime::from_timestamp_millis(1_700_000_000_000).unwrap();
        let durable = DurableTask::from_spec(TaskSpec::new("follow up", DelaySpec::immediate()), now)
            .unwrap();
        let due = DueTask::Durable(durable);
        assert_eq!(due.source(), TaskSource::Durable);
        assert_eq!(due.label(), "follow up");
        assert_eq!(due.scheduled_at(), now);

        let ephemeral = EphemeralTask::new("tick", now, task_action(|| async { Ok(()) }));
        let due = DueTask::Ephemeral(ephemeral);
        assert_eq!(due.source(), TaskSource::Ephemeral);
        assert_eq!(due.label(), "tick");
    }

    proptest! {
        #[test]
        fn delay_ms_is_linear(minutes in 0u32..10_000, hours in 0u32..1_000, days in 0u32..100) {
            let delay = DelaySpec {
                minutes: Some(minutes as f64),
                hours: Some(hours as f64),
                days: Some(days as f64),
            };
            let expected = minutes as i64 * 60_000 + hours as i64 * 3_600_000 + days as i64 * 86_400_000;
            prop_assert_eq!(delay.delay_ms(), expected);
        }
    }
}
