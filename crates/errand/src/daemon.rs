//! Daemon command: runs the scheduler loop until interrupted.
//!
//! The daemon wires together:
//! - The durable task store (single writer, owns the document while running)
//! - A command-backed agent for durable tasks
//! - An optional adaptive poller that feeds new tasks into the store

use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use miette::Result;
use serde_json::Value;
use tracing::{debug, info};

use errand_scheduler::{
    BackoffController, Clock, DEFAULT_EPHEMERAL_RETRIES, DelaySpec, DurableTaskStore,
    EphemeralQueue, RetryPolicy, RetryableInvoker, Scheduler, SchedulerConfig, SchedulerError,
    SystemClock, TaskSpec, task_action,
};

use crate::agent::{CommandAgent, run_shell};

/// Name of the ephemeral task that runs the poll command.
pub const POLL_TASK_NAME: &str = "Check for new tasks";

/// Poll cadence bounds, in minutes.
const POLL_INITIAL_MINUTES: f64 = 1.0;
const POLL_MAX_MINUTES: f64 = 60.0;

/// Configuration for the daemon.
pub struct DaemonConfig {
    pub store_path: PathBuf,
    /// Shell command that carries out a durable task.
    pub task_command: String,
    /// Shell command printing new tasks as a JSON array, if polling is enabled.
    pub poll_command: Option<String>,
    pub tick_interval: Duration,
    /// Retries per command invocation.
    pub tool_retries: u32,
}

/// Run the daemon.
pub async fn run(config: DaemonConfig) -> Result<()> {
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    let store = DurableTaskStore::open(&config.store_path, Arc::clone(&clock))
        .await
        .map_err(|e| miette::miette!("failed to open task store: {}", e))?;

    let invoker = RetryableInvoker::new(RetryPolicy::default().with_retries(config.tool_retries));
    let agent = Arc::new(CommandAgent::new(config.task_command, invoker.clone()));

    let scheduler = Arc::new(Scheduler::new(
        SchedulerConfig {
            tick_interval: config.tick_interval,
            ..SchedulerConfig::default()
        },
        clock,
        store.clone(),
        agent,
    ));

    if let Some(command) = config.poll_command {
        let poller = Poller::new(command, invoker, store, scheduler.queue().clone());
        poller
            .enqueue(DelaySpec::immediate())
            .map_err(|e| miette::miette!("failed to schedule poller: {}", e))?;
        info!("poller enabled");
    }

    scheduler.start();
    info!(
        store = %config.store_path.display(),
        tick_ms = config.tick_interval.as_millis() as u64,
        "daemon started"
    );

    shutdown_signal().await;
    info!("received shutdown signal");

    scheduler.shutdown().await;
    info!("daemon stopped");
    Ok(())
}

/// Resolve on Ctrl-C, or SIGTERM on unix.
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
            }
            Err(_) => {
                tokio::signal::ctrl_c().await.ok();
            }
        }
    }

    #[cfg(not(unix))]
    tokio::signal::ctrl_c().await.ok();
}

/// Periodically asks an external command for new durable tasks.
///
/// The wait between polls shrinks back to a minute whenever a poll finds
/// work and grows while polls come back empty.
pub struct Poller {
    command: String,
    invoker: RetryableInvoker,
    store: DurableTaskStore,
    queue: EphemeralQueue,
    cadence: Mutex<BackoffController>,
}

impl Poller {
    pub fn new(
        command: impl Into<String>,
        invoker: RetryableInvoker,
        store: DurableTaskStore,
        queue: EphemeralQueue,
    ) -> Arc<Self> {
        Arc::new(Self {
            command: command.into(),
            invoker,
            store,
            queue,
            cadence: Mutex::new(BackoffController::new(POLL_INITIAL_MINUTES, POLL_MAX_MINUTES)),
        })
    }

    /// Current wait between polls, in minutes.
    pub fn cadence_minutes(&self) -> f64 {
        self.cadence().current()
    }

    /// Queue the next poll after `delay`.
    pub fn enqueue(self: &Arc<Self>, delay: DelaySpec) -> Result<u64, SchedulerError> {
        let poller = Arc::clone(self);
        let action = task_action(move || {
            let poller = Arc::clone(&poller);
            async move { poller.poll().await }
        });
        self.queue
            .schedule(POLL_TASK_NAME, delay, DEFAULT_EPHEMERAL_RETRIES, action)
    }

    /// Run the poll command once and queue the next poll.
    ///
    /// Errors leave the cadence untouched and do not queue a follow-up; the
    /// scheduler's retry policy decides whether this poll runs again.
    pub async fn poll(self: &Arc<Self>) -> Result<(), SchedulerError> {
        let result = self
            .invoker
            .invoke("poll-command", || run_shell(&self.command, b""))
            .await?;
        let specs = parse_poll_output(&result.content)?;

        let found = specs.len();
        if found > 0 {
            self.store.add_tasks(specs).await?;
        }

        let next = {
            let mut cadence = self.cadence();
            if found > 0 {
                cadence.reset()
            } else {
                cadence.increase()
            }
        };
        debug!(found, next_poll_minutes = next, "poll finished");

        self.enqueue(DelaySpec::minutes(next))?;
        Ok(())
    }

    fn cadence(&self) -> std::sync::MutexGuard<'_, BackoffController> {
        self.cadence.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Parse the poll command's output into task specs.
///
/// Blank output means nothing new.
pub fn parse_poll_output(content: &Value) -> Result<Vec<TaskSpec>, SchedulerError> {
    match content {
        Value::String(text) if text.trim().is_empty() => Ok(Vec::new()),
        Value::String(text) => Ok(serde_json::from_str(text.trim())?),
        Value::Null => Ok(Vec::new()),
        other => Ok(serde_json::from_value(other.clone())?),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use async_trait::async_trait;
    use chrono::{DateTime, Utc};
    use errand_scheduler::{
        DurableTask, ExecutionOutcome, ManualClock, PRUNE_TASK_NAME, RecordingSleeper, TaskAgent,
        TickOutcome,
    };
    use pretty_assertions::assert_eq;
    use serde_json::json;

    const T0_MS: i64 = 1_700_000_000_000;

    fn t0() -> DateTime<Utc> {
        DateTime::from_timestamp_millis(T0_MS).unwrap()
    }

    struct NoopAgent;

    #[async_trait]
    impl TaskAgent for NoopAgent {
        async fn handle_task(&self, _task: &DurableTask) -> Result<(), SchedulerError> {
            Ok(())
        }
    }

    fn invoker() -> RetryableInvoker {
        RetryableInvoker::new(RetryPolicy::default().with_retries(0))
            .with_sleeper(Arc::new(RecordingSleeper::new()))
    }

    struct Harness {
        dir: tempfile::TempDir,
        clock: Arc<ManualClock>,
        scheduler: Scheduler,
    }

    async fn harness() -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let clock = Arc::new(ManualClock::new(t0()));
        let store = DurableTaskStore::open(dir.path().join("db.json"), clock.clone())
            .await
            .unwrap();
        let scheduler = Scheduler::new(
            SchedulerConfig::default(),
            clock.clone(),
            store,
            Arc::new(NoopAgent),
        );
        Harness {
            dir,
            clock,
            scheduler,
        }
    }

    fn poller(h: &Harness, command: &str) -> Arc<Poller> {
        Poller::new(
            command,
            invoker(),
            h.scheduler.store().clone(),
            h.scheduler.queue().clone(),
        )
    }

    fn queued(h: &Harness) -> Vec<(String, DateTime<Utc>)> {
        h.scheduler
            .queue()
            .snapshot()
            .into_iter()
            .map(|t| (t.name, t.scheduled_at))
            .collect()
    }

    #[test]
    fn test_parse_poll_output_blank_is_empty() {
        assert!(parse_poll_output(&json!("")).unwrap().is_empty());
        assert!(parse_poll_output(&json!("  \n")).unwrap().is_empty());
        assert!(parse_poll_output(&Value::Null).unwrap().is_empty());
    }

    #[test]
    fn test_parse_poll_output_reads_task_specs() {
        let output = json!(
            r#"[{"task": "answer the question about shipping", "url": "https://x/chat/1",
                 "scheduleExecutionIn": {"minutes": 5}}]"#
        );
        let specs = parse_poll_output(&output).unwrap();
        assert_eq!(
            specs,
            vec![
                TaskSpec::new("answer the question about shipping", DelaySpec::minutes(5.0))
                    .with_url("https://x/chat/1")
            ]
        );
    }

    #[test]
    fn test_parse_poll_output_rejects_garbage() {
        let err = parse_poll_output(&json!("not json")).unwrap_err();
        assert!(matches!(err, SchedulerError::Json(_)));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_empty_polls_back_off() {
        let h = harness().await;
        let poller = poller(&h, "true");

        poller.poll().await.unwrap();
        assert_eq!(poller.cadence_minutes(), 2.0);
        poller.poll().await.unwrap();
        assert_eq!(poller.cadence_minutes(), 3.0);

        let at = |minutes: i64| t0() + chrono::Duration::minutes(minutes);
        assert_eq!(
            queued(&h),
            vec![
                (POLL_TASK_NAME.to_string(), at(2)),
                (POLL_TASK_NAME.to_string(), at(3)),
            ]
        );
        assert!(h.scheduler.store().tasks().is_empty());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_poll_with_tasks_stores_them_and_resets() {
        let h = harness().await;
        let inbox = h.dir.path().join("inbox.json");
        std::fs::write(&inbox, "").unwrap();
        let poller = poller(&h, &format!("cat '{}'", inbox.display()));

        poller.poll().await.unwrap();
        poller.poll().await.unwrap();
        assert_eq!(poller.cadence_minutes(), 3.0);

        std::fs::write(
            &inbox,
            r#"[{"task": "follow up", "scheduleExecutionIn": {"hours": 1}}]"#,
        )
        .unwrap();
        poller.poll().await.unwrap();
        assert_eq!(poller.cadence_minutes(), 1.0);

        let tasks = h.scheduler.store().tasks();
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].description, "follow up");
        assert_eq!(tasks[0].scheduled_at, t0() + chrono::Duration::hours(1));

        // Adding tasks queued a prune pass alongside the polls
        let names: Vec<String> = queued(&h).into_iter().map(|(name, _)| name).collect();
        assert!(names.iter().any(|n| n == PRUNE_TASK_NAME));
        assert_eq!(names.iter().filter(|n| *n == POLL_TASK_NAME).count(), 3);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_failed_poll_is_retried_by_scheduler() {
        let h = harness().await;
        let poller = poller(&h, "echo down >&2; exit 1");
        poller.enqueue(DelaySpec::immediate()).unwrap();

        let outcome = h.scheduler.tick().await;
        let TickOutcome::Executed(execution) = outcome else {
            panic!("expected the poll to run, got {:?}", outcome);
        };
        assert_eq!(execution.name, POLL_TASK_NAME);
        assert!(matches!(
            execution.outcome,
            ExecutionOutcome::Rescheduled { attempt: 1, .. }
        ));

        // No follow-up poll beyond the retry, and the cadence is unchanged
        assert_eq!(h.scheduler.queue().len(), 1);
        assert_eq!(poller.cadence_minutes(), 1.0);

        h.clock.advance(chrono::Duration::minutes(1));
        let outcome = h.scheduler.tick().await;
        let TickOutcome::Executed(execution) = outcome else {
            panic!("expected the retry to run, got {:?}", outcome);
        };
        assert_eq!(execution.name, format!("{} (retry 1)", POLL_TASK_NAME));
    }
}
