//! Single-flight scheduler over ephemeral and durable tasks.
//!
//! Every tick the scheduler looks at the in-memory ephemeral tasks and the
//! durable tasks in the store, and runs the single earliest due one. At most
//! one task runs at a time; ticks that land while a task is in flight do
//! nothing.
//!
//! Failure handling differs by kind. A failed ephemeral task is requeued
//! with a growing delay while it has retries left, then dropped. A failed
//! durable task stays in the store untouched and is picked again on a later
//! tick, with no delay and no bound.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, trace, warn};

use crate::backoff::BackoffController;
use crate::clock::Clock;
use crate::store::DurableTaskStore;
use crate::types::{
    DelaySpec, DueTask, DurableTask, EphemeralTask, RetrySpec, TaskAction, TaskSource, task_action,
};
use crate::SchedulerError;

/// Name of the maintenance task enqueued after durable tasks are added.
pub const PRUNE_TASK_NAME: &str = "Prune tasks";

/// Retries given to ephemeral tasks scheduled without an explicit count.
pub const DEFAULT_EPHEMERAL_RETRIES: u32 = 2;

/// Lower bound on the tick period.
const MIN_TICK_INTERVAL: Duration = Duration::from_millis(10);

/// Executes durable tasks on the scheduler's behalf.
#[async_trait]
pub trait TaskAgent: Send + Sync {
    /// Carry out a durable task.
    ///
    /// Only return an error for failures worth retrying; the task stays in
    /// the store and runs again.
    async fn handle_task(&self, task: &DurableTask) -> Result<(), SchedulerError>;

    /// Remove redundant follow-ups from the store.
    async fn prune_tasks(&self, store: &DurableTaskStore) -> Result<(), SchedulerError> {
        store.prune_superseded().await?;
        Ok(())
    }
}

/// Scheduler settings.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SchedulerConfig {
    /// How often the loop looks for due work.
    pub tick_interval: Duration,
    /// Growth factor of the ephemeral retry delay.
    pub retry_backoff_factor: f64,
    /// Ceiling of the ephemeral retry delay, in minutes.
    pub retry_backoff_max_minutes: f64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_secs(1),
            retry_backoff_factor: crate::backoff::DEFAULT_FACTOR,
            retry_backoff_max_minutes: 60.0,
        }
    }
}

/// The set of pending ephemeral tasks.
///
/// Cheaply cloneable handle for producers.
#[derive(Clone)]
pub struct EphemeralQueue {
    tasks: Arc<Mutex<Vec<EphemeralTask>>>,
    next_id: Arc<AtomicU64>,
    clock: Arc<dyn Clock>,
}

impl EphemeralQueue {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            tasks: Arc::new(Mutex::new(Vec::new())),
            next_id: Arc::new(AtomicU64::new(1)),
            clock,
        }
    }

    /// Add a task, returning the id it was stored under.
    pub fn add(&self, mut task: EphemeralTask) -> u64 {
        task.id = self.next_id.fetch_add(1, Ordering::Relaxed);
        debug!(id = task.id, name = %task.name, at = %task.scheduled_at, "queued ephemeral task");
        let id = task.id;
        self.lock().push(task);
        id
    }

    /// Queue `action` to run after `delay`, with `retries` retries on failure.
    pub fn schedule(
        &self,
        name: impl Into<String>,
        delay: DelaySpec,
        retries: u32,
        action: TaskAction,
    ) -> Result<u64, SchedulerError> {
        let scheduled_at = delay.due_from(self.clock.now())?;
        let task =
            EphemeralTask::new(name, scheduled_at, action).with_retry(RetrySpec::initial(retries));
        Ok(self.add(task))
    }

    /// Snapshot of the pending tasks in insertion order.
    pub fn snapshot(&self) -> Vec<EphemeralTask> {
        self.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn remove(&self, id: u64) -> Option<EphemeralTask> {
        let mut tasks = self.lock();
        let idx = tasks.iter().position(|t| t.id == id)?;
        Some(tasks.remove(idx))
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<EphemeralTask>> {
        self.tasks.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// What a tick did.
#[derive(Debug, Clone, PartialEq)]
pub enum TickOutcome {
    /// A task was already in flight.
    Busy,
    /// Nothing was due.
    Idle,
    /// One task ran.
    Executed(Execution),
}

/// The task a tick ran and how it ended.
#[derive(Debug, Clone, PartialEq)]
pub struct Execution {
    pub source: TaskSource,
    pub name: String,
    pub outcome: ExecutionOutcome,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ExecutionOutcome {
    /// Finished; the task is gone.
    Completed,
    /// Ephemeral failure, requeued as a retry.
    Rescheduled {
        retry_at: DateTime<Utc>,
        attempt: u32,
    },
    /// Ephemeral failure with no retries left.
    Dropped { error: String },
    /// Durable failure; the task stays in the store.
    Retained { error: String },
    /// The durable task ran but could not be removed from the store.
    BookkeepingFailed { error: String },
}

/// Resets the in-flight flag when a tick ends, including by panic.
struct BusyGuard<'a>(&'a watch::Sender<bool>);

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        self.0.send_replace(false);
    }
}

/// The running timer and the switch that ends it.
struct Timer {
    stop: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl Timer {
    fn is_active(&self) -> bool {
        !*self.stop.borrow() && !self.task.is_finished()
    }
}

/// The scheduler loop.
pub struct Scheduler {
    config: SchedulerConfig,
    clock: Arc<dyn Clock>,
    store: DurableTaskStore,
    agent: Arc<dyn TaskAgent>,
    queue: EphemeralQueue,
    busy: watch::Sender<bool>,
    timer: Mutex<Option<Timer>>,
}

impl Scheduler {
    /// Create a stopped scheduler.
    ///
    /// Registers a hook on `store` so that every batch of added durable
    /// tasks enqueues an immediate [`PRUNE_TASK_NAME`] task.
    pub fn new(
        config: SchedulerConfig,
        clock: Arc<dyn Clock>,
        store: DurableTaskStore,
        agent: Arc<dyn TaskAgent>,
    ) -> Self {
        let queue = EphemeralQueue::new(Arc::clone(&clock));
        register_prune_hook(&store, &queue, &agent);
        let (busy, _) = watch::channel(false);

        Self {
            config,
            clock,
            store,
            agent,
            queue,
            busy,
            timer: Mutex::new(None),
        }
    }

    /// Handle for adding ephemeral tasks.
    pub fn queue(&self) -> &EphemeralQueue {
        &self.queue
    }

    pub fn store(&self) -> &DurableTaskStore {
        &self.store
    }

    /// Add an ephemeral task to the active set.
    pub fn add_ephemeral_task(&self, task: EphemeralTask) -> u64 {
        self.queue.add(task)
    }

    /// Start ticking. Calling this while running does nothing.
    pub fn start(self: &Arc<Self>) {
        let mut timer = self.timer.lock().unwrap_or_else(PoisonError::into_inner);
        if timer.as_ref().is_some_and(Timer::is_active) {
            debug!("scheduler already running");
            return;
        }

        let period = self.config.tick_interval.max(MIN_TICK_INTERVAL);
        if period != self.config.tick_interval {
            debug!(
                requested_ms = self.config.tick_interval.as_millis() as u64,
                tick_ms = period.as_millis() as u64,
                "tick interval raised to minimum"
            );
        }

        let (stop_tx, mut stop_rx) = watch::channel(false);
        let scheduler = Arc::clone(self);
        let task = tokio::spawn(async move {
            let mut interval = tokio::time::interval_at(Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    biased;
                    _ = stop_rx.changed() => break,
                    _ = interval.tick() => {}
                }

                // Own task so a panicking action ends only this tick
                let scheduler = Arc::clone(&scheduler);
                if let Err(e) = tokio::spawn(async move { scheduler.tick().await }).await {
                    error!(error = %e, "tick panicked");
                }
            }
            debug!("scheduler timer exited");
        });
        *timer = Some(Timer {
            stop: stop_tx,
            task,
        });

        info!(tick_ms = period.as_millis() as u64, "scheduler started");
    }

    /// Stop ticking. A task already in flight keeps running; no tick
    /// starts after this returns.
    pub fn stop(&self) {
        let timer = self.timer.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(timer) = timer.as_ref()
            && timer.is_active()
        {
            timer.stop.send_replace(true);
            info!("scheduler stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        self.timer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(Timer::is_active)
    }

    /// Whether a task is executing right now.
    pub fn is_processing(&self) -> bool {
        *self.busy.borrow()
    }

    /// Wait until no task is executing.
    pub async fn wait_idle(&self) {
        let mut busy = self.busy.subscribe();
        let _ = busy.wait_for(|busy| !*busy).await;
    }

    /// Stop ticking and wait for the in-flight task, if any, to finish.
    pub async fn shutdown(&self) {
        self.stop();
        if self.is_processing() {
            info!("waiting for in-flight task before shutdown");
        }

        let timer = self
            .timer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(timer) = timer
            && let Err(e) = timer.task.await
        {
            error!(error = %e, "scheduler timer failed");
        }

        // Covers ticks driven by callers other than the timer
        self.wait_idle().await;
    }

    /// Run the earliest due task, if any and if nothing else is running.
    pub async fn tick(&self) -> TickOutcome {
        let acquired = self.busy.send_if_modified(|busy| {
            if *busy {
                false
            } else {
                *busy = true;
                true
            }
        });
        if !acquired {
            trace!("tick skipped, task in flight");
            return TickOutcome::Busy;
        }
        let _guard = BusyGuard(&self.busy);

        let Some(next) = self.next_due(self.clock.now()) else {
            return TickOutcome::Idle;
        };

        let source = next.source();
        let name = next.label().to_string();
        let outcome = match next {
            DueTask::Ephemeral(task) => self.run_ephemeral(task).await,
            DueTask::Durable(task) => self.run_durable(task).await,
        };

        TickOutcome::Executed(Execution {
            source,
            name,
            outcome,
        })
    }

    /// The earliest task due at `now`.
    ///
    /// Ephemeral tasks are listed before durable ones and the first of
    /// several equally early tasks wins.
    fn next_due(&self, now: DateTime<Utc>) -> Option<DueTask> {
        self.queue
            .snapshot()
            .into_iter()
            .map(DueTask::Ephemeral)
            .chain(self.store.tasks().into_iter().map(DueTask::Durable))
            .filter(|task| task.scheduled_at() <= now)
            .min_by_key(DueTask::scheduled_at)
    }

    #[tracing::instrument(skip(self, task), fields(name = %task.name))]
    async fn run_ephemeral(&self, task: EphemeralTask) -> ExecutionOutcome {
        // Out of the active set before it runs
        self.queue.remove(task.id);
        info!("running ephemeral task");

        match (task.action)().await {
            Ok(()) => {
                info!("completed ephemeral task");
                ExecutionOutcome::Completed
            }
            Err(e) => self.retry_ephemeral(task, e),
        }
    }

    fn retry_ephemeral(&self, task: EphemeralTask, failure: SchedulerError) -> ExecutionOutcome {
        let retry = match task.retry {
            Some(retry) if retry.remaining > 0 => retry,
            _ => {
                error!(error = %failure, "ephemeral task failed, no retries left");
                return ExecutionOutcome::Dropped {
                    error: failure.to_string(),
                };
            }
        };

        match self.next_retry(&task, retry, self.clock.now()) {
            Ok(next) => {
                let retry_at = next.scheduled_at;
                warn!(
                    error = %failure,
                    attempt = retry.attempt,
                    remaining = retry.remaining,
                    retry_at = %retry_at,
                    "ephemeral task failed, scheduled retry"
                );
                self.queue.add(next);
                ExecutionOutcome::Rescheduled {
                    retry_at,
                    attempt: retry.attempt,
                }
            }
            Err(e) => {
                error!(error = %failure, retry_error = %e, "ephemeral task failed, could not schedule retry");
                ExecutionOutcome::Dropped {
                    error: failure.to_string(),
                }
            }
        }
    }

    /// Build the follow-up attempt for a failed ephemeral task.
    fn next_retry(
        &self,
        task: &EphemeralTask,
        retry: RetrySpec,
        now: DateTime<Utc>,
    ) -> Result<EphemeralTask, SchedulerError> {
        let retry_at = DelaySpec::minutes(retry.backoff_minutes).due_from(now)?;
        let mut backoff =
            BackoffController::new(retry.backoff_minutes, self.config.retry_backoff_max_minutes)
                .with_factor(self.config.retry_backoff_factor);

        let next = RetrySpec {
            remaining: retry.remaining - 1,
            attempt: retry.attempt + 1,
            backoff_minutes: backoff.increase(),
        };

        Ok(EphemeralTask::new(
            format!("{} (retry {})", task.name, retry.attempt),
            retry_at,
            Arc::clone(&task.action),
        )
        .with_retry(Some(next)))
    }

    #[tracing::instrument(skip(self, task), fields(task = %task.description, url = ?task.url))]
    async fn run_durable(&self, task: DurableTask) -> ExecutionOutcome {
        info!("running durable task");

        if let Err(e) = self.agent.handle_task(&task).await {
            warn!(error = %e, "durable task failed, leaving it in the store");
            return ExecutionOutcome::Retained {
                error: e.to_string(),
            };
        }

        match self.store.remove_task(&task).await {
            Ok(_) => {
                info!("completed durable task");
                ExecutionOutcome::Completed
            }
            Err(e) => {
                error!(error = %e, "durable task ran but could not be removed");
                ExecutionOutcome::BookkeepingFailed {
                    error: e.to_string(),
                }
            }
        }
    }
}

/// Enqueue a prune pass whenever durable tasks are added to `store`.
fn register_prune_hook(
    store: &DurableTaskStore,
    queue: &EphemeralQueue,
    agent: &Arc<dyn TaskAgent>,
) {
    let queue = queue.clone();
    let agent = Arc::clone(agent);
    store.set_tasks_added_hook(Arc::new(move |store: &DurableTaskStore| {
        let store = store.clone();
        let agent = Arc::clone(&agent);
        let action = task_action(move || {
            let store = store.clone();
            let agent = Arc::clone(&agent);
            async move { agent.prune_tasks(&store).await }
        });
        if let Err(e) = queue.schedule(
            PRUNE_TASK_NAME,
            DelaySpec::immediate(),
            DEFAULT_EPHEMERAL_RETRIES,
            action,
        ) {
            error!(error = %e, "failed to enqueue prune task");
        }
    }));
}
