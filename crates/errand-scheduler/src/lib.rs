//! Single-flight task scheduler for Errand.
//!
//! This crate provides:
//! - A backoff controller with a floor and a ceiling
//! - A durable task store persisted as a JSON document, with serialized writes
//! - A retrying invoker for external tool calls
//! - A scheduler that merges in-memory and durable tasks and runs one at a time

pub mod backoff;
pub mod clock;
mod error;
mod invoker;
mod scheduler;
mod store;
mod types;

pub use backoff::BackoffController;
pub use clock::{Clock, ManualClock, RecordingSleeper, Sleeper, SystemClock, TokioSleeper};
pub use error::SchedulerError;
pub use invoker::{RetryPolicy, RetryableInvoker, ToolInvocationResult};
pub use scheduler::{
    DEFAULT_EPHEMERAL_RETRIES, EphemeralQueue, Execution, ExecutionOutcome, PRUNE_TASK_NAME,
    Scheduler, SchedulerConfig, TaskAgent, TickOutcome,
};
pub use store::{DurableTaskStore, StoreDocument, TasksAddedHook};
pub use types::{
    DelaySpec, DueTask, DurableTask, EphemeralTask, RetrySpec, TaskAction, TaskFuture, TaskSource,
    TaskSpec, task_action,
};
