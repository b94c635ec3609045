//! Error types for the scheduler.

use thiserror::Error;

/// Errors that can occur in scheduler, store, and invoker operations.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// IO error while reading or writing the task document.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// The store writer is no longer running.
    #[error("task store closed")]
    StoreClosed,

    /// A store mutation panicked; the document was left unchanged.
    #[error("task store mutation panicked")]
    MutationPanicked,

    /// Calling an external system failed (network, subprocess, tool RPC).
    #[error("transport failure: {0}")]
    Transport(String),

    /// The callee reported a failure without erroring at the transport level.
    #[error("logical failure: {0}")]
    Logical(String),

    /// A scheduled unit of work failed.
    #[error("task failed: {0}")]
    TaskFailed(String),

    /// Task input was rejected.
    #[error("invalid task: {0}")]
    InvalidTask(String),
}
