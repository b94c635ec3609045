//! Bounded retry with backoff around a single external call.
//!
//! Two failure modes are retried the same way: the call itself erroring
//! (transport failure) and the call succeeding with `isError` set (logical
//! failure). Once the attempts are used up the last failure is returned to
//! the caller, who decides what it means.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::backoff::BackoffController;
use crate::clock::{Sleeper, TokioSleeper};
use crate::SchedulerError;

/// Result of a tool call, with a failure flag distinct from a thrown error.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolInvocationResult {
    #[serde(rename = "isError", default)]
    pub is_error: bool,
    #[serde(default)]
    pub content: Value,
}

impl ToolInvocationResult {
    /// A successful result.
    pub fn ok(content: Value) -> Self {
        Self {
            is_error: false,
            content,
        }
    }

    /// A logical failure carrying a single text item.
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            is_error: true,
            content: serde_json::json!([{ "type": "text", "text": message.into() }]),
        }
    }

    /// The callee-supplied error message, empty when this is not an error.
    ///
    /// Uses the first content item's `text` (minus an `Error: ` prefix) when
    /// content is a list, otherwise the JSON rendering of the content.
    pub fn error_message(&self) -> String {
        if !self.is_error {
            return String::new();
        }
        match &self.content {
            Value::Array(items) => {
                let text = items
                    .first()
                    .and_then(|item| item.get("text"))
                    .and_then(Value::as_str)
                    .map(str::to_string)
                    .unwrap_or_else(|| self.content.to_string());
                text.strip_prefix("Error: ")
                    .map(str::to_string)
                    .unwrap_or(text)
            }
            Value::Null => String::new(),
            other => other.to_string(),
        }
    }
}

/// Retry settings for [`RetryableInvoker`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub retries: u32,
    pub initial_backoff_secs: f64,
    pub factor: f64,
    pub max_backoff_secs: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            retries: 2,
            initial_backoff_secs: 5.0,
            factor: 3.0,
            max_backoff_secs: 60.0,
        }
    }
}

impl RetryPolicy {
    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }
}

/// Wraps one external call with bounded retries.
#[derive(Clone)]
pub struct RetryableInvoker {
    policy: RetryPolicy,
    sleeper: Arc<dyn Sleeper>,
}

impl RetryableInvoker {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            sleeper: Arc::new(TokioSleeper),
        }
    }

    /// Replace the sleeper used between attempts.
    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Call `call` until it succeeds or `retries + 1` attempts have failed.
    ///
    /// Each invocation gets a fresh backoff starting at the policy's initial
    /// delay. No delay follows a successful attempt.
    pub async fn invoke<F, Fut>(
        &self,
        label: &str,
        mut call: F,
    ) -> Result<ToolInvocationResult, SchedulerError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<ToolInvocationResult, SchedulerError>>,
    {
        let mut backoff =
            BackoffController::new(self.policy.initial_backoff_secs, self.policy.max_backoff_secs)
                .with_factor(self.policy.factor);
        let mut attempt: u32 = 0;

        loop {
            let failure = match call().await {
                Ok(result) if !result.is_error => {
                    if attempt > 0 {
                        debug!(tool = label, attempt = attempt + 1, "call succeeded after retry");
                    }
                    return Ok(result);
                }
                Ok(result) => {
                    let mut message = result.error_message();
                    if message.is_empty() {
                        message = format!("tool {} returned error", label);
                    }
                    SchedulerError::Logical(message)
                }
                Err(e) => e,
            };

            warn!(tool = label, attempt = attempt + 1, error = %failure, "tool call failed");
            if attempt >= self.policy.retries {
                return Err(failure);
            }

            let delay = backoff.current();
            backoff.increase();
            self.sleeper
                .sleep(Duration::try_from_secs_f64(delay).unwrap_or(Duration::ZERO))
                .await;
            attempt += 1;
        }
    }
}
