//! Agent that hands durable tasks to an external command.

use std::process::Stdio;

use async_trait::async_trait;
use serde_json::Value;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

use errand_scheduler::{
    DurableTask, RetryableInvoker, SchedulerError, TaskAgent, ToolInvocationResult,
};

/// Runs a shell command per durable task, with the task JSON on stdin.
///
/// A zero exit status means the task is done. Anything else is retried by
/// the invoker and, once retries are used up, reported to the scheduler so
/// the task stays in the store.
pub struct CommandAgent {
    task_command: String,
    invoker: RetryableInvoker,
}

impl CommandAgent {
    pub fn new(task_command: impl Into<String>, invoker: RetryableInvoker) -> Self {
        Self {
            task_command: task_command.into(),
            invoker,
        }
    }
}

#[async_trait]
impl TaskAgent for CommandAgent {
    async fn handle_task(&self, task: &DurableTask) -> Result<(), SchedulerError> {
        let input = serde_json::to_vec(task)?;
        let result = self
            .invoker
            .invoke("task-command", || run_shell(&self.task_command, &input))
            .await?;
        debug!(output = %result.content, "task command finished");
        Ok(())
    }
}

/// Run `command` through `sh -c`, feeding it `stdin`.
///
/// Failing to start or talk to the process is a transport failure; a
/// non-zero exit is a logical failure carrying stderr.
pub async fn run_shell(command: &str, stdin: &[u8]) -> Result<ToolInvocationResult, SchedulerError> {
    let mut child = Command::new("sh")
        .arg("-c")
        .arg(command)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| SchedulerError::Transport(format!("failed to spawn `{}`: {}", command, e)))?;

    if let Some(mut input) = child.stdin.take() {
        match input.write_all(stdin).await {
            // The command is free to ignore its input
            Err(e) if e.kind() != std::io::ErrorKind::BrokenPipe => {
                return Err(SchedulerError::Transport(format!(
                    "failed to write to `{}`: {}",
                    command, e
                )));
            }
            _ => {}
        }
    }

    let output = child
        .wait_with_output()
        .await
        .map_err(|e| SchedulerError::Transport(format!("failed to wait for `{}`: {}", command, e)))?;

    if output.status.success() {
        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        return Ok(ToolInvocationResult::ok(Value::String(stdout)));
    }

    let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
    let message = if stderr.is_empty() {
        format!("`{}` exited with {}", command, output.status)
    } else {
        stderr
    };
    Ok(ToolInvocationResult::error(message))
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::sync::Arc;

    use chrono::Utc;
    use errand_scheduler::{DelaySpec, RecordingSleeper, RetryPolicy, TaskSpec};

    fn invoker(retries: u32) -> RetryableInvoker {
        RetryableInvoker::new(RetryPolicy::default().with_retries(retries))
            .with_sleeper(Arc::new(RecordingSleeper::new()))
    }

    fn task() -> DurableTask {
        DurableTask::from_spec(
            TaskSpec::new("reply to buyer", DelaySpec::immediate()).with_url("https://x/chat/9"),
            Utc::now(),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_run_shell_captures_stdout() {
        let result = run_shell("cat", b"hello").await.unwrap();
        assert!(!result.is_error);
        assert_eq!(result.content, Value::String("hello".to_string()));
    }

    #[tokio::test]
    async fn test_run_shell_nonzero_exit_is_logical_failure() {
        let result = run_shell("echo 'Error: page did not load' >&2; exit 3", b"")
            .await
            .unwrap();
        assert!(result.is_error);
        assert_eq!(result.error_message(), "page did not load");
    }

    #[tokio::test]
    async fn test_run_shell_silent_failure_names_command() {
        let result = run_shell("exit 4", b"ignored input").await.unwrap();
        assert!(result.is_error);
        assert!(result.error_message().contains("`exit 4` exited with"));
    }

    #[tokio::test]
    async fn test_agent_passes_task_json_on_stdin() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("seen.json");
        let agent = CommandAgent::new(format!("cat > '{}'", out.display()), invoker(0));

        let task = task();
        agent.handle_task(&task).await.unwrap();

        let seen: DurableTask =
            serde_json::from_str(&std::fs::read_to_string(&out).unwrap()).unwrap();
        assert_eq!(seen, task);
    }

    #[tokio::test]
    async fn test_agent_failure_surfaces_after_retries() {
        let dir = tempfile::tempdir().unwrap();
        let counter = dir.path().join("attempts");
        let agent = CommandAgent::new(
            format!("echo x >> '{}'; echo nope >&2; exit 1", counter.display()),
            invoker(2),
        );

        let err = agent.handle_task(&task()).await.unwrap_err();
        assert!(matches!(err, SchedulerError::Logical(ref m) if m == "nope"));

        let attempts = std::fs::read_to_string(&counter).unwrap();
        assert_eq!(attempts.lines().count(), 3);
    }
}
