//! `tasks` subcommands for inspecting and editing the task document.

use std::path::Path;
use std::sync::Arc;

use miette::Result;

use errand_scheduler::{DurableTask, DurableTaskStore, SystemClock, TaskSpec};

/// Print the durable tasks, earliest first.
pub async fn list(store_path: &Path, json: bool) -> Result<()> {
    let document = DurableTaskStore::load(store_path)
        .await
        .map_err(|e| miette::miette!("failed to read {}: {}", store_path.display(), e))?;
    let tasks = sorted(document.tasks);

    if json {
        let rendered = serde_json::to_string_pretty(&tasks)
            .map_err(|e| miette::miette!("failed to render tasks: {}", e))?;
        println!("{}", rendered);
        return Ok(());
    }

    if tasks.is_empty() {
        println!("No tasks scheduled.");
        return Ok(());
    }

    for task in &tasks {
        println!("{}", render(task));
    }
    Ok(())
}

/// Append one durable task to the document.
pub async fn add(store_path: &Path, spec: TaskSpec) -> Result<()> {
    let store = DurableTaskStore::open(store_path, Arc::new(SystemClock))
        .await
        .map_err(|e| miette::miette!("failed to open {}: {}", store_path.display(), e))?;

    let added = store
        .add_tasks(vec![spec])
        .await
        .map_err(|e| miette::miette!("failed to add task: {}", e))?;

    for task in &added {
        println!("Scheduled: {}", render(task));
    }
    Ok(())
}

fn sorted(mut tasks: Vec<DurableTask>) -> Vec<DurableTask> {
    // Stable, so equal times keep document order
    tasks.sort_by_key(|task| task.scheduled_at);
    tasks
}

fn render(task: &DurableTask) -> String {
    let when = task.scheduled_at.format("%Y-%m-%d %H:%M:%S UTC");
    match &task.url {
        Some(url) => format!("{}  {}  ({})", when, task.description, url),
        None => format!("{}  {}", when, task.description),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::DateTime;
    use errand_scheduler::DelaySpec;
    use pretty_assertions::assert_eq;

    fn task(description: &str, at_ms: i64) -> DurableTask {
        DurableTask {
            description: description.to_string(),
            url: None,
            delay: DelaySpec::immediate(),
            scheduled_at: DateTime::from_timestamp_millis(at_ms).unwrap(),
        }
    }

    #[test]
    fn test_sorted_orders_by_time_keeping_ties() {
        let tasks = vec![task("late", 3_000), task("first tie", 1_000), task("second tie", 1_000)];
        let names: Vec<String> = sorted(tasks).into_iter().map(|t| t.description).collect();
        assert_eq!(names, vec!["first tie", "second tie", "late"]);
    }

    #[test]
    fn test_render_includes_url_when_present() {
        let mut t = task("ask about the bike", 1_700_000_000_000);
        assert_eq!(render(&t), "2023-11-14 22:13:20 UTC  ask about the bike");

        t.url = Some("https://x/chat/4".to_string());
        assert_eq!(
            render(&t),
            "2023-11-14 22:13:20 UTC  ask about the bike  (https://x/chat/4)"
        );
    }

    #[tokio::test]
    async fn test_add_then_list_round_trips_through_the_document() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("db.json");

        add(&path, TaskSpec::new("check the reply", DelaySpec::minutes(10.0)))
            .await
            .unwrap();

        let document = DurableTaskStore::load(&path).await.unwrap();
        assert_eq!(document.tasks.len(), 1);
        assert_eq!(document.tasks[0].description, "check the reply");

        list(&path, false).await.unwrap();
        list(&path, true).await.unwrap();
    }

    #[tokio::test]
    async fn test_add_rejects_negative_delay() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("db.json");

        let err = add(&path, TaskSpec::new("nope", DelaySpec::minutes(-1.0)))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("invalid task"));
        assert!(!path.exists());
    }
}
