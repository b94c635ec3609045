//! Durable task store backed by a single JSON document.
//!
//! The document holds the `tasks` collection next to unrelated sibling
//! collections, which are carried through every write untouched. Reads are
//! served from an in-memory copy; every mutation is a read-modify-write
//! applied by a single writer task, so two mutations never interleave their
//! writes.

use std::collections::{HashMap, HashSet};
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::types::{DurableTask, TaskSpec};
use crate::SchedulerError;

/// Channel buffer size for the store writer.
const STORE_CHANNEL_SIZE: usize = 64;

/// The persisted document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StoreDocument {
    #[serde(default)]
    pub tasks: Vec<DurableTask>,
    /// Sibling collections (listings, logs, ...) preserved as-is.
    #[serde(flatten)]
    pub other: serde_json::Map<String, serde_json::Value>,
}

/// Called after tasks were added and persisted.
pub type TasksAddedHook = Arc<dyn Fn(&DurableTaskStore) + Send + Sync>;

/// Delivers the outcome of a persisted mutation to its caller.
type Reply = Box<dyn FnOnce(Result<(), SchedulerError>) + Send>;

/// A mutation queued for the writer. `None` means the draft must be
/// discarded; the caller has already been answered.
type Mutation = Box<dyn FnOnce(&mut StoreDocument) -> Option<Reply> + Send>;

/// Handle to the durable task store.
///
/// Cheaply cloneable; all clones share the same cache and writer.
#[derive(Clone)]
pub struct DurableTaskStore {
    path: PathBuf,
    cache: Arc<RwLock<StoreDocument>>,
    op_tx: mpsc::Sender<Mutation>,
    clock: Arc<dyn Clock>,
    on_tasks_added: Arc<RwLock<Option<TasksAddedHook>>>,
}

impl DurableTaskStore {
    /// Load the document at `path` and start the writer.
    ///
    /// A missing file is treated as an empty document; it is created on the
    /// first mutation.
    pub async fn open(
        path: impl Into<PathBuf>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, SchedulerError> {
        let path = path.into();
        let document = Self::load(&path).await?;
        info!(path = %path.display(), tasks = document.tasks.len(), "opened task store");

        let cache = Arc::new(RwLock::new(document));
        let (op_tx, op_rx) = mpsc::channel(STORE_CHANNEL_SIZE);
        let writer = StoreWriter {
            path: path.clone(),
            cache: Arc::clone(&cache),
            op_rx,
        };
        tokio::spawn(writer.run());

        Ok(Self {
            path,
            cache,
            op_tx,
            clock,
            on_tasks_added: Arc::new(RwLock::new(None)),
        })
    }

    /// Read a document from disk without opening a store.
    pub async fn load(path: &Path) -> Result<StoreDocument, SchedulerError> {
        if !fs::try_exists(path).await? {
            return Ok(StoreDocument::default());
        }
        let content = fs::read_to_string(path).await?;
        Ok(serde_json::from_str(&content)?)
    }

    /// Path of the backing document.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Snapshot of the current durable tasks.
    pub fn tasks(&self) -> Vec<DurableTask> {
        self.cache
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .tasks
            .clone()
    }

    /// Snapshot of the whole document.
    pub fn document(&self) -> StoreDocument {
        self.cache
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Register the hook run after every non-empty [`add_tasks`](Self::add_tasks).
    pub fn set_tasks_added_hook(&self, hook: TasksAddedHook) {
        *self
            .on_tasks_added
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(hook);
    }

    /// Apply `f` to the document and persist the result.
    ///
    /// The cache only reflects the change once the write succeeded. If
    /// persisting fails the change is discarded and the error returned.
    /// A panic in `f` discards the change too and is reported as
    /// [`SchedulerError::MutationPanicked`]; the store stays usable.
    pub async fn mutate<R, F>(&self, f: F) -> Result<R, SchedulerError>
    where
        R: Send + 'static,
        F: FnOnce(&mut StoreDocument) -> R + Send + 'static,
    {
        let (response_tx, response_rx) = oneshot::channel();
        let apply: Mutation = Box::new(move |document: &mut StoreDocument| {
            match panic::catch_unwind(AssertUnwindSafe(|| f(document))) {
                Ok(value) => Some(Box::new(move |outcome: Result<(), SchedulerError>| {
                    let _ = response_tx.send(outcome.map(|()| value));
                }) as Reply),
                Err(_) => {
                    let _ = response_tx.send(Err(SchedulerError::MutationPanicked));
                    None
                }
            }
        });

        self.op_tx
            .send(apply)
            .await
            .map_err(|_| SchedulerError::StoreClosed)?;

        response_rx.await.map_err(|_| SchedulerError::StoreClosed)?
    }

    /// Stamp each spec with `now + delay` and append it.
    ///
    /// The batch is rejected as a whole if any spec is invalid. After a
    /// non-empty batch is persisted the tasks-added hook runs.
    #[tracing::instrument(skip(self, specs), fields(count = specs.len()))]
    pub async fn add_tasks(&self, specs: Vec<TaskSpec>) -> Result<Vec<DurableTask>, SchedulerError> {
        if specs.is_empty() {
            return Ok(Vec::new());
        }

        let now = self.clock.now();
        let tasks = specs
            .into_iter()
            .map(|spec| DurableTask::from_spec(spec, now))
            .collect::<Result<Vec<_>, _>>()?;

        let added = tasks.clone();
        self.mutate(move |document| document.tasks.extend(tasks))
            .await?;
        info!(count = added.len(), "added durable tasks");

        let hook = self
            .on_tasks_added
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if let Some(hook) = hook {
            hook(self);
        }

        Ok(added)
    }

    /// Remove the first stored task equal to `task`.
    ///
    /// Returns whether a task was removed.
    #[tracing::instrument(skip(self, task), fields(task = %task.description))]
    pub async fn remove_task(&self, task: &DurableTask) -> Result<bool, SchedulerError> {
        let target = task.clone();
        let removed = self
            .mutate(move |document| {
                match document.tasks.iter().position(|t| *t == target) {
                    Some(idx) => {
                        document.tasks.remove(idx);
                        true
                    }
                    None => false,
                }
            })
            .await?;
        if !removed {
            debug!("task already gone from store");
        }
        Ok(removed)
    }

    /// Remove every task due at exactly `timestamp_ms` (epoch milliseconds).
    ///
    /// Returns the number of tasks removed.
    #[tracing::instrument(skip(self))]
    pub async fn remove_by_scheduled_timestamp(
        &self,
        timestamp_ms: i64,
    ) -> Result<usize, SchedulerError> {
        let removed = self
            .mutate(move |document| {
                let before = document.tasks.len();
                document
                    .tasks
                    .retain(|t| t.scheduled_at.timestamp_millis() != timestamp_ms);
                before - document.tasks.len()
            })
            .await?;
        info!(removed, "removed tasks by scheduled time");
        Ok(removed)
    }

    /// Drop follow-ups superseded by a later task for the same URL.
    ///
    /// For each URL only the task with the latest due time survives. Tasks
    /// without a URL are left alone. Returns the removed tasks.
    #[tracing::instrument(skip(self))]
    pub async fn prune_superseded(&self) -> Result<Vec<DurableTask>, SchedulerError> {
        let removed = self
            .mutate(|document| {
                let (kept, removed) = split_superseded(std::mem::take(&mut document.tasks));
                document.tasks = kept;
                removed
            })
            .await?;
        if !removed.is_empty() {
            info!(removed = removed.len(), "pruned superseded tasks");
        }
        Ok(removed)
    }
}

/// Partition tasks into (kept, superseded).
fn split_superseded(tasks: Vec<DurableTask>) -> (Vec<DurableTask>, Vec<DurableTask>) {
    let mut latest: HashMap<String, DateTime<Utc>> = HashMap::new();
    for task in &tasks {
        if let Some(url) = &task.url {
            latest
                .entry(url.clone())
                .and_modify(|at| *at = (*at).max(task.scheduled_at))
                .or_insert(task.scheduled_at);
        }
    }

    let mut seen = HashSet::new();
    let mut kept = Vec::new();
    let mut removed = Vec::new();
    for task in tasks {
        let keep = match &task.url {
            None => true,
            Some(url) => latest.get(url) == Some(&task.scheduled_at) && seen.insert(url.clone()),
        };
        if keep {
            kept.push(task);
        } else {
            removed.push(task);
        }
    }
    (kept, removed)
}

/// Owns the backing file and applies mutations one at a time.
struct StoreWriter {
    path: PathBuf,
    cache: Arc<RwLock<StoreDocument>>,
    op_rx: mpsc::Receiver<Mutation>,
}

impl StoreWriter {
    async fn run(mut self) {
        debug!(path = %self.path.display(), "task store writer started");

        while let Some(apply) = self.op_rx.recv().await {
            let mut draft = self
                .cache
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .clone();
            let Some(reply) = apply(&mut draft) else {
                warn!("store mutation panicked, change discarded");
                continue;
            };

            let outcome = write_document(&self.path, &draft).await;
            match &outcome {
                Ok(()) => {
                    *self.cache.write().unwrap_or_else(PoisonError::into_inner) = draft;
                }
                Err(e) => {
                    warn!(path = %self.path.display(), error = %e, "failed to persist task store");
                }
            }
            reply(outcome);
        }

        debug!("task store writer stopped");
    }
}

/// Write the document next to `path` and rename it into place.
async fn write_document(path: &Path, document: &StoreDocument) -> Result<(), SchedulerError> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent).await?;
    }

    let content = serde_json::to_string_pretty(document)?;

    let temp_path = path.with_extension("tmp");
    let mut file = fs::File::create(&temp_path).await?;
    file.write_all(content.as_bytes()).await?;
    file.sync_all().await?;

    fs::rename(&temp_path, path).await?;
    Ok(())
}
