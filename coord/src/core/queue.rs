use async_trait::async_trait;
use futures_util::stream::{self, BoxStream, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, mpsc};
use tracing::{debug, info, warn};
use uuid::Uuid;

use common::error::CoreError;
use common::time_utils::utc_now_ms;

use crate::core::meta::MetaStore;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    Replicate,
    Compress,
    Thumbnail,
    Delete,
}

impl TaskKind {
    pub const ALL: [TaskKind; 4] = [
        TaskKind::Replicate,
        TaskKind::Compress,
        TaskKind::Thumbnail,
        TaskKind::Delete,
    ];
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TaskPayload {
    Replicate {
        file_id: String,
        source_node: String,
        target_node: String,
    },
    Compress {
        file_id: String,
    },
    Thumbnail {
        file_id: String,
    },
    Delete {
        file_id: String,
    },
}

impl TaskPayload {
    pub fn kind(&self) -> TaskKind {
        match self {
            TaskPayload::Replicate { .. } => TaskKind::Replicate,
            TaskPayload::Compress { .. } => TaskKind::Compress,
            TaskPayload::Thumbnail { .. } => TaskKind::Thumbnail,
            TaskPayload::Delete { .. } => TaskKind::Delete,
        }
    }

    pub fn file_id(&self) -> &str {
        match self {
            TaskPayload::Replicate { file_id, .. }
            | TaskPayload::Compress { file_id }
            | TaskPayload::Thumbnail { file_id }
            | TaskPayload::Delete { file_id } => file_id,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    InFlight,
    Succeeded,
    FailedRetryable,
    FailedPermanent,
    /// The file went away before the work was done.
    Cancelled,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Succeeded | TaskStatus::FailedPermanent | TaskStatus::Cancelled
        )
    }
}

/// Unit of asynchronous work. Retry state lives here and is persisted with
/// every transition.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Task {
    pub id: String,
    pub kind: TaskKind,
    pub payload: TaskPayload,
    /// Attempts started so far.
    pub attempt: u32,
    pub status: TaskStatus,
    pub not_before_ms: i64,
    pub last_error: Option<String>,
    pub created_at_ms: i64,
    pub updated_at_ms: i64,
}

impl Task {
    pub fn new(payload: TaskPayload, not_before_ms: i64) -> Self {
        let now = utc_now_ms();
        Self {
            id: format!("{}/{}", payload.file_id(), Uuid::new_v4()),
            kind: payload.kind(),
            payload,
            attempt: 0,
            status: TaskStatus::Pending,
            not_before_ms,
            last_error: None,
            created_at_ms: now,
            updated_at_ms: now,
        }
    }

    pub fn file_id(&self) -> &str {
        self.payload.file_id()
    }
}

/// At-least-once task dispatch.
#[async_trait]
pub trait TaskQueue: Send + Sync {
    async fn enqueue(&self, payload: TaskPayload) -> Result<Task, CoreError>;
    /// Like `enqueue`, but not delivered before `not_before_ms`.
    async fn schedule(&self, payload: TaskPayload, not_before_ms: i64) -> Result<Task, CoreError>;
    /// Delivered tasks are already marked in flight with `attempt` bumped.
    /// Several consumers of one kind share its deliveries.
    fn consume(&self, kind: TaskKind) -> BoxStream<'static, Task>;
    /// Hands a failed attempt back for redelivery at `not_before_ms`.
    async fn requeue(&self, task: Task, not_before_ms: i64) -> Result<Task, CoreError>;
    /// Records a terminal status; the task is never delivered again.
    async fn complete(
        &self,
        task: Task,
        status: TaskStatus,
        error: Option<String>,
    ) -> Result<Task, CoreError>;
    fn tasks_for_file(&self, file_id: &str) -> Result<Vec<Task>, CoreError>;
    /// Re-dispatches every unfinished task found in the store.
    async fn recover(&self) -> Result<usize, CoreError>;
}

type IdReceiver = Arc<Mutex<mpsc::UnboundedReceiver<String>>>;

/// Task queue persisted through the `MetaStore`. In-process delivery runs
/// over one channel of task ids per kind; the store stays authoritative and
/// `recover` rebuilds the channels after a restart.
#[derive(Clone)]
pub struct DurableTaskQueue {
    store: Arc<dyn MetaStore>,
    senders: Arc<HashMap<TaskKind, mpsc::UnboundedSender<String>>>,
    receivers: Arc<HashMap<TaskKind, IdReceiver>>,
}

impl DurableTaskQueue {
    pub fn new(store: Arc<dyn MetaStore>) -> Self {
        let mut senders = HashMap::new();
        let mut receivers = HashMap::new();
        for kind in TaskKind::ALL {
            let (tx, rx) = mpsc::unbounded_channel();
            senders.insert(kind, tx);
            receivers.insert(kind, Arc::new(Mutex::new(rx)));
        }
        Self {
            store,
            senders: Arc::new(senders),
            receivers: Arc::new(receivers),
        }
    }

    fn dispatch(&self, task: &Task) {
        let delay_ms = task.not_before_ms.saturating_sub(utc_now_ms());
        let Some(tx) = self.senders.get(&task.kind).cloned() else {
            return;
        };
        let id = task.id.clone();
        if delay_ms <= 0 {
            let _ = tx.send(id);
        } else {
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(delay_ms as u64)).await;
                let _ = tx.send(id);
            });
        }
    }

    /// Turns a delivered id into a runnable task, or `None` when the delivery
    /// is stale (finished, duplicate, or not yet due).
    fn claim(&self, id: &str) -> Result<Option<Task>, CoreError> {
        let Some(mut task) = self.store.get_task(id)? else {
            return Ok(None);
        };
        if task.status.is_terminal() || task.status == TaskStatus::InFlight {
            return Ok(None);
        }
        if task.not_before_ms > utc_now_ms() {
            self.dispatch(&task);
            return Ok(None);
        }

        task.status = TaskStatus::InFlight;
        task.attempt = task.attempt.saturating_add(1);
        task.updated_at_ms = utc_now_ms();
        self.store.save_task(&task)?;
        Ok(Some(task))
    }
}

#[async_trait]
impl TaskQueue for DurableTaskQueue {
    async fn enqueue(&self, payload: TaskPayload) -> Result<Task, CoreError> {
        self.schedule(payload, utc_now_ms()).await
    }

    async fn schedule(&self, payload: TaskPayload, not_before_ms: i64) -> Result<Task, CoreError> {
        let task = Task::new(payload, not_before_ms);
        self.store.save_task(&task)?;
        debug!(task_id = %task.id, kind = ?task.kind, not_before_ms, "task enqueued");
        self.dispatch(&task);
        Ok(task)
    }

    fn consume(&self, kind: TaskKind) -> BoxStream<'static, Task> {
        let Some(rx) = self.receivers.get(&kind).cloned() else {
            return stream::empty().boxed();
        };
        let queue = self.clone();

        stream::unfold((rx, queue), |(rx, queue)| async move {
            loop {
                let next = { rx.lock().await.recv().await };
                let id = next?;
                match queue.claim(&id) {
                    Ok(Some(task)) => return Some((task, (rx, queue))),
                    Ok(None) => continue,
                    Err(e) => {
                        warn!(task_id = %id, error = %e, "failed to claim task");
                        continue;
                    }
                }
            }
        })
        .boxed()
    }

    async fn requeue(&self, mut task: Task, not_before_ms: i64) -> Result<Task, CoreError> {
        task.status = TaskStatus::FailedRetryable;
        task.not_before_ms = not_before_ms;
        task.updated_at_ms = utc_now_ms();
        self.store.save_task(&task)?;
        self.dispatch(&task);
        Ok(task)
    }

    async fn complete(
        &self,
        mut task: Task,
        status: TaskStatus,
        error: Option<String>,
    ) -> Result<Task, CoreError> {
        task.status = status;
        if error.is_some() {
            task.last_error = error;
        }
        task.updated_at_ms = utc_now_ms();
        self.store.save_task(&task)?;
        Ok(task)
    }

    fn tasks_for_file(&self, file_id: &str) -> Result<Vec<Task>, CoreError> {
        let mut tasks = self.store.list_tasks_for_file(file_id)?;
        tasks.sort_by_key(|t| t.created_at_ms);
        Ok(tasks)
    }

    async fn recover(&self) -> Result<usize, CoreError> {
        let mut recovered = 0;
        for mut task in self.store.list_tasks()? {
            if task.status.is_terminal() {
                continue;
            }
            if task.status == TaskStatus::InFlight {
                // the attempt that was running died with the process
                task.status = TaskStatus::FailedRetryable;
                task.last_error = Some("interrupted".to_string());
                self.store.save_task(&task)?;
            }
            self.dispatch(&task);
            recovered += 1;
        }
        info!(recovered, "task queue recovered");
        Ok(recovered)
    }
}
