use bytes::Bytes;
use futures_util::StreamExt;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use common::error::CoreError;
use common::file_utils::content_checksum;
use common::time_utils::utc_now_ms;

use crate::core::client::call_with_deadline;
use crate::core::queue::{Task, TaskKind, TaskPayload, TaskStatus};
use crate::core::record::{FileRecord, ReplicationLogEntry, ReplicationOutcome};
use crate::core::retry::Backoff;
use crate::core::state::{CoordinatorState, wait_for_shutdown};

#[derive(Debug, Default)]
pub struct ReplicationStats {
    succeeded: AtomicU64,
    already_present: AtomicU64,
    retried: AtomicU64,
    failed_permanent: AtomicU64,
    abandoned: AtomicU64,
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq, Default)]
pub struct ReplicationStatsSnapshot {
    pub succeeded: u64,
    pub already_present: u64,
    pub retried: u64,
    pub failed_permanent: u64,
    pub abandoned: u64,
}

impl ReplicationStats {
    pub fn snapshot(&self) -> ReplicationStatsSnapshot {
        ReplicationStatsSnapshot {
            succeeded: self.succeeded.load(Ordering::Relaxed),
            already_present: self.already_present.load(Ordering::Relaxed),
            retried: self.retried.load(Ordering::Relaxed),
            failed_permanent: self.failed_permanent.load(Ordering::Relaxed),
            abandoned: self.abandoned.load(Ordering::Relaxed),
        }
    }
}

/// Operator view of one replication task.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ReplicationTask {
    pub task_id: String,
    pub file_id: String,
    pub source_node: String,
    pub target_node: String,
    pub attempt: u32,
    pub status: TaskStatus,
    pub not_before_ms: i64,
    pub last_error: Option<String>,
}

impl ReplicationTask {
    pub fn from_task(task: &Task) -> Option<Self> {
        match &task.payload {
            TaskPayload::Replicate {
                file_id,
                source_node,
                target_node,
            } => Some(Self {
                task_id: task.id.clone(),
                file_id: file_id.clone(),
                source_node: source_node.clone(),
                target_node: target_node.clone(),
                attempt: task.attempt,
                status: task.status,
                not_before_ms: task.not_before_ms,
                last_error: task.last_error.clone(),
            }),
            _ => None,
        }
    }
}

enum Step {
    Copied { source: String },
    AlreadyPresent,
    Abandoned(&'static str),
}

#[derive(Clone)]
pub struct ReplicationEngine {
    state: CoordinatorState,
    backoff: Backoff,
    max_attempts: u32,
    concurrency: usize,
}

impl ReplicationEngine {
    pub fn new(state: CoordinatorState) -> Self {
        let cfg = state.cfg.clone();
        Self {
            state,
            backoff: Backoff::new(cfg.replication_backoff_base, cfg.replication_backoff_cap),
            max_attempts: cfg.replication_max_attempts.max(1),
            concurrency: cfg.replication_concurrency.max(1),
        }
    }

    /// Consumes replication tasks until shutdown.
    pub async fn run(self, shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
        self.state
            .queue
            .consume(TaskKind::Replicate)
            .take_until(wait_for_shutdown(shutdown))
            .for_each_concurrent(self.concurrency, |task| {
                let engine = self.clone();
                async move {
                    engine.handle(task).await;
                }
            })
            .await;

        info!("replication engine stopped");

        Ok(())
    }

    /// Runs one delivery of a task and records its outcome. Returns the
    /// status the task was left in.
    #[tracing::instrument(skip(self, task), fields(task_id = %task.id, attempt = task.attempt))]
    pub async fn handle(&self, task: Task) -> TaskStatus {
        let TaskPayload::Replicate {
            file_id,
            source_node,
            target_node,
        } = task.payload.clone()
        else {
            return self.finish(task, TaskStatus::Cancelled, None).await;
        };

        match self.replicate(&file_id, &source_node, &target_node).await {
            Ok(Step::Copied { source }) => {
                self.state.replication_stats.succeeded.fetch_add(1, Ordering::Relaxed);
                self.log(
                    &task,
                    &file_id,
                    &target_node,
                    Some(source.clone()),
                    ReplicationOutcome::Succeeded,
                    None,
                );
                info!(%file_id, %source, target = %target_node, "replica written");
                self.finish(task, TaskStatus::Succeeded, None).await
            }
            Ok(Step::AlreadyPresent) => {
                self.state.replication_stats.already_present.fetch_add(1, Ordering::Relaxed);
                self.log(
                    &task,
                    &file_id,
                    &target_node,
                    None,
                    ReplicationOutcome::AlreadyPresent,
                    None,
                );
                debug!(%file_id, target = %target_node, "replica already present");
                self.finish(task, TaskStatus::Succeeded, None).await
            }
            Ok(Step::Abandoned(reason)) => {
                self.state.replication_stats.abandoned.fetch_add(1, Ordering::Relaxed);
                debug!(%file_id, target = %target_node, reason, "replication abandoned");
                self.finish(task, TaskStatus::Cancelled, Some(reason.to_string())).await
            }
            Err(e) => self.fail(task, &file_id, &target_node, e).await,
        }
    }

    async fn fail(&self, task: Task, file_id: &str, target: &str, err: CoreError) -> TaskStatus {
        let permanent =
            task.attempt >= self.max_attempts || matches!(err, CoreError::UnknownNode(_));

        if !permanent {
            let delay = self.backoff.delay_for(task.attempt);
            self.state.replication_stats.retried.fetch_add(1, Ordering::Relaxed);
            self.log(
                &task,
                file_id,
                target,
                None,
                ReplicationOutcome::Retrying,
                Some(err.to_string()),
            );
            warn!(
                file_id,
                target,
                attempt = task.attempt,
                ?delay,
                error = %err,
                "replication attempt failed, retrying"
            );

            let mut task = task;
            task.last_error = Some(err.to_string());
            let not_before = utc_now_ms().saturating_add(delay.as_millis() as i64);
            return match self.state.queue.requeue(task, not_before).await {
                Ok(t) => t.status,
                Err(e) => {
                    warn!(file_id, error = %e, "requeue failed, task left for recovery");
                    TaskStatus::FailedRetryable
                }
            };
        }

        let failure = CoreError::ReplicationPermanentFailure {
            file_id: file_id.to_string(),
            target: target.to_string(),
        };
        self.state.replication_stats.failed_permanent.fetch_add(1, Ordering::Relaxed);
        self.log(
            &task,
            file_id,
            target,
            None,
            ReplicationOutcome::FailedPermanent,
            Some(err.to_string()),
        );
        warn!(file_id, target, attempt = task.attempt, error = %err, "{}", failure);

        match self.state.store.update_file_record(file_id, &mut |r| {
            r.under_replicated = r.replica_nodes.len() < r.replica_target;
            Ok(())
        }) {
            Ok(_) | Err(CoreError::NotFound) => {}
            Err(e) => warn!(file_id, error = %e, "could not flag record under-replicated"),
        }

        self.finish(
            task,
            TaskStatus::FailedPermanent,
            Some(format!("{failure}: {err}")),
        )
        .await
    }

    async fn replicate(
        &self,
        file_id: &str,
        source_hint: &str,
        target: &str,
    ) -> Result<Step, CoreError> {
        let Some(record) = self.state.store.get_file_record(file_id)? else {
            return Ok(Step::Abandoned("record missing"));
        };
        if record.is_terminal() {
            return Ok(Step::Abandoned("file expired or deleted"));
        }
        if record.primary_node == target || record.replica_nodes.iter().any(|n| n == target) {
            return Ok(Step::AlreadyPresent);
        }

        let target_store = self.state.node_store(target)?;
        if !self.state.registry.is_online(target) {
            return Err(CoreError::unreachable(target, "target offline"));
        }
        let timeout = self.state.cfg.rpc_timeout;

        // a previous delivery may have written the bytes but died before
        // recording them
        let present =
            call_with_deadline(target, timeout, target_store.exists(record.object_key())).await?;
        let source = if present {
            None
        } else {
            let (content, source) = self.read_source(&record, source_hint, target).await?;
            call_with_deadline(
                target,
                timeout,
                target_store.put(record.object_key(), content),
            )
            .await?;
            Some(source)
        };

        let mut abandoned = false;
        let mut added = false;
        self.state
            .placement()
            .with_file_lock(file_id, |r| {
                if r.is_terminal() {
                    abandoned = true;
                    return Ok(());
                }
                added = r.add_replica(target);
                // counted together with the append, under the same lock
                if added {
                    self.state
                        .registry
                        .update_usage(target, r.size_bytes as i64, 1)?;
                }
                Ok(())
            })
            .await?;

        if abandoned {
            // deletion raced us; do not leave a stray copy behind
            let removed =
                call_with_deadline(target, timeout, target_store.delete(record.object_key()))
                    .await;
            if let Err(e) = removed {
                warn!(file_id, target, error = %e, "stray replica left behind");
            }
            return Ok(Step::Abandoned("file expired or deleted"));
        }

        Ok(match source {
            Some(source) if added => Step::Copied { source },
            _ => Step::AlreadyPresent,
        })
    }

    /// Source hint first, then the primary, then confirmed replicas.
    async fn read_source(
        &self,
        record: &FileRecord,
        hint: &str,
        target: &str,
    ) -> Result<(Bytes, String), CoreError> {
        let mut candidates = vec![hint.to_string()];
        for node in record.holders() {
            if !candidates.contains(&node) {
                candidates.push(node);
            }
        }

        let timeout = self.state.cfg.rpc_timeout;
        let mut last_error = CoreError::AllCopiesUnreachable;
        for node_id in candidates.into_iter().filter(|n| n != target) {
            if !self.state.registry.is_online(&node_id) {
                continue;
            }
            let read = async {
                let store = self.state.node_store(&node_id)?;
                call_with_deadline(&node_id, timeout, store.get(record.object_key())).await
            }
            .await;
            match read {
                Ok(content) if content_checksum(&content) == record.checksum => {
                    return Ok((content, node_id));
                }
                Ok(_) => last_error = CoreError::ChecksumMismatch,
                Err(e) => last_error = e,
            }
        }
        Err(last_error)
    }

    fn log(
        &self,
        task: &Task,
        file_id: &str,
        target: &str,
        source: Option<String>,
        outcome: ReplicationOutcome,
        detail: Option<String>,
    ) {
        let entry = ReplicationLogEntry {
            file_id: file_id.to_string(),
            target_node: target.to_string(),
            source_node: source,
            attempt: task.attempt,
            outcome,
            detail,
            at_ms: utc_now_ms(),
        };
        if let Err(e) = self.state.store.append_replication_log(&entry) {
            warn!(file_id, error = %e, "replication log append failed");
        }
    }

    async fn finish(&self, task: Task, status: TaskStatus, error: Option<String>) -> TaskStatus {
        match self.state.queue.complete(task, status, error).await {
            Ok(t) => t.status,
            Err(e) => {
                warn!(error = %e, "task completion not persisted");
                status
            }
        }
    }
}
