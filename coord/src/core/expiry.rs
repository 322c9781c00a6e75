use futures_util::StreamExt;
use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use common::error::CoreError;
use common::time_utils::utc_now_ms;

use crate::core::queue::{Task, TaskKind, TaskPayload, TaskStatus};
use crate::core::record::{FileRecord, FileStatus};
use crate::core::retry::Backoff;
use crate::core::state::{CoordinatorState, wait_for_shutdown};

#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct SweepReport {
    pub scanned: usize,
    pub expired: usize,
    pub enqueued: usize,
    pub stale_uploads: usize,
}

#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct PurgeReport {
    pub deleted: usize,
    pub incomplete: usize,
    pub failed: usize,
}

/// A live record that may no longer be served.
fn is_retired(record: &FileRecord, now_ms: i64) -> bool {
    record.is_downloadable() && (record.is_expired_at(now_ms) || record.downloads_remaining == 0)
}

/// Periodic safety net for deletions: retires records past expiry (or out of
/// downloads) and makes sure every retired record has a live delete task.
#[derive(Clone)]
pub struct ExpirySweeper {
    state: CoordinatorState,
}

impl ExpirySweeper {
    pub fn new(state: CoordinatorState) -> Self {
        Self { state }
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
        let mut tick = tokio::time::interval(self.state.cfg.expiry_sweep_interval);

        loop {
            tokio::select! {
                _ = tick.tick() => {},
                _ = shutdown.changed() => { if *shutdown.borrow() { break; } }
            }

            if let Err(e) = self.sweep_once().await {
                warn!(error = %e, "expiry sweep failed");
            }
        }

        info!("expiry sweeper stopped");

        Ok(())
    }

    #[tracing::instrument(skip(self))]
    pub async fn sweep_once(&self) -> Result<SweepReport, CoreError> {
        let now = utc_now_ms();
        let mut report = SweepReport::default();

        for record in self.state.store.list_file_records()? {
            report.scanned += 1;
            let retire = is_retired(&record, now);
            if !retire && record.status != FileStatus::Expired {
                continue;
            }

            if retire {
                let updated = self
                    .state
                    .placement()
                    .with_file_lock(&record.id, |r| {
                        if is_retired(r, now) {
                            r.status = FileStatus::Expired;
                        }
                        Ok(())
                    })
                    .await?;
                if updated.status != FileStatus::Expired {
                    continue;
                }
                report.expired += 1;
            }

            if !self.has_live_delete_task(&record.id)? {
                self.state
                    .queue
                    .enqueue(TaskPayload::Delete {
                        file_id: record.id.clone(),
                    })
                    .await?;
                report.enqueued += 1;
            }
        }

        report.stale_uploads = self.state.chunked_uploads().purge_stale()?;

        if report.expired > 0 || report.enqueued > 0 {
            info!(?report, "expiry sweep");
        } else {
            debug!(scanned = report.scanned, "expiry sweep found nothing");
        }
        Ok(report)
    }

    /// A due-or-overdue delete task that has not finished.
    fn has_live_delete_task(&self, file_id: &str) -> Result<bool, CoreError> {
        let now = utc_now_ms();
        Ok(self.state.queue.tasks_for_file(file_id)?.iter().any(|t| {
            t.kind == TaskKind::Delete && !t.status.is_terminal() && t.not_before_ms <= now
        }))
    }

    /// Deletes every expired record inline, without the queue.
    pub async fn purge_expired(&self) -> Result<PurgeReport, CoreError> {
        let placement = self.state.placement();
        let mut report = PurgeReport::default();

        for record in self.state.store.list_file_records()? {
            if record.status != FileStatus::Expired {
                continue;
            }
            match placement.delete_file(&record.id).await {
                Ok(outcome) if outcome.complete => report.deleted += 1,
                Ok(_) => report.incomplete += 1,
                Err(e) => {
                    warn!(file_id = %record.id, error = %e, "purge failed");
                    report.failed += 1;
                }
            }
        }
        Ok(report)
    }
}

/// Consumes delete tasks. Tasks that arrive before the file is due are put
/// back until its expiry; partial deletions retry with backoff.
#[derive(Clone)]
pub struct DeletionWorker {
    state: CoordinatorState,
    backoff: Backoff,
    max_attempts: u32,
}

impl DeletionWorker {
    pub fn new(state: CoordinatorState) -> Self {
        let cfg = state.cfg.clone();
        Self {
            state,
            backoff: Backoff::new(cfg.replication_backoff_base, cfg.replication_backoff_cap),
            max_attempts: cfg.replication_max_attempts.max(1),
        }
    }

    pub async fn run(self, shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
        self.state
            .queue
            .consume(TaskKind::Delete)
            .take_until(wait_for_shutdown(shutdown))
            .for_each_concurrent(2, |task| {
                let worker = self.clone();
                async move {
                    worker.handle(task).await;
                }
            })
            .await;

        info!("deletion worker stopped");

        Ok(())
    }

    #[tracing::instrument(skip(self, task), fields(task_id = %task.id, attempt = task.attempt))]
    pub async fn handle(&self, task: Task) -> TaskStatus {
        let file_id = task.file_id().to_string();
        let record = match self.state.store.get_file_record(&file_id) {
            Ok(Some(r)) => r,
            Ok(None) => return self.finish(task, TaskStatus::Cancelled, None).await,
            Err(e) => return self.retry(task, e.to_string()).await,
        };

        let now = utc_now_ms();
        if record.is_downloadable() && !is_retired(&record, now) {
            // scheduled ahead of a later expiry; wait for it
            debug!(%file_id, expires_at_ms = record.expires_at_ms, "delete not due yet");
            let mut task = task;
            task.attempt = task.attempt.saturating_sub(1);
            return match self.state.queue.requeue(task, record.expires_at_ms).await {
                Ok(t) => t.status,
                Err(e) => {
                    warn!(%file_id, error = %e, "requeue failed, task left for recovery");
                    TaskStatus::FailedRetryable
                }
            };
        }

        match self.state.placement().delete_file(&file_id).await {
            Ok(outcome) if outcome.complete => self.finish(task, TaskStatus::Succeeded, None).await,
            Ok(_) => self.retry(task, "some copies not deleted".to_string()).await,
            Err(CoreError::NotFound) => self.finish(task, TaskStatus::Cancelled, None).await,
            Err(e) => self.retry(task, e.to_string()).await,
        }
    }

    async fn retry(&self, mut task: Task, error: String) -> TaskStatus {
        if task.attempt >= self.max_attempts {
            warn!(
                file_id = %task.file_id(),
                attempt = task.attempt,
                %error,
                "deletion gave up, sweeper will retry"
            );
            return self.finish(task, TaskStatus::FailedPermanent, Some(error)).await;
        }
        let delay = self.backoff.delay_for(task.attempt);
        task.last_error = Some(error);
        let not_before = utc_now_ms().saturating_add(delay.as_millis() as i64);
        match self.state.queue.requeue(task, not_before).await {
            Ok(t) => t.status,
            Err(e) => {
                warn!(error = %e, "requeue failed, task left for recovery");
                TaskStatus::FailedRetryable
            }
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
