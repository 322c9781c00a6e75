use bytes::Bytes;
use flate2::Compression;
use flate2::write::GzEncoder;
use futures_util::StreamExt;
use futures_util::stream::select_all;
use std::io::Write;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use common::error::CoreError;
use common::file_utils::content_checksum;
use common::time_utils::utc_now_ms;

use crate::core::client::call_with_deadline;
use crate::core::queue::{Task, TaskKind, TaskPayload, TaskStatus};
use crate::core::record::{AssetState, DerivedAsset, FileRecord, FileStatus};
use crate::core::state::{CoordinatorState, wait_for_shutdown};

/// Renders image thumbnails. `Ok(None)` means the format is not supported.
pub trait Thumbnailer: Send + Sync {
    fn render(&self, mime_type: &str, content: &[u8]) -> Result<Option<Vec<u8>>, CoreError>;
}

/// Build without an image codec: every thumbnail request is skipped.
pub struct NoThumbnailer;

impl Thumbnailer for NoThumbnailer {
    fn render(&self, _mime_type: &str, _content: &[u8]) -> Result<Option<Vec<u8>>, CoreError> {
        Ok(None)
    }
}

pub fn gzip(content: &[u8]) -> Result<Vec<u8>, CoreError> {
    let mut encoder = GzEncoder::new(Vec::with_capacity(content.len() / 2), Compression::default());
    encoder.write_all(content)?;
    Ok(encoder.finish()?)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AssetSlot {
    Compressed,
    Thumbnail,
}

impl AssetSlot {
    fn of(kind: TaskKind) -> Option<Self> {
        match kind {
            TaskKind::Compress => Some(AssetSlot::Compressed),
            TaskKind::Thumbnail => Some(AssetSlot::Thumbnail),
            _ => None,
        }
    }

    fn get(self, record: &mut FileRecord) -> &mut AssetState {
        match self {
            AssetSlot::Compressed => &mut record.derived_assets.compressed,
            AssetSlot::Thumbnail => &mut record.derived_assets.thumbnail,
        }
    }

    fn key(self, record: &FileRecord) -> String {
        match self {
            AssetSlot::Compressed => record.compressed_key(),
            AssetSlot::Thumbnail => record.thumbnail_key(),
        }
    }
}

enum Rendered {
    Asset(Vec<u8>),
    Skip(&'static str),
}

/// Compression and thumbnail worker. The file stays downloadable
/// throughout: status moves active -> processing -> active.
#[derive(Clone)]
pub struct PostProcessor {
    state: CoordinatorState,
}

impl PostProcessor {
    pub fn new(state: CoordinatorState) -> Self {
        Self { state }
    }

    pub async fn run(self, shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
        let streams = vec![
            self.state.queue.consume(TaskKind::Compress),
            self.state.queue.consume(TaskKind::Thumbnail),
        ];
        select_all(streams)
            .take_until(wait_for_shutdown(shutdown))
            .for_each_concurrent(2, |task| {
                let worker = self.clone();
                async move {
                    worker.handle(task).await;
                }
            })
            .await;

        info!("post-processor stopped");

        Ok(())
    }

    #[tracing::instrument(skip(self, task), fields(task_id = %task.id, kind = ?task.kind))]
    pub async fn handle(&self, task: Task) -> TaskStatus {
        let Some(slot) = AssetSlot::of(task.kind) else {
            return self.finish(task, TaskStatus::Cancelled, None).await;
        };
        let file_id = task.file_id().to_string();

        let started = self
            .state
            .placement()
            .with_file_lock(&file_id, |r| {
                if r.is_downloadable() {
                    *slot.get(r) = AssetState::Running;
                    r.status = FileStatus::Processing;
                }
                Ok(())
            })
            .await;
        let record = match started {
            Ok(r) if r.is_downloadable() => r,
            Ok(_) | Err(CoreError::NotFound) => {
                return self.finish(task, TaskStatus::Cancelled, None).await;
            }
            Err(e) => return self.retry_or_fail(task, slot, e).await,
        };

        match self.produce(&record, slot).await {
            Ok(state) => {
                let ready = matches!(state, AssetState::Ready(_));
                if let Err(e) = self.settle(&file_id, slot, state).await {
                    warn!(%file_id, error = %e, "asset state not recorded");
                }
                if ready {
                    info!(%file_id, ?slot, "derived asset stored");
                }
                self.finish(task, TaskStatus::Succeeded, None).await
            }
            Err(e) => self.retry_or_fail(task, slot, e).await,
        }
    }

    async fn produce(&self, record: &FileRecord, slot: AssetSlot) -> Result<AssetState, CoreError> {
        let timeout = self.state.cfg.rpc_timeout;
        let node_id = record.primary_node.clone();
        let store = self.state.node_store(&node_id)?;
        let original =
            call_with_deadline(&node_id, timeout, store.get(record.object_key())).await?;
        if content_checksum(&original) != record.checksum {
            return Err(CoreError::ChecksumMismatch);
        }

        let thumbnailer = self.state.thumbnailer.clone();
        let mime_type = record.mime_type.clone();
        let rendered =
            tokio::task::spawn_blocking(move || render(slot, &mime_type, &original, thumbnailer))
                .await
                .map_err(|e| CoreError::Any(e.into()))??;

        let bytes = match rendered {
            Rendered::Asset(bytes) => bytes,
            Rendered::Skip(reason) => return Ok(AssetState::Skipped(reason.to_string())),
        };

        let key = slot.key(record);
        let size = bytes.len() as u64;
        call_with_deadline(&node_id, timeout, store.put(&key, Bytes::from(bytes))).await?;
        self.state.registry.update_usage(&node_id, size as i64, 1)?;

        Ok(AssetState::Ready(DerivedAsset {
            object_key: key,
            node_id,
            size_bytes: size,
        }))
    }

    /// Stores the final asset state and drops back to active once no other
    /// asset is still running. A record retired meanwhile keeps its status.
    async fn settle(
        &self,
        file_id: &str,
        slot: AssetSlot,
        state: AssetState,
    ) -> Result<(), CoreError> {
        let mut state = Some(state);
        self.state
            .placement()
            .with_file_lock(file_id, |r| {
                if let Some(s) = state.take() {
                    *slot.get(r) = s;
                }
                if r.status == FileStatus::Processing && !r.derived_assets.any_running() {
                    r.status = FileStatus::Active;
                }
                Ok(())
            })
            .await?;
        Ok(())
    }

    async fn retry_or_fail(&self, mut task: Task, slot: AssetSlot, err: CoreError) -> TaskStatus {
        let file_id = task.file_id().to_string();
        task.last_error = Some(err.to_string());

        if task.attempt < self.state.cfg.postprocess_max_attempts {
            warn!(
                %file_id,
                ?slot,
                attempt = task.attempt,
                error = %err,
                "post-processing failed, retrying"
            );
            // leave the asset pending and let downloads see an active file
            if let Err(e) = self.settle(&file_id, slot, AssetState::Pending).await {
                debug!(%file_id, error = %e, "asset state not reset");
            }
            return match self.state.queue.requeue(task, utc_now_ms()).await {
                Ok(t) => t.status,
                Err(e) => {
                    warn!(%file_id, error = %e, "requeue failed, task left for recovery");
                    TaskStatus::FailedRetryable
                }
            };
        }

        warn!(
            %file_id,
            ?slot,
            attempt = task.attempt,
            error = %err,
            "post-processing failed permanently"
        );
        if let Err(e) = self
            .settle(&file_id, slot, AssetState::Failed(err.to_string()))
            .await
        {
            debug!(%file_id, error = %e, "asset failure not recorded");
        }
        self.finish(task, TaskStatus::FailedPermanent, Some(err.to_string()))
            .await
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

fn render(
    slot: AssetSlot,
    mime_type: &str,
    original: &[u8],
    thumbnailer: Arc<dyn Thumbnailer>,
) -> Result<Rendered, CoreError> {
    match slot {
        AssetSlot::Compressed => {
            let compressed = gzip(original)?;
            if compressed.len() >= original.len() {
                return Ok(Rendered::Skip("compression does not reduce size"));
            }
            Ok(Rendered::Asset(compressed))
        }
        AssetSlot::Thumbnail => {
            if !mime_type.starts_with("image/") {
                return Ok(Rendered::Skip("not an image"));
            }
            Ok(match thumbnailer.render(mime_type, original)? {
                Some(thumb) => Rendered::Asset(thumb),
                None => Rendered::Skip("no thumbnail codec for this image type"),
            })
        }
    }
}
