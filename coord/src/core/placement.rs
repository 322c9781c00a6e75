use bytes::Bytes;
use serde::Serialize;
use std::time::Duration;
use tracing::{Instrument, info, info_span, warn};
use uuid::Uuid;

use common::error::CoreError;
use common::file_utils::content_checksum;
use common::time_utils::utc_now_ms;

use crate::core::client::call_with_deadline;
use crate::core::lock::{
    CounterOutcome, acquire_with_wait, delete_lock_key, download_counter_key, download_lock_key,
    file_lock_key, upload_lock_key,
};
use crate::core::node::StorageNode;
use crate::core::queue::{TaskKind, TaskPayload};
use crate::core::record::{AssetState, DerivedAssets, FileRecord, FileStatus, ReplicationLogEntry};
use crate::core::replication::{ReplicationStatsSnapshot, ReplicationTask};
use crate::core::retry::retry_transient;
use crate::core::selector::Placement;
use crate::core::state::CoordinatorState;

const DEFAULT_FILE_NAME: &str = "file";

#[derive(Debug, Clone, Default)]
pub struct UploadMetadata {
    pub original_name: Option<String>,
    pub mime_type: Option<String>,
    pub download_limit: Option<u32>,
    pub ttl: Option<Duration>,
}

#[derive(Debug, Clone, Serialize)]
pub struct UploadOutcome {
    pub record: FileRecord,
    /// Same content was already stored; nothing was written.
    pub duplicate: bool,
}

#[derive(Debug, Clone)]
pub struct Download {
    pub content: Bytes,
    pub served_by: String,
    pub record: FileRecord,
}

#[derive(Debug, Clone, Serialize)]
pub struct DeletionOutcome {
    pub record: FileRecord,
    /// Every holder confirmed the delete.
    pub complete: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct ClusterHealth {
    pub nodes: Vec<StorageNode>,
    pub online_nodes: usize,
    pub offline_nodes: usize,
    pub capacity_bytes: u64,
    pub used_bytes: u64,
    pub replication: ReplicationStatsSnapshot,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReplicationStatus {
    pub file_id: String,
    pub status: FileStatus,
    pub primary_node: String,
    pub replica_nodes: Vec<String>,
    pub replica_target: usize,
    pub under_replicated: bool,
    pub tasks: Vec<ReplicationTask>,
    pub log: Vec<ReplicationLogEntry>,
}

/// Upload, download and deletion workflows over the shared cluster handles.
#[derive(Clone)]
pub struct PlacementCoordinator {
    state: CoordinatorState,
}

impl PlacementCoordinator {
    pub fn new(state: CoordinatorState) -> Self {
        Self { state }
    }

    #[tracing::instrument(skip(self, content, meta), fields(size = content.len()))]
    pub async fn place_upload(
        &self,
        content: Bytes,
        meta: UploadMetadata,
    ) -> Result<UploadOutcome, CoreError> {
        let cfg = &self.state.cfg;
        let validated = self.validate(&content, meta)?;
        let checksum = content_checksum(&content);

        // identical concurrent uploads collapse onto one record
        let upload_lock = acquire_with_wait(
            &self.state.locks,
            &upload_lock_key(&checksum),
            cfg.lock_ttl,
            cfg.lock_wait,
        )
        .await?;

        if let Some(existing) = self.state.store.find_by_checksum(&checksum)?
            && existing.is_downloadable()
            && existing.downloads_remaining > 0
            && !existing.is_expired_at(utc_now_ms())
        {
            info!(file_id = %existing.id, "duplicate upload, reusing record");
            upload_lock.release().await?;
            return Ok(UploadOutcome {
                record: existing,
                duplicate: true,
            });
        }

        let file_id = Uuid::new_v4().to_string();
        let size = content.len() as u64;

        let placement = self
            .write_primary(&file_id, &content)
            .instrument(info_span!("write_primary", %file_id))
            .await?;

        let now = utc_now_ms();
        let expires_at_ms = now.saturating_add(validated.ttl.as_millis() as i64);
        let is_image = validated.mime_type.starts_with("image/");
        let wants_compression = cfg.compression_enabled && size >= cfg.compression_min_bytes;

        let mut record = FileRecord {
            id: file_id.clone(),
            checksum,
            size_bytes: size,
            mime_type: validated.mime_type,
            original_name: validated.original_name,
            primary_node: placement.primary.id.clone(),
            replica_nodes: Vec::new(),
            planned_replicas: placement.replica_ids(),
            replica_target: cfg.replica_target,
            // nothing is confirmed until the replication tasks land
            under_replicated: cfg.replica_target > 0,
            download_limit: validated.download_limit,
            downloads_remaining: validated.download_limit,
            created_at_ms: now,
            expires_at_ms,
            status: FileStatus::Uploading,
            derived_assets: DerivedAssets {
                compressed: if wants_compression {
                    AssetState::Pending
                } else {
                    AssetState::NotRequested
                },
                thumbnail: if is_image {
                    AssetState::Pending
                } else {
                    AssetState::NotRequested
                },
            },
            purged_nodes: Vec::new(),
        };

        if let Err(e) = self.state.store.save_file_record(&record) {
            warn!(%file_id, error = %e, "record not persisted, removing primary copy");
            self.compensate_primary(&placement.primary.id, &file_id, size)
                .await;
            return Err(e);
        }

        record = self.state.store.update_file_record(&file_id, &mut |r| {
            r.status = FileStatus::Active;
            Ok(())
        })?;
        upload_lock.release().await?;

        self.after_commit(&record, &placement, wants_compression, is_image)
            .instrument(info_span!("dispatch", %file_id))
            .await;

        info!(
            %file_id,
            primary = %record.primary_node,
            replicas = ?record.planned_replicas,
            under_replicated = record.under_replicated,
            "upload placed"
        );

        Ok(UploadOutcome {
            record,
            duplicate: false,
        })
    }

    fn validate(&self, content: &Bytes, meta: UploadMetadata) -> Result<ValidUpload, CoreError> {
        let cfg = &self.state.cfg;
        if content.is_empty() {
            return Err(CoreError::InvalidInput("empty file".into()));
        }
        if content.len() as u64 > cfg.max_upload_bytes {
            return Err(CoreError::InvalidInput(format!(
                "file exceeds {} bytes",
                cfg.max_upload_bytes
            )));
        }

        let mime_type = meta
            .mime_type
            .filter(|m| !m.trim().is_empty())
            .unwrap_or_else(|| "application/octet-stream".to_string());
        if !cfg.mime_allowed(&mime_type) {
            return Err(CoreError::InvalidInput(format!(
                "mime type {mime_type} not allowed"
            )));
        }

        let download_limit = meta.download_limit.unwrap_or(cfg.default_download_limit);
        if download_limit == 0 {
            return Err(CoreError::InvalidInput(
                "download limit must be positive".into(),
            ));
        }

        let ttl = meta.ttl.unwrap_or(cfg.default_ttl);
        if ttl.is_zero() || ttl > cfg.max_ttl {
            return Err(CoreError::InvalidInput(format!(
                "ttl must be within 1..={} seconds",
                cfg.max_ttl.as_secs()
            )));
        }

        let original_name = meta
            .original_name
            .map(|n| n.trim().to_string())
            .filter(|n| !n.is_empty())
            .unwrap_or_else(|| DEFAULT_FILE_NAME.to_string());

        Ok(ValidUpload {
            original_name,
            mime_type,
            download_limit,
            ttl,
        })
    }

    /// Writes the object to a freshly selected primary; on failure the node
    /// is excluded and selection runs once more.
    async fn write_primary(&self, file_id: &str, content: &Bytes) -> Result<Placement, CoreError> {
        let cfg = &self.state.cfg;
        let size = content.len() as u64;
        let mut excluded: Vec<String> = Vec::new();
        let mut last_error = String::new();

        for attempt in 1..=2 {
            let placement = match self.state.selector.select(size, cfg.replica_target, &excluded)
            {
                Ok(p) => p,
                Err(CoreError::NoAvailableNodes) if attempt > 1 => {
                    return Err(CoreError::PrimaryWriteFailed(last_error));
                }
                Err(e) => return Err(e),
            };
            let primary = placement.primary.id.clone();

            let outcome = async {
                let store = self.state.node_store(&primary)?;
                call_with_deadline(&primary, cfg.rpc_timeout, store.put(file_id, content.clone()))
                    .await
            }
            .await;

            match outcome {
                Ok(()) => {
                    self.state
                        .registry
                        .update_usage(&primary, size as i64, 1)?;
                    return Ok(placement);
                }
                Err(e) => {
                    warn!(node_id = %primary, attempt, error = %e, "primary write failed");
                    self.state.note_node_failure(&primary);
                    last_error = e.to_string();
                    excluded.push(primary);
                }
            }
        }

        Err(CoreError::PrimaryWriteFailed(last_error))
    }

    async fn compensate_primary(&self, node_id: &str, file_id: &str, size: u64) {
        let removed = async {
            let store = self.state.node_store(node_id)?;
            call_with_deadline(node_id, self.state.cfg.rpc_timeout, store.delete(file_id)).await
        }
        .await;
        match removed {
            Ok(()) => {
                if let Err(e) = self
                    .state
                    .registry
                    .update_usage(node_id, -(size as i64), -1)
                {
                    warn!(node_id, file_id, error = %e, "usage not released");
                }
            }
            Err(e) => warn!(node_id, file_id, error = %e, "orphaned primary copy"),
        }
    }

    /// Post-commit work. Failures here never undo the upload.
    async fn after_commit(
        &self,
        record: &FileRecord,
        placement: &Placement,
        wants_compression: bool,
        is_image: bool,
    ) {
        let counter_ttl = ttl_until(record.expires_at_ms);
        if let Err(e) = self
            .state
            .locks
            .set_counter(
                &download_counter_key(&record.id),
                record.download_limit as u64,
                counter_ttl,
            )
            .await
        {
            warn!(file_id = %record.id, error = %e, "download counter not initialised");
        }

        let mut payloads: Vec<TaskPayload> = placement
            .replicas
            .iter()
            .map(|target| TaskPayload::Replicate {
                file_id: record.id.clone(),
                source_node: placement.primary.id.clone(),
                target_node: target.id.clone(),
            })
            .collect();
        if wants_compression {
            payloads.push(TaskPayload::Compress {
                file_id: record.id.clone(),
            });
        }
        if is_image {
            payloads.push(TaskPayload::Thumbnail {
                file_id: record.id.clone(),
            });
        }

        for payload in payloads {
            let kind = payload.kind();
            if let Err(e) = self.state.queue.enqueue(payload).await {
                warn!(file_id = %record.id, ?kind, error = %e, "task not enqueued");
            }
        }

        let delete = TaskPayload::Delete {
            file_id: record.id.clone(),
        };
        if let Err(e) = self.state.queue.schedule(delete, record.expires_at_ms).await {
            warn!(file_id = %record.id, error = %e, "expiry not scheduled, sweeper will catch it");
        }
    }

    #[tracing::instrument(skip(self))]
    pub async fn resolve_download(&self, file_id: &str) -> Result<Download, CoreError> {
        let record = self.downloadable_record(file_id)?;

        let counter_key = download_counter_key(file_id);
        let remaining = self.claim_download(&record, &counter_key).await?;

        let (content, served_by) = match self.read_any_copy(&record).await {
            Ok(found) => found,
            Err(e) => {
                // nothing was served, give the download back
                self.state.locks.increment(&counter_key).await?;
                return Err(e);
            }
        };

        let record = self.state.store.update_file_record(file_id, &mut |r| {
            r.downloads_remaining = r.downloads_remaining.min(remaining);
            Ok(())
        })?;

        if record.downloads_remaining == 0 {
            info!(file_id, "download limit reached, scheduling deletion");
            let delete = TaskPayload::Delete {
                file_id: file_id.to_string(),
            };
            if let Err(e) = self.state.queue.enqueue(delete).await {
                warn!(file_id, error = %e, "deletion not enqueued, sweeper will catch it");
            }
        }

        Ok(Download {
            content,
            served_by,
            record,
        })
    }

    /// Takes one download off the shared counter. The lock only covers
    /// seeding the counter from the record; the read happens outside it.
    async fn claim_download(
        &self,
        record: &FileRecord,
        counter_key: &str,
    ) -> Result<u32, CoreError> {
        let cfg = &self.state.cfg;
        let guard = acquire_with_wait(
            &self.state.locks,
            &download_lock_key(&record.id),
            cfg.download_lock_ttl,
            cfg.lock_wait,
        )
        .await?;

        let claimed = async {
            self.state
                .locks
                .init_counter(
                    counter_key,
                    record.downloads_remaining as u64,
                    ttl_until(record.expires_at_ms),
                )
                .await?;
            match self.state.locks.decrement_if_positive(counter_key).await? {
                CounterOutcome::Decremented(left) => Ok(u32::try_from(left).unwrap_or(u32::MAX)),
                CounterOutcome::AlreadyZero => Err(CoreError::CounterExhausted),
            }
        }
        .await;
        guard.release().await?;
        claimed
    }

    fn downloadable_record(&self, file_id: &str) -> Result<FileRecord, CoreError> {
        let record = self
            .state
            .store
            .get_file_record(file_id)?
            .ok_or(CoreError::NotFound)?;
        // an exhausted file reports the limit even once it has been retired
        if record.download_limit > 0 && record.downloads_remaining == 0 {
            return Err(CoreError::CounterExhausted);
        }
        match record.status {
            FileStatus::Deleted | FileStatus::Uploading => return Err(CoreError::NotFound),
            FileStatus::Expired => return Err(CoreError::Expired),
            FileStatus::Active | FileStatus::Processing => {}
        }
        if record.is_expired_at(utc_now_ms()) {
            return Err(CoreError::Expired);
        }
        Ok(record)
    }

    /// Primary first, then confirmed replicas in order. Offline holders are
    /// skipped; a copy whose bytes do not match the checksum is treated as
    /// unreadable.
    async fn read_any_copy(&self, record: &FileRecord) -> Result<(Bytes, String), CoreError> {
        let timeout = self.state.cfg.rpc_timeout;
        for node_id in record.holders() {
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
                    if node_id != record.primary_node {
                        info!(file_id = %record.id, %node_id, "served from replica");
                    }
                    return Ok((content, node_id));
                }
                Ok(_) => {
                    warn!(file_id = %record.id, %node_id, "copy failed checksum verification");
                }
                Err(e) => {
                    warn!(
                        file_id = %record.id,
                        %node_id,
                        error = %e,
                        "read failed, trying next copy"
                    );
                    if matches!(e, CoreError::NodeUnreachable { .. }) {
                        self.state.note_node_failure(&node_id);
                    }
                }
            }
        }
        Err(CoreError::AllCopiesUnreachable)
    }

    pub fn get_file(&self, file_id: &str) -> Result<FileRecord, CoreError> {
        self.state
            .store
            .get_file_record(file_id)?
            .ok_or(CoreError::NotFound)
    }

    pub fn get_cluster_health(&self) -> ClusterHealth {
        let nodes = self.state.registry.snapshot();
        let online_nodes = nodes.iter().filter(|n| n.online).count();
        ClusterHealth {
            online_nodes,
            offline_nodes: nodes.len() - online_nodes,
            capacity_bytes: nodes.iter().map(|n| n.capacity_bytes).sum(),
            used_bytes: nodes.iter().map(|n| n.used_bytes).sum(),
            replication: self.state.replication_stats.snapshot(),
            nodes,
        }
    }

    pub fn get_replication_status(&self, file_id: &str) -> Result<ReplicationStatus, CoreError> {
        let record = self.get_file(file_id)?;
        let tasks = self
            .state
            .queue
            .tasks_for_file(file_id)?
            .iter()
            .filter(|t| t.kind == TaskKind::Replicate)
            .filter_map(ReplicationTask::from_task)
            .collect();
        let log = self.state.store.replication_log(file_id)?;

        Ok(ReplicationStatus {
            file_id: record.id,
            status: record.status,
            primary_node: record.primary_node,
            replica_nodes: record.replica_nodes,
            replica_target: record.replica_target,
            under_replicated: record.under_replicated,
            tasks,
            log,
        })
    }

    /// Removes every physical copy and retires the record. Safe to repeat:
    /// nodes already purged are skipped and a deleted record is returned as is.
    #[tracing::instrument(skip(self))]
    pub async fn delete_file(&self, file_id: &str) -> Result<DeletionOutcome, CoreError> {
        let cfg = &self.state.cfg;
        let existing = self.get_file(file_id)?;
        if existing.status == FileStatus::Deleted {
            return Ok(DeletionOutcome {
                record: existing,
                complete: true,
            });
        }

        let guard = acquire_with_wait(
            &self.state.locks,
            &delete_lock_key(file_id),
            cfg.delete_lock_ttl,
            cfg.lock_wait,
        )
        .await?;

        // stop serving before touching the copies
        let record = self.with_file_lock(file_id, |r| {
            if r.status != FileStatus::Deleted {
                r.status = FileStatus::Expired;
            }
            Ok(())
        })
        .await?;
        if record.status == FileStatus::Deleted {
            guard.release().await?;
            return Ok(DeletionOutcome {
                record,
                complete: true,
            });
        }

        let mut all_purged = true;
        for node_id in deletion_targets(&record) {
            if record.purged_nodes.contains(&node_id) {
                continue;
            }
            let keys = keys_on_node(&record, &node_id);

            match self.purge_node(&node_id, &keys).await {
                Ok(()) => {
                    let accounted: Vec<u64> = keys.iter().filter_map(|(_, size)| *size).collect();
                    let freed: u64 = accounted.iter().sum();
                    if let Err(e) = self.state.registry.update_usage(
                        &node_id,
                        -(freed as i64),
                        -(accounted.len() as i64),
                    ) {
                        warn!(file_id, %node_id, error = %e, "usage not released");
                    }
                    self.state.store.update_file_record(file_id, &mut |r| {
                        if !r.purged_nodes.contains(&node_id) {
                            r.purged_nodes.push(node_id.clone());
                        }
                        Ok(())
                    })?;
                }
                Err(CoreError::UnknownNode(_)) => {
                    warn!(file_id, %node_id, "holder no longer registered, skipping");
                }
                Err(e) => {
                    warn!(file_id, %node_id, error = %e, "copy not deleted");
                    all_purged = false;
                }
            }

            // the fan-out may outlive the initial ttl
            guard.extend(cfg.delete_lock_ttl).await?;
        }

        let record = if all_purged {
            self.state
                .locks
                .delete_counter(&download_counter_key(file_id))
                .await?;
            let record = self
                .with_file_lock(file_id, |r| {
                    r.status = FileStatus::Deleted;
                    Ok(())
                })
                .await?;
            info!(file_id, "file deleted");
            record
        } else {
            self.get_file(file_id)?
        };
        guard.release().await?;

        Ok(DeletionOutcome {
            record,
            complete: all_purged,
        })
    }

    async fn purge_node(
        &self,
        node_id: &str,
        keys: &[(String, Option<u64>)],
    ) -> Result<(), CoreError> {
        let store = self.state.node_store(node_id)?;
        let cfg = &self.state.cfg;
        for (key, _) in keys {
            retry_transient(cfg.rpc_retry_budget, || {
                call_with_deadline(node_id, cfg.rpc_timeout, store.delete(key))
            })
            .await?;
        }
        Ok(())
    }

    /// Record mutation serialised with the other per-file writers.
    pub async fn with_file_lock(
        &self,
        file_id: &str,
        mut mutate: impl FnMut(&mut FileRecord) -> Result<(), CoreError>,
    ) -> Result<FileRecord, CoreError> {
        let guard = acquire_with_wait(
            &self.state.locks,
            &file_lock_key(file_id),
            self.state.cfg.lock_ttl,
            self.state.cfg.lock_wait,
        )
        .await?;
        let updated = self.state.store.update_file_record(file_id, &mut mutate);
        guard.release().await?;
        updated
    }
}

struct ValidUpload {
    original_name: String,
    mime_type: String,
    download_limit: u32,
    ttl: Duration,
}

fn ttl_until(expires_at_ms: i64) -> Option<Duration> {
    let left = expires_at_ms.saturating_sub(utc_now_ms());
    Some(Duration::from_millis(left.max(1) as u64))
}

/// Every node that may hold bytes of this file.
fn deletion_targets(record: &FileRecord) -> Vec<String> {
    let mut targets = record.holders();
    for node in record
        .planned_replicas
        .iter()
        .chain(record.derived_assets.ready_assets().map(|a| &a.node_id))
    {
        if !targets.contains(node) {
            targets.push(node.clone());
        }
    }
    targets
}

/// Object keys this node may hold for the file, with the bytes accounted
/// against the node for each (`None` when never counted).
fn keys_on_node(record: &FileRecord, node_id: &str) -> Vec<(String, Option<u64>)> {
    let mut keys = Vec::new();
    let confirmed = record.holders().iter().any(|n| n == node_id);
    // a planned replica that never confirmed may still hold a stray copy
    keys.push((
        record.object_key().to_string(),
        confirmed.then_some(record.size_bytes),
    ));
    for asset in record.derived_assets.ready_assets() {
        if asset.node_id == node_id {
            keys.push((asset.object_key.clone(), Some(asset.size_bytes)));
        }
    }
    keys
}
