use bytes::{Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{info, warn};
use uuid::Uuid;

use common::error::CoreError;
use common::file_utils::content_checksum;
use common::schemas::{CompleteUploadRequest, InitUploadRequest};
use common::time_utils::utc_now_ms;

use crate::core::placement::{UploadMetadata, UploadOutcome};
use crate::core::state::CoordinatorState;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Open,
    /// Parts are being assembled; no part may change.
    Completing,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UploadPart {
    pub number: u32,
    pub size_bytes: u64,
    pub checksum: String,
}

/// Manifest of a chunked upload. Part bytes are stored beside it under the
/// same id and go away with it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UploadSession {
    pub id: String,
    pub original_name: Option<String>,
    pub mime_type: Option<String>,
    pub total_size: u64,
    pub chunk_size: u64,
    pub parts_expected: u32,
    pub parts: BTreeMap<u32, UploadPart>,
    pub status: SessionStatus,
    pub created_at_ms: i64,
    pub expires_at_ms: i64,
}

impl UploadSession {
    pub fn received(&self) -> u32 {
        self.parts.len() as u32
    }

    pub fn received_bytes(&self) -> u64 {
        self.parts.values().map(|p| p.size_bytes).sum()
    }

    pub fn missing_parts(&self) -> Vec<u32> {
        (1..=self.parts_expected)
            .filter(|n| !self.parts.contains_key(n))
            .collect()
    }

    /// Every part is `chunk_size` long except the last, which takes the rest.
    pub fn expected_part_size(&self, number: u32) -> u64 {
        if number < self.parts_expected {
            self.chunk_size
        } else {
            self.total_size - self.chunk_size * (self.parts_expected as u64 - 1)
        }
    }

    pub fn is_expired_at(&self, now_ms: i64) -> bool {
        now_ms >= self.expires_at_ms
    }
}

/// Multi-request uploads: parts are collected in the metadata store and the
/// assembled file goes through the regular upload path.
#[derive(Clone)]
pub struct ChunkedUploads {
    state: CoordinatorState,
}

impl ChunkedUploads {
    pub fn new(state: CoordinatorState) -> Self {
        Self { state }
    }

    pub fn init(&self, req: InitUploadRequest) -> Result<UploadSession, CoreError> {
        let cfg = &self.state.cfg;
        if req.size == 0 {
            return Err(CoreError::InvalidInput("empty file".into()));
        }
        if req.size > cfg.max_upload_bytes {
            return Err(CoreError::InvalidInput(format!(
                "file exceeds {} bytes",
                cfg.max_upload_bytes
            )));
        }
        if let Some(mime) = req.mime_type.as_deref()
            && !mime.trim().is_empty()
            && !cfg.mime_allowed(mime)
        {
            return Err(CoreError::InvalidInput(format!(
                "mime type {mime} not allowed"
            )));
        }

        let chunk_size = req.chunk_size.unwrap_or(cfg.chunk_size);
        if chunk_size == 0 {
            return Err(CoreError::InvalidInput("chunk size must be positive".into()));
        }
        let parts_expected = u32::try_from(req.size.div_ceil(chunk_size))
            .ok()
            .filter(|n| *n <= cfg.max_upload_parts)
            .ok_or_else(|| {
                CoreError::InvalidInput(format!(
                    "more than {} parts, raise the chunk size",
                    cfg.max_upload_parts
                ))
            })?;

        let now = utc_now_ms();
        let session = UploadSession {
            id: Uuid::new_v4().to_string(),
            original_name: req.original_name,
            mime_type: req.mime_type,
            total_size: req.size,
            chunk_size,
            parts_expected,
            parts: BTreeMap::new(),
            status: SessionStatus::Open,
            created_at_ms: now,
            expires_at_ms: now.saturating_add(cfg.upload_session_ttl.as_millis() as i64),
        };
        self.state.store.save_upload_session(&session)?;
        info!(
            upload_id = %session.id,
            size = session.total_size,
            parts = parts_expected,
            "chunked upload opened"
        );

        Ok(session)
    }

    /// Stores one part. Sending a part again replaces it.
    #[tracing::instrument(skip(self, content, checksum), fields(size = content.len()))]
    pub fn upload_part(
        &self,
        upload_id: &str,
        number: u32,
        content: Bytes,
        checksum: Option<&str>,
    ) -> Result<UploadSession, CoreError> {
        let session = self.status(upload_id)?;
        if number == 0 || number > session.parts_expected {
            return Err(CoreError::InvalidInput(format!(
                "part number must be within 1..={}",
                session.parts_expected
            )));
        }
        let expected = session.expected_part_size(number);
        if content.len() as u64 != expected {
            return Err(CoreError::InvalidInput(format!(
                "part {number} must be {expected} bytes, got {}",
                content.len()
            )));
        }

        let actual = content_checksum(&content);
        if let Some(claimed) = checksum
            && claimed != actual
        {
            warn!(upload_id, number, "part failed checksum verification");
            return Err(CoreError::ChecksumMismatch);
        }

        let part = UploadPart {
            number,
            size_bytes: expected,
            checksum: actual,
        };
        self.state
            .store
            .write_upload_part(upload_id, number, &content, &mut |s| {
                if s.status != SessionStatus::Open {
                    return Err(CoreError::Conflict("upload is being completed".into()));
                }
                s.parts.insert(number, part.clone());
                Ok(())
            })
    }

    /// Live session, or `Expired` once its ttl has passed.
    pub fn status(&self, upload_id: &str) -> Result<UploadSession, CoreError> {
        let session = self
            .state
            .store
            .get_upload_session(upload_id)?
            .ok_or(CoreError::NotFound)?;
        if session.is_expired_at(utc_now_ms()) {
            return Err(CoreError::Expired);
        }
        Ok(session)
    }

    /// Assembles the parts in order and places the result like a single-shot
    /// upload. A failed attempt reopens the session so the client can fix
    /// parts and try again.
    #[tracing::instrument(skip(self, req))]
    pub async fn complete(
        &self,
        upload_id: &str,
        req: CompleteUploadRequest,
    ) -> Result<UploadOutcome, CoreError> {
        let now = utc_now_ms();
        let session = self
            .state
            .store
            .update_upload_session(upload_id, &mut |s| {
                if s.is_expired_at(now) {
                    return Err(CoreError::Expired);
                }
                if s.status != SessionStatus::Open {
                    return Err(CoreError::Conflict(
                        "upload is already being completed".into(),
                    ));
                }
                let missing = s.missing_parts();
                if !missing.is_empty() {
                    return Err(CoreError::Conflict(format!(
                        "{} of {} parts received, missing {:?}",
                        s.received(),
                        s.parts_expected,
                        missing
                    )));
                }
                s.status = SessionStatus::Completing;
                Ok(())
            })?;

        let placed = async {
            let content = self.assemble(&session)?;
            if let Some(claimed) = req.checksum.as_deref()
                && claimed != content_checksum(&content)
            {
                return Err(CoreError::ChecksumMismatch);
            }
            let meta = UploadMetadata {
                original_name: session.original_name.clone(),
                mime_type: session.mime_type.clone(),
                download_limit: req.download_limit,
                ttl: req.ttl_seconds.map(Duration::from_secs),
            };
            self.state.placement().place_upload(content, meta).await
        }
        .await;

        let outcome = match placed {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!(upload_id, error = %e, "chunked upload not placed, reopening");
                self.reopen(upload_id);
                return Err(e);
            }
        };

        if let Err(e) = self.state.store.delete_upload_session(upload_id) {
            warn!(upload_id, error = %e, "finished session not removed, sweeper will catch it");
        }
        info!(
            upload_id,
            file_id = %outcome.record.id,
            duplicate = outcome.duplicate,
            "chunked upload completed"
        );

        Ok(outcome)
    }

    fn assemble(&self, session: &UploadSession) -> Result<Bytes, CoreError> {
        let mut content = BytesMut::with_capacity(session.total_size as usize);
        for (number, part) in &session.parts {
            let bytes = self
                .state
                .store
                .get_upload_part(&session.id, *number)?
                .ok_or_else(|| anyhow::anyhow!("part {} of {} lost", number, session.id))?;
            // parts are verified again before they become a file
            if content_checksum(&bytes) != part.checksum {
                return Err(CoreError::ChecksumMismatch);
            }
            content.extend_from_slice(&bytes);
        }
        Ok(content.freeze())
    }

    fn reopen(&self, upload_id: &str) {
        let reopened = self.state.store.update_upload_session(upload_id, &mut |s| {
            s.status = SessionStatus::Open;
            Ok(())
        });
        if let Err(e) = reopened {
            warn!(upload_id, error = %e, "session left completing until it expires");
        }
    }

    pub fn abort(&self, upload_id: &str) -> Result<(), CoreError> {
        if self.state.store.get_upload_session(upload_id)?.is_none() {
            return Err(CoreError::NotFound);
        }
        self.state.store.delete_upload_session(upload_id)?;
        info!(upload_id, "chunked upload aborted");
        Ok(())
    }

    /// Drops sessions past their ttl together with their parts.
    pub fn purge_stale(&self) -> Result<usize, CoreError> {
        let now = utc_now_ms();
        let mut purged = 0;
        for session in self.state.store.list_upload_sessions()? {
            if !session.is_expired_at(now) {
                continue;
            }
            self.state.store.delete_upload_session(&session.id)?;
            purged += 1;
        }
        if purged > 0 {
            info!(purged, "stale chunked uploads removed");
        }
        Ok(purged)
    }
}
