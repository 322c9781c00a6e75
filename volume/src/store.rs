use bytes::Bytes;
use nix::sys::statvfs::statvfs;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::fs::{self, File};
use tokio::io::AsyncWriteExt;
use walkdir::WalkDir;

use common::constants::{BLOB_DIR_NAME, TMP_DIR_NAME};
use common::error::CoreError;
use common::file_utils::{blob_path, content_checksum, fsync_dir, tmp_path};

use crate::state::DurabilityLevel;

pub fn disk_usage(root: &Path) -> anyhow::Result<(Option<u64>, Option<u64>)> {
    let v = statvfs(root)?;
    let cap = v.blocks() as u64 * v.fragment_size() as u64;
    let free = v.blocks_available() as u64 * v.fragment_size() as u64;
    let used = cap.saturating_sub(free);
    Ok((Some(used), Some(cap)))
}

/// Bytes and object count held under `blobs/`.
#[derive(Debug, Default)]
pub struct BlobUsage {
    pub used_bytes: AtomicU64,
    pub file_count: AtomicU64,
}

impl BlobUsage {
    /// Seeds the counters from what is already on disk.
    pub fn scan(root: &Path) -> Self {
        let usage = Self::default();
        for entry in WalkDir::new(root.join(BLOB_DIR_NAME))
            .into_iter()
            .filter_map(Result::ok)
            .filter(|e| e.file_type().is_file())
        {
            if let Ok(meta) = entry.metadata() {
                usage.added(meta.len());
            }
        }
        usage
    }

    pub fn added(&self, size: u64) {
        self.used_bytes.fetch_add(size, Ordering::Relaxed);
        self.file_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn removed(&self, size: u64) {
        let _ = self
            .used_bytes
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| {
                Some(v.saturating_sub(size))
            });
        let _ = self
            .file_count
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| {
                Some(v.saturating_sub(1))
            });
    }

    pub fn snapshot(&self) -> (u64, u64) {
        (
            self.used_bytes.load(Ordering::Relaxed),
            self.file_count.load(Ordering::Relaxed),
        )
    }
}

pub async fn conditional_sync_file(
    file: &mut File,
    durability: &DurabilityLevel,
) -> Result<(), CoreError> {
    match durability {
        DurabilityLevel::Immediate => {
            file.sync_all().await?;
        }
        DurabilityLevel::OS => {
            // Skip sync, rely on OS
        }
    }
    Ok(())
}

pub async fn conditional_sync_dir(
    dir: &Path,
    durability: &DurabilityLevel,
) -> Result<(), CoreError> {
    match durability {
        DurabilityLevel::Immediate => {
            fsync_dir(dir).await?;
        }
        DurabilityLevel::OS => {
            // Skip sync, rely on OS
        }
    }
    Ok(())
}

/// Result of a committed blob write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WrittenBlob {
    pub size: u64,
    pub etag: String,
    /// Size of the blob this write replaced, if any.
    pub replaced: Option<u64>,
}

/// Writes `content` under `key` atomically: temp file, sync, rename into the
/// sharded blob tree, sync the parent directory.
pub async fn write_blob(
    root: &Path,
    key: &str,
    content: Bytes,
    durability: &DurabilityLevel,
) -> Result<WrittenBlob, CoreError> {
    let final_path = blob_path(root, key);
    let tmp = tmp_path(root, &format!("{}.{}", key, uuid::Uuid::new_v4()));

    let etag = content_checksum(&content);
    let size = content.len() as u64;

    let written = async {
        let mut file = File::create(&tmp).await?;
        file.write_all(&content).await?;
        conditional_sync_file(&mut file, durability).await?;
        drop(file);

        let parent = final_path
            .parent()
            .ok_or_else(|| CoreError::InvalidInput(format!("bad blob path for {key}")))?;
        fs::create_dir_all(parent).await?;

        let replaced = fs::metadata(&final_path).await.ok().map(|m| m.len());
        fs::rename(&tmp, &final_path).await?;
        conditional_sync_dir(parent, durability).await?;
        Ok::<_, CoreError>(replaced)
    }
    .await;

    match written {
        Ok(replaced) => Ok(WrittenBlob {
            size,
            etag,
            replaced,
        }),
        Err(e) => {
            let _ = fs::remove_file(&tmp).await;
            Err(e)
        }
    }
}

/// Removes a blob, returning its size. `None` when it was not there.
pub async fn remove_blob(root: &Path, key: &str) -> Result<Option<u64>, CoreError> {
    let path = blob_path(root, key);
    let size = match fs::metadata(&path).await {
        Ok(meta) => meta.len(),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    match fs::remove_file(&path).await {
        Ok(()) => Ok(Some(size)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Leftover temp files from interrupted writes.
pub async fn sweep_tmp(root: &Path) -> std::io::Result<usize> {
    let mut removed = 0;
    let mut entries = fs::read_dir(root.join(TMP_DIR_NAME)).await?;
    while let Some(entry) = entries.next_entry().await? {
        if entry.file_type().await?.is_file() {
            fs::remove_file(entry.path()).await?;
            removed += 1;
        }
    }
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::file_utils::init_dirs;
    use tempfile::TempDir;

    #[tokio::test]
    async fn write_replace_remove() {
        let dir = TempDir::new().unwrap();
        init_dirs(dir.path()).await.unwrap();

        let first = write_blob(
            dir.path(),
            "k1",
            Bytes::from_static(b"hello"),
            &DurabilityLevel::Immediate,
        )
        .await
        .unwrap();
        assert_eq!(first.size, 5);
        assert_eq!(first.etag, content_checksum(b"hello"));
        assert_eq!(first.replaced, None);

        let second = write_blob(dir.path(), "k1", Bytes::from_static(b"hi"), &DurabilityLevel::OS)
            .await
            .unwrap();
        assert_eq!(second.replaced, Some(5));
        assert_eq!(fs::read(blob_path(dir.path(), "k1")).await.unwrap(), b"hi");

        assert_eq!(remove_blob(dir.path(), "k1").await.unwrap(), Some(2));
        assert_eq!(remove_blob(dir.path(), "k1").await.unwrap(), None);
        assert_eq!(sweep_tmp(dir.path()).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn usage_scan_counts_existing_blobs() {
        let dir = TempDir::new().unwrap();
        init_dirs(dir.path()).await.unwrap();
        for key in ["a", "b", "c"] {
            write_blob(dir.path(), key, Bytes::from_static(b"1234"), &DurabilityLevel::OS)
                .await
                .unwrap();
        }

        let usage = BlobUsage::scan(dir.path());
        assert_eq!(usage.snapshot(), (12, 3));

        usage.removed(4);
        usage.removed(100);
        assert_eq!(usage.snapshot(), (0, 1));
    }

    #[tokio::test]
    async fn tmp_sweep_removes_leftovers() {
        let dir = TempDir::new().unwrap();
        init_dirs(dir.path()).await.unwrap();
        fs::write(tmp_path(dir.path(), "stale.part"), b"x").await.unwrap();
        assert_eq!(sweep_tmp(dir.path()).await.unwrap(), 1);
    }
}
