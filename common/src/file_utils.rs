use axum::http::HeaderMap;
use std::{
    io,
    path::{Path, PathBuf},
};
use tokio::fs;

use crate::constants::{BLOB_DIR_NAME, MAX_OBJECT_KEY_LEN, TMP_DIR_NAME};
use crate::error::CoreError;

pub fn parse_content_length(headers: &HeaderMap) -> Option<u64> {
    headers
        .get(axum::http::header::CONTENT_LENGTH)?
        .to_str()
        .ok()?
        .parse()
        .ok()
}

/// Hex blake3 digest used as the file checksum and the volume etag.
pub fn content_checksum(bytes: &[u8]) -> String {
    blake3::hash(bytes).to_hex().to_string()
}

/// Object keys travel in URL paths and become file names on volumes.
pub fn validate_object_key(key: &str) -> Result<(), CoreError> {
    if key.is_empty() || key.len() > MAX_OBJECT_KEY_LEN {
        return Err(CoreError::InvalidInput(format!(
            "object key length must be 1..={}",
            MAX_OBJECT_KEY_LEN
        )));
    }
    if key.starts_with('.')
        || !key
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_' || b == b'.')
    {
        return Err(CoreError::InvalidInput(format!(
            "object key contains forbidden characters: {}",
            key
        )));
    }
    Ok(())
}

fn shard_dirs(key: &str) -> (String, String) {
    let hash = blake3::hash(key.as_bytes());
    let bytes = hash.as_bytes();
    (format!("{:02x}", bytes[0]), format!("{:02x}", bytes[1]))
}

pub fn blob_path(root: &Path, key: &str) -> PathBuf {
    let (a, b) = shard_dirs(key);
    root.join(BLOB_DIR_NAME).join(a).join(b).join(key)
}

pub fn tmp_path(root: &Path, name: &str) -> PathBuf {
    root.join(TMP_DIR_NAME).join(name)
}

pub async fn init_dirs(root: &Path) -> anyhow::Result<()> {
    fs::create_dir_all(root.join(BLOB_DIR_NAME)).await?;
    fs::create_dir_all(root.join(TMP_DIR_NAME)).await?;
    Ok(())
}

pub async fn file_exists(path: &Path) -> bool {
    fs::metadata(path)
        .await
        .map(|m| m.is_file())
        .unwrap_or(false)
}

pub async fn fsync_dir(dir: &Path) -> io::Result<()> {
    let dir = dir.to_path_buf();
    tokio::task::spawn_blocking(move || std::fs::File::open(&dir)?.sync_all())
        .await
        .map_err(io::Error::other)?
}
