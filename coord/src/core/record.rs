use serde::{Deserialize, Serialize};
use std::fmt::Display;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FileStatus {
    Uploading,  // primary written, record not yet usable
    Active,     // downloadable
    Processing, // downloadable, derived assets being produced
    Expired,    // no more downloads, physical copies being removed
    Deleted,    // all copies removed
}

impl Display for FileStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FileStatus::Uploading => write!(f, "uploading"),
            FileStatus::Active => write!(f, "active"),
            FileStatus::Processing => write!(f, "processing"),
            FileStatus::Expired => write!(f, "expired"),
            FileStatus::Deleted => write!(f, "deleted"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DerivedAsset {
    pub object_key: String,
    pub node_id: String,
    pub size_bytes: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(tag = "state", content = "detail", rename_all = "snake_case")]
pub enum AssetState {
    #[default]
    NotRequested,
    Pending,
    Running,
    Ready(DerivedAsset),
    Skipped(String),
    Failed(String),
}

impl AssetState {
    pub fn ready(&self) -> Option<&DerivedAsset> {
        match self {
            AssetState::Ready(asset) => Some(asset),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct DerivedAssets {
    pub compressed: AssetState,
    pub thumbnail: AssetState,
}

impl DerivedAssets {
    pub fn any_running(&self) -> bool {
        self.compressed == AssetState::Running || self.thumbnail == AssetState::Running
    }

    pub fn ready_assets(&self) -> impl Iterator<Item = &DerivedAsset> {
        self.compressed.ready().into_iter().chain(self.thumbnail.ready())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FileRecord {
    pub id: String,
    pub checksum: String,
    pub size_bytes: u64,
    pub mime_type: String,
    pub original_name: String,
    pub primary_node: String,
    /// Confirmed copies, in the order replication completed. Set semantics.
    pub replica_nodes: Vec<String>,
    /// Targets chosen at placement time.
    pub planned_replicas: Vec<String>,
    pub replica_target: usize,
    pub under_replicated: bool,
    pub download_limit: u32,
    pub downloads_remaining: u32,
    pub created_at_ms: i64,
    pub expires_at_ms: i64,
    pub status: FileStatus,
    pub derived_assets: DerivedAssets,
    /// Nodes already purged by an in-progress deletion.
    #[serde(default)]
    pub purged_nodes: Vec<String>,
}

impl FileRecord {
    /// Key of the primary object on every node holding a copy.
    pub fn object_key(&self) -> &str {
        &self.id
    }

    pub fn compressed_key(&self) -> String {
        format!("{}.gz", self.id)
    }

    pub fn thumbnail_key(&self) -> String {
        format!("{}.thumb", self.id)
    }

    /// Primary first, then confirmed replicas in order.
    pub fn holders(&self) -> Vec<String> {
        let mut holders = Vec::with_capacity(1 + self.replica_nodes.len());
        holders.push(self.primary_node.clone());
        for node in &self.replica_nodes {
            if !holders.contains(node) {
                holders.push(node.clone());
            }
        }
        holders
    }

    /// Returns false when `node_id` was already a replica.
    pub fn add_replica(&mut self, node_id: &str) -> bool {
        if node_id == self.primary_node || self.replica_nodes.iter().any(|n| n == node_id) {
            return false;
        }
        self.replica_nodes.push(node_id.to_string());
        if self.replica_nodes.len() >= self.replica_target {
            self.under_replicated = false;
        }
        true
    }

    pub fn is_expired_at(&self, now_ms: i64) -> bool {
        now_ms >= self.expires_at_ms
    }

    pub fn is_downloadable(&self) -> bool {
        matches!(self.status, FileStatus::Active | FileStatus::Processing)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self.status, FileStatus::Expired | FileStatus::Deleted)
    }
}

/// One line of the per-file replication history.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReplicationLogEntry {
    pub file_id: String,
    pub target_node: String,
    pub source_node: Option<String>,
    pub attempt: u32,
    pub outcome: ReplicationOutcome,
    pub detail: Option<String>,
    pub at_ms: i64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ReplicationOutcome {
    Succeeded,
    AlreadyPresent,
    Retrying,
    FailedPermanent,
}

#[cfg(test)]
pub(crate) fn sample_record(id: &str, primary: &str) -> FileRecord {
    FileRecord {
        id: id.to_string(),
        checksum: "c".repeat(64),
        size_bytes: 10,
        mime_type: "text/plain".to_string(),
        original_name: "a.txt".to_string(),
        primary_node: primary.to_string(),
        replica_nodes: vec![],
        planned_replicas: vec![],
        replica_target: 2,
        under_replicated: false,
        download_limit: 3,
        downloads_remaining: 3,
        created_at_ms: 0,
        expires_at_ms: 1_000,
        status: FileStatus::Active,
        derived_assets: DerivedAssets::default(),
        purged_nodes: vec![],
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_replica_has_set_semantics() {
        let mut rec = sample_record("f1", "a");
        rec.under_replicated = true;
        assert!(rec.add_replica("b"));
        assert!(!rec.add_replica("b"));
        assert!(!rec.add_replica("a"));
        assert!(rec.under_replicated);
        assert!(rec.add_replica("c"));
        assert!(!rec.under_replicated);
        assert_eq!(rec.holders(), vec!["a", "b", "c"]);
    }

    #[test]
    fn expiry_boundary() {
        let rec = sample_record("f1", "a");
        assert!(!rec.is_expired_at(999));
        assert!(rec.is_expired_at(1_000));
    }

    #[test]
    fn asset_state_serializes_tagged() {
        let state = AssetState::Skipped("no gain".into());
        let json = serde_json::to_string(&state).unwrap();
        assert_eq!(json, r#"{"state":"skipped","detail":"no gain"}"#);
        let back: AssetState = serde_json::from_str(r#"{"state":"pending"}"#).unwrap();
        assert_eq!(back, AssetState::Pending);
    }
}
