use serde::{Deserialize, Serialize};

/// Volume reply to a successful object write.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct PutResponse {
    pub key: String,
    pub size: u64,
    pub etag: String,
}

/// Volume liveness report. Usage fields are optional so that minimal
/// object stores can answer health checks without accounting.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct HealthResponse {
    pub node_id: String,
    pub status: String,
    pub used_bytes: Option<u64>,
    pub capacity_bytes: Option<u64>,
    pub file_count: Option<u64>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct RegisterNodeRequest {
    pub id: String,
    pub endpoint: String,
    pub capacity_bytes: u64,
}

/// Opens a chunked upload. `size` is the assembled length in bytes.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct InitUploadRequest {
    pub original_name: Option<String>,
    pub mime_type: Option<String>,
    pub size: u64,
    pub chunk_size: Option<u64>,
}

/// Finishes a chunked upload. `checksum` is the blake3 hex digest of the
/// assembled file; when present it must match.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct CompleteUploadRequest {
    pub checksum: Option<String>,
    pub download_limit: Option<u32>,
    pub ttl_seconds: Option<u64>,
}
