use std::time::Duration;

const MIB: u64 = 1024 * 1024;

/// Tunables shared by every coordinator component. `Default` carries the
/// production values; tests override individual fields.
#[derive(Debug, Clone)]
pub struct ClusterConfig {
    // placement
    pub replica_target: usize,
    pub min_free_bytes: u64,
    pub weight_free_space: f64,
    pub weight_failures: f64,
    pub selection_jitter: f64,

    // health
    pub check_interval: Duration,
    pub check_timeout: Duration,
    pub offline_threshold: u32,

    // node RPCs
    pub rpc_timeout: Duration,
    pub rpc_retry_budget: Duration,

    // replication
    pub replication_max_attempts: u32,
    pub replication_backoff_base: Duration,
    pub replication_backoff_cap: Duration,
    pub replication_concurrency: usize,

    // post-processing
    pub postprocess_max_attempts: u32,
    pub compression_enabled: bool,
    pub compression_min_bytes: u64,

    // uploads and downloads
    pub max_upload_bytes: u64,
    pub allowed_mime_prefixes: Vec<String>,
    pub default_download_limit: u32,
    pub default_ttl: Duration,
    pub max_ttl: Duration,

    // chunked uploads
    pub chunk_size: u64,
    pub max_upload_parts: u32,
    pub upload_session_ttl: Duration,

    // locks
    pub lock_ttl: Duration,
    pub download_lock_ttl: Duration,
    pub delete_lock_ttl: Duration,
    pub lock_wait: Duration,

    // expiry
    pub expiry_sweep_interval: Duration,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            replica_target: 2,
            min_free_bytes: 100 * MIB,
            weight_free_space: 0.7,
            weight_failures: 0.3,
            selection_jitter: 0.05,

            check_interval: Duration::from_secs(10),
            check_timeout: Duration::from_secs(3),
            offline_threshold: 3,

            rpc_timeout: Duration::from_secs(10),
            rpc_retry_budget: Duration::from_secs(20),

            replication_max_attempts: 5,
            replication_backoff_base: Duration::from_secs(1),
            replication_backoff_cap: Duration::from_secs(60),
            replication_concurrency: 4,

            postprocess_max_attempts: 3,
            compression_enabled: true,
            compression_min_bytes: 1024,

            max_upload_bytes: 50 * MIB,
            allowed_mime_prefixes: Vec::new(),
            default_download_limit: 3,
            default_ttl: Duration::from_secs(3600),
            max_ttl: Duration::from_secs(30 * 24 * 3600),

            chunk_size: 5 * MIB,
            max_upload_parts: 10_000,
            upload_session_ttl: Duration::from_secs(3600),

            lock_ttl: Duration::from_secs(30),
            download_lock_ttl: Duration::from_secs(10),
            delete_lock_ttl: Duration::from_secs(60),
            lock_wait: Duration::from_secs(2),

            expiry_sweep_interval: Duration::from_secs(30),
        }
    }
}

impl ClusterConfig {
    /// An empty prefix list accepts every mime type.
    pub fn mime_allowed(&self, mime: &str) -> bool {
        self.allowed_mime_prefixes.is_empty()
            || self
                .allowed_mime_prefixes
                .iter()
                .any(|prefix| mime.starts_with(prefix.as_str()))
    }
}
