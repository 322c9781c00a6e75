use clap::Args;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use common::url_utils::parse_node_spec;

use crate::core::client::HttpConnector;
use crate::core::config::ClusterConfig;
use crate::core::lock::LocalLockService;
use crate::core::meta::{KvDb, MetaStore};
use crate::core::node::StorageNode;
use crate::core::queue::DurableTaskQueue;
use crate::core::registry::NodeRegistry;
use crate::core::state::CoordinatorState;

const MIB: u64 = 1024 * 1024;

/// Cluster tunables shared by every subcommand that talks to storage nodes.
#[derive(Args, Debug, Clone)]
pub struct ClusterArgs {
    /// Static storage node, `id=url[,capacity_bytes]`. Repeatable.
    #[arg(long = "node", env = "DFS_NODES", value_delimiter = ';')]
    pub nodes: Vec<String>,

    /// Replicas per file, on top of the primary copy
    #[arg(long, env = "DFS_REPLICA_TARGET", default_value_t = 2)]
    pub replica_target: usize,

    /// Free space a node must keep after a write (MiB)
    #[arg(long, default_value_t = 100)]
    pub min_free_mib: u64,

    #[arg(long, default_value_t = 10)]
    pub check_interval_secs: u64,

    #[arg(long, default_value_t = 3)]
    pub check_timeout_secs: u64,

    /// Consecutive failed checks before a node is marked offline
    #[arg(long, default_value_t = 3)]
    pub offline_threshold: u32,

    /// Per-request timeout towards storage nodes (seconds)
    #[arg(long, default_value_t = 10)]
    pub http_timeout_secs: u64,

    #[arg(long, default_value_t = 5)]
    pub replication_max_attempts: u32,

    #[arg(long, default_value_t = 4)]
    pub replication_concurrency: usize,

    /// Largest accepted upload (MiB)
    #[arg(long, env = "DFS_MAX_UPLOAD_MIB", default_value_t = 50)]
    pub max_upload_mib: u64,

    /// Accepted mime type prefixes, comma separated. Empty accepts all.
    #[arg(long, value_delimiter = ',')]
    pub allowed_mime: Vec<String>,

    #[arg(long, default_value_t = 3)]
    pub default_download_limit: u32,

    #[arg(long, default_value_t = 3600)]
    pub default_ttl_secs: u64,

    #[arg(long, default_value_t = 30 * 24 * 3600)]
    pub max_ttl_secs: u64,

    #[arg(long, default_value_t = 30)]
    pub expiry_sweep_secs: u64,

    /// Default part size for chunked uploads (MiB)
    #[arg(long, default_value_t = 5)]
    pub chunk_size_mib: u64,

    /// How long an unfinished chunked upload is kept
    #[arg(long, default_value_t = 3600)]
    pub upload_session_ttl_secs: u64,

    /// Skip gzip post-processing
    #[arg(long, default_value_t = false)]
    pub no_compression: bool,
}

impl ClusterArgs {
    pub fn to_config(&self) -> ClusterConfig {
        let defaults = ClusterConfig::default();
        ClusterConfig {
            replica_target: self.replica_target,
            min_free_bytes: self.min_free_mib.saturating_mul(MIB),
            check_interval: Duration::from_secs(self.check_interval_secs.max(1)),
            check_timeout: Duration::from_secs(self.check_timeout_secs.max(1)),
            offline_threshold: self.offline_threshold.max(1),
            rpc_timeout: Duration::from_secs(self.http_timeout_secs.max(1)),
            replication_max_attempts: self.replication_max_attempts.max(1),
            replication_concurrency: self.replication_concurrency.max(1),
            compression_enabled: !self.no_compression,
            max_upload_bytes: self.max_upload_mib.saturating_mul(MIB),
            allowed_mime_prefixes: self.allowed_mime.clone(),
            default_download_limit: self.default_download_limit,
            default_ttl: Duration::from_secs(self.default_ttl_secs),
            max_ttl: Duration::from_secs(self.max_ttl_secs),
            expiry_sweep_interval: Duration::from_secs(self.expiry_sweep_secs.max(1)),
            chunk_size: self.chunk_size_mib.max(1).saturating_mul(MIB),
            upload_session_ttl: Duration::from_secs(self.upload_session_ttl_secs.max(1)),
            ..defaults
        }
    }
}

/// Opens the metadata index and wires every coordinator service around it.
/// Statically configured nodes are registered on top of the persisted ones.
pub fn open_cluster(index: &Path, args: &ClusterArgs) -> anyhow::Result<CoordinatorState> {
    let cfg = args.to_config();
    let db = KvDb::open(index)?;
    let store: Arc<dyn MetaStore> = Arc::new(db);

    let registry = NodeRegistry::load_from_store(store.clone())?;
    for raw in &args.nodes {
        let spec = parse_node_spec(raw)?;
        // capacity 0 until the first check reports it
        let capacity = spec
            .capacity_bytes
            .or_else(|| registry.get(&spec.id).ok().map(|n| n.capacity_bytes))
            .unwrap_or(0);
        let node = registry.register(StorageNode::new(spec.id, spec.endpoint, capacity))?;
        info!(node_id = %node.id, endpoint = %node.endpoint, "static node registered");
    }

    let http_client = reqwest::Client::builder()
        .pool_idle_timeout(Duration::from_secs(30))
        .tcp_keepalive(Duration::from_secs(30))
        .timeout(cfg.rpc_timeout)
        .build()?;
    let connector = Arc::new(HttpConnector::new(http_client, cfg.rpc_timeout));
    let queue = Arc::new(DurableTaskQueue::new(store.clone()));

    Ok(CoordinatorState::new(
        cfg,
        store,
        registry,
        connector,
        Arc::new(LocalLockService::new()),
        queue,
    ))
}
