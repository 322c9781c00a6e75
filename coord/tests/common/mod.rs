#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use axum_server::Server;
use bytes::Bytes;
use tempfile::TempDir;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use common::file_utils::init_dirs;
use coord::core::client::{MemoryConnector, MemoryObjectStore, ObjectStore};
use coord::core::config::ClusterConfig;
use coord::core::expiry::DeletionWorker;
use coord::core::lock::LocalLockService;
use coord::core::meta::{KvDb, MetaStore};
use coord::core::node::StorageNode;
use coord::core::placement::{PlacementCoordinator, UploadMetadata};
use coord::core::postprocess::PostProcessor;
use coord::core::queue::DurableTaskQueue;
use coord::core::record::FileRecord;
use coord::core::registry::NodeRegistry;
use coord::core::replication::ReplicationEngine;
use coord::core::state::CoordinatorState;
use volume::state::VolumeState;

pub const NODE_CAPACITY: u64 = 1024 * 1024 * 1024;

/// Production defaults with every delay shrunk to test scale.
pub fn test_config() -> ClusterConfig {
    ClusterConfig {
        min_free_bytes: 0,
        check_interval: Duration::from_millis(50),
        check_timeout: Duration::from_millis(200),
        rpc_timeout: Duration::from_secs(1),
        rpc_retry_budget: Duration::from_millis(200),
        replication_backoff_base: Duration::from_millis(10),
        replication_backoff_cap: Duration::from_millis(50),
        lock_wait: Duration::from_secs(5),
        expiry_sweep_interval: Duration::from_millis(100),
        ..ClusterConfig::default()
    }
}

pub fn node_id(i: usize) -> String {
    format!("n{}", i + 1)
}

/// Coordinator services over in-memory storage nodes and a real RocksDB index.
pub struct TestCluster {
    pub state: CoordinatorState,
    pub connector: MemoryConnector,
    pub stores: Vec<Arc<MemoryObjectStore>>,
    pub data_dir: TempDir,
    shutdown_tx: watch::Sender<bool>,
    workers: Vec<JoinHandle<Result<(), anyhow::Error>>>,
}

impl TestCluster {
    pub fn new(nodes: usize) -> Result<Self> {
        Self::with_config(nodes, test_config())
    }

    pub fn with_config(nodes: usize, cfg: ClusterConfig) -> Result<Self> {
        let data_dir = TempDir::new()?;
        let db: Arc<dyn MetaStore> = Arc::new(KvDb::open(&data_dir.path().join("index"))?);

        let registry = NodeRegistry::with_store(db.clone());
        let connector = MemoryConnector::new();
        let mut stores = Vec::with_capacity(nodes);
        for i in 0..nodes {
            let id = node_id(i);
            stores.push(connector.add(MemoryObjectStore::new(id.clone(), NODE_CAPACITY)));
            registry.register(StorageNode::new(id.clone(), format!("mem://{id}"), NODE_CAPACITY))?;
            registry.mark_online(&id)?;
        }

        let queue = Arc::new(DurableTaskQueue::new(db.clone()));
        let state = CoordinatorState::new(
            cfg,
            db,
            registry,
            Arc::new(connector.clone()),
            Arc::new(LocalLockService::new()),
            queue,
        );

        let (shutdown_tx, _) = watch::channel(false);
        Ok(Self {
            state,
            connector,
            stores,
            data_dir,
            shutdown_tx,
            workers: Vec::new(),
        })
    }

    pub fn placement(&self) -> PlacementCoordinator {
        self.state.placement()
    }

    pub fn store(&self, node_id: &str) -> Arc<MemoryObjectStore> {
        self.stores
            .iter()
            .find(|s| s.node_id() == node_id)
            .cloned()
            .unwrap_or_else(|| panic!("no store {node_id}"))
    }

    /// Replication, post-processing and deletion consumers.
    pub fn start_workers(&mut self) {
        let rx = self.shutdown_tx.subscribe();
        self.workers.push(tokio::spawn(
            ReplicationEngine::new(self.state.clone()).run(rx.clone()),
        ));
        self.workers
            .push(tokio::spawn(PostProcessor::new(self.state.clone()).run(rx.clone())));
        self.workers
            .push(tokio::spawn(DeletionWorker::new(self.state.clone()).run(rx)));
    }

    pub async fn upload(&self, content: &[u8], download_limit: u32) -> Result<FileRecord> {
        let outcome = self
            .placement()
            .place_upload(
                Bytes::copy_from_slice(content),
                UploadMetadata {
                    original_name: Some("test.bin".into()),
                    download_limit: Some(download_limit),
                    ..UploadMetadata::default()
                },
            )
            .await?;
        Ok(outcome.record)
    }

    pub fn record(&self, file_id: &str) -> Result<FileRecord> {
        Ok(self.placement().get_file(file_id)?)
    }

    /// Waits until the record has `n` confirmed replicas.
    pub async fn wait_replicated(&self, file_id: &str, n: usize) -> Result<FileRecord> {
        wait_until(5000, || async { Ok(self.record(file_id)?.replica_nodes.len() >= n) }).await?;
        self.record(file_id)
    }

    pub async fn shutdown(self) -> Result<()> {
        let _ = self.shutdown_tx.send(true);
        for handle in self.workers {
            handle.await??;
        }
        Ok(())
    }
}

pub struct TestServer {
    pub handle: JoinHandle<Result<(), anyhow::Error>>,
    pub shutdown_tx: watch::Sender<bool>,
    pub addr: SocketAddr,
    pub url: String,
}

impl TestServer {
    pub async fn spawn(app: axum::Router) -> Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let url = format!("http://{}", addr);

        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(async move {
            let server = Server::from_tcp(listener.into_std()?).serve(app.into_make_service());

            tokio::select! {
                res = server => res.map_err(anyhow::Error::from),
                _ = shutdown_rx.changed() => Ok(()),
            }
        });

        Ok(Self {
            handle,
            shutdown_tx,
            addr,
            url,
        })
    }

    pub async fn shutdown(self) -> Result<()> {
        let _ = self.shutdown_tx.send(true);
        self.handle.abort();
        let _ = self.handle.await;
        Ok(())
    }
}

pub struct TestVolume {
    pub server: TestServer,
    pub state: VolumeState,
    pub data_dir: TempDir,
}

impl TestVolume {
    pub async fn new(node_id: &str) -> Result<Self> {
        let data_dir = TempDir::new()?;
        init_dirs(data_dir.path()).await?;

        let mut state = VolumeState::new(data_dir.path().to_path_buf(), node_id);
        state.capacity_bytes = Some(NODE_CAPACITY);
        state.fault_admin = true;

        let server = TestServer::spawn(volume::routes::router(state.clone())).await?;
        Ok(Self {
            server,
            state,
            data_dir,
        })
    }

    pub fn url(&self) -> &str {
        &self.server.url
    }

    pub async fn shutdown(self) -> Result<()> {
        self.server.shutdown().await
    }
}

pub async fn wait_until<F, Fut>(timeout_ms: u64, mut check_fn: F) -> Result<()>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<bool>>,
{
    let start = Instant::now();
    let timeout_duration = Duration::from_millis(timeout_ms);

    loop {
        if check_fn().await? {
            return Ok(());
        }

        if start.elapsed() > timeout_duration {
            anyhow::bail!("wait_until timed out after {}ms", timeout_ms);
        }

        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

pub fn blake3_hex(bytes: &[u8]) -> String {
    blake3::hash(bytes).to_hex().to_string()
}

pub fn generate_random_bytes(size: usize) -> Vec<u8> {
    (0..size).map(|i| (i % 251) as u8).collect()
}

/// Distinct content per call so uploads do not deduplicate.
pub fn unique_bytes(tag: &str, size: usize) -> Vec<u8> {
    let mut out = tag.as_bytes().to_vec();
    out.extend(generate_random_bytes(size));
    out
}
