//! Per-node object byte interface and its two implementations: the HTTP
//! client used against real volumes and an in-memory store with fault
//! switches used by tests and local runs.

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tokio::time::{sleep, timeout};

use common::error::CoreError;
use common::file_utils::content_checksum;
use common::schemas::{HealthResponse, PutResponse};
use common::trace_middleware::inject_trace_context;

use crate::core::node::StorageNode;

#[async_trait]
pub trait ObjectStore: Send + Sync {
    fn node_id(&self) -> &str;

    async fn put(&self, key: &str, content: Bytes) -> Result<(), CoreError>;

    /// `ObjectNotFound` when the node answers but does not hold `key`.
    async fn get(&self, key: &str) -> Result<Bytes, CoreError>;

    async fn exists(&self, key: &str) -> Result<bool, CoreError>;

    /// Deleting a missing key succeeds.
    async fn delete(&self, key: &str) -> Result<(), CoreError>;

    async fn health(&self) -> Result<HealthResponse, CoreError>;
}

/// Resolves a registry entry to a handle on its object store.
pub trait NodeConnector: Send + Sync {
    fn connect(&self, node: &StorageNode) -> Arc<dyn ObjectStore>;
}

/// Bounds a node call; an elapsed deadline reads as the node being unreachable.
pub async fn call_with_deadline<T>(
    node_id: &str,
    deadline: Duration,
    fut: impl Future<Output = Result<T, CoreError>>,
) -> Result<T, CoreError> {
    match timeout(deadline, fut).await {
        Ok(res) => res,
        Err(_) => Err(CoreError::unreachable(node_id, "deadline elapsed")),
    }
}

// ---------------------------------------------------------------------------
// HTTP

#[derive(Clone)]
pub struct HttpConnector {
    http: reqwest::Client,
    rpc_timeout: Duration,
}

impl HttpConnector {
    pub fn new(http: reqwest::Client, rpc_timeout: Duration) -> Self {
        Self { http, rpc_timeout }
    }
}

impl NodeConnector for HttpConnector {
    fn connect(&self, node: &StorageNode) -> Arc<dyn ObjectStore> {
        Arc::new(HttpObjectStore {
            node_id: node.id.clone(),
            endpoint: node.endpoint.trim_end_matches('/').to_string(),
            http: self.http.clone(),
            rpc_timeout: self.rpc_timeout,
        })
    }
}

pub struct HttpObjectStore {
    node_id: String,
    endpoint: String,
    http: reqwest::Client,
    rpc_timeout: Duration,
}

impl HttpObjectStore {
    fn object_url(&self, key: &str) -> String {
        format!("{}/objects/{}", self.endpoint, key)
    }

    fn transport(&self, err: reqwest::Error) -> CoreError {
        CoreError::unreachable(&self.node_id, err)
    }

    async fn send(&self, req: reqwest::RequestBuilder) -> Result<reqwest::Response, CoreError> {
        inject_trace_context(req.timeout(self.rpc_timeout))
            .send()
            .await
            .map_err(|e| self.transport(e))
    }
}

fn status_error(st: reqwest::StatusCode) -> CoreError {
    match st {
        reqwest::StatusCode::NOT_FOUND => CoreError::ObjectNotFound,
        reqwest::StatusCode::PAYLOAD_TOO_LARGE => CoreError::TooLarge,
        _ => CoreError::UpstreamStatus(st),
    }
}

#[async_trait]
impl ObjectStore for HttpObjectStore {
    fn node_id(&self) -> &str {
        &self.node_id
    }

    async fn put(&self, key: &str, content: Bytes) -> Result<(), CoreError> {
        let expected = content_checksum(&content);
        let resp = self.send(self.http.put(self.object_url(key)).body(content)).await?;
        if !resp.status().is_success() {
            return Err(status_error(resp.status()));
        }

        let put_resp: PutResponse = resp.json().await.map_err(|e| self.transport(e))?;
        if put_resp.etag != expected {
            return Err(CoreError::ChecksumMismatch);
        }
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Bytes, CoreError> {
        let resp = self.send(self.http.get(self.object_url(key))).await?;
        if !resp.status().is_success() {
            return Err(status_error(resp.status()));
        }
        resp.bytes().await.map_err(|e| self.transport(e))
    }

    async fn exists(&self, key: &str) -> Result<bool, CoreError> {
        let resp = self.send(self.http.head(self.object_url(key))).await?;
        match resp.status() {
            st if st.is_success() => Ok(true),
            reqwest::StatusCode::NOT_FOUND => Ok(false),
            st => Err(status_error(st)),
        }
    }

    async fn delete(&self, key: &str) -> Result<(), CoreError> {
        let resp = self.send(self.http.delete(self.object_url(key))).await?;
        match resp.status() {
            st if st.is_success() => Ok(()),
            reqwest::StatusCode::NOT_FOUND => Ok(()),
            st => Err(status_error(st)),
        }
    }

    async fn health(&self) -> Result<HealthResponse, CoreError> {
        let url = format!("{}/health", self.endpoint);
        let resp = self.send(self.http.get(url)).await?;
        if !resp.status().is_success() {
            return Err(CoreError::UpstreamStatus(resp.status()));
        }
        resp.json().await.map_err(|e| self.transport(e))
    }
}

// ---------------------------------------------------------------------------
// In-memory

/// One-shot and sticky failure switch.
#[derive(Debug, Default)]
pub struct FaultSwitch {
    once: AtomicBool,
    always: AtomicBool,
}

impl FaultSwitch {
    pub fn fail_once(&self) {
        self.once.store(true, Ordering::Relaxed);
    }

    pub fn fail_always(&self, on: bool) {
        self.always.store(on, Ordering::Relaxed);
    }

    pub fn trip(&self) -> bool {
        self.always.load(Ordering::Relaxed) || self.once.swap(false, Ordering::Relaxed)
    }

    fn reset(&self) {
        self.once.store(false, Ordering::Relaxed);
        self.always.store(false, Ordering::Relaxed);
    }
}

#[derive(Debug, Default)]
pub struct MemoryFaults {
    pub put: FaultSwitch,
    pub get: FaultSwitch,
    pub health: FaultSwitch,
    pub latency_ms: AtomicU64,
    /// A killed node fails every call.
    pub killed: AtomicBool,
}

impl MemoryFaults {
    pub fn kill(&self) {
        self.killed.store(true, Ordering::Relaxed);
    }

    pub fn revive(&self) {
        self.killed.store(false, Ordering::Relaxed);
    }

    pub fn reset(&self) {
        self.put.reset();
        self.get.reset();
        self.health.reset();
        self.latency_ms.store(0, Ordering::Relaxed);
        self.killed.store(false, Ordering::Relaxed);
    }
}

pub struct MemoryObjectStore {
    node_id: String,
    capacity_bytes: u64,
    objects: DashMap<String, Bytes>,
    pub faults: MemoryFaults,
    puts: AtomicU64,
}

impl MemoryObjectStore {
    pub fn new(node_id: impl Into<String>, capacity_bytes: u64) -> Self {
        Self {
            node_id: node_id.into(),
            capacity_bytes,
            objects: DashMap::new(),
            faults: MemoryFaults::default(),
            puts: AtomicU64::new(0),
        }
    }

    pub fn contains(&self, key: &str) -> bool {
        self.objects.contains_key(key)
    }

    pub fn object_count(&self) -> usize {
        self.objects.len()
    }

    /// Successful puts since creation.
    pub fn put_count(&self) -> u64 {
        self.puts.load(Ordering::Relaxed)
    }

    pub fn used_bytes(&self) -> u64 {
        self.objects.iter().map(|o| o.value().len() as u64).sum()
    }

    async fn enter(&self, switch: Option<&FaultSwitch>) -> Result<(), CoreError> {
        let latency = self.faults.latency_ms.load(Ordering::Relaxed);
        if latency > 0 {
            sleep(Duration::from_millis(latency)).await;
        }
        if self.faults.killed.load(Ordering::Relaxed) {
            return Err(CoreError::unreachable(&self.node_id, "connection refused"));
        }
        if switch.is_some_and(FaultSwitch::trip) {
            return Err(CoreError::unreachable(&self.node_id, "injected fault"));
        }
        Ok(())
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    fn node_id(&self) -> &str {
        &self.node_id
    }

    async fn put(&self, key: &str, content: Bytes) -> Result<(), CoreError> {
        self.enter(Some(&self.faults.put)).await?;
        self.objects.insert(key.to_string(), content);
        self.puts.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Bytes, CoreError> {
        self.enter(Some(&self.faults.get)).await?;
        self.objects
            .get(key)
            .map(|o| o.value().clone())
            .ok_or(CoreError::ObjectNotFound)
    }

    async fn exists(&self, key: &str) -> Result<bool, CoreError> {
        self.enter(None).await?;
        Ok(self.objects.contains_key(key))
    }

    async fn delete(&self, key: &str) -> Result<(), CoreError> {
        self.enter(None).await?;
        self.objects.remove(key);
        Ok(())
    }

    async fn health(&self) -> Result<HealthResponse, CoreError> {
        self.enter(Some(&self.faults.health)).await?;
        Ok(HealthResponse {
            node_id: self.node_id.clone(),
            status: "ok".to_string(),
            used_bytes: Some(self.used_bytes()),
            capacity_bytes: Some(self.capacity_bytes),
            file_count: Some(self.objects.len() as u64),
        })
    }
}

/// Connector over a fixed set of in-memory stores keyed by node id.
#[derive(Clone, Default)]
pub struct MemoryConnector {
    stores: Arc<DashMap<String, Arc<MemoryObjectStore>>>,
}

impl MemoryConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, store: MemoryObjectStore) -> Arc<MemoryObjectStore> {
        let store = Arc::new(store);
        self.stores.insert(store.node_id.clone(), store.clone());
        store
    }

    pub fn store(&self, node_id: &str) -> Option<Arc<MemoryObjectStore>> {
        self.stores.get(node_id).map(|s| s.value().clone())
    }
}

impl NodeConnector for MemoryConnector {
    fn connect(&self, node: &StorageNode) -> Arc<dyn ObjectStore> {
        match self.store(&node.id) {
            Some(store) => store as Arc<dyn ObjectStore>,
            // unknown nodes behave like a dead host
            None => {
                let ghost = MemoryObjectStore::new(node.id.clone(), 0);
                ghost.faults.kill();
                Arc::new(ghost)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn memory_store_faults() {
        let store = MemoryObjectStore::new("n1", 1_000);
        store.put("k", Bytes::from_static(b"abc")).await.unwrap();
        assert_eq!(store.get("k").await.unwrap(), Bytes::from_static(b"abc"));

        store.faults.get.fail_once();
        assert!(matches!(
            store.get("k").await,
            Err(CoreError::NodeUnreachable { .. })
        ));
        assert!(store.get("k").await.is_ok());

        store.faults.kill();
        assert!(store.health().await.is_err());
        store.faults.reset();

        let health = store.health().await.unwrap();
        assert_eq!(health.used_bytes, Some(3));
        assert_eq!(health.file_count, Some(1));

        store.delete("k").await.unwrap();
        store.delete("k").await.unwrap();
        assert!(matches!(store.get("k").await, Err(CoreError::ObjectNotFound)));
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_maps_to_unreachable() {
        let store = MemoryObjectStore::new("slow", 10);
        store.faults.latency_ms.store(5_000, Ordering::Relaxed);

        let res = call_with_deadline("slow", Duration::from_secs(1), store.health()).await;
        assert!(matches!(res, Err(CoreError::NodeUnreachable { .. })));
    }

    #[tokio::test]
    async fn unknown_nodes_are_unreachable() {
        let connector = MemoryConnector::new();
        let handle = connector.connect(&StorageNode::new("ghost", "mem://ghost", 1));
        assert!(handle.health().await.is_err());
    }
}
