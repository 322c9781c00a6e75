use dashmap::DashMap;
use std::sync::{Arc, Mutex};
use tracing::{info, warn};

use common::error::CoreError;

use crate::core::meta::MetaStore;
use crate::core::node::{NodeHealth, StorageNode};

/// Live view of the storage nodes. Each node lives in its own shard entry so
/// mutations on one node never wait on another. Mutations are written
/// through to the store after the entry is released.
#[derive(Clone)]
pub struct NodeRegistry {
    nodes: Arc<DashMap<String, StorageNode>>,
    store: Option<Arc<dyn MetaStore>>,
    /// Orders write-through so a stale copy never lands after a newer one.
    persist_order: Arc<Mutex<()>>,
}

impl Default for NodeRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl NodeRegistry {
    /// Memory-only registry.
    pub fn new() -> Self {
        Self {
            nodes: Arc::new(DashMap::new()),
            store: None,
            persist_order: Arc::new(Mutex::new(())),
        }
    }

    pub fn with_store(store: Arc<dyn MetaStore>) -> Self {
        Self {
            nodes: Arc::new(DashMap::new()),
            store: Some(store),
            persist_order: Arc::new(Mutex::new(())),
        }
    }

    /// Rebuilds the cache from persisted nodes. Health is not trusted across
    /// restarts: every node starts Unknown until its first check.
    pub fn load_from_store(store: Arc<dyn MetaStore>) -> Result<Self, CoreError> {
        let registry = Self::with_store(store.clone());
        for mut node in store.list_nodes()? {
            node.set_health(NodeHealth::Unknown);
            node.consecutive_failures = 0;
            registry.nodes.insert(node.id.clone(), node);
        }
        info!(nodes = registry.nodes.len(), "node registry loaded");
        Ok(registry)
    }

    /// Inserts or replaces a node's static description. Runtime counters of an
    /// already-known node are kept.
    pub fn register(&self, node: StorageNode) -> Result<StorageNode, CoreError> {
        let id = node.id.clone();
        let registered = self
            .nodes
            .entry(id.clone())
            .and_modify(|existing| {
                existing.endpoint = node.endpoint.clone();
                existing.capacity_bytes = node.capacity_bytes;
            })
            .or_insert(node)
            .value()
            .clone();
        self.persist(&id)?;
        Ok(registered)
    }

    pub fn get(&self, id: &str) -> Result<StorageNode, CoreError> {
        self.nodes
            .get(id)
            .map(|n| n.value().clone())
            .ok_or_else(|| CoreError::UnknownNode(id.to_string()))
    }

    pub fn contains(&self, id: &str) -> bool {
        self.nodes.contains_key(id)
    }

    /// Nodes eligible for new placements, ordered by id.
    pub fn list_online(&self) -> Vec<StorageNode> {
        let mut online: Vec<StorageNode> = self
            .nodes
            .iter()
            .filter(|n| n.online)
            .map(|n| n.value().clone())
            .collect();
        online.sort_by(|a, b| a.id.cmp(&b.id));
        online
    }

    /// Every known node, ordered by id.
    pub fn snapshot(&self) -> Vec<StorageNode> {
        let mut all: Vec<StorageNode> = self.nodes.iter().map(|n| n.value().clone()).collect();
        all.sort_by(|a, b| a.id.cmp(&b.id));
        all
    }

    pub fn is_online(&self, id: &str) -> bool {
        self.nodes.get(id).map(|n| n.online).unwrap_or(false)
    }

    pub fn mark_online(&self, id: &str) -> Result<(), CoreError> {
        self.update(id, |node| {
            node.set_health(NodeHealth::Online);
            node.consecutive_failures = 0;
        })
    }

    pub fn mark_offline(&self, id: &str) -> Result<(), CoreError> {
        self.update(id, |node| node.set_health(NodeHealth::Offline))
    }

    /// Adjusts usage counters; both saturate at zero.
    pub fn update_usage(
        &self,
        id: &str,
        delta_bytes: i64,
        delta_files: i64,
    ) -> Result<(), CoreError> {
        self.update(id, |node| {
            node.used_bytes = apply_delta(node.used_bytes, delta_bytes);
            node.file_count = apply_delta(node.file_count, delta_files);
        })
    }

    /// Atomic read-modify-write of one node. The store write happens once
    /// the entry is released.
    pub fn update<R>(
        &self,
        id: &str,
        mutate: impl FnOnce(&mut StorageNode) -> R,
    ) -> Result<R, CoreError> {
        let out = {
            let mut entry = self
                .nodes
                .get_mut(id)
                .ok_or_else(|| CoreError::UnknownNode(id.to_string()))?;
            mutate(entry.value_mut())
        };
        self.persist(id)?;
        Ok(out)
    }

    /// Writes the node's current state. The copy is taken under
    /// `persist_order`, so the last write always carries the newest state.
    fn persist(&self, id: &str) -> Result<(), CoreError> {
        let Some(store) = &self.store else {
            return Ok(());
        };
        let _order = self
            .persist_order
            .lock()
            .map_err(|e| anyhow::anyhow!("registry persist lock poisoned: {}", e))?;
        let Some(node) = self.nodes.get(id).map(|n| n.value().clone()) else {
            return Ok(());
        };
        store.save_node(&node).inspect_err(|e| {
            warn!(node_id = %node.id, error = %e, "failed to persist node");
        })
    }
}

fn apply_delta(value: u64, delta: i64) -> u64 {
    if delta >= 0 {
        value.saturating_add(delta as u64)
    } else {
        value.saturating_sub(delta.unsigned_abs())
    }
}
