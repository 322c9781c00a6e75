use std::sync::Arc;
use tokio::sync::watch;
use tracing::warn;

use common::error::CoreError;

use crate::core::chunked::ChunkedUploads;
use crate::core::client::{NodeConnector, ObjectStore};
use crate::core::config::ClusterConfig;
use crate::core::lock::LockService;
use crate::core::meta::MetaStore;
use crate::core::placement::PlacementCoordinator;
use crate::core::postprocess::{NoThumbnailer, Thumbnailer};
use crate::core::queue::TaskQueue;
use crate::core::registry::NodeRegistry;
use crate::core::replication::ReplicationStats;
use crate::core::selector::NodeSelector;

/// Handles shared by the API layer and every background worker.
#[derive(Clone)]
pub struct CoordinatorState {
    pub cfg: Arc<ClusterConfig>,
    pub store: Arc<dyn MetaStore>,
    pub registry: NodeRegistry,
    pub selector: NodeSelector,
    pub connector: Arc<dyn NodeConnector>,
    pub locks: Arc<dyn LockService>,
    pub queue: Arc<dyn TaskQueue>,
    pub thumbnailer: Arc<dyn Thumbnailer>,
    pub replication_stats: Arc<ReplicationStats>,
}

impl CoordinatorState {
    pub fn new(
        cfg: ClusterConfig,
        store: Arc<dyn MetaStore>,
        registry: NodeRegistry,
        connector: Arc<dyn NodeConnector>,
        locks: Arc<dyn LockService>,
        queue: Arc<dyn TaskQueue>,
    ) -> Self {
        let selector = NodeSelector::new(registry.clone(), &cfg);
        Self {
            cfg: Arc::new(cfg),
            store,
            registry,
            selector,
            connector,
            locks,
            queue,
            thumbnailer: Arc::new(NoThumbnailer),
            replication_stats: Arc::new(ReplicationStats::default()),
        }
    }

    pub fn with_thumbnailer(mut self, thumbnailer: Arc<dyn Thumbnailer>) -> Self {
        self.thumbnailer = thumbnailer;
        self
    }

    pub fn placement(&self) -> PlacementCoordinator {
        PlacementCoordinator::new(self.clone())
    }

    pub fn chunked_uploads(&self) -> ChunkedUploads {
        ChunkedUploads::new(self.clone())
    }

    /// Object store handle for a registered node.
    pub fn node_store(&self, node_id: &str) -> Result<Arc<dyn ObjectStore>, CoreError> {
        let node = self.registry.get(node_id)?;
        Ok(self.connector.connect(&node))
    }

    /// Counts a failed RPC against the node without waiting for the next
    /// check to notice.
    pub fn note_node_failure(&self, node_id: &str) {
        let counted = self.registry.update(node_id, |node| {
            node.consecutive_failures = node.consecutive_failures.saturating_add(1);
        });
        if let Err(e) = counted {
            warn!(node_id, error = %e, "node failure not counted");
        }
    }
}

/// Resolves once the shutdown flag flips to true or its sender is gone.
pub async fn wait_for_shutdown(mut shutdown: watch::Receiver<bool>) {
    while !*shutdown.borrow() {
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}
