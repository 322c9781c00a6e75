use futures_util::future::join_all;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use common::error::CoreError;
use common::schemas::HealthResponse;
use common::time_utils::utc_now_ms;

use crate::core::client::{NodeConnector, call_with_deadline};
use crate::core::config::ClusterConfig;
use crate::core::node::{NodeHealth, StorageNode};
use crate::core::registry::NodeRegistry;

/// Next state after one check. `failures` already includes this check when
/// it failed.
pub fn next_health(current: NodeHealth, ok: bool, failures: u32, threshold: u32) -> NodeHealth {
    if ok {
        return NodeHealth::Online;
    }
    if failures >= threshold {
        return NodeHealth::Offline;
    }
    match current {
        NodeHealth::Online | NodeHealth::Suspect => NodeHealth::Suspect,
        // never-seen nodes do not start serving on a failure
        NodeHealth::Unknown => NodeHealth::Unknown,
        NodeHealth::Offline => NodeHealth::Offline,
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CheckResult {
    pub node_id: String,
    pub ok: bool,
    pub previous: NodeHealth,
    pub health: NodeHealth,
    pub error: Option<String>,
}

#[derive(Clone)]
pub struct HealthMonitor {
    registry: NodeRegistry,
    connector: Arc<dyn NodeConnector>,
    check_interval: Duration,
    check_timeout: Duration,
    offline_threshold: u32,
}

impl HealthMonitor {
    pub fn new(
        registry: NodeRegistry,
        connector: Arc<dyn NodeConnector>,
        cfg: &ClusterConfig,
    ) -> Self {
        Self {
            registry,
            connector,
            check_interval: cfg.check_interval,
            check_timeout: cfg.check_timeout,
            offline_threshold: cfg.offline_threshold.max(1),
        }
    }

    /// Checks every node on a fixed interval until `shutdown` flips.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
        let mut tick = tokio::time::interval(self.check_interval);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = tick.tick() => {},
                _ = shutdown.changed() => { if *shutdown.borrow() { break; } }
            }
            self.check_all().await;
        }

        info!("health monitor stopped");

        Ok(())
    }

    /// One check cycle over all known nodes, in parallel.
    #[tracing::instrument(skip(self))]
    pub async fn check_all(&self) -> Vec<CheckResult> {
        let nodes = self.registry.snapshot();
        join_all(nodes.iter().map(|node| self.check_node(node))).await
    }

    async fn check_node(&self, node: &StorageNode) -> CheckResult {
        let store = self.connector.connect(node);
        let outcome = call_with_deadline(&node.id, self.check_timeout, store.health()).await;
        self.apply_check(&node.id, outcome)
    }

    /// Folds one check outcome into the registry. Never fails: a node that
    /// vanished from the registry mid-cycle is just reported.
    pub fn apply_check(
        &self,
        node_id: &str,
        outcome: Result<HealthResponse, CoreError>,
    ) -> CheckResult {
        let threshold = self.offline_threshold;
        let ok = outcome.is_ok();
        let error = outcome.as_ref().err().map(|e| e.to_string());

        let update = self.registry.update(node_id, |node| {
            let previous = node.health;
            match &outcome {
                Ok(report) => {
                    node.consecutive_failures = 0;
                    node.last_heartbeat_ms = Some(utc_now_ms());
                    refresh_usage(node, report);
                }
                Err(_) => {
                    node.consecutive_failures = node.consecutive_failures.saturating_add(1);
                }
            }
            let next = next_health(previous, ok, node.consecutive_failures, threshold);
            node.set_health(next);
            (previous, next)
        });

        let (previous, health) = match update {
            Ok(pair) => pair,
            Err(e) => {
                warn!(node_id, error = %e, "check result not applied");
                (NodeHealth::Unknown, NodeHealth::Unknown)
            }
        };

        if previous != health {
            match health {
                NodeHealth::Offline => warn!(node_id, ?previous, "node marked offline"),
                NodeHealth::Suspect => warn!(node_id, error = ?error, "node suspect"),
                _ => info!(node_id, ?previous, ?health, "node health changed"),
            }
        } else {
            debug!(node_id, ?health, ok, "check");
        }

        CheckResult {
            node_id: node_id.to_string(),
            ok,
            previous,
            health,
            error,
        }
    }
}

fn refresh_usage(node: &mut StorageNode, report: &HealthResponse) {
    if let Some(cap) = report.capacity_bytes
        && cap > 0
    {
        node.capacity_bytes = cap;
    }
    if let Some(used) = report.used_bytes {
        node.used_bytes = used;
    }
    if let Some(count) = report.file_count {
        node.file_count = count;
    }
}
