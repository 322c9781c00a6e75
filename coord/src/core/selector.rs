use rand::Rng;
use serde::Serialize;
use tracing::{debug, warn};

use common::error::CoreError;

use crate::core::config::ClusterConfig;
use crate::core::node::StorageNode;
use crate::core::registry::NodeRegistry;

#[derive(Debug, Clone, Copy)]
pub struct ScoreWeights {
    pub free_space: f64,
    pub failures: f64,
    pub jitter: f64,
}

impl From<&ClusterConfig> for ScoreWeights {
    fn from(cfg: &ClusterConfig) -> Self {
        Self {
            free_space: cfg.weight_free_space,
            failures: cfg.weight_failures,
            jitter: cfg.selection_jitter,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Placement {
    pub primary: StorageNode,
    pub replicas: Vec<StorageNode>,
    /// Fewer eligible nodes than `1 + replicas requested`.
    pub under_replicated: bool,
}

impl Placement {
    pub fn replica_ids(&self) -> Vec<String> {
        self.replicas.iter().map(|n| n.id.clone()).collect()
    }
}

/// Online, not excluded, and still above the free-space floor after taking
/// `size` more bytes.
pub fn is_eligible(node: &StorageNode, size: u64, min_free_bytes: u64, exclude: &[String]) -> bool {
    node.online
        && !exclude.iter().any(|id| id == &node.id)
        && node.free_bytes() >= size.saturating_add(min_free_bytes)
}

pub fn score<R: Rng + ?Sized>(node: &StorageNode, weights: &ScoreWeights, rng: &mut R) -> f64 {
    weights.free_space * node.free_ratio()
        + weights.failures * (1.0 / (1.0 + node.consecutive_failures as f64))
        + weights.jitter * rng.random::<f64>()
}

/// Eligible nodes, best score first.
pub fn rank_nodes<'a, R: Rng + ?Sized>(
    nodes: &'a [StorageNode],
    size: u64,
    min_free_bytes: u64,
    exclude: &[String],
    weights: &ScoreWeights,
    rng: &mut R,
) -> Vec<&'a StorageNode> {
    let mut scored: Vec<(f64, &StorageNode)> = nodes
        .iter()
        .filter(|n| is_eligible(n, size, min_free_bytes, exclude))
        .map(|n| (score(n, weights, rng), n))
        .collect();
    scored.sort_by(|a, b| b.0.total_cmp(&a.0));

    scored.into_iter().map(|(_, n)| n).collect()
}

#[derive(Clone)]
pub struct NodeSelector {
    registry: NodeRegistry,
    weights: ScoreWeights,
    min_free_bytes: u64,
}

impl NodeSelector {
    pub fn new(registry: NodeRegistry, cfg: &ClusterConfig) -> Self {
        Self {
            registry,
            weights: ScoreWeights::from(cfg),
            min_free_bytes: cfg.min_free_bytes,
        }
    }

    pub fn select(
        &self,
        size: u64,
        replicas: usize,
        exclude: &[String],
    ) -> Result<Placement, CoreError> {
        self.select_with_rng(size, replicas, exclude, &mut rand::rng())
    }

    pub fn select_with_rng<R: Rng + ?Sized>(
        &self,
        size: u64,
        replicas: usize,
        exclude: &[String],
        rng: &mut R,
    ) -> Result<Placement, CoreError> {
        let online = self.registry.list_online();
        let ranked = rank_nodes(
            &online,
            size,
            self.min_free_bytes,
            exclude,
            &self.weights,
            rng,
        );

        let mut picked = ranked.into_iter().take(1 + replicas).cloned();
        let primary = picked.next().ok_or(CoreError::NoAvailableNodes)?;
        let replicas_chosen: Vec<StorageNode> = picked.collect();
        let under_replicated = replicas_chosen.len() < replicas;

        if under_replicated {
            warn!(
                requested = replicas,
                placed = replicas_chosen.len(),
                size,
                "not enough eligible nodes for full replication"
            );
        }
        debug!(
            primary = %primary.id,
            replicas = ?replicas_chosen.iter().map(|n| &n.id).collect::<Vec<_>>(),
            "placement chosen"
        );

        Ok(Placement {
            primary,
            replicas: replicas_chosen,
            under_replicated,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;
    use std::collections::HashSet;

    const GIB: u64 = 1024 * 1024 * 1024;

    fn cfg() -> ClusterConfig {
        ClusterConfig {
            min_free_bytes: 100,
            ..ClusterConfig::default()
        }
    }

    fn online_node(reg: &NodeRegistry, id: &str, cap: u64, used: u64) {
        reg.register(StorageNode::new(id, format!("http://{id}"), cap))
            .unwrap();
        reg.mark_online(id).unwrap();
        reg.update_usage(id, used as i64, 0).unwrap();
    }

    #[test]
    fn picks_distinct_online_nodes() {
        let reg = NodeRegistry::new();
        for id in ["a", "b", "c", "d"] {
            online_node(&reg, id, GIB, 0);
        }
        reg.mark_offline("d").unwrap();
        let selector = NodeSelector::new(reg, &cfg());

        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..50 {
            let p = selector.select_with_rng(10, 2, &[], &mut rng).unwrap();
            let mut ids: HashSet<String> = p.replica_ids().into_iter().collect();
            ids.insert(p.primary.id.clone());
            assert_eq!(ids.len(), 3);
            assert!(!ids.contains("d"));
            assert!(!p.under_replicated);
        }
    }

    #[test]
    fn capacity_floor_is_hard() {
        let reg = NodeRegistry::new();
        online_node(&reg, "full", 1_000, 850);
        online_node(&reg, "roomy", 1_000, 0);
        let selector = NodeSelector::new(reg, &cfg());

        // 850 + 60 + floor(100) > 1000
        let p = selector.select(60, 1, &[]).unwrap();
        assert_eq!(p.primary.id, "roomy");
        assert!(p.replicas.is_empty());
        assert!(p.under_replicated);

        assert!(matches!(
            selector.select(2_000, 1, &[]),
            Err(CoreError::NoAvailableNodes)
        ));
    }

    #[test]
    fn exclusions_are_respected() {
        let reg = NodeRegistry::new();
        online_node(&reg, "a", GIB, 0);
        online_node(&reg, "b", GIB, 0);
        let selector = NodeSelector::new(reg, &cfg());

        let p = selector.select(1, 2, &["a".to_string()]).unwrap();
        assert_eq!(p.primary.id, "b");
        assert!(p.under_replicated);

        assert!(matches!(
            selector.select(1, 2, &["a".to_string(), "b".to_string()]),
            Err(CoreError::NoAvailableNodes)
        ));
    }

    #[test]
    fn empty_cluster_has_no_placement() {
        let selector = NodeSelector::new(NodeRegistry::new(), &cfg());
        assert!(matches!(
            selector.select(1, 2, &[]),
            Err(CoreError::NoAvailableNodes)
        ));
    }

    #[test]
    fn scoring_prefers_free_and_healthy_nodes() {
        let weights = ScoreWeights {
            free_space: 0.7,
            failures: 0.3,
            jitter: 0.0,
        };
        let mut rng = StdRng::seed_from_u64(1);

        let mut empty = StorageNode::new("empty", "", 1_000);
        empty.set_health(crate::core::node::NodeHealth::Online);
        let mut busy = empty.clone();
        busy.id = "busy".into();
        busy.used_bytes = 900;
        let mut flaky = empty.clone();
        flaky.id = "flaky".into();
        flaky.consecutive_failures = 2;

        assert!(score(&empty, &weights, &mut rng) > score(&busy, &weights, &mut rng));
        assert!(score(&empty, &weights, &mut rng) > score(&flaky, &weights, &mut rng));

        let nodes = vec![busy, flaky, empty];
        let ranked = rank_nodes(&nodes, 1, 0, &[], &weights, &mut rng);
        assert_eq!(ranked[0].id, "empty");
    }
}
