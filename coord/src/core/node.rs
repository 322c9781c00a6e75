use serde::{Deserialize, Serialize};

/// Health monitor view of a node.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum NodeHealth {
    Unknown,
    Online,
    Suspect,
    Offline,
}

impl NodeHealth {
    /// Suspect nodes keep serving; only Offline (or never checked) nodes are
    /// removed from selection.
    pub fn is_online(self) -> bool {
        matches!(self, NodeHealth::Online | NodeHealth::Suspect)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct StorageNode {
    pub id: String,
    pub endpoint: String,
    pub capacity_bytes: u64,
    pub used_bytes: u64,
    pub file_count: u64,
    pub online: bool,
    pub health: NodeHealth,
    pub consecutive_failures: u32,
    pub last_heartbeat_ms: Option<i64>,
}

impl StorageNode {
    pub fn new(id: impl Into<String>, endpoint: impl Into<String>, capacity_bytes: u64) -> Self {
        Self {
            id: id.into(),
            endpoint: endpoint.into(),
            capacity_bytes,
            used_bytes: 0,
            file_count: 0,
            online: false,
            health: NodeHealth::Unknown,
            consecutive_failures: 0,
            last_heartbeat_ms: None,
        }
    }

    pub fn free_bytes(&self) -> u64 {
        self.capacity_bytes.saturating_sub(self.used_bytes)
    }

    /// `(capacity - used) / capacity`, clamped to `[0, 1]`.
    pub fn free_ratio(&self) -> f64 {
        if self.capacity_bytes == 0 {
            return 0.0;
        }
        (self.free_bytes() as f64 / self.capacity_bytes as f64).clamp(0.0, 1.0)
    }

    pub fn set_health(&mut self, health: NodeHealth) {
        self.health = health;
        self.online = health.is_online();
    }
}
