use std::path::PathBuf;
use std::sync::Arc;

use crate::fault_injection::FaultInjector;
use crate::store::BlobUsage;

#[derive(Clone, Debug)]
pub enum DurabilityLevel {
    Immediate, // fsync at end of each PUT (default, safest)
    OS,        // no explicit fsync; rely on OS (fastest)
}

#[derive(Clone)]
pub struct VolumeState {
    pub data_root: Arc<PathBuf>,
    pub node_id: String,
    /// Advertised capacity; the filesystem size when unset.
    pub capacity_bytes: Option<u64>,
    pub max_object_bytes: u64,
    pub durability_level: DurabilityLevel,
    pub usage: Arc<BlobUsage>,
    pub fault_injector: Arc<FaultInjector>,
    /// Exposes the `/admin/fail/*` endpoints.
    pub fault_admin: bool,
}

impl VolumeState {
    pub fn new(data_root: PathBuf, node_id: impl Into<String>) -> Self {
        let usage = BlobUsage::scan(&data_root);
        Self {
            data_root: Arc::new(data_root),
            node_id: node_id.into(),
            capacity_bytes: None,
            max_object_bytes: 1024 * 1024 * 1024,
            durability_level: DurabilityLevel::Immediate,
            usage: Arc::new(usage),
            fault_injector: Arc::new(FaultInjector::new()),
            fault_admin: false,
        }
    }
}
