use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
};
use serde::Deserialize;
use std::time::Duration;
use tokio::time::sleep;

use crate::state::VolumeState;
use common::error::CoreError;

/// One-shot and sticky failure flags for a single operation.
#[derive(Debug, Default)]
pub struct FaultFlag {
    pub once: AtomicBool,
    pub always: AtomicBool,
}

impl FaultFlag {
    pub fn should_fail(&self) -> bool {
        if self.always.load(Ordering::Relaxed) {
            return true;
        }
        self.once.swap(false, Ordering::Relaxed)
    }

    fn reset(&self) {
        self.once.store(false, Ordering::Relaxed);
        self.always.store(false, Ordering::Relaxed);
    }
}

/// Fault injection state for testing
#[derive(Debug, Default)]
pub struct FaultInjector {
    pub put: FaultFlag,
    pub get: FaultFlag,
    pub delete: FaultFlag,
    pub health: FaultFlag,
    /// PUT answers with a wrong etag.
    pub etag_mismatch: FaultFlag,

    pub inject_latency_ms: AtomicU64,
    pub is_killed: AtomicBool,
}

impl FaultInjector {
    pub fn new() -> Self {
        Self::default()
    }

    fn flag(&self, op: &str) -> Option<&FaultFlag> {
        match op {
            "put" => Some(&self.put),
            "get" => Some(&self.get),
            "delete" => Some(&self.delete),
            "health" => Some(&self.health),
            "etag_mismatch" => Some(&self.etag_mismatch),
            _ => None,
        }
    }

    pub fn is_killed(&self) -> bool {
        self.is_killed.load(Ordering::Relaxed)
    }

    /// Apply latency if configured
    pub async fn apply_latency(&self) {
        let latency_ms = self.inject_latency_ms.load(Ordering::Relaxed);
        if latency_ms > 0 {
            sleep(Duration::from_millis(latency_ms)).await;
        }
    }

    /// Common gate in front of every data-path handler.
    pub async fn enter(&self, node_id: &str) -> Result<(), CoreError> {
        if self.is_killed() {
            return Err(CoreError::unreachable(node_id, "server is killed"));
        }
        self.apply_latency().await;
        Ok(())
    }

    pub fn reset(&self) {
        self.put.reset();
        self.get.reset();
        self.delete.reset();
        self.health.reset();
        self.etag_mismatch.reset();
        self.inject_latency_ms.store(0, Ordering::Relaxed);
        self.is_killed.store(false, Ordering::Relaxed);
    }
}

pub fn injected(op: &str) -> CoreError {
    CoreError::Any(anyhow::anyhow!("fault injection: {op} failed"))
}

#[derive(Deserialize)]
pub struct FaultQuery {
    #[serde(default)]
    pub once: bool,
    #[serde(default)]
    pub always: bool,
    #[serde(default)]
    pub latency_ms: Option<u64>,
}

fn require_admin(ctx: &VolumeState) -> Result<(), CoreError> {
    if !ctx.fault_admin {
        return Err(CoreError::NotFound);
    }
    Ok(())
}

/// POST /admin/fail/{op}?once=true -> next `op` returns 500.
pub async fn fail_op(
    Path(op): Path<String>,
    Query(params): Query<FaultQuery>,
    State(ctx): State<VolumeState>,
) -> Result<StatusCode, CoreError> {
    require_admin(&ctx)?;
    let flag = ctx
        .fault_injector
        .flag(&op)
        .ok_or_else(|| CoreError::InvalidInput(format!("unknown fault target: {op}")))?;
    if params.once {
        flag.once.store(true, Ordering::Relaxed);
    }
    if params.always {
        flag.always.store(true, Ordering::Relaxed);
    }
    Ok(StatusCode::OK)
}

/// POST /admin/inject/latency?latency_ms=1000 -> inject latency into all operations
pub async fn inject_latency(
    Query(params): Query<FaultQuery>,
    State(ctx): State<VolumeState>,
) -> Result<StatusCode, CoreError> {
    require_admin(&ctx)?;
    if let Some(latency_ms) = params.latency_ms {
        ctx.fault_injector
            .inject_latency_ms
            .store(latency_ms, Ordering::Relaxed);
    }
    Ok(StatusCode::OK)
}

/// POST /admin/kill -> every request fails until reset (simulated crash)
pub async fn kill_server(State(ctx): State<VolumeState>) -> Result<StatusCode, CoreError> {
    require_admin(&ctx)?;
    ctx.fault_injector.is_killed.store(true, Ordering::Relaxed);
    Ok(StatusCode::OK)
}

/// POST /admin/reset -> reset all fault injection flags
pub async fn reset_faults(State(ctx): State<VolumeState>) -> Result<StatusCode, CoreError> {
    require_admin(&ctx)?;
    ctx.fault_injector.reset();
    Ok(StatusCode::OK)
}
