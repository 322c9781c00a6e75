use axum::{
    Json, Router,
    body::Bytes,
    extract::{DefaultBodyLimit, Path, State},
    http::{HeaderMap, HeaderValue, StatusCode, header},
    middleware,
    response::IntoResponse,
    routing::{get, post},
};
use tokio::fs;
use tracing::{debug, info};

use common::error::CoreError;
use common::file_utils::{blob_path, content_checksum, validate_object_key};
use common::schemas::{HealthResponse, PutResponse};
use common::trace_middleware::trace_context_middleware;

use crate::fault_injection::{fail_op, inject_latency, injected, kill_server, reset_faults};
use crate::state::VolumeState;
use crate::store::{disk_usage, remove_blob, write_blob};

pub fn router(state: VolumeState) -> Router {
    let body_limit = usize::try_from(state.max_object_bytes).unwrap_or(usize::MAX);

    Router::new()
        .route(
            "/objects/{key}",
            get(get_object)
                .put(put_object)
                .head(head_object)
                .delete(delete_object),
        )
        .route("/health", get(health))
        // Fault injection endpoints, 404 unless enabled
        .route("/admin/fail/{op}", post(fail_op))
        .route("/admin/inject/latency", post(inject_latency))
        .route("/admin/kill", post(kill_server))
        .route("/admin/reset", post(reset_faults))
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(middleware::from_fn(trace_context_middleware))
        .with_state(state)
}

// PUT /objects/{key}
#[tracing::instrument(name = "volume.put", skip(ctx, body), fields(size = body.len()))]
pub async fn put_object(
    Path(key): Path<String>,
    State(ctx): State<VolumeState>,
    body: Bytes,
) -> Result<(StatusCode, Json<PutResponse>), CoreError> {
    ctx.fault_injector.enter(&ctx.node_id).await?;
    validate_object_key(&key)?;
    if ctx.fault_injector.put.should_fail() {
        return Err(injected("put"));
    }

    let written = write_blob(&ctx.data_root, &key, body, &ctx.durability_level).await?;
    if let Some(old) = written.replaced {
        ctx.usage.removed(old);
    }
    ctx.usage.added(written.size);
    debug!(%key, size = written.size, "blob stored");

    let etag = if ctx.fault_injector.etag_mismatch.should_fail() {
        content_checksum(b"fault injection")
    } else {
        written.etag
    };

    Ok((
        StatusCode::CREATED,
        Json(PutResponse {
            key,
            size: written.size,
            etag,
        }),
    ))
}

// GET /objects/{key}
pub async fn get_object(
    Path(key): Path<String>,
    State(ctx): State<VolumeState>,
) -> Result<impl IntoResponse, CoreError> {
    ctx.fault_injector.enter(&ctx.node_id).await?;
    validate_object_key(&key)?;
    if ctx.fault_injector.get.should_fail() {
        return Err(injected("get"));
    }

    let content = match fs::read(blob_path(&ctx.data_root, &key)).await {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Err(CoreError::ObjectNotFound),
        Err(e) => return Err(e.into()),
    };

    let mut headers = HeaderMap::new();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/octet-stream"),
    );
    Ok((StatusCode::OK, headers, content))
}

// HEAD /objects/{key}
pub async fn head_object(
    Path(key): Path<String>,
    State(ctx): State<VolumeState>,
) -> Result<impl IntoResponse, CoreError> {
    ctx.fault_injector.enter(&ctx.node_id).await?;
    validate_object_key(&key)?;

    let meta = match fs::metadata(blob_path(&ctx.data_root, &key)).await {
        Ok(meta) if meta.is_file() => meta,
        Ok(_) => return Err(CoreError::ObjectNotFound),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Err(CoreError::ObjectNotFound),
        Err(e) => return Err(e.into()),
    };

    let mut headers = HeaderMap::new();
    headers.insert(header::CONTENT_LENGTH, HeaderValue::from(meta.len()));
    Ok((StatusCode::OK, headers))
}

// DELETE /objects/{key}
#[tracing::instrument(name = "volume.delete", skip(ctx))]
pub async fn delete_object(
    Path(key): Path<String>,
    State(ctx): State<VolumeState>,
) -> Result<StatusCode, CoreError> {
    ctx.fault_injector.enter(&ctx.node_id).await?;
    validate_object_key(&key)?;
    if ctx.fault_injector.delete.should_fail() {
        return Err(injected("delete"));
    }

    match remove_blob(&ctx.data_root, &key).await? {
        Some(size) => {
            ctx.usage.removed(size);
            info!(%key, size, "blob deleted");
            Ok(StatusCode::NO_CONTENT)
        }
        None => Err(CoreError::ObjectNotFound),
    }
}

// GET /health
pub async fn health(State(ctx): State<VolumeState>) -> Result<Json<HealthResponse>, CoreError> {
    ctx.fault_injector.enter(&ctx.node_id).await?;
    if ctx.fault_injector.health.should_fail() {
        return Err(injected("health"));
    }

    let (used_bytes, file_count) = ctx.usage.snapshot();
    let capacity_bytes = match ctx.capacity_bytes {
        Some(cap) => Some(cap),
        None => disk_usage(&ctx.data_root).ok().and_then(|(_, cap)| cap),
    };

    Ok(Json(HealthResponse {
        node_id: ctx.node_id.clone(),
        status: "ok".to_string(),
        used_bytes: Some(used_bytes),
        capacity_bytes,
        file_count: Some(file_count),
    }))
}
