use axum::{
    Router,
    body::Bytes,
    extract::{DefaultBodyLimit, Json, Path, State},
    http::{HeaderMap, HeaderName, HeaderValue, StatusCode, header},
    middleware,
    response::{IntoResponse, Response},
    routing::{get, post, put},
};
use std::time::Duration;

use common::constants::{
    HEADER_CHECKSUM, HEADER_DOWNLOAD_LIMIT, HEADER_FILE_NAME, HEADER_SERVED_BY,
    HEADER_TTL_SECONDS,
};
use common::error::CoreError;
use common::schemas::{CompleteUploadRequest, InitUploadRequest, RegisterNodeRequest};
use common::trace_middleware::trace_context_middleware;
use common::url_utils::sanitize_url;

use crate::core::chunked::UploadSession;
use crate::core::node::StorageNode;
use crate::core::placement::{ClusterHealth, ReplicationStatus, UploadMetadata, UploadOutcome};
use crate::core::record::FileRecord;
use crate::core::state::CoordinatorState;

pub fn router(state: CoordinatorState) -> Router {
    let body_limit = usize::try_from(state.cfg.max_upload_bytes)
        .unwrap_or(usize::MAX)
        .saturating_add(1);

    Router::new()
        .route("/files", post(upload_file))
        .route("/files/{id}", get(download_file).delete(delete_file))
        .route("/files/{id}/info", get(file_info))
        .route("/files/{id}/replication", get(replication_status))
        .route("/uploads", post(init_upload))
        .route("/uploads/{id}", get(upload_status).delete(abort_upload))
        .route("/uploads/{id}/parts/{number}", put(upload_part))
        .route("/uploads/{id}/complete", post(complete_upload))
        .route("/admin/nodes", get(list_nodes).post(register_node))
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(middleware::from_fn(trace_context_middleware))
        .with_state(state)
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

fn header_num<T: std::str::FromStr>(
    headers: &HeaderMap,
    name: &str,
) -> Result<Option<T>, CoreError> {
    match header_str(headers, name) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| CoreError::InvalidInput(format!("bad {name} header"))),
    }
}

fn header_value(value: &str) -> Result<HeaderValue, CoreError> {
    HeaderValue::from_str(value).map_err(|e| CoreError::Any(e.into()))
}

// POST /files
#[tracing::instrument(name = "coord.upload", skip(ctx, headers, body), fields(size = body.len()))]
pub async fn upload_file(
    State(ctx): State<CoordinatorState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<(StatusCode, Json<UploadOutcome>), CoreError> {
    let meta = UploadMetadata {
        original_name: header_str(&headers, HEADER_FILE_NAME).map(str::to_string),
        mime_type: header_str(&headers, header::CONTENT_TYPE.as_str()).map(str::to_string),
        download_limit: header_num::<u32>(&headers, HEADER_DOWNLOAD_LIMIT)?,
        ttl: header_num::<u64>(&headers, HEADER_TTL_SECONDS)?.map(Duration::from_secs),
    };

    let outcome = ctx.placement().place_upload(body, meta).await?;
    Ok((placed_status(&outcome), Json(outcome)))
}

fn placed_status(outcome: &UploadOutcome) -> StatusCode {
    if outcome.duplicate {
        StatusCode::OK
    } else {
        StatusCode::CREATED
    }
}

// POST /uploads
pub async fn init_upload(
    State(ctx): State<CoordinatorState>,
    Json(req): Json<InitUploadRequest>,
) -> Result<(StatusCode, Json<UploadSession>), CoreError> {
    let session = ctx.chunked_uploads().init(req)?;
    Ok((StatusCode::CREATED, Json(session)))
}

// GET /uploads/{id}
pub async fn upload_status(
    Path(id): Path<String>,
    State(ctx): State<CoordinatorState>,
) -> Result<Json<UploadSession>, CoreError> {
    Ok(Json(ctx.chunked_uploads().status(&id)?))
}

// PUT /uploads/{id}/parts/{number}
#[tracing::instrument(name = "coord.part", skip(ctx, headers, body), fields(size = body.len()))]
pub async fn upload_part(
    Path((id, number)): Path<(String, u32)>,
    State(ctx): State<CoordinatorState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<UploadSession>, CoreError> {
    let checksum = header_str(&headers, HEADER_CHECKSUM);
    let session = ctx
        .chunked_uploads()
        .upload_part(&id, number, body, checksum)?;
    Ok(Json(session))
}

// POST /uploads/{id}/complete
#[tracing::instrument(name = "coord.complete_upload", skip(ctx, req))]
pub async fn complete_upload(
    Path(id): Path<String>,
    State(ctx): State<CoordinatorState>,
    Json(req): Json<CompleteUploadRequest>,
) -> Result<(StatusCode, Json<UploadOutcome>), CoreError> {
    let outcome = ctx.chunked_uploads().complete(&id, req).await?;
    Ok((placed_status(&outcome), Json(outcome)))
}

// DELETE /uploads/{id}
pub async fn abort_upload(
    Path(id): Path<String>,
    State(ctx): State<CoordinatorState>,
) -> Result<StatusCode, CoreError> {
    ctx.chunked_uploads().abort(&id)?;
    Ok(StatusCode::NO_CONTENT)
}

// GET /files/{id}
#[tracing::instrument(name = "coord.download", skip(ctx))]
pub async fn download_file(
    Path(id): Path<String>,
    State(ctx): State<CoordinatorState>,
) -> Result<Response, CoreError> {
    let download = ctx.placement().resolve_download(&id).await?;
    let record = &download.record;

    let disposition = format!(
        "attachment; filename=\"{}\"",
        record.original_name.replace(['"', '\\'], "_")
    );

    let mut headers = HeaderMap::new();
    headers.insert(header::CONTENT_TYPE, header_value(&record.mime_type)?);
    headers.insert(header::CONTENT_DISPOSITION, header_value(&disposition)?);
    headers.insert(
        HeaderName::from_static(HEADER_SERVED_BY),
        header_value(&download.served_by)?,
    );
    headers.insert(
        HeaderName::from_static(HEADER_CHECKSUM),
        header_value(&record.checksum)?,
    );

    Ok((StatusCode::OK, headers, download.content).into_response())
}

// GET /files/{id}/info
pub async fn file_info(
    Path(id): Path<String>,
    State(ctx): State<CoordinatorState>,
) -> Result<Json<FileRecord>, CoreError> {
    Ok(Json(ctx.placement().get_file(&id)?))
}

// GET /files/{id}/replication
pub async fn replication_status(
    Path(id): Path<String>,
    State(ctx): State<CoordinatorState>,
) -> Result<Json<ReplicationStatus>, CoreError> {
    Ok(Json(ctx.placement().get_replication_status(&id)?))
}

// DELETE /files/{id}
#[tracing::instrument(name = "coord.delete", skip(ctx))]
pub async fn delete_file(
    Path(id): Path<String>,
    State(ctx): State<CoordinatorState>,
) -> Result<impl IntoResponse, CoreError> {
    let outcome = ctx.placement().delete_file(&id).await?;
    // an incomplete deletion finishes in the background
    if !outcome.complete {
        ctx.queue
            .enqueue(crate::core::queue::TaskPayload::Delete { file_id: id })
            .await?;
        return Ok((StatusCode::ACCEPTED, Json(outcome)));
    }
    Ok((StatusCode::OK, Json(outcome)))
}

// GET /admin/nodes
pub async fn list_nodes(State(ctx): State<CoordinatorState>) -> Json<ClusterHealth> {
    Json(ctx.placement().get_cluster_health())
}

// POST /admin/nodes
pub async fn register_node(
    State(ctx): State<CoordinatorState>,
    Json(req): Json<RegisterNodeRequest>,
) -> Result<(StatusCode, Json<StorageNode>), CoreError> {
    if req.id.trim().is_empty() {
        return Err(CoreError::InvalidInput("node id is empty".into()));
    }
    let endpoint =
        sanitize_url(&req.endpoint).map_err(|e| CoreError::InvalidInput(e.to_string()))?;

    let node = ctx
        .registry
        .register(StorageNode::new(req.id, endpoint, req.capacity_bytes))?;
    tracing::info!(node_id = %node.id, endpoint = %node.endpoint, "node registered");

    Ok((StatusCode::CREATED, Json(node)))
}
