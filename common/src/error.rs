use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
};
use std::io;

#[derive(thiserror::Error, Debug)]
pub enum CoreError {
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("no available storage nodes")]
    NoAvailableNodes,
    #[error("primary write failed: {0}")]
    PrimaryWriteFailed(String),
    #[error("node {node_id} unreachable: {reason}")]
    NodeUnreachable { node_id: String, reason: String },
    #[error("replication of {file_id} to {target} failed permanently")]
    ReplicationPermanentFailure { file_id: String, target: String },
    #[error("lock busy: {0}")]
    LockBusy(String),
    #[error("lock expired: {0}")]
    LockExpired(String),
    #[error("no downloads left")]
    CounterExhausted,
    #[error("not found")]
    NotFound,
    #[error("file expired")]
    Expired,
    #[error("all copies unreachable")]
    AllCopiesUnreachable,
    #[error("unknown node: {0}")]
    UnknownNode(String),
    #[error("object not found on node")]
    ObjectNotFound,
    #[error("payload too large")]
    TooLarge,
    #[error("checksum mismatch")]
    ChecksumMismatch,
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("upstream status {0}")]
    UpstreamStatus(reqwest::StatusCode),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Any(#[from] anyhow::Error),
}

impl CoreError {
    pub fn unreachable(node_id: &str, reason: impl ToString) -> Self {
        CoreError::NodeUnreachable {
            node_id: node_id.to_string(),
            reason: reason.to_string(),
        }
    }

    /// Transient failures that a caller may retry against the same node.
    pub fn is_transient(&self) -> bool {
        match self {
            CoreError::NodeUnreachable { .. } | CoreError::LockBusy(_) => true,
            CoreError::UpstreamStatus(st) => {
                st.is_server_error() || *st == reqwest::StatusCode::TOO_MANY_REQUESTS
            }
            _ => false,
        }
    }
}

impl From<serde_json::Error> for CoreError {
    fn from(e: serde_json::Error) -> Self {
        CoreError::Any(e.into())
    }
}

impl IntoResponse for CoreError {
    fn into_response(self) -> Response {
        let status_code = match self {
            CoreError::InvalidInput(_) => StatusCode::BAD_REQUEST,
            CoreError::NoAvailableNodes => StatusCode::SERVICE_UNAVAILABLE,
            CoreError::PrimaryWriteFailed(_) => StatusCode::SERVICE_UNAVAILABLE,
            CoreError::NodeUnreachable { .. } => StatusCode::BAD_GATEWAY,
            CoreError::ReplicationPermanentFailure { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            CoreError::LockBusy(_) => StatusCode::TOO_MANY_REQUESTS,
            CoreError::LockExpired(_) => StatusCode::CONFLICT,
            CoreError::CounterExhausted => StatusCode::FORBIDDEN,
            CoreError::NotFound => StatusCode::NOT_FOUND,
            CoreError::Expired => StatusCode::GONE,
            CoreError::AllCopiesUnreachable => StatusCode::SERVICE_UNAVAILABLE,
            CoreError::UnknownNode(_) => StatusCode::NOT_FOUND,
            CoreError::ObjectNotFound => StatusCode::NOT_FOUND,
            CoreError::TooLarge => StatusCode::PAYLOAD_TOO_LARGE,
            CoreError::ChecksumMismatch => StatusCode::UNPROCESSABLE_ENTITY,
            CoreError::Conflict(_) => StatusCode::CONFLICT,
            CoreError::UpstreamStatus(_) => StatusCode::BAD_GATEWAY,
            CoreError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
            CoreError::Any(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };

        (status_code, self.to_string()).into_response()
    }
}
