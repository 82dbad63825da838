use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;
use tracing::{error, warn};

/// Errors surfaced across the HTTP boundary. Consensus-internal failures never
/// reach here: the consensus module converts transport and log-mismatch errors
/// into benign outcomes (see `raft::consensus`) and only this ambient layer
/// turns request-handling problems into responses.
#[derive(Debug, Error)]
pub enum AppError {
    #[error("not the leader")]
    NotLeader { leader_id: Option<u64> },

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("upstream API error: {0}")]
    Upstream(String),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    leader_id: Option<u64>,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, message, leader_id) = match &self {
            AppError::NotLeader { leader_id } => (
                StatusCode::MISDIRECTED_REQUEST,
                "this node is not the leader".to_string(),
                *leader_id,
            ),
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg.clone(), None),
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, msg.clone(), None),
            AppError::Upstream(msg) => (StatusCode::BAD_GATEWAY, msg.clone(), None),
            AppError::Internal(err) => {
                error!("internal error: {err:#}");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal server error".to_string(),
                    None,
                )
            }
        };

        if status.is_client_error() {
            warn!("request failed: {message}");
        }

        (status, Json(ErrorBody { error: message, leader_id })).into_response()
    }
}

pub type AppResult<T> = Result<T, AppError>;
