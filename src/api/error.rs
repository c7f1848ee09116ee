use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

use crate::errors::ClusterError;

/// JSON error body: `{ "error": "<kind>", "message": "<text>" }`.
#[derive(Debug)]
pub struct ErrorResponse {
    pub status: StatusCode,
    pub error: ClusterError,
}

impl ErrorResponse {
    pub fn new(error: ClusterError) -> Self {
        Self {
            status: status_for(&error),
            error,
        }
    }
}

impl From<ClusterError> for ErrorResponse {
    fn from(error: ClusterError) -> Self {
        Self::new(error)
    }
}

impl IntoResponse for ErrorResponse {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(json!({
                "error": self.error.kind(),
                "message": self.error.to_string(),
            })),
        )
            .into_response()
    }
}

fn status_for(error: &ClusterError) -> StatusCode {
    match error {
        ClusterError::VmNotFound { .. } => StatusCode::NOT_FOUND,
        ClusterError::MigrationInProgress { .. } | ClusterError::Aborted { .. } => StatusCode::CONFLICT,
        ClusterError::InvalidTarget { .. } | ClusterError::InvalidArgument(_) => {
            StatusCode::UNPROCESSABLE_ENTITY
        }
        ClusterError::TimedOut { .. } => StatusCode::GATEWAY_TIMEOUT,
        ClusterError::SourceUnavailable { .. }
        | ClusterError::ParseFailure { .. }
        | ClusterError::CommandFailed { .. } => StatusCode::BAD_GATEWAY,
    }
}

pub type ApiResult<T> = Result<T, ErrorResponse>;
