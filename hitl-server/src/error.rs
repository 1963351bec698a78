//! HTTP error mapping.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use hitl::broker::SubmitError;
use serde_json::json;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    Malformed(String),
    #[error("Request {0} not found or already responded")]
    NotFound(String),
    #[error(transparent)]
    Submit(#[from] SubmitError),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::Malformed(_) => StatusCode::BAD_REQUEST,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Submit(SubmitError::DuplicateId(_)) => StatusCode::CONFLICT,
            ApiError::Submit(SubmitError::Unbounded(_)) => StatusCode::UNPROCESSABLE_ENTITY,
            ApiError::Submit(SubmitError::TimeoutOutOfRange(_)) => StatusCode::BAD_REQUEST,
            ApiError::Submit(SubmitError::Closed) => StatusCode::SERVICE_UNAVAILABLE,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        debug!(status = status.as_u16(), error = %self, "request rejected");
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}
