//! Wire-facing error type. Every handler returns `Result<_, ApiError>`, and
//! `IntoResponse` maps each variant to an HTTP status following a fixed
//! propagation policy: `400` for validation, `401`/`404` for auth/ownership,
//! `5xx` for transport.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

use ocrbase_common::error::{BlobError, ErrorCode, QueueError, StoreError};

#[derive(Error, Debug)]
pub enum ApiError {
    #[error("validation error: {0}")]
    Validation(String),
    #[error("unauthorized")]
    Unauthorized,
    #[error("job {0} not found")]
    NotFound(String),
    #[error("job {0} has already been confirmed")]
    AlreadyConfirmed(String),
    #[error("upload failed: {0}")]
    UploadFailed(String),
    #[error("enqueue failed: {0}")]
    EnqueueFailed(String),
    #[error("internal error: {0}")]
    Internal(String),
}

impl From<StoreError> for ApiError {
    fn from(error: StoreError) -> Self {
        match error {
            StoreError::NotFound(id) => ApiError::NotFound(id),
            StoreError::AlreadyConfirmed(id) => ApiError::AlreadyConfirmed(id),
            other => ApiError::Internal(other.to_string()),
        }
    }
}

impl From<BlobError> for ApiError {
    fn from(error: BlobError) -> Self {
        ApiError::UploadFailed(error.to_string())
    }
}

impl From<QueueError> for ApiError {
    fn from(error: QueueError) -> Self {
        ApiError::EnqueueFailed(error.to_string())
    }
}

impl ApiError {
    fn status_and_code(&self) -> (StatusCode, ErrorCode) {
        match self {
            ApiError::Validation(_) => (StatusCode::BAD_REQUEST, ErrorCode::Validation),
            ApiError::Unauthorized => (StatusCode::UNAUTHORIZED, ErrorCode::Unauthorized),
            ApiError::NotFound(_) => (StatusCode::NOT_FOUND, ErrorCode::JobNotFound),
            ApiError::AlreadyConfirmed(_) => {
                (StatusCode::CONFLICT, ErrorCode::AlreadyConfirmed)
            }
            ApiError::UploadFailed(_) => {
                (StatusCode::INTERNAL_SERVER_ERROR, ErrorCode::UploadFailed)
            }
            ApiError::EnqueueFailed(_) => {
                (StatusCode::INTERNAL_SERVER_ERROR, ErrorCode::EnqueueFailed)
            }
            ApiError::Internal(_) => (StatusCode::INTERNAL_SERVER_ERROR, ErrorCode::Unknown),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code) = self.status_and_code();
        tracing::warn!(error = %self, status = %status, "request failed");

        let body = Json(json!({
            "error": self.to_string(),
            "errorCode": code,
        }));

        (status, body).into_response()
    }
}

pub type Result<T> = std::result::Result<T, ApiError>;
