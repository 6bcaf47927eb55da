//! Error types for scanforge.
//!
//! Each area has its own enum; the HTTP layer folds them into `ApiError`,
//! which maps onto response statuses. Everything that goes wrong inside the
//! background runner is converted to a terminal `Failed` job record instead
//! of propagating.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;
use uuid::Uuid;

/// Configuration resolution failures (bad env var values).
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value for {key}: {reason}")]
    Invalid { key: String, reason: String },
}

/// Job store failures.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("job store backend error: {reason}")]
    Backend { reason: String },

    #[error("failed to serialize job record: {reason}")]
    Serialize { reason: String },
}

/// Rejections of an uploaded bundle before any tool run starts.
///
/// These are always surfaced synchronously to the submitter; if a job record
/// was already created, it is marked Failed with the same message.
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("uploaded file is empty")]
    EmptyUpload,

    #[error("uploaded file is not a valid zip archive: {reason}")]
    InvalidArchive { reason: String },

    #[error(
        "no {marker} found anywhere in the uploaded archive; top-level entries: [{listing}]"
    )]
    MarkerNotFound { marker: String, listing: String },

    #[error("invalid parameter {name}: {reason}")]
    InvalidParameter { name: String, reason: String },
}

/// Failures while launching or running the external tool process.
///
/// Captured into the job record's error field; the full output stays in
/// `run.log`.
#[derive(Debug, Error)]
pub enum ExecutionError {
    #[error("failed to launch {program}: {reason}")]
    Launch { program: String, reason: String },

    #[error("tool run exceeded the {secs}s timeout and was killed")]
    TimedOut { secs: u64 },

    #[error("tool exited with code {code}: {stderr_tail}")]
    NonZeroExit { code: i32, stderr_tail: String },

    #[error("tool completed but no output was generated")]
    EmptyOutput,

    #[error("I/O error during tool run: {reason}")]
    Io { reason: String },
}

/// Failures while packaging the output tree into the result archive.
///
/// Treated like execution failures: a job is never reported Complete unless
/// packaging verifiably succeeded.
#[derive(Debug, Error)]
pub enum PackagingError {
    #[error("failed to package results: {reason}")]
    Archive { reason: String },

    #[error("packaged archive is empty")]
    EmptyArchive,
}

/// Client-facing error for the HTTP surface.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("{0}")]
    NotFound(String),

    #[error("job {0} has not completed yet")]
    NotReady(Uuid),

    #[error("internal error: {0}")]
    Internal(String),
}

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        ApiError::Internal(e.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            ApiError::Validation(_) | ApiError::NotReady(_) => StatusCode::BAD_REQUEST,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            tracing::error!("request failed: {self}");
        }
        let body = Json(serde_json::json!({ "error": self.to_string() }));
        (status, body).into_response()
    }
}
