use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::{Value, json};
use std::fmt;

use crate::services::{blob_gateway::BlobError, error::IngestError};

/// A lightweight wrapper for general errors that keeps the message local.
#[derive(Debug)]
pub struct AppError {
    pub status: StatusCode,
    pub message: String,
    /// Machine-readable extras, e.g. the missing part numbers of an incomplete upload.
    pub details: Option<Value>,
}

impl AppError {
    /// Create a new AppError with a specific status and message.
    pub fn new(status: StatusCode, msg: impl Into<String>) -> Self {
        Self {
            status,
            message: msg.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }

    /// Shortcut for a 500 Internal Server Error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, msg)
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for AppError {}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let mut body = json!({
            "error": self.message,
            "status": self.status.as_u16()
        });
        if let Some(details) = self.details {
            body["details"] = details;
        }

        (self.status, Json(body)).into_response()
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::internal(err.to_string())
    }
}

impl From<BlobError> for AppError {
    fn from(err: BlobError) -> Self {
        let status = match &err {
            BlobError::NotFound(_) | BlobError::UploadNotFound(_) => StatusCode::NOT_FOUND,
            BlobError::InvalidKey | BlobError::InvalidPart { .. } => StatusCode::BAD_REQUEST,
            BlobError::InvalidSignature => StatusCode::FORBIDDEN,
            BlobError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            BlobError::Io(io) => {
                tracing::error!(error = %io, "blob store I/O failure");
                return AppError::internal("storage failure");
            }
        };
        AppError::new(status, err.to_string())
    }
}

impl From<IngestError> for AppError {
    fn from(err: IngestError) -> Self {
        let err = match err {
            IngestError::Blob(blob) => return blob.into(),
            other => other,
        };
        let status = match &err {
            IngestError::InvalidRequest(_) | IngestError::ChecksumMismatch { .. } => {
                StatusCode::BAD_REQUEST
            }
            IngestError::UploadNotFound(_) | IngestError::MediaNotFound(_) => StatusCode::NOT_FOUND,
            IngestError::IncompleteUpload { missing, .. } => {
                return AppError::new(StatusCode::CONFLICT, err.to_string())
                    .with_details(json!({ "missing_parts": missing }));
            }
            IngestError::SessionExpired { .. } => StatusCode::GONE,
            IngestError::SessionNotOpen { .. }
            | IngestError::StaleState { .. }
            | IngestError::InvalidTransition { .. }
            | IngestError::PartRetryLimit { .. } => StatusCode::CONFLICT,
            IngestError::DeleteNotAllowed(_) => StatusCode::FORBIDDEN,
            IngestError::Blob(_) => StatusCode::INTERNAL_SERVER_ERROR,
            IngestError::Sqlx(_) | IngestError::Json(_) | IngestError::Io(_) => {
                tracing::error!(error = %err, "internal pipeline failure");
                return AppError::internal("internal error");
            }
        };
        AppError::new(status, err.to_string())
    }
}
