//! Error taxonomy for the ingestion pipeline.

use chrono::{DateTime, Utc};
use std::io;
use thiserror::Error;
use uuid::Uuid;

use crate::models::{media_file::MediaStatus, upload_session::SessionState};
use crate::services::blob_gateway::BlobError;

/// Cap the listed part numbers so a huge upload cannot bloat logs or responses.
fn format_missing_parts(parts: &[i32]) -> String {
    const MAX_DISPLAYED: usize = 10;
    if parts.len() <= MAX_DISPLAYED {
        format!("{:?}", parts)
    } else {
        format!(
            "{:?} (and {} more)",
            &parts[..MAX_DISPLAYED],
            parts.len() - MAX_DISPLAYED
        )
    }
}

#[derive(Debug, Error)]
pub enum IngestError {
    /// Malformed caller input. Never retried.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("upload `{0}` not found")]
    UploadNotFound(String),

    #[error("media `{0}` not found")]
    MediaNotFound(Uuid),

    #[error("upload `{upload_id}` is missing {} parts: {}", .missing.len(), format_missing_parts(.missing))]
    IncompleteUpload { upload_id: String, missing: Vec<i32> },

    #[error("upload `{upload_id}` expired at {expired_at}")]
    SessionExpired {
        upload_id: String,
        expired_at: DateTime<Utc>,
    },

    #[error("upload `{upload_id}` is {state:?}, expected an open session")]
    SessionNotOpen {
        upload_id: String,
        state: SessionState,
    },

    #[error("content of upload `{upload_id}` does not match: expected {expected}, got {actual}")]
    ChecksumMismatch {
        upload_id: String,
        expected: String,
        actual: String,
    },

    /// The persisted status moved underneath the caller. Re-read and decide; never retry blindly.
    #[error("media `{media_id}` is {actual}, expected {expected}")]
    StaleState {
        media_id: Uuid,
        expected: MediaStatus,
        actual: MediaStatus,
    },

    #[error("transition {from} -> {to} is not allowed")]
    InvalidTransition { from: MediaStatus, to: MediaStatus },

    #[error("deleting media `{0}` was not authorized")]
    DeleteNotAllowed(Uuid),

    #[error("part {part_number} of upload `{upload_id}` exhausted its {limit} retries")]
    PartRetryLimit {
        upload_id: String,
        part_number: i32,
        limit: i32,
    },

    #[error(transparent)]
    Blob(#[from] BlobError),

    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type IngestResult<T> = Result<T, IngestError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn incomplete_upload_lists_missing_parts() {
        let err = IngestError::IncompleteUpload {
            upload_id: "up".into(),
            missing: vec![2],
        };
        assert_eq!(err.to_string(), "upload `up` is missing 1 parts: [2]");
    }

    #[test]
    fn incomplete_upload_caps_long_lists() {
        let err = IngestError::IncompleteUpload {
            upload_id: "up".into(),
            missing: (1..=25).collect(),
        };
        let msg = err.to_string();
        assert!(msg.contains("missing 25 parts"));
        assert!(msg.contains("(and 15 more)"));
    }

    #[test]
    fn stale_state_names_both_states() {
        let err = IngestError::StaleState {
            media_id: Uuid::nil(),
            expected: MediaStatus::Validated,
            actual: MediaStatus::Deleted,
        };
        let msg = err.to_string();
        assert!(msg.contains("is DELETED, expected VALIDATED"));
    }
}
