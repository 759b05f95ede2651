//! The durable record of one logical media asset and its lifecycle states.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::fmt;
use uuid::Uuid;

use crate::models::upload_session::UploadPurpose;

/// Authoritative status of a media asset.
///
/// ```text
/// INITIATED -> UPLOADED -> VALIDATED -> PROCESSING -> COMPLETED
///                       \-> REJECTED                \-> FAILED
/// UPLOADED | VALIDATED -> MALWARE_DETECTED | INVALID_FILE
/// any non-terminal -> EXPIRED
/// any -> DELETED
/// ```
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash, sqlx::Type)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[sqlx(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MediaStatus {
    Initiated,
    Uploaded,
    Validated,
    Processing,
    Completed,
    Rejected,
    MalwareDetected,
    InvalidFile,
    Failed,
    Expired,
    Deleted,
}

impl MediaStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MediaStatus::Initiated => "INITIATED",
            MediaStatus::Uploaded => "UPLOADED",
            MediaStatus::Validated => "VALIDATED",
            MediaStatus::Processing => "PROCESSING",
            MediaStatus::Completed => "COMPLETED",
            MediaStatus::Rejected => "REJECTED",
            MediaStatus::MalwareDetected => "MALWARE_DETECTED",
            MediaStatus::InvalidFile => "INVALID_FILE",
            MediaStatus::Failed => "FAILED",
            MediaStatus::Expired => "EXPIRED",
            MediaStatus::Deleted => "DELETED",
        }
    }

    /// No forward progress is possible from a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            MediaStatus::Completed
                | MediaStatus::Rejected
                | MediaStatus::MalwareDetected
                | MediaStatus::InvalidFile
                | MediaStatus::Failed
                | MediaStatus::Expired
                | MediaStatus::Deleted
        )
    }

    /// States the deduplication index may link new uploads onto.
    pub fn is_live(&self) -> bool {
        matches!(
            self,
            MediaStatus::Uploaded
                | MediaStatus::Validated
                | MediaStatus::Processing
                | MediaStatus::Completed
        )
    }

    /// Whether the state machine permits moving from `self` to `next`.
    pub fn can_transition_to(&self, next: MediaStatus) -> bool {
        use MediaStatus::*;

        if next == Deleted {
            return *self != Deleted;
        }
        if next == Expired {
            return !self.is_terminal();
        }
        matches!(
            (self, next),
            (Initiated, Uploaded)
                | (Uploaded, Validated)
                | (Uploaded, Rejected)
                | (Uploaded, MalwareDetected)
                | (Uploaded, InvalidFile)
                | (Validated, Processing)
                | (Validated, MalwareDetected)
                | (Validated, InvalidFile)
                | (Processing, Completed)
                | (Processing, Failed)
        )
    }

    /// Transitions that must publish a domain event in the same transaction.
    pub fn emits_event(&self) -> bool {
        matches!(
            self,
            MediaStatus::Validated | MediaStatus::Completed | MediaStatus::Failed
        )
    }
}

impl fmt::Display for MediaStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One logical media asset.
///
/// Created when an upload completes without a live duplicate; afterwards it only
/// changes through state machine transitions and is never physically removed.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug)]
pub struct MediaFile {
    pub id: Uuid,

    /// Upload that produced this asset (later duplicates link to it instead).
    pub upload_id: String,

    pub user_id: String,

    /// Hex SHA-256 of the full content.
    pub checksum: String,

    /// Hex SHA-256 of the leading sample of the content.
    pub sparse_checksum: Option<String>,

    pub status: MediaStatus,

    /// Which check failed, for terminal failure states.
    pub reject_reason: Option<String>,

    pub content_type: String,

    pub purpose: UploadPurpose,

    pub size_bytes: i64,

    /// Blob store backend name (e.g. "local").
    pub storage_provider: String,

    pub storage_bucket: String,

    pub storage_key: String,

    pub created_at: DateTime<Utc>,

    pub updated_at: DateTime<Utc>,
}

/// Column list shared by every `media_file` query.
pub const MEDIA_FILE_COLUMNS: &str = "id, upload_id, user_id, checksum, sparse_checksum, status, \
     reject_reason, content_type, purpose, size_bytes, storage_provider, storage_bucket, \
     storage_key, created_at, updated_at";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn happy_path_is_permitted() {
        use MediaStatus::*;
        let path = [Initiated, Uploaded, Validated, Processing, Completed];
        for pair in path.windows(2) {
            assert!(pair[0].can_transition_to(pair[1]), "{} -> {}", pair[0], pair[1]);
        }
    }

    #[test]
    fn terminal_states_only_move_to_deleted() {
        use MediaStatus::*;
        for terminal in [Rejected, MalwareDetected, InvalidFile, Failed, Expired, Completed] {
            assert!(terminal.is_terminal());
            assert!(terminal.can_transition_to(Deleted));
            for next in [Uploaded, Validated, Processing, Completed, Failed, Expired] {
                assert!(!terminal.can_transition_to(next), "{} -> {}", terminal, next);
            }
        }
        assert!(!Deleted.can_transition_to(Deleted));
    }

    #[test]
    fn expiry_applies_to_non_terminal_states_only() {
        use MediaStatus::*;
        for state in [Initiated, Uploaded, Validated, Processing] {
            assert!(state.can_transition_to(Expired));
        }
        assert!(!Completed.can_transition_to(Expired));
    }

    #[test]
    fn skipping_states_is_rejected() {
        use MediaStatus::*;
        assert!(!Uploaded.can_transition_to(Processing));
        assert!(!Uploaded.can_transition_to(Completed));
        assert!(!Validated.can_transition_to(Completed));
        assert!(!Processing.can_transition_to(Validated));
    }

    #[test]
    fn live_states_match_dedup_scope() {
        use MediaStatus::*;
        let live: Vec<_> = [
            Initiated, Uploaded, Validated, Processing, Completed, Rejected, MalwareDetected,
            InvalidFile, Failed, Expired, Deleted,
        ]
        .into_iter()
        .filter(MediaStatus::is_live)
        .collect();
        assert_eq!(live, vec![Uploaded, Validated, Processing, Completed]);
    }

    #[test]
    fn status_serializes_screaming_snake_case() {
        let json = serde_json::to_string(&MediaStatus::MalwareDetected).unwrap();
        assert_eq!(json, "\"MALWARE_DETECTED\"");
        assert_eq!(MediaStatus::InvalidFile.to_string(), "INVALID_FILE");
    }
}
