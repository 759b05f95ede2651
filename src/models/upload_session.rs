//! Multipart upload sessions: one row per logical upload attempt.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::collections::BTreeMap;
use uuid::Uuid;

use crate::models::chunk_status::ChunkState;

/// Lifecycle of the session row itself (not of the media asset).
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, sqlx::Type)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[sqlx(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionState {
    /// Accepting parts.
    Open,
    /// A `complete` call owns the session.
    Completing,
    /// Finalized; `media_id` links to the resulting (or deduplicated) asset.
    Completed,
    /// Finalization found corrupt content; waiting for the sweeper.
    Failed,
}

/// What an upload is for. Drives the object key prefix and the MIME allow-list.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, sqlx::Type)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[sqlx(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum UploadPurpose {
    MovieSource,
    MovieTrailer,
    MoviePoster,
    UserAvatar,
    AiAsset,
}

const VIDEO_TYPES: &[&str] = &[
    "video/mp4",
    "video/quicktime",
    "video/x-matroska",
    "video/webm",
    "video/x-msvideo",
];
const IMAGE_TYPES: &[&str] = &["image/jpeg", "image/png", "image/webp"];
const DOCUMENT_TYPES: &[&str] = &[
    "application/pdf",
    "text/plain",
    "text/markdown",
    "application/json",
];

impl UploadPurpose {
    pub fn allowed_mime_types(&self) -> &'static [&'static str] {
        match self {
            UploadPurpose::MovieSource | UploadPurpose::MovieTrailer => VIDEO_TYPES,
            UploadPurpose::MoviePoster | UploadPurpose::UserAvatar => IMAGE_TYPES,
            UploadPurpose::AiAsset => DOCUMENT_TYPES,
        }
    }

    /// Case-insensitive, ignores MIME parameters such as `; charset=utf-8`.
    pub fn allows(&self, content_type: &str) -> bool {
        let essence = content_type
            .split(';')
            .next()
            .unwrap_or_default()
            .trim()
            .to_ascii_lowercase();
        self.allowed_mime_types().contains(&essence.as_str())
    }

    pub fn key_prefix(&self) -> &'static str {
        match self {
            UploadPurpose::MovieSource => "movies/source",
            UploadPurpose::MovieTrailer => "movies/trailers",
            UploadPurpose::MoviePoster => "movies/posters",
            UploadPurpose::UserAvatar => "users/avatars",
            UploadPurpose::AiAsset => "ai/assets",
        }
    }
}

/// An in-progress (or finished) multipart upload.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug)]
pub struct UploadSession {
    /// Opaque id handed to the client.
    pub upload_id: String,

    pub user_id: String,

    /// Target object key in the blob store.
    pub object_key: String,

    /// Multipart id issued by the blob store gateway.
    pub gateway_upload_id: String,

    pub content_type: String,

    pub purpose: UploadPurpose,

    pub expected_size: i64,

    pub part_size: i64,

    pub part_count: i32,

    /// Full-content checksum the client claims, verified at completion.
    pub expected_checksum: Option<String>,

    /// Leading-sample checksum supplied by the client for early duplicate hints.
    pub sparse_checksum: Option<String>,

    pub state: SessionState,

    pub media_id: Option<Uuid>,

    pub failure_reason: Option<String>,

    /// Size of the stitched object once multipart-complete succeeded. A retried
    /// completion reuses the object instead of assembling again.
    pub assembled_size: Option<i64>,

    pub created_at: DateTime<Utc>,

    pub updated_at: DateTime<Utc>,

    pub expires_at: DateTime<Utc>,
}

impl UploadSession {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }

    /// Inclusive byte range `(start, end)` covered by `part_number`.
    pub fn part_range(&self, part_number: i32) -> (i64, i64) {
        let start = i64::from(part_number - 1) * self.part_size;
        let end = (start + self.part_size - 1).min(self.expected_size - 1);
        (start, end)
    }
}

pub const UPLOAD_SESSION_COLUMNS: &str = "upload_id, user_id, object_key, gateway_upload_id, \
     content_type, purpose, expected_size, part_size, part_count, expected_checksum, \
     sparse_checksum, state, media_id, failure_reason, assembled_size, created_at, updated_at, expires_at";

/// Snapshot of part completion for one session.
#[derive(Serialize, Debug, Clone)]
pub struct UploadProgress {
    pub upload_id: String,
    pub total_parts: i32,
    pub uploaded_parts: i64,
    pub failed_parts: i64,
    pub pending_parts: i64,
    pub percentage: f64,
    pub parts: BTreeMap<i32, ChunkState>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn purpose_allow_lists() {
        assert!(UploadPurpose::MovieSource.allows("video/mp4"));
        assert!(UploadPurpose::MovieSource.allows("Video/MP4; codecs=avc1"));
        assert!(!UploadPurpose::MovieSource.allows("image/png"));
        assert!(UploadPurpose::UserAvatar.allows("image/webp"));
        assert!(!UploadPurpose::AiAsset.allows("video/mp4"));
    }

    #[test]
    fn last_part_range_is_clamped() {
        let now = Utc::now();
        let session = UploadSession {
            upload_id: "u".into(),
            user_id: "user".into(),
            object_key: "k".into(),
            gateway_upload_id: "g".into(),
            content_type: "video/mp4".into(),
            purpose: UploadPurpose::MovieSource,
            expected_size: 25,
            part_size: 10,
            part_count: 3,
            expected_checksum: None,
            sparse_checksum: None,
            state: SessionState::Open,
            media_id: None,
            failure_reason: None,
            assembled_size: None,
            created_at: now,
            updated_at: now,
            expires_at: now,
        };
        assert_eq!(session.part_range(1), (0, 9));
        assert_eq!(session.part_range(3), (20, 24));
        assert!(session.is_expired_at(now));
    }
}
