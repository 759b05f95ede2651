//! Outbox rows and the domain events they carry.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

use crate::models::media_file::{MediaFile, MediaStatus};

pub const SUBJECT_MEDIA_READY: &str = "media.ready";
pub const SUBJECT_MEDIA_STATUS: &str = "media.status";

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, sqlx::Type)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[sqlx(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OutboxStatus {
    Pending,
    Sent,
    /// Retry budget exhausted (dead letter).
    Failed,
}

#[derive(Serialize, Deserialize, Clone, FromRow, Debug)]
pub struct OutboxEvent {
    pub id: i64,

    /// Media id the event concerns; consumers correlate on it.
    pub aggregate_id: String,

    pub subject: String,

    pub event_type: String,

    /// JSON-serialized [`MediaEvent`].
    pub payload: String,

    pub status: OutboxStatus,

    pub retry_count: i32,

    pub last_error: Option<String>,

    /// Publisher instance currently holding the delivery lease.
    pub claimed_by: Option<String>,

    pub claimed_until: Option<DateTime<Utc>>,

    pub next_attempt_at: DateTime<Utc>,

    pub last_attempt_at: Option<DateTime<Utc>>,

    pub sent_at: Option<DateTime<Utc>>,

    pub created_at: DateTime<Utc>,
}

pub const OUTBOX_EVENT_COLUMNS: &str = "id, aggregate_id, subject, event_type, payload, status, \
     retry_count, last_error, claimed_by, claimed_until, next_attempt_at, last_attempt_at, \
     sent_at, created_at";

/// Events handed to downstream consumers through the outbox.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MediaEvent {
    /// The asset passed validation and can be transcoded.
    ReadyForProcessing {
        media_id: Uuid,
        upload_id: String,
        bucket: String,
        key: String,
        content_type: String,
        size_bytes: i64,
        checksum: String,
    },
    /// A terminal processing outcome reported by a worker.
    StatusChanged {
        media_id: Uuid,
        upload_id: String,
        status: MediaStatus,
        reason: Option<String>,
    },
}

impl MediaEvent {
    /// The event a media file emits on entering its current status, if any.
    pub fn for_media(media: &MediaFile) -> Option<Self> {
        match media.status {
            MediaStatus::Validated => Some(MediaEvent::ReadyForProcessing {
                media_id: media.id,
                upload_id: media.upload_id.clone(),
                bucket: media.storage_bucket.clone(),
                key: media.storage_key.clone(),
                content_type: media.content_type.clone(),
                size_bytes: media.size_bytes,
                checksum: media.checksum.clone(),
            }),
            MediaStatus::Completed | MediaStatus::Failed => Some(MediaEvent::StatusChanged {
                media_id: media.id,
                upload_id: media.upload_id.clone(),
                status: media.status,
                reason: media.reject_reason.clone(),
            }),
            _ => None,
        }
    }

    pub fn media_id(&self) -> Uuid {
        match self {
            MediaEvent::ReadyForProcessing { media_id, .. }
            | MediaEvent::StatusChanged { media_id, .. } => *media_id,
        }
    }

    pub fn subject(&self) -> &'static str {
        match self {
            MediaEvent::ReadyForProcessing { .. } => SUBJECT_MEDIA_READY,
            MediaEvent::StatusChanged { .. } => SUBJECT_MEDIA_STATUS,
        }
    }

    pub fn event_type(&self) -> &'static str {
        match self {
            MediaEvent::ReadyForProcessing { .. } => "ReadyForProcessing",
            MediaEvent::StatusChanged { .. } => "StatusChanged",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payload_is_tagged_json() {
        let event = MediaEvent::StatusChanged {
            media_id: Uuid::nil(),
            upload_id: "up-1".into(),
            status: MediaStatus::Failed,
            reason: Some("probe failed".into()),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "status_changed");
        assert_eq!(json["status"], "FAILED");
        assert_eq!(event.subject(), SUBJECT_MEDIA_STATUS);

        let back: MediaEvent = serde_json::from_value(json).unwrap();
        assert_eq!(back, event);
    }
}
