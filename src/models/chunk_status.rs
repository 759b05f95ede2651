//! Per-part upload bookkeeping.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, sqlx::Type)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[sqlx(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChunkState {
    Pending,
    Uploaded,
    Failed,
}

/// One row per `(upload_id, part_number)`.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug, PartialEq)]
pub struct ChunkStatus {
    pub upload_id: String,

    /// 1-based, dense up to the session's part count.
    pub part_number: i32,

    pub status: ChunkState,

    /// ETag returned by the blob store for this part.
    pub etag: Option<String>,

    pub retry_count: i32,

    pub error_message: Option<String>,

    pub updated_at: DateTime<Utc>,
}

pub const CHUNK_STATUS_COLUMNS: &str =
    "upload_id, part_number, status, etag, retry_count, error_message, updated_at";
