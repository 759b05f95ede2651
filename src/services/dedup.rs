//! Deduplication Index over `media_file` checksums.
//!
//! Only live rows (UPLOADED, VALIDATED, PROCESSING, COMPLETED) take part, so a
//! new upload is never linked onto a rejected or failed asset. The partial
//! unique index `ux_media_file_live_checksum` makes insert-or-link a single
//! conditional write.

use chrono::Utc;
use serde::Serialize;
use sqlx::{SqliteConnection, SqlitePool};
use tracing::debug;
use uuid::Uuid;

use crate::models::{
    media_file::{MEDIA_FILE_COLUMNS, MediaFile, MediaStatus},
    upload_session::UploadPurpose,
};
use crate::services::error::{IngestError, IngestResult};

/// SQL form of [`MediaStatus::is_live`]; must match the partial index predicate.
pub(crate) const LIVE_STATUSES_SQL: &str = "('UPLOADED', 'VALIDATED', 'PROCESSING', 'COMPLETED')";

const INSERT_ATTEMPTS: usize = 3;

/// Everything needed to create the media row for a finished upload.
#[derive(Debug, Clone)]
pub struct NewMediaFile {
    pub upload_id: String,
    pub user_id: String,
    pub checksum: String,
    pub sparse_checksum: Option<String>,
    pub content_type: String,
    pub purpose: UploadPurpose,
    pub size_bytes: i64,
    pub storage_provider: String,
    pub storage_bucket: String,
    pub storage_key: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "outcome", content = "media", rename_all = "snake_case")]
pub enum DedupOutcome {
    /// No live asset held the checksum; a new UPLOADED row was created.
    Inserted(MediaFile),
    /// An existing live asset holds the checksum.
    Linked(MediaFile),
}

impl DedupOutcome {
    pub fn media(&self) -> &MediaFile {
        match self {
            DedupOutcome::Inserted(m) | DedupOutcome::Linked(m) => m,
        }
    }

    pub fn into_media(self) -> MediaFile {
        match self {
            DedupOutcome::Inserted(m) | DedupOutcome::Linked(m) => m,
        }
    }

    pub fn is_duplicate(&self) -> bool {
        matches!(self, DedupOutcome::Linked(_))
    }
}

#[derive(Clone)]
pub struct DedupIndex {
    db: SqlitePool,
}

impl DedupIndex {
    pub fn new(db: SqlitePool) -> Self {
        Self { db }
    }

    pub async fn lookup_by_checksum(&self, checksum: &str) -> IngestResult<Option<MediaFile>> {
        let mut conn = self.db.acquire().await?;
        Ok(Self::live_by(&mut conn, "checksum", checksum).await?)
    }

    /// Early, advisory duplicate hint. Several live assets may share a sample;
    /// COMPLETED ones are preferred, then the oldest.
    pub async fn lookup_by_sparse_checksum(
        &self,
        sparse_checksum: &str,
    ) -> IngestResult<Option<MediaFile>> {
        let mut conn = self.db.acquire().await?;
        Ok(Self::live_by(&mut conn, "sparse_checksum", sparse_checksum).await?)
    }

    async fn live_by(
        conn: &mut SqliteConnection,
        column: &'static str,
        value: &str,
    ) -> Result<Option<MediaFile>, sqlx::Error> {
        sqlx::query_as::<_, MediaFile>(&format!(
            "SELECT {} FROM media_file WHERE {} = ? AND status IN {} \
             ORDER BY CASE status WHEN 'COMPLETED' THEN 0 ELSE 1 END, created_at ASC \
             LIMIT 1",
            MEDIA_FILE_COLUMNS, column, LIVE_STATUSES_SQL
        ))
        .bind(value)
        .fetch_optional(conn)
        .await
    }

    /// Insert an UPLOADED media row unless a live row already holds the checksum,
    /// in which case that row is returned. Run inside the caller's transaction.
    pub async fn insert_or_link(
        conn: &mut SqliteConnection,
        new: &NewMediaFile,
    ) -> IngestResult<DedupOutcome> {
        let insert_sql = format!(
            "INSERT INTO media_file ({}) \
             VALUES (?, ?, ?, ?, ?, ?, NULL, ?, ?, ?, ?, ?, ?, ?, ?) \
             ON CONFLICT DO NOTHING \
             RETURNING {}",
            MEDIA_FILE_COLUMNS, MEDIA_FILE_COLUMNS
        );

        for attempt in 1..=INSERT_ATTEMPTS {
            let now = Utc::now();
            let inserted = sqlx::query_as::<_, MediaFile>(&insert_sql)
                .bind(Uuid::new_v4())
                .bind(&new.upload_id)
                .bind(&new.user_id)
                .bind(&new.checksum)
                .bind(&new.sparse_checksum)
                .bind(MediaStatus::Uploaded)
                .bind(&new.content_type)
                .bind(new.purpose)
                .bind(new.size_bytes)
                .bind(&new.storage_provider)
                .bind(&new.storage_bucket)
                .bind(&new.storage_key)
                .bind(now)
                .bind(now)
                .fetch_optional(&mut *conn)
                .await?;

            if let Some(media) = inserted {
                debug!(media_id = %media.id, upload_id = %new.upload_id, "inserted media row");
                return Ok(DedupOutcome::Inserted(media));
            }

            if let Some(existing) = Self::live_by(&mut *conn, "checksum", &new.checksum).await? {
                debug!(
                    media_id = %existing.id,
                    upload_id = %new.upload_id,
                    "linked upload to existing media"
                );
                return Ok(DedupOutcome::Linked(existing));
            }

            // the conflicting row left the live set between the two statements
            debug!(attempt, checksum = %new.checksum, "dedup conflict vanished, retrying");
        }

        Err(IngestError::Sqlx(sqlx::Error::RowNotFound))
    }
}
