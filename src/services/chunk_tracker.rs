//! Chunk Status Tracker: per-part bookkeeping keyed by `(upload_id, part_number)`.
//!
//! Holds no completion policy. The upload session manager decides what a gap
//! or a failed part means; this module only records and reports.

use chrono::Utc;
use sqlx::{QueryBuilder, Sqlite, SqliteConnection, SqlitePool};

use crate::models::chunk_status::{CHUNK_STATUS_COLUMNS, ChunkState, ChunkStatus};

/// Rows per multi-row INSERT when seeding a session's parts.
const SEED_BATCH: usize = 500;

#[derive(Clone)]
pub struct ChunkTracker {
    db: SqlitePool,
}

impl ChunkTracker {
    pub fn new(db: SqlitePool) -> Self {
        Self { db }
    }

    /// Create PENDING rows for parts `1..=part_count`. Existing rows are left alone.
    pub async fn initialize_tx(
        conn: &mut SqliteConnection,
        upload_id: &str,
        part_count: i32,
    ) -> Result<(), sqlx::Error> {
        let now = Utc::now();
        let parts: Vec<i32> = (1..=part_count).collect();
        for batch in parts.chunks(SEED_BATCH) {
            let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(
                "INSERT INTO chunk_upload_status (upload_id, part_number, status, retry_count, updated_at) ",
            );
            qb.push_values(batch, |mut row, part_number| {
                row.push_bind(upload_id)
                    .push_bind(*part_number)
                    .push_bind(ChunkState::Pending)
                    .push_bind(0i32)
                    .push_bind(now);
            });
            qb.push(" ON CONFLICT (upload_id, part_number) DO NOTHING");
            qb.build().execute(&mut *conn).await?;
        }
        Ok(())
    }

    /// Record `status` for one part. Last write wins between concurrent writers
    /// of the same part; repeating an identical write leaves the row untouched.
    pub async fn upsert(
        &self,
        upload_id: &str,
        part_number: i32,
        status: ChunkState,
        etag: Option<&str>,
    ) -> Result<ChunkStatus, sqlx::Error> {
        self.write(upload_id, part_number, status, etag, None).await
    }

    /// Mark a part FAILED with the client's error message.
    pub async fn mark_failed(
        &self,
        upload_id: &str,
        part_number: i32,
        message: &str,
    ) -> Result<ChunkStatus, sqlx::Error> {
        self.write(upload_id, part_number, ChunkState::Failed, None, Some(message))
            .await
    }

    async fn write(
        &self,
        upload_id: &str,
        part_number: i32,
        status: ChunkState,
        etag: Option<&str>,
        error_message: Option<&str>,
    ) -> Result<ChunkStatus, sqlx::Error> {
        let sql = format!(
            "INSERT INTO chunk_upload_status \
                 (upload_id, part_number, status, etag, retry_count, error_message, updated_at) \
             VALUES (?, ?, ?, ?, 0, ?, ?) \
             ON CONFLICT (upload_id, part_number) DO UPDATE SET \
                 status = excluded.status, \
                 etag = excluded.etag, \
                 error_message = excluded.error_message, \
                 updated_at = excluded.updated_at \
             WHERE chunk_upload_status.status IS NOT excluded.status \
                OR chunk_upload_status.etag IS NOT excluded.etag \
                OR chunk_upload_status.error_message IS NOT excluded.error_message \
             RETURNING {}",
            CHUNK_STATUS_COLUMNS
        );
        let written = sqlx::query_as::<_, ChunkStatus>(&sql)
            .bind(upload_id)
            .bind(part_number)
            .bind(status)
            .bind(etag)
            .bind(error_message)
            .bind(Utc::now())
            .fetch_optional(&self.db)
            .await?;

        match written {
            Some(row) => Ok(row),
            // identical write: the conflict clause skipped the update
            None => self.get(upload_id, part_number).await?.ok_or(sqlx::Error::RowNotFound),
        }
    }

    pub async fn get(
        &self,
        upload_id: &str,
        part_number: i32,
    ) -> Result<Option<ChunkStatus>, sqlx::Error> {
        sqlx::query_as::<_, ChunkStatus>(&format!(
            "SELECT {} FROM chunk_upload_status WHERE upload_id = ? AND part_number = ?",
            CHUNK_STATUS_COLUMNS
        ))
        .bind(upload_id)
        .bind(part_number)
        .fetch_optional(&self.db)
        .await
    }

    /// Reset a part to PENDING for another attempt, unless it already used
    /// `limit` retries. Returns `None` when the limit is reached or the part is unknown.
    pub async fn bump_retry(
        &self,
        upload_id: &str,
        part_number: i32,
        limit: i32,
    ) -> Result<Option<ChunkStatus>, sqlx::Error> {
        sqlx::query_as::<_, ChunkStatus>(&format!(
            "UPDATE chunk_upload_status \
             SET retry_count = retry_count + 1, status = ?, etag = NULL, updated_at = ? \
             WHERE upload_id = ? AND part_number = ? AND retry_count < ? \
             RETURNING {}",
            CHUNK_STATUS_COLUMNS
        ))
        .bind(ChunkState::Pending)
        .bind(Utc::now())
        .bind(upload_id)
        .bind(part_number)
        .bind(limit)
        .fetch_optional(&self.db)
        .await
    }

    /// All parts of an upload in ascending part order.
    pub async fn list_by_upload(&self, upload_id: &str) -> Result<Vec<ChunkStatus>, sqlx::Error> {
        let mut conn = self.db.acquire().await?;
        Self::list_by_upload_tx(&mut conn, upload_id).await
    }

    pub async fn list_by_upload_tx(
        conn: &mut SqliteConnection,
        upload_id: &str,
    ) -> Result<Vec<ChunkStatus>, sqlx::Error> {
        sqlx::query_as::<_, ChunkStatus>(&format!(
            "SELECT {} FROM chunk_upload_status WHERE upload_id = ? ORDER BY part_number ASC",
            CHUNK_STATUS_COLUMNS
        ))
        .bind(upload_id)
        .fetch_all(conn)
        .await
    }

    pub async fn count_by_status(
        &self,
        upload_id: &str,
        status: ChunkState,
    ) -> Result<i64, sqlx::Error> {
        sqlx::query_scalar(
            "SELECT COUNT(*) FROM chunk_upload_status WHERE upload_id = ? AND status = ?",
        )
        .bind(upload_id)
        .bind(status)
        .fetch_one(&self.db)
        .await
    }

    pub async fn delete_all_for_upload(&self, upload_id: &str) -> Result<u64, sqlx::Error> {
        let mut conn = self.db.acquire().await?;
        Self::delete_all_for_upload_tx(&mut conn, upload_id).await
    }

    pub async fn delete_all_for_upload_tx(
        conn: &mut SqliteConnection,
        upload_id: &str,
    ) -> Result<u64, sqlx::Error> {
        let res = sqlx::query("DELETE FROM chunk_upload_status WHERE upload_id = ?")
            .bind(upload_id)
            .execute(conn)
            .await?;
        Ok(res.rows_affected())
    }
}
