//! Upload Session Manager: the lifecycle of one multipart upload attempt.
//!
//! ```text
//! OPEN --complete--> COMPLETING --> COMPLETED (media_id set, chunk rows gone)
//!   |                    |
//!   |                    +--> FAILED (content did not match; object removed)
//!   +--abort / expiry sweep--> row deleted
//! ```
//!
//! Clients upload parts straight to the blob store through presigned URLs and
//! report each part here. Completion re-reads the tracker, so a stale client
//! view can never force a premature completion.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{SqliteConnection, SqlitePool};
use std::{collections::BTreeMap, sync::Arc, time::Duration};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::PipelineConfig;
use crate::models::{
    chunk_status::{ChunkState, ChunkStatus},
    media_file::MediaFile,
    upload_session::{
        SessionState, UPLOAD_SESSION_COLUMNS, UploadProgress, UploadPurpose, UploadSession,
    },
};
use crate::services::{
    blob_gateway::{BlobGateway, CompletedPart, PresignedPart},
    checksum::{self, ContentDigest},
    chunk_tracker::ChunkTracker,
    dedup::{DedupIndex, NewMediaFile},
    error::{IngestError, IngestResult},
    state_machine::MediaStateMachine,
};

const MAX_FILENAME_LEN: usize = 200;

/// Admission limits for new sessions.
#[derive(Debug, Clone)]
pub struct SessionLimits {
    pub ttl: Duration,
    pub max_upload_bytes: i64,
    pub min_part_size: i64,
    pub max_parts: i32,
    pub sparse_sample_bytes: usize,
    pub part_retry_limit: i32,
}

impl From<&PipelineConfig> for SessionLimits {
    fn from(cfg: &PipelineConfig) -> Self {
        Self {
            ttl: cfg.session_ttl,
            max_upload_bytes: cfg.max_upload_bytes,
            min_part_size: cfg.min_part_size,
            max_parts: cfg.max_parts,
            sparse_sample_bytes: cfg.sparse_sample_bytes,
            part_retry_limit: cfg.part_retry_limit,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct OpenSessionRequest {
    pub user_id: String,
    pub filename: String,
    pub content_type: String,
    pub purpose: UploadPurpose,
    pub expected_size: i64,
    pub part_size: i64,
    #[serde(default)]
    pub expected_checksum: Option<String>,
    #[serde(default)]
    pub sparse_checksum: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct OpenedSession {
    pub session: UploadSession,
    pub parts: Vec<PresignedPart>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CompletedUpload {
    pub media: MediaFile,
    /// True when the content matched an existing live asset and was linked to it.
    pub deduplicated: bool,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub examined: usize,
    pub aborted: usize,
    pub errors: usize,
}

#[derive(Clone)]
pub struct UploadSessionManager {
    db: SqlitePool,
    tracker: ChunkTracker,
    dedup: DedupIndex,
    state_machine: MediaStateMachine,
    gateway: Arc<dyn BlobGateway>,
    limits: SessionLimits,
}

impl UploadSessionManager {
    pub fn new(
        db: SqlitePool,
        state_machine: MediaStateMachine,
        gateway: Arc<dyn BlobGateway>,
        limits: SessionLimits,
    ) -> Self {
        Self {
            tracker: ChunkTracker::new(db.clone()),
            dedup: DedupIndex::new(db.clone()),
            db,
            state_machine,
            gateway,
            limits,
        }
    }

    pub fn tracker(&self) -> &ChunkTracker {
        &self.tracker
    }

    /// Admit a new upload: validate, reserve the multipart upload, create the
    /// session and its PENDING part rows, and presign every part.
    pub async fn open_session(&self, req: OpenSessionRequest) -> IngestResult<OpenedSession> {
        let part_count = self.validate_open(&req)?;
        let filename = object_name(&req.filename)?;
        let expected_checksum = normalize_optional_digest(req.expected_checksum.as_deref(), "expected_checksum")?;
        let sparse_checksum = normalize_optional_digest(req.sparse_checksum.as_deref(), "sparse_checksum")?;

        let upload_id = Uuid::new_v4().to_string();
        let object_key = format!("{}/{}/{}", req.purpose.key_prefix(), upload_id, filename);
        let gateway_upload_id = self.gateway.create_multipart_upload(&object_key).await?;

        let now = Utc::now();
        let ttl = ChronoDuration::from_std(self.limits.ttl).unwrap_or(ChronoDuration::hours(24));
        let session = UploadSession {
            upload_id,
            user_id: req.user_id.trim().to_string(),
            object_key,
            gateway_upload_id,
            content_type: req.content_type.clone(),
            purpose: req.purpose,
            expected_size: req.expected_size,
            part_size: req.part_size,
            part_count,
            expected_checksum,
            sparse_checksum,
            state: SessionState::Open,
            media_id: None,
            failure_reason: None,
            assembled_size: None,
            created_at: now,
            updated_at: now,
            expires_at: now + ttl,
        };

        if let Err(err) = self.persist_new_session(&session).await {
            if let Err(abort_err) = self.gateway.abort_multipart_upload(&session.gateway_upload_id).await {
                warn!(upload_id = %session.upload_id, error = %abort_err, "failed to release multipart upload");
            }
            return Err(err);
        }

        let mut parts = Vec::with_capacity(part_count as usize);
        for part_number in 1..=part_count {
            match self.presign(&session, part_number).await {
                Ok(part) => parts.push(part),
                Err(err) => {
                    if let Err(release_err) = self.release(&session).await {
                        warn!(upload_id = %session.upload_id, error = %release_err, "failed to release unsigned session");
                    }
                    return Err(err);
                }
            }
        }

        info!(
            upload_id = %session.upload_id,
            user_id = %session.user_id,
            parts = part_count,
            size = session.expected_size,
            "opened upload session"
        );
        Ok(OpenedSession { session, parts })
    }

    /// Returns the part count implied by the request.
    fn validate_open(&self, req: &OpenSessionRequest) -> IngestResult<i32> {
        let invalid = |msg: String| Err(IngestError::InvalidRequest(msg));

        if req.user_id.trim().is_empty() {
            return invalid("user_id must not be empty".into());
        }
        if req.expected_size <= 0 {
            return invalid("expected_size must be positive".into());
        }
        if req.expected_size > self.limits.max_upload_bytes {
            return invalid(format!(
                "expected_size {} exceeds the maximum of {} bytes",
                req.expected_size, self.limits.max_upload_bytes
            ));
        }
        if req.part_size <= 0 {
            return invalid("part_size must be positive".into());
        }
        if !req.purpose.allows(&req.content_type) {
            return invalid(format!(
                "content type {} is not allowed for {:?}",
                req.content_type, req.purpose
            ));
        }

        let part_count = (req.expected_size + req.part_size - 1) / req.part_size;
        if part_count > i64::from(self.limits.max_parts) {
            return invalid(format!(
                "{} parts exceed the maximum of {}",
                part_count, self.limits.max_parts
            ));
        }
        if part_count > 1 && req.part_size < self.limits.min_part_size {
            return invalid(format!(
                "part_size {} is below the minimum of {} bytes",
                req.part_size, self.limits.min_part_size
            ));
        }
        Ok(part_count as i32)
    }

    async fn persist_new_session(&self, s: &UploadSession) -> IngestResult<()> {
        let mut tx = self.db.begin().await?;
        sqlx::query(&format!(
            "INSERT INTO upload_session ({}) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            UPLOAD_SESSION_COLUMNS
        ))
        .bind(&s.upload_id)
        .bind(&s.user_id)
        .bind(&s.object_key)
        .bind(&s.gateway_upload_id)
        .bind(&s.content_type)
        .bind(s.purpose)
        .bind(s.expected_size)
        .bind(s.part_size)
        .bind(s.part_count)
        .bind(&s.expected_checksum)
        .bind(&s.sparse_checksum)
        .bind(s.state)
        .bind(s.media_id)
        .bind(&s.failure_reason)
        .bind(s.assembled_size)
        .bind(s.created_at)
        .bind(s.updated_at)
        .bind(s.expires_at)
        .execute(&mut *tx)
        .await?;
        ChunkTracker::initialize_tx(&mut *tx, &s.upload_id, s.part_count).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn presign(&self, session: &UploadSession, part_number: i32) -> IngestResult<PresignedPart> {
        let url = self
            .gateway
            .presign_part(&session.gateway_upload_id, part_number)
            .await?;
        let (start_byte, end_byte) = session.part_range(part_number);
        Ok(PresignedPart {
            part_number,
            url: url.url,
            expires_at: url.expires_at,
            start_byte,
            end_byte,
        })
    }

    pub async fn get_session(&self, upload_id: &str) -> IngestResult<UploadSession> {
        let mut conn = self.db.acquire().await?;
        Self::get_session_tx(&mut conn, upload_id).await
    }

    async fn get_session_tx(conn: &mut SqliteConnection, upload_id: &str) -> IngestResult<UploadSession> {
        sqlx::query_as::<_, UploadSession>(&format!(
            "SELECT {} FROM upload_session WHERE upload_id = ?",
            UPLOAD_SESSION_COLUMNS
        ))
        .bind(upload_id)
        .fetch_optional(conn)
        .await?
        .ok_or_else(|| IngestError::UploadNotFound(upload_id.to_string()))
    }

    /// Load a session that must still be accepting parts, and check `part_number`.
    async fn open_session_for_part(&self, upload_id: &str, part_number: i32) -> IngestResult<UploadSession> {
        let session = self.get_session(upload_id).await?;
        ensure_accepting(&session, Utc::now())?;
        if part_number < 1 || part_number > session.part_count {
            return Err(IngestError::InvalidRequest(format!(
                "part {} is outside 1..={}",
                part_number, session.part_count
            )));
        }
        Ok(session)
    }

    /// Mark a part UPLOADED. Repeating the call with the same etag is a no-op.
    pub async fn record_part_uploaded(
        &self,
        upload_id: &str,
        part_number: i32,
        etag: &str,
    ) -> IngestResult<ChunkStatus> {
        let etag = etag.trim().trim_matches('"');
        if etag.is_empty() {
            return Err(IngestError::InvalidRequest("etag must not be empty".into()));
        }
        self.open_session_for_part(upload_id, part_number).await?;
        let status = self
            .tracker
            .upsert(upload_id, part_number, ChunkState::Uploaded, Some(etag))
            .await?;
        debug!(upload_id = %upload_id, part_number, "part uploaded");
        Ok(status)
    }

    pub async fn record_part_failed(
        &self,
        upload_id: &str,
        part_number: i32,
        error: &str,
    ) -> IngestResult<ChunkStatus> {
        self.open_session_for_part(upload_id, part_number).await?;
        let status = self.tracker.mark_failed(upload_id, part_number, error).await?;
        warn!(upload_id = %upload_id, part_number, error = %error, "client reported failed part");
        Ok(status)
    }

    /// Re-issue the presigned URL for a part, consuming one of its retries.
    pub async fn retry_part(&self, upload_id: &str, part_number: i32) -> IngestResult<PresignedPart> {
        let session = self.open_session_for_part(upload_id, part_number).await?;
        let limit = self.limits.part_retry_limit;
        if self.tracker.bump_retry(upload_id, part_number, limit).await?.is_none() {
            return Err(IngestError::PartRetryLimit {
                upload_id: upload_id.to_string(),
                part_number,
                limit,
            });
        }
        self.presign(&session, part_number).await
    }

    pub async fn progress(&self, upload_id: &str) -> IngestResult<UploadProgress> {
        let session = self.get_session(upload_id).await?;
        let total = session.part_count;

        if session.state == SessionState::Completed {
            return Ok(UploadProgress {
                upload_id: session.upload_id,
                total_parts: total,
                uploaded_parts: i64::from(total),
                failed_parts: 0,
                pending_parts: 0,
                percentage: 100.0,
                parts: BTreeMap::new(),
            });
        }

        let parts: BTreeMap<i32, ChunkState> = self
            .tracker
            .list_by_upload(upload_id)
            .await?
            .into_iter()
            .map(|c| (c.part_number, c.status))
            .collect();
        let count = |s: ChunkState| parts.values().filter(|v| **v == s).count() as i64;
        let uploaded = count(ChunkState::Uploaded);
        let failed = count(ChunkState::Failed);

        Ok(UploadProgress {
            upload_id: session.upload_id,
            total_parts: total,
            uploaded_parts: uploaded,
            failed_parts: failed,
            pending_parts: i64::from(total) - uploaded - failed,
            percentage: if total > 0 {
                (uploaded as f64 * 10_000.0 / f64::from(total)).round() / 100.0
            } else {
                0.0
            },
            parts,
        })
    }

    /// Early duplicate hint from the client-supplied sparse checksum.
    pub async fn duplicate_hint(&self, upload_id: &str) -> IngestResult<Option<MediaFile>> {
        let session = self.get_session(upload_id).await?;
        match session.sparse_checksum.as_deref() {
            Some(sparse) => self.dedup.lookup_by_sparse_checksum(sparse).await,
            None => Ok(None),
        }
    }

    /// Finalize an upload into a media asset, or link it onto an existing live
    /// asset with the same content. Calling it again after success returns the
    /// same asset.
    pub async fn complete_session(&self, upload_id: &str) -> IngestResult<CompletedUpload> {
        let session = self.get_session(upload_id).await?;
        if session.state == SessionState::Completed {
            return self.completed_link(&session).await;
        }
        ensure_accepting(&session, Utc::now())?;

        // cheap pre-check before taking ownership of the session
        let parts = self.tracker.list_by_upload(upload_id).await?;
        missing_parts(&session, &parts)?;

        if !self.claim_for_completion(upload_id).await? {
            let current = self.get_session(upload_id).await?;
            if current.state == SessionState::Completed {
                return self.completed_link(&current).await;
            }
            return Err(IngestError::SessionNotOpen {
                upload_id: upload_id.to_string(),
                state: current.state,
            });
        }

        match self.finalize(&session).await {
            Ok(done) => Ok(done),
            Err(err) => {
                // only a session still COMPLETING is reopened; failed or swept ones stay put
                self.reopen(upload_id).await;
                Err(err)
            }
        }
    }

    async fn finalize(&self, session: &UploadSession) -> IngestResult<CompletedUpload> {
        let upload_id = session.upload_id.as_str();

        // parts cannot change any more; this read is authoritative
        let parts = self.tracker.list_by_upload(upload_id).await?;
        let completed = missing_parts(session, &parts)?;

        let size = match session.assembled_size {
            Some(size) => size,
            None => {
                let size = self
                    .gateway
                    .complete_multipart_upload(&session.gateway_upload_id, &completed)
                    .await?;
                self.mark_assembled(upload_id, size).await?;
                size
            }
        };

        let digest = self.digest(session).await?;

        if let Some(mismatch) = content_mismatch(session, size, &digest) {
            self.fail_session(session, &mismatch.to_string()).await;
            return Err(mismatch);
        }
        if let Some(client_sparse) = &session.sparse_checksum {
            if *client_sparse != digest.sparse_checksum {
                warn!(upload_id = %upload_id, "client sparse checksum differs from stored content");
            }
        }

        let new_media = NewMediaFile {
            upload_id: upload_id.to_string(),
            user_id: session.user_id.clone(),
            checksum: digest.checksum.clone(),
            sparse_checksum: Some(digest.sparse_checksum.clone()),
            content_type: session.content_type.clone(),
            purpose: session.purpose,
            size_bytes: digest.size_bytes,
            storage_provider: self.gateway.provider().to_string(),
            storage_bucket: self.gateway.bucket().to_string(),
            storage_key: session.object_key.clone(),
        };

        let mut tx = self.db.begin().await?;
        let outcome = DedupIndex::insert_or_link(&mut *tx, &new_media).await?;
        let linked = sqlx::query(
            "UPDATE upload_session \
             SET state = ?, media_id = ?, sparse_checksum = ?, updated_at = ? \
             WHERE upload_id = ? AND state = ?",
        )
        .bind(SessionState::Completed)
        .bind(outcome.media().id)
        .bind(&digest.sparse_checksum)
        .bind(Utc::now())
        .bind(upload_id)
        .bind(SessionState::Completing)
        .execute(&mut *tx)
        .await?;
        if linked.rows_affected() == 0 {
            // swept while we were hashing; the transaction rolls back on drop
            return Err(IngestError::UploadNotFound(upload_id.to_string()));
        }
        ChunkTracker::delete_all_for_upload_tx(&mut *tx, upload_id).await?;
        tx.commit().await?;

        let deduplicated = outcome.is_duplicate();
        let media = outcome.into_media();
        if deduplicated {
            if let Err(err) = self.gateway.delete_object(&session.object_key).await {
                warn!(upload_id = %upload_id, error = %err, "failed to remove duplicate object");
            }
            info!(upload_id = %upload_id, media_id = %media.id, "upload deduplicated onto existing media");
        } else {
            info!(
                upload_id = %upload_id,
                media_id = %media.id,
                size = media.size_bytes,
                "upload completed"
            );
        }
        Ok(CompletedUpload { media, deduplicated })
    }

    async fn digest(&self, session: &UploadSession) -> IngestResult<ContentDigest> {
        let stream = self.gateway.open_object(&session.object_key).await?;
        Ok(checksum::digest_stream(stream, self.limits.sparse_sample_bytes).await?)
    }

    async fn completed_link(&self, session: &UploadSession) -> IngestResult<CompletedUpload> {
        let media_id = session
            .media_id
            .ok_or_else(|| IngestError::UploadNotFound(session.upload_id.clone()))?;
        let media = self.state_machine.get(media_id).await?;
        Ok(CompletedUpload {
            deduplicated: media.upload_id != session.upload_id,
            media,
        })
    }

    /// OPEN -> COMPLETING. `false` if another caller got there first.
    async fn claim_for_completion(&self, upload_id: &str) -> IngestResult<bool> {
        let res = sqlx::query(
            "UPDATE upload_session SET state = ?, updated_at = ? WHERE upload_id = ? AND state = ?",
        )
        .bind(SessionState::Completing)
        .bind(Utc::now())
        .bind(upload_id)
        .bind(SessionState::Open)
        .execute(&self.db)
        .await?;
        Ok(res.rows_affected() == 1)
    }

    /// Remember that the parts were stitched, so a retried completion skips straight to hashing.
    async fn mark_assembled(&self, upload_id: &str, size: i64) -> IngestResult<()> {
        let res = sqlx::query(
            "UPDATE upload_session SET assembled_size = ?, updated_at = ? \
             WHERE upload_id = ? AND state = ?",
        )
        .bind(size)
        .bind(Utc::now())
        .bind(upload_id)
        .bind(SessionState::Completing)
        .execute(&self.db)
        .await?;
        if res.rows_affected() == 0 {
            return Err(IngestError::UploadNotFound(upload_id.to_string()));
        }
        debug!(upload_id = %upload_id, size, "multipart upload assembled");
        Ok(())
    }

    /// COMPLETING -> OPEN so the client can fix parts and try again.
    async fn reopen(&self, upload_id: &str) {
        let res = sqlx::query(
            "UPDATE upload_session SET state = ?, updated_at = ? WHERE upload_id = ? AND state = ?",
        )
        .bind(SessionState::Open)
        .bind(Utc::now())
        .bind(upload_id)
        .bind(SessionState::Completing)
        .execute(&self.db)
        .await;
        if let Err(err) = res {
            warn!(upload_id = %upload_id, error = %err, "failed to reopen session");
        }
    }

    async fn fail_session(&self, session: &UploadSession, reason: &str) {
        warn!(upload_id = %session.upload_id, reason = %reason, "upload failed finalization");
        let res = sqlx::query(
            "UPDATE upload_session SET state = ?, failure_reason = ?, updated_at = ? \
             WHERE upload_id = ? AND state = ?",
        )
        .bind(SessionState::Failed)
        .bind(reason)
        .bind(Utc::now())
        .bind(&session.upload_id)
        .bind(SessionState::Completing)
        .execute(&self.db)
        .await;
        if let Err(err) = res {
            warn!(upload_id = %session.upload_id, error = %err, "failed to mark session failed");
        }
        if let Err(err) = self.gateway.delete_object(&session.object_key).await {
            warn!(upload_id = %session.upload_id, error = %err, "failed to remove rejected object");
        }
    }

    /// Release reserved storage and forget the session. Completed sessions are
    /// kept as the upload -> media link and cannot be aborted.
    pub async fn abort_session(&self, upload_id: &str) -> IngestResult<()> {
        let session = self.get_session(upload_id).await?;
        if matches!(session.state, SessionState::Completed | SessionState::Completing) {
            return Err(IngestError::SessionNotOpen {
                upload_id: upload_id.to_string(),
                state: session.state,
            });
        }
        self.release(&session).await?;
        info!(upload_id = %upload_id, "aborted upload session");
        Ok(())
    }

    async fn release(&self, session: &UploadSession) -> IngestResult<()> {
        self.gateway
            .abort_multipart_upload(&session.gateway_upload_id)
            .await?;
        if session.state == SessionState::Completing || session.assembled_size.is_some() {
            // a crash or failed attempt mid-completion may have left an assembled object behind
            self.gateway.delete_object(&session.object_key).await?;
        }

        let mut tx = self.db.begin().await?;
        ChunkTracker::delete_all_for_upload_tx(&mut *tx, &session.upload_id).await?;
        sqlx::query("DELETE FROM upload_session WHERE upload_id = ? AND state = ?")
            .bind(&session.upload_id)
            .bind(session.state)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    /// Abort every unfinished session past its expiry, continuing past
    /// individual failures.
    pub async fn sweep_expired(&self, now: DateTime<Utc>, batch: i64) -> IngestResult<SweepReport> {
        let expired = sqlx::query_as::<_, UploadSession>(&format!(
            "SELECT {} FROM upload_session WHERE state != ? AND expires_at <= ? \
             ORDER BY expires_at ASC LIMIT ?",
            UPLOAD_SESSION_COLUMNS
        ))
        .bind(SessionState::Completed)
        .bind(now)
        .bind(batch)
        .fetch_all(&self.db)
        .await?;

        let mut report = SweepReport {
            examined: expired.len(),
            ..Default::default()
        };
        for session in expired {
            match self.release(&session).await {
                Ok(()) => {
                    debug!(upload_id = %session.upload_id, state = ?session.state, "expired session released");
                    report.aborted += 1;
                }
                Err(err) => {
                    warn!(upload_id = %session.upload_id, error = %err, "failed to release expired session");
                    report.errors += 1;
                }
            }
        }
        if report.aborted > 0 {
            info!(aborted = report.aborted, errors = report.errors, "session sweep finished");
        }
        Ok(report)
    }
}

fn ensure_accepting(session: &UploadSession, now: DateTime<Utc>) -> IngestResult<()> {
    if session.state != SessionState::Open {
        return Err(IngestError::SessionNotOpen {
            upload_id: session.upload_id.clone(),
            state: session.state,
        });
    }
    if session.is_expired_at(now) {
        return Err(IngestError::SessionExpired {
            upload_id: session.upload_id.clone(),
            expired_at: session.expires_at,
        });
    }
    Ok(())
}

/// Gap check over the dense range `1..=part_count`. On success, returns the
/// parts to hand to multipart-complete.
fn missing_parts(session: &UploadSession, parts: &[ChunkStatus]) -> IngestResult<Vec<CompletedPart>> {
    let uploaded: BTreeMap<i32, &str> = parts
        .iter()
        .filter(|p| p.status == ChunkState::Uploaded)
        .filter_map(|p| p.etag.as_deref().map(|etag| (p.part_number, etag)))
        .collect();

    let missing: Vec<i32> = (1..=session.part_count)
        .filter(|n| !uploaded.contains_key(n))
        .collect();
    if !missing.is_empty() {
        return Err(IngestError::IncompleteUpload {
            upload_id: session.upload_id.clone(),
            missing,
        });
    }

    Ok((1..=session.part_count)
        .filter_map(|n| {
            uploaded.get(&n).map(|etag| CompletedPart {
                part_number: n,
                etag: etag.to_string(),
            })
        })
        .collect())
}

fn content_mismatch(session: &UploadSession, size: i64, digest: &ContentDigest) -> Option<IngestError> {
    if size != session.expected_size || digest.size_bytes != session.expected_size {
        return Some(IngestError::ChecksumMismatch {
            upload_id: session.upload_id.clone(),
            expected: format!("{} bytes", session.expected_size),
            actual: format!("{} bytes", digest.size_bytes),
        });
    }
    match &session.expected_checksum {
        Some(expected) if *expected != digest.checksum => Some(IngestError::ChecksumMismatch {
            upload_id: session.upload_id.clone(),
            expected: expected.clone(),
            actual: digest.checksum.clone(),
        }),
        _ => None,
    }
}

/// Object names become path segments; keep them boring.
fn object_name(filename: &str) -> IngestResult<String> {
    let name = filename.trim();
    let ok = !name.is_empty()
        && name.len() <= MAX_FILENAME_LEN
        && !name.starts_with('.')
        && name
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'.' | b'_' | b'-'));
    if ok {
        Ok(name.to_string())
    } else {
        Err(IngestError::InvalidRequest(format!(
            "filename `{}` must be 1-{} characters of [A-Za-z0-9._-] and not start with '.'",
            filename, MAX_FILENAME_LEN
        )))
    }
}

fn normalize_optional_digest(value: Option<&str>, field: &str) -> IngestResult<Option<String>> {
    match value {
        None => Ok(None),
        Some(v) if v.trim().is_empty() => Ok(None),
        Some(v) => checksum::normalize_hex_digest(v)
            .map(Some)
            .ok_or_else(|| IngestError::InvalidRequest(format!("{} must be a hex SHA-256 digest", field))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_pool;
    use crate::models::media_file::MediaStatus;
    use crate::services::blob_gateway::{BlobError, BlobResult, ByteStream, PresignedUrl};
    use crate::services::local_blob_store::{LocalBlobStore, tests::{put_part, store_in}};
    use sha2::{Digest, Sha256};

    const MIB: i64 = 1024 * 1024;

    struct Harness {
        manager: UploadSessionManager,
        store: Arc<LocalBlobStore>,
        state_machine: MediaStateMachine,
        pool: SqlitePool,
        _dir: tempfile::TempDir,
    }

    fn limits() -> SessionLimits {
        SessionLimits {
            ttl: Duration::from_secs(3600),
            max_upload_bytes: 100 * MIB,
            min_part_size: 5 * MIB,
            max_parts: 10_000,
            sparse_sample_bytes: 1024 * 1024,
            part_retry_limit: 2,
        }
    }

    async fn harness_with(limits: SessionLimits) -> Harness {
        let pool = test_pool().await;
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(store_in(dir.path()));
        let state_machine = MediaStateMachine::new(pool.clone());
        let manager = UploadSessionManager::new(pool.clone(), state_machine.clone(), store.clone(), limits);
        Harness { manager, store, state_machine, pool, _dir: dir }
    }

    async fn harness() -> Harness {
        harness_with(limits()).await
    }

    fn request(size: i64, part_size: i64) -> OpenSessionRequest {
        OpenSessionRequest {
            user_id: "user-1".into(),
            filename: "feature.mp4".into(),
            content_type: "video/mp4".into(),
            purpose: UploadPurpose::MovieSource,
            expected_size: size,
            part_size,
            expected_checksum: None,
            sparse_checksum: None,
        }
    }

    impl Harness {
        async fn upload_part(&self, session: &UploadSession, part: i32, data: &[u8]) {
            let etag = put_part(&self.store, &session.gateway_upload_id, part, data).await;
            self.manager
                .record_part_uploaded(&session.upload_id, part, &etag)
                .await
                .unwrap();
        }

        async fn count(&self, table: &str) -> i64 {
            sqlx::query_scalar(&format!("SELECT COUNT(*) FROM {}", table))
                .fetch_one(&self.pool)
                .await
                .unwrap()
        }

        async fn upload_whole(&self, data: &[u8]) -> CompletedUpload {
            let opened = self
                .manager
                .open_session(request(data.len() as i64, data.len() as i64))
                .await
                .unwrap();
            self.upload_part(&opened.session, 1, data).await;
            self.manager.complete_session(&opened.session.upload_id).await.unwrap()
        }
    }

    #[tokio::test]
    async fn three_part_upload_reports_gap_then_completes() {
        let h = harness().await;
        let part_size = 10 * MIB;
        let opened = h.manager.open_session(request(3 * part_size, part_size)).await.unwrap();
        let session = opened.session;
        assert_eq!(session.part_count, 3);
        assert_eq!(opened.parts.len(), 3);
        assert_eq!((opened.parts[2].start_byte, opened.parts[2].end_byte), (20 * MIB, 30 * MIB - 1));
        assert!(session.object_key.starts_with("movies/source/"));

        let parts: Vec<Vec<u8>> = (1..=3u8).map(|n| vec![n; part_size as usize]).collect();
        h.upload_part(&session, 1, &parts[0]).await;
        h.upload_part(&session, 3, &parts[2]).await;

        let err = h.manager.complete_session(&session.upload_id).await.unwrap_err();
        assert!(matches!(&err, IngestError::IncompleteUpload { missing, .. } if *missing == vec![2]));
        assert_eq!(h.manager.get_session(&session.upload_id).await.unwrap().state, SessionState::Open);

        h.upload_part(&session, 2, &parts[1]).await;
        let done = h.manager.complete_session(&session.upload_id).await.unwrap();
        assert!(!done.deduplicated);
        assert_eq!(done.media.status, MediaStatus::Uploaded);
        assert_eq!(done.media.size_bytes, 3 * part_size);

        let mut hasher = Sha256::new();
        parts.iter().for_each(|p| hasher.update(p));
        assert_eq!(done.media.checksum, hex::encode(hasher.finalize()));
        assert_eq!(
            done.media.sparse_checksum.as_deref(),
            Some(checksum::sparse_checksum(&parts[0], 1024 * 1024).as_str())
        );

        assert_eq!(h.count("chunk_upload_status").await, 0);
        let stored = h.manager.get_session(&session.upload_id).await.unwrap();
        assert_eq!(stored.state, SessionState::Completed);
        assert_eq!(stored.media_id, Some(done.media.id));
        assert_eq!(
            h.state_machine.status_for_upload(&session.upload_id).await.unwrap(),
            MediaStatus::Uploaded
        );
    }

    #[tokio::test]
    async fn identical_payload_links_to_existing_media_without_new_event() {
        let h = harness().await;
        let payload = vec![7u8; 5 * MIB as usize];

        let first = h.upload_whole(&payload).await;
        let id = first.media.id;
        for (from, to) in [
            (MediaStatus::Uploaded, MediaStatus::Validated),
            (MediaStatus::Validated, MediaStatus::Processing),
            (MediaStatus::Processing, MediaStatus::Completed),
        ] {
            h.state_machine.transition(id, from, to).await.unwrap();
        }
        let events_before = h.count("outbox_event").await;
        assert_eq!(events_before, 2);

        let second = h.upload_whole(&payload).await;
        assert!(second.deduplicated);
        assert_eq!(second.media.id, id);
        assert_eq!(second.media.status, MediaStatus::Completed);
        assert_eq!(h.count("media_file").await, 1);
        assert_eq!(h.count("outbox_event").await, events_before);

        // the duplicate bytes are not kept
        let second_session: String = sqlx::query_scalar(
            "SELECT object_key FROM upload_session WHERE upload_id != ?",
        )
        .bind(&first.media.upload_id)
        .fetch_one(&h.pool)
        .await
        .unwrap();
        assert!(h.store.open_object(&second_session).await.is_err());
        assert!(h.store.open_object(&first.media.storage_key).await.is_ok());
    }

    #[tokio::test]
    async fn recording_a_part_twice_is_idempotent() {
        let h = harness().await;
        let opened = h.manager.open_session(request(10, 10)).await.unwrap();
        let id = &opened.session.upload_id;

        let once = h.manager.record_part_uploaded(id, 1, "\"abc\"").await.unwrap();
        let twice = h.manager.record_part_uploaded(id, 1, "abc").await.unwrap();
        assert_eq!(once, twice);
        assert_eq!(h.manager.tracker().count_by_status(id, ChunkState::Uploaded).await.unwrap(), 1);

        assert!(matches!(
            h.manager.record_part_uploaded(id, 2, "abc").await,
            Err(IngestError::InvalidRequest(_))
        ));
    }

    #[tokio::test]
    async fn open_rejects_bad_requests() {
        let h = harness().await;
        let cases = [
            request(0, 10),
            request(200 * MIB, 10 * MIB),
            request(20 * MIB, MIB),
            OpenSessionRequest { content_type: "image/png".into(), ..request(10, 10) },
            OpenSessionRequest { filename: "../../etc/passwd".into(), ..request(10, 10) },
            OpenSessionRequest { user_id: " ".into(), ..request(10, 10) },
            OpenSessionRequest { expected_checksum: Some("nope".into()), ..request(10, 10) },
        ];
        for req in cases {
            let err = h.manager.open_session(req.clone()).await.unwrap_err();
            assert!(matches!(err, IngestError::InvalidRequest(_)), "{:?} -> {}", req, err);
        }
        assert_eq!(h.count("upload_session").await, 0);

        let tiny = SessionLimits { max_parts: 2, ..limits() };
        let h = harness_with(tiny).await;
        assert!(matches!(
            h.manager.open_session(request(15 * MIB, 5 * MIB)).await,
            Err(IngestError::InvalidRequest(_))
        ));
    }

    #[tokio::test]
    async fn expired_session_cannot_complete_and_is_swept() {
        let h = harness_with(SessionLimits { ttl: Duration::ZERO, ..limits() }).await;
        let opened = h.manager.open_session(request(10, 10)).await.unwrap();
        let id = opened.session.upload_id.clone();

        assert!(matches!(
            h.manager.complete_session(&id).await,
            Err(IngestError::SessionExpired { .. })
        ));
        assert!(matches!(
            h.manager.record_part_uploaded(&id, 1, "e").await,
            Err(IngestError::SessionExpired { .. })
        ));

        let report = h.manager.sweep_expired(Utc::now(), 100).await.unwrap();
        assert_eq!(report, SweepReport { examined: 1, aborted: 1, errors: 0 });
        assert_eq!(h.count("upload_session").await, 0);
        assert_eq!(h.count("chunk_upload_status").await, 0);
        assert!(h.store.presign_part(&opened.session.gateway_upload_id, 1).await.is_err());
    }

    #[tokio::test]
    async fn sweep_keeps_completed_sessions() {
        let h = harness().await;
        let done = h.upload_whole(b"hello").await;
        let report = h
            .manager
            .sweep_expired(Utc::now() + ChronoDuration::days(2), 100)
            .await
            .unwrap();
        assert_eq!(report.examined, 0);
        assert_eq!(
            h.state_machine.status_for_upload(&done.media.upload_id).await.unwrap(),
            MediaStatus::Uploaded
        );
    }

    #[tokio::test]
    async fn abort_releases_everything() {
        let h = harness().await;
        let opened = h.manager.open_session(request(10, 10)).await.unwrap();
        h.upload_part(&opened.session, 1, b"0123456789").await;

        h.manager.abort_session(&opened.session.upload_id).await.unwrap();
        assert_eq!(h.count("upload_session").await, 0);
        assert_eq!(h.count("chunk_upload_status").await, 0);
        assert!(matches!(
            h.manager.abort_session(&opened.session.upload_id).await,
            Err(IngestError::UploadNotFound(_))
        ));
    }

    #[tokio::test]
    async fn checksum_mismatch_fails_the_session() {
        let h = harness().await;
        let req = OpenSessionRequest {
            expected_checksum: Some("0".repeat(64)),
            ..request(5, 5)
        };
        let opened = h.manager.open_session(req).await.unwrap();
        h.upload_part(&opened.session, 1, b"hello").await;

        let err = h.manager.complete_session(&opened.session.upload_id).await.unwrap_err();
        assert!(matches!(err, IngestError::ChecksumMismatch { .. }));
        let session = h.manager.get_session(&opened.session.upload_id).await.unwrap();
        assert_eq!(session.state, SessionState::Failed);
        assert!(h.store.open_object(&session.object_key).await.is_err());
        assert_eq!(h.count("media_file").await, 0);
        assert_eq!(
            h.state_machine.status_for_upload(&session.upload_id).await.unwrap(),
            MediaStatus::Failed
        );
    }

    #[tokio::test]
    async fn complete_is_idempotent() {
        let h = harness().await;
        let first = h.upload_whole(b"same bytes").await;
        let again = h.manager.complete_session(&first.media.upload_id).await.unwrap();
        assert_eq!(again.media.id, first.media.id);
        assert!(!again.deduplicated);
    }

    #[tokio::test]
    async fn failed_parts_can_be_retried_until_the_limit() {
        let h = harness().await;
        let opened = h.manager.open_session(request(10, 10)).await.unwrap();
        let id = &opened.session.upload_id;

        h.manager.record_part_failed(id, 1, "timeout").await.unwrap();
        let progress = h.manager.progress(id).await.unwrap();
        assert_eq!((progress.failed_parts, progress.pending_parts), (1, 0));

        for _ in 0..2 {
            let part = h.manager.retry_part(id, 1).await.unwrap();
            assert_eq!(part.part_number, 1);
        }
        assert!(matches!(
            h.manager.retry_part(id, 1).await,
            Err(IngestError::PartRetryLimit { limit: 2, .. })
        ));
    }

    #[tokio::test]
    async fn progress_reports_counts_and_percentage() {
        let h = harness().await;
        let opened = h.manager.open_session(request(20 * MIB, 5 * MIB)).await.unwrap();
        let id = &opened.session.upload_id;
        h.manager.record_part_uploaded(id, 1, "a").await.unwrap();
        h.manager.record_part_failed(id, 4, "boom").await.unwrap();

        let p = h.manager.progress(id).await.unwrap();
        assert_eq!(p.total_parts, 4);
        assert_eq!((p.uploaded_parts, p.failed_parts, p.pending_parts), (1, 1, 2));
        assert_eq!(p.percentage, 25.0);
        assert_eq!(p.parts.get(&4), Some(&ChunkState::Failed));
    }

    #[tokio::test]
    async fn sparse_checksum_gives_early_duplicate_hint() {
        let h = harness().await;
        let payload = b"leading bytes of a movie".to_vec();
        let existing = h.upload_whole(&payload).await;

        let hinted = OpenSessionRequest {
            sparse_checksum: Some(checksum::sparse_checksum(&payload, 1024 * 1024)),
            ..request(payload.len() as i64, payload.len() as i64)
        };
        let opened = h.manager.open_session(hinted).await.unwrap();
        let hint = h.manager.duplicate_hint(&opened.session.upload_id).await.unwrap();
        assert_eq!(hint.map(|m| m.id), Some(existing.media.id));

        let plain = h.manager.open_session(request(3, 3)).await.unwrap();
        assert!(h.manager.duplicate_hint(&plain.session.upload_id).await.unwrap().is_none());
    }

    /// Delegates to the local store but refuses to presign, recording aborts.
    struct UnsignableGateway {
        inner: Arc<LocalBlobStore>,
        aborted: std::sync::Mutex<Vec<String>>,
    }

    #[async_trait::async_trait]
    impl BlobGateway for UnsignableGateway {
        fn provider(&self) -> &str {
            self.inner.provider()
        }

        fn bucket(&self) -> &str {
            self.inner.bucket()
        }

        async fn create_multipart_upload(&self, key: &str) -> BlobResult<String> {
            self.inner.create_multipart_upload(key).await
        }

        async fn presign_part(&self, _upload_id: &str, _part_number: i32) -> BlobResult<PresignedUrl> {
            Err(BlobError::Unavailable("signing key unavailable".into()))
        }

        async fn complete_multipart_upload(&self, upload_id: &str, parts: &[CompletedPart]) -> BlobResult<i64> {
            self.inner.complete_multipart_upload(upload_id, parts).await
        }

        async fn abort_multipart_upload(&self, upload_id: &str) -> BlobResult<()> {
            self.aborted.lock().unwrap().push(upload_id.to_string());
            self.inner.abort_multipart_upload(upload_id).await
        }

        async fn open_object(&self, key: &str) -> BlobResult<ByteStream> {
            self.inner.open_object(key).await
        }

        async fn delete_object(&self, key: &str) -> BlobResult<()> {
            self.inner.delete_object(key).await
        }
    }

    #[tokio::test]
    async fn presign_failure_releases_the_new_session() {
        let h = harness().await;
        let gateway = Arc::new(UnsignableGateway {
            inner: h.store.clone(),
            aborted: Default::default(),
        });
        let manager = UploadSessionManager::new(h.pool.clone(), h.state_machine.clone(), gateway.clone(), limits());

        let err = manager.open_session(request(10, 10)).await.unwrap_err();
        assert!(matches!(err, IngestError::Blob(BlobError::Unavailable(_))), "{err}");
        assert_eq!(h.count("upload_session").await, 0);
        assert_eq!(h.count("chunk_upload_status").await, 0);
        assert_eq!(gateway.aborted.lock().unwrap().len(), 1);
    }

    async fn refuse_media_inserts(pool: &SqlitePool) {
        sqlx::query(
            "CREATE TRIGGER refuse_media BEFORE INSERT ON media_file \
             BEGIN SELECT RAISE(ABORT, 'database is busy'); END",
        )
        .execute(pool)
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn database_failure_after_assembly_can_be_retried() {
        let h = harness().await;
        let payload = vec![9u8; 4096];
        let opened = h.manager.open_session(request(4096, 4096)).await.unwrap();
        let id = opened.session.upload_id.clone();
        h.upload_part(&opened.session, 1, &payload).await;

        refuse_media_inserts(&h.pool).await;
        let err = h.manager.complete_session(&id).await.unwrap_err();
        assert!(matches!(err, IngestError::Sqlx(_)), "{err}");

        let stored = h.manager.get_session(&id).await.unwrap();
        assert_eq!(stored.state, SessionState::Open);
        assert_eq!(stored.assembled_size, Some(4096));
        assert!(h.store.open_object(&stored.object_key).await.is_ok());
        assert_eq!(h.count("media_file").await, 0);

        sqlx::query("DROP TRIGGER refuse_media").execute(&h.pool).await.unwrap();
        let done = h.manager.complete_session(&id).await.unwrap();
        assert!(!done.deduplicated);
        assert_eq!(done.media.size_bytes, 4096);
        assert_eq!(h.manager.get_session(&id).await.unwrap().state, SessionState::Completed);
    }

    #[tokio::test]
    async fn aborting_after_a_failed_completion_removes_the_assembled_object() {
        let h = harness().await;
        let opened = h.manager.open_session(request(16, 16)).await.unwrap();
        let id = opened.session.upload_id.clone();
        h.upload_part(&opened.session, 1, b"assembled object").await;

        refuse_media_inserts(&h.pool).await;
        h.manager.complete_session(&id).await.unwrap_err();

        h.manager.abort_session(&id).await.unwrap();
        assert!(h.store.open_object(&opened.session.object_key).await.is_err());
        assert_eq!(h.count("upload_session").await, 0);
    }
}
