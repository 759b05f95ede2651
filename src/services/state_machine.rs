//! Media State Machine: the authoritative lifecycle of a media asset.
//!
//! Every transition is a compare-and-swap on the persisted status. Transitions
//! into VALIDATED, COMPLETED and FAILED enqueue their outbox event inside the
//! same transaction, so an event exists iff its state change committed.

use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::{SqliteConnection, SqlitePool};
use std::sync::Arc;
use tokio::sync::Notify;
use tracing::{debug, info};
use uuid::Uuid;

use crate::models::{
    media_file::{MEDIA_FILE_COLUMNS, MediaFile, MediaStatus},
    outbox_event::MediaEvent,
    upload_session::SessionState,
};
use crate::services::{
    error::{IngestError, IngestResult},
    outbox::OutboxTxOps,
};

const DELETE_ATTEMPTS: usize = 3;

/// How a worker-reported transition was resolved.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "outcome", content = "media", rename_all = "snake_case")]
pub enum ReportOutcome {
    Applied(MediaFile),
    /// A previous delivery of the same report already moved the asset.
    AlreadyApplied(MediaFile),
    /// The asset reached a terminal state (e.g. DELETED) first; nothing to do.
    Ignored(MediaFile),
}

#[derive(Clone)]
pub struct MediaStateMachine {
    db: SqlitePool,
    outbox_notify: Option<Arc<Notify>>,
}

impl MediaStateMachine {
    pub fn new(db: SqlitePool) -> Self {
        Self {
            db,
            outbox_notify: None,
        }
    }

    /// Wake the outbox publisher whenever a transition enqueues an event.
    pub fn with_outbox_notifier(mut self, notify: Arc<Notify>) -> Self {
        self.outbox_notify = Some(notify);
        self
    }

    pub async fn get(&self, media_id: Uuid) -> IngestResult<MediaFile> {
        let mut conn = self.db.acquire().await?;
        Self::get_tx(&mut conn, media_id).await
    }

    pub async fn get_tx(conn: &mut SqliteConnection, media_id: Uuid) -> IngestResult<MediaFile> {
        sqlx::query_as::<_, MediaFile>(&format!(
            "SELECT {} FROM media_file WHERE id = ?",
            MEDIA_FILE_COLUMNS
        ))
        .bind(media_id)
        .fetch_optional(conn)
        .await?
        .ok_or(IngestError::MediaNotFound(media_id))
    }

    pub async fn get_status(&self, media_id: Uuid) -> IngestResult<MediaStatus> {
        sqlx::query_scalar::<_, MediaStatus>("SELECT status FROM media_file WHERE id = ?")
            .bind(media_id)
            .fetch_optional(&self.db)
            .await?
            .ok_or(IngestError::MediaNotFound(media_id))
    }

    /// Status as seen through an upload id: INITIATED until the session
    /// completes, then the status of the linked (possibly deduplicated) asset.
    pub async fn status_for_upload(&self, upload_id: &str) -> IngestResult<MediaStatus> {
        let row: Option<(SessionState, Option<Uuid>)> =
            sqlx::query_as("SELECT state, media_id FROM upload_session WHERE upload_id = ?")
                .bind(upload_id)
                .fetch_optional(&self.db)
                .await?;

        match row {
            None => Err(IngestError::UploadNotFound(upload_id.to_string())),
            Some((SessionState::Completed, Some(media_id))) => self.get_status(media_id).await,
            Some((SessionState::Failed, _)) => Ok(MediaStatus::Failed),
            Some(_) => Ok(MediaStatus::Initiated),
        }
    }

    pub async fn transition(
        &self,
        media_id: Uuid,
        from: MediaStatus,
        to: MediaStatus,
    ) -> IngestResult<MediaFile> {
        self.transition_with_reason(media_id, from, to, None).await
    }

    /// CAS `from -> to`, recording `reason` on the row when given.
    pub async fn transition_with_reason(
        &self,
        media_id: Uuid,
        from: MediaStatus,
        to: MediaStatus,
        reason: Option<&str>,
    ) -> IngestResult<MediaFile> {
        let mut tx = self.db.begin().await?;
        let media = Self::transition_tx(&mut *tx, media_id, from, to, reason).await?;
        tx.commit().await?;
        self.after_commit(to);
        Ok(media)
    }

    /// Signal the publisher once a transaction containing a transition to
    /// `to` has committed.
    pub fn after_commit(&self, to: MediaStatus) {
        if to.emits_event() {
            if let Some(notify) = &self.outbox_notify {
                notify.notify_one();
            }
        }
    }

    /// The transition itself, inside the caller's transaction.
    ///
    /// - `InvalidTransition` when the edge does not exist.
    /// - `StaleState` when the persisted status is not `from`.
    pub async fn transition_tx(
        conn: &mut SqliteConnection,
        media_id: Uuid,
        from: MediaStatus,
        to: MediaStatus,
        reason: Option<&str>,
    ) -> IngestResult<MediaFile> {
        if !from.can_transition_to(to) {
            return Err(IngestError::InvalidTransition { from, to });
        }

        let updated = sqlx::query_as::<_, MediaFile>(&format!(
            "UPDATE media_file \
             SET status = ?, reject_reason = COALESCE(?, reject_reason), updated_at = ? \
             WHERE id = ? AND status = ? \
             RETURNING {}",
            MEDIA_FILE_COLUMNS
        ))
        .bind(to)
        .bind(reason)
        .bind(Utc::now())
        .bind(media_id)
        .bind(from)
        .fetch_optional(&mut *conn)
        .await?;

        let Some(media) = updated else {
            let current = Self::get_tx(&mut *conn, media_id).await?;
            return Err(IngestError::StaleState {
                media_id,
                expected: from,
                actual: current.status,
            });
        };

        if let Some(event) = MediaEvent::for_media(&media) {
            OutboxTxOps::enqueue(&mut *conn, &event).await?;
        }

        info!(media_id = %media_id, from = %from, to = %to, "media transitioned");
        Ok(media)
    }

    /// Apply a transition reported by a worker, tolerating redeliveries and
    /// assets that moved on (e.g. were deleted) while the worker ran.
    pub async fn apply_worker_report(
        &self,
        media_id: Uuid,
        from: MediaStatus,
        to: MediaStatus,
        reason: Option<&str>,
    ) -> IngestResult<ReportOutcome> {
        match self.transition_with_reason(media_id, from, to, reason).await {
            Ok(media) => Ok(ReportOutcome::Applied(media)),
            Err(IngestError::StaleState { actual, .. }) => {
                let current = self.get(media_id).await?;
                if current.status == to {
                    debug!(media_id = %media_id, status = %to, "worker report already applied");
                    Ok(ReportOutcome::AlreadyApplied(current))
                } else if current.status.is_terminal() {
                    info!(
                        media_id = %media_id,
                        current = %current.status,
                        reported = %to,
                        "ignoring worker report for terminal asset"
                    );
                    Ok(ReportOutcome::Ignored(current))
                } else {
                    Err(IngestError::StaleState {
                        media_id,
                        expected: from,
                        actual,
                    })
                }
            }
            Err(err) => Err(err),
        }
    }

    /// Soft delete. Authorization is decided by the caller and passed in.
    /// Deleting an already deleted asset returns it unchanged.
    pub async fn delete(&self, media_id: Uuid, allow_delete: bool) -> IngestResult<MediaFile> {
        if !allow_delete {
            return Err(IngestError::DeleteNotAllowed(media_id));
        }

        let mut last_err = None;
        for _ in 0..DELETE_ATTEMPTS {
            let current = self.get(media_id).await?;
            if current.status == MediaStatus::Deleted {
                return Ok(current);
            }
            match self
                .transition(media_id, current.status, MediaStatus::Deleted)
                .await
            {
                Ok(media) => return Ok(media),
                // raced with another transition; re-read and try again
                Err(err @ IngestError::StaleState { .. }) => last_err = Some(err),
                Err(err) => return Err(err),
            }
        }
        Err(last_err.unwrap_or(IngestError::MediaNotFound(media_id)))
    }

    /// Move non-terminal assets not updated since `older_than` to EXPIRED.
    pub async fn expire_stale(&self, older_than: DateTime<Utc>) -> IngestResult<Vec<Uuid>> {
        let expired: Vec<Uuid> = sqlx::query_scalar(
            "UPDATE media_file \
             SET status = ?, reject_reason = COALESCE(reject_reason, 'no progress before expiry'), updated_at = ? \
             WHERE status IN ('INITIATED', 'UPLOADED', 'VALIDATED', 'PROCESSING') AND updated_at < ? \
             RETURNING id",
        )
        .bind(MediaStatus::Expired)
        .bind(Utc::now())
        .bind(older_than)
        .fetch_all(&self.db)
        .await?;

        if !expired.is_empty() {
            info!(count = expired.len(), "expired stale media");
        }
        Ok(expired)
    }

    /// Oldest-updated first.
    pub async fn list_by_status(
        &self,
        status: MediaStatus,
        limit: i64,
    ) -> IngestResult<Vec<MediaFile>> {
        Ok(sqlx::query_as::<_, MediaFile>(&format!(
            "SELECT {} FROM media_file WHERE status = ? ORDER BY updated_at ASC LIMIT ?",
            MEDIA_FILE_COLUMNS
        ))
        .bind(status)
        .bind(limit)
        .fetch_all(&self.db)
        .await?)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::db::test_pool;
    use crate::models::outbox_event::OutboxEvent;
    use crate::services::dedup::{DedupIndex, tests::new_media};
    use chrono::Duration as ChronoDuration;

    pub(crate) async fn seed_media(pool: &SqlitePool, checksum: &str) -> MediaFile {
        let mut tx = pool.begin().await.unwrap();
        let media = DedupIndex::insert_or_link(&mut *tx, &new_media(&format!("up-{checksum}"), checksum))
            .await
            .unwrap()
            .into_media();
        tx.commit().await.unwrap();
        media
    }

    async fn outbox(pool: &SqlitePool) -> Vec<OutboxEvent> {
        sqlx::query_as(&format!(
            "SELECT {} FROM outbox_event ORDER BY id",
            crate::models::outbox_event::OUTBOX_EVENT_COLUMNS
        ))
        .fetch_all(pool)
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn validated_enqueues_ready_event_atomically() {
        let pool = test_pool().await;
        let sm = MediaStateMachine::new(pool.clone());
        let media = seed_media(&pool, "c1").await;

        let validated = sm
            .transition(media.id, MediaStatus::Uploaded, MediaStatus::Validated)
            .await
            .unwrap();
        assert_eq!(validated.status, MediaStatus::Validated);

        let events = outbox(&pool).await;
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].subject, "media.ready");
        assert_eq!(events[0].aggregate_id, media.id.to_string());
        let payload: MediaEvent = serde_json::from_str(&events[0].payload).unwrap();
        assert_eq!(payload.media_id(), media.id);
    }

    #[tokio::test]
    async fn rejection_records_reason_without_event() {
        let pool = test_pool().await;
        let sm = MediaStateMachine::new(pool.clone());
        let media = seed_media(&pool, "c2").await;

        let rejected = sm
            .transition_with_reason(
                media.id,
                MediaStatus::Uploaded,
                MediaStatus::MalwareDetected,
                Some("virus scan: Eicar-Test-Signature"),
            )
            .await
            .unwrap();
        assert_eq!(rejected.reject_reason.as_deref(), Some("virus scan: Eicar-Test-Signature"));
        assert!(outbox(&pool).await.is_empty());
    }

    #[tokio::test]
    async fn concurrent_transitions_from_same_state_only_one_wins() {
        let pool = test_pool().await;
        let sm = MediaStateMachine::new(pool.clone());
        let media = seed_media(&pool, "c3").await;

        let (a, b) = tokio::join!(
            sm.transition(media.id, MediaStatus::Uploaded, MediaStatus::Validated),
            sm.transition(media.id, MediaStatus::Uploaded, MediaStatus::Rejected),
        );
        let wins = [a.is_ok(), b.is_ok()].into_iter().filter(|ok| *ok).count();
        assert_eq!(wins, 1);
        let loser = if a.is_err() { a.unwrap_err() } else { b.unwrap_err() };
        assert!(matches!(
            loser,
            IngestError::StaleState { expected: MediaStatus::Uploaded, .. }
        ));
    }

    #[tokio::test]
    async fn stale_expectation_is_rejected() {
        let pool = test_pool().await;
        let sm = MediaStateMachine::new(pool.clone());
        let media = seed_media(&pool, "c4").await;

        let err = sm
            .transition(media.id, MediaStatus::Validated, MediaStatus::Processing)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            IngestError::StaleState { expected: MediaStatus::Validated, actual: MediaStatus::Uploaded, .. }
        ));
        assert_eq!(sm.get_status(media.id).await.unwrap(), MediaStatus::Uploaded);
    }

    #[tokio::test]
    async fn missing_edges_and_media_are_reported() {
        let pool = test_pool().await;
        let sm = MediaStateMachine::new(pool.clone());
        let media = seed_media(&pool, "c5").await;

        assert!(matches!(
            sm.transition(media.id, MediaStatus::Uploaded, MediaStatus::Completed).await,
            Err(IngestError::InvalidTransition { .. })
        ));
        assert!(matches!(
            sm.transition(Uuid::new_v4(), MediaStatus::Uploaded, MediaStatus::Validated).await,
            Err(IngestError::MediaNotFound(_))
        ));
    }

    #[tokio::test]
    async fn worker_report_after_delete_is_ignored() {
        let pool = test_pool().await;
        let sm = MediaStateMachine::new(pool.clone());
        let media = seed_media(&pool, "c6").await;
        sm.transition(media.id, MediaStatus::Uploaded, MediaStatus::Validated).await.unwrap();
        sm.transition(media.id, MediaStatus::Validated, MediaStatus::Processing).await.unwrap();
        sm.delete(media.id, true).await.unwrap();

        let outcome = sm
            .apply_worker_report(media.id, MediaStatus::Processing, MediaStatus::Completed, None)
            .await
            .unwrap();
        assert!(matches!(outcome, ReportOutcome::Ignored(m) if m.status == MediaStatus::Deleted));
        // only the ready event; the ignored completion emitted nothing
        assert_eq!(outbox(&pool).await.len(), 1);
    }

    #[tokio::test]
    async fn duplicate_worker_report_is_already_applied() {
        let pool = test_pool().await;
        let sm = MediaStateMachine::new(pool.clone());
        let media = seed_media(&pool, "c7").await;
        sm.transition(media.id, MediaStatus::Uploaded, MediaStatus::Validated).await.unwrap();

        let first = sm
            .apply_worker_report(media.id, MediaStatus::Validated, MediaStatus::Processing, None)
            .await
            .unwrap();
        let second = sm
            .apply_worker_report(media.id, MediaStatus::Validated, MediaStatus::Processing, None)
            .await
            .unwrap();
        assert!(matches!(first, ReportOutcome::Applied(_)));
        assert!(matches!(second, ReportOutcome::AlreadyApplied(_)));
    }

    #[tokio::test]
    async fn delete_requires_explicit_permission() {
        let pool = test_pool().await;
        let sm = MediaStateMachine::new(pool.clone());
        let media = seed_media(&pool, "c8").await;

        assert!(matches!(
            sm.delete(media.id, false).await,
            Err(IngestError::DeleteNotAllowed(id)) if id == media.id
        ));
        assert_eq!(sm.get_status(media.id).await.unwrap(), MediaStatus::Uploaded);

        let deleted = sm.delete(media.id, true).await.unwrap();
        assert_eq!(deleted.status, MediaStatus::Deleted);
        assert_eq!(sm.delete(media.id, true).await.unwrap().status, MediaStatus::Deleted);
    }

    #[tokio::test]
    async fn expire_stale_skips_recent_and_terminal_assets() {
        let pool = test_pool().await;
        let sm = MediaStateMachine::new(pool.clone());
        let stale = seed_media(&pool, "old").await;
        let done = seed_media(&pool, "done").await;
        sqlx::query("UPDATE media_file SET status = 'COMPLETED' WHERE id = ?")
            .bind(done.id)
            .execute(&pool)
            .await
            .unwrap();

        assert!(sm.expire_stale(Utc::now() - ChronoDuration::hours(1)).await.unwrap().is_empty());

        let expired = sm.expire_stale(Utc::now() + ChronoDuration::seconds(1)).await.unwrap();
        assert_eq!(expired, vec![stale.id]);
        assert_eq!(sm.get_status(stale.id).await.unwrap(), MediaStatus::Expired);
        assert_eq!(sm.get_status(done.id).await.unwrap(), MediaStatus::Completed);
    }

    #[tokio::test]
    async fn outbox_notifier_fires_after_event_transition() {
        let pool = test_pool().await;
        let notify = Arc::new(Notify::new());
        let sm = MediaStateMachine::new(pool.clone()).with_outbox_notifier(notify.clone());
        let media = seed_media(&pool, "c9").await;

        sm.transition(media.id, MediaStatus::Uploaded, MediaStatus::Validated).await.unwrap();
        tokio::time::timeout(std::time::Duration::from_secs(1), notify.notified())
            .await
            .unwrap();
    }
}
