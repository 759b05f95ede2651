//! Reliable outbox: events are written in the same transaction as the state
//! change that produced them and delivered to the message bus by a sweep.
//!
//! Delivery is at-least-once. Each sweep claims a batch under a time-limited
//! lease (`claimed_by`, `claimed_until`) with a single `UPDATE … RETURNING`, so
//! two publisher instances never attempt the same row at the same time, and a
//! crashed instance's claims become available again once the lease runs out.

use bytes::Bytes;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::Serialize;
use sqlx::{SqliteConnection, SqlitePool};
use std::{sync::Arc, time::Duration};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::models::outbox_event::{MediaEvent, OUTBOX_EVENT_COLUMNS, OutboxEvent, OutboxStatus};
use crate::services::error::IngestResult;
use crate::services::message_bus::MessageBus;

/// Delay before a failed event becomes eligible again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backoff {
    /// Same delay after every failure.
    Fixed(Duration),
    /// `base * 2^(attempt - 1)`, capped at `max`.
    Exponential { base: Duration, max: Duration },
}

impl Backoff {
    /// Delay after the `attempt`-th failed delivery (1-based).
    pub fn delay_for(&self, attempt: i32) -> Duration {
        match *self {
            Backoff::Fixed(delay) => delay,
            Backoff::Exponential { base, max } => {
                let shift = attempt.saturating_sub(1).clamp(0, 30) as u32;
                base.checked_mul(1u32 << shift).unwrap_or(max).min(max)
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct OutboxPolicy {
    /// Failed attempts before an event is dead-lettered.
    pub max_retries: i32,
    pub batch_size: i64,
    /// How long a claim keeps other publishers away from a row.
    pub claim_ttl: Duration,
    /// SENT rows older than this are deleted by [`OutboxPublisher::clean_sent`].
    pub retention: Duration,
    pub backoff: Backoff,
}

/// Transaction-scoped outbox writes.
pub struct OutboxTxOps;

impl OutboxTxOps {
    /// Persist `event` as PENDING. Call inside the transaction that made the change.
    pub async fn enqueue(conn: &mut SqliteConnection, event: &MediaEvent) -> IngestResult<i64> {
        let payload = serde_json::to_string(event)?;
        let now = Utc::now();
        let id: i64 = sqlx::query_scalar(
            "INSERT INTO outbox_event \
                 (aggregate_id, subject, event_type, payload, status, retry_count, next_attempt_at, created_at) \
             VALUES (?, ?, ?, ?, ?, 0, ?, ?) \
             RETURNING id",
        )
        .bind(event.media_id().to_string())
        .bind(event.subject())
        .bind(event.event_type())
        .bind(payload)
        .bind(OutboxStatus::Pending)
        .bind(now)
        .bind(now)
        .fetch_one(conn)
        .await?;
        Ok(id)
    }
}

/// Outcome of one publish sweep.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PublishReport {
    pub claimed: usize,
    pub sent: usize,
    pub retried: usize,
    pub dead_lettered: usize,
}

impl PublishReport {
    pub fn is_idle(&self) -> bool {
        self.claimed == 0
    }
}

#[derive(Clone)]
pub struct OutboxPublisher {
    db: SqlitePool,
    bus: Arc<dyn MessageBus>,
    policy: OutboxPolicy,
    instance_id: String,
    notify: Arc<Notify>,
}

impl OutboxPublisher {
    pub fn new(db: SqlitePool, bus: Arc<dyn MessageBus>, policy: OutboxPolicy) -> Self {
        Self {
            db,
            bus,
            policy,
            instance_id: format!("publisher-{}", Uuid::new_v4().simple()),
            notify: Arc::new(Notify::new()),
        }
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    /// Handle used by writers to wake the publish loop after a commit.
    pub fn notifier(&self) -> Arc<Notify> {
        self.notify.clone()
    }

    pub async fn publish_pending(&self) -> IngestResult<PublishReport> {
        self.publish_pending_at(Utc::now()).await
    }

    /// One sweep as of `now`. Every claimed event is attempted independently.
    pub async fn publish_pending_at(&self, now: DateTime<Utc>) -> IngestResult<PublishReport> {
        let batch = self.claim(now).await?;
        let mut report = PublishReport {
            claimed: batch.len(),
            ..Default::default()
        };

        for event in batch {
            let delivery = self
                .bus
                .publish(&event.subject, Bytes::from(event.payload.clone()))
                .await;

            let outcome = match delivery {
                Ok(()) => self.mark_sent(&event, now).await.map(|_| {
                    report.sent += 1;
                }),
                Err(err) => {
                    let attempt = event.retry_count + 1;
                    if attempt >= self.policy.max_retries {
                        error!(
                            event_id = event.id,
                            aggregate_id = %event.aggregate_id,
                            attempts = attempt,
                            error = %err,
                            "outbox event exhausted retries, dead-lettering"
                        );
                        report.dead_lettered += 1;
                    } else {
                        warn!(
                            event_id = event.id,
                            aggregate_id = %event.aggregate_id,
                            attempt,
                            error = %err,
                            "outbox delivery failed, will retry"
                        );
                        report.retried += 1;
                    }
                    self.record_failure(&event, attempt, &err.to_string(), now).await
                }
            };

            // bookkeeping failure: the lease expires and the row is retried
            if let Err(err) = outcome {
                warn!(event_id = event.id, error = %err, "failed to record outbox delivery outcome");
            }
        }

        Ok(report)
    }

    /// Lease up to `batch_size` due PENDING events, oldest first.
    async fn claim(&self, now: DateTime<Utc>) -> IngestResult<Vec<OutboxEvent>> {
        let lease = ChronoDuration::from_std(self.policy.claim_ttl).unwrap_or(ChronoDuration::seconds(60));
        let mut events = sqlx::query_as::<_, OutboxEvent>(&format!(
            "UPDATE outbox_event SET claimed_by = ?, claimed_until = ? \
             WHERE id IN ( \
                 SELECT id FROM outbox_event \
                 WHERE status = ? AND retry_count < ? AND next_attempt_at <= ? \
                   AND (claimed_until IS NULL OR claimed_until <= ?) \
                 ORDER BY id ASC \
                 LIMIT ? \
             ) \
             RETURNING {}",
            OUTBOX_EVENT_COLUMNS
        ))
        .bind(&self.instance_id)
        .bind(now + lease)
        .bind(OutboxStatus::Pending)
        .bind(self.policy.max_retries)
        .bind(now)
        .bind(now)
        .bind(self.policy.batch_size)
        .fetch_all(&self.db)
        .await?;

        events.sort_by_key(|e| e.id);
        Ok(events)
    }

    async fn mark_sent(&self, event: &OutboxEvent, now: DateTime<Utc>) -> IngestResult<()> {
        sqlx::query(
            "UPDATE outbox_event \
             SET status = ?, sent_at = ?, last_attempt_at = ?, claimed_by = NULL, claimed_until = NULL \
             WHERE id = ? AND claimed_by = ?",
        )
        .bind(OutboxStatus::Sent)
        .bind(now)
        .bind(now)
        .bind(event.id)
        .bind(&self.instance_id)
        .execute(&self.db)
        .await?;
        Ok(())
    }

    async fn record_failure(
        &self,
        event: &OutboxEvent,
        attempt: i32,
        message: &str,
        now: DateTime<Utc>,
    ) -> IngestResult<()> {
        let status = if attempt >= self.policy.max_retries {
            OutboxStatus::Failed
        } else {
            OutboxStatus::Pending
        };
        let delay = ChronoDuration::from_std(self.policy.backoff.delay_for(attempt))
            .unwrap_or(ChronoDuration::zero());
        sqlx::query(
            "UPDATE outbox_event \
             SET status = ?, retry_count = ?, last_error = ?, last_attempt_at = ?, \
                 next_attempt_at = ?, claimed_by = NULL, claimed_until = NULL \
             WHERE id = ? AND claimed_by = ?",
        )
        .bind(status)
        .bind(attempt)
        .bind(message)
        .bind(now)
        .bind(now + delay)
        .bind(event.id)
        .bind(&self.instance_id)
        .execute(&self.db)
        .await?;
        Ok(())
    }

    /// Delete SENT rows older than the retention window.
    pub async fn clean_sent(&self) -> IngestResult<u64> {
        self.clean_sent_before(Utc::now() - self.retention()).await
    }

    fn retention(&self) -> ChronoDuration {
        ChronoDuration::from_std(self.policy.retention).unwrap_or(ChronoDuration::days(7))
    }

    pub async fn clean_sent_before(&self, cutoff: DateTime<Utc>) -> IngestResult<u64> {
        let res = sqlx::query("DELETE FROM outbox_event WHERE status = ? AND sent_at < ?")
            .bind(OutboxStatus::Sent)
            .bind(cutoff)
            .execute(&self.db)
            .await?;
        Ok(res.rows_affected())
    }

    /// Events that exhausted their retry budget, oldest first.
    pub async fn dead_letters(&self, limit: i64) -> IngestResult<Vec<OutboxEvent>> {
        Ok(sqlx::query_as::<_, OutboxEvent>(&format!(
            "SELECT {} FROM outbox_event WHERE status = ? ORDER BY id ASC LIMIT ?",
            OUTBOX_EVENT_COLUMNS
        ))
        .bind(OutboxStatus::Failed)
        .bind(limit)
        .fetch_all(&self.db)
        .await?)
    }

    /// Give a dead-lettered event a fresh retry budget. `false` if it is not dead-lettered.
    pub async fn requeue(&self, event_id: i64) -> IngestResult<bool> {
        let res = sqlx::query(
            "UPDATE outbox_event \
             SET status = ?, retry_count = 0, next_attempt_at = ?, claimed_by = NULL, claimed_until = NULL \
             WHERE id = ? AND status = ?",
        )
        .bind(OutboxStatus::Pending)
        .bind(Utc::now())
        .bind(event_id)
        .bind(OutboxStatus::Failed)
        .execute(&self.db)
        .await?;
        let requeued = res.rows_affected() == 1;
        if requeued {
            self.notify.notify_one();
            info!(event_id, "requeued dead-lettered outbox event");
        }
        Ok(requeued)
    }

    /// Run sweeps every `interval`, or sooner when woken through [`Self::notifier`].
    pub fn spawn(self, interval: Duration, cancel: CancellationToken) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;

                    _ = cancel.cancelled() => {
                        info!("Outbox publisher shutting down");
                        break;
                    }
                    _ = self.notify.notified() => {}
                    _ = tokio::time::sleep(interval) => {}
                }

                if cancel.is_cancelled() {
                    break;
                }

                match self.publish_pending().await {
                    Ok(report) if report.is_idle() => debug!("outbox idle"),
                    Ok(report) => info!(
                        claimed = report.claimed,
                        sent = report.sent,
                        retried = report.retried,
                        dead_lettered = report.dead_lettered,
                        "outbox sweep finished"
                    ),
                    Err(e) => warn!("Outbox publish sweep failed: {}", e),
                }
            }
            debug!("Outbox publisher stopped");
        })
    }
}
