//! Embedded transcoding worker.
//!
//! Consumes `media.ready` from the message bus and drives each asset through
//! VALIDATED -> PROCESSING -> COMPLETED | FAILED. Every report goes through the
//! state machine's CAS, so redelivered events and assets deleted mid-flight
//! resolve to no-ops instead of errors.

pub mod command;
pub mod probe;

use async_trait::async_trait;
use serde::Serialize;
use std::{path::PathBuf, sync::Arc, time::Duration};
use thiserror::Error;
use tokio::sync::{Semaphore, broadcast};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::models::{
    media_file::MediaStatus,
    outbox_event::{MediaEvent, SUBJECT_MEDIA_READY},
    probe::ProbeResult,
};
use crate::services::{
    blob_gateway::{BlobError, ObjectReader},
    error::IngestResult,
    message_bus::BusMessage,
    state_machine::{MediaStateMachine, ReportOutcome},
};
use crate::worker::{
    command::{ToolCommand, ToolError},
    probe::ProbeChain,
};

/// Everything a transcoder needs to locate the source.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TranscodeJob {
    pub media_id: Uuid,
    pub upload_id: String,
    pub bucket: String,
    pub key: String,
    pub content_type: String,
}

impl TranscodeJob {
    pub fn from_event(event: MediaEvent) -> Option<Self> {
        match event {
            MediaEvent::ReadyForProcessing {
                media_id,
                upload_id,
                bucket,
                key,
                content_type,
                ..
            } => Some(Self {
                media_id,
                upload_id,
                bucket,
                key,
                content_type,
            }),
            MediaEvent::StatusChanged { .. } => None,
        }
    }
}

#[derive(Debug, Error)]
pub enum TranscodeError {
    #[error(transparent)]
    Tool(#[from] ToolError),
    #[error(transparent)]
    Blob(#[from] BlobError),
}

#[async_trait]
pub trait Transcoder: Send + Sync {
    async fn transcode(&self, job: &TranscodeJob, probe: &ProbeResult) -> Result<(), TranscodeError>;
}

/// Hands the job to an external program:
/// `<program> --media-id ID --input URL --codec C --width W --height H`.
pub struct CommandTranscoder {
    program: PathBuf,
    objects: Arc<dyn ObjectReader>,
    timeout: Duration,
}

impl CommandTranscoder {
    pub fn new(program: impl Into<PathBuf>, objects: Arc<dyn ObjectReader>, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            objects,
            timeout,
        }
    }
}

#[async_trait]
impl Transcoder for CommandTranscoder {
    async fn transcode(&self, job: &TranscodeJob, probe: &ProbeResult) -> Result<(), TranscodeError> {
        let source = self.objects.presign_get(&job.bucket, &job.key).await?;
        ToolCommand::new(&self.program)
            .args(["--media-id".to_string(), job.media_id.to_string()])
            .args(["--input".to_string(), source.url])
            .args(["--codec".to_string(), probe.codec.clone()])
            .args(["--width".to_string(), probe.width.to_string()])
            .args(["--height".to_string(), probe.height.to_string()])
            .timeout(self.timeout)
            .execute()
            .await?;
        Ok(())
    }
}

/// What happened to one delivered job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOutcome {
    Completed,
    Failed,
    /// Another delivery owns the asset, or it already left the pipeline.
    Skipped,
}

#[derive(Clone)]
pub struct TranscodeWorker {
    state_machine: MediaStateMachine,
    probes: Arc<ProbeChain>,
    transcoder: Arc<dyn Transcoder>,
    concurrency: usize,
}

/// Extra rows fetched past the reported lag when rescanning.
const BACKLOG_BATCH: i64 = 100;

impl TranscodeWorker {
    pub fn new(
        state_machine: MediaStateMachine,
        probes: Arc<ProbeChain>,
        transcoder: Arc<dyn Transcoder>,
        concurrency: usize,
    ) -> Self {
        Self {
            state_machine,
            probes,
            transcoder,
            concurrency: concurrency.max(1),
        }
    }

    pub async fn process(&self, job: &TranscodeJob) -> IngestResult<JobOutcome> {
        let id = job.media_id;
        match self
            .state_machine
            .apply_worker_report(id, MediaStatus::Validated, MediaStatus::Processing, None)
            .await?
        {
            ReportOutcome::Applied(_) => {}
            ReportOutcome::AlreadyApplied(_) | ReportOutcome::Ignored(_) => {
                debug!(media_id = %id, "duplicate or stale job, skipping");
                return Ok(JobOutcome::Skipped);
            }
        }

        let failure = match self.probes.probe(&job.bucket, &job.key).await {
            Err(err) => Some(format!("probe failed: {}", err)),
            Ok(probe) => match self.transcoder.transcode(job, &probe).await {
                Ok(()) => None,
                Err(err) => Some(format!("transcode failed: {}", err)),
            },
        };

        let (to, outcome) = match &failure {
            None => (MediaStatus::Completed, JobOutcome::Completed),
            Some(reason) => {
                warn!(media_id = %id, reason = %reason, "processing failed");
                (MediaStatus::Failed, JobOutcome::Failed)
            }
        };
        match self
            .state_machine
            .apply_worker_report(id, MediaStatus::Processing, to, failure.as_deref())
            .await?
        {
            ReportOutcome::Applied(_) => Ok(outcome),
            ReportOutcome::AlreadyApplied(_) | ReportOutcome::Ignored(_) => Ok(JobOutcome::Skipped),
        }
    }

    /// Jobs for assets sitting in VALIDATED, oldest first. Their ready events
    /// may have been dropped by a lagging subscriber; `process` skips any that
    /// another delivery already owns.
    pub async fn validated_backlog(&self, limit: i64) -> IngestResult<Vec<TranscodeJob>> {
        let media = self.state_machine.list_by_status(MediaStatus::Validated, limit).await?;
        Ok(media
            .iter()
            .filter_map(MediaEvent::for_media)
            .filter_map(TranscodeJob::from_event)
            .collect())
    }

    /// Consume bus messages until cancelled or the bus closes.
    pub async fn run(self, mut rx: broadcast::Receiver<BusMessage>, cancel: CancellationToken) {
        let permits = Arc::new(Semaphore::new(self.concurrency));
        let mut inflight = JoinSet::new();
        info!(concurrency = self.concurrency, "transcode worker started");

        loop {
            let msg = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                Some(_) = inflight.join_next(), if !inflight.is_empty() => continue,
                msg = rx.recv() => msg,
            };

            let job = match msg {
                Ok(msg) => match ready_job(&msg) {
                    Some(job) => job,
                    None => continue,
                },
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "transcode worker lagged behind the bus, rescanning validated assets");
                    let limit = i64::try_from(skipped)
                        .unwrap_or(i64::MAX)
                        .saturating_add(BACKLOG_BATCH);
                    match self.validated_backlog(limit).await {
                        Ok(jobs) => {
                            info!(jobs = jobs.len(), "re-dispatching validated backlog");
                            for job in jobs {
                                self.dispatch(job, &permits, &mut inflight).await;
                            }
                        }
                        Err(err) => error!(error = %err, "could not list validated backlog"),
                    }
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => break,
            };
            self.dispatch(job, &permits, &mut inflight).await;
        }

        info!(inflight = inflight.len(), "transcode worker stopping");
        while inflight.join_next().await.is_some() {}
    }

    /// Wait for a permit, then process `job` in the background.
    async fn dispatch(&self, job: TranscodeJob, permits: &Arc<Semaphore>, inflight: &mut JoinSet<()>) {
        // the semaphore is never closed
        let Ok(permit) = permits.clone().acquire_owned().await else {
            return;
        };
        let worker = self.clone();
        inflight.spawn(async move {
            let _permit = permit;
            match worker.process(&job).await {
                Ok(outcome) => debug!(media_id = %job.media_id, ?outcome, "job finished"),
                Err(err) => error!(media_id = %job.media_id, error = %err, "job could not be recorded"),
            }
        });
    }
}

fn ready_job(msg: &BusMessage) -> Option<TranscodeJob> {
    if msg.subject != SUBJECT_MEDIA_READY {
        return None;
    }
    match serde_json::from_slice::<MediaEvent>(&msg.payload) {
        Ok(event) => TranscodeJob::from_event(event),
        Err(err) => {
            warn!(error = %err, "dropping undecodable media.ready payload");
            None
        }
    }
}
