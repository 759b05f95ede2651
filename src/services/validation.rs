//! Validation of freshly uploaded assets.
//!
//! Scanning and type detection are collaborators; this module only turns their
//! verdicts into state transitions out of UPLOADED:
//!
//! - detected type outside the purpose allow-list -> INVALID_FILE
//! - virus found -> MALWARE_DETECTED
//! - a collaborator failed -> REJECTED (reason records which one)
//! - otherwise -> VALIDATED, which enqueues the ready-for-processing event

use async_trait::async_trait;
use futures::StreamExt;
use serde::Serialize;
use std::{io, sync::Arc, time::Duration};
use thiserror::Error;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpStream,
    time::timeout,
};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::models::media_file::{MediaFile, MediaStatus};
use crate::services::{
    blob_gateway::{BlobError, ObjectReader},
    error::{IngestError, IngestResult},
    state_machine::MediaStateMachine,
};

/// The stored object a collaborator should look at.
#[derive(Debug, Clone, PartialEq)]
pub struct ObjectRef {
    pub bucket: String,
    pub key: String,
    /// Type the client declared at upload time.
    pub declared_content_type: String,
    pub size_bytes: i64,
}

impl ObjectRef {
    pub fn for_media(media: &MediaFile) -> Self {
        Self {
            bucket: media.storage_bucket.clone(),
            key: media.storage_key.clone(),
            declared_content_type: media.content_type.clone(),
            size_bytes: media.size_bytes,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum ScanVerdict {
    Clean,
    /// Signature name reported by the scanner.
    Infected(String),
}

#[derive(Debug, Error)]
pub enum CollaboratorError {
    #[error(transparent)]
    Blob(#[from] BlobError),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error("unexpected reply: {0}")]
    Protocol(String),
    #[error("timed out after {0:?}")]
    Timeout(Duration),
}

#[async_trait]
pub trait VirusScanner: Send + Sync {
    fn name(&self) -> &str;
    async fn scan(&self, object: &ObjectRef) -> Result<ScanVerdict, CollaboratorError>;
}

#[async_trait]
pub trait ContentTypeValidator: Send + Sync {
    /// MIME type of the stored bytes.
    async fn detect(&self, object: &ObjectRef) -> Result<String, CollaboratorError>;
}

/// Trusts every object. For deployments without a scanner.
pub struct ScanningDisabled;

#[async_trait]
impl VirusScanner for ScanningDisabled {
    fn name(&self) -> &str {
        "disabled"
    }

    async fn scan(&self, _object: &ObjectRef) -> Result<ScanVerdict, CollaboratorError> {
        Ok(ScanVerdict::Clean)
    }
}

/// Reports the type the client declared. No sniffing.
pub struct DeclaredContentType;

#[async_trait]
impl ContentTypeValidator for DeclaredContentType {
    async fn detect(&self, object: &ObjectRef) -> Result<String, CollaboratorError> {
        Ok(object.declared_content_type.clone())
    }
}

/// clamd client speaking the `zINSTREAM` command over TCP.
pub struct ClamdScanner {
    addr: String,
    objects: Arc<dyn ObjectReader>,
    timeout: Duration,
}

impl ClamdScanner {
    pub fn new(addr: impl Into<String>, objects: Arc<dyn ObjectReader>, timeout: Duration) -> Self {
        Self {
            addr: addr.into(),
            objects,
            timeout,
        }
    }

    async fn stream_object(&self, object: &ObjectRef) -> Result<String, CollaboratorError> {
        let mut conn = TcpStream::connect(&self.addr).await?;
        conn.write_all(b"zINSTREAM\0").await?;

        let mut body = self.objects.open_stream(&object.bucket, &object.key).await?;
        while let Some(chunk) = body.next().await {
            let chunk = chunk?;
            if chunk.is_empty() {
                continue;
            }
            let len = u32::try_from(chunk.len())
                .map_err(|_| CollaboratorError::Protocol("chunk larger than 4 GiB".into()))?;
            conn.write_all(&len.to_be_bytes()).await?;
            conn.write_all(&chunk).await?;
        }
        conn.write_all(&0u32.to_be_bytes()).await?;
        conn.flush().await?;

        let mut reply = Vec::new();
        conn.read_to_end(&mut reply).await?;
        Ok(String::from_utf8_lossy(&reply).into_owned())
    }
}

/// `stream: OK`, `stream: <signature> FOUND` or `... ERROR`, NUL-terminated.
pub(crate) fn parse_clamd_reply(reply: &str) -> Result<ScanVerdict, CollaboratorError> {
    let reply = reply.trim_end_matches(['\0', '\n', '\r', ' ']);
    let body = reply.strip_prefix("stream: ").unwrap_or(reply);
    if body == "OK" {
        return Ok(ScanVerdict::Clean);
    }
    if let Some(signature) = body.strip_suffix(" FOUND") {
        return Ok(ScanVerdict::Infected(signature.to_string()));
    }
    Err(CollaboratorError::Protocol(reply.to_string()))
}

#[async_trait]
impl VirusScanner for ClamdScanner {
    fn name(&self) -> &str {
        "clamd"
    }

    async fn scan(&self, object: &ObjectRef) -> Result<ScanVerdict, CollaboratorError> {
        let reply = timeout(self.timeout, self.stream_object(object))
            .await
            .map_err(|_| CollaboratorError::Timeout(self.timeout))??;
        debug!(key = %object.key, reply = %reply.trim_end_matches('\0'), "clamd replied");
        parse_clamd_reply(&reply)
    }
}

/// Counts from one recovery sweep.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ValidationSweep {
    pub examined: usize,
    pub validated: usize,
    pub rejected: usize,
    pub errors: usize,
}

#[derive(Clone)]
pub struct ValidationService {
    state_machine: MediaStateMachine,
    scanner: Arc<dyn VirusScanner>,
    content_types: Arc<dyn ContentTypeValidator>,
}

impl ValidationService {
    pub fn new(
        state_machine: MediaStateMachine,
        scanner: Arc<dyn VirusScanner>,
        content_types: Arc<dyn ContentTypeValidator>,
    ) -> Self {
        Self {
            state_machine,
            scanner,
            content_types,
        }
    }

    /// Decide the fate of an UPLOADED asset. Assets in any other state are
    /// returned unchanged, so repeated or concurrent calls are harmless.
    pub async fn validate(&self, media_id: Uuid) -> IngestResult<MediaFile> {
        let media = self.state_machine.get(media_id).await?;
        if media.status != MediaStatus::Uploaded {
            return Ok(media);
        }

        let object = ObjectRef::for_media(&media);
        let (to, reason) = self.verdict(&media, &object).await;

        match self
            .state_machine
            .transition_with_reason(media_id, MediaStatus::Uploaded, to, reason.as_deref())
            .await
        {
            Ok(media) => {
                if let Some(reason) = &reason {
                    info!(media_id = %media_id, status = %to, reason = %reason, "media failed validation");
                }
                Ok(media)
            }
            Err(IngestError::StaleState { actual, .. }) => {
                debug!(media_id = %media_id, current = %actual, "validation raced, keeping current state");
                self.state_machine.get(media_id).await
            }
            Err(err) => Err(err),
        }
    }

    async fn verdict(&self, media: &MediaFile, object: &ObjectRef) -> (MediaStatus, Option<String>) {
        match self.content_types.detect(object).await {
            Ok(detected) if !media.purpose.allows(&detected) => {
                return (
                    MediaStatus::InvalidFile,
                    Some(format!(
                        "content type {} is not allowed for {:?}",
                        detected, media.purpose
                    )),
                );
            }
            Ok(_) => {}
            Err(err) => {
                return (
                    MediaStatus::Rejected,
                    Some(format!("content type detection failed: {}", err)),
                );
            }
        }

        match self.scanner.scan(object).await {
            Ok(ScanVerdict::Clean) => (MediaStatus::Validated, None),
            Ok(ScanVerdict::Infected(signature)) => (
                MediaStatus::MalwareDetected,
                Some(format!("{} found {}", self.scanner.name(), signature)),
            ),
            Err(err) => (
                MediaStatus::Rejected,
                Some(format!("{} scan failed: {}", self.scanner.name(), err)),
            ),
        }
    }

    /// Validate up to `limit` assets still sitting in UPLOADED, e.g. after a
    /// crash between completion and validation.
    pub async fn validate_pending(&self, limit: i64) -> IngestResult<ValidationSweep> {
        let pending = self
            .state_machine
            .list_by_status(MediaStatus::Uploaded, limit)
            .await?;
        let mut sweep = ValidationSweep {
            examined: pending.len(),
            ..Default::default()
        };

        for media in pending {
            match self.validate(media.id).await {
                Ok(m) if m.status == MediaStatus::Validated => sweep.validated += 1,
                Ok(m) if m.status != MediaStatus::Uploaded => sweep.rejected += 1,
                Ok(_) => {}
                Err(err) => {
                    warn!(media_id = %media.id, error = %err, "validation failed");
                    sweep.errors += 1;
                }
            }
        }
        Ok(sweep)
    }
}
