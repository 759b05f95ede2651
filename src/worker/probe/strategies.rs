//! The shipped probe strategies, from cheapest to most expensive.

use async_trait::async_trait;
use std::sync::Arc;
use tracing::debug;

use crate::models::probe::ProbeResult;
use crate::services::blob_gateway::ObjectReader;
use crate::worker::probe::{
    ProbeError, ProbeStrategy,
    ffprobe::{FfprobeRunner, ProbeInput},
};

/// ffprobe reads the object straight from a presigned URL; nothing flows
/// through the worker.
pub struct PresignedUrlProbe {
    objects: Arc<dyn ObjectReader>,
    runner: FfprobeRunner,
}

impl PresignedUrlProbe {
    pub const NAME: &'static str = "presigned-url";

    pub fn new(objects: Arc<dyn ObjectReader>, runner: FfprobeRunner) -> Self {
        Self { objects, runner }
    }
}

#[async_trait]
impl ProbeStrategy for PresignedUrlProbe {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn priority(&self) -> i32 {
        100
    }

    fn supports(&self, _bucket: &str, _key: &str) -> bool {
        true
    }

    async fn probe(&self, bucket: &str, key: &str) -> Result<ProbeResult, ProbeError> {
        let url = self.objects.presign_get(bucket, key).await?;
        self.runner.probe(ProbeInput::Url(&url.url), Self::NAME).await
    }
}

/// Download the leading bytes into a temp file and probe that. Works for
/// containers that keep their index up front.
pub struct PartialDownloadProbe {
    objects: Arc<dyn ObjectReader>,
    runner: FfprobeRunner,
    partial_bytes: u64,
}

impl PartialDownloadProbe {
    pub const NAME: &'static str = "partial-download";

    pub fn new(objects: Arc<dyn ObjectReader>, runner: FfprobeRunner, partial_bytes: u64) -> Self {
        Self {
            objects,
            runner,
            partial_bytes,
        }
    }
}

#[async_trait]
impl ProbeStrategy for PartialDownloadProbe {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn priority(&self) -> i32 {
        50
    }

    fn supports(&self, _bucket: &str, key: &str) -> bool {
        let key = key.to_ascii_lowercase();
        [".mp4", ".mov", ".m4v"].iter().any(|ext| key.ends_with(ext))
    }

    async fn probe(&self, bucket: &str, key: &str) -> Result<ProbeResult, ProbeError> {
        let head = self.objects.read_prefix(bucket, key, self.partial_bytes).await?;
        debug!(bucket, key, bytes = head.len(), "probing downloaded prefix");

        // removed when `tmp` drops
        let tmp = tempfile::Builder::new()
            .prefix("probe_")
            .suffix(".partial")
            .tempfile()?;
        tokio::fs::write(tmp.path(), &head).await?;
        self.runner.probe(ProbeInput::File(tmp.path()), Self::NAME).await
    }
}

/// Pipe the object into ffprobe's stdin.
pub struct StreamPipeProbe {
    objects: Arc<dyn ObjectReader>,
    runner: FfprobeRunner,
}

impl StreamPipeProbe {
    pub const NAME: &'static str = "stream-pipe";

    pub fn new(objects: Arc<dyn ObjectReader>, runner: FfprobeRunner) -> Self {
        Self { objects, runner }
    }
}

#[async_trait]
impl ProbeStrategy for StreamPipeProbe {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn priority(&self) -> i32 {
        10
    }

    fn supports(&self, _bucket: &str, _key: &str) -> bool {
        true
    }

    async fn probe(&self, bucket: &str, key: &str) -> Result<ProbeResult, ProbeError> {
        let stream = self.objects.open_stream(bucket, key).await?;
        self.runner.probe(ProbeInput::Stream(stream), Self::NAME).await
    }
}

/// The default chain members, in registration order.
pub fn default_strategies(
    objects: Arc<dyn ObjectReader>,
    runner: FfprobeRunner,
    partial_bytes: u64,
) -> Vec<Arc<dyn ProbeStrategy>> {
    vec![
        Arc::new(PresignedUrlProbe::new(objects.clone(), runner.clone())),
        Arc::new(PartialDownloadProbe::new(objects.clone(), runner.clone(), partial_bytes)),
        Arc::new(StreamPipeProbe::new(objects, runner)),
    ]
}
