//! Transcode probe strategy chain.
//!
//! Strategies are registered once at startup as an explicit list; the chain
//! orders them by descending priority and falls through on failure.

pub mod ffprobe;
pub mod strategies;

use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::models::probe::ProbeResult;
use crate::services::blob_gateway::BlobError;
use crate::worker::command::ToolError;

#[derive(Debug, Error)]
pub enum ProbeError {
    #[error(transparent)]
    Tool(#[from] ToolError),
    #[error(transparent)]
    Blob(#[from] BlobError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("unparseable prober output: {0}")]
    Parse(String),
    #[error("no video stream found")]
    NoVideoStream,
    #[error("no probe strategy supports {bucket}/{key}")]
    Unsupported { bucket: String, key: String },
    #[error("all probe strategies failed for {bucket}/{key}")]
    Exhausted {
        bucket: String,
        key: String,
        #[source]
        last: Box<ProbeError>,
    },
}

#[async_trait]
pub trait ProbeStrategy: Send + Sync {
    fn name(&self) -> &str;

    /// Higher runs first.
    fn priority(&self) -> i32;

    fn supports(&self, bucket: &str, key: &str) -> bool;

    async fn probe(&self, bucket: &str, key: &str) -> Result<ProbeResult, ProbeError>;
}

pub struct ProbeChain {
    strategies: Vec<Arc<dyn ProbeStrategy>>,
}

impl ProbeChain {
    pub fn new(mut strategies: Vec<Arc<dyn ProbeStrategy>>) -> Self {
        // stable: equal priorities keep registration order
        strategies.sort_by_key(|s| std::cmp::Reverse(s.priority()));
        info!(strategies = ?strategies.iter().map(|s| s.name()).collect::<Vec<_>>(), "probe chain ready");
        Self { strategies }
    }

    pub fn strategy_names(&self) -> Vec<&str> {
        self.strategies.iter().map(|s| s.name()).collect()
    }

    pub fn supports(&self, bucket: &str, key: &str) -> bool {
        self.strategies.iter().any(|s| s.supports(bucket, key))
    }

    pub async fn probe(&self, bucket: &str, key: &str) -> Result<ProbeResult, ProbeError> {
        let mut last = None;
        for strategy in &self.strategies {
            if !strategy.supports(bucket, key) {
                debug!(strategy = strategy.name(), bucket, key, "strategy does not apply");
                continue;
            }
            match strategy.probe(bucket, key).await {
                Ok(result) => {
                    info!(strategy = strategy.name(), bucket, key, resolution = %result.resolution(), "probed");
                    return Ok(result);
                }
                Err(err) => {
                    warn!(strategy = strategy.name(), bucket, key, error = %err, "probe strategy failed");
                    last = Some(err);
                }
            }
        }

        match last {
            Some(last) => {
                error!(bucket, key, "all probe strategies failed");
                Err(ProbeError::Exhausted {
                    bucket: bucket.to_string(),
                    key: key.to_string(),
                    last: Box::new(last),
                })
            }
            None => Err(ProbeError::Unsupported {
                bucket: bucket.to_string(),
                key: key.to_string(),
            }),
        }
    }
}
