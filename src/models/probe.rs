//! Transient metadata extracted before transcoding. Never persisted.

use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct ProbeResult {
    /// Video codec name as reported by the prober (e.g. "h264").
    pub codec: String,

    pub width: u32,

    pub height: u32,

    pub duration: Option<Duration>,

    /// Bits per second, container-level when the stream does not report one.
    pub bitrate: Option<u64>,

    /// Name of the strategy that produced this result.
    pub strategy: String,
}

impl ProbeResult {
    pub fn resolution(&self) -> String {
        format!("{}x{}", self.width, self.height)
    }
}
