//! ffprobe runner shared by every probe strategy.
//!
//! Shells out to `ffprobe -v error -print_format json -show_format -show_streams`
//! and maps the first video stream into a [`ProbeResult`].

use serde::Deserialize;
use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use crate::models::probe::ProbeResult;
use crate::services::blob_gateway::ByteStream;
use crate::worker::command::ToolCommand;
use crate::worker::probe::ProbeError;

/// Where ffprobe reads the media from.
pub enum ProbeInput<'a> {
    Url(&'a str),
    File(&'a Path),
    /// Piped through stdin.
    Stream(ByteStream),
}

#[derive(Debug, Clone)]
pub struct FfprobeRunner {
    ffprobe_path: PathBuf,
    timeout: Duration,
}

impl FfprobeRunner {
    pub fn new(ffprobe_path: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            ffprobe_path: ffprobe_path.into(),
            timeout,
        }
    }

    pub async fn probe(&self, input: ProbeInput<'_>, strategy: &str) -> Result<ProbeResult, ProbeError> {
        let mut cmd = ToolCommand::new(&self.ffprobe_path);
        cmd.args([
            "-v",
            "error",
            "-print_format",
            "json",
            "-show_format",
            "-show_streams",
        ])
        .timeout(self.timeout);

        match input {
            ProbeInput::Url(url) => cmd.arg(url),
            ProbeInput::File(path) => cmd.arg(path.to_string_lossy()),
            ProbeInput::Stream(stream) => cmd.arg("pipe:0").stdin_stream(stream),
        };

        let output = cmd.execute().await?;
        parse_ffprobe_json(&output.stdout, strategy)
    }
}

#[derive(Debug, Deserialize)]
struct FfprobeOutput {
    #[serde(default)]
    format: Option<FfprobeFormat>,
    #[serde(default)]
    streams: Vec<FfprobeStream>,
}

#[derive(Debug, Deserialize)]
struct FfprobeFormat {
    duration: Option<String>,
    bit_rate: Option<String>,
}

#[derive(Debug, Deserialize)]
struct FfprobeStream {
    codec_type: Option<String>,
    codec_name: Option<String>,
    width: Option<u32>,
    height: Option<u32>,
    duration: Option<String>,
    bit_rate: Option<String>,
}

fn parse_secs(s: Option<&str>) -> Option<Duration> {
    s.and_then(|s| s.parse::<f64>().ok())
        .filter(|v| v.is_finite() && *v >= 0.0)
        .map(Duration::from_secs_f64)
}

fn parse_u64(s: Option<&str>) -> Option<u64> {
    s.and_then(|s| s.parse::<u64>().ok())
}

pub(crate) fn parse_ffprobe_json(json: &str, strategy: &str) -> Result<ProbeResult, ProbeError> {
    let out: FfprobeOutput =
        serde_json::from_str(json).map_err(|e| ProbeError::Parse(e.to_string()))?;

    let video = out
        .streams
        .iter()
        .find(|s| s.codec_type.as_deref() == Some("video"))
        .ok_or(ProbeError::NoVideoStream)?;

    let (width, height) = match (video.width, video.height) {
        (Some(w), Some(h)) if w > 0 && h > 0 => (w, h),
        _ => return Err(ProbeError::Parse("video stream has no dimensions".into())),
    };

    let format = out.format.as_ref();
    Ok(ProbeResult {
        codec: video.codec_name.clone().unwrap_or_else(|| "unknown".into()),
        width,
        height,
        duration: parse_secs(video.duration.as_deref())
            .or_else(|| parse_secs(format.and_then(|f| f.duration.as_deref()))),
        bitrate: parse_u64(video.bit_rate.as_deref())
            .or_else(|| parse_u64(format.and_then(|f| f.bit_rate.as_deref()))),
        strategy: strategy.to_string(),
    })
}
