//! Builder for running external tools (ffprobe, the transcoder) with a timeout.

use futures::StreamExt;
use std::{
    path::{Path, PathBuf},
    process::{ExitStatus, Stdio},
    time::Duration,
};
use thiserror::Error;
use tokio::{io::AsyncWriteExt, process::Command};
use tracing::debug;

use crate::services::blob_gateway::ByteStream;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(300);

#[derive(Debug, Error)]
pub enum ToolError {
    #[error("{tool}: failed to spawn: {source}")]
    Spawn {
        tool: String,
        #[source]
        source: std::io::Error,
    },
    #[error("{tool}: I/O error: {source}")]
    Io {
        tool: String,
        #[source]
        source: std::io::Error,
    },
    #[error("{tool}: timed out after {timeout:?}")]
    Timeout { tool: String, timeout: Duration },
    #[error("{tool}: exited with {status}: {stderr}")]
    Failed {
        tool: String,
        status: ExitStatus,
        stderr: String,
    },
}

#[derive(Debug, Clone)]
pub struct ToolOutput {
    pub status: ExitStatus,
    pub stdout: String,
    pub stderr: String,
}

pub struct ToolCommand {
    program: PathBuf,
    args: Vec<String>,
    timeout: Duration,
    stdin: Option<ByteStream>,
}

impl ToolCommand {
    pub fn new(program: impl AsRef<Path>) -> Self {
        Self {
            program: program.as_ref().to_path_buf(),
            args: Vec::new(),
            timeout: DEFAULT_TIMEOUT,
            stdin: None,
        }
    }

    pub fn arg(&mut self, s: impl Into<String>) -> &mut Self {
        self.args.push(s.into());
        self
    }

    pub fn args(&mut self, iter: impl IntoIterator<Item = impl Into<String>>) -> &mut Self {
        self.args.extend(iter.into_iter().map(Into::into));
        self
    }

    pub fn timeout(&mut self, d: Duration) -> &mut Self {
        self.timeout = d;
        self
    }

    /// Pipe `stream` into the process's stdin.
    pub fn stdin_stream(&mut self, stream: ByteStream) -> &mut Self {
        self.stdin = Some(stream);
        self
    }

    fn tool_name(&self) -> String {
        self.program
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| self.program.to_string_lossy().to_string())
    }

    /// Run to completion, capturing stdout and stderr. A non-zero exit is an error.
    pub async fn execute(&mut self) -> Result<ToolOutput, ToolError> {
        let tool = self.tool_name();
        debug!(tool = %tool, args = ?self.args, "running tool");

        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .stdin(if self.stdin.is_some() { Stdio::piped() } else { Stdio::null() })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|source| ToolError::Spawn {
            tool: tool.clone(),
            source,
        })?;

        // Feed stdin concurrently so a chatty child cannot deadlock on a full stdout pipe.
        let feeder = match (self.stdin.take(), child.stdin.take()) {
            (Some(mut stream), Some(mut pipe)) => Some(tokio::spawn(async move {
                while let Some(chunk) = stream.next().await {
                    let Ok(chunk) = chunk else { break };
                    // the child may stop reading early (ffprobe does once it has the headers)
                    if pipe.write_all(&chunk).await.is_err() {
                        break;
                    }
                }
                let _ = pipe.shutdown().await;
            })),
            _ => None,
        };

        let result = tokio::time::timeout(self.timeout, child.wait_with_output()).await;
        if let Some(feeder) = feeder {
            feeder.abort();
        }

        let output = match result {
            Ok(Ok(output)) => output,
            Ok(Err(source)) => return Err(ToolError::Io { tool, source }),
            // the child future was dropped, and kill_on_drop reaps the process
            Err(_) => {
                return Err(ToolError::Timeout {
                    tool,
                    timeout: self.timeout,
                });
            }
        };

        let out = ToolOutput {
            status: output.status,
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        };
        if !out.status.success() {
            return Err(ToolError::Failed {
                tool,
                status: out.status,
                stderr: out.stderr.trim().to_string(),
            });
        }
        Ok(out)
    }
}
