//! Unix-socket client for the executor agent.
//!
//! The wire protocol is newline-delimited JSON, one request or response per
//! line. The request/response structs are mirrored in the `executor-agent`
//! crate, which stays dependency-minimal so it can be baked into arbitrary
//! user images.

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::UnixStream;
use tokio::time::{sleep, timeout, Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentRequestType {
    Ping,
    Exec,
    Signal,
    Shell,
    Stdin,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentRequest {
    pub id: String,
    #[serde(rename = "type")]
    pub request_type: AgentRequestType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cmd: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub env: Option<HashMap<String, String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub workdir: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signal: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
}

impl AgentRequest {
    pub fn ping(id: impl Into<String>) -> Self {
        Self::bare(id, AgentRequestType::Ping)
    }

    pub fn exec(
        id: impl Into<String>,
        cmd: Vec<String>,
        env: HashMap<String, String>,
        workdir: Option<String>,
        timeout: Option<u64>,
    ) -> Self {
        Self {
            cmd: Some(cmd),
            env: Some(env),
            workdir,
            timeout,
            ..Self::bare(id, AgentRequestType::Exec)
        }
    }

    pub fn shell(
        id: impl Into<String>,
        env: HashMap<String, String>,
        workdir: Option<String>,
    ) -> Self {
        Self {
            env: Some(env),
            workdir,
            ..Self::bare(id, AgentRequestType::Shell)
        }
    }

    pub fn stdin(id: impl Into<String>, data: String) -> Self {
        Self {
            data: Some(data),
            ..Self::bare(id, AgentRequestType::Stdin)
        }
    }

    pub fn signal(id: impl Into<String>, pid: i32, signal: String) -> Self {
        Self {
            pid: Some(pid),
            signal: Some(signal),
            ..Self::bare(id, AgentRequestType::Signal)
        }
    }

    fn bare(id: impl Into<String>, request_type: AgentRequestType) -> Self {
        Self {
            id: id.into(),
            request_type,
            cmd: None,
            env: None,
            workdir: None,
            timeout: None,
            pid: None,
            signal: None,
            data: None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentResponse {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stdout: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stderr: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub done: bool,
}

/// Factory for per-call connections; every exec and shell owns its own.
#[derive(Debug, Clone)]
pub struct AgentClient {
    socket: PathBuf,
}

impl AgentClient {
    pub fn new(socket: impl Into<PathBuf>) -> Self {
        Self {
            socket: socket.into(),
        }
    }

    pub fn socket(&self) -> &Path {
        &self.socket
    }

    pub async fn connect(&self) -> Result<AgentConnection> {
        let stream = UnixStream::connect(&self.socket)
            .await
            .with_context(|| format!("executor agent unreachable at {}", self.socket.display()))?;
        let (read_half, write_half) = stream.into_split();
        Ok(AgentConnection {
            reader: AgentReader {
                inner: BufReader::new(read_half),
                line: String::new(),
            },
            writer: AgentWriter { inner: write_half },
        })
    }

    /// One ping round-trip with a short deadline.
    pub async fn ping(&self) -> Result<()> {
        let mut conn = self.connect().await?;
        conn.writer.send(&AgentRequest::ping("ping")).await?;
        let response = timeout(Duration::from_secs(2), conn.reader.next())
            .await
            .context("agent ping timed out")??;
        match response {
            Some(r) if r.done => Ok(()),
            Some(r) => bail!("unexpected ping response: {r:?}"),
            None => bail!("agent closed the connection"),
        }
    }

    /// Poll `ping` until the agent answers or the deadline passes. The
    /// sidecar readiness probe reports ready only after this succeeds.
    pub async fn wait_ready(&self, deadline: Duration, interval: Duration) -> Result<()> {
        let until = Instant::now() + deadline;
        loop {
            match self.ping().await {
                Ok(()) => return Ok(()),
                Err(e) if Instant::now() >= until => {
                    return Err(e.context("executor agent never became ready"));
                }
                Err(_) => sleep(interval).await,
            }
        }
    }
}

#[derive(Debug)]
pub struct AgentConnection {
    pub reader: AgentReader,
    pub writer: AgentWriter,
}

impl AgentConnection {
    pub fn into_split(self) -> (AgentReader, AgentWriter) {
        (self.reader, self.writer)
    }
}

#[derive(Debug)]
pub struct AgentReader {
    inner: BufReader<OwnedReadHalf>,
    line: String,
}

impl AgentReader {
    /// Next response line; `None` on a cleanly closed connection.
    pub async fn next(&mut self) -> Result<Option<AgentResponse>> {
        loop {
            self.line.clear();
            let n = self.inner.read_line(&mut self.line).await?;
            if n == 0 {
                return Ok(None);
            }
            if self.line.trim().is_empty() {
                continue;
            }
            let response: AgentResponse = serde_json::from_str(&self.line)
                .with_context(|| format!("malformed agent response: {}", self.line.trim()))?;
            return Ok(Some(response));
        }
    }
}

#[derive(Debug)]
pub struct AgentWriter {
    inner: OwnedWriteHalf,
}

impl AgentWriter {
    pub async fn send(&mut self, request: &AgentRequest) -> Result<()> {
        let mut line = serde_json::to_string(request)?;
        line.push('\n');
        self.inner.write_all(line.as_bytes()).await?;
        Ok(())
    }
}
