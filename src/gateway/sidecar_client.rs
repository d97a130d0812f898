//! Sidecar capability set seen by the gateway.
//!
//! One implementation speaks the line-JSON RPC to the pod's sidecar; the
//! mock is scripted for tests. The runtime only ever sees the trait.

use async_trait::async_trait;
use std::collections::HashMap;
use std::time::Instant;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::{timeout, Duration};

use crate::error::{Error, Result};
use crate::metrics::SIDECAR_CALL_DURATION;
use crate::rpc::{CommandOutput, RpcFrame, RpcRequest, ShellInbound};

/// Everything needed to run one command in a pod.
#[derive(Debug, Clone)]
pub struct ExecSpec {
    pub command: Vec<String>,
    pub env: HashMap<String, String>,
    pub working_dir: Option<String>,
    pub timeout_seconds: Option<u64>,
}

/// A live interactive shell: frames out, stdin/signals in. Dropping the
/// session closes the underlying RPC connection.
pub struct ShellSession {
    pub inbound: mpsc::Sender<ShellInbound>,
    pub frames: mpsc::Receiver<RpcFrame>,
}

#[async_trait]
pub trait SidecarClient: Send + Sync {
    /// Run one command, aggregating the streamed frames.
    async fn execute(&self, pod_ip: &str, spec: ExecSpec) -> Result<CommandOutput>;
    /// Open a bidirectional shell.
    async fn open_shell(
        &self,
        pod_ip: &str,
        env: HashMap<String, String>,
        working_dir: Option<String>,
    ) -> Result<ShellSession>;
    /// Probe the sidecar-to-agent path.
    async fn health_check(&self, pod_ip: &str) -> Result<()>;
}

/// Production client: newline-delimited JSON over TCP to `pod_ip:port`.
pub struct TcpSidecarClient {
    port: u16,
    connect_timeout: Duration,
}

impl TcpSidecarClient {
    pub fn new(port: u16, connect_timeout: Duration) -> Self {
        Self {
            port,
            connect_timeout,
        }
    }

    async fn connect(&self, pod_ip: &str) -> Result<TcpStream> {
        let addr = format!("{pod_ip}:{}", self.port);
        timeout(self.connect_timeout, TcpStream::connect(&addr))
            .await
            .map_err(|_| Error::Timeout(format!("connecting to sidecar {addr}")))?
            .map_err(|e| Error::Upstream(format!("sidecar {addr}: {e}")))
    }

    async fn open(&self, pod_ip: &str, request: &RpcRequest) -> Result<TcpStream> {
        let mut stream = self.connect(pod_ip).await?;
        let mut line = serde_json::to_string(request)?;
        line.push('\n');
        stream
            .write_all(line.as_bytes())
            .await
            .map_err(|e| Error::Upstream(format!("sidecar write: {e}")))?;
        Ok(stream)
    }
}

#[async_trait]
impl SidecarClient for TcpSidecarClient {
    async fn execute(&self, pod_ip: &str, spec: ExecSpec) -> Result<CommandOutput> {
        let started = Instant::now();
        let request = RpcRequest::Execute {
            command: spec.command,
            env: spec.env,
            working_dir: spec.working_dir,
            timeout_seconds: spec.timeout_seconds,
        };
        let stream = self.open(pod_ip, &request).await?;

        // Streaming call: the frame stream inherits the caller's deadline
        // rather than the per-call timeout.
        let mut reader = BufReader::new(stream);
        let mut line = String::new();
        let mut output = CommandOutput::default();
        loop {
            line.clear();
            let n = reader
                .read_line(&mut line)
                .await
                .map_err(|e| Error::Upstream(format!("sidecar read: {e}")))?;
            if n == 0 {
                return Err(Error::Upstream(
                    "sidecar closed the stream before the exit frame".to_string(),
                ));
            }
            let frame: RpcFrame = serde_json::from_str(&line)?;
            output.absorb(&frame);
            if frame.done {
                break;
            }
        }
        metrics::histogram!(SIDECAR_CALL_DURATION, "method" => "execute")
            .record(started.elapsed().as_secs_f64());
        Ok(output)
    }

    async fn open_shell(
        &self,
        pod_ip: &str,
        env: HashMap<String, String>,
        working_dir: Option<String>,
    ) -> Result<ShellSession> {
        let request = RpcRequest::InteractiveShell { env, working_dir };
        let stream = self.open(pod_ip, &request).await?;
        let (read_half, mut write_half) = stream.into_split();

        let (inbound_tx, mut inbound_rx) = mpsc::channel::<ShellInbound>(64);
        let (frame_tx, frame_rx) = mpsc::channel::<RpcFrame>(64);

        tokio::spawn(async move {
            while let Some(frame) = inbound_rx.recv().await {
                let Ok(mut line) = serde_json::to_string(&frame) else {
                    continue;
                };
                line.push('\n');
                if write_half.write_all(line.as_bytes()).await.is_err() {
                    break;
                }
            }
            // Sender dropped: half-close so the sidecar tears the shell down.
        });

        tokio::spawn(async move {
            let mut reader = BufReader::new(read_half);
            let mut line = String::new();
            loop {
                line.clear();
                match reader.read_line(&mut line).await {
                    Ok(0) | Err(_) => break,
                    Ok(_) => {}
                }
                let Ok(frame) = serde_json::from_str::<RpcFrame>(&line) else {
                    continue;
                };
                let terminal = frame.done;
                if frame_tx.send(frame).await.is_err() || terminal {
                    break;
                }
            }
        });

        Ok(ShellSession {
            inbound: inbound_tx,
            frames: frame_rx,
        })
    }

    async fn health_check(&self, pod_ip: &str) -> Result<()> {
        let started = Instant::now();
        let stream = self.open(pod_ip, &RpcRequest::HealthCheck).await?;
        let mut reader = BufReader::new(stream);
        let mut line = String::new();
        timeout(self.connect_timeout, reader.read_line(&mut line))
            .await
            .map_err(|_| Error::Timeout(format!("sidecar health check on {pod_ip}")))?
            .map_err(|e| Error::Upstream(format!("sidecar read: {e}")))?;
        let frame: RpcFrame = serde_json::from_str(&line)?;
        metrics::histogram!(SIDECAR_CALL_DURATION, "method" => "health_check")
            .record(started.elapsed().as_secs_f64());
        match frame.error {
            Some(message) => Err(Error::Upstream(message)),
            None => Ok(()),
        }
    }
}
