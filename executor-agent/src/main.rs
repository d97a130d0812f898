//! arl executor agent
//!
//! Runs inside the user container and executes commands on behalf of the
//! sidecar. Listens on a Unix socket shared between the two containers and
//! speaks a newline-delimited JSON protocol: each line is one request or one
//! response. Command output is streamed as it is produced.

mod proc;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{mpsc, Mutex};

use crate::proc::ProcessTable;

/// Default socket path; the pod spec mounts the parent directory into both
/// containers.
const DEFAULT_SOCKET: &str = "/var/run/arl/agent.sock";

/// Request types understood by the agent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestType {
    /// Liveness probe
    Ping,
    /// Launch a command and stream its output
    Exec,
    /// Deliver a signal to a tracked process
    Signal,
    /// Start an interactive shell on this connection
    Shell,
    /// Write bytes to a live shell's stdin
    Stdin,
}

/// One request line from the sidecar
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentRequest {
    pub id: String,
    #[serde(rename = "type")]
    pub request_type: RequestType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cmd: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub env: Option<HashMap<String, String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub workdir: Option<String>,
    /// Exec timeout in seconds
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<i32>,
    /// Signal name: SIGTERM, SIGINT or SIGKILL
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signal: Option<String>,
    /// Stdin payload for a live shell
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
}

/// One response line to the sidecar
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
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub done: bool,
}

impl AgentResponse {
    pub fn ack(id: &str) -> Self {
        Self {
            id: id.to_string(),
            done: true,
            ..Default::default()
        }
    }

    pub fn error(id: &str, msg: impl Into<String>) -> Self {
        Self {
            id: id.to_string(),
            error: Some(msg.into()),
            ..Default::default()
        }
    }

    pub fn stdout_chunk(id: &str, data: String) -> Self {
        Self {
            id: id.to_string(),
            stdout: Some(data),
            ..Default::default()
        }
    }

    pub fn stderr_chunk(id: &str, data: String) -> Self {
        Self {
            id: id.to_string(),
            stderr: Some(data),
            ..Default::default()
        }
    }

    pub fn exited(id: &str, exit_code: i32) -> Self {
        Self {
            id: id.to_string(),
            exit_code: Some(exit_code),
            done: true,
            ..Default::default()
        }
    }
}

/// Serialized writer shared by the streaming tasks of one connection. The
/// mutex keeps concurrently produced JSON lines from interleaving.
pub type ResponseWriter = Arc<Mutex<tokio::net::unix::OwnedWriteHalf>>;

pub async fn send_response(writer: &ResponseWriter, response: &AgentResponse) -> Result<()> {
    let mut line = serde_json::to_string(response)?;
    line.push('\n');
    let mut w = writer.lock().await;
    w.write_all(line.as_bytes()).await?;
    Ok(())
}

/// Handle one sidecar connection until it closes.
///
/// Each `exec` and `shell` request owns its own streaming tasks; `stdin`
/// lines are routed to the shell started earlier on this connection by
/// request id. Dropping the stdin senders on disconnect closes the shell's
/// stdin so it exits naturally.
async fn handle_connection(stream: UnixStream, table: Arc<ProcessTable>) -> Result<()> {
    let (reader, writer) = stream.into_split();
    let mut reader = BufReader::new(reader);
    let writer: ResponseWriter = Arc::new(Mutex::new(writer));
    let mut shells: HashMap<String, mpsc::Sender<Vec<u8>>> = HashMap::new();
    let mut line = String::new();

    loop {
        line.clear();
        let n = reader.read_line(&mut line).await?;
        if n == 0 {
            break;
        }
        if line.trim().is_empty() {
            continue;
        }

        let request: AgentRequest = match serde_json::from_str(&line) {
            Ok(r) => r,
            Err(e) => {
                send_response(&writer, &AgentResponse::error("", format!("invalid request: {e}")))
                    .await?;
                continue;
            }
        };

        match request.request_type {
            RequestType::Ping => {
                send_response(&writer, &AgentResponse::ack(&request.id)).await?;
            }
            RequestType::Exec => {
                let Some(cmd) = request.cmd.clone() else {
                    send_response(&writer, &AgentResponse::error(&request.id, "no command"))
                        .await?;
                    continue;
                };
                if cmd.is_empty() {
                    send_response(&writer, &AgentResponse::error(&request.id, "empty command"))
                        .await?;
                    continue;
                }
                let writer = writer.clone();
                let table = table.clone();
                tokio::spawn(async move {
                    proc::run_exec(
                        writer,
                        table,
                        request.id,
                        cmd,
                        request.env.unwrap_or_default(),
                        request.workdir,
                        request.timeout,
                    )
                    .await;
                });
            }
            RequestType::Shell => {
                let stdin_tx = proc::run_shell(
                    writer.clone(),
                    table.clone(),
                    request.id.clone(),
                    request.env.unwrap_or_default(),
                    request.workdir.clone(),
                )
                .await;
                match stdin_tx {
                    Ok(tx) => {
                        shells.insert(request.id, tx);
                    }
                    Err(e) => {
                        send_response(&writer, &AgentResponse::error(&request.id, e.to_string()))
                            .await?;
                    }
                }
            }
            RequestType::Stdin => {
                let Some(data) = request.data else {
                    continue;
                };
                match shells.get(&request.id) {
                    Some(tx) => {
                        // A closed channel means the shell already exited.
                        let _ = tx.send(data.into_bytes()).await;
                    }
                    None => {
                        send_response(
                            &writer,
                            &AgentResponse::error(&request.id, "no shell with this id"),
                        )
                        .await?;
                    }
                }
            }
            RequestType::Signal => {
                let response = match (request.pid, request.signal.as_deref()) {
                    (Some(pid), Some(signal)) => match table.deliver(pid, signal) {
                        Ok(()) => AgentResponse::ack(&request.id),
                        Err(e) => AgentResponse::error(&request.id, e.to_string()),
                    },
                    _ => AgentResponse::error(&request.id, "signal requires pid and signal"),
                };
                send_response(&writer, &response).await?;
            }
        }
    }

    Ok(())
}

async fn run(socket_path: &Path) -> Result<()> {
    if let Some(parent) = socket_path.parent() {
        tokio::fs::create_dir_all(parent).await.ok();
    }
    let _ = tokio::fs::remove_file(socket_path).await;

    let listener = UnixListener::bind(socket_path)
        .with_context(|| format!("failed to bind {}", socket_path.display()))?;
    eprintln!("executor-agent listening on {}", socket_path.display());

    let table = Arc::new(ProcessTable::new());

    loop {
        match listener.accept().await {
            Ok((stream, _)) => {
                let table = table.clone();
                tokio::spawn(async move {
                    if let Err(e) = handle_connection(stream, table).await {
                        eprintln!("connection error: {e}");
                    }
                });
            }
            Err(e) => {
                eprintln!("accept error: {e}");
            }
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let socket = std::env::var("AGENT_SOCKET").unwrap_or_else(|_| DEFAULT_SOCKET.to_string());
    run(Path::new(&socket)).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::{timeout, Duration};

    fn exec_request(id: &str, cmd: &[&str]) -> String {
        let req = AgentRequest {
            id: id.to_string(),
            request_type: RequestType::Exec,
            cmd: Some(cmd.iter().map(|s| s.to_string()).collect()),
            env: None,
            workdir: None,
            timeout: None,
            pid: None,
            signal: None,
            data: None,
        };
        serde_json::to_string(&req).unwrap() + "\n"
    }

    async fn drive(input: Vec<String>) -> Vec<AgentResponse> {
        let (client, server) = UnixStream::pair().unwrap();
        let table = Arc::new(ProcessTable::new());
        tokio::spawn(async move {
            let _ = handle_connection(server, table).await;
        });

        let (read_half, mut write_half) = client.into_split();
        for line in input {
            write_half.write_all(line.as_bytes()).await.unwrap();
        }

        let mut responses = Vec::new();
        let mut reader = BufReader::new(read_half);
        let mut line = String::new();
        loop {
            line.clear();
            let n = timeout(Duration::from_secs(10), reader.read_line(&mut line))
                .await
                .expect("agent response timed out")
                .unwrap();
            if n == 0 {
                break;
            }
            let response: AgentResponse = serde_json::from_str(&line).unwrap();
            let finished = response.done;
            responses.push(response);
            if finished {
                break;
            }
        }
        responses
    }

    #[tokio::test]
    async fn ping_acks() {
        let req = AgentRequest {
            id: "p1".to_string(),
            request_type: RequestType::Ping,
            cmd: None,
            env: None,
            workdir: None,
            timeout: None,
            pid: None,
            signal: None,
            data: None,
        };
        let responses = drive(vec![serde_json::to_string(&req).unwrap() + "\n"]).await;
        assert_eq!(responses.len(), 1);
        assert!(responses[0].done);
        assert_eq!(responses[0].id, "p1");
    }

    #[tokio::test]
    async fn exec_streams_stdout_and_exit() {
        let responses = drive(vec![exec_request("e1", &["echo", "hi"])]).await;
        let stdout: String = responses.iter().filter_map(|r| r.stdout.clone()).collect();
        assert_eq!(stdout, "hi\n");
        let last = responses.last().unwrap();
        assert!(last.done);
        assert_eq!(last.exit_code, Some(0));
    }

    #[tokio::test]
    async fn exec_reports_nonzero_exit() {
        let responses = drive(vec![exec_request("e2", &["sh", "-c", "exit 3"])]).await;
        assert_eq!(responses.last().unwrap().exit_code, Some(3));
    }

    #[tokio::test]
    async fn exec_missing_command_errors() {
        let req = AgentRequest {
            id: "e3".to_string(),
            request_type: RequestType::Exec,
            cmd: None,
            env: None,
            workdir: None,
            timeout: None,
            pid: None,
            signal: None,
            data: None,
        };
        let (client, server) = UnixStream::pair().unwrap();
        let table = Arc::new(ProcessTable::new());
        tokio::spawn(async move {
            let _ = handle_connection(server, table).await;
        });
        let (read_half, mut write_half) = client.into_split();
        write_half
            .write_all((serde_json::to_string(&req).unwrap() + "\n").as_bytes())
            .await
            .unwrap();
        let mut reader = BufReader::new(read_half);
        let mut line = String::new();
        timeout(Duration::from_secs(5), reader.read_line(&mut line))
            .await
            .unwrap()
            .unwrap();
        let response: AgentResponse = serde_json::from_str(&line).unwrap();
        assert!(response.error.is_some());
    }

    #[tokio::test]
    async fn exec_timeout_kills_child() {
        let req = AgentRequest {
            id: "t1".to_string(),
            request_type: RequestType::Exec,
            cmd: Some(vec!["sleep".to_string(), "30".to_string()]),
            env: None,
            workdir: None,
            timeout: Some(1),
            pid: None,
            signal: None,
            data: None,
        };
        let started = std::time::Instant::now();
        let responses = drive(vec![serde_json::to_string(&req).unwrap() + "\n"]).await;
        assert!(started.elapsed() < Duration::from_secs(10));
        let last = responses.last().unwrap();
        assert!(last.done);
        assert_ne!(last.exit_code, Some(0));
    }

    #[tokio::test]
    async fn shell_runs_commands_from_stdin() {
        let shell = AgentRequest {
            id: "s1".to_string(),
            request_type: RequestType::Shell,
            cmd: None,
            env: None,
            workdir: None,
            timeout: None,
            pid: None,
            signal: None,
            data: None,
        };
        let stdin = AgentRequest {
            id: "s1".to_string(),
            request_type: RequestType::Stdin,
            cmd: None,
            env: None,
            workdir: None,
            timeout: None,
            pid: None,
            signal: None,
            data: Some("echo shell-works; exit 0\n".to_string()),
        };
        let responses = drive(vec![
            serde_json::to_string(&shell).unwrap() + "\n",
            serde_json::to_string(&stdin).unwrap() + "\n",
        ])
        .await;
        let stdout: String = responses.iter().filter_map(|r| r.stdout.clone()).collect();
        assert!(stdout.contains("shell-works"));
        assert_eq!(responses.last().unwrap().exit_code, Some(0));
    }
}
