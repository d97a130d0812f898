//! RPC server bridging the gateway to the executor agent.
//!
//! The sidecar never executes commands itself. Each call opens a fresh
//! agent connection and forwards response lines as RPC frames; the shell
//! method additionally pumps inbound stdin/signal frames the other way.

use anyhow::Result;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::rpc::{RpcFrame, RpcRequest, ShellInbound};
use crate::sidecar::agent::{AgentClient, AgentRequest, AgentResponse};

pub async fn run(
    listener: TcpListener,
    agent: Option<AgentClient>,
    shutdown: CancellationToken,
) -> Result<()> {
    let agent = Arc::new(agent);
    loop {
        let accepted = tokio::select! {
            accepted = listener.accept() => accepted,
            _ = shutdown.cancelled() => return Ok(()),
        };
        match accepted {
            Ok((stream, peer)) => {
                debug!(%peer, "rpc connection accepted");
                let agent = agent.clone();
                tokio::spawn(async move {
                    if let Err(e) = handle_connection(stream, agent).await {
                        warn!(error = %e, "rpc connection failed");
                    }
                });
            }
            Err(e) => warn!(error = %e, "rpc accept failed"),
        }
    }
}

async fn write_frame(writer: &mut OwnedWriteHalf, frame: &RpcFrame) -> Result<()> {
    let mut line = serde_json::to_string(frame)?;
    line.push('\n');
    writer.write_all(line.as_bytes()).await?;
    Ok(())
}

async fn handle_connection(stream: TcpStream, agent: Arc<Option<AgentClient>>) -> Result<()> {
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);
    let mut line = String::new();

    let n = reader.read_line(&mut line).await?;
    if n == 0 {
        return Ok(());
    }
    let request: RpcRequest = match serde_json::from_str(&line) {
        Ok(r) => r,
        Err(e) => {
            write_frame(&mut write_half, &RpcFrame::error(format!("invalid request: {e}")))
                .await?;
            return Ok(());
        }
    };

    let Some(agent) = &*agent else {
        write_frame(
            &mut write_half,
            &RpcFrame::error("sidecar has no executor agent socket configured"),
        )
        .await?;
        return Ok(());
    };

    match request {
        RpcRequest::HealthCheck => {
            let frame = match agent.ping().await {
                Ok(()) => RpcFrame::ok(),
                Err(e) => RpcFrame::error(e.to_string()),
            };
            write_frame(&mut write_half, &frame).await?;
        }
        RpcRequest::Execute {
            command,
            env,
            working_dir,
            timeout_seconds,
        } => {
            execute(agent, &mut write_half, command, env, working_dir, timeout_seconds).await?;
        }
        RpcRequest::InteractiveShell { env, working_dir } => {
            interactive_shell(agent, reader, write_half, env, working_dir).await?;
        }
    }

    Ok(())
}

/// Server-streaming exec: one agent connection, every agent line becomes a
/// frame, terminated by the `exit` frame. A vanished agent turns into a
/// deterministic error tail rather than a hung stream.
async fn execute(
    agent: &AgentClient,
    writer: &mut OwnedWriteHalf,
    command: Vec<String>,
    env: HashMap<String, String>,
    working_dir: Option<String>,
    timeout_seconds: Option<u64>,
) -> Result<()> {
    let mut conn = match agent.connect().await {
        Ok(conn) => conn,
        Err(e) => {
            write_frame(writer, &RpcFrame::error(e.to_string())).await?;
            return Ok(());
        }
    };

    let id = uuid::Uuid::new_v4().to_string();
    let request = AgentRequest::exec(&id, command, env, working_dir, timeout_seconds);
    if let Err(e) = conn.writer.send(&request).await {
        write_frame(writer, &RpcFrame::error(e.to_string())).await?;
        return Ok(());
    }

    loop {
        match conn.reader.next().await {
            Ok(Some(response)) => {
                if let Some(frame) = frame_from_agent(&response) {
                    let terminal = frame.done;
                    write_frame(writer, &frame).await?;
                    if terminal {
                        return Ok(());
                    }
                }
            }
            Ok(None) | Err(_) => {
                // Agent died mid-stream.
                write_frame(
                    writer,
                    &RpcFrame {
                        stderr: Some("executor agent connection closed mid-stream".to_string()),
                        exit_code: Some(1),
                        done: true,
                        ..Default::default()
                    },
                )
                .await?;
                return Ok(());
            }
        }
    }
}

/// Map one agent response line to an RPC frame; pid-only acknowledgements
/// produce nothing.
fn frame_from_agent(response: &AgentResponse) -> Option<RpcFrame> {
    if response.done {
        return Some(RpcFrame::exit(response.exit_code.unwrap_or(1)));
    }
    if let Some(message) = &response.error {
        return Some(RpcFrame::stderr(message.clone()));
    }
    if let Some(data) = &response.stdout {
        return Some(RpcFrame::stdout(data.clone()));
    }
    if let Some(data) = &response.stderr {
        return Some(RpcFrame::stderr(data.clone()));
    }
    None
}

/// Bidirectional shell: inbound frames become stdin/signal messages, agent
/// output becomes outbound frames. Closing either side tears down the other.
async fn interactive_shell(
    agent: &AgentClient,
    mut inbound: BufReader<tokio::net::tcp::OwnedReadHalf>,
    mut writer: OwnedWriteHalf,
    env: HashMap<String, String>,
    working_dir: Option<String>,
) -> Result<()> {
    let conn = match agent.connect().await {
        Ok(conn) => conn,
        Err(e) => {
            write_frame(&mut writer, &RpcFrame::error(e.to_string())).await?;
            return Ok(());
        }
    };
    let (mut agent_reader, mut agent_writer) = conn.into_split();

    let id = uuid::Uuid::new_v4().to_string();
    if let Err(e) = agent_writer
        .send(&AgentRequest::shell(&id, env, working_dir))
        .await
    {
        write_frame(&mut writer, &RpcFrame::error(e.to_string())).await?;
        return Ok(());
    }

    // The shell pid arrives on the first agent response; signals sent before
    // that are dropped.
    let (pid_tx, pid_rx) = watch::channel::<Option<i32>>(None);

    let shell_id = id.clone();
    let inbound_task = tokio::spawn(async move {
        let mut line = String::new();
        loop {
            line.clear();
            match inbound.read_line(&mut line).await {
                Ok(0) | Err(_) => break,
                Ok(_) => {}
            }
            if line.trim().is_empty() {
                continue;
            }
            let frame: ShellInbound = match serde_json::from_str(&line) {
                Ok(f) => f,
                Err(e) => {
                    debug!(error = %e, "dropping malformed shell frame");
                    continue;
                }
            };
            if let Some(data) = frame.stdin {
                if agent_writer
                    .send(&AgentRequest::stdin(&shell_id, data))
                    .await
                    .is_err()
                {
                    break;
                }
            }
            if let Some(signal) = frame.signal {
                let pid = *pid_rx.borrow();
                match pid {
                    Some(pid) => {
                        if agent_writer
                            .send(&AgentRequest::signal(&shell_id, pid, signal))
                            .await
                            .is_err()
                        {
                            break;
                        }
                    }
                    None => debug!("dropping signal, shell pid not known yet"),
                }
            }
            // resize frames are dropped: the executor shell has no PTY.
        }
        // Dropping agent_writer half-closes the socket; the agent closes the
        // shell's stdin and lets it exit naturally.
    });

    loop {
        match agent_reader.next().await {
            Ok(Some(response)) => {
                if let Some(pid) = response.pid {
                    let _ = pid_tx.send(Some(pid));
                }
                if let Some(frame) = frame_from_agent(&response) {
                    let terminal = frame.done;
                    if write_frame(&mut writer, &frame).await.is_err() {
                        break;
                    }
                    if terminal {
                        break;
                    }
                }
            }
            Ok(None) | Err(_) => {
                let _ = write_frame(
                    &mut writer,
                    &RpcFrame {
                        stderr: Some("executor agent connection closed mid-stream".to_string()),
                        exit_code: Some(1),
                        done: true,
                        ..Default::default()
                    },
                )
                .await;
                break;
            }
        }
    }

    inbound_task.abort();
    Ok(())
}
