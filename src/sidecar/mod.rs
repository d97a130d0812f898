//! In-pod sidecar: health surface plus the RPC bridge to the executor agent.
//!
//! The sidecar is a protocol bridge only; all user code runs in the user
//! container under the executor agent. Readiness is gated on the agent
//! answering `ping`, so a Sandbox cannot reach Ready before the pod can
//! actually execute steps.

pub mod agent;
pub mod server;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::get;
use axum::Router;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::config::Settings;
use crate::sidecar::agent::AgentClient;

const AGENT_POLL_INTERVAL: Duration = Duration::from_millis(200);

#[derive(Clone)]
struct HealthState {
    ready: Arc<AtomicBool>,
}

fn health_router(ready: Arc<AtomicBool>) -> Router {
    Router::new()
        .route("/health", get(|| async { "ok" }))
        .route("/healthz", get(|| async { "ok" }))
        .route(
            "/readyz",
            get(|State(state): State<HealthState>| async move {
                if state.ready.load(Ordering::Relaxed) {
                    (StatusCode::OK, "ok")
                } else {
                    (StatusCode::SERVICE_UNAVAILABLE, "agent not ready")
                }
            }),
        )
        .with_state(HealthState { ready })
}

pub async fn run(settings: Settings) -> Result<()> {
    let ready = Arc::new(AtomicBool::new(false));
    let shutdown = CancellationToken::new();

    let agent = settings.agent_socket.as_ref().map(AgentClient::new);
    match &agent {
        Some(client) => {
            let client = client.clone();
            let ready = ready.clone();
            let deadline = settings.agent_ready_timeout;
            tokio::spawn(async move {
                match client.wait_ready(deadline, AGENT_POLL_INTERVAL).await {
                    Ok(()) => {
                        info!(socket = %client.socket().display(), "executor agent is ready");
                        ready.store(true, Ordering::Relaxed);
                    }
                    Err(e) => error!(error = %e, "executor agent never answered; staying unready"),
                }
            });
        }
        None => error!("no executor agent socket configured; execution will fail"),
    }

    let health_listener = TcpListener::bind(("0.0.0.0", settings.sidecar_health_port))
        .await
        .context("failed to bind sidecar health port")?;
    let rpc_listener = TcpListener::bind(("0.0.0.0", settings.sidecar_rpc_port))
        .await
        .context("failed to bind sidecar rpc port")?;
    info!(
        health = settings.sidecar_health_port,
        rpc = settings.sidecar_rpc_port,
        "sidecar listening"
    );

    let health_router = health_router(ready);
    let health = tokio::spawn(async move { axum::serve(health_listener, health_router).await });
    let rpc = server::run(rpc_listener, agent, shutdown.clone());

    let signal = shutdown.clone();
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        signal.cancel();
    });

    tokio::select! {
        result = health => result
            .context("health server task failed")?
            .context("health server exited"),
        result = rpc => result,
        _ = shutdown.cancelled() => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::{CommandOutput, RpcFrame, RpcRequest};
    use serde_json::json;
    use std::collections::HashMap;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
    use tokio::net::{TcpStream, UnixListener};
    use tokio::time::timeout;

    /// Minimal scripted agent: acks pings, answers exec with one stdout
    /// chunk and a clean exit.
    async fn fake_agent(listener: UnixListener) {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                return;
            };
            tokio::spawn(async move {
                let (read_half, mut write_half) = stream.into_split();
                let mut reader = BufReader::new(read_half);
                let mut line = String::new();
                while let Ok(n) = reader.read_line(&mut line).await {
                    if n == 0 {
                        return;
                    }
                    let request: serde_json::Value = serde_json::from_str(&line).unwrap();
                    let id = request["id"].as_str().unwrap_or("").to_string();
                    let responses = match request["type"].as_str() {
                        Some("ping") => vec![json!({"id": id, "done": true})],
                        Some("exec") => vec![
                            json!({"id": id, "pid": 41}),
                            json!({"id": id, "stdout": "hi\n"}),
                            json!({"id": id, "exit_code": 0, "done": true}),
                        ],
                        _ => vec![json!({"id": id, "error": "unsupported"})],
                    };
                    for response in responses {
                        let mut out = response.to_string();
                        out.push('\n');
                        write_half.write_all(out.as_bytes()).await.unwrap();
                    }
                    line.clear();
                }
            });
        }
    }

    async fn start_bridge(agent: Option<AgentClient>) -> std::net::SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(server::run(listener, agent, CancellationToken::new()));
        addr
    }

    async fn call(addr: std::net::SocketAddr, request: &RpcRequest) -> Vec<RpcFrame> {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        let mut line = serde_json::to_string(request).unwrap();
        line.push('\n');
        stream.write_all(line.as_bytes()).await.unwrap();

        let mut frames = Vec::new();
        let mut reader = BufReader::new(stream);
        let mut buf = String::new();
        loop {
            buf.clear();
            let n = timeout(Duration::from_secs(5), reader.read_line(&mut buf))
                .await
                .expect("frame timed out")
                .unwrap();
            if n == 0 {
                break;
            }
            let frame: RpcFrame = serde_json::from_str(&buf).unwrap();
            let terminal = frame.done;
            frames.push(frame);
            if terminal {
                break;
            }
        }
        frames
    }

    #[tokio::test]
    async fn execute_streams_agent_output() {
        let dir = tempfile::tempdir().unwrap();
        let socket = dir.path().join("agent.sock");
        let listener = UnixListener::bind(&socket).unwrap();
        tokio::spawn(fake_agent(listener));

        let addr = start_bridge(Some(AgentClient::new(&socket))).await;
        let frames = call(
            addr,
            &RpcRequest::Execute {
                command: vec!["echo".into(), "hi".into()],
                env: HashMap::new(),
                working_dir: None,
                timeout_seconds: None,
            },
        )
        .await;

        let output = CommandOutput::from_frames(frames);
        assert_eq!(output.stdout, "hi\n");
        assert_eq!(output.exit_code, 0);
    }

    #[tokio::test]
    async fn health_check_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let socket = dir.path().join("agent.sock");
        let listener = UnixListener::bind(&socket).unwrap();
        tokio::spawn(fake_agent(listener));

        let addr = start_bridge(Some(AgentClient::new(&socket))).await;
        let frames = call(addr, &RpcRequest::HealthCheck).await;
        assert_eq!(frames.len(), 1);
        assert!(frames[0].done);
        assert!(frames[0].error.is_none());
    }

    #[tokio::test]
    async fn missing_agent_socket_is_an_explicit_error() {
        let addr = start_bridge(None).await;
        let frames = call(
            addr,
            &RpcRequest::Execute {
                command: vec!["true".into()],
                env: HashMap::new(),
                working_dir: None,
                timeout_seconds: None,
            },
        )
        .await;
        assert_eq!(frames.len(), 1);
        assert!(
            frames[0]
                .error
                .as_deref()
                .unwrap()
                .contains("no executor agent socket")
        );
    }

    #[tokio::test]
    async fn unreachable_agent_fails_the_call() {
        let addr = start_bridge(Some(AgentClient::new("/nonexistent/agent.sock"))).await;
        let frames = call(addr, &RpcRequest::HealthCheck).await;
        assert!(frames[0].error.is_some());
    }

    #[tokio::test]
    async fn readyz_flips_with_the_flag() {
        use tower::util::ServiceExt;

        let ready = Arc::new(AtomicBool::new(false));
        let router = health_router(ready.clone());

        let request = axum::http::Request::builder()
            .uri("/readyz")
            .body(axum::body::Body::empty())
            .unwrap();
        let response = router.clone().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);

        ready.store(true, Ordering::Relaxed);
        let request = axum::http::Request::builder()
            .uri("/readyz")
            .body(axum::body::Body::empty())
            .unwrap();
        let response = router.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
}
