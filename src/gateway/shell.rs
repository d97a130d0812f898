//! WebSocket bridge for interactive shells.
//!
//! The HTTP request upgrades to a framed JSON channel; the gateway opens a
//! sidecar `interactive_shell` call and pumps frames both ways. Closing the
//! WebSocket closes the RPC; the RPC's exit frame closes the WebSocket.

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::response::{IntoResponse, Response};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::debug;

use crate::gateway::api::AppState;
use crate::rpc::{Resize, RpcFrame, ShellInbound};

/// Client to server frames.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
enum ClientFrame {
    Input { data: String },
    Signal { signal: String },
    Resize { rows: u16, cols: u16 },
}

/// Server to client frames.
#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
enum ServerFrame {
    Output { data: String },
    Error { data: String },
    Exit { exit_code: i32 },
}

pub async fn ws_handler(
    State(runtime): State<AppState>,
    Path(id): Path<String>,
    ws: WebSocketUpgrade,
) -> Response {
    let session = match runtime.session(&id) {
        Ok(session) => session,
        Err(e) => return e.into_response(),
    };
    ws.on_upgrade(move |socket| async move {
        let meta = session.meta();
        let shell = runtime
            .sidecar()
            .open_shell(&meta.pod_ip, HashMap::new(), Some(meta.work_dir.clone()))
            .await;
        match shell {
            Ok(shell) => bridge(socket, shell).await,
            Err(e) => {
                let mut socket = socket;
                let _ = send_frame(
                    &mut socket,
                    &ServerFrame::Error {
                        data: e.to_string(),
                    },
                )
                .await;
            }
        }
    })
}

async fn send_frame(socket: &mut WebSocket, frame: &ServerFrame) -> Result<(), axum::Error> {
    let text = serde_json::to_string(frame).unwrap_or_default();
    socket.send(Message::Text(text.into())).await
}

async fn bridge(mut socket: WebSocket, mut shell: crate::gateway::sidecar_client::ShellSession) {
    loop {
        tokio::select! {
            message = socket.recv() => {
                let Some(Ok(message)) = message else {
                    // Client went away; dropping the shell closes the RPC.
                    return;
                };
                let Message::Text(text) = message else {
                    continue;
                };
                let frame: ClientFrame = match serde_json::from_str(&text) {
                    Ok(frame) => frame,
                    Err(e) => {
                        debug!(error = %e, "dropping malformed shell frame");
                        continue;
                    }
                };
                let inbound = match frame {
                    ClientFrame::Input { data } => ShellInbound {
                        stdin: Some(data),
                        ..Default::default()
                    },
                    ClientFrame::Signal { signal } => ShellInbound {
                        signal: Some(signal),
                        ..Default::default()
                    },
                    ClientFrame::Resize { rows, cols } => ShellInbound {
                        resize: Some(Resize { rows, cols }),
                        ..Default::default()
                    },
                };
                if shell.inbound.send(inbound).await.is_err() {
                    return;
                }
            }
            frame = shell.frames.recv() => {
                let Some(frame) = frame else {
                    // RPC ended without an exit frame.
                    let _ = send_frame(&mut socket, &ServerFrame::Exit { exit_code: 1 }).await;
                    return;
                };
                if forward_frame(&mut socket, frame).await.is_err() {
                    return;
                }
            }
        }
    }
}

/// Returns Err to stop the bridge (exit frame sent or socket dead).
async fn forward_frame(socket: &mut WebSocket, frame: RpcFrame) -> Result<(), ()> {
    if let Some(data) = frame.stdout {
        send_frame(socket, &ServerFrame::Output { data })
            .await
            .map_err(|_| ())?;
    }
    if let Some(data) = frame.stderr {
        send_frame(socket, &ServerFrame::Error { data })
            .await
            .map_err(|_| ())?;
    }
    if let Some(data) = frame.error {
        send_frame(socket, &ServerFrame::Error { data })
            .await
            .map_err(|_| ())?;
    }
    if frame.done {
        let _ = send_frame(
            socket,
            &ServerFrame::Exit {
                exit_code: frame.exit_code.unwrap_or(1),
            },
        )
        .await;
        return Err(());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_frames_parse_the_wire_format() {
        let input: ClientFrame =
            serde_json::from_str(r#"{"type":"input","data":"ls\n"}"#).unwrap();
        assert!(matches!(input, ClientFrame::Input { data } if data == "ls\n"));

        let signal: ClientFrame =
            serde_json::from_str(r#"{"type":"signal","signal":"SIGINT"}"#).unwrap();
        assert!(matches!(signal, ClientFrame::Signal { signal } if signal == "SIGINT"));

        let resize: ClientFrame =
            serde_json::from_str(r#"{"type":"resize","rows":40,"cols":120}"#).unwrap();
        assert!(matches!(resize, ClientFrame::Resize { rows: 40, cols: 120 }));
    }

    #[test]
    fn server_frames_serialize_the_wire_format() {
        let json = serde_json::to_value(ServerFrame::Output {
            data: "hello".into(),
        })
        .unwrap();
        assert_eq!(json["type"], "output");
        assert_eq!(json["data"], "hello");

        let json = serde_json::to_value(ServerFrame::Exit { exit_code: 0 }).unwrap();
        assert_eq!(json["type"], "exit");
        assert_eq!(json["exit_code"], 0);
    }
}
