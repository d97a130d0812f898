//! Sidecar RPC wire format.
//!
//! The gateway and the sidecar speak newline-delimited JSON over TCP: one
//! request line opens a call, then the sidecar streams response frames until
//! the terminal `done` frame. The `interactive_shell` method is
//! bidirectional: after the request line the client keeps writing inbound
//! frames (stdin, signal, resize) on the same connection.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// One request line from the gateway.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "snake_case")]
pub enum RpcRequest {
    /// Launch a command and stream its output (server-streaming)
    Execute {
        command: Vec<String>,
        #[serde(default, skip_serializing_if = "HashMap::is_empty")]
        env: HashMap<String, String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        working_dir: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timeout_seconds: Option<u64>,
    },
    /// Start an interactive shell (bidirectional streaming)
    InteractiveShell {
        #[serde(default, skip_serializing_if = "HashMap::is_empty")]
        env: HashMap<String, String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        working_dir: Option<String>,
    },
    /// Liveness of the sidecar-to-agent path
    HealthCheck,
}

/// One streamed response frame from the sidecar.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RpcFrame {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stdout: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stderr: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub done: bool,
}

impl RpcFrame {
    pub fn stdout(data: String) -> Self {
        Self {
            stdout: Some(data),
            ..Default::default()
        }
    }

    pub fn stderr(data: String) -> Self {
        Self {
            stderr: Some(data),
            ..Default::default()
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            error: Some(message.into()),
            done: true,
            ..Default::default()
        }
    }

    pub fn exit(exit_code: i32) -> Self {
        Self {
            exit_code: Some(exit_code),
            done: true,
            ..Default::default()
        }
    }

    pub fn ok() -> Self {
        Self {
            done: true,
            ..Default::default()
        }
    }
}

/// Inbound frames of a live shell call.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ShellInbound {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stdin: Option<String>,
    /// SIGTERM, SIGINT or SIGKILL
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signal: Option<String>,
    /// Window size; dropped by the sidecar (the executor shell is pipe-backed)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resize: Option<Resize>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Resize {
    pub rows: u16,
    pub cols: u16,
}

/// Aggregated result of one executed command.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

impl CommandOutput {
    /// Fold a stream of frames into the final output. An `error` frame
    /// surfaces on stderr with exit code 1, matching the per-step error
    /// contract.
    pub fn from_frames(frames: impl IntoIterator<Item = RpcFrame>) -> Self {
        let mut output = CommandOutput::default();
        for frame in frames {
            output.absorb(&frame);
        }
        output
    }

    pub fn absorb(&mut self, frame: &RpcFrame) {
        if let Some(data) = &frame.stdout {
            self.stdout.push_str(data);
        }
        if let Some(data) = &frame.stderr {
            self.stderr.push_str(data);
        }
        if let Some(message) = &frame.error {
            self.stderr.push_str(message);
            self.exit_code = 1;
        }
        if let Some(code) = frame.exit_code {
            self.exit_code = code;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_lines_round_trip() {
        let request = RpcRequest::Execute {
            command: vec!["echo".into(), "hi".into()],
            env: HashMap::new(),
            working_dir: Some("/workspace".into()),
            timeout_seconds: Some(30),
        };
        let line = serde_json::to_string(&request).unwrap();
        assert!(line.contains("\"method\":\"execute\""));
        let parsed: RpcRequest = serde_json::from_str(&line).unwrap();
        match parsed {
            RpcRequest::Execute { command, .. } => assert_eq!(command, ["echo", "hi"]),
            other => panic!("unexpected request: {other:?}"),
        }
    }

    #[test]
    fn health_check_is_bare() {
        let line = serde_json::to_string(&RpcRequest::HealthCheck).unwrap();
        assert_eq!(line, "{\"method\":\"health_check\"}");
    }

    #[test]
    fn frames_fold_in_order() {
        let output = CommandOutput::from_frames([
            RpcFrame::stdout("a".into()),
            RpcFrame::stderr("warn".into()),
            RpcFrame::stdout("b\n".into()),
            RpcFrame::exit(0),
        ]);
        assert_eq!(output.stdout, "ab\n");
        assert_eq!(output.stderr, "warn");
        assert_eq!(output.exit_code, 0);
    }

    #[test]
    fn error_frame_becomes_stderr_and_nonzero_exit() {
        let output = CommandOutput::from_frames([RpcFrame::error("agent unreachable")]);
        assert_eq!(output.exit_code, 1);
        assert!(output.stderr.contains("agent unreachable"));
    }
}
