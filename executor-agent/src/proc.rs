//! Process launching and tracking.
//!
//! Every exec and shell owns a dedicated child process group so that a
//! timeout or signal reaches the whole tree, not just the direct child.

use anyhow::{bail, Result};
use std::collections::HashMap;
use std::collections::HashSet;
use std::os::unix::process::ExitStatusExt;
use std::process::Stdio;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio::time::Duration;

use crate::{send_response, AgentResponse, ResponseWriter};

const STREAM_BUF: usize = 8192;

/// In-memory table of live children, keyed by pid. Signals are only
/// delivered to pids present here.
pub struct ProcessTable {
    pids: StdMutex<HashSet<i32>>,
}

impl ProcessTable {
    pub fn new() -> Self {
        Self {
            pids: StdMutex::new(HashSet::new()),
        }
    }

    pub fn track(&self, pid: i32) {
        self.pids.lock().unwrap().insert(pid);
    }

    pub fn untrack(&self, pid: i32) {
        self.pids.lock().unwrap().remove(&pid);
    }

    pub fn contains(&self, pid: i32) -> bool {
        self.pids.lock().unwrap().contains(&pid)
    }

    /// Send a named signal to a tracked process.
    pub fn deliver(&self, pid: i32, signal: &str) -> Result<()> {
        let signo = match signal {
            "SIGTERM" => libc::SIGTERM,
            "SIGINT" => libc::SIGINT,
            "SIGKILL" => libc::SIGKILL,
            other => bail!("unsupported signal: {other}"),
        };
        if !self.contains(pid) {
            bail!("pid {pid} is not tracked");
        }
        let rc = unsafe { libc::kill(pid, signo) };
        if rc != 0 {
            bail!("kill({pid}, {signal}) failed: {}", std::io::Error::last_os_error());
        }
        Ok(())
    }
}

fn build_command(
    program: &str,
    args: &[String],
    env: &HashMap<String, String>,
    workdir: Option<&str>,
) -> Command {
    let mut cmd = Command::new(program);
    cmd.args(args);
    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::piped());
    cmd.process_group(0);
    if let Some(dir) = workdir {
        cmd.current_dir(dir);
    }
    for (key, value) in env {
        cmd.env(key, value);
    }
    cmd
}

fn kill_group(pid: i32) {
    unsafe {
        libc::kill(-pid, libc::SIGKILL);
    }
}

fn exit_code(status: std::process::ExitStatus) -> i32 {
    status.code().unwrap_or_else(|| 128 + status.signal().unwrap_or(1))
}

/// Pump one output pipe into response chunks until EOF.
async fn stream_pipe<R>(
    mut pipe: R,
    writer: ResponseWriter,
    id: String,
    stderr: bool,
) where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut buf = [0u8; STREAM_BUF];
    loop {
        match pipe.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                let data = String::from_utf8_lossy(&buf[..n]).to_string();
                let response = if stderr {
                    AgentResponse::stderr_chunk(&id, data)
                } else {
                    AgentResponse::stdout_chunk(&id, data)
                };
                if send_response(&writer, &response).await.is_err() {
                    break;
                }
            }
        }
    }
}

/// Wait for the child, killing its process group if a timeout is set and
/// expires first. Either way the child's final status is reported.
async fn wait_with_timeout(child: &mut Child, pid: i32, timeout: Option<u64>) -> i32 {
    match timeout {
        Some(secs) if secs > 0 => {
            tokio::select! {
                status = child.wait() => status.map(exit_code).unwrap_or(1),
                _ = tokio::time::sleep(Duration::from_secs(secs)) => {
                    kill_group(pid);
                    child.wait().await.map(exit_code).unwrap_or(1)
                }
            }
        }
        _ => child.wait().await.map(exit_code).unwrap_or(1),
    }
}

/// Launch a command and stream its output frames, then the terminal
/// `{exit_code, done}` frame.
pub async fn run_exec(
    writer: ResponseWriter,
    table: Arc<ProcessTable>,
    id: String,
    cmd: Vec<String>,
    env: HashMap<String, String>,
    workdir: Option<String>,
    timeout: Option<u64>,
) {
    let mut child = match build_command(&cmd[0], &cmd[1..], &env, workdir.as_deref())
        .stdin(Stdio::null())
        .spawn()
    {
        Ok(child) => child,
        Err(e) => {
            let _ = send_response(
                &writer,
                &AgentResponse::error(&id, format!("failed to launch {}: {e}", cmd[0])),
            )
            .await;
            let _ = send_response(&writer, &AgentResponse::exited(&id, 127)).await;
            return;
        }
    };

    let pid = child.id().map(|p| p as i32).unwrap_or(-1);
    table.track(pid);
    let _ = send_response(
        &writer,
        &AgentResponse {
            id: id.clone(),
            pid: Some(pid),
            ..Default::default()
        },
    )
    .await;

    let stdout = child.stdout.take().expect("stdout piped");
    let stderr = child.stderr.take().expect("stderr piped");
    let out_task = tokio::spawn(stream_pipe(stdout, writer.clone(), id.clone(), false));
    let err_task = tokio::spawn(stream_pipe(stderr, writer.clone(), id.clone(), true));

    let code = wait_with_timeout(&mut child, pid, timeout).await;
    let _ = out_task.await;
    let _ = err_task.await;
    table.untrack(pid);
    let _ = send_response(&writer, &AgentResponse::exited(&id, code)).await;
}

/// Start an interactive shell and return the sender feeding its stdin.
///
/// The shell is `/bin/bash` when present, `/bin/sh` otherwise. Dropping the
/// returned sender closes stdin, letting the shell exit on its own.
pub async fn run_shell(
    writer: ResponseWriter,
    table: Arc<ProcessTable>,
    id: String,
    env: HashMap<String, String>,
    workdir: Option<String>,
) -> Result<mpsc::Sender<Vec<u8>>> {
    let shell = if std::path::Path::new("/bin/bash").exists() {
        "/bin/bash"
    } else {
        "/bin/sh"
    };

    let mut child = build_command(shell, &[], &env, workdir.as_deref())
        .stdin(Stdio::piped())
        .spawn()?;

    let pid = child.id().map(|p| p as i32).unwrap_or(-1);
    table.track(pid);
    let _ = send_response(
        &writer,
        &AgentResponse {
            id: id.clone(),
            pid: Some(pid),
            ..Default::default()
        },
    )
    .await;

    let mut stdin = child.stdin.take().expect("stdin piped");
    let (tx, mut rx) = mpsc::channel::<Vec<u8>>(64);
    tokio::spawn(async move {
        while let Some(data) = rx.recv().await {
            if stdin.write_all(&data).await.is_err() {
                break;
            }
            if stdin.flush().await.is_err() {
                break;
            }
        }
        // Sender dropped or write failed; closing stdin ends the shell.
        drop(stdin);
    });

    let stdout = child.stdout.take().expect("stdout piped");
    let stderr = child.stderr.take().expect("stderr piped");
    let out_task = tokio::spawn(stream_pipe(stdout, writer.clone(), id.clone(), false));
    let err_task = tokio::spawn(stream_pipe(stderr, writer.clone(), id.clone(), true));

    tokio::spawn(async move {
        let code = child.wait().await.map(exit_code).unwrap_or(1);
        let _ = out_task.await;
        let _ = err_task.await;
        table.untrack(pid);
        let _ = send_response(&writer, &AgentResponse::exited(&id, code)).await;
    });

    Ok(tx)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_tracks_and_untracks() {
        let table = ProcessTable::new();
        table.track(42);
        assert!(table.contains(42));
        table.untrack(42);
        assert!(!table.contains(42));
    }

    #[test]
    fn deliver_rejects_unknown_pid() {
        let table = ProcessTable::new();
        assert!(table.deliver(999_999, "SIGTERM").is_err());
    }

    #[test]
    fn deliver_rejects_unknown_signal() {
        let table = ProcessTable::new();
        table.track(1);
        assert!(table.deliver(1, "SIGSTOP").is_err());
    }

    #[test]
    fn exit_code_prefers_status_code() {
        let status = std::process::Command::new("sh")
            .args(["-c", "exit 7"])
            .status()
            .unwrap();
        assert_eq!(exit_code(status), 7);
    }
}
