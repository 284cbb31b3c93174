//! Agent subprocess lifecycle: discovery, spawn, line-framed stdio, and
//! graceful-then-forceful termination.
//!
//! Grounded on the teacher's `StdioTransport` (newline-delimited JSON over
//! piped stdio, background reader/writer tasks), generalized with the
//! behaviors the bridge needs that the teacher's MCP transport did not:
//! binary discovery across a fixed search path, a SIGTERM-then-SIGKILL grace
//! window instead of fire-and-forget SIGTERM, and [`SubprocessHandle::kill`]
//! as an explicit operation rather than only a `Drop` side effect.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, Mutex};

use crate::error::{BridgeError, Result};
use crate::subprocess::stderr;

/// Grace period between SIGTERM and SIGKILL when tearing down a subprocess.
pub const TERMINATE_GRACE: Duration = Duration::from_secs(5);

/// Fixed search path for the agent binary, tried before falling back to
/// `PATH`. Mirrors common install locations for locally-installed CLI tools.
const BINARY_SEARCH_PATH: &[&str] = &[
    "/usr/local/bin/agent",
    "/opt/homebrew/bin/agent",
    "/usr/bin/agent",
];

/// Locate the agent binary: the fixed search path first, then `PATH` via
/// `which`-equivalent lookup through `std::env::var("PATH")`.
pub fn discover_binary() -> Result<PathBuf> {
    for candidate in BINARY_SEARCH_PATH {
        let path = PathBuf::from(candidate);
        if path.is_file() {
            return Ok(path);
        }
    }
    if let Ok(path_var) = std::env::var("PATH") {
        for dir in std::env::split_paths(&path_var) {
            let candidate = dir.join("agent");
            if candidate.is_file() {
                return Ok(candidate);
            }
        }
    }
    Err(BridgeError::Transport("agent binary not found in search path or PATH".to_string()).into())
}

/// A line-framed connection to a live agent subprocess.
///
/// Holds no session identity of its own; the dispatcher keys its process
/// table by session id and re-keys it on migration ([`crate::dispatcher`]).
pub struct SubprocessHandle {
    stdin_tx: mpsc::UnboundedSender<String>,
    child: Arc<Mutex<Child>>,
}

/// Lines produced by a spawned subprocess, split by source pipe.
pub struct SubprocessLines {
    /// One JSON-RPC line per stdout line, newline stripped.
    pub stdout_rx: mpsc::UnboundedReceiver<String>,
    /// Stderr lines, classified by [`crate::subprocess::stderr::classify`]
    /// before being handed to the caller for logging or fatal-pattern
    /// handling.
    pub stderr_rx: mpsc::UnboundedReceiver<String>,
}

impl SubprocessHandle {
    /// Spawn the agent binary with `["acp", "--print-logs"]` plus an
    /// optional `--cwd`/`--model`, and wire up its stdio pipes.
    ///
    /// Returns the handle (used to write outbound lines and to terminate
    /// the process) alongside the stdout/stderr line streams.
    pub fn spawn(binary: &PathBuf, cwd: Option<&str>, model: Option<&str>) -> Result<(Self, SubprocessLines)> {
        let mut args = vec!["acp".to_string(), "--print-logs".to_string()];
        if let Some(cwd) = cwd {
            args.push("--cwd".to_string());
            args.push(cwd.to_string());
        }
        if let Some(model) = model {
            args.push("--model".to_string());
            args.push(model.to_string());
        }

        let mut cmd = Command::new(binary);
        cmd.args(&args);
        cmd.stdin(Stdio::piped());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());

        let mut child = cmd.spawn().map_err(|e| {
            BridgeError::Transport(format!("failed to spawn agent binary `{}`: {e}", binary.display()))
        })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| BridgeError::Transport("child stdin unavailable after spawn".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| BridgeError::Transport("child stdout unavailable after spawn".to_string()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| BridgeError::Transport("child stderr unavailable after spawn".to_string()))?;

        let (stdin_tx, mut stdin_rx) = mpsc::unbounded_channel::<String>();
        let (stdout_tx, stdout_rx) = mpsc::unbounded_channel::<String>();
        let (stderr_tx, stderr_rx) = mpsc::unbounded_channel::<String>();

        tokio::spawn(async move {
            let mut stdin = stdin;
            while let Some(msg) = stdin_rx.recv().await {
                let line = format!("{msg}\n");
                if stdin.write_all(line.as_bytes()).await.is_err() {
                    break;
                }
            }
        });

        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if stdout_tx.send(line).is_err() {
                    break;
                }
            }
        });

        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                match stderr::classify(&line) {
                    Some(category) => tracing::warn!(?category, line, "fatal pattern on agent stderr"),
                    None => tracing::debug!(line, "agent stderr"),
                }
                if stderr_tx.send(line).is_err() {
                    break;
                }
            }
        });

        let child = Arc::new(Mutex::new(child));
        Ok((
            Self {
                stdin_tx,
                child,
            },
            SubprocessLines { stdout_rx, stderr_rx },
        ))
    }

    /// Clone of the stdin sender, for handing to a [`crate::rpc::Correlator`]
    /// so correlator-originated lines and dispatcher-originated lines share
    /// the same writer task and therefore the same ordering guarantee.
    pub fn sender(&self) -> mpsc::UnboundedSender<String> {
        self.stdin_tx.clone()
    }

    /// Terminate the subprocess: SIGTERM, wait up to [`TERMINATE_GRACE`],
    /// then SIGKILL if it hasn't exited. On non-Unix platforms, `start_kill`
    /// is used immediately since there is no portable graceful-signal API.
    pub async fn kill(&self) -> Result<()> {
        let mut child = self.child.lock().await;

        #[cfg(unix)]
        {
            if let Some(pid) = child.id() {
                // SAFETY: pid came from tokio::process::Child::id() and is
                // valid for the lifetime of this Child handle.
                unsafe {
                    libc::kill(pid as libc::pid_t, libc::SIGTERM);
                }
            }
            match tokio::time::timeout(TERMINATE_GRACE, child.wait()).await {
                Ok(Ok(_)) => Ok(()),
                Ok(Err(e)) => Err(BridgeError::Io(e).into()),
                Err(_elapsed) => {
                    let _ = child.start_kill();
                    let _ = child.wait().await;
                    Ok(())
                }
            }
        }

        #[cfg(not(unix))]
        {
            let _ = child.start_kill();
            let _ = child.wait().await;
            Ok(())
        }
    }
}

/// Test-only helpers for constructing a [`SubprocessHandle`] without
/// spawning a real agent binary.
#[cfg(test)]
pub mod test_support {
    use super::*;

    /// Spawn `cat` as a stand-in child process: it echoes stdin to stdout
    /// and never writes anything unsolicited, which is all
    /// [`SessionState`](crate::dispatcher::session::SessionState) unit tests
    /// need from a real [`tokio::process::Child`].
    pub fn noop_handle() -> SubprocessHandle {
        let mut cmd = Command::new("cat");
        cmd.stdin(Stdio::piped());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        let mut child = cmd.spawn().expect("cat is available in the test environment");
        let stdin = child.stdin.take().expect("piped stdin");
        let (stdin_tx, mut stdin_rx) = mpsc::unbounded_channel::<String>();
        tokio::spawn(async move {
            let mut stdin = stdin;
            while let Some(msg) = stdin_rx.recv().await {
                if stdin.write_all(format!("{msg}\n").as_bytes()).await.is_err() {
                    break;
                }
            }
        });
        SubprocessHandle {
            stdin_tx,
            child: Arc::new(Mutex::new(child)),
        }
    }
}
