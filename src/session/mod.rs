//! Persistent worker sessions.
//!
//! A session is one OS process driven over its stdio pipes. Two reader
//! tasks drain stdout and stderr into per-session accumulators; the
//! [`registry::SessionRegistry`] owns every live session and exposes the
//! spawn / write / call / close surface.
//!
//! Submodules:
//! - `buffers`: stdout/stderr accumulators with append notification.
//! - `reader`: background tasks draining a pipe into an accumulator.
//! - `registry`: session map, spawning, and teardown.
//! - `protocol`: readiness detection and sentinel-framed calls.

pub mod buffers;
pub mod protocol;
pub mod reader;
pub mod registry;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::process::{Child, ChildStdin};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::session::buffers::OutputBuffers;
use crate::{AppError, Result};

/// How a worker is asked to stop when its session is closed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Termination {
    /// Write a plain `exit` line (interactive shells).
    ExitLine,
    /// Write a `{"command":"exit"}` request (protocol-driven workers).
    #[default]
    ExitRequest,
    /// Only close stdin (programs that exit on end-of-input).
    CloseInput,
}

impl Termination {
    /// The line written to stdin before it is closed, if any.
    #[must_use]
    pub fn line(self) -> Option<String> {
        match self {
            Self::ExitLine => Some("exit".to_owned()),
            Self::ExitRequest => Some(serde_json::json!({ "command": "exit" }).to_string()),
            Self::CloseInput => None,
        }
    }
}

/// Everything needed to start a worker process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpawnSpec {
    /// Executable path or name resolved through `PATH`.
    pub program: String,
    /// Ordered arguments.
    pub args: Vec<String>,
    /// Working directory; inherits the current one when `None`.
    pub current_dir: Option<PathBuf>,
    /// Extra environment variables layered over the inherited environment.
    pub env: HashMap<String, String>,
    /// Whether stderr gets its own pipe and reader; discarded otherwise.
    pub capture_stderr: bool,
    /// Shutdown signal sent on close.
    pub termination: Termination,
}

impl SpawnSpec {
    /// Spec for `program` with no arguments, stderr captured, and an
    /// `exit` request on close.
    #[must_use]
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            current_dir: None,
            env: HashMap::new(),
            capture_stderr: true,
            termination: Termination::default(),
        }
    }

    /// Append arguments.
    #[must_use]
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Set the working directory.
    #[must_use]
    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.current_dir = Some(dir.into());
        self
    }

    /// Add one environment variable.
    #[must_use]
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Choose whether stderr is captured.
    #[must_use]
    pub fn capture_stderr(mut self, capture: bool) -> Self {
        self.capture_stderr = capture;
        self
    }

    /// Choose the shutdown signal.
    #[must_use]
    pub fn termination(mut self, termination: Termination) -> Self {
        self.termination = termination;
        self
    }
}

/// Diagnostic description of a live session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionInfo {
    /// Session identifier.
    pub id: String,
    /// Executable the session runs.
    pub program: String,
    /// OS process id, if the process had one at spawn.
    pub pid: Option<u32>,
    /// Spawn timestamp.
    pub created_at: DateTime<Utc>,
}

/// One live worker process and its pipes.
#[derive(Debug)]
pub(crate) struct Session {
    pub(crate) id: String,
    pub(crate) program: String,
    pub(crate) pid: Option<u32>,
    pub(crate) created_at: DateTime<Utc>,
    pub(crate) termination: Termination,
    pub(crate) child: Mutex<Child>,
    pub(crate) stdin: Mutex<Option<ChildStdin>>,
    pub(crate) buffers: Arc<OutputBuffers>,
    /// Held for the whole of a request/response exchange.
    pub(crate) exchange: Mutex<()>,
    pub(crate) cancel: CancellationToken,
    pub(crate) readers: Mutex<Vec<JoinHandle<()>>>,
}

impl Session {
    pub(crate) fn info(&self) -> SessionInfo {
        SessionInfo {
            id: self.id.clone(),
            program: self.program.clone(),
            pid: self.pid,
            created_at: self.created_at,
        }
    }

    /// Write `line` plus a trailing newline to stdin and flush.
    ///
    /// Blocks while the pipe is full; callers that need a bound wrap this
    /// in a timeout.
    pub(crate) async fn write_line(&self, line: &str) -> Result<()> {
        let mut guard = self.stdin.lock().await;
        let stdin = guard.as_mut().ok_or_else(|| {
            AppError::WriteFailed(format!("session {} input is closed", self.id))
        })?;

        send_line(stdin, line).await.map_err(|err| {
            warn!(session_id = self.id, %err, "write to worker stdin failed");
            AppError::WriteFailed(format!("session {}: {err}", self.id))
        })
    }

    /// Signal the worker to stop, close stdin, and reap the process.
    ///
    /// Signalling is best effort and bounded by `grace`: a write failure is
    /// ignored, and input blocked by a full pipe or a stuck writer is
    /// skipped. If the process is still alive once `grace` has passed it is
    /// asked to terminate, then killed after a second `grace`, so this
    /// always returns once the process is reaped.
    pub(crate) async fn shutdown(&self, grace: Duration) -> Result<()> {
        let started = Instant::now();
        let signalled = tokio::time::timeout(grace, async {
            let mut stdin = self.stdin.lock().await;
            if let (Some(pipe), Some(line)) = (stdin.as_mut(), self.termination.line()) {
                if let Err(err) = send_line(pipe, &line).await {
                    debug!(session_id = self.id, %err, "termination signal not delivered");
                }
            }
            drop(stdin.take());
        })
        .await;
        if signalled.is_err() {
            warn!(session_id = self.id, ?grace, "worker input blocked, skipping termination signal");
        }

        let waited = {
            let mut child = self.child.lock().await;
            let first_wait = grace.saturating_sub(started.elapsed());
            reap(&self.id, &mut child, first_wait, grace).await
        };

        // A writer still blocked on the pipe keeps the input until it fails.
        if let Ok(mut stdin) = self.stdin.try_lock() {
            drop(stdin.take());
        }

        self.cancel.cancel();
        for handle in self.readers.lock().await.drain(..) {
            if let Err(err) = handle.await {
                warn!(session_id = self.id, %err, "reader task ended abnormally");
            }
        }

        match waited {
            Ok(status) if status.success() => {
                info!(session_id = self.id, %status, "worker exited");
                Ok(())
            }
            Ok(status) => Err(AppError::ProcessWait(format!(
                "session {} exited with {status}",
                self.id
            ))),
            Err(err) => Err(AppError::ProcessWait(format!(
                "session {}: {err}",
                self.id
            ))),
        }
    }
}

async fn send_line(stdin: &mut ChildStdin, line: &str) -> std::io::Result<()> {
    let mut bytes = Vec::with_capacity(line.len() + 1);
    bytes.extend_from_slice(line.as_bytes());
    bytes.push(b'\n');

    stdin.write_all(&bytes).await?;
    stdin.flush().await
}

async fn reap(
    session_id: &str,
    child: &mut Child,
    first_wait: Duration,
    grace: Duration,
) -> std::io::Result<std::process::ExitStatus> {
    if let Ok(result) = tokio::time::timeout(first_wait, child.wait()).await {
        return result;
    }

    warn!(session_id, ?grace, "worker did not exit within grace period, terminating");
    request_terminate(session_id, child);

    if let Ok(result) = tokio::time::timeout(grace, child.wait()).await {
        return result;
    }

    warn!(session_id, "worker ignored terminate request, killing");
    child.start_kill()?;
    child.wait().await
}

#[cfg(unix)]
fn request_terminate(session_id: &str, child: &Child) {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    let Some(pid) = child.id().and_then(|pid| i32::try_from(pid).ok()) else {
        return;
    };
    if let Err(err) = kill(Pid::from_raw(pid), Signal::SIGTERM) {
        warn!(session_id, %err, "failed to send SIGTERM");
    }
}

#[cfg(not(unix))]
fn request_terminate(session_id: &str, child: &mut Child) {
    if let Err(err) = child.start_kill() {
        warn!(session_id, %err, "failed to kill worker");
    }
}
