//! Session registry: the map of live worker sessions.
//!
//! The registry is an explicit object, constructed once and shared through
//! an [`Arc`], so independent registries can coexist (tests run several).
//! A session is inserted only after its process started and both pipes
//! were captured, and it is removed *before* shutdown blocks on the
//! process, so a concurrent close or lookup never sees a half-closed entry.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::process::Command;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::session::buffers::{OutputBuffers, OutputSnapshot, StreamKind};
use crate::session::reader::run_reader;
use crate::session::{Session, SessionInfo, SpawnSpec};
use crate::{AppError, Result};

/// Default interval between accumulator checks while waiting.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Default time a closing worker is given before it is terminated.
pub const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Tunables shared by every session of a registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegistryConfig {
    /// Fallback interval between accumulator checks in `await_marker`/`call`.
    pub poll_interval: Duration,
    /// How long `close` waits for a voluntary exit before escalating.
    pub shutdown_grace: Duration,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            poll_interval: DEFAULT_POLL_INTERVAL,
            shutdown_grace: DEFAULT_SHUTDOWN_GRACE,
        }
    }
}

/// Owner of every live worker session.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    config: RegistryConfig,
    sessions: Mutex<HashMap<String, Arc<Session>>>,
}

impl SessionRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new(config: RegistryConfig) -> Self {
        Self {
            config,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// Tunables this registry was built with.
    #[must_use]
    pub fn config(&self) -> RegistryConfig {
        self.config
    }

    /// Start a worker process and register it under a fresh identifier.
    ///
    /// Stdin and stdout are always piped; stderr is piped only when
    /// `spec.capture_stderr` is set. One reader task is started per
    /// captured output stream.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Spawn` if the process cannot be started or a pipe
    /// cannot be captured. Nothing is registered in that case and a started
    /// process is killed when its handle drops.
    pub async fn spawn(&self, spec: &SpawnSpec) -> Result<String> {
        let id = Uuid::new_v4().to_string();
        let span = info_span!("spawn_session", session_id = %id, program = %spec.program);

        async {
            let mut cmd = Command::new(&spec.program);
            cmd.args(&spec.args)
                .envs(&spec.env)
                .stdin(Stdio::piped())
                .stdout(Stdio::piped())
                .stderr(if spec.capture_stderr {
                    Stdio::piped()
                } else {
                    Stdio::null()
                })
                .kill_on_drop(true);
            if let Some(dir) = &spec.current_dir {
                cmd.current_dir(dir);
            }

            let mut child = cmd.spawn().map_err(|err| {
                AppError::Spawn(format!("failed to spawn {}: {err}", spec.program))
            })?;

            let stdin = child
                .stdin
                .take()
                .ok_or_else(|| AppError::Spawn("failed to capture worker stdin".into()))?;
            let stdout = child
                .stdout
                .take()
                .ok_or_else(|| AppError::Spawn("failed to capture worker stdout".into()))?;
            let stderr = if spec.capture_stderr {
                Some(
                    child
                        .stderr
                        .take()
                        .ok_or_else(|| AppError::Spawn("failed to capture worker stderr".into()))?,
                )
            } else {
                None
            };

            let pid = child.id();
            let buffers = Arc::new(OutputBuffers::new());
            let cancel = CancellationToken::new();

            let mut readers = vec![tokio::spawn(run_reader(
                id.clone(),
                StreamKind::Stdout,
                stdout,
                Arc::clone(&buffers),
                cancel.clone(),
            ))];
            if let Some(stderr) = stderr {
                readers.push(tokio::spawn(run_reader(
                    id.clone(),
                    StreamKind::Stderr,
                    stderr,
                    Arc::clone(&buffers),
                    cancel.clone(),
                )));
            }

            let session = Arc::new(Session {
                id: id.clone(),
                program: spec.program.clone(),
                pid,
                created_at: Utc::now(),
                termination: spec.termination,
                child: Mutex::new(child),
                stdin: Mutex::new(Some(stdin)),
                buffers,
                exchange: Mutex::new(()),
                cancel,
                readers: Mutex::new(readers),
            });

            self.sessions.lock().await.insert(id.clone(), session);

            info!(pid = pid.unwrap_or(0), args = ?spec.args, "worker process spawned");
            Ok(id.clone())
        }
        .instrument(span)
        .await
    }

    /// Write `input` followed by a newline to the session's stdin.
    ///
    /// # Errors
    ///
    /// Returns `AppError::SessionNotFound` for an unknown identifier and
    /// `AppError::WriteFailed` if the pipe is broken.
    pub async fn write(&self, id: &str, input: &str) -> Result<()> {
        self.get(id).await?.write_line(input).await
    }

    /// Remove a session, signal its worker to stop, and reap the process.
    ///
    /// # Errors
    ///
    /// Returns `AppError::SessionNotFound` if the identifier is not
    /// registered (including a second close of the same session), and
    /// `AppError::ProcessWait` if waiting fails or the worker exits with a
    /// failure status.
    pub async fn close(&self, id: &str) -> Result<()> {
        let session = self
            .sessions
            .lock()
            .await
            .remove(id)
            .ok_or_else(|| AppError::SessionNotFound(id.to_owned()))?;

        let span = info_span!("close_session", session_id = id, pid = session.pid.unwrap_or(0));
        session
            .shutdown(self.config.shutdown_grace)
            .instrument(span)
            .await
    }

    /// Close every registered session, returning the first failure.
    ///
    /// Every session is closed even if an earlier one fails.
    ///
    /// # Errors
    ///
    /// Returns the first `AppError::ProcessWait` encountered.
    pub async fn close_all(&self) -> Result<()> {
        let ids = self.ids().await;
        let mut first_err = None;
        for id in ids {
            match self.close(&id).await {
                // Raced with a concurrent close.
                Ok(()) | Err(AppError::SessionNotFound(_)) => {}
                Err(err) => {
                    warn!(session_id = id, %err, "failed to close session during shutdown");
                    first_err.get_or_insert(err);
                }
            }
        }
        first_err.map_or(Ok(()), Err)
    }

    /// Consistent copy of the session's stdout and stderr accumulators.
    ///
    /// # Errors
    ///
    /// Returns `AppError::SessionNotFound` for an unknown identifier.
    pub async fn snapshot(&self, id: &str) -> Result<OutputSnapshot> {
        Ok(self.get(id).await?.buffers.snapshot().await)
    }

    /// Discard the session's accumulated stdout.
    ///
    /// # Errors
    ///
    /// Returns `AppError::SessionNotFound` for an unknown identifier.
    pub async fn reset_output(&self, id: &str) -> Result<()> {
        self.get(id).await?.buffers.reset_stdout().await;
        Ok(())
    }

    /// Diagnostic description of a session.
    ///
    /// # Errors
    ///
    /// Returns `AppError::SessionNotFound` for an unknown identifier.
    pub async fn info(&self, id: &str) -> Result<SessionInfo> {
        Ok(self.get(id).await?.info())
    }

    /// Whether the session's process has not been observed to exit.
    ///
    /// Never blocks on the process; unknown identifiers report `false`.
    pub async fn is_running(&self, id: &str) -> bool {
        let Ok(session) = self.get(id).await else {
            return false;
        };
        let mut child = session.child.lock().await;
        match child.try_wait() {
            Ok(None) => true,
            Ok(Some(_)) => false,
            Err(err) => {
                warn!(session_id = id, %err, "failed to poll worker status");
                false
            }
        }
    }

    /// Whether `id` is registered.
    pub async fn contains(&self, id: &str) -> bool {
        self.sessions.lock().await.contains_key(id)
    }

    /// Identifiers of every registered session.
    pub async fn ids(&self) -> Vec<String> {
        self.sessions.lock().await.keys().cloned().collect()
    }

    /// Number of registered sessions.
    pub async fn len(&self) -> usize {
        self.sessions.lock().await.len()
    }

    /// Whether no session is registered.
    pub async fn is_empty(&self) -> bool {
        self.sessions.lock().await.is_empty()
    }

    pub(crate) async fn get(&self, id: &str) -> Result<Arc<Session>> {
        self.sessions
            .lock()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| AppError::SessionNotFound(id.to_owned()))
    }
}
