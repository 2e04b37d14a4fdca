//! Error types shared across the crate.

use std::fmt::{Display, Formatter};
use std::time::Duration;

/// Shared crate result type.
pub type Result<T> = std::result::Result<T, AppError>;

/// Error enumeration covering every worker lifecycle failure mode.
#[derive(Debug)]
pub enum AppError {
    /// Process or pipe creation failed.
    Spawn(String),
    /// No live session is registered under the given identifier.
    SessionNotFound(String),
    /// Writing to the worker's stdin failed; the process has usually exited.
    WriteFailed(String),
    /// The worker never emitted its readiness marker.
    ReadinessTimeout {
        /// Resource key the worker was being loaded for, when known.
        key: Option<String>,
        /// Marker that was awaited.
        marker: String,
        /// Window that elapsed.
        timeout: Duration,
        /// Everything the worker printed on stdout.
        stdout: String,
        /// Everything the worker printed on stderr.
        stderr: String,
    },
    /// The worker did not finish its response within the window.
    ResponseTimeout {
        /// Sentinel that was awaited.
        sentinel: String,
        /// Window that elapsed.
        timeout: Duration,
        /// Output accumulated since the request was written.
        stdout: String,
        /// Everything the worker printed on stderr.
        stderr: String,
    },
    /// Waiting for the process failed or it exited with a failure status.
    ProcessWait(String),
    /// The worker replied with an error object or an unparseable body.
    Worker(String),
    /// Configuration parsing or validation failure.
    Config(String),
    /// File-system or I/O operation failure.
    Io(String),
}

impl AppError {
    /// Attach the resource key a load was attempted for.
    ///
    /// Message-carrying variants are prefixed with the key; a readiness
    /// timeout records it in its `key` field.
    #[must_use]
    pub fn for_resource(self, resource: &str) -> Self {
        match self {
            Self::Spawn(msg) => Self::Spawn(format!("{resource}: {msg}")),
            Self::SessionNotFound(msg) => Self::SessionNotFound(format!("{resource}: {msg}")),
            Self::WriteFailed(msg) => Self::WriteFailed(format!("{resource}: {msg}")),
            Self::ProcessWait(msg) => Self::ProcessWait(format!("{resource}: {msg}")),
            Self::Worker(msg) => Self::Worker(format!("{resource}: {msg}")),
            Self::ReadinessTimeout {
                marker,
                timeout,
                stdout,
                stderr,
                ..
            } => Self::ReadinessTimeout {
                key: Some(resource.to_owned()),
                marker,
                timeout,
                stdout,
                stderr,
            },
            other => other,
        }
    }

    /// Whether the failure is a timeout the caller may retry after.
    #[must_use]
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            Self::ReadinessTimeout { .. } | Self::ResponseTimeout { .. }
        )
    }
}

impl Display for AppError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Spawn(msg) => write!(f, "spawn: {msg}"),
            Self::SessionNotFound(id) => write!(f, "session not found: {id}"),
            Self::WriteFailed(msg) => write!(f, "write failed: {msg}"),
            Self::ReadinessTimeout {
                key,
                marker,
                timeout,
                stdout,
                stderr,
            } => {
                write!(f, "readiness timeout")?;
                if let Some(key) = key {
                    write!(f, " for {key}")?;
                }
                write!(
                    f,
                    ": marker {marker:?} not seen within {timeout:?}\nlast stdout: {stdout}\nlast stderr: {stderr}"
                )
            }
            Self::ResponseTimeout {
                sentinel,
                timeout,
                stdout,
                stderr,
            } => write!(
                f,
                "response timeout: sentinel {sentinel:?} not seen within {timeout:?}\nlast stdout: {stdout}\nlast stderr: {stderr}"
            ),
            Self::ProcessWait(msg) => write!(f, "process wait: {msg}"),
            Self::Worker(msg) => write!(f, "worker: {msg}"),
            Self::Config(msg) => write!(f, "config: {msg}"),
            Self::Io(msg) => write!(f, "io: {msg}"),
        }
    }
}

impl std::error::Error for AppError {}

impl From<toml::de::Error> for AppError {
    fn from(err: toml::de::Error) -> Self {
        Self::Config(format!("invalid config: {err}"))
    }
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}
