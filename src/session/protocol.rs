//! Request/response exchange over a worker's stdio.
//!
//! Workers speak line-oriented text: each request is one line on stdin and
//! each response is everything the worker prints on stdout before a fixed
//! sentinel. Readiness is signalled the same way, with a marker printed
//! once after start-up.
//!
//! Only one exchange runs per session at a time: [`SessionRegistry::call`]
//! holds the session's exchange lock from the accumulator reset until the
//! response is extracted, so a second caller waits its turn instead of
//! interleaving with the first. The call's timeout bounds the whole
//! exchange, including a write into a pipe the worker is not draining.

use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::session::buffers::OnMatch;
use crate::session::registry::SessionRegistry;
use crate::session::Session;
use crate::{AppError, Result};

impl SessionRegistry {
    /// Wait until the worker prints `marker` on stdout.
    ///
    /// Used once per session right after spawn. The accumulator is left
    /// as is; the first [`call`](Self::call) resets it.
    ///
    /// # Errors
    ///
    /// Returns `AppError::SessionNotFound` for an unknown identifier and
    /// `AppError::ReadinessTimeout`, carrying everything the worker printed,
    /// if the marker does not appear within `timeout`. The session is left
    /// registered; the caller is expected to close it.
    pub async fn await_marker(&self, id: &str, marker: &str, timeout: Duration) -> Result<()> {
        let session = self.get(id).await?;

        if session
            .buffers
            .wait_for(marker, timeout, self.config().poll_interval, OnMatch::Keep)
            .await
            .is_some()
        {
            info!(session_id = id, marker, "worker ready");
            return Ok(());
        }

        let snapshot = session.buffers.snapshot().await;
        warn!(session_id = id, marker, ?timeout, "worker readiness timed out");
        Err(AppError::ReadinessTimeout {
            key: None,
            marker: marker.to_owned(),
            timeout,
            stdout: snapshot.stdout,
            stderr: snapshot.stderr,
        })
    }

    /// Send one request line and return the response framed by `sentinel`.
    ///
    /// Stdout accumulated before the request is discarded. The response is
    /// the text before the first occurrence of `sentinel`; anything after
    /// it is discarded too, so it cannot leak into the next call. `timeout`
    /// covers writing the request and waiting for the sentinel.
    ///
    /// # Errors
    ///
    /// - `AppError::SessionNotFound` for an unknown identifier.
    /// - `AppError::WriteFailed` if the request cannot be written; no
    ///   waiting happens in that case.
    /// - `AppError::ResponseTimeout` with the accumulated output if the
    ///   request cannot be delivered or the sentinel does not appear within
    ///   `timeout`. The session stays open.
    pub async fn call(
        &self,
        id: &str,
        payload: &str,
        sentinel: &str,
        timeout: Duration,
    ) -> Result<String> {
        let session = self.get(id).await?;
        let _exchange = session.exchange.lock().await;
        let deadline = Instant::now() + timeout;

        session.buffers.reset_stdout().await;
        if let Ok(written) = tokio::time::timeout_at(deadline, session.write_line(payload)).await {
            written?;
        } else {
            warn!(session_id = id, ?timeout, "worker input blocked, request not delivered");
            return Err(response_timeout(&session, sentinel, timeout).await);
        }
        debug!(session_id = id, bytes = payload.len(), "request written");

        let remaining = deadline.saturating_duration_since(Instant::now());
        if let Some(response) = session
            .buffers
            .wait_for(sentinel, remaining, self.config().poll_interval, OnMatch::Drain)
            .await
        {
            debug!(session_id = id, bytes = response.len(), "response received");
            return Ok(response);
        }

        warn!(session_id = id, ?timeout, "worker response timed out");
        Err(response_timeout(&session, sentinel, timeout).await)
    }
}

async fn response_timeout(session: &Session, sentinel: &str, timeout: Duration) -> AppError {
    let snapshot = session.buffers.snapshot().await;
    AppError::ResponseTimeout {
        sentinel: sentinel.to_owned(),
        timeout,
        stdout: snapshot.stdout,
        stderr: snapshot.stderr,
    }
}
