//! Worker profiles: how to start a worker and how to talk to it.

use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::cache::WorkerCache;
use crate::session::registry::SessionRegistry;
use crate::session::SpawnSpec;
use crate::{AppError, Result};

/// Default time a worker is given to print its readiness marker.
pub const DEFAULT_READY_TIMEOUT: Duration = Duration::from_secs(180);

/// Default time a worker is given to finish one response.
pub const DEFAULT_RESPONSE_TIMEOUT: Duration = Duration::from_secs(30);

/// Everything needed to load a worker and exchange requests with it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerProfile {
    /// Resource key the worker is cached under.
    pub key: String,
    /// Process to start.
    pub spec: SpawnSpec,
    /// Substring printed once the worker finished initialising.
    pub ready_marker: String,
    /// Substring printed after every response.
    pub sentinel: String,
    /// Window for the readiness marker.
    pub ready_timeout: Duration,
    /// Window for each response.
    pub response_timeout: Duration,
}

impl WorkerProfile {
    /// Profile with default timeouts.
    #[must_use]
    pub fn new(
        key: impl Into<String>,
        spec: SpawnSpec,
        ready_marker: impl Into<String>,
        sentinel: impl Into<String>,
    ) -> Self {
        Self {
            key: key.into(),
            spec,
            ready_marker: ready_marker.into(),
            sentinel: sentinel.into(),
            ready_timeout: DEFAULT_READY_TIMEOUT,
            response_timeout: DEFAULT_RESPONSE_TIMEOUT,
        }
    }

    /// Override both timeouts.
    #[must_use]
    pub fn with_timeouts(mut self, ready: Duration, response: Duration) -> Self {
        self.ready_timeout = ready;
        self.response_timeout = response;
        self
    }

    /// Load (or reuse) the worker through `cache`.
    ///
    /// # Errors
    ///
    /// Propagates [`WorkerCache::load`] failures.
    pub async fn load(&self, cache: &WorkerCache) -> Result<String> {
        cache
            .load(&self.key, &self.spec, &self.ready_marker, self.ready_timeout)
            .await
    }

    /// Unload the worker from `cache`.
    ///
    /// # Errors
    ///
    /// Propagates [`WorkerCache::unload`] failures.
    pub async fn unload(&self, cache: &WorkerCache) -> Result<()> {
        cache.unload(&self.key).await
    }

    /// Send one raw request line and return the framed response text.
    ///
    /// # Errors
    ///
    /// Propagates [`SessionRegistry::call`] failures.
    pub async fn request(
        &self,
        registry: &SessionRegistry,
        session_id: &str,
        payload: &str,
    ) -> Result<String> {
        registry
            .call(session_id, payload, &self.sentinel, self.response_timeout)
            .await
    }

    /// Send `request` as one JSON line and decode the JSON reply.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Worker` if the request cannot be serialised, the
    /// worker replies with `{"error": ...}`, or the reply does not decode
    /// as `Resp`. Transport failures propagate from
    /// [`SessionRegistry::call`].
    pub async fn invoke_json<Req, Resp>(
        &self,
        registry: &SessionRegistry,
        session_id: &str,
        request: &Req,
    ) -> Result<Resp>
    where
        Req: Serialize + Sync,
        Resp: DeserializeOwned,
    {
        let line = serde_json::to_string(request)
            .map_err(|err| AppError::Worker(format!("failed to serialise request: {err}")))?;
        let reply = self.request(registry, session_id, &line).await?;
        debug!(session_id, key = self.key, "decoding worker reply");
        decode_reply(&reply)
    }
}

#[derive(Debug, Deserialize)]
struct ErrorReply {
    error: String,
}

/// Decode a worker's JSON reply, surfacing `{"error": ...}` objects.
///
/// Leading log lines before the JSON body are tolerated: decoding starts
/// at the first `{` or `[`.
///
/// # Errors
///
/// Returns `AppError::Worker` for error replies and undecodable bodies.
pub fn decode_reply<Resp: DeserializeOwned>(reply: &str) -> Result<Resp> {
    let body = reply
        .find(['{', '['])
        .map_or(reply, |start| &reply[start..])
        .trim();

    if let Ok(ErrorReply { error }) = serde_json::from_str::<ErrorReply>(body) {
        return Err(AppError::Worker(error));
    }

    serde_json::from_str(body)
        .map_err(|err| AppError::Worker(format!("unparseable reply: {err}: {body}")))
}
