//! At most one live worker per resource key.
//!
//! A single cache-wide lock is held for the whole of every `load` and
//! `unload`, including the spawn and readiness wait. Loads of different
//! keys therefore run one after another, which is what guarantees that two
//! concurrent loads of the same key never start two processes.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tracing::{info, info_span, warn, Instrument};

use crate::cache::SessionHost;
use crate::session::registry::SessionRegistry;
use crate::session::SpawnSpec;
use crate::Result;

/// Maps resource keys (e.g. model file paths) to ready worker sessions.
pub struct WorkerCache {
    host: Arc<dyn SessionHost>,
    entries: Mutex<HashMap<String, String>>,
}

impl std::fmt::Debug for WorkerCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerCache").finish_non_exhaustive()
    }
}

impl WorkerCache {
    /// Create an empty cache backed by `host`.
    #[must_use]
    pub fn new(host: Arc<dyn SessionHost>) -> Self {
        Self {
            host,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Return the session serving `key`, starting one if none is cached.
    ///
    /// On a hit the cached identifier is returned with no spawn and no
    /// readiness wait. On a miss a worker is spawned from `spec` and the
    /// entry is published only after `ready_marker` was seen within
    /// `timeout`.
    ///
    /// # Errors
    ///
    /// Returns the spawn or readiness failure, tagged with `key`. A session
    /// that was spawned but never became ready is closed (best effort)
    /// and nothing is cached.
    pub async fn load(
        &self,
        key: &str,
        spec: &SpawnSpec,
        ready_marker: &str,
        timeout: Duration,
    ) -> Result<String> {
        let mut entries = self.entries.lock().await;

        if let Some(id) = entries.get(key) {
            return Ok(id.clone());
        }

        let span = info_span!("load_worker", key, program = %spec.program);
        let id = self
            .start(key, spec, ready_marker, timeout)
            .instrument(span)
            .await?;

        entries.insert(key.to_owned(), id.clone());
        Ok(id)
    }

    /// Close and forget the session serving `key`.
    ///
    /// Unloading a key that is not cached is a no-op.
    ///
    /// # Errors
    ///
    /// Returns the close failure of the session, tagged with `key`. The
    /// entry is removed either way.
    pub async fn unload(&self, key: &str) -> Result<()> {
        let mut entries = self.entries.lock().await;

        let Some(id) = entries.remove(key) else {
            return Ok(());
        };

        info!(key, session_id = id, "unloading worker");
        self.host
            .close(&id)
            .await
            .map_err(|err| err.for_resource(key))
    }

    /// Unload every cached worker, returning the first failure.
    ///
    /// # Errors
    ///
    /// Returns the first close failure; every entry is removed regardless.
    pub async fn unload_all(&self) -> Result<()> {
        let mut entries = self.entries.lock().await;
        let mut first_err = None;

        for (key, id) in entries.drain() {
            if let Err(err) = self.host.close(&id).await {
                warn!(key, session_id = id, %err, "failed to unload worker");
                first_err.get_or_insert(err.for_resource(&key));
            }
        }

        first_err.map_or(Ok(()), Err)
    }

    /// Session identifier cached for `key`, if any.
    pub async fn session_id(&self, key: &str) -> Option<String> {
        self.entries.lock().await.get(key).cloned()
    }

    /// Every cached resource key.
    pub async fn keys(&self) -> Vec<String> {
        self.entries.lock().await.keys().cloned().collect()
    }

    async fn start(
        &self,
        key: &str,
        spec: &SpawnSpec,
        ready_marker: &str,
        timeout: Duration,
    ) -> Result<String> {
        let id = self
            .host
            .spawn(spec)
            .await
            .map_err(|err| err.for_resource(key))?;

        if let Err(err) = self.host.await_marker(&id, ready_marker, timeout).await {
            warn!(session_id = id, %err, "worker failed to become ready, closing");
            if let Err(close_err) = self.host.close(&id).await {
                warn!(session_id = id, %close_err, "failed to close unready worker");
            }
            return Err(err.for_resource(key));
        }

        info!(session_id = id, "worker loaded");
        Ok(id)
    }
}

impl From<Arc<SessionRegistry>> for WorkerCache {
    fn from(registry: Arc<SessionRegistry>) -> Self {
        Self::new(registry)
    }
}
