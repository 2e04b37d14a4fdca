//! Resource-keyed worker cache.
//!
//! The [`SessionHost`] trait decouples the cache from the concrete session
//! registry: the cache only needs to spawn a session, wait for its
//! readiness marker, and close it. [`SessionRegistry`] is the production
//! implementation; tests substitute counting or scripted hosts.

pub mod worker_cache;

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use crate::session::registry::SessionRegistry;
use crate::session::SpawnSpec;
use crate::Result;

pub use worker_cache::WorkerCache;

/// Boxed future returned by [`SessionHost`] methods.
pub type HostFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// Session lifecycle surface the worker cache depends on.
pub trait SessionHost: Send + Sync {
    /// Start a worker and return its session identifier.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Spawn`](crate::AppError::Spawn) if the process
    /// cannot be started.
    fn spawn<'a>(&'a self, spec: &'a SpawnSpec) -> HostFuture<'a, String>;

    /// Wait for the worker's readiness marker.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::ReadinessTimeout`](crate::AppError::ReadinessTimeout)
    /// if the marker does not appear in time.
    fn await_marker<'a>(
        &'a self,
        id: &'a str,
        marker: &'a str,
        timeout: Duration,
    ) -> HostFuture<'a, ()>;

    /// Stop the worker and release its process.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::SessionNotFound`](crate::AppError::SessionNotFound)
    /// for an unknown identifier, or
    /// [`AppError::ProcessWait`](crate::AppError::ProcessWait) if the worker
    /// exits with a failure.
    fn close<'a>(&'a self, id: &'a str) -> HostFuture<'a, ()>;
}

impl SessionHost for SessionRegistry {
    fn spawn<'a>(&'a self, spec: &'a SpawnSpec) -> HostFuture<'a, String> {
        Box::pin(SessionRegistry::spawn(self, spec))
    }

    fn await_marker<'a>(
        &'a self,
        id: &'a str,
        marker: &'a str,
        timeout: Duration,
    ) -> HostFuture<'a, ()> {
        Box::pin(SessionRegistry::await_marker(self, id, marker, timeout))
    }

    fn close<'a>(&'a self, id: &'a str) -> HostFuture<'a, ()> {
        Box::pin(SessionRegistry::close(self, id))
    }
}
