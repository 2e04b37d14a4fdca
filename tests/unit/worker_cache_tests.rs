//! Unit tests for `WorkerCache` against a scripted in-memory host.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use worker_cortex::cache::{HostFuture, SessionHost};
use worker_cortex::session::SpawnSpec;
use worker_cortex::{AppError, WorkerCache};

#[derive(Default)]
struct FakeHost {
    spawned: AtomicUsize,
    closed: Mutex<Vec<String>>,
    never_ready: AtomicBool,
    fail_spawn: AtomicBool,
    fail_close: AtomicBool,
}

impl FakeHost {
    fn spawn_count(&self) -> usize {
        self.spawned.load(Ordering::SeqCst)
    }

    fn closed(&self) -> Vec<String> {
        self.closed.lock().unwrap().clone()
    }
}

impl SessionHost for FakeHost {
    fn spawn<'a>(&'a self, spec: &'a SpawnSpec) -> HostFuture<'a, String> {
        Box::pin(async move {
            if self.fail_spawn.load(Ordering::SeqCst) {
                return Err(AppError::Spawn(format!("failed to spawn {}", spec.program)));
            }
            let n = self.spawned.fetch_add(1, Ordering::SeqCst);
            Ok(format!("session-{n}"))
        })
    }

    fn await_marker<'a>(
        &'a self,
        _id: &'a str,
        marker: &'a str,
        timeout: Duration,
    ) -> HostFuture<'a, ()> {
        Box::pin(async move {
            if self.never_ready.load(Ordering::SeqCst) {
                return Err(AppError::ReadinessTimeout {
                    key: None,
                    marker: marker.to_owned(),
                    timeout,
                    stdout: String::new(),
                    stderr: String::new(),
                });
            }
            Ok(())
        })
    }

    fn close<'a>(&'a self, id: &'a str) -> HostFuture<'a, ()> {
        Box::pin(async move {
            self.closed.lock().unwrap().push(id.to_owned());
            if self.fail_close.load(Ordering::SeqCst) {
                return Err(AppError::ProcessWait("exited with exit status: 1".into()));
            }
            Ok(())
        })
    }
}

fn cache_with(host: &Arc<FakeHost>) -> WorkerCache {
    WorkerCache::new(Arc::clone(host) as Arc<dyn SessionHost>)
}

fn spec() -> SpawnSpec {
    SpawnSpec::new("worker")
}

const READY: &str = "[READY]";
const TIMEOUT: Duration = Duration::from_secs(1);

#[tokio::test]
async fn second_load_is_a_hit() {
    let host = Arc::new(FakeHost::default());
    let cache = cache_with(&host);

    let first = cache.load("model-a", &spec(), READY, TIMEOUT).await.unwrap();
    let second = cache.load("model-a", &spec(), READY, TIMEOUT).await.unwrap();

    assert_eq!(first, second);
    assert_eq!(host.spawn_count(), 1);
    assert_eq!(cache.session_id("model-a").await, Some(first));
}

#[tokio::test]
async fn distinct_keys_get_distinct_sessions() {
    let host = Arc::new(FakeHost::default());
    let cache = cache_with(&host);

    let a = cache.load("model-a", &spec(), READY, TIMEOUT).await.unwrap();
    let b = cache.load("model-b", &spec(), READY, TIMEOUT).await.unwrap();

    assert_ne!(a, b);
    assert_eq!(host.spawn_count(), 2);

    let mut keys = cache.keys().await;
    keys.sort();
    assert_eq!(keys, vec!["model-a", "model-b"]);
}

#[tokio::test]
async fn unready_worker_is_closed_and_not_cached() {
    let host = Arc::new(FakeHost::default());
    host.never_ready.store(true, Ordering::SeqCst);
    let cache = cache_with(&host);

    let err = cache
        .load("model-a", &spec(), READY, TIMEOUT)
        .await
        .unwrap_err();

    match &err {
        AppError::ReadinessTimeout { key, marker, .. } => {
            assert_eq!(key.as_deref(), Some("model-a"));
            assert_eq!(marker, READY);
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert_eq!(host.closed(), vec!["session-0"]);
    assert!(cache.session_id("model-a").await.is_none());
}

#[tokio::test]
async fn failed_load_can_be_retried() {
    let host = Arc::new(FakeHost::default());
    host.never_ready.store(true, Ordering::SeqCst);
    let cache = cache_with(&host);

    assert!(cache.load("model-a", &spec(), READY, TIMEOUT).await.is_err());

    host.never_ready.store(false, Ordering::SeqCst);
    let id = cache.load("model-a", &spec(), READY, TIMEOUT).await.unwrap();

    assert_eq!(id, "session-1");
    assert_eq!(host.spawn_count(), 2);
}

#[tokio::test]
async fn spawn_failure_closes_nothing() {
    let host = Arc::new(FakeHost::default());
    host.fail_spawn.store(true, Ordering::SeqCst);
    let cache = cache_with(&host);

    let err = cache
        .load("model-a", &spec(), READY, TIMEOUT)
        .await
        .unwrap_err();

    assert!(matches!(err, AppError::Spawn(ref msg) if msg.starts_with("model-a: ")));
    assert!(host.closed().is_empty());
    assert!(cache.keys().await.is_empty());
}

#[tokio::test]
async fn unload_of_absent_key_is_ok() {
    let host = Arc::new(FakeHost::default());
    let cache = cache_with(&host);

    cache.unload("never-loaded").await.unwrap();
    assert!(host.closed().is_empty());
}

#[tokio::test]
async fn unload_closes_and_forgets() {
    let host = Arc::new(FakeHost::default());
    let cache = cache_with(&host);

    let id = cache.load("model-a", &spec(), READY, TIMEOUT).await.unwrap();
    cache.unload("model-a").await.unwrap();

    assert_eq!(host.closed(), vec![id]);
    assert!(cache.session_id("model-a").await.is_none());

    cache.load("model-a", &spec(), READY, TIMEOUT).await.unwrap();
    assert_eq!(host.spawn_count(), 2, "reload after unload must spawn");
}

#[tokio::test]
async fn unload_close_failure_is_tagged_and_entry_removed() {
    let host = Arc::new(FakeHost::default());
    let cache = cache_with(&host);

    cache.load("model-a", &spec(), READY, TIMEOUT).await.unwrap();
    host.fail_close.store(true, Ordering::SeqCst);

    let err = cache.unload("model-a").await.unwrap_err();

    assert!(matches!(err, AppError::ProcessWait(ref msg) if msg.starts_with("model-a: ")));
    assert!(cache.session_id("model-a").await.is_none());
}

#[tokio::test]
async fn unload_all_empties_the_cache() {
    let host = Arc::new(FakeHost::default());
    let cache = cache_with(&host);

    cache.load("model-a", &spec(), READY, TIMEOUT).await.unwrap();
    cache.load("model-b", &spec(), READY, TIMEOUT).await.unwrap();

    cache.unload_all().await.unwrap();

    assert!(cache.keys().await.is_empty());
    assert_eq!(host.closed().len(), 2);
}

#[tokio::test]
async fn unload_all_reports_first_failure_but_closes_everything() {
    let host = Arc::new(FakeHost::default());
    let cache = cache_with(&host);

    cache.load("model-a", &spec(), READY, TIMEOUT).await.unwrap();
    cache.load("model-b", &spec(), READY, TIMEOUT).await.unwrap();
    host.fail_close.store(true, Ordering::SeqCst);

    assert!(cache.unload_all().await.is_err());
    assert_eq!(host.closed().len(), 2);
    assert!(cache.keys().await.is_empty());
}
