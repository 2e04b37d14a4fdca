//! Integration tests for JSON request/response workers.

use std::sync::Arc;
use std::time::Duration;

use worker_cortex::workers::vision::{CaptionResponse, VisionRequest, VISION_SENTINEL};
use worker_cortex::{AppError, WorkerCache, WorkerProfile};

use super::test_helpers::{registry, sh_spec, VISION_WORKER};

fn fake_blip() -> WorkerProfile {
    WorkerProfile::new(
        "models/blip",
        sh_spec(VISION_WORKER),
        "[BLIP] Ready.",
        VISION_SENTINEL,
    )
    .with_timeouts(Duration::from_secs(2), Duration::from_secs(2))
}

fn caption(image_path: &str) -> VisionRequest {
    VisionRequest::Caption {
        image_path: image_path.to_owned(),
        prompt: None,
    }
}

#[tokio::test]
async fn caption_round_trip() {
    let registry = registry();
    let cache = WorkerCache::from(Arc::clone(&registry));
    let profile = fake_blip();

    let id = profile.load(&cache).await.unwrap();
    let reply: CaptionResponse = profile
        .invoke_json(&registry, &id, &caption("cat.png"))
        .await
        .unwrap();

    assert_eq!(reply.caption, "a cat on a mat");
    assert_eq!(reply.image, "cat.png");

    // Model logging on stderr never pollutes replies.
    let snapshot = registry.snapshot(&id).await.unwrap();
    assert!(snapshot.stderr.contains("loading model"));

    profile.unload(&cache).await.unwrap();
    assert!(registry.is_empty().await);
}

#[tokio::test]
async fn error_reply_is_worker_error_and_session_survives() {
    let registry = registry();
    let cache = WorkerCache::from(Arc::clone(&registry));
    let profile = fake_blip();
    let id = profile.load(&cache).await.unwrap();

    let err = profile
        .invoke_json::<_, CaptionResponse>(&registry, &id, &caption("missing.png"))
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::Worker(ref msg) if msg == "image not found"));

    let reply: CaptionResponse = profile
        .invoke_json(&registry, &id, &caption("cat.png"))
        .await
        .unwrap();
    assert_eq!(reply.caption, "a cat on a mat");

    cache.unload_all().await.unwrap();
}

#[tokio::test]
async fn raw_request_returns_framed_text() {
    let registry = registry();
    let cache = WorkerCache::from(Arc::clone(&registry));
    let profile = fake_blip();
    let id = profile.load(&cache).await.unwrap();

    let raw = profile
        .request(&registry, &id, r#"{"command":"caption","image_path":"cat.png"}"#)
        .await
        .unwrap();

    assert!(raw.trim().starts_with('{'), "{raw}");
    assert!(!raw.contains(VISION_SENTINEL));

    cache.unload_all().await.unwrap();
}
