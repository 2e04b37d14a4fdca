//! Integration tests for readiness detection and sentinel-framed calls.

use std::time::Duration;

use tokio::time::Instant;

use worker_cortex::AppError;

use super::test_helpers::{
    registry, sh_spec, DEAF_WORKER, DOUBLE_ANSWER_WORKER, ECHO_WORKER, NEVER_READY_WORKER,
    PIPE_FILLING_BYTES, SILENT_WORKER, SPLIT_SENTINEL_WORKER,
};

const SECOND: Duration = Duration::from_secs(1);

#[tokio::test]
async fn ready_then_ping_returns_echo() {
    let registry = registry();
    let id = registry.spawn(&sh_spec(ECHO_WORKER)).await.unwrap();

    registry.await_marker(&id, "[READY]", SECOND).await.unwrap();
    let response = registry.call(&id, "ping", "END", SECOND).await.unwrap();

    assert_eq!(response, "ping");
    registry.close(&id).await.unwrap();
}

#[tokio::test]
async fn sequential_calls_do_not_leak_into_each_other() {
    let registry = registry();
    let id = registry.spawn(&sh_spec(ECHO_WORKER)).await.unwrap();
    registry.await_marker(&id, "[READY]", SECOND).await.unwrap();

    for word in ["one", "two", "three"] {
        let response = registry.call(&id, word, "END", SECOND).await.unwrap();
        // The newline after the previous sentinel is drained with it.
        assert_eq!(response.trim_start_matches('\n'), word);
    }

    registry.close(&id).await.unwrap();
}

#[tokio::test]
async fn sentinel_split_across_reads_is_found() {
    let registry = registry();
    let id = registry.spawn(&sh_spec(SPLIT_SENTINEL_WORKER)).await.unwrap();
    registry.await_marker(&id, "[READY]", SECOND).await.unwrap();

    let response = registry
        .call(&id, "split", "END", Duration::from_secs(3))
        .await
        .unwrap();

    assert_eq!(response, "split");
    registry.close(&id).await.unwrap();
}

#[tokio::test]
async fn first_sentinel_wins() {
    let registry = registry();
    let id = registry.spawn(&sh_spec(DOUBLE_ANSWER_WORKER)).await.unwrap();
    registry.await_marker(&id, "[READY]", SECOND).await.unwrap();

    let response = registry.call(&id, "go", "END", SECOND).await.unwrap();
    assert_eq!(response, "a");

    // The trailing record was discarded with the first response.
    let next = registry.call(&id, "go", "END", SECOND).await.unwrap();
    assert_eq!(next.trim_start_matches('\n'), "a");

    registry.close(&id).await.unwrap();
}

#[tokio::test]
async fn missing_sentinel_times_out_within_one_poll_interval() {
    let registry = registry();
    let id = registry.spawn(&sh_spec(SILENT_WORKER)).await.unwrap();
    registry.await_marker(&id, "[READY]", SECOND).await.unwrap();

    let timeout = Duration::from_millis(500);
    let started = Instant::now();
    let err = registry.call(&id, "ping", "END", timeout).await.unwrap_err();
    let elapsed = started.elapsed();

    assert!(elapsed >= timeout, "returned early after {elapsed:?}");
    assert!(elapsed < Duration::from_millis(1000), "returned late after {elapsed:?}");
    match err {
        AppError::ResponseTimeout {
            sentinel, stdout, ..
        } => {
            assert_eq!(sentinel, "END");
            assert!(stdout.contains("working on ping"), "{stdout}");
        }
        other => panic!("unexpected error: {other:?}"),
    }

    assert!(registry.contains(&id).await, "timeout leaves the session open");
    registry.close(&id).await.unwrap();
}

#[tokio::test]
async fn readiness_timeout_reports_output_and_session_still_closes() {
    let registry = registry();
    let id = registry.spawn(&sh_spec(NEVER_READY_WORKER)).await.unwrap();

    let err = registry
        .await_marker(&id, "[READY]", Duration::from_millis(300))
        .await
        .unwrap_err();

    match err {
        AppError::ReadinessTimeout {
            key, marker, stdout, ..
        } => {
            assert!(key.is_none());
            assert_eq!(marker, "[READY]");
            assert_eq!(stdout, "loading...\n");
        }
        other => panic!("unexpected error: {other:?}"),
    }

    registry.close(&id).await.unwrap();
}

#[tokio::test]
async fn marker_already_printed_is_found_immediately() {
    let registry = registry();
    let id = registry.spawn(&sh_spec(ECHO_WORKER)).await.unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;

    let started = Instant::now();
    registry.await_marker(&id, "[READY]", SECOND).await.unwrap();
    assert!(started.elapsed() < Duration::from_millis(100));

    registry.close(&id).await.unwrap();
}

#[tokio::test]
async fn concurrent_calls_are_serialized() {
    let registry = registry();
    let id = registry.spawn(&sh_spec(SPLIT_SENTINEL_WORKER)).await.unwrap();
    registry.await_marker(&id, "[READY]", SECOND).await.unwrap();

    let timeout = Duration::from_secs(3);
    let (left, right) = tokio::join!(
        registry.call(&id, "left", "END", timeout),
        registry.call(&id, "right", "END", timeout),
    );

    let mut answers = vec![
        left.unwrap().trim_start_matches('\n').to_owned(),
        right.unwrap().trim_start_matches('\n').to_owned(),
    ];
    answers.sort();
    assert_eq!(answers, vec!["left", "right"]);

    registry.close(&id).await.unwrap();
}

#[tokio::test]
async fn calls_on_different_sessions_run_in_parallel() {
    let registry = registry();
    let a = registry.spawn(&sh_spec(SPLIT_SENTINEL_WORKER)).await.unwrap();
    let b = registry.spawn(&sh_spec(SPLIT_SENTINEL_WORKER)).await.unwrap();
    registry.await_marker(&a, "[READY]", SECOND).await.unwrap();
    registry.await_marker(&b, "[READY]", SECOND).await.unwrap();

    let started = Instant::now();
    let (left, right) = tokio::join!(
        registry.call(&a, "a", "END", SECOND),
        registry.call(&b, "b", "END", SECOND),
    );

    assert_eq!(left.unwrap(), "a");
    assert_eq!(right.unwrap(), "b");
    assert!(started.elapsed() < Duration::from_millis(590));

    registry.close_all().await.unwrap();
}

#[tokio::test]
async fn call_on_unknown_session_is_not_found() {
    let registry = registry();
    assert!(matches!(
        registry.call("missing", "ping", "END", SECOND).await,
        Err(AppError::SessionNotFound(_))
    ));
}

#[tokio::test]
async fn call_after_exit_fails_to_write() {
    let registry = registry();
    let id = registry
        .spawn(&sh_spec("printf '[READY]\\n'; exit 0"))
        .await
        .unwrap();
    registry.await_marker(&id, "[READY]", SECOND).await.unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;

    let first = registry.call(&id, "ping", "END", Duration::from_millis(200)).await;
    let second = registry.call(&id, "ping", "END", Duration::from_millis(200)).await;
    assert!(
        matches!(first, Err(AppError::WriteFailed(_)))
            || matches!(second, Err(AppError::WriteFailed(_))),
        "expected a write failure, got {first:?} / {second:?}"
    );

    registry.close(&id).await.unwrap();
}

#[tokio::test]
async fn blocked_request_write_is_bounded_by_call_timeout() {
    let registry = registry();
    let id = registry.spawn(&sh_spec(DEAF_WORKER)).await.unwrap();
    registry.await_marker(&id, "[READY]", SECOND).await.unwrap();

    let payload = "x".repeat(PIPE_FILLING_BYTES);
    let timeout = Duration::from_millis(500);
    let started = Instant::now();
    let result = tokio::time::timeout(
        Duration::from_secs(5),
        registry.call(&id, &payload, "END", timeout),
    )
    .await
    .expect("call must return within its own timeout");
    let elapsed = started.elapsed();

    assert!(
        matches!(result, Err(AppError::ResponseTimeout { .. })),
        "unexpected result: {result:?}"
    );
    assert!(elapsed >= timeout, "returned early after {elapsed:?}");
    assert!(elapsed < Duration::from_millis(1000), "returned late after {elapsed:?}");
    assert!(registry.contains(&id).await, "timeout leaves the session open");

    let closed = tokio::time::timeout(Duration::from_secs(8), registry.close(&id))
        .await
        .expect("close must reap a worker whose input pipe is full");
    assert!(matches!(closed, Ok(()) | Err(AppError::ProcessWait(_))));
    assert!(registry.is_empty().await);
}
