//! Per-session output accumulators.
//!
//! Each session owns one [`OutputBuffers`]: a stdout and a stderr byte
//! accumulator behind a single session-local lock. Reader tasks append;
//! protocol calls search, extract, and reset. Every append wakes pending
//! waiters so a sentinel is noticed as soon as it lands, with a fixed poll
//! interval as the fallback.

use std::fmt::{Display, Formatter};
use std::time::Duration;

use bytes::BytesMut;
use serde::Serialize;
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;

/// Which worker output stream a chunk came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamKind {
    /// The worker's standard output.
    Stdout,
    /// The worker's standard error.
    Stderr,
}

impl Display for StreamKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Stdout => f.write_str("stdout"),
            Self::Stderr => f.write_str("stderr"),
        }
    }
}

/// What to do with the stdout accumulator once a needle is found.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OnMatch {
    /// Leave the accumulator untouched (readiness detection).
    Keep,
    /// Clear the accumulator so trailing bytes cannot leak into the next call.
    Drain,
}

/// Consistent copy of both accumulators, decoded lossily as UTF-8.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct OutputSnapshot {
    /// Accumulated stdout text.
    pub stdout: String,
    /// Accumulated stderr text.
    pub stderr: String,
}

#[derive(Debug, Default)]
struct Streams {
    stdout: BytesMut,
    stderr: BytesMut,
}

/// Stdout/stderr accumulators with append notification.
#[derive(Debug, Default)]
pub struct OutputBuffers {
    streams: Mutex<Streams>,
    appended: Notify,
}

impl OutputBuffers {
    /// Create empty accumulators.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a chunk read from `stream` and wake every pending waiter.
    pub async fn append(&self, stream: StreamKind, chunk: &[u8]) {
        {
            let mut guard = self.streams.lock().await;
            match stream {
                StreamKind::Stdout => guard.stdout.extend_from_slice(chunk),
                StreamKind::Stderr => guard.stderr.extend_from_slice(chunk),
            }
        }
        self.appended.notify_waiters();
    }

    /// Copy both accumulators under the lock.
    pub async fn snapshot(&self) -> OutputSnapshot {
        let guard = self.streams.lock().await;
        OutputSnapshot {
            stdout: String::from_utf8_lossy(&guard.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&guard.stderr).into_owned(),
        }
    }

    /// Discard everything accumulated on stdout.
    pub async fn reset_stdout(&self) {
        self.streams.lock().await.stdout.clear();
    }

    /// Return the stdout text before the first occurrence of `needle`, if any.
    pub async fn extract(&self, needle: &str, on_match: OnMatch) -> Option<String> {
        let mut guard = self.streams.lock().await;
        let pos = find(&guard.stdout, needle.as_bytes())?;
        let head = String::from_utf8_lossy(&guard.stdout[..pos]).into_owned();
        if on_match == OnMatch::Drain {
            guard.stdout.clear();
        }
        Some(head)
    }

    /// Wait until stdout contains `needle` or `timeout` elapses.
    ///
    /// Returns the text preceding the first occurrence on success and `None`
    /// on timeout. A timeout is never reported before `timeout` has passed
    /// and the accumulator is re-checked at least every `poll_interval`.
    pub async fn wait_for(
        &self,
        needle: &str,
        timeout: Duration,
        poll_interval: Duration,
        on_match: OnMatch,
    ) -> Option<String> {
        let deadline = Instant::now() + timeout;

        loop {
            // Register interest before checking so an append racing with the
            // check still wakes us.
            let notified = self.appended.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(head) = self.extract(needle, on_match).await {
                return Some(head);
            }

            let now = Instant::now();
            if now >= deadline {
                return None;
            }

            let wake_at = std::cmp::min(now + poll_interval, deadline);
            tokio::select! {
                () = &mut notified => {}
                () = tokio::time::sleep_until(wake_at) => {}
            }
        }
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() {
        return Some(0);
    }
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}
