//! Reader tasks draining worker output into the session accumulators.
//!
//! Exactly one reader owns each captured stream. A reader runs until its
//! stream reports end-of-file or a read error, or until the session's
//! cancellation token fires after the process has been reaped. It is never
//! restarted: once stdout closes the session produces no further responses.

use std::sync::Arc;

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::session::buffers::{OutputBuffers, StreamKind};

/// Bytes requested from the pipe per read.
pub const READ_CHUNK_BYTES: usize = 4096;

/// Drain `source` into the `stream` accumulator of `buffers`.
///
/// Each chunk is appended under the session lock in the order it was read
/// and mirrored to `tracing` at `TRACE` level for diagnostics.
pub async fn run_reader<R>(
    session_id: String,
    stream: StreamKind,
    mut source: R,
    buffers: Arc<OutputBuffers>,
    cancel: CancellationToken,
) where
    R: AsyncRead + Unpin + Send,
{
    let mut chunk = BytesMut::with_capacity(READ_CHUNK_BYTES);

    loop {
        chunk.clear();
        chunk.reserve(READ_CHUNK_BYTES);

        tokio::select! {
            biased;

            () = cancel.cancelled() => {
                debug!(session_id, %stream, "reader: cancellation received, stopping");
                break;
            }

            read = source.read_buf(&mut chunk) => {
                match read {
                    Ok(0) => {
                        debug!(session_id, %stream, "reader: end of stream");
                        break;
                    }
                    Ok(n) => {
                        trace!(
                            session_id,
                            %stream,
                            bytes = n,
                            text = %String::from_utf8_lossy(&chunk),
                            "worker output"
                        );
                        buffers.append(stream, &chunk).await;
                    }
                    Err(err) => {
                        warn!(session_id, %stream, %err, "reader: read error, stopping");
                        break;
                    }
                }
            }
        }
    }
}
