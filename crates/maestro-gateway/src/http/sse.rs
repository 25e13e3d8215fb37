//! Shared SSE plumbing for streaming endpoints.

use std::convert::Infallible;
use std::time::Duration;

use axum::http::header;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::IntoResponse;
use futures_util::Stream;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use maestro_protocol::frames::StreamFrame;

/// Cancels the engine run when the client goes away: the response stream
/// is dropped on disconnect, which drops this guard.
struct CancelOnDrop(CancellationToken);

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        self.0.cancel();
    }
}

fn sse_headers() -> [(header::HeaderName, &'static str); 2] {
    [
        (header::CACHE_CONTROL, "no-cache"),
        (header::CONNECTION, "keep-alive"),
    ]
}

/// Bridge a frame channel into an SSE response.
///
/// Frames arrive pre-recorded from the engine; the heartbeat comment is
/// produced by the keep-alive layer and never touches the ledger. The
/// stream closes after the terminal frame.
pub fn frame_response(
    rx: mpsc::Receiver<StreamFrame>,
    cancel: CancellationToken,
    heartbeat_interval_s: u64,
) -> impl IntoResponse {
    let stream = async_stream::stream! {
        let _guard = CancelOnDrop(cancel);
        let mut rx = rx;
        while let Some(frame) = rx.recv().await {
            let terminal = frame.kind.is_terminal();
            match serde_json::to_string(&frame) {
                Ok(json) => yield Ok::<_, Infallible>(Event::default().data(json)),
                Err(e) => {
                    tracing::error!(error = %e, "frame serialization failed");
                }
            }
            if terminal {
                break;
            }
        }
    };
    let sse = Sse::new(stream).keep_alive(keep_alive(heartbeat_interval_s));
    (sse_headers(), sse)
}

/// SSE response over pre-serialized frame JSON (ledger replay).
pub fn json_response<S>(stream: S, heartbeat_interval_s: u64) -> impl IntoResponse
where
    S: Stream<Item = String> + Send + 'static,
{
    let stream = async_stream::stream! {
        futures_util::pin_mut!(stream);
        while let Some(json) = futures_util::StreamExt::next(&mut stream).await {
            yield Ok::<_, Infallible>(Event::default().data(json));
        }
    };
    let sse = Sse::new(stream).keep_alive(keep_alive(heartbeat_interval_s));
    (sse_headers(), sse)
}

fn keep_alive(heartbeat_interval_s: u64) -> KeepAlive {
    KeepAlive::new()
        .interval(Duration::from_secs(heartbeat_interval_s.max(1)))
        .text("")
}
