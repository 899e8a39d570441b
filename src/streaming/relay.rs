//! Relay of raw backend SSE chunks to the caller.

use axum::{
    body::Body,
    http::{header, HeaderName, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
};
use bytes::Bytes;
use tokio::sync::mpsc;

/// Capacity of the channel between the dispatcher and the caller's response body.
pub const STREAM_CHANNEL_CAPACITY: usize = 64;

/// Sink receiving raw chunks of a streamed completion.
pub type StreamSink = mpsc::Sender<Bytes>;

pub fn stream_channel() -> (StreamSink, mpsc::Receiver<Bytes>) {
    mpsc::channel(STREAM_CHANNEL_CAPACITY)
}

/// Build an SSE response whose body yields `first` followed by everything
/// received on `rx`, untouched.
pub fn sse_response(
    first: Option<Bytes>,
    mut rx: mpsc::Receiver<Bytes>,
    extra_headers: Vec<(HeaderName, HeaderValue)>,
) -> Response {
    let stream = async_stream::stream! {
        if let Some(chunk) = first {
            yield Ok::<Bytes, std::io::Error>(chunk);
        }
        while let Some(chunk) = rx.recv().await {
            yield Ok(chunk);
        }
    };

    let mut response = (
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, HeaderValue::from_static("text/event-stream")),
            (header::CACHE_CONTROL, HeaderValue::from_static("no-cache")),
            (header::CONNECTION, HeaderValue::from_static("keep-alive")),
        ],
        Body::from_stream(stream),
    )
        .into_response();

    let headers = response.headers_mut();
    for (name, value) in extra_headers {
        headers.insert(name, value);
    }
    response
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_relays_chunks_unmodified() {
        let (tx, rx) = stream_channel();
        let response = sse_response(
            Some(Bytes::from_static(b"data: {\"a\":1}\n\n")),
            rx,
            vec![(HeaderName::from_static("x-thread-id"), HeaderValue::from_static("t-1"))],
        );

        tx.send(Bytes::from_static(b"data: [DONE]\n\n")).await.unwrap();
        drop(tx);

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[header::CONTENT_TYPE], "text/event-stream");
        assert_eq!(response.headers()["x-thread-id"], "t-1");

        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        assert_eq!(&body[..], b"data: {\"a\":1}\n\ndata: [DONE]\n\n");
    }
}
