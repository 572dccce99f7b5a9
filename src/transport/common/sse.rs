//! Server-side SSE emission.
//!
//! Outgoing messages are framed by hand rather than through a framework SSE
//! type: the `endpoint` bootstrap event carries raw URL bytes, not JSON, and
//! the wire tests pin exact frame bytes.

use std::{convert::Infallible, time::Duration};

use axum::{
    body::Body,
    http::{header, Response, StatusCode},
};
use bytes::Bytes;
use futures::{Stream, StreamExt};

use super::http_header::{EVENT_STREAM_MIME_TYPE, HEADER_X_ACCEL_BUFFERING};
use crate::model::JsonRpcMessage;

/// One item of a server-push stream.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerSseEvent {
    /// Legacy bootstrap event advertising the POST endpoint; the payload is
    /// the raw relative URL.
    Endpoint(String),
    /// A JSON-RPC message, emitted with an explicit `event: message` tag for
    /// cross-SDK compatibility.
    Message(JsonRpcMessage),
}

/// Serializes [`ServerSseEvent`]s into wire frames, reusing one buffer
/// across items.
#[derive(Debug, Default)]
pub struct SseEncoder {
    buf: Vec<u8>,
}

impl SseEncoder {
    pub fn encode(&mut self, event: &ServerSseEvent) -> Result<Bytes, serde_json::Error> {
        self.buf.clear();
        match event {
            ServerSseEvent::Endpoint(url) => {
                self.buf.extend_from_slice(b"event: endpoint\ndata: ");
                self.buf.extend_from_slice(url.as_bytes());
            }
            ServerSseEvent::Message(message) => {
                self.buf.extend_from_slice(b"event: message\ndata: ");
                serde_json::to_writer(&mut self.buf, message)?;
            }
        }
        self.buf.extend_from_slice(b"\n\n");
        Ok(Bytes::copy_from_slice(&self.buf))
    }
}

const PING_FRAME: &[u8] = b": ping\n\n";

/// Turn a stream of events into a streaming response body: one SSE frame per
/// event, optional comment pings while idle, terminating when the event
/// stream ends. Dropping the body (client disconnect) drops the event stream
/// with it, so writes after an abort simply never happen.
pub fn sse_body<S>(events: S, keep_alive: Option<Duration>) -> Body
where
    S: Stream<Item = ServerSseEvent> + Send + 'static,
{
    let frames = async_stream::stream! {
        let mut events = std::pin::pin!(events);
        let mut encoder = SseEncoder::default();
        let mut keep_alive_timer = keep_alive.map(|period| {
            tokio::time::interval_at(tokio::time::Instant::now() + period, period)
        });
        loop {
            tokio::select! {
                event = events.next() => {
                    let Some(event) = event else { break };
                    match encoder.encode(&event) {
                        Ok(frame) => yield Ok::<_, Infallible>(frame),
                        // An unserializable message is dropped rather than
                        // tearing down the stream.
                        Err(e) => tracing::warn!("failed to encode sse frame: {e}"),
                    }
                }
                _ = tick(&mut keep_alive_timer) => {
                    yield Ok(Bytes::from_static(PING_FRAME));
                }
            }
        }
    };
    Body::from_stream(frames)
}

async fn tick(timer: &mut Option<tokio::time::Interval>) {
    match timer.as_mut() {
        Some(timer) => {
            timer.tick().await;
        }
        None => std::future::pending().await,
    }
}

/// Wrap an SSE body with the response headers every event stream carries:
/// `text/event-stream`, caching and buffering disabled, identity encoding.
pub fn sse_response(body: Body) -> Response<Body> {
    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, EVENT_STREAM_MIME_TYPE)
        .header(header::CACHE_CONTROL, "no-cache,no-store")
        .header(header::CONTENT_ENCODING, "identity")
        .header(HEADER_X_ACCEL_BUFFERING, "no")
        .body(body)
        .expect("static response must build")
}
