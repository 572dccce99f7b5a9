#![allow(dead_code)]

use std::{sync::Arc, time::Duration};

use anyhow::{anyhow, Context as _};
use bytes::Bytes;
use futures::{Stream, StreamExt};
use serde_json::json;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use mcp_http_transport::{
    model::{ErrorCode, ErrorData, JsonRpcMessage, JsonRpcRequest},
    transport::{DispatcherFactory, InboundMessage, SessionContext},
};

pub fn init_tracing() {
    let _ = tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".to_string().into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .try_init();
}

/// Dispatcher used by every suite: answers `initialize` with a fixed server
/// identity and `tools/call` for the `echo` tool by reflecting the message
/// argument. Notifications are consumed silently.
pub fn echo_dispatcher() -> DispatcherFactory {
    let factory: DispatcherFactory = Arc::new(|mut context: SessionContext| {
        Box::pin(async move {
            loop {
                let envelope = tokio::select! {
                    _ = context.ct.cancelled() => break,
                    envelope = context.inbound.recv() => match envelope {
                        Some(envelope) => envelope,
                        None => break,
                    },
                };
                let InboundMessage { message, reply_to } = envelope;
                if let JsonRpcMessage::Request(request) = message {
                    let reply = handle_request(&request);
                    context.sender.send(reply, reply_to.as_ref()).await?;
                }
            }
            Ok(())
        })
    });
    factory
}

fn handle_request(request: &JsonRpcRequest) -> JsonRpcMessage {
    match request.method.as_str() {
        "initialize" => JsonRpcMessage::response(
            request.id.clone(),
            json!({
                "protocolVersion": "2025-03-26",
                "capabilities": {"tools": {}},
                "serverInfo": {"name": "TestServer", "version": "73"}
            }),
        ),
        "tools/call" => {
            let params = request.params.clone().unwrap_or_default();
            if params["name"] == "echo" {
                JsonRpcMessage::response(
                    request.id.clone(),
                    json!({
                        "content": [{"type": "text", "text": params["arguments"]["message"]}]
                    }),
                )
            } else {
                JsonRpcMessage::error(
                    request.id.clone(),
                    ErrorData::new(ErrorCode::INVALID_PARAMS, "Unknown tool", None),
                )
            }
        }
        _ => JsonRpcMessage::error(
            request.id.clone(),
            ErrorData::new(ErrorCode::METHOD_NOT_FOUND, "Method not found", None),
        ),
    }
}

pub fn initialize_request(id: i64) -> JsonRpcMessage {
    JsonRpcMessage::request(
        id,
        "initialize",
        Some(json!({
            "protocolVersion": "2025-03-26",
            "capabilities": {},
            "clientInfo": {"name": "test-client", "version": "0.1"}
        })),
    )
}

pub fn echo_request(id: i64, text: &str) -> JsonRpcMessage {
    JsonRpcMessage::request(
        id,
        "tools/call",
        Some(json!({"name": "echo", "arguments": {"message": text}})),
    )
}

#[derive(Debug, Clone, PartialEq)]
pub struct SseFrame {
    pub event: Option<String>,
    pub data: String,
}

/// Split a complete SSE body into frames, ignoring comment-only chunks.
pub fn parse_sse_frames(body: &str) -> Vec<SseFrame> {
    body.split("\n\n")
        .filter_map(|chunk| {
            let mut event = None;
            let mut data = Vec::new();
            for line in chunk.lines() {
                if let Some(value) = line.strip_prefix("event: ") {
                    event = Some(value.to_string());
                } else if let Some(value) = line.strip_prefix("data: ") {
                    data.push(value.to_string());
                }
            }
            if event.is_none() && data.is_empty() {
                return None;
            }
            Some(SseFrame {
                event,
                data: data.join("\n"),
            })
        })
        .collect()
}

/// Read the next non-comment frame from a live byte stream, buffering
/// partial chunks across reads.
pub async fn read_frame<S>(stream: &mut S, buf: &mut String) -> anyhow::Result<SseFrame>
where
    S: Stream<Item = reqwest::Result<Bytes>> + Unpin,
{
    loop {
        if let Some(position) = buf.find("\n\n") {
            let chunk: String = buf.drain(..position + 2).collect();
            if let Some(frame) = parse_sse_frames(&chunk).into_iter().next() {
                return Ok(frame);
            }
            continue;
        }
        let chunk = tokio::time::timeout(Duration::from_secs(5), stream.next())
            .await
            .context("timed out waiting for an sse frame")?
            .ok_or_else(|| anyhow!("sse stream ended"))??;
        buf.push_str(std::str::from_utf8(&chunk)?);
    }
}
