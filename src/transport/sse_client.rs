//! Legacy HTTP+SSE client: a long-lived GET stream plus a POST endpoint the
//! server advertises through the `endpoint` bootstrap event.
//!
//! Reference: <https://html.spec.whatwg.org/multipage/server-sent-events.html>

use std::sync::Arc;

use futures::{stream::BoxStream, StreamExt};
use reqwest::{
    header::{HeaderMap, HeaderValue, ACCEPT, CONTENT_TYPE},
    Url,
};
use sse_stream::{Error as SseError, Sse, SseStream};

use super::common::http_header::{EVENT_STREAM_MIME_TYPE, HEADER_PROTOCOL_VERSION, JSON_MIME_TYPE};
use crate::{error::TransportError, model::JsonRpcMessage};

/// Outcome of the connect handshake: the advertised POST endpoint and the
/// remainder of the event stream (everything after the `endpoint` event).
pub struct SseConnection {
    pub post_uri: Url,
    pub stream: BoxStream<'static, Result<Sse, SseError>>,
}

#[derive(Debug, Clone)]
pub struct SseClient {
    http: reqwest::Client,
    endpoint: Url,
    additional_headers: Arc<HeaderMap>,
}

impl SseClient {
    pub fn new(http: reqwest::Client, endpoint: Url, additional_headers: Arc<HeaderMap>) -> Self {
        Self {
            http,
            endpoint,
            additional_headers,
        }
    }

    /// Open the GET stream and wait for the `endpoint` event. Events of any
    /// other type arriving first are skipped, matching the other SDKs.
    pub async fn connect(&self) -> Result<SseConnection, TransportError> {
        let response = self
            .http
            .get(self.endpoint.clone())
            .headers((*self.additional_headers).clone())
            .header(ACCEPT, HeaderValue::from_static(EVENT_STREAM_MIME_TYPE))
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(TransportError::UnexpectedStatus(response.status()));
        }
        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok());
        if !content_type.is_some_and(|ct| ct.starts_with(EVENT_STREAM_MIME_TYPE)) {
            return Err(TransportError::UnexpectedContentType(
                content_type.map(str::to_owned),
            ));
        }

        let mut stream = SseStream::from_byte_stream(response.bytes_stream()).boxed();
        let endpoint = loop {
            let sse = stream
                .next()
                .await
                .ok_or(TransportError::MissingEndpointEvent)??;
            if sse.event.as_deref() != Some("endpoint") {
                continue;
            }
            break sse.data.ok_or(TransportError::MissingEndpointEvent)?;
        };
        let post_uri = self.endpoint.join(&endpoint)?;
        tracing::debug!(%post_uri, "sse endpoint event received");
        Ok(SseConnection { post_uri, stream })
    }

    /// Submit one message to the advertised POST endpoint. The reply, if
    /// any, arrives on the GET stream; the POST itself only acknowledges.
    pub async fn post_message(
        &self,
        post_uri: &Url,
        message: &JsonRpcMessage,
        protocol_version: Option<&str>,
    ) -> Result<(), TransportError> {
        let mut request = self
            .http
            .post(post_uri.clone())
            .headers((*self.additional_headers).clone())
            .header(CONTENT_TYPE, HeaderValue::from_static(JSON_MIME_TYPE))
            .json(message);
        if let Some(version) = protocol_version {
            request = request.header(HEADER_PROTOCOL_VERSION, version);
        }
        let response = request.send().await?;
        if !response.status().is_success() {
            return Err(TransportError::UnexpectedStatus(response.status()));
        }
        Ok(())
    }
}
