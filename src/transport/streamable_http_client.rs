//! Streamable HTTP client: POST to submit messages, GET for the server-push
//! stream, DELETE to end the session.

use std::sync::Arc;

use futures::{stream::BoxStream, StreamExt};
use reqwest::{
    header::{HeaderMap, HeaderValue, ACCEPT, CONTENT_TYPE},
    StatusCode, Url,
};
use sse_stream::{Error as SseError, Sse, SseStream};

use super::common::http_header::{
    EVENT_STREAM_MIME_TYPE, HEADER_PROTOCOL_VERSION, HEADER_SESSION_ID, JSON_MIME_TYPE,
};
use crate::{error::TransportError, model::JsonRpcMessage};

pub type BoxedSseStream = BoxStream<'static, Result<Sse, SseError>>;

/// What a POST came back with: nothing (202), one JSON message, or an SSE
/// stream carrying the responses to the submitted requests.
pub enum PostResponse {
    Accepted,
    Json(JsonRpcMessage, Option<String>),
    Sse(BoxedSseStream, Option<String>),
}

/// Per-request header context: the session id once the server assigned one,
/// and the negotiated protocol version once `initialize` completed.
#[derive(Debug, Default, Clone, Copy)]
pub struct RequestContext<'a> {
    pub session_id: Option<&'a str>,
    pub protocol_version: Option<&'a str>,
}

#[derive(Debug, Clone)]
pub struct StreamableHttpClient {
    http: reqwest::Client,
    endpoint: Url,
    additional_headers: Arc<HeaderMap>,
}

impl StreamableHttpClient {
    pub fn new(http: reqwest::Client, endpoint: Url, additional_headers: Arc<HeaderMap>) -> Self {
        Self {
            http,
            endpoint,
            additional_headers,
        }
    }

    fn apply_context(
        &self,
        mut request: reqwest::RequestBuilder,
        context: RequestContext<'_>,
    ) -> reqwest::RequestBuilder {
        request = request.headers((*self.additional_headers).clone());
        if let Some(session_id) = context.session_id {
            request = request.header(HEADER_SESSION_ID, session_id);
        }
        if let Some(version) = context.protocol_version {
            request = request.header(HEADER_PROTOCOL_VERSION, version);
        }
        request
    }

    pub async fn post_message(
        &self,
        message: &JsonRpcMessage,
        context: RequestContext<'_>,
    ) -> Result<PostResponse, TransportError> {
        let request = self
            .http
            .post(self.endpoint.clone())
            .header(
                ACCEPT,
                HeaderValue::from_static("application/json, text/event-stream"),
            )
            .header(CONTENT_TYPE, HeaderValue::from_static(JSON_MIME_TYPE))
            .json(message);
        let response = self.apply_context(request, context).send().await?;
        if !response.status().is_success() {
            return Err(TransportError::UnexpectedStatus(response.status()));
        }
        if response.status() == StatusCode::ACCEPTED {
            return Ok(PostResponse::Accepted);
        }

        let session_id = response
            .headers()
            .get(HEADER_SESSION_ID)
            .and_then(|value| value.to_str().ok())
            .map(str::to_owned);
        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .map(str::to_owned);
        match content_type.as_deref() {
            Some(ct) if ct.starts_with(EVENT_STREAM_MIME_TYPE) => {
                let stream = SseStream::from_byte_stream(response.bytes_stream()).boxed();
                Ok(PostResponse::Sse(stream, session_id))
            }
            Some(ct) if ct.starts_with(JSON_MIME_TYPE) => {
                let message: JsonRpcMessage = response.json().await?;
                Ok(PostResponse::Json(message, session_id))
            }
            other => Err(TransportError::UnexpectedContentType(
                other.map(str::to_owned),
            )),
        }
    }

    /// Open the standalone server-push stream. Servers that do not offer one
    /// answer 405, surfaced as `UnexpectedStatus` for the caller to tolerate.
    pub async fn get_stream(
        &self,
        context: RequestContext<'_>,
    ) -> Result<BoxedSseStream, TransportError> {
        let request = self
            .http
            .get(self.endpoint.clone())
            .header(ACCEPT, HeaderValue::from_static(EVENT_STREAM_MIME_TYPE));
        let response = self.apply_context(request, context).send().await?;
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
        Ok(SseStream::from_byte_stream(response.bytes_stream()).boxed())
    }

    /// Terminate the session. A 405 means the server does not track
    /// sessions; that is not a failure of disposal.
    pub async fn delete_session(&self, context: RequestContext<'_>) -> Result<(), TransportError> {
        let request = self.http.delete(self.endpoint.clone());
        let response = self.apply_context(request, context).send().await?;
        if response.status() == StatusCode::METHOD_NOT_ALLOWED {
            tracing::debug!("server does not support session delete");
            return Ok(());
        }
        if !response.status().is_success() {
            return Err(TransportError::UnexpectedStatus(response.status()));
        }
        Ok(())
    }
}
