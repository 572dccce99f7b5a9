//! Streamable HTTP server transport: a single endpoint handling POST
//! (submit messages), GET (server-push stream) and DELETE (terminate the
//! session).
//!
//! Responses to the requests carried by one POST are streamed back as that
//! POST's response body; everything else the server wants to push rides the
//! session's unsolicited channel, drained by whichever GET stream is
//! listening.

use std::{
    collections::HashSet,
    io,
    net::SocketAddr,
    sync::{Arc, Mutex, Weak},
    time::Duration,
};

use axum::{
    body::{Body, Bytes},
    extract::{Extension, State},
    http::{header, HeaderMap, Response, StatusCode},
    routing::get,
    Router,
};
use futures::{Stream, StreamExt};
use tracing::Instrument;

use super::{
    channel::{self, FullPolicy},
    common::{
        http_header::{
            EVENT_STREAM_MIME_TYPE, HEADER_SESSION_ID, JSON_MIME_TYPE,
        },
        session_not_found_response,
        sse::{sse_body, sse_response, ServerSseEvent},
    },
    session::{Principal, SessionGuard, SessionRegistry, TransportKind},
    InboundMessage,
};
use crate::{
    error::{SessionAccessError, TransportError},
    model::{body_is_batch, JsonRpcMessage, RequestId},
};

/// Capacity 1, drop-oldest: a missing GET listener never blocks the
/// dispatcher, at the cost of best-effort delivery for unsolicited pushes.
const UNSOLICITED_CHANNEL_CAPACITY: usize = 1;
const POST_CHANNEL_CAPACITY: usize = 1;

/// State shared by the responses to one POST: the wait-mode channel feeding
/// the response body and the set of request ids still awaiting an answer.
/// The POST stream closes exactly when the set transitions to empty.
struct PostStream {
    tx: channel::Sender<JsonRpcMessage>,
    pending: Mutex<HashSet<RequestId>>,
}

/// Routing token tagged onto requests handed to the dispatcher, pointing
/// back at the POST that carried them. Resolves to nothing once that POST
/// has completed or aborted, in which case replies fall back to the
/// session's unsolicited channel.
#[derive(Clone)]
pub struct ReplyTo {
    post: Weak<PostStream>,
}

impl std::fmt::Debug for ReplyTo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplyTo")
            .field("active", &(self.post.strong_count() > 0))
            .finish()
    }
}

/// Per-session server endpoint for the streamable HTTP transport.
#[derive(Clone)]
pub struct StreamableHttpServerTransport {
    inner: Arc<TransportInner>,
}

struct TransportInner {
    inbound_tx: tokio::sync::mpsc::Sender<InboundMessage>,
    unsolicited_tx: channel::Sender<JsonRpcMessage>,
    unsolicited_rx: channel::Receiver<JsonRpcMessage>,
}

impl StreamableHttpServerTransport {
    pub(crate) fn new(inbound_tx: tokio::sync::mpsc::Sender<InboundMessage>) -> Self {
        let (unsolicited_tx, unsolicited_rx) =
            channel::channel(UNSOLICITED_CHANNEL_CAPACITY, FullPolicy::DropOldest);
        Self {
            inner: Arc::new(TransportInner {
                inbound_tx,
                unsolicited_tx,
                unsolicited_rx,
            }),
        }
    }

    /// Deserialize a POST body: one message, or a batch when the first
    /// non-whitespace byte opens an array. A JSON `null` matches no message
    /// shape and fails here.
    pub fn parse_body(body: &[u8]) -> Result<Vec<JsonRpcMessage>, serde_json::Error> {
        if body_is_batch(body) {
            serde_json::from_slice(body)
        } else {
            serde_json::from_slice(body).map(|message| vec![message])
        }
    }

    /// Feed one POST's messages to the dispatcher. Requests are tagged with
    /// a [`ReplyTo`] back-pointer and registered in the POST's pending set
    /// before anything is forwarded, so the set can only empty once — after
    /// the last response is sent.
    ///
    /// Returns `None` when the POST carried no requests (the caller answers
    /// 202 with no body), otherwise the response stream for the POST body.
    pub async fn handle_post(
        &self,
        messages: Vec<JsonRpcMessage>,
    ) -> Result<Option<PostResponseStream>, TransportError> {
        let (tx, rx) = channel::channel(POST_CHANNEL_CAPACITY, FullPolicy::Wait);
        let post = Arc::new(PostStream {
            tx,
            pending: Mutex::new(
                messages
                    .iter()
                    .filter_map(|message| message.request_id().cloned())
                    .collect(),
            ),
        });
        let has_requests = !post
            .pending
            .lock()
            .expect("post stream lock poisoned")
            .is_empty();

        for message in messages {
            let reply_to = message.is_request().then(|| ReplyTo {
                post: Arc::downgrade(&post),
            });
            self.inner
                .inbound_tx
                .send(InboundMessage { message, reply_to })
                .await
                .map_err(|_| TransportError::ChannelClosed)?;
        }

        if !has_requests {
            return Ok(None);
        }
        Ok(Some(PostResponseStream { rx, post }))
    }

    /// Route a dispatcher-produced message out. Responses retire their id
    /// from the originating POST's pending set and close that POST's stream
    /// on the transition to empty; messages whose tag no longer resolves go
    /// to the unsolicited channel (drop-oldest, never blocking).
    pub async fn send(
        &self,
        message: JsonRpcMessage,
        reply_to: Option<&ReplyTo>,
    ) -> Result<(), TransportError> {
        if let Some(post) = reply_to.and_then(|tag| tag.post.upgrade()) {
            let response_id = message.response_id().cloned();
            match post.tx.send(message).await {
                Ok(()) => {
                    if let Some(id) = response_id {
                        let emptied = {
                            let mut pending =
                                post.pending.lock().expect("post stream lock poisoned");
                            pending.remove(&id) && pending.is_empty()
                        };
                        if emptied {
                            post.tx.close();
                        }
                    }
                    return Ok(());
                }
                Err(channel::SendError(message)) => {
                    // The POST aborted mid-stream; deliver best-effort.
                    let _ = self.inner.unsolicited_tx.send(message).await;
                    return Ok(());
                }
            }
        }
        self.inner
            .unsolicited_tx
            .send(message)
            .await
            .map_err(|_| TransportError::ChannelClosed)
    }

    /// Server-push stream for a GET. Concurrent GETs share the channel as
    /// competing consumers; with drop-oldest semantics delivery is
    /// best-effort by design.
    pub fn unsolicited_stream(&self) -> impl Stream<Item = ServerSseEvent> + Send + 'static {
        let rx = self.inner.unsolicited_rx.clone();
        async_stream::stream! {
            while let Some(message) = rx.recv().await {
                yield ServerSseEvent::Message(message);
            }
        }
    }

    pub(crate) fn close(&self) {
        self.inner.unsolicited_tx.close();
    }
}

/// The response body of a POST that carried requests. Dropping it (client
/// disconnect) releases the POST stream abortively: pending replies reroute
/// to the unsolicited channel.
pub struct PostResponseStream {
    rx: channel::Receiver<JsonRpcMessage>,
    post: Arc<PostStream>,
}

impl PostResponseStream {
    pub fn into_event_stream(self) -> impl Stream<Item = ServerSseEvent> + Send + 'static {
        let PostResponseStream { rx, post } = self;
        async_stream::stream! {
            // Holding the Arc keeps the ReplyTo tags resolvable for the
            // lifetime of the stream.
            let _post = post;
            while let Some(message) = rx.recv().await {
                yield ServerSseEvent::Message(message);
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct StreamableHttpServerConfig {
    pub bind: SocketAddr,
    /// Interval for `: ping` comment frames on idle SSE streams; `None`
    /// disables them.
    pub sse_keep_alive: Option<Duration>,
}

impl Default for StreamableHttpServerConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([127, 0, 0, 1], 0)),
            sse_keep_alive: Some(Duration::from_secs(15)),
        }
    }
}

/// Axum service exposing a [`SessionRegistry`] over the streamable HTTP
/// wire: `POST /`, `GET /`, `DELETE /`.
#[derive(Clone)]
pub struct StreamableHttpServer {
    pub config: StreamableHttpServerConfig,
    registry: Arc<SessionRegistry>,
}

impl StreamableHttpServer {
    pub fn new(
        registry: Arc<SessionRegistry>,
        config: StreamableHttpServerConfig,
    ) -> (Self, Router) {
        let server = Self { config, registry };
        let router = Router::new()
            .route(
                "/",
                get(get_handler).post(post_handler).delete(delete_handler),
            )
            .with_state(server.clone());
        (server, router)
    }

    pub async fn serve(registry: Arc<SessionRegistry>, bind: SocketAddr) -> io::Result<Self> {
        Self::serve_with_config(
            registry,
            StreamableHttpServerConfig {
                bind,
                ..Default::default()
            },
        )
        .await
    }

    /// Bind and serve in the background; shuts down gracefully when the
    /// registry does. `config.bind` is updated with the bound address,
    /// which matters when the port is 0.
    pub async fn serve_with_config(
        registry: Arc<SessionRegistry>,
        mut config: StreamableHttpServerConfig,
    ) -> io::Result<Self> {
        let listener = tokio::net::TcpListener::bind(config.bind).await?;
        config.bind = listener.local_addr()?;
        let (server, router) = Self::new(registry.clone(), config);
        let ct = registry.cancellation_token().child_token();
        let bind = server.config.bind;
        let serve = axum::serve(listener, router).with_graceful_shutdown(async move {
            ct.cancelled().await;
            tracing::info!("streamable http server cancelled");
        });
        tokio::spawn(
            async move {
                if let Err(e) = serve.await {
                    tracing::error!(error = %e, "streamable http server shutdown with error");
                }
            }
            .instrument(tracing::info_span!("streamable-http-server", bind_address = %bind)),
        );
        Ok(server)
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }
}

fn text_response(status: StatusCode, message: &'static str) -> Response<Body> {
    Response::builder()
        .status(status)
        .body(Body::from(message))
        .expect("static response must build")
}

fn empty_response(status: StatusCode) -> Response<Body> {
    Response::builder()
        .status(status)
        .body(Body::empty())
        .expect("static response must build")
}

fn with_session_header(mut response: Response<Body>, session_id: &str) -> Response<Body> {
    if let Ok(value) = header::HeaderValue::from_str(session_id) {
        response.headers_mut().insert(HEADER_SESSION_ID, value);
    }
    response
}

fn header_contains(headers: &HeaderMap, name: header::HeaderName, needle: &str) -> bool {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| value.contains(needle))
}

/// Session lookup shared by the three handlers. `Err` is a ready-to-send
/// response for the failure cases of the session taxonomy.
fn resolve_session(
    registry: &Arc<SessionRegistry>,
    session_id: &str,
    principal: Option<&Principal>,
) -> Result<SessionGuard, Response<Body>> {
    match registry.find_session(session_id, principal) {
        Ok(session) => Ok(SessionGuard::new(session)),
        Err(SessionAccessError::NotFound) => Err(session_not_found_response()),
        Err(SessionAccessError::UserMismatch) => Err(empty_response(StatusCode::FORBIDDEN)),
    }
}

fn stream_with_guard<S>(
    events: S,
    guard: SessionGuard,
) -> impl Stream<Item = ServerSseEvent> + Send + 'static
where
    S: Stream<Item = ServerSseEvent> + Send + 'static,
{
    async_stream::stream! {
        let _guard = guard;
        let mut events = std::pin::pin!(events);
        while let Some(event) = events.next().await {
            yield event;
        }
    }
}

async fn post_handler(
    State(server): State<StreamableHttpServer>,
    headers: HeaderMap,
    principal: Option<Extension<Principal>>,
    body: Bytes,
) -> Response<Body> {
    if !header_contains(&headers, header::ACCEPT, JSON_MIME_TYPE)
        || !header_contains(&headers, header::ACCEPT, EVENT_STREAM_MIME_TYPE)
    {
        return text_response(
            StatusCode::NOT_ACCEPTABLE,
            "Not Acceptable: Client must accept both application/json and text/event-stream",
        );
    }
    if !header_contains(&headers, header::CONTENT_TYPE, JSON_MIME_TYPE) {
        return text_response(
            StatusCode::UNSUPPORTED_MEDIA_TYPE,
            "Unsupported Media Type: Content-Type must be application/json",
        );
    }

    // Parse before touching session state: a malformed body is a protocol
    // fault of this request and must leave the session alive.
    let messages = match StreamableHttpServerTransport::parse_body(&body) {
        Ok(messages) => messages,
        Err(e) => {
            tracing::warn!(error = %e, "malformed POST body");
            return text_response(StatusCode::INTERNAL_SERVER_ERROR, "malformed message");
        }
    };

    let principal = principal.as_ref().map(|extension| &extension.0);
    let guard = match headers.get(HEADER_SESSION_ID) {
        Some(value) => {
            let Ok(session_id) = value.to_str() else {
                return text_response(StatusCode::BAD_REQUEST, "invalid session id header");
            };
            match resolve_session(server.registry(), session_id, principal) {
                Ok(guard) => guard,
                Err(response) => return response,
            }
        }
        None => SessionGuard::new(
            server
                .registry()
                .create_session(principal, TransportKind::StreamableHttp),
        ),
    };
    let session_id = guard.id().clone();
    tracing::debug!(%session_id, count = messages.len(), "client POST");

    let Some(transport) = guard.transport().as_streamable_http() else {
        return text_response(StatusCode::BAD_REQUEST, "session uses a different transport");
    };
    let transport = transport.clone();

    match transport.handle_post(messages).await {
        Ok(None) => with_session_header(empty_response(StatusCode::ACCEPTED), &session_id),
        Ok(Some(post_stream)) => {
            let events = stream_with_guard(post_stream.into_event_stream(), guard);
            let response = sse_response(sse_body(events, server.config.sse_keep_alive));
            with_session_header(response, &session_id)
        }
        Err(e) => {
            tracing::error!(%session_id, error = %e, "failed to enqueue POST messages");
            text_response(StatusCode::INTERNAL_SERVER_ERROR, "session terminated")
        }
    }
}

async fn get_handler(
    State(server): State<StreamableHttpServer>,
    headers: HeaderMap,
    principal: Option<Extension<Principal>>,
) -> Response<Body> {
    if !header_contains(&headers, header::ACCEPT, EVENT_STREAM_MIME_TYPE) {
        return text_response(
            StatusCode::NOT_ACCEPTABLE,
            "Not Acceptable: Client must accept text/event-stream",
        );
    }
    let Some(session_id) = headers
        .get(HEADER_SESSION_ID)
        .and_then(|value| value.to_str().ok())
    else {
        return text_response(StatusCode::BAD_REQUEST, "missing session id header");
    };

    let principal = principal.as_ref().map(|extension| &extension.0);
    let guard = match resolve_session(server.registry(), session_id, principal) {
        Ok(guard) => guard,
        Err(response) => return response,
    };
    tracing::debug!(%session_id, "client GET for server-push stream");

    let Some(transport) = guard.transport().as_streamable_http() else {
        return text_response(StatusCode::BAD_REQUEST, "session uses a different transport");
    };
    let events = stream_with_guard(transport.unsolicited_stream(), guard);
    let response = sse_response(sse_body(events, server.config.sse_keep_alive));
    with_session_header(response, session_id)
}

async fn delete_handler(
    State(server): State<StreamableHttpServer>,
    headers: HeaderMap,
    principal: Option<Extension<Principal>>,
) -> Response<Body> {
    let Some(session_id) = headers
        .get(HEADER_SESSION_ID)
        .and_then(|value| value.to_str().ok())
    else {
        return text_response(StatusCode::BAD_REQUEST, "missing session id header");
    };

    let principal = principal.as_ref().map(|extension| &extension.0);
    if let Err(response) = resolve_session(server.registry(), session_id, principal) {
        return response;
    }
    server.registry().delete_session(session_id);
    tracing::info!(%session_id, "session closed by client");
    with_session_header(empty_response(StatusCode::OK), session_id)
}
