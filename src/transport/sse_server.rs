//! Legacy HTTP+SSE server transport: a long-lived `GET /sse` stream for
//! server-to-client messages plus a `POST /message?sessionId=…` endpoint for
//! client-to-server messages.
//!
//! The GET owns the session: the first frame is the `endpoint` bootstrap
//! event advertising the POST URL, and when the stream ends the session is
//! deleted.

use std::{io, net::SocketAddr, sync::Arc, time::Duration};

use axum::{
    body::{Body, Bytes},
    extract::{Extension, Query, State},
    http::{Response, StatusCode},
    routing::{get, post},
    Router,
};
use futures::Stream;
use tracing::Instrument;

use super::{
    channel::{self, FullPolicy},
    common::{
        session_not_found_response,
        sse::{sse_body, sse_response, ServerSseEvent},
    },
    session::{Principal, SessionGuard, SessionId, SessionRegistry, TransportKind},
    InboundMessage,
};
use crate::{
    error::{SessionAccessError, TransportError},
    model::JsonRpcMessage,
};

const OUTBOUND_CHANNEL_CAPACITY: usize = 64;

/// Per-session server endpoint for the legacy transport. All outgoing
/// traffic, solicited or not, rides the single GET stream.
#[derive(Clone)]
pub struct SseServerTransport {
    inner: Arc<TransportInner>,
}

struct TransportInner {
    inbound_tx: tokio::sync::mpsc::Sender<InboundMessage>,
    outbound_tx: channel::Sender<JsonRpcMessage>,
    outbound_rx: channel::Receiver<JsonRpcMessage>,
}

impl SseServerTransport {
    pub(crate) fn new(inbound_tx: tokio::sync::mpsc::Sender<InboundMessage>) -> Self {
        let (outbound_tx, outbound_rx) =
            channel::channel(OUTBOUND_CHANNEL_CAPACITY, FullPolicy::Wait);
        Self {
            inner: Arc::new(TransportInner {
                inbound_tx,
                outbound_tx,
                outbound_rx,
            }),
        }
    }

    /// Forward one client message to the dispatcher. Replies come back on
    /// the GET stream, so nothing is tagged.
    pub async fn accept_message(&self, message: JsonRpcMessage) -> Result<(), TransportError> {
        self.inner
            .inbound_tx
            .send(InboundMessage {
                message,
                reply_to: None,
            })
            .await
            .map_err(|_| TransportError::ChannelClosed)
    }

    pub async fn send(&self, message: JsonRpcMessage) -> Result<(), TransportError> {
        self.inner
            .outbound_tx
            .send(message)
            .await
            .map_err(|_| TransportError::ChannelClosed)
    }

    pub fn outbound_stream(&self) -> impl Stream<Item = ServerSseEvent> + Send + 'static {
        let rx = self.inner.outbound_rx.clone();
        async_stream::stream! {
            while let Some(message) = rx.recv().await {
                yield ServerSseEvent::Message(message);
            }
        }
    }

    pub(crate) fn close(&self) {
        self.inner.outbound_tx.close();
    }
}

#[derive(Debug, Clone)]
pub struct SseServerConfig {
    pub bind: SocketAddr,
    pub sse_path: String,
    pub post_path: String,
    pub sse_keep_alive: Option<Duration>,
}

impl Default for SseServerConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([127, 0, 0, 1], 0)),
            sse_path: "/sse".to_string(),
            post_path: "/message".to_string(),
            sse_keep_alive: Some(Duration::from_secs(15)),
        }
    }
}

/// Axum service exposing a [`SessionRegistry`] over the legacy wire.
#[derive(Clone)]
pub struct SseServer {
    pub config: SseServerConfig,
    registry: Arc<SessionRegistry>,
}

impl SseServer {
    pub fn new(registry: Arc<SessionRegistry>, config: SseServerConfig) -> (Self, Router) {
        let server = Self { config, registry };
        let router = Router::new()
            .route(&server.config.sse_path, get(sse_handler))
            .route(&server.config.post_path, post(post_handler))
            .with_state(server.clone());
        (server, router)
    }

    pub async fn serve(registry: Arc<SessionRegistry>, bind: SocketAddr) -> io::Result<Self> {
        Self::serve_with_config(
            registry,
            SseServerConfig {
                bind,
                ..Default::default()
            },
        )
        .await
    }

    pub async fn serve_with_config(
        registry: Arc<SessionRegistry>,
        mut config: SseServerConfig,
    ) -> io::Result<Self> {
        let listener = tokio::net::TcpListener::bind(config.bind).await?;
        config.bind = listener.local_addr()?;
        let (server, router) = Self::new(registry.clone(), config);
        let ct = registry.cancellation_token().child_token();
        let bind = server.config.bind;
        let serve = axum::serve(listener, router).with_graceful_shutdown(async move {
            ct.cancelled().await;
            tracing::info!("sse server cancelled");
        });
        tokio::spawn(
            async move {
                if let Err(e) = serve.await {
                    tracing::error!(error = %e, "sse server shutdown with error");
                }
            }
            .instrument(tracing::info_span!("sse-server", bind_address = %bind)),
        );
        Ok(server)
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }
}

#[derive(Debug, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
struct PostQuery {
    session_id: String,
}

/// Deletes the session when the GET stream that owns it goes away.
struct SessionDropGuard {
    registry: Arc<SessionRegistry>,
    session_id: SessionId,
}

impl Drop for SessionDropGuard {
    fn drop(&mut self) {
        tracing::debug!(session_id = %self.session_id, "sse stream closed, deleting session");
        self.registry.delete_session(&self.session_id);
    }
}

async fn sse_handler(
    State(server): State<SseServer>,
    principal: Option<Extension<Principal>>,
) -> Response<Body> {
    let principal = principal.as_ref().map(|extension| &extension.0);
    let session = server
        .registry()
        .create_session(principal, TransportKind::Sse);
    let session_id = session.id().clone();
    tracing::info!(%session_id, "sse connection");

    let Some(transport) = session.transport().as_sse() else {
        // create_session just built this as an SSE transport
        return Response::builder()
            .status(StatusCode::INTERNAL_SERVER_ERROR)
            .body(Body::empty())
            .expect("static response must build");
    };
    let endpoint = format!(
        "{}?sessionId={}",
        server.config.post_path.trim_start_matches('/'),
        session_id
    );
    let guard = SessionGuard::new(session.clone());
    let cleanup = SessionDropGuard {
        registry: server.registry().clone(),
        session_id,
    };
    let messages = transport.outbound_stream();
    let events = async_stream::stream! {
        let _guard = guard;
        let _cleanup = cleanup;
        yield ServerSseEvent::Endpoint(endpoint);
        let mut messages = std::pin::pin!(messages);
        while let Some(event) = futures::StreamExt::next(&mut messages).await {
            yield event;
        }
    };
    sse_response(sse_body(events, server.config.sse_keep_alive))
}

async fn post_handler(
    State(server): State<SseServer>,
    query: Result<Query<PostQuery>, axum::extract::rejection::QueryRejection>,
    principal: Option<Extension<Principal>>,
    body: Bytes,
) -> Response<Body> {
    let Ok(Query(PostQuery { session_id })) = query else {
        return plain_response(StatusCode::BAD_REQUEST, "missing sessionId");
    };

    let principal = principal.as_ref().map(|extension| &extension.0);
    let guard = match server.registry().find_session(&session_id, principal) {
        Ok(session) => SessionGuard::new(session),
        Err(SessionAccessError::NotFound) => return session_not_found_response(),
        Err(SessionAccessError::UserMismatch) => {
            return Response::builder()
                .status(StatusCode::FORBIDDEN)
                .body(Body::empty())
                .expect("static response must build")
        }
    };

    let message: JsonRpcMessage = match serde_json::from_slice(&body) {
        Ok(message) => message,
        Err(e) => {
            tracing::warn!(%session_id, error = %e, "malformed client message");
            return plain_response(StatusCode::INTERNAL_SERVER_ERROR, "malformed message");
        }
    };
    tracing::debug!(%session_id, "client message");

    let Some(transport) = guard.transport().as_sse() else {
        return plain_response(StatusCode::BAD_REQUEST, "session uses a different transport");
    };
    match transport.accept_message(message).await {
        Ok(()) => plain_response(StatusCode::ACCEPTED, "Accepted"),
        Err(_) => plain_response(StatusCode::GONE, "session terminated"),
    }
}

fn plain_response(status: StatusCode, body: &'static str) -> Response<Body> {
    Response::builder()
        .status(status)
        .body(Body::from(body))
        .expect("static response must build")
}
