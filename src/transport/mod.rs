//! HTTP transports for MCP JSON-RPC traffic.
//!
//! Two wire variants interoperate:
//!
//! * **Streamable HTTP** — one endpoint handling POST (submit messages, with
//!   responses streamed back as that POST's SSE body), GET (server-push
//!   stream) and DELETE (terminate the session). See
//!   [`streamable_http_server`] and [`streamable_http_client`].
//! * **HTTP+SSE (legacy)** — a long-lived `GET /sse` stream plus a separate
//!   `POST /message?sessionId=…` endpoint. See [`sse_server`] and
//!   [`sse_client`].
//!
//! [`auto_client`] probes the streamable variant and transparently falls
//! back to the legacy pair, so callers need not know what the server speaks.
//!
//! The transports do not interpret messages. Parsed inbound traffic is
//! pushed to an external *dispatcher* through a per-session channel; the
//! dispatcher sends results back through [`ServerTransport::send`], echoing
//! the [`InboundMessage::reply_to`] token so responses land on the POST body
//! that carried their request.

pub mod auto_client;
pub mod channel;
pub mod common;
pub mod session;
pub mod sse_client;
pub mod sse_server;
pub mod streamable_http_client;
pub mod streamable_http_server;

use std::sync::Arc;

use futures::future::BoxFuture;
use tokio_util::sync::CancellationToken;

pub use auto_client::{
    ClientTransportConfig, HttpClientTransport, MessageReader, TransportMode,
    DEFAULT_CONNECT_TIMEOUT,
};
pub use session::{
    session_id, Claim, Principal, Session, SessionGuard, SessionId, SessionRegistry,
    TransportKind, UserIdClaim,
};
pub use sse_client::SseClient;
pub use sse_server::{SseServer, SseServerConfig, SseServerTransport};
pub use streamable_http_client::StreamableHttpClient;
pub use streamable_http_server::{
    ReplyTo, StreamableHttpServer, StreamableHttpServerConfig, StreamableHttpServerTransport,
};

use crate::{error::TransportError, model::JsonRpcMessage};

/// One parsed client message handed to the dispatcher, with the routing
/// token for its reply. The token is carried alongside the message rather
/// than inside it, keeping the JSON-RPC types free of transport concerns.
#[derive(Debug)]
pub struct InboundMessage {
    pub message: JsonRpcMessage,
    /// Present on requests that arrived on a streamable-HTTP POST; echo it
    /// back to [`ServerTransport::send`] to route the response onto that
    /// POST's body.
    pub reply_to: Option<ReplyTo>,
}

/// Everything a dispatcher task needs to run one session.
pub struct SessionContext {
    pub session_id: SessionId,
    /// Inbound message queue fed by the HTTP handlers.
    pub inbound: tokio::sync::mpsc::Receiver<InboundMessage>,
    /// Outbound path back onto the wire.
    pub sender: ServerTransport,
    /// Cancelled when the session is deleted or the process shuts down.
    pub ct: CancellationToken,
}

pub type DispatcherError = Box<dyn std::error::Error + Send + Sync>;
pub type DispatcherFuture = BoxFuture<'static, Result<(), DispatcherError>>;

/// Produces the dispatcher future for each new session. An `Err` return
/// from the future disposes the session.
pub type DispatcherFactory = Arc<dyn Fn(SessionContext) -> DispatcherFuture + Send + Sync>;

/// The server-side endpoint object owned by a session, one of the two wire
/// variants. Cheap to clone.
#[derive(Clone)]
pub enum ServerTransport {
    StreamableHttp(StreamableHttpServerTransport),
    Sse(SseServerTransport),
}

impl ServerTransport {
    /// Send a dispatcher-produced message to the client. On the streamable
    /// variant the `reply_to` token routes responses onto the originating
    /// POST body; the legacy variant has a single stream and ignores it.
    pub async fn send(
        &self,
        message: JsonRpcMessage,
        reply_to: Option<&ReplyTo>,
    ) -> Result<(), TransportError> {
        match self {
            ServerTransport::StreamableHttp(transport) => transport.send(message, reply_to).await,
            ServerTransport::Sse(transport) => transport.send(message).await,
        }
    }

    pub fn as_streamable_http(&self) -> Option<&StreamableHttpServerTransport> {
        match self {
            ServerTransport::StreamableHttp(transport) => Some(transport),
            ServerTransport::Sse(_) => None,
        }
    }

    pub fn as_sse(&self) -> Option<&SseServerTransport> {
        match self {
            ServerTransport::Sse(transport) => Some(transport),
            ServerTransport::StreamableHttp(_) => None,
        }
    }

    pub(crate) fn close(&self) {
        match self {
            ServerTransport::StreamableHttp(transport) => transport.close(),
            ServerTransport::Sse(transport) => transport.close(),
        }
    }
}
