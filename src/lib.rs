//! Session-multiplexing HTTP transports for MCP.
//!
//! The Model Context Protocol exchanges JSON-RPC 2.0 messages between a host
//! process and a tool-providing server. This crate implements the HTTP
//! transport core for both ends of that exchange: session identification and
//! lifecycle, per-session bidirectional dispatch, SSE framing, POST-scoped
//! response streams, user identity binding, and graceful shutdown — for the
//! streamable HTTP wire and the legacy HTTP+SSE wire, with client-side
//! auto-detection between the two.
//!
//! Message *handling* is not part of this crate. A server plugs in a
//! dispatcher per session (see [`transport::DispatcherFactory`]): the
//! transports parse what arrives on the wire and queue it to the dispatcher,
//! and the dispatcher pushes whatever it produces back through
//! [`transport::ServerTransport::send`].
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use mcp_http_transport::transport::{
//!     DispatcherFactory, SessionRegistry, StreamableHttpServer,
//! };
//!
//! # async fn run(dispatcher: DispatcherFactory) -> std::io::Result<()> {
//! let registry = SessionRegistry::new(dispatcher);
//! let server =
//!     StreamableHttpServer::serve(registry.clone(), "127.0.0.1:8080".parse().unwrap()).await?;
//! println!("listening on {}", server.config.bind);
//! # Ok(())
//! # }
//! ```

pub mod error;
pub mod model;
pub mod transport;

pub use error::{SessionAccessError, TransportError};
