//! Client transport with automatic variant detection.
//!
//! The caller asks for a session without knowing which HTTP variant the
//! server speaks. In [`TransportMode::AutoDetect`] the first message sent
//! (expected to be the `initialize` request) is used as the probe: it is
//! POSTed as streamable HTTP first, and on a non-success status or any
//! failure the transport falls back to the legacy SSE handshake and replays
//! the message there. All received messages flow into a single delegating
//! reader that blocks until one of the variants commits.

use std::{
    sync::{Arc, RwLock},
    time::Duration,
};

use futures::StreamExt;
use reqwest::header::HeaderMap;
use tokio::sync::{mpsc, watch, Mutex};
use tokio_util::sync::CancellationToken;
use url::Url;

use super::{
    sse_client::{SseClient, SseConnection},
    streamable_http_client::{BoxedSseStream, PostResponse, RequestContext, StreamableHttpClient},
};
use crate::{error::TransportError, model::JsonRpcMessage};

pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

const INCOMING_CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum TransportMode {
    /// Use the single-endpoint streamable HTTP transport directly.
    StreamableHttp,
    /// Use the legacy `GET /sse` + `POST /message` pair directly.
    Sse,
    /// Probe streamable HTTP, fall back to legacy SSE.
    #[default]
    AutoDetect,
}

#[derive(Debug, Clone)]
pub struct ClientTransportConfig {
    pub endpoint: Url,
    pub mode: TransportMode,
    pub connect_timeout: Duration,
    /// Merged into every outgoing HTTP request.
    pub additional_headers: HeaderMap,
    /// Opaque identifier used in log events.
    pub name: Option<String>,
}

impl ClientTransportConfig {
    pub fn new(endpoint: impl AsRef<str>) -> Result<Self, TransportError> {
        let endpoint = Url::parse(endpoint.as_ref())?;
        validate_endpoint(&endpoint)?;
        Ok(Self {
            endpoint,
            mode: TransportMode::default(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            additional_headers: HeaderMap::new(),
            name: None,
        })
    }

    pub fn with_mode(mut self, mode: TransportMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }
}

fn validate_endpoint(endpoint: &Url) -> Result<(), TransportError> {
    if !matches!(endpoint.scheme(), "http" | "https") {
        return Err(TransportError::InvalidEndpoint(endpoint.to_string()));
    }
    Ok(())
}

enum Committed {
    StreamableHttp,
    Sse { post_uri: Url },
}

#[derive(Debug, Clone)]
enum ReaderState {
    Pending,
    Connected,
    Failed(Arc<str>),
}

/// Reader side of the transport: blocks until variant detection commits,
/// then yields messages from whichever transport won.
#[derive(Clone)]
pub struct MessageReader {
    state: watch::Receiver<ReaderState>,
    incoming: Arc<Mutex<mpsc::Receiver<JsonRpcMessage>>>,
}

impl MessageReader {
    /// Receive the next server message. `Ok(None)` means the transport is
    /// closed; `Err` carries the detection failure when neither variant
    /// could be established.
    pub async fn recv(&self) -> Result<Option<JsonRpcMessage>, TransportError> {
        let mut state = self.state.clone();
        loop {
            let current = state.borrow_and_update().clone();
            match current {
                ReaderState::Connected => break,
                ReaderState::Failed(reason) => {
                    return Err(TransportError::ConnectionFailed(reason.to_string()));
                }
                ReaderState::Pending => {
                    if state.changed().await.is_err() {
                        return Ok(None);
                    }
                }
            }
        }
        let mut incoming = self.incoming.lock().await;
        Ok(incoming.recv().await)
    }
}

pub struct HttpClientTransport {
    config: ClientTransportConfig,
    streamable: StreamableHttpClient,
    sse: SseClient,
    committed: Mutex<Option<Committed>>,
    session_id: RwLock<Option<Arc<str>>>,
    protocol_version: Arc<RwLock<Option<String>>>,
    incoming_tx: mpsc::Sender<JsonRpcMessage>,
    reader: MessageReader,
    state_tx: watch::Sender<ReaderState>,
    ct: CancellationToken,
}

impl HttpClientTransport {
    pub fn new(config: ClientTransportConfig) -> Result<Self, TransportError> {
        validate_endpoint(&config.endpoint)?;
        let http = reqwest::Client::builder().build()?;
        let additional_headers = Arc::new(config.additional_headers.clone());
        let streamable = StreamableHttpClient::new(
            http.clone(),
            config.endpoint.clone(),
            additional_headers.clone(),
        );
        let sse = SseClient::new(http, config.endpoint.clone(), additional_headers);
        let (incoming_tx, incoming_rx) = mpsc::channel(INCOMING_CHANNEL_CAPACITY);
        let (state_tx, state_rx) = watch::channel(ReaderState::Pending);
        let reader = MessageReader {
            state: state_rx,
            incoming: Arc::new(Mutex::new(incoming_rx)),
        };
        Ok(Self {
            config,
            streamable,
            sse,
            committed: Mutex::new(None),
            session_id: RwLock::new(None),
            protocol_version: Arc::new(RwLock::new(None)),
            incoming_tx,
            reader,
            state_tx,
            ct: CancellationToken::new(),
        })
    }

    pub fn reader(&self) -> MessageReader {
        self.reader.clone()
    }

    pub fn session_id(&self) -> Option<Arc<str>> {
        self.session_id.read().expect("lock poisoned").clone()
    }

    pub fn protocol_version(&self) -> Option<String> {
        self.protocol_version.read().expect("lock poisoned").clone()
    }

    /// The variant this transport committed to, once detection ran.
    pub async fn committed_mode(&self) -> Option<TransportMode> {
        match &*self.committed.lock().await {
            Some(Committed::StreamableHttp) => Some(TransportMode::StreamableHttp),
            Some(Committed::Sse { .. }) => Some(TransportMode::Sse),
            None => None,
        }
    }

    /// Send one message. The first call performs variant detection; later
    /// calls delegate to the committed transport.
    pub async fn send_message(&self, message: JsonRpcMessage) -> Result<(), TransportError> {
        let mut committed = self.committed.lock().await;
        match committed.as_ref() {
            Some(Committed::StreamableHttp) => self.post_streamable(&message).await,
            Some(Committed::Sse { post_uri }) => {
                let post_uri = post_uri.clone();
                let version = self.protocol_version();
                self.sse
                    .post_message(&post_uri, &message, version.as_deref())
                    .await
            }
            None => self.establish(&mut committed, &message).await,
        }
    }

    /// Dispose the transport: against a session-tracking streamable server,
    /// DELETE the session; then stop the pump tasks.
    pub async fn close(&self) -> Result<(), TransportError> {
        let committed = self.committed.lock().await;
        if matches!(committed.as_ref(), Some(Committed::StreamableHttp)) {
            if let Some(session_id) = self.session_id() {
                let version = self.protocol_version();
                let context = RequestContext {
                    session_id: Some(&session_id),
                    protocol_version: version.as_deref(),
                };
                match self.streamable.delete_session(context).await {
                    Ok(()) => tracing::info!(%session_id, "session deleted"),
                    Err(e) => {
                        tracing::debug!(%session_id, error = %e, "failed to delete session")
                    }
                }
            }
        }
        self.ct.cancel();
        Ok(())
    }

    async fn establish(
        &self,
        committed: &mut Option<Committed>,
        message: &JsonRpcMessage,
    ) -> Result<(), TransportError> {
        let result = match self.config.mode {
            TransportMode::StreamableHttp => self.connect_streamable(committed, message).await,
            TransportMode::Sse => self.connect_sse(committed, message).await,
            TransportMode::AutoDetect => {
                match self.connect_streamable(committed, message).await {
                    Ok(()) => Ok(()),
                    Err(first) => {
                        tracing::debug!(
                            name = ?self.config.name,
                            error = %first,
                            "streamable http attempt failed, falling back to sse"
                        );
                        self.connect_sse(committed, message).await
                    }
                }
            }
        };
        match result {
            Ok(()) => {
                self.state_tx.send_replace(ReaderState::Connected);
                Ok(())
            }
            Err(e) => {
                self.state_tx
                    .send_replace(ReaderState::Failed(e.to_string().into()));
                Err(e)
            }
        }
    }

    async fn connect_streamable(
        &self,
        committed: &mut Option<Committed>,
        message: &JsonRpcMessage,
    ) -> Result<(), TransportError> {
        let response = tokio::time::timeout(
            self.config.connect_timeout,
            self.streamable
                .post_message(message, RequestContext::default()),
        )
        .await
        .map_err(|_| TransportError::ConnectTimeout(self.config.connect_timeout))??;

        match response {
            PostResponse::Accepted => {}
            PostResponse::Json(message, session_id) => {
                self.store_session_id(session_id);
                self.deliver(message).await;
            }
            PostResponse::Sse(mut stream, session_id) => {
                self.store_session_id(session_id);
                // Read the probe's own response synchronously so the
                // negotiated version is known before any follow-up request.
                let first = tokio::time::timeout(
                    self.config.connect_timeout,
                    next_message_from_stream(&mut stream),
                )
                .await
                .map_err(|_| TransportError::ConnectTimeout(self.config.connect_timeout))??;
                self.deliver(first).await;
                self.spawn_message_pump(stream);
            }
        }
        *committed = Some(Committed::StreamableHttp);
        tracing::debug!(name = ?self.config.name, "committed to streamable http transport");
        self.spawn_standalone_stream();
        Ok(())
    }

    async fn connect_sse(
        &self,
        committed: &mut Option<Committed>,
        message: &JsonRpcMessage,
    ) -> Result<(), TransportError> {
        let SseConnection { post_uri, stream } =
            tokio::time::timeout(self.config.connect_timeout, self.sse.connect())
                .await
                .map_err(|_| TransportError::ConnectTimeout(self.config.connect_timeout))??;
        // Pump before posting: the reply to the initial message arrives on
        // the GET stream, possibly immediately.
        self.spawn_message_pump(stream);
        self.sse.post_message(&post_uri, message, None).await?;
        *committed = Some(Committed::Sse { post_uri });
        tracing::debug!(name = ?self.config.name, "committed to legacy sse transport");
        Ok(())
    }

    async fn post_streamable(&self, message: &JsonRpcMessage) -> Result<(), TransportError> {
        let session_id = self.session_id();
        let version = self.protocol_version();
        let context = RequestContext {
            session_id: session_id.as_deref(),
            protocol_version: version.as_deref(),
        };
        match self.streamable.post_message(message, context).await? {
            PostResponse::Accepted => {}
            PostResponse::Json(message, session_id) => {
                self.store_session_id(session_id);
                self.deliver(message).await;
            }
            PostResponse::Sse(stream, session_id) => {
                self.store_session_id(session_id);
                self.spawn_message_pump(stream);
            }
        }
        Ok(())
    }

    fn store_session_id(&self, session_id: Option<String>) {
        if let Some(session_id) = session_id {
            let mut slot = self.session_id.write().expect("lock poisoned");
            if slot.is_none() {
                tracing::debug!(%session_id, "server assigned session id");
                *slot = Some(session_id.into());
            }
        }
    }

    async fn deliver(&self, message: JsonRpcMessage) {
        note_protocol_version(&self.protocol_version, &message);
        if self.incoming_tx.send(message).await.is_err() {
            tracing::trace!("message reader dropped");
        }
    }

    fn spawn_message_pump(&self, stream: BoxedSseStream) {
        tokio::spawn(pump_sse_stream(
            stream,
            self.incoming_tx.clone(),
            self.protocol_version.clone(),
            self.ct.clone(),
        ));
    }

    /// Open the standalone server-push stream for unsolicited messages.
    /// Servers without one answer 405; that is not an error.
    fn spawn_standalone_stream(&self) {
        let Some(session_id) = self.session_id() else {
            return;
        };
        let streamable = self.streamable.clone();
        let protocol_version = self.protocol_version.clone();
        let incoming_tx = self.incoming_tx.clone();
        let ct = self.ct.clone();
        tokio::spawn(async move {
            let version = protocol_version.read().expect("lock poisoned").clone();
            let context = RequestContext {
                session_id: Some(&session_id),
                protocol_version: version.as_deref(),
            };
            match streamable.get_stream(context).await {
                Ok(stream) => {
                    tracing::debug!("standalone event stream opened");
                    pump_sse_stream(stream, incoming_tx, protocol_version, ct).await;
                }
                Err(TransportError::UnexpectedStatus(status))
                    if status == reqwest::StatusCode::METHOD_NOT_ALLOWED =>
                {
                    tracing::debug!("server does not offer a standalone event stream");
                }
                Err(e) => tracing::debug!(error = %e, "failed to open standalone event stream"),
            }
        });
    }
}

/// Wait for the next JSON-RPC message on an SSE stream, skipping comments
/// and non-message events.
async fn next_message_from_stream(
    stream: &mut BoxedSseStream,
) -> Result<JsonRpcMessage, TransportError> {
    loop {
        let sse = match stream.next().await {
            Some(event) => event?,
            None => {
                return Err(TransportError::ConnectionFailed(
                    "event stream ended without a response".to_string(),
                ))
            }
        };
        if sse.event.as_deref() == Some("endpoint") {
            continue;
        }
        let Some(data) = sse.data else { continue };
        match serde_json::from_str::<JsonRpcMessage>(&data) {
            Ok(message) => return Ok(message),
            Err(e) => tracing::warn!("failed to deserialize server message: {e}"),
        }
    }
}

async fn pump_sse_stream(
    mut stream: BoxedSseStream,
    incoming_tx: mpsc::Sender<JsonRpcMessage>,
    protocol_version: Arc<RwLock<Option<String>>>,
    ct: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            _ = ct.cancelled() => break,
            event = stream.next() => event,
        };
        match event {
            Some(Ok(sse)) => {
                if sse.event.as_deref() == Some("endpoint") {
                    continue;
                }
                let Some(data) = sse.data else { continue };
                match serde_json::from_str::<JsonRpcMessage>(&data) {
                    Ok(message) => {
                        note_protocol_version(&protocol_version, &message);
                        if incoming_tx.send(message).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => tracing::warn!("failed to deserialize server message: {e}"),
                }
            }
            // Peer disconnect is an expected end of stream.
            Some(Err(e)) => {
                tracing::debug!("sse stream ended: {e}");
                break;
            }
            None => break,
        }
    }
}

/// Capture the negotiated version from an `initialize` result before the
/// message reaches the reader, so follow-up requests already carry the
/// header by the time the caller observes the response.
fn note_protocol_version(slot: &RwLock<Option<String>>, message: &JsonRpcMessage) {
    let JsonRpcMessage::Response(response) = message else {
        return;
    };
    let Some(version) = response
        .result
        .get("protocolVersion")
        .and_then(|value| value.as_str())
    else {
        return;
    };
    let mut slot = slot.write().expect("lock poisoned");
    if slot.as_deref() != Some(version) {
        tracing::debug!(protocol_version = version, "negotiated protocol version");
        *slot = Some(version.to_string());
    }
}
