//! Session identity and lifecycle.
//!
//! A *session* groups the logically related interactions between one client
//! and the server, starting from the `initialize` handshake. The server
//! assigns each session a unique [`SessionId`]; on the streamable HTTP
//! transport it travels in the `mcp-session-id` header, on the legacy SSE
//! transport in the `sessionId` query parameter advertised by the `endpoint`
//! bootstrap event.
//!
//! The [`SessionRegistry`] is the process-wide owner: it creates sessions,
//! spawns their dispatcher tasks, authorizes lookups against the caller's
//! identity, and tears everything down on shutdown.

use std::{
    sync::{
        atomic::{AtomicU32, AtomicU64, Ordering},
        Arc, Mutex,
    },
    time::{Duration, Instant},
};

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use dashmap::DashMap;
use rand::{rngs::OsRng, RngCore as _};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::{
    sse_server::SseServerTransport, streamable_http_server::StreamableHttpServerTransport,
    DispatcherFactory, ServerTransport, SessionContext,
};
use crate::error::SessionAccessError;

pub type SessionId = Arc<str>;

/// Generate a session id: 16 bytes from the OS cryptographic RNG, URL-safe
/// base64 without padding (22 characters). A registry insert collision on
/// one of these is an invariant violation, not a case to handle.
pub fn session_id() -> SessionId {
    let mut bytes = [0u8; 16];
    OsRng.fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes).into()
}

/// One claim asserted about an authenticated caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Claim {
    pub kind: String,
    pub value: String,
    pub issuer: String,
}

impl Claim {
    pub fn new(
        kind: impl Into<String>,
        value: impl Into<String>,
        issuer: impl Into<String>,
    ) -> Self {
        Self {
            kind: kind.into(),
            value: value.into(),
            issuer: issuer.into(),
        }
    }
}

/// The authenticated caller, as populated into request extensions by
/// whatever authentication middleware fronts the transport. Absent for
/// anonymous callers.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Principal {
    pub claims: Vec<Claim>,
}

/// Claim kinds that identify a user, in precedence order.
const USER_ID_CLAIM_KINDS: [&str; 3] = ["nameidentifier", "sub", "upn"];

impl Principal {
    pub fn new(claims: Vec<Claim>) -> Self {
        Self { claims }
    }

    /// The claim a session is bound to: the first `nameidentifier`, `sub`,
    /// or `upn` claim, in that order.
    pub fn user_id_claim(&self) -> Option<UserIdClaim> {
        USER_ID_CLAIM_KINDS.iter().find_map(|kind| {
            self.claims
                .iter()
                .find(|claim| claim.kind == *kind)
                .map(|claim| UserIdClaim {
                    kind: claim.kind.clone(),
                    value: claim.value.clone(),
                    issuer: claim.issuer.clone(),
                })
        })
    }
}

/// Identity a session was created under. Compared as a whole tuple: two
/// callers are the same user only if kind, value and issuer all match.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserIdClaim {
    pub kind: String,
    pub value: String,
    pub issuer: String,
}

/// Which server transport a new session speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    StreamableHttp,
    Sse,
}

/// Per-session state owned by the [`SessionRegistry`].
pub struct Session {
    id: SessionId,
    transport: ServerTransport,
    user: Option<UserIdClaim>,
    ref_count: AtomicU32,
    last_activity_ms: AtomicU64,
    epoch: Instant,
    ct: CancellationToken,
    run_task: Mutex<Option<JoinHandle<()>>>,
}

impl Session {
    pub fn id(&self) -> &SessionId {
        &self.id
    }

    pub fn transport(&self) -> &ServerTransport {
        &self.transport
    }

    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.ct
    }

    /// Mark the session busy. Handlers call this on entry (through
    /// [`SessionGuard`]) so idle cleanup cannot race an in-flight request.
    pub fn reference(&self) {
        self.ref_count.fetch_add(1, Ordering::SeqCst);
    }

    /// Drop one handler reference; the transition to zero stamps the
    /// last-activity clock.
    pub fn unreference(&self) {
        if self.ref_count.fetch_sub(1, Ordering::SeqCst) == 1 {
            // fetch_max keeps the stamp monotonic even if two handlers race
            // the zero transition.
            self.last_activity_ms
                .fetch_max(self.now_ms(), Ordering::SeqCst);
        }
    }

    /// Compare the caller against the identity the session was created
    /// under. Anonymous matches anonymous.
    pub fn has_same_user(&self, principal: Option<&Principal>) -> bool {
        self.user == principal.and_then(Principal::user_id_claim)
    }

    /// How long the session has been idle, or `None` while any handler
    /// holds it.
    pub fn idle_for(&self) -> Option<Duration> {
        if self.ref_count.load(Ordering::SeqCst) > 0 {
            return None;
        }
        let last = self.last_activity_ms.load(Ordering::SeqCst);
        Some(Duration::from_millis(self.now_ms().saturating_sub(last)))
    }

    fn now_ms(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }

    fn dispose(&self) {
        self.ct.cancel();
        self.transport.close();
        // The run task notices the cancellation on its own; detach rather
        // than await so disposal stays synchronous.
        drop(self.run_task.lock().expect("session lock poisoned").take());
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("user", &self.user)
            .field("ref_count", &self.ref_count.load(Ordering::SeqCst))
            .finish()
    }
}

/// RAII bracket around a handler's use of a session: referenced on
/// construction, unreferenced on drop, on every exit path including
/// cancellation. Handlers that stream move the guard into the response body
/// so the bracket spans the whole stream.
pub struct SessionGuard {
    session: Arc<Session>,
}

impl SessionGuard {
    pub fn new(session: Arc<Session>) -> Self {
        session.reference();
        Self { session }
    }
}

impl std::ops::Deref for SessionGuard {
    type Target = Session;

    fn deref(&self) -> &Session {
        &self.session
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.session.unreference();
    }
}

const INBOUND_CHANNEL_CAPACITY: usize = 16;

/// Process-wide session table. Keys are opaque id strings compared
/// byte-exactly; lookup, insert and delete are O(1) average on the
/// concurrent map.
pub struct SessionRegistry {
    sessions: DashMap<SessionId, Arc<Session>>,
    dispatcher: DispatcherFactory,
    ct: CancellationToken,
    epoch: Instant,
}

impl SessionRegistry {
    pub fn new(dispatcher: DispatcherFactory) -> Arc<Self> {
        Self::with_cancellation_token(dispatcher, CancellationToken::new())
    }

    pub fn with_cancellation_token(
        dispatcher: DispatcherFactory,
        ct: CancellationToken,
    ) -> Arc<Self> {
        Arc::new(Self {
            sessions: DashMap::new(),
            dispatcher,
            ct,
            epoch: Instant::now(),
        })
    }

    /// Token cancelled on [`shutdown`](Self::shutdown); servers hang their
    /// graceful-shutdown signal off child tokens of this one.
    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.ct
    }

    /// Create a session bound to the caller's identity, insert it, and
    /// start its dispatcher task.
    pub fn create_session(
        self: &Arc<Self>,
        principal: Option<&Principal>,
        kind: TransportKind,
    ) -> Arc<Session> {
        let id = session_id();
        let (inbound_tx, inbound_rx) = tokio::sync::mpsc::channel(INBOUND_CHANNEL_CAPACITY);
        let transport = match kind {
            TransportKind::StreamableHttp => {
                ServerTransport::StreamableHttp(StreamableHttpServerTransport::new(inbound_tx))
            }
            TransportKind::Sse => ServerTransport::Sse(SseServerTransport::new(inbound_tx)),
        };
        let ct = self.ct.child_token();
        let now = self.epoch.elapsed().as_millis() as u64;
        let session = Arc::new(Session {
            id: id.clone(),
            transport: transport.clone(),
            user: principal.and_then(Principal::user_id_claim),
            ref_count: AtomicU32::new(0),
            last_activity_ms: AtomicU64::new(now),
            epoch: self.epoch,
            ct: ct.clone(),
            run_task: Mutex::new(None),
        });
        if self.sessions.insert(id.clone(), session.clone()).is_some() {
            panic!("session id collision: {id}");
        }
        tracing::debug!(session_id = %id, ?kind, "created session");

        let context = SessionContext {
            session_id: id.clone(),
            inbound: inbound_rx,
            sender: transport,
            ct: ct.clone(),
        };
        let dispatcher = (self.dispatcher)(context);
        let registry = Arc::downgrade(self);
        let task_id = id.clone();
        let handle = tokio::spawn(async move {
            let result = tokio::select! {
                result = dispatcher => result,
                _ = ct.cancelled() => Ok(()),
            };
            if let Err(e) = result {
                tracing::error!(session_id = %task_id, error = %e, "session dispatcher failed");
            }
            // Whatever ended the dispatcher, the transport is no longer
            // serviced; drop the session so clients get a clean 404.
            if let Some(registry) = registry.upgrade() {
                registry.delete_session(&task_id);
            }
        });
        *session.run_task.lock().expect("session lock poisoned") = Some(handle);
        session
    }

    /// Look up a live session, enforcing that the caller is the user the
    /// session was created under. Applied uniformly on every transport.
    pub fn find_session(
        &self,
        id: &str,
        principal: Option<&Principal>,
    ) -> Result<Arc<Session>, SessionAccessError> {
        let session = self
            .sessions
            .get(id)
            .map(|entry| entry.value().clone())
            .ok_or(SessionAccessError::NotFound)?;
        if !session.has_same_user(principal) {
            tracing::warn!(session_id = %id, "session access denied: user mismatch");
            return Err(SessionAccessError::UserMismatch);
        }
        Ok(session)
    }

    /// Atomically remove and dispose a session. Idempotent.
    pub fn delete_session(&self, id: &str) -> bool {
        match self.sessions.remove(id) {
            Some((_, session)) => {
                session.dispose();
                tracing::debug!(session_id = %id, "deleted session");
                true
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Cancel every session's task promptly and clear the table. Does not
    /// wait for dispatchers to notice; callers wanting a grace period own
    /// that policy.
    pub fn shutdown(&self) {
        self.ct.cancel();
        for entry in self.sessions.iter() {
            entry.value().dispose();
        }
        self.sessions.clear();
        tracing::info!("session registry shut down");
    }

    /// Periodically evict sessions that have been idle (no handler holding
    /// them) longer than `idle_timeout`. Runs until the registry shuts down.
    pub fn run_idle_sweeper(
        self: &Arc<Self>,
        idle_timeout: Duration,
        period: Duration,
    ) -> JoinHandle<()> {
        let registry = Arc::downgrade(self);
        let ct = self.ct.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            loop {
                tokio::select! {
                    _ = ct.cancelled() => break,
                    _ = interval.tick() => {}
                }
                let Some(registry) = registry.upgrade() else {
                    break;
                };
                let expired: Vec<SessionId> = registry
                    .sessions
                    .iter()
                    .filter(|entry| {
                        entry
                            .value()
                            .idle_for()
                            .is_some_and(|idle| idle >= idle_timeout)
                    })
                    .map(|entry| entry.key().clone())
                    .collect();
                for id in expired {
                    tracing::info!(session_id = %id, "evicting idle session");
                    registry.delete_session(&id);
                }
            }
        })
    }
}

impl std::fmt::Debug for SessionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionRegistry")
            .field("sessions", &self.sessions.len())
            .finish()
    }
}
