//! The session contract consumed by the service layer
//!
//! A [`Session`] is one logged-in (or logging-in) protocol connection for one
//! identity. Address resolution, TLS and the stream handshake live behind this
//! trait; the rest of the stack only drives the lifecycle, sends requests and
//! listens to inbound stanzas.
//!
//! Implementations must uphold:
//! - state changes are published in transition order to every subscriber;
//! - once DISPOSED, every operation fails with [`XmppError::SessionDisposed`],
//!   including requests already waiting for a reply;
//! - `kill_connection` drops the transport and leaves the session in
//!   DISCONNECTED, ready for a later `login`.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;

use crate::error::{XmppError, XmppResult};
use crate::jid::Jid;
use crate::stanza::Stanza;
use crate::state::SessionState;

/// Shared handle to a session
pub type SessionRef = Arc<dyn Session>;

/// Secret used for one login attempt
#[derive(Clone, PartialEq, Eq)]
pub struct Credential(String);

impl Credential {
    pub fn new(secret: impl Into<String>) -> Self {
        Self(secret.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Credential(***)")
    }
}

/// One protocol session
#[async_trait]
pub trait Session: Send + Sync + fmt::Debug {
    /// Address this session logs in as
    fn login_jid(&self) -> &Jid;

    /// Full address bound by the server, once ONLINE
    fn negotiated_jid(&self) -> Option<Jid>;

    fn state(&self) -> SessionState;

    /// Ordered feed of future state transitions
    fn subscribe_state(&self) -> broadcast::Receiver<SessionState>;

    /// Feed of stanzas received from the server
    fn inbound_stanzas(&self) -> broadcast::Receiver<Stanza>;

    /// Connect, handshake and authenticate. Resolves once ONLINE.
    async fn login(&self, credential: &Credential) -> XmppResult<()>;

    /// Drop the transport without disposing; the session ends DISCONNECTED
    async fn kill_connection(&self) -> XmppResult<()>;

    /// Terminal shutdown
    async fn dispose(&self) -> XmppResult<()>;

    /// Send a request IQ and wait for the correlated reply.
    ///
    /// An `error` reply resolves to [`XmppError::Stanza`]; the transport's
    /// own request timeout surfaces as [`XmppError::Timeout`].
    async fn send_iq(&self, iq: Stanza) -> XmppResult<Stanza>;

    /// Send a stanza that expects no reply (results, error replies)
    async fn send(&self, stanza: Stanza) -> XmppResult<()>;
}

/// Wait until `session` is ONLINE.
///
/// Fails with `SessionDisposed` if the session is disposed first, or with
/// `LoginFailed` if it falls back to DISCONNECTED after having started a login
/// attempt.
pub async fn wait_until_online(session: &dyn Session) -> XmppResult<()> {
    let mut changes = session.subscribe_state();
    let mut seen_attempt = false;
    let mut state = session.state();
    loop {
        match state {
            SessionState::Online => return Ok(()),
            SessionState::Disposed => return Err(XmppError::SessionDisposed),
            SessionState::Connecting | SessionState::Handshaking => seen_attempt = true,
            SessionState::Disconnected if seen_attempt => {
                return Err(XmppError::login_failed("connection lost during login"))
            }
            SessionState::Disconnected => {}
        }
        state = match changes.recv().await {
            Ok(next) => next,
            Err(RecvError::Lagged(_)) => session.state(),
            Err(RecvError::Closed) => return Err(XmppError::SessionDisposed),
        };
    }
}
