//! Session construction
//!
//! The transport layer is reached through [`SessionConnector`]: it discovers
//! how a domain can be reached and builds a session for one chosen method.
//! The registry only ever picks a TLS-protected method.

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use viska_xmpp_core::{Jid, SessionRef};

use crate::error::ServiceResult;

/// Transport flavor of a connection method
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConnectionProtocol {
    /// Plain XMPP stream over TCP
    Tcp,
    WebSocket,
    Bosh,
    Other(String),
}

impl fmt::Display for ConnectionProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionProtocol::Tcp => f.write_str("tcp"),
            ConnectionProtocol::WebSocket => f.write_str("websocket"),
            ConnectionProtocol::Bosh => f.write_str("bosh"),
            ConnectionProtocol::Other(name) => f.write_str(name),
        }
    }
}

/// One advertised way of reaching a domain
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionMethod {
    pub protocol: ConnectionProtocol,
    pub host: String,
    pub port: u16,
    /// Whether the connection is TLS-protected from the start
    pub tls: bool,
}

impl ConnectionMethod {
    pub fn new(protocol: ConnectionProtocol, host: impl Into<String>, port: u16, tls: bool) -> Self {
        Self {
            protocol,
            host: host.into(),
            port,
            tls,
        }
    }
}

/// The first secure method, in advertised preference order
pub fn select_secure(methods: &[ConnectionMethod]) -> Option<&ConnectionMethod> {
    methods.iter().find(|method| method.tls)
}

/// Builds sessions for the registry
#[async_trait]
pub trait SessionConnector: Send + Sync {
    /// Connection methods advertised by `domain`, most preferred first.
    ///
    /// Lookup failures are reported as
    /// [`ServiceError::AddressResolution`](crate::ServiceError::AddressResolution).
    async fn resolve(&self, domain: &str) -> ServiceResult<Vec<ConnectionMethod>>;

    /// A fresh DISCONNECTED session logging in as `identity` over `method`.
    ///
    /// Fails with `UnsupportedProtocolVariant` when no transport
    /// implementation exists for the method's protocol.
    fn construct(&self, identity: &Jid, method: &ConnectionMethod) -> ServiceResult<SessionRef>;
}
