//! Error types for the XMPP core

use thiserror::Error;

use crate::stanza::StanzaError;
use crate::state::SessionState;

/// Result type for XMPP core operations
pub type XmppResult<T> = Result<T, XmppError>;

/// Errors raised by addresses, the stanza codec and sessions
#[derive(Debug, Clone, Error)]
pub enum XmppError {
    /// Address does not follow `[local@]domain[/resource]`
    #[error("Malformed identity '{input}': {reason}")]
    MalformedIdentity { input: String, reason: String },

    /// Operation attempted against a session that reached DISPOSED
    #[error("Session has been disposed")]
    SessionDisposed,

    /// State machine rejected a transition
    #[error("Invalid session state transition: {from} -> {to}")]
    InvalidTransition { from: SessionState, to: SessionState },

    /// Operation requires a connected session
    #[error("Session is not connected (state: {state})")]
    NotConnected { state: SessionState },

    /// Remote answered a request with an error stanza
    #[error("Remote returned stanza error: {0}")]
    Stanza(StanzaError),

    /// No reply arrived within the transport's request timeout
    #[error("Request timed out after {seconds} seconds")]
    Timeout { seconds: u64 },

    /// XML could not be parsed or written
    #[error("XML error: {message}")]
    Xml { message: String },

    /// Stanza is structurally invalid (missing root attributes etc.)
    #[error("Invalid stanza: {message}")]
    InvalidStanza { message: String },

    /// Transport-level failure reported by the session implementation
    #[error("Transport error: {message}")]
    Transport { message: String },

    /// Login was refused or aborted
    #[error("Login failed: {message}")]
    LoginFailed { message: String },
}

impl XmppError {
    /// Create a malformed identity error
    pub fn malformed_identity(input: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::MalformedIdentity {
            input: input.into(),
            reason: reason.into(),
        }
    }

    /// Create an XML error
    pub fn xml(message: impl Into<String>) -> Self {
        Self::Xml {
            message: message.into(),
        }
    }

    /// Create an invalid stanza error
    pub fn invalid_stanza(message: impl Into<String>) -> Self {
        Self::InvalidStanza {
            message: message.into(),
        }
    }

    /// Create a transport error
    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
        }
    }

    /// Create a login failure
    pub fn login_failed(message: impl Into<String>) -> Self {
        Self::LoginFailed {
            message: message.into(),
        }
    }

    /// Whether the error means the session is gone for good
    pub fn is_disposed(&self) -> bool {
        matches!(self, Self::SessionDisposed)
    }
}

impl From<quick_xml::Error> for XmppError {
    fn from(err: quick_xml::Error) -> Self {
        Self::xml(err.to_string())
    }
}
