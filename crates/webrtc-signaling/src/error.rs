//! Error types for call signaling

use thiserror::Error;
use viska_xmpp_core::{StanzaError, XmppError};

use crate::types::CallId;

/// Result type for signaling operations
pub type SignalingResult<T> = Result<T, SignalingError>;

/// Errors raised while encoding, decoding or sending signaling messages
#[derive(Debug, Clone, Error)]
pub enum SignalingError {
    /// Malformed inbound payload, answered to the sender as `bad-request`
    #[error("Bad request: {reason}")]
    BadRequest { reason: String },

    /// Session description type outside offer/pranswer/answer
    #[error("Unknown SDP type: {value}")]
    UnknownSdpType { value: String },

    /// The call id was closed and may not carry further messages
    #[error("Call {call_id} is closed")]
    CallClosed { call_id: CallId },

    /// The plugin has not been applied to a session yet
    #[error("Signaling plugin is not attached to a session")]
    NotAttached,

    /// Failure from the underlying session
    #[error(transparent)]
    Xmpp(#[from] XmppError),
}

impl SignalingError {
    pub fn bad_request(reason: impl Into<String>) -> Self {
        Self::BadRequest {
            reason: reason.into(),
        }
    }

    /// Stanza error to reply with, for errors caused by the remote
    pub fn to_stanza_error(&self) -> Option<StanzaError> {
        match self {
            Self::BadRequest { reason } => Some(StanzaError::bad_request(reason.clone())),
            _ => None,
        }
    }

    /// Whether the session this plugin is attached to has been disposed
    pub fn is_disposed(&self) -> bool {
        matches!(self, Self::Xmpp(e) if e.is_disposed())
    }
}
