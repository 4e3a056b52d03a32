//! Error types for the session service

use thiserror::Error;
use viska_xmpp_core::{Jid, XmppError};

/// Result type for session service operations
pub type ServiceResult<T> = Result<T, ServiceError>;

/// Errors raised by the registry, the sync coordinator and the service context
#[derive(Debug, Clone, Error)]
pub enum ServiceError {
    /// A session (or a login in progress) already exists for this identity
    #[error("A session for {identity} already exists")]
    DuplicateIdentity { identity: Jid },

    /// The remote domain advertises no TLS-protected connection method
    #[error("{domain} offers no secure connection method")]
    NoSecureTransport { domain: String },

    /// The selected connection method has no transport implementation
    #[error("Unsupported connection protocol: {protocol}")]
    UnsupportedProtocolVariant { protocol: String },

    /// Discovering connection methods for a domain failed
    #[error("Failed to resolve {domain}: {reason}")]
    AddressResolution { domain: String, reason: String },

    /// The session was disposed while the operation was pending
    #[error("Session is disposed")]
    SessionDisposed,

    /// No session is registered for this identity
    #[error("No session registered for {identity}")]
    UnknownIdentity { identity: Jid },

    /// Login did not reach ONLINE
    #[error("Login failed for {identity}: {reason}")]
    LoginFailed { identity: Jid, reason: String },

    /// Account store failure
    #[error("Account store error: {0}")]
    Account(String),

    /// Invalid configuration or missing collaborator
    #[error("Configuration error: {0}")]
    Config(String),

    /// Failure from a session
    #[error(transparent)]
    Xmpp(#[from] XmppError),
}

impl ServiceError {
    pub fn duplicate(identity: &Jid) -> Self {
        Self::DuplicateIdentity {
            identity: identity.clone(),
        }
    }

    pub fn unknown(identity: &Jid) -> Self {
        Self::UnknownIdentity {
            identity: identity.clone(),
        }
    }

    pub fn login_failed(identity: &Jid, reason: impl Into<String>) -> Self {
        Self::LoginFailed {
            identity: identity.clone(),
            reason: reason.into(),
        }
    }

    pub fn address_resolution(domain: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::AddressResolution {
            domain: domain.into(),
            reason: reason.into(),
        }
    }

    /// Map a session failure during login, keeping disposal distinguishable
    pub fn from_login(identity: &Jid, error: XmppError) -> Self {
        match error {
            XmppError::SessionDisposed => Self::SessionDisposed,
            XmppError::LoginFailed { message } => Self::login_failed(identity, message),
            other => Self::login_failed(identity, other.to_string()),
        }
    }

    pub fn is_duplicate(&self) -> bool {
        matches!(self, Self::DuplicateIdentity { .. })
    }

    pub fn is_disposed(&self) -> bool {
        match self {
            Self::SessionDisposed => true,
            Self::Xmpp(e) => e.is_disposed(),
            _ => false,
        }
    }

    /// Text suitable for showing to the account owner
    pub fn user_message(&self) -> String {
        match self {
            Self::AddressResolution { domain, .. } => {
                format!("Could not find the server for {}. Check the address and your connection.", domain)
            }
            Self::NoSecureTransport { domain } => {
                format!("{} does not offer a secure connection.", domain)
            }
            other => other.to_string(),
        }
    }
}
