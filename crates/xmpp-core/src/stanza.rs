//! Stanzas and stanza errors
//!
//! A [`Stanza`] wraps the root element of one protocol message. Only the
//! pieces the session service needs are modelled explicitly: the stanza kind,
//! routing attributes, the IQ type and payload, and RFC 6120 §8.3 error
//! replies.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{XmppError, XmppResult};
use crate::jid::Jid;
use crate::xml::Element;

/// Namespace of stanza error conditions
pub const NS_STANZAS: &str = "urn:ietf:params:xml:ns:xmpp-stanzas";

/// Top-level stanza kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StanzaKind {
    Iq,
    Message,
    Presence,
}

impl StanzaKind {
    pub fn element_name(&self) -> &'static str {
        match self {
            StanzaKind::Iq => "iq",
            StanzaKind::Message => "message",
            StanzaKind::Presence => "presence",
        }
    }
}

/// IQ request/response types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum IqType {
    Get,
    Set,
    Result,
    Error,
}

impl IqType {
    pub fn as_str(&self) -> &'static str {
        match self {
            IqType::Get => "get",
            IqType::Set => "set",
            IqType::Result => "result",
            IqType::Error => "error",
        }
    }

    /// Whether this IQ expects a reply
    pub fn is_request(&self) -> bool {
        matches!(self, IqType::Get | IqType::Set)
    }
}

impl FromStr for IqType {
    type Err = XmppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "get" => Ok(IqType::Get),
            "set" => Ok(IqType::Set),
            "result" => Ok(IqType::Result),
            "error" => Ok(IqType::Error),
            other => Err(XmppError::invalid_stanza(format!("unknown iq type '{}'", other))),
        }
    }
}

/// Error types from RFC 6120 §8.3.2
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorType {
    Auth,
    Cancel,
    Continue,
    Modify,
    Wait,
}

impl ErrorType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorType::Auth => "auth",
            ErrorType::Cancel => "cancel",
            ErrorType::Continue => "continue",
            ErrorType::Modify => "modify",
            ErrorType::Wait => "wait",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "auth" => ErrorType::Auth,
            "cancel" => ErrorType::Cancel,
            "continue" => ErrorType::Continue,
            "modify" => ErrorType::Modify,
            "wait" => ErrorType::Wait,
            _ => return None,
        })
    }
}

/// Defined error conditions (subset used by this stack)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Condition {
    BadRequest,
    FeatureNotImplemented,
    InternalServerError,
    ItemNotFound,
    NotAllowed,
    RecipientUnavailable,
    RemoteServerTimeout,
    ServiceUnavailable,
    UnexpectedRequest,
    /// Any condition not listed above
    Other(String),
}

impl Condition {
    pub fn as_str(&self) -> &str {
        match self {
            Condition::BadRequest => "bad-request",
            Condition::FeatureNotImplemented => "feature-not-implemented",
            Condition::InternalServerError => "internal-server-error",
            Condition::ItemNotFound => "item-not-found",
            Condition::NotAllowed => "not-allowed",
            Condition::RecipientUnavailable => "recipient-unavailable",
            Condition::RemoteServerTimeout => "remote-server-timeout",
            Condition::ServiceUnavailable => "service-unavailable",
            Condition::UnexpectedRequest => "unexpected-request",
            Condition::Other(name) => name,
        }
    }

    fn from_name(name: &str) -> Self {
        match name {
            "bad-request" => Condition::BadRequest,
            "feature-not-implemented" => Condition::FeatureNotImplemented,
            "internal-server-error" => Condition::InternalServerError,
            "item-not-found" => Condition::ItemNotFound,
            "not-allowed" => Condition::NotAllowed,
            "recipient-unavailable" => Condition::RecipientUnavailable,
            "remote-server-timeout" => Condition::RemoteServerTimeout,
            "service-unavailable" => Condition::ServiceUnavailable,
            "unexpected-request" => Condition::UnexpectedRequest,
            other => Condition::Other(other.to_string()),
        }
    }
}

impl fmt::Display for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A stanza-level error, sent back to the originator of a request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StanzaError {
    pub condition: Condition,
    pub error_type: ErrorType,
    pub text: Option<String>,
}

impl StanzaError {
    pub fn new(condition: Condition, error_type: ErrorType) -> Self {
        Self {
            condition,
            error_type,
            text: None,
        }
    }

    /// `bad-request` / `modify`, the answer to malformed payloads
    pub fn bad_request(text: impl Into<String>) -> Self {
        Self::new(Condition::BadRequest, ErrorType::Modify).with_text(text)
    }

    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.text = Some(text.into());
        self
    }

    /// Render as an `<error/>` element
    pub fn to_element(&self) -> Element {
        let mut error = Element::new("error").attr("type", self.error_type.as_str());
        error.push_child(Element::with_namespace(self.condition.as_str(), NS_STANZAS));
        if let Some(text) = &self.text {
            error.push_child(Element::with_namespace("text", NS_STANZAS).text(text.clone()));
        }
        error
    }

    /// Read an `<error/>` element; unknown conditions are kept verbatim
    pub fn from_element(error: &Element) -> XmppResult<Self> {
        let error_type = error
            .get_attr("type")
            .and_then(ErrorType::parse)
            .ok_or_else(|| XmppError::invalid_stanza("error element without a valid type"))?;
        let condition = error
            .children()
            .find(|el| el.namespace() == Some(NS_STANZAS) && el.name() != "text")
            .map(|el| Condition::from_name(el.name()))
            .ok_or_else(|| XmppError::invalid_stanza("error element without a condition"))?;
        let text = error
            .get_child_ns("text", NS_STANZAS)
            .map(Element::text_content);
        Ok(Self {
            condition,
            error_type,
            text,
        })
    }
}

impl fmt::Display for StanzaError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.condition, self.error_type.as_str())?;
        if let Some(text) = &self.text {
            write!(f, ": {}", text)?;
        }
        Ok(())
    }
}

/// One protocol message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Stanza {
    root: Element,
}

impl Stanza {
    /// Wrap a root element, checking it is a stanza
    pub fn from_element(root: Element) -> XmppResult<Self> {
        match root.name() {
            "iq" | "message" | "presence" => Ok(Self { root }),
            other => Err(XmppError::invalid_stanza(format!("<{}> is not a stanza", other))),
        }
    }

    pub fn parse(xml: &str) -> XmppResult<Self> {
        Self::from_element(Element::parse(xml)?)
    }

    /// Build an IQ with a fresh random id
    pub fn iq(iq_type: IqType, from: Option<&Jid>, to: Option<&Jid>, payload: Option<Element>) -> Self {
        Self::iq_with_id(iq_type, &Uuid::new_v4().to_string(), from, to, payload)
    }

    pub fn iq_with_id(
        iq_type: IqType,
        id: &str,
        from: Option<&Jid>,
        to: Option<&Jid>,
        payload: Option<Element>,
    ) -> Self {
        let mut root = Element::new("iq")
            .attr("type", iq_type.as_str())
            .attr("id", id);
        if let Some(from) = from {
            root.set_attr("from", from.to_string());
        }
        if let Some(to) = to {
            root.set_attr("to", to.to_string());
        }
        if let Some(payload) = payload {
            root.push_child(payload);
        }
        Self { root }
    }

    pub fn kind(&self) -> StanzaKind {
        match self.root.name() {
            "iq" => StanzaKind::Iq,
            "message" => StanzaKind::Message,
            _ => StanzaKind::Presence,
        }
    }

    pub fn id(&self) -> Option<&str> {
        self.root.get_attr("id")
    }

    /// Sender address; unparseable addresses read as absent
    pub fn sender(&self) -> Option<Jid> {
        self.root.get_attr("from").and_then(|s| Jid::parse(s).ok())
    }

    pub fn recipient(&self) -> Option<Jid> {
        self.root.get_attr("to").and_then(|s| Jid::parse(s).ok())
    }

    pub fn iq_type(&self) -> Option<IqType> {
        if self.kind() != StanzaKind::Iq {
            return None;
        }
        self.root.get_attr("type").and_then(|t| t.parse().ok())
    }

    /// The single payload child of a request IQ
    pub fn iq_payload(&self) -> Option<&Element> {
        if self.kind() != StanzaKind::Iq {
            return None;
        }
        self.root.children().find(|el| el.name() != "error")
    }

    pub fn iq_namespace(&self) -> Option<&str> {
        self.iq_payload().and_then(Element::namespace)
    }

    pub fn iq_name(&self) -> Option<&str> {
        self.iq_payload().map(Element::name)
    }

    /// The `<error/>` child of an error stanza
    pub fn error(&self) -> Option<StanzaError> {
        if self.root.get_attr("type") != Some("error") {
            return None;
        }
        self.root
            .get_child("error")
            .and_then(|el| StanzaError::from_element(el).ok())
    }

    /// Empty `result` reply to this IQ
    pub fn result_reply(&self) -> XmppResult<Stanza> {
        let id = self.require_request_id()?;
        Ok(Stanza::iq_with_id(
            IqType::Result,
            id,
            self.recipient().as_ref(),
            self.sender().as_ref(),
            None,
        ))
    }

    /// `error` reply to this IQ, echoing the original payload
    pub fn error_reply(&self, error: &StanzaError) -> XmppResult<Stanza> {
        let id = self.require_request_id()?;
        let mut reply = Stanza::iq_with_id(
            IqType::Error,
            id,
            self.recipient().as_ref(),
            self.sender().as_ref(),
            self.iq_payload().cloned(),
        );
        reply.root.push_child(error.to_element());
        Ok(reply)
    }

    fn require_request_id(&self) -> XmppResult<&str> {
        match (self.iq_type(), self.id()) {
            (Some(t), Some(id)) if t.is_request() => Ok(id),
            _ => Err(XmppError::invalid_stanza("only request IQs with an id can be answered")),
        }
    }

    pub fn element(&self) -> &Element {
        &self.root
    }

    pub fn into_element(self) -> Element {
        self.root
    }

    pub fn to_xml(&self) -> XmppResult<String> {
        self.root.to_xml()
    }
}
