//! Value types exchanged by the signaling protocol

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use viska_xmpp_core::Jid;

use crate::error::SignalingError;

/// Opaque correlation token for one call attempt
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CallId(String);

impl CallId {
    /// A fresh random id
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for CallId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for CallId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for CallId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for CallId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Session description type, as written in the `type` attribute
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    Offer,
    #[serde(rename = "pranswer")]
    PrAnswer,
    Answer,
}

impl SdpType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SdpType::Offer => "offer",
            SdpType::PrAnswer => "pranswer",
            SdpType::Answer => "answer",
        }
    }
}

impl fmt::Display for SdpType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SdpType {
    type Err = SignalingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "offer" => Ok(SdpType::Offer),
            "pranswer" => Ok(SdpType::PrAnswer),
            "answer" => Ok(SdpType::Answer),
            other => Err(SignalingError::UnknownSdpType {
                value: other.to_string(),
            }),
        }
    }
}

/// A typed session description body
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    pub sdp_type: SdpType,
    pub description: String,
}

impl SessionDescription {
    pub fn new(sdp_type: SdpType, description: impl Into<String>) -> Self {
        Self {
            sdp_type,
            description: description.into(),
        }
    }

    pub fn offer(description: impl Into<String>) -> Self {
        Self::new(SdpType::Offer, description)
    }

    pub fn answer(description: impl Into<String>) -> Self {
        Self::new(SdpType::Answer, description)
    }
}

/// One ICE candidate
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    /// Media stream identification tag, when known
    pub sdp_mid: Option<String>,
    /// Index of the media description the candidate belongs to
    pub sdp_mline_index: u32,
    /// The `candidate:` attribute line
    pub sdp: String,
}

impl IceCandidate {
    pub fn new(sdp_mid: Option<String>, sdp_mline_index: u32, sdp: impl Into<String>) -> Self {
        Self {
            sdp_mid,
            sdp_mline_index,
            sdp: sdp.into(),
        }
    }
}

/// Which side opened the call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CallDirection {
    Outbound,
    Inbound,
}

/// Last negotiation step seen for a call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CallPhase {
    /// Only candidates exchanged so far
    Negotiating,
    Offered,
    ProvisionallyAnswered,
    Answered,
}

impl From<SdpType> for CallPhase {
    fn from(sdp_type: SdpType) -> Self {
        match sdp_type {
            SdpType::Offer => CallPhase::Offered,
            SdpType::PrAnswer => CallPhase::ProvisionallyAnswered,
            SdpType::Answer => CallPhase::Answered,
        }
    }
}

/// Bookkeeping for one live call on a session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallSession {
    pub call_id: CallId,
    pub local: Jid,
    pub remote: Jid,
    pub direction: CallDirection,
    pub phase: CallPhase,
    pub started_at: DateTime<Utc>,
}

impl CallSession {
    pub fn new(call_id: CallId, local: Jid, remote: Jid, direction: CallDirection) -> Self {
        Self {
            call_id,
            local,
            remote,
            direction,
            phase: CallPhase::Negotiating,
            started_at: Utc::now(),
        }
    }
}
