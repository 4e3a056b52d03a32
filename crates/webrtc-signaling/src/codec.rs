//! Wire codec for the `webrtc` IQ payload
//!
//! ```xml
//! <iq type="set" id="..." to="jon@westeros.com/123">
//!   <webrtc xmlns="https://schemas.viska.chat/demo/webrtc" id="..." action="create">
//!     <sdp type="offer">
//!       <line>v=0</line>
//!       <line>o=- 4611731400430051336 2 IN IP4 127.0.0.1</line>
//!     </sdp>
//!     <ice-candidate sdpMid="audio" sdpMLineIndex="0">
//!       <sdp><line>candidate:1 1 udp 2122260223 10.0.0.2 54400 typ host</line></sdp>
//!     </ice-candidate>
//!   </webrtc>
//! </iq>
//! ```
//!
//! Multi-line bodies are carried one `line` element per line so that the
//! line breaks survive XML whitespace handling.

use viska_xmpp_core::Element;

use crate::error::{SignalingError, SignalingResult};
use crate::types::{CallId, IceCandidate, SdpType, SessionDescription};

/// Namespace of the signaling payload
pub const NS_WEBRTC: &str = "https://schemas.viska.chat/demo/webrtc";

/// Name of the signaling payload element
pub const WEBRTC_ELEMENT: &str = "webrtc";

pub const NO_SESSION_ID: &str = "No session id found.";
pub const SDP_TYPE_UNKNOWN: &str = "SDP type unknown.";
pub const INVALID_MLINE_INDEX: &str = "Invalid sdpMLineIndex.";

/// The `action` attribute
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// No action: descriptions or candidates for an existing call
    Update,
    Create,
    Close,
}

impl Action {
    fn from_attr(value: Option<&str>) -> Self {
        match value {
            Some("create") => Action::Create,
            Some("close") => Action::Close,
            _ => Action::Update,
        }
    }

    fn as_attr(&self) -> Option<&'static str> {
        match self {
            Action::Update => None,
            Action::Create => Some("create"),
            Action::Close => Some("close"),
        }
    }
}

/// One child of the payload, in document order
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PayloadItem {
    Description(SessionDescription),
    Candidate(IceCandidate),
}

/// A fully decoded `webrtc` element
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignalingPayload {
    pub call_id: CallId,
    pub action: Action,
    pub items: Vec<PayloadItem>,
}

/// Split on CRLF or any single Unicode line break, keeping empty segments
pub fn split_lines(body: &str) -> Vec<&str> {
    let mut lines = Vec::new();
    let mut start = 0;
    let mut chars = body.char_indices().peekable();
    while let Some((index, c)) = chars.next() {
        let width = match c {
            '\r' if matches!(chars.peek(), Some((_, '\n'))) => {
                chars.next();
                2
            }
            '\n' | '\u{0B}' | '\u{0C}' | '\r' | '\u{85}' | '\u{2028}' | '\u{2029}' => c.len_utf8(),
            _ => continue,
        };
        lines.push(&body[start..index]);
        start = index + width;
    }
    lines.push(&body[start..]);
    lines
}

/// Rebuild a body from the `line` children of `element`
pub fn join_lines(element: &Element, terminator: &str) -> String {
    element
        .children()
        .filter(|child| child.name() == "line")
        .map(|line| line.text_content())
        .collect::<Vec<_>>()
        .join(terminator)
}

fn lines_element(name: &str, body: &str) -> Element {
    let mut element = Element::with_namespace(name, NS_WEBRTC);
    for line in split_lines(body) {
        element.push_child(Element::with_namespace("line", NS_WEBRTC).text(line));
    }
    element
}

fn payload(call_id: &CallId, action: Action) -> Element {
    let mut element = Element::with_namespace(WEBRTC_ELEMENT, NS_WEBRTC).attr("id", call_id.as_str());
    if let Some(action) = action.as_attr() {
        element.set_attr("action", action);
    }
    element
}

/// Payload carrying one session description
pub fn encode_description(call_id: &CallId, description: &SessionDescription, creating: bool) -> Element {
    let action = if creating { Action::Create } else { Action::Update };
    payload(call_id, action).child(
        lines_element("sdp", &description.description).attr("type", description.sdp_type.as_str()),
    )
}

/// Payload carrying a batch of ICE candidates
pub fn encode_candidates(call_id: &CallId, candidates: &[IceCandidate]) -> Element {
    let mut element = payload(call_id, Action::Update);
    for candidate in candidates {
        let mut child = Element::with_namespace("ice-candidate", NS_WEBRTC)
            .attr("sdpMLineIndex", candidate.sdp_mline_index.to_string());
        if let Some(mid) = candidate.sdp_mid.as_deref().filter(|mid| !mid.trim().is_empty()) {
            child.set_attr("sdpMid", mid);
        }
        if !candidate.sdp.trim().is_empty() {
            child.push_child(lines_element("sdp", &candidate.sdp));
        }
        element.push_child(child);
    }
    element
}

/// Payload closing a call
pub fn encode_close(call_id: &CallId) -> Element {
    payload(call_id, Action::Close)
}

/// Decode a `webrtc` element.
///
/// Either the whole payload decodes or a `BadRequest` is returned; a close
/// ignores any children.
pub fn decode(element: &Element, terminator: &str) -> SignalingResult<SignalingPayload> {
    let call_id = element
        .get_attr("id")
        .filter(|id| !id.trim().is_empty())
        .map(CallId::from)
        .ok_or_else(|| SignalingError::bad_request(NO_SESSION_ID))?;

    let action = Action::from_attr(element.get_attr("action"));
    if action == Action::Close {
        return Ok(SignalingPayload {
            call_id,
            action,
            items: Vec::new(),
        });
    }

    let mut items = Vec::new();
    for child in element.children() {
        match child.name() {
            "sdp" => items.push(PayloadItem::Description(decode_description(child, terminator)?)),
            "ice-candidate" => items.push(PayloadItem::Candidate(decode_candidate(child, terminator)?)),
            _ => {}
        }
    }

    Ok(SignalingPayload {
        call_id,
        action,
        items,
    })
}

fn decode_description(element: &Element, terminator: &str) -> SignalingResult<SessionDescription> {
    let sdp_type: SdpType = element
        .get_attr("type")
        .unwrap_or_default()
        .parse()
        .map_err(|_| SignalingError::bad_request(SDP_TYPE_UNKNOWN))?;
    Ok(SessionDescription::new(sdp_type, join_lines(element, terminator)))
}

fn decode_candidate(element: &Element, terminator: &str) -> SignalingResult<IceCandidate> {
    let sdp_mline_index = element
        .get_attr("sdpMLineIndex")
        .and_then(|index| index.trim().parse::<u32>().ok())
        .ok_or_else(|| SignalingError::bad_request(INVALID_MLINE_INDEX))?;
    let sdp_mid = element
        .get_attr("sdpMid")
        .filter(|mid| !mid.trim().is_empty())
        .map(str::to_string);
    let sdp = element
        .get_child("sdp")
        .map(|sdp| join_lines(sdp, terminator))
        .unwrap_or_default();
    Ok(IceCandidate::new(sdp_mid, sdp_mline_index, sdp))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_lines_on_every_break() {
        assert_eq!(split_lines("a\r\nb\nc\rd"), vec!["a", "b", "c", "d"]);
        assert_eq!(split_lines("a\u{2028}b\u{85}c\u{0B}d\u{0C}e\u{2029}f"), vec!["a", "b", "c", "d", "e", "f"]);
        assert_eq!(split_lines("a\r\n\r\nb\r\n"), vec!["a", "", "b", ""]);
        assert_eq!(split_lines(""), vec![""]);
        // a lone CR followed by CRLF is two breaks
        assert_eq!(split_lines("a\r\r\nb"), vec!["a", "", "b"]);
    }

    #[test]
    fn test_description_round_trip_keeps_empty_lines() {
        let body = "v=0\r\n\r\ns=-\r\n";
        let call_id = CallId::from("c1");
        let element = encode_description(&call_id, &SessionDescription::offer(body), true);
        assert_eq!(element.get_attr("action"), Some("create"));

        let reparsed = Element::parse(&element.to_xml().unwrap()).unwrap();
        let decoded = decode(&reparsed, "\r\n").unwrap();
        assert_eq!(decoded.call_id, call_id);
        assert_eq!(decoded.action, Action::Create);
        assert_eq!(
            decoded.items,
            vec![PayloadItem::Description(SessionDescription::offer(body))]
        );
    }

    #[test]
    fn test_candidate_attributes() {
        let candidates = vec![
            IceCandidate::new(Some("audio".into()), 0, "candidate:1 1 udp 1 10.0.0.2 5000 typ host"),
            IceCandidate::new(Some("  ".into()), 1, " "),
        ];
        let element = encode_candidates(&CallId::from("c1"), &candidates);
        let children: Vec<_> = element.children().collect();
        assert_eq!(children.len(), 2);
        assert_eq!(children[0].get_attr("sdpMid"), Some("audio"));
        assert_eq!(children[0].get_attr("sdpMLineIndex"), Some("0"));
        assert!(children[0].get_child("sdp").is_some());
        assert_eq!(children[1].get_attr("sdpMid"), None);
        assert_eq!(children[1].get_attr("sdpMLineIndex"), Some("1"));
        assert!(children[1].get_child("sdp").is_none());
        assert!(element.get_attr("action").is_none());

        let decoded = decode(&element, "\r\n").unwrap();
        assert_eq!(
            decoded.items,
            vec![
                PayloadItem::Candidate(candidates[0].clone()),
                PayloadItem::Candidate(IceCandidate::new(None, 1, "")),
            ]
        );
    }

    #[test]
    fn test_close_short_circuits() {
        let element = Element::parse(&format!(
            r#"<webrtc xmlns="{}" id="c1" action="close"><sdp type="bogus"/></webrtc>"#,
            NS_WEBRTC
        ))
        .unwrap();
        let decoded = decode(&element, "\n").unwrap();
        assert_eq!(decoded.action, Action::Close);
        assert!(decoded.items.is_empty());
        assert_eq!(encode_close(&CallId::from("c1")).get_attr("action"), Some("close"));
    }

    #[test]
    fn test_decode_failures() {
        let missing_id = Element::with_namespace(WEBRTC_ELEMENT, NS_WEBRTC);
        assert!(matches!(
            decode(&missing_id, "\n"),
            Err(SignalingError::BadRequest { reason }) if reason == NO_SESSION_ID
        ));

        let blank_id = Element::with_namespace(WEBRTC_ELEMENT, NS_WEBRTC).attr("id", "  ");
        assert!(decode(&blank_id, "\n").is_err());

        let bad_type = Element::parse(&format!(
            r#"<webrtc xmlns="{}" id="c1"><ice-candidate sdpMLineIndex="0"/><sdp type="rollback"><line>x</line></sdp></webrtc>"#,
            NS_WEBRTC
        ))
        .unwrap();
        assert!(matches!(
            decode(&bad_type, "\n"),
            Err(SignalingError::BadRequest { reason }) if reason == SDP_TYPE_UNKNOWN
        ));

        let bad_index = Element::parse(&format!(
            r#"<webrtc xmlns="{}" id="c1"><ice-candidate sdpMLineIndex="first"/></webrtc>"#,
            NS_WEBRTC
        ))
        .unwrap();
        assert!(matches!(
            decode(&bad_index, "\n"),
            Err(SignalingError::BadRequest { reason }) if reason == INVALID_MLINE_INDEX
        ));
    }

    #[test]
    fn test_items_keep_document_order() {
        let element = Element::parse(&format!(
            r#"<webrtc xmlns="{ns}" id="c9">
                 <ice-candidate sdpMLineIndex="0"><sdp><line>cand-a</line></sdp></ice-candidate>
                 <sdp type="answer"><line>v=0</line></sdp>
                 <ice-candidate sdpMLineIndex="1"><sdp><line>cand-b</line></sdp></ice-candidate>
               </webrtc>"#,
            ns = NS_WEBRTC
        ))
        .unwrap();
        let decoded = decode(&element, "\n").unwrap();
        assert_eq!(decoded.action, Action::Update);
        assert_eq!(
            decoded.items,
            vec![
                PayloadItem::Candidate(IceCandidate::new(None, 0, "cand-a")),
                PayloadItem::Description(SessionDescription::answer("v=0")),
                PayloadItem::Candidate(IceCandidate::new(None, 1, "cand-b")),
            ]
        );
    }
}
