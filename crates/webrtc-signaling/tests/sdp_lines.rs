// Property tests for the line encoding of description bodies

use proptest::prelude::*;
use viska_webrtc_signaling::codec::{self, PayloadItem};
use viska_webrtc_signaling::{CallId, IceCandidate, SdpType, SessionDescription};
use viska_xmpp_core::Element;

fn sdp_line() -> impl Strategy<Value = String> {
    // Printable text, including blanks and XML-special characters
    "[ -~]{0,40}"
}

fn sdp_type() -> impl Strategy<Value = SdpType> {
    prop_oneof![Just(SdpType::Offer), Just(SdpType::PrAnswer), Just(SdpType::Answer)]
}

fn through_xml(element: &Element) -> Element {
    Element::parse(&element.to_xml().unwrap()).unwrap()
}

proptest! {
    #[test]
    fn description_body_survives_the_wire(
        lines in prop::collection::vec(sdp_line(), 1..12),
        sdp_type in sdp_type(),
        terminator in prop_oneof![Just("\r\n"), Just("\n")],
        creating in any::<bool>(),
    ) {
        let body = lines.join(terminator);
        let description = SessionDescription::new(sdp_type, body);
        let call_id = CallId::new();

        let wire = through_xml(&codec::encode_description(&call_id, &description, creating));
        let decoded = codec::decode(&wire, terminator).unwrap();

        prop_assert_eq!(decoded.call_id, call_id);
        prop_assert_eq!(decoded.items, vec![PayloadItem::Description(description)]);
    }

    #[test]
    fn split_then_join_is_identity(lines in prop::collection::vec(sdp_line(), 1..12)) {
        let body = lines.join("\r\n");
        let split: Vec<String> = codec::split_lines(&body).into_iter().map(str::to_string).collect();
        prop_assert_eq!(split, lines);
    }

    #[test]
    fn candidates_keep_order_and_index(
        entries in prop::collection::vec(("[a-z0-9]{1,4}", 0u32..8, "candidate:[ -~]{1,30}"), 0..6),
    ) {
        let candidates: Vec<IceCandidate> = entries
            .into_iter()
            .map(|(mid, index, sdp)| IceCandidate::new(Some(mid), index, sdp))
            .collect();

        let wire = through_xml(&codec::encode_candidates(&CallId::from("c1"), &candidates));
        let decoded = codec::decode(&wire, "\r\n").unwrap();

        let expected: Vec<PayloadItem> = candidates.into_iter().map(PayloadItem::Candidate).collect();
        prop_assert_eq!(decoded.items, expected);
    }
}
