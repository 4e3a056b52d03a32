// End-to-end signaling tests over in-memory sessions
//
// Outbound stanzas captured on one session are serialized, reparsed and
// injected into the peer's session so both codec directions are exercised.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio_stream::StreamExt;
use viska_webrtc_signaling::{
    CallDirection, CallId, CallPhase, IceCandidate, SessionDescription, SignalingConfig, SignalingEvent, WebRtcPlugin,
    NS_WEBRTC,
};
use viska_xmpp_core::testing::MemorySession;
use viska_xmpp_core::{Condition, IqType, Jid, PluginManager, Session, Stanza};

fn jid(s: &str) -> Jid {
    Jid::parse(s).unwrap()
}

struct Peer {
    session: Arc<MemorySession>,
    plugin: Arc<WebRtcPlugin>,
    _plugins: PluginManager,
}

fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("viska_webrtc_signaling=debug")
        .with_test_writer()
        .try_init();
}

fn peer(address: &str) -> Peer {
    init_logging();
    let session = MemorySession::online(jid(address));
    let plugins = PluginManager::new(session.clone());
    let plugin = plugins.apply(WebRtcPlugin::new(SignalingConfig::default()));
    Peer {
        session,
        plugin,
        _plugins: plugins,
    }
}

/// Deliver what `from` sent last to `to`, through the XML text form
fn deliver_last(from: &Peer, to: &Peer) {
    let stanza = from.session.sent().pop().expect("nothing sent");
    let reparsed = Stanza::parse(&stanza.to_xml().unwrap()).unwrap();
    to.session.inject(reparsed);
}

async fn next_sent(rx: &mut broadcast::Receiver<Stanza>) -> Stanza {
    tokio::time::timeout(Duration::from_secs(1), rx.recv())
        .await
        .expect("no stanza sent")
        .unwrap()
}

async fn next_event(rx: &mut broadcast::Receiver<SignalingEvent>) -> SignalingEvent {
    tokio::time::timeout(Duration::from_secs(1), rx.recv())
        .await
        .expect("no event")
        .unwrap()
}

fn inbound(xml: &str) -> Stanza {
    Stanza::parse(xml).unwrap()
}

#[tokio::test]
async fn test_close_yields_exactly_one_event() {
    let alice = peer("alice@example.com");
    let mut events = alice.plugin.subscribe();
    let mut replies = alice.session.subscribe_sent();

    alice.session.inject(inbound(&format!(
        r#"<iq type="set" id="s1" from="bob@example.com/phone" to="alice@example.com/memory">
             <webrtc xmlns="{}" id="c1" action="close"/>
           </iq>"#,
        NS_WEBRTC
    )));

    let reply = next_sent(&mut replies).await;
    assert_eq!(reply.iq_type(), Some(IqType::Result));
    assert_eq!(reply.id(), Some("s1"));

    assert_eq!(
        events.try_recv().unwrap(),
        SignalingEvent::SessionClosing {
            call_id: CallId::from("c1")
        }
    );
    assert!(events.try_recv().is_err());
}

#[tokio::test]
async fn test_missing_id_is_answered_with_bad_request() {
    let alice = peer("alice@example.com");
    let mut events = alice.plugin.subscribe();
    let mut replies = alice.session.subscribe_sent();

    alice.session.inject(inbound(&format!(
        r#"<iq type="set" id="s2" from="bob@example.com/phone"><webrtc xmlns="{}"><sdp type="offer"><line>v=0</line></sdp></webrtc></iq>"#,
        NS_WEBRTC
    )));

    let reply = next_sent(&mut replies).await;
    assert_eq!(reply.iq_type(), Some(IqType::Error));
    assert_eq!(reply.recipient(), Some(jid("bob@example.com/phone")));
    let error = reply.error().unwrap();
    assert_eq!(error.condition, Condition::BadRequest);
    assert_eq!(error.text.as_deref(), Some("No session id found."));

    assert!(events.try_recv().is_err());
    assert_eq!(alice.session.sent().len(), 1);
}

#[tokio::test]
async fn test_unknown_sdp_type_rejects_whole_payload() {
    let alice = peer("alice@example.com");
    let mut events = alice.plugin.subscribe();
    let mut replies = alice.session.subscribe_sent();

    alice.session.inject(inbound(&format!(
        r#"<iq type="set" id="s3" from="bob@example.com/phone"><webrtc xmlns="{}" id="c1"><ice-candidate sdpMLineIndex="0"><sdp><line>candidate:1</line></sdp></ice-candidate><sdp type="rollback"/></webrtc></iq>"#,
        NS_WEBRTC
    )));

    let reply = next_sent(&mut replies).await;
    assert_eq!(reply.error().unwrap().text.as_deref(), Some("SDP type unknown."));
    assert!(events.try_recv().is_err());
    assert!(alice.plugin.call(&CallId::from("c1")).is_none());
}

#[tokio::test]
async fn test_other_namespaces_are_ignored() {
    let alice = peer("alice@example.com");
    let mut events = alice.plugin.subscribe();

    alice.session.inject(inbound(
        r#"<iq type="set" id="x1" from="bob@example.com/phone"><webrtc xmlns="urn:example:other" id="c1" action="close"/></iq>"#,
    ));
    alice.session.inject(inbound(&format!(
        r#"<iq type="get" id="x2" from="bob@example.com/phone"><webrtc xmlns="{}" id="c1" action="close"/></iq>"#,
        NS_WEBRTC
    )));
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert!(events.try_recv().is_err());
    assert!(alice.session.sent().is_empty());
}

#[tokio::test]
async fn test_offer_round_trips_between_peers() {
    let alice = peer("alice@example.com");
    let bob = peer("bob@example.com");
    let mut bob_events = bob.plugin.subscribe();
    let mut bob_replies = bob.session.subscribe_sent();

    let body = "v=0\r\no=- 46117 2 IN IP4 127.0.0.1\r\n\r\ns=-\r\na=group:BUNDLE 0\r\n";
    let call_id = alice.plugin.new_call_id();
    let bob_address = bob.session.negotiated_jid().unwrap();
    alice
        .plugin
        .send_sdp(&bob_address, &call_id, &SessionDescription::offer(body), true)
        .await
        .unwrap();
    deliver_last(&alice, &bob);

    match next_event(&mut bob_events).await {
        SignalingEvent::SdpReceived {
            call_id: received,
            remote,
            description,
            is_offer,
        } => {
            assert_eq!(received, call_id);
            assert_eq!(remote.to_string(), "alice@example.com/memory");
            assert_eq!(description, SessionDescription::offer(body));
            assert!(is_offer);
        }
        other => panic!("unexpected event {:?}", other),
    }
    assert_eq!(next_sent(&mut bob_replies).await.iq_type(), Some(IqType::Result));

    let call = bob.plugin.call(&call_id).unwrap();
    assert_eq!(call.direction, CallDirection::Inbound);
    assert_eq!(call.phase, CallPhase::Offered);
}

#[tokio::test]
async fn test_concurrent_calls_do_not_cross_deliver() {
    let alice = peer("alice@example.com");
    let bob = peer("bob@example.com");
    let bob_address = bob.session.negotiated_jid().unwrap();

    let call_a = alice.plugin.new_call_id();
    let call_b = alice.plugin.new_call_id();
    let mut only_a = bob.plugin.call_events(call_a.clone());
    let mut only_b = bob.plugin.call_events(call_b.clone());

    alice
        .plugin
        .send_sdp(&bob_address, &call_a, &SessionDescription::offer("a=1"), true)
        .await
        .unwrap();
    deliver_last(&alice, &bob);
    alice
        .plugin
        .send_sdp(&bob_address, &call_b, &SessionDescription::offer("b=1"), true)
        .await
        .unwrap();
    deliver_last(&alice, &bob);
    alice
        .plugin
        .send_ice_candidates(&bob_address, &call_a, &[IceCandidate::new(Some("0".into()), 0, "candidate:a")])
        .await
        .unwrap();
    deliver_last(&alice, &bob);
    alice.plugin.close_session(&bob_address, &call_b).await.unwrap();
    deliver_last(&alice, &bob);

    let timeout = Duration::from_secs(1);
    let first_a = tokio::time::timeout(timeout, only_a.next()).await.unwrap().unwrap();
    let second_a = tokio::time::timeout(timeout, only_a.next()).await.unwrap().unwrap();
    let first_b = tokio::time::timeout(timeout, only_b.next()).await.unwrap().unwrap();
    let second_b = tokio::time::timeout(timeout, only_b.next()).await.unwrap().unwrap();

    for event in [&first_a, &second_a] {
        assert_eq!(event.call_id(), &call_a);
    }
    for event in [&first_b, &second_b] {
        assert_eq!(event.call_id(), &call_b);
    }
    assert!(matches!(first_a, SignalingEvent::SdpReceived { .. }));
    assert!(matches!(second_a, SignalingEvent::IceCandidateReceived { .. }));
    assert!(matches!(first_b, SignalingEvent::SdpReceived { .. }));
    assert!(matches!(second_b, SignalingEvent::SessionClosing { .. }));

    assert!(bob.plugin.call(&call_a).is_some());
    assert!(bob.plugin.call(&call_b).is_none());
}

#[tokio::test]
async fn test_messages_after_close_are_acknowledged_and_dropped() {
    let alice = peer("alice@example.com");
    let mut events = alice.plugin.subscribe();
    let mut replies = alice.session.subscribe_sent();

    alice.session.inject(inbound(&format!(
        r#"<iq type="set" id="s1" from="bob@example.com/phone"><webrtc xmlns="{}" id="c7" action="close"/></iq>"#,
        NS_WEBRTC
    )));
    alice.session.inject(inbound(&format!(
        r#"<iq type="set" id="s2" from="bob@example.com/phone"><webrtc xmlns="{}" id="c7"><sdp type="answer"><line>v=0</line></sdp></webrtc></iq>"#,
        NS_WEBRTC
    )));

    assert_eq!(next_sent(&mut replies).await.id(), Some("s1"));
    let late = next_sent(&mut replies).await;
    assert_eq!(late.id(), Some("s2"));
    assert_eq!(late.iq_type(), Some(IqType::Result));

    assert!(matches!(events.try_recv().unwrap(), SignalingEvent::SessionClosing { .. }));
    assert!(events.try_recv().is_err());
}

#[tokio::test]
async fn test_remote_close_after_local_close_is_reported() {
    let alice = peer("alice@example.com");
    let bob_address = jid("bob@example.com/phone");
    let call_id = CallId::from("c1");
    let mut events = alice.plugin.subscribe();
    let mut replies = alice.session.subscribe_sent();

    alice.plugin.close_session(&bob_address, &call_id).await.unwrap();
    assert_eq!(next_sent(&mut replies).await.iq_type(), Some(IqType::Set));

    // Both sides hung up at once, then bob repeats the close
    for id in ["s1", "s2"] {
        alice.session.inject(inbound(&format!(
            r#"<iq type="set" id="{id}" from="bob@example.com/phone"><webrtc xmlns="{}" id="c1" action="close"/></iq>"#,
            NS_WEBRTC
        )));
        let reply = next_sent(&mut replies).await;
        assert_eq!(reply.id(), Some(id));
        assert_eq!(reply.iq_type(), Some(IqType::Result));
        assert_eq!(
            next_event(&mut events).await,
            SignalingEvent::SessionClosing {
                call_id: call_id.clone()
            }
        );
    }
    assert!(events.try_recv().is_err());
    assert!(alice.plugin.call(&call_id).is_none());
}

#[tokio::test]
async fn test_dispose_clears_calls_and_fails_sends() {
    let alice = peer("alice@example.com");
    let bob_address = jid("bob@example.com/phone");
    let call_id = alice.plugin.new_call_id();
    alice
        .plugin
        .send_sdp(&bob_address, &call_id, &SessionDescription::offer("v=0"), true)
        .await
        .unwrap();
    assert_eq!(alice.plugin.active_calls().len(), 1);

    alice.session.dispose().await.unwrap();
    for _ in 0..100 {
        if alice.plugin.active_calls().is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert!(alice.plugin.active_calls().is_empty());

    let result = alice.plugin.close_session(&bob_address, &call_id).await;
    assert!(result.is_err());
    let fresh = alice.plugin.new_call_id();
    let result = alice
        .plugin
        .send_sdp(&bob_address, &fresh, &SessionDescription::offer("v=0"), true)
        .await;
    assert!(result.unwrap_err().is_disposed());
}

#[tokio::test]
async fn test_error_reply_surfaces_to_sender() {
    let alice = peer("alice@example.com");
    alice
        .session
        .set_reply_mode(viska_xmpp_core::testing::ReplyMode::AutoError(
            viska_xmpp_core::StanzaError::bad_request("nope"),
        ));
    let result = alice
        .plugin
        .send_ice_candidates(&jid("bob@example.com/phone"), &CallId::new(), &[])
        .await;
    match result {
        Err(viska_webrtc_signaling::SignalingError::Xmpp(viska_xmpp_core::XmppError::Stanza(error))) => {
            assert_eq!(error.condition, Condition::BadRequest);
        }
        other => panic!("unexpected result {:?}", other),
    }
}
