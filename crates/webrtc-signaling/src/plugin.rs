//! The signaling plugin
//!
//! One [`WebRtcPlugin`] is applied per session. It taps the session's inbound
//! stream once, decodes `webrtc` requests on a single task (so events keep
//! stanza arrival order) and keeps a table of the calls seen on the session.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, OnceLock};

use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info_span, warn, Instrument};
use viska_xmpp_core::{Element, IqType, Jid, Plugin, PluginContext, SessionState, Stanza};

use crate::codec::{self, Action, PayloadItem, NS_WEBRTC, WEBRTC_ELEMENT};
use crate::config::SignalingConfig;
use crate::error::{SignalingError, SignalingResult};
use crate::events::{CallEventStream, EventEmitter, EventStream, SignalingEvent};
use crate::types::{CallDirection, CallId, CallPhase, CallSession, IceCandidate, SessionDescription};

const NO_SENDER: &str = "No sender found.";

/// Closed call ids remembered per session; older ones are forgotten
pub const RETIRED_CALLS_KEPT: usize = 256;

/// Recently closed call ids, oldest first
#[derive(Debug, Default)]
struct Retired {
    order: VecDeque<CallId>,
    ids: HashSet<CallId>,
}

impl Retired {
    fn contains(&self, call_id: &CallId) -> bool {
        self.ids.contains(call_id)
    }

    fn insert(&mut self, call_id: &CallId) {
        if !self.ids.insert(call_id.clone()) {
            return;
        }
        self.order.push_back(call_id.clone());
        while self.order.len() > RETIRED_CALLS_KEPT {
            if let Some(oldest) = self.order.pop_front() {
                self.ids.remove(&oldest);
            }
        }
    }

    fn len(&self) -> usize {
        self.order.len()
    }
}

#[derive(Debug, Default)]
struct CallTable {
    active: HashMap<CallId, CallSession>,
    retired: Retired,
}

impl CallTable {
    fn ensure_open(&self, call_id: &CallId) -> SignalingResult<()> {
        if self.retired.contains(call_id) {
            return Err(SignalingError::CallClosed {
                call_id: call_id.clone(),
            });
        }
        Ok(())
    }

    fn touch(&mut self, call_id: &CallId, local: &Jid, remote: &Jid, direction: CallDirection) -> &mut CallSession {
        self.active
            .entry(call_id.clone())
            .or_insert_with(|| CallSession::new(call_id.clone(), local.clone(), remote.clone(), direction))
    }

    fn retire(&mut self, call_id: &CallId) -> Option<CallSession> {
        self.retired.insert(call_id);
        self.active.remove(call_id)
    }

    fn retire_all(&mut self) {
        let ids: Vec<CallId> = self.active.keys().cloned().collect();
        for id in ids {
            self.retire(&id);
        }
    }
}

/// Call signaling over `https://schemas.viska.chat/demo/webrtc` IQs
#[derive(Debug)]
pub struct WebRtcPlugin {
    config: SignalingConfig,
    context: OnceLock<PluginContext>,
    calls: Mutex<CallTable>,
    events: EventEmitter,
}

impl WebRtcPlugin {
    pub fn new(config: SignalingConfig) -> Self {
        let events = EventEmitter::new(config.event_capacity);
        Self {
            config,
            context: OnceLock::new(),
            calls: Mutex::new(CallTable::default()),
            events,
        }
    }

    pub fn config(&self) -> &SignalingConfig {
        &self.config
    }

    /// Every event decoded on this session
    pub fn events(&self) -> EventStream {
        self.events.subscribe()
    }

    /// Raw receiver for consumers that prefer `recv()` over a stream
    pub fn subscribe(&self) -> broadcast::Receiver<SignalingEvent> {
        self.events.receiver()
    }

    /// Events of one call only
    pub fn call_events(&self, call_id: CallId) -> CallEventStream {
        self.events.subscribe_call(call_id)
    }

    /// A call id not yet used on this plugin instance
    pub fn new_call_id(&self) -> CallId {
        let calls = self.calls.lock();
        loop {
            let id = CallId::new();
            if !calls.active.contains_key(&id) && !calls.retired.contains(&id) {
                return id;
            }
        }
    }

    pub fn call(&self, call_id: &CallId) -> Option<CallSession> {
        self.calls.lock().active.get(call_id).cloned()
    }

    pub fn active_calls(&self) -> Vec<CallSession> {
        self.calls.lock().active.values().cloned().collect()
    }

    /// Send a session description; `creating` marks the message that opens the call
    pub async fn send_sdp(
        &self,
        recipient: &Jid,
        call_id: &CallId,
        description: &SessionDescription,
        creating: bool,
    ) -> SignalingResult<()> {
        let context = self.context()?;
        {
            let mut calls = self.calls.lock();
            calls.ensure_open(call_id)?;
            let call = calls.touch(call_id, &context.local_jid(), recipient, CallDirection::Outbound);
            call.phase = description.sdp_type.into();
        }
        let payload = codec::encode_description(call_id, description, creating);
        self.send_request(context, recipient, payload).await
    }

    pub async fn send_ice_candidates(
        &self,
        recipient: &Jid,
        call_id: &CallId,
        candidates: &[IceCandidate],
    ) -> SignalingResult<()> {
        let context = self.context()?;
        {
            let mut calls = self.calls.lock();
            calls.ensure_open(call_id)?;
            calls.touch(call_id, &context.local_jid(), recipient, CallDirection::Outbound);
        }
        let payload = codec::encode_candidates(call_id, candidates);
        self.send_request(context, recipient, payload).await
    }

    /// Tell the remote the call is over; the id is retired immediately
    pub async fn close_session(&self, recipient: &Jid, call_id: &CallId) -> SignalingResult<()> {
        let context = self.context()?;
        {
            let mut calls = self.calls.lock();
            calls.ensure_open(call_id)?;
            calls.retire(call_id);
        }
        let payload = codec::encode_close(call_id);
        self.send_request(context, recipient, payload).await
    }

    fn context(&self) -> SignalingResult<&PluginContext> {
        self.context.get().ok_or(SignalingError::NotAttached)
    }

    async fn send_request(&self, context: &PluginContext, recipient: &Jid, payload: Element) -> SignalingResult<()> {
        let iq = Stanza::iq(IqType::Set, Some(&context.local_jid()), Some(recipient), Some(payload));
        context.send_iq(iq).await?;
        Ok(())
    }

    async fn run(
        self: Arc<Self>,
        context: PluginContext,
        mut inbound: broadcast::Receiver<Stanza>,
        mut states: broadcast::Receiver<SessionState>,
    ) {
        loop {
            tokio::select! {
                biased;
                state = states.recv() => match state {
                    Ok(SessionState::Disposed) | Err(RecvError::Closed) => break,
                    Ok(_) => {}
                    Err(RecvError::Lagged(_)) => {
                        if context.session().state().is_terminal() {
                            break;
                        }
                    }
                },
                stanza = inbound.recv() => match stanza {
                    Ok(stanza) => self.handle_stanza(&context, stanza).await,
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "inbound stanza feed lagged, signaling messages lost");
                    }
                    Err(RecvError::Closed) => break,
                },
            }
        }
        let mut calls = self.calls.lock();
        debug!(calls = calls.active.len(), "session disposed, dropping calls");
        calls.retire_all();
    }

    async fn handle_stanza(&self, context: &PluginContext, stanza: Stanza) {
        if stanza.iq_type() != Some(IqType::Set) {
            return;
        }
        let Some(payload) = stanza.iq_payload().filter(|p| p.is(WEBRTC_ELEMENT, NS_WEBRTC)) else {
            return;
        };

        let outcome = codec::decode(payload, &self.config.line_terminator)
            .and_then(|decoded| self.dispatch(context, stanza.sender(), decoded));
        let reply = match outcome {
            Ok(()) => context.send_result(&stanza).await,
            Err(e) => {
                debug!(error = %e, id = ?stanza.id(), "rejecting signaling request");
                match e.to_stanza_error() {
                    Some(error) => context.send_error(&stanza, &error).await,
                    None => Ok(()),
                }
            }
        };
        if let Err(e) = reply {
            debug!(error = %e, "failed to answer signaling request");
        }
    }

    /// Update the call table and emit the decoded events
    fn dispatch(&self, context: &PluginContext, sender: Option<Jid>, decoded: codec::SignalingPayload) -> SignalingResult<()> {
        let call_id = decoded.call_id;
        let mut calls = self.calls.lock();

        // Both sides may hang up at once; every close is reported
        if decoded.action == Action::Close {
            calls.retire(&call_id);
            drop(calls);
            self.events.emit(SignalingEvent::SessionClosing { call_id });
            return Ok(());
        }

        if calls.retired.contains(&call_id) {
            debug!(%call_id, "ignoring message for closed call");
            return Ok(());
        }

        let remote = sender.ok_or_else(|| SignalingError::bad_request(NO_SENDER))?;
        let call = calls.touch(&call_id, &context.local_jid(), &remote, CallDirection::Inbound);
        let is_offer = decoded.action == Action::Create;
        let mut events = Vec::with_capacity(decoded.items.len());
        for item in decoded.items {
            match item {
                PayloadItem::Description(description) => {
                    call.phase = CallPhase::from(description.sdp_type);
                    events.push(SignalingEvent::SdpReceived {
                        call_id: call_id.clone(),
                        remote: remote.clone(),
                        description,
                        is_offer,
                    });
                }
                PayloadItem::Candidate(candidate) => events.push(SignalingEvent::IceCandidateReceived {
                    call_id: call_id.clone(),
                    candidate,
                }),
            }
        }
        drop(calls);

        for event in events {
            self.events.emit(event);
        }
        Ok(())
    }
}

impl Default for WebRtcPlugin {
    fn default() -> Self {
        Self::new(SignalingConfig::default())
    }
}

impl Plugin for WebRtcPlugin {
    fn name(&self) -> &'static str {
        "webrtc"
    }

    fn features(&self) -> Vec<String> {
        vec![NS_WEBRTC.to_string()]
    }

    fn supported_iqs(&self) -> Vec<(String, String)> {
        vec![(NS_WEBRTC.to_string(), WEBRTC_ELEMENT.to_string())]
    }

    fn on_applying(self: Arc<Self>, context: PluginContext) {
        if self.context.set(context.clone()).is_err() {
            warn!("signaling plugin applied twice, ignoring");
            return;
        }
        // Subscribe before spawning so nothing sent after attach is missed
        let inbound = context.inbound_stanzas();
        let states = context.session().subscribe_state();
        let span = info_span!("webrtc", identity = %context.session().login_jid());
        tokio::spawn(self.run(context, inbound, states).instrument(span));
    }
}
