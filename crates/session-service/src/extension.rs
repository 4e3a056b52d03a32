//! Per-session extensions installed by the registry
//!
//! Every session the registry constructs gets its own
//! [`PluginManager`]; each configured [`SessionExtension`] is installed into
//! it before login starts, so no inbound stanza is missed.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, info_span, warn, Instrument};
use viska_webrtc_signaling::{CallId, SessionDescription, SignalingConfig, SignalingEvent, WebRtcPlugin};
use viska_xmpp_core::{Jid, PluginManager};

/// Something installed into every new session's plugin manager
pub trait SessionExtension: Send + Sync {
    fn name(&self) -> &'static str;

    fn install(&self, plugins: &PluginManager);
}

/// An offer from a remote party, handed to the call UI
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IncomingCall {
    /// Identity of the session the offer arrived on
    pub local: Jid,
    pub remote: Jid,
    pub call_id: CallId,
    pub description: SessionDescription,
}

/// Receives incoming call offers
#[async_trait]
pub trait IncomingCallHandler: Send + Sync {
    async fn on_incoming_call(&self, call: IncomingCall);
}

/// Installs [`WebRtcPlugin`] and forwards its offers to an [`IncomingCallHandler`]
pub struct WebRtcExtension {
    config: SignalingConfig,
    handler: Option<Arc<dyn IncomingCallHandler>>,
}

impl WebRtcExtension {
    pub fn new(config: SignalingConfig) -> Self {
        Self { config, handler: None }
    }

    pub fn with_handler(mut self, handler: Arc<dyn IncomingCallHandler>) -> Self {
        self.handler = Some(handler);
        self
    }
}

impl SessionExtension for WebRtcExtension {
    fn name(&self) -> &'static str {
        "webrtc"
    }

    fn install(&self, plugins: &PluginManager) {
        let plugin = plugins.apply(WebRtcPlugin::new(self.config.clone()));
        let local = plugins.session().login_jid().clone();
        let span = info_span!("signaling", identity = %local);
        // The receiver ends when the plugin is dropped with its session
        let events = plugin.subscribe();
        drop(plugin);
        tokio::spawn(forward_events(local, events, self.handler.clone()).instrument(span));
    }
}

async fn forward_events(
    local: Jid,
    mut events: tokio::sync::broadcast::Receiver<SignalingEvent>,
    handler: Option<Arc<dyn IncomingCallHandler>>,
) {
    loop {
        let event = match events.recv().await {
            Ok(event) => event,
            Err(RecvError::Lagged(skipped)) => {
                warn!(skipped, "signaling events dropped");
                continue;
            }
            Err(RecvError::Closed) => break,
        };

        match &event {
            SignalingEvent::SdpReceived {
                call_id,
                remote,
                description,
                is_offer,
            } => {
                info!(%call_id, %remote, sdp_type = %description.sdp_type, is_offer, "session description received");
            }
            SignalingEvent::IceCandidateReceived { call_id, candidate } => {
                info!(%call_id, sdp_mline_index = candidate.sdp_mline_index, "ICE candidate received");
            }
            SignalingEvent::SessionClosing { call_id } => {
                info!(%call_id, "call closed by remote");
            }
        }

        if let SignalingEvent::SdpReceived {
            call_id,
            remote,
            description,
            is_offer: true,
        } = event
        {
            match &handler {
                Some(handler) => {
                    handler
                        .on_incoming_call(IncomingCall {
                            local: local.clone(),
                            remote,
                            call_id,
                            description,
                        })
                        .await
                }
                None => debug!(%call_id, "no incoming call handler, offer not delivered"),
            }
        }
    }
    debug!("signaling event forwarder stopped");
}
