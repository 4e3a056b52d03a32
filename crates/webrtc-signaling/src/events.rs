//! Events emitted by the signaling plugin

use std::pin::Pin;

use futures::Stream;
use serde::Serialize;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt;
use viska_xmpp_core::Jid;

use crate::types::{CallId, IceCandidate, SessionDescription};

/// Decoded signaling message, one per `sdp`/`ice-candidate` child or close
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum SignalingEvent {
    /// The remote sent a session description
    SdpReceived {
        call_id: CallId,
        remote: Jid,
        description: SessionDescription,
        /// Set when the message opened the call (`action="create"`)
        is_offer: bool,
    },

    /// The remote sent an ICE candidate
    IceCandidateReceived {
        call_id: CallId,
        candidate: IceCandidate,
    },

    /// The remote closed the call
    SessionClosing { call_id: CallId },
}

impl SignalingEvent {
    pub fn call_id(&self) -> &CallId {
        match self {
            SignalingEvent::SdpReceived { call_id, .. }
            | SignalingEvent::IceCandidateReceived { call_id, .. }
            | SignalingEvent::SessionClosing { call_id } => call_id,
        }
    }
}

/// Stream of every signaling event of one session
pub type EventStream = BroadcastStream<SignalingEvent>;

/// Stream of the events of a single call
pub type CallEventStream = Pin<Box<dyn Stream<Item = SignalingEvent> + Send>>;

/// Broadcasts events to every subscriber in emission order
#[derive(Debug, Clone)]
pub struct EventEmitter {
    sender: broadcast::Sender<SignalingEvent>,
}

impl EventEmitter {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn emit(&self, event: SignalingEvent) {
        // No subscribers is fine
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> EventStream {
        BroadcastStream::new(self.sender.subscribe())
    }

    pub fn receiver(&self) -> broadcast::Receiver<SignalingEvent> {
        self.sender.subscribe()
    }

    /// Events for `call_id` only; lagged gaps are skipped
    pub fn subscribe_call(&self, call_id: CallId) -> CallEventStream {
        Box::pin(self.subscribe().filter_map(move |event| match event {
            Ok(event) if *event.call_id() == call_id => Some(event),
            _ => None,
        }))
    }

    pub fn receiver_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventEmitter {
    fn default() -> Self {
        Self::new(256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_call_filter_skips_other_calls() {
        let emitter = EventEmitter::default();
        let mut only_a = emitter.subscribe_call(CallId::from("a"));

        emitter.emit(SignalingEvent::SessionClosing {
            call_id: CallId::from("b"),
        });
        emitter.emit(SignalingEvent::SessionClosing {
            call_id: CallId::from("a"),
        });

        let event = only_a.next().await.unwrap();
        assert_eq!(event.call_id().as_str(), "a");
    }

    #[test]
    fn test_emit_without_subscribers() {
        let emitter = EventEmitter::new(4);
        emitter.emit(SignalingEvent::SessionClosing {
            call_id: CallId::new(),
        });
        assert_eq!(emitter.receiver_count(), 0);
    }
}
