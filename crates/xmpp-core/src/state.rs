//! Session lifecycle state machine
//!
//! ```text
//! DISCONNECTED ──login──▶ CONNECTING ──stream ok──▶ HANDSHAKING ──auth ok──▶ ONLINE
//!      ▲                       │                         │                     │
//!      └────── transport loss ─┴─────────────────────────┴─────────────────────┘
//!
//!  any state ──dispose──▶ DISPOSED (terminal)
//! ```
//!
//! [`StateMachine`] is the shared helper session implementations use to hold
//! their current state and publish transitions. Transitions are applied and
//! broadcast under one lock, so every subscriber observes them in the order
//! they happened.

use std::fmt;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::trace;

use crate::error::{XmppError, XmppResult};

/// Lifecycle states of a protocol session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Handshaking,
    Online,
    Disposed,
}

impl SessionState {
    /// Whether the transition `self -> next` is allowed
    pub fn can_transition_to(self, next: SessionState) -> bool {
        use SessionState::*;
        match (self, next) {
            (Disposed, _) => false,
            (_, Disposed) => true,
            (_, Disconnected) => true,
            (Disconnected, Connecting) => true,
            (Connecting, Handshaking) => true,
            (Handshaking, Online) => true,
            _ => false,
        }
    }

    /// CONNECTING or HANDSHAKING
    pub fn is_logging_in(self) -> bool {
        matches!(self, SessionState::Connecting | SessionState::Handshaking)
    }

    /// Whether a transport connection is open or being opened
    pub fn has_connection(self) -> bool {
        matches!(
            self,
            SessionState::Connecting | SessionState::Handshaking | SessionState::Online
        )
    }

    pub fn is_terminal(self) -> bool {
        self == SessionState::Disposed
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Disconnected => "DISCONNECTED",
            SessionState::Connecting => "CONNECTING",
            SessionState::Handshaking => "HANDSHAKING",
            SessionState::Online => "ONLINE",
            SessionState::Disposed => "DISPOSED",
        };
        f.write_str(name)
    }
}

/// Current state plus an ordered change feed
#[derive(Debug)]
pub struct StateMachine {
    current: Mutex<SessionState>,
    changes: broadcast::Sender<SessionState>,
}

impl StateMachine {
    pub fn new(capacity: usize) -> Self {
        let (changes, _) = broadcast::channel(capacity.max(1));
        Self {
            current: Mutex::new(SessionState::Disconnected),
            changes,
        }
    }

    pub fn current(&self) -> SessionState {
        *self.current.lock()
    }

    /// Subscribe to future transitions
    pub fn subscribe(&self) -> broadcast::Receiver<SessionState> {
        self.changes.subscribe()
    }

    /// Apply a transition; transitions to the current state are no-ops
    pub fn transition(&self, next: SessionState) -> XmppResult<()> {
        let mut current = self.current.lock();
        if *current == next {
            return Ok(());
        }
        if !current.can_transition_to(next) {
            if current.is_terminal() {
                return Err(XmppError::SessionDisposed);
            }
            return Err(XmppError::InvalidTransition {
                from: *current,
                to: next,
            });
        }
        trace!("session state {} -> {}", *current, next);
        *current = next;
        // No receivers is fine
        let _ = self.changes.send(next);
        Ok(())
    }

    /// Fail with `SessionDisposed` once DISPOSED was reached
    pub fn ensure_not_disposed(&self) -> XmppResult<()> {
        if self.current().is_terminal() {
            Err(XmppError::SessionDisposed)
        } else {
            Ok(())
        }
    }
}

impl Default for StateMachine {
    fn default() -> Self {
        Self::new(64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use SessionState::*;

    #[test]
    fn test_transition_table() {
        assert!(Disconnected.can_transition_to(Connecting));
        assert!(Connecting.can_transition_to(Handshaking));
        assert!(Handshaking.can_transition_to(Online));
        assert!(Online.can_transition_to(Disconnected));
        assert!(Connecting.can_transition_to(Disconnected));
        assert!(Online.can_transition_to(Disposed));

        assert!(!Disconnected.can_transition_to(Online));
        assert!(!Connecting.can_transition_to(Online));
        assert!(!Online.can_transition_to(Connecting));
        for next in [Disconnected, Connecting, Handshaking, Online, Disposed] {
            assert!(!Disposed.can_transition_to(next));
        }
    }

    #[tokio::test]
    async fn test_transitions_are_broadcast_in_order() {
        let machine = StateMachine::default();
        let mut rx = machine.subscribe();

        machine.transition(Connecting).unwrap();
        machine.transition(Handshaking).unwrap();
        machine.transition(Online).unwrap();
        machine.transition(Disconnected).unwrap();

        assert_eq!(rx.recv().await.unwrap(), Connecting);
        assert_eq!(rx.recv().await.unwrap(), Handshaking);
        assert_eq!(rx.recv().await.unwrap(), Online);
        assert_eq!(rx.recv().await.unwrap(), Disconnected);
        assert_eq!(machine.current(), Disconnected);
    }

    #[test]
    fn test_disposed_is_irreversible() {
        let machine = StateMachine::default();
        machine.transition(Disposed).unwrap();
        assert!(matches!(
            machine.transition(Connecting),
            Err(XmppError::SessionDisposed)
        ));
        assert!(machine.ensure_not_disposed().is_err());
        // Repeating the terminal state is a no-op
        assert!(machine.transition(Disposed).is_ok());
    }

    #[test]
    fn test_invalid_transition_reports_states() {
        let machine = StateMachine::default();
        match machine.transition(Online) {
            Err(XmppError::InvalidTransition { from, to }) => {
                assert_eq!(from, Disconnected);
                assert_eq!(to, Online);
            }
            other => panic!("unexpected {:?}", other),
        }
    }
}
