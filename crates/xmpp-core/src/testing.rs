//! In-memory session for tests and demos
//!
//! [`MemorySession`] follows the lifecycle rules of the [`Session`] contract
//! without any network: login walks CONNECTING → HANDSHAKING → ONLINE (and can
//! be held in CONNECTING), outbound stanzas are recorded, and inbound stanzas
//! are injected by the test.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{broadcast, oneshot, watch};

use crate::error::{XmppError, XmppResult};
use crate::jid::Jid;
use crate::session::{Credential, Session};
use crate::stanza::{Stanza, StanzaError};
use crate::state::{SessionState, StateMachine};

/// How the fake server answers request IQs
#[derive(Debug, Clone)]
pub enum ReplyMode {
    /// Answer every request with an empty result
    AutoResult,
    /// Answer every request with this error
    AutoError(StanzaError),
    /// Leave requests pending until [`MemorySession::respond`]
    Manual,
}

/// What the next login attempts do after the handshake
#[derive(Debug, Clone)]
pub enum LoginOutcome {
    Succeed,
    Fail(String),
}

/// A [`Session`] backed by memory
#[derive(Debug)]
pub struct MemorySession {
    login_jid: Jid,
    negotiated: Mutex<Option<Jid>>,
    machine: StateMachine,
    inbound: broadcast::Sender<Stanza>,
    outbound: broadcast::Sender<Stanza>,
    sent: Mutex<Vec<Stanza>>,
    pending: Mutex<HashMap<String, oneshot::Sender<XmppResult<Stanza>>>>,
    reply_mode: Mutex<ReplyMode>,
    login_outcome: Mutex<LoginOutcome>,
    login_gate: watch::Sender<bool>,
    login_calls: AtomicUsize,
    logins_while_busy: AtomicUsize,
    kill_calls: AtomicUsize,
    dispose_calls: AtomicUsize,
}

impl MemorySession {
    pub fn new(login_jid: Jid) -> Arc<Self> {
        let (inbound, _) = broadcast::channel(256);
        let (outbound, _) = broadcast::channel(256);
        let (login_gate, _) = watch::channel(false);
        Arc::new(Self {
            login_jid,
            negotiated: Mutex::new(None),
            machine: StateMachine::default(),
            inbound,
            outbound,
            sent: Mutex::new(Vec::new()),
            pending: Mutex::new(HashMap::new()),
            reply_mode: Mutex::new(ReplyMode::AutoResult),
            login_outcome: Mutex::new(LoginOutcome::Succeed),
            login_gate,
            login_calls: AtomicUsize::new(0),
            logins_while_busy: AtomicUsize::new(0),
            kill_calls: AtomicUsize::new(0),
            dispose_calls: AtomicUsize::new(0),
        })
    }

    /// A session that is already ONLINE
    pub fn online(login_jid: Jid) -> Arc<Self> {
        let session = Self::new(login_jid);
        for state in [
            SessionState::Connecting,
            SessionState::Handshaking,
            SessionState::Online,
        ] {
            let _ = session.machine.transition(state);
        }
        *session.negotiated.lock() = session.login_jid.with_resource("memory").ok();
        session
    }

    /// Deliver a stanza as if it came from the server
    pub fn inject(&self, stanza: Stanza) {
        let _ = self.inbound.send(stanza);
    }

    /// Every stanza sent so far
    pub fn sent(&self) -> Vec<Stanza> {
        self.sent.lock().clone()
    }

    /// Feed of stanzas sent from now on
    pub fn subscribe_sent(&self) -> broadcast::Receiver<Stanza> {
        self.outbound.subscribe()
    }

    pub fn set_reply_mode(&self, mode: ReplyMode) {
        *self.reply_mode.lock() = mode;
    }

    pub fn set_login_outcome(&self, outcome: LoginOutcome) {
        *self.login_outcome.lock() = outcome;
    }

    /// Keep subsequent logins parked in CONNECTING
    pub fn hold_login(&self) {
        self.login_gate.send_replace(true);
    }

    pub fn release_login(&self) {
        self.login_gate.send_replace(false);
    }

    /// Complete a request left pending in [`ReplyMode::Manual`]
    pub fn respond(&self, id: &str, reply: XmppResult<Stanza>) -> bool {
        match self.pending.lock().remove(id) {
            Some(tx) => tx.send(reply).is_ok(),
            None => false,
        }
    }

    pub fn pending_requests(&self) -> usize {
        self.pending.lock().len()
    }

    /// Simulate the transport going away
    pub fn drop_connection(&self) {
        if self.machine.current().has_connection() {
            let _ = self.machine.transition(SessionState::Disconnected);
            *self.negotiated.lock() = None;
        }
    }

    pub fn login_calls(&self) -> usize {
        self.login_calls.load(Ordering::SeqCst)
    }

    /// Number of `login` calls that arrived while already logging in
    pub fn logins_while_busy(&self) -> usize {
        self.logins_while_busy.load(Ordering::SeqCst)
    }

    pub fn kill_calls(&self) -> usize {
        self.kill_calls.load(Ordering::SeqCst)
    }

    pub fn dispose_calls(&self) -> usize {
        self.dispose_calls.load(Ordering::SeqCst)
    }

    fn record(&self, stanza: &Stanza) {
        self.sent.lock().push(stanza.clone());
        let _ = self.outbound.send(stanza.clone());
    }

    async fn wait_for_gate(&self) -> XmppResult<()> {
        let mut gate = self.login_gate.subscribe();
        let mut states = self.machine.subscribe();
        loop {
            if !*gate.borrow_and_update() {
                break;
            }
            tokio::select! {
                changed = gate.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                state = states.recv() => {
                    match state {
                        Ok(SessionState::Disposed) | Err(broadcast::error::RecvError::Closed) => {
                            return Err(XmppError::SessionDisposed)
                        }
                        Ok(SessionState::Disconnected) => {
                            return Err(XmppError::login_failed("connection killed during login"))
                        }
                        _ => {}
                    }
                }
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Session for MemorySession {
    fn login_jid(&self) -> &Jid {
        &self.login_jid
    }

    fn negotiated_jid(&self) -> Option<Jid> {
        self.negotiated.lock().clone()
    }

    fn state(&self) -> SessionState {
        self.machine.current()
    }

    fn subscribe_state(&self) -> broadcast::Receiver<SessionState> {
        self.machine.subscribe()
    }

    fn inbound_stanzas(&self) -> broadcast::Receiver<Stanza> {
        self.inbound.subscribe()
    }

    async fn login(&self, _credential: &Credential) -> XmppResult<()> {
        self.login_calls.fetch_add(1, Ordering::SeqCst);
        let state = self.machine.current();
        if state.is_logging_in() {
            self.logins_while_busy.fetch_add(1, Ordering::SeqCst);
            return Err(XmppError::login_failed("login already in progress"));
        }
        if state == SessionState::Online {
            return Ok(());
        }

        self.machine.transition(SessionState::Connecting)?;
        self.wait_for_gate().await?;
        self.machine.transition(SessionState::Handshaking)?;

        let outcome = self.login_outcome.lock().clone();
        match outcome {
            LoginOutcome::Succeed => {
                self.machine.transition(SessionState::Online)?;
                *self.negotiated.lock() = self.login_jid.with_resource("memory").ok();
                Ok(())
            }
            LoginOutcome::Fail(message) => {
                self.machine.transition(SessionState::Disconnected)?;
                Err(XmppError::login_failed(message))
            }
        }
    }

    async fn kill_connection(&self) -> XmppResult<()> {
        self.kill_calls.fetch_add(1, Ordering::SeqCst);
        self.machine.ensure_not_disposed()?;
        self.drop_connection();
        Ok(())
    }

    async fn dispose(&self) -> XmppResult<()> {
        self.dispose_calls.fetch_add(1, Ordering::SeqCst);
        self.machine.transition(SessionState::Disposed)?;
        for (_, tx) in self.pending.lock().drain() {
            let _ = tx.send(Err(XmppError::SessionDisposed));
        }
        Ok(())
    }

    async fn send_iq(&self, iq: Stanza) -> XmppResult<Stanza> {
        self.machine.ensure_not_disposed()?;
        let state = self.machine.current();
        if state != SessionState::Online {
            return Err(XmppError::NotConnected { state });
        }
        let id = iq
            .id()
            .ok_or_else(|| XmppError::invalid_stanza("request without id"))?
            .to_string();
        self.record(&iq);

        let mode = self.reply_mode.lock().clone();
        match mode {
            ReplyMode::AutoResult => iq.result_reply(),
            ReplyMode::AutoError(error) => Err(XmppError::Stanza(error)),
            ReplyMode::Manual => {
                let (tx, rx) = oneshot::channel();
                self.pending.lock().insert(id, tx);
                // Re-check: dispose may have drained the map before the insert
                if self.machine.current().is_terminal() {
                    return Err(XmppError::SessionDisposed);
                }
                rx.await.unwrap_or(Err(XmppError::SessionDisposed))
            }
        }
    }

    async fn send(&self, stanza: Stanza) -> XmppResult<()> {
        self.machine.ensure_not_disposed()?;
        self.record(&stanza);
        Ok(())
    }
}
