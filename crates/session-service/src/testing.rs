//! In-memory collaborators for tests and demos
//!
//! Everything here runs without a network: [`MemoryConnector`] hands out
//! [`MemorySession`]s, [`MemoryAccountStore`] and [`ManualNetwork`] are
//! driven by the test, and the recording types capture what the service
//! reported.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{broadcast, watch, Notify};
use viska_xmpp_core::testing::{LoginOutcome, MemorySession};
use viska_xmpp_core::{Credential, Jid, Session, SessionRef};

use crate::account::{AccountChange, AccountStore, NetworkEvent, NetworkMonitor};
use crate::connector::{ConnectionMethod, ConnectionProtocol, SessionConnector};
use crate::error::{ServiceError, ServiceResult};
use crate::extension::{IncomingCall, IncomingCallHandler};
use crate::presence::{ErrorSink, PresenceReporter};

/// Connector producing [`MemorySession`]s
///
/// Every domain advertises a single TLS TCP method unless configured
/// otherwise; only TCP methods can be constructed.
#[derive(Debug, Default)]
pub struct MemoryConnector {
    methods: Mutex<HashMap<String, Vec<ConnectionMethod>>>,
    unresolvable: Mutex<HashSet<String>>,
    sessions: Mutex<Vec<Arc<MemorySession>>>,
    hold_logins: AtomicBool,
    hold_resolution: AtomicBool,
    resolution_released: Notify,
    login_outcome: Mutex<Option<LoginOutcome>>,
    resolve_calls: AtomicUsize,
}

impl MemoryConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_methods(&self, domain: &str, methods: Vec<ConnectionMethod>) {
        self.methods.lock().insert(domain.to_string(), methods);
    }

    pub fn fail_resolution(&self, domain: &str) {
        self.unresolvable.lock().insert(domain.to_string());
    }

    /// Park logins of sessions constructed from now on in CONNECTING
    pub fn hold_logins(&self, hold: bool) {
        self.hold_logins.store(hold, Ordering::SeqCst);
    }

    /// Park every `resolve` call until released
    pub fn hold_resolution(&self, hold: bool) {
        self.hold_resolution.store(hold, Ordering::SeqCst);
        if !hold {
            self.resolution_released.notify_waiters();
        }
    }

    /// Outcome of logins of sessions constructed from now on
    pub fn set_login_outcome(&self, outcome: LoginOutcome) {
        *self.login_outcome.lock() = Some(outcome);
    }

    /// Every session constructed so far, in order
    pub fn sessions(&self) -> Vec<Arc<MemorySession>> {
        self.sessions.lock().clone()
    }

    pub fn sessions_for(&self, identity: &Jid) -> Vec<Arc<MemorySession>> {
        self.sessions
            .lock()
            .iter()
            .filter(|session| session.login_jid() == identity)
            .cloned()
            .collect()
    }

    pub fn last_session(&self, identity: &Jid) -> Option<Arc<MemorySession>> {
        self.sessions_for(identity).pop()
    }

    pub fn constructed(&self) -> usize {
        self.sessions.lock().len()
    }

    pub fn resolve_calls(&self) -> usize {
        self.resolve_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SessionConnector for MemoryConnector {
    async fn resolve(&self, domain: &str) -> ServiceResult<Vec<ConnectionMethod>> {
        self.resolve_calls.fetch_add(1, Ordering::SeqCst);
        loop {
            let released = self.resolution_released.notified();
            tokio::pin!(released);
            released.as_mut().enable();
            if !self.hold_resolution.load(Ordering::SeqCst) {
                break;
            }
            released.await;
        }
        if self.unresolvable.lock().contains(domain) {
            return Err(ServiceError::address_resolution(domain, "no such domain"));
        }
        let methods = self.methods.lock().get(domain).cloned();
        Ok(methods.unwrap_or_else(|| {
            vec![ConnectionMethod::new(
                ConnectionProtocol::Tcp,
                format!("xmpp.{}", domain),
                5223,
                true,
            )]
        }))
    }

    fn construct(&self, identity: &Jid, method: &ConnectionMethod) -> ServiceResult<SessionRef> {
        if method.protocol != ConnectionProtocol::Tcp {
            return Err(ServiceError::UnsupportedProtocolVariant {
                protocol: method.protocol.to_string(),
            });
        }
        let session = MemorySession::new(identity.clone());
        if self.hold_logins.load(Ordering::SeqCst) {
            session.hold_login();
        }
        if let Some(outcome) = self.login_outcome.lock().clone() {
            session.set_login_outcome(outcome);
        }
        self.sessions.lock().push(session.clone());
        let session: SessionRef = session;
        Ok(session)
    }
}

/// Account store backed by a map
#[derive(Debug)]
pub struct MemoryAccountStore {
    accounts: Mutex<HashMap<Jid, (Credential, bool)>>,
    broken_credentials: Mutex<HashSet<Jid>>,
    changes: broadcast::Sender<AccountChange>,
    listing_gate: watch::Sender<bool>,
    list_calls: AtomicUsize,
}

impl Default for MemoryAccountStore {
    fn default() -> Self {
        let (changes, _) = broadcast::channel(64);
        let (listing_gate, _) = watch::channel(false);
        Self {
            accounts: Mutex::new(HashMap::new()),
            broken_credentials: Mutex::new(HashSet::new()),
            changes,
            listing_gate,
            list_calls: AtomicUsize::new(0),
        }
    }
}

impl MemoryAccountStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an enabled account
    pub fn add(&self, identity: Jid, secret: &str) {
        self.accounts
            .lock()
            .insert(identity.clone(), (Credential::new(secret), true));
        let _ = self.changes.send(AccountChange::Added(identity));
    }

    pub fn remove(&self, identity: &Jid) {
        if self.accounts.lock().remove(identity).is_some() {
            let _ = self.changes.send(AccountChange::Removed(identity.clone()));
        }
    }

    pub fn set_enabled(&self, identity: &Jid, enabled: bool) {
        if let Some(account) = self.accounts.lock().get_mut(identity) {
            account.1 = enabled;
        }
        let _ = self.changes.send(AccountChange::Updated(identity.clone()));
    }

    /// Make `credential` fail for this identity
    pub fn break_credential(&self, identity: &Jid) {
        self.broken_credentials.lock().insert(identity.clone());
    }

    /// Block `enabled_identities` until [`resume_listing`](Self::resume_listing)
    pub fn pause_listing(&self) {
        self.listing_gate.send_replace(true);
    }

    pub fn resume_listing(&self) {
        self.listing_gate.send_replace(false);
    }

    pub fn list_calls(&self) -> usize {
        self.list_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl AccountStore for MemoryAccountStore {
    async fn enabled_identities(&self) -> ServiceResult<HashSet<Jid>> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        let mut gate = self.listing_gate.subscribe();
        let _ = gate.wait_for(|paused| !*paused).await;
        Ok(self
            .accounts
            .lock()
            .iter()
            .filter(|(_, (_, enabled))| *enabled)
            .map(|(identity, _)| identity.clone())
            .collect())
    }

    async fn credential(&self, identity: &Jid) -> ServiceResult<Credential> {
        if self.broken_credentials.lock().contains(identity) {
            return Err(ServiceError::Account(format!("keystore locked for {}", identity)));
        }
        self.accounts
            .lock()
            .get(identity)
            .map(|(credential, _)| credential.clone())
            .ok_or_else(|| ServiceError::Account(format!("no account for {}", identity)))
    }

    fn subscribe(&self) -> broadcast::Receiver<AccountChange> {
        self.changes.subscribe()
    }
}

/// Network signal flipped by the test
#[derive(Debug)]
pub struct ManualNetwork {
    available: AtomicBool,
    events: broadcast::Sender<NetworkEvent>,
}

impl ManualNetwork {
    pub fn new(available: bool) -> Self {
        let (events, _) = broadcast::channel(16);
        Self {
            available: AtomicBool::new(available),
            events,
        }
    }

    /// Emits an event only on an actual edge
    pub fn set_available(&self, available: bool) {
        if self.available.swap(available, Ordering::SeqCst) != available {
            let event = if available {
                NetworkEvent::Available
            } else {
                NetworkEvent::Lost
            };
            let _ = self.events.send(event);
        }
    }
}

impl NetworkMonitor for ManualNetwork {
    fn is_available(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }

    fn subscribe(&self) -> broadcast::Receiver<NetworkEvent> {
        self.events.subscribe()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresenceReport {
    Online(usize),
    Idle,
}

/// Records every presence report
#[derive(Debug, Default)]
pub struct RecordingPresence {
    reports: Mutex<Vec<PresenceReport>>,
}

impl RecordingPresence {
    pub fn reports(&self) -> Vec<PresenceReport> {
        self.reports.lock().clone()
    }

    pub fn last(&self) -> Option<PresenceReport> {
        self.reports.lock().last().copied()
    }
}

impl PresenceReporter for RecordingPresence {
    fn report_online(&self, count: usize) {
        self.reports.lock().push(PresenceReport::Online(count));
    }

    fn report_idle(&self) {
        self.reports.lock().push(PresenceReport::Idle);
    }
}

/// Records every reported failure
#[derive(Debug, Default)]
pub struct RecordingErrorSink {
    errors: Mutex<Vec<(Option<Jid>, ServiceError)>>,
}

impl RecordingErrorSink {
    pub fn errors(&self) -> Vec<(Option<Jid>, ServiceError)> {
        self.errors.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.errors.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.errors.lock().is_empty()
    }
}

impl ErrorSink for RecordingErrorSink {
    fn report(&self, identity: Option<&Jid>, error: &ServiceError) {
        self.errors.lock().push((identity.cloned(), error.clone()));
    }
}

/// Collects incoming call offers
#[derive(Debug, Default)]
pub struct RecordingCallHandler {
    calls: Mutex<Vec<IncomingCall>>,
    notify: Notify,
}

impl RecordingCallHandler {
    pub fn calls(&self) -> Vec<IncomingCall> {
        self.calls.lock().clone()
    }

    /// Wait until at least `count` offers arrived
    pub async fn wait_for(&self, count: usize) -> Vec<IncomingCall> {
        loop {
            let notified = self.notify.notified();
            {
                let calls = self.calls.lock();
                if calls.len() >= count {
                    return calls.clone();
                }
            }
            notified.await;
        }
    }
}

#[async_trait]
impl IncomingCallHandler for RecordingCallHandler {
    async fn on_incoming_call(&self, call: IncomingCall) {
        self.calls.lock().push(call);
        self.notify.notify_waiters();
    }
}
