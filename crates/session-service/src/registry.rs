//! Session registry
//!
//! Owns the mapping identity → session and enforces that at most one session
//! exists per identity. Snapshot reads (`get`, `session_states`) go straight
//! to the concurrent map; every compound change (check-then-insert,
//! remove-then-replace) runs under the registry's gate lock, and logins hold a
//! reservation from the duplicate check until their entry is inserted.
//!
//! Removing an identity whose login is still reserved cancels the
//! reservation, and a replacing login supersedes one. A cancelled login
//! disposes whatever it built and fails with `SessionDisposed`.
//!
//! Each entry carries a login-attempt flag. A login or resume claims it before
//! calling [`Session::login`](viska_xmpp_core::Session::login), so a session
//! never sees a second login while one is in flight; later callers wait for the
//! running attempt instead.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Weak};
use std::time::Duration;

use dashmap::DashMap;
use futures::future::join_all;
use parking_lot::Mutex;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, info_span, warn, Instrument};
use viska_xmpp_core::{wait_until_online, Credential, Jid, PluginManager, SessionRef, SessionState, XmppResult};

use crate::connector::{select_secure, SessionConnector};
use crate::error::{ServiceError, ServiceResult};
use crate::extension::SessionExtension;
use crate::presence::{PresenceReporter, PresenceTracker};

/// Progress of the most recent login attempt of an entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoginAttempt {
    /// No attempt has run, or the last one was abandoned
    Idle,
    InFlight,
    Succeeded,
    Failed(String),
}

#[derive(Clone)]
struct Entry {
    session: SessionRef,
    plugins: Arc<PluginManager>,
    attempt: Arc<watch::Sender<LoginAttempt>>,
}

fn same_session(a: &SessionRef, b: &SessionRef) -> bool {
    std::ptr::eq(Arc::as_ptr(a) as *const (), Arc::as_ptr(b) as *const ())
}

/// Fire-and-forget disposal; failures are logged and swallowed
fn spawn_dispose(session: SessionRef) -> JoinHandle<()> {
    tokio::spawn(async move {
        if let Err(e) = session.dispose().await {
            debug!(identity = %session.login_jid(), error = %e, "dispose failed");
        }
    })
}

/// Logins between reservation and insertion, keyed by identity
#[derive(Debug, Default)]
struct Reservations {
    next: u64,
    held: HashMap<Jid, u64>,
}

impl Reservations {
    fn reserve(&mut self, identity: &Jid) -> u64 {
        self.next += 1;
        self.held.insert(identity.clone(), self.next);
        self.next
    }

    fn holds(&self, identity: &Jid, ticket: u64) -> bool {
        self.held.get(identity) == Some(&ticket)
    }

    fn release(&mut self, identity: &Jid, ticket: u64) -> bool {
        if self.holds(identity, ticket) {
            self.held.remove(identity);
            true
        } else {
            false
        }
    }
}

/// Identity → session map with at-most-one-session semantics
pub struct SessionRegistry {
    connector: Arc<dyn SessionConnector>,
    extensions: Vec<Arc<dyn SessionExtension>>,
    presence: PresenceTracker,
    dispose_timeout: Duration,
    entries: DashMap<Jid, Entry>,
    /// Gate for compound changes; holds identities with a login between
    /// reservation and insertion
    pending: Mutex<Reservations>,
}

impl SessionRegistry {
    pub fn new(connector: Arc<dyn SessionConnector>, presence: Arc<dyn PresenceReporter>) -> Self {
        Self {
            connector,
            extensions: Vec::new(),
            presence: PresenceTracker::new(presence),
            dispose_timeout: Duration::from_secs(5),
            entries: DashMap::new(),
            pending: Mutex::new(Reservations::default()),
        }
    }

    /// Install `extension` into every session constructed from now on
    pub fn with_extension(mut self, extension: Arc<dyn SessionExtension>) -> Self {
        self.extensions.push(extension);
        self
    }

    /// How long a replacing login waits for the old session to dispose
    pub fn with_dispose_timeout(mut self, timeout: Duration) -> Self {
        self.dispose_timeout = timeout;
        self
    }

    /// Construct a session for `identity` and log it in.
    ///
    /// Fails with `DuplicateIdentity` if an entry (or another login) exists
    /// for the identity and `replace_existing` is false. With
    /// `replace_existing`, a login still being set up is superseded, the
    /// current session is removed and disposed, and the new one is only
    /// registered once that disposal has finished.
    ///
    /// Resolution and transport selection happen before the registry is
    /// touched: `NoSecureTransport` leaves any existing entry in place.
    /// A failed login keeps the new entry (DISCONNECTED) for later resume.
    pub async fn login(
        self: &Arc<Self>,
        identity: &Jid,
        credential: &Credential,
        replace_existing: bool,
    ) -> ServiceResult<SessionRef> {
        self.begin_login(identity, replace_existing)?.run(credential).await
    }

    /// Reserve a login slot for `identity` without suspending.
    ///
    /// Once this returns, the identity counts as registered for
    /// [`identities`](Self::identities) and competing logins without
    /// `replace_existing` fail with `DuplicateIdentity` until the returned
    /// handle is run or dropped. A replacing login takes over the
    /// reservation; the login it displaced fails with `SessionDisposed`.
    pub fn begin_login(self: &Arc<Self>, identity: &Jid, replace_existing: bool) -> ServiceResult<PendingLogin> {
        let mut pending = self.pending.lock();
        if !replace_existing && (pending.held.contains_key(identity) || self.entries.contains_key(identity)) {
            return Err(ServiceError::duplicate(identity));
        }
        if replace_existing && pending.held.contains_key(identity) {
            info!(%identity, "superseding pending login");
        }
        let ticket = pending.reserve(identity);
        Ok(PendingLogin {
            registry: self.clone(),
            identity: identity.clone(),
            ticket,
            replace_existing,
            committed: false,
            attempt: None,
            done: false,
        })
    }

    /// Bring an existing entry back ONLINE.
    ///
    /// ONLINE returns at once; CONNECTING/HANDSHAKING (or a login attempt in
    /// flight) waits for that attempt; DISCONNECTED force-closes any
    /// leftover transport and logs in again on the same session.
    pub async fn reconnect(self: &Arc<Self>, identity: &Jid, credential: &Credential) -> ServiceResult<()> {
        match self.begin_reconnect(identity)? {
            ReconnectStep::Online => Ok(()),
            ReconnectStep::Wait(waiter) => waiter.wait().await,
            ReconnectStep::Claimed(pending) => pending.run(credential).await,
        }
    }

    /// Decide, without suspending, how to bring `identity` back ONLINE.
    ///
    /// A `Claimed` result owns the entry's login attempt.
    pub fn begin_reconnect(self: &Arc<Self>, identity: &Jid) -> ServiceResult<ReconnectStep> {
        let entry = self
            .entries
            .get(identity)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| ServiceError::unknown(identity))?;

        if *entry.attempt.borrow() == LoginAttempt::InFlight {
            return Ok(ReconnectStep::Wait(Waiter::Attempt {
                identity: identity.clone(),
                attempt: entry.attempt.subscribe(),
            }));
        }

        match entry.session.state() {
            SessionState::Online => Ok(ReconnectStep::Online),
            SessionState::Disposed => Err(ServiceError::SessionDisposed),
            SessionState::Connecting | SessionState::Handshaking => Ok(ReconnectStep::Wait(Waiter::Session {
                identity: identity.clone(),
                session: entry.session.clone(),
            })),
            SessionState::Disconnected => {
                let claimed = entry.attempt.send_if_modified(|attempt| {
                    if *attempt == LoginAttempt::InFlight {
                        false
                    } else {
                        *attempt = LoginAttempt::InFlight;
                        true
                    }
                });
                if claimed {
                    Ok(ReconnectStep::Claimed(PendingReconnect {
                        registry: self.clone(),
                        identity: identity.clone(),
                        session: entry.session,
                        attempt: entry.attempt,
                        done: false,
                    }))
                } else {
                    Ok(ReconnectStep::Wait(Waiter::Attempt {
                        identity: identity.clone(),
                        attempt: entry.attempt.subscribe(),
                    }))
                }
            }
        }
    }

    /// Snapshot read; never blocks on logins
    pub fn get(&self, identity: &Jid) -> Option<SessionRef> {
        self.entries.get(identity).map(|entry| entry.session.clone())
    }

    /// Plugin manager of the registered session
    pub fn plugins(&self, identity: &Jid) -> Option<Arc<PluginManager>> {
        self.entries.get(identity).map(|entry| entry.plugins.clone())
    }

    /// Whether `identity` has an entry; reserved logins do not count
    pub fn contains(&self, identity: &Jid) -> bool {
        self.entries.contains_key(identity)
    }

    /// Registered identities plus those with a login being set up
    pub fn identities(&self) -> HashSet<Jid> {
        let pending = self.pending.lock();
        let mut identities: HashSet<Jid> = self.entries.iter().map(|entry| entry.key().clone()).collect();
        identities.extend(pending.held.keys().cloned());
        identities
    }

    /// Snapshot of every entry's session state
    pub fn session_states(&self) -> Vec<(Jid, SessionState)> {
        self.entries
            .iter()
            .map(|entry| (entry.key().clone(), entry.session.state()))
            .collect()
    }

    /// Progress of the entry's most recent login attempt
    pub fn attempt(&self, identity: &Jid) -> Option<LoginAttempt> {
        self.entries.get(identity).map(|entry| entry.attempt.borrow().clone())
    }

    /// Whether a login or resume currently owns the entry
    pub fn is_attempt_in_flight(&self, identity: &Jid) -> bool {
        self.attempt(identity) == Some(LoginAttempt::InFlight)
    }

    /// Number of entries whose session is ONLINE
    pub fn online_count(&self) -> usize {
        self.entries
            .iter()
            .filter(|entry| entry.session.state() == SessionState::Online)
            .count()
    }

    /// Number of entries, not counting reserved logins
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the registry has no entries
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Remove the entry and dispose its session without waiting.
    ///
    /// A login still reserved for `identity` is cancelled as well. Returns
    /// whether there was anything to remove.
    pub fn remove(&self, identity: &Jid) -> bool {
        let (removed, cancelled) = {
            let mut pending = self.pending.lock();
            (self.entries.remove(identity), pending.held.remove(identity).is_some())
        };
        if cancelled {
            info!(%identity, "cancelling pending login");
        }
        match removed {
            Some((_, entry)) => {
                info!(%identity, "removing session");
                spawn_dispose(entry.session);
                self.refresh_presence();
                true
            }
            None => cancelled,
        }
    }

    /// Force-close the transport of every connected or connecting session.
    ///
    /// Sessions end DISCONNECTED and stay registered. Returns how many were
    /// closed.
    pub async fn kill_all_connections(&self) -> usize {
        let sessions: Vec<SessionRef> = self
            .entries
            .iter()
            .map(|entry| entry.session.clone())
            .filter(|session| session.state().has_connection())
            .collect();
        let count = sessions.len();
        join_all(sessions.into_iter().map(|session| async move {
            if let Err(e) = session.kill_connection().await {
                debug!(identity = %session.login_jid(), error = %e, "kill_connection failed");
            }
        }))
        .await;
        if count > 0 {
            info!(count, "closed all connections");
        }
        count
    }

    /// Remove every entry, cancel every reserved login and fire disposal on
    /// each session; does not wait
    pub fn dispose_all(&self) -> usize {
        let drained: Vec<Entry> = {
            let mut pending = self.pending.lock();
            pending.held.clear();
            let identities: Vec<Jid> = self.entries.iter().map(|entry| entry.key().clone()).collect();
            identities
                .iter()
                .filter_map(|identity| self.entries.remove(identity).map(|(_, entry)| entry))
                .collect()
        };
        let count = drained.len();
        for entry in drained {
            spawn_dispose(entry.session);
        }
        info!(count, "disposing all sessions");
        self.refresh_presence();
        count
    }

    fn remove_if_current(&self, identity: &Jid, session: &SessionRef) -> bool {
        let _gate = self.pending.lock();
        self.entries
            .remove_if(identity, |_, entry| same_session(&entry.session, session))
            .is_some()
    }

    fn refresh_presence(&self) {
        let online = self.online_count();
        let registered = self.entries.len();
        self.presence.refresh(online, registered);
    }

    /// Record the outcome of a login that owned `attempt`
    async fn finish_attempt(
        &self,
        identity: &Jid,
        session: &SessionRef,
        attempt: &watch::Sender<LoginAttempt>,
        result: XmppResult<()>,
    ) -> ServiceResult<()> {
        match result {
            Ok(()) => {
                info!(%identity, "logged in");
                attempt.send_replace(LoginAttempt::Succeeded);
                self.refresh_presence();
                Ok(())
            }
            Err(e) => {
                let error = ServiceError::from_login(identity, e);
                warn!(%identity, error = %error, "login failed");
                if !error.is_disposed() {
                    // Cancel whatever the failed attempt left half-open
                    if let Err(e) = session.kill_connection().await {
                        debug!(%identity, error = %e, "kill_connection after failed login");
                    }
                }
                attempt.send_replace(LoginAttempt::Failed(error.to_string()));
                Err(error)
            }
        }
    }
}

impl std::fmt::Debug for SessionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionRegistry")
            .field("sessions", &self.session_states())
            .field("pending", &*self.pending.lock())
            .field("extensions", &self.extensions.iter().map(|e| e.name()).collect::<Vec<_>>())
            .finish()
    }
}

/// A reserved login, see [`SessionRegistry::begin_login`]
#[derive(Debug)]
pub struct PendingLogin {
    registry: Arc<SessionRegistry>,
    identity: Jid,
    ticket: u64,
    replace_existing: bool,
    committed: bool,
    attempt: Option<Arc<watch::Sender<LoginAttempt>>>,
    done: bool,
}

impl PendingLogin {
    pub fn identity(&self) -> &Jid {
        &self.identity
    }

    pub async fn run(mut self, credential: &Credential) -> ServiceResult<SessionRef> {
        let span = info_span!("login", identity = %self.identity);
        self.connect(credential).instrument(span).await
    }

    async fn connect(&mut self, credential: &Credential) -> ServiceResult<SessionRef> {
        let registry = self.registry.clone();
        let identity = self.identity.clone();

        let domain = identity.domain_part().to_string();
        let methods = registry.connector.resolve(&domain).await?;
        let method = select_secure(&methods)
            .cloned()
            .ok_or_else(|| ServiceError::NoSecureTransport { domain: domain.clone() })?;
        debug!(protocol = %method.protocol, host = %method.host, port = method.port, "selected connection method");

        let displaced = {
            let pending = registry.pending.lock();
            if !pending.holds(&identity, self.ticket) {
                debug!("login cancelled during resolution");
                return Err(ServiceError::SessionDisposed);
            }
            if self.replace_existing {
                registry.entries.remove(&identity).map(|(_, entry)| entry)
            } else {
                None
            }
        };
        if let Some(old) = displaced {
            info!("replacing existing session");
            let disposal = spawn_dispose(old.session);
            registry.refresh_presence();
            if tokio::time::timeout(registry.dispose_timeout, disposal).await.is_err() {
                return Err(ServiceError::login_failed(
                    &identity,
                    "previous session did not dispose in time",
                ));
            }
        }

        let session = registry.connector.construct(&identity, &method)?;
        let plugins = Arc::new(PluginManager::new(session.clone()));
        for extension in &registry.extensions {
            extension.install(&plugins);
        }
        let states = session.subscribe_state();
        let (attempt, _) = watch::channel(LoginAttempt::InFlight);
        let attempt = Arc::new(attempt);

        let registered = {
            let mut pending = registry.pending.lock();
            if pending.release(&identity, self.ticket) {
                registry.entries.insert(
                    identity.clone(),
                    Entry {
                        session: session.clone(),
                        plugins,
                        attempt: attempt.clone(),
                    },
                );
                self.committed = true;
                self.attempt = Some(attempt.clone());
                true
            } else {
                false
            }
        };
        if !registered {
            debug!("login cancelled, discarding constructed session");
            spawn_dispose(session);
            return Err(ServiceError::SessionDisposed);
        }
        tokio::spawn(
            watch_session(Arc::downgrade(&registry), identity.clone(), session.clone(), states)
                .instrument(info_span!("session", %identity)),
        );
        registry.refresh_presence();

        let result = session.login(credential).await;
        let outcome = registry.finish_attempt(&identity, &session, &attempt, result).await;
        self.done = true;
        outcome.map(|()| session)
    }
}

impl Drop for PendingLogin {
    fn drop(&mut self) {
        if !self.committed {
            self.registry.pending.lock().release(&self.identity, self.ticket);
        } else if !self.done {
            if let Some(attempt) = &self.attempt {
                release_abandoned(attempt);
            }
        }
    }
}

/// What [`SessionRegistry::begin_reconnect`] decided
pub enum ReconnectStep {
    Online,
    Wait(Waiter),
    Claimed(PendingReconnect),
}

/// Waits for a login someone else is running
pub enum Waiter {
    Attempt {
        identity: Jid,
        attempt: watch::Receiver<LoginAttempt>,
    },
    Session {
        identity: Jid,
        session: SessionRef,
    },
}

impl Waiter {
    pub async fn wait(self) -> ServiceResult<()> {
        match self {
            Waiter::Attempt { identity, mut attempt } => {
                let outcome = attempt
                    .wait_for(|attempt| *attempt != LoginAttempt::InFlight)
                    .await
                    .map(|outcome| LoginAttempt::clone(&outcome));
                match outcome {
                    Ok(LoginAttempt::Succeeded) => Ok(()),
                    Ok(LoginAttempt::Failed(reason)) => Err(ServiceError::login_failed(&identity, reason)),
                    Ok(_) => Err(ServiceError::login_failed(&identity, "login attempt abandoned")),
                    Err(_) => Err(ServiceError::SessionDisposed),
                }
            }
            Waiter::Session { identity, session } => wait_until_online(session.as_ref())
                .await
                .map_err(|e| ServiceError::from_login(&identity, e)),
        }
    }
}

/// A claimed resume of a DISCONNECTED entry
pub struct PendingReconnect {
    registry: Arc<SessionRegistry>,
    identity: Jid,
    session: SessionRef,
    attempt: Arc<watch::Sender<LoginAttempt>>,
    done: bool,
}

impl PendingReconnect {
    pub fn identity(&self) -> &Jid {
        &self.identity
    }

    pub async fn run(mut self, credential: &Credential) -> ServiceResult<()> {
        let span = info_span!("reconnect", identity = %self.identity);
        self.resume(credential).instrument(span).await
    }

    async fn resume(&mut self, credential: &Credential) -> ServiceResult<()> {
        debug!("resuming session");
        if let Err(e) = self.session.kill_connection().await {
            debug!(error = %e, "kill_connection before resume");
        }
        let result = self.session.login(credential).await;
        let outcome = self
            .registry
            .finish_attempt(&self.identity, &self.session, &self.attempt, result)
            .await;
        self.done = true;
        outcome
    }
}

impl Drop for PendingReconnect {
    fn drop(&mut self) {
        if !self.done {
            release_abandoned(&self.attempt);
        }
    }
}

fn release_abandoned(attempt: &watch::Sender<LoginAttempt>) {
    attempt.send_if_modified(|state| {
        if *state == LoginAttempt::InFlight {
            *state = LoginAttempt::Idle;
            true
        } else {
            false
        }
    });
}

/// Follows one session's state: DISPOSED removes its entry, every change
/// refreshes presence
async fn watch_session(
    registry: Weak<SessionRegistry>,
    identity: Jid,
    session: SessionRef,
    mut states: broadcast::Receiver<SessionState>,
) {
    loop {
        let state = match states.recv().await {
            Ok(state) => state,
            Err(RecvError::Lagged(_)) => session.state(),
            Err(RecvError::Closed) => SessionState::Disposed,
        };
        let Some(registry) = registry.upgrade() else {
            break;
        };
        debug!(%state, "session state changed");
        if state == SessionState::Disposed {
            if registry.remove_if_current(&identity, &session) {
                info!("disposed session removed");
            }
            registry.refresh_presence();
            break;
        }
        registry.refresh_presence();
    }
}
