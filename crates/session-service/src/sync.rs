//! Account sync coordinator
//!
//! Reconciles the registry against the account store and the network signal.
//! A pass computes three deltas:
//!
//! - `to_remove`: registered identities no longer enabled, disposed in the
//!   background;
//! - `to_login`: enabled identities with no entry (and no login being set
//!   up), logged in with `replace_existing = false`;
//! - `to_reconnect`: enabled entries that are DISCONNECTED with no login
//!   attempt in flight, resumed on the same session.
//!
//! Logins and resumes are reserved inside the pass and completed on
//! background tasks, so a pass never waits on a handshake and an immediate
//! second pass finds nothing left to do. Passes are single-flight: a trigger
//! during a pass schedules exactly one follow-up pass.

use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{debug, info, info_span, Instrument};
use viska_xmpp_core::{Jid, SessionState};

use crate::account::{AccountChange, AccountStore};
use crate::error::ServiceError;
use crate::presence::ErrorSink;
use crate::registry::{ReconnectStep, SessionRegistry};

#[derive(Debug, Default)]
struct SyncState {
    in_progress: bool,
    pending: bool,
    network_available: bool,
}

/// What one `sync` call did, across its coalesced passes
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncReport {
    pub passes: usize,
    pub removed: Vec<Jid>,
    pub logins: Vec<Jid>,
    pub reconnects: Vec<Jid>,
}

impl SyncReport {
    /// Whether no pass changed anything
    pub fn is_noop(&self) -> bool {
        self.removed.is_empty() && self.logins.is_empty() && self.reconnects.is_empty()
    }
}

/// Resets the in-progress flag even if the sync future is dropped
struct PassGuard<'a> {
    state: &'a Mutex<SyncState>,
}

impl Drop for PassGuard<'_> {
    fn drop(&mut self) {
        self.state.lock().in_progress = false;
    }
}

/// Keeps the registry in line with the account store and the network
pub struct AccountSync {
    registry: Arc<SessionRegistry>,
    accounts: Arc<dyn AccountStore>,
    errors: Arc<dyn ErrorSink>,
    state: Mutex<SyncState>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl AccountSync {
    pub fn new(registry: Arc<SessionRegistry>, accounts: Arc<dyn AccountStore>, errors: Arc<dyn ErrorSink>) -> Self {
        Self {
            registry,
            accounts,
            errors,
            state: Mutex::new(SyncState::default()),
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    pub fn is_network_available(&self) -> bool {
        self.state.lock().network_available
    }

    pub fn set_network_available(&self, available: bool) {
        self.state.lock().network_available = available;
    }

    pub fn is_syncing(&self) -> bool {
        self.state.lock().in_progress
    }

    /// Run passes until no trigger is pending.
    ///
    /// Returns `None` when another sync is already running; that sync then
    /// runs one more pass on our behalf.
    pub async fn sync(&self) -> Option<SyncReport> {
        {
            let mut state = self.state.lock();
            if state.in_progress {
                state.pending = true;
                debug!("sync already running, coalescing");
                return None;
            }
            state.in_progress = true;
            state.pending = false;
        }
        let _guard = PassGuard { state: &self.state };

        let mut report = SyncReport::default();
        loop {
            self.run_pass(&mut report).await;
            let mut state = self.state.lock();
            if state.pending {
                state.pending = false;
                continue;
            }
            break;
        }
        info!(
            passes = report.passes,
            removed = report.removed.len(),
            logins = report.logins.len(),
            reconnects = report.reconnects.len(),
            "sync finished"
        );
        Some(report)
    }

    /// Run [`sync`](Self::sync) on a background task
    pub fn spawn_sync(self: &Arc<Self>) -> JoinHandle<Option<SyncReport>> {
        let this = self.clone();
        tokio::spawn(async move { this.sync().await }.instrument(info_span!("sync")))
    }

    /// Account store changed; sync if the network is up
    pub fn on_account_change(self: &Arc<Self>, change: &AccountChange) -> Option<JoinHandle<Option<SyncReport>>> {
        debug!(identity = %change.identity(), ?change, "account changed");
        if self.is_network_available() {
            Some(self.spawn_sync())
        } else {
            None
        }
    }

    /// Connectivity came back; always syncs
    pub fn on_network_available(self: &Arc<Self>) -> JoinHandle<Option<SyncReport>> {
        info!("network available");
        self.set_network_available(true);
        self.spawn_sync()
    }

    /// Connectivity lost: drop every transport, keep every session
    pub async fn on_network_lost(&self) -> usize {
        info!("network lost");
        self.set_network_available(false);
        self.registry.kill_all_connections().await
    }

    /// Wait for the login and resume tasks started by earlier passes
    pub async fn settle(&self) {
        loop {
            let tasks: Vec<JoinHandle<()>> = std::mem::take(&mut *self.tasks.lock());
            if tasks.is_empty() {
                break;
            }
            for task in tasks {
                let _ = task.await;
            }
        }
    }

    /// Abort outstanding login and resume tasks
    pub fn abort_tasks(&self) {
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
    }

    async fn run_pass(&self, report: &mut SyncReport) {
        report.passes += 1;
        let enabled = match self.accounts.enabled_identities().await {
            Ok(enabled) => enabled,
            Err(e) => {
                self.errors.report(None, &e);
                return;
            }
        };

        let registered = self.registry.identities();
        let network_available = self.is_network_available();

        let to_remove: Vec<Jid> = registered.difference(&enabled).cloned().collect();
        for identity in to_remove {
            if self.registry.remove(&identity) {
                report.removed.push(identity);
            }
        }

        if !network_available {
            debug!("network unavailable, skipping logins");
            return;
        }

        let to_login: Vec<Jid> = enabled.difference(&registered).cloned().collect();
        for identity in to_login {
            self.start_login(identity, report);
        }

        let to_reconnect: Vec<Jid> = self
            .registry
            .session_states()
            .into_iter()
            .filter(|(identity, state)| *state == SessionState::Disconnected && enabled.contains(identity))
            .map(|(identity, _)| identity)
            .filter(|identity| !self.registry.is_attempt_in_flight(identity))
            .collect();
        for identity in to_reconnect {
            self.start_reconnect(identity, report);
        }
    }

    fn start_login(&self, identity: Jid, report: &mut SyncReport) {
        let pending = match self.registry.begin_login(&identity, false) {
            Ok(pending) => pending,
            Err(e) if e.is_duplicate() => {
                debug!(%identity, "login raced another, skipping");
                return;
            }
            Err(e) => {
                self.errors.report(Some(&identity), &e);
                return;
            }
        };
        report.logins.push(identity.clone());

        let accounts = self.accounts.clone();
        let errors = self.errors.clone();
        let span = info_span!("sync_login", %identity);
        self.track(tokio::spawn(
            async move {
                let result = match accounts.credential(&identity).await {
                    Ok(credential) => pending.run(&credential).await.map(|_| ()),
                    Err(e) => Err(e),
                };
                report_failure(errors.as_ref(), &identity, result);
            }
            .instrument(span),
        ));
    }

    fn start_reconnect(&self, identity: Jid, report: &mut SyncReport) {
        let pending = match self.registry.begin_reconnect(&identity) {
            Ok(ReconnectStep::Claimed(pending)) => pending,
            Ok(_) => return,
            Err(e) => {
                debug!(%identity, error = %e, "cannot resume");
                return;
            }
        };
        report.reconnects.push(identity.clone());

        let accounts = self.accounts.clone();
        let errors = self.errors.clone();
        let span = info_span!("sync_reconnect", %identity);
        self.track(tokio::spawn(
            async move {
                let result = match accounts.credential(&identity).await {
                    Ok(credential) => pending.run(&credential).await,
                    Err(e) => Err(e),
                };
                report_failure(errors.as_ref(), &identity, result);
            }
            .instrument(span),
        ));
    }

    fn track(&self, task: JoinHandle<()>) {
        let mut tasks = self.tasks.lock();
        tasks.retain(|task| !task.is_finished());
        tasks.push(task);
    }
}

fn report_failure(errors: &dyn ErrorSink, identity: &Jid, result: Result<(), ServiceError>) {
    match result {
        Ok(()) => {}
        // Disposed mid-login: the account was removed or replaced
        Err(e) if e.is_disposed() || e.is_duplicate() => debug!(%identity, error = %e, "login superseded"),
        Err(e) => errors.report(Some(identity), &e),
    }
}

impl std::fmt::Debug for AccountSync {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccountSync")
            .field("state", &*self.state.lock())
            .field("tasks", &self.tasks.lock().len())
            .finish()
    }
}
