//! The service context
//!
//! [`SessionService`] wires the registry, the sync coordinator and the
//! platform collaborators together. It is built explicitly with
//! [`SessionServiceBuilder`] and owned by the application; nothing here is
//! global.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, info_span, warn, Instrument};
use viska_webrtc_signaling::WebRtcPlugin;
use viska_xmpp_core::{Credential, Jid, SessionRef};

use crate::account::{AccountChange, AccountStore, NetworkEvent, NetworkMonitor};
use crate::config::ServiceConfig;
use crate::connector::SessionConnector;
use crate::error::{ServiceError, ServiceResult};
use crate::extension::{IncomingCallHandler, SessionExtension, WebRtcExtension};
use crate::presence::{ErrorSink, NoopPresence, PresenceReporter, TracingErrorSink};
use crate::registry::SessionRegistry;
use crate::sync::AccountSync;

/// Builder for [`SessionService`]
#[derive(Default)]
pub struct SessionServiceBuilder {
    config: ServiceConfig,
    connector: Option<Arc<dyn SessionConnector>>,
    accounts: Option<Arc<dyn AccountStore>>,
    network: Option<Arc<dyn NetworkMonitor>>,
    presence: Option<Arc<dyn PresenceReporter>>,
    errors: Option<Arc<dyn ErrorSink>>,
    incoming_calls: Option<Arc<dyn IncomingCallHandler>>,
    extensions: Vec<Arc<dyn SessionExtension>>,
}

impl SessionServiceBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn config(mut self, config: ServiceConfig) -> Self {
        self.config = config;
        self
    }

    pub fn connector(mut self, connector: Arc<dyn SessionConnector>) -> Self {
        self.connector = Some(connector);
        self
    }

    pub fn accounts(mut self, accounts: Arc<dyn AccountStore>) -> Self {
        self.accounts = Some(accounts);
        self
    }

    pub fn network(mut self, network: Arc<dyn NetworkMonitor>) -> Self {
        self.network = Some(network);
        self
    }

    /// Defaults to a reporter that ignores everything
    pub fn presence(mut self, presence: Arc<dyn PresenceReporter>) -> Self {
        self.presence = Some(presence);
        self
    }

    /// Defaults to [`TracingErrorSink`]
    pub fn errors(mut self, errors: Arc<dyn ErrorSink>) -> Self {
        self.errors = Some(errors);
        self
    }

    pub fn incoming_calls(mut self, handler: Arc<dyn IncomingCallHandler>) -> Self {
        self.incoming_calls = Some(handler);
        self
    }

    /// Install an extra extension into every session
    pub fn extension(mut self, extension: Arc<dyn SessionExtension>) -> Self {
        self.extensions.push(extension);
        self
    }

    pub fn build(self) -> ServiceResult<SessionService> {
        let connector = self
            .connector
            .ok_or_else(|| ServiceError::Config("a session connector is required".to_string()))?;
        let accounts = self
            .accounts
            .ok_or_else(|| ServiceError::Config("an account store is required".to_string()))?;
        let network = self
            .network
            .ok_or_else(|| ServiceError::Config("a network monitor is required".to_string()))?;
        let presence = self.presence.unwrap_or_else(|| Arc::new(NoopPresence));
        let errors = self.errors.unwrap_or_else(|| Arc::new(TracingErrorSink));

        let mut registry = SessionRegistry::new(connector, presence).with_dispose_timeout(self.config.dispose_timeout());
        if self.config.enable_webrtc {
            let mut webrtc = WebRtcExtension::new(self.config.signaling.clone());
            if let Some(handler) = self.incoming_calls {
                webrtc = webrtc.with_handler(handler);
            }
            registry = registry.with_extension(Arc::new(webrtc));
        }
        for extension in self.extensions {
            registry = registry.with_extension(extension);
        }
        let registry = Arc::new(registry);
        let sync = Arc::new(AccountSync::new(registry.clone(), accounts.clone(), errors));
        let (shutdown, _) = watch::channel(false);

        Ok(SessionService {
            config: self.config,
            registry,
            sync,
            accounts,
            network,
            shutdown,
            listeners: Mutex::new(Vec::new()),
            started: AtomicBool::new(false),
        })
    }
}

/// Explicitly owned context running the registry and the sync coordinator
pub struct SessionService {
    config: ServiceConfig,
    registry: Arc<SessionRegistry>,
    sync: Arc<AccountSync>,
    accounts: Arc<dyn AccountStore>,
    network: Arc<dyn NetworkMonitor>,
    shutdown: watch::Sender<bool>,
    listeners: Mutex<Vec<JoinHandle<()>>>,
    started: AtomicBool,
}

impl SessionService {
    pub fn builder() -> SessionServiceBuilder {
        SessionServiceBuilder::new()
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    pub fn sync(&self) -> &Arc<AccountSync> {
        &self.sync
    }

    /// Subscribe to account and network changes and run the first sync.
    ///
    /// Returns the initial sync task when the network is already up.
    pub fn start(&self) -> ServiceResult<Option<JoinHandle<Option<crate::sync::SyncReport>>>> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(ServiceError::Config("service already started".to_string()));
        }
        // Subscribe before reading the current state so no edge is lost
        let account_changes = self.accounts.subscribe();
        let network_events = self.network.subscribe();
        let available = self.network.is_available();
        self.sync.set_network_available(available);

        {
            let mut listeners = self.listeners.lock();
            listeners.push(tokio::spawn(
                account_listener(self.sync.clone(), account_changes, self.shutdown.subscribe())
                    .instrument(info_span!("accounts")),
            ));
            listeners.push(tokio::spawn(
                network_listener(
                    self.sync.clone(),
                    self.network.clone(),
                    network_events,
                    self.shutdown.subscribe(),
                )
                .instrument(info_span!("network")),
            ));
        }
        info!(network_available = available, "session service started");

        Ok(available.then(|| self.sync.spawn_sync()))
    }

    /// Log in one identity outside of account sync
    pub async fn login(&self, identity: &Jid, credential: &Credential, replace_existing: bool) -> ServiceResult<SessionRef> {
        self.registry.login(identity, credential, replace_existing).await
    }

    pub fn session(&self, identity: &Jid) -> Option<SessionRef> {
        self.registry.get(identity)
    }

    /// Signaling plugin of the identity's session
    pub fn webrtc(&self, identity: &Jid) -> Option<Arc<WebRtcPlugin>> {
        self.registry.plugins(identity)?.get::<WebRtcPlugin>()
    }

    /// Stop listening, abandon running sync tasks and dispose every session
    pub async fn shutdown(&self) {
        self.shutdown.send_replace(true);
        let listeners: Vec<JoinHandle<()>> = self.listeners.lock().drain(..).collect();
        for listener in listeners {
            let _ = listener.await;
        }
        self.sync.abort_tasks();
        let disposed = self.registry.dispose_all();
        info!(disposed, "session service stopped");
    }
}

impl std::fmt::Debug for SessionService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionService")
            .field("registry", &self.registry)
            .field("sync", &self.sync)
            .field("started", &self.started.load(Ordering::SeqCst))
            .finish()
    }
}

async fn account_listener(
    sync: Arc<AccountSync>,
    mut changes: broadcast::Receiver<AccountChange>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            change = changes.recv() => match change {
                Ok(change) => {
                    sync.on_account_change(&change);
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "account changes lagged, resyncing");
                    if sync.is_network_available() {
                        sync.spawn_sync();
                    }
                }
                Err(RecvError::Closed) => break,
            },
        }
    }
    debug!("account listener stopped");
}

async fn network_listener(
    sync: Arc<AccountSync>,
    network: Arc<dyn NetworkMonitor>,
    mut events: broadcast::Receiver<NetworkEvent>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            event = events.recv() => match event {
                Ok(NetworkEvent::Available) => {
                    sync.on_network_available();
                }
                Ok(NetworkEvent::Lost) => {
                    sync.on_network_lost().await;
                }
                Err(RecvError::Lagged(_)) => {
                    if network.is_available() {
                        sync.on_network_available();
                    } else {
                        sync.on_network_lost().await;
                    }
                }
                Err(RecvError::Closed) => break,
            },
        }
    }
    debug!("network listener stopped");
}
