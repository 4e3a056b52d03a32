//! Pluggable protocol extensions
//!
//! A [`Plugin`] is attached to exactly one session through a
//! [`PluginManager`]. When applied it receives a [`PluginContext`] giving it
//! the session's inbound stanza feed and the operations it needs to answer
//! requests. Plugins advertise the features and IQ payloads they handle so a
//! caller can answer service discovery or route unknown requests.

use std::any::{Any, TypeId};
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::broadcast;
use tracing::debug;

use crate::error::XmppResult;
use crate::jid::Jid;
use crate::session::SessionRef;
use crate::stanza::{Stanza, StanzaError};

/// A protocol extension bound to one session
pub trait Plugin: Send + Sync + 'static {
    /// Short name used in logs
    fn name(&self) -> &'static str;

    /// Feature namespaces advertised for this plugin
    fn features(&self) -> Vec<String>;

    /// `(namespace, element)` pairs of IQ payloads this plugin answers
    fn supported_iqs(&self) -> Vec<(String, String)>;

    /// Called once when the plugin is attached to its session
    fn on_applying(self: Arc<Self>, context: PluginContext);
}

/// What a plugin may do with its session
#[derive(Clone, Debug)]
pub struct PluginContext {
    session: SessionRef,
}

impl PluginContext {
    pub fn new(session: SessionRef) -> Self {
        Self { session }
    }

    pub fn session(&self) -> &SessionRef {
        &self.session
    }

    /// Negotiated address, falling back to the login address before binding
    pub fn local_jid(&self) -> Jid {
        self.session
            .negotiated_jid()
            .unwrap_or_else(|| self.session.login_jid().clone())
    }

    pub fn inbound_stanzas(&self) -> broadcast::Receiver<Stanza> {
        self.session.inbound_stanzas()
    }

    pub async fn send_iq(&self, iq: Stanza) -> XmppResult<Stanza> {
        self.session.send_iq(iq).await
    }

    /// Acknowledge a request with an empty result
    pub async fn send_result(&self, request: &Stanza) -> XmppResult<()> {
        self.session.send(request.result_reply()?).await
    }

    /// Answer a request with a stanza error
    pub async fn send_error(&self, request: &Stanza, error: &StanzaError) -> XmppResult<()> {
        self.session.send(request.error_reply(error)?).await
    }
}

struct Installed {
    type_id: TypeId,
    plugin: Arc<dyn Plugin>,
    any: Arc<dyn Any + Send + Sync>,
}

/// The set of plugins attached to one session
pub struct PluginManager {
    context: PluginContext,
    plugins: RwLock<Vec<Installed>>,
}

impl PluginManager {
    pub fn new(session: SessionRef) -> Self {
        Self {
            context: PluginContext::new(session),
            plugins: RwLock::new(Vec::new()),
        }
    }

    pub fn session(&self) -> &SessionRef {
        self.context.session()
    }

    /// Attach `plugin`, or return the instance already attached for its type
    pub fn apply<P: Plugin>(&self, plugin: P) -> Arc<P> {
        let plugin = {
            let mut plugins = self.plugins.write();
            if let Some(existing) = plugins.iter().find(|p| p.type_id == TypeId::of::<P>()) {
                if let Ok(existing) = existing.any.clone().downcast::<P>() {
                    return existing;
                }
            }
            let plugin = Arc::new(plugin);
            plugins.push(Installed {
                type_id: TypeId::of::<P>(),
                plugin: plugin.clone(),
                any: plugin.clone(),
            });
            plugin
        };
        debug!(
            plugin = plugin.name(),
            identity = %self.context.session().login_jid(),
            "applying plugin"
        );
        plugin.clone().on_applying(self.context.clone());
        plugin
    }

    /// Typed lookup of an attached plugin
    pub fn get<P: Plugin>(&self) -> Option<Arc<P>> {
        self.plugins
            .read()
            .iter()
            .find(|p| p.type_id == TypeId::of::<P>())
            .and_then(|p| p.any.clone().downcast::<P>().ok())
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.plugins.read().iter().map(|p| p.plugin.name()).collect()
    }

    /// Union of advertised features
    pub fn features(&self) -> Vec<String> {
        let mut features: Vec<String> = self
            .plugins
            .read()
            .iter()
            .flat_map(|p| p.plugin.features())
            .collect();
        features.sort();
        features.dedup();
        features
    }

    pub fn supports_iq(&self, namespace: &str, name: &str) -> bool {
        self.plugins.read().iter().any(|p| {
            p.plugin
                .supported_iqs()
                .iter()
                .any(|(ns, n)| ns == namespace && n == name)
        })
    }
}

impl std::fmt::Debug for PluginManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginManager")
            .field("identity", &self.context.session().login_jid())
            .field("plugins", &self.names())
            .finish()
    }
}
