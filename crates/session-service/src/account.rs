//! Account store and network collaborators

use std::collections::HashSet;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use viska_xmpp_core::{Credential, Jid};

use crate::error::ServiceResult;

/// Change notification from the account store
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum AccountChange {
    Added(Jid),
    Removed(Jid),
    /// Credential or enabled flag changed
    Updated(Jid),
}

impl AccountChange {
    pub fn identity(&self) -> &Jid {
        match self {
            AccountChange::Added(jid) | AccountChange::Removed(jid) | AccountChange::Updated(jid) => jid,
        }
    }
}

/// Platform account store
#[async_trait]
pub trait AccountStore: Send + Sync {
    /// Identities that should currently be logged in
    async fn enabled_identities(&self) -> ServiceResult<HashSet<Jid>>;

    async fn credential(&self, identity: &Jid) -> ServiceResult<Credential>;

    fn subscribe(&self) -> broadcast::Receiver<AccountChange>;
}

/// Edge-triggered connectivity change
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NetworkEvent {
    Available,
    Lost,
}

/// Platform connectivity signal
pub trait NetworkMonitor: Send + Sync {
    fn is_available(&self) -> bool;

    fn subscribe(&self) -> broadcast::Receiver<NetworkEvent>;
}
