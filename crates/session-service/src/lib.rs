//! # viska session service
//!
//! Client-side supervision of XMPP sessions, one per account:
//!
//! - [`SessionRegistry`] owns identity → session and guarantees at most one
//!   session per identity, even under concurrent replacing logins.
//! - [`AccountSync`] reconciles the registry with the [`AccountStore`] and the
//!   [`NetworkMonitor`]: it logs in new accounts, disposes removed ones,
//!   resumes disconnected sessions and drops transports when the network goes
//!   away.
//! - [`WebRtcExtension`] attaches call signaling to every session and hands
//!   incoming offers to an [`IncomingCallHandler`].
//! - [`SessionService`] is the explicitly built context tying it together.
//!
//! ```rust
//! use std::sync::Arc;
//! use viska_session_service::testing::{ManualNetwork, MemoryAccountStore, MemoryConnector};
//! use viska_session_service::{ServiceConfig, SessionService};
//! use viska_xmpp_core::Jid;
//!
//! # tokio_test::block_on(async {
//! let accounts = Arc::new(MemoryAccountStore::new());
//! accounts.add(Jid::parse("alice@example.com").unwrap(), "secret");
//!
//! let service = SessionService::builder()
//!     .config(ServiceConfig::default())
//!     .connector(Arc::new(MemoryConnector::new()))
//!     .accounts(accounts)
//!     .network(Arc::new(ManualNetwork::new(true)))
//!     .build()
//!     .unwrap();
//!
//! if let Some(initial) = service.start().unwrap() {
//!     initial.await.unwrap();
//! }
//! service.sync().settle().await;
//! assert_eq!(service.registry().online_count(), 1);
//! service.shutdown().await;
//! # });
//! ```

pub mod account;
pub mod config;
pub mod connector;
pub mod error;
pub mod extension;
pub mod logging;
pub mod presence;
pub mod registry;
pub mod service;
pub mod sync;
pub mod testing;

pub use account::{AccountChange, AccountStore, NetworkEvent, NetworkMonitor};
pub use config::ServiceConfig;
pub use connector::{select_secure, ConnectionMethod, ConnectionProtocol, SessionConnector};
pub use error::{ServiceError, ServiceResult};
pub use extension::{IncomingCall, IncomingCallHandler, SessionExtension, WebRtcExtension};
pub use logging::{setup_logging, LoggingConfig};
pub use presence::{ErrorSink, NoopPresence, PresenceReporter, PresenceTracker, TracingErrorSink};
pub use registry::{LoginAttempt, PendingLogin, PendingReconnect, ReconnectStep, SessionRegistry, Waiter};
pub use service::{SessionService, SessionServiceBuilder};
pub use sync::{AccountSync, SyncReport};
