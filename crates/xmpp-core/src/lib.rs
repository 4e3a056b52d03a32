//! # viska XMPP core
//!
//! Building blocks shared by the session service and its plugins:
//!
//! - [`Jid`]: federated addresses, the key for everything per-account
//! - [`xml::Element`] and [`Stanza`]: an owned stanza tree with a quick-xml
//!   codec and RFC 6120 error replies
//! - [`SessionState`] / [`StateMachine`]: the session lifecycle
//! - [`Session`]: the contract a transport implementation fulfils
//! - [`Plugin`] / [`PluginManager`]: per-session protocol extensions
//! - [`testing::MemorySession`]: a network-free session for tests
//!
//! ```rust
//! use viska_xmpp_core::{IqType, Jid, Stanza};
//!
//! let to: Jid = "bob@example.com/phone".parse().unwrap();
//! let iq = Stanza::iq(IqType::Get, None, Some(&to), None);
//! assert_eq!(iq.iq_type(), Some(IqType::Get));
//! assert!(iq.to_xml().unwrap().starts_with("<iq"));
//! ```

pub mod error;
pub mod jid;
pub mod plugin;
pub mod session;
pub mod stanza;
pub mod state;
pub mod testing;
pub mod xml;

pub use error::{XmppError, XmppResult};
pub use jid::Jid;
pub use plugin::{Plugin, PluginContext, PluginManager};
pub use session::{wait_until_online, Credential, Session, SessionRef};
pub use stanza::{Condition, ErrorType, IqType, Stanza, StanzaError, StanzaKind, NS_STANZAS};
pub use state::{SessionState, StateMachine};
pub use xml::{Element, Node};
