//! # viska WebRTC signaling
//!
//! Call setup messages (session descriptions, ICE candidates and close
//! notices) multiplexed over XMPP `iq` stanzas in the
//! `https://schemas.viska.chat/demo/webrtc` namespace, correlated by an opaque
//! call id.
//!
//! Apply a [`WebRtcPlugin`] to a session's
//! [`PluginManager`](viska_xmpp_core::PluginManager), then subscribe to its
//! [`events`](WebRtcPlugin::events) and use the `send_*` operations.
//!
//! ```rust,no_run
//! use viska_webrtc_signaling::{SessionDescription, WebRtcPlugin};
//! use viska_xmpp_core::{testing::MemorySession, Jid, PluginManager};
//!
//! # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
//! let session = MemorySession::online(Jid::parse("alice@example.com")?);
//! let plugins = PluginManager::new(session);
//! let webrtc = plugins.apply(WebRtcPlugin::default());
//!
//! let call_id = webrtc.new_call_id();
//! let bob = Jid::parse("bob@example.com/phone")?;
//! webrtc
//!     .send_sdp(&bob, &call_id, &SessionDescription::offer("v=0\r\n"), true)
//!     .await?;
//! # Ok(())
//! # }
//! ```

pub mod codec;
pub mod config;
pub mod error;
pub mod events;
pub mod plugin;
pub mod types;

pub use codec::NS_WEBRTC;
pub use config::SignalingConfig;
pub use error::{SignalingError, SignalingResult};
pub use events::{CallEventStream, EventEmitter, EventStream, SignalingEvent};
pub use plugin::{WebRtcPlugin, RETIRED_CALLS_KEPT};
pub use types::{CallDirection, CallId, CallPhase, CallSession, IceCandidate, SdpType, SessionDescription};
