//! Signaling plugin configuration

use serde::{Deserialize, Serialize};

/// Settings for one [`WebRtcPlugin`](crate::WebRtcPlugin) instance
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SignalingConfig {
    /// Inserted between decoded `line` elements when rebuilding a body
    pub line_terminator: String,

    /// Buffer size of the event broadcast channel
    pub event_capacity: usize,
}

impl Default for SignalingConfig {
    fn default() -> Self {
        Self {
            line_terminator: "\r\n".to_string(),
            event_capacity: 256,
        }
    }
}

impl SignalingConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_line_terminator(mut self, terminator: impl Into<String>) -> Self {
        self.line_terminator = terminator.into();
        self
    }

    pub fn with_event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity.max(1);
        self
    }
}
