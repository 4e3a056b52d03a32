//! Service configuration
//!
//! [`ServiceConfig`] can be built in code with the `with_*` methods or loaded
//! from TOML; every field has a default so partial files are fine:
//!
//! ```toml
//! dispose_timeout_ms = 2000
//!
//! [signaling]
//! line_terminator = "\n"
//!
//! [logging]
//! level = "debug"
//! ```

use std::time::Duration;

use serde::{Deserialize, Serialize};
use viska_webrtc_signaling::SignalingConfig;

use crate::error::{ServiceError, ServiceResult};
use crate::logging::LoggingConfig;

/// Configuration for a [`SessionService`](crate::SessionService)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    /// How long a replacing login waits for the previous session to dispose
    pub dispose_timeout_ms: u64,

    /// Attach the WebRTC signaling plugin to every session
    pub enable_webrtc: bool,

    pub signaling: SignalingConfig,

    pub logging: LoggingConfig,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            dispose_timeout_ms: 5_000,
            enable_webrtc: true,
            signaling: SignalingConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl ServiceConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a TOML document
    pub fn from_toml_str(input: &str) -> ServiceResult<Self> {
        toml::from_str(input).map_err(|e| ServiceError::Config(format!("Invalid service configuration: {}", e)))
    }

    pub fn dispose_timeout(&self) -> Duration {
        Duration::from_millis(self.dispose_timeout_ms)
    }

    pub fn with_dispose_timeout(mut self, timeout: Duration) -> Self {
        self.dispose_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_webrtc(mut self, enabled: bool) -> Self {
        self.enable_webrtc = enabled;
        self
    }

    pub fn with_signaling(mut self, signaling: SignalingConfig) -> Self {
        self.signaling = signaling;
        self
    }

    pub fn with_logging(mut self, logging: LoggingConfig) -> Self {
        self.logging = logging;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ServiceConfig::default();
        assert_eq!(config.dispose_timeout(), Duration::from_secs(5));
        assert!(config.enable_webrtc);
        assert_eq!(config.signaling.line_terminator, "\r\n");
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_partial_toml() {
        let config = ServiceConfig::from_toml_str(
            r#"
            dispose_timeout_ms = 250
            enable_webrtc = false

            [signaling]
            line_terminator = "\n"

            [logging]
            level = "debug"
            json = true
            "#,
        )
        .unwrap();
        assert_eq!(config.dispose_timeout(), Duration::from_millis(250));
        assert!(!config.enable_webrtc);
        assert_eq!(config.signaling.line_terminator, "\n");
        assert_eq!(config.signaling.event_capacity, 256);
        assert_eq!(config.logging.level, "debug");
        assert!(config.logging.json);
        assert_eq!(config.logging.app_name, "viska");
    }

    #[test]
    fn test_invalid_toml() {
        let result = ServiceConfig::from_toml_str("dispose_timeout_ms = \"soon\"");
        assert!(matches!(result, Err(ServiceError::Config(_))));
    }

    #[test]
    fn test_builders() {
        let config = ServiceConfig::new()
            .with_dispose_timeout(Duration::from_millis(10))
            .with_webrtc(false)
            .with_signaling(SignalingConfig::new().with_line_terminator("\n"));
        assert_eq!(config.dispose_timeout_ms, 10);
        assert!(!config.enable_webrtc);
        assert_eq!(config.signaling.line_terminator, "\n");
    }
}
