//! Runtime configuration for profile connections and the session manager

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{LinkError, LinkResult};

/// Default period of the maintenance loop (retry drain + idle sweep).
const DEFAULT_MAINTENANCE_INTERVAL_SECS: u64 = 30;

/// Default idle time after which a silent call is closed.
const DEFAULT_CALL_IDLE_TIMEOUT_MS: u64 = 20_000;

/// Default time to wait for any single server response.
const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 30_000;

/// Configuration shared by every connection of a session manager.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkConfig {
    /// Period of the per-connection maintenance loop, in seconds
    pub maintenance_interval_secs: u64,
    /// Idle timeout assigned to new calls, in milliseconds
    pub call_idle_timeout_ms: u64,
    /// Upper bound on any single request round-trip, in milliseconds
    pub request_timeout_ms: u64,
    /// Client port assumed for servers known only by host
    pub default_client_port: u16,
    /// Non-client port assumed for servers known only by host
    pub default_non_client_port: u16,
    /// Application-service port assumed for servers known only by host
    pub default_app_service_port: u16,
    /// Register the built-in pairing service on new identities
    pub pairing_enabled: bool,
    /// Capacity of the broadcast channels used for events
    pub event_channel_capacity: usize,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            maintenance_interval_secs: DEFAULT_MAINTENANCE_INTERVAL_SECS,
            call_idle_timeout_ms: DEFAULT_CALL_IDLE_TIMEOUT_MS,
            request_timeout_ms: DEFAULT_REQUEST_TIMEOUT_MS,
            default_client_port: 16988,
            default_non_client_port: 16987,
            default_app_service_port: 16989,
            pairing_enabled: true,
            event_channel_capacity: 256,
        }
    }
}

impl LinkConfig {
    /// Parse a configuration from JSON, filling missing fields with defaults.
    pub fn from_json(json: &str) -> LinkResult<Self> {
        let config: Self =
            serde_json::from_str(json).map_err(|e| LinkError::Serialization(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values that would stall the maintenance loop or every request.
    pub fn validate(&self) -> LinkResult<()> {
        if self.maintenance_interval_secs == 0 {
            return Err(LinkError::InvalidState(
                "maintenance_interval_secs must be positive".to_string(),
            ));
        }
        if self.request_timeout_ms == 0 {
            return Err(LinkError::InvalidState(
                "request_timeout_ms must be positive".to_string(),
            ));
        }
        if self.event_channel_capacity == 0 {
            return Err(LinkError::InvalidState(
                "event_channel_capacity must be positive".to_string(),
            ));
        }
        Ok(())
    }

    pub fn maintenance_interval(&self) -> Duration {
        Duration::from_secs(self.maintenance_interval_secs)
    }

    pub fn call_idle_timeout(&self) -> Duration {
        Duration::from_millis(self.call_idle_timeout_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}
