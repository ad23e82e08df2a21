//! Gateway configuration
//!
//! Defaults merged with `MODBUS_`-prefixed environment variables, so the
//! deployment knobs are `MODBUS_SESSION_IDLE_TTL`, `MODBUS_REAP_INTERVAL`,
//! `MODBUS_MAX_CONCURRENT_POLLS`, `MODBUS_DEFAULT_TIMEOUT_MS` and the HTTP
//! bind settings.

use figment::providers::{Env, Serialized};
use figment::Figment;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::DevSrvError;

/// Environment-driven gateway settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Seconds a session may sit idle before the reaper closes it
    pub session_idle_ttl: u64,
    /// Seconds between reaper scans
    pub reap_interval: u64,
    /// Upper bound on concurrently active pollers
    pub max_concurrent_polls: usize,
    /// Exchange timeout applied when a device does not configure one
    pub default_timeout_ms: u64,
    /// HTTP bind address
    pub http_host: String,
    pub http_port: u16,
    /// Budget for stopping all pollers at shutdown
    pub shutdown_grace_ms: u64,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            session_idle_ttl: 120,
            reap_interval: 30,
            max_concurrent_polls: 64,
            default_timeout_ms: 5000,
            http_host: "0.0.0.0".to_string(),
            http_port: 8080,
            shutdown_grace_ms: 10_000,
        }
    }
}

impl GatewayConfig {
    /// Defaults overlaid with `MODBUS_*` environment variables
    pub fn load() -> Result<Self, DevSrvError> {
        Figment::from(Serialized::defaults(Self::default()))
            .merge(Env::prefixed("MODBUS_"))
            .extract()
            .map_err(|e| DevSrvError::Config(e.to_string()))
    }

    pub fn session_idle_ttl(&self) -> Duration {
        Duration::from_secs(self.session_idle_ttl)
    }

    pub fn reap_interval(&self) -> Duration {
        Duration::from_secs(self.reap_interval)
    }

    pub fn default_timeout(&self) -> Duration {
        Duration::from_millis(self.default_timeout_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }
}
