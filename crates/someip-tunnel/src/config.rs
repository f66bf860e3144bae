//! Tunnel configuration.
//!
//! Defaults reproduce the deployed setup: application "Tunnel", services
//! "TunnelToRust" (published) and "TunnelFromRust" (subscribed), history
//! and buffer of 20 records, 100 ms poll cycle, no request expiry.
//!
//! Values come from an optional JSON file, then `TUNNEL_*` environment
//! variables override individual fields.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::ipc::ServiceConfig;

pub const DEFAULT_APP_NAME: &str = "Tunnel";
pub const DEFAULT_TO_GATEWAY: &str = "TunnelToRust";
pub const DEFAULT_FROM_GATEWAY: &str = "TunnelFromRust";
pub const DEFAULT_CYCLE_TIME_MS: u64 = 100;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("invalid value '{value}' for {key}")]
    InvalidEnv { key: &'static str, value: String },

    #[error("cycle time must be non-zero")]
    ZeroCycleTime,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TunnelConfig {
    /// Name the bridge registers with the RPC runtime.
    pub app_name: String,
    /// Service the bridge publishes frames on.
    pub to_gateway: ServiceConfig,
    /// Service the bridge receives frames from.
    pub from_gateway: ServiceConfig,
    pub cycle_time_ms: u64,
    /// Pending requests older than this are dropped. Disabled when unset.
    pub request_ttl_ms: Option<u64>,
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            app_name: DEFAULT_APP_NAME.to_string(),
            to_gateway: ServiceConfig::new(DEFAULT_TO_GATEWAY),
            from_gateway: ServiceConfig::new(DEFAULT_FROM_GATEWAY),
            cycle_time_ms: DEFAULT_CYCLE_TIME_MS,
            request_ttl_ms: None,
        }
    }
}

impl TunnelConfig {
    pub fn with_app_name(mut self, name: impl Into<String>) -> Self {
        self.app_name = name.into();
        self
    }

    pub fn with_to_gateway(mut self, service: ServiceConfig) -> Self {
        self.to_gateway = service;
        self
    }

    pub fn with_from_gateway(mut self, service: ServiceConfig) -> Self {
        self.from_gateway = service;
        self
    }

    pub fn with_cycle_time(mut self, cycle_time: Duration) -> Self {
        self.cycle_time_ms = cycle_time.as_millis() as u64;
        self
    }

    pub fn with_request_ttl(mut self, ttl: Option<Duration>) -> Self {
        self.request_ttl_ms = ttl.map(|ttl| ttl.as_millis() as u64);
        self
    }

    pub fn cycle_time(&self) -> Duration {
        Duration::from_millis(self.cycle_time_ms)
    }

    pub fn request_ttl(&self) -> Option<Duration> {
        self.request_ttl_ms.map(Duration::from_millis)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.cycle_time_ms == 0 {
            return Err(ConfigError::ZeroCycleTime);
        }
        Ok(())
    }

    pub fn from_json_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self = serde_json::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Applies `TUNNEL_*` overrides looked up through `var`.
    pub fn with_env_overrides(
        mut self,
        var: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, ConfigError> {
        if let Some(name) = var("TUNNEL_APP_NAME") {
            self.app_name = name;
        }
        if let Some(name) = var("TUNNEL_TO_GATEWAY") {
            self.to_gateway.name = name;
        }
        if let Some(name) = var("TUNNEL_FROM_GATEWAY") {
            self.from_gateway.name = name;
        }
        if let Some(size) = parse_var::<usize>(&var, "TUNNEL_HISTORY_SIZE")? {
            self.to_gateway.history_size = size;
            self.from_gateway.history_size = size;
        }
        if let Some(size) = parse_var::<usize>(&var, "TUNNEL_BUFFER_SIZE")? {
            self.to_gateway.subscriber_max_buffer_size = size;
            self.from_gateway.subscriber_max_buffer_size = size;
        }
        if let Some(ms) = parse_var::<u64>(&var, "TUNNEL_CYCLE_TIME_MS")? {
            self.cycle_time_ms = ms;
        }
        if let Some(ms) = parse_var::<u64>(&var, "TUNNEL_REQUEST_TTL_MS")? {
            // 0 disables expiry.
            self.request_ttl_ms = (ms > 0).then_some(ms);
        }
        self.validate()?;
        Ok(self)
    }
}

pub(crate) fn parse_var<T: std::str::FromStr>(
    var: &impl Fn(&str) -> Option<String>,
    key: &'static str,
) -> Result<Option<T>, ConfigError> {
    match var(key) {
        None => Ok(None),
        Some(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::InvalidEnv { key, value }),
    }
}
