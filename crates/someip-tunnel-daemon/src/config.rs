//! Daemon configuration: the tunnel settings plus where the shared-memory
//! services and lifetime cells live.

use std::path::{Path, PathBuf};

use serde::Deserialize;
use someip_tunnel::config::{ConfigError, TunnelConfig};
use someip_tunnel::ipc::shm::DEFAULT_SHM_DIR;

pub const DEFAULT_LIFETIME_FROM_GATEWAY: &str = "LifetimeFromGateway";
pub const DEFAULT_LIFETIME_TO_GATEWAY: &str = "LifetimeToGateway";

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DaemonConfig {
    pub tunnel: TunnelConfig,
    pub shm_dir: PathBuf,
    /// Cell the gateway publishes its generation on.
    pub lifetime_from_gateway: String,
    /// Cell bumped whenever a fresh tunnel is ready.
    pub lifetime_to_gateway: String,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            tunnel: TunnelConfig::default(),
            shm_dir: PathBuf::from(DEFAULT_SHM_DIR),
            lifetime_from_gateway: DEFAULT_LIFETIME_FROM_GATEWAY.to_string(),
            lifetime_to_gateway: DEFAULT_LIFETIME_TO_GATEWAY.to_string(),
        }
    }
}

impl DaemonConfig {
    /// Reads `path` if given (defaults otherwise), then applies `TUNNEL_*`
    /// environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let config = match path {
            Some(path) => {
                let text =
                    std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
                        path: path.to_path_buf(),
                        source,
                    })?;
                serde_json::from_str(&text).map_err(|source| ConfigError::Parse {
                    path: path.to_path_buf(),
                    source,
                })?
            }
            None => Self::default(),
        };
        config.with_env_overrides(|key| std::env::var(key).ok())
    }

    pub fn with_env_overrides(
        mut self,
        var: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, ConfigError> {
        if let Some(dir) = var("TUNNEL_SHM_DIR") {
            self.shm_dir = PathBuf::from(dir);
        }
        self.tunnel = self.tunnel.with_env_overrides(var)?;
        Ok(self)
    }
}
