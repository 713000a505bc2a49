//! Server configuration, loaded from a JSON file.
//!
//! Every field has a default, so `{}` is a valid configuration:
//!
//! ```json
//! {
//!   "bind_addr": "127.0.0.1:8001",
//!   "request_timeout_ms": 5000,
//!   "admin_token": "change-me",
//!   "curator": { "binder": { "flush_period_ms": 500, "kick_period_ms": 200 } },
//!   "store": { "type": "file", "path": "./documents" },
//!   "auth": { "type": "tokens", "tokens": { "secret": "create" } }
//! }
//! ```

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tandem_collab::{AuthConfig, CuratorConfig, StoreConfig};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config: {0}")]
    Parse(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// WebSocket listen address (default: 127.0.0.1:8001)
    pub bind_addr: String,
    /// Deadline for a request to the curator or a binder (default: 5s)
    pub request_timeout_ms: u64,
    /// Token for the `get_users` and `kick_user` commands; empty disables them
    pub admin_token: String,
    pub curator: CuratorConfig,
    pub store: StoreConfig,
    pub auth: AuthConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:8001".to_string(),
            request_timeout_ms: 5000,
            admin_token: String::new(),
            curator: CuratorConfig::default(),
            store: StoreConfig::default(),
            auth: AuthConfig::default(),
        }
    }
}

impl ServerConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(serde_json::from_str(&raw)?)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}
