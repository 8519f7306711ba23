use std::fs;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::connection::DEFAULT_READ_BUFFER_SIZE;
use crate::error::ConfigError;
use crate::router::RouteTarget;

/// Proxy settings, read from a JSON file. Missing fields take their
/// defaults.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ProxyConfig {
    pub bind: SocketAddr,
    /// Independent accept loops, each on its own thread.
    pub workers: usize,
    pub upstreams: Vec<RouteTarget>,
    pub read_buffer_size: usize,
    pub connect_timeout_ms: u64,
    pub backlog: i32,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([127, 0, 0, 1], 8080)),
            workers: 1,
            upstreams: Vec::new(),
            read_buffer_size: DEFAULT_READ_BUFFER_SIZE,
            connect_timeout_ms: 5000,
            backlog: 1024,
        }
    }
}

impl ProxyConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path)?;
        Self::from_json(&text)
    }

    pub fn from_json(text: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.workers == 0 {
            return Err(ConfigError::Invalid("workers must be at least 1".into()));
        }
        if self.read_buffer_size == 0 {
            return Err(ConfigError::Invalid("read_buffer_size must be positive".into()));
        }
        if self.backlog <= 0 {
            return Err(ConfigError::Invalid("backlog must be positive".into()));
        }
        Ok(())
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}
