//! Runtime configuration assembled from command-line arguments.

use crate::gateway::GatewayConfig;
use shared::{Position, PROTOCOL_REVISION, TICK_MILLIS};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid bind address '{0}'")]
    InvalidAddress(String),

    #[error("{0} must be greater than zero")]
    Zero(&'static str),
}

/// Where new characters appear.
pub const DEFAULT_SPAWN: Position = Position::new(3222, 3218, 0);

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub tick: Duration,
    /// Worker threads for the task pool; `None` uses one per core.
    pub workers: Option<usize>,
    pub gateway: GatewayConfig,
    pub restricted: bool,
    pub idle_timeout: Duration,
    pub ban_list: Option<PathBuf>,
    pub save_dir: PathBuf,
    pub revision: u16,
    pub spawn: Position,
    /// Usernames granted administrator rights on login.
    pub administrators: Vec<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 43594,
            tick: Duration::from_millis(TICK_MILLIS),
            workers: None,
            gateway: GatewayConfig::default(),
            restricted: false,
            idle_timeout: Duration::from_secs(15),
            ban_list: None,
            save_dir: PathBuf::from("saves"),
            revision: PROTOCOL_REVISION,
            spawn: DEFAULT_SPAWN,
            administrators: Vec::new(),
        }
    }
}

impl ServerConfig {
    pub fn address(&self) -> Result<SocketAddr, ConfigError> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .map_err(|_| ConfigError::InvalidAddress(format!("{}:{}", self.host, self.port)))
    }

    pub fn is_administrator(&self, username: &str) -> bool {
        self.administrators
            .iter()
            .any(|admin| admin.eq_ignore_ascii_case(username))
    }

    pub fn worker_threads(&self) -> usize {
        self.workers.unwrap_or_else(num_cpus::get).max(1)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.tick.is_zero() {
            return Err(ConfigError::Zero("tick length"));
        }
        if self.idle_timeout.is_zero() {
            return Err(ConfigError::Zero("idle timeout"));
        }
        if self.gateway.connection_limit == 0 {
            return Err(ConfigError::Zero("connection limit"));
        }
        if self.workers == Some(0) {
            return Err(ConfigError::Zero("worker count"));
        }
        self.address().map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ServerConfig::default();
        assert_eq!(config.tick, Duration::from_millis(600));
        assert_eq!(config.gateway.connection_limit, 1);
        assert_eq!(config.gateway.rate_window, Duration::from_secs(1));
        assert_eq!(config.address().unwrap().port(), 43594);
        assert!(config.worker_threads() >= 1);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_invalid_values_rejected() {
        let mut config = ServerConfig {
            host: "not a host".to_string(),
            ..ServerConfig::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::InvalidAddress(_))));

        config.host = "127.0.0.1".to_string();
        config.tick = Duration::ZERO;
        assert!(matches!(config.validate(), Err(ConfigError::Zero(_))));
    }
}
