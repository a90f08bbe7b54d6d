//! Server configuration from the environment.
//!
//! The configuration surface is deliberately small: a bind host, a port,
//! and the durable-storage path. Everything else has fixed defaults.

use std::path::PathBuf;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Host to bind to
    pub host: String,
    /// Port to bind to
    pub port: u16,
    /// Durable storage directory
    pub storage_path: PathBuf,
    /// Broadcast channel capacity per room
    pub broadcast_capacity: usize,
    /// Append-queue depth at which a persistence-lag warning fires
    pub append_queue_warn_depth: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 1234,
            storage_path: PathBuf::from("./storage-location"),
            broadcast_capacity: 256,
            append_queue_warn_depth: 1024,
        }
    }
}

impl ServerConfig {
    /// Read configuration from `HOST`, `PORT` and `STORAGE_PATH`.
    ///
    /// Unset variables fall back to defaults; a malformed `PORT` is a
    /// startup fault, not a silent fallback.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Ok(host) = std::env::var("HOST") {
            if !host.is_empty() {
                config.host = host;
            }
        }
        if let Ok(port) = std::env::var("PORT") {
            config.port = port
                .parse()
                .map_err(|_| ConfigError::InvalidPort(port.clone()))?;
        }
        if let Ok(path) = std::env::var("STORAGE_PATH") {
            if !path.is_empty() {
                config.storage_path = PathBuf::from(path);
            }
        }

        Ok(config)
    }

    /// Socket address string for `TcpListener::bind`.
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Configuration errors. All of them are startup faults.
#[derive(Debug, Clone)]
pub enum ConfigError {
    /// `PORT` was set but not a valid u16
    InvalidPort(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::InvalidPort(raw) => write!(f, "Invalid PORT value: {raw:?}"),
        }
    }
}

impl std::error::Error for ConfigError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ServerConfig::default();
        assert_eq!(config.host, "127.0.0.1");
        assert_eq!(config.port, 1234);
        assert_eq!(config.storage_path, PathBuf::from("./storage-location"));
        assert_eq!(config.bind_addr(), "127.0.0.1:1234");
    }

    #[test]
    fn test_bind_addr_formats_host_port() {
        let config = ServerConfig {
            host: "0.0.0.0".into(),
            port: 9000,
            ..ServerConfig::default()
        };
        assert_eq!(config.bind_addr(), "0.0.0.0:9000");
    }

    #[test]
    fn test_invalid_port_display() {
        let err = ConfigError::InvalidPort("eighty".into());
        assert!(err.to_string().contains("eighty"));
    }
}
