//! Server and client settings.
use std::{path::PathBuf, time::Duration};

use thiserror::Error;

use crate::protocol::framing::DEFAULT_CHUNK_SIZE;

pub const DEFAULT_SOCKET_PATH: &str = "/var/run/netconfd.sock";
pub const DEFAULT_STARTUP_PATH: &str = "/etc/netconfd/startup.xml";
pub const DEFAULT_MAX_SESSIONS: usize = 16;
pub const DEFAULT_HELLO_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_EXPECTATION_TTL: Duration = Duration::from_secs(8);
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("max sessions must be at least 1")]
    NoSessions,
    #[error("chunk size must be at least 1")]
    NoChunkSize,
    #[error("hello timeout must be non-zero")]
    NoHelloTimeout,
    #[error("expectation ttl must be non-zero")]
    NoTtl,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    pub socket_path: PathBuf,
    /// `None` keeps startup in memory only.
    pub startup_path: Option<PathBuf>,
    pub max_sessions: usize,
    pub hello_timeout: Duration,
    pub chunk_size: usize,
    /// Largest inbound message accepted before the session is dropped.
    pub max_message_size: usize,
    pub writable_running: bool,
    pub schema_search_paths: Vec<PathBuf>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            socket_path: PathBuf::from(DEFAULT_SOCKET_PATH),
            startup_path: Some(PathBuf::from(DEFAULT_STARTUP_PATH)),
            max_sessions: DEFAULT_MAX_SESSIONS,
            hello_timeout: DEFAULT_HELLO_TIMEOUT,
            chunk_size: DEFAULT_CHUNK_SIZE,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            writable_running: true,
            schema_search_paths: Vec::new(),
        }
    }
}

impl ServerConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_sessions == 0 {
            return Err(ConfigError::NoSessions);
        }
        if self.chunk_size == 0 {
            return Err(ConfigError::NoChunkSize);
        }
        if self.hello_timeout.is_zero() {
            return Err(ConfigError::NoHelloTimeout);
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientConfig {
    pub socket_path: PathBuf,
    pub ttl: Duration,
    pub hello_timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            socket_path: PathBuf::from(DEFAULT_SOCKET_PATH),
            ttl: DEFAULT_EXPECTATION_TTL,
            hello_timeout: DEFAULT_HELLO_TIMEOUT,
        }
    }
}

impl ClientConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.ttl.is_zero() {
            return Err(ConfigError::NoTtl);
        }
        if self.hello_timeout.is_zero() {
            return Err(ConfigError::NoHelloTimeout);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = ServerConfig::default();
        assert_eq!(config.socket_path, PathBuf::from("/var/run/netconfd.sock"));
        assert_eq!(config.max_sessions, 16);
        assert_eq!(config.hello_timeout, Duration::from_secs(30));
        assert_eq!(config.chunk_size, 4096);
        assert_eq!(config.validate(), Ok(()));
        assert_eq!(ClientConfig::default().ttl, Duration::from_secs(8));
    }

    #[test]
    #[should_panic(expected = "max sessions must be at least 1")]
    fn zero_sessions() {
        let config = ServerConfig {
            max_sessions: 0,
            ..Default::default()
        };
        config.validate().unwrap();
    }

    #[test]
    fn zero_chunk_size_and_ttl() {
        let config = ServerConfig {
            chunk_size: 0,
            ..Default::default()
        };
        assert_eq!(config.validate(), Err(ConfigError::NoChunkSize));

        let client = ClientConfig {
            ttl: Duration::ZERO,
            ..Default::default()
        };
        assert_eq!(client.validate(), Err(ConfigError::NoTtl));
    }
}
