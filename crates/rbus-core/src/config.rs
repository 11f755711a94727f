//! Configuration file parsing.
//!
//! Both the daemon and clients read the same TOML document. Every key has a
//! default, so an empty file is a valid configuration:
//!
//! ```toml
//! [daemon]
//! listen = "unix:path=/run/user/1000/rbus/socket"
//! pid_file = "/run/user/1000/rbus/rbus.pid"
//! auth_mechanisms = ["EXTERNAL"]
//! max_connections = 256
//! max_queued_messages = 4096
//!
//! [connection]
//! worker_threads = 4
//! reply_timeout_ms = 20000
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::auth::Mechanisms;

/// Default number of worker tasks per connection.
pub const DEFAULT_WORKER_THREADS: usize = 4;

/// Default time a call waits for its reply.
pub const DEFAULT_REPLY_TIMEOUT_MS: u64 = 20_000;

/// Default initial capacity of the pending-call table.
pub const DEFAULT_PENDING_CAPACITY: usize = 10;

/// Default initial capacity of outbound queues.
pub const DEFAULT_QUEUE_CAPACITY: usize = 16;

/// Default limit on concurrent daemon connections.
pub const DEFAULT_MAX_CONNECTIONS: usize = 256;

/// Default limit on messages queued for one daemon peer.
pub const DEFAULT_MAX_QUEUED_MESSAGES: usize = 4096;

/// Default time allowed for the SASL handshake.
pub const DEFAULT_HANDSHAKE_TIMEOUT_MS: u64 = 10_000;

/// Default permissions of a daemon Unix socket.
pub const DEFAULT_SOCKET_MODE: u32 = 0o600;

/// Root configuration document.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BusConfig {
    /// Daemon settings.
    #[serde(default)]
    pub daemon: DaemonConfig,

    /// Client connection settings.
    #[serde(default)]
    pub connection: ConnectionConfig,
}

impl BusConfig {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, is not valid TOML or
    /// fails validation.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(ConfigError::Io)?;
        Self::from_toml(&content)
    }

    /// Parse configuration from a TOML string.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Serialize configuration to TOML.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Check cross-field constraints.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.daemon.validate()?;
        self.connection.validate()
    }
}

/// Daemon settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DaemonConfig {
    /// Address to listen on; generated when absent.
    pub listen: Option<String>,

    /// File to write the daemon PID to.
    pub pid_file: Option<PathBuf>,

    /// File to write the bus address to.
    pub address_file: Option<PathBuf>,

    /// Mechanisms offered to clients; per-transport default when absent.
    pub auth_mechanisms: Option<Vec<String>>,

    /// Concurrent connection limit.
    pub max_connections: usize,

    /// Messages queued for one peer before it is disconnected.
    pub max_queued_messages: usize,

    /// Time allowed for a client to authenticate.
    pub handshake_timeout_ms: u64,

    /// Permissions applied to a Unix socket after binding.
    pub socket_mode: u32,

    /// Directory of the cookie keyring.
    pub keyring_dir: Option<PathBuf>,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            listen: None,
            pid_file: None,
            address_file: None,
            auth_mechanisms: None,
            max_connections: DEFAULT_MAX_CONNECTIONS,
            max_queued_messages: DEFAULT_MAX_QUEUED_MESSAGES,
            handshake_timeout_ms: DEFAULT_HANDSHAKE_TIMEOUT_MS,
            socket_mode: DEFAULT_SOCKET_MODE,
            keyring_dir: None,
        }
    }
}

impl DaemonConfig {
    /// Handshake timeout as a duration.
    #[must_use]
    pub const fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    /// Configured mechanisms, or `None` for the transport default.
    pub fn mechanisms(&self) -> Result<Option<Mechanisms>, ConfigError> {
        self.auth_mechanisms
            .as_deref()
            .map(parse_mechanisms)
            .transpose()
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.max_connections == 0 {
            return Err(ConfigError::Validation(
                "daemon.max_connections must be at least 1".to_string(),
            ));
        }
        if self.max_queued_messages == 0 {
            return Err(ConfigError::Validation(
                "daemon.max_queued_messages must be at least 1".to_string(),
            ));
        }
        if self.socket_mode > 0o777 {
            return Err(ConfigError::Validation(format!(
                "daemon.socket_mode {:#o} is not a permission mode",
                self.socket_mode
            )));
        }
        self.mechanisms()?;
        Ok(())
    }
}

/// Client connection settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ConnectionConfig {
    /// Worker tasks running handlers and callbacks.
    pub worker_threads: usize,

    /// Default reply timeout for `call`.
    pub reply_timeout_ms: u64,

    /// Initial capacity of the pending-call table.
    pub pending_capacity: usize,

    /// Initial capacity of the outbound queue.
    pub queue_capacity: usize,

    /// Mechanisms the client is willing to use.
    pub auth_mechanisms: Vec<String>,

    /// Directory of the cookie keyring.
    pub keyring_dir: Option<PathBuf>,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            worker_threads: DEFAULT_WORKER_THREADS,
            reply_timeout_ms: DEFAULT_REPLY_TIMEOUT_MS,
            pending_capacity: DEFAULT_PENDING_CAPACITY,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            auth_mechanisms: Mechanisms::ALL.names().map(str::to_string).collect(),
            keyring_dir: None,
        }
    }
}

impl ConnectionConfig {
    /// Set the number of worker tasks.
    #[must_use]
    pub const fn with_worker_threads(mut self, workers: usize) -> Self {
        self.worker_threads = workers;
        self
    }

    /// Set the default reply timeout.
    #[must_use]
    pub const fn with_reply_timeout(mut self, timeout: Duration) -> Self {
        // Timeouts beyond u64 milliseconds are not meaningful.
        #[allow(clippy::cast_possible_truncation)]
        let millis = timeout.as_millis() as u64;
        self.reply_timeout_ms = millis;
        self
    }

    /// Restrict the authentication mechanisms.
    #[must_use]
    pub fn with_mechanisms(mut self, mechanisms: Mechanisms) -> Self {
        self.auth_mechanisms = mechanisms.names().map(str::to_string).collect();
        self
    }

    /// Set the keyring directory.
    #[must_use]
    pub fn with_keyring_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.keyring_dir = Some(dir.into());
        self
    }

    /// Default reply timeout as a duration.
    #[must_use]
    pub const fn reply_timeout(&self) -> Duration {
        Duration::from_millis(self.reply_timeout_ms)
    }

    /// Allowed mechanisms.
    pub fn mechanisms(&self) -> Result<Mechanisms, ConfigError> {
        parse_mechanisms(&self.auth_mechanisms)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.worker_threads == 0 {
            return Err(ConfigError::Validation(
                "connection.worker_threads must be at least 1".to_string(),
            ));
        }
        if self.pending_capacity == 0 || self.queue_capacity == 0 {
            return Err(ConfigError::Validation(
                "connection buffer capacities must be at least 1".to_string(),
            ));
        }
        if self.mechanisms()?.is_empty() {
            return Err(ConfigError::Validation(
                "connection.auth_mechanisms must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}

fn parse_mechanisms(names: &[String]) -> Result<Mechanisms, ConfigError> {
    Mechanisms::from_names(names.iter().map(String::as_str))
        .map_err(|e| ConfigError::Validation(e.to_string()))
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// I/O error reading configuration file.
    #[error("failed to read configuration file: {0}")]
    Io(#[from] std::io::Error),

    /// TOML parsing error.
    #[error("failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),

    /// TOML serialization error.
    #[error("failed to serialize configuration: {0}")]
    Serialize(#[from] toml::ser::Error),

    /// Validation error.
    #[error("configuration validation failed: {0}")]
    Validation(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = BusConfig::from_toml("").unwrap();
        assert_eq!(config, BusConfig::default());
        assert_eq!(config.connection.worker_threads, DEFAULT_WORKER_THREADS);
        assert_eq!(
            config.connection.reply_timeout(),
            Duration::from_millis(DEFAULT_REPLY_TIMEOUT_MS)
        );
        assert_eq!(config.connection.mechanisms().unwrap(), Mechanisms::ALL);
        assert_eq!(config.daemon.mechanisms().unwrap(), None);
    }

    #[test]
    fn test_parse_full_config() {
        let toml = r#"
            [daemon]
            listen = "unix:path=/tmp/rbus-test"
            pid_file = "/tmp/rbus.pid"
            auth_mechanisms = ["EXTERNAL", "ANONYMOUS"]
            max_connections = 8
            max_queued_messages = 32
            socket_mode = 0o660

            [connection]
            worker_threads = 2
            reply_timeout_ms = 500
        "#;
        let config = BusConfig::from_toml(toml).unwrap();
        assert_eq!(config.daemon.listen.as_deref(), Some("unix:path=/tmp/rbus-test"));
        assert_eq!(config.daemon.socket_mode, 0o660);
        assert_eq!(config.daemon.max_queued_messages, 32);
        assert_eq!(
            config.daemon.mechanisms().unwrap(),
            Some(Mechanisms::EXTERNAL | Mechanisms::ANONYMOUS)
        );
        assert_eq!(config.connection.reply_timeout(), Duration::from_millis(500));
    }

    #[test]
    fn test_validation_failures() {
        assert!(matches!(
            BusConfig::from_toml("[connection]\nworker_threads = 0"),
            Err(ConfigError::Validation(_))
        ));
        assert!(matches!(
            BusConfig::from_toml("[daemon]\nauth_mechanisms = [\"KERBEROS_V4\"]"),
            Err(ConfigError::Validation(_))
        ));
        assert!(matches!(
            BusConfig::from_toml("[daemon]\nmax_queued_messages = 0"),
            Err(ConfigError::Validation(_))
        ));
        assert!(matches!(
            BusConfig::from_toml("[daemon]\nbogus = 1"),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn test_round_trip_through_toml() {
        let mut config = BusConfig::default();
        config.daemon.listen = Some("tcp:host=localhost,port=0".to_string());
        let text = config.to_toml().unwrap();
        assert_eq!(BusConfig::from_toml(&text).unwrap(), config);
    }

    #[test]
    fn test_from_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("rbus.toml");
        std::fs::write(&path, "[connection]\nqueue_capacity = 4\n").unwrap();
        let config = BusConfig::from_file(&path).unwrap();
        assert_eq!(config.connection.queue_capacity, 4);
    }
}
