//! Daemon error types.
//!
//! # Error Hierarchy
//!
//! - [`DaemonError`]: startup, listener and per-connection failures
//!
//! Per-connection errors never stop the daemon; they end that connection
//! only. Startup errors (bind, configuration, files) are fatal.

use std::io;

use rbus_core::address::AddressError;
use rbus_core::auth::AuthError;
use rbus_core::config::ConfigError;
use rbus_core::wire::WireError;
use thiserror::Error;

/// Errors raised by the daemon.
#[derive(Debug, Error)]
pub enum DaemonError {
    /// Listener or file I/O failed.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The listen address is invalid.
    #[error("invalid listen address: {0}")]
    Address(#[from] AddressError),

    /// Configuration could not be loaded or is invalid.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// A client failed to authenticate.
    #[error("authentication failed: {0}")]
    Auth(#[from] AuthError),

    /// A client sent a malformed message.
    #[error("wire error: {0}")]
    Wire(#[from] WireError),

    /// The address uses a transport this platform cannot serve.
    #[error("unsupported transport: {reason}")]
    Unsupported {
        /// What is missing.
        reason: String,
    },
}

impl DaemonError {
    /// Creates an unsupported transport error.
    #[must_use]
    pub fn unsupported(reason: impl Into<String>) -> Self {
        Self::Unsupported {
            reason: reason.into(),
        }
    }

    /// Wraps an I/O error with the path or operation it concerns.
    #[must_use]
    pub fn io_context(e: &io::Error, context: impl std::fmt::Display) -> Self {
        Self::Io(io::Error::new(e.kind(), format!("{context}: {e}")))
    }
}

/// Result type for daemon operations.
pub type DaemonResult<T> = Result<T, DaemonError>;
