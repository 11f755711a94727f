//! Connection-level error type.
//!
//! [`BusError`] is what callers of the connection engine see. It wraps the
//! lower layer errors (codec, handshake, addressing) and adds the outcomes
//! that only exist once messages are in flight: disconnects, reply
//! timeouts and Error replies from the remote side.
//!
//! # Error Classification
//!
//! - **Fatal**: the connection is unusable afterwards (transport, codec,
//!   handshake failures, disconnect)
//! - **Recoverable**: the call failed but the connection is still healthy
//!   (timeouts, Error replies, rejected arguments)

use std::io;

use thiserror::Error;

use crate::address::AddressError;
use crate::auth::AuthError;
use crate::match_rule::MatchRuleError;
use crate::wire::WireError;

/// Errors returned by the connection engine.
#[derive(Debug, Error)]
pub enum BusError {
    /// Encoding or decoding a message failed.
    #[error("wire error: {0}")]
    Wire(#[from] WireError),

    /// The SASL handshake did not complete.
    #[error("authentication failed: {0}")]
    Auth(#[from] AuthError),

    /// The bus address could not be parsed or used.
    #[error("invalid bus address: {0}")]
    Address(#[from] AddressError),

    /// A match rule could not be parsed.
    #[error("invalid match rule: {0}")]
    MatchRule(#[from] MatchRuleError),

    /// Transport I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The connection has been closed.
    #[error("connection closed")]
    Disconnected,

    /// No reply arrived within the timeout.
    #[error("no reply within {timeout_ms} ms")]
    NoReply {
        /// Timeout that elapsed, in milliseconds.
        timeout_ms: u64,
    },

    /// The remote side answered with an Error message.
    #[error("{name}: {message}")]
    MethodError {
        /// Error name carried in the reply header.
        name: String,
        /// First string argument of the reply, if any.
        message: String,
    },

    /// A message could not be built or is missing required fields.
    #[error("invalid message: {reason}")]
    InvalidMessage {
        /// What is wrong with the message.
        reason: String,
    },

    /// An object could not be exported.
    #[error("cannot export object: {reason}")]
    Export {
        /// Why the export was refused.
        reason: String,
    },
}

impl BusError {
    /// Creates an invalid message error.
    #[must_use]
    pub fn invalid_message(reason: impl Into<String>) -> Self {
        Self::InvalidMessage {
            reason: reason.into(),
        }
    }

    /// Creates a method error from an error name and text.
    #[must_use]
    pub fn method_error(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::MethodError {
            name: name.into(),
            message: message.into(),
        }
    }

    /// Returns the remote error name if this is an Error reply.
    #[must_use]
    pub fn error_name(&self) -> Option<&str> {
        match self {
            Self::MethodError { name, .. } => Some(name),
            _ => None,
        }
    }

    /// Returns `true` if the connection cannot be used after this error.
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Wire(_) | Self::Auth(_) | Self::Io(_) | Self::Disconnected
        )
    }

    /// Returns `true` if the failed operation may be retried on the same
    /// connection.
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::NoReply { .. } | Self::MethodError { .. } | Self::InvalidMessage { .. }
        )
    }
}

/// Result type for connection operations.
pub type BusResult<T> = Result<T, BusError>;
