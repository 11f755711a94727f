//! SASL authentication handshake.
//!
//! Before any binary message is exchanged, client and server run a
//! line-oriented SASL dialogue over the raw socket:
//!
//! ```text
//! client                                   server
//!   | \0                                      |
//!   | AUTH                                 -> |
//!   | <-       REJECTED EXTERNAL DBUS_COOKIE_SHA1 ANONYMOUS
//!   | AUTH EXTERNAL 31303030               -> |
//!   | <-                        OK <server guid>
//!   | BEGIN                                -> |
//!   | ... binary messages ...                 |
//! ```
//!
//! The state machines in [`server`] and [`client`] are pure: they consume a
//! parsed [`Command`] and produce the reply to send. The async drivers in
//! [`handshake`] run them over a socket.
//!
//! # Security Considerations
//!
//! - The server enforces a line length limit ([`MAX_LINE_LENGTH`]) and a
//!   rejection budget ([`MAX_AUTH_ATTEMPTS`]) while the peer is still
//!   unauthenticated.
//! - EXTERNAL compares the asserted uid with the kernel-reported peer
//!   credential in constant time, and is refused outright on transports
//!   that report none.
//! - Handshake steps that read or write the cookie keyring run on the
//!   blocking thread pool.
//! - Cookie contexts received from the server are validated before they are
//!   used as keyring file names.

mod client;
mod command;
mod cookie;
mod credentials;
mod handshake;
mod server;

use std::fmt;
use std::io;
use std::ops::{BitAnd, BitOr};

pub use client::{ClientAuth, ClientState};
pub use command::Command;
pub use cookie::{
    Cookie, Keyring, COOKIE_CONTEXT, EXPIRE_KEYS_TIMEOUT_SECS, LOCK_TIMEOUT, MAX_TIME_TRAVEL_SECS,
    NEW_KEY_TIMEOUT_SECS,
};
pub use credentials::PeerCredentials;
pub use handshake::{client_handshake, server_handshake, AuthOutcome};
pub use server::{ServerAuth, ServerState};
use thiserror::Error;

/// Maximum length of a single SASL line, including the terminator.
pub const MAX_LINE_LENGTH: usize = 16 * 1024;

/// Rejections after which the server gives up on a client.
pub const MAX_AUTH_ATTEMPTS: usize = 10;

/// A SASL mechanism.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Mechanism {
    /// Identity asserted by the transport (Unix credentials).
    External,
    /// Shared secret read from the user's cookie keyring.
    CookieSha1,
    /// No identity at all.
    Anonymous,
}

impl Mechanism {
    /// Mechanisms in the order a client tries them.
    pub const PREFERENCE: [Self; 3] = [Self::External, Self::CookieSha1, Self::Anonymous];

    /// SASL name.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::External => "EXTERNAL",
            Self::CookieSha1 => "DBUS_COOKIE_SHA1",
            Self::Anonymous => "ANONYMOUS",
        }
    }

    /// Parses a SASL name.
    #[must_use]
    pub fn from_name(name: &str) -> Option<Self> {
        Self::PREFERENCE.into_iter().find(|m| m.name() == name)
    }

    const fn bit(self) -> u8 {
        match self {
            Self::External => 1,
            Self::CookieSha1 => 2,
            Self::Anonymous => 4,
        }
    }
}

impl fmt::Display for Mechanism {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A set of mechanisms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Mechanisms(u8);

impl Mechanisms {
    /// The empty set.
    pub const NONE: Self = Self(0);
    /// `EXTERNAL` only.
    pub const EXTERNAL: Self = Self(1);
    /// `DBUS_COOKIE_SHA1` only.
    pub const COOKIE_SHA1: Self = Self(2);
    /// `ANONYMOUS` only.
    pub const ANONYMOUS: Self = Self(4);
    /// Every supported mechanism.
    pub const ALL: Self = Self(7);

    /// Returns `true` if `mechanism` is in the set.
    #[must_use]
    pub const fn contains(self, mechanism: Mechanism) -> bool {
        self.0 & mechanism.bit() != 0
    }

    /// Adds a mechanism.
    pub fn insert(&mut self, mechanism: Mechanism) {
        self.0 |= mechanism.bit();
    }

    /// Members of either set.
    #[must_use]
    pub const fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    /// The set without the members of `other`.
    #[must_use]
    pub const fn difference(self, other: Self) -> Self {
        Self(self.0 & !other.0)
    }

    /// Returns `true` for the empty set.
    #[must_use]
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Members in preference order.
    pub fn iter(self) -> impl Iterator<Item = Mechanism> {
        Mechanism::PREFERENCE
            .into_iter()
            .filter(move |m| self.contains(*m))
    }

    /// SASL names of the members, in preference order.
    pub fn names(self) -> impl Iterator<Item = &'static str> {
        self.iter().map(Mechanism::name)
    }

    /// The most preferred member.
    #[must_use]
    pub fn first(self) -> Option<Mechanism> {
        self.iter().next()
    }

    /// Builds a set from SASL names, rejecting unknown ones.
    pub fn from_names<'a>(names: impl IntoIterator<Item = &'a str>) -> Result<Self, AuthError> {
        let mut set = Self::NONE;
        for name in names {
            let mechanism = Mechanism::from_name(name)
                .ok_or_else(|| AuthError::UnknownMechanism(name.to_string()))?;
            set.insert(mechanism);
        }
        Ok(set)
    }

    /// Builds a set from SASL names, skipping unknown ones.
    #[must_use]
    pub fn from_names_lossy<'a>(names: impl IntoIterator<Item = &'a str>) -> Self {
        let mut set = Self::NONE;
        for mechanism in names.into_iter().filter_map(Mechanism::from_name) {
            set.insert(mechanism);
        }
        set
    }
}

impl From<Mechanism> for Mechanisms {
    fn from(mechanism: Mechanism) -> Self {
        Self(mechanism.bit())
    }
}

impl BitOr for Mechanisms {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        self.union(rhs)
    }
}

impl BitAnd for Mechanisms {
    type Output = Self;

    fn bitand(self, rhs: Self) -> Self {
        Self(self.0 & rhs.0)
    }
}

/// Errors raised during the handshake.
#[derive(Debug, Error)]
pub enum AuthError {
    /// A line is not a valid SASL command.
    #[error("invalid SASL command {0:?}")]
    InvalidCommand(String),

    /// Every mutually acceptable mechanism was rejected.
    #[error("authentication rejected")]
    Rejected,

    /// The peer sent a command that is illegal in the current state.
    #[error("SASL protocol violation: {0}")]
    Protocol(String),

    /// The first byte from the client was not NUL.
    #[error("expected NUL byte before authentication")]
    MissingNul,

    /// A line exceeded [`MAX_LINE_LENGTH`].
    #[error("SASL line exceeds {max} bytes")]
    LineTooLong {
        /// Maximum accepted length.
        max: usize,
    },

    /// A mechanism name is not supported.
    #[error("unknown mechanism {0:?}")]
    UnknownMechanism(String),

    /// The cookie keyring could not be read or written.
    #[error("cookie keyring: {0}")]
    Cookie(String),

    /// The peer closed the connection mid-handshake.
    #[error("connection closed during authentication")]
    ConnectionClosed,

    /// The handshake did not finish in time.
    #[error("authentication timed out after {timeout_ms} ms")]
    Timeout {
        /// Timeout that elapsed, in milliseconds.
        timeout_ms: u64,
    },

    /// Transport failure.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl AuthError {
    /// Creates a keyring error.
    #[must_use]
    pub fn cookie(reason: impl Into<String>) -> Self {
        Self::Cookie(reason.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mechanism_set_operations() {
        let set = Mechanisms::EXTERNAL | Mechanisms::ANONYMOUS;
        assert!(set.contains(Mechanism::External));
        assert!(!set.contains(Mechanism::CookieSha1));
        assert_eq!(set.first(), Some(Mechanism::External));
        assert_eq!(
            set.difference(Mechanisms::EXTERNAL).first(),
            Some(Mechanism::Anonymous)
        );
        assert_eq!(
            Mechanisms::ALL.names().collect::<Vec<_>>(),
            vec!["EXTERNAL", "DBUS_COOKIE_SHA1", "ANONYMOUS"]
        );
    }

    #[test]
    fn test_from_names() {
        assert_eq!(
            Mechanisms::from_names(["ANONYMOUS", "EXTERNAL"]).unwrap(),
            Mechanisms::EXTERNAL | Mechanisms::ANONYMOUS
        );
        assert!(matches!(
            Mechanisms::from_names(["GSSAPI"]),
            Err(AuthError::UnknownMechanism(_))
        ));
        assert_eq!(
            Mechanisms::from_names_lossy(["GSSAPI", "ANONYMOUS"]),
            Mechanisms::ANONYMOUS
        );
    }
}
