//! Bus addresses.
//!
//! An address names a transport and its parameters:
//! `unix:path=/run/rbus/socket,guid=0123...` or
//! `tcp:host=localhost,port=4711`. Several alternatives may be listed,
//! separated by `;`. Values may contain `%xx` escapes.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use rand::distributions::Alphanumeric;
use rand::{Rng, RngCore};
use thiserror::Error;

/// Length of a bus GUID in raw bytes (hex-encoded on the wire).
pub const GUID_BYTES: usize = 16;

/// Errors from parsing or interpreting a bus address.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum AddressError {
    /// The address string is empty.
    #[error("address is empty")]
    Empty,

    /// No `transport:` prefix.
    #[error("missing transport in address {0:?}")]
    MissingTransport(String),

    /// A parameter is not of the form `key=value`.
    #[error("malformed parameter {0:?}")]
    MalformedParameter(String),

    /// A `%` escape is truncated or not hex.
    #[error("invalid escape in {0:?}")]
    InvalidEscape(String),

    /// The transport is not supported.
    #[error("unsupported transport {0:?}")]
    UnsupportedTransport(String),

    /// A parameter required by the transport is missing.
    #[error("{transport} address requires {key}")]
    MissingParameter {
        /// Transport name.
        transport: &'static str,
        /// Missing key.
        key: &'static str,
    },

    /// The TCP port is not a number in range.
    #[error("invalid port {0:?}")]
    InvalidPort(String),
}

/// Where a transport connects or listens.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    /// Unix socket at a filesystem path.
    UnixPath(PathBuf),
    /// Unix socket in the Linux abstract namespace.
    UnixAbstract(String),
    /// TCP socket.
    Tcp {
        /// Host name or IP address.
        host: String,
        /// Port; 0 asks the listener to pick one.
        port: u16,
    },
}

/// A parsed bus address. Parameter order is preserved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusAddress {
    transport: String,
    params: Vec<(String, String)>,
}

impl BusAddress {
    /// Parses the first alternative of an address list.
    pub fn parse(address: &str) -> Result<Self, AddressError> {
        Self::parse_list(address)?
            .into_iter()
            .next()
            .ok_or(AddressError::Empty)
    }

    /// Parses every `;`-separated alternative.
    pub fn parse_list(addresses: &str) -> Result<Vec<Self>, AddressError> {
        let list: Vec<Self> = addresses
            .split(';')
            .filter(|part| !part.trim().is_empty())
            .map(Self::parse_one)
            .collect::<Result<_, _>>()?;
        if list.is_empty() {
            return Err(AddressError::Empty);
        }
        Ok(list)
    }

    fn parse_one(address: &str) -> Result<Self, AddressError> {
        let address = address.trim();
        let (transport, rest) = address
            .split_once(':')
            .filter(|(transport, _)| !transport.is_empty())
            .ok_or_else(|| AddressError::MissingTransport(address.to_string()))?;
        let mut params = Vec::new();
        for pair in rest.split(',').filter(|pair| !pair.is_empty()) {
            let (key, value) = pair
                .split_once('=')
                .filter(|(key, _)| !key.is_empty())
                .ok_or_else(|| AddressError::MalformedParameter(pair.to_string()))?;
            params.push((key.to_string(), unescape(value)?));
        }
        Ok(Self {
            transport: transport.to_string(),
            params,
        })
    }

    /// Address of a Unix socket at `path`.
    #[must_use]
    pub fn unix_path(path: impl AsRef<Path>) -> Self {
        Self {
            transport: "unix".to_string(),
            params: vec![(
                "path".to_string(),
                path.as_ref().to_string_lossy().into_owned(),
            )],
        }
    }

    /// Address of a TCP socket.
    #[must_use]
    pub fn tcp(host: impl Into<String>, port: u16) -> Self {
        Self {
            transport: "tcp".to_string(),
            params: vec![
                ("host".to_string(), host.into()),
                ("port".to_string(), port.to_string()),
            ],
        }
    }

    /// A fresh Unix socket address with a random name inside `dir`.
    #[must_use]
    pub fn dynamic_unix(dir: impl AsRef<Path>) -> Self {
        let suffix: String = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(10)
            .map(char::from)
            .collect();
        Self::unix_path(dir.as_ref().join(format!("rbus-{suffix}")))
    }

    /// A TCP address on localhost whose port is chosen when bound.
    #[must_use]
    pub fn dynamic_tcp() -> Self {
        Self::tcp("localhost", 0)
    }

    /// Transport name, e.g. `unix`.
    #[must_use]
    pub fn transport(&self) -> &str {
        &self.transport
    }

    /// Value of a parameter.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&str> {
        self.params
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Sets or replaces a parameter.
    #[must_use]
    pub fn with_param(mut self, key: &str, value: impl Into<String>) -> Self {
        let value = value.into();
        match self.params.iter_mut().find(|(k, _)| k == key) {
            Some(slot) => slot.1 = value,
            None => self.params.push((key.to_string(), value)),
        }
        self
    }

    /// GUID of the bus, if the address names one.
    #[must_use]
    pub fn guid(&self) -> Option<&str> {
        self.get("guid")
    }

    /// Adds a random GUID unless one is present.
    #[must_use]
    pub fn ensure_guid(self) -> Self {
        if self.guid().is_some() {
            self
        } else {
            self.with_param("guid", generate_guid())
        }
    }

    /// Interprets the transport parameters.
    pub fn endpoint(&self) -> Result<Endpoint, AddressError> {
        match self.transport.as_str() {
            "unix" => {
                if let Some(path) = self.get("path") {
                    Ok(Endpoint::UnixPath(PathBuf::from(path)))
                } else if let Some(name) = self.get("abstract") {
                    Ok(Endpoint::UnixAbstract(name.to_string()))
                } else {
                    Err(AddressError::MissingParameter {
                        transport: "unix",
                        key: "path",
                    })
                }
            },
            "tcp" => {
                let host = self.get("host").unwrap_or("localhost").to_string();
                let port = self.get("port").ok_or(AddressError::MissingParameter {
                    transport: "tcp",
                    key: "port",
                })?;
                let port = port
                    .parse::<u16>()
                    .map_err(|_| AddressError::InvalidPort(port.to_string()))?;
                Ok(Endpoint::Tcp { host, port })
            },
            other => Err(AddressError::UnsupportedTransport(other.to_string())),
        }
    }
}

impl fmt::Display for BusAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:", self.transport)?;
        for (i, (key, value)) in self.params.iter().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            write!(f, "{key}={}", escape(value))?;
        }
        Ok(())
    }
}

impl FromStr for BusAddress {
    type Err = AddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// Generates a bus GUID: 16 random bytes, hex-encoded.
#[must_use]
pub fn generate_guid() -> String {
    let mut bytes = [0u8; GUID_BYTES];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

const fn is_optionally_escaped(byte: u8) -> bool {
    byte.is_ascii_alphanumeric() || matches!(byte, b'-' | b'_' | b'/' | b'.' | b'\\' | b'*')
}

fn escape(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for byte in value.bytes() {
        if is_optionally_escaped(byte) {
            out.push(char::from(byte));
        } else {
            out.push_str(&format!("%{byte:02x}"));
        }
    }
    out
}

fn unescape(value: &str) -> Result<String, AddressError> {
    let bytes = value.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let decoded = value
                .get(i + 1..i + 3)
                .and_then(|hex| u8::from_str_radix(hex, 16).ok())
                .ok_or_else(|| AddressError::InvalidEscape(value.to_string()))?;
            out.push(decoded);
            i += 3;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8(out).map_err(|_| AddressError::InvalidEscape(value.to_string()))
}
