//! Codec error types.

use std::io;

use thiserror::Error;

/// Errors raised while encoding or decoding messages.
///
/// Every decode error is fatal for the stream it came from: once framing is
/// lost there is no way to find the start of the next message.
#[derive(Debug, Error)]
pub enum WireError {
    /// The first header byte is neither `l` nor `B`.
    #[error("invalid endian marker {0:#04x}")]
    InvalidEndian(u8),

    /// The sender speaks a newer protocol version.
    #[error("unsupported protocol version {version}")]
    UnsupportedVersion {
        /// Version byte found in the header.
        version: u8,
    },

    /// The message type byte is not one of the four known types.
    #[error("unknown message type {0}")]
    UnknownMessageType(u8),

    /// Declared message length exceeds the limit.
    #[error("message too large: {size} bytes exceeds maximum {max} bytes")]
    MessageTooLarge {
        /// Declared size.
        size: usize,
        /// Maximum allowed size.
        max: usize,
    },

    /// Declared array length exceeds the limit.
    #[error("array too long: {len} bytes exceeds maximum {max} bytes")]
    ArrayTooLong {
        /// Declared array byte length.
        len: usize,
        /// Maximum allowed length.
        max: usize,
    },

    /// A message decodes into more values than the decoder allows.
    #[error("message holds more than {max} values")]
    TooManyValues {
        /// Values allowed per message part.
        max: usize,
    },

    /// A signature string is malformed.
    #[error("invalid signature {signature:?}: {reason}")]
    InvalidSignature {
        /// The offending signature.
        signature: String,
        /// What is wrong with it.
        reason: String,
    },

    /// A value does not match the type it is encoded as.
    #[error("type mismatch: expected {expected}, found {found}")]
    TypeMismatch {
        /// Signature of the expected type.
        expected: String,
        /// Signature of the supplied value.
        found: String,
    },

    /// The buffer ended before the value did.
    #[error("truncated message: needed {needed} bytes at offset {offset}")]
    Truncated {
        /// Offset at which reading failed.
        offset: usize,
        /// Bytes required from that offset.
        needed: usize,
    },

    /// A padding byte was not zero.
    #[error("non-zero padding at offset {offset}")]
    NonZeroPadding {
        /// Offset of the offending byte.
        offset: usize,
    },

    /// A string value is not valid UTF-8 or lacks its terminating NUL.
    #[error("invalid string at offset {offset}")]
    InvalidString {
        /// Offset of the string's first byte.
        offset: usize,
    },

    /// A boolean was encoded as something other than 0 or 1.
    #[error("invalid boolean value {0}")]
    InvalidBoolean(u32),

    /// An object path does not follow the path grammar.
    #[error("invalid object path {0:?}")]
    InvalidObjectPath(String),

    /// The header is structurally invalid.
    #[error("invalid header: {reason}")]
    InvalidHeader {
        /// What is wrong with the header.
        reason: String,
    },

    /// A header field required for the message type is absent.
    #[error("missing required header field {0}")]
    MissingHeaderField(&'static str),

    /// Underlying transport error surfaced through the codec.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl WireError {
    /// Creates an invalid signature error.
    #[must_use]
    pub fn invalid_signature(signature: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidSignature {
            signature: signature.into(),
            reason: reason.into(),
        }
    }

    /// Creates an invalid header error.
    #[must_use]
    pub fn invalid_header(reason: impl Into<String>) -> Self {
        Self::InvalidHeader {
            reason: reason.into(),
        }
    }

    /// Returns `true` if the peer violated the protocol, as opposed to a
    /// transport failure.
    #[must_use]
    pub const fn is_protocol_violation(&self) -> bool {
        !matches!(self, Self::Io(_))
    }
}
