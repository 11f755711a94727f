//! Binary message format.
//!
//! A message on the wire is a fixed 12-byte header, a length-prefixed array
//! of header fields, padding to an 8-byte boundary and a body whose layout is
//! described by the message signature:
//!
//! ```text
//! offset 0   1      2     3        4            8        12
//!        +---+------+-----+--------+------------+--------+
//!        | e | type |flags|version | body length| serial |
//!        +---+------+-----+--------+------------+--------+
//!        | header fields a(yv), 8-aligned entries         |
//!        +------------------------------------------------+
//!        | zero padding to a multiple of 8                |
//!        +------------------------------------------------+
//!        | body (signature-driven)                        |
//!        +------------------------------------------------+
//! ```
//!
//! # Invariants
//!
//! - Every value is aligned to its natural boundary relative to the start of
//!   the message; padding bytes are zero.
//! - Array length prefixes never exceed [`MAX_ARRAY_LENGTH`] and whole
//!   messages never exceed [`MAX_MESSAGE_LENGTH`].
//! - Decoding a header or a body yields at most [`MAX_DECODED_VALUES`]
//!   values; `ay` is read as one packed [`Value::Bytes`].
//! - `decode(encode(m)) == m`, and re-encoding a decoded message yields the
//!   same bytes.
//!
//! # Security Considerations
//!
//! Lengths read from the wire are checked against the limits above BEFORE
//! any allocation, and container nesting is bounded, so hostile input cannot
//! exhaust memory or the stack.

mod codec;
mod error;
mod marshal;
mod message;
mod signature;
mod unmarshal;
mod value;

pub use codec::MessageCodec;
pub use error::WireError;
pub use message::{Endian, Flags, Message, MessageType};
pub use signature::{Signature, Type};
pub use value::{ObjectPath, Value};

/// Protocol version written into every header.
pub const PROTOCOL_VERSION: u8 = 1;

/// Maximum byte length of a single array (64 MiB).
pub const MAX_ARRAY_LENGTH: usize = 64 * 1024 * 1024;

/// Maximum length of a whole message (128 MiB).
pub const MAX_MESSAGE_LENGTH: usize = 128 * 1024 * 1024;

/// Maximum number of values decoded from a header or a body.
///
/// Each decoded value costs far more memory than its wire encoding, so the
/// byte limits alone do not bound the decoder's allocation.
pub const MAX_DECODED_VALUES: usize = 1 << 20;

/// Maximum length of a signature string.
pub const MAX_SIGNATURE_LENGTH: usize = 255;

/// Maximum nesting depth for arrays, and separately for structs.
pub const MAX_CONTAINER_DEPTH: usize = 32;

/// Length of the fixed header plus the header-field array length prefix.
///
/// This is the smallest prefix from which a frame's total length can be
/// computed.
pub const FIXED_HEADER_LENGTH: usize = 16;

/// Rounds `offset` up to the next multiple of `alignment`.
#[must_use]
pub(crate) const fn align_up(offset: usize, alignment: usize) -> usize {
    (offset + alignment - 1) & !(alignment - 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_align_up() {
        assert_eq!(align_up(0, 8), 0);
        assert_eq!(align_up(1, 8), 8);
        assert_eq!(align_up(12, 4), 12);
        assert_eq!(align_up(13, 2), 14);
        assert_eq!(align_up(17, 1), 17);
    }
}
