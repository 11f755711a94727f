//! Type signatures.
//!
//! A signature is a string of type codes. Basic types are single characters;
//! containers nest: `a` prefixes an element type, `(...)` encloses struct
//! fields and `{kv}` is a dictionary entry, legal only as an array element
//! and only with a basic key type.

use std::fmt;
use std::str::FromStr;

use super::error::WireError;
use super::{MAX_CONTAINER_DEPTH, MAX_SIGNATURE_LENGTH};

/// A single complete type.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Type {
    /// `y`: unsigned 8-bit integer.
    Byte,
    /// `b`: boolean, encoded as a 32-bit 0 or 1.
    Boolean,
    /// `n`: signed 16-bit integer.
    Int16,
    /// `q`: unsigned 16-bit integer.
    UInt16,
    /// `i`: signed 32-bit integer.
    Int32,
    /// `u`: unsigned 32-bit integer.
    UInt32,
    /// `x`: signed 64-bit integer.
    Int64,
    /// `t`: unsigned 64-bit integer.
    UInt64,
    /// `d`: IEEE 754 double.
    Double,
    /// `s`: UTF-8 string.
    String,
    /// `o`: object path.
    ObjectPath,
    /// `g`: signature.
    Signature,
    /// `v`: value carrying its own signature.
    Variant,
    /// `a`: homogeneous array.
    Array(Box<Type>),
    /// `(...)`: struct of one or more fields.
    Struct(Vec<Type>),
    /// `{kv}`: dictionary entry.
    DictEntry(Box<Type>, Box<Type>),
}

impl Type {
    /// Alignment boundary in bytes.
    #[must_use]
    pub const fn alignment(&self) -> usize {
        match self {
            Self::Byte | Self::Signature | Self::Variant => 1,
            Self::Int16 | Self::UInt16 => 2,
            Self::Boolean
            | Self::Int32
            | Self::UInt32
            | Self::String
            | Self::ObjectPath
            | Self::Array(_) => 4,
            Self::Int64 | Self::UInt64 | Self::Double | Self::Struct(_) | Self::DictEntry(..) => 8,
        }
    }

    /// Returns `true` for types that may be dictionary keys.
    #[must_use]
    pub const fn is_basic(&self) -> bool {
        !matches!(
            self,
            Self::Variant | Self::Array(_) | Self::Struct(_) | Self::DictEntry(..)
        )
    }

    /// Parses exactly one complete type.
    pub fn parse_single(signature: &str) -> Result<Self, WireError> {
        let types = parse_types(signature)?;
        match <[Self; 1]>::try_from(types) {
            Ok([single]) => Ok(single),
            Err(_) => Err(WireError::invalid_signature(
                signature,
                "expected exactly one complete type",
            )),
        }
    }

    fn write_code(&self, out: &mut String) {
        match self {
            Self::Byte => out.push('y'),
            Self::Boolean => out.push('b'),
            Self::Int16 => out.push('n'),
            Self::UInt16 => out.push('q'),
            Self::Int32 => out.push('i'),
            Self::UInt32 => out.push('u'),
            Self::Int64 => out.push('x'),
            Self::UInt64 => out.push('t'),
            Self::Double => out.push('d'),
            Self::String => out.push('s'),
            Self::ObjectPath => out.push('o'),
            Self::Signature => out.push('g'),
            Self::Variant => out.push('v'),
            Self::Array(element) => {
                out.push('a');
                element.write_code(out);
            },
            Self::Struct(fields) => {
                out.push('(');
                for field in fields {
                    field.write_code(out);
                }
                out.push(')');
            },
            Self::DictEntry(key, value) => {
                out.push('{');
                key.write_code(out);
                value.write_code(out);
                out.push('}');
            },
        }
    }
}

impl fmt::Display for Type {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut out = String::new();
        self.write_code(&mut out);
        f.write_str(&out)
    }
}

/// A validated signature: zero or more complete types.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct Signature {
    text: String,
    types: Vec<Type>,
}

impl Signature {
    /// Parses and validates a signature string.
    pub fn new(text: impl Into<String>) -> Result<Self, WireError> {
        let text = text.into();
        let types = parse_types(&text)?;
        Ok(Self { text, types })
    }

    /// The empty signature.
    #[must_use]
    pub fn empty() -> Self {
        Self::default()
    }

    /// Builds a signature from a list of types.
    pub fn from_types(types: &[Type]) -> Result<Self, WireError> {
        let mut text = String::new();
        for ty in types {
            ty.write_code(&mut text);
        }
        // Re-parse so hand-built trees (empty structs, bad keys) are rejected.
        Self::new(text)
    }

    /// The signature text.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.text
    }

    /// The complete types, in order.
    #[must_use]
    pub fn types(&self) -> &[Type] {
        &self.types
    }

    /// Returns `true` for the empty signature.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.text.is_empty()
    }
}

impl fmt::Display for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.text)
    }
}

impl FromStr for Signature {
    type Err = WireError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl TryFrom<&str> for Signature {
    type Error = WireError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

fn parse_types(signature: &str) -> Result<Vec<Type>, WireError> {
    if signature.len() > MAX_SIGNATURE_LENGTH {
        return Err(WireError::invalid_signature(signature, "signature too long"));
    }
    let mut parser = Parser {
        signature,
        bytes: signature.as_bytes(),
        pos: 0,
        array_depth: 0,
        struct_depth: 0,
    };
    let mut types = Vec::new();
    while parser.pos < parser.bytes.len() {
        types.push(parser.parse_type()?);
    }
    Ok(types)
}

struct Parser<'a> {
    signature: &'a str,
    bytes: &'a [u8],
    pos: usize,
    array_depth: usize,
    struct_depth: usize,
}

impl Parser<'_> {
    fn error(&self, reason: impl Into<String>) -> WireError {
        WireError::invalid_signature(self.signature, reason)
    }

    fn next(&mut self) -> Result<u8, WireError> {
        let byte = self
            .bytes
            .get(self.pos)
            .copied()
            .ok_or_else(|| self.error("unexpected end of signature"))?;
        self.pos += 1;
        Ok(byte)
    }

    fn peek(&self) -> Option<u8> {
        self.bytes.get(self.pos).copied()
    }

    fn parse_type(&mut self) -> Result<Type, WireError> {
        let code = self.next()?;
        let ty = match code {
            b'y' => Type::Byte,
            b'b' => Type::Boolean,
            b'n' => Type::Int16,
            b'q' => Type::UInt16,
            b'i' => Type::Int32,
            b'u' => Type::UInt32,
            b'x' => Type::Int64,
            b't' => Type::UInt64,
            b'd' => Type::Double,
            b's' => Type::String,
            b'o' => Type::ObjectPath,
            b'g' => Type::Signature,
            b'v' => Type::Variant,
            b'a' => {
                self.array_depth += 1;
                if self.array_depth > MAX_CONTAINER_DEPTH {
                    return Err(self.error("arrays nested too deeply"));
                }
                let element = if self.peek() == Some(b'{') {
                    self.pos += 1;
                    self.parse_dict_entry()?
                } else {
                    self.parse_type()?
                };
                self.array_depth -= 1;
                Type::Array(Box::new(element))
            },
            b'(' => {
                self.struct_depth += 1;
                if self.struct_depth > MAX_CONTAINER_DEPTH {
                    return Err(self.error("structs nested too deeply"));
                }
                let mut fields = Vec::new();
                loop {
                    match self.peek() {
                        Some(b')') => {
                            self.pos += 1;
                            break;
                        },
                        Some(_) => fields.push(self.parse_type()?),
                        None => return Err(self.error("unterminated struct")),
                    }
                }
                if fields.is_empty() {
                    return Err(self.error("empty struct"));
                }
                self.struct_depth -= 1;
                Type::Struct(fields)
            },
            b'{' => return Err(self.error("dict entry outside of an array")),
            other => {
                return Err(self.error(format!("unexpected type code {:?}", char::from(other))));
            },
        };
        Ok(ty)
    }

    fn parse_dict_entry(&mut self) -> Result<Type, WireError> {
        self.struct_depth += 1;
        if self.struct_depth > MAX_CONTAINER_DEPTH {
            return Err(self.error("structs nested too deeply"));
        }
        let key = self.parse_type()?;
        if !key.is_basic() {
            return Err(self.error("dict entry key must be a basic type"));
        }
        let value = self.parse_type()?;
        if self.next()? != b'}' {
            return Err(self.error("dict entry must have exactly two types"));
        }
        self.struct_depth -= 1;
        Ok(Type::DictEntry(Box::new(key), Box::new(value)))
    }
}
