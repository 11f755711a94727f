//! Typed values carried in message bodies and header fields.

use std::fmt;

use super::error::WireError;
use super::signature::{Signature, Type};
use crate::names;

/// A validated object path such as `/org/example/Object`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectPath(String);

impl ObjectPath {
    /// Validates and wraps an object path.
    pub fn new(path: impl Into<String>) -> Result<Self, WireError> {
        let path = path.into();
        if names::is_valid_object_path(&path) {
            Ok(Self(path))
        } else {
            Err(WireError::InvalidObjectPath(path))
        }
    }

    /// The root path `/`.
    #[must_use]
    pub fn root() -> Self {
        Self("/".to_string())
    }

    /// The path as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns `true` if `self` equals `prefix` or lies below it.
    #[must_use]
    pub fn starts_with(&self, prefix: &Self) -> bool {
        if prefix.0 == "/" {
            return true;
        }
        self.0 == prefix.0
            || (self.0.starts_with(&prefix.0) && self.0.as_bytes().get(prefix.0.len()) == Some(&b'/'))
    }
}

impl fmt::Display for ObjectPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<&str> for ObjectPath {
    type Error = WireError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl AsRef<str> for ObjectPath {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// A typed value.
///
/// Arrays remember their element type so that empty arrays still have a
/// signature. Byte arrays are always held packed as [`Value::Bytes`].
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// `y`
    Byte(u8),
    /// `b`
    Boolean(bool),
    /// `n`
    Int16(i16),
    /// `q`
    UInt16(u16),
    /// `i`
    Int32(i32),
    /// `u`
    UInt32(u32),
    /// `x`
    Int64(i64),
    /// `t`
    UInt64(u64),
    /// `d`
    Double(f64),
    /// `s`
    String(String),
    /// `o`
    ObjectPath(ObjectPath),
    /// `g`
    Signature(Signature),
    /// `a`
    Array {
        /// Type of every element.
        element: Type,
        /// The elements.
        items: Vec<Value>,
    },
    /// `ay`
    Bytes(Vec<u8>),
    /// `(...)`
    Struct(Vec<Value>),
    /// `{kv}`
    DictEntry(Box<Value>, Box<Value>),
    /// `v`
    Variant(Box<Value>),
}

impl Value {
    /// Builds an array, checking every item against `element`.
    ///
    /// Arrays of bytes come back as [`Value::Bytes`].
    pub fn array(element: Type, items: Vec<Self>) -> Result<Self, WireError> {
        if element == Type::Byte {
            return items
                .into_iter()
                .map(|item| match item {
                    Self::Byte(b) => Ok(b),
                    other => Err(WireError::TypeMismatch {
                        expected: Type::Byte.to_string(),
                        found: other.value_type().to_string(),
                    }),
                })
                .collect::<Result<Vec<u8>, _>>()
                .map(Self::Bytes);
        }
        for item in &items {
            let found = item.value_type();
            if found != element {
                return Err(WireError::TypeMismatch {
                    expected: element.to_string(),
                    found: found.to_string(),
                });
            }
        }
        Ok(Self::Array { element, items })
    }

    /// Builds an `as` array.
    #[must_use]
    pub fn string_array<I, S>(items: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::Array {
            element: Type::String,
            items: items.into_iter().map(|s| Self::String(s.into())).collect(),
        }
    }

    /// Builds an `a{kv}` dictionary, checking every pair.
    pub fn dict(key: Type, value: Type, pairs: Vec<(Self, Self)>) -> Result<Self, WireError> {
        let entry = Type::DictEntry(Box::new(key), Box::new(value));
        let items = pairs
            .into_iter()
            .map(|(k, v)| Self::DictEntry(Box::new(k), Box::new(v)))
            .collect();
        Self::array(entry, items)
    }

    /// Wraps a value in a variant.
    #[must_use]
    pub fn variant(inner: impl Into<Self>) -> Self {
        Self::Variant(Box::new(inner.into()))
    }

    /// The type of this value.
    #[must_use]
    pub fn value_type(&self) -> Type {
        match self {
            Self::Byte(_) => Type::Byte,
            Self::Boolean(_) => Type::Boolean,
            Self::Int16(_) => Type::Int16,
            Self::UInt16(_) => Type::UInt16,
            Self::Int32(_) => Type::Int32,
            Self::UInt32(_) => Type::UInt32,
            Self::Int64(_) => Type::Int64,
            Self::UInt64(_) => Type::UInt64,
            Self::Double(_) => Type::Double,
            Self::String(_) => Type::String,
            Self::ObjectPath(_) => Type::ObjectPath,
            Self::Signature(_) => Type::Signature,
            Self::Array { element, .. } => Type::Array(Box::new(element.clone())),
            Self::Bytes(_) => Type::Array(Box::new(Type::Byte)),
            Self::Struct(fields) => Type::Struct(fields.iter().map(Self::value_type).collect()),
            Self::DictEntry(key, value) => {
                Type::DictEntry(Box::new(key.value_type()), Box::new(value.value_type()))
            },
            Self::Variant(_) => Type::Variant,
        }
    }

    /// String contents of `s`, `o` and `g` values.
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            Self::ObjectPath(p) => Some(p.as_str()),
            Self::Signature(g) => Some(g.as_str()),
            _ => None,
        }
    }

    /// Value of a `u`.
    #[must_use]
    pub const fn as_u32(&self) -> Option<u32> {
        match self {
            Self::UInt32(v) => Some(*v),
            _ => None,
        }
    }

    /// Value of a `b`.
    #[must_use]
    pub const fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Boolean(v) => Some(*v),
            _ => None,
        }
    }

    /// Contents of an `ay`.
    #[must_use]
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Self::Bytes(bytes) => Some(bytes),
            _ => None,
        }
    }

    /// Items of an array other than `ay`.
    #[must_use]
    pub fn as_array(&self) -> Option<&[Self]> {
        match self {
            Self::Array { items, .. } => Some(items),
            _ => None,
        }
    }

    /// Unwraps one level of variant, if any.
    #[must_use]
    pub fn flatten_variant(&self) -> &Self {
        match self {
            Self::Variant(inner) => inner,
            other => other,
        }
    }
}

macro_rules! impl_from {
    ($($ty:ty => $variant:ident),* $(,)?) => {
        $(
            impl From<$ty> for Value {
                fn from(value: $ty) -> Self {
                    Self::$variant(value)
                }
            }
        )*
    };
}

impl_from! {
    u8 => Byte,
    bool => Boolean,
    i16 => Int16,
    u16 => UInt16,
    i32 => Int32,
    u32 => UInt32,
    i64 => Int64,
    u64 => UInt64,
    f64 => Double,
    String => String,
    ObjectPath => ObjectPath,
    Signature => Signature,
}

impl From<Vec<u8>> for Value {
    fn from(value: Vec<u8>) -> Self {
        Self::Bytes(value)
    }
}

impl From<&[u8]> for Value {
    fn from(value: &[u8]) -> Self {
        Self::Bytes(value.to_vec())
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Self::String(value.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_object_path_validation() {
        assert!(ObjectPath::new("/").is_ok());
        assert!(ObjectPath::new("/org/example/Obj_1").is_ok());
        for bad in ["", "org", "/org/", "//org", "/org//x", "/org/ex-ample."] {
            assert!(ObjectPath::new(bad).is_err(), "accepted {bad:?}");
        }
    }

    #[test]
    fn test_object_path_prefix() {
        let path = ObjectPath::new("/org/example/child").unwrap();
        assert!(path.starts_with(&ObjectPath::new("/org/example").unwrap()));
        assert!(path.starts_with(&ObjectPath::root()));
        assert!(!path.starts_with(&ObjectPath::new("/org/ex").unwrap()));
    }

    #[test]
    fn test_value_type_of_containers() {
        let dict = Value::dict(
            Type::String,
            Type::Variant,
            vec![(Value::from("k"), Value::variant(7u32))],
        )
        .unwrap();
        assert_eq!(dict.value_type().to_string(), "a{sv}");

        let record = Value::Struct(vec![Value::from(1i32), Value::string_array(["a"])]);
        assert_eq!(record.value_type().to_string(), "(ias)");
    }

    #[test]
    fn test_array_rejects_mixed_items() {
        let err = Value::array(Type::String, vec![Value::from("a"), Value::from(1u32)]);
        assert!(matches!(err, Err(WireError::TypeMismatch { .. })));
    }

    #[test]
    fn test_byte_arrays_are_packed() {
        let packed = Value::array(Type::Byte, vec![Value::Byte(1), Value::Byte(2)]).unwrap();
        assert_eq!(packed, Value::Bytes(vec![1, 2]));
        assert_eq!(packed.value_type().to_string(), "ay");
        assert_eq!(packed.as_bytes(), Some(&[1u8, 2][..]));
        assert!(packed.as_array().is_none());

        let err = Value::array(Type::Byte, vec![Value::Byte(1), Value::from(2u32)]);
        assert!(matches!(err, Err(WireError::TypeMismatch { .. })));
    }
}
