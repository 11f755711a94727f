//! Value encoding.

use super::error::WireError;
use super::message::Endian;
use super::signature::Type;
use super::value::Value;
use super::{align_up, MAX_ARRAY_LENGTH};

/// Appends aligned values to a buffer.
///
/// Offsets are measured from the start of `buf`, so callers encoding a
/// header must start with the fixed header already in the buffer, and
/// callers encoding a body start with an empty buffer (the body itself
/// begins on an 8-byte boundary).
pub(crate) struct Marshaller {
    buf: Vec<u8>,
    endian: Endian,
}

macro_rules! put_int {
    ($self:ident, $value:expr) => {{
        let bytes = match $self.endian {
            Endian::Little => $value.to_le_bytes(),
            Endian::Big => $value.to_be_bytes(),
        };
        $self.buf.extend_from_slice(&bytes);
    }};
}

impl Marshaller {
    pub(crate) const fn new(endian: Endian) -> Self {
        Self {
            buf: Vec::new(),
            endian,
        }
    }

    pub(crate) const fn with_buffer(buf: Vec<u8>, endian: Endian) -> Self {
        Self { buf, endian }
    }

    pub(crate) fn into_inner(self) -> Vec<u8> {
        self.buf
    }

    pub(crate) fn len(&self) -> usize {
        self.buf.len()
    }

    pub(crate) fn pad_to(&mut self, alignment: usize) {
        let target = align_up(self.buf.len(), alignment);
        self.buf.resize(target, 0);
    }

    pub(crate) fn put_u8(&mut self, value: u8) {
        self.buf.push(value);
    }

    pub(crate) fn put_u32(&mut self, value: u32) {
        self.pad_to(4);
        put_int!(self, value);
    }

    fn patch_u32(&mut self, offset: usize, value: u32) {
        let bytes = match self.endian {
            Endian::Little => value.to_le_bytes(),
            Endian::Big => value.to_be_bytes(),
        };
        self.buf[offset..offset + 4].copy_from_slice(&bytes);
    }

    fn put_str(&mut self, value: &str) -> Result<(), WireError> {
        let len = u32::try_from(value.len()).map_err(|_| WireError::MessageTooLarge {
            size: value.len(),
            max: u32::MAX as usize,
        })?;
        self.put_u32(len);
        self.buf.extend_from_slice(value.as_bytes());
        self.buf.push(0);
        Ok(())
    }

    pub(crate) fn put_signature(&mut self, value: &str) {
        // Signature length is bounded at 255 by construction.
        #[allow(clippy::cast_possible_truncation)]
        let len = value.len() as u8;
        self.buf.push(len);
        self.buf.extend_from_slice(value.as_bytes());
        self.buf.push(0);
    }

    /// Writes `value` as type `ty`, failing if they disagree.
    pub(crate) fn put_value(&mut self, ty: &Type, value: &Value) -> Result<(), WireError> {
        match (ty, value) {
            (Type::Byte, Value::Byte(v)) => self.put_u8(*v),
            (Type::Boolean, Value::Boolean(v)) => self.put_u32(u32::from(*v)),
            (Type::Int16, Value::Int16(v)) => {
                self.pad_to(2);
                put_int!(self, *v);
            },
            (Type::UInt16, Value::UInt16(v)) => {
                self.pad_to(2);
                put_int!(self, *v);
            },
            (Type::Int32, Value::Int32(v)) => {
                self.pad_to(4);
                put_int!(self, *v);
            },
            (Type::UInt32, Value::UInt32(v)) => self.put_u32(*v),
            (Type::Int64, Value::Int64(v)) => {
                self.pad_to(8);
                put_int!(self, *v);
            },
            (Type::UInt64, Value::UInt64(v)) => {
                self.pad_to(8);
                put_int!(self, *v);
            },
            (Type::Double, Value::Double(v)) => {
                self.pad_to(8);
                put_int!(self, v.to_bits());
            },
            (Type::String, Value::String(v)) => self.put_str(v)?,
            (Type::ObjectPath, Value::ObjectPath(v)) => self.put_str(v.as_str())?,
            (Type::Signature, Value::Signature(v)) => self.put_signature(v.as_str()),
            (Type::Variant, Value::Variant(inner)) => {
                let inner_type = inner.value_type();
                let signature = inner_type.to_string();
                // Validates nesting limits of the embedded type.
                Type::parse_single(&signature)?;
                self.put_signature(&signature);
                self.put_value(&inner_type, inner)?;
            },
            (Type::Array(element_type), Value::Array { element, items })
                if element == element_type.as_ref() =>
            {
                self.put_array(element_type, items)?;
            },
            (Type::Array(element_type), Value::Bytes(bytes))
                if element_type.as_ref() == &Type::Byte =>
            {
                if bytes.len() > MAX_ARRAY_LENGTH {
                    return Err(WireError::ArrayTooLong {
                        len: bytes.len(),
                        max: MAX_ARRAY_LENGTH,
                    });
                }
                // Bounded by MAX_ARRAY_LENGTH above.
                #[allow(clippy::cast_possible_truncation)]
                let len = bytes.len() as u32;
                self.put_u32(len);
                self.buf.extend_from_slice(bytes);
            },
            (Type::Struct(field_types), Value::Struct(fields))
                if field_types.len() == fields.len() =>
            {
                self.pad_to(8);
                for (field_type, field) in field_types.iter().zip(fields) {
                    self.put_value(field_type, field)?;
                }
            },
            (Type::DictEntry(key_type, value_type), Value::DictEntry(key, value)) => {
                self.pad_to(8);
                self.put_value(key_type, key)?;
                self.put_value(value_type, value)?;
            },
            (expected, found) => {
                return Err(WireError::TypeMismatch {
                    expected: expected.to_string(),
                    found: found.value_type().to_string(),
                });
            },
        }
        Ok(())
    }

    fn put_array(&mut self, element: &Type, items: &[Value]) -> Result<(), WireError> {
        self.pad_to(4);
        let length_offset = self.buf.len();
        self.put_u32(0);
        // Padding before the first element is not counted in the length.
        self.pad_to(element.alignment());
        let start = self.buf.len();
        for item in items {
            self.put_value(element, item)?;
        }
        let len = self.buf.len() - start;
        if len > MAX_ARRAY_LENGTH {
            return Err(WireError::ArrayTooLong {
                len,
                max: MAX_ARRAY_LENGTH,
            });
        }
        // Bounded by MAX_ARRAY_LENGTH above.
        #[allow(clippy::cast_possible_truncation)]
        let len = len as u32;
        self.patch_u32(length_offset, len);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_string_layout() {
        let mut m = Marshaller::new(Endian::Little);
        m.put_value(&Type::String, &Value::from("hi")).unwrap();
        assert_eq!(m.into_inner(), vec![2, 0, 0, 0, b'h', b'i', 0]);
    }

    #[test]
    fn test_alignment_padding_is_zero() {
        let mut m = Marshaller::new(Endian::Big);
        m.put_value(&Type::Byte, &Value::Byte(0xff)).unwrap();
        m.put_value(&Type::UInt64, &Value::UInt64(1)).unwrap();
        assert_eq!(
            m.into_inner(),
            vec![0xff, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 1]
        );
    }

    #[test]
    fn test_array_length_excludes_leading_padding() {
        let mut m = Marshaller::new(Endian::Little);
        let value = Value::array(Type::UInt64, vec![Value::UInt64(5)]).unwrap();
        m.put_value(&Type::Array(Box::new(Type::UInt64)), &value)
            .unwrap();
        let bytes = m.into_inner();
        // Length prefix, 4 bytes padding, then one 8-byte element.
        assert_eq!(&bytes[..4], &8u32.to_le_bytes());
        assert_eq!(bytes.len(), 16);
    }

    #[test]
    fn test_type_mismatch() {
        let mut m = Marshaller::new(Endian::Little);
        let err = m.put_value(&Type::UInt32, &Value::from("x")).unwrap_err();
        assert!(matches!(err, WireError::TypeMismatch { .. }));
    }

    #[test]
    fn test_byte_array_layout() {
        let mut m = Marshaller::new(Endian::Big);
        m.put_value(&Type::Byte, &Value::Byte(9)).unwrap();
        m.put_value(&Type::Array(Box::new(Type::Byte)), &Value::from(&b"ab"[..]))
            .unwrap();
        assert_eq!(m.into_inner(), vec![9, 0, 0, 0, 0, 0, 0, 2, b'a', b'b']);
    }
}
