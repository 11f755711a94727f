//! Value decoding.

use super::error::WireError;
use super::message::Endian;
use super::signature::{Signature, Type};
use super::value::{ObjectPath, Value};
use super::{align_up, MAX_ARRAY_LENGTH, MAX_CONTAINER_DEPTH, MAX_DECODED_VALUES};

/// Reads aligned values from a buffer.
///
/// As with the marshaller, alignment is relative to the start of `buf`.
/// Each unmarshaller decodes at most [`MAX_DECODED_VALUES`] values.
pub(crate) struct Unmarshaller<'a> {
    buf: &'a [u8],
    pos: usize,
    endian: Endian,
    variant_depth: usize,
    values_left: usize,
}

macro_rules! get_int {
    ($self:ident, $ty:ty) => {{
        const SIZE: usize = std::mem::size_of::<$ty>();
        $self.align(SIZE)?;
        let bytes: [u8; SIZE] = $self.take(SIZE)?.try_into().map_err(|_| WireError::Truncated {
            offset: $self.pos,
            needed: SIZE,
        })?;
        match $self.endian {
            Endian::Little => <$ty>::from_le_bytes(bytes),
            Endian::Big => <$ty>::from_be_bytes(bytes),
        }
    }};
}

impl<'a> Unmarshaller<'a> {
    pub(crate) const fn new(buf: &'a [u8], endian: Endian) -> Self {
        Self {
            buf,
            pos: 0,
            endian,
            variant_depth: 0,
            values_left: MAX_DECODED_VALUES,
        }
    }

    pub(crate) const fn at(buf: &'a [u8], pos: usize, endian: Endian) -> Self {
        Self {
            buf,
            pos,
            endian,
            variant_depth: 0,
            values_left: MAX_DECODED_VALUES,
        }
    }

    pub(crate) const fn position(&self) -> usize {
        self.pos
    }

    #[cfg(test)]
    fn with_value_limit(mut self, limit: usize) -> Self {
        self.values_left = limit;
        self
    }

    fn count_value(&mut self) -> Result<(), WireError> {
        self.values_left = self
            .values_left
            .checked_sub(1)
            .ok_or(WireError::TooManyValues {
                max: MAX_DECODED_VALUES,
            })?;
        Ok(())
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8], WireError> {
        let end = self
            .pos
            .checked_add(len)
            .filter(|end| *end <= self.buf.len())
            .ok_or(WireError::Truncated {
                offset: self.pos,
                needed: len,
            })?;
        let slice = &self.buf[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    /// Skips padding up to `alignment`, verifying that it is zero.
    pub(crate) fn align(&mut self, alignment: usize) -> Result<(), WireError> {
        let target = align_up(self.pos, alignment);
        let start = self.pos;
        let padding = self.take(target - start)?;
        if let Some(index) = padding.iter().position(|b| *b != 0) {
            return Err(WireError::NonZeroPadding {
                offset: start + index,
            });
        }
        Ok(())
    }

    pub(crate) fn get_u8(&mut self) -> Result<u8, WireError> {
        Ok(self.take(1)?[0])
    }

    pub(crate) fn get_u32(&mut self) -> Result<u32, WireError> {
        Ok(get_int!(self, u32))
    }

    fn get_str(&mut self, len: usize) -> Result<&'a str, WireError> {
        let offset = self.pos;
        let bytes = self.take(len)?;
        if self.get_u8()? != 0 {
            return Err(WireError::InvalidString { offset });
        }
        std::str::from_utf8(bytes).map_err(|_| WireError::InvalidString { offset })
    }

    fn get_string(&mut self) -> Result<String, WireError> {
        let len = self.get_u32()? as usize;
        Ok(self.get_str(len)?.to_string())
    }

    pub(crate) fn get_signature(&mut self) -> Result<Signature, WireError> {
        let len = usize::from(self.get_u8()?);
        let text = self.get_str(len)?;
        Signature::new(text)
    }

    /// Reads one value of type `ty`.
    pub(crate) fn get_value(&mut self, ty: &Type) -> Result<Value, WireError> {
        self.count_value()?;
        let value = match ty {
            Type::Byte => Value::Byte(self.get_u8()?),
            Type::Boolean => match self.get_u32()? {
                0 => Value::Boolean(false),
                1 => Value::Boolean(true),
                other => return Err(WireError::InvalidBoolean(other)),
            },
            Type::Int16 => Value::Int16(get_int!(self, i16)),
            Type::UInt16 => Value::UInt16(get_int!(self, u16)),
            Type::Int32 => Value::Int32(get_int!(self, i32)),
            Type::UInt32 => Value::UInt32(self.get_u32()?),
            Type::Int64 => Value::Int64(get_int!(self, i64)),
            Type::UInt64 => Value::UInt64(get_int!(self, u64)),
            Type::Double => Value::Double(f64::from_bits(get_int!(self, u64))),
            Type::String => Value::String(self.get_string()?),
            Type::ObjectPath => Value::ObjectPath(ObjectPath::new(self.get_string()?)?),
            Type::Signature => Value::Signature(self.get_signature()?),
            Type::Variant => {
                let signature = self.get_signature()?;
                let inner_type = Type::parse_single(signature.as_str())?;
                self.variant_depth += 1;
                if self.variant_depth > MAX_CONTAINER_DEPTH * 2 {
                    return Err(WireError::invalid_signature(
                        signature.as_str(),
                        "variants nested too deeply",
                    ));
                }
                let inner = self.get_value(&inner_type)?;
                self.variant_depth -= 1;
                Value::Variant(Box::new(inner))
            },
            Type::Array(element) => self.get_array(element)?,
            Type::Struct(field_types) => {
                self.align(8)?;
                let mut fields = Vec::with_capacity(field_types.len());
                for field_type in field_types {
                    fields.push(self.get_value(field_type)?);
                }
                Value::Struct(fields)
            },
            Type::DictEntry(key_type, value_type) => {
                self.align(8)?;
                let key = self.get_value(key_type)?;
                let value = self.get_value(value_type)?;
                Value::DictEntry(Box::new(key), Box::new(value))
            },
        };
        Ok(value)
    }

    fn get_array(&mut self, element: &Type) -> Result<Value, WireError> {
        let len = self.get_u32()? as usize;
        if len > MAX_ARRAY_LENGTH {
            return Err(WireError::ArrayTooLong {
                len,
                max: MAX_ARRAY_LENGTH,
            });
        }
        self.align(element.alignment())?;
        if *element == Type::Byte {
            return Ok(Value::Bytes(self.take(len)?.to_vec()));
        }
        let end = self
            .pos
            .checked_add(len)
            .filter(|end| *end <= self.buf.len())
            .ok_or(WireError::Truncated {
                offset: self.pos,
                needed: len,
            })?;
        let mut items = Vec::new();
        while self.pos < end {
            items.push(self.get_value(element)?);
        }
        if self.pos != end {
            return Err(WireError::invalid_header(format!(
                "array element overran declared length at offset {}",
                self.pos
            )));
        }
        Ok(Value::Array {
            element: element.clone(),
            items,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::marshal::Marshaller;

    fn round_trip(ty: &Type, value: &Value, endian: Endian) -> Value {
        let mut m = Marshaller::new(endian);
        m.put_value(ty, value).unwrap();
        let bytes = m.into_inner();
        let mut u = Unmarshaller::new(&bytes, endian);
        let decoded = u.get_value(ty).unwrap();
        assert_eq!(u.position(), bytes.len());
        decoded
    }

    #[test]
    fn test_nested_containers() {
        let value = Value::Struct(vec![
            Value::Byte(1),
            Value::dict(
                Type::String,
                Type::Variant,
                vec![
                    (Value::from("a"), Value::variant(Value::string_array(["x", "y"]))),
                    (Value::from("b"), Value::variant(Value::Double(2.5))),
                ],
            )
            .unwrap(),
            Value::Int16(-3),
        ]);
        let ty = value.value_type();
        assert_eq!(round_trip(&ty, &value, Endian::Little), value);
        assert_eq!(round_trip(&ty, &value, Endian::Big), value);
    }

    #[test]
    fn test_empty_array_keeps_element_type() {
        let value = Value::array(Type::Struct(vec![Type::UInt64]), vec![]).unwrap();
        let ty = value.value_type();
        assert_eq!(round_trip(&ty, &value, Endian::Little), value);
    }

    #[test]
    fn test_rejects_bad_boolean() {
        let bytes = 2u32.to_le_bytes();
        let mut u = Unmarshaller::new(&bytes, Endian::Little);
        assert!(matches!(
            u.get_value(&Type::Boolean),
            Err(WireError::InvalidBoolean(2))
        ));
    }

    #[test]
    fn test_rejects_nonzero_padding() {
        let bytes = [7u8, 1, 0, 0, 9, 0, 0, 0];
        let mut u = Unmarshaller::new(&bytes, Endian::Little);
        u.get_value(&Type::Byte).unwrap();
        assert!(matches!(
            u.get_value(&Type::UInt32),
            Err(WireError::NonZeroPadding { offset: 1 })
        ));
    }

    #[test]
    fn test_rejects_oversized_array_before_reading() {
        let len = u32::try_from(MAX_ARRAY_LENGTH + 1).unwrap();
        let bytes = len.to_le_bytes();
        let mut u = Unmarshaller::new(&bytes, Endian::Little);
        assert!(matches!(
            u.get_value(&Type::Array(Box::new(Type::Byte))),
            Err(WireError::ArrayTooLong { .. })
        ));
    }

    #[test]
    fn test_truncated_string() {
        let mut bytes = 10u32.to_le_bytes().to_vec();
        bytes.extend_from_slice(b"abc");
        let mut u = Unmarshaller::new(&bytes, Endian::Little);
        assert!(matches!(
            u.get_value(&Type::String),
            Err(WireError::Truncated { .. })
        ));
    }

    #[test]
    fn test_byte_array_is_packed() {
        let len = 1024 * 1024;
        let mut bytes = u32::try_from(len).unwrap().to_le_bytes().to_vec();
        bytes.resize(4 + len, 0xab);
        let mut u = Unmarshaller::new(&bytes, Endian::Little);
        let value = u.get_value(&Type::Array(Box::new(Type::Byte))).unwrap();
        assert_eq!(u.position(), bytes.len());
        let packed = value.as_bytes().unwrap();
        assert_eq!(packed.len(), len);
        assert!(packed.iter().all(|b| *b == 0xab));
    }

    #[test]
    fn test_value_budget_is_enforced() {
        let value = Value::array(Type::UInt32, (0..8u32).map(Value::from).collect()).unwrap();
        let ty = value.value_type();
        let mut m = Marshaller::new(Endian::Little);
        m.put_value(&ty, &value).unwrap();
        let bytes = m.into_inner();

        // The array itself plus eight elements.
        let mut u = Unmarshaller::new(&bytes, Endian::Little).with_value_limit(9);
        assert_eq!(u.get_value(&ty).unwrap(), value);

        let mut u = Unmarshaller::new(&bytes, Endian::Little).with_value_limit(8);
        assert!(matches!(
            u.get_value(&ty),
            Err(WireError::TooManyValues { .. })
        ));
    }
}
