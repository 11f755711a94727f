//! Messages and their header.

use std::fmt;
use std::ops::BitOr;

use super::error::WireError;
use super::marshal::Marshaller;
use super::signature::{Signature, Type};
use super::unmarshal::Unmarshaller;
use super::value::{ObjectPath, Value};
use super::{align_up, FIXED_HEADER_LENGTH, MAX_ARRAY_LENGTH, MAX_MESSAGE_LENGTH, PROTOCOL_VERSION};

const FIELD_PATH: u8 = 1;
const FIELD_INTERFACE: u8 = 2;
const FIELD_MEMBER: u8 = 3;
const FIELD_ERROR_NAME: u8 = 4;
const FIELD_REPLY_SERIAL: u8 = 5;
const FIELD_DESTINATION: u8 = 6;
const FIELD_SENDER: u8 = 7;
const FIELD_SIGNATURE: u8 = 8;

/// The four message kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    /// Invokes a method on a remote object.
    MethodCall = 1,
    /// Successful reply to a method call.
    MethodReturn = 2,
    /// Failed reply to a method call.
    Error = 3,
    /// Broadcast or unicast notification.
    Signal = 4,
}

impl MessageType {
    /// Lowercase name as used in match rules.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::MethodCall => "method_call",
            Self::MethodReturn => "method_return",
            Self::Error => "error",
            Self::Signal => "signal",
        }
    }

    /// Parses a match-rule type name.
    #[must_use]
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "method_call" => Some(Self::MethodCall),
            "method_return" => Some(Self::MethodReturn),
            "error" => Some(Self::Error),
            "signal" => Some(Self::Signal),
            _ => None,
        }
    }
}

impl TryFrom<u8> for MessageType {
    type Error = WireError;

    fn try_from(value: u8) -> Result<Self, WireError> {
        match value {
            1 => Ok(Self::MethodCall),
            2 => Ok(Self::MethodReturn),
            3 => Ok(Self::Error),
            4 => Ok(Self::Signal),
            other => Err(WireError::UnknownMessageType(other)),
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Header flag bits. Unknown bits are preserved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Flags(u8);

impl Flags {
    /// The sender does not want a reply.
    pub const NO_REPLY_EXPECTED: Self = Self(0x1);
    /// Do not start a service to handle this message.
    pub const NO_AUTO_START: Self = Self(0x2);
    /// The call may be handled asynchronously by the receiver.
    pub const ASYNC: Self = Self(0x40);

    /// No flags set.
    #[must_use]
    pub const fn empty() -> Self {
        Self(0)
    }

    /// Wraps raw header bits.
    #[must_use]
    pub const fn from_bits(bits: u8) -> Self {
        Self(bits)
    }

    /// Raw header bits.
    #[must_use]
    pub const fn bits(self) -> u8 {
        self.0
    }

    /// Returns `true` if every bit of `other` is set.
    #[must_use]
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for Flags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// Byte order of a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Endian {
    /// `l`
    Little,
    /// `B`
    Big,
}

impl Endian {
    /// Byte order of this host.
    #[must_use]
    pub const fn native() -> Self {
        if cfg!(target_endian = "big") {
            Self::Big
        } else {
            Self::Little
        }
    }

    const fn marker(self) -> u8 {
        match self {
            Self::Little => b'l',
            Self::Big => b'B',
        }
    }

    const fn from_marker(byte: u8) -> Result<Self, WireError> {
        match byte {
            b'l' => Ok(Self::Little),
            b'B' => Ok(Self::Big),
            other => Err(WireError::InvalidEndian(other)),
        }
    }
}

impl Default for Endian {
    fn default() -> Self {
        Self::native()
    }
}

/// The fixed 16-byte prefix of a frame.
#[derive(Debug, Clone, Copy)]
pub(crate) struct FixedHeader {
    pub(crate) endian: Endian,
    pub(crate) message_type: MessageType,
    pub(crate) flags: Flags,
    pub(crate) body_len: usize,
    pub(crate) serial: u32,
    pub(crate) fields_len: usize,
}

impl FixedHeader {
    /// Parses and validates the first [`FIXED_HEADER_LENGTH`] bytes.
    pub(crate) fn parse(prefix: &[u8]) -> Result<Self, WireError> {
        if prefix.len() < FIXED_HEADER_LENGTH {
            return Err(WireError::Truncated {
                offset: prefix.len(),
                needed: FIXED_HEADER_LENGTH - prefix.len(),
            });
        }
        let endian = Endian::from_marker(prefix[0])?;
        let version = prefix[3];
        if version != PROTOCOL_VERSION {
            return Err(WireError::UnsupportedVersion { version });
        }
        let message_type = MessageType::try_from(prefix[1])?;
        let flags = Flags::from_bits(prefix[2]);

        let mut u = Unmarshaller::at(prefix, 4, endian);
        let body_len = u.get_u32()? as usize;
        let serial = u.get_u32()?;
        let fields_len = u.get_u32()? as usize;
        if fields_len > MAX_ARRAY_LENGTH {
            return Err(WireError::ArrayTooLong {
                len: fields_len,
                max: MAX_ARRAY_LENGTH,
            });
        }
        if serial == 0 {
            return Err(WireError::invalid_header("serial must be non-zero"));
        }

        let header = Self {
            endian,
            message_type,
            flags,
            body_len,
            serial,
            fields_len,
        };
        let total = header.total_len();
        if total > MAX_MESSAGE_LENGTH {
            return Err(WireError::MessageTooLarge {
                size: total,
                max: MAX_MESSAGE_LENGTH,
            });
        }
        Ok(header)
    }

    /// Offset of the first body byte.
    pub(crate) const fn body_offset(&self) -> usize {
        align_up(FIXED_HEADER_LENGTH + self.fields_len, 8)
    }

    /// Length of the whole frame.
    pub(crate) const fn total_len(&self) -> usize {
        self.body_offset() + self.body_len
    }
}

fn header_fields_type() -> Type {
    Type::Array(Box::new(Type::Struct(vec![Type::Byte, Type::Variant])))
}

/// A bus message.
///
/// Construct with [`Message::method_call`], [`Message::signal`],
/// [`Message::method_return`] or [`Message::error`], then add optional
/// fields with the `with_*` builders. The serial is assigned by the
/// connection when the message is sent.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    endian: Endian,
    message_type: MessageType,
    flags: Flags,
    serial: u32,
    path: Option<ObjectPath>,
    interface: Option<String>,
    member: Option<String>,
    error_name: Option<String>,
    reply_serial: Option<u32>,
    destination: Option<String>,
    sender: Option<String>,
    signature: Signature,
    body: Vec<Value>,
}

impl Message {
    fn new(message_type: MessageType) -> Self {
        Self {
            endian: Endian::native(),
            message_type,
            flags: Flags::empty(),
            serial: 0,
            path: None,
            interface: None,
            member: None,
            error_name: None,
            reply_serial: None,
            destination: None,
            sender: None,
            signature: Signature::empty(),
            body: Vec::new(),
        }
    }

    /// Creates a method call on `path`.
    pub fn method_call(path: &str, member: impl Into<String>) -> Result<Self, WireError> {
        let mut message = Self::new(MessageType::MethodCall);
        message.path = Some(ObjectPath::new(path)?);
        message.member = Some(member.into());
        Ok(message)
    }

    /// Creates a signal emitted from `path`.
    pub fn signal(
        path: &str,
        interface: impl Into<String>,
        member: impl Into<String>,
    ) -> Result<Self, WireError> {
        let mut message = Self::new(MessageType::Signal);
        message.path = Some(ObjectPath::new(path)?);
        message.interface = Some(interface.into());
        message.member = Some(member.into());
        Ok(message)
    }

    /// Creates a successful reply to `call`.
    #[must_use]
    pub fn method_return(call: &Self) -> Self {
        let mut message = Self::new(MessageType::MethodReturn);
        message.reply_serial = Some(call.serial);
        message.destination.clone_from(&call.sender);
        message.flags = Flags::NO_REPLY_EXPECTED;
        message
    }

    /// Creates an Error reply to `call` carrying `text` as its only argument.
    #[must_use]
    pub fn error(call: &Self, error_name: impl Into<String>, text: impl Into<String>) -> Self {
        let mut message = Self::new(MessageType::Error);
        message.reply_serial = Some(call.serial);
        message.destination.clone_from(&call.sender);
        message.error_name = Some(error_name.into());
        message.flags = Flags::NO_REPLY_EXPECTED;
        message.signature = Signature::from_types(&[Type::String]).unwrap_or_default();
        message.body = vec![Value::String(text.into())];
        message
    }

    /// Creates an Error message replying to serial `reply_serial` without
    /// the original call at hand.
    #[must_use]
    pub fn error_for_serial(
        reply_serial: u32,
        error_name: impl Into<String>,
        text: impl Into<String>,
    ) -> Self {
        let mut message = Self::new(MessageType::Error);
        message.reply_serial = Some(reply_serial);
        message.error_name = Some(error_name.into());
        message.flags = Flags::NO_REPLY_EXPECTED;
        message.signature = Signature::from_types(&[Type::String]).unwrap_or_default();
        message.body = vec![Value::String(text.into())];
        message
    }

    /// Sets the interface.
    #[must_use]
    pub fn with_interface(mut self, interface: impl Into<String>) -> Self {
        self.interface = Some(interface.into());
        self
    }

    /// Sets the destination bus name.
    #[must_use]
    pub fn with_destination(mut self, destination: impl Into<String>) -> Self {
        self.destination = Some(destination.into());
        self
    }

    /// Sets the sender bus name.
    #[must_use]
    pub fn with_sender(mut self, sender: impl Into<String>) -> Self {
        self.sender = Some(sender.into());
        self
    }

    /// Adds header flags.
    #[must_use]
    pub fn with_flags(mut self, flags: Flags) -> Self {
        self.flags = self.flags | flags;
        self
    }

    /// Sets the byte order used when encoding.
    #[must_use]
    pub const fn with_endian(mut self, endian: Endian) -> Self {
        self.endian = endian;
        self
    }

    /// Sets the body; the signature is derived from the values.
    pub fn with_body(mut self, body: Vec<Value>) -> Result<Self, WireError> {
        let types: Vec<Type> = body.iter().map(Value::value_type).collect();
        self.signature = Signature::from_types(&types)?;
        self.body = body;
        Ok(self)
    }

    /// Assigns the serial. Done by the connection on send.
    pub fn set_serial(&mut self, serial: u32) {
        self.serial = serial;
    }

    /// Overwrites the sender. Done by the daemon on routing.
    pub fn set_sender(&mut self, sender: Option<String>) {
        self.sender = sender;
    }

    /// Overwrites the destination.
    pub fn set_destination(&mut self, destination: Option<String>) {
        self.destination = destination;
    }

    /// Message kind.
    #[must_use]
    pub const fn message_type(&self) -> MessageType {
        self.message_type
    }

    /// Header flags.
    #[must_use]
    pub const fn flags(&self) -> Flags {
        self.flags
    }

    /// Byte order.
    #[must_use]
    pub const fn endian(&self) -> Endian {
        self.endian
    }

    /// Serial, or 0 if not yet sent.
    #[must_use]
    pub const fn serial(&self) -> u32 {
        self.serial
    }

    /// Object path.
    #[must_use]
    pub const fn path(&self) -> Option<&ObjectPath> {
        self.path.as_ref()
    }

    /// Interface name.
    #[must_use]
    pub fn interface(&self) -> Option<&str> {
        self.interface.as_deref()
    }

    /// Member name.
    #[must_use]
    pub fn member(&self) -> Option<&str> {
        self.member.as_deref()
    }

    /// Error name of an Error message.
    #[must_use]
    pub fn error_name(&self) -> Option<&str> {
        self.error_name.as_deref()
    }

    /// Serial of the call this message replies to.
    #[must_use]
    pub const fn reply_serial(&self) -> Option<u32> {
        self.reply_serial
    }

    /// Destination bus name.
    #[must_use]
    pub fn destination(&self) -> Option<&str> {
        self.destination.as_deref()
    }

    /// Sender bus name.
    #[must_use]
    pub fn sender(&self) -> Option<&str> {
        self.sender.as_deref()
    }

    /// Body signature.
    #[must_use]
    pub const fn signature(&self) -> &Signature {
        &self.signature
    }

    /// Body values.
    #[must_use]
    pub fn body(&self) -> &[Value] {
        &self.body
    }

    /// Consumes the message, returning its body.
    #[must_use]
    pub fn into_body(self) -> Vec<Value> {
        self.body
    }

    /// Returns `true` for a method call whose sender waits for a reply.
    #[must_use]
    pub const fn expects_reply(&self) -> bool {
        matches!(self.message_type, MessageType::MethodCall)
            && !self.flags.contains(Flags::NO_REPLY_EXPECTED)
    }

    /// First string argument, used as the human-readable text of errors.
    #[must_use]
    pub fn error_text(&self) -> Option<&str> {
        self.body.first().and_then(Value::as_str)
    }

    /// Checks that the header fields required by the message type are set.
    pub fn validate(&self) -> Result<(), WireError> {
        match self.message_type {
            MessageType::MethodCall => {
                require(self.path.is_some(), "PATH")?;
                require(self.member.is_some(), "MEMBER")?;
            },
            MessageType::Signal => {
                require(self.path.is_some(), "PATH")?;
                require(self.interface.is_some(), "INTERFACE")?;
                require(self.member.is_some(), "MEMBER")?;
            },
            MessageType::Error => {
                require(self.error_name.is_some(), "ERROR_NAME")?;
                require(self.reply_serial.is_some(), "REPLY_SERIAL")?;
            },
            MessageType::MethodReturn => {
                require(self.reply_serial.is_some(), "REPLY_SERIAL")?;
            },
        }
        Ok(())
    }

    fn header_fields(&self) -> Vec<Value> {
        let mut fields = Vec::new();
        let mut push = |code: u8, value: Value| {
            fields.push(Value::Struct(vec![
                Value::Byte(code),
                Value::Variant(Box::new(value)),
            ]));
        };
        if let Some(path) = &self.path {
            push(FIELD_PATH, Value::ObjectPath(path.clone()));
        }
        if let Some(interface) = &self.interface {
            push(FIELD_INTERFACE, Value::String(interface.clone()));
        }
        if let Some(member) = &self.member {
            push(FIELD_MEMBER, Value::String(member.clone()));
        }
        if let Some(error_name) = &self.error_name {
            push(FIELD_ERROR_NAME, Value::String(error_name.clone()));
        }
        if let Some(reply_serial) = self.reply_serial {
            push(FIELD_REPLY_SERIAL, Value::UInt32(reply_serial));
        }
        if let Some(destination) = &self.destination {
            push(FIELD_DESTINATION, Value::String(destination.clone()));
        }
        if let Some(sender) = &self.sender {
            push(FIELD_SENDER, Value::String(sender.clone()));
        }
        if !self.signature.is_empty() {
            push(FIELD_SIGNATURE, Value::Signature(self.signature.clone()));
        }
        fields
    }

    /// Encodes the message into its wire form.
    pub fn encode(&self) -> Result<Vec<u8>, WireError> {
        self.validate()?;
        if self.serial == 0 {
            return Err(WireError::invalid_header("serial must be non-zero"));
        }
        if self.signature.types().len() != self.body.len() {
            return Err(WireError::TypeMismatch {
                expected: self.signature.to_string(),
                found: format!("{} values", self.body.len()),
            });
        }

        let mut body = Marshaller::new(self.endian);
        for (ty, value) in self.signature.types().iter().zip(&self.body) {
            body.put_value(ty, value)?;
        }
        let body = body.into_inner();
        let body_len = u32::try_from(body.len()).map_err(|_| WireError::MessageTooLarge {
            size: body.len(),
            max: MAX_MESSAGE_LENGTH,
        })?;

        let mut header = Marshaller::with_buffer(Vec::with_capacity(128 + body.len()), self.endian);
        header.put_u8(self.endian.marker());
        header.put_u8(self.message_type as u8);
        header.put_u8(self.flags.bits());
        header.put_u8(PROTOCOL_VERSION);
        header.put_u32(body_len);
        header.put_u32(self.serial);
        let fields = Value::Array {
            element: Type::Struct(vec![Type::Byte, Type::Variant]),
            items: self.header_fields(),
        };
        header.put_value(&header_fields_type(), &fields)?;
        header.pad_to(8);

        if header.len() + body.len() > MAX_MESSAGE_LENGTH {
            return Err(WireError::MessageTooLarge {
                size: header.len() + body.len(),
                max: MAX_MESSAGE_LENGTH,
            });
        }
        let mut out = header.into_inner();
        out.extend_from_slice(&body);
        Ok(out)
    }

    /// Decodes exactly one complete message from `bytes`.
    pub fn decode(bytes: &[u8]) -> Result<Self, WireError> {
        let fixed = FixedHeader::parse(bytes)?;
        let total = fixed.total_len();
        if bytes.len() < total {
            return Err(WireError::Truncated {
                offset: bytes.len(),
                needed: total - bytes.len(),
            });
        }
        if bytes.len() > total {
            return Err(WireError::invalid_header(format!(
                "{} trailing bytes after message",
                bytes.len() - total
            )));
        }

        let mut message = Self::new(fixed.message_type);
        message.endian = fixed.endian;
        message.flags = fixed.flags;
        message.serial = fixed.serial;

        let mut u = Unmarshaller::at(bytes, 12, fixed.endian);
        let fields = u.get_value(&header_fields_type())?;
        u.align(8)?;
        if u.position() != fixed.body_offset() {
            return Err(WireError::invalid_header("header field array length mismatch"));
        }
        for field in fields.as_array().unwrap_or_default() {
            message.apply_header_field(field)?;
        }
        message.validate()?;

        let body = &bytes[fixed.body_offset()..total];
        let mut u = Unmarshaller::new(body, fixed.endian);
        for ty in message.signature.types() {
            message.body.push(u.get_value(ty)?);
        }
        if u.position() != body.len() {
            return Err(WireError::invalid_header(format!(
                "body has {} bytes beyond its signature",
                body.len() - u.position()
            )));
        }
        Ok(message)
    }

    fn apply_header_field(&mut self, field: &Value) -> Result<(), WireError> {
        let Value::Struct(parts) = field else {
            return Err(WireError::invalid_header("header field is not a struct"));
        };
        let (Some(Value::Byte(code)), Some(Value::Variant(value))) = (parts.first(), parts.get(1))
        else {
            return Err(WireError::invalid_header("header field is not (yv)"));
        };
        let mismatch = || WireError::invalid_header(format!("header field {code} has wrong type"));
        match (*code, value.as_ref()) {
            (FIELD_PATH, Value::ObjectPath(path)) => self.path = Some(path.clone()),
            (FIELD_INTERFACE, Value::String(s)) => self.interface = Some(s.clone()),
            (FIELD_MEMBER, Value::String(s)) => self.member = Some(s.clone()),
            (FIELD_ERROR_NAME, Value::String(s)) => self.error_name = Some(s.clone()),
            (FIELD_REPLY_SERIAL, Value::UInt32(serial)) => self.reply_serial = Some(*serial),
            (FIELD_DESTINATION, Value::String(s)) => self.destination = Some(s.clone()),
            (FIELD_SENDER, Value::String(s)) => self.sender = Some(s.clone()),
            (FIELD_SIGNATURE, Value::Signature(sig)) => self.signature = sig.clone(),
            (FIELD_PATH..=FIELD_SIGNATURE, _) => return Err(mismatch()),
            // UNIX_FDS and codes from future protocol revisions are ignored.
            _ => {},
        }
        Ok(())
    }
}

fn require(present: bool, field: &'static str) -> Result<(), WireError> {
    if present {
        Ok(())
    } else {
        Err(WireError::MissingHeaderField(field))
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} serial={}", self.message_type, self.serial)?;
        if let Some(reply_serial) = self.reply_serial {
            write!(f, " reply_serial={reply_serial}")?;
        }
        if let Some(path) = &self.path {
            write!(f, " path={path}")?;
        }
        if let Some(interface) = &self.interface {
            write!(f, " interface={interface}")?;
        }
        if let Some(member) = &self.member {
            write!(f, " member={member}")?;
        }
        if let Some(error_name) = &self.error_name {
            write!(f, " error={error_name}")?;
        }
        if let Some(sender) = &self.sender {
            write!(f, " sender={sender}")?;
        }
        if let Some(destination) = &self.destination {
            write!(f, " destination={destination}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    fn ping(serial: u32) -> Message {
        let mut call = Message::method_call("/org/example/Obj", "Ping")
            .unwrap()
            .with_interface("org.example.Iface")
            .with_destination("org.example.Service")
            .with_body(vec![Value::from("hello"), Value::from(42u32)])
            .unwrap();
        call.set_serial(serial);
        call
    }

    #[test]
    fn test_round_trip_is_byte_exact() {
        for endian in [Endian::Little, Endian::Big] {
            let call = ping(7).with_endian(endian);
            let bytes = call.encode().unwrap();
            let decoded = Message::decode(&bytes).unwrap();
            assert_eq!(decoded, call);
            assert_eq!(decoded.encode().unwrap(), bytes);
        }
    }

    #[test]
    fn test_fixed_header_layout() {
        let bytes = ping(0x0102_0304).with_endian(Endian::Little).encode().unwrap();
        assert_eq!(bytes[0], b'l');
        assert_eq!(bytes[1], MessageType::MethodCall as u8);
        assert_eq!(bytes[3], PROTOCOL_VERSION);
        assert_eq!(&bytes[8..12], &0x0102_0304u32.to_le_bytes());
        let fixed = FixedHeader::parse(&bytes).unwrap();
        assert_eq!(fixed.body_offset() % 8, 0);
        assert_eq!(fixed.total_len(), bytes.len());
    }

    #[test]
    fn test_reply_carries_reply_serial() {
        let mut call = ping(9);
        call.set_sender(Some(":1.4".to_string()));
        let mut reply = Message::method_return(&call);
        reply.set_serial(1);
        assert_eq!(reply.reply_serial(), Some(9));
        assert_eq!(reply.destination(), Some(":1.4"));
        let decoded = Message::decode(&reply.encode().unwrap()).unwrap();
        assert_eq!(decoded.reply_serial(), Some(9));

        let error = Message::error(&call, "org.example.Error.Failed", "boom");
        assert_eq!(error.error_text(), Some("boom"));
        assert_eq!(error.signature().as_str(), "s");
    }

    #[test]
    fn test_newer_version_is_fatal() {
        let mut bytes = ping(1).encode().unwrap();
        bytes[3] = PROTOCOL_VERSION + 1;
        assert!(matches!(
            Message::decode(&bytes),
            Err(WireError::UnsupportedVersion { .. })
        ));
    }

    #[test]
    fn test_unknown_type_is_fatal() {
        let mut bytes = ping(1).encode().unwrap();
        bytes[1] = 9;
        assert!(matches!(
            Message::decode(&bytes),
            Err(WireError::UnknownMessageType(9))
        ));
    }

    #[test]
    fn test_missing_required_fields() {
        let mut reply = Message::new(MessageType::MethodReturn);
        reply.set_serial(1);
        assert!(matches!(
            reply.encode(),
            Err(WireError::MissingHeaderField("REPLY_SERIAL"))
        ));
    }

    #[test]
    fn test_unsent_message_has_no_serial() {
        let call = Message::method_call("/", "Ping").unwrap();
        assert!(call.encode().is_err());
    }

    proptest! {
        #[test]
        fn prop_basic_bodies_round_trip(
            byte in any::<u8>(),
            flag in any::<bool>(),
            small in any::<i16>(),
            word in any::<u32>(),
            wide in any::<i64>(),
            text in "[a-zA-Z0-9 ]{0,40}",
            items in proptest::collection::vec("[a-z]{0,8}", 0..6),
            serial in 1u32..,
            big_endian in any::<bool>(),
        ) {
            let endian = if big_endian { Endian::Big } else { Endian::Little };
            let mut signal = Message::signal("/a/b", "org.example.Sig", "Changed")
                .unwrap()
                .with_endian(endian)
                .with_body(vec![
                    Value::Byte(byte),
                    Value::Boolean(flag),
                    Value::Int16(small),
                    Value::UInt32(word),
                    Value::Int64(wide),
                    Value::String(text),
                    Value::string_array(items),
                ])
                .unwrap();
            signal.set_serial(serial);
            let bytes = signal.encode().unwrap();
            let decoded = Message::decode(&bytes).unwrap();
            prop_assert_eq!(&decoded, &signal);
            prop_assert_eq!(decoded.encode().unwrap(), bytes);
        }
    }
}
