use {
    crate::{
        names::{
            validate_bus_name, validate_error_name, validate_interface_name,
            validate_member_name,
        },
        types::Args,
        unmarshal::Reader,
        Array, Endian, Error, Fd, ObjectPath, Signature, Type, Value, Writer,
    },
    std::{
        fmt::{self, Display, Formatter},
        num::NonZeroU32,
        ops::{BitOr, BitOrAssign},
    },
};

/// The maximum size of a complete message.
pub const MAX_MESSAGE_LEN: usize = 128 << 20;
/// The maximum size of the header field array.
pub const MAX_HEADER_FIELDS_LEN: usize = 64 << 10;
/// The length of the fixed header including the length of the field array.
pub const FIXED_HEADER_LEN: usize = 16;

const PROTOCOL_VERSION: u8 = 1;

const HDR_PATH: u8 = 1;
const HDR_INTERFACE: u8 = 2;
const HDR_MEMBER: u8 = 3;
const HDR_ERROR_NAME: u8 = 4;
const HDR_REPLY_SERIAL: u8 = 5;
const HDR_DESTINATION: u8 = 6;
const HDR_SENDER: u8 = 7;
const HDR_SIGNATURE: u8 = 8;
const HDR_UNIX_FDS: u8 = 9;

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum MessageType {
    MethodCall = 1,
    MethodReturn = 2,
    Error = 3,
    Signal = 4,
}

impl MessageType {
    fn from_u8(v: u8) -> Result<Self, Error> {
        let ty = match v {
            1 => Self::MethodCall,
            2 => Self::MethodReturn,
            3 => Self::Error,
            4 => Self::Signal,
            _ => return Err(Error::InvalidMessageType(v)),
        };
        Ok(ty)
    }

    /// The name used for the `type` key of match rules.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::MethodCall => "method_call",
            Self::MethodReturn => "method_return",
            Self::Error => "error",
            Self::Signal => "signal",
        }
    }
}

impl Display for MessageType {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Flags(u8);

impl Flags {
    pub const NONE: Self = Self(0);
    pub const NO_REPLY_EXPECTED: Self = Self(1);
    pub const NO_AUTO_START: Self = Self(2);
    pub const ALLOW_INTERACTIVE_AUTH: Self = Self(4);

    pub fn bits(self) -> u8 {
        self.0
    }

    /// Unknown bits are preserved.
    pub fn from_bits(bits: u8) -> Self {
        Self(bits)
    }

    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for Flags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self::Output {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for Flags {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

/// The header of a message.
#[derive(Clone, Debug, PartialEq)]
pub struct Header {
    pub kind: MessageType,
    pub flags: Flags,
    /// Zero until the message has been sent or received.
    pub serial: u32,
    pub reply_serial: Option<NonZeroU32>,
    pub path: Option<ObjectPath>,
    pub interface: Option<String>,
    pub member: Option<String>,
    pub error_name: Option<String>,
    pub destination: Option<String>,
    pub sender: Option<String>,
    pub unix_fds: u32,
}

impl Header {
    fn new(kind: MessageType) -> Self {
        Self {
            kind,
            flags: Flags::NONE,
            serial: 0,
            reply_serial: None,
            path: None,
            interface: None,
            member: None,
            error_name: None,
            destination: None,
            sender: None,
            unix_fds: 0,
        }
    }

    fn check_required(&self) -> Result<(), Error> {
        let missing = |present: bool, name| match present {
            true => Ok(()),
            false => Err(Error::MissingHeader(name)),
        };
        match self.kind {
            MessageType::MethodCall => {
                missing(self.path.is_some(), "path")?;
                missing(self.member.is_some(), "member")?;
            }
            MessageType::MethodReturn => {
                missing(self.reply_serial.is_some(), "reply-serial")?;
            }
            MessageType::Error => {
                missing(self.error_name.is_some(), "error-name")?;
                missing(self.reply_serial.is_some(), "reply-serial")?;
            }
            MessageType::Signal => {
                missing(self.path.is_some(), "path")?;
                missing(self.interface.is_some(), "interface")?;
                missing(self.member.is_some(), "member")?;
            }
        }
        Ok(())
    }
}

/// A D-Bus message.
///
/// Names set through the builder methods are validated by [`Message::encode`].
#[derive(Clone, Debug, PartialEq)]
pub struct Message {
    header: Header,
    endian: Endian,
    signature: Signature,
    body: Vec<Value>,
}

impl Message {
    fn new(kind: MessageType) -> Self {
        Self {
            header: Header::new(kind),
            endian: Endian::NATIVE,
            signature: Signature::empty(),
            body: vec![],
        }
    }

    /// A message with `header` and an empty body.
    pub fn from_header(header: Header) -> Self {
        Self {
            header,
            ..Self::new(MessageType::MethodCall)
        }
    }

    pub fn method_call(path: ObjectPath, member: impl Into<String>) -> Self {
        let mut msg = Self::new(MessageType::MethodCall);
        msg.header.path = Some(path);
        msg.header.member = Some(member.into());
        msg
    }

    pub fn signal(
        path: ObjectPath,
        interface: impl Into<String>,
        member: impl Into<String>,
    ) -> Self {
        let mut msg = Self::new(MessageType::Signal);
        msg.header.path = Some(path);
        msg.header.interface = Some(interface.into());
        msg.header.member = Some(member.into());
        msg
    }

    fn reply_to(kind: MessageType, call: &Message) -> Self {
        let mut msg = Self::new(kind);
        msg.header.reply_serial = NonZeroU32::new(call.header.serial);
        msg.header.destination = call.header.sender.clone();
        msg
    }

    /// Creates a return for `call`, addressed to its sender.
    pub fn method_return(call: &Message) -> Self {
        Self::reply_to(MessageType::MethodReturn, call)
    }

    /// Creates an error reply for `call`. A non-empty `message` becomes the first body
    /// value.
    pub fn error(call: &Message, name: impl Into<String>, message: &str) -> Self {
        let mut msg = Self::reply_to(MessageType::Error, call);
        msg.header.error_name = Some(name.into());
        if !message.is_empty() {
            msg = msg.with_body(vec![Value::String(message.to_string())]);
        }
        msg
    }

    pub fn with_interface(mut self, interface: impl Into<String>) -> Self {
        self.header.interface = Some(interface.into());
        self
    }

    pub fn with_destination(mut self, destination: impl Into<String>) -> Self {
        self.header.destination = Some(destination.into());
        self
    }

    pub fn with_sender(mut self, sender: impl Into<String>) -> Self {
        self.header.sender = Some(sender.into());
        self
    }

    pub fn with_flags(mut self, flags: Flags) -> Self {
        self.header.flags |= flags;
        self
    }

    pub fn with_reply_serial(mut self, serial: NonZeroU32) -> Self {
        self.header.reply_serial = Some(serial);
        self
    }

    /// Replaces the body. The signature is derived from the values.
    pub fn with_body(mut self, body: Vec<Value>) -> Self {
        let types = body.iter().map(|v| v.ty()).collect();
        // An invalid signature is reported by encode.
        self.signature = Signature::from_types(types).unwrap_or_default();
        self.body = body;
        self
    }

    pub fn with_args<A: Args>(self, args: A) -> Self {
        self.with_body(args.into_body())
    }

    pub fn header(&self) -> &Header {
        &self.header
    }

    pub fn kind(&self) -> MessageType {
        self.header.kind
    }

    pub fn flags(&self) -> Flags {
        self.header.flags
    }

    pub fn serial(&self) -> u32 {
        self.header.serial
    }

    pub fn reply_serial(&self) -> Option<NonZeroU32> {
        self.header.reply_serial
    }

    pub fn path(&self) -> Option<&ObjectPath> {
        self.header.path.as_ref()
    }

    pub fn interface(&self) -> Option<&str> {
        self.header.interface.as_deref()
    }

    pub fn member(&self) -> Option<&str> {
        self.header.member.as_deref()
    }

    pub fn error_name(&self) -> Option<&str> {
        self.header.error_name.as_deref()
    }

    pub fn destination(&self) -> Option<&str> {
        self.header.destination.as_deref()
    }

    pub fn sender(&self) -> Option<&str> {
        self.header.sender.as_deref()
    }

    pub fn endian(&self) -> Endian {
        self.endian
    }

    pub fn signature(&self) -> &Signature {
        &self.signature
    }

    pub fn body(&self) -> &[Value] {
        &self.body
    }

    pub fn into_body(self) -> Vec<Value> {
        self.body
    }

    /// Moves the body out, leaving an empty body and signature behind.
    pub fn take_body(&mut self) -> Vec<Value> {
        self.signature = Signature::empty();
        std::mem::take(&mut self.body)
    }

    /// Converts the body into typed arguments.
    pub fn args<A: Args>(&self) -> Result<A, Error> {
        A::from_body(self.body.clone())
    }

    /// Returns whether the sender wants a reply.
    pub fn expects_reply(&self) -> bool {
        self.header.kind == MessageType::MethodCall
            && !self.header.flags.contains(Flags::NO_REPLY_EXPECTED)
    }

    /// The first body value if it is a string. Used as the text of error replies.
    pub fn error_message(&self) -> Option<&str> {
        match self.body.first() {
            Some(Value::String(s)) => Some(s),
            _ => None,
        }
    }

    fn validate(&self) -> Result<(), Error> {
        self.header.check_required()?;
        if let Some(interface) = &self.header.interface {
            validate_interface_name(interface)?;
        }
        if let Some(member) = &self.header.member {
            validate_member_name(member)?;
        }
        if let Some(name) = &self.header.error_name {
            validate_error_name(name)?;
        }
        if let Some(name) = &self.header.destination {
            validate_bus_name(name)?;
        }
        if let Some(name) = &self.header.sender {
            validate_bus_name(name)?;
        }
        let types: Vec<_> = self.body.iter().map(|v| v.ty()).collect();
        if types.as_slice() != self.signature.types() {
            // with_body fell back to the empty signature
            Signature::from_types(types)?;
        }
        Ok(())
    }

    /// Serializes the message with the given serial.
    ///
    /// Returns the frame and the file descriptors that must accompany it.
    pub fn encode(&self, serial: NonZeroU32) -> Result<(Vec<u8>, Vec<Fd>), Error> {
        self.validate()?;
        let mut body = Writer::new(self.endian);
        for value in &self.body {
            body.write_value(value)?;
        }
        let (body, fds) = body.into_parts();

        let mut fields = vec![];
        let mut field = |code: u8, value: Value| {
            fields.push(Value::Struct(vec![Value::Byte(code), value.into_variant()]));
        };
        let h = &self.header;
        if let Some(path) = &h.path {
            field(HDR_PATH, Value::ObjectPath(path.clone()));
        }
        if let Some(v) = &h.interface {
            field(HDR_INTERFACE, Value::String(v.clone()));
        }
        if let Some(v) = &h.member {
            field(HDR_MEMBER, Value::String(v.clone()));
        }
        if let Some(v) = &h.error_name {
            field(HDR_ERROR_NAME, Value::String(v.clone()));
        }
        if let Some(v) = h.reply_serial {
            field(HDR_REPLY_SERIAL, Value::Uint32(v.get()));
        }
        if let Some(v) = &h.destination {
            field(HDR_DESTINATION, Value::String(v.clone()));
        }
        if let Some(v) = &h.sender {
            field(HDR_SENDER, Value::String(v.clone()));
        }
        if !self.signature.is_empty() {
            field(HDR_SIGNATURE, Value::Signature(self.signature.clone()));
        }
        if !fds.is_empty() {
            field(HDR_UNIX_FDS, Value::Uint32(fds.len() as u32));
        }

        let mut w = Writer::new(self.endian);
        w.write_u8(self.endian.marker());
        w.write_u8(h.kind as u8);
        w.write_u8(h.flags.bits());
        w.write_u8(PROTOCOL_VERSION);
        w.write_u32(body.len() as u32);
        w.write_u32(serial.get());
        let fields = Array::new_unchecked(field_type(), fields);
        w.write_value(&Value::Array(fields))?;
        if w.len() - FIXED_HEADER_LEN > MAX_HEADER_FIELDS_LEN {
            return Err(Error::HeaderTooLong);
        }
        w.pad(8);
        let (mut frame, _) = w.into_parts();
        frame.extend_from_slice(&body);
        if frame.len() > MAX_MESSAGE_LEN {
            return Err(Error::MessageTooLong(frame.len()));
        }
        Ok((frame, fds))
    }

    /// Parses the header of a complete frame without decoding the body.
    pub fn peek_header(frame: &[u8]) -> Result<Header, Error> {
        parse_header(frame).map(|p| p.header)
    }

    /// Deserializes a complete frame. `fds` are the descriptors received with it.
    pub fn decode(frame: &[u8], fds: Vec<Fd>) -> Result<Message, Error> {
        let Parsed {
            header,
            endian,
            signature,
            body_start,
            body_len,
        } = parse_header(frame)?;
        if header.unix_fds as usize > fds.len() {
            return Err(Error::FdIndex(header.unix_fds));
        }
        let mut body = Reader::at(&frame[..body_start + body_len], body_start, endian, &fds);
        let body = body.read_body(&signature)?;
        Ok(Message {
            header,
            endian,
            signature,
            body,
        })
    }
}

struct Parsed {
    header: Header,
    endian: Endian,
    signature: Signature,
    body_start: usize,
    body_len: usize,
}

fn parse_header(frame: &[u8]) -> Result<Parsed, Error> {
    let total = frame_length(frame)?.ok_or(Error::UnexpectedEof)?;
    if frame.len() != total {
        return Err(match frame.len() < total {
            true => Error::UnexpectedEof,
            false => Error::TrailingBytes(frame.len() - total),
        });
    }
    let endian = Endian::from_marker(frame[0])?;
    let mut r = Reader::new(frame, endian, &[]);
    r.read_u8()?;
    let kind = MessageType::from_u8(r.read_u8()?)?;
    let flags = Flags::from_bits(r.read_u8()?);
    let version = r.read_u8()?;
    if version != PROTOCOL_VERSION {
        return Err(Error::InvalidProtocol(version));
    }
    let body_len = r.read_u32()? as usize;
    let serial = r.read_u32()?;
    if serial == 0 {
        return Err(Error::ZeroSerial);
    }
    let mut header = Header::new(kind);
    header.flags = flags;
    header.serial = serial;
    let mut signature = Signature::empty();
    let Value::Array(fields) = r.read_value(&Type::Array(Box::new(field_type())))? else {
        return Err(Error::UnexpectedEof);
    };
    for f in fields.into_items() {
        let Value::Struct(f) = f else {
            continue;
        };
        let mut f = f.into_iter();
        let (Some(Value::Byte(code)), Some(value)) = (f.next(), f.next()) else {
            continue;
        };
        let value = value.into_inner();
        let wrong = |value: &Value| Error::HeaderFieldType {
            code,
            actual: value.ty().to_string(),
        };
        match (code, value) {
            (HDR_PATH, Value::ObjectPath(p)) => header.path = Some(p),
            (HDR_INTERFACE, Value::String(s)) => {
                validate_interface_name(&s)?;
                header.interface = Some(s);
            }
            (HDR_MEMBER, Value::String(s)) => {
                validate_member_name(&s)?;
                header.member = Some(s);
            }
            (HDR_ERROR_NAME, Value::String(s)) => {
                validate_error_name(&s)?;
                header.error_name = Some(s);
            }
            (HDR_REPLY_SERIAL, Value::Uint32(v)) => {
                header.reply_serial = Some(NonZeroU32::new(v).ok_or(Error::ZeroSerial)?);
            }
            (HDR_DESTINATION, Value::String(s)) => {
                validate_bus_name(&s)?;
                header.destination = Some(s);
            }
            (HDR_SENDER, Value::String(s)) => {
                validate_bus_name(&s)?;
                header.sender = Some(s);
            }
            (HDR_SIGNATURE, Value::Signature(s)) => signature = s,
            (HDR_UNIX_FDS, Value::Uint32(n)) => header.unix_fds = n,
            (HDR_PATH..=HDR_UNIX_FDS, v) => return Err(wrong(&v)),
            _ => {}
        }
    }
    header.check_required()?;
    r.align(8)?;
    let body_start = r.pos();
    if signature.is_empty() && body_len > 0 {
        return Err(Error::MissingSignature(body_len));
    }
    Ok(Parsed {
        header,
        endian,
        signature,
        body_start,
        body_len,
    })
}

fn field_type() -> Type {
    Type::Struct(vec![Type::Byte, Type::Variant])
}

/// Computes the size of the message starting at `prefix`.
///
/// Returns `None` until the fixed header is available.
pub fn frame_length(prefix: &[u8]) -> Result<Option<usize>, Error> {
    if prefix.len() < FIXED_HEADER_LEN {
        return Ok(None);
    }
    let endian = Endian::from_marker(prefix[0])?;
    let mut r = Reader::at(&prefix[..FIXED_HEADER_LEN], 4, endian, &[]);
    let body_len = r.read_u32()? as usize;
    r.read_u32()?;
    let fields_len = r.read_u32()? as usize;
    if fields_len > MAX_HEADER_FIELDS_LEN {
        return Err(Error::HeaderTooLong);
    }
    let total = (FIXED_HEADER_LEN + fields_len).next_multiple_of(8) + body_len;
    if total > MAX_MESSAGE_LEN {
        return Err(Error::MessageTooLong(total));
    }
    Ok(Some(total))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn serial(n: u32) -> NonZeroU32 {
        NonZeroU32::new(n).unwrap()
    }

    fn call() -> Message {
        Message::method_call(ObjectPath::root(), "upper")
            .with_interface("org.example.interface")
            .with_destination("org.example.Echo")
            .with_args(("test string".to_string(),))
    }

    #[test]
    fn round_trip() {
        for endian in [Endian::Little, Endian::Big] {
            let mut msg = call();
            msg.endian = endian;
            let (frame, fds) = msg.encode(serial(7)).unwrap();
            assert_eq!(frame.len(), frame_length(&frame).unwrap().unwrap());
            let back = Message::decode(&frame, fds).unwrap();
            assert_eq!(back.serial(), 7);
            assert_eq!(back.endian(), endian);
            assert_eq!(back.member(), Some("upper"));
            assert_eq!(back.signature(), "s");
            assert_eq!(back.args::<(String,)>().unwrap().0, "test string");
            let (again, _) = back.encode(serial(7)).unwrap();
            assert_eq!(again, frame);
        }
    }

    #[test]
    fn body_is_eight_aligned() {
        let (frame, _) = call().encode(serial(1)).unwrap();
        let body_len = u32::from_ne_bytes(frame[4..8].try_into().unwrap()) as usize;
        assert_eq!((frame.len() - body_len) % 8, 0);
    }

    #[test]
    fn replies() {
        let mut c = call().with_sender(":1.5");
        c.header.serial = 3;
        let ret = Message::method_return(&c).with_args(("X".to_string(),));
        assert_eq!(ret.reply_serial(), Some(serial(3)));
        assert_eq!(ret.destination(), Some(":1.5"));
        let err = Message::error(&c, "org.freedesktop.DBus.Error.Failed", "boom");
        let (frame, _) = err.encode(serial(4)).unwrap();
        let err = Message::decode(&frame, vec![]).unwrap();
        assert_eq!(err.kind(), MessageType::Error);
        assert_eq!(err.error_message(), Some("boom"));
    }

    #[test]
    fn required_fields() {
        let signal = Message::new(MessageType::Signal);
        assert!(matches!(
            signal.encode(serial(1)),
            Err(Error::MissingHeader("path"))
        ));
        let ret = Message::new(MessageType::MethodReturn);
        assert!(matches!(
            ret.encode(serial(1)),
            Err(Error::MissingHeader("reply-serial"))
        ));
        // a method call frame with the member field removed
        let (mut frame, _) = Message::method_call(ObjectPath::root(), "Ping")
            .encode(serial(1))
            .unwrap();
        let idx = frame.windows(4).position(|w| w == b"Ping").unwrap();
        // header field code of the member field precedes its variant signature
        frame[idx - 8] = 100;
        assert!(matches!(
            Message::decode(&frame, vec![]),
            Err(Error::MissingHeader("member"))
        ));
    }

    #[test]
    fn invalid_names_rejected() {
        let msg = Message::method_call(ObjectPath::root(), "bad.member");
        assert!(matches!(
            msg.encode(serial(1)),
            Err(Error::InvalidMemberName(_))
        ));
        let msg = call().with_destination("nodots");
        assert!(matches!(msg.encode(serial(1)), Err(Error::InvalidBusName(_))));
    }

    #[test]
    fn frame_length_needs_prefix() {
        let (frame, _) = call().encode(serial(1)).unwrap();
        assert_eq!(frame_length(&frame[..15]).unwrap(), None);
        assert_eq!(frame_length(&frame[..16]).unwrap(), Some(frame.len()));
        let mut huge = frame[..16].to_vec();
        huge[4..8].copy_from_slice(&u32::MAX.to_ne_bytes());
        assert!(matches!(
            frame_length(&huge),
            Err(Error::MessageTooLong(_))
        ));
    }
}
