use thiserror::Error;

/// A signature could not be parsed.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum SignatureError {
    #[error("Signature is longer than 255 bytes")]
    TooLong,
    #[error("Signature contains an invalid type code `{}`", char::from(*.0))]
    UnknownType(u8),
    #[error("Array type is not followed by an element type")]
    MissingArrayElement,
    #[error("Struct signature does not contain a terminating ')'")]
    UnterminatedStruct,
    #[error("Struct signature contains no fields")]
    EmptyStruct,
    #[error("Dict entry signature does not contain a terminating '}}'")]
    UnterminatedDictEntry,
    #[error("Dict entry must contain exactly two types")]
    DictEntryArity,
    #[error("Dict entry key must be a basic type")]
    DictEntryKey,
    #[error("Dict entry is only allowed as an array element")]
    DictEntryOutsideArray,
    #[error("Unbalanced `{}` in signature", char::from(*.0))]
    Unbalanced(u8),
    #[error("Arrays are nested more than 32 levels deep")]
    ArrayDepth,
    #[error("Structs are nested more than 32 levels deep")]
    StructDepth,
    #[error("Signature must contain exactly one complete type")]
    NotSingle,
    #[error("Signature is not valid UTF-8")]
    InvalidUtf8,
    /// A peer rejected a signature with this explanation.
    #[error("{0}")]
    Reported(String),
}

/// A value or message could not be encoded or decoded.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    #[error(transparent)]
    Signature(#[from] SignatureError),
    #[error("Unexpected end of message")]
    UnexpectedEof,
    #[error("String does not contain valid UTF-8")]
    InvalidUtf8,
    #[error("String contains an embedded NUL byte")]
    EmbeddedNul,
    #[error("String is not terminated by a NUL byte")]
    MissingNul,
    #[error("Boolean value was {0} instead of 0 or 1")]
    InvalidBool(u32),
    #[error("Alignment padding contains non-zero bytes")]
    NonZeroPadding,
    #[error("Array of {0} bytes exceeds the 64 MiB limit")]
    ArrayTooLong(usize),
    #[error("Array length does not end on an element boundary")]
    ArrayLength,
    #[error("Array element has type `{actual}` instead of `{expected}`")]
    ArrayElement { expected: String, actual: String },
    #[error("Invalid object path `{0}`")]
    InvalidObjectPath(String),
    #[error("Invalid bus name `{0}`")]
    InvalidBusName(String),
    #[error("Invalid interface name `{0}`")]
    InvalidInterfaceName(String),
    #[error("Invalid member name `{0}`")]
    InvalidMemberName(String),
    #[error("Invalid error name `{0}`")]
    InvalidErrorName(String),
    #[error("Unix fd index {0} is out of bounds")]
    FdIndex(u32),
    #[error("Expected a value of type `{expected}` but found `{actual}`")]
    TypeMismatch { expected: String, actual: String },
    #[error("Expected {expected} body values but found {actual}")]
    BodyArity { expected: usize, actual: usize },
    #[error("Invalid endianness marker {0:#04x}")]
    InvalidEndianness(u8),
    #[error("Unknown message type {0}")]
    InvalidMessageType(u8),
    #[error("Unsupported protocol version {0}")]
    InvalidProtocol(u8),
    #[error("Message has serial 0")]
    ZeroSerial,
    #[error("Message is missing the required `{0}` header field")]
    MissingHeader(&'static str),
    #[error("Header field {code} has type `{actual}`")]
    HeaderFieldType { code: u8, actual: String },
    #[error("Header fields exceed the 64 KiB limit")]
    HeaderTooLong,
    #[error("Message of {0} bytes exceeds the size limit")]
    MessageTooLong(usize),
    #[error("Message body has no signature but {0} bytes of data")]
    MissingSignature(usize),
    #[error("Message body has {0} trailing bytes")]
    TrailingBytes(usize),
    #[error("Variants are nested too deeply")]
    VariantDepth,
    /// A peer rejected a message with this explanation.
    #[error("{0}")]
    Reported(String),
}
