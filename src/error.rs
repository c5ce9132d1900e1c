use {
    buslane_wire::{Message, SignatureError},
    std::{
        fmt::{self, Display, Formatter},
        io,
        num::NonZeroU32,
    },
    thiserror::Error,
};

pub const ERR_FAILED: &str = "org.freedesktop.DBus.Error.Failed";
pub const ERR_NO_REPLY: &str = "org.freedesktop.DBus.Error.NoReply";
pub const ERR_TIMEOUT: &str = "org.freedesktop.DBus.Error.Timeout";
pub const ERR_DISCONNECTED: &str = "org.freedesktop.DBus.Error.Disconnected";
pub const ERR_ACCESS_DENIED: &str = "org.freedesktop.DBus.Error.AccessDenied";
pub const ERR_UNKNOWN_METHOD: &str = "org.freedesktop.DBus.Error.UnknownMethod";
pub const ERR_UNKNOWN_OBJECT: &str = "org.freedesktop.DBus.Error.UnknownObject";
pub const ERR_UNKNOWN_INTERFACE: &str = "org.freedesktop.DBus.Error.UnknownInterface";
pub const ERR_UNKNOWN_PROPERTY: &str = "org.freedesktop.DBus.Error.UnknownProperty";
pub const ERR_PROPERTY_READ_ONLY: &str = "org.freedesktop.DBus.Error.PropertyReadOnly";
pub const ERR_INVALID_ARGS: &str = "org.freedesktop.DBus.Error.InvalidArgs";
pub const ERR_INVALID_SIGNATURE: &str = "org.freedesktop.DBus.Error.InvalidSignature";
pub const ERR_INCONSISTENT_MESSAGE: &str = "org.freedesktop.DBus.Error.InconsistentMessage";
pub const ERR_MATCH_RULE_INVALID: &str = "org.freedesktop.DBus.Error.MatchRuleInvalid";
pub const ERR_NAME_HAS_NO_OWNER: &str = "org.freedesktop.DBus.Error.NameHasNoOwner";
pub const ERR_REQUEST_NAME_ALREADY_OWNER: &str = "org.buslane.RequestName.AlreadyOwner";
pub const ERR_REQUEST_NAME_EXISTS: &str = "org.buslane.RequestName.Exists";
pub const ERR_REQUEST_NAME_IN_QUEUE: &str = "org.buslane.RequestName.InQueue";

const STANDARD_PREFIX: &str = "org.freedesktop.DBus.Error.";

/// An error received from or sent to a peer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RemoteError {
    /// The full D-Bus error name.
    pub name: String,
    /// The first string of the error body, or an empty string.
    pub message: String,
    /// The serial of the call this error replied to.
    pub reply_serial: Option<NonZeroU32>,
}

impl RemoteError {
    pub fn new(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            message: message.into(),
            reply_serial: None,
        }
    }

    /// Extracts the error from an error message.
    pub fn from_message(msg: &Message) -> Self {
        Self {
            name: msg.error_name().unwrap_or(ERR_FAILED).to_string(),
            message: msg.error_message().unwrap_or_default().to_string(),
            reply_serial: msg.reply_serial(),
        }
    }
}

impl Display for RemoteError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self.message.is_empty() {
            true => f.write_str(&self.name),
            false => write!(f, "{}: {}", self.name, self.message),
        }
    }
}

/// A `RequestName` call did not make this connection the primary owner.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum RequestNameError {
    /// The connection already owns the name with different flags.
    #[error("The connection already owns `{0}`")]
    AlreadyOwner(String),
    /// The name is owned by another connection and the request was not queued.
    #[error("The name `{0}` is owned by another connection")]
    Exists(String),
    /// The request was queued behind the current owner.
    #[error("The request for `{0}` was queued")]
    InQueue(String),
    /// A peer replied with one of the errors above.
    ///
    /// The requested name is not transmitted, so only the remote error is known.
    #[error("{0}")]
    Remote(RemoteError),
}

impl RequestNameError {
    pub fn dbus_name(&self) -> &str {
        match self {
            RequestNameError::AlreadyOwner(_) => ERR_REQUEST_NAME_ALREADY_OWNER,
            RequestNameError::Exists(_) => ERR_REQUEST_NAME_EXISTS,
            RequestNameError::InQueue(_) => ERR_REQUEST_NAME_IN_QUEUE,
            RequestNameError::Remote(r) => &r.name,
        }
    }

    /// The bus name that was requested, if it is known.
    pub fn name(&self) -> Option<&str> {
        match self {
            RequestNameError::AlreadyOwner(n)
            | RequestNameError::Exists(n)
            | RequestNameError::InQueue(n) => Some(n),
            RequestNameError::Remote(_) => None,
        }
    }
}

/// An error.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// The connection is closed.
    #[error("The connection has been closed")]
    Disconnected,
    /// No reply arrived before the call timed out.
    #[error("The call timed out")]
    Timeout,
    /// A message could not be encoded or decoded.
    #[error("Invalid message")]
    InvalidMessage(#[source] buslane_wire::Error),
    /// A signature could not be parsed or does not match.
    #[error("Invalid signature")]
    InvalidSignature(#[source] SignatureError),
    /// The operation is not allowed in the current state or mode.
    #[error("Misuse: {0}")]
    Misuse(String),
    #[error("{0}")]
    UnknownMethod(RemoteError),
    #[error("{0}")]
    UnknownObject(RemoteError),
    #[error("{0}")]
    UnknownInterface(RemoteError),
    #[error("{0}")]
    UnknownProperty(RemoteError),
    #[error("{0}")]
    PropertyReadOnly(RemoteError),
    #[error("{0}")]
    InvalidArgs(RemoteError),
    #[error("{0}")]
    AccessDenied(RemoteError),
    #[error("{0}")]
    NoReply(RemoteError),
    #[error("{0}")]
    Failed(RemoteError),
    #[error(transparent)]
    RequestName(#[from] RequestNameError),
    /// An error name without a more specific variant.
    #[error("{0}")]
    Remote(RemoteError),
    #[error("An I/O error occurred")]
    Io(#[from] io::Error),
    #[error("Authentication failed: {0}")]
    Auth(String),
    #[error("Invalid bus address: {0}")]
    Address(String),
    #[error("Interface `{interface}` is already exported at `{path}`")]
    AlreadyExported { path: String, interface: String },
    #[error("Invalid interface descriptor: {0}")]
    InvalidDescriptor(String),
}

impl From<buslane_wire::Error> for Error {
    fn from(value: buslane_wire::Error) -> Self {
        match value {
            buslane_wire::Error::Signature(e) => Error::InvalidSignature(e),
            e => Error::InvalidMessage(e),
        }
    }
}

impl From<SignatureError> for Error {
    fn from(value: SignatureError) -> Self {
        Error::InvalidSignature(value)
    }
}

impl Error {
    /// Maps an error received from a peer to the matching variant.
    pub fn from_remote(remote: RemoteError) -> Self {
        let ctor: fn(RemoteError) -> Error = match &*remote.name {
            ERR_TIMEOUT => return Error::Timeout,
            ERR_DISCONNECTED => return Error::Disconnected,
            ERR_INVALID_SIGNATURE => {
                return Error::InvalidSignature(SignatureError::Reported(remote.message))
            }
            ERR_INCONSISTENT_MESSAGE => {
                return Error::InvalidMessage(buslane_wire::Error::Reported(remote.message))
            }
            ERR_UNKNOWN_METHOD => Error::UnknownMethod,
            ERR_UNKNOWN_OBJECT => Error::UnknownObject,
            ERR_UNKNOWN_INTERFACE => Error::UnknownInterface,
            ERR_UNKNOWN_PROPERTY => Error::UnknownProperty,
            ERR_PROPERTY_READ_ONLY => Error::PropertyReadOnly,
            ERR_INVALID_ARGS => Error::InvalidArgs,
            ERR_ACCESS_DENIED => Error::AccessDenied,
            ERR_NO_REPLY => Error::NoReply,
            ERR_FAILED => Error::Failed,
            ERR_REQUEST_NAME_ALREADY_OWNER | ERR_REQUEST_NAME_EXISTS | ERR_REQUEST_NAME_IN_QUEUE => {
                return RequestNameError::Remote(remote).into()
            }
            _ => Error::Remote,
        };
        ctor(remote)
    }

    /// Creates an error with a standard name.
    pub fn failed(message: impl Into<String>) -> Self {
        Error::Failed(RemoteError::new(ERR_FAILED, message))
    }

    pub fn invalid_args(message: impl Into<String>) -> Self {
        Error::InvalidArgs(RemoteError::new(ERR_INVALID_ARGS, message))
    }

    pub fn access_denied(message: impl Into<String>) -> Self {
        Error::AccessDenied(RemoteError::new(ERR_ACCESS_DENIED, message))
    }

    pub fn unknown_method(message: impl Into<String>) -> Self {
        Error::UnknownMethod(RemoteError::new(ERR_UNKNOWN_METHOD, message))
    }

    pub fn unknown_object(message: impl Into<String>) -> Self {
        Error::UnknownObject(RemoteError::new(ERR_UNKNOWN_OBJECT, message))
    }

    pub fn unknown_interface(message: impl Into<String>) -> Self {
        Error::UnknownInterface(RemoteError::new(ERR_UNKNOWN_INTERFACE, message))
    }

    pub fn unknown_property(message: impl Into<String>) -> Self {
        Error::UnknownProperty(RemoteError::new(ERR_UNKNOWN_PROPERTY, message))
    }

    pub fn property_read_only(message: impl Into<String>) -> Self {
        Error::PropertyReadOnly(RemoteError::new(ERR_PROPERTY_READ_ONLY, message))
    }

    /// Creates an error with an arbitrary name.
    ///
    /// Well-known names produce their specific variant.
    pub fn custom(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::from_remote(RemoteError::new(name, message))
    }

    /// The D-Bus error name used when this error is sent to a peer.
    pub fn dbus_name(&self) -> &str {
        match self {
            Error::Disconnected => ERR_DISCONNECTED,
            Error::Timeout => ERR_TIMEOUT,
            Error::InvalidMessage(_) => ERR_INCONSISTENT_MESSAGE,
            Error::InvalidSignature(_) => ERR_INVALID_SIGNATURE,
            Error::UnknownMethod(r)
            | Error::UnknownObject(r)
            | Error::UnknownInterface(r)
            | Error::UnknownProperty(r)
            | Error::PropertyReadOnly(r)
            | Error::InvalidArgs(r)
            | Error::AccessDenied(r)
            | Error::NoReply(r)
            | Error::Failed(r)
            | Error::Remote(r) => &r.name,
            Error::RequestName(e) => e.dbus_name(),
            _ => ERR_FAILED,
        }
    }

    /// Converts this error into the form sent in an error reply.
    pub fn to_remote(&self) -> RemoteError {
        match self {
            Error::UnknownMethod(r)
            | Error::UnknownObject(r)
            | Error::UnknownInterface(r)
            | Error::UnknownProperty(r)
            | Error::PropertyReadOnly(r)
            | Error::InvalidArgs(r)
            | Error::AccessDenied(r)
            | Error::NoReply(r)
            | Error::Failed(r)
            | Error::Remote(r) => r.clone(),
            Error::RequestName(RequestNameError::Remote(r)) => r.clone(),
            Error::InvalidMessage(e) => RemoteError::new(ERR_INCONSISTENT_MESSAGE, e.to_string()),
            Error::InvalidSignature(e) => RemoteError::new(ERR_INVALID_SIGNATURE, e.to_string()),
            e => RemoteError::new(e.dbus_name(), e.to_string()),
        }
    }

    /// The remote error carried by this error, if any.
    pub fn remote(&self) -> Option<&RemoteError> {
        match self {
            Error::UnknownMethod(r)
            | Error::UnknownObject(r)
            | Error::UnknownInterface(r)
            | Error::UnknownProperty(r)
            | Error::PropertyReadOnly(r)
            | Error::InvalidArgs(r)
            | Error::AccessDenied(r)
            | Error::NoReply(r)
            | Error::Failed(r)
            | Error::Remote(r)
            | Error::RequestName(RequestNameError::Remote(r)) => Some(r),
            _ => None,
        }
    }

    pub fn is_request_name(&self) -> bool {
        matches!(self, Error::RequestName(_))
    }

    /// Returns whether the name is one of the `org.freedesktop.DBus.Error` names.
    pub(crate) fn is_standard_name(name: &str) -> bool {
        name.starts_with(STANDARD_PREFIX)
    }
}
