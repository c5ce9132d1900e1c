//! Calls to the message bus itself.

use {
    crate::{
        connection::{decode_args, Connection},
        Error, RequestNameError,
    },
    buslane_wire::{names::validate_well_known_name, Message, ObjectPath},
    std::ops::BitOr,
};

pub const DBUS_NAME: &str = "org.freedesktop.DBus";
pub const DBUS_PATH: &str = "/org/freedesktop/DBus";
pub const DBUS_INTERFACE: &str = "org.freedesktop.DBus";

const REPLY_PRIMARY_OWNER: u32 = 1;
const REPLY_IN_QUEUE: u32 = 2;
const REPLY_EXISTS: u32 = 3;
const REPLY_ALREADY_OWNER: u32 = 4;

/// Creates a call to a method of the bus.
pub(crate) fn bus_call(member: &str) -> Message {
    Message::method_call(ObjectPath::from_static_unchecked(DBUS_PATH), member)
        .with_destination(DBUS_NAME)
        .with_interface(DBUS_INTERFACE)
}

/// Flags of a `RequestName` call.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct RequestNameFlags(u32);

impl RequestNameFlags {
    pub const NONE: Self = Self(0);
    /// Another connection may take the name over.
    pub const ALLOW_REPLACEMENT: Self = Self(1);
    /// Take the name over if the current owner allows replacement.
    pub const REPLACE_EXISTING: Self = Self(2);
    /// Fail instead of queueing if the name is owned.
    pub const DO_NOT_QUEUE: Self = Self(4);

    pub fn bits(self) -> u32 {
        self.0
    }

    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for RequestNameFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self::Output {
        Self(self.0 | rhs.0)
    }
}

/// A successful `RequestName` call.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum RequestNameReply {
    /// The connection became the primary owner.
    PrimaryOwner,
    /// The connection already owned the name with the same flags.
    AlreadyOwner,
}

impl Connection {
    fn record_request(
        &self,
        name: &str,
        flags: RequestNameFlags,
        code: u32,
    ) -> Result<RequestNameReply, Error> {
        let mut state = self.shared.state.lock();
        match code {
            REPLY_PRIMARY_OWNER => {
                state.names.insert(name.to_string(), flags);
                Ok(RequestNameReply::PrimaryOwner)
            }
            REPLY_ALREADY_OWNER => {
                let previous = state.names.entry(name.to_string()).or_insert(flags);
                match *previous == flags {
                    true => Ok(RequestNameReply::AlreadyOwner),
                    false => Err(RequestNameError::AlreadyOwner(name.to_string()).into()),
                }
            }
            REPLY_IN_QUEUE => Err(RequestNameError::InQueue(name.to_string()).into()),
            REPLY_EXISTS => Err(RequestNameError::Exists(name.to_string()).into()),
            code => Err(Error::failed(format!(
                "RequestName returned the unknown code {code}"
            ))),
        }
    }

    fn request_name_call(name: &str, flags: RequestNameFlags) -> Result<Message, Error> {
        validate_well_known_name(name)?;
        Ok(bus_call("RequestName").with_args((name.to_string(), flags.bits())))
    }

    /// Requests a well-known name.
    ///
    /// Requesting a name that this connection already owns with the same flags
    /// succeeds with [RequestNameReply::AlreadyOwner]. All other outcomes that do not
    /// make this connection the owner are reported as [RequestNameError]s.
    pub async fn request_name(
        &self,
        name: &str,
        flags: RequestNameFlags,
    ) -> Result<RequestNameReply, Error> {
        let msg = Self::request_name_call(name, flags)?;
        let (code,) = self.call_message(&msg).map(decode_args::<(u32,)>).await?;
        self.record_request(name, flags, code)
    }

    pub fn request_name_blocking(
        &self,
        name: &str,
        flags: RequestNameFlags,
    ) -> Result<RequestNameReply, Error> {
        let msg = Self::request_name_call(name, flags)?;
        let (code,) = decode_args::<(u32,)>(self.call_message_blocking(&msg)?)?;
        self.record_request(name, flags, code)
    }

    /// Releases a well-known name.
    ///
    /// The bus accepts the release whether or not this connection owned the name.
    pub async fn release_name(&self, name: &str) -> Result<(), Error> {
        validate_well_known_name(name)?;
        self.shared.state.lock().names.remove(name);
        let msg = bus_call("ReleaseName").with_args((name.to_string(),));
        self.call_message(&msg).await?;
        Ok(())
    }

    pub fn release_name_blocking(&self, name: &str) -> Result<(), Error> {
        validate_well_known_name(name)?;
        self.shared.state.lock().names.remove(name);
        let msg = bus_call("ReleaseName").with_args((name.to_string(),));
        self.call_message_blocking(&msg)?;
        Ok(())
    }

    /// The well-known names owned by this connection.
    pub fn owned_names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.shared.state.lock().names.keys().cloned().collect();
        names.sort();
        names
    }

    /// The unique name of the owner of `name`.
    pub async fn get_name_owner(&self, name: &str) -> Result<String, Error> {
        let msg = bus_call("GetNameOwner").with_args((name.to_string(),));
        let (owner,) = self.call_message(&msg).map(decode_args::<(String,)>).await?;
        Ok(owner)
    }

    pub fn get_name_owner_blocking(&self, name: &str) -> Result<String, Error> {
        let msg = bus_call("GetNameOwner").with_args((name.to_string(),));
        let (owner,) = decode_args(self.call_message_blocking(&msg)?)?;
        Ok(owner)
    }

    pub async fn name_has_owner(&self, name: &str) -> Result<bool, Error> {
        let msg = bus_call("NameHasOwner").with_args((name.to_string(),));
        let (has,) = self.call_message(&msg).map(decode_args::<(bool,)>).await?;
        Ok(has)
    }

    pub fn name_has_owner_blocking(&self, name: &str) -> Result<bool, Error> {
        let msg = bus_call("NameHasOwner").with_args((name.to_string(),));
        let (has,) = decode_args(self.call_message_blocking(&msg)?)?;
        Ok(has)
    }

    /// The names currently on the bus.
    pub async fn list_names(&self) -> Result<Vec<String>, Error> {
        let msg = bus_call("ListNames");
        let (names,) = self.call_message(&msg).map(decode_args::<(Vec<String>,)>).await?;
        Ok(names)
    }

    pub fn list_names_blocking(&self) -> Result<Vec<String>, Error> {
        let (names,) = decode_args(self.call_message_blocking(&bus_call("ListNames"))?)?;
        Ok(names)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags() {
        let f = RequestNameFlags::ALLOW_REPLACEMENT | RequestNameFlags::DO_NOT_QUEUE;
        assert_eq!(f.bits(), 5);
        assert!(f.contains(RequestNameFlags::DO_NOT_QUEUE));
        assert!(!f.contains(RequestNameFlags::REPLACE_EXISTING));
    }

    #[test]
    fn bus_calls_are_addressed_to_the_bus() {
        let msg = bus_call("Hello");
        assert_eq!(msg.destination(), Some(DBUS_NAME));
        assert_eq!(msg.interface(), Some(DBUS_INTERFACE));
        assert_eq!(msg.path().map(|p| p.as_str()), Some(DBUS_PATH));
        assert_eq!(msg.member(), Some("Hello"));
    }
}
