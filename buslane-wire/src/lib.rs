//! The D-Bus wire format: signatures, values, marshalling and messages.

pub use {
    error::{Error, SignatureError},
    marshal::{Endian, Writer, MAX_ARRAY_LEN},
    message::{
        frame_length, Flags, Header, Message, MessageType, FIXED_HEADER_LEN,
        MAX_HEADER_FIELDS_LEN, MAX_MESSAGE_LEN,
    },
    names::ObjectPath,
    signature::{signature_string, Signature, Type},
    types::{single, Args, DbusType, Struct, Variant},
    unmarshal::Reader,
    value::{Array, Fd, Value},
};

mod error;
mod marshal;
mod message;
pub mod names;
mod signature;
mod types;
mod unmarshal;
mod value;
