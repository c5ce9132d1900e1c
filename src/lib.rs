//! A D-Bus client library.
//!
//! A [Connection] talks to a message bus either in [Mode::Blocking], where calls
//! block the calling thread, or in [Mode::Cooperative], where a tokio task owns the
//! socket and calls are futures.
//!
//! Remote objects are accessed through a [Proxy] that checks calls against an
//! [InterfaceDescriptor]. Local objects are exported by binding handlers to a
//! descriptor with [Interface::builder] and passing the result to
//! [Connection::export].
//!
//! ```no_run
//! # async fn f() -> Result<(), buslane::Error> {
//! use buslane::{Connection, InterfaceDescriptor, Proxy};
//!
//! let conn = Connection::session().await?;
//! let descriptor = InterfaceDescriptor::builder("org.example.interface")
//!     .method("upper", "s", "s")
//!     .build()?;
//! let proxy = Proxy::new(&conn, "org.example.service", "/", descriptor)?;
//! let (upper,): (String,) = proxy.call("upper", ("test string".to_string(),)).await?;
//! # Ok(())
//! # }
//! ```

pub use {
    address::BusKind,
    bus::{RequestNameFlags, RequestNameReply},
    buslane_wire as wire,
    buslane_wire::{Args, DbusType, Fd, Message, ObjectPath, Signature, Struct, Type, Value, Variant},
    connection::{CallFuture, Connection, ConnectionBuilder, IntoObjectPath, Mode},
    default_bus::{
        current, default_bus, default_bus_blocking, set_default_bus, set_process_default_bus,
    },
    descriptor::{Access, EmitsChange, InterfaceDescriptor, MethodSpec, PropertySpec, SignalSpec},
    error::{Error, RemoteError, RequestNameError},
    matching::MatchRule,
    object_manager::ObjectManagerHandle,
    proxy::{PropertiesChanged, PropertyChanges, Proxy},
    server::{ExportHandle, Interface, InterfaceBuilder, PendingReply},
    signal::SignalStream,
};

pub mod address;
mod auth;
pub mod bus;
mod connection;
pub mod default_bus;
mod descriptor;
pub mod error;
mod introspect;
mod matching;
mod object_manager;
mod proxy;
mod server;
pub mod settings;
mod signal;
mod socket;
