//! Client-side bindings of interface descriptors.

use {
    crate::{
        connection::{decode_args, Connection, IntoObjectPath},
        default_bus,
        descriptor::{EmitsChange, InterfaceDescriptor, MethodSpec, PropertySpec},
        matching::MatchRule,
        server::{INTROSPECTABLE, PROPERTIES},
        signal::SignalStream,
        Error,
    },
    buslane_wire::{
        names::validate_bus_name, Args, DbusType, Message, ObjectPath, Signature, Value, Variant,
    },
    std::{
        collections::HashMap,
        sync::Arc,
        time::{Duration, Instant},
    },
};

/// A remote object seen through an [InterfaceDescriptor].
///
/// Calls are checked against the descriptor before they are sent.
#[derive(Clone)]
pub struct Proxy {
    conn: Connection,
    destination: String,
    path: ObjectPath,
    descriptor: Arc<InterfaceDescriptor>,
}

/// A `PropertiesChanged` signal.
#[derive(Clone, Debug, PartialEq)]
pub struct PropertiesChanged {
    pub interface: String,
    pub changed: HashMap<String, Value>,
    pub invalidated: Vec<String>,
}

type PropertiesChangedArgs = (String, HashMap<String, Variant>, Vec<String>);

fn decode_properties_changed(msg: Message) -> Result<PropertiesChanged, Error> {
    let (interface, changed, invalidated) = decode_args::<PropertiesChangedArgs>(msg)?;
    Ok(PropertiesChanged {
        interface,
        changed: changed.into_iter().map(|(k, v)| (k, v.0)).collect(),
        invalidated,
    })
}

fn decode_variant(msg: Message) -> Result<Value, Error> {
    let (v,) = decode_args::<(Variant,)>(msg)?;
    Ok(v.0)
}

fn decode_all(msg: Message) -> Result<HashMap<String, Value>, Error> {
    let (props,) = decode_args::<(HashMap<String, Variant>,)>(msg)?;
    Ok(props.into_iter().map(|(k, v)| (k, v.0)).collect())
}

fn decode_string(msg: Message) -> Result<String, Error> {
    let (s,) = decode_args::<(String,)>(msg)?;
    Ok(s)
}

fn check_signature(what: &str, actual: Option<Signature>, declared: &Signature) -> Result<(), Error> {
    match actual {
        Some(actual) if actual != *declared => Err(Error::Misuse(format!(
            "{what} has the signature `{declared}` but was used with `{actual}`"
        ))),
        _ => Ok(()),
    }
}

fn runtime_signature(values: &[Value]) -> Result<Signature, Error> {
    Ok(Signature::from_types(values.iter().map(|v| v.ty()).collect())?)
}

impl Proxy {
    pub fn new(
        conn: &Connection,
        destination: &str,
        path: impl IntoObjectPath,
        descriptor: Arc<InterfaceDescriptor>,
    ) -> Result<Self, Error> {
        validate_bus_name(destination)?;
        Ok(Self {
            conn: conn.clone(),
            destination: destination.to_string(),
            path: path.into_object_path()?,
            descriptor,
        })
    }

    /// Creates a proxy on the default bus of the current context.
    pub async fn new_default(
        destination: &str,
        path: impl IntoObjectPath,
        descriptor: Arc<InterfaceDescriptor>,
    ) -> Result<Self, Error> {
        let conn = default_bus::default_bus().await?;
        Self::new(&conn, destination, path, descriptor)
    }

    pub fn new_default_blocking(
        destination: &str,
        path: impl IntoObjectPath,
        descriptor: Arc<InterfaceDescriptor>,
    ) -> Result<Self, Error> {
        let conn = default_bus::default_bus_blocking()?;
        Self::new(&conn, destination, path, descriptor)
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    pub fn destination(&self) -> &str {
        &self.destination
    }

    pub fn path(&self) -> &ObjectPath {
        &self.path
    }

    pub fn descriptor(&self) -> &Arc<InterfaceDescriptor> {
        &self.descriptor
    }

    fn message(&self, interface: &str, member: &str) -> Message {
        Message::method_call(self.path.clone(), member)
            .with_destination(&*self.destination)
            .with_interface(interface)
    }

    fn method(&self, member: &str) -> Result<&MethodSpec, Error> {
        self.descriptor.method(member).ok_or_else(|| {
            Error::Misuse(format!(
                "`{}` has no method `{member}`",
                self.descriptor.name()
            ))
        })
    }

    fn property(&self, name: &str) -> Result<&PropertySpec, Error> {
        self.descriptor.property(name).ok_or_else(|| {
            Error::Misuse(format!(
                "`{}` has no property `{name}`",
                self.descriptor.name()
            ))
        })
    }

    fn method_call<A: Args, R: Args>(&self, member: &str, args: A) -> Result<Message, Error> {
        let spec = self.method(member)?;
        if spec.no_reply {
            return Err(Error::Misuse(format!(
                "`{member}` does not reply, use `call_no_reply`"
            )));
        }
        check_signature(member, A::signature(), &spec.input)?;
        check_signature(member, R::signature(), &spec.output)?;
        Ok(self.message(self.descriptor.name(), member).with_args(args))
    }

    fn dyn_call(&self, member: &str, args: Vec<Value>) -> Result<Message, Error> {
        let spec = self.method(member)?;
        if spec.no_reply {
            return Err(Error::Misuse(format!(
                "`{member}` does not reply, use `call_no_reply`"
            )));
        }
        check_signature(member, Some(runtime_signature(&args)?), &spec.input)?;
        Ok(self.message(self.descriptor.name(), member).with_body(args))
    }

    /// Calls a method and decodes its reply.
    ///
    /// `R` is `()` for methods without output, `(T,)` for a single value and a tuple
    /// otherwise.
    pub async fn call<A: Args, R: Args>(&self, member: &str, args: A) -> Result<R, Error> {
        let msg = self.method_call::<A, R>(member, args)?;
        self.conn.call_message(&msg).map(decode_args::<R>).await
    }

    pub fn call_blocking<A: Args, R: Args>(&self, member: &str, args: A) -> Result<R, Error> {
        let msg = self.method_call::<A, R>(member, args)?;
        decode_args(self.conn.call_message_blocking(&msg)?)
    }

    /// Like [Self::call] with an explicit timeout.
    pub async fn call_with_timeout<A: Args, R: Args>(
        &self,
        member: &str,
        args: A,
        timeout: Option<Duration>,
    ) -> Result<R, Error> {
        let msg = self.method_call::<A, R>(member, args)?;
        self.conn
            .call_message_with_timeout(&msg, timeout)
            .map(decode_args::<R>)
            .await
    }

    /// Calls a method without waiting for a reply.
    pub fn call_no_reply<A: Args>(&self, member: &str, args: A) -> Result<(), Error> {
        let spec = self.method(member)?;
        check_signature(member, A::signature(), &spec.input)?;
        self.conn.call_no_reply(
            &self.destination,
            &self.path,
            self.descriptor.name(),
            member,
            args,
        )
    }

    /// Calls a method with a body assembled at runtime.
    pub async fn call_dyn(&self, member: &str, args: Vec<Value>) -> Result<Vec<Value>, Error> {
        let msg = self.dyn_call(member, args)?;
        Ok(self.conn.call_message(&msg).await?.into_body())
    }

    pub fn call_dyn_blocking(&self, member: &str, args: Vec<Value>) -> Result<Vec<Value>, Error> {
        let msg = self.dyn_call(member, args)?;
        Ok(self.conn.call_message_blocking(&msg)?.into_body())
    }

    fn get_call<T: DbusType>(&self, name: &str) -> Result<Message, Error> {
        let spec = self.property(name)?;
        if !spec.access.is_readable() {
            return Err(Error::access_denied(format!("`{name}` is not readable")));
        }
        if T::dbus_type() != spec.ty {
            return Err(Error::Misuse(format!(
                "`{name}` has the type `{}` but was read as `{}`",
                spec.ty,
                T::dbus_type()
            )));
        }
        Ok(self
            .message(PROPERTIES, "Get")
            .with_args((self.descriptor.name().to_string(), name.to_string())))
    }

    fn set_call<T: DbusType>(&self, name: &str, value: T) -> Result<Message, Error> {
        let spec = self.property(name)?;
        if !spec.access.is_writable() {
            return Err(Error::property_read_only(format!("`{name}` is not writable")));
        }
        if T::dbus_type() != spec.ty {
            return Err(Error::Misuse(format!(
                "`{name}` has the type `{}` but was written as `{}`",
                spec.ty,
                T::dbus_type()
            )));
        }
        Ok(self.message(PROPERTIES, "Set").with_args((
            self.descriptor.name().to_string(),
            name.to_string(),
            Variant(value.into_value()),
        )))
    }

    /// Reads a property through `org.freedesktop.DBus.Properties.Get`.
    pub async fn get_property<T: DbusType>(&self, name: &str) -> Result<T, Error> {
        let msg = self.get_call::<T>(name)?;
        let value = self.conn.call_message(&msg).map(decode_variant).await?;
        Ok(T::from_value(value)?)
    }

    pub fn get_property_blocking<T: DbusType>(&self, name: &str) -> Result<T, Error> {
        let msg = self.get_call::<T>(name)?;
        let value = decode_variant(self.conn.call_message_blocking(&msg)?)?;
        Ok(T::from_value(value)?)
    }

    pub async fn set_property<T: DbusType>(&self, name: &str, value: T) -> Result<(), Error> {
        let msg = self.set_call(name, value)?;
        self.conn.call_message(&msg).await?;
        Ok(())
    }

    pub fn set_property_blocking<T: DbusType>(&self, name: &str, value: T) -> Result<(), Error> {
        let msg = self.set_call(name, value)?;
        self.conn.call_message_blocking(&msg)?;
        Ok(())
    }

    fn get_all_call(&self) -> Message {
        self.message(PROPERTIES, "GetAll")
            .with_args((self.descriptor.name().to_string(),))
    }

    /// Reads all readable properties.
    pub async fn get_all_properties(&self) -> Result<HashMap<String, Value>, Error> {
        self.conn.call_message(&self.get_all_call()).map(decode_all).await
    }

    pub fn get_all_properties_blocking(&self) -> Result<HashMap<String, Value>, Error> {
        decode_all(self.conn.call_message_blocking(&self.get_all_call())?)
    }

    fn signal_rule<T: Args>(&self, member: &str) -> Result<MatchRule, Error> {
        let Some(spec) = self.descriptor.signal(member) else {
            return Err(Error::Misuse(format!(
                "`{}` has no signal `{member}`",
                self.descriptor.name()
            )));
        };
        check_signature(member, T::signature(), &spec.signature)?;
        Ok(MatchRule::signal()
            .sender(&self.destination)
            .path(self.path.clone())
            .interface(self.descriptor.name())
            .member(member))
    }

    /// Subscribes to a signal of the remote object.
    pub async fn signal<T: Args>(&self, member: &str) -> Result<SignalStream<T>, Error> {
        let rule = self.signal_rule::<T>(member)?;
        self.conn.shared.subscribe(rule, decode_args::<T>).await
    }

    pub fn signal_blocking<T: Args>(&self, member: &str) -> Result<SignalStream<T>, Error> {
        let rule = self.signal_rule::<T>(member)?;
        self.conn.shared.subscribe_blocking(rule, decode_args::<T>)
    }

    fn properties_rule(&self) -> MatchRule {
        MatchRule::signal()
            .sender(&self.destination)
            .path(self.path.clone())
            .interface(PROPERTIES)
            .member("PropertiesChanged")
            .arg(0, self.descriptor.name())
    }

    /// Subscribes to changes of the properties of this interface.
    pub async fn property_changes(&self) -> Result<PropertyChanges, Error> {
        let stream = self
            .conn
            .shared
            .subscribe(self.properties_rule(), decode_properties_changed)
            .await?;
        Ok(PropertyChanges {
            stream,
            descriptor: self.descriptor.clone(),
        })
    }

    pub fn property_changes_blocking(&self) -> Result<PropertyChanges, Error> {
        let stream = self
            .conn
            .shared
            .subscribe_blocking(self.properties_rule(), decode_properties_changed)?;
        Ok(PropertyChanges {
            stream,
            descriptor: self.descriptor.clone(),
        })
    }

    /// Fetches the introspection XML of the remote object.
    pub async fn introspect(&self) -> Result<String, Error> {
        let msg = self.message(INTROSPECTABLE, "Introspect");
        self.conn.call_message(&msg).map(decode_string).await
    }

    pub fn introspect_blocking(&self) -> Result<String, Error> {
        let msg = self.message(INTROSPECTABLE, "Introspect");
        decode_string(self.conn.call_message_blocking(&msg)?)
    }
}

/// A stream of property changes of one interface.
///
/// Entries are filtered by the declared emits-change policy: values are only
/// reported for properties that emit them and names are only reported as
/// invalidated for properties that emit change signals at all. Signals that become
/// empty after filtering are skipped.
#[must_use]
pub struct PropertyChanges {
    stream: SignalStream<PropertiesChanged>,
    descriptor: Arc<InterfaceDescriptor>,
}

impl PropertyChanges {
    fn filter(&self, mut pc: PropertiesChanged) -> Option<PropertiesChanged> {
        let policy = |name: &str| self.descriptor.property(name).map(|p| p.emits_change);
        pc.changed
            .retain(|name, _| policy(name) == Some(EmitsChange::True));
        pc.invalidated.retain(|name| {
            matches!(
                policy(name),
                Some(EmitsChange::True | EmitsChange::Invalidates)
            )
        });
        match pc.changed.is_empty() && pc.invalidated.is_empty() {
            true => None,
            false => Some(pc),
        }
    }

    /// Waits for the next change. Returns `None` once the connection has been closed.
    pub async fn next(&mut self) -> Option<PropertiesChanged> {
        loop {
            let pc = self.stream.next().await?;
            if let Some(pc) = self.filter(pc) {
                return Some(pc);
            }
        }
    }

    pub fn next_blocking(
        &mut self,
        timeout: Option<Duration>,
    ) -> Result<Option<PropertiesChanged>, Error> {
        let deadline = timeout.map(|t| Instant::now() + t);
        loop {
            let remaining = deadline.map(|d| d.saturating_duration_since(Instant::now()));
            let Some(pc) = self.stream.next_blocking(remaining)? else {
                return Ok(None);
            };
            if let Some(pc) = self.filter(pc) {
                return Ok(Some(pc));
            }
        }
    }

    /// The number of signals dropped because the queue was full.
    pub fn dropped(&self) -> u64 {
        self.stream.dropped()
    }
}
