//! Exported objects and the dispatch of incoming method calls.

use {
    crate::{
        connection::{Connection, IntoObjectPath, Mode, Shared},
        descriptor::{EmitsChange, InterfaceDescriptor},
        introspect, object_manager, Error,
    },
    ahash::AHashMap,
    buslane_wire::{
        Args, Array, DbusType, Header, Message, ObjectPath, Signature, Type, Value, Variant,
    },
    error_reporter::Report,
    indexmap::IndexMap,
    parking_lot::Mutex,
    std::{
        collections::BTreeMap,
        future::Future,
        pin::Pin,
        sync::{Arc, Weak},
    },
};

pub const PEER: &str = "org.freedesktop.DBus.Peer";
pub const INTROSPECTABLE: &str = "org.freedesktop.DBus.Introspectable";
pub const PROPERTIES: &str = "org.freedesktop.DBus.Properties";
pub const OBJECT_MANAGER: &str = "org.freedesktop.DBus.ObjectManager";

type Body = Vec<Value>;
type BoxFuture = Pin<Box<dyn Future<Output = Result<Body, Error>> + Send>>;

enum Handler {
    Sync(Box<dyn Fn(Body) -> Result<Body, Error> + Send + Sync>),
    Deferred(Box<dyn Fn(Body, PendingReply) + Send + Sync>),
    Async(Box<dyn Fn(Body) -> Result<BoxFuture, Error> + Send + Sync>),
}

type Getter = Box<dyn Fn() -> Result<Value, Error> + Send + Sync>;
type Setter = Box<dyn Fn(Value) -> Result<(), Error> + Send + Sync>;

enum Property {
    Stored(Mutex<Value>),
    Computed { get: Getter, set: Option<Setter> },
}

/// An object exported at a path, consisting of one or more interfaces.
#[derive(Default)]
pub(crate) struct Object {
    pub interfaces: IndexMap<String, Arc<Interface>>,
    pub manager: bool,
}

pub(crate) type ObjectTable = BTreeMap<ObjectPath, Object>;

/// The implementation of an interface.
pub struct Interface {
    descriptor: Arc<InterfaceDescriptor>,
    methods: AHashMap<String, Handler>,
    properties: AHashMap<String, Property>,
}

fn invalid_body(e: buslane_wire::Error) -> Error {
    Error::invalid_args(e.to_string())
}

impl Interface {
    pub fn builder(descriptor: Arc<InterfaceDescriptor>) -> InterfaceBuilder {
        InterfaceBuilder {
            interface: Interface {
                descriptor,
                methods: Default::default(),
                properties: Default::default(),
            },
            error: None,
        }
    }

    pub fn descriptor(&self) -> &Arc<InterfaceDescriptor> {
        &self.descriptor
    }

    pub fn name(&self) -> &str {
        self.descriptor.name()
    }

    fn has_async(&self) -> bool {
        self.methods.values().any(|h| matches!(h, Handler::Async(_)))
    }

    fn read(&self, name: &str) -> Result<Value, Error> {
        match self.properties.get(name) {
            Some(Property::Stored(v)) => Ok(v.lock().clone()),
            Some(Property::Computed { get, .. }) => get(),
            None => Err(Error::unknown_property(format!(
                "`{}` has no property `{name}`",
                self.name()
            ))),
        }
    }

    pub(crate) fn get_property(&self, name: &str) -> Result<Value, Error> {
        let Some(spec) = self.descriptor.property(name) else {
            return Err(Error::unknown_property(format!(
                "`{}` has no property `{name}`",
                self.name()
            )));
        };
        if !spec.access.is_readable() {
            return Err(Error::access_denied(format!("`{name}` is write-only")));
        }
        self.read(name)
    }

    /// The values of all readable properties, in declaration order.
    pub(crate) fn readable_properties(&self) -> Vec<(String, Value)> {
        let mut res = vec![];
        for spec in self.descriptor.properties() {
            if !spec.access.is_readable() {
                continue;
            }
            match self.read(&spec.name) {
                Ok(v) => res.push((spec.name.clone(), v)),
                Err(e) => log::warn!(
                    "Could not read property `{}` of `{}`: {}",
                    spec.name,
                    self.name(),
                    Report::new(e)
                ),
            }
        }
        res
    }

    /// Stores a new value. Setters of computed properties run only if `remote`.
    fn write(&self, name: &str, value: Value, remote: bool) -> Result<(), Error> {
        let Some(spec) = self.descriptor.property(name) else {
            return Err(Error::unknown_property(format!(
                "`{}` has no property `{name}`",
                self.name()
            )));
        };
        if remote && !spec.access.is_writable() {
            return Err(Error::property_read_only(format!("`{name}` is read-only")));
        }
        if value.ty() != spec.ty {
            return Err(Error::invalid_args(format!(
                "`{name}` has type `{}` but the value has type `{}`",
                spec.ty,
                value.ty()
            )));
        }
        match self.properties.get(name) {
            Some(Property::Stored(v)) => {
                *v.lock() = value;
                Ok(())
            }
            Some(Property::Computed { set: Some(set), .. }) if remote => set(value),
            Some(Property::Computed { .. }) => Err(Error::Misuse(format!(
                "`{name}` is computed and cannot be stored"
            ))),
            None => Err(Error::unknown_property(format!("`{name}` has no value"))),
        }
    }
}

/// Attaches handlers to the members of an [InterfaceDescriptor].
///
/// Every declared method needs a handler and every declared property needs a value or
/// a getter. Mismatches are reported by [Self::build].
#[must_use]
pub struct InterfaceBuilder {
    interface: Interface,
    error: Option<Error>,
}

impl InterfaceBuilder {
    fn fail(&mut self, msg: String) {
        if self.error.is_none() {
            self.error = Some(Error::InvalidDescriptor(msg));
        }
    }

    fn check_method(&mut self, name: &str, input: Option<Signature>, output: Option<Option<Signature>>) {
        let Some(spec) = self.interface.descriptor.method(name) else {
            let msg = format!("`{}` does not declare a method `{name}`", self.interface.name());
            return self.fail(msg);
        };
        if let Some(input) = input {
            if input != spec.input {
                let msg = format!(
                    "handler of `{name}` takes `{input}` but `{}` is declared",
                    spec.input
                );
                return self.fail(msg);
            }
        }
        if let Some(Some(output)) = output {
            if output != spec.output {
                let msg = format!(
                    "handler of `{name}` returns `{output}` but `{}` is declared",
                    spec.output
                );
                return self.fail(msg);
            }
        }
    }

    fn add_method(&mut self, name: &str, handler: Handler) {
        if self.interface.methods.insert(name.to_string(), handler).is_some() {
            self.fail(format!("method `{name}` has two handlers"));
        }
    }

    /// Adds a handler that replies synchronously.
    pub fn method<A, R, F>(mut self, name: &str, f: F) -> Self
    where
        A: Args,
        R: Args,
        F: Fn(A) -> Result<R, Error> + Send + Sync + 'static,
    {
        self.check_method(name, A::signature(), Some(R::signature()));
        let handler = move |body: Body| -> Result<Body, Error> {
            let args = A::from_body(body).map_err(invalid_body)?;
            f(args).map(R::into_body)
        };
        self.add_method(name, Handler::Sync(Box::new(handler)));
        self
    }

    /// Adds a handler that replies through a [PendingReply], possibly later.
    pub fn method_with_reply<A, F>(mut self, name: &str, f: F) -> Self
    where
        A: Args,
        F: Fn(A, PendingReply) + Send + Sync + 'static,
    {
        self.check_method(name, A::signature(), None);
        let handler = move |body: Body, pr: PendingReply| match A::from_body(body) {
            Ok(args) => f(args, pr),
            Err(e) => pr.error(invalid_body(e)),
        };
        self.add_method(name, Handler::Deferred(Box::new(handler)));
        self
    }

    /// Adds a handler that runs on its own task. Only cooperative connections can
    /// export interfaces with such handlers.
    pub fn method_async<A, R, F, Fut>(mut self, name: &str, f: F) -> Self
    where
        A: Args,
        R: Args,
        F: Fn(A) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R, Error>> + Send + 'static,
    {
        self.check_method(name, A::signature(), Some(R::signature()));
        let handler = move |body: Body| -> Result<BoxFuture, Error> {
            let args = A::from_body(body).map_err(invalid_body)?;
            let fut = f(args);
            Ok(Box::pin(async move { fut.await.map(R::into_body) }))
        };
        self.add_method(name, Handler::Async(Box::new(handler)));
        self
    }

    fn add_property(&mut self, name: &str, ty: Type, property: Property) {
        let Some(spec) = self.interface.descriptor.property(name) else {
            let msg = format!("`{}` does not declare a property `{name}`", self.interface.name());
            return self.fail(msg);
        };
        if spec.ty != ty {
            let msg = format!("`{name}` is declared as `{}` but has type `{ty}`", spec.ty);
            return self.fail(msg);
        }
        if self.interface.properties.insert(name.to_string(), property).is_some() {
            self.fail(format!("property `{name}` is defined twice"));
        }
    }

    /// Adds a property whose value is stored by the engine.
    ///
    /// Writable stored properties can be changed by peers.
    pub fn property<T: DbusType>(mut self, name: &str, initial: T) -> Self {
        let value = initial.into_value();
        self.add_property(name, value.ty(), Property::Stored(Mutex::new(value)));
        self
    }

    /// Adds a read-only property computed by `get`.
    pub fn property_with<T, G>(mut self, name: &str, get: G) -> Self
    where
        T: DbusType,
        G: Fn() -> Result<T, Error> + Send + Sync + 'static,
    {
        let get = move || get().map(T::into_value);
        self.add_property(
            name,
            T::dbus_type(),
            Property::Computed {
                get: Box::new(get),
                set: None,
            },
        );
        self
    }

    /// Adds a computed property that peers can write.
    pub fn property_with_setter<T, G, S>(mut self, name: &str, get: G, set: S) -> Self
    where
        T: DbusType,
        G: Fn() -> Result<T, Error> + Send + Sync + 'static,
        S: Fn(T) -> Result<(), Error> + Send + Sync + 'static,
    {
        let get = move || get().map(T::into_value);
        let set = move |v: Value| -> Result<(), Error> { set(T::from_value(v).map_err(invalid_body)?) };
        self.add_property(
            name,
            T::dbus_type(),
            Property::Computed {
                get: Box::new(get),
                set: Some(Box::new(set)),
            },
        );
        self
    }

    pub fn build(self) -> Result<Interface, Error> {
        if let Some(e) = self.error {
            return Err(e);
        }
        let interface = self.interface;
        let d = &interface.descriptor;
        if let Some(m) = d.methods().find(|m| !interface.methods.contains_key(&m.name)) {
            return Err(Error::InvalidDescriptor(format!(
                "method `{}` of `{}` has no handler",
                m.name,
                d.name()
            )));
        }
        for p in d.properties() {
            match interface.properties.get(&p.name) {
                None => {
                    return Err(Error::InvalidDescriptor(format!(
                        "property `{}` of `{}` has no value",
                        p.name,
                        d.name()
                    )))
                }
                Some(Property::Computed { set: None, .. }) if p.access.is_writable() => {
                    return Err(Error::InvalidDescriptor(format!(
                        "writable property `{}` of `{}` has no setter",
                        p.name,
                        d.name()
                    )))
                }
                _ => {}
            }
        }
        Ok(interface)
    }
}

/// A method call that has not been answered yet.
///
/// Dropping this object without replying sends a `Failed` error unless the caller
/// does not expect a reply.
pub struct PendingReply {
    shared: Weak<Shared>,
    call: Message,
    output: Option<Signature>,
    errors: Vec<String>,
    no_reply: bool,
    replied: bool,
}

impl PendingReply {
    fn new(shared: &Arc<Shared>, call: Message) -> Self {
        Self {
            shared: Arc::downgrade(shared),
            no_reply: !call.expects_reply(),
            call,
            output: None,
            errors: vec![],
            replied: false,
        }
    }

    /// The call without its body.
    pub fn message(&self) -> &Message {
        &self.call
    }

    /// The unique name of the caller.
    pub fn sender(&self) -> Option<&str> {
        self.call.sender()
    }

    pub fn reply<R: Args>(self, reply: R) {
        self.reply_body(reply.into_body());
    }

    /// Replies with a body that must match the declared output signature.
    pub fn reply_body(mut self, body: Vec<Value>) {
        if let Some(output) = &self.output {
            let actual = Signature::from_types(body.iter().map(|v| v.ty()).collect());
            if actual.ok().as_ref() != Some(output) {
                log::warn!(
                    "Reply to `{}` does not have the declared signature `{output}`",
                    self.call.member().unwrap_or_default(),
                );
                let e = Error::failed("The method handler returned an invalid reply");
                return self.error(e);
            }
        }
        let msg = Message::method_return(&self.call).with_body(body);
        self.send(msg);
    }

    /// Replies with an error.
    ///
    /// Errors outside the declared error list of the method are replaced by `Failed`.
    pub fn error(mut self, e: Error) {
        let mut remote = e.to_remote();
        if !self.errors.is_empty()
            && !Error::is_standard_name(&remote.name)
            && !self.errors.iter().any(|n| *n == remote.name)
        {
            log::warn!(
                "`{}` returned the undeclared error {}",
                self.call.member().unwrap_or_default(),
                remote.name,
            );
            remote = Error::failed(remote.to_string()).to_remote();
        }
        let msg = Message::error(&self.call, remote.name, &remote.message);
        self.send(msg);
    }

    pub(crate) fn finish(self, res: Result<Body, Error>) {
        match res {
            Ok(body) => self.reply_body(body),
            Err(e) => self.error(e),
        }
    }

    fn send(&mut self, msg: Message) {
        self.replied = true;
        if self.no_reply {
            return;
        }
        let Some(shared) = self.shared.upgrade() else {
            return;
        };
        if let Err(e) = shared.send(&msg) {
            log::debug!("Could not send a reply: {}", Report::new(e));
        }
    }
}

impl Drop for PendingReply {
    fn drop(&mut self) {
        if !self.replied {
            let remote = Error::failed("The method handler did not reply").to_remote();
            let msg = Message::error(&self.call, remote.name, &remote.message);
            self.send(msg);
        }
    }
}

/// Keeps an interface exported.
///
/// Dropping the handle unexports the interface.
#[must_use]
pub struct ExportHandle {
    shared: Weak<Shared>,
    path: ObjectPath,
    interface: Arc<Interface>,
    detached: bool,
}

impl ExportHandle {
    pub fn path(&self) -> &ObjectPath {
        &self.path
    }

    pub fn descriptor(&self) -> &Arc<InterfaceDescriptor> {
        self.interface.descriptor()
    }

    fn shared(&self) -> Result<Arc<Shared>, Error> {
        match self.shared.upgrade() {
            Some(s) if !s.is_killed() => Ok(s),
            _ => Err(Error::Disconnected),
        }
    }

    /// Emits a declared signal from the exported object.
    pub fn emit_signal(&self, member: &str, args: impl Args) -> Result<(), Error> {
        let Some(spec) = self.interface.descriptor.signal(member) else {
            return Err(Error::Misuse(format!(
                "`{}` does not declare a signal `{member}`",
                self.interface.name()
            )));
        };
        let body = args.into_body();
        let actual = Signature::from_types(body.iter().map(|v| v.ty()).collect())?;
        if actual != spec.signature {
            return Err(Error::Misuse(format!(
                "signal `{member}` has signature `{}` but the arguments have `{actual}`",
                spec.signature
            )));
        }
        let msg = Message::signal(self.path.clone(), self.interface.name(), member).with_body(body);
        self.shared()?.send(&msg)?;
        Ok(())
    }

    /// Changes a stored property and emits `PropertiesChanged` according to its policy.
    pub fn set_property<T: DbusType>(&self, name: &str, value: T) -> Result<(), Error> {
        self.set_property_value(name, value.into_value())
    }

    pub fn set_property_value(&self, name: &str, value: Value) -> Result<(), Error> {
        let shared = self.shared()?;
        self.interface.write(name, value.clone(), false)?;
        let changes = vec![(name.to_string(), Some(value))];
        properties_changed(&shared, &self.path, &self.interface, changes)
    }

    /// Emits `PropertiesChanged` for properties whose values changed outside of the
    /// engine, for example computed properties.
    pub fn emit_properties_changed(&self, names: &[&str]) -> Result<(), Error> {
        let shared = self.shared()?;
        let mut changes = vec![];
        for name in names {
            if self.interface.descriptor.property(name).is_none() {
                return Err(Error::unknown_property(format!(
                    "`{}` has no property `{name}`",
                    self.interface.name()
                )));
            }
            changes.push((name.to_string(), None));
        }
        properties_changed(&shared, &self.path, &self.interface, changes)
    }

    /// Unexports the interface.
    pub fn unexport(self) {
        drop(self);
    }

    /// Keeps the interface exported until the connection is closed.
    pub fn detach(mut self) {
        self.detached = true;
    }

    fn remove(&self) {
        let Some(shared) = self.shared.upgrade() else {
            return;
        };
        let manager = {
            let mut state = shared.state.lock();
            let Some(object) = state.objects.get_mut(&self.path) else {
                return;
            };
            match object.interfaces.get(self.interface.name()) {
                Some(i) if Arc::ptr_eq(i, &self.interface) => {}
                _ => return,
            }
            object.interfaces.shift_remove(self.interface.name());
            if object.interfaces.is_empty() && !object.manager {
                state.objects.remove(&self.path);
            }
            object_manager::manager_of(&state.objects, &self.path)
        };
        if let Some(manager) = manager {
            object_manager::interfaces_removed(&shared, &manager, &self.path, &[self.interface.name()]);
        }
    }
}

impl Drop for ExportHandle {
    fn drop(&mut self) {
        if !self.detached {
            self.remove();
        }
    }
}

impl Connection {
    /// Exports an interface at a path.
    ///
    /// Fails with [Error::AlreadyExported] if the interface is already exported at the
    /// path. Emits `InterfacesAdded` if an object manager is responsible for the path.
    pub fn export(&self, path: impl IntoObjectPath, interface: Interface) -> Result<ExportHandle, Error> {
        let path = path.into_object_path()?;
        let shared = &self.shared;
        if interface.has_async() && shared.mode() == Mode::Blocking {
            return Err(Error::Misuse(format!(
                "`{}` has async handlers and cannot be exported on a blocking connection",
                interface.name()
            )));
        }
        if shared.is_killed() {
            return Err(Error::Disconnected);
        }
        let interface = Arc::new(interface);
        let manager = {
            let mut state = shared.state.lock();
            let object = state.objects.entry(path.clone()).or_default();
            if object.interfaces.contains_key(interface.name()) {
                return Err(Error::AlreadyExported {
                    path: path.to_string(),
                    interface: interface.name().to_string(),
                });
            }
            object
                .interfaces
                .insert(interface.name().to_string(), interface.clone());
            object_manager::manager_of(&state.objects, &path)
        };
        if let Some(manager) = manager {
            object_manager::interfaces_added(shared, &manager, &path, &[&interface]);
        }
        Ok(ExportHandle {
            shared: Arc::downgrade(shared),
            path,
            interface,
            detached: false,
        })
    }
}

/// Builds an `a{sv}` dictionary.
pub(crate) fn property_dict(props: Vec<(String, Value)>) -> Value {
    let entries = props
        .into_iter()
        .map(|(k, v)| (Value::String(k), v.into_variant()));
    Value::dict(Type::String, Type::Variant, entries)
        .unwrap_or_else(|_| Value::Array(Array::empty(dict_entry(Type::String, Type::Variant))))
}

pub(crate) fn dict_entry(k: Type, v: Type) -> Type {
    Type::DictEntry(Box::new(k), Box::new(v))
}

fn properties_changed(
    shared: &Shared,
    path: &ObjectPath,
    interface: &Interface,
    changes: Vec<(String, Option<Value>)>,
) -> Result<(), Error> {
    let mut changed = vec![];
    let mut invalidated = vec![];
    for (name, value) in changes {
        let Some(spec) = interface.descriptor.property(&name) else {
            continue;
        };
        match spec.emits_change {
            EmitsChange::True => {
                let value = match value {
                    Some(v) => v,
                    None => interface.read(&name)?,
                };
                changed.push((name, value));
            }
            EmitsChange::Invalidates => invalidated.push(Value::String(name)),
            EmitsChange::False | EmitsChange::Const => {}
        }
    }
    if changed.is_empty() && invalidated.is_empty() {
        return Ok(());
    }
    let body = vec![
        Value::String(interface.name().to_string()),
        property_dict(changed),
        Value::Array(Array::new(Type::String, invalidated)?),
    ];
    let msg = Message::signal(path.clone(), PROPERTIES, "PropertiesChanged").with_body(body);
    shared.send(&msg)?;
    Ok(())
}

/// Answers a method call whose body could not be decoded.
pub(crate) fn reject_call(shared: &Arc<Shared>, header: Header, e: Error) {
    let call = Message::from_header(header);
    if call.expects_reply() {
        PendingReply::new(shared, call).error(e);
    }
}

/// Handles an incoming method call.
pub(crate) fn handle_call(shared: &Arc<Shared>, mut call: Message) {
    let signature = call.signature().clone();
    let body = call.take_body();
    let (Some(path), Some(member)) = (call.path().cloned(), call.member().map(str::to_string))
    else {
        return;
    };
    let interface = call.interface().map(str::to_string);
    let mut pr = PendingReply::new(shared, call);
    match interface.as_deref() {
        Some(PEER) => return peer(pr, &member),
        Some(INTROSPECTABLE) => return introspectable(shared, pr, &path, &member),
        Some(PROPERTIES) => return properties(shared, pr, &path, &member, body),
        Some(OBJECT_MANAGER) => return object_manager::handle_call(shared, pr, &path, &member),
        _ => {}
    }
    let found = {
        let state = shared.state.lock();
        state.objects.get(&path).and_then(|o| match &interface {
            Some(i) => o.interfaces.get(i).cloned(),
            None => o
                .interfaces
                .values()
                .find(|i| i.descriptor.method(&member).is_some())
                .cloned(),
        })
    };
    let unknown = || {
        Error::unknown_method(format!(
            "No method `{member}` on interface `{}` at `{path}`",
            interface.as_deref().unwrap_or("*"),
        ))
    };
    let Some(iface) = found else {
        return pr.error(unknown());
    };
    let (Some(spec), Some(handler)) = (iface.descriptor.method(&member), iface.methods.get(&member))
    else {
        return pr.error(unknown());
    };
    pr.output = Some(spec.output.clone());
    pr.errors = spec.errors.clone();
    pr.no_reply |= spec.no_reply;
    if signature != spec.input {
        return pr.error(Error::invalid_args(format!(
            "`{member}` takes `{}` but was called with `{signature}`",
            spec.input
        )));
    }
    match handler {
        Handler::Sync(f) => pr.finish(f(body)),
        Handler::Deferred(f) => f(body, pr),
        Handler::Async(f) => match f(body) {
            Ok(fut) => {
                tokio::spawn(async move { pr.finish(fut.await) });
            }
            Err(e) => pr.error(e),
        },
    }
}

fn machine_id() -> Result<String, Error> {
    let mut last = None;
    for path in ["/etc/machine-id", "/var/lib/dbus/machine-id"] {
        match std::fs::read_to_string(path) {
            Ok(id) => return Ok(id.trim().to_string()),
            Err(e) => last = Some(e),
        }
    }
    let e = last.map(|e| e.to_string()).unwrap_or_default();
    Err(Error::failed(format!("Could not read the machine id: {e}")))
}

fn peer(pr: PendingReply, member: &str) {
    let res = match member {
        "Ping" => Ok(vec![]),
        "GetMachineId" => machine_id().map(|id| vec![Value::String(id)]),
        _ => Err(Error::unknown_method(format!("No method `{member}` on `{PEER}`"))),
    };
    pr.finish(res);
}

fn introspectable(shared: &Shared, pr: PendingReply, path: &ObjectPath, member: &str) {
    if member != "Introspect" {
        let e = Error::unknown_method(format!("No method `{member}` on `{INTROSPECTABLE}`"));
        return pr.error(e);
    }
    let (interfaces, children, manager) = {
        let state = shared.state.lock();
        let (interfaces, manager) = match state.objects.get(path) {
            Some(o) => (o.interfaces.values().cloned().collect::<Vec<_>>(), o.manager),
            None => (vec![], false),
        };
        let mut children = vec![];
        for p in state.objects.keys() {
            if let Some(c) = path.child_segment(p) {
                children.push(c.to_string());
            }
        }
        children.dedup();
        (interfaces, children, manager)
    };
    let descriptors: Vec<_> = interfaces.iter().map(|i| &**i.descriptor()).collect();
    let children: Vec<_> = children.iter().map(|c| c.as_str()).collect();
    let xml = introspect::xml(&descriptors, &children, manager);
    pr.finish(Ok(vec![Value::String(xml)]));
}

fn find_interface(shared: &Shared, path: &ObjectPath, name: &str) -> Result<Arc<Interface>, Error> {
    let state = shared.state.lock();
    let Some(object) = state.objects.get(path) else {
        return Err(Error::unknown_object(format!("No object at `{path}`")));
    };
    match object.interfaces.get(name) {
        Some(i) => Ok(i.clone()),
        None => Err(Error::unknown_interface(format!(
            "No interface `{name}` at `{path}`"
        ))),
    }
}

fn properties(shared: &Shared, pr: PendingReply, path: &ObjectPath, member: &str, body: Body) {
    let res = (|| -> Result<Body, Error> {
        match member {
        "Get" => {
            let (iface, name) = <(String, String)>::from_body(body).map_err(invalid_body)?;
            let iface = find_interface(shared, path, &iface)?;
            Ok(vec![iface.get_property(&name)?.into_variant()])
        }
        "GetAll" => {
            let (iface,) = <(String,)>::from_body(body).map_err(invalid_body)?;
            let iface = find_interface(shared, path, &iface)?;
            Ok(vec![property_dict(iface.readable_properties())])
        }
        "Set" => {
            let (iface, name, Variant(value)) =
                <(String, String, Variant)>::from_body(body).map_err(invalid_body)?;
            let iface = find_interface(shared, path, &iface)?;
            iface.write(&name, value.clone(), true)?;
            if let Err(e) = properties_changed(shared, path, &iface, vec![(name, Some(value))]) {
                log::warn!("Could not emit PropertiesChanged: {}", Report::new(e));
            }
            Ok(vec![])
        }
        _ => Err(Error::unknown_method(format!("No method `{member}` on `{PROPERTIES}`"))),
        }
    })();
    pr.finish(res);
}
