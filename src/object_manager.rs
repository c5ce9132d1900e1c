//! `org.freedesktop.DBus.ObjectManager`.

use {
    crate::{
        connection::{Connection, IntoObjectPath, Shared},
        server::{dict_entry, property_dict, Interface, ObjectTable, PendingReply, OBJECT_MANAGER},
        Error,
    },
    buslane_wire::{Array, Message, ObjectPath, Type, Value},
    error_reporter::Report,
    std::sync::{Arc, Weak},
};

fn properties_type() -> Type {
    Type::Array(Box::new(dict_entry(Type::String, Type::Variant)))
}

fn interfaces_type() -> Type {
    Type::Array(Box::new(dict_entry(Type::String, properties_type())))
}

/// The closest strict ancestor of `path` that has an object manager.
pub(crate) fn manager_of(objects: &ObjectTable, path: &ObjectPath) -> Option<ObjectPath> {
    let mut next = path.parent();
    while let Some(p) = next {
        if objects.get(&p).is_some_and(|o| o.manager) {
            return Some(p);
        }
        next = p.parent();
    }
    None
}

/// Builds the `a{sa{sv}}` description of interfaces.
fn interfaces_value(interfaces: &[&Arc<Interface>]) -> Result<Value, Error> {
    let entries = interfaces.iter().map(|i| {
        (
            Value::String(i.name().to_string()),
            property_dict(i.readable_properties()),
        )
    });
    Ok(Value::dict(Type::String, properties_type(), entries)?)
}

fn emit(shared: &Shared, manager: &ObjectPath, member: &str, body: Vec<Value>) {
    let msg = Message::signal(manager.clone(), OBJECT_MANAGER, member).with_body(body);
    if let Err(e) = shared.send(&msg) {
        log::warn!("Could not emit {member}: {}", Report::new(e));
    }
}

pub(crate) fn interfaces_added(
    shared: &Shared,
    manager: &ObjectPath,
    path: &ObjectPath,
    interfaces: &[&Arc<Interface>],
) {
    match interfaces_value(interfaces) {
        Ok(v) => emit(
            shared,
            manager,
            "InterfacesAdded",
            vec![Value::ObjectPath(path.clone()), v],
        ),
        Err(e) => log::warn!("Could not describe {path}: {}", Report::new(e)),
    }
}

pub(crate) fn interfaces_removed(
    shared: &Shared,
    manager: &ObjectPath,
    path: &ObjectPath,
    interfaces: &[&str],
) {
    let names = interfaces
        .iter()
        .map(|n| Value::String(n.to_string()))
        .collect();
    match Array::new(Type::String, names) {
        Ok(names) => emit(
            shared,
            manager,
            "InterfacesRemoved",
            vec![Value::ObjectPath(path.clone()), Value::Array(names)],
        ),
        Err(e) => log::warn!("Could not describe {path}: {}", Report::new(e)),
    }
}

fn managed_objects(shared: &Shared, manager: &ObjectPath) -> Result<Value, Error> {
    let objects: Vec<(ObjectPath, Vec<Arc<Interface>>)> = {
        let state = shared.state.lock();
        state
            .objects
            .iter()
            .filter(|(p, o)| manager.is_ancestor_of(p) && !o.interfaces.is_empty())
            .map(|(p, o)| (p.clone(), o.interfaces.values().cloned().collect()))
            .collect()
    };
    let mut entries = vec![];
    for (path, interfaces) in objects {
        let interfaces: Vec<_> = interfaces.iter().collect();
        entries.push((Value::ObjectPath(path), interfaces_value(&interfaces)?));
    }
    Ok(Value::dict(Type::ObjectPath, interfaces_type(), entries)?)
}

pub(crate) fn handle_call(shared: &Shared, pr: PendingReply, path: &ObjectPath, member: &str) {
    let is_manager = shared
        .state
        .lock()
        .objects
        .get(path)
        .is_some_and(|o| o.manager);
    let res = match (is_manager, member) {
        (false, _) => Err(Error::unknown_interface(format!(
            "No object manager at `{path}`"
        ))),
        (true, "GetManagedObjects") => managed_objects(shared, path).map(|v| vec![v]),
        (true, _) => Err(Error::unknown_method(format!(
            "No method `{member}` on `{OBJECT_MANAGER}`"
        ))),
    };
    pr.finish(res);
}

/// Keeps an object manager installed.
///
/// Dropping the handle removes the object manager.
#[must_use]
pub struct ObjectManagerHandle {
    shared: Weak<Shared>,
    path: ObjectPath,
    detached: bool,
}

impl ObjectManagerHandle {
    pub fn path(&self) -> &ObjectPath {
        &self.path
    }

    /// Keeps the object manager installed until the connection is closed.
    pub fn detach(mut self) {
        self.detached = true;
    }
}

impl Drop for ObjectManagerHandle {
    fn drop(&mut self) {
        if self.detached {
            return;
        }
        let Some(shared) = self.shared.upgrade() else {
            return;
        };
        let mut state = shared.state.lock();
        if let Some(object) = state.objects.get_mut(&self.path) {
            object.manager = false;
            if object.interfaces.is_empty() {
                state.objects.remove(&self.path);
            }
        }
    }
}

impl Connection {
    /// Serves `GetManagedObjects` at `path` for all objects below it.
    ///
    /// `InterfacesAdded` and `InterfacesRemoved` are emitted when interfaces are
    /// exported or unexported below `path`, unless a closer object manager is
    /// responsible for them.
    pub fn add_object_manager(
        &self,
        path: impl IntoObjectPath,
    ) -> Result<ObjectManagerHandle, Error> {
        let path = path.into_object_path()?;
        if self.shared.is_killed() {
            return Err(Error::Disconnected);
        }
        let mut state = self.shared.state.lock();
        let object = state.objects.entry(path.clone()).or_default();
        if object.manager {
            return Err(Error::AlreadyExported {
                path: path.to_string(),
                interface: OBJECT_MANAGER.to_string(),
            });
        }
        object.manager = true;
        Ok(ObjectManagerHandle {
            shared: Arc::downgrade(&self.shared),
            path,
            detached: false,
        })
    }
}
