//! Declarative descriptions of D-Bus interfaces.

use {
    crate::Error,
    buslane_wire::{
        names::{is_valid_error_name, is_valid_interface_name, is_valid_member_name},
        Signature, Type,
    },
    indexmap::IndexMap,
    std::sync::Arc,
};

/// How a property may be accessed by peers.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Access {
    Read,
    Write,
    ReadWrite,
}

impl Access {
    pub fn is_readable(self) -> bool {
        matches!(self, Access::Read | Access::ReadWrite)
    }

    pub fn is_writable(self) -> bool {
        matches!(self, Access::Write | Access::ReadWrite)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Access::Read => "read",
            Access::Write => "write",
            Access::ReadWrite => "readwrite",
        }
    }
}

/// Whether `PropertiesChanged` is emitted when a property changes.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum EmitsChange {
    /// The signal carries the new value.
    True,
    /// The signal names the property without a value.
    Invalidates,
    /// No signal is emitted.
    False,
    /// The property never changes.
    Const,
}

impl EmitsChange {
    pub fn as_str(self) -> &'static str {
        match self {
            EmitsChange::True => "true",
            EmitsChange::Invalidates => "invalidates",
            EmitsChange::False => "false",
            EmitsChange::Const => "const",
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct MethodSpec {
    pub name: String,
    pub input: Signature,
    pub output: Signature,
    /// Callers are not expected to wait for a reply.
    pub no_reply: bool,
    /// The error names the method may return besides the standard ones. An empty list
    /// allows any error.
    pub errors: Vec<String>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct PropertySpec {
    pub name: String,
    pub ty: Type,
    pub access: Access,
    pub emits_change: EmitsChange,
}

#[derive(Clone, Debug, PartialEq)]
pub struct SignalSpec {
    pub name: String,
    pub signature: Signature,
}

/// The methods, properties and signals of an interface.
///
/// Descriptors are immutable once built and are shared by proxies and exported
/// objects.
#[derive(Clone, Debug, PartialEq)]
pub struct InterfaceDescriptor {
    name: String,
    methods: IndexMap<String, MethodSpec>,
    properties: IndexMap<String, PropertySpec>,
    signals: IndexMap<String, SignalSpec>,
}

impl InterfaceDescriptor {
    pub fn builder(name: &str) -> DescriptorBuilder {
        DescriptorBuilder {
            name: name.to_string(),
            methods: vec![],
            properties: vec![],
            signals: vec![],
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn method(&self, name: &str) -> Option<&MethodSpec> {
        self.methods.get(name)
    }

    pub fn property(&self, name: &str) -> Option<&PropertySpec> {
        self.properties.get(name)
    }

    pub fn signal(&self, name: &str) -> Option<&SignalSpec> {
        self.signals.get(name)
    }

    pub fn methods(&self) -> impl Iterator<Item = &MethodSpec> {
        self.methods.values()
    }

    pub fn properties(&self) -> impl Iterator<Item = &PropertySpec> {
        self.properties.values()
    }

    pub fn signals(&self) -> impl Iterator<Item = &SignalSpec> {
        self.signals.values()
    }
}

struct MethodDecl {
    name: String,
    input: String,
    output: String,
    no_reply: bool,
    errors: Vec<String>,
}

struct PropertyDecl {
    name: String,
    ty: String,
    access: Access,
    emits_change: EmitsChange,
}

/// Collects the members of an [InterfaceDescriptor].
///
/// Names and signatures are checked by [Self::build].
pub struct DescriptorBuilder {
    name: String,
    methods: Vec<MethodDecl>,
    properties: Vec<PropertyDecl>,
    signals: Vec<(String, String)>,
}

fn invalid(msg: String) -> Error {
    Error::InvalidDescriptor(msg)
}

fn signature(owner: &str, s: &str) -> Result<Signature, Error> {
    Signature::new(s).map_err(|e| invalid(format!("`{owner}` has an invalid signature `{s}`: {e}")))
}

fn member(kind: &str, name: &str) -> Result<(), Error> {
    match is_valid_member_name(name) {
        true => Ok(()),
        false => Err(invalid(format!("invalid {kind} name `{name}`"))),
    }
}

impl DescriptorBuilder {
    /// Declares a method with an input and an output signature.
    pub fn method(self, name: &str, input: &str, output: &str) -> Self {
        self.method_errors(name, input, output, &[])
    }

    /// Declares a method whose callers do not wait for a reply.
    pub fn method_no_reply(mut self, name: &str, input: &str) -> Self {
        self.methods.push(MethodDecl {
            name: name.to_string(),
            input: input.to_string(),
            output: String::new(),
            no_reply: true,
            errors: vec![],
        });
        self
    }

    /// Declares a method that may only fail with the given errors besides the
    /// standard `org.freedesktop.DBus.Error` names.
    pub fn method_errors(mut self, name: &str, input: &str, output: &str, errors: &[&str]) -> Self {
        self.methods.push(MethodDecl {
            name: name.to_string(),
            input: input.to_string(),
            output: output.to_string(),
            no_reply: false,
            errors: errors.iter().map(|e| e.to_string()).collect(),
        });
        self
    }

    pub fn property(mut self, name: &str, ty: &str, access: Access, emits_change: EmitsChange) -> Self {
        self.properties.push(PropertyDecl {
            name: name.to_string(),
            ty: ty.to_string(),
            access,
            emits_change,
        });
        self
    }

    pub fn signal(mut self, name: &str, signature: &str) -> Self {
        self.signals.push((name.to_string(), signature.to_string()));
        self
    }

    pub fn build(self) -> Result<Arc<InterfaceDescriptor>, Error> {
        if !is_valid_interface_name(&self.name) {
            return Err(invalid(format!("invalid interface name `{}`", self.name)));
        }
        let mut methods = IndexMap::new();
        for m in self.methods {
            member("method", &m.name)?;
            for e in &m.errors {
                if !is_valid_error_name(e) {
                    return Err(invalid(format!("`{}` declares an invalid error `{e}`", m.name)));
                }
            }
            let spec = MethodSpec {
                input: signature(&m.name, &m.input)?,
                output: signature(&m.name, &m.output)?,
                no_reply: m.no_reply,
                errors: m.errors,
                name: m.name,
            };
            if spec.no_reply && !spec.output.is_empty() {
                return Err(invalid(format!("`{}` has no reply but an output", spec.name)));
            }
            if methods.contains_key(&spec.name) {
                return Err(invalid(format!("method `{}` is declared twice", spec.name)));
            }
            methods.insert(spec.name.clone(), spec);
        }
        let mut properties = IndexMap::new();
        for p in self.properties {
            member("property", &p.name)?;
            let ty = match signature(&p.name, &p.ty)?.single() {
                Some(ty) => ty.clone(),
                None => {
                    return Err(invalid(format!(
                        "property `{}` must have a single complete type",
                        p.name
                    )))
                }
            };
            if properties.contains_key(&p.name) {
                return Err(invalid(format!("property `{}` is declared twice", p.name)));
            }
            properties.insert(
                p.name.clone(),
                PropertySpec {
                    name: p.name,
                    ty,
                    access: p.access,
                    emits_change: p.emits_change,
                },
            );
        }
        let mut signals = IndexMap::new();
        for (name, sig) in self.signals {
            member("signal", &name)?;
            let signature = signature(&name, &sig)?;
            if signals.contains_key(&name) {
                return Err(invalid(format!("signal `{name}` is declared twice")));
            }
            signals.insert(name.clone(), SignalSpec { name, signature });
        }
        Ok(Arc::new(InterfaceDescriptor {
            name: self.name,
            methods,
            properties,
            signals,
        }))
    }
}
