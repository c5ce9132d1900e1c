use {
    crate::{Error, ObjectPath, Signature, Type},
    std::{
        fmt::{self, Debug, Formatter},
        os::fd::{AsRawFd, OwnedFd, RawFd},
        sync::Arc,
    },
};

/// A dynamically typed D-Bus value.
#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    Byte(u8),
    Bool(bool),
    Int16(i16),
    Uint16(u16),
    Int32(i32),
    Uint32(u32),
    Int64(i64),
    Uint64(u64),
    Double(f64),
    String(String),
    ObjectPath(ObjectPath),
    Signature(Signature),
    UnixFd(Fd),
    Array(Array),
    Struct(Vec<Value>),
    DictEntry(Box<Value>, Box<Value>),
    Variant(Box<Value>),
}

/// An array together with its element type.
///
/// The element type is stored explicitly so that empty arrays still have a signature.
#[derive(Clone, Debug, PartialEq)]
pub struct Array {
    elem: Type,
    items: Vec<Value>,
}

/// A unix file descriptor attached to a message.
///
/// The descriptor is closed once the last clone is dropped.
#[derive(Clone)]
pub struct Fd(Arc<dyn AsRawFd + Send + Sync>);

impl Value {
    /// The type of this value.
    pub fn ty(&self) -> Type {
        match self {
            Value::Byte(_) => Type::Byte,
            Value::Bool(_) => Type::Bool,
            Value::Int16(_) => Type::Int16,
            Value::Uint16(_) => Type::Uint16,
            Value::Int32(_) => Type::Int32,
            Value::Uint32(_) => Type::Uint32,
            Value::Int64(_) => Type::Int64,
            Value::Uint64(_) => Type::Uint64,
            Value::Double(_) => Type::Double,
            Value::String(_) => Type::String,
            Value::ObjectPath(_) => Type::ObjectPath,
            Value::Signature(_) => Type::Signature,
            Value::UnixFd(_) => Type::UnixFd,
            Value::Array(a) => Type::Array(Box::new(a.elem.clone())),
            Value::Struct(fields) => Type::Struct(fields.iter().map(|f| f.ty()).collect()),
            Value::DictEntry(k, v) => Type::DictEntry(Box::new(k.ty()), Box::new(v.ty())),
            Value::Variant(_) => Type::Variant,
        }
    }

    /// Wraps this value in a variant.
    pub fn into_variant(self) -> Value {
        Value::Variant(Box::new(self))
    }

    /// Builds an `a{KV}` value.
    pub fn dict(
        key: Type,
        value: Type,
        entries: impl IntoIterator<Item = (Value, Value)>,
    ) -> Result<Value, Error> {
        let elem = Type::DictEntry(Box::new(key), Box::new(value));
        let items = entries
            .into_iter()
            .map(|(k, v)| Value::DictEntry(Box::new(k), Box::new(v)))
            .collect();
        Ok(Value::Array(Array::new(elem, items)?))
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            Value::ObjectPath(p) => Some(p.as_str()),
            Value::Signature(s) => Some(s.as_str()),
            _ => None,
        }
    }

    pub fn as_u32(&self) -> Option<u32> {
        match self {
            Value::Uint32(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&Array> {
        match self {
            Value::Array(a) => Some(a),
            _ => None,
        }
    }

    /// Returns the contents of a variant, or the value itself.
    pub fn into_inner(self) -> Value {
        match self {
            Value::Variant(v) => *v,
            v => v,
        }
    }
}

impl Array {
    /// Creates an array, checking that every item has type `elem`.
    pub fn new(elem: Type, items: Vec<Value>) -> Result<Self, Error> {
        for item in &items {
            let ty = item.ty();
            if ty != elem {
                return Err(Error::ArrayElement {
                    expected: elem.to_string(),
                    actual: ty.to_string(),
                });
            }
        }
        Ok(Self { elem, items })
    }

    pub(crate) fn new_unchecked(elem: Type, items: Vec<Value>) -> Self {
        Self { elem, items }
    }

    pub fn empty(elem: Type) -> Self {
        Self {
            elem,
            items: vec![],
        }
    }

    pub fn element_type(&self) -> &Type {
        &self.elem
    }

    pub fn items(&self) -> &[Value] {
        &self.items
    }

    pub fn into_items(self) -> Vec<Value> {
        self.items
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Iterates over the entries of an `a{KV}` array.
    pub fn entries(&self) -> impl Iterator<Item = (&Value, &Value)> {
        self.items.iter().filter_map(|item| match item {
            Value::DictEntry(k, v) => Some((&**k, &**v)),
            _ => None,
        })
    }
}

impl Fd {
    /// Wraps a value that owns a descriptor and closes it on drop.
    pub fn new<T>(owner: T) -> Self
    where
        T: AsRawFd + Send + Sync + 'static,
    {
        Self(Arc::new(owner))
    }
}

impl AsRawFd for Fd {
    fn as_raw_fd(&self) -> RawFd {
        self.0.as_raw_fd()
    }
}

impl From<OwnedFd> for Fd {
    fn from(value: OwnedFd) -> Self {
        Self::new(value)
    }
}

impl PartialEq for Fd {
    fn eq(&self, other: &Self) -> bool {
        self.0.as_raw_fd() == other.0.as_raw_fd()
    }
}

impl Debug for Fd {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Fd").field(&self.0.as_raw_fd()).finish()
    }
}
