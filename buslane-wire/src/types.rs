//! Conversions between Rust types and [`Value`]s.

use {
    crate::{Array, Error, Fd, ObjectPath, Signature, Type, Value},
    std::{
        collections::{BTreeMap, HashMap},
        hash::{BuildHasher, Hash},
    },
};

/// A Rust type with a fixed D-Bus type.
pub trait DbusType: Sized {
    fn dbus_type() -> Type;

    fn into_value(self) -> Value;

    fn from_value(value: Value) -> Result<Self, Error>;
}

/// A sequence of values forming a message body.
pub trait Args: Sized {
    /// The body signature, or `None` if it is only known at runtime.
    fn signature() -> Option<Signature>;

    fn into_body(self) -> Vec<Value>;

    fn from_body(body: Vec<Value>) -> Result<Self, Error>;
}

/// A value of any type, carried as a variant.
#[derive(Clone, Debug, PartialEq)]
pub struct Variant(pub Value);

/// A struct, represented by a tuple of its fields.
#[derive(Clone, Debug, PartialEq)]
pub struct Struct<T>(pub T);

pub(crate) fn mismatch(expected: &Type, actual: &Value) -> Error {
    Error::TypeMismatch {
        expected: expected.to_string(),
        actual: actual.ty().to_string(),
    }
}

macro_rules! simple {
    ($ty:ty, $variant:ident) => {
        impl DbusType for $ty {
            fn dbus_type() -> Type {
                Type::$variant
            }

            fn into_value(self) -> Value {
                Value::$variant(self)
            }

            fn from_value(value: Value) -> Result<Self, Error> {
                match value {
                    Value::$variant(v) => Ok(v),
                    v => Err(mismatch(&Type::$variant, &v)),
                }
            }
        }
    };
}

simple!(u8, Byte);
simple!(bool, Bool);
simple!(i16, Int16);
simple!(u16, Uint16);
simple!(i32, Int32);
simple!(u32, Uint32);
simple!(i64, Int64);
simple!(u64, Uint64);
simple!(f64, Double);
simple!(String, String);
simple!(ObjectPath, ObjectPath);
simple!(Signature, Signature);

impl DbusType for Fd {
    fn dbus_type() -> Type {
        Type::UnixFd
    }

    fn into_value(self) -> Value {
        Value::UnixFd(self)
    }

    fn from_value(value: Value) -> Result<Self, Error> {
        match value {
            Value::UnixFd(fd) => Ok(fd),
            v => Err(mismatch(&Type::UnixFd, &v)),
        }
    }
}

impl DbusType for Variant {
    fn dbus_type() -> Type {
        Type::Variant
    }

    fn into_value(self) -> Value {
        self.0.into_variant()
    }

    fn from_value(value: Value) -> Result<Self, Error> {
        match value {
            Value::Variant(v) => Ok(Variant(*v)),
            v => Err(mismatch(&Type::Variant, &v)),
        }
    }
}

impl Variant {
    /// Converts the contained value.
    pub fn get<T: DbusType>(self) -> Result<T, Error> {
        T::from_value(self.0)
    }
}

impl<T: DbusType> DbusType for Vec<T> {
    fn dbus_type() -> Type {
        Type::Array(Box::new(T::dbus_type()))
    }

    fn into_value(self) -> Value {
        let items = self.into_iter().map(|v| v.into_value()).collect();
        Value::Array(Array::new_unchecked(T::dbus_type(), items))
    }

    fn from_value(value: Value) -> Result<Self, Error> {
        match value {
            Value::Array(a) if *a.element_type() == T::dbus_type() => {
                a.into_items().into_iter().map(T::from_value).collect()
            }
            v => Err(mismatch(&Self::dbus_type(), &v)),
        }
    }
}

fn dict_type<K: DbusType, V: DbusType>() -> Type {
    Type::Array(Box::new(Type::DictEntry(
        Box::new(K::dbus_type()),
        Box::new(V::dbus_type()),
    )))
}

fn dict_into_value<K: DbusType, V: DbusType>(entries: impl Iterator<Item = (K, V)>) -> Value {
    let items = entries
        .map(|(k, v)| Value::DictEntry(Box::new(k.into_value()), Box::new(v.into_value())))
        .collect();
    let elem = Type::DictEntry(Box::new(K::dbus_type()), Box::new(V::dbus_type()));
    Value::Array(Array::new_unchecked(elem, items))
}

fn dict_from_value<K: DbusType, V: DbusType, C: FromIterator<(K, V)>>(
    value: Value,
) -> Result<C, Error> {
    let expected = dict_type::<K, V>();
    match value {
        Value::Array(a) if Type::Array(Box::new(a.element_type().clone())) == expected => a
            .into_items()
            .into_iter()
            .map(|item| match item {
                Value::DictEntry(k, v) => Ok((K::from_value(*k)?, V::from_value(*v)?)),
                v => Err(mismatch(&expected, &v)),
            })
            .collect(),
        v => Err(mismatch(&expected, &v)),
    }
}

impl<K, V, S> DbusType for HashMap<K, V, S>
where
    K: DbusType + Eq + Hash,
    V: DbusType,
    S: BuildHasher + Default,
{
    fn dbus_type() -> Type {
        dict_type::<K, V>()
    }

    fn into_value(self) -> Value {
        dict_into_value(self.into_iter())
    }

    fn from_value(value: Value) -> Result<Self, Error> {
        dict_from_value(value)
    }
}

impl<K, V> DbusType for BTreeMap<K, V>
where
    K: DbusType + Ord,
    V: DbusType,
{
    fn dbus_type() -> Type {
        dict_type::<K, V>()
    }

    fn into_value(self) -> Value {
        dict_into_value(self.into_iter())
    }

    fn from_value(value: Value) -> Result<Self, Error> {
        dict_from_value(value)
    }
}

impl Args for () {
    fn signature() -> Option<Signature> {
        Some(Signature::empty())
    }

    fn into_body(self) -> Vec<Value> {
        vec![]
    }

    fn from_body(body: Vec<Value>) -> Result<Self, Error> {
        match body.len() {
            0 => Ok(()),
            n => Err(Error::BodyArity {
                expected: 0,
                actual: n,
            }),
        }
    }
}

/// A body of arbitrary values.
impl Args for Vec<Value> {
    fn signature() -> Option<Signature> {
        None
    }

    fn into_body(self) -> Vec<Value> {
        self
    }

    fn from_body(body: Vec<Value>) -> Result<Self, Error> {
        Ok(body)
    }
}

macro_rules! tuple {
    ($n:expr; $($name:ident),+) => {
        impl<$($name: DbusType),+> DbusType for Struct<($($name,)+)> {
            fn dbus_type() -> Type {
                Type::Struct(vec![$($name::dbus_type()),+])
            }

            #[allow(non_snake_case)]
            fn into_value(self) -> Value {
                let ($($name,)+) = self.0;
                Value::Struct(vec![$($name.into_value()),+])
            }

            fn from_value(value: Value) -> Result<Self, Error> {
                match value {
                    Value::Struct(fields) if fields.len() == $n => {
                        let mut fields = fields.into_iter();
                        Ok(Struct(($(
                            $name::from_value(fields.next().ok_or(Error::UnexpectedEof)?)?,
                        )+)))
                    }
                    v => Err(mismatch(&Self::dbus_type(), &v)),
                }
            }
        }

        impl<$($name: DbusType),+> Args for ($($name,)+) {
            fn signature() -> Option<Signature> {
                Signature::from_types(vec![$($name::dbus_type()),+]).ok()
            }

            #[allow(non_snake_case)]
            fn into_body(self) -> Vec<Value> {
                let ($($name,)+) = self;
                vec![$($name.into_value()),+]
            }

            fn from_body(body: Vec<Value>) -> Result<Self, Error> {
                if body.len() != $n {
                    return Err(Error::BodyArity {
                        expected: $n,
                        actual: body.len(),
                    });
                }
                let mut body = body.into_iter();
                Ok(($(
                    $name::from_value(body.next().ok_or(Error::UnexpectedEof)?)?,
                )+))
            }
        }
    };
}

tuple!(1; A);
tuple!(2; A, B);
tuple!(3; A, B, C);
tuple!(4; A, B, C, D);
tuple!(5; A, B, C, D, E);
tuple!(6; A, B, C, D, E, F);
tuple!(7; A, B, C, D, E, F, G);
tuple!(8; A, B, C, D, E, F, G, H);

/// Converts the single value of a body.
pub fn single<T: DbusType>(body: Vec<Value>) -> Result<T, Error> {
    <(T,)>::from_body(body).map(|(v,)| v)
}
