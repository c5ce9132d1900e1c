use {
    crate::SignatureError,
    std::{
        fmt::{self, Display, Formatter, Write},
        str::FromStr,
    },
};

pub const MAX_SIGNATURE_LEN: usize = 255;
pub const MAX_ARRAY_DEPTH: usize = 32;
pub const MAX_STRUCT_DEPTH: usize = 32;

/// A single complete D-Bus type.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Type {
    Byte,
    Bool,
    Int16,
    Uint16,
    Int32,
    Uint32,
    Int64,
    Uint64,
    Double,
    String,
    ObjectPath,
    Signature,
    UnixFd,
    Variant,
    Array(Box<Type>),
    DictEntry(Box<Type>, Box<Type>),
    Struct(Vec<Type>),
}

impl Type {
    /// The alignment of values of this type on the wire.
    pub fn alignment(&self) -> usize {
        match self {
            Type::Byte | Type::Signature | Type::Variant => 1,
            Type::Int16 | Type::Uint16 => 2,
            Type::Bool
            | Type::Int32
            | Type::Uint32
            | Type::String
            | Type::ObjectPath
            | Type::UnixFd
            | Type::Array(_) => 4,
            Type::Int64
            | Type::Uint64
            | Type::Double
            | Type::DictEntry(..)
            | Type::Struct(_) => 8,
        }
    }

    /// Basic types may be used as dict entry keys.
    pub fn is_basic(&self) -> bool {
        !matches!(
            self,
            Type::Variant | Type::Array(_) | Type::DictEntry(..) | Type::Struct(_)
        )
    }

    /// Fixed types always occupy the same number of bytes.
    pub fn is_fixed(&self) -> bool {
        match self {
            Type::String | Type::ObjectPath | Type::Signature | Type::Variant | Type::Array(_) => {
                false
            }
            Type::DictEntry(k, v) => k.is_fixed() && v.is_fixed(),
            Type::Struct(fields) => fields.iter().all(|f| f.is_fixed()),
            _ => true,
        }
    }

    /// The child types of containers.
    pub fn children(&self) -> Vec<&Type> {
        match self {
            Type::Array(e) => vec![e],
            Type::DictEntry(k, v) => vec![k, v],
            Type::Struct(fields) => fields.iter().collect(),
            _ => vec![],
        }
    }

    /// Parses a signature that must contain exactly one complete type.
    pub fn parse_single(s: &str) -> Result<Type, SignatureError> {
        let mut types = Signature::new(s)?.types;
        if types.len() != 1 {
            return Err(SignatureError::NotSingle);
        }
        Ok(types.pop().unwrap_or(Type::Byte))
    }

    fn depths(&self) -> (usize, usize) {
        match self {
            Type::Array(e) => {
                let (a, s) = e.depths();
                (a + 1, s)
            }
            Type::DictEntry(k, v) => {
                let (ka, ks) = k.depths();
                let (va, vs) = v.depths();
                (ka.max(va), ks.max(vs) + 1)
            }
            Type::Struct(fields) => {
                let (a, s) = fields
                    .iter()
                    .map(|f| f.depths())
                    .fold((0, 0), |(a1, s1), (a2, s2)| (a1.max(a2), s1.max(s2)));
                (a, s + 1)
            }
            _ => (0, 0),
        }
    }

    fn write(&self, out: &mut String) {
        let c = match self {
            Type::Byte => 'y',
            Type::Bool => 'b',
            Type::Int16 => 'n',
            Type::Uint16 => 'q',
            Type::Int32 => 'i',
            Type::Uint32 => 'u',
            Type::Int64 => 'x',
            Type::Uint64 => 't',
            Type::Double => 'd',
            Type::String => 's',
            Type::ObjectPath => 'o',
            Type::Signature => 'g',
            Type::UnixFd => 'h',
            Type::Variant => 'v',
            Type::Array(e) => {
                out.push('a');
                e.write(out);
                return;
            }
            Type::DictEntry(k, v) => {
                out.push('{');
                k.write(out);
                v.write(out);
                out.push('}');
                return;
            }
            Type::Struct(fields) => {
                out.push('(');
                for f in fields {
                    f.write(out);
                }
                out.push(')');
                return;
            }
        };
        out.push(c);
    }
}

impl Display for Type {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let mut s = String::new();
        self.write(&mut s);
        f.write_str(&s)
    }
}

/// A validated signature: a sequence of complete types.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct Signature {
    text: String,
    types: Vec<Type>,
}

impl Signature {
    pub fn new(s: &str) -> Result<Self, SignatureError> {
        if s.len() > MAX_SIGNATURE_LEN {
            return Err(SignatureError::TooLong);
        }
        let mut parser = Parser {
            s: s.as_bytes(),
            pos: 0,
        };
        let mut types = vec![];
        while parser.pos < parser.s.len() {
            types.push(parser.complete(0, 0, false)?);
        }
        Ok(Self {
            text: s.to_string(),
            types,
        })
    }

    pub fn empty() -> Self {
        Self::default()
    }

    /// Builds a signature from already parsed types, enforcing the length and depth
    /// limits.
    pub fn from_types(types: Vec<Type>) -> Result<Self, SignatureError> {
        let mut text = String::new();
        for ty in &types {
            let (arrays, structs) = ty.depths();
            if arrays > MAX_ARRAY_DEPTH {
                return Err(SignatureError::ArrayDepth);
            }
            if structs > MAX_STRUCT_DEPTH {
                return Err(SignatureError::StructDepth);
            }
            ty.write(&mut text);
        }
        if text.len() > MAX_SIGNATURE_LEN {
            return Err(SignatureError::TooLong);
        }
        Ok(Self { text, types })
    }

    pub fn as_str(&self) -> &str {
        &self.text
    }

    pub fn types(&self) -> &[Type] {
        &self.types
    }

    pub fn into_types(self) -> Vec<Type> {
        self.types
    }

    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }

    /// Returns the type if the signature consists of exactly one complete type.
    pub fn single(&self) -> Option<&Type> {
        match &*self.types {
            [t] => Some(t),
            _ => None,
        }
    }
}

impl Display for Signature {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(&self.text)
    }
}

impl FromStr for Signature {
    type Err = SignatureError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl TryFrom<&str> for Signature {
    type Error = SignatureError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<Type> for Signature {
    fn from(value: Type) -> Self {
        let mut text = String::new();
        value.write(&mut text);
        Self {
            text,
            types: vec![value],
        }
    }
}

impl PartialEq<str> for Signature {
    fn eq(&self, other: &str) -> bool {
        self.text == other
    }
}

impl PartialEq<&str> for Signature {
    fn eq(&self, other: &&str) -> bool {
        self.text == *other
    }
}

struct Parser<'a> {
    s: &'a [u8],
    pos: usize,
}

impl Parser<'_> {
    fn peek(&self) -> Option<u8> {
        self.s.get(self.pos).copied()
    }

    fn complete(
        &mut self,
        arrays: usize,
        structs: usize,
        array_element: bool,
    ) -> Result<Type, SignatureError> {
        let Some(c) = self.peek() else {
            return Err(SignatureError::MissingArrayElement);
        };
        self.pos += 1;
        let ty = match c {
            b'y' => Type::Byte,
            b'b' => Type::Bool,
            b'n' => Type::Int16,
            b'q' => Type::Uint16,
            b'i' => Type::Int32,
            b'u' => Type::Uint32,
            b'x' => Type::Int64,
            b't' => Type::Uint64,
            b'd' => Type::Double,
            b's' => Type::String,
            b'o' => Type::ObjectPath,
            b'g' => Type::Signature,
            b'h' => Type::UnixFd,
            b'v' => Type::Variant,
            b'a' => {
                if arrays >= MAX_ARRAY_DEPTH {
                    return Err(SignatureError::ArrayDepth);
                }
                if matches!(self.peek(), None | Some(b')') | Some(b'}')) {
                    return Err(SignatureError::MissingArrayElement);
                }
                Type::Array(Box::new(self.complete(arrays + 1, structs, true)?))
            }
            b'(' => {
                if structs >= MAX_STRUCT_DEPTH {
                    return Err(SignatureError::StructDepth);
                }
                let mut fields = vec![];
                loop {
                    match self.peek() {
                        None => return Err(SignatureError::UnterminatedStruct),
                        Some(b')') => {
                            self.pos += 1;
                            break;
                        }
                        Some(_) => fields.push(self.complete(arrays, structs + 1, false)?),
                    }
                }
                if fields.is_empty() {
                    return Err(SignatureError::EmptyStruct);
                }
                Type::Struct(fields)
            }
            b'{' => {
                if !array_element {
                    return Err(SignatureError::DictEntryOutsideArray);
                }
                if structs >= MAX_STRUCT_DEPTH {
                    return Err(SignatureError::StructDepth);
                }
                let mut entry = vec![];
                loop {
                    match self.peek() {
                        None => return Err(SignatureError::UnterminatedDictEntry),
                        Some(b'}') => {
                            self.pos += 1;
                            break;
                        }
                        Some(_) if entry.len() == 2 => {
                            return Err(SignatureError::DictEntryArity)
                        }
                        Some(_) => entry.push(self.complete(arrays, structs + 1, false)?),
                    }
                }
                let mut entry = entry.into_iter();
                let (Some(key), Some(value)) = (entry.next(), entry.next()) else {
                    return Err(SignatureError::DictEntryArity);
                };
                if !key.is_basic() {
                    return Err(SignatureError::DictEntryKey);
                }
                Type::DictEntry(Box::new(key), Box::new(value))
            }
            b')' | b'}' => return Err(SignatureError::Unbalanced(c)),
            _ => return Err(SignatureError::UnknownType(c)),
        };
        Ok(ty)
    }
}

/// Renders a list of types as a signature string without validation.
pub fn signature_string(types: &[Type]) -> String {
    let mut s = String::new();
    for ty in types {
        let _ = write!(s, "{ty}");
    }
    s
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_nested() {
        let sig = Signature::new("a{sv}(ia(ox))vay").unwrap();
        assert_eq!(sig.types().len(), 4);
        assert_eq!(
            sig.types()[0],
            Type::Array(Box::new(Type::DictEntry(
                Box::new(Type::String),
                Box::new(Type::Variant)
            )))
        );
        assert_eq!(sig.to_string(), "a{sv}(ia(ox))vay");
        assert_eq!(signature_string(sig.types()), "a{sv}(ia(ox))vay");
    }

    #[test]
    fn rejects_malformed() {
        let cases = [
            ("a", SignatureError::MissingArrayElement),
            ("(a)", SignatureError::MissingArrayElement),
            ("()", SignatureError::EmptyStruct),
            ("(ii", SignatureError::UnterminatedStruct),
            ("ii)", SignatureError::Unbalanced(b')')),
            ("{sv}", SignatureError::DictEntryOutsideArray),
            ("a{s}", SignatureError::DictEntryArity),
            ("a{sii}", SignatureError::DictEntryArity),
            ("a{vs}", SignatureError::DictEntryKey),
            ("a{sv", SignatureError::UnterminatedDictEntry),
            ("z", SignatureError::UnknownType(b'z')),
            ("a(i{sv})", SignatureError::DictEntryOutsideArray),
        ];
        for (sig, err) in cases {
            assert_eq!(Signature::new(sig), Err(err), "{sig}");
        }
    }

    #[test]
    fn depth_limits() {
        let ok = format!("{}y", "a".repeat(32));
        assert!(Signature::new(&ok).is_ok());
        let deep = format!("{}y", "a".repeat(33));
        assert_eq!(Signature::new(&deep), Err(SignatureError::ArrayDepth));
        let structs = format!("{}y{}", "(".repeat(33), ")".repeat(33));
        assert_eq!(Signature::new(&structs), Err(SignatureError::StructDepth));
        assert_eq!(
            Signature::new(&"y".repeat(256)),
            Err(SignatureError::TooLong)
        );
    }

    #[test]
    fn properties() {
        assert_eq!(Type::parse_single("(yx)").unwrap().alignment(), 8);
        assert_eq!(Type::parse_single("ay").unwrap().alignment(), 4);
        assert_eq!(Type::parse_single("g").unwrap().alignment(), 1);
        assert!(Type::parse_single("(yx)").unwrap().is_fixed());
        assert!(!Type::parse_single("(ys)").unwrap().is_fixed());
        assert!(Type::parse_single("h").unwrap().is_basic());
        assert!(!Type::parse_single("v").unwrap().is_basic());
        assert_eq!(Type::parse_single("ii"), Err(SignatureError::NotSingle));
        assert_eq!(Type::parse_single(""), Err(SignatureError::NotSingle));
    }

    #[test]
    fn from_types_validates() {
        let mut ty = Type::Byte;
        for _ in 0..33 {
            ty = Type::Array(Box::new(ty));
        }
        assert_eq!(
            Signature::from_types(vec![ty]),
            Err(SignatureError::ArrayDepth)
        );
        let sig = Signature::from_types(vec![Type::String, Type::Int32]).unwrap();
        assert_eq!(sig, "si");
    }
}
