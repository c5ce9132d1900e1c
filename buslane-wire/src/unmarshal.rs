use crate::{
    marshal::MAX_ARRAY_LEN, Array, Endian, Error, Fd, ObjectPath, Signature, SignatureError,
    Type, Value,
};

const MAX_VARIANT_DEPTH: usize = 64;

/// Deserializes values from the D-Bus wire format.
///
/// Offsets used for alignment are relative to the start of `buf`.
pub struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
    endian: Endian,
    fds: &'a [Fd],
    variants: usize,
}

macro_rules! read_int {
    ($name:ident, $ty:ty) => {
        pub fn $name(&mut self) -> Result<$ty, Error> {
            const N: usize = std::mem::size_of::<$ty>();
            self.align(N)?;
            let bytes: [u8; N] = self.take(N)?.try_into().map_err(|_| Error::UnexpectedEof)?;
            Ok(match self.endian {
                Endian::Little => <$ty>::from_le_bytes(bytes),
                Endian::Big => <$ty>::from_be_bytes(bytes),
            })
        }
    };
}

impl<'a> Reader<'a> {
    pub fn new(buf: &'a [u8], endian: Endian, fds: &'a [Fd]) -> Self {
        Self::at(buf, 0, endian, fds)
    }

    /// Creates a reader that starts at `pos` of `buf`.
    pub fn at(buf: &'a [u8], pos: usize, endian: Endian, fds: &'a [Fd]) -> Self {
        Self {
            buf,
            pos,
            endian,
            fds,
            variants: 0,
        }
    }

    pub fn pos(&self) -> usize {
        self.pos
    }

    pub fn remaining(&self) -> usize {
        self.buf.len().saturating_sub(self.pos)
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], Error> {
        if self.remaining() < n {
            return Err(Error::UnexpectedEof);
        }
        let res = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(res)
    }

    /// Skips padding up to a multiple of `align`. Padding bytes must be zero.
    pub fn align(&mut self, align: usize) -> Result<(), Error> {
        let target = self.pos.next_multiple_of(align);
        let padding = self.take(target - self.pos)?;
        if padding.iter().any(|b| *b != 0) {
            return Err(Error::NonZeroPadding);
        }
        Ok(())
    }

    pub fn read_u8(&mut self) -> Result<u8, Error> {
        Ok(self.take(1)?[0])
    }

    read_int!(read_u16, u16);
    read_int!(read_i16, i16);
    read_int!(read_u32, u32);
    read_int!(read_i32, i32);
    read_int!(read_u64, u64);
    read_int!(read_i64, i64);

    pub fn read_bool(&mut self) -> Result<bool, Error> {
        match self.read_u32()? {
            0 => Ok(false),
            1 => Ok(true),
            n => Err(Error::InvalidBool(n)),
        }
    }

    fn read_text(&mut self, len: usize) -> Result<&'a str, Error> {
        let bytes = self.take(len)?;
        if self.read_u8()? != 0 {
            return Err(Error::MissingNul);
        }
        if bytes.contains(&0) {
            return Err(Error::EmbeddedNul);
        }
        std::str::from_utf8(bytes).map_err(|_| Error::InvalidUtf8)
    }

    pub fn read_str(&mut self) -> Result<&'a str, Error> {
        let len = self.read_u32()? as usize;
        self.read_text(len)
    }

    pub fn read_object_path(&mut self) -> Result<ObjectPath, Error> {
        ObjectPath::new(self.read_str()?)
    }

    pub fn read_signature(&mut self) -> Result<Signature, Error> {
        let len = self.read_u8()? as usize;
        let s = self.read_text(len).map_err(|e| match e {
            Error::InvalidUtf8 => Error::Signature(SignatureError::InvalidUtf8),
            e => e,
        })?;
        Ok(Signature::new(s)?)
    }

    pub fn read_value(&mut self, ty: &Type) -> Result<Value, Error> {
        let value = match ty {
            Type::Byte => Value::Byte(self.read_u8()?),
            Type::Bool => Value::Bool(self.read_bool()?),
            Type::Int16 => Value::Int16(self.read_i16()?),
            Type::Uint16 => Value::Uint16(self.read_u16()?),
            Type::Int32 => Value::Int32(self.read_i32()?),
            Type::Uint32 => Value::Uint32(self.read_u32()?),
            Type::Int64 => Value::Int64(self.read_i64()?),
            Type::Uint64 => Value::Uint64(self.read_u64()?),
            Type::Double => Value::Double(f64::from_bits(self.read_u64()?)),
            Type::String => Value::String(self.read_str()?.to_string()),
            Type::ObjectPath => Value::ObjectPath(self.read_object_path()?),
            Type::Signature => Value::Signature(self.read_signature()?),
            Type::UnixFd => {
                let idx = self.read_u32()?;
                let fd = self.fds.get(idx as usize).ok_or(Error::FdIndex(idx))?;
                Value::UnixFd(fd.clone())
            }
            Type::Array(elem) => {
                let len = self.read_u32()? as usize;
                if len > MAX_ARRAY_LEN {
                    return Err(Error::ArrayTooLong(len));
                }
                self.align(elem.alignment())?;
                if self.remaining() < len {
                    return Err(Error::UnexpectedEof);
                }
                let end = self.pos + len;
                let mut items = vec![];
                while self.pos < end {
                    items.push(self.read_value(elem)?);
                }
                if self.pos != end {
                    return Err(Error::ArrayLength);
                }
                Value::Array(Array::new_unchecked((**elem).clone(), items))
            }
            Type::Struct(fields) => {
                self.align(8)?;
                let mut values = Vec::with_capacity(fields.len());
                for field in fields {
                    values.push(self.read_value(field)?);
                }
                Value::Struct(values)
            }
            Type::DictEntry(k, v) => {
                self.align(8)?;
                let k = self.read_value(k)?;
                let v = self.read_value(v)?;
                Value::DictEntry(Box::new(k), Box::new(v))
            }
            Type::Variant => {
                let signature = self.read_signature()?;
                let Some(inner) = signature.single() else {
                    return Err(SignatureError::NotSingle.into());
                };
                if self.variants >= MAX_VARIANT_DEPTH {
                    return Err(Error::VariantDepth);
                }
                self.variants += 1;
                let value = self.read_value(inner);
                self.variants -= 1;
                Value::Variant(Box::new(value?))
            }
        };
        Ok(value)
    }

    /// Reads a complete message body. Every byte must be consumed.
    pub fn read_body(&mut self, signature: &Signature) -> Result<Vec<Value>, Error> {
        let mut values = Vec::with_capacity(signature.types().len());
        for ty in signature.types() {
            values.push(self.read_value(ty)?);
        }
        if self.remaining() > 0 {
            return Err(Error::TrailingBytes(self.remaining()));
        }
        Ok(values)
    }
}

#[cfg(test)]
mod tests {
    use {super::*, crate::marshal::Writer};

    fn read(bytes: &[u8], sig: &str) -> Result<Vec<Value>, Error> {
        let sig = Signature::new(sig).unwrap();
        Reader::new(bytes, Endian::Little, &[]).read_body(&sig)
    }

    #[test]
    fn round_trip_both_endians() {
        let value = Value::Struct(vec![
            Value::Byte(9),
            Value::dict(
                Type::String,
                Type::Variant,
                [(Value::String("k".into()), Value::Int64(-3).into_variant())],
            )
            .unwrap(),
            Value::Double(-1.25),
            Value::ObjectPath(ObjectPath::new("/a/b").unwrap()),
            Value::Signature(Signature::new("a{sv}").unwrap()),
            Value::Uint32(123).into_variant().into_variant(),
        ]);
        for endian in [Endian::Little, Endian::Big] {
            let mut w = Writer::new(endian);
            w.write_value(&value).unwrap();
            let (bytes, _) = w.into_parts();
            let mut r = Reader::new(&bytes, endian, &[]);
            assert_eq!(r.read_value(&value.ty()).unwrap(), value);
            assert_eq!(r.remaining(), 0);
        }
    }

    #[test]
    fn rejects_bad_bool() {
        assert!(matches!(read(&[2, 0, 0, 0], "b"), Err(Error::InvalidBool(2))));
    }

    #[test]
    fn rejects_nonzero_padding() {
        assert!(matches!(
            read(&[1, 1, 0, 0, 5, 0, 0, 0], "yu"),
            Err(Error::NonZeroPadding)
        ));
        assert_eq!(
            read(&[1, 0, 0, 0, 5, 0, 0, 0], "yu").unwrap(),
            [Value::Byte(1), Value::Uint32(5)]
        );
    }

    #[test]
    fn rejects_bad_strings() {
        assert!(matches!(
            read(&[2, 0, 0, 0, b'a', 0, 0], "s"),
            Err(Error::EmbeddedNul)
        ));
        assert!(matches!(
            read(&[1, 0, 0, 0, b'a', b'b'], "s"),
            Err(Error::MissingNul)
        ));
        assert!(matches!(
            read(&[1, 0, 0, 0, 0xff, 0], "s"),
            Err(Error::InvalidUtf8)
        ));
        assert!(matches!(
            read(&[2, 0, 0, 0, b'a', b'-', 0], "o"),
            Err(Error::InvalidObjectPath(_))
        ));
    }

    #[test]
    fn array_limits() {
        // 3 bytes of u16 elements cannot end on an element boundary
        assert!(matches!(
            read(&[3, 0, 0, 0, 1, 0, 2, 0], "aq"),
            Err(Error::ArrayLength)
        ));
        let too_long = ((MAX_ARRAY_LEN + 1) as u32).to_le_bytes();
        assert!(matches!(read(&too_long, "ay"), Err(Error::ArrayTooLong(_))));
        assert!(matches!(
            read(&[8, 0, 0, 0, 1], "ay"),
            Err(Error::UnexpectedEof)
        ));
    }

    #[test]
    fn trailing_bytes_rejected() {
        assert!(matches!(
            read(&[1, 0, 0, 0, 0], "u"),
            Err(Error::TrailingBytes(1))
        ));
    }

    #[test]
    fn fd_index_checked() {
        assert!(matches!(read(&[0, 0, 0, 0], "h"), Err(Error::FdIndex(0))));
    }

    #[test]
    fn variant_depth_limited() {
        let mut value = Value::Byte(0);
        for _ in 0..65 {
            value = value.into_variant();
        }
        let mut w = Writer::new(Endian::Little);
        w.write_value(&value).unwrap();
        let (bytes, _) = w.into_parts();
        assert!(matches!(
            Reader::new(&bytes, Endian::Little, &[]).read_value(&Type::Variant),
            Err(Error::VariantDepth)
        ));
    }
}
