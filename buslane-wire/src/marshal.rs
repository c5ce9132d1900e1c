use crate::{Error, Fd, Signature, Value};

/// The maximum size of an array's contents.
pub const MAX_ARRAY_LEN: usize = 64 << 20;

/// Byte order of a message.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Endian {
    Little,
    Big,
}

impl Endian {
    /// The byte order of the host.
    pub const NATIVE: Endian = if cfg!(target_endian = "big") {
        Endian::Big
    } else {
        Endian::Little
    };

    pub fn marker(self) -> u8 {
        match self {
            Endian::Little => b'l',
            Endian::Big => b'B',
        }
    }

    pub fn from_marker(marker: u8) -> Result<Self, Error> {
        match marker {
            b'l' => Ok(Endian::Little),
            b'B' => Ok(Endian::Big),
            _ => Err(Error::InvalidEndianness(marker)),
        }
    }
}

/// Serializes values into the D-Bus wire format.
///
/// Alignment is computed relative to the start of the buffer, so a writer must start
/// at an 8-aligned position of the message.
pub struct Writer {
    buf: Vec<u8>,
    fds: Vec<Fd>,
    endian: Endian,
}

macro_rules! write_int {
    ($name:ident, $ty:ty) => {
        pub fn $name(&mut self, v: $ty) {
            self.pad(std::mem::size_of::<$ty>());
            let bytes = match self.endian {
                Endian::Little => v.to_le_bytes(),
                Endian::Big => v.to_be_bytes(),
            };
            self.buf.extend_from_slice(&bytes);
        }
    };
}

impl Writer {
    pub fn new(endian: Endian) -> Self {
        Self {
            buf: Vec::with_capacity(128),
            fds: vec![],
            endian,
        }
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn endian(&self) -> Endian {
        self.endian
    }

    pub fn into_parts(self) -> (Vec<u8>, Vec<Fd>) {
        (self.buf, self.fds)
    }

    /// Appends zero bytes until the length is a multiple of `align`.
    pub fn pad(&mut self, align: usize) {
        let len = self.buf.len().next_multiple_of(align);
        self.buf.resize(len, 0);
    }

    pub fn write_u8(&mut self, v: u8) {
        self.buf.push(v);
    }

    write_int!(write_u16, u16);
    write_int!(write_i16, i16);
    write_int!(write_u32, u32);
    write_int!(write_i32, i32);
    write_int!(write_u64, u64);
    write_int!(write_i64, i64);

    pub fn write_f64(&mut self, v: f64) {
        self.write_u64(v.to_bits());
    }

    pub fn write_str(&mut self, s: &str) -> Result<(), Error> {
        if s.contains('\0') {
            return Err(Error::EmbeddedNul);
        }
        self.write_u32(s.len() as u32);
        self.buf.extend_from_slice(s.as_bytes());
        self.buf.push(0);
        Ok(())
    }

    pub fn write_signature(&mut self, s: &str) {
        self.buf.push(s.len() as u8);
        self.buf.extend_from_slice(s.as_bytes());
        self.buf.push(0);
    }

    /// Patches a previously written u32 at `pos`.
    fn patch_u32(&mut self, pos: usize, v: u32) {
        let bytes = match self.endian {
            Endian::Little => v.to_le_bytes(),
            Endian::Big => v.to_be_bytes(),
        };
        self.buf[pos..pos + 4].copy_from_slice(&bytes);
    }

    pub fn write_value(&mut self, value: &Value) -> Result<(), Error> {
        match value {
            Value::Byte(v) => self.write_u8(*v),
            Value::Bool(v) => self.write_u32(*v as u32),
            Value::Int16(v) => self.write_i16(*v),
            Value::Uint16(v) => self.write_u16(*v),
            Value::Int32(v) => self.write_i32(*v),
            Value::Uint32(v) => self.write_u32(*v),
            Value::Int64(v) => self.write_i64(*v),
            Value::Uint64(v) => self.write_u64(*v),
            Value::Double(v) => self.write_f64(*v),
            Value::String(s) => self.write_str(s)?,
            Value::ObjectPath(p) => self.write_str(p.as_str())?,
            Value::Signature(s) => self.write_signature(s.as_str()),
            Value::UnixFd(fd) => {
                let idx = self.fds.len() as u32;
                self.fds.push(fd.clone());
                self.write_u32(idx);
            }
            Value::Array(array) => {
                self.write_u32(0);
                let len_pos = self.buf.len() - 4;
                self.pad(array.element_type().alignment());
                let start = self.buf.len();
                for item in array.items() {
                    self.write_value(item)?;
                }
                let len = self.buf.len() - start;
                if len > MAX_ARRAY_LEN {
                    return Err(Error::ArrayTooLong(len));
                }
                self.patch_u32(len_pos, len as u32);
            }
            Value::Struct(fields) => {
                self.pad(8);
                for field in fields {
                    self.write_value(field)?;
                }
            }
            Value::DictEntry(k, v) => {
                self.pad(8);
                self.write_value(k)?;
                self.write_value(v)?;
            }
            Value::Variant(inner) => {
                let signature = Signature::from_types(vec![inner.ty()])?;
                self.write_signature(signature.as_str());
                self.write_value(inner)?;
            }
        }
        Ok(())
    }
}
