//! Variable values and their wire encoding.

use bytes::{BufMut, Bytes, BytesMut};

use super::{Decoder, VarType};
use crate::error::internal::DecodeErrorKind;
use crate::error::{Result, Status};
use crate::table::Table;

/// Value of a JIP variable.
///
/// Integers and floats travel big-endian, floats as their bit pattern.
/// Strings and blobs carry a one byte length prefix, so at most 255 bytes
/// fit. Strings are kept as the raw bytes the device sent; they need not be
/// UTF-8. Tables never travel as a single value; see [`TablePage`](super::TablePage).
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    I8(i8),
    I16(i16),
    I32(i32),
    I64(i64),
    U8(u8),
    U16(u16),
    U32(u32),
    U64(u64),
    Float(f32),
    Double(f64),
    Str(Bytes),
    Blob(Bytes),
    Table(Table),
}

impl Value {
    /// The wire type tag of this value.
    pub fn var_type(&self) -> VarType {
        match self {
            Self::I8(_) => VarType::Int8,
            Self::I16(_) => VarType::Int16,
            Self::I32(_) => VarType::Int32,
            Self::I64(_) => VarType::Int64,
            Self::U8(_) => VarType::Uint8,
            Self::U16(_) => VarType::Uint16,
            Self::U32(_) => VarType::Uint32,
            Self::U64(_) => VarType::Uint64,
            Self::Float(_) => VarType::Flt,
            Self::Double(_) => VarType::Dbl,
            Self::Str(_) => VarType::Str,
            Self::Blob(_) => VarType::Blob,
            Self::Table(_) => VarType::Table,
        }
    }

    /// Zero, empty string, empty blob or empty table.
    pub fn default_for(var_type: VarType) -> Self {
        match var_type {
            VarType::Int8 => Self::I8(0),
            VarType::Int16 => Self::I16(0),
            VarType::Int32 => Self::I32(0),
            VarType::Int64 => Self::I64(0),
            VarType::Uint8 => Self::U8(0),
            VarType::Uint16 => Self::U16(0),
            VarType::Uint32 => Self::U32(0),
            VarType::Uint64 => Self::U64(0),
            VarType::Flt => Self::Float(0.0),
            VarType::Dbl => Self::Double(0.0),
            VarType::Str => Self::Str(Bytes::new()),
            VarType::Blob => Self::Blob(Bytes::new()),
            VarType::Table => Self::Table(Table::new()),
        }
    }

    /// Size of the value as stored locally.
    ///
    /// Strings count a terminator that never travels on the wire.
    pub fn stored_len(&self) -> usize {
        match self {
            Self::I8(_) | Self::U8(_) => 1,
            Self::I16(_) | Self::U16(_) => 2,
            Self::I32(_) | Self::U32(_) | Self::Float(_) => 4,
            Self::I64(_) | Self::U64(_) | Self::Double(_) => 8,
            Self::Str(s) => s.len() + 1,
            Self::Blob(b) => b.len(),
            Self::Table(t) => t.rows().map(|(_, row)| row.len()).sum(),
        }
    }

    /// Append the wire encoding.
    ///
    /// Fails with `BadBufferSize` for strings and blobs longer than 255
    /// bytes and with `WrongType` for tables.
    pub fn encode(&self, buf: &mut BytesMut) -> std::result::Result<(), Status> {
        match self {
            Self::I8(v) => buf.put_i8(*v),
            Self::I16(v) => buf.put_i16(*v),
            Self::I32(v) => buf.put_i32(*v),
            Self::I64(v) => buf.put_i64(*v),
            Self::U8(v) => buf.put_u8(*v),
            Self::U16(v) => buf.put_u16(*v),
            Self::U32(v) => buf.put_u32(*v),
            Self::U64(v) => buf.put_u64(*v),
            Self::Float(v) => buf.put_u32(v.to_bits()),
            Self::Double(v) => buf.put_u64(v.to_bits()),
            Self::Str(s) => put_prefixed(buf, s)?,
            Self::Blob(b) => put_prefixed(buf, b)?,
            Self::Table(_) => return Err(Status::WrongType),
        }
        Ok(())
    }

    /// Read one value of `var_type` from a response body.
    pub(crate) fn decode(var_type: VarType, decoder: &mut Decoder) -> Result<Self> {
        Ok(match var_type {
            VarType::Int8 => Self::I8(decoder.read_u8()? as i8),
            VarType::Int16 => Self::I16(decoder.read_u16()? as i16),
            VarType::Int32 => Self::I32(decoder.read_u32()? as i32),
            VarType::Int64 => Self::I64(decoder.read_u64()? as i64),
            VarType::Uint8 => Self::U8(decoder.read_u8()?),
            VarType::Uint16 => Self::U16(decoder.read_u16()?),
            VarType::Uint32 => Self::U32(decoder.read_u32()?),
            VarType::Uint64 => Self::U64(decoder.read_u64()?),
            VarType::Flt => Self::Float(f32::from_bits(decoder.read_u32()?)),
            VarType::Dbl => Self::Double(f64::from_bits(decoder.read_u64()?)),
            VarType::Str => Self::Str(decoder.read_prefixed()?),
            VarType::Blob => Self::Blob(decoder.read_prefixed()?),
            VarType::Table => {
                return Err(decoder.malformed(DecodeErrorKind::UnknownVarType(var_type.as_u8())));
            }
        })
    }

    /// Parse the data of a SET request, which must be exactly one value.
    ///
    /// Fixed-size types need the exact byte count; strings and blobs need a
    /// length prefix that matches what follows.
    pub fn from_payload(var_type: VarType, payload: &[u8]) -> std::result::Result<Self, Status> {
        let fixed = |n: usize| -> std::result::Result<&[u8], Status> {
            if payload.len() == n {
                Ok(payload)
            } else {
                Err(Status::BadBufferSize)
            }
        };
        let prefixed = || -> std::result::Result<&[u8], Status> {
            match payload.split_first() {
                Some((&len, rest)) if len as usize == rest.len() => Ok(rest),
                _ => Err(Status::BadBufferSize),
            }
        };
        Ok(match var_type {
            VarType::Int8 => Self::I8(fixed(1)?[0] as i8),
            VarType::Uint8 => Self::U8(fixed(1)?[0]),
            VarType::Int16 => Self::I16(i16::from_be_bytes(array(fixed(2)?))),
            VarType::Uint16 => Self::U16(u16::from_be_bytes(array(fixed(2)?))),
            VarType::Int32 => Self::I32(i32::from_be_bytes(array(fixed(4)?))),
            VarType::Uint32 => Self::U32(u32::from_be_bytes(array(fixed(4)?))),
            VarType::Flt => Self::Float(f32::from_bits(u32::from_be_bytes(array(fixed(4)?)))),
            VarType::Int64 => Self::I64(i64::from_be_bytes(array(fixed(8)?))),
            VarType::Uint64 => Self::U64(u64::from_be_bytes(array(fixed(8)?))),
            VarType::Dbl => Self::Double(f64::from_bits(u64::from_be_bytes(array(fixed(8)?)))),
            VarType::Str => Self::Str(Bytes::copy_from_slice(prefixed()?)),
            VarType::Blob => Self::Blob(Bytes::copy_from_slice(prefixed()?)),
            VarType::Table => return Err(Status::WrongType),
        })
    }

    pub fn as_u8(&self) -> Option<u8> {
        match self {
            Self::U8(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_u32(&self) -> Option<u32> {
        match self {
            Self::U32(v) => Some(*v),
            Self::U16(v) => Some(u32::from(*v)),
            Self::U8(v) => Some(u32::from(*v)),
            _ => None,
        }
    }

    /// The string, if it is one and holds valid UTF-8.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Str(s) => std::str::from_utf8(s).ok(),
            _ => None,
        }
    }

    /// The string with invalid UTF-8 sequences replaced, for display.
    pub fn to_string_lossy(&self) -> Option<std::borrow::Cow<'_, str>> {
        match self {
            Self::Str(s) => Some(String::from_utf8_lossy(s)),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Self::Blob(b) => Some(b),
            Self::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_table(&self) -> Option<&Table> {
        match self {
            Self::Table(t) => Some(t),
            _ => None,
        }
    }

    pub fn as_table_mut(&mut self) -> Option<&mut Table> {
        match self {
            Self::Table(t) => Some(t),
            _ => None,
        }
    }
}

fn put_prefixed(buf: &mut BytesMut, data: &[u8]) -> std::result::Result<(), Status> {
    let len = u8::try_from(data.len()).map_err(|_| Status::BadBufferSize)?;
    buf.put_u8(len);
    buf.put_slice(data);
    Ok(())
}

fn array<const N: usize>(slice: &[u8]) -> [u8; N] {
    let mut out = [0u8; N];
    out.copy_from_slice(slice);
    out
}

impl std::fmt::Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::I8(v) => write!(f, "{}", v),
            Self::I16(v) => write!(f, "{}", v),
            Self::I32(v) => write!(f, "{}", v),
            Self::I64(v) => write!(f, "{}", v),
            Self::U8(v) => write!(f, "{}", v),
            Self::U16(v) => write!(f, "{}", v),
            Self::U32(v) => write!(f, "{}", v),
            Self::U64(v) => write!(f, "{}", v),
            Self::Float(v) => write!(f, "{}", v),
            Self::Double(v) => write!(f, "{}", v),
            Self::Str(s) => write!(f, "{:?}", String::from_utf8_lossy(s)),
            Self::Blob(b) => {
                f.write_str("0x")?;
                for byte in b.iter() {
                    write!(f, "{:02x}", byte)?;
                }
                Ok(())
            }
            Self::Table(t) => write!(f, "table({} rows)", t.present()),
        }
    }
}

macro_rules! impl_from {
    ($($ty:ty => $variant:ident),* $(,)?) => {
        $(
            impl From<$ty> for Value {
                fn from(v: $ty) -> Self {
                    Self::$variant(v)
                }
            }
        )*
    };
}

impl_from! {
    i8 => I8,
    i16 => I16,
    i32 => I32,
    i64 => I64,
    u8 => U8,
    u16 => U16,
    u32 => U32,
    u64 => U64,
    f32 => Float,
    f64 => Double,
    Bytes => Blob,
    Table => Table,
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Self::Str(Bytes::from(v))
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Self::Str(Bytes::copy_from_slice(v.as_bytes()))
    }
}
