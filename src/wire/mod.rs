//! JIP wire format.
//!
//! Every packet starts with a three byte header `{version, command, handle}`
//! followed by a command specific body. Multi-byte integers are big-endian.
//! Strings and blobs carry a one byte length prefix.
//!
//! Nothing in this module performs I/O.

mod message;
mod value;

pub use message::*;
pub use value::Value;

use std::net::SocketAddr;

use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

use crate::error::internal::DecodeErrorKind;
use crate::error::{Error, Result};

/// Protocol version carried in every header.
pub const PROTOCOL_VERSION: u8 = 0;

/// Default UDP port for JIP.
pub const DEFAULT_PORT: u16 = 1873;

/// Handle bit asking a low-power node to stay awake for a follow-up.
pub const STAY_AWAKE: u8 = 0x80;

/// Bits of the handle that carry the rolling counter.
pub const HANDLE_MASK: u8 = 0x7f;

/// Largest packet either side builds.
pub const MAX_PACKET_SIZE: usize = 1024;

/// JIP command codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Command {
    GetRequest,
    GetResponse,
    SetRequest,
    SetResponse,
    QueryMibRequest,
    QueryMibResponse,
    QueryVarRequest,
    QueryVarResponse,
    TrapRequest,
    UntrapRequest,
    TrapResponse,
    TrapNotify,
    GetMibRequest,
    SetMibRequest,
}

impl Command {
    pub fn from_u8(value: u8) -> Option<Self> {
        Some(match value {
            0x10 => Self::GetRequest,
            0x11 => Self::GetResponse,
            0x12 => Self::SetRequest,
            0x13 => Self::SetResponse,
            0x14 => Self::QueryMibRequest,
            0x15 => Self::QueryMibResponse,
            0x16 => Self::QueryVarRequest,
            0x17 => Self::QueryVarResponse,
            0x18 => Self::TrapRequest,
            0x19 => Self::UntrapRequest,
            0x1a => Self::TrapResponse,
            0x1b => Self::TrapNotify,
            0x1c => Self::GetMibRequest,
            0x1d => Self::SetMibRequest,
            _ => return None,
        })
    }

    pub fn as_u8(&self) -> u8 {
        match self {
            Self::GetRequest => 0x10,
            Self::GetResponse => 0x11,
            Self::SetRequest => 0x12,
            Self::SetResponse => 0x13,
            Self::QueryMibRequest => 0x14,
            Self::QueryMibResponse => 0x15,
            Self::QueryVarRequest => 0x16,
            Self::QueryVarResponse => 0x17,
            Self::TrapRequest => 0x18,
            Self::UntrapRequest => 0x19,
            Self::TrapResponse => 0x1a,
            Self::TrapNotify => 0x1b,
            Self::GetMibRequest => 0x1c,
            Self::SetMibRequest => 0x1d,
        }
    }
}

impl std::fmt::Display for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Debug::fmt(self, f)
    }
}

/// Packet header. The version byte is implicit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub command: Command,
    pub handle: u8,
}

impl Header {
    pub const LEN: usize = 3;

    pub fn new(command: Command, handle: u8) -> Self {
        Self { command, handle }
    }

    /// Whether the sender asked the receiver to stay awake.
    pub fn stay_awake(&self) -> bool {
        self.handle & STAY_AWAKE != 0
    }

    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u8(PROTOCOL_VERSION);
        buf.put_u8(self.command.as_u8());
        buf.put_u8(self.handle);
    }

    pub(crate) fn decode(decoder: &mut Decoder) -> Result<Self> {
        let version = decoder.read_u8()?;
        if version != PROTOCOL_VERSION {
            return Err(decoder.malformed(DecodeErrorKind::VersionMismatch(version)));
        }
        let command = decoder.read_u8()?;
        let command = Command::from_u8(command)
            .ok_or_else(|| decoder.malformed(DecodeErrorKind::UnknownCommand(command)))?;
        let handle = decoder.read_u8()?;
        Ok(Self { command, handle })
    }
}

/// Frame a body with a header.
pub fn encode_packet(header: Header, body: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(Header::LEN + body.len());
    header.encode(&mut buf);
    buf.put_slice(body);
    buf.freeze()
}

/// Split a packet into its header and body.
///
/// Rejects packets whose version byte is not [`PROTOCOL_VERSION`].
pub fn decode_packet(data: Bytes, source: SocketAddr) -> Result<(Header, Bytes)> {
    let mut decoder = Decoder::with_target(data, source);
    let header = Header::decode(&mut decoder)?;
    Ok((header, decoder.rest()))
}

/// Variable type tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VarType {
    Int8,
    Int16,
    Int32,
    Int64,
    Uint8,
    Uint16,
    Uint32,
    Uint64,
    Flt,
    Dbl,
    Str,
    Blob,
    Table,
}

impl VarType {
    pub fn from_u8(value: u8) -> Option<Self> {
        Some(match value {
            0 => Self::Int8,
            1 => Self::Int16,
            2 => Self::Int32,
            3 => Self::Int64,
            4 => Self::Uint8,
            5 => Self::Uint16,
            6 => Self::Uint32,
            7 => Self::Uint64,
            8 => Self::Flt,
            9 => Self::Dbl,
            10 => Self::Str,
            11 => Self::Blob,
            75 => Self::Table,
            _ => return None,
        })
    }

    pub fn as_u8(&self) -> u8 {
        match self {
            Self::Int8 => 0,
            Self::Int16 => 1,
            Self::Int32 => 2,
            Self::Int64 => 3,
            Self::Uint8 => 4,
            Self::Uint16 => 5,
            Self::Uint32 => 6,
            Self::Uint64 => 7,
            Self::Flt => 8,
            Self::Dbl => 9,
            Self::Str => 10,
            Self::Blob => 11,
            Self::Table => 75,
        }
    }

    pub fn is_table(&self) -> bool {
        *self == Self::Table
    }
}

impl std::fmt::Display for VarType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Int8 => "int8",
            Self::Int16 => "int16",
            Self::Int32 => "int32",
            Self::Int64 => "int64",
            Self::Uint8 => "uint8",
            Self::Uint16 => "uint16",
            Self::Uint32 => "uint32",
            Self::Uint64 => "uint64",
            Self::Flt => "float",
            Self::Dbl => "double",
            Self::Str => "string",
            Self::Blob => "blob",
            Self::Table => "table",
        };
        f.write_str(name)
    }
}

/// Variable access classes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccessType {
    Const,
    ReadOnly,
    ReadWrite,
}

impl AccessType {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Const),
            1 => Some(Self::ReadOnly),
            2 => Some(Self::ReadWrite),
            _ => None,
        }
    }

    pub fn as_u8(&self) -> u8 {
        match self {
            Self::Const => 0,
            Self::ReadOnly => 1,
            Self::ReadWrite => 2,
        }
    }

    pub fn is_writable(&self) -> bool {
        *self == Self::ReadWrite
    }
}

/// Variable security class. Only `None` is defined by the protocol.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Security {
    #[default]
    None,
    Other(u8),
}

impl Security {
    pub fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::None,
            other => Self::Other(other),
        }
    }

    pub fn as_u8(&self) -> u8 {
        match self {
            Self::None => 0,
            Self::Other(code) => *code,
        }
    }
}

/// Cursor over a packet body.
///
/// Zero-copy: slices share the underlying `Bytes`.
pub(crate) struct Decoder {
    data: Bytes,
    offset: usize,
    target: SocketAddr,
}

impl Decoder {
    pub(crate) fn with_target(data: Bytes, target: SocketAddr) -> Self {
        Self {
            data,
            offset: 0,
            target,
        }
    }

    #[cfg(test)]
    pub(crate) fn new(data: Bytes) -> Self {
        Self::with_target(data, crate::error::UNKNOWN_TARGET)
    }

    pub(crate) fn target(&self) -> SocketAddr {
        self.target
    }

    pub(crate) fn remaining(&self) -> usize {
        self.data.len() - self.offset
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.offset >= self.data.len()
    }

    /// Log the detailed kind and return the public error.
    pub(crate) fn malformed(&self, kind: DecodeErrorKind) -> Box<Error> {
        tracing::debug!(
            target: "async_jip::wire",
            { jip.source = %self.target, jip.offset = self.offset, jip.decode_error = %kind },
            "decode error"
        );
        Error::MalformedResponse {
            target: self.target,
        }
        .boxed()
    }

    fn need(&self, n: usize) -> Result<()> {
        if self.remaining() < n {
            return Err(self.malformed(DecodeErrorKind::Truncated {
                needed: n,
                available: self.remaining(),
            }));
        }
        Ok(())
    }

    pub(crate) fn read_u8(&mut self) -> Result<u8> {
        self.need(1)?;
        let value = self.data[self.offset];
        self.offset += 1;
        Ok(value)
    }

    pub(crate) fn read_u16(&mut self) -> Result<u16> {
        let mut raw = [0u8; 2];
        raw.copy_from_slice(&self.read_bytes(2)?);
        Ok(u16::from_be_bytes(raw))
    }

    pub(crate) fn read_u32(&mut self) -> Result<u32> {
        let mut raw = [0u8; 4];
        raw.copy_from_slice(&self.read_bytes(4)?);
        Ok(u32::from_be_bytes(raw))
    }

    pub(crate) fn read_u64(&mut self) -> Result<u64> {
        let mut raw = [0u8; 8];
        raw.copy_from_slice(&self.read_bytes(8)?);
        Ok(u64::from_be_bytes(raw))
    }

    pub(crate) fn read_bytes(&mut self, n: usize) -> Result<Bytes> {
        self.need(n)?;
        let slice = self.data.slice(self.offset..self.offset + n);
        self.offset += n;
        Ok(slice)
    }

    /// Read a one byte length followed by that many bytes.
    pub(crate) fn read_prefixed(&mut self) -> Result<Bytes> {
        let len = self.read_u8()? as usize;
        if self.remaining() < len {
            return Err(self.malformed(DecodeErrorKind::LengthMismatch {
                declared: len,
                available: self.remaining(),
            }));
        }
        self.read_bytes(len)
    }

    /// Consume everything left.
    pub(crate) fn rest(&mut self) -> Bytes {
        let slice = self.data.slice(self.offset..);
        self.offset = self.data.len();
        slice
    }
}
