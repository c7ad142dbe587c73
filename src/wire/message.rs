//! Command bodies.
//!
//! Each type encodes to and decodes from the bytes that follow the
//! [`Header`](super::Header).

use std::net::SocketAddr;

use bytes::{BufMut, Bytes, BytesMut};

use super::{AccessType, Command, Decoder, Security, Value, VarType};
use crate::error::internal::DecodeErrorKind;
use crate::error::{Result, Status};

/// How a request names its MIB.
///
/// Indexes are positions in one node's MIB list and only valid for that
/// node. IDs are shared by every node exposing the same MIB.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MibAddr {
    Index(u8),
    Id(u32),
}

impl MibAddr {
    fn encode(&self, buf: &mut BytesMut) {
        match self {
            Self::Index(index) => buf.put_u8(*index),
            Self::Id(id) => buf.put_u32(*id),
        }
    }

    fn decode(by_id: bool, decoder: &mut Decoder) -> Result<Self> {
        if by_id {
            Ok(Self::Id(decoder.read_u32()?))
        } else {
            Ok(Self::Index(decoder.read_u8()?))
        }
    }
}

/// GET_REQUEST / GET_MIB_REQUEST.
///
/// The selector after the variable index is either a one byte variable
/// count (scalars) or `{first_entry u16, entry_count u8}` (tables). Which one
/// applies depends on the target variable, so the raw bytes are kept.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GetRequest {
    pub mib: MibAddr,
    pub var_index: u8,
    pub selector: Bytes,
}

impl GetRequest {
    pub fn scalar(mib: MibAddr, var_index: u8, count: u8) -> Self {
        Self {
            mib,
            var_index,
            selector: Bytes::copy_from_slice(&[count]),
        }
    }

    pub fn table(mib: MibAddr, var_index: u8, first_entry: u16, entry_count: u8) -> Self {
        let mut selector = BytesMut::with_capacity(3);
        selector.put_u16(first_entry);
        selector.put_u8(entry_count);
        Self {
            mib,
            var_index,
            selector: selector.freeze(),
        }
    }

    pub fn command(&self) -> Command {
        match self.mib {
            MibAddr::Index(_) => Command::GetRequest,
            MibAddr::Id(_) => Command::GetMibRequest,
        }
    }

    /// Number of consecutive scalar variables requested. Absent means one.
    pub fn var_count(&self) -> u8 {
        self.selector.first().copied().unwrap_or(1)
    }

    /// `(first_entry, entry_count)` for a table variable.
    pub fn rows(&self) -> (u16, u8) {
        match self.selector.len() {
            0 => (0, 1),
            1 | 2 => (0, self.selector[0]),
            _ => (
                u16::from_be_bytes([self.selector[0], self.selector[1]]),
                self.selector[2],
            ),
        }
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(8);
        self.mib.encode(&mut buf);
        buf.put_u8(self.var_index);
        buf.put_slice(&self.selector);
        buf.freeze()
    }

    pub fn decode(command: Command, body: Bytes, source: SocketAddr) -> Result<Self> {
        let mut decoder = Decoder::with_target(body, source);
        let mib = MibAddr::decode(command == Command::GetMibRequest, &mut decoder)?;
        let var_index = decoder.read_u8()?;
        let selector = decoder.rest();
        Ok(Self {
            mib,
            var_index,
            selector,
        })
    }
}

/// SET_REQUEST / SET_MIB_REQUEST.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SetRequest {
    pub mib: MibAddr,
    pub var_index: u8,
    /// Raw type byte, compared against the variable's type by the receiver.
    pub var_type: u8,
    pub data: Bytes,
}

impl SetRequest {
    /// Build a request carrying `value`.
    pub fn new(mib: MibAddr, var_index: u8, value: &Value) -> std::result::Result<Self, Status> {
        let mut data = BytesMut::new();
        value.encode(&mut data)?;
        Ok(Self {
            mib,
            var_index,
            var_type: value.var_type().as_u8(),
            data: data.freeze(),
        })
    }

    pub fn command(&self) -> Command {
        match self.mib {
            MibAddr::Index(_) => Command::SetRequest,
            MibAddr::Id(_) => Command::SetMibRequest,
        }
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(8 + self.data.len());
        self.mib.encode(&mut buf);
        buf.put_u8(self.var_index);
        buf.put_u8(Status::Ok.as_u8());
        buf.put_u8(self.var_type);
        buf.put_slice(&self.data);
        buf.freeze()
    }

    pub fn decode(command: Command, body: Bytes, source: SocketAddr) -> Result<Self> {
        let mut decoder = Decoder::with_target(body, source);
        let mib = MibAddr::decode(command == Command::SetMibRequest, &mut decoder)?;
        let var_index = decoder.read_u8()?;
        let _status = decoder.read_u8()?;
        let var_type = decoder.read_u8()?;
        Ok(Self {
            mib,
            var_index,
            var_type,
            data: decoder.rest(),
        })
    }
}

/// SET_RESPONSE / TRAP_RESPONSE body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VarStatus {
    pub mib_index: u8,
    pub var_index: u8,
    pub status: Status,
}

impl VarStatus {
    pub fn encode(&self) -> Bytes {
        Bytes::copy_from_slice(&[self.mib_index, self.var_index, self.status.as_u8()])
    }

    pub fn decode(body: Bytes, source: SocketAddr) -> Result<Self> {
        let mut decoder = Decoder::with_target(body, source);
        Ok(Self {
            mib_index: decoder.read_u8()?,
            var_index: decoder.read_u8()?,
            status: Status::from_u8(decoder.read_u8()?),
        })
    }
}

/// One entry of a [`VarDescription`]: a value, or the status that replaced it.
#[derive(Debug, Clone, PartialEq)]
pub enum VarEntry {
    Value(Value),
    Error(Status),
}

/// GET_RESPONSE / TRAP_NOTIFY body for scalar variables.
///
/// `{mib_index, var_index}` then one entry per variable:
/// `{status}` on error, `{status, var_type, value}` on success.
/// A request-level error is a description with a single error entry.
#[derive(Debug, Clone, PartialEq)]
pub struct VarDescription {
    pub mib_index: u8,
    pub var_index: u8,
    pub entries: Vec<VarEntry>,
}

impl VarDescription {
    pub fn error(mib_index: u8, var_index: u8, status: Status) -> Self {
        Self {
            mib_index,
            var_index,
            entries: vec![VarEntry::Error(status)],
        }
    }

    /// Status of the first entry.
    pub fn status(&self) -> Status {
        match self.entries.first() {
            Some(VarEntry::Value(_)) => Status::Ok,
            Some(VarEntry::Error(status)) => *status,
            None => Status::Failed,
        }
    }

    pub fn encode(&self) -> std::result::Result<Bytes, Status> {
        let mut buf = BytesMut::with_capacity(16);
        buf.put_u8(self.mib_index);
        buf.put_u8(self.var_index);
        for entry in &self.entries {
            match entry {
                VarEntry::Value(value) => {
                    buf.put_u8(Status::Ok.as_u8());
                    buf.put_u8(value.var_type().as_u8());
                    value.encode(&mut buf)?;
                }
                VarEntry::Error(status) => buf.put_u8(status.as_u8()),
            }
        }
        Ok(buf.freeze())
    }

    fn decode_entries(decoder: &mut Decoder, mib_index: u8, var_index: u8) -> Result<Self> {
        let mut entries = Vec::new();
        while !decoder.is_empty() {
            let status = Status::from_u8(decoder.read_u8()?);
            if !status.is_ok() {
                entries.push(VarEntry::Error(status));
                continue;
            }
            let raw = decoder.read_u8()?;
            let var_type = VarType::from_u8(raw)
                .ok_or_else(|| decoder.malformed(DecodeErrorKind::UnknownVarType(raw)))?;
            entries.push(VarEntry::Value(Value::decode(var_type, decoder)?));
        }
        Ok(Self {
            mib_index,
            var_index,
            entries,
        })
    }

    pub fn decode(body: Bytes, source: SocketAddr) -> Result<Self> {
        let mut decoder = Decoder::with_target(body, source);
        let mib_index = decoder.read_u8()?;
        let var_index = decoder.read_u8()?;
        Self::decode_entries(&mut decoder, mib_index, var_index)
    }
}

/// One page of a table variable.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TablePage {
    /// Present rows after this page.
    pub remaining: u16,
    pub version: u16,
    /// `(row index, row bytes)` in ascending order.
    pub entries: Vec<(u16, Bytes)>,
}

impl TablePage {
    /// Encoded size of an entry carrying `len` bytes.
    pub const fn entry_len(len: usize) -> usize {
        3 + len
    }

    /// Size of the body before the first entry.
    pub const HEADER_LEN: usize = 8;
}

/// GET_RESPONSE body.
#[derive(Debug, Clone, PartialEq)]
pub enum GetResponse {
    Vars(VarDescription),
    Table {
        mib_index: u8,
        var_index: u8,
        page: TablePage,
    },
}

impl GetResponse {
    pub fn status(&self) -> Status {
        match self {
            Self::Vars(description) => description.status(),
            Self::Table { .. } => Status::Ok,
        }
    }

    pub fn encode(&self) -> std::result::Result<Bytes, Status> {
        match self {
            Self::Vars(description) => description.encode(),
            Self::Table {
                mib_index,
                var_index,
                page,
            } => {
                let size: usize = page
                    .entries
                    .iter()
                    .map(|(_, row)| TablePage::entry_len(row.len()))
                    .sum();
                let mut buf = BytesMut::with_capacity(TablePage::HEADER_LEN + size);
                buf.put_u8(*mib_index);
                buf.put_u8(*var_index);
                buf.put_u8(Status::Ok.as_u8());
                buf.put_u8(VarType::Table.as_u8());
                buf.put_u16(page.remaining);
                buf.put_u16(page.version);
                for (row, data) in &page.entries {
                    let len = u8::try_from(data.len()).map_err(|_| Status::BadBufferSize)?;
                    buf.put_u16(*row);
                    buf.put_u8(len);
                    buf.put_slice(data);
                }
                Ok(buf.freeze())
            }
        }
    }

    pub fn decode(body: Bytes, source: SocketAddr) -> Result<Self> {
        let mut decoder = Decoder::with_target(body.clone(), source);
        let mib_index = decoder.read_u8()?;
        let var_index = decoder.read_u8()?;
        let status = decoder.read_u8()?;
        let is_table = status == Status::Ok.as_u8()
            && decoder.read_u8()? == VarType::Table.as_u8();
        if !is_table {
            return VarDescription::decode(body, source).map(Self::Vars);
        }

        let remaining = decoder.read_u16()?;
        let version = decoder.read_u16()?;
        let mut entries = Vec::new();
        while !decoder.is_empty() {
            let row = decoder.read_u16()?;
            entries.push((row, decoder.read_prefixed()?));
        }
        Ok(Self::Table {
            mib_index,
            var_index,
            page: TablePage {
                remaining,
                version,
                entries,
            },
        })
    }
}

/// QUERY_MIB_REQUEST.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueryMibRequest {
    pub start: u8,
    pub count: u8,
}

impl QueryMibRequest {
    pub fn encode(&self) -> Bytes {
        Bytes::copy_from_slice(&[self.start, self.count])
    }

    pub fn decode(body: Bytes, source: SocketAddr) -> Result<Self> {
        let mut decoder = Decoder::with_target(body, source);
        Ok(Self {
            start: decoder.read_u8()?,
            count: decoder.read_u8()?,
        })
    }
}

/// One MIB listed by a QUERY_MIB_RESPONSE.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MibEntry {
    pub index: u8,
    pub id: u32,
    pub name: String,
}

/// QUERY_MIB_RESPONSE.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryMibResponse {
    pub status: Status,
    /// MIBs left after this page.
    pub outstanding: u8,
    pub entries: Vec<MibEntry>,
}

impl QueryMibResponse {
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(64);
        buf.put_u8(self.status.as_u8());
        buf.put_u8(self.entries.len() as u8);
        buf.put_u8(self.outstanding);
        for entry in &self.entries {
            buf.put_u8(entry.index);
            buf.put_u32(entry.id);
            put_name(&mut buf, &entry.name);
        }
        buf.freeze()
    }

    pub fn decode(body: Bytes, source: SocketAddr) -> Result<Self> {
        let mut decoder = Decoder::with_target(body, source);
        let status = Status::from_u8(decoder.read_u8()?);
        if !status.is_ok() {
            return Ok(Self {
                status,
                outstanding: 0,
                entries: Vec::new(),
            });
        }
        let returned = decoder.read_u8()?;
        let outstanding = decoder.read_u8()?;
        let mut entries = Vec::with_capacity(returned as usize);
        for _ in 0..returned {
            let index = decoder.read_u8()?;
            let id = decoder.read_u32()?;
            let name = read_name(&mut decoder)?;
            entries.push(MibEntry { index, id, name });
        }
        Ok(Self {
            status,
            outstanding,
            entries,
        })
    }
}

/// QUERY_VAR_REQUEST.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueryVarRequest {
    pub mib_index: u8,
    pub start: u8,
    pub count: u8,
}

impl QueryVarRequest {
    pub fn encode(&self) -> Bytes {
        Bytes::copy_from_slice(&[self.mib_index, self.start, self.count])
    }

    pub fn decode(body: Bytes, source: SocketAddr) -> Result<Self> {
        let mut decoder = Decoder::with_target(body, source);
        Ok(Self {
            mib_index: decoder.read_u8()?,
            start: decoder.read_u8()?,
            count: decoder.read_u8()?,
        })
    }
}

/// One variable listed by a QUERY_VAR_RESPONSE.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VarInfo {
    pub index: u8,
    pub name: String,
    pub var_type: VarType,
    pub access: AccessType,
    pub security: Security,
}

/// QUERY_VAR_RESPONSE.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryVarResponse {
    pub status: Status,
    pub mib_index: u8,
    pub outstanding: u8,
    pub entries: Vec<VarInfo>,
}

impl QueryVarResponse {
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(64);
        buf.put_u8(self.status.as_u8());
        buf.put_u8(self.mib_index);
        buf.put_u8(self.entries.len() as u8);
        buf.put_u8(self.outstanding);
        for entry in &self.entries {
            buf.put_u8(entry.index);
            put_name(&mut buf, &entry.name);
            buf.put_u8(entry.var_type.as_u8());
            buf.put_u8(entry.access.as_u8());
            buf.put_u8(entry.security.as_u8());
        }
        buf.freeze()
    }

    pub fn decode(body: Bytes, source: SocketAddr) -> Result<Self> {
        let mut decoder = Decoder::with_target(body, source);
        let status = Status::from_u8(decoder.read_u8()?);
        let mib_index = decoder.read_u8()?;
        if !status.is_ok() {
            return Ok(Self {
                status,
                mib_index,
                outstanding: 0,
                entries: Vec::new(),
            });
        }
        let returned = decoder.read_u8()?;
        let outstanding = decoder.read_u8()?;
        let mut entries = Vec::with_capacity(returned as usize);
        for _ in 0..returned {
            let index = decoder.read_u8()?;
            let name = read_name(&mut decoder)?;
            let raw_type = decoder.read_u8()?;
            let var_type = VarType::from_u8(raw_type)
                .ok_or_else(|| decoder.malformed(DecodeErrorKind::UnknownVarType(raw_type)))?;
            let raw_access = decoder.read_u8()?;
            let access = AccessType::from_u8(raw_access)
                .ok_or_else(|| decoder.malformed(DecodeErrorKind::UnknownAccess(raw_access)))?;
            let security = Security::from_u8(decoder.read_u8()?);
            entries.push(VarInfo {
                index,
                name,
                var_type,
                access,
                security,
            });
        }
        Ok(Self {
            status,
            mib_index,
            outstanding,
            entries,
        })
    }
}

/// TRAP_REQUEST / UNTRAP_REQUEST.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrapRequest {
    /// Echoed in every TRAP_NOTIFY so the subscriber can tell traps apart.
    pub handle: u8,
    pub mib_index: u8,
    pub var_index: u8,
}

impl TrapRequest {
    pub fn encode(&self) -> Bytes {
        Bytes::copy_from_slice(&[self.handle, self.mib_index, self.var_index])
    }

    pub fn decode(body: Bytes, source: SocketAddr) -> Result<Self> {
        let mut decoder = Decoder::with_target(body, source);
        Ok(Self {
            handle: decoder.read_u8()?,
            mib_index: decoder.read_u8()?,
            var_index: decoder.read_u8()?,
        })
    }
}

fn put_name(buf: &mut BytesMut, name: &str) {
    let bytes = name.as_bytes();
    let len = bytes.len().min(u8::MAX as usize);
    buf.put_u8(len as u8);
    buf.put_slice(&bytes[..len]);
}

fn read_name(decoder: &mut Decoder) -> Result<String> {
    Ok(String::from_utf8_lossy(&decoder.read_prefixed()?).into_owned())
}
