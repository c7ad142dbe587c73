//! Request handling for one served node.
//!
//! [`dispatch`] turns one decoded request into at most one reply plus the
//! trap notifications a committed write triggers. It performs no I/O, so it
//! runs the same against a real socket and in tests.

use std::net::{Ipv6Addr, SocketAddr};

use bytes::{Bytes, BytesMut};

use crate::error::Status;
use crate::topology::{Node, TrapRegistration, VarRef};
use crate::util::is_multicast;
use crate::wire::{
    Command, GetRequest, GetResponse, Header, MAX_PACKET_SIZE, MibAddr, MibEntry, QueryMibRequest,
    QueryMibResponse, QueryVarRequest, QueryVarResponse, SetRequest, TrapRequest, Value,
    VarDescription, VarEntry, VarInfo, VarStatus, VarType,
};

/// Room for a reply body.
const BODY_BUDGET: usize = MAX_PACKET_SIZE - Header::LEN;

/// A TRAP_NOTIFY to send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub subscriber: SocketAddr,
    /// Handle the subscriber registered with, sent as the packet handle.
    pub handle: u8,
    pub body: Bytes,
}

/// Result of handling one request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Dispatched {
    /// Reply command and body, if the request is answered.
    pub reply: Option<(Command, Bytes)>,
    pub notifications: Vec<Notification>,
}

impl Dispatched {
    fn reply(command: Command, body: Bytes) -> Self {
        Self {
            reply: Some((command, body)),
            notifications: Vec::new(),
        }
    }

    fn silent() -> Self {
        Self::default()
    }
}

/// Handle one request addressed to `node`.
///
/// `source` is the requester, `destination` the address the request was sent
/// to. Requests to a multicast destination are handled but the caller must
/// not send the reply. Malformed requests and commands that are not requests
/// get no reply.
pub fn dispatch(
    node: &mut Node,
    command: Command,
    body: Bytes,
    source: SocketAddr,
    destination: Option<Ipv6Addr>,
) -> Dispatched {
    let result = match command {
        Command::GetRequest | Command::GetMibRequest => {
            GetRequest::decode(command, body, source).map(|request| handle_get(node, &request))
        }
        Command::SetRequest | Command::SetMibRequest => SetRequest::decode(command, body, source)
            .map(|request| handle_set(node, &request, destination)),
        Command::QueryMibRequest => QueryMibRequest::decode(body, source)
            .map(|request| Dispatched::reply(Command::QueryMibResponse, query_mib(node, request))),
        Command::QueryVarRequest => QueryVarRequest::decode(body, source)
            .map(|request| Dispatched::reply(Command::QueryVarResponse, query_var(node, request))),
        Command::TrapRequest => TrapRequest::decode(body, source).map(|request| {
            Dispatched::reply(Command::TrapResponse, trap(node, request, source))
        }),
        Command::UntrapRequest => TrapRequest::decode(body, source).map(|request| {
            Dispatched::reply(Command::TrapResponse, untrap(node, request, source))
        }),
        other => {
            tracing::debug!(target: "async_jip::server", { jip.source = %source, jip.command = %other }, "ignoring non-request command");
            return Dispatched::silent();
        }
    };
    result.unwrap_or_else(|e| {
        tracing::debug!(target: "async_jip::server", { jip.source = %source, jip.command = %command, error = %e }, "dropping malformed request");
        Dispatched::silent()
    })
}

fn resolve_mib(node: &Node, mib: MibAddr) -> Option<usize> {
    match mib {
        MibAddr::Index(index) => node.mib_by_index(index),
        MibAddr::Id(id) => node.lookup_mib_id(None, id),
    }
}

/// Wire indexes of a variable, for reply headers.
fn wire_indexes(node: &Node, var: VarRef) -> (u8, u8) {
    let mib = &node.mibs[var.mib];
    (mib.index, mib.vars[var.var].index)
}

fn get_error(mib_index: u8, var_index: u8, status: Status) -> Dispatched {
    let body = VarDescription::error(mib_index, var_index, status)
        .encode()
        .unwrap_or_default();
    Dispatched::reply(Command::GetResponse, body)
}

/// Run the variable's provider, if any.
///
/// `Err(None)` suppresses the reply, `Err(Some(status))` reports a failure.
fn provide(node: &mut Node, var: VarRef) -> Result<(), Option<Status>> {
    let Some(provider) = node.var(var).and_then(|slot| slot.capability.provider()) else {
        return Ok(());
    };
    match provider(node, var) {
        Status::Ok => Ok(()),
        Status::Timeout => Err(None),
        status => Err(Some(status)),
    }
}

fn handle_get(node: &mut Node, request: &GetRequest) -> Dispatched {
    let Some(mib) = resolve_mib(node, request.mib) else {
        return get_error(0, 0, Status::BadMibIndex);
    };
    let Some(position) = node.mibs[mib].lookup_var_index(request.var_index) else {
        return get_error(0, 0, Status::BadVarIndex);
    };
    let var = VarRef::new(mib, position);
    let (mib_index, var_index) = wire_indexes(node, var);

    if node.mibs[mib].vars[position].var_type.is_table() {
        match provide(node, var) {
            Ok(()) => {}
            Err(None) => return Dispatched::silent(),
            Err(Some(status)) => return get_error(mib_index, var_index, status),
        }
        let slot = &node.mibs[mib].vars[position];
        let table = match (&slot.value, slot.enabled) {
            (Some(Value::Table(table)), true) => table,
            _ => return get_error(mib_index, var_index, Status::Disabled),
        };
        let (first, count) = request.rows();
        let response = GetResponse::Table {
            mib_index,
            var_index,
            page: table.page(first, count, BODY_BUDGET),
        };
        return match response.encode() {
            Ok(body) => Dispatched::reply(Command::GetResponse, body),
            Err(status) => get_error(mib_index, var_index, status),
        };
    }

    let last = (position + request.var_count() as usize).min(node.mibs[mib].vars.len());
    let mut entries = Vec::new();
    let mut used = 2;
    for position in position..last {
        let entry = match scalar_entry(node, VarRef::new(mib, position)) {
            Some(entry) => entry,
            None => return Dispatched::silent(),
        };
        let size = entry_len(&entry);
        if used + size > BODY_BUDGET {
            break;
        }
        used += size;
        entries.push(entry);
    }
    let description = VarDescription {
        mib_index,
        var_index,
        entries,
    };
    match description.encode() {
        Ok(body) => Dispatched::reply(Command::GetResponse, body),
        Err(status) => get_error(mib_index, var_index, status),
    }
}

/// One entry of a scalar GET reply. `None` suppresses the reply.
fn scalar_entry(node: &mut Node, var: VarRef) -> Option<VarEntry> {
    match provide(node, var) {
        Ok(()) => {}
        Err(None) => return None,
        Err(Some(status)) => return Some(VarEntry::Error(status)),
    }
    let slot = node.var(var)?;
    Some(match (&slot.value, slot.enabled) {
        (_, false) | (None, _) => VarEntry::Error(Status::Disabled),
        (Some(Value::Table(_)), true) => VarEntry::Error(Status::WrongType),
        (Some(value), true) => {
            let mut scratch = BytesMut::new();
            match value.encode(&mut scratch) {
                Ok(()) => VarEntry::Value(value.clone()),
                Err(status) => VarEntry::Error(status),
            }
        }
    })
}

fn entry_len(entry: &VarEntry) -> usize {
    match entry {
        VarEntry::Error(_) => 1,
        VarEntry::Value(value) => {
            let mut scratch = BytesMut::new();
            // Entries are only built from values that encode
            let _ = value.encode(&mut scratch);
            2 + scratch.len()
        }
    }
}

fn set_reply(mib_index: u8, var_index: u8, status: Status) -> Dispatched {
    let body = VarStatus {
        mib_index,
        var_index,
        status,
    }
    .encode();
    Dispatched::reply(Command::SetResponse, body)
}

/// Validate, commit, then hand the write to the variable's sink.
fn handle_set(node: &mut Node, request: &SetRequest, destination: Option<Ipv6Addr>) -> Dispatched {
    let Some(mib) = resolve_mib(node, request.mib) else {
        return set_reply(0, 0, Status::BadMibIndex);
    };
    let Some(position) = node.mibs[mib].lookup_var_index(request.var_index) else {
        return set_reply(0, 0, Status::BadVarIndex);
    };
    let var = VarRef::new(mib, position);
    let (mib_index, var_index) = wire_indexes(node, var);
    let slot = &mut node.mibs[mib].vars[position];

    if request.var_type != slot.var_type.as_u8() {
        return set_reply(mib_index, var_index, Status::WrongType);
    }
    if !slot.access.is_writable() {
        return set_reply(mib_index, var_index, Status::NoAccess);
    }
    if !slot.enabled {
        return set_reply(mib_index, var_index, Status::Disabled);
    }
    let value = match Value::from_payload(slot.var_type, &request.data) {
        Ok(value) => value,
        Err(status) => return set_reply(mib_index, var_index, status),
    };
    let changed = match slot.set_value(value) {
        Ok(changed) => changed,
        Err(status) => return set_reply(mib_index, var_index, status),
    };

    let multicast = destination.filter(is_multicast);
    let status = match slot.capability.sink() {
        Some(sink) => sink(node, var, multicast),
        None => Status::Ok,
    };

    let notifications = if changed {
        notifications(node, var)
    } else {
        Vec::new()
    };
    if multicast.is_none() && status == Status::Timeout {
        return Dispatched {
            reply: None,
            notifications,
        };
    }
    Dispatched {
        notifications,
        ..set_reply(mib_index, var_index, status)
    }
}

/// TRAP_NOTIFY packets for every subscriber of `var`.
pub(crate) fn notifications(node: &Node, var: VarRef) -> Vec<Notification> {
    let Some(slot) = node.var(var) else {
        return Vec::new();
    };
    if slot.registrations.is_empty() || slot.var_type == VarType::Table {
        return Vec::new();
    }
    let Some(value) = slot.value.clone() else {
        return Vec::new();
    };
    let (mib_index, var_index) = wire_indexes(node, var);
    let body = match (VarDescription {
        mib_index,
        var_index,
        entries: vec![VarEntry::Value(value)],
    })
    .encode()
    {
        Ok(body) => body,
        Err(status) => {
            tracing::debug!(target: "async_jip::server", { jip.node = %node.address, jip.var = %slot.name, jip.status = %status }, "cannot encode trap value");
            return Vec::new();
        }
    };
    slot.registrations
        .iter()
        .map(|registration| Notification {
            subscriber: registration.subscriber,
            handle: registration.handle,
            body: body.clone(),
        })
        .collect()
}

fn query_mib(node: &Node, request: QueryMibRequest) -> Bytes {
    let start = request.start as usize;
    let entries: Vec<_> = node
        .mibs
        .iter()
        .skip(start)
        .take(request.count as usize)
        .map(|mib| MibEntry {
            index: mib.index,
            id: mib.id,
            name: mib.name.clone(),
        })
        .collect();
    let outstanding = node.mibs.len().saturating_sub(start + entries.len());
    QueryMibResponse {
        status: Status::Ok,
        outstanding: outstanding.min(u8::MAX as usize) as u8,
        entries,
    }
    .encode()
}

fn query_var(node: &Node, request: QueryVarRequest) -> Bytes {
    let Some(mib) = node.mib_by_index(request.mib_index) else {
        return QueryVarResponse {
            status: Status::BadMibIndex,
            mib_index: request.mib_index,
            outstanding: 0,
            entries: Vec::new(),
        }
        .encode();
    };
    let vars = &node.mibs[mib].vars;
    let start = request.start as usize;
    let entries: Vec<_> = vars
        .iter()
        .skip(start)
        .take(request.count as usize)
        .map(|var| VarInfo {
            index: var.index,
            name: var.name.clone(),
            var_type: var.var_type,
            access: var.access,
            security: var.security,
        })
        .collect();
    let outstanding = vars.len().saturating_sub(start + entries.len());
    QueryVarResponse {
        status: Status::Ok,
        mib_index: request.mib_index,
        outstanding: outstanding.min(u8::MAX as usize) as u8,
        entries,
    }
    .encode()
}

fn trap_target(node: &Node, request: TrapRequest) -> Result<VarRef, Status> {
    let mib = node
        .mib_by_index(request.mib_index)
        .ok_or(Status::BadMibIndex)?;
    let var = node.mibs[mib]
        .lookup_var_index(request.var_index)
        .ok_or(Status::BadVarIndex)?;
    Ok(VarRef::new(mib, var))
}

fn trap_reply(request: TrapRequest, status: Status) -> Bytes {
    VarStatus {
        mib_index: request.mib_index,
        var_index: request.var_index,
        status,
    }
    .encode()
}

/// Register `subscriber`; a second request replaces its handle.
fn trap(node: &mut Node, request: TrapRequest, subscriber: SocketAddr) -> Bytes {
    let var = match trap_target(node, request) {
        Ok(var) => var,
        Err(status) => return trap_reply(request, status),
    };
    let address = node.address;
    let Some(slot) = node.var_mut(var) else {
        return trap_reply(request, Status::Failed);
    };
    if slot.var_type.is_table() {
        return trap_reply(request, Status::WrongType);
    }
    slot.registrations.retain(|registration| registration.subscriber != subscriber);
    slot.registrations.push(TrapRegistration {
        subscriber,
        handle: request.handle,
    });
    tracing::debug!(
        target: "async_jip::server",
        { jip.node = %address, jip.var = %slot.name, jip.subscriber = %subscriber, jip.handle = request.handle },
        "trap registered"
    );
    trap_reply(request, Status::Ok)
}

/// Drop the registration of `subscriber`. Not being registered is fine.
fn untrap(node: &mut Node, request: TrapRequest, subscriber: SocketAddr) -> Bytes {
    let var = match trap_target(node, request) {
        Ok(var) => var,
        Err(status) => return trap_reply(request, status),
    };
    if let Some(slot) = node.var_mut(var) {
        slot.registrations.retain(|registration| registration.subscriber != subscriber);
    }
    trap_reply(request, Status::Ok)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::table::Table;
    use crate::topology::{Capability, Mib, Provider, Sink, Var};
    use crate::wire::{AccessType, Security};

    fn source() -> SocketAddr {
        "[fd04::100]:40000".parse().unwrap()
    }

    fn bulb() -> Node {
        let mut node = Node::new("[fd04::5]:1873".parse().unwrap(), 0x0810_0002);
        let mut info = Mib::new(0xffff_ff00, 0, "Node");
        info.add_var(Var::new(0, "MacAddress", VarType::Uint64, AccessType::Const, Security::None));
        info.add_var(Var::new(1, "DescriptiveName", VarType::Str, AccessType::ReadWrite, Security::None));
        node.add_mib(info);
        let mut control = Mib::new(0xffff_fe04, 3, "BulbControl");
        control.add_var(Var::new(0, "Mode", VarType::Uint8, AccessType::ReadWrite, Security::None));
        control.add_var(Var::new(1, "Level", VarType::Uint8, AccessType::ReadWrite, Security::None));
        control.add_var(Var::new(2, "Rows", VarType::Table, AccessType::ReadOnly, Security::None));
        node.add_mib(control);

        node.var_mut(VarRef::new(0, 0)).unwrap().value = Some(Value::U64(0x0015_8d00_0001_0203));
        node.var_mut(VarRef::new(0, 1)).unwrap().value = Some(Value::from("lamp"));
        node.var_mut(VarRef::new(1, 0)).unwrap().value = Some(Value::U8(1));
        node.var_mut(VarRef::new(1, 1)).unwrap().value = Some(Value::U8(200));
        let mut rows = Table::new();
        rows.update_row(0, vec![1, 2]).unwrap();
        rows.update_row(3, vec![3]).unwrap();
        node.var_mut(VarRef::new(1, 2)).unwrap().value = Some(Value::Table(rows));
        node
    }

    fn reply(dispatched: &Dispatched) -> (Command, Bytes) {
        dispatched.reply.clone().unwrap()
    }

    fn set(node: &mut Node, body: &[u8]) -> Dispatched {
        dispatch(node, Command::SetMibRequest, Bytes::copy_from_slice(body), source(), None)
    }

    #[test]
    fn get_scalar_run() {
        let mut node = bulb();
        let request = GetRequest::scalar(MibAddr::Index(3), 0, 2).encode();
        let dispatched = dispatch(&mut node, Command::GetRequest, request, source(), None);
        let (command, body) = reply(&dispatched);
        assert_eq!(command, Command::GetResponse);
        assert_eq!(&body[..], &[3, 0, 0x00, 4, 1, 0x00, 4, 200]);
    }

    #[test]
    fn get_unknown_mib_and_var() {
        let mut node = bulb();
        let request = GetRequest::scalar(MibAddr::Id(0x1234_5678), 0, 1).encode();
        let (_, body) = reply(&dispatch(&mut node, Command::GetMibRequest, request, source(), None));
        assert_eq!(&body[..], &[0, 0, 0x8f]);

        let request = GetRequest::scalar(MibAddr::Index(9), 0, 1).encode();
        let (_, body) = reply(&dispatch(&mut node, Command::GetRequest, request, source(), None));
        assert_eq!(&body[..], &[0, 0, 0x8f]);

        let request = GetRequest::scalar(MibAddr::Id(0xffff_fe04), 7, 1).encode();
        let (_, body) = reply(&dispatch(&mut node, Command::GetMibRequest, request, source(), None));
        assert_eq!(&body[..], &[0, 0, 0x9f]);
    }

    #[test]
    fn get_disabled_var() {
        let mut node = bulb();
        node.var_mut(VarRef::new(1, 0)).unwrap().enabled = false;
        let request = GetRequest::scalar(MibAddr::Id(0xffff_fe04), 0, 1).encode();
        let (_, body) = reply(&dispatch(&mut node, Command::GetMibRequest, request, source(), None));
        assert_eq!(&body[..], &[3, 0, 0xef]);
    }

    #[test]
    fn get_table_page() {
        let mut node = bulb();
        let request = GetRequest::table(MibAddr::Id(0xffff_fe04), 2, 0, 1).encode();
        let (_, body) = reply(&dispatch(&mut node, Command::GetMibRequest, request, source(), None));
        let GetResponse::Table { page, .. } = GetResponse::decode(body, source()).unwrap() else {
            panic!("expected a table page");
        };
        assert_eq!(page.entries, vec![(0, Bytes::from_static(&[1, 2]))]);
        assert_eq!(page.remaining, 1);

        // Disabled table
        node.var_mut(VarRef::new(1, 2)).unwrap().enabled = false;
        let request = GetRequest::table(MibAddr::Id(0xffff_fe04), 2, 0, 1).encode();
        let (_, body) = reply(&dispatch(&mut node, Command::GetMibRequest, request, source(), None));
        assert_eq!(&body[..], &[3, 2, 0xef]);
    }

    #[test]
    fn provider_runs_before_read() {
        let mut node = bulb();
        let provider: Provider = Arc::new(|node: &mut Node, var: VarRef| {
            node.var_mut(var).unwrap().value = Some(Value::U8(42));
            Status::Ok
        });
        node.var_mut(VarRef::new(1, 1)).unwrap().capability = Capability::Provider(provider);
        let request = GetRequest::scalar(MibAddr::Index(3), 1, 1).encode();
        let (_, body) = reply(&dispatch(&mut node, Command::GetRequest, request, source(), None));
        assert_eq!(&body[..], &[3, 1, 0x00, 4, 42]);
    }

    #[test]
    fn provider_errors_and_timeouts() {
        let mut node = bulb();
        let failing: Provider = Arc::new(|_: &mut Node, _: VarRef| Status::BadValue);
        node.var_mut(VarRef::new(1, 0)).unwrap().capability = Capability::Provider(failing);
        let request = GetRequest::scalar(MibAddr::Index(3), 0, 2).encode();
        let (_, body) = reply(&dispatch(&mut node, Command::GetRequest, request.clone(), source(), None));
        assert_eq!(&body[..], &[3, 0, 0xdf, 0x00, 4, 200]);

        let silent: Provider = Arc::new(|_: &mut Node, _: VarRef| Status::Timeout);
        node.var_mut(VarRef::new(1, 1)).unwrap().capability = Capability::Provider(silent);
        let dispatched = dispatch(&mut node, Command::GetRequest, request, source(), None);
        assert!(dispatched.reply.is_none());
    }

    #[test]
    fn set_commits_value() {
        let mut node = bulb();
        let dispatched = set(&mut node, &[0xff, 0xff, 0xfe, 0x04, 1, 0, 4, 7]);
        let (command, body) = reply(&dispatched);
        assert_eq!(command, Command::SetResponse);
        assert_eq!(&body[..], &[3, 1, 0x00]);
        assert_eq!(node.var(VarRef::new(1, 1)).unwrap().value, Some(Value::U8(7)));
    }

    #[test]
    fn set_checks_in_order() {
        let mut node = bulb();
        // Unknown MIB, unknown var
        assert_eq!(&reply(&set(&mut node, &[0, 0, 0, 1, 0, 0, 4, 7])).1[..], &[0, 0, 0x8f]);
        assert_eq!(&reply(&set(&mut node, &[0xff, 0xff, 0xfe, 0x04, 9, 0, 4, 7])).1[..], &[0, 0, 0x9f]);
        // Wrong type beats read-only
        assert_eq!(&reply(&set(&mut node, &[0xff, 0xff, 0xff, 0x00, 0, 0, 4, 7])).1[..], &[0, 0, 0xcf]);
        // Read-only
        let dispatched = set(&mut node, &[0xff, 0xff, 0xff, 0x00, 0, 0, 7, 0, 0, 0, 0, 0, 0, 0, 1]);
        assert_eq!(&reply(&dispatched).1[..], &[0, 0, 0xaf]);
        assert_eq!(node.var(VarRef::new(0, 0)).unwrap().value, Some(Value::U64(0x0015_8d00_0001_0203)));
        // Disabled
        node.var_mut(VarRef::new(1, 0)).unwrap().enabled = false;
        assert_eq!(&reply(&set(&mut node, &[0xff, 0xff, 0xfe, 0x04, 0, 0, 4, 7])).1[..], &[3, 0, 0xef]);
        // Payload size
        assert_eq!(&reply(&set(&mut node, &[0xff, 0xff, 0xfe, 0x04, 1, 0, 4, 7, 8])).1[..], &[3, 1, 0xbf]);
        assert_eq!(&reply(&set(&mut node, &[0xff, 0xff, 0xff, 0x00, 1, 0, 10, 3, b'a'])).1[..], &[0, 1, 0xbf]);
        assert_eq!(node.var(VarRef::new(1, 1)).unwrap().value, Some(Value::U8(200)));
        assert_eq!(node.var(VarRef::new(0, 1)).unwrap().value, Some(Value::from("lamp")));
    }

    #[test]
    fn set_string_by_index() {
        let mut node = bulb();
        let body = Bytes::from_static(&[0, 1, 0, 10, 3, b'd', b'e', b'n']);
        let (_, reply) = reply(&dispatch(&mut node, Command::SetRequest, body, source(), None));
        assert_eq!(&reply[..], &[0, 1, 0x00]);
        assert_eq!(node.var(VarRef::new(0, 1)).unwrap().value, Some(Value::from("den")));
    }

    #[test]
    fn set_string_keeps_raw_bytes() {
        let mut node = bulb();
        let get = || GetRequest::scalar(MibAddr::Id(0xffff_ff00), 1, 1).encode();

        let dispatched = set(&mut node, &[0xff, 0xff, 0xff, 0x00, 1, 0, 10, 2, 0xc3, 0x28]);
        assert_eq!(&reply(&dispatched).1[..], &[0, 1, 0x00]);
        let (_, body) = reply(&dispatch(&mut node, Command::GetMibRequest, get(), source(), None));
        assert_eq!(&body[..], &[0, 1, 0x00, 10, 2, 0xc3, 0x28]);

        let mut long = vec![0xff, 0xff, 0xff, 0x00, 1, 0, 10, 255];
        long.extend_from_slice(&[0xff; 255]);
        assert_eq!(&reply(&set(&mut node, &long)).1[..], &[0, 1, 0x00]);
        let (_, body) = reply(&dispatch(&mut node, Command::GetMibRequest, get(), source(), None));
        assert_eq!(&body[..5], &[0, 1, 0x00, 10, 255]);
        assert_eq!(body.len(), 5 + 255);
        assert!(body[5..].iter().all(|&b| b == 0xff));
    }

    #[test]
    fn sink_sees_multicast_destination() {
        let mut node = bulb();
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = calls.clone();
        let group: Ipv6Addr = "ff15::1".parse().unwrap();
        let sink: Sink = Arc::new(move |_: &mut Node, _: VarRef, destination: Option<Ipv6Addr>| {
            assert_eq!(destination, Some("ff15::1".parse().unwrap()));
            seen.fetch_add(1, Ordering::SeqCst);
            Status::Timeout
        });
        node.var_mut(VarRef::new(1, 0)).unwrap().capability = Capability::Sink(sink);

        let body = Bytes::from_static(&[0xff, 0xff, 0xfe, 0x04, 0, 0, 4, 0]);
        let dispatched = dispatch(&mut node, Command::SetMibRequest, body, source(), Some(group));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        // Multicast writes are answered by nobody; the caller drops the reply
        assert!(dispatched.reply.is_some());
    }

    #[test]
    fn unicast_sink_timeout_suppresses_reply() {
        let mut node = bulb();
        let sink: Sink = Arc::new(|_: &mut Node, _: VarRef, destination: Option<Ipv6Addr>| {
            assert!(destination.is_none());
            Status::Timeout
        });
        node.var_mut(VarRef::new(1, 0)).unwrap().capability = Capability::Sink(sink);
        let unicast = "fd04::5".parse().ok();
        let body = Bytes::from_static(&[0xff, 0xff, 0xfe, 0x04, 0, 0, 4, 0]);
        let dispatched = dispatch(&mut node, Command::SetMibRequest, body, source(), unicast);
        assert!(dispatched.reply.is_none());
        assert_eq!(node.var(VarRef::new(1, 0)).unwrap().value, Some(Value::U8(0)));
    }

    #[test]
    fn sink_failure_is_reported() {
        let mut node = bulb();
        let sink: Sink = Arc::new(|_: &mut Node, _: VarRef, _: Option<Ipv6Addr>| Status::BadValue);
        node.var_mut(VarRef::new(1, 0)).unwrap().capability = Capability::Sink(sink);
        assert_eq!(&reply(&set(&mut node, &[0xff, 0xff, 0xfe, 0x04, 0, 0, 4, 9])).1[..], &[3, 0, 0xdf]);
    }

    #[test]
    fn query_paging() {
        let node = bulb();
        let response = query_mib(&node, QueryMibRequest { start: 1, count: 4 });
        let response = QueryMibResponse::decode(response, source()).unwrap();
        assert_eq!(response.outstanding, 0);
        assert_eq!(response.entries.len(), 1);
        assert_eq!(response.entries[0].name, "BulbControl");

        let response = query_mib(&node, QueryMibRequest { start: 5, count: 4 });
        assert_eq!(&response[..], &[0x00, 0, 0]);

        let response = query_var(&node, QueryVarRequest { mib_index: 3, start: 0, count: 2 });
        let response = QueryVarResponse::decode(response, source()).unwrap();
        assert_eq!(response.outstanding, 1);
        assert_eq!(response.entries[1].name, "Level");

        let response = query_var(&node, QueryVarRequest { mib_index: 1, start: 0, count: 2 });
        let response = QueryVarResponse::decode(response, source()).unwrap();
        assert_eq!(response.status, Status::BadMibIndex);
    }

    #[test]
    fn trap_registration_and_notify() {
        let mut node = bulb();
        let request = TrapRequest { handle: 0x21, mib_index: 3, var_index: 0 }.encode();
        let (command, body) = reply(&dispatch(&mut node, Command::TrapRequest, request, source(), None));
        assert_eq!(command, Command::TrapResponse);
        assert_eq!(&body[..], &[3, 0, 0x00]);

        let dispatched = set(&mut node, &[0xff, 0xff, 0xfe, 0x04, 0, 0, 4, 5]);
        assert_eq!(
            dispatched.notifications,
            vec![Notification {
                subscriber: source(),
                handle: 0x21,
                body: Bytes::from_static(&[3, 0, 0x00, 4, 5]),
            }]
        );

        // Same value again: nothing changed, nothing sent
        let dispatched = set(&mut node, &[0xff, 0xff, 0xfe, 0x04, 0, 0, 4, 5]);
        assert!(dispatched.notifications.is_empty());

        let request = TrapRequest { handle: 0x21, mib_index: 3, var_index: 0 }.encode();
        dispatch(&mut node, Command::UntrapRequest, request, source(), None);
        let dispatched = set(&mut node, &[0xff, 0xff, 0xfe, 0x04, 0, 0, 4, 6]);
        assert!(dispatched.notifications.is_empty());
    }

    #[test]
    fn trap_unknown_var() {
        let mut node = bulb();
        let request = TrapRequest { handle: 1, mib_index: 3, var_index: 9 }.encode();
        let (_, body) = reply(&dispatch(&mut node, Command::TrapRequest, request, source(), None));
        assert_eq!(&body[..], &[3, 9, 0x9f]);
    }

    #[test]
    fn malformed_and_foreign_packets_are_dropped() {
        let mut node = bulb();
        let dispatched = dispatch(&mut node, Command::SetMibRequest, Bytes::from_static(&[0xff]), source(), None);
        assert!(dispatched.reply.is_none());
        let dispatched = dispatch(&mut node, Command::GetResponse, Bytes::new(), source(), None);
        assert!(dispatched.reply.is_none());
    }
}
