//! Multicast group membership of served nodes.
//!
//! Every served node can join up to [`MAX_GROUPS`] IPv6 multicast groups.
//! Membership is visible and writable through the groups MIB
//! ([`GROUPS_MIB_ID`]):
//!
//! | var | type  | meaning                                    |
//! |-----|-------|--------------------------------------------|
//! | 0   | table | one row per slot, the group in compressed form |
//! | 1   | blob  | join the group written                      |
//! | 2   | blob  | leave the group written                     |
//! | 3   | any   | leave every group                           |
//!
//! A compressed group is the scope byte followed by the address bytes after
//! the run of zeros that follows it, so `ff15::1` compresses to `[0x15, 0x01]`.

use std::collections::HashMap;
use std::net::{Ipv6Addr, SocketAddr};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::net::UdpSocket;

use crate::error::Status;
use crate::table::Table;
use crate::topology::{Capability, Node, Provider, Sink, VarRef};
use crate::wire::Value;

/// MIB ID of the groups MIB.
pub const GROUPS_MIB_ID: u32 = 0xffff_ff02;

/// Group slots per node.
pub const MAX_GROUPS: usize = 16;

const VAR_GROUPS: u8 = 0;
const VAR_ADD: u8 = 1;
const VAR_REMOVE: u8 = 2;
const VAR_CLEAR: u8 = 3;

/// Groups joined by one node, by slot.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GroupTable {
    slots: [Option<Ipv6Addr>; MAX_GROUPS],
}

impl GroupTable {
    pub fn contains(&self, group: &Ipv6Addr) -> bool {
        self.slots.iter().flatten().any(|joined| joined == group)
    }

    /// Joined groups in slot order.
    pub fn groups(&self) -> impl Iterator<Item = Ipv6Addr> + '_ {
        self.slots.iter().flatten().copied()
    }

    pub fn len(&self) -> usize {
        self.groups().count()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.iter().all(Option::is_none)
    }

    fn free_slot(&self) -> Option<usize> {
        self.slots.iter().position(Option::is_none)
    }

    fn slot_of(&self, group: &Ipv6Addr) -> Option<usize> {
        self.slots.iter().position(|slot| slot.as_ref() == Some(group))
    }

    /// The table served as var 0 of the groups MIB.
    fn to_table(&self) -> Table {
        let mut table = Table::new();
        for (slot, group) in self.slots.iter().enumerate() {
            if let Some(group) = group {
                // Compressed groups are at most 15 bytes
                let _ = table.update_row(slot as u16, compress(group));
            }
        }
        table
    }
}

/// Compress a multicast group for the groups MIB.
///
/// The unspecified address compresses to nothing.
pub fn compress(group: &Ipv6Addr) -> Vec<u8> {
    if group.is_unspecified() {
        return Vec::new();
    }
    let octets = group.octets();
    let tail = octets[2..]
        .iter()
        .position(|byte| *byte != 0)
        .map_or(&[][..], |start| &octets[2 + start..]);
    let mut compressed = Vec::with_capacity(1 + tail.len());
    compressed.push(octets[1]);
    compressed.extend_from_slice(tail);
    compressed
}

/// Expand a compressed group: `ff`, the scope byte, then the remaining
/// bytes right-aligned.
pub fn expand(compressed: &[u8]) -> Result<Ipv6Addr, Status> {
    let Some((&scope, tail)) = compressed.split_first() else {
        return Err(Status::BadBufferSize);
    };
    if tail.len() > 14 {
        return Err(Status::BadBufferSize);
    }
    let mut octets = [0u8; 16];
    octets[0] = 0xff;
    octets[1] = scope;
    octets[16 - tail.len()..].copy_from_slice(tail);
    Ok(Ipv6Addr::from(octets))
}

/// Socket-level group membership shared by every served node.
///
/// The socket joins a group when the first node joins it and leaves when
/// the last node leaves. Also answers which nodes a multicast request is
/// for.
pub(crate) struct Membership {
    socket: Option<Arc<UdpSocket>>,
    interface: u32,
    members: Mutex<HashMap<Ipv6Addr, Vec<SocketAddr>>>,
}

impl Membership {
    pub(crate) fn new(socket: Arc<UdpSocket>, interface: u32) -> Self {
        Self {
            socket: Some(socket),
            interface,
            members: Mutex::new(HashMap::new()),
        }
    }

    /// Membership bookkeeping without a socket.
    #[cfg(test)]
    pub(crate) fn detached() -> Self {
        Self {
            socket: None,
            interface: 0,
            members: Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<Ipv6Addr, Vec<SocketAddr>>> {
        self.members.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Nodes that joined `group`.
    pub(crate) fn members(&self, group: &Ipv6Addr) -> Vec<SocketAddr> {
        self.lock().get(group).cloned().unwrap_or_default()
    }

    fn join(&self, group: Ipv6Addr, node: SocketAddr) -> Result<(), Status> {
        let mut members = self.lock();
        let nodes = members.entry(group).or_default();
        if nodes.is_empty()
            && let Some(socket) = &self.socket
            && let Err(e) = socket.join_multicast_v6(&group, self.interface)
        {
            tracing::warn!(target: "async_jip::server", { jip.group = %group, error = %e }, "joining multicast group failed");
            members.remove(&group);
            return Err(Status::Failed);
        }
        if !nodes.contains(&node) {
            nodes.push(node);
        }
        Ok(())
    }

    fn leave(&self, group: Ipv6Addr, node: SocketAddr) -> Result<(), Status> {
        let mut members = self.lock();
        let Some(nodes) = members.get_mut(&group) else {
            return Err(Status::Failed);
        };
        nodes.retain(|member| *member != node);
        if !nodes.is_empty() {
            return Ok(());
        }
        members.remove(&group);
        if let Some(socket) = &self.socket
            && let Err(e) = socket.leave_multicast_v6(&group, self.interface)
        {
            tracing::warn!(target: "async_jip::server", { jip.group = %group, error = %e }, "leaving multicast group failed");
            return Err(Status::Failed);
        }
        Ok(())
    }
}

/// Join `group` on behalf of `node`.
///
/// Joining a group twice is not an error. Fails with [`Status::Failed`]
/// when every slot is taken or the socket cannot join.
pub(crate) fn join_group(node: &mut Node, membership: &Membership, group: Ipv6Addr) -> Status {
    if !group.is_multicast() {
        return Status::BadValue;
    }
    let address = node.address;
    let groups = node.groups.get_or_insert_with(GroupTable::default);
    if groups.contains(&group) {
        return Status::Ok;
    }
    let Some(slot) = groups.free_slot() else {
        tracing::debug!(target: "async_jip::server", { jip.node = %address, jip.group = %group }, "no free group slot");
        return Status::Failed;
    };
    if let Err(status) = membership.join(group, address) {
        return status;
    }
    groups.slots[slot] = Some(group);
    tracing::debug!(target: "async_jip::server", { jip.node = %address, jip.group = %group, jip.slot = slot }, "joined group");
    Status::Ok
}

/// Leave `group` on behalf of `node`. Fails if the node is not a member.
pub(crate) fn leave_group(node: &mut Node, membership: &Membership, group: Ipv6Addr) -> Status {
    let address = node.address;
    let Some(groups) = node.groups.as_mut() else {
        return Status::Failed;
    };
    let Some(slot) = groups.slot_of(&group) else {
        return Status::Failed;
    };
    if let Err(status) = membership.leave(group, address) {
        return status;
    }
    groups.slots[slot] = None;
    tracing::debug!(target: "async_jip::server", { jip.node = %address, jip.group = %group, jip.slot = slot }, "left group");
    Status::Ok
}

/// Leave every group. The first failure is reported, the rest still run.
pub(crate) fn leave_all(node: &mut Node, membership: &Membership) -> Status {
    let joined: Vec<_> = node.groups.iter().flat_map(GroupTable::groups).collect();
    joined
        .into_iter()
        .map(|group| leave_group(node, membership, group))
        .fold(Status::Ok, |first, status| if first.is_ok() { status } else { first })
}

/// Attach the groups MIB handlers to a freshly added node.
///
/// Nodes without the groups MIB still get an empty group table so that
/// [`join_group`] works for them.
pub(crate) fn install(node: &mut Node, membership: Arc<Membership>) {
    node.groups = Some(GroupTable::default());
    let Some(mib) = node.lookup_mib_id(None, GROUPS_MIB_ID) else {
        return;
    };

    let refresh: Provider = Arc::new(|node: &mut Node, var: VarRef| {
        let table = node.groups.as_ref().map(GroupTable::to_table).unwrap_or_default();
        match node.var_mut(var) {
            Some(slot) => {
                slot.value = Some(Value::Table(table));
                Status::Ok
            }
            None => Status::Failed,
        }
    });
    let add: Sink = {
        let membership = membership.clone();
        Arc::new(move |node: &mut Node, var: VarRef, _: Option<Ipv6Addr>| match written_group(node, var) {
            Ok(group) => join_group(node, &membership, group),
            Err(status) => status,
        })
    };
    let remove: Sink = {
        let membership = membership.clone();
        Arc::new(move |node: &mut Node, var: VarRef, _: Option<Ipv6Addr>| match written_group(node, var) {
            Ok(group) => leave_group(node, &membership, group),
            Err(status) => status,
        })
    };
    let clear: Sink = Arc::new(move |node: &mut Node, _: VarRef, _: Option<Ipv6Addr>| leave_all(node, &membership));

    for (index, capability) in [
        (VAR_GROUPS, Capability::Provider(refresh)),
        (VAR_ADD, Capability::Sink(add)),
        (VAR_REMOVE, Capability::Sink(remove)),
        (VAR_CLEAR, Capability::Sink(clear)),
    ] {
        let Some(position) = node.mibs[mib].lookup_var_index(index) else {
            continue;
        };
        let var = &mut node.mibs[mib].vars[position];
        var.capability = capability;
        var.enabled = true;
        if var.value.is_none() {
            var.value = Some(Value::default_for(var.var_type));
        }
    }
}

/// The group just written to an add or remove variable.
fn written_group(node: &Node, var: VarRef) -> Result<Ipv6Addr, Status> {
    let data = node
        .var(var)
        .and_then(|slot| slot.value.as_ref())
        .and_then(Value::as_bytes)
        .ok_or(Status::BadBufferSize)?;
    expand(data)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::topology::{Mib, Var};
    use crate::wire::{AccessType, Security, VarType};

    fn group(n: u16) -> Ipv6Addr {
        Ipv6Addr::new(0xff15, 0, 0, 0, 0, 0, 0, n)
    }

    fn node() -> Node {
        let mut node = Node::new("[fd04::5]:1873".parse().unwrap(), 0x0810_0002);
        let mut mib = Mib::new(GROUPS_MIB_ID, 2, "Groups");
        mib.add_var(Var::new(0, "Groups", VarType::Table, AccessType::ReadOnly, Security::None));
        mib.add_var(Var::new(1, "AddGroup", VarType::Blob, AccessType::ReadWrite, Security::None));
        mib.add_var(Var::new(2, "RemoveGroup", VarType::Blob, AccessType::ReadWrite, Security::None));
        mib.add_var(Var::new(3, "ClearGroups", VarType::Uint8, AccessType::ReadWrite, Security::None));
        node.add_mib(mib);
        node
    }

    #[test]
    fn compression() {
        assert_eq!(compress(&group(1)), vec![0x15, 0x01]);
        assert_eq!(compress(&"ff05::1:2".parse().unwrap()), vec![0x05, 0x00, 0x01, 0x00, 0x02]);
        assert_eq!(compress(&"ff02:0102::".parse().unwrap()), vec![0x02, 0x01, 0x02, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0]);
        assert!(compress(&Ipv6Addr::UNSPECIFIED).is_empty());

        assert_eq!(expand(&[0x15, 0x01]), Ok(group(1)));
        assert_eq!(expand(&[0x05, 0x00, 0x01, 0x00, 0x02]), Ok("ff05::1:2".parse().unwrap()));
        assert_eq!(expand(&[0x15]), Ok("ff15::".parse().unwrap()));
        assert_eq!(expand(&[]), Err(Status::BadBufferSize));
        assert_eq!(expand(&[0; 16]), Err(Status::BadBufferSize));
    }

    #[test]
    fn join_and_leave() {
        let membership = Membership::detached();
        let mut node = node();
        install(&mut node, Arc::new(Membership::detached()));

        assert_eq!(join_group(&mut node, &membership, group(1)), Status::Ok);
        // Second join is fine
        assert_eq!(join_group(&mut node, &membership, group(1)), Status::Ok);
        assert_eq!(node.groups.as_ref().unwrap().len(), 1);
        assert_eq!(membership.members(&group(1)), vec![node.address]);

        assert_eq!(leave_group(&mut node, &membership, group(1)), Status::Ok);
        assert_eq!(leave_group(&mut node, &membership, group(1)), Status::Failed);
        assert!(membership.members(&group(1)).is_empty());
        assert_eq!(join_group(&mut node, &membership, "fd04::1".parse().unwrap()), Status::BadValue);
    }

    #[test]
    fn slots_run_out() {
        let membership = Membership::detached();
        let mut node = node();
        for n in 0..MAX_GROUPS as u16 {
            assert_eq!(join_group(&mut node, &membership, group(n + 1)), Status::Ok);
        }
        assert_eq!(join_group(&mut node, &membership, group(100)), Status::Failed);
        assert_eq!(leave_all(&mut node, &membership), Status::Ok);
        assert!(node.groups.as_ref().unwrap().is_empty());
    }

    #[test]
    fn installed_handlers_drive_membership() {
        let membership = Arc::new(Membership::detached());
        let mut node = node();
        install(&mut node, membership.clone());
        assert!(node.mibs[0].vars.iter().all(|var| var.enabled));

        let add = VarRef::new(0, 1);
        node.var_mut(add).unwrap().value = Some(Value::Blob(vec![0x15, 0x07].into()));
        let sink = node.var(add).unwrap().capability.sink().unwrap();
        assert_eq!(sink(&mut node, add, None), Status::Ok);
        assert_eq!(membership.members(&group(7)), vec![node.address]);

        let table = VarRef::new(0, 0);
        let provider = node.var(table).unwrap().capability.provider().unwrap();
        assert_eq!(provider(&mut node, table), Status::Ok);
        let rows = node.var(table).unwrap().value.as_ref().unwrap().as_table().unwrap().clone();
        assert_eq!(rows.row(0).map(|row| row.to_vec()), Some(vec![0x15, 0x07]));

        let clear = VarRef::new(0, 3);
        let sink = node.var(clear).unwrap().capability.sink().unwrap();
        assert_eq!(sink(&mut node, clear, None), Status::Ok);
        assert!(membership.members(&group(7)).is_empty());
    }
}
