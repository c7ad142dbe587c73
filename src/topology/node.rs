//! Node, MIB and variable records.
//!
//! A [`Node`] owns its MIBs, a [`Mib`] owns its variables. Variables are
//! addressed by position through [`VarRef`]; the positions stay valid for as
//! long as the node's schema is not replaced.

use std::fmt;
use std::net::{Ipv6Addr, SocketAddr};
use std::sync::Arc;

use crate::error::Status;
use crate::server::GroupTable;
use crate::wire::{AccessType, Security, Value, VarType};

/// Device ID bit marking nodes that spend most of their time asleep.
pub const SLEEPING_DEVICE: u32 = 0x8000_0000;

/// Position of a variable inside a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct VarRef {
    /// Position in [`Node::mibs`].
    pub mib: usize,
    /// Position in [`Mib::vars`].
    pub var: usize,
}

impl VarRef {
    pub fn new(mib: usize, var: usize) -> Self {
        Self { mib, var }
    }
}

/// Refreshes a variable's value before it is read.
///
/// Returning [`Status::Timeout`] suppresses the reply to the request.
pub type Provider = Arc<dyn Fn(&mut Node, VarRef) -> Status + Send + Sync>;

/// Acts on a variable after a successful write.
///
/// The second argument is the multicast group the write arrived on, if any.
pub type Sink = Arc<dyn Fn(&mut Node, VarRef, Option<Ipv6Addr>) -> Status + Send + Sync>;

/// Invoked when a trap notification updates a variable.
pub type TrapCallback = Arc<dyn Fn(&Node, VarRef) + Send + Sync>;

/// Behaviour attached to a variable.
#[derive(Clone, Default)]
pub enum Capability {
    #[default]
    None,
    /// Server: refresh the value on read.
    Provider(Provider),
    /// Server: act on a committed write.
    Sink(Sink),
    /// Server: both of the above.
    Handlers { provider: Provider, sink: Sink },
    /// Client: subscribed to change notifications.
    TrapSubscriber { handle: u8, callback: TrapCallback },
}

impl Capability {
    pub fn provider(&self) -> Option<Provider> {
        match self {
            Self::Provider(provider) | Self::Handlers { provider, .. } => Some(provider.clone()),
            _ => None,
        }
    }

    pub fn sink(&self) -> Option<Sink> {
        match self {
            Self::Sink(sink) | Self::Handlers { sink, .. } => Some(sink.clone()),
            _ => None,
        }
    }

    /// Trap handle and callback when subscribed.
    pub fn trap(&self) -> Option<(u8, TrapCallback)> {
        match self {
            Self::TrapSubscriber { handle, callback } => Some((*handle, callback.clone())),
            _ => None,
        }
    }
}

impl fmt::Debug for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::None => f.write_str("None"),
            Self::Provider(_) => f.write_str("Provider"),
            Self::Sink(_) => f.write_str("Sink"),
            Self::Handlers { .. } => f.write_str("Handlers"),
            Self::TrapSubscriber { handle, .. } => f
                .debug_struct("TrapSubscriber")
                .field("handle", handle)
                .finish_non_exhaustive(),
        }
    }
}

/// A remote subscriber registered on a server variable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrapRegistration {
    pub subscriber: SocketAddr,
    pub handle: u8,
}

/// One variable.
#[derive(Debug, Clone)]
pub struct Var {
    pub index: u8,
    pub name: String,
    pub var_type: VarType,
    pub access: AccessType,
    pub security: Security,
    pub enabled: bool,
    /// Last known value; `None` until first read or write.
    pub value: Option<Value>,
    pub capability: Capability,
    /// Server side trap subscribers.
    pub registrations: Vec<TrapRegistration>,
}

impl Var {
    pub fn new(
        index: u8,
        name: impl Into<String>,
        var_type: VarType,
        access: AccessType,
        security: Security,
    ) -> Self {
        Self {
            index,
            name: name.into(),
            var_type,
            access,
            security,
            enabled: true,
            value: None,
            capability: Capability::None,
            registrations: Vec::new(),
        }
    }

    /// Replace the value. A value of another type is rejected.
    ///
    /// Returns whether the stored value changed.
    pub fn set_value(&mut self, value: Value) -> std::result::Result<bool, Status> {
        if value.var_type() != self.var_type {
            return Err(Status::WrongType);
        }
        let changed = self.value.as_ref() != Some(&value);
        self.value = Some(value);
        Ok(changed)
    }
}

/// One MIB instance on a node.
#[derive(Debug, Clone)]
pub struct Mib {
    pub id: u32,
    /// Position in the owning node's MIB list as reported by that node.
    pub index: u8,
    pub name: String,
    pub vars: Vec<Var>,
}

impl Mib {
    pub fn new(id: u32, index: u8, name: impl Into<String>) -> Self {
        Self {
            id,
            index,
            name: name.into(),
            vars: Vec::new(),
        }
    }

    /// Append a variable and return its position.
    pub fn add_var(&mut self, var: Var) -> usize {
        self.vars.push(var);
        self.vars.len() - 1
    }

    /// First variable called `name` after position `after`.
    pub fn lookup_var(&self, after: Option<usize>, name: &str) -> Option<usize> {
        let start = after.map_or(0, |p| p + 1);
        self.vars
            .iter()
            .skip(start)
            .position(|var| var.name == name)
            .map(|p| p + start)
    }

    /// Variable with the wire index `index`.
    pub fn lookup_var_index(&self, index: u8) -> Option<usize> {
        self.vars.iter().position(|var| var.index == index)
    }
}

/// One mesh endpoint.
#[derive(Debug, Clone)]
pub struct Node {
    pub address: SocketAddr,
    /// Device type. See [`SLEEPING_DEVICE`].
    pub device_id: u32,
    pub mibs: Vec<Mib>,
    pub(crate) groups: Option<GroupTable>,
}

impl Node {
    pub fn new(address: SocketAddr, device_id: u32) -> Self {
        Self {
            address,
            device_id,
            mibs: Vec::new(),
            groups: None,
        }
    }

    pub fn is_sleeping(&self) -> bool {
        self.device_id & SLEEPING_DEVICE != 0
    }

    /// Append a MIB and return its position.
    pub fn add_mib(&mut self, mib: Mib) -> usize {
        self.mibs.push(mib);
        self.mibs.len() - 1
    }

    /// First MIB called `name` after position `after`.
    pub fn lookup_mib(&self, after: Option<usize>, name: &str) -> Option<usize> {
        let start = after.map_or(0, |p| p + 1);
        self.mibs
            .iter()
            .skip(start)
            .position(|mib| mib.name == name)
            .map(|p| p + start)
    }

    /// First MIB with type `id` after position `after`.
    pub fn lookup_mib_id(&self, after: Option<usize>, id: u32) -> Option<usize> {
        let start = after.map_or(0, |p| p + 1);
        self.mibs
            .iter()
            .skip(start)
            .position(|mib| mib.id == id)
            .map(|p| p + start)
    }

    /// MIB with the wire index `index`.
    pub fn mib_by_index(&self, index: u8) -> Option<usize> {
        self.mibs.iter().position(|mib| mib.index == index)
    }

    /// Locate `mib_name`/`var_name`.
    pub fn find_var(&self, mib_name: &str, var_name: &str) -> Option<VarRef> {
        let mib = self.lookup_mib(None, mib_name)?;
        let var = self.mibs[mib].lookup_var(None, var_name)?;
        Some(VarRef { mib, var })
    }

    /// Locate a variable by MIB ID and variable index.
    pub fn find_var_id(&self, mib_id: u32, var_index: u8) -> Option<VarRef> {
        let mib = self.lookup_mib_id(None, mib_id)?;
        let var = self.mibs[mib].lookup_var_index(var_index)?;
        Some(VarRef { mib, var })
    }

    pub fn mib(&self, var: VarRef) -> Option<&Mib> {
        self.mibs.get(var.mib)
    }

    pub fn var(&self, var: VarRef) -> Option<&Var> {
        self.mibs.get(var.mib)?.vars.get(var.var)
    }

    pub fn var_mut(&mut self, var: VarRef) -> Option<&mut Var> {
        self.mibs.get_mut(var.mib)?.vars.get_mut(var.var)
    }

    /// Every variable position, in MIB then variable order.
    pub fn var_refs(&self) -> impl Iterator<Item = VarRef> + '_ {
        self.mibs.iter().enumerate().flat_map(|(mib, m)| {
            (0..m.vars.len()).map(move |var| VarRef { mib, var })
        })
    }
}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Node {} (device 0x{:08x})", self.address, self.device_id)?;
        for mib in &self.mibs {
            writeln!(f, "  Mib {} 0x{:08x} {}", mib.index, mib.id, mib.name)?;
            for var in &mib.vars {
                write!(
                    f,
                    "    Var {} {} ({}, {:?})",
                    var.index, var.name, var.var_type, var.access
                )?;
                match (&var.value, var.enabled) {
                    (_, false) => writeln!(f, " disabled")?,
                    (Some(value), true) => writeln!(f, " = {}", value)?,
                    (None, true) => writeln!(f)?,
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node() -> Node {
        let mut node = Node::new("[fd04::1]:1873".parse().unwrap(), 0x0801_0001);
        let mut first = Mib::new(0xffff_ff00, 0, "Node");
        first.add_var(Var::new(0, "MacAddress", VarType::Uint64, AccessType::Const, Security::None));
        first.add_var(Var::new(1, "DescriptiveName", VarType::Str, AccessType::ReadWrite, Security::None));
        node.add_mib(first);
        let mut second = Mib::new(0xffff_fe04, 1, "BulbControl");
        second.add_var(Var::new(0, "Mode", VarType::Uint8, AccessType::ReadWrite, Security::None));
        node.add_mib(second);
        node.add_mib(Mib::new(0xffff_fe04, 2, "BulbControl"));
        node
    }

    #[test]
    fn lookups_resume_after_position() {
        let node = node();
        let first = node.lookup_mib(None, "BulbControl").unwrap();
        assert_eq!(first, 1);
        assert_eq!(node.lookup_mib(Some(first), "BulbControl"), Some(2));
        assert_eq!(node.lookup_mib(Some(2), "BulbControl"), None);
        assert_eq!(node.lookup_mib_id(Some(1), 0xffff_fe04), Some(2));
        assert_eq!(node.mib_by_index(2), Some(2));
    }

    #[test]
    fn find_var_by_name_and_id() {
        let node = node();
        let var = node.find_var("Node", "DescriptiveName").unwrap();
        assert_eq!(var, VarRef::new(0, 1));
        assert_eq!(node.find_var_id(0xffff_fe04, 0), Some(VarRef::new(1, 0)));
        assert!(node.find_var("Node", "Missing").is_none());
        assert_eq!(node.var_refs().count(), 3);
    }

    #[test]
    fn set_value_checks_type() {
        let mut node = node();
        let var = node.var_mut(VarRef::new(1, 0)).unwrap();
        assert_eq!(var.set_value(Value::U8(3)), Ok(true));
        assert_eq!(var.set_value(Value::U8(3)), Ok(false));
        assert_eq!(var.set_value(Value::U16(3)), Err(Status::WrongType));
        assert_eq!(var.value, Some(Value::U8(3)));
    }

    #[test]
    fn sleeping_bit() {
        let mut node = node();
        assert!(!node.is_sleeping());
        node.device_id |= SLEEPING_DEVICE;
        assert!(node.is_sleeping());
    }

    #[test]
    fn display_lists_vars() {
        let mut node = node();
        node.var_mut(VarRef::new(0, 1)).unwrap().value = Some(Value::from("lamp"));
        node.var_mut(VarRef::new(1, 0)).unwrap().enabled = false;
        let text = node.to_string();
        assert!(text.contains("DescriptiveName (string, ReadWrite) = \"lamp\""));
        assert!(text.contains("Mode (uint8, ReadWrite) disabled"));
    }
}
