//! Schema cache.
//!
//! Nodes of the same device type expose the same MIBs, and MIBs with the same
//! ID expose the same variables. The cache remembers both so that a newly
//! seen node can be populated without a single network exchange.
//!
//! Schemas carry names, types and access classes only: no values, no trap
//! state, no capabilities. Populating always produces independent copies.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::topology::{Mib, Node, Var};
use crate::wire::{AccessType, Security, VarType};

/// Shape of one variable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VarSchema {
    pub index: u8,
    pub name: String,
    pub var_type: VarType,
    pub access: AccessType,
    #[serde(default)]
    pub security: Security,
}

impl VarSchema {
    fn from_var(var: &Var) -> Self {
        Self {
            index: var.index,
            name: var.name.clone(),
            var_type: var.var_type,
            access: var.access,
            security: var.security,
        }
    }

    fn to_var(&self) -> Var {
        Var::new(self.index, self.name.clone(), self.var_type, self.access, self.security)
    }
}

/// Shape of one MIB.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MibSchema {
    pub id: u32,
    /// Index the MIB had on the node it was learned from.
    #[serde(default)]
    pub index: u8,
    pub name: String,
    pub vars: Vec<VarSchema>,
}

impl MibSchema {
    pub fn new(id: u32, name: impl Into<String>) -> Self {
        Self {
            id,
            index: 0,
            name: name.into(),
            vars: Vec::new(),
        }
    }

    /// Builder-style: append a variable.
    pub fn var(
        mut self,
        index: u8,
        name: impl Into<String>,
        var_type: VarType,
        access: AccessType,
    ) -> Self {
        self.vars.push(VarSchema {
            index,
            name: name.into(),
            var_type,
            access,
            security: Security::None,
        });
        self
    }

    pub fn from_mib(mib: &Mib) -> Self {
        Self {
            id: mib.id,
            index: mib.index,
            name: mib.name.clone(),
            vars: mib.vars.iter().map(VarSchema::from_var).collect(),
        }
    }

    /// A fresh MIB with every variable enabled and no values.
    pub fn to_mib(&self) -> Mib {
        let mut mib = Mib::new(self.id, self.index, self.name.clone());
        mib.vars = self.vars.iter().map(VarSchema::to_var).collect();
        mib
    }
}

/// Shape of one device type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeSchema {
    pub device_id: u32,
    pub mibs: Vec<MibSchema>,
}

impl NodeSchema {
    pub fn new(device_id: u32) -> Self {
        Self {
            device_id,
            mibs: Vec::new(),
        }
    }

    /// Builder-style: append a MIB at the next index.
    pub fn mib(mut self, mut mib: MibSchema) -> Self {
        mib.index = self.mibs.len() as u8;
        self.mibs.push(mib);
        self
    }

    pub fn from_node(node: &Node) -> Self {
        Self {
            device_id: node.device_id,
            mibs: node.mibs.iter().map(MibSchema::from_mib).collect(),
        }
    }
}

/// Device-type and MIB-ID indexed schemas.
#[derive(Debug, Clone, Default)]
pub struct SchemaCache {
    nodes: HashMap<u32, NodeSchema>,
    mibs: HashMap<u32, MibSchema>,
}

impl SchemaCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Give `node` the MIBs of its device type.
    ///
    /// Returns `false` on a miss, leaving the node untouched.
    pub fn populate_node(&self, node: &mut Node) -> bool {
        match self.nodes.get(&node.device_id) {
            Some(schema) => {
                node.mibs = schema.mibs.iter().map(MibSchema::to_mib).collect();
                true
            }
            None => false,
        }
    }

    /// Give `mib` the variables of its MIB ID.
    ///
    /// Returns `false` on a miss, leaving the MIB untouched.
    pub fn populate_mib(&self, mib: &mut Mib) -> bool {
        match self.mibs.get(&mib.id) {
            Some(schema) => {
                mib.vars = schema.vars.iter().map(VarSchema::to_var).collect();
                true
            }
            None => false,
        }
    }

    /// Remember the schema of `node`'s device type.
    ///
    /// Returns `false` if the device type is already known.
    pub fn add_node(&mut self, node: &Node) -> bool {
        self.insert_node(NodeSchema::from_node(node))
    }

    /// Remember the schema of `mib`'s ID.
    ///
    /// Returns `false` if the MIB ID is already known.
    pub fn add_mib(&mut self, mib: &Mib) -> bool {
        self.insert_mib(MibSchema::from_mib(mib))
    }

    /// Insert a device schema along with any of its MIBs not yet known.
    pub fn insert_node(&mut self, schema: NodeSchema) -> bool {
        if self.nodes.contains_key(&schema.device_id) {
            tracing::trace!(target: "async_jip::cache", { jip.device_id = schema.device_id }, "device type already cached");
            return false;
        }
        for mib in &schema.mibs {
            self.mibs.entry(mib.id).or_insert_with(|| mib.clone());
        }
        self.nodes.insert(schema.device_id, schema);
        true
    }

    pub fn insert_mib(&mut self, schema: MibSchema) -> bool {
        if self.mibs.contains_key(&schema.id) {
            tracing::trace!(target: "async_jip::cache", { jip.mib_id = schema.id }, "MIB already cached");
            return false;
        }
        self.mibs.insert(schema.id, schema);
        true
    }

    pub fn node(&self, device_id: u32) -> Option<&NodeSchema> {
        self.nodes.get(&device_id)
    }

    pub fn mib(&self, id: u32) -> Option<&MibSchema> {
        self.mibs.get(&id)
    }

    /// Device schemas ordered by device ID.
    pub fn nodes(&self) -> Vec<&NodeSchema> {
        let mut nodes: Vec<_> = self.nodes.values().collect();
        nodes.sort_by_key(|schema| schema.device_id);
        nodes
    }

    /// MIB schemas ordered by ID.
    pub fn mibs(&self) -> Vec<&MibSchema> {
        let mut mibs: Vec<_> = self.mibs.values().collect();
        mibs.sort_by_key(|schema| schema.id);
        mibs
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty() && self.mibs.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::Value;

    fn bulb() -> NodeSchema {
        NodeSchema::new(0x0801_0004)
            .mib(
                MibSchema::new(0xffff_ff00, "Node")
                    .var(0, "MacAddress", VarType::Uint64, AccessType::Const)
                    .var(1, "DescriptiveName", VarType::Str, AccessType::ReadWrite),
            )
            .mib(MibSchema::new(0xffff_fe04, "BulbControl").var(
                0,
                "Mode",
                VarType::Uint8,
                AccessType::ReadWrite,
            ))
    }

    #[test]
    fn populate_node_copies_schema() {
        let mut cache = SchemaCache::new();
        assert!(cache.insert_node(bulb()));
        assert!(cache.mib(0xffff_fe04).is_some());

        let mut node = Node::new("[fd04::2]:1873".parse().unwrap(), 0x0801_0004);
        assert!(cache.populate_node(&mut node));
        assert_eq!(node.mibs.len(), 2);
        assert_eq!(node.mibs[1].index, 1);
        assert_eq!(NodeSchema::from_node(&node), bulb());

        let mut unknown = Node::new("[fd04::3]:1873".parse().unwrap(), 1);
        assert!(!cache.populate_node(&mut unknown));
        assert!(unknown.mibs.is_empty());
    }

    #[test]
    fn populated_copies_are_independent() {
        let mut cache = SchemaCache::new();
        cache.insert_node(bulb());
        let mut node = Node::new("[fd04::2]:1873".parse().unwrap(), 0x0801_0004);
        cache.populate_node(&mut node);
        node.mibs[0].vars[1].value = Some(Value::from("lamp"));
        node.mibs[0].vars.pop();

        let mut other = Node::new("[fd04::4]:1873".parse().unwrap(), 0x0801_0004);
        cache.populate_node(&mut other);
        assert_eq!(other.mibs[0].vars.len(), 2);
        assert!(other.mibs[0].vars[1].value.is_none());
    }

    #[test]
    fn duplicates_are_rejected_quietly() {
        let mut cache = SchemaCache::new();
        let mut node = Node::new("[fd04::2]:1873".parse().unwrap(), 0x0801_0004);
        node.add_mib(MibSchema::new(0xffff_fe04, "BulbControl").to_mib());
        assert!(cache.add_mib(&node.mibs[0]));
        assert!(!cache.add_mib(&node.mibs[0]));
        assert!(cache.add_node(&node));
        assert!(!cache.add_node(&node));
    }

    #[test]
    fn populate_mib_by_id() {
        let mut cache = SchemaCache::new();
        cache.insert_node(bulb());
        let mut mib = Mib::new(0xffff_fe04, 3, "BulbControl");
        assert!(cache.populate_mib(&mut mib));
        assert_eq!(mib.vars[0].name, "Mode");
        assert_eq!(mib.index, 3);
        assert!(!cache.populate_mib(&mut Mib::new(0x1234, 0, "Other")));
    }
}
