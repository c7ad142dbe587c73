//! Device schemas shared by the integration tests.

use async_jip::{AccessType, MibSchema, NodeSchema, VarType};

/// Device type of the test coordinator.
pub const COORDINATOR: u32 = 0x0801_0001;

/// Device type of the test lamp.
pub const LAMP: u32 = 0x0810_0002;

pub const NODE_MIB: u32 = 0xffff_ff00;
pub const GROUPS_MIB: u32 = 0xffff_ff02;
pub const JENNET_MIB: u32 = 0xffff_fe81;
pub const BULB_MIB: u32 = 0xffff_fe04;
pub const SCENES_MIB: u32 = 0xffff_fe06;

/// Node information MIB carried by every device.
pub fn node_mib() -> MibSchema {
    MibSchema::new(NODE_MIB, "Node")
        .var(0, "MacAddress", VarType::Uint64, AccessType::Const)
        .var(1, "DescriptiveName", VarType::Str, AccessType::ReadWrite)
        .var(2, "Version", VarType::Str, AccessType::ReadOnly)
}

/// Multicast group membership.
pub fn groups_mib() -> MibSchema {
    MibSchema::new(GROUPS_MIB, "Groups")
        .var(0, "Groups", VarType::Table, AccessType::ReadOnly)
        .var(1, "AddGroup", VarType::Blob, AccessType::ReadWrite)
        .var(2, "RemoveGroup", VarType::Blob, AccessType::ReadWrite)
        .var(3, "ClearGroups", VarType::Uint8, AccessType::ReadWrite)
}

/// Mesh routing information kept by the coordinator.
pub fn jennet_mib() -> MibSchema {
    MibSchema::new(JENNET_MIB, "JenNet")
        .var(0, "NetworkTable", VarType::Table, AccessType::ReadOnly)
        .var(1, "TreeVersion", VarType::Uint16, AccessType::ReadOnly)
}

/// Lamp control.
pub fn bulb_mib() -> MibSchema {
    MibSchema::new(BULB_MIB, "BulbControl")
        .var(0, "Mode", VarType::Uint8, AccessType::ReadWrite)
        .var(1, "LumCurrent", VarType::Uint8, AccessType::ReadWrite)
        .var(2, "LumTarget", VarType::Uint8, AccessType::ReadOnly)
}

/// Stored lighting scenes, one row per scene.
pub fn scenes_mib() -> MibSchema {
    MibSchema::new(SCENES_MIB, "BulbScenes")
        .var(0, "Scenes", VarType::Table, AccessType::ReadWrite)
}

pub fn coordinator_schema() -> NodeSchema {
    NodeSchema::new(COORDINATOR)
        .mib(node_mib())
        .mib(groups_mib())
        .mib(jennet_mib())
}

pub fn lamp_schema() -> NodeSchema {
    NodeSchema::new(LAMP)
        .mib(node_mib())
        .mib(groups_mib())
        .mib(bulb_mib())
        .mib(scenes_mib())
}
