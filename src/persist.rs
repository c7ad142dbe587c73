//! Saving and restoring definitions and networks.
//!
//! Two JSON documents, both tagged with [`FORMAT_VERSION`]:
//!
//! - a *definitions* file holds the schema cache, so nodes of known device
//!   types join without being queried.
//! - a *network* file holds the border router and the address and device ID
//!   of every node. Loading it needs the matching definitions already in the
//!   cache.
//!
//! ```rust,no_run
//! # fn example(network: &async_jip::Network) -> async_jip::Result<()> {
//! async_jip::persist::save_definitions(network, "definitions.json")?;
//! async_jip::persist::save_network(network, "network.json")?;
//! # Ok(())
//! # }
//! ```

use std::net::{Ipv6Addr, SocketAddr};
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::cache::{MibSchema, NodeSchema};
use crate::error::{Error, Result};
use crate::topology::{Network, Node};

/// Version written to and required of every file.
pub const FORMAT_VERSION: u32 = 3;

#[derive(Debug, Serialize, Deserialize)]
struct DefinitionsFile {
    version: u32,
    nodes: Vec<NodeSchema>,
    mibs: Vec<MibSchema>,
}

#[derive(Debug, Serialize, Deserialize)]
struct NetworkFile {
    version: u32,
    border_router: Option<Ipv6Addr>,
    nodes: Vec<NodeEntry>,
}

#[derive(Debug, Serialize, Deserialize)]
struct NodeEntry {
    address: SocketAddr,
    device_id: u32,
}

fn persist_error(path: &Path, reason: impl std::fmt::Display) -> Box<Error> {
    Error::Persist {
        path: path.to_path_buf(),
        reason: reason.to_string().into(),
    }
    .boxed()
}

fn write_json<V: Serialize>(path: &Path, value: &V) -> Result<()> {
    let json = serde_json::to_string_pretty(value).map_err(|e| persist_error(path, e))?;
    std::fs::write(path, json).map_err(|e| persist_error(path, e))
}

fn read_json<V: for<'de> Deserialize<'de>>(path: &Path) -> Result<V> {
    let json = std::fs::read(path).map_err(|e| persist_error(path, e))?;
    serde_json::from_slice(&json).map_err(|e| persist_error(path, e))
}

fn check_version(path: &Path, version: u32) -> Result<()> {
    if version != FORMAT_VERSION {
        return Err(persist_error(
            path,
            format!("format version {} (expected {})", version, FORMAT_VERSION),
        ));
    }
    Ok(())
}

/// Write the schema cache.
pub fn save_definitions(network: &Network, path: impl AsRef<Path>) -> Result<()> {
    let path = path.as_ref();
    let file = network.with_cache(|cache| DefinitionsFile {
        version: FORMAT_VERSION,
        nodes: cache.nodes().into_iter().cloned().collect(),
        mibs: cache.mibs().into_iter().cloned().collect(),
    });
    write_json(path, &file)?;
    tracing::debug!(
        target: "async_jip::persist",
        { path = %path.display(), jip.devices = file.nodes.len(), jip.mibs = file.mibs.len() },
        "definitions saved"
    );
    Ok(())
}

/// Merge a definitions file into the schema cache.
///
/// Schemas already cached are kept. Returns the number of device types
/// added.
pub fn load_definitions(network: &Network, path: impl AsRef<Path>) -> Result<usize> {
    let path = path.as_ref();
    let file: DefinitionsFile = read_json(path)?;
    check_version(path, file.version)?;

    let added = network.with_cache(|cache| {
        for mib in file.mibs {
            cache.insert_mib(mib);
        }
        file.nodes
            .into_iter()
            .filter(|node| cache.insert_node(node.clone()))
            .count()
    });
    tracing::debug!(target: "async_jip::persist", { path = %path.display(), jip.devices = added }, "definitions loaded");
    Ok(added)
}

/// Write the border router and node list.
pub fn save_network(network: &Network, path: impl AsRef<Path>) -> Result<()> {
    let path = path.as_ref();
    let file = NetworkFile {
        version: FORMAT_VERSION,
        border_router: network.border_router(),
        nodes: network
            .members()
            .into_iter()
            .map(|(address, device_id)| NodeEntry { address, device_id })
            .collect(),
    };
    write_json(path, &file)?;
    tracing::debug!(target: "async_jip::persist", { path = %path.display(), jip.nodes = file.nodes.len() }, "network saved");
    Ok(())
}

/// Add the nodes of a network file, populated from the schema cache.
///
/// The file is rejected if it was saved behind another border router.
/// Nodes whose device type is not cached, or whose address is taken, are
/// skipped. Returns the number of nodes added.
pub async fn load_network(network: &Network, path: impl AsRef<Path>) -> Result<usize> {
    let path = path.as_ref();
    let file: NetworkFile = read_json(path)?;
    check_version(path, file.version)?;

    if let Some(saved) = file.border_router {
        match network.border_router() {
            Some(current) if current != saved => {
                return Err(persist_error(
                    path,
                    format!("saved behind border router {}, connected to {}", saved, current),
                ));
            }
            Some(_) => {}
            None => network.set_border_router(saved),
        }
    }

    let mut added = 0;
    for entry in file.nodes {
        let mut node = Node::new(entry.address, entry.device_id);
        if !network.with_cache(|cache| cache.populate_node(&mut node)) {
            tracing::debug!(target: "async_jip::persist", { jip.node = %entry.address, jip.device_id = entry.device_id }, "device type not cached, skipping node");
            continue;
        }
        match network.add_node(node).await {
            Ok(_) => added += 1,
            Err(e) => {
                tracing::debug!(target: "async_jip::persist", { jip.node = %entry.address, error = %e }, "skipping node");
            }
        }
    }
    tracing::debug!(target: "async_jip::persist", { path = %path.display(), jip.nodes = added }, "network loaded");
    Ok(added)
}
