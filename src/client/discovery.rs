//! Node and network discovery.
//!
//! Discovering a node pages through its MIB list and, for every MIB not
//! already in the schema cache, through the MIB's variables. Discovering
//! the network reads the coordinator's `JenNet`/`NetworkTable` and
//! reconciles the node list with it.

use std::collections::HashSet;
use std::net::{Ipv6Addr, SocketAddr};

use tracing::instrument;

use crate::error::{Error, Result};
use crate::topology::{DEVICE_ID_ALL, Mib, NetworkEventKind, Node, Var};
use crate::transport::Transport;
use crate::wire::{
    Command, DEFAULT_PORT, MibEntry, QueryMibRequest, QueryMibResponse, QueryVarRequest,
    QueryVarResponse, Value, VarInfo,
};

use super::Client;

/// MIBs or variables asked for per query.
const QUERY_PAGE: u8 = 4;

/// Queries answered with a non-OK status before discovery fails.
const QUERY_MAX_ATTEMPTS: u32 = 5;

/// Bytes per `NetworkTable` row: interface ID then device ID.
const NETWORK_TABLE_ROW_LEN: usize = 12;

impl<T: Transport> Client<T> {
    /// Learn a node's MIBs and variables from the node itself.
    ///
    /// MIBs already in the schema cache are copied from there; the others
    /// are queried and cached. The node's device schema is cached last.
    #[instrument(skip(self, node), err, fields(jip.node = %node.address, jip.device_id = node.device_id))]
    pub async fn discover_node(&self, node: &mut Node) -> Result<()> {
        let entries = self.query_mibs(node).await?;
        node.mibs.clear();

        for entry in entries {
            let mut mib = Mib::new(entry.id, entry.index, entry.name);
            let cached = self
                .inner
                .network
                .with_cache(|cache| cache.populate_mib(&mut mib));
            if !cached {
                for info in self.query_vars(node, mib.index).await? {
                    mib.add_var(Var::new(
                        info.index,
                        info.name,
                        info.var_type,
                        info.access,
                        info.security,
                    ));
                }
                self.inner.network.with_cache(|cache| cache.add_mib(&mib));
            }
            node.add_mib(mib);
        }

        self.inner.network.with_cache(|cache| cache.add_node(node));
        tracing::debug!(
            target: "async_jip::discovery",
            { jip.node = %node.address, jip.mibs = node.mibs.len() },
            "node discovered"
        );
        Ok(())
    }

    async fn query_mibs(&self, node: &mut Node) -> Result<Vec<MibEntry>> {
        let mut entries = Vec::new();
        let mut start: u8 = 0;
        loop {
            let request = QueryMibRequest {
                start,
                count: QUERY_PAGE,
            }
            .encode();
            let mut attempts = 0;
            let response = loop {
                let (body, source) = self
                    .exchange_with(
                        node,
                        Command::QueryMibRequest,
                        &request,
                        Command::QueryMibResponse,
                        true,
                    )
                    .await?;
                let response = QueryMibResponse::decode(body, source)?;
                if response.status.is_ok() {
                    break response;
                }
                attempts += 1;
                tracing::debug!(
                    target: "async_jip::discovery",
                    { jip.node = %node.address, jip.status = %response.status, jip.attempts = attempts },
                    "MIB query refused"
                );
                if attempts >= QUERY_MAX_ATTEMPTS {
                    return Err(Error::status_from(node.address, response.status));
                }
            };

            let returned = response.entries.len();
            entries.extend(response.entries);
            if response.outstanding == 0 {
                return Ok(entries);
            }
            start = advance(node.address, start, returned)?;
        }
    }

    async fn query_vars(&self, node: &mut Node, mib_index: u8) -> Result<Vec<VarInfo>> {
        let mut vars = Vec::new();
        let mut start: u8 = 0;
        loop {
            let request = QueryVarRequest {
                mib_index,
                start,
                count: QUERY_PAGE,
            }
            .encode();
            let mut attempts = 0;
            let response = loop {
                let (body, source) = self
                    .exchange_with(
                        node,
                        Command::QueryVarRequest,
                        &request,
                        Command::QueryVarResponse,
                        true,
                    )
                    .await?;
                let response = QueryVarResponse::decode(body, source)?;
                if response.status.is_ok() {
                    break response;
                }
                attempts += 1;
                tracing::debug!(
                    target: "async_jip::discovery",
                    { jip.node = %node.address, jip.mib_index = mib_index, jip.status = %response.status, jip.attempts = attempts },
                    "variable query refused"
                );
                if attempts >= QUERY_MAX_ATTEMPTS {
                    return Err(Error::status_from(node.address, response.status));
                }
            };

            let returned = response.entries.len();
            vars.extend(response.entries);
            if response.outstanding == 0 {
                return Ok(vars);
            }
            start = advance(node.address, start, returned)?;
        }
    }

    /// Bring the node list in line with the coordinator's network table.
    ///
    /// The coordinator is added first if missing. Nodes listed in the table
    /// but unknown here are added (and discovered unless cached), emitting
    /// [`NetworkEventKind::Join`]. Known nodes no longer listed are removed,
    /// emitting [`NetworkEventKind::Leave`]; the border router itself is
    /// never removed. A node that fails to join is skipped.
    #[instrument(skip(self), err)]
    pub async fn discover_network(&self) -> Result<()> {
        let network = &self.inner.network;
        let coordinator = self.coordinator_address();
        let mut node = match network.lookup_node(coordinator).await {
            Some(node) => node,
            None => {
                self.add_node(coordinator, self.inner.config.coordinator_device_id)
                    .await?
            }
        };

        let table_var = node.find_var("JenNet", "NetworkTable").ok_or_else(|| {
            Error::UnknownVar {
                node: node.address,
                mib: "JenNet".into(),
                var: "NetworkTable".into(),
            }
            .boxed()
        })?;
        self.get_var(&mut node, table_var).await?;
        let rows: Vec<(u64, u32)> = match node.var(table_var).and_then(|v| v.value.as_ref()) {
            Some(Value::Table(table)) => table
                .rows()
                .filter_map(|(index, data)| {
                    let row = parse_network_row(data);
                    if row.is_none() {
                        tracing::debug!(target: "async_jip::discovery", { jip.row = index, jip.bytes = data.len() }, "skipping malformed network table row");
                    }
                    row
                })
                .collect(),
            _ => Vec::new(),
        };
        drop(node);

        let border_router = network.border_router().ok_or_else(|| {
            Error::Config("border router address unknown, cannot derive node addresses".into())
                .boxed()
        })?;
        let previous = network.node_addresses(DEVICE_ID_ALL);

        let mut current = HashSet::with_capacity(rows.len());
        for (interface_id, device_id) in rows {
            let address = child_address(border_router, interface_id);
            current.insert(address);
            if network.contains(address) {
                continue;
            }
            match self.add_node(address, device_id).await {
                Ok(node) => {
                    drop(node);
                    network.notify(NetworkEventKind::Join, address, device_id);
                }
                Err(e) => {
                    tracing::warn!(target: "async_jip::discovery", { jip.node = %address, jip.device_id = device_id, error = %e }, "node failed to join");
                }
            }
        }

        for address in previous {
            if current.contains(&address) || address.ip() == border_router {
                continue;
            }
            match self.remove_node(address).await {
                Ok(node) => {
                    let device_id = node.device_id;
                    drop(node);
                    network.notify(NetworkEventKind::Leave, address, device_id);
                }
                Err(e) => {
                    tracing::debug!(target: "async_jip::discovery", { jip.node = %address, error = %e }, "departed node already gone");
                }
            }
        }

        tracing::debug!(target: "async_jip::discovery", { jip.nodes = network.len() }, "network discovered");
        Ok(())
    }
}

/// Next query start after `returned` entries.
fn advance(target: SocketAddr, start: u8, returned: usize) -> Result<u8> {
    // Entries outstanding but none returned would repeat the same query.
    if returned == 0 {
        return Err(Error::MalformedResponse { target }.boxed());
    }
    u8::try_from(returned)
        .ok()
        .and_then(|returned| start.checked_add(returned))
        .ok_or_else(|| Error::MalformedResponse { target }.boxed())
}

/// `{interface id u64, device id u32}`, big-endian.
fn parse_network_row(data: &[u8]) -> Option<(u64, u32)> {
    if data.len() != NETWORK_TABLE_ROW_LEN {
        return None;
    }
    let interface_id = u64::from_be_bytes(data[..8].try_into().ok()?);
    let device_id = u32::from_be_bytes(data[8..].try_into().ok()?);
    Some((interface_id, device_id))
}

/// Address of a node: the border router's /64 prefix plus its interface ID.
fn child_address(border_router: Ipv6Addr, interface_id: u64) -> SocketAddr {
    let prefix = u128::from(border_router) & !u128::from(u64::MAX);
    let address = Ipv6Addr::from(prefix | u128::from(interface_id));
    SocketAddr::new(address.into(), DEFAULT_PORT)
}
