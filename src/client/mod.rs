//! JIP client implementation.
//!
//! A [`Client`] keeps a model of the mesh (a [`Network`]) and talks to its
//! nodes over one [`Connection`]. Operations take the node they act on
//! already locked, so the caller decides how long a node stays reserved:
//!
//! ```rust,no_run
//! use async_jip::Client;
//!
//! # async fn example() -> async_jip::Result<()> {
//! let client = Client::builder().border_router("[fd04::1]:1873").connect().await?;
//! client.discover_network().await?;
//!
//! for address in client.network().node_addresses(async_jip::DEVICE_ID_ALL) {
//!     let Some(mut node) = client.network().lookup_node(address).await else {
//!         continue;
//!     };
//!     if let Some(name) = node.find_var("Node", "DescriptiveName") {
//!         client.get_var(&mut node, name).await?;
//!     }
//!     println!("{}", *node);
//! }
//! # Ok(())
//! # }
//! ```

mod builder;
mod discovery;
mod monitor;
pub(crate) mod retry;
mod table;
mod trap;

pub use builder::ClientBuilder;
pub use retry::{Backoff, Retry, RetryBuilder};

use std::net::{Ipv6Addr, SocketAddr};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::broadcast;
use tracing::instrument;

use crate::error::{Error, Result, Status};
use crate::topology::{Network, NetworkEvent, Node, NodeGuard, VarRef};
use crate::transport::{Connection, Exchange, Transport, UdpTransport};
use crate::util::is_multicast;
use crate::wire::{
    Command, DEFAULT_PORT, GetRequest, GetResponse, MibAddr, SetRequest, Value, VarEntry, VarStatus,
};

/// Default wait for an always-on node (500 ms).
pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(500);

/// Default wait for a sleeping node (8 s).
pub const DEFAULT_SLEEPY_TIMEOUT: Duration = Duration::from_secs(8);

/// Default device ID assumed for the coordinator.
pub const DEFAULT_COORDINATOR_DEVICE_ID: u32 = 0x0801_0001;

/// Default number of copies of a multicast request.
pub const DEFAULT_MULTICAST_SEND_COUNT: u32 = 2;

/// Default multicast hop limit, enough to cross the border router.
pub const DEFAULT_MULTICAST_HOPS: u32 = 2;

/// Default table rows requested per page.
pub const DEFAULT_TABLE_PAGE_SIZE: u8 = 1;

/// Default cap on concurrently handled trap notifications.
pub const DEFAULT_MAX_TRAP_TASKS: usize = 64;

/// Pause between copies of a multicast request.
const MULTICAST_SEND_INTERVAL: Duration = Duration::from_millis(200);

/// Client configuration.
///
/// Most users should use [`ClientBuilder`] rather than constructing this directly.
#[derive(Clone, Debug)]
pub struct ClientConfig {
    /// Border router address (default: `[::]:1873`, learned from the first
    /// response)
    pub border_router: SocketAddr,
    /// Wait for an always-on node (default: 500 ms)
    pub timeout: Duration,
    /// Wait for a node whose device ID has the sleeping bit (default: 8 s)
    pub sleepy_timeout: Duration,
    /// Retransmission policy (default: 3 sends, no backoff)
    pub retry: Retry,
    /// Copies of every multicast request (default: 2)
    pub multicast_send_count: u32,
    /// Multicast hop limit (default: 2)
    pub multicast_hops: u32,
    /// Outgoing multicast interface index (default: system choice)
    pub multicast_interface: Option<u32>,
    /// Device ID of the coordinator when it is not cached (default: 0x08010001)
    pub coordinator_device_id: u32,
    /// Table rows per GET request (default: 1)
    pub table_page_size: u8,
    /// Trap notifications handled at once; more are dropped (default: 64)
    pub max_trap_tasks: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            border_router: SocketAddr::new(Ipv6Addr::UNSPECIFIED.into(), DEFAULT_PORT),
            timeout: DEFAULT_TIMEOUT,
            sleepy_timeout: DEFAULT_SLEEPY_TIMEOUT,
            retry: Retry::default(),
            multicast_send_count: DEFAULT_MULTICAST_SEND_COUNT,
            multicast_hops: DEFAULT_MULTICAST_HOPS,
            multicast_interface: None,
            coordinator_device_id: DEFAULT_COORDINATOR_DEVICE_ID,
            table_page_size: DEFAULT_TABLE_PAGE_SIZE,
            max_trap_tasks: DEFAULT_MAX_TRAP_TASKS,
        }
    }
}

/// JIP client.
///
/// Generic over transport type, with [`UdpTransport`] as default. Cheap to
/// clone; clones share the network model and the connection.
pub struct Client<T: Transport = UdpTransport> {
    inner: Arc<ClientInner<T>>,
}

impl<T: Transport> Clone for Client<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

struct ClientInner<T: Transport> {
    connection: Connection<T>,
    network: Arc<Network>,
    config: ClientConfig,
    monitor: Mutex<Option<monitor::MonitorTask>>,
}

impl Client<UdpTransport> {
    /// Create a new client builder.
    ///
    /// # Example
    ///
    /// ```rust,no_run
    /// use async_jip::{Client, Retry};
    /// use std::time::Duration;
    ///
    /// # async fn example() -> async_jip::Result<()> {
    /// let client = Client::builder()
    ///     .border_router("[fd04::1]:1873")
    ///     .timeout(Duration::from_secs(1))
    ///     .retry(Retry::fixed(4, Duration::from_millis(100)))
    ///     .connect()
    ///     .await?;
    /// # Ok(())
    /// # }
    /// ```
    pub fn builder() -> ClientBuilder {
        ClientBuilder::new()
    }
}

impl<T: Transport> Client<T> {
    /// Create a client over an existing transport.
    ///
    /// Starts the receive loop, so this must run inside a tokio runtime.
    pub fn new(transport: T, config: ClientConfig) -> Self {
        let network = Arc::new(Network::new());
        if !config.border_router.ip().is_unspecified()
            && let SocketAddr::V6(border_router) = config.border_router
        {
            network.set_border_router(*border_router.ip());
        }
        let on_trap = trap::notify_handler(network.clone());
        let connection = Connection::start(transport, on_trap, config.max_trap_tasks);
        Self {
            inner: Arc::new(ClientInner {
                connection,
                network,
                config,
                monitor: Mutex::new(None),
            }),
        }
    }

    /// The network model.
    pub fn network(&self) -> &Arc<Network> {
        &self.inner.network
    }

    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.inner.connection.local_addr()
    }

    /// Receive join and leave events found by discovery.
    pub fn subscribe(&self) -> broadcast::Receiver<NetworkEvent> {
        self.inner.network.subscribe()
    }

    /// Where the coordinator lives: the border router once known, the
    /// configured address until then.
    pub fn coordinator_address(&self) -> SocketAddr {
        match self.inner.network.border_router() {
            Some(address) => SocketAddr::new(address.into(), self.inner.config.border_router.port()),
            None => self.inner.config.border_router,
        }
    }

    fn monitor_slot(&self) -> MutexGuard<'_, Option<monitor::MonitorTask>> {
        self.inner.monitor.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Per-send wait for `node`.
    fn timeout_for(&self, node: &Node) -> Duration {
        if node.is_sleeping() {
            self.inner.config.sleepy_timeout
        } else {
            self.inner.config.timeout
        }
    }

    /// Exchange with a locked node.
    ///
    /// A node whose address is unspecified takes the responder's address,
    /// which also becomes the border router address.
    async fn exchange_with(
        &self,
        node: &mut Node,
        command: Command,
        body: &[u8],
        expect: Command,
        stay_awake: bool,
    ) -> Result<(Bytes, SocketAddr)> {
        let (response, source) = self
            .inner
            .connection
            .exchange(Exchange {
                target: node.address,
                command,
                body,
                expect,
                stay_awake,
                timeout: self.timeout_for(node),
                retry: &self.inner.config.retry,
            })
            .await?;

        if node.address.ip().is_unspecified()
            && let SocketAddr::V6(responder) = source
        {
            let adopted = SocketAddr::new((*responder.ip()).into(), node.address.port());
            tracing::info!(target: "async_jip::client", { jip.border_router = %responder.ip() }, "learned border router address");
            self.inner.network.set_border_router(*responder.ip());
            match self.inner.network.rekey_node(node.address, adopted) {
                Ok(()) => {}
                // Not in the network yet
                Err(e) if matches!(*e, Error::UnknownNode { .. }) => {}
                Err(e) => return Err(e),
            }
            node.address = adopted;
        }
        Ok((response, source))
    }

    /// Read a variable into the node model.
    ///
    /// A table variable is fetched page by page. A variable reported as
    /// disabled is marked so, keeping its last value, and the call fails
    /// with [`Status::Disabled`].
    #[instrument(skip(self, node), err, fields(jip.node = %node.address, jip.mib = var.mib, jip.var = var.var))]
    pub async fn get_var(&self, node: &mut Node, var: VarRef) -> Result<()> {
        let target = node.address;
        let (mib_id, var_index, var_type) = {
            let mib = node.mib(var).ok_or_else(|| unknown_var(target, var))?;
            let v = node.var(var).ok_or_else(|| unknown_var(target, var))?;
            (mib.id, v.index, v.var_type)
        };
        if var_type.is_table() {
            return self.fetch_table(node, var, mib_id, var_index).await;
        }

        let request = GetRequest::scalar(MibAddr::Id(mib_id), var_index, 1).encode();
        let (body, source) = self
            .exchange_with(node, Command::GetMibRequest, &request, Command::GetResponse, false)
            .await?;
        let description = match GetResponse::decode(body, source)? {
            GetResponse::Vars(description) => description,
            GetResponse::Table { .. } => {
                tracing::debug!(target: "async_jip::client", { jip.node = %target, jip.expected = %var_type }, "table returned for scalar variable");
                return Err(Error::status_from(target, Status::WrongType));
            }
        };

        let slot = node.var_mut(var).ok_or_else(|| unknown_var(target, var))?;
        match description.entries.into_iter().next() {
            Some(VarEntry::Value(value)) => {
                if value.var_type() != var_type {
                    tracing::debug!(target: "async_jip::client", { jip.node = %target, jip.expected = %var_type, jip.actual = %value.var_type() }, "type mismatch in GET response");
                    return Err(Error::status_from(target, Status::WrongType));
                }
                slot.enabled = true;
                slot.set_value(value)
                    .map_err(|status| Error::status_from(target, status))?;
                Ok(())
            }
            Some(VarEntry::Error(Status::Disabled)) => {
                slot.enabled = false;
                Err(Error::status_from(target, Status::Disabled))
            }
            Some(VarEntry::Error(status)) => Err(Error::status_from(target, status)),
            None => Err(Error::MalformedResponse { target }.boxed()),
        }
    }

    /// Write a variable on the node and, once acknowledged, into the model.
    ///
    /// Values of the wrong type are rejected locally with
    /// [`Status::WrongType`].
    #[instrument(skip(self, node, value), err, fields(jip.node = %node.address, jip.mib = var.mib, jip.var = var.var))]
    pub async fn set_var(&self, node: &mut Node, var: VarRef, value: Value) -> Result<()> {
        let target = node.address;
        let request = self.set_request(node, var, &value)?.encode();

        let (body, source) = self
            .exchange_with(node, Command::SetMibRequest, &request, Command::SetResponse, false)
            .await?;
        let status = VarStatus::decode(body, source)?.status;
        if !status.is_ok() {
            tracing::debug!(target: "async_jip::client", { jip.node = %target, jip.status = %status }, "node rejected SET");
            return Err(Error::status_from(target, status));
        }

        let slot = node.var_mut(var).ok_or_else(|| unknown_var(target, var))?;
        slot.set_value(value)
            .map_err(|status| Error::status_from(target, status))?;
        Ok(())
    }

    /// Write a variable on every node in a multicast group.
    ///
    /// `node` only supplies the variable's schema; its model is not updated.
    /// Nobody answers, so only local failures are reported.
    #[instrument(skip(self, node, value), err, fields(jip.group = %group, jip.mib = var.mib, jip.var = var.var))]
    pub async fn multicast_set_var(
        &self,
        node: &Node,
        var: VarRef,
        value: &Value,
        group: Ipv6Addr,
    ) -> Result<()> {
        let target = SocketAddr::new(group.into(), self.inner.config.border_router.port());
        if !is_multicast(&group) {
            return Err(Error::Config(format!("{} is not a multicast address", group).into()).boxed());
        }
        let request = self.set_request(node, var, value)?.encode();

        let transport = self.inner.connection.transport();
        transport.set_multicast_hops(self.inner.config.multicast_hops)?;
        if let Some(interface) = self.inner.config.multicast_interface {
            transport.set_multicast_interface(interface)?;
        }

        for copy in 0..self.inner.config.multicast_send_count {
            if copy > 0 {
                tokio::time::sleep(MULTICAST_SEND_INTERVAL).await;
            }
            self.inner
                .connection
                .send(target, Command::SetMibRequest, &request)
                .await?;
        }
        Ok(())
    }

    fn set_request(&self, node: &Node, var: VarRef, value: &Value) -> Result<SetRequest> {
        let target = node.address;
        let mib = node.mib(var).ok_or_else(|| unknown_var(target, var))?;
        let slot = node.var(var).ok_or_else(|| unknown_var(target, var))?;
        if value.var_type() != slot.var_type {
            return Err(Error::status_from(target, Status::WrongType));
        }
        SetRequest::new(MibAddr::Id(mib.id), slot.index, value)
            .map_err(|status| Error::status_from(target, status))
    }

    /// Add a node, populated from the schema cache or else discovered.
    ///
    /// The node is returned locked. Nothing is added when discovery fails.
    #[instrument(skip(self), err, fields(jip.node = %address, jip.device_id = device_id))]
    pub async fn add_node(&self, address: SocketAddr, device_id: u32) -> Result<NodeGuard> {
        if self.inner.network.contains(address) {
            return Err(Error::DuplicateNode { address }.boxed());
        }
        let mut node = Node::new(address, device_id);
        let cached = self.inner.network.with_cache(|cache| cache.populate_node(&mut node));
        if !cached {
            self.discover_node(&mut node).await?;
        }
        self.inner.network.add_node(node).await
    }

    /// Remove a node, cancelling its trap subscriptions first.
    ///
    /// Unsubscribing is best-effort: a node that has already gone is removed
    /// all the same.
    #[instrument(skip(self), err, fields(jip.node = %address))]
    pub async fn remove_node(&self, address: SocketAddr) -> Result<NodeGuard> {
        let mut node = self
            .inner
            .network
            .remove_node(address)
            .await
            .ok_or_else(|| Error::UnknownNode { address }.boxed())?;
        let trapped: Vec<_> = node
            .var_refs()
            .filter(|var| {
                node.var(*var)
                    .is_some_and(|v| v.capability.trap().is_some())
            })
            .collect();
        for var in trapped {
            if let Err(e) = self.untrap_var(&mut node, var).await {
                tracing::debug!(target: "async_jip::client", { jip.node = %address, error = %e }, "untrap on removal failed");
            }
        }
        Ok(node)
    }

    /// Stop the monitor, the receive loop and wait for trap handlers.
    pub async fn shutdown(&self) {
        self.stop_monitor().await;
        self.inner.connection.shutdown().await;
    }
}

fn unknown_var(node: SocketAddr, var: VarRef) -> Box<Error> {
    Error::UnknownVar {
        node,
        mib: var.mib.to_string().into(),
        var: var.var.to_string().into(),
    }
    .boxed()
}
