//! JIP server.
//!
//! A [`Server`] answers JIP requests on behalf of any number of nodes it
//! serves. Each served node is an ordinary [`Node`] in the server's
//! [`Network`]; a request is routed to the node whose address it was sent
//! to, or to every node that joined the multicast group it was sent to.
//!
//! Variables are plain values. Attach a [`Capability`](crate::Capability) to
//! refresh a value before it is read or to act on a committed write.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use async_jip::server::Server;
//! use async_jip::{Capability, Node, Status, VarRef};
//!
//! # async fn example() -> async_jip::Result<()> {
//! let server = Server::builder().bind("[::]:1873").build().await?;
//! async_jip::persist::load_definitions(server.network(), "definitions.json")?;
//!
//! let mut node = server
//!     .node_add("[fd04::10]:1873".parse().unwrap(), 0x0810_0002, Some("Lamp"), Some("1.0"))
//!     .await?;
//! if let Some(mode) = node.find_var("BulbControl", "Mode") {
//!     let var = node.var_mut(mode).unwrap();
//!     var.enabled = true;
//!     var.capability = Capability::Sink(Arc::new(|node: &mut Node, var: VarRef, _| {
//!         println!("mode is now {:?}", node.var(var).and_then(|v| v.value.clone()));
//!         Status::Ok
//!     }));
//! }
//! drop(node);
//!
//! server.run().await
//! # }
//! ```

mod dispatch;
mod groups;

pub use dispatch::{Dispatched, Notification, dispatch};
pub use groups::{GROUPS_MIB_ID, GroupTable, MAX_GROUPS, compress, expand};

use std::io::IoSliceMut;
use std::net::{IpAddr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use bytes::Bytes;
use quinn_udp::{RecvMeta, Transmit, UdpSockRef, UdpSocketState};
use tokio::net::UdpSocket;
use tokio::sync::{Semaphore, broadcast};
use tokio_util::sync::CancellationToken;
use tracing::instrument;

use crate::error::{Error, Result, Status};
use crate::topology::{Network, NetworkEvent, NetworkEventKind, Node, NodeGuard, VarRef};
use crate::util::{bind_udp_socket, is_multicast};
use crate::wire::{Command, Header, Value, decode_packet, encode_packet};

use groups::Membership;

/// MIB ID of the node information MIB every node carries.
pub const NODE_MIB_ID: u32 = 0xffff_ff00;

/// Index of the descriptive name in the node information MIB.
const VAR_NAME: u8 = 1;

/// Index of the software version in the node information MIB.
const VAR_VERSION: u8 = 2;

/// Receive buffer, large enough for any datagram.
const RECV_BUFFER_LEN: usize = 65535;

/// Builder for [`Server`].
///
/// Defaults:
/// - Bind address: `[::]:1873`
/// - Max concurrent requests: 64
/// - Receive buffer size: kernel default
/// - Multicast interface: 0 (kernel's choice)
/// - A fresh, empty [`Network`]
pub struct ServerBuilder {
    bind_addr: String,
    max_concurrent_requests: Option<usize>,
    recv_buffer_size: Option<usize>,
    multicast_interface: u32,
    network: Option<Arc<Network>>,
    cancel: Option<CancellationToken>,
}

impl Default for ServerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ServerBuilder {
    pub fn new() -> Self {
        Self {
            bind_addr: "[::]:1873".to_string(),
            max_concurrent_requests: Some(64),
            recv_buffer_size: None,
            multicast_interface: 0,
            network: None,
            cancel: None,
        }
    }

    /// Set the UDP bind address.
    pub fn bind(mut self, addr: impl Into<String>) -> Self {
        self.bind_addr = addr.into();
        self
    }

    /// Limit how many requests are handled at once. `None` removes the
    /// limit.
    pub fn max_concurrent_requests(mut self, limit: Option<usize>) -> Self {
        self.max_concurrent_requests = limit;
        self
    }

    /// Request a socket receive buffer of this size from the kernel.
    pub fn recv_buffer_size(mut self, size: Option<usize>) -> Self {
        self.recv_buffer_size = size;
        self
    }

    /// Interface on which nodes join multicast groups.
    pub fn multicast_interface(mut self, index: u32) -> Self {
        self.multicast_interface = index;
        self
    }

    /// Serve nodes of an existing network, sharing its schema cache.
    pub fn network(mut self, network: Arc<Network>) -> Self {
        self.network = Some(network);
        self
    }

    /// Use an external cancellation token to stop [`Server::run`].
    pub fn cancel(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    /// Bind the socket and create the server.
    pub async fn build(self) -> Result<Server> {
        let bind_addr: SocketAddr = self.bind_addr.parse().map_err(|_| {
            Error::Config(format!("invalid bind address: {}", self.bind_addr).into()).boxed()
        })?;
        if self.max_concurrent_requests == Some(0) {
            return Err(Error::Config("max_concurrent_requests must be non-zero".into()).boxed());
        }

        let network_error = |e| {
            Error::Network {
                target: bind_addr,
                source: e,
            }
            .boxed()
        };
        let socket = bind_udp_socket(bind_addr, self.recv_buffer_size).map_err(network_error)?;
        let local_addr = socket.local_addr().map_err(network_error)?;
        let socket_state = UdpSocketState::new(UdpSockRef::from(&socket)).map_err(network_error)?;
        let socket = Arc::new(socket);

        tracing::info!(target: "async_jip::server", { jip.local_addr = %local_addr }, "server bound");

        Ok(Server {
            inner: Arc::new(ServerInner {
                membership: Arc::new(Membership::new(socket.clone(), self.multicast_interface)),
                socket,
                socket_state,
                local_addr,
                network: self.network.unwrap_or_default(),
                concurrency_limit: self
                    .max_concurrent_requests
                    .map(|n| Arc::new(Semaphore::new(n))),
                cancel: self.cancel.unwrap_or_default(),
                invalid_packets: AtomicU32::new(0),
                unroutable_packets: AtomicU32::new(0),
            }),
        })
    }
}

struct ServerInner {
    socket: Arc<UdpSocket>,
    socket_state: UdpSocketState,
    local_addr: SocketAddr,
    network: Arc<Network>,
    membership: Arc<Membership>,
    concurrency_limit: Option<Arc<Semaphore>>,
    cancel: CancellationToken,
    invalid_packets: AtomicU32,
    unroutable_packets: AtomicU32,
}

/// Serves JIP nodes over UDP.
///
/// Cheap to clone; clones share the socket and the network.
#[derive(Clone)]
pub struct Server {
    inner: Arc<ServerInner>,
}

impl Server {
    pub fn builder() -> ServerBuilder {
        ServerBuilder::new()
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.inner.local_addr
    }

    /// The served nodes.
    pub fn network(&self) -> &Arc<Network> {
        &self.inner.network
    }

    /// Receive join and leave events for served nodes.
    pub fn subscribe(&self) -> broadcast::Receiver<NetworkEvent> {
        self.inner.network.subscribe()
    }

    /// Token that stops [`run`](Self::run) when cancelled.
    pub fn cancel(&self) -> CancellationToken {
        self.inner.cancel.clone()
    }

    /// Packets dropped because they did not decode.
    pub fn invalid_packets(&self) -> u32 {
        self.inner.invalid_packets.load(Ordering::Relaxed)
    }

    /// Packets dropped because no served node matched their destination.
    pub fn unroutable_packets(&self) -> u32 {
        self.inner.unroutable_packets.load(Ordering::Relaxed)
    }

    /// Start serving a node.
    ///
    /// The node's MIBs come from the schema cache; a device type that is not
    /// cached fails with [`Status::BadDeviceId`]. Every variable starts
    /// disabled except the descriptive name and version of the node
    /// information MIB, set from `name` and `version`, and the groups MIB.
    /// Emits a join event and returns the node locked.
    #[instrument(skip(self), err, fields(jip.node = %address, jip.device_id = device_id))]
    pub async fn node_add(
        &self,
        address: SocketAddr,
        device_id: u32,
        name: Option<&str>,
        version: Option<&str>,
    ) -> Result<NodeGuard> {
        let mut node = Node::new(address, device_id);
        if !self
            .inner
            .network
            .with_cache(|cache| cache.populate_node(&mut node))
        {
            return Err(Error::status_from(address, Status::BadDeviceId));
        }
        for var in node.mibs.iter_mut().flat_map(|mib| mib.vars.iter_mut()) {
            var.enabled = false;
        }
        for (index, text) in [(VAR_NAME, name), (VAR_VERSION, version)] {
            let Some(text) = text else { continue };
            let Some(var) = node.find_var_id(NODE_MIB_ID, index) else {
                continue;
            };
            let slot = node.var_mut(var).ok_or_else(|| Error::status_from(address, Status::Failed))?;
            slot.set_value(Value::from(text))
                .map_err(|_| Error::status_from(address, Status::Failed))?;
            slot.enabled = true;
        }
        groups::install(&mut node, self.inner.membership.clone());

        let guard = self.inner.network.add_node(node).await?;
        self.inner
            .network
            .notify(NetworkEventKind::Join, address, device_id);
        Ok(guard)
    }

    /// Stop serving a node.
    ///
    /// The node leaves its multicast groups and a leave event is emitted.
    /// Returns the detached node locked.
    #[instrument(skip(self), err, fields(jip.node = %address))]
    pub async fn node_remove(&self, address: SocketAddr) -> Result<NodeGuard> {
        let mut node = self
            .inner
            .network
            .remove_node(address)
            .await
            .ok_or_else(|| Error::UnknownNode { address }.boxed())?;
        let status = groups::leave_all(&mut node, &self.inner.membership);
        if !status.is_ok() {
            tracing::debug!(target: "async_jip::server", { jip.node = %address, jip.status = %status }, "leaving groups failed");
        }
        self.inner
            .network
            .notify(NetworkEventKind::Leave, address, node.device_id);
        Ok(node)
    }

    /// Make `node` a member of a multicast group.
    pub fn node_group_join(&self, node: &mut Node, group: Ipv6Addr) -> Result<()> {
        match groups::join_group(node, &self.inner.membership, group) {
            Status::Ok => Ok(()),
            status => Err(Error::status_from(node.address, status)),
        }
    }

    /// Remove `node` from a multicast group it joined.
    pub fn node_group_leave(&self, node: &mut Node, group: Ipv6Addr) -> Result<()> {
        match groups::leave_group(node, &self.inner.membership, group) {
            Status::Ok => Ok(()),
            status => Err(Error::status_from(node.address, status)),
        }
    }

    /// Groups `node` is a member of.
    pub fn node_groups(node: &Node) -> Vec<Ipv6Addr> {
        node.groups.iter().flat_map(GroupTable::groups).collect()
    }

    /// Send the current value of `var` to its trap subscribers.
    ///
    /// Writes received over the network notify subscribers on their own;
    /// call this after changing a value locally.
    pub async fn notify_var(&self, node: &Node, var: VarRef) {
        let source = node.address.ip();
        for notification in dispatch::notifications(node, var) {
            self.send_notification(&notification, source).await;
        }
    }

    /// Run the server until the cancellation token fires.
    ///
    /// Requests are handled concurrently up to the configured limit.
    pub async fn run(&self) -> Result<()> {
        let mut buf = vec![0u8; RECV_BUFFER_LEN];

        loop {
            let recv_meta = tokio::select! {
                result = self.recv_packet(&mut buf) => result?,
                _ = self.inner.cancel.cancelled() => {
                    tracing::info!(target: "async_jip::server", "server shutdown requested");
                    return Ok(());
                }
            };

            let data = Bytes::copy_from_slice(&buf[..recv_meta.len]);
            let server = self.clone();

            let permit = match &self.inner.concurrency_limit {
                Some(sem) => match sem.clone().acquire_owned().await {
                    Ok(permit) => Some(permit),
                    Err(_) => return Ok(()),
                },
                None => None,
            };

            tokio::spawn(async move {
                server
                    .handle_packet(data, recv_meta.addr, recv_meta.dst_ip)
                    .await;
                drop(permit);
            });
        }
    }

    async fn recv_packet(&self, buf: &mut [u8]) -> Result<RecvMeta> {
        let mut iov = [IoSliceMut::new(buf)];
        let mut meta = [RecvMeta::default()];

        loop {
            self.inner
                .socket
                .readable()
                .await
                .map_err(|e| Error::Network {
                    target: self.inner.local_addr,
                    source: e,
                })?;

            let result = self.inner.socket.try_io(tokio::io::Interest::READABLE, || {
                let sref = UdpSockRef::from(&*self.inner.socket);
                self.inner.socket_state.recv(sref, &mut iov, &mut meta)
            });

            match result {
                Ok(n) if n > 0 => return Ok(meta[0]),
                Ok(_) => continue,
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => continue,
                Err(e) => {
                    return Err(Error::Network {
                        target: self.inner.local_addr,
                        source: e,
                    }
                    .boxed());
                }
            }
        }
    }

    async fn send_to(
        &self,
        data: &[u8],
        destination: SocketAddr,
        src_ip: Option<IpAddr>,
    ) -> std::io::Result<()> {
        let transmit = Transmit {
            destination,
            ecn: None,
            contents: data,
            segment_size: None,
            src_ip,
        };

        loop {
            self.inner.socket.writable().await?;

            let result = self.inner.socket.try_io(tokio::io::Interest::WRITABLE, || {
                let sref = UdpSockRef::from(&*self.inner.socket);
                self.inner.socket_state.try_send(sref, &transmit)
            });

            match result {
                Ok(()) => return Ok(()),
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => continue,
                Err(e) => return Err(e),
            }
        }
    }

    async fn send_notification(&self, notification: &Notification, source: IpAddr) {
        let packet = encode_packet(
            Header::new(Command::TrapNotify, notification.handle),
            &notification.body,
        );
        if let Err(e) = self
            .send_to(&packet, notification.subscriber, Some(source))
            .await
        {
            tracing::warn!(target: "async_jip::server", { jip.subscriber = %notification.subscriber, error = %e }, "failed to send trap notification");
        }
    }

    /// Served nodes a packet sent to `destination` is for.
    ///
    /// Without destination information only a server with a single node
    /// can route.
    fn targets(&self, destination: Option<IpAddr>) -> Vec<SocketAddr> {
        match destination {
            Some(IpAddr::V6(group)) if is_multicast(&group) => self.inner.membership.members(&group),
            Some(ip) => self
                .inner
                .network
                .node_addresses(crate::topology::DEVICE_ID_ALL)
                .into_iter()
                .filter(|address| address.ip() == ip)
                .collect(),
            None => {
                let all = self
                    .inner
                    .network
                    .node_addresses(crate::topology::DEVICE_ID_ALL);
                if all.len() == 1 { all } else { Vec::new() }
            }
        }
    }

    /// Route one received datagram and answer it.
    ///
    /// `dst_ip` is the address the datagram was sent to, as reported by the
    /// kernel.
    async fn handle_packet(&self, data: Bytes, source: SocketAddr, dst_ip: Option<IpAddr>) {
        let (header, body) = match decode_packet(data, source) {
            Ok(packet) => packet,
            Err(e) => {
                self.inner.invalid_packets.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(target: "async_jip::server", { jip.source = %source, error = %e }, "dropping invalid packet");
                return;
            }
        };

        let destination = dst_ip.map(|ip| match ip {
            IpAddr::V4(v4) => IpAddr::V6(v4.to_ipv6_mapped()),
            v6 => v6,
        });
        let destination_v6 = match destination {
            Some(IpAddr::V6(ip)) => Some(ip),
            _ => None,
        };
        let multicast = destination_v6.is_some_and(|ip| is_multicast(&ip));

        let targets = self.targets(destination);
        if targets.is_empty() {
            self.inner.unroutable_packets.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(
                target: "async_jip::server",
                { jip.source = %source, jip.destination = ?destination, jip.command = %header.command },
                "no served node for destination"
            );
            return;
        }

        for address in targets {
            let Some(mut node) = self.inner.network.lookup_node(address).await else {
                continue;
            };
            tracing::trace!(
                target: "async_jip::server",
                { jip.source = %source, jip.node = %address, jip.command = %header.command, jip.handle = header.handle },
                "request"
            );
            let dispatched = dispatch(&mut node, header.command, body.clone(), source, destination_v6);
            drop(node);

            if let Some((command, reply)) = dispatched.reply
                && !multicast
            {
                let packet = encode_packet(Header::new(command, header.handle), &reply);
                if let Err(e) = self.send_to(&packet, source, dst_ip).await {
                    tracing::warn!(target: "async_jip::server", { jip.source = %source, error = %e }, "failed to send response");
                }
            }
            for notification in &dispatched.notifications {
                self.send_notification(notification, address.ip()).await;
            }
        }
    }
}
