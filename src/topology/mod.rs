//! Network topology.
//!
//! The [`Network`] holds every known [`Node`] behind two lock levels:
//!
//! - a coarse lock guarding the node list, the schema cache and the border
//!   router address. It is a synchronous mutex and is never held across an
//!   `.await`.
//! - one asynchronous lock per node guarding the node's content. Node locks
//!   are only ever *tried* while the coarse lock is held, so a task waiting
//!   on a busy node never blocks lookups of other nodes.
//!
//! Every accessor returns the node locked as a [`NodeGuard`]; dropping the
//! guard unlocks it.

mod node;

pub use node::{
    Capability, Mib, Node, Provider, SLEEPING_DEVICE, Sink, TrapCallback, TrapRegistration, Var,
    VarRef,
};

use std::collections::VecDeque;
use std::net::{Ipv6Addr, SocketAddr};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::{OwnedMutexGuard, broadcast};

use crate::cache::SchemaCache;
use crate::error::{Error, Result};

/// Device ID filter matching every node.
pub const DEVICE_ID_ALL: u32 = 0xFFFF_FFFF;

/// Failed try-locks before a lookup backs off or a traversal skips a node.
const LOCK_ATTEMPTS: u32 = 10;

/// Back-off of a direct lookup after [`LOCK_ATTEMPTS`] failures.
const LOCK_BACKOFF: Duration = Duration::from_secs(1);

/// Capacity of the network event channel.
const EVENT_CAPACITY: usize = 64;

/// A locked node.
pub type NodeGuard = OwnedMutexGuard<Node>;

/// Kind of topology change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkEventKind {
    Join,
    Leave,
}

/// A node joined or left the network.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NetworkEvent {
    pub kind: NetworkEventKind,
    pub address: SocketAddr,
    pub device_id: u32,
}

struct NodeSlot {
    address: SocketAddr,
    device_id: u32,
    node: Arc<tokio::sync::Mutex<Node>>,
}

struct NetworkInner {
    nodes: Vec<NodeSlot>,
    cache: SchemaCache,
    border_router: Option<Ipv6Addr>,
}

/// The set of known nodes.
pub struct Network {
    inner: Mutex<NetworkInner>,
    events: broadcast::Sender<NetworkEvent>,
}

impl Default for Network {
    fn default() -> Self {
        Self::new()
    }
}

impl Network {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            inner: Mutex::new(NetworkInner {
                nodes: Vec::new(),
                cache: SchemaCache::default(),
                border_router: None,
            }),
            events,
        }
    }

    fn lock(&self) -> MutexGuard<'_, NetworkInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Number of nodes.
    pub fn len(&self) -> usize {
        self.lock().nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().nodes.is_empty()
    }

    pub fn contains(&self, address: SocketAddr) -> bool {
        self.lock().nodes.iter().any(|slot| slot.address == address)
    }

    /// Address of the border router, once known.
    pub fn border_router(&self) -> Option<Ipv6Addr> {
        self.lock().border_router
    }

    pub fn set_border_router(&self, address: Ipv6Addr) {
        let mut inner = self.lock();
        if inner.border_router != Some(address) {
            tracing::debug!(target: "async_jip::topology", { jip.border_router = %address }, "border router address set");
            inner.border_router = Some(address);
        }
    }

    /// Run `f` with the schema cache.
    pub fn with_cache<R>(&self, f: impl FnOnce(&mut SchemaCache) -> R) -> R {
        f(&mut self.lock().cache)
    }

    /// Receive join and leave events.
    pub fn subscribe(&self) -> broadcast::Receiver<NetworkEvent> {
        self.events.subscribe()
    }

    pub(crate) fn notify(&self, kind: NetworkEventKind, address: SocketAddr, device_id: u32) {
        tracing::debug!(
            target: "async_jip::topology",
            { jip.event = ?kind, jip.node = %address, jip.device_id = device_id },
            "network event"
        );
        // No receivers is fine.
        let _ = self.events.send(NetworkEvent {
            kind,
            address,
            device_id,
        });
    }

    fn try_lock(&self, address: SocketAddr) -> LockAttempt {
        let inner = self.lock();
        match inner.nodes.iter().find(|slot| slot.address == address) {
            None => LockAttempt::Missing,
            Some(slot) => match slot.node.clone().try_lock_owned() {
                Ok(guard) => LockAttempt::Locked(guard),
                Err(_) => LockAttempt::Busy,
            },
        }
    }

    /// Find the node at `address` and lock it.
    ///
    /// Waits for as long as the node is locked elsewhere, backing off for a
    /// second after every ten failed attempts. Returns `None` when no such
    /// node exists (or it is removed while waiting).
    pub async fn lookup_node(&self, address: SocketAddr) -> Option<NodeGuard> {
        let mut attempts = 0;
        loop {
            match self.try_lock(address) {
                LockAttempt::Locked(guard) => return Some(guard),
                LockAttempt::Missing => return None,
                LockAttempt::Busy => {
                    attempts += 1;
                    if attempts > LOCK_ATTEMPTS {
                        tracing::debug!(target: "async_jip::topology", { jip.node = %address }, "node lock contended, backing off");
                        tokio::time::sleep(LOCK_BACKOFF).await;
                        attempts = 0;
                    }
                    tokio::task::yield_now().await;
                }
            }
        }
    }

    /// Like [`lookup_node`](Self::lookup_node) but gives up after ten
    /// failed attempts.
    pub async fn try_lookup_node(&self, address: SocketAddr) -> Option<NodeGuard> {
        for _ in 0..LOCK_ATTEMPTS {
            match self.try_lock(address) {
                LockAttempt::Locked(guard) => return Some(guard),
                LockAttempt::Missing => return None,
                LockAttempt::Busy => tokio::task::yield_now().await,
            }
        }
        tracing::debug!(target: "async_jip::topology", { jip.node = %address }, "skipping contended node");
        None
    }

    /// Insert a node and return it locked.
    ///
    /// Fails with [`Error::DuplicateNode`] if the address is taken.
    pub async fn add_node(&self, node: Node) -> Result<NodeGuard> {
        let address = node.address;
        let device_id = node.device_id;
        let guard = Arc::new(tokio::sync::Mutex::new(node)).lock_owned().await;
        let cell = OwnedMutexGuard::mutex(&guard).clone();

        let mut inner = self.lock();
        if inner.nodes.iter().any(|slot| slot.address == address) {
            return Err(Error::DuplicateNode { address }.boxed());
        }
        inner.nodes.push(NodeSlot {
            address,
            device_id,
            node: cell,
        });
        tracing::debug!(
            target: "async_jip::topology",
            { jip.node = %address, jip.device_id = device_id, jip.nodes = inner.nodes.len() },
            "node added"
        );
        Ok(guard)
    }

    /// Move the node at `from` to `to` in the node list.
    ///
    /// The node's own `address` field is left to the caller, who normally
    /// holds its lock. Fails with [`Error::DuplicateNode`] if `to` is taken
    /// and [`Error::UnknownNode`] if nothing lives at `from`.
    pub fn rekey_node(&self, from: SocketAddr, to: SocketAddr) -> Result<()> {
        let mut inner = self.lock();
        if inner.nodes.iter().any(|slot| slot.address == to) {
            return Err(Error::DuplicateNode { address: to }.boxed());
        }
        let slot = inner
            .nodes
            .iter_mut()
            .find(|slot| slot.address == from)
            .ok_or_else(|| Error::UnknownNode { address: from }.boxed())?;
        slot.address = to;
        tracing::debug!(target: "async_jip::topology", { jip.from = %from, jip.to = %to }, "node readdressed");
        Ok(())
    }

    /// Detach the node at `address` and return it locked.
    pub async fn remove_node(&self, address: SocketAddr) -> Option<NodeGuard> {
        let guard = self.lookup_node(address).await?;
        let mut inner = self.lock();
        let position = inner
            .nodes
            .iter()
            .position(|slot| Arc::ptr_eq(&slot.node, OwnedMutexGuard::mutex(&guard)))?;
        inner.nodes.remove(position);
        tracing::debug!(
            target: "async_jip::topology",
            { jip.node = %address, jip.nodes = inner.nodes.len() },
            "node removed"
        );
        Some(guard)
    }

    /// Addresses of every node whose device ID equals `device_filter`, or of
    /// every node for [`DEVICE_ID_ALL`].
    pub fn node_addresses(&self, device_filter: u32) -> Vec<SocketAddr> {
        self.lock()
            .nodes
            .iter()
            .filter(|slot| device_filter == DEVICE_ID_ALL || slot.device_id == device_filter)
            .map(|slot| slot.address)
            .collect()
    }

    /// Address and device ID of every node, without locking any.
    pub fn members(&self) -> Vec<(SocketAddr, u32)> {
        self.lock()
            .nodes
            .iter()
            .map(|slot| (slot.address, slot.device_id))
            .collect()
    }

    /// Best-effort traversal over a snapshot of the node list.
    pub fn cursor(&self) -> NodeCursor<'_> {
        NodeCursor {
            network: self,
            pending: self.node_addresses(DEVICE_ID_ALL).into(),
        }
    }

    /// Render the whole tree.
    pub async fn describe(&self) -> String {
        let mut text = String::new();
        if let Some(border_router) = self.border_router() {
            text.push_str(&format!("Border router {}\n", border_router));
        }
        let mut cursor = self.cursor();
        while let Some(node) = cursor.next().await {
            text.push_str(&node.to_string());
        }
        text
    }
}

enum LockAttempt {
    Locked(NodeGuard),
    Busy,
    Missing,
}

/// Visits every node present when the cursor was created.
///
/// Nodes removed since are skipped, as are nodes that stay locked for ten
/// attempts.
pub struct NodeCursor<'a> {
    network: &'a Network,
    pending: VecDeque<SocketAddr>,
}

impl NodeCursor<'_> {
    pub async fn next(&mut self) -> Option<NodeGuard> {
        while let Some(address) = self.pending.pop_front() {
            if let Some(guard) = self.network.try_lookup_node(address).await {
                return Some(guard);
            }
        }
        None
    }
}
