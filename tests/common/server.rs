//! In-process JIP server for testing.
//!
//! Serves one node on an ephemeral loopback port. The node's address is
//! the server's own address, so requests sent to the node reach the server
//! and notifications come back from the node.

use std::net::{Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_jip::{Network, NodeGuard, Server};
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::fixtures;

/// A served node. Starts on creation and stops on drop.
pub struct TestServer {
    server: Server,
    address: SocketAddr,
    cancel: CancellationToken,
    _task: JoinHandle<()>,
}

impl TestServer {
    /// Serve a lamp named "Lamp".
    pub async fn lamp() -> Self {
        Self::with_device(fixtures::LAMP, Some("Lamp")).await
    }

    /// Serve a coordinator.
    pub async fn coordinator() -> Self {
        Self::with_device(fixtures::COORDINATOR, Some("Coordinator")).await
    }

    /// Serve a node of `device_id`, known from the test fixtures.
    pub async fn with_device(device_id: u32, name: Option<&str>) -> Self {
        let cancel = CancellationToken::new();
        let server = Server::builder()
            .bind("[::1]:0")
            .cancel(cancel.clone())
            .build()
            .await
            .expect("failed to build test server");
        server.network().with_cache(|cache| {
            cache.insert_node(fixtures::coordinator_schema());
            cache.insert_node(fixtures::lamp_schema());
        });

        let address = SocketAddr::new(Ipv6Addr::LOCALHOST.into(), server.local_addr().port());
        drop(
            server
                .node_add(address, device_id, name, Some("1.0.0"))
                .await
                .expect("failed to add test node"),
        );

        let running = server.clone();
        let task = tokio::spawn(async move {
            if let Err(e) = running.run().await {
                eprintln!("TestServer error: {}", e);
            }
        });

        Self {
            server,
            address,
            cancel,
            _task: task,
        }
    }

    /// Address of the served node.
    pub fn addr(&self) -> SocketAddr {
        self.address
    }

    pub fn server(&self) -> &Server {
        &self.server
    }

    pub fn network(&self) -> &Arc<Network> {
        self.server.network()
    }

    /// Lock the served node.
    pub async fn node(&self) -> NodeGuard {
        self.server
            .network()
            .lookup_node(self.address)
            .await
            .expect("served node missing")
    }

    /// Enable a variable, optionally giving it a value.
    pub async fn enable(&self, mib: &str, var: &str, value: Option<async_jip::Value>) {
        let mut node = self.node().await;
        let var = node.find_var(mib, var).expect("no such variable");
        let slot = node.var_mut(var).expect("no such variable");
        slot.enabled = true;
        if let Some(value) = value {
            slot.set_value(value).expect("value of wrong type");
        }
    }

    /// Stop serving. Called automatically on drop.
    pub fn stop(&self) {
        self.cancel.cancel();
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// A node that never answers and counts what it receives.
pub struct SilentNode {
    addr: SocketAddr,
    received: Arc<AtomicUsize>,
    _task: JoinHandle<()>,
}

impl SilentNode {
    pub async fn new() -> Self {
        let socket = UdpSocket::bind("[::1]:0").await.expect("failed to bind");
        let addr = socket.local_addr().expect("no local address");
        let received = Arc::new(AtomicUsize::new(0));
        let counter = received.clone();
        let task = tokio::spawn(async move {
            let mut buf = [0u8; 2048];
            while socket.recv_from(&mut buf).await.is_ok() {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });
        Self {
            addr,
            received,
            _task: task,
        }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Datagrams received so far.
    pub fn received(&self) -> usize {
        self.received.load(Ordering::SeqCst)
    }
}

impl Drop for SilentNode {
    fn drop(&mut self) {
        self._task.abort();
    }
}

/// Relays requests to a [`TestServer`], dropping the first `drop` of them.
///
/// Clients talk to the proxy's address as if it were the node.
pub struct LossyProxy {
    addr: SocketAddr,
    forwarded: Arc<AtomicUsize>,
    _task: JoinHandle<()>,
}

impl LossyProxy {
    pub async fn drop_first(upstream: SocketAddr, drop: usize) -> Self {
        let front = Arc::new(UdpSocket::bind("[::1]:0").await.expect("failed to bind"));
        let back = Arc::new(UdpSocket::bind("[::1]:0").await.expect("failed to bind"));
        let addr = front.local_addr().expect("no local address");
        let forwarded = Arc::new(AtomicUsize::new(0));
        let seen = forwarded.clone();

        let task = tokio::spawn(async move {
            let mut request = [0u8; 2048];
            let mut response = [0u8; 2048];
            let mut client = None;
            let mut count = 0;
            loop {
                tokio::select! {
                    Ok((len, from)) = front.recv_from(&mut request) => {
                        client = Some(from);
                        count += 1;
                        if count > drop {
                            seen.fetch_add(1, Ordering::SeqCst);
                            let _ = back.send_to(&request[..len], upstream).await;
                        }
                    }
                    Ok((len, _)) = back.recv_from(&mut response) => {
                        if let Some(client) = client {
                            let _ = front.send_to(&response[..len], client).await;
                        }
                    }
                }
            }
        });

        Self {
            addr,
            forwarded,
            _task: task,
        }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Requests passed on to the server.
    pub fn forwarded(&self) -> usize {
        self.forwarded.load(Ordering::SeqCst)
    }
}

impl Drop for LossyProxy {
    fn drop(&mut self) {
        self._task.abort();
    }
}
