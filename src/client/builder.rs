//! Client builder.
//!
//! This module provides the [`ClientBuilder`] type, the entry point for
//! constructing JIP clients over plain UDP or through an IPv4 tunnel.

use std::net::{IpAddr, Ipv6Addr, SocketAddr, SocketAddrV4, ToSocketAddrs};
use std::time::Duration;

use crate::client::retry::Retry;
use crate::client::{
    ClientConfig, DEFAULT_COORDINATOR_DEVICE_ID, DEFAULT_MAX_TRAP_TASKS, DEFAULT_MULTICAST_HOPS,
    DEFAULT_MULTICAST_SEND_COUNT, DEFAULT_SLEEPY_TIMEOUT, DEFAULT_TABLE_PAGE_SIZE, DEFAULT_TIMEOUT,
};
use crate::error::{Error, Result};
use crate::transport::{TunnelTransport, UdpTransport};
use crate::wire::DEFAULT_PORT;

use super::Client;

/// Builder for constructing JIP clients.
///
/// # Example
///
/// ```rust,no_run
/// use async_jip::{ClientBuilder, Retry};
/// use std::time::Duration;
///
/// # async fn example() -> async_jip::Result<()> {
/// // Border router learned from the first response
/// let client = ClientBuilder::new().connect().await?;
///
/// // Known border router, patient with sleeping nodes
/// let client = ClientBuilder::new()
///     .border_router("fd04:bd3:80e8:2::1")
///     .sleepy_timeout(Duration::from_secs(15))
///     .connect()
///     .await?;
///
/// // Through an IPv4 gateway
/// let client = ClientBuilder::new()
///     .border_router("fd04:bd3:80e8:2::1")
///     .connect_tunnel("192.168.1.20:1873")
///     .await?;
/// # Ok(())
/// # }
/// ```
pub struct ClientBuilder {
    border_router: Option<String>,
    bind: Option<String>,
    timeout: Duration,
    sleepy_timeout: Duration,
    retry: Retry,
    multicast_send_count: u32,
    multicast_hops: u32,
    multicast_interface: Option<u32>,
    coordinator_device_id: u32,
    table_page_size: u8,
    max_trap_tasks: usize,
}

impl Default for ClientBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ClientBuilder {
    pub fn new() -> Self {
        Self {
            border_router: None,
            bind: None,
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

    /// Set the border router address (default: learned from the first
    /// response to a request sent to `[::]`).
    ///
    /// Accepts a bare IPv6 address, which gets port 1873, or an
    /// `[address]:port` pair.
    pub fn border_router(mut self, address: impl Into<String>) -> Self {
        self.border_router = Some(address.into());
        self
    }

    /// Set the local address to bind (default: `[::]:0`). UDP only.
    pub fn bind(mut self, address: impl Into<String>) -> Self {
        self.bind = Some(address.into());
        self
    }

    /// Set the per-send wait for always-on nodes (default: 500 ms).
    ///
    /// The total time for a request may be `timeout * total_sends` plus any
    /// backoff.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set the per-send wait for sleeping nodes (default: 8 s).
    ///
    /// Applies to nodes whose device ID carries
    /// [`SLEEPING_DEVICE`](crate::SLEEPING_DEVICE).
    pub fn sleepy_timeout(mut self, timeout: Duration) -> Self {
        self.sleepy_timeout = timeout;
        self
    }

    /// Set the retransmission policy (default: 3 sends, no backoff).
    ///
    /// # Example
    ///
    /// ```rust
    /// use async_jip::{ClientBuilder, Retry};
    /// use std::time::Duration;
    ///
    /// // Single send
    /// let builder = ClientBuilder::new().retry(Retry::none());
    ///
    /// // Exponential backoff with jitter
    /// let builder = ClientBuilder::new()
    ///     .retry(Retry::exponential(4).max_delay(Duration::from_secs(2)).jitter(0.25));
    /// ```
    pub fn retry(mut self, retry: impl Into<Retry>) -> Self {
        self.retry = retry.into();
        self
    }

    /// Set how many copies of a multicast request go out (default: 2).
    pub fn multicast_send_count(mut self, count: u32) -> Self {
        self.multicast_send_count = count;
        self
    }

    /// Set the multicast hop limit (default: 2).
    pub fn multicast_hops(mut self, hops: u32) -> Self {
        self.multicast_hops = hops;
        self
    }

    /// Send multicast through the interface with this index (default: the
    /// system's choice).
    pub fn multicast_interface(mut self, index: u32) -> Self {
        self.multicast_interface = Some(index);
        self
    }

    /// Set the device ID assumed for the coordinator (default: 0x08010001).
    pub fn coordinator_device_id(mut self, device_id: u32) -> Self {
        self.coordinator_device_id = device_id;
        self
    }

    /// Set the table rows requested per GET (default: 1).
    ///
    /// Larger pages speed up big tables on nodes with room in their
    /// response buffer.
    pub fn table_page_size(mut self, rows: u8) -> Self {
        self.table_page_size = rows;
        self
    }

    /// Set how many trap notifications are handled at once (default: 64).
    pub fn max_trap_tasks(mut self, limit: usize) -> Self {
        self.max_trap_tasks = limit;
        self
    }

    fn validate(&self) -> Result<()> {
        if self.timeout.is_zero() || self.sleepy_timeout.is_zero() {
            return Err(Error::Config("timeouts must be non-zero".into()).boxed());
        }
        if self.table_page_size == 0 {
            return Err(Error::Config("table page size must be at least 1".into()).boxed());
        }
        if self.max_trap_tasks == 0 {
            return Err(Error::Config("at least one trap task is required".into()).boxed());
        }
        Ok(())
    }

    fn resolve_border_router(&self) -> Result<SocketAddr> {
        let Some(address) = &self.border_router else {
            return Ok(SocketAddr::new(Ipv6Addr::UNSPECIFIED.into(), DEFAULT_PORT));
        };
        if let Ok(ip) = address.parse::<Ipv6Addr>() {
            return Ok(SocketAddr::new(ip.into(), DEFAULT_PORT));
        }
        let resolved = resolve(address)?;
        if !resolved.is_ipv6() {
            return Err(Error::Config(
                format!("border router '{}' is not an IPv6 address", address).into(),
            )
            .boxed());
        }
        Ok(resolved)
    }

    fn build_config(&self) -> Result<ClientConfig> {
        self.validate()?;
        Ok(ClientConfig {
            border_router: self.resolve_border_router()?,
            timeout: self.timeout,
            sleepy_timeout: self.sleepy_timeout,
            retry: self.retry.clone(),
            multicast_send_count: self.multicast_send_count,
            multicast_hops: self.multicast_hops,
            multicast_interface: self.multicast_interface,
            coordinator_device_id: self.coordinator_device_id,
            table_page_size: self.table_page_size,
            max_trap_tasks: self.max_trap_tasks,
        })
    }

    /// Bind a UDP socket and start the client.
    pub async fn connect(self) -> Result<Client<UdpTransport>> {
        let config = self.build_config()?;
        let bind = match &self.bind {
            Some(address) => resolve(address)?,
            None => SocketAddr::new(Ipv6Addr::UNSPECIFIED.into(), 0),
        };
        let transport = UdpTransport::bind(bind).await?;
        tracing::debug!(
            target: "async_jip::client",
            { jip.local_addr = %transport_addr(&transport), jip.border_router = %config.border_router },
            "client started"
        );
        Ok(Client::new(transport, config))
    }

    /// Start the client through an IPv4 tunnel gateway.
    pub async fn connect_tunnel(self, gateway: impl Into<String>) -> Result<Client<TunnelTransport>> {
        let config = self.build_config()?;
        let gateway = gateway.into();
        let resolved = resolve(&gateway)?;
        let gateway = match resolved {
            SocketAddr::V4(v4) => v4,
            SocketAddr::V6(v6) => match v6.ip().to_ipv4_mapped() {
                Some(v4) => SocketAddrV4::new(v4, v6.port()),
                None => {
                    return Err(Error::Config(
                        format!("tunnel gateway '{}' is not an IPv4 address", gateway).into(),
                    )
                    .boxed());
                }
            },
        };
        let transport = TunnelTransport::connect(gateway).await?;
        Ok(Client::new(transport, config))
    }
}

fn transport_addr(transport: &UdpTransport) -> SocketAddr {
    use crate::transport::Transport;
    transport.local_addr()
}

/// Resolve `address` to its first socket address.
fn resolve(address: &str) -> Result<SocketAddr> {
    if let Ok(ip) = address.parse::<IpAddr>() {
        return Ok(SocketAddr::new(ip, DEFAULT_PORT));
    }
    address
        .to_socket_addrs()
        .map_err(|e| {
            Error::Config(format!("could not resolve address '{}': {}", address, e).into()).boxed()
        })?
        .next()
        .ok_or_else(|| {
            Error::Config(format!("could not resolve address '{}'", address).into()).boxed()
        })
}
