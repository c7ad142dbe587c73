//! UDP transport implementation.

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use tokio::net::UdpSocket;

use super::Transport;
use crate::error::{Error, Result, UNKNOWN_TARGET};
use crate::util::{bind_udp_socket, set_multicast_hops, set_multicast_interface};

/// Receive buffer size. Larger than any packet so truncation is detectable.
pub(crate) const RECV_BUFFER: usize = 2048;

/// Unconnected IPv6 UDP socket shared by every node.
#[derive(Clone)]
pub struct UdpTransport {
    inner: Arc<UdpTransportInner>,
}

struct UdpTransportInner {
    socket: UdpSocket,
    local_addr: SocketAddr,
}

impl UdpTransport {
    /// Bind to `addr`. Port zero picks an ephemeral port.
    pub async fn bind(addr: SocketAddr) -> Result<Self> {
        let socket = bind_udp_socket(addr, None).map_err(|source| {
            Error::Network {
                target: addr,
                source,
            }
            .boxed()
        })?;
        let local_addr = socket.local_addr().map_err(|source| {
            Error::Network {
                target: addr,
                source,
            }
            .boxed()
        })?;

        tracing::debug!(target: "async_jip::transport", { jip.local_addr = %local_addr }, "UDP transport bound");

        Ok(Self {
            inner: Arc::new(UdpTransportInner { socket, local_addr }),
        })
    }
}

impl Transport for UdpTransport {
    async fn send_to(&self, data: &[u8], target: SocketAddr) -> Result<()> {
        tracing::trace!(target: "async_jip::transport", { jip.target = %target, jip.bytes = data.len() }, "UDP send");
        self.inner
            .socket
            .send_to(data, target)
            .await
            .map_err(|source| Error::Network { target, source }.boxed())?;
        Ok(())
    }

    async fn recv_from(&self) -> Result<(Bytes, SocketAddr)> {
        let mut buf = vec![0u8; RECV_BUFFER];
        let (len, source) = self.inner.socket.recv_from(&mut buf).await.map_err(|source| {
            Error::Network {
                target: UNKNOWN_TARGET,
                source,
            }
            .boxed()
        })?;
        buf.truncate(len);
        tracing::trace!(target: "async_jip::transport", { jip.source = %source, jip.bytes = len }, "UDP recv");
        Ok((Bytes::from(buf), source))
    }

    fn local_addr(&self) -> SocketAddr {
        self.inner.local_addr
    }

    fn set_multicast_hops(&self, hops: u32) -> Result<()> {
        set_multicast_hops(&self.inner.socket, hops).map_err(|source| {
            Error::Network {
                target: self.inner.local_addr,
                source,
            }
            .boxed()
        })
    }

    fn set_multicast_interface(&self, index: u32) -> Result<()> {
        set_multicast_interface(&self.inner.socket, index).map_err(|source| {
            Error::Network {
                target: self.inner.local_addr,
                source,
            }
            .boxed()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn datagrams_round_trip_over_loopback() {
        let a = UdpTransport::bind("[::1]:0".parse().unwrap()).await.unwrap();
        let b = UdpTransport::bind("[::1]:0".parse().unwrap()).await.unwrap();
        a.send_to(&[0, 0x10, 1], b.local_addr()).await.unwrap();
        let (data, source) = b.recv_from().await.unwrap();
        assert_eq!(&data[..], &[0, 0x10, 1]);
        assert_eq!(source, a.local_addr());
    }
}
