//! IPv6-in-IPv4 tunnel transport.
//!
//! For networks whose gateway is only reachable over IPv4. Every datagram
//! carries a 19 byte prefix `{version = 1, length u16, IPv6 address}` where
//! `length` covers the address and the payload. Outbound the address is the
//! destination node, inbound it is the source node.

use std::net::{Ipv6Addr, SocketAddr, SocketAddrV4};
use std::sync::Arc;

use bytes::{BufMut, Bytes, BytesMut};
use tokio::net::UdpSocket;

use super::Transport;
use super::udp::RECV_BUFFER;
use crate::error::{Error, Result};
use crate::util::bind_ephemeral_udp_socket;
use crate::wire::DEFAULT_PORT;

/// Tunnel framing version.
pub const TUNNEL_VERSION: u8 = 1;

/// Size of the tunnel prefix.
pub const TUNNEL_HEADER_LEN: usize = 19;

/// Prefix `payload` with the tunnel header for `destination`.
pub fn encode_tunnel_frame(destination: Ipv6Addr, payload: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(TUNNEL_HEADER_LEN + payload.len());
    buf.put_u8(TUNNEL_VERSION);
    buf.put_u16((payload.len() + 16) as u16);
    buf.put_slice(&destination.octets());
    buf.put_slice(payload);
    buf.freeze()
}

/// Strip the tunnel header, returning the embedded address and the payload.
///
/// The payload is cut to the header's length; a frame shorter than its
/// header claims is rejected.
pub fn decode_tunnel_frame(mut frame: Bytes) -> Option<(Ipv6Addr, Bytes)> {
    if frame.len() < TUNNEL_HEADER_LEN || frame[0] != TUNNEL_VERSION {
        return None;
    }
    let payload_len = usize::from(u16::from_be_bytes([frame[1], frame[2]])).checked_sub(16)?;
    if frame.len() - TUNNEL_HEADER_LEN < payload_len {
        return None;
    }
    let mut octets = [0u8; 16];
    octets.copy_from_slice(&frame[3..TUNNEL_HEADER_LEN]);
    let mut payload = frame.split_off(TUNNEL_HEADER_LEN);
    payload.truncate(payload_len);
    Some((Ipv6Addr::from(octets), payload))
}

/// Tunnel to an IPv4 gateway.
#[derive(Clone)]
pub struct TunnelTransport {
    inner: Arc<TunnelInner>,
}

struct TunnelInner {
    socket: UdpSocket,
    gateway: SocketAddr,
    local_addr: SocketAddr,
}

impl TunnelTransport {
    pub async fn connect(gateway: SocketAddrV4) -> Result<Self> {
        let gateway = SocketAddr::V4(gateway);
        let network = |source| Error::Network {
            target: gateway,
            source,
        };
        let socket = bind_ephemeral_udp_socket(gateway).map_err(|e| network(e).boxed())?;
        let local_addr = socket.local_addr().map_err(|e| network(e).boxed())?;

        tracing::debug!(
            target: "async_jip::transport",
            { jip.gateway = %gateway, jip.local_addr = %local_addr },
            "IPv4 tunnel transport bound"
        );

        Ok(Self {
            inner: Arc::new(TunnelInner {
                socket,
                gateway,
                local_addr,
            }),
        })
    }
}

impl Transport for TunnelTransport {
    async fn send_to(&self, data: &[u8], target: SocketAddr) -> Result<()> {
        let destination = match target {
            SocketAddr::V6(v6) => *v6.ip(),
            SocketAddr::V4(v4) => v4.ip().to_ipv6_mapped(),
        };
        let frame = encode_tunnel_frame(destination, data);
        tracing::trace!(
            target: "async_jip::transport",
            { jip.target = %target, jip.gateway = %self.inner.gateway, jip.bytes = frame.len() },
            "tunnel send"
        );
        self.inner
            .socket
            .send_to(&frame, self.inner.gateway)
            .await
            .map_err(|source| Error::Network { target, source }.boxed())?;
        Ok(())
    }

    async fn recv_from(&self) -> Result<(Bytes, SocketAddr)> {
        loop {
            let mut buf = vec![0u8; RECV_BUFFER];
            let (len, from) = self.inner.socket.recv_from(&mut buf).await.map_err(|source| {
                Error::Network {
                    target: self.inner.gateway,
                    source,
                }
                .boxed()
            })?;
            if from != self.inner.gateway {
                tracing::debug!(target: "async_jip::transport", { jip.source = %from, jip.bytes = len }, "dropping datagram from outside the gateway");
                continue;
            }
            buf.truncate(len);
            match decode_tunnel_frame(Bytes::from(buf)) {
                Some((source, payload)) => {
                    return Ok((payload, SocketAddr::new(source.into(), DEFAULT_PORT)));
                }
                None => {
                    tracing::debug!(target: "async_jip::transport", { jip.bytes = len }, "dropping malformed tunnel frame");
                }
            }
        }
    }

    fn local_addr(&self) -> SocketAddr {
        self.inner.local_addr
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_layout() {
        let address: Ipv6Addr = "fd04::1".parse().unwrap();
        let frame = encode_tunnel_frame(address, &[0, 0x10, 7]);
        assert_eq!(frame.len(), TUNNEL_HEADER_LEN + 3);
        assert_eq!(&frame[..3], &[1, 0, 19]);
        assert_eq!(&frame[3..19], &address.octets());

        let (source, payload) = decode_tunnel_frame(frame).unwrap();
        assert_eq!(source, address);
        assert_eq!(&payload[..], &[0, 0x10, 7]);
    }

    #[test]
    fn rejects_short_or_foreign_frames() {
        assert!(decode_tunnel_frame(Bytes::from_static(&[1, 0, 16])).is_none());
        let mut frame = encode_tunnel_frame(Ipv6Addr::LOCALHOST, &[0]).to_vec();
        frame[0] = 2;
        assert!(decode_tunnel_frame(Bytes::from(frame)).is_none());
    }

    #[test]
    fn length_field_bounds_payload() {
        let address: Ipv6Addr = "fd04::1".parse().unwrap();
        let mut padded = encode_tunnel_frame(address, &[0, 0x11, 4]).to_vec();
        padded.extend_from_slice(&[0xaa, 0xbb]);
        let (_, payload) = decode_tunnel_frame(Bytes::from(padded)).unwrap();
        assert_eq!(&payload[..], &[0, 0x11, 4]);

        // Claims more than it carries
        let mut truncated = encode_tunnel_frame(address, &[0, 0x11, 4]).to_vec();
        truncated.pop();
        assert!(decode_tunnel_frame(Bytes::from(truncated)).is_none());

        // Length shorter than the address
        let mut short = encode_tunnel_frame(address, &[]).to_vec();
        short[2] = 15;
        assert!(decode_tunnel_frame(Bytes::from(short)).is_none());
    }

    #[tokio::test]
    async fn source_is_embedded_address() {
        let gateway = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let SocketAddr::V4(gateway_addr) = gateway.local_addr().unwrap() else {
            unreachable!()
        };
        let tunnel = TunnelTransport::connect(gateway_addr).await.unwrap();

        let node: Ipv6Addr = "fd04::7".parse().unwrap();
        tunnel
            .send_to(&[0, 0x14, 1], SocketAddr::new(node.into(), DEFAULT_PORT))
            .await
            .unwrap();
        let mut buf = [0u8; 64];
        let (len, from) = gateway.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[3..19], &node.octets());

        let reply = encode_tunnel_frame(node, &[0, 0x15, 1]);
        gateway.send_to(&reply, from).await.unwrap();
        let (payload, source) = tunnel.recv_from().await.unwrap();
        assert_eq!(&payload[..], &[0, 0x15, 1]);
        assert_eq!(source, SocketAddr::new(node.into(), DEFAULT_PORT));
        assert_eq!(len, TUNNEL_HEADER_LEN + 3);
    }

    #[tokio::test]
    async fn ignores_senders_other_than_gateway() {
        let gateway = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let SocketAddr::V4(gateway_addr) = gateway.local_addr().unwrap() else {
            unreachable!()
        };
        let tunnel = TunnelTransport::connect(gateway_addr).await.unwrap();
        let intruder = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let local = SocketAddr::from(([127, 0, 0, 1], tunnel.local_addr().port()));

        let node: Ipv6Addr = "fd04::7".parse().unwrap();
        intruder
            .send_to(&encode_tunnel_frame(node, &[0, 0x15, 9]), local)
            .await
            .unwrap();
        gateway
            .send_to(&encode_tunnel_frame(node, &[0, 0x15, 1]), local)
            .await
            .unwrap();

        let (payload, _) = tunnel.recv_from().await.unwrap();
        assert_eq!(&payload[..], &[0, 0x15, 1]);
    }
}
