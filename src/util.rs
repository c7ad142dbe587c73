//! Internal utilities.

use std::io;
use std::net::{Ipv6Addr, SocketAddr};

use socket2::{Domain, Protocol, SockRef, Socket, Type};
use tokio::net::UdpSocket;

/// Create and bind a UDP socket with proper IPv6 configuration.
///
/// For IPv6 sockets, sets `IPV6_V6ONLY = true` so that the socket never
/// sees IPv4-mapped addresses. `recv_buffer_size`, when given, is requested
/// from the kernel; the kernel may clamp it.
pub(crate) fn bind_udp_socket(
    addr: SocketAddr,
    recv_buffer_size: Option<usize>,
) -> io::Result<UdpSocket> {
    let domain = if addr.is_ipv6() {
        Domain::IPV6
    } else {
        Domain::IPV4
    };

    let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;

    if addr.is_ipv6() {
        socket.set_only_v6(true)?;
    }

    // Allow address reuse for quick restarts
    socket.set_reuse_address(true)?;

    if let Some(size) = recv_buffer_size {
        socket.set_recv_buffer_size(size)?;
    }

    // Set non-blocking before converting to tokio socket
    socket.set_nonblocking(true)?;

    socket.bind(&addr.into())?;

    UdpSocket::from_std(socket.into())
}

/// Bind an ephemeral socket of the same family as `target`.
pub(crate) fn bind_ephemeral_udp_socket(target: SocketAddr) -> io::Result<UdpSocket> {
    let bind_addr = if target.is_ipv6() {
        SocketAddr::new(Ipv6Addr::UNSPECIFIED.into(), 0)
    } else {
        SocketAddr::new(std::net::Ipv4Addr::UNSPECIFIED.into(), 0)
    };
    bind_udp_socket(bind_addr, None)
}

/// Hop limit for outgoing multicast datagrams.
pub(crate) fn set_multicast_hops(socket: &UdpSocket, hops: u32) -> io::Result<()> {
    SockRef::from(socket).set_multicast_hops_v6(hops)
}

/// Interface index for outgoing multicast datagrams. Zero lets the kernel pick.
pub(crate) fn set_multicast_interface(socket: &UdpSocket, index: u32) -> io::Result<()> {
    SockRef::from(socket).set_multicast_if_v6(index)
}

/// Whether `address` is an IPv6 multicast group.
pub(crate) fn is_multicast(address: &Ipv6Addr) -> bool {
    address.octets()[0] == 0xff
}
