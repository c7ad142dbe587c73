//! Transport layer abstraction.
//!
//! Provides the datagram-level [`Transport`] trait, its UDP and IPv4-tunnel
//! implementations, and the [`Connection`] that runs the receive loop and
//! matches responses to requests.

mod connection;
mod tunnel;
mod udp;

#[cfg(any(test, feature = "testing"))]
mod mock;

pub use connection::*;
pub use tunnel::*;
pub use udp::*;

#[cfg(any(test, feature = "testing"))]
pub use mock::*;

use std::future::Future;
use std::net::SocketAddr;

use bytes::Bytes;

use crate::error::Result;

/// Datagram transport.
///
/// # Clone Requirement
///
/// The receive loop owns a clone of the transport while callers keep
/// sending through theirs. All implementations use `Arc` internally, making
/// clone cheap.
pub trait Transport: Send + Sync + Clone + 'static {
    /// Send one datagram to `target`.
    fn send_to(&self, data: &[u8], target: SocketAddr) -> impl Future<Output = Result<()>> + Send;

    /// Wait for the next datagram.
    ///
    /// Returns the payload and the address of the node that sent it.
    fn recv_from(&self) -> impl Future<Output = Result<(Bytes, SocketAddr)>> + Send;

    /// Local bind address.
    fn local_addr(&self) -> SocketAddr;

    /// Hop limit for multicast sends. Transports without multicast ignore it.
    fn set_multicast_hops(&self, _hops: u32) -> Result<()> {
        Ok(())
    }

    /// Outgoing interface for multicast sends. Zero means any.
    fn set_multicast_interface(&self, _index: u32) -> Result<()> {
        Ok(())
    }
}
