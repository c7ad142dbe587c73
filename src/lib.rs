//! # async-jip
//!
//! Async client and server for JIP, the request/response management
//! protocol of low-power IPv6 mesh networks.
//!
//! ## Features
//!
//! - Client: network discovery, variable GET/SET including paged tables,
//!   multicast SET, trap subscriptions and a background network monitor
//! - Server: host any number of nodes, answer requests on their behalf,
//!   multicast group membership and trap notifications
//! - Async-first API built on Tokio
//! - Schema cache so nodes of a known device type join without queries
//! - JSON persistence of definitions and networks
//! - UDP over IPv6, or an IPv4 tunnel to a gateway
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use async_jip::{Client, DEVICE_ID_ALL};
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> async_jip::Result<()> {
//!     let client = Client::builder()
//!         .border_router("fd04:bd3:80e8:2::1")
//!         .timeout(Duration::from_millis(500))
//!         .connect()
//!         .await?;
//!
//!     client.discover_network().await?;
//!     for address in client.network().node_addresses(DEVICE_ID_ALL) {
//!         if let Some(mut node) = client.network().lookup_node(address).await
//!             && let Some(name) = node.find_var("Node", "DescriptiveName")
//!         {
//!             client.get_var(&mut node, name).await?;
//!             println!("{}: {:?}", address, node.var(name).and_then(|v| v.value.clone()));
//!         }
//!     }
//!
//!     client.shutdown().await;
//!     Ok(())
//! }
//! ```
//!
//! ## Server Example
//!
//! ```rust,no_run
//! use async_jip::Server;
//!
//! #[tokio::main]
//! async fn main() -> async_jip::Result<()> {
//!     let server = Server::builder().bind("[::]:1873").build().await?;
//!     async_jip::persist::load_definitions(server.network(), "definitions.json")?;
//!
//!     let address = "[fd04::10]:1873".parse().unwrap();
//!     drop(server.node_add(address, 0x0810_0002, Some("Lamp"), Some("1.0")).await?);
//!
//!     server.run().await
//! }
//! ```

pub mod cache;
pub mod client;
pub mod error;
pub mod persist;
pub mod server;
pub mod table;
pub mod topology;
pub mod transport;
pub mod wire;

pub(crate) mod util;

#[cfg(feature = "cli")]
pub mod cli;

// Re-exports for convenience
pub use cache::{MibSchema, NodeSchema, SchemaCache, VarSchema};
pub use client::{Backoff, Client, ClientBuilder, ClientConfig, Retry, RetryBuilder};
pub use error::{Error, Result, Status};
pub use server::{Server, ServerBuilder};
pub use table::Table;
pub use topology::{
    Capability, DEVICE_ID_ALL, Mib, Network, NetworkEvent, NetworkEventKind, Node, NodeGuard,
    Provider, SLEEPING_DEVICE, Sink, TrapCallback, TrapRegistration, Var, VarRef,
};
pub use transport::{Transport, TunnelTransport, UdpTransport};
pub use wire::{AccessType, Command, DEFAULT_PORT, MibAddr, Security, Value, VarType};

/// Type alias for a client reaching the mesh through an IPv4 tunnel gateway.
pub type TunnelClient = Client<TunnelTransport>;

/// Testing utilities exposed via the `testing` feature.
#[cfg(feature = "testing")]
pub mod testing {
    pub use crate::transport::{MockResponse, MockTransport, RecordedRequest, Responder};
}
