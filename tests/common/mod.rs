//! Shared test infrastructure for async-jip.
//!
//! Provides TestServer (in-process JIP server), faulty peers and schema
//! fixtures.

// Not every test file uses every utility
#![allow(dead_code)]
#![allow(unused_imports)]

pub mod fixtures;
pub mod server;

pub use fixtures::{COORDINATOR, LAMP, coordinator_schema, lamp_schema};
pub use server::{LossyProxy, SilentNode, TestServer};
