//! Shared pieces of the command line tools.
//!
//! Only built with the `cli` feature.

pub mod args;
