//! Error types for async-jip.
//!
//! This module provides:
//!
//! - [`Error`] - The main error type
//! - [`Status`] - JIP status codes, both the ones carried on the wire and the
//!   library-local ones
//!
//! # Error Handling
//!
//! Errors are boxed for efficiency: `Result<T> = Result<T, Box<Error>>`.
//! Code that prefers the status-code view can call [`Error::status`].
//!
//! ```rust
//! use async_jip::{Error, Result, Status};
//!
//! fn handle_error(result: Result<()>) {
//!     match result {
//!         Ok(()) => println!("Success"),
//!         Err(e) => match &*e {
//!             Error::Timeout { target, retries, .. } => {
//!                 println!("{} unreachable after {} sends", target, retries);
//!             }
//!             Error::Status { status: Status::Disabled, .. } => {
//!                 println!("variable currently unavailable");
//!             }
//!             _ => println!("Error: {}", e),
//!         },
//!     }
//! }
//! ```

pub(crate) mod internal;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Placeholder address used when no peer is involved.
pub(crate) const UNKNOWN_TARGET: SocketAddr =
    SocketAddr::new(std::net::IpAddr::V6(std::net::Ipv6Addr::UNSPECIFIED), 0);

// Pattern for converting detailed internal errors to simplified public errors:
//
// tracing::debug!(
//     target: "async_jip::wire",
//     { jip.offset = 4, jip.decode_error = %kind },
//     "decode error details here"
// );
// return Err(Error::MalformedResponse { target }.boxed());

/// Result type alias using the library's boxed Error type.
pub type Result<T> = std::result::Result<T, Box<Error>>;

/// The main error type for all async-jip operations.
///
/// Errors are boxed (via [`Result`]) to keep the size small on the stack.
///
/// ```
/// use async_jip::{Error, Status};
///
/// fn is_retriable(error: &Error) -> bool {
///     matches!(error, Error::Timeout { .. } | Error::Network { .. })
/// }
///
/// fn is_unavailable(error: &Error) -> bool {
///     error.status() == Status::Disabled
/// }
/// ```
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// Socket failure (unreachable, address in use, etc.)
    #[error("network error communicating with {target}: {source}")]
    Network {
        target: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    /// No matching response after every send.
    #[error("timeout after {elapsed:?} waiting for {target} ({retries} sends)")]
    Timeout {
        target: SocketAddr,
        elapsed: Duration,
        retries: u32,
    },

    /// Non-OK status, either returned by the peer or raised by local validation.
    #[error("JIP status from {target}: {status}")]
    Status { target: SocketAddr, status: Status },

    /// Response could not be decoded.
    #[error("malformed response from {target}")]
    MalformedResponse { target: SocketAddr },

    /// No node with this address in the network.
    #[error("no node at {address}")]
    UnknownNode { address: SocketAddr },

    /// A node with this address already exists.
    #[error("node at {address} already exists")]
    DuplicateNode { address: SocketAddr },

    /// Named MIB or variable is not present on the node.
    #[error("{node} has no variable {mib}/{var}")]
    UnknownVar {
        node: SocketAddr,
        mib: Box<str>,
        var: Box<str>,
    },

    /// Invalid configuration.
    #[error("configuration error: {0}")]
    Config(Box<str>),

    /// Definitions or network file could not be used.
    #[error("cannot use {}: {reason}", path.display())]
    Persist { path: PathBuf, reason: Box<str> },
}

impl Error {
    /// Box this error (convenience for constructing boxed errors).
    pub fn boxed(self) -> Box<Self> {
        Box::new(self)
    }

    /// Shorthand for a status error against `target`.
    pub(crate) fn status_from(target: SocketAddr, status: Status) -> Box<Self> {
        Self::Status { target, status }.boxed()
    }

    /// Map this error onto the JIP status code space.
    pub fn status(&self) -> Status {
        match self {
            Self::Network { .. } => Status::Network,
            Self::Timeout { .. } => Status::Timeout,
            Self::Status { status, .. } => *status,
            Self::UnknownNode { .. } => Status::BadDeviceId,
            Self::UnknownVar { .. } => Status::BadVarIndex,
            Self::Config(_) => Status::WrongContext,
            Self::MalformedResponse { .. } | Self::DuplicateNode { .. } | Self::Persist { .. } => {
                Status::Failed
            }
        }
    }
}

/// JIP status codes.
///
/// Values `0x00` and `0x7f..=0xff` travel on the wire. The `0x11..=0x15`
/// range is reserved for library-local conditions and never sent.
///
/// ```
/// use async_jip::Status;
///
/// let status = Status::from_u8(0xaf);
/// assert_eq!(status, Status::NoAccess);
/// assert_eq!(status.as_u8(), 0xaf);
/// assert!(status.is_wire());
/// println!("Error: {}", status); // prints "Access denied"
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum Status {
    /// Success (0x00).
    Ok,
    /// The node did not answer in time (0x7f).
    Timeout,
    /// MIB index or ID not found (0x8f).
    BadMibIndex,
    /// Variable index not found (0x9f).
    BadVarIndex,
    /// Variable is constant or read-only (0xaf).
    NoAccess,
    /// Payload size does not fit the variable (0xbf).
    BadBufferSize,
    /// Declared type differs from the variable's (0xcf).
    WrongType,
    /// Value rejected by the variable owner (0xdf).
    BadValue,
    /// Variable currently disabled (0xef).
    Disabled,
    /// Unspecified failure (0xff).
    Failed,
    /// Unknown device type (0x11, local).
    BadDeviceId,
    /// Socket level failure (0x12, local).
    Network,
    /// Resource busy (0x13, local).
    WouldBlock,
    /// Allocation failure (0x14, local).
    NoMem,
    /// Operation not valid for this client or server (0x15, local).
    WrongContext,
    /// Unknown or future status code.
    Unknown(u8),
}

impl Status {
    /// Create from raw status code.
    pub fn from_u8(value: u8) -> Self {
        match value {
            0x00 => Self::Ok,
            0x7f => Self::Timeout,
            0x8f => Self::BadMibIndex,
            0x9f => Self::BadVarIndex,
            0xaf => Self::NoAccess,
            0xbf => Self::BadBufferSize,
            0xcf => Self::WrongType,
            0xdf => Self::BadValue,
            0xef => Self::Disabled,
            0xff => Self::Failed,
            0x11 => Self::BadDeviceId,
            0x12 => Self::Network,
            0x13 => Self::WouldBlock,
            0x14 => Self::NoMem,
            0x15 => Self::WrongContext,
            other => {
                tracing::warn!(target: "async_jip::error", { jip.status = other }, "unknown JIP status");
                Self::Unknown(other)
            }
        }
    }

    /// Convert to raw status code.
    pub fn as_u8(&self) -> u8 {
        match self {
            Self::Ok => 0x00,
            Self::Timeout => 0x7f,
            Self::BadMibIndex => 0x8f,
            Self::BadVarIndex => 0x9f,
            Self::NoAccess => 0xaf,
            Self::BadBufferSize => 0xbf,
            Self::WrongType => 0xcf,
            Self::BadValue => 0xdf,
            Self::Disabled => 0xef,
            Self::Failed => 0xff,
            Self::BadDeviceId => 0x11,
            Self::Network => 0x12,
            Self::WouldBlock => 0x13,
            Self::NoMem => 0x14,
            Self::WrongContext => 0x15,
            Self::Unknown(code) => *code,
        }
    }

    /// Whether this status may appear in a packet.
    pub fn is_wire(&self) -> bool {
        !matches!(
            self,
            Self::BadDeviceId | Self::Network | Self::WouldBlock | Self::NoMem | Self::WrongContext
        )
    }

    pub fn is_ok(&self) -> bool {
        *self == Self::Ok
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Ok => write!(f, "Success"),
            Self::Timeout => write!(f, "Operation timed out"),
            Self::BadMibIndex => write!(f, "Bad MIB Index/ID"),
            Self::BadVarIndex => write!(f, "Bad variable index"),
            Self::NoAccess => write!(f, "Access denied"),
            Self::BadBufferSize => write!(f, "Bad buffer size"),
            Self::WrongType => write!(f, "Incorrect variable data type"),
            Self::BadValue => write!(f, "Invalid value for variable"),
            Self::Disabled => write!(f, "Variable is disabled"),
            Self::Failed => write!(f, "Failed"),
            Self::BadDeviceId => write!(f, "Bad Device ID"),
            Self::Network => write!(f, "Network Error"),
            Self::WouldBlock => write!(f, "Operation would block"),
            Self::NoMem => write!(f, "Memory allocation failed"),
            Self::WrongContext => write!(f, "Wrong context"),
            Self::Unknown(code) => write!(f, "Unknown status 0x{:02x}", code),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_size_budget() {
        assert!(
            std::mem::size_of::<Error>() <= 128,
            "Error size {} exceeds 128-byte budget",
            std::mem::size_of::<Error>()
        );

        assert_eq!(
            std::mem::size_of::<Result<()>>(),
            std::mem::size_of::<*const ()>(),
            "Result<()> should be pointer-sized"
        );
    }

    #[test]
    fn status_codes_are_stable() {
        for code in [
            0x00, 0x7f, 0x8f, 0x9f, 0xaf, 0xbf, 0xcf, 0xdf, 0xef, 0xff, 0x11, 0x12, 0x13, 0x14,
            0x15,
        ] {
            assert_eq!(Status::from_u8(code).as_u8(), code);
        }
        assert_eq!(Status::from_u8(0x42), Status::Unknown(0x42));
    }

    #[test]
    fn local_statuses_never_travel() {
        assert!(Status::Disabled.is_wire());
        assert!(Status::Timeout.is_wire());
        assert!(!Status::BadDeviceId.is_wire());
        assert!(!Status::WrongContext.is_wire());
    }

    #[test]
    fn error_maps_to_status() {
        let target: SocketAddr = "[::1]:1873".parse().unwrap();
        let timeout = Error::Timeout {
            target,
            elapsed: Duration::from_millis(1500),
            retries: 3,
        };
        assert_eq!(timeout.status(), Status::Timeout);
        assert_eq!(
            Error::status_from(target, Status::NoAccess).status(),
            Status::NoAccess
        );
        assert_eq!(Status::NoAccess.to_string(), "Access denied");
    }
}
