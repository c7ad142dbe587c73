//! Detailed decode failure kinds.
//!
//! These never reach the public API. Decoders log them at debug level and
//! return [`Error::MalformedResponse`](super::Error::MalformedResponse).

/// Wire decode error kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum DecodeErrorKind {
    /// Fewer bytes than the field needs.
    Truncated { needed: usize, available: usize },
    /// Header carries a different protocol version.
    VersionMismatch(u8),
    /// Command byte outside the known set.
    UnknownCommand(u8),
    /// Variable type byte outside the known set.
    UnknownVarType(u8),
    /// Access class byte outside the known set.
    UnknownAccess(u8),
    /// Response carries a different command than expected.
    UnexpectedCommand { expected: u8, actual: u8 },
    /// A length-prefixed string or blob disagrees with the remaining payload.
    LengthMismatch { declared: usize, available: usize },
    /// Tunnel frame version other than 1.
    TunnelVersion(u8),
}

impl std::fmt::Display for DecodeErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Truncated { needed, available } => {
                write!(f, "truncated: need {} bytes, have {}", needed, available)
            }
            Self::VersionMismatch(v) => write!(f, "unsupported protocol version {}", v),
            Self::UnknownCommand(c) => write!(f, "unknown command 0x{:02X}", c),
            Self::UnknownVarType(t) => write!(f, "unknown variable type {}", t),
            Self::UnknownAccess(a) => write!(f, "unknown access class {}", a),
            Self::UnexpectedCommand { expected, actual } => {
                write!(f, "expected command 0x{:02X}, got 0x{:02X}", expected, actual)
            }
            Self::LengthMismatch {
                declared,
                available,
            } => write!(f, "declared length {} but {} bytes follow", declared, available),
            Self::TunnelVersion(v) => write!(f, "unsupported tunnel version {}", v),
        }
    }
}
