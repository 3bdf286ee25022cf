//! Error handling and types

use thiserror::Error;

/// Errors produced by a sync session.
///
/// Each variant maps to one of the documented process exit codes; per-file
/// recoverable failures are recorded in the session stats instead of being
/// propagated through this type.
#[derive(Error, Debug)]
pub enum SyncError {
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("protocol version mismatch: peer speaks {peer}, we speak {ours}")]
    VersionMismatch { peer: u16, ours: u16 },

    #[error("hash mismatch reconstructing {0}")]
    HashMismatch(String),

    #[error("session idle timeout after {0} seconds")]
    Timeout(u64),

    #[error("session cancelled: {0}")]
    Cancelled(String),
}

impl SyncError {
    /// Process exit code for this error kind.
    ///
    /// 0 is success and never produced here; 1 configuration, 2 protocol
    /// (including version mismatch and timeout), 3 I/O, 4 hash mismatch,
    /// 5 cancelled.
    #[must_use]
    pub const fn exit_code(&self) -> i32 {
        match self {
            Self::Config(_) => 1,
            Self::Protocol(_) | Self::VersionMismatch { .. } | Self::Timeout(_) => 2,
            Self::Io(_) => 3,
            Self::HashMismatch(_) => 4,
            Self::Cancelled(_) => 5,
        }
    }

    /// Wire code carried in ERROR frame payloads.
    #[must_use]
    pub const fn wire_code(&self) -> u8 {
        match self {
            Self::Config(_) => 1,
            Self::Io(_) => 2,
            Self::Protocol(_) => 3,
            Self::VersionMismatch { .. } => 4,
            Self::HashMismatch(_) => 5,
            Self::Timeout(_) => 6,
            Self::Cancelled(_) => 7,
        }
    }

    /// Rebuild an error from an ERROR frame's code and message.
    #[must_use]
    pub fn from_wire(code: u8, message: String) -> Self {
        match code {
            1 => Self::Config(message),
            2 => Self::Io(std::io::Error::other(message)),
            4 => Self::VersionMismatch {
                peer: 0,
                ours: crate::protocol::PROTOCOL_VERSION,
            },
            5 => Self::HashMismatch(message),
            6 => Self::Timeout(0),
            7 => Self::Cancelled(message),
            _ => Self::Protocol(message),
        }
    }
}

pub type Result<T> = std::result::Result<T, SyncError>;
