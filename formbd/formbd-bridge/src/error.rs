//! Error types for bridge operations

use thiserror::Error;

use crate::engine::StatusCode;
use crate::status::Status;

/// Failure of a bridge entry point.
///
/// Bridge-local failures ([`InvalidArgument`](Self::InvalidArgument),
/// [`Released`](Self::Released), [`ForeignResource`](Self::ForeignResource))
/// are raised before any native call and never carry a native code.
/// [`Native`](Self::Native) is always the engine's own verdict.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BridgeError {
    /// Malformed argument rejected by the bridge
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    /// The resource was already closed, committed or rolled back
    #[error("{kind} handle has already been released")]
    Released { kind: &'static str },

    /// The resource was created through a different bridge instance
    #[error("{kind} handle belongs to another bridge")]
    ForeignResource { kind: &'static str },

    /// Failure reported by the native engine
    #[error("native engine returned {status} (code {code})")]
    Native { status: Status, code: StatusCode },

    /// The engine reported success but left the handle out-parameter empty
    #[error("{operation} succeeded without producing a handle")]
    MissingHandle { operation: &'static str },

    /// The engine claims to have written past the buffer it was given
    #[error("cursor reported {written} bytes written into a {capacity}-byte buffer")]
    BufferOverrun { written: u64, capacity: usize },

    /// The blocking task running a native call did not complete
    #[error("blocking task failed: {0}")]
    TaskFailed(String),
}

impl BridgeError {
    /// Error for a non-OK native code.
    pub(crate) fn native(code: StatusCode) -> Self {
        Self::Native {
            status: Status::from_code(code),
            code,
        }
    }

    /// Symbolic status exposed across the boundary.
    pub fn status(&self) -> Status {
        match self {
            Self::InvalidArgument(_) | Self::Released { .. } | Self::ForeignResource { .. } => {
                Status::InvalidArg
            }
            Self::Native { status, .. } => *status,
            Self::BufferOverrun { .. } => Status::Corruption,
            Self::MissingHandle { .. } | Self::TaskFailed(_) => Status::InternalError,
        }
    }

    /// Whether the engine itself reported this failure.
    pub fn is_native(&self) -> bool {
        matches!(self, Self::Native { .. })
    }
}

/// Converts a native status code into a `Result`.
pub(crate) fn check(code: StatusCode) -> BridgeResult<()> {
    if Status::from_code(code).is_ok() {
        Ok(())
    } else {
        Err(BridgeError::native(code))
    }
}

/// Result type for bridge operations
pub type BridgeResult<T> = Result<T, BridgeError>;
