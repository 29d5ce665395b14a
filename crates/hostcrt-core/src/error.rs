//! Error taxonomy for the runtime.
//!
//! Recoverable errors are written into the caller's last-error slot and the
//! operation returns a sentinel. Fatal errors mean the caller broke a mutex
//! contract; the boundary turns them into a process abort (see
//! [`crate::runtime::Runtime::violation`]).

use thiserror::Error;

use crate::errno;
use crate::tls::ThreadId;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, CrtError>;

/// Every failure the runtime can report.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CrtError {
    /// The heap could not satisfy a request.
    #[error("{op}: out of memory requesting {requested} bytes")]
    OutOfMemory { op: &'static str, requested: usize },

    /// Unknown, destroyed, stale or null handle.
    #[error("{op}: invalid handle {handle:#x}")]
    InvalidHandle { op: &'static str, handle: u64 },

    /// Byte access outside a live block.
    #[error("{op}: range {offset}+{len} is outside block {handle:#x} of {size} bytes")]
    OutOfBounds {
        op: &'static str,
        handle: u64,
        offset: usize,
        len: usize,
        size: usize,
    },

    /// The host refused to start a thread.
    #[error("{op}: host could not start a thread: {reason}")]
    SpawnFailed { op: &'static str, reason: String },

    /// Attribute or operation outside the supported subset.
    #[error("{op}: {what} is not supported")]
    NotSupported { op: &'static str, what: String },

    /// A RECURSIVE mutex was released by a thread that does not own it.
    #[error("{op}: mutex {mutex:#x} is owned by thread {owner}, not by calling thread {caller}")]
    WrongOwner {
        op: &'static str,
        mutex: usize,
        owner: ThreadId,
        caller: ThreadId,
    },

    /// A mutex was released while not locked.
    #[error("{op}: mutex {mutex:#x} is not locked (calling thread {caller})")]
    UseViolation {
        op: &'static str,
        mutex: usize,
        caller: ThreadId,
    },
}

impl CrtError {
    /// Error number written into the last-error slot.
    #[must_use]
    pub const fn errno(&self) -> i32 {
        match self {
            Self::OutOfMemory { .. } => errno::ENOMEM,
            Self::InvalidHandle { .. } => errno::EINVAL,
            Self::OutOfBounds { .. } => errno::EFAULT,
            Self::SpawnFailed { .. } => errno::EAGAIN,
            Self::NotSupported { .. } => errno::ENOTSUP,
            Self::WrongOwner { .. } | Self::UseViolation { .. } => errno::EPERM,
        }
    }

    /// Whether the error signals a broken caller contract.
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        matches!(self, Self::WrongOwner { .. } | Self::UseViolation { .. })
    }

    /// Operation that produced the error.
    #[must_use]
    pub const fn op(&self) -> &'static str {
        match self {
            Self::OutOfMemory { op, .. }
            | Self::InvalidHandle { op, .. }
            | Self::OutOfBounds { op, .. }
            | Self::SpawnFailed { op, .. }
            | Self::NotSupported { op, .. }
            | Self::WrongOwner { op, .. }
            | Self::UseViolation { op, .. } => op,
        }
    }

    /// Short name of the contract a fatal error violates.
    #[must_use]
    pub const fn contract(&self) -> &'static str {
        match self {
            Self::WrongOwner { .. } => "unlock-by-owner",
            Self::UseViolation { .. } => "unlock-requires-locked",
            Self::OutOfMemory { .. } => "heap-capacity",
            Self::InvalidHandle { .. } => "live-handle",
            Self::OutOfBounds { .. } => "block-bounds",
            Self::SpawnFailed { .. } => "thread-start",
            Self::NotSupported { .. } => "supported-subset",
        }
    }

    /// Handle the error is about, when it names one.
    #[must_use]
    pub const fn handle(&self) -> Option<u64> {
        match self {
            Self::InvalidHandle { handle, .. } | Self::OutOfBounds { handle, .. } => Some(*handle),
            Self::WrongOwner { mutex, .. } | Self::UseViolation { mutex, .. } => {
                Some(*mutex as u64)
            }
            _ => None,
        }
    }
}
