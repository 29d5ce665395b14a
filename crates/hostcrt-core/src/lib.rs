//! # hostcrt-core
//!
//! Safe implementation of a small C-runtime layer for generated callers:
//! a handle-based heap, per-thread contexts with a last-error slot,
//! NORMAL/RECURSIVE mutexes keyed by opaque handles, and a thread lifecycle
//! manager, all built on host primitives.
//!
//! Everything hangs off a [`Runtime`]. The `hostcrt-abi` crate exposes it
//! through `extern "C"` entry points.

#![deny(unsafe_code)]

pub mod config;
pub mod errno;
pub mod error;
pub mod log;
pub mod malloc;
pub mod pthread;
pub mod runtime;
pub mod tls;

pub use config::{RuntimeConfig, ViolationPolicy};
pub use error::{CrtError, Result};
pub use log::{EventLog, EventRecord, LogLevel};
pub use malloc::{Allocator, AllocatorStats, BlockHandle};
pub use pthread::{MutexAttr, MutexKind, ThreadHandle, TryLockOutcome};
pub use runtime::{Runtime, TeardownReport};
pub use tls::{ThreadId, Tls};
