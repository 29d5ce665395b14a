// Every export takes raw pointers and opaque handles from generated C code;
// validity is checked at runtime, so per-function safety docs would repeat
// the same contract everywhere.
#![allow(clippy::missing_safety_doc)]
//! # hostcrt-abi
//!
//! `extern "C"` boundary for `hostcrt-core`.
//!
//! ```text
//! generated caller -> hostcrt_* entry (this crate) -> Runtime (core) -> sentinel + last error
//! ```
//!
//! Calling convention:
//! - The logical-thread context crosses as an opaque `*const Tls` obtained from
//!   [`runtime_abi::hostcrt_tls_create`] (or handed to a thread's start
//!   routine by [`pthread_abi::hostcrt_pthread_create`]).
//! - Blocks are `u64` handles, mutexes are caller-chosen non-zero `usize`
//!   handles, threads are `u64` identities. Zero is always null.
//! - Allocation entries return a null handle on failure; `pthread` entries
//!   return the error number. Either way the number is also stored in the
//!   context's last-error slot.
//! - Fatal mutex contract violations abort the process, or unwind when
//!   `HOSTCRT_ON_VIOLATION=panic`; those entries use the `C-unwind` ABI.

pub mod errno_abi;
pub mod malloc_abi;
pub mod pthread_abi;
pub mod runtime_abi;
