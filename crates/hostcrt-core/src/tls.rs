//! Logical-thread contexts.
//!
//! A [`Tls`] is what generated code threads through every call: the logical
//! thread identity used for mutex ownership, the last-error slot, and a small
//! block of backing storage owned by the runtime allocator. Contexts are
//! created and destroyed explicitly. Identities come from one process-wide
//! counter starting at 1 and are never reused, even across runtimes.

use std::cell::Cell;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use serde::Serialize;

use crate::error::{CrtError, Result};
use crate::log::{Component, Event, EventLog};
use crate::malloc::BlockHandle;
use crate::runtime::Runtime;

/// Bytes of backing storage per context. The identity sits in the first 8
/// bytes, little-endian.
pub const TLS_STORAGE_SIZE: usize = 16;

/// Process-wide identity counter shared by every [`Runtime`].
static NEXT_THREAD_ID: AtomicU64 = AtomicU64::new(1);

fn next_thread_id() -> ThreadId {
    ThreadId(NEXT_THREAD_ID.fetch_add(1, Ordering::Relaxed))
}

/// Logical thread identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct ThreadId(u64);

impl ThreadId {
    #[must_use]
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    #[must_use]
    pub const fn raw(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ThreadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Per-logical-thread context.
///
/// `Tls` is `Send` but not `Sync`: the last-error slot is a plain cell that
/// only the owning thread touches.
pub struct Tls {
    runtime: Arc<Runtime>,
    id: ThreadId,
    last_error: Cell<i32>,
    storage: BlockHandle,
}

impl Tls {
    #[must_use]
    pub fn thread_id(&self) -> ThreadId {
        self.id
    }

    /// Runtime this context was created by.
    #[must_use]
    pub fn runtime(&self) -> &Arc<Runtime> {
        &self.runtime
    }

    /// Backing storage block.
    #[must_use]
    pub fn storage(&self) -> BlockHandle {
        self.storage
    }

    #[must_use]
    pub fn last_error(&self) -> i32 {
        self.last_error.get()
    }

    pub fn set_last_error(&self, code: i32) {
        self.last_error.set(code);
    }

    /// Store `err`'s code in the last-error slot and return it.
    pub fn record_error(&self, err: &CrtError) -> i32 {
        let code = err.errno();
        self.last_error.set(code);
        code
    }

    /// Address of the last-error slot, valid for the context's lifetime.
    #[must_use]
    pub fn errno_location(&self) -> *mut i32 {
        self.last_error.as_ptr()
    }
}

impl fmt::Debug for Tls {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tls")
            .field("id", &self.id)
            .field("last_error", &self.last_error.get())
            .field("storage", &self.storage)
            .finish()
    }
}

/// Context bookkeeping for one runtime.
pub struct TlsManager {
    issued: AtomicU64,
    live: AtomicUsize,
    log: Arc<EventLog>,
}

impl TlsManager {
    pub(crate) fn new(log: Arc<EventLog>) -> Self {
        Self {
            issued: AtomicU64::new(0),
            live: AtomicUsize::new(0),
            log,
        }
    }

    pub(crate) fn create(&self, runtime: &Arc<Runtime>) -> Result<Tls> {
        let id = next_thread_id();
        self.issued.fetch_add(1, Ordering::Relaxed);
        let allocator = runtime.allocator();
        let storage = allocator.allocate_zeroed(TLS_STORAGE_SIZE)?;
        if let Err(err) = allocator.write(storage, 0, &id.raw().to_le_bytes()) {
            let _ = allocator.release(storage);
            return Err(err);
        }
        self.live.fetch_add(1, Ordering::Relaxed);
        self.log.record(
            Event::new(Component::Tls, "create", "create")
                .thread(id.raw())
                .handle(storage.raw())
                .size(TLS_STORAGE_SIZE),
        );
        Ok(Tls {
            runtime: Arc::clone(runtime),
            id,
            last_error: Cell::new(0),
            storage,
        })
    }

    pub(crate) fn destroy(&self, tls: Tls) -> Result<()> {
        let id = tls.id;
        tls.runtime.allocator().release(tls.storage)?;
        self.live.fetch_sub(1, Ordering::Relaxed);
        self.log.record(
            Event::new(Component::Tls, "destroy", "destroy")
                .thread(id.raw())
                .handle(tls.storage.raw()),
        );
        Ok(())
    }

    /// Contexts created and not yet destroyed.
    #[must_use]
    pub fn live(&self) -> usize {
        self.live.load(Ordering::Relaxed)
    }

    /// Identities handed out by this runtime so far.
    #[must_use]
    pub fn issued(&self) -> u64 {
        self.issued.load(Ordering::Relaxed)
    }
}

impl fmt::Debug for TlsManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsManager")
            .field("issued", &self.issued())
            .field("live", &self.live())
            .finish()
    }
}
