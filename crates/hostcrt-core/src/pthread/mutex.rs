//! Handle-keyed mutexes.
//!
//! Callers name a mutex by an opaque non-zero integer. The registry maps each
//! handle to one [`PthreadMutex`], creating a NORMAL mutex the first time an
//! uninitialized handle is used. Each mutex guards its fields with its own
//! lock and condition variable; the registry lock only covers the handle map
//! and is always taken before a mutex's own lock, never after.
//!
//! Ownership is by logical thread identity ([`ThreadId`]), not host thread.

use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::{Condvar, Mutex};
use serde::Serialize;

use crate::error::{CrtError, Result};
use crate::log::{Component, Event, EventLog, LogLevel};
use crate::tls::ThreadId;

/// Normal (default) mutex: no recursion, self-relock blocks forever.
pub const PTHREAD_MUTEX_NORMAL: i32 = 0;
/// Recursive mutex: the owner can re-lock, each lock needs its own unlock.
pub const PTHREAD_MUTEX_RECURSIVE: i32 = 1;
/// Default mutex type (alias for NORMAL).
pub const PTHREAD_MUTEX_DEFAULT: i32 = PTHREAD_MUTEX_NORMAL;

/// Kind stored in a destroyed attribute.
const ATTR_DESTROYED: i32 = -1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MutexKind {
    Normal,
    Recursive,
}

impl MutexKind {
    #[must_use]
    pub const fn from_raw(raw: i32) -> Option<Self> {
        match raw {
            PTHREAD_MUTEX_NORMAL => Some(Self::Normal),
            PTHREAD_MUTEX_RECURSIVE => Some(Self::Recursive),
            _ => None,
        }
    }

    #[must_use]
    pub const fn as_raw(self) -> i32 {
        match self {
            Self::Normal => PTHREAD_MUTEX_NORMAL,
            Self::Recursive => PTHREAD_MUTEX_RECURSIVE,
        }
    }
}

/// Mutex attribute object, laid out the way generated code allocates it.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MutexAttr {
    kind: i32,
}

impl Default for MutexAttr {
    fn default() -> Self {
        Self::new()
    }
}

impl MutexAttr {
    /// Fresh attribute with kind NORMAL.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            kind: PTHREAD_MUTEX_NORMAL,
        }
    }

    /// Raw kind value as last stored.
    #[must_use]
    pub const fn raw_kind(&self) -> i32 {
        self.kind
    }

    #[must_use]
    pub const fn is_destroyed(&self) -> bool {
        self.kind == ATTR_DESTROYED
    }

    /// Set the kind. Only NORMAL and RECURSIVE are accepted; anything else
    /// leaves the attribute unchanged.
    pub fn set_kind(&mut self, raw: i32) -> Result<()> {
        if self.is_destroyed() {
            return Err(CrtError::InvalidHandle {
                op: "mutexattr_settype",
                handle: 0,
            });
        }
        let kind = MutexKind::from_raw(raw).ok_or_else(|| CrtError::NotSupported {
            op: "mutexattr_settype",
            what: format!("mutex kind {raw}"),
        })?;
        self.kind = kind.as_raw();
        Ok(())
    }

    pub fn kind(&self) -> Result<MutexKind> {
        self.resolve("mutexattr_gettype")
    }

    fn resolve(&self, op: &'static str) -> Result<MutexKind> {
        if self.is_destroyed() {
            return Err(CrtError::InvalidHandle { op, handle: 0 });
        }
        MutexKind::from_raw(self.kind).ok_or_else(|| CrtError::NotSupported {
            op,
            what: format!("mutex kind {}", self.kind),
        })
    }

    /// Mark destroyed; later use reports `InvalidHandle`.
    pub fn destroy(&mut self) {
        self.kind = ATTR_DESTROYED;
    }
}

/// Result of a non-blocking acquire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TryLockOutcome {
    Acquired,
    Busy,
}

/// Observable state of one mutex.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct MutexSnapshot {
    pub kind: MutexKind,
    pub owner: Option<ThreadId>,
    pub hold_count: u32,
    pub waiters: u32,
}

/// Branch counters across every mutex of a registry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MutexCounters {
    /// Lock calls that had to block.
    pub contended_waits: u64,
    /// Condition broadcasts issued on release or reinit.
    pub wake_broadcasts: u64,
    /// Mutexes materialized on first use of an unknown handle.
    pub lazy_creations: u64,
}

#[derive(Default)]
struct Counters {
    contended_waits: AtomicU64,
    wake_broadcasts: AtomicU64,
    lazy_creations: AtomicU64,
}

struct MutexState {
    kind: MutexKind,
    owner: Option<ThreadId>,
    hold_count: u32,
    waiters: u32,
}

impl MutexState {
    fn acquire(&mut self, caller: ThreadId) {
        self.owner = Some(caller);
        self.hold_count = 1;
    }

    fn clear(&mut self) {
        self.owner = None;
        self.hold_count = 0;
    }
}

/// One mutex state machine.
struct PthreadMutex {
    handle: usize,
    state: Mutex<MutexState>,
    released: Condvar,
}

impl PthreadMutex {
    fn new(handle: usize, kind: MutexKind) -> Self {
        Self {
            handle,
            state: Mutex::new(MutexState {
                kind,
                owner: None,
                hold_count: 0,
                waiters: 0,
            }),
            released: Condvar::new(),
        }
    }

    fn reenter(&self, state: &mut MutexState) -> Result<()> {
        state.hold_count = state
            .hold_count
            .checked_add(1)
            .ok_or_else(|| CrtError::NotSupported {
                op: "lock",
                what: format!("recursion depth beyond {} on mutex {:#x}", u32::MAX, self.handle),
            })?;
        Ok(())
    }

    fn lock(&self, caller: ThreadId, counters: &Counters, log: &EventLog) -> Result<()> {
        let mut state = self.state.lock();
        if state.kind == MutexKind::Recursive && state.owner == Some(caller) {
            return self.reenter(&mut state);
        }
        if state.hold_count > 0 {
            counters.contended_waits.fetch_add(1, Ordering::Relaxed);
            log.record(
                Event::new(Component::Mutex, "lock", "contended_wait")
                    .level(LogLevel::Trace)
                    .handle(self.handle as u64)
                    .thread(caller.raw()),
            );
            state.waiters += 1;
            while state.hold_count != 0 {
                self.released.wait(&mut state);
            }
            state.waiters -= 1;
        }
        state.acquire(caller);
        Ok(())
    }

    fn try_lock(&self, caller: ThreadId) -> Result<TryLockOutcome> {
        let mut state = self.state.lock();
        if state.kind == MutexKind::Recursive && state.owner == Some(caller) {
            self.reenter(&mut state)?;
            return Ok(TryLockOutcome::Acquired);
        }
        if state.hold_count > 0 {
            return Ok(TryLockOutcome::Busy);
        }
        state.acquire(caller);
        Ok(TryLockOutcome::Acquired)
    }

    fn unlock(&self, caller: ThreadId, counters: &Counters) -> Result<()> {
        let mut state = self.state.lock();
        if state.hold_count == 0 {
            return Err(CrtError::UseViolation {
                op: "unlock",
                mutex: self.handle,
                caller,
            });
        }
        if state.kind == MutexKind::Recursive {
            match state.owner {
                Some(owner) if owner != caller => {
                    return Err(CrtError::WrongOwner {
                        op: "unlock",
                        mutex: self.handle,
                        owner,
                        caller,
                    });
                }
                _ => {}
            }
            state.hold_count -= 1;
            if state.hold_count > 0 {
                return Ok(());
            }
        }
        state.clear();
        counters.wake_broadcasts.fetch_add(1, Ordering::Relaxed);
        self.released.notify_all();
        Ok(())
    }

    fn snapshot(&self) -> MutexSnapshot {
        let state = self.state.lock();
        MutexSnapshot {
            kind: state.kind,
            owner: state.owner,
            hold_count: state.hold_count,
            waiters: state.waiters,
        }
    }
}

/// Handle → mutex map with lazy NORMAL creation.
pub struct MutexRegistry {
    map: Mutex<HashMap<usize, Arc<PthreadMutex>>>,
    counters: Counters,
    log: Arc<EventLog>,
}

impl MutexRegistry {
    #[must_use]
    pub fn new(log: Arc<EventLog>) -> Self {
        Self {
            map: Mutex::new(HashMap::new()),
            counters: Counters::default(),
            log,
        }
    }

    fn check_handle(op: &'static str, handle: usize) -> Result<()> {
        if handle == 0 {
            return Err(CrtError::InvalidHandle { op, handle: 0 });
        }
        Ok(())
    }

    fn get_or_create(&self, op: &'static str, handle: usize) -> Result<Arc<PthreadMutex>> {
        Self::check_handle(op, handle)?;
        let mut map = self.map.lock();
        match map.entry(handle) {
            Entry::Occupied(entry) => Ok(Arc::clone(entry.get())),
            Entry::Vacant(entry) => {
                self.counters.lazy_creations.fetch_add(1, Ordering::Relaxed);
                self.log.record(
                    Event::new(Component::Mutex, op, "lazy_create")
                        .handle(handle as u64)
                        .details("normal"),
                );
                Ok(Arc::clone(
                    entry.insert(Arc::new(PthreadMutex::new(handle, MutexKind::Normal))),
                ))
            }
        }
    }

    /// Bind `handle` to a mutex of `attr`'s kind (NORMAL when `None`).
    ///
    /// An existing entry is reset in place: kind replaced, owner cleared and
    /// every waiter woken.
    pub fn init(&self, handle: usize, attr: Option<&MutexAttr>) -> Result<()> {
        Self::check_handle("mutex_init", handle)?;
        let kind = match attr {
            Some(attr) => attr.resolve("mutex_init")?,
            None => MutexKind::Normal,
        };
        let mut map = self.map.lock();
        match map.entry(handle) {
            Entry::Occupied(entry) => {
                let mutex = entry.get();
                let mut state = mutex.state.lock();
                let previous = (state.owner, state.hold_count);
                state.kind = kind;
                state.clear();
                self.counters.wake_broadcasts.fetch_add(1, Ordering::Relaxed);
                mutex.released.notify_all();
                drop(state);
                if previous.1 > 0 {
                    let owner = previous.0.map_or(0, ThreadId::raw);
                    self.log.record(
                        Event::new(Component::Mutex, "mutex_init", "reinit")
                            .level(LogLevel::Warn)
                            .handle(handle as u64)
                            .thread(owner)
                            .outcome("reset_while_locked")
                            .details(format!("hold_count {}", previous.1)),
                    );
                } else {
                    self.log.record(
                        Event::new(Component::Mutex, "mutex_init", "reinit")
                            .handle(handle as u64),
                    );
                }
            }
            Entry::Vacant(entry) => {
                entry.insert(Arc::new(PthreadMutex::new(handle, kind)));
                self.log.record(
                    Event::new(Component::Mutex, "mutex_init", "init")
                        .handle(handle as u64)
                        .details(format!("{kind:?}").to_lowercase()),
                );
            }
        }
        Ok(())
    }

    /// Remove the entry for `handle`. Unknown handles are a no-op.
    pub fn destroy(&self, handle: usize) -> Result<()> {
        Self::check_handle("mutex_destroy", handle)?;
        let removed = self.map.lock().remove(&handle);
        if let Some(mutex) = removed {
            let snap = mutex.snapshot();
            let event = Event::new(Component::Mutex, "mutex_destroy", "destroy").handle(handle as u64);
            self.log.record(if snap.hold_count > 0 {
                event
                    .level(LogLevel::Warn)
                    .outcome("destroyed_while_locked")
            } else {
                event
            });
        }
        Ok(())
    }

    /// Block until `caller` holds the mutex.
    pub fn lock(&self, handle: usize, caller: ThreadId) -> Result<()> {
        let mutex = self.get_or_create("lock", handle)?;
        mutex.lock(caller, &self.counters, &self.log)
    }

    /// Acquire without blocking.
    pub fn try_lock(&self, handle: usize, caller: ThreadId) -> Result<TryLockOutcome> {
        let mutex = self.get_or_create("trylock", handle)?;
        mutex.try_lock(caller)
    }

    /// Release one hold. `UseViolation` and `WrongOwner` are fatal contract
    /// breaks; the mutex is left unchanged when they are returned.
    pub fn unlock(&self, handle: usize, caller: ThreadId) -> Result<()> {
        let mutex = self.get_or_create("unlock", handle)?;
        mutex.unlock(caller, &self.counters)
    }

    /// Current state of `handle`, if registered.
    #[must_use]
    pub fn snapshot(&self, handle: usize) -> Option<MutexSnapshot> {
        let mutex = self.map.lock().get(&handle).cloned()?;
        Some(mutex.snapshot())
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.map.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub fn counters(&self) -> MutexCounters {
        MutexCounters {
            contended_waits: self.counters.contended_waits.load(Ordering::Relaxed),
            wake_broadcasts: self.counters.wake_broadcasts.load(Ordering::Relaxed),
            lazy_creations: self.counters.lazy_creations.load(Ordering::Relaxed),
        }
    }

    /// Drop every entry. Returns how many were registered.
    pub fn clear(&self) -> usize {
        let mut map = self.map.lock();
        let count = map.len();
        map.clear();
        count
    }
}

impl std::fmt::Debug for MutexRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MutexRegistry")
            .field("len", &self.len())
            .field("counters", &self.counters())
            .finish()
    }
}
