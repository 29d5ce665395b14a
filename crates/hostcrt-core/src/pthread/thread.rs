//! Logical thread lifecycle: spawn, join, detach.
//!
//! Every spawned thread runs on its own host thread with a fresh [`Tls`]
//! context. The registry tracks one [`ThreadState`] per live thread, keyed by
//! the child's identity, which doubles as the caller-visible thread handle.
//! An entry disappears when it is joined, or when a detached thread finishes.

use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc;
use std::thread;

use parking_lot::{Condvar, Mutex};
use serde::Serialize;

use crate::error::{CrtError, Result};
use crate::log::{Component, Event, EventLog, LogLevel};
use crate::runtime::Runtime;
use crate::tls::{ThreadId, Tls};

/// Caller-visible thread handle: the child's logical identity.
pub type ThreadHandle = ThreadId;

#[derive(Debug, Default)]
struct ThreadInner {
    finished: bool,
    detached: bool,
    join_claimed: bool,
    return_value: usize,
}

struct ThreadState {
    inner: Mutex<ThreadInner>,
    done: Condvar,
}

impl ThreadState {
    fn new() -> Self {
        Self {
            inner: Mutex::new(ThreadInner::default()),
            done: Condvar::new(),
        }
    }
}

/// Observable flags of one thread entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ThreadStatus {
    pub finished: bool,
    pub detached: bool,
    pub join_claimed: bool,
}

/// Lifetime counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ThreadCounters {
    pub spawned: u64,
    pub joined: u64,
    pub detached: u64,
    /// Detached threads whose entry was removed on completion.
    pub reclaimed: u64,
}

#[derive(Default)]
struct Counters {
    spawned: AtomicU64,
    joined: AtomicU64,
    detached: AtomicU64,
    reclaimed: AtomicU64,
}

/// Handle → thread state map.
pub struct ThreadRegistry {
    threads: Mutex<HashMap<ThreadId, Arc<ThreadState>>>,
    counters: Counters,
    log: Arc<EventLog>,
}

impl ThreadRegistry {
    #[must_use]
    pub fn new(log: Arc<EventLog>) -> Self {
        Self {
            threads: Mutex::new(HashMap::new()),
            counters: Counters::default(),
            log,
        }
    }

    fn lookup(&self, op: &'static str, handle: ThreadHandle) -> Result<Arc<ThreadState>> {
        self.threads
            .lock()
            .get(&handle)
            .cloned()
            .ok_or(CrtError::InvalidHandle {
                op,
                handle: handle.raw(),
            })
    }

    fn invalid(op: &'static str, handle: ThreadHandle) -> CrtError {
        CrtError::InvalidHandle {
            op,
            handle: handle.raw(),
        }
    }

    /// Start `entry` on a new host thread with a fresh context.
    ///
    /// Returns once the child is running, not when it finishes. The child's
    /// context is destroyed after `entry` returns.
    pub(crate) fn spawn<F>(&self, runtime: &Arc<Runtime>, entry: F) -> Result<ThreadHandle>
    where
        F: FnOnce(&Tls) -> usize + Send + 'static,
    {
        let tls = runtime.create_tls()?;
        let id = tls.thread_id();
        let state = Arc::new(ThreadState::new());
        self.threads.lock().insert(id, Arc::clone(&state));

        let slot = Arc::new(Mutex::new(Some(tls)));
        let child_slot = Arc::clone(&slot);
        let (started_tx, started_rx) = mpsc::sync_channel::<()>(1);

        let spawned = thread::Builder::new()
            .name(format!("hostcrt-{id}"))
            .spawn(move || {
                let Some(tls) = child_slot.lock().take() else {
                    return;
                };
                drop(child_slot);
                let _ = started_tx.send(());
                let outcome = panic::catch_unwind(AssertUnwindSafe(|| entry(&tls)));
                let runtime = Arc::clone(tls.runtime());
                if let Err(err) = runtime.destroy_tls(tls) {
                    runtime.log().record(
                        Event::new(Component::Thread, "spawn", "destroy_context")
                            .level(LogLevel::Error)
                            .thread(id.raw())
                            .outcome("failed")
                            .details(err.to_string()),
                    );
                }
                let value = *outcome.as_ref().unwrap_or(&0);
                runtime.threads().finish(id, &state, value, outcome.is_err());
                if let Err(payload) = outcome {
                    panic::resume_unwind(payload);
                }
            });

        if let Err(err) = spawned {
            self.threads.lock().remove(&id);
            let leftover = slot.lock().take();
            if let Some(Err(destroy_err)) = leftover.map(|tls| runtime.destroy_tls(tls)) {
                self.log.record(
                    Event::new(Component::Thread, "spawn", "destroy_context")
                        .level(LogLevel::Error)
                        .thread(id.raw())
                        .outcome("failed")
                        .details(destroy_err.to_string()),
                );
            }
            self.log.record(
                Event::new(Component::Thread, "spawn", "spawn")
                    .level(LogLevel::Error)
                    .thread(id.raw())
                    .outcome("spawn_failed")
                    .details(err.to_string()),
            );
            return Err(CrtError::SpawnFailed {
                op: "spawn",
                reason: err.to_string(),
            });
        }

        let _ = started_rx.recv();
        self.counters.spawned.fetch_add(1, Ordering::Relaxed);
        self.log
            .record(Event::new(Component::Thread, "spawn", "started").thread(id.raw()));
        Ok(id)
    }

    fn finish(&self, id: ThreadId, state: &ThreadState, value: usize, panicked: bool) {
        let mut inner = state.inner.lock();
        inner.finished = true;
        inner.return_value = value;
        let detached = inner.detached;
        state.done.notify_all();
        drop(inner);

        let event = Event::new(Component::Thread, "spawn", "finished")
            .thread(id.raw())
            .outcome(if panicked { "panicked" } else { "returned" });
        self.log.record(if panicked {
            event.level(LogLevel::Error)
        } else {
            event
        });
        if detached {
            self.reclaim(id);
        }
    }

    fn reclaim(&self, id: ThreadId) {
        self.threads.lock().remove(&id);
        self.counters.reclaimed.fetch_add(1, Ordering::Relaxed);
        self.log
            .record(Event::new(Component::Thread, "detach", "reclaimed").thread(id.raw()));
    }

    /// Wait for `handle` to finish and return its entry's value.
    ///
    /// Unknown, detached, already joined and currently joined handles are
    /// `InvalidHandle`.
    pub fn join(&self, handle: ThreadHandle) -> Result<usize> {
        let state = self.lookup("join", handle)?;
        let mut inner = state.inner.lock();
        if inner.detached || inner.join_claimed {
            return Err(Self::invalid("join", handle));
        }
        inner.join_claimed = true;
        while !inner.finished {
            state.done.wait(&mut inner);
        }
        let value = inner.return_value;
        drop(inner);

        self.threads.lock().remove(&handle);
        self.counters.joined.fetch_add(1, Ordering::Relaxed);
        self.log.record(
            Event::new(Component::Thread, "join", "joined")
                .thread(handle.raw())
                .details(format!("value {value:#x}")),
        );
        Ok(value)
    }

    /// Let `handle` reclaim itself on completion instead of awaiting join.
    pub fn detach(&self, handle: ThreadHandle) -> Result<()> {
        let state = self.lookup("detach", handle)?;
        let mut inner = state.inner.lock();
        if inner.detached || inner.join_claimed {
            return Err(Self::invalid("detach", handle));
        }
        inner.detached = true;
        let finished = inner.finished;
        drop(inner);

        self.counters.detached.fetch_add(1, Ordering::Relaxed);
        self.log
            .record(Event::new(Component::Thread, "detach", "detached").thread(handle.raw()));
        if finished {
            self.reclaim(handle);
        }
        Ok(())
    }

    /// Threads with a registry entry.
    #[must_use]
    pub fn live_threads(&self) -> usize {
        self.threads.lock().len()
    }

    /// Handles that still expect a join.
    #[must_use]
    pub fn unjoined(&self) -> Vec<ThreadHandle> {
        let mut handles: Vec<_> = self
            .threads
            .lock()
            .iter()
            .filter(|(_, state)| !state.inner.lock().detached)
            .map(|(id, _)| *id)
            .collect();
        handles.sort_unstable();
        handles
    }

    /// Lifecycle flags of `handle`. `None` once the entry is gone.
    #[must_use]
    pub fn status(&self, handle: ThreadHandle) -> Option<ThreadStatus> {
        let state = self.threads.lock().get(&handle).cloned()?;
        let inner = state.inner.lock();
        Some(ThreadStatus {
            finished: inner.finished,
            detached: inner.detached,
            join_claimed: inner.join_claimed,
        })
    }

    /// Whether `handle` has finished running. `None` for unknown handles.
    #[must_use]
    pub fn is_finished(&self, handle: ThreadHandle) -> Option<bool> {
        self.status(handle).map(|status| status.finished)
    }

    #[must_use]
    pub fn counters(&self) -> ThreadCounters {
        ThreadCounters {
            spawned: self.counters.spawned.load(Ordering::Relaxed),
            joined: self.counters.joined.load(Ordering::Relaxed),
            detached: self.counters.detached.load(Ordering::Relaxed),
            reclaimed: self.counters.reclaimed.load(Ordering::Relaxed),
        }
    }
}

impl std::fmt::Debug for ThreadRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThreadRegistry")
            .field("live", &self.live_threads())
            .field("counters", &self.counters())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RuntimeConfig;
    use std::sync::mpsc::channel;
    use std::time::{Duration, Instant};

    fn wait_until(mut done: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if done() {
                return true;
            }
            thread::sleep(Duration::from_millis(1));
        }
        done()
    }

    #[test]
    fn join_returns_entry_value_and_removes_entry() {
        let rt = Runtime::new(RuntimeConfig::default());
        let handle = rt.spawn(|_tls| 0xDEAD).unwrap();
        assert_eq!(rt.join(handle).unwrap(), 0xDEAD);
        assert_eq!(rt.threads().live_threads(), 0);
        assert!(matches!(
            rt.join(handle),
            Err(CrtError::InvalidHandle { op: "join", .. })
        ));
    }

    #[test]
    fn child_gets_fresh_identity() {
        let rt = Runtime::new(RuntimeConfig::default());
        let parent = rt.create_tls().unwrap();
        let handle = rt.spawn(|tls| tls.thread_id().raw() as usize).unwrap();
        assert_ne!(handle, parent.thread_id());
        assert_eq!(rt.join(handle).unwrap() as u64, handle.raw());
        rt.destroy_tls(parent).unwrap();
    }

    #[test]
    fn spawn_returns_after_start_not_completion() {
        let rt = Runtime::new(RuntimeConfig::default());
        let (release_tx, release_rx) = channel::<()>();
        let handle = rt
            .spawn(move |_| {
                let _ = release_rx.recv();
                7
            })
            .unwrap();
        assert_eq!(rt.threads().is_finished(handle), Some(false));
        release_tx.send(()).unwrap();
        assert_eq!(rt.join(handle).unwrap(), 7);
    }

    #[test]
    fn detached_thread_reclaims_itself() {
        let rt = Runtime::new(RuntimeConfig::default());
        let (release_tx, release_rx) = channel::<()>();
        let handle = rt
            .spawn(move |_| {
                let _ = release_rx.recv();
                1
            })
            .unwrap();
        rt.detach(handle).unwrap();
        assert!(matches!(
            rt.detach(handle),
            Err(CrtError::InvalidHandle { op: "detach", .. })
        ));
        assert!(matches!(
            rt.join(handle),
            Err(CrtError::InvalidHandle { op: "join", .. })
        ));
        release_tx.send(()).unwrap();
        assert!(wait_until(|| rt.threads().live_threads() == 0));
        assert_eq!(rt.threads().counters().reclaimed, 1);
    }

    #[test]
    fn detaching_finished_thread_reclaims_immediately() {
        let rt = Runtime::new(RuntimeConfig::default());
        let handle = rt.spawn(|_| 0).unwrap();
        assert!(wait_until(|| rt.threads().is_finished(handle) == Some(true)));
        rt.detach(handle).unwrap();
        assert_eq!(rt.threads().live_threads(), 0);
        assert!(matches!(rt.detach(handle), Err(CrtError::InvalidHandle { .. })));
    }

    #[test]
    fn child_context_is_destroyed_after_entry() {
        let rt = Runtime::new(RuntimeConfig::default());
        let handle = rt.spawn(|_| 0).unwrap();
        rt.join(handle).unwrap();
        assert_eq!(rt.tls_manager().live(), 0);
        assert_eq!(rt.allocator().stats().live_blocks, 0);
    }

    #[test]
    fn unknown_handle_is_invalid() {
        let rt = Runtime::new(RuntimeConfig::default());
        let ghost = ThreadId::from_raw(999);
        assert!(matches!(rt.join(ghost), Err(CrtError::InvalidHandle { .. })));
        assert!(matches!(rt.detach(ghost), Err(CrtError::InvalidHandle { .. })));
        assert_eq!(rt.threads().is_finished(ghost), None);
    }

    #[test]
    fn unjoined_lists_only_joinable_threads() {
        let rt = Runtime::new(RuntimeConfig::default());
        let (release_tx, release_rx) = channel::<()>();
        let joinable = rt
            .spawn(move |_| {
                let _ = release_rx.recv();
                0
            })
            .unwrap();
        let detached = rt.spawn(|_| 0).unwrap();
        rt.detach(detached).unwrap();
        assert_eq!(rt.threads().unjoined(), vec![joinable]);
        release_tx.send(()).unwrap();
        rt.join(joinable).unwrap();
        assert!(rt.threads().unjoined().is_empty());
    }
}
