//! POSIX-style threads and mutexes over host primitives.

pub mod mutex;
pub mod thread;

pub use mutex::{
    MutexAttr, MutexCounters, MutexKind, MutexRegistry, MutexSnapshot, PTHREAD_MUTEX_DEFAULT,
    PTHREAD_MUTEX_NORMAL, PTHREAD_MUTEX_RECURSIVE, TryLockOutcome,
};
pub use thread::{ThreadCounters, ThreadHandle, ThreadRegistry, ThreadStatus};
