//! `pthread` entry points.
//!
//! Every entry returns 0 or an error number, and stores non-zero numbers in
//! the caller's last-error slot. The exception is `trylock` on a held mutex,
//! which returns `EBUSY` without touching the slot.

use std::ffi::{c_int, c_void};

use hostcrt_core::pthread::MutexAttr;
use hostcrt_core::{CrtError, ThreadId, Tls, TryLockOutcome, errno};

use crate::runtime_abi::{report, tls_ref};

/// Thread start routine: receives the child's context and the `arg` given to
/// [`hostcrt_pthread_create`]; its return value is what join hands back.
pub type StartRoutine = unsafe extern "C" fn(tls: *const Tls, arg: usize) -> usize;

fn status(tls: &Tls, result: hostcrt_core::Result<()>) -> c_int {
    match result {
        Ok(()) => 0,
        Err(err) => report(tls, &err),
    }
}

fn null_argument(tls: &Tls, op: &'static str) -> c_int {
    report(tls, &CrtError::InvalidHandle { op, handle: 0 })
}

// ---------------------------------------------------------------------------
// Mutex attributes
// ---------------------------------------------------------------------------

#[unsafe(no_mangle)]
pub unsafe extern "C" fn hostcrt_pthread_mutexattr_init(
    tls: *const Tls,
    attr: *mut MutexAttr,
) -> c_int {
    // SAFETY: boundary contract, see `tls_ref`.
    let Some(tls) = (unsafe { tls_ref(tls) }) else {
        return errno::EINVAL;
    };
    if attr.is_null() {
        return null_argument(tls, "mutexattr_init");
    }
    // SAFETY: caller provides writable storage for one attribute.
    unsafe { attr.write(MutexAttr::new()) };
    0
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn hostcrt_pthread_mutexattr_settype(
    tls: *const Tls,
    attr: *mut MutexAttr,
    kind: c_int,
) -> c_int {
    // SAFETY: boundary contract, see `tls_ref`.
    let Some(tls) = (unsafe { tls_ref(tls) }) else {
        return errno::EINVAL;
    };
    // SAFETY: caller passes null or an attribute it owns.
    let Some(attr) = (unsafe { attr.as_mut() }) else {
        return null_argument(tls, "mutexattr_settype");
    };
    status(tls, attr.set_kind(kind))
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn hostcrt_pthread_mutexattr_gettype(
    tls: *const Tls,
    attr: *const MutexAttr,
    kind: *mut c_int,
) -> c_int {
    // SAFETY: boundary contract, see `tls_ref`.
    let Some(tls) = (unsafe { tls_ref(tls) }) else {
        return errno::EINVAL;
    };
    // SAFETY: caller passes null or an attribute it owns.
    let Some(attr) = (unsafe { attr.as_ref() }) else {
        return null_argument(tls, "mutexattr_gettype");
    };
    if kind.is_null() {
        return null_argument(tls, "mutexattr_gettype");
    }
    match attr.kind() {
        Ok(value) => {
            // SAFETY: `kind` is non-null and caller-owned.
            unsafe { kind.write(value.as_raw()) };
            0
        }
        Err(err) => report(tls, &err),
    }
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn hostcrt_pthread_mutexattr_destroy(
    tls: *const Tls,
    attr: *mut MutexAttr,
) -> c_int {
    // SAFETY: boundary contract, see `tls_ref`.
    let Some(tls) = (unsafe { tls_ref(tls) }) else {
        return errno::EINVAL;
    };
    // SAFETY: caller passes null or an attribute it owns.
    let Some(attr) = (unsafe { attr.as_mut() }) else {
        return null_argument(tls, "mutexattr_destroy");
    };
    attr.destroy();
    0
}

// ---------------------------------------------------------------------------
// Mutexes
// ---------------------------------------------------------------------------

/// Bind `mutex` to a fresh mutex; `attr` may be null for NORMAL.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn hostcrt_pthread_mutex_init(
    tls: *const Tls,
    mutex: usize,
    attr: *const MutexAttr,
) -> c_int {
    // SAFETY: boundary contract, see `tls_ref`.
    let Some(tls) = (unsafe { tls_ref(tls) }) else {
        return errno::EINVAL;
    };
    // SAFETY: caller passes null or an attribute it owns.
    let attr = unsafe { attr.as_ref() };
    status(tls, tls.runtime().mutexes().init(mutex, attr))
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn hostcrt_pthread_mutex_destroy(tls: *const Tls, mutex: usize) -> c_int {
    // SAFETY: boundary contract, see `tls_ref`.
    let Some(tls) = (unsafe { tls_ref(tls) }) else {
        return errno::EINVAL;
    };
    status(tls, tls.runtime().mutexes().destroy(mutex))
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn hostcrt_pthread_mutex_lock(tls: *const Tls, mutex: usize) -> c_int {
    // SAFETY: boundary contract, see `tls_ref`.
    let Some(tls) = (unsafe { tls_ref(tls) }) else {
        return errno::EINVAL;
    };
    status(tls, tls.runtime().mutexes().lock(mutex, tls.thread_id()))
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn hostcrt_pthread_mutex_trylock(tls: *const Tls, mutex: usize) -> c_int {
    // SAFETY: boundary contract, see `tls_ref`.
    let Some(tls) = (unsafe { tls_ref(tls) }) else {
        return errno::EINVAL;
    };
    match tls.runtime().mutexes().try_lock(mutex, tls.thread_id()) {
        Ok(TryLockOutcome::Acquired) => 0,
        Ok(TryLockOutcome::Busy) => errno::EBUSY,
        Err(err) => report(tls, &err),
    }
}

/// Release one hold. Unlocking an unlocked mutex, or a RECURSIVE mutex owned
/// by another thread, is fatal.
#[unsafe(no_mangle)]
pub unsafe extern "C-unwind" fn hostcrt_pthread_mutex_unlock(
    tls: *const Tls,
    mutex: usize,
) -> c_int {
    // SAFETY: boundary contract, see `tls_ref`.
    let Some(tls) = (unsafe { tls_ref(tls) }) else {
        return errno::EINVAL;
    };
    status(tls, tls.runtime().mutexes().unlock(mutex, tls.thread_id()))
}

// ---------------------------------------------------------------------------
// Threads
// ---------------------------------------------------------------------------

/// Start `start(child_tls, arg)` on a new logical thread and store its
/// handle in `*thread`. Thread attributes are not supported; `attr` must be
/// null.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn hostcrt_pthread_create(
    tls: *const Tls,
    thread: *mut u64,
    attr: *const c_void,
    start: Option<StartRoutine>,
    arg: usize,
) -> c_int {
    // SAFETY: boundary contract, see `tls_ref`.
    let Some(tls) = (unsafe { tls_ref(tls) }) else {
        return errno::EINVAL;
    };
    if !attr.is_null() {
        return report(
            tls,
            &CrtError::NotSupported {
                op: "pthread_create",
                what: "thread attributes".to_string(),
            },
        );
    }
    let (Some(start), false) = (start, thread.is_null()) else {
        return null_argument(tls, "pthread_create");
    };
    let spawned = tls.runtime().spawn(move |child: &Tls| {
        // SAFETY: `start` is the caller's start routine; the child context
        // outlives the call.
        unsafe { start(child, arg) }
    });
    match spawned {
        Ok(handle) => {
            // SAFETY: `thread` is non-null and caller-owned.
            unsafe { thread.write(handle.raw()) };
            0
        }
        Err(err) => report(tls, &err),
    }
}

/// Wait for `thread` and store its start routine's value in `*retval`
/// unless `retval` is null.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn hostcrt_pthread_join(
    tls: *const Tls,
    thread: u64,
    retval: *mut usize,
) -> c_int {
    // SAFETY: boundary contract, see `tls_ref`.
    let Some(tls) = (unsafe { tls_ref(tls) }) else {
        return errno::EINVAL;
    };
    match tls.runtime().join(ThreadId::from_raw(thread)) {
        Ok(value) => {
            if !retval.is_null() {
                // SAFETY: `retval` is non-null and caller-owned.
                unsafe { retval.write(value) };
            }
            0
        }
        Err(err) => report(tls, &err),
    }
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn hostcrt_pthread_detach(tls: *const Tls, thread: u64) -> c_int {
    // SAFETY: boundary contract, see `tls_ref`.
    let Some(tls) = (unsafe { tls_ref(tls) }) else {
        return errno::EINVAL;
    };
    status(tls, tls.runtime().detach(ThreadId::from_raw(thread)))
}

/// Identity of the calling logical thread; 0 for a null context.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn hostcrt_pthread_self(tls: *const Tls) -> u64 {
    // SAFETY: boundary contract, see `tls_ref`.
    (unsafe { tls_ref(tls) }).map_or(0, |tls| tls.thread_id().raw())
}

#[unsafe(no_mangle)]
pub extern "C" fn hostcrt_pthread_equal(a: u64, b: u64) -> c_int {
    c_int::from(a == b)
}
