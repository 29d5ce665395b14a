//! Runtime installation and context lifecycle.

use std::ffi::c_int;
use std::sync::Arc;

use hostcrt_core::log::{Component, Event};
use hostcrt_core::{CrtError, LogLevel, Runtime, Tls};
use parking_lot::Mutex;

static RUNTIME: Mutex<Option<Arc<Runtime>>> = parking_lot::const_mutex(None);

/// The installed runtime, installing one from the environment on first use.
pub fn installed_runtime() -> Arc<Runtime> {
    Arc::clone(RUNTIME.lock().get_or_insert_with(Runtime::from_env))
}

/// Install `runtime` in place of the current one. Returns the previous one.
pub fn install_runtime(runtime: Arc<Runtime>) -> Option<Arc<Runtime>> {
    RUNTIME.lock().replace(runtime)
}

/// Borrow the context behind a boundary pointer.
///
/// # Safety
///
/// `tls` must be null or come from [`hostcrt_tls_create`] (or a start
/// routine argument) and not have been destroyed.
pub(crate) unsafe fn tls_ref<'a>(tls: *const Tls) -> Option<&'a Tls> {
    // SAFETY: caller guarantees `tls` is null or a live context.
    unsafe { tls.as_ref() }
}

/// Store a recoverable error in the slot and return its number. Fatal
/// errors go to the runtime's violation policy instead.
pub(crate) fn report(tls: &Tls, err: &CrtError) -> c_int {
    if err.is_fatal() {
        tls.runtime().violation(tls, err);
    }
    tls.record_error(err)
}

/// Install a runtime configured from `HOSTCRT_*` variables if none is
/// installed yet.
#[unsafe(no_mangle)]
pub extern "C" fn hostcrt_init() -> c_int {
    let _ = installed_runtime();
    0
}

/// Uninstall the runtime and report what it still owned.
///
/// Returns 0 when nothing leaked (or nothing was installed), 1 otherwise.
/// Contexts created earlier keep the old runtime alive until destroyed.
#[unsafe(no_mangle)]
pub extern "C" fn hostcrt_teardown() -> c_int {
    let Some(runtime) = RUNTIME.lock().take() else {
        return 0;
    };
    let report = runtime.teardown();
    if report.is_clean() {
        0
    } else {
        eprintln!("hostcrt: teardown with live resources: {}", report.to_json());
        1
    }
}

/// Create a context for the calling logical thread. Null when the heap is
/// exhausted.
#[unsafe(no_mangle)]
pub extern "C" fn hostcrt_tls_create() -> *mut Tls {
    match installed_runtime().create_tls() {
        Ok(tls) => Box::into_raw(Box::new(tls)),
        Err(_) => std::ptr::null_mut(),
    }
}

/// Destroy a context from [`hostcrt_tls_create`]. Null is a no-op.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn hostcrt_tls_destroy(tls: *mut Tls) {
    if tls.is_null() {
        return;
    }
    // SAFETY: non-null pointers come from `Box::into_raw` in `hostcrt_tls_create`.
    let tls = unsafe { Box::from_raw(tls) };
    let runtime = Arc::clone(tls.runtime());
    let id = tls.thread_id();
    if let Err(err) = runtime.destroy_tls(*tls) {
        runtime.log().record(
            Event::new(Component::Tls, "tls_destroy", "destroy")
                .level(LogLevel::Error)
                .thread(id.raw())
                .outcome("failed")
                .details(err.to_string()),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hostcrt_core::RuntimeConfig;

    #[test]
    fn report_writes_slot_for_recoverable_errors() {
        let rt = Runtime::new(RuntimeConfig::default());
        let tls = rt.create_tls().unwrap();
        let code = report(
            &tls,
            &CrtError::InvalidHandle {
                op: "release",
                handle: 9,
            },
        );
        assert_eq!(code, hostcrt_core::errno::EINVAL);
        assert_eq!(tls.last_error(), hostcrt_core::errno::EINVAL);
        rt.destroy_tls(tls).unwrap();
    }
}
