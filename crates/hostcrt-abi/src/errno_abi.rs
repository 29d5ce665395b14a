//! Last-error slot accessors.
//!
//! The slot lives in the caller's context rather than in host thread-local
//! storage, so a logical thread sees the same value whichever host thread
//! runs it.

use std::ffi::c_int;

use hostcrt_core::Tls;

use crate::runtime_abi::tls_ref;

/// Address of the context's last-error slot; null for a null context.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn hostcrt_errno_location(tls: *const Tls) -> *mut c_int {
    // SAFETY: boundary contract, see `tls_ref`.
    match unsafe { tls_ref(tls) } {
        Some(tls) => tls.errno_location(),
        None => std::ptr::null_mut(),
    }
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn hostcrt_get_errno(tls: *const Tls) -> c_int {
    // SAFETY: boundary contract, see `tls_ref`.
    (unsafe { tls_ref(tls) }).map_or(0, Tls::last_error)
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn hostcrt_set_errno(tls: *const Tls, code: c_int) {
    // SAFETY: boundary contract, see `tls_ref`.
    if let Some(tls) = unsafe { tls_ref(tls) } {
        tls.set_last_error(code);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hostcrt_core::{Runtime, RuntimeConfig};

    #[test]
    fn location_aliases_the_slot() {
        let rt = Runtime::new(RuntimeConfig::default());
        let tls = rt.create_tls().unwrap();
        let ptr: *const Tls = &tls;
        unsafe {
            let slot = hostcrt_errno_location(ptr);
            assert!(!slot.is_null());
            *slot = 77;
            assert_eq!(hostcrt_get_errno(ptr), 77);
            hostcrt_set_errno(ptr, 3);
            assert_eq!(*slot, 3);
        }
        assert_eq!(tls.last_error(), 3);
        rt.destroy_tls(tls).unwrap();
    }

    #[test]
    fn null_context_is_tolerated() {
        unsafe {
            assert!(hostcrt_errno_location(std::ptr::null()).is_null());
            assert_eq!(hostcrt_get_errno(std::ptr::null()), 0);
            hostcrt_set_errno(std::ptr::null(), 5);
        }
    }
}
