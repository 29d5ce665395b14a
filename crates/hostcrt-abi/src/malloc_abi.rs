//! Allocation entry points.
//!
//! Blocks cross the boundary as `u64` handles. Failures return the null
//! handle and store `ENOMEM`/`EINVAL`/`EFAULT` in the context's last-error
//! slot.

use std::ffi::c_int;

use hostcrt_core::{BlockHandle, Tls, errno};

use crate::runtime_abi::{report, tls_ref};

fn handle_or_null(tls: &Tls, result: hostcrt_core::Result<BlockHandle>) -> u64 {
    match result {
        Ok(handle) => handle.raw(),
        Err(err) => {
            report(tls, &err);
            0
        }
    }
}

/// C `malloc`. `size == 0` yields a valid zero-length block.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn hostcrt_malloc(tls: *const Tls, size: usize) -> u64 {
    // SAFETY: boundary contract, see `tls_ref`.
    let Some(tls) = (unsafe { tls_ref(tls) }) else {
        return 0;
    };
    handle_or_null(tls, tls.runtime().allocator().allocate(size))
}

/// C `calloc`. `nmemb * size` overflow is `ENOMEM`.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn hostcrt_calloc(tls: *const Tls, nmemb: usize, size: usize) -> u64 {
    // SAFETY: boundary contract, see `tls_ref`.
    let Some(tls) = (unsafe { tls_ref(tls) }) else {
        return 0;
    };
    handle_or_null(tls, tls.runtime().allocator().allocate_array(nmemb, size))
}

/// C `realloc`. On failure the original block stays valid.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn hostcrt_realloc(tls: *const Tls, block: u64, size: usize) -> u64 {
    // SAFETY: boundary contract, see `tls_ref`.
    let Some(tls) = (unsafe { tls_ref(tls) }) else {
        return 0;
    };
    handle_or_null(
        tls,
        tls.runtime()
            .allocator()
            .resize(BlockHandle::from_raw(block), size),
    )
}

/// C `free`. Null is a no-op; a stale handle sets `EINVAL`.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn hostcrt_free(tls: *const Tls, block: u64) {
    // SAFETY: boundary contract, see `tls_ref`.
    let Some(tls) = (unsafe { tls_ref(tls) }) else {
        return;
    };
    if let Err(err) = tls.runtime().allocator().release(BlockHandle::from_raw(block)) {
        report(tls, &err);
    }
}

/// Usable bytes of a live block; 0 for null or stale handles.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn hostcrt_malloc_usable_size(tls: *const Tls, block: u64) -> usize {
    // SAFETY: boundary contract, see `tls_ref`.
    (unsafe { tls_ref(tls) }).map_or(0, |tls| {
        tls.runtime()
            .allocator()
            .usable_size(BlockHandle::from_raw(block))
    })
}

fn null_buffer(tls: &Tls) -> c_int {
    tls.set_last_error(errno::EFAULT);
    errno::EFAULT
}

/// Copy `len` bytes at `offset` of `block` into `dst`. Returns 0 or the
/// error number.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn hostcrt_block_read(
    tls: *const Tls,
    block: u64,
    offset: usize,
    dst: *mut u8,
    len: usize,
) -> c_int {
    // SAFETY: boundary contract, see `tls_ref`.
    let Some(tls) = (unsafe { tls_ref(tls) }) else {
        return errno::EINVAL;
    };
    if dst.is_null() && len > 0 {
        return null_buffer(tls);
    }
    let dst: &mut [u8] = if len == 0 {
        &mut []
    } else {
        // SAFETY: caller provides `len` writable bytes at non-null `dst`.
        unsafe { std::slice::from_raw_parts_mut(dst, len) }
    };
    match tls
        .runtime()
        .allocator()
        .read(BlockHandle::from_raw(block), offset, dst)
    {
        Ok(()) => 0,
        Err(err) => report(tls, &err),
    }
}

/// Copy `len` bytes from `src` into `block` at `offset`. Returns 0 or the
/// error number.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn hostcrt_block_write(
    tls: *const Tls,
    block: u64,
    offset: usize,
    src: *const u8,
    len: usize,
) -> c_int {
    // SAFETY: boundary contract, see `tls_ref`.
    let Some(tls) = (unsafe { tls_ref(tls) }) else {
        return errno::EINVAL;
    };
    if src.is_null() && len > 0 {
        return null_buffer(tls);
    }
    let src: &[u8] = if len == 0 {
        &[]
    } else {
        // SAFETY: caller provides `len` readable bytes at non-null `src`.
        unsafe { std::slice::from_raw_parts(src, len) }
    };
    match tls
        .runtime()
        .allocator()
        .write(BlockHandle::from_raw(block), offset, src)
    {
        Ok(()) => 0,
        Err(err) => report(tls, &err),
    }
}
