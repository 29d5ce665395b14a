//! Coarse-locked arena allocator.
//!
//! Blocks live in arena slots addressed by [`BlockHandle`]s. One lock guards
//! the whole heap: slot table, free-slot stack, recycle pool and counters.
//! Released buffers are parked in a bounded recycle pool and handed to later
//! requests without clearing, the way C `malloc` reuses freed chunks;
//! [`Allocator::allocate_zeroed`] always clears what it hands out.

use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;

use super::handle::BlockHandle;
use crate::error::{CrtError, Result};
use crate::log::{Component, Event, EventLog, LogLevel};

/// Largest request the heap will consider.
pub const MAX_REQUEST: usize = isize::MAX as usize;

/// Point-in-time allocator counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct AllocatorStats {
    /// Blocks currently handed out.
    pub live_blocks: usize,
    /// Usable bytes across live blocks.
    pub live_bytes: usize,
    /// High-water mark of `live_bytes`.
    pub peak_bytes: usize,
    /// Released buffers waiting in the recycle pool.
    pub recycled_buffers: usize,
    pub total_allocations: u64,
    pub total_releases: u64,
    pub failed_allocations: u64,
    /// Requests served from the recycle pool.
    pub recycle_hits: u64,
}

struct Slot {
    generation: u32,
    block: Option<Vec<u8>>,
}

struct HeapState {
    slots: Vec<Slot>,
    free_slots: Vec<u32>,
    recycled: Vec<Vec<u8>>,
    stats: AllocatorStats,
}

/// Set `buf.len()` to `size`, keeping whatever bytes are already there.
fn set_len(buf: &mut Vec<u8>, size: usize) {
    if buf.len() >= size {
        buf.truncate(size);
    } else {
        buf.resize(size, 0);
    }
}

impl HeapState {
    fn new() -> Self {
        Self {
            slots: Vec::new(),
            free_slots: Vec::new(),
            recycled: Vec::new(),
            stats: AllocatorStats::default(),
        }
    }

    fn block(&self, handle: BlockHandle) -> Option<&Vec<u8>> {
        let slot = self.slots.get(handle.index()?)?;
        if slot.generation != handle.generation() {
            return None;
        }
        slot.block.as_ref()
    }

    fn block_mut(&mut self, handle: BlockHandle) -> Option<&mut Vec<u8>> {
        let slot = self.slots.get_mut(handle.index()?)?;
        if slot.generation != handle.generation() {
            return None;
        }
        slot.block.as_mut()
    }

    /// Best fit by capacity from the recycle pool.
    fn take_recycled(&mut self, size: usize) -> Option<Vec<u8>> {
        let (pos, _) = self
            .recycled
            .iter()
            .enumerate()
            .filter(|(_, buf)| buf.capacity() >= size)
            .min_by_key(|(_, buf)| buf.capacity())?;
        self.stats.recycle_hits += 1;
        Some(self.recycled.swap_remove(pos))
    }

    /// A buffer of exactly `size` bytes, plus whether it came from the pool
    /// (and may hold stale bytes).
    fn obtain_buffer(&mut self, size: usize) -> Option<(Vec<u8>, bool)> {
        if size > 0 {
            if let Some(mut buf) = self.take_recycled(size) {
                set_len(&mut buf, size);
                return Some((buf, true));
            }
        }
        let mut buf = Vec::new();
        buf.try_reserve_exact(size).ok()?;
        buf.resize(size, 0);
        Some((buf, false))
    }

    fn recycle(&mut self, buf: Vec<u8>, limit: usize) {
        if buf.capacity() > 0 && self.recycled.len() < limit {
            self.recycled.push(buf);
        }
    }

    fn insert(&mut self, buf: Vec<u8>) -> Option<BlockHandle> {
        let index = match self.free_slots.pop() {
            Some(index) => index,
            None => {
                if self.slots.len() > BlockHandle::MAX_INDEX as usize {
                    return None;
                }
                self.slots.push(Slot {
                    generation: 0,
                    block: None,
                });
                (self.slots.len() - 1) as u32
            }
        };
        let len = buf.len();
        let slot = &mut self.slots[index as usize];
        slot.block = Some(buf);
        let handle = BlockHandle::compose(index, slot.generation);
        self.stats.live_blocks += 1;
        self.stats.live_bytes += len;
        self.stats.peak_bytes = self.stats.peak_bytes.max(self.stats.live_bytes);
        self.stats.total_allocations += 1;
        Some(handle)
    }

    fn remove(&mut self, handle: BlockHandle) -> Option<Vec<u8>> {
        let index = handle.index()?;
        let slot = self.slots.get_mut(index)?;
        if slot.generation != handle.generation() {
            return None;
        }
        let buf = slot.block.take()?;
        // A slot whose generation would wrap is retired for good.
        if slot.generation < u32::MAX {
            slot.generation += 1;
            self.free_slots.push(index as u32);
        }
        self.stats.live_blocks -= 1;
        self.stats.live_bytes -= buf.len();
        self.stats.total_releases += 1;
        Some(buf)
    }
}

/// Thread-safe heap shared by every logical thread of a runtime.
pub struct Allocator {
    state: Mutex<HeapState>,
    heap_limit: Option<usize>,
    recycle_limit: usize,
    log: Arc<EventLog>,
}

impl Allocator {
    /// `heap_limit` caps live bytes; `recycle_limit` bounds the recycle pool.
    #[must_use]
    pub fn new(heap_limit: Option<usize>, recycle_limit: usize, log: Arc<EventLog>) -> Self {
        Self {
            state: Mutex::new(HeapState::new()),
            heap_limit,
            recycle_limit,
            log,
        }
    }

    fn exceeds_limit(&self, live_after: usize) -> bool {
        self.heap_limit.is_some_and(|limit| live_after > limit)
    }

    fn out_of_memory(&self, state: &mut HeapState, op: &'static str, requested: usize) -> CrtError {
        state.stats.failed_allocations += 1;
        self.log.record(
            Event::new(Component::Malloc, op, "alloc")
                .level(LogLevel::Warn)
                .size(requested)
                .outcome("out_of_memory"),
        );
        CrtError::OutOfMemory { op, requested }
    }

    fn invalid_handle(&self, op: &'static str, handle: BlockHandle) -> CrtError {
        self.log.record(
            Event::new(Component::Malloc, op, "lookup")
                .level(LogLevel::Warn)
                .handle(handle.raw())
                .outcome("invalid_handle"),
        );
        CrtError::InvalidHandle {
            op,
            handle: handle.raw(),
        }
    }

    fn allocate_inner(&self, op: &'static str, size: usize, zeroed: bool) -> Result<BlockHandle> {
        let mut state = self.state.lock();
        if size > MAX_REQUEST || self.exceeds_limit(state.stats.live_bytes.saturating_add(size)) {
            return Err(self.out_of_memory(&mut state, op, size));
        }
        let Some((mut buf, recycled)) = state.obtain_buffer(size) else {
            return Err(self.out_of_memory(&mut state, op, size));
        };
        if zeroed && recycled {
            buf.fill(0);
        }
        let Some(handle) = state.insert(buf) else {
            return Err(self.out_of_memory(&mut state, op, size));
        };
        drop(state);
        self.log.record(
            Event::new(Component::Malloc, op, "alloc")
                .level(LogLevel::Trace)
                .handle(handle.raw())
                .size(size)
                .outcome(if recycled { "recycled" } else { "fresh" }),
        );
        Ok(handle)
    }

    /// Hand out a block of `size` usable bytes. Contents are unspecified.
    ///
    /// `allocate(0)` returns a valid, non-null, zero-length block.
    pub fn allocate(&self, size: usize) -> Result<BlockHandle> {
        self.allocate_inner("allocate", size, false)
    }

    /// Like [`Allocator::allocate`] but every byte reads as zero.
    pub fn allocate_zeroed(&self, size: usize) -> Result<BlockHandle> {
        self.allocate_inner("allocate_zeroed", size, true)
    }

    /// Zeroed block of `count * size` bytes; overflow is `OutOfMemory`.
    pub fn allocate_array(&self, count: usize, size: usize) -> Result<BlockHandle> {
        match count.checked_mul(size) {
            Some(total) => self.allocate_inner("allocate_array", total, true),
            None => {
                let mut state = self.state.lock();
                Err(self.out_of_memory(&mut state, "allocate_array", usize::MAX))
            }
        }
    }

    /// Change the usable size of `handle`.
    ///
    /// A null handle allocates; `new_size == 0` releases and returns NULL.
    /// When `new_size` fits the block's capacity the same handle comes back.
    /// Otherwise the contents move to a new block and the old handle goes
    /// stale. On failure the original block is left as it was.
    pub fn resize(&self, handle: BlockHandle, new_size: usize) -> Result<BlockHandle> {
        if handle.is_null() {
            return self.allocate_inner("resize", new_size, false);
        }
        if new_size == 0 {
            self.release_inner("resize", handle)?;
            return Ok(BlockHandle::NULL);
        }

        let mut state = self.state.lock();
        let Some((old_len, capacity)) = state.block(handle).map(|b| (b.len(), b.capacity())) else {
            drop(state);
            return Err(self.invalid_handle("resize", handle));
        };
        let live_after = (state.stats.live_bytes - old_len).saturating_add(new_size);
        if new_size > MAX_REQUEST || self.exceeds_limit(live_after) {
            return Err(self.out_of_memory(&mut state, "resize", new_size));
        }

        if new_size <= capacity {
            if let Some(block) = state.block_mut(handle) {
                set_len(block, new_size);
            }
            state.stats.live_bytes = live_after;
            state.stats.peak_bytes = state.stats.peak_bytes.max(live_after);
            drop(state);
            self.log.record(
                Event::new(Component::Malloc, "resize", "resize")
                    .level(LogLevel::Trace)
                    .handle(handle.raw())
                    .size(new_size)
                    .outcome("in_place"),
            );
            return Ok(handle);
        }

        let Some((mut buf, _)) = state.obtain_buffer(new_size) else {
            return Err(self.out_of_memory(&mut state, "resize", new_size));
        };
        if let Some(old) = state.block(handle) {
            buf[..old_len].copy_from_slice(old);
        }
        let Some(moved) = state.insert(buf) else {
            return Err(self.out_of_memory(&mut state, "resize", new_size));
        };
        if let Some(old) = state.remove(handle) {
            state.recycle(old, self.recycle_limit);
        }
        drop(state);
        self.log.record(
            Event::new(Component::Malloc, "resize", "resize")
                .level(LogLevel::Trace)
                .handle(moved.raw())
                .size(new_size)
                .outcome("relocated")
                .details(format!("from {handle}")),
        );
        Ok(moved)
    }

    fn release_inner(&self, op: &'static str, handle: BlockHandle) -> Result<()> {
        if handle.is_null() {
            return Ok(());
        }
        let mut state = self.state.lock();
        let Some(buf) = state.remove(handle) else {
            drop(state);
            return Err(self.invalid_handle(op, handle));
        };
        let size = buf.len();
        state.recycle(buf, self.recycle_limit);
        drop(state);
        self.log.record(
            Event::new(Component::Malloc, op, "free")
                .level(LogLevel::Trace)
                .handle(handle.raw())
                .size(size),
        );
        Ok(())
    }

    /// Return a block to the heap. NULL is a no-op; a released or unknown
    /// handle is `InvalidHandle`.
    pub fn release(&self, handle: BlockHandle) -> Result<()> {
        self.release_inner("release", handle)
    }

    /// Usable bytes of a live block, 0 for null or stale handles.
    #[must_use]
    pub fn usable_size(&self, handle: BlockHandle) -> usize {
        self.state.lock().block(handle).map_or(0, Vec::len)
    }

    /// Whether `handle` names a live block.
    #[must_use]
    pub fn is_live(&self, handle: BlockHandle) -> bool {
        self.state.lock().block(handle).is_some()
    }

    fn check_range(
        op: &'static str,
        handle: BlockHandle,
        offset: usize,
        len: usize,
        size: usize,
    ) -> Result<std::ops::Range<usize>> {
        match offset.checked_add(len) {
            Some(end) if end <= size => Ok(offset..end),
            _ => Err(CrtError::OutOfBounds {
                op,
                handle: handle.raw(),
                offset,
                len,
                size,
            }),
        }
    }

    /// Copy `dst.len()` bytes starting at `offset` out of the block.
    pub fn read(&self, handle: BlockHandle, offset: usize, dst: &mut [u8]) -> Result<()> {
        let state = self.state.lock();
        let Some(block) = state.block(handle) else {
            return Err(self.invalid_handle("read", handle));
        };
        let range = Self::check_range("read", handle, offset, dst.len(), block.len())?;
        dst.copy_from_slice(&block[range]);
        Ok(())
    }

    /// Copy `src` into the block starting at `offset`.
    pub fn write(&self, handle: BlockHandle, offset: usize, src: &[u8]) -> Result<()> {
        let mut state = self.state.lock();
        let Some(block) = state.block_mut(handle) else {
            return Err(self.invalid_handle("write", handle));
        };
        let range = Self::check_range("write", handle, offset, src.len(), block.len())?;
        block[range].copy_from_slice(src);
        Ok(())
    }

    /// Run `f` over the block's bytes under the heap lock.
    ///
    /// `f` must not call back into this allocator.
    pub fn with_bytes<R>(&self, handle: BlockHandle, f: impl FnOnce(&[u8]) -> R) -> Result<R> {
        let state = self.state.lock();
        match state.block(handle) {
            Some(block) => Ok(f(block)),
            None => Err(self.invalid_handle("with_bytes", handle)),
        }
    }

    /// Mutable counterpart of [`Allocator::with_bytes`].
    pub fn with_bytes_mut<R>(
        &self,
        handle: BlockHandle,
        f: impl FnOnce(&mut [u8]) -> R,
    ) -> Result<R> {
        let mut state = self.state.lock();
        match state.block_mut(handle) {
            Some(block) => Ok(f(block)),
            None => Err(self.invalid_handle("with_bytes_mut", handle)),
        }
    }

    #[must_use]
    pub fn stats(&self) -> AllocatorStats {
        let state = self.state.lock();
        AllocatorStats {
            recycled_buffers: state.recycled.len(),
            ..state.stats
        }
    }
}

impl std::fmt::Debug for Allocator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Allocator")
            .field("heap_limit", &self.heap_limit)
            .field("recycle_limit", &self.recycle_limit)
            .field("stats", &self.stats())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn allocator(limit: Option<usize>) -> Allocator {
        Allocator::new(limit, 8, Arc::new(EventLog::new(256, false)))
    }

    #[test]
    fn zero_size_block_is_valid_and_non_null() {
        let heap = allocator(None);
        let h = heap.allocate(0).unwrap();
        assert!(!h.is_null());
        assert_eq!(heap.usable_size(h), 0);
        assert!(heap.is_live(h));
        heap.release(h).unwrap();
    }

    #[test]
    fn release_null_is_noop_and_double_release_is_invalid() {
        let heap = allocator(None);
        heap.release(BlockHandle::NULL).unwrap();
        let h = heap.allocate(16).unwrap();
        heap.release(h).unwrap();
        let err = heap.release(h).unwrap_err();
        assert_eq!(
            err,
            CrtError::InvalidHandle {
                op: "release",
                handle: h.raw()
            }
        );
    }

    #[test]
    fn stale_handle_never_aliases_reused_slot() {
        let heap = allocator(None);
        let first = heap.allocate(8).unwrap();
        heap.release(first).unwrap();
        let second = heap.allocate(8).unwrap();
        assert_ne!(first, second);
        assert_eq!(first.index(), second.index());
        assert_eq!(second.generation(), first.generation() + 1);
        assert_eq!(heap.usable_size(first), 0);
        assert!(matches!(
            heap.write(first, 0, &[1]),
            Err(CrtError::InvalidHandle { .. })
        ));
        assert!(heap.is_live(second));
    }

    #[test]
    fn zeroed_allocation_clears_recycled_storage() {
        let heap = allocator(None);
        let dirty = heap.allocate(64).unwrap();
        heap.with_bytes_mut(dirty, |bytes| bytes.fill(0xAB)).unwrap();
        heap.release(dirty).unwrap();
        assert_eq!(heap.stats().recycled_buffers, 1);

        let clean = heap.allocate_zeroed(64).unwrap();
        assert_eq!(heap.stats().recycle_hits, 1);
        heap.with_bytes(clean, |bytes| assert!(bytes.iter().all(|&b| b == 0)))
            .unwrap();
    }

    #[test]
    fn plain_allocation_reuses_without_clearing() {
        let heap = allocator(None);
        let dirty = heap.allocate(32).unwrap();
        heap.write(dirty, 0, &[7; 32]).unwrap();
        heap.release(dirty).unwrap();
        let reused = heap.allocate(16).unwrap();
        let mut out = [0u8; 16];
        heap.read(reused, 0, &mut out).unwrap();
        assert_eq!(out, [7; 16]);
    }

    #[test]
    fn resize_within_capacity_keeps_handle() {
        let heap = allocator(None);
        let h = heap.allocate(64).unwrap();
        heap.write(h, 0, b"hostcrt").unwrap();
        let shrunk = heap.resize(h, 8).unwrap();
        assert_eq!(shrunk, h);
        assert_eq!(heap.usable_size(h), 8);
        let grown = heap.resize(h, 64).unwrap();
        assert_eq!(grown, h);
        let mut out = [0u8; 7];
        heap.read(h, 0, &mut out).unwrap();
        assert_eq!(&out, b"hostcrt");
    }

    #[test]
    fn resize_past_capacity_relocates_and_stales_old_handle() {
        let heap = allocator(None);
        let h = heap.allocate(4).unwrap();
        heap.write(h, 0, &[1, 2, 3, 4]).unwrap();
        let moved = heap.resize(h, 4096).unwrap();
        assert_ne!(moved, h);
        assert!(!heap.is_live(h));
        assert_eq!(heap.usable_size(moved), 4096);
        let mut out = [0u8; 4];
        heap.read(moved, 0, &mut out).unwrap();
        assert_eq!(out, [1, 2, 3, 4]);
        assert_eq!(heap.stats().live_blocks, 1);
        assert_eq!(heap.stats().live_bytes, 4096);
    }

    #[test]
    fn resize_null_allocates_and_resize_zero_releases() {
        let heap = allocator(None);
        let h = heap.resize(BlockHandle::NULL, 12).unwrap();
        assert_eq!(heap.usable_size(h), 12);
        assert_eq!(heap.resize(h, 0).unwrap(), BlockHandle::NULL);
        assert!(!heap.is_live(h));
        assert!(matches!(
            heap.resize(h, 8),
            Err(CrtError::InvalidHandle { op: "resize", .. })
        ));
    }

    #[test]
    fn heap_limit_refuses_and_leaves_original_untouched() {
        let heap = allocator(Some(128));
        let h = heap.allocate(100).unwrap();
        heap.write(h, 0, &[9; 100]).unwrap();
        assert!(matches!(
            heap.allocate(64),
            Err(CrtError::OutOfMemory {
                op: "allocate",
                requested: 64
            })
        ));
        assert!(matches!(
            heap.resize(h, 256),
            Err(CrtError::OutOfMemory { op: "resize", .. })
        ));
        assert!(heap.is_live(h));
        let mut out = [0u8; 100];
        heap.read(h, 0, &mut out).unwrap();
        assert_eq!(out, [9; 100]);
        assert_eq!(heap.stats().failed_allocations, 2);
    }

    #[test]
    fn oversized_and_overflowing_requests_fail() {
        let heap = allocator(None);
        assert!(matches!(
            heap.allocate(MAX_REQUEST + 1),
            Err(CrtError::OutOfMemory { .. })
        ));
        assert!(matches!(
            heap.allocate_array(usize::MAX, 2),
            Err(CrtError::OutOfMemory {
                op: "allocate_array",
                requested: usize::MAX
            })
        ));
        let arr = heap.allocate_array(4, 8).unwrap();
        assert_eq!(heap.usable_size(arr), 32);
    }

    #[test]
    fn byte_access_is_bounds_checked() {
        let heap = allocator(None);
        let h = heap.allocate(8).unwrap();
        heap.write(h, 4, &[1, 2, 3, 4]).unwrap();
        let err = heap.write(h, 5, &[0; 4]).unwrap_err();
        assert_eq!(
            err,
            CrtError::OutOfBounds {
                op: "write",
                handle: h.raw(),
                offset: 5,
                len: 4,
                size: 8
            }
        );
        let mut big = [0u8; 2];
        assert!(matches!(
            heap.read(h, usize::MAX, &mut big),
            Err(CrtError::OutOfBounds { .. })
        ));
    }

    #[test]
    fn stats_track_live_and_peak_bytes() {
        let heap = allocator(None);
        let a = heap.allocate(100).unwrap();
        let b = heap.allocate(50).unwrap();
        heap.release(a).unwrap();
        let stats = heap.stats();
        assert_eq!(stats.live_blocks, 1);
        assert_eq!(stats.live_bytes, 50);
        assert_eq!(stats.peak_bytes, 150);
        assert_eq!(stats.total_allocations, 2);
        assert_eq!(stats.total_releases, 1);
        heap.release(b).unwrap();
        assert_eq!(heap.stats().live_bytes, 0);
    }

    #[test]
    fn recycle_pool_is_bounded() {
        let heap = Allocator::new(None, 2, Arc::new(EventLog::new(16, false)));
        let handles: Vec<_> = (0..5).map(|_| heap.allocate(16).unwrap()).collect();
        for h in handles {
            heap.release(h).unwrap();
        }
        assert_eq!(heap.stats().recycled_buffers, 2);
    }
}
