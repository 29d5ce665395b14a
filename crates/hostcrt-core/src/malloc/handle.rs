//! Opaque allocation handles.
//!
//! A handle packs an arena slot index and the slot's generation:
//! `raw = (generation << 32) | (index + 1)`. The low half is never zero for a
//! live block, so raw `0` is free to act as NULL. Releasing a block bumps its
//! slot generation, which turns every copy of the old handle stale.

use std::fmt;

/// Handle to a runtime-owned byte region.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct BlockHandle(u64);

impl BlockHandle {
    /// The null handle.
    pub const NULL: Self = Self(0);

    /// Highest slot index a handle can name.
    pub const MAX_INDEX: u32 = u32::MAX - 1;

    #[must_use]
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    #[must_use]
    pub const fn raw(self) -> u64 {
        self.0
    }

    #[must_use]
    pub const fn is_null(self) -> bool {
        self.0 == 0
    }

    pub(crate) const fn compose(index: u32, generation: u32) -> Self {
        Self(((generation as u64) << 32) | (index as u64 + 1))
    }

    /// Slot index, or `None` when the low half is zero.
    pub(crate) const fn index(self) -> Option<usize> {
        let low = (self.0 & 0xFFFF_FFFF) as u32;
        if low == 0 {
            None
        } else {
            Some((low - 1) as usize)
        }
    }

    pub(crate) const fn generation(self) -> u32 {
        (self.0 >> 32) as u32
    }
}

impl fmt::Debug for BlockHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_null() {
            f.write_str("BlockHandle(NULL)")
        } else {
            write!(f, "BlockHandle({:#x})", self.0)
        }
    }
}

impl fmt::Display for BlockHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}
