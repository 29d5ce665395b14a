//! Thread-safe heap handing out generation-checked block handles.

pub mod allocator;
pub mod handle;

pub use allocator::{Allocator, AllocatorStats};
pub use handle::BlockHandle;
