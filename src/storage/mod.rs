//! # Storage Module
//!
//! Zero-copy access to claimed content through one capability,
//! [`MemoryMap`], with three realizations:
//!
//! | Type | Backing | Unmap releases |
//! |------|---------|----------------|
//! | [`FileMemoryMap`] | one file, `memmap2` mapping | mapping + file handle (after flush) |
//! | [`AtomicEntryMemoryMap`] | value in an [`crate::memory::EntryTable`] | value lock guard |
//! | [`PassthroughMemoryMap`] | any buffer, via [`PassthroughOps`] | the buffer state |
//!
//! ## Safety Model
//!
//! Mapped memory can become invalid when the backing store is grown and
//! remapped. As in the rest of this crate, the borrow checker enforces it:
//!
//! ```text
//! MemoryMap::data(&self) -> Option<&[u8]>        // borrows &self immutably
//! MemoryMap::resize(&mut self, n) -> Result<&mut [u8]>  // requires &mut self
//! ```
//!
//! No slice obtained before `resize` can be used after it, at zero runtime
//! cost.
//!
//! ## Thread Safety
//!
//! Every mapping is `Send` but not `Sync`. A mapping may be handed to another
//! thread; sharing one between threads needs outside synchronization.
//!
//! ## Platform Support
//!
//! File mappings use the `memmap2` crate:
//! - Linux and macOS (mmap/munmap/msync, madvise for prefetch)
//! - Windows (CreateFileMapping/MapViewOfFile)

mod entry_map;
mod map;
mod mmap;
mod passthrough;

pub use entry_map::AtomicEntryMemoryMap;
pub use map::{MemoryMap, UnmapHook, UnmapHooks};
pub use mmap::{FileMemoryMap, TruncateGate};
pub use passthrough::{PassthroughMemoryMap, PassthroughOps};
