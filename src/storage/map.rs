//! # Memory Map Capability
//!
//! [`MemoryMap`] is the single interface callers use for zero-copy access to
//! claimed content, whichever backend holds the bytes.
//!
//! ## Contract
//!
//! ```text
//! fn data(&self) -> Option<&[u8]>;              // None once unmapped/invalid
//! fn data_mut(&mut self) -> Option<&mut [u8]>;  // None if read-only or invalid
//! fn size(&self) -> usize;                      // UNMAPPED_SIZE once unmapped/invalid
//! fn unmap(&mut self) -> Result<()>;            // idempotent, runs hooks once
//! fn resize(&mut self, n) -> Result<&mut [u8]>; // writable only
//! fn register_unmap_hook(&mut self, hook);
//! ```
//!
//! ## Views Instead of Addresses
//!
//! A mapping never hands out a raw pointer. `data()` returns a slice whose
//! length is the mapped length, and `read_at` / `write_at` check ranges and
//! fail with `OutOfBounds` rather than touching memory outside the mapping.
//!
//! ## Resize Ordering
//!
//! `resize` takes `&mut self` and returns the new view. The borrow checker
//! guarantees that no slice obtained before the resize is still alive, so
//! nobody can dereference the pre-resize region.
//!
//! ## Unmap Hooks
//!
//! Hooks run exactly once, in registration order, on the first `unmap()` (or
//! on drop if `unmap()` was never called). Each receives the last valid view.
//! A failing hook does not stop later hooks; the first failure is returned
//! from `unmap()`.

use std::fmt;

use eyre::Result;
use smallvec::SmallVec;
use tracing::warn;

use crate::config::INLINE_UNMAP_HOOKS;
use crate::error::ContentError;

/// Cleanup action run with the final view of a mapping.
pub type UnmapHook = Box<dyn FnOnce(&[u8]) -> Result<()> + Send>;

pub trait MemoryMap: Send {
    /// Returns the mapped bytes, or `None` once unmapped or invalid.
    fn data(&self) -> Option<&[u8]>;

    /// Returns the mapped bytes mutably, or `None` for read-only or invalid
    /// mappings.
    fn data_mut(&mut self) -> Option<&mut [u8]>;

    /// Returns the mapped length, or `UNMAPPED_SIZE` once unmapped or invalid.
    fn size(&self) -> usize;

    fn is_read_only(&self) -> bool;

    fn is_valid(&self) -> bool {
        self.data().is_some()
    }

    /// Releases the mapping. Calling it again is a no-op.
    fn unmap(&mut self) -> Result<()>;

    /// Grows (zero-filled) or shrinks the backing store and returns the new
    /// view. Fails with `NotSupported` on read-only mappings.
    fn resize(&mut self, new_size: usize) -> Result<&mut [u8]>;

    fn register_unmap_hook(&mut self, hook: UnmapHook);

    fn read_at(&self, offset: usize, len: usize) -> Result<&[u8]> {
        let data = self
            .data()
            .ok_or(ContentError::InvalidMapping { operation: "read" })?;
        let range = checked_range(offset, len, data.len())?;
        Ok(&data[range])
    }

    fn write_at(&mut self, offset: usize, bytes: &[u8]) -> Result<()> {
        if self.is_read_only() {
            return Err(ContentError::NotSupported { operation: "write" }.into());
        }
        let data = self
            .data_mut()
            .ok_or(ContentError::InvalidMapping { operation: "write" })?;
        let range = checked_range(offset, bytes.len(), data.len())?;
        data[range].copy_from_slice(bytes);
        Ok(())
    }
}

impl fmt::Debug for dyn MemoryMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryMap")
            .field("size", &self.size())
            .field("read_only", &self.is_read_only())
            .field("valid", &self.is_valid())
            .finish()
    }
}

fn checked_range(offset: usize, len: usize, size: usize) -> Result<std::ops::Range<usize>> {
    match offset.checked_add(len) {
        Some(end) if end <= size => Ok(offset..end),
        _ => Err(ContentError::OutOfBounds { offset, len, size }.into()),
    }
}

/// Ordered list of pending unmap hooks.
#[derive(Default)]
pub struct UnmapHooks {
    hooks: SmallVec<[UnmapHook; INLINE_UNMAP_HOOKS]>,
    fired: bool,
}

impl fmt::Debug for UnmapHooks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UnmapHooks")
            .field("pending", &self.hooks.len())
            .field("fired", &self.fired)
            .finish()
    }
}

impl UnmapHooks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.hooks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hooks.is_empty()
    }

    /// Queues `hook`. If the hooks already fired, `hook` runs immediately with
    /// an empty view.
    pub fn register(&mut self, hook: UnmapHook) {
        if self.fired {
            let empty: &[u8] = &[];
            if let Err(err) = hook(empty) {
                warn!(error = %err, "late unmap hook failed");
            }
            return;
        }
        self.hooks.push(hook);
    }

    /// Runs every queued hook in order with `view`, once.
    pub fn fire(&mut self, view: &[u8]) -> Result<()> {
        self.fired = true;

        let mut first_err = None;
        for hook in self.hooks.drain(..) {
            if let Err(err) = hook(view) {
                if first_err.is_none() {
                    first_err = Some(err);
                } else {
                    warn!(error = %err, "additional unmap hook failed");
                }
            }
        }

        match first_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::Arc;

    fn recorder(log: &Arc<Mutex<Vec<String>>>, name: &'static str) -> UnmapHook {
        let log = Arc::clone(log);
        Box::new(move |view: &[u8]| {
            log.lock().push(format!("{}:{}", name, view.len()));
            Ok::<(), eyre::Report>(())
        })
    }

    #[test]
    fn hooks_fire_once_in_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut hooks = UnmapHooks::new();
        hooks.register(recorder(&log, "a"));
        hooks.register(recorder(&log, "b"));

        hooks.fire(b"xyz").unwrap();
        hooks.fire(b"xyz").unwrap();

        assert_eq!(*log.lock(), vec!["a:3".to_string(), "b:3".to_string()]);
        assert!(hooks.is_empty());
    }

    #[test]
    fn failing_hook_does_not_stop_later_hooks() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut hooks = UnmapHooks::new();
        hooks.register(Box::new(|_: &[u8]| Err::<(), _>(eyre::eyre!("flush failed"))));
        hooks.register(recorder(&log, "after"));

        let err = hooks.fire(b"").unwrap_err();

        assert!(err.to_string().contains("flush failed"));
        assert_eq!(*log.lock(), vec!["after:0".to_string()]);
    }

    #[test]
    fn late_hook_runs_immediately() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut hooks = UnmapHooks::new();
        hooks.fire(b"abc").unwrap();

        hooks.register(recorder(&log, "late"));

        assert_eq!(*log.lock(), vec!["late:0".to_string()]);
    }

    #[test]
    fn checked_range_rejects_overflow() {
        assert_eq!(checked_range(2, 3, 5).unwrap(), 2..5);
        assert!(checked_range(2, 4, 5).is_err());
        assert!(checked_range(usize::MAX, 2, 5).is_err());
    }
}
