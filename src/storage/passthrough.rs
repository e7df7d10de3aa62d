//! # Passthrough Memory Map
//!
//! `PassthroughMemoryMap<S>` presents a buffer that some other component
//! already owns as a [`MemoryMap`]. The adapter knows nothing about `S`; it
//! is driven by a [`PassthroughOps`] table of plain functions:
//!
//! ```text
//! data(&S) -> &[u8]          view of the buffer
//! data_mut(&mut S) -> &mut [u8]
//! size(&S) -> usize
//! resize(&mut S, n) -> Result<()>
//! ```
//!
//! The key/value repository uses it to expose a decoded value, with an unmap
//! hook that writes the bytes back. `unmap()` runs the hooks with the current
//! view and then drops `S`; what dropping means (freeing, returning a pooled
//! buffer, nothing at all) is up to `S`.

use std::fmt;

use eyre::{bail, Result};
use tracing::warn;

use super::map::{MemoryMap, UnmapHook, UnmapHooks};
use crate::config::UNMAPPED_SIZE;
use crate::error::ContentError;

pub struct PassthroughOps<S> {
    pub data: fn(&S) -> &[u8],
    pub data_mut: fn(&mut S) -> &mut [u8],
    pub size: fn(&S) -> usize,
    pub resize: fn(&mut S, usize) -> Result<()>,
}

impl<S> Clone for PassthroughOps<S> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<S> Copy for PassthroughOps<S> {}

impl PassthroughOps<Vec<u8>> {
    /// Operations for a plain byte vector; resizing zero-fills.
    pub fn vec() -> Self {
        Self {
            data: Vec::as_slice,
            data_mut: Vec::as_mut_slice,
            size: Vec::len,
            resize: |buf, new_size| {
                buf.resize(new_size, 0);
                Ok(())
            },
        }
    }
}

pub struct PassthroughMemoryMap<S> {
    state: Option<S>,
    ops: PassthroughOps<S>,
    read_only: bool,
    hooks: UnmapHooks,
}

impl<S> fmt::Debug for PassthroughMemoryMap<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PassthroughMemoryMap")
            .field("size", &self.state.as_ref().map(|s| (self.ops.size)(s)))
            .field("read_only", &self.read_only)
            .field("hooks", &self.hooks)
            .finish()
    }
}

impl<S> PassthroughMemoryMap<S> {
    pub fn new(state: S, ops: PassthroughOps<S>, read_only: bool) -> Self {
        Self {
            state: Some(state),
            ops,
            read_only,
            hooks: UnmapHooks::new(),
        }
    }

    fn release(&mut self) -> Result<()> {
        let state = self.state.take();
        let bytes: &[u8] = match &state {
            Some(state) => (self.ops.data)(state),
            None => &[],
        };

        let result = self.hooks.fire(bytes);
        drop(state);
        result
    }
}

impl<S: Send> MemoryMap for PassthroughMemoryMap<S> {
    fn data(&self) -> Option<&[u8]> {
        self.state.as_ref().map(|state| (self.ops.data)(state))
    }

    fn data_mut(&mut self) -> Option<&mut [u8]> {
        if self.read_only {
            return None;
        }
        let data_mut = self.ops.data_mut;
        self.state.as_mut().map(data_mut)
    }

    fn size(&self) -> usize {
        self.state
            .as_ref()
            .map_or(UNMAPPED_SIZE, |state| (self.ops.size)(state))
    }

    fn is_read_only(&self) -> bool {
        self.read_only
    }

    fn unmap(&mut self) -> Result<()> {
        self.release()
    }

    fn resize(&mut self, new_size: usize) -> Result<&mut [u8]> {
        if self.read_only {
            bail!(ContentError::NotSupported {
                operation: "resize"
            });
        }

        let Some(state) = self.state.as_mut() else {
            bail!(ContentError::InvalidMapping {
                operation: "resize"
            });
        };

        (self.ops.resize)(state, new_size)?;
        Ok((self.ops.data_mut)(state))
    }

    fn register_unmap_hook(&mut self, hook: UnmapHook) {
        self.hooks.register(hook);
    }
}

impl<S> Drop for PassthroughMemoryMap<S> {
    fn drop(&mut self) {
        if let Err(err) = self.release() {
            warn!(error = %err, "unmap hook failed on drop of passthrough mapping");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{error_kind, ErrorKind};
    use parking_lot::Mutex;
    use std::sync::Arc;

    struct Fixed {
        bytes: [u8; 8],
        len: usize,
    }

    fn fixed_ops() -> PassthroughOps<Fixed> {
        PassthroughOps {
            data: |f| &f.bytes[..f.len],
            data_mut: |f| &mut f.bytes[..f.len],
            size: |f| f.len,
            resize: |f, new_size| {
                if new_size > f.bytes.len() {
                    eyre::bail!("fixed buffer holds at most {} bytes", f.bytes.len());
                }
                f.bytes[f.len.min(new_size)..].fill(0);
                f.len = new_size;
                Ok(())
            },
        }
    }

    #[test]
    fn delegates_to_vec_buffer() {
        let mut map = PassthroughMemoryMap::new(b"abc".to_vec(), PassthroughOps::vec(), false);

        assert_eq!(map.data().unwrap(), b"abc");
        assert_eq!(map.size(), 3);
        map.write_at(1, b"Z").unwrap();
        assert_eq!(map.resize(5).unwrap(), b"aZc\0\0");
        assert_eq!(map.size(), 5);
    }

    #[test]
    fn unmap_fires_hooks_with_current_view() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut map = PassthroughMemoryMap::new(b"hello".to_vec(), PassthroughOps::vec(), false);

        let sink = Arc::clone(&seen);
        map.register_unmap_hook(Box::new(move |view: &[u8]| {
            sink.lock().push(view.to_vec());
            Ok(())
        }));
        map.resize(2).unwrap();

        map.unmap().unwrap();
        map.unmap().unwrap();

        assert_eq!(*seen.lock(), vec![b"he".to_vec()]);
        assert!(map.data().is_none());
        assert_eq!(map.size(), UNMAPPED_SIZE);
    }

    #[test]
    fn read_only_rejects_mutation() {
        let mut map = PassthroughMemoryMap::new(vec![1, 2, 3], PassthroughOps::vec(), true);

        assert!(map.data_mut().is_none());
        let err = map.resize(1).unwrap_err();
        assert_eq!(error_kind(&err), Some(ErrorKind::NotSupported));
        let err = map.write_at(0, &[9]).unwrap_err();
        assert_eq!(error_kind(&err), Some(ErrorKind::NotSupported));
    }

    #[test]
    fn resize_failure_propagates_from_ops() {
        let state = Fixed {
            bytes: *b"12345678",
            len: 4,
        };
        let mut map = PassthroughMemoryMap::new(state, fixed_ops(), false);

        assert!(map.resize(9).is_err());
        assert_eq!(map.size(), 4);
        assert_eq!(map.resize(6).unwrap(), b"1234\0\0");
    }

    #[test]
    fn resize_after_unmap_is_invalid() {
        let mut map = PassthroughMemoryMap::new(Vec::new(), PassthroughOps::vec(), false);
        map.unmap().unwrap();

        let err = map.resize(1).unwrap_err();

        assert_eq!(error_kind(&err), Some(ErrorKind::InvalidMapping));
    }
}
