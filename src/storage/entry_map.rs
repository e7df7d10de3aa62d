//! # Entry-Backed Memory Map
//!
//! `AtomicEntryMemoryMap<K>` exposes a value held in an [`EntryTable<K>`] as
//! a [`MemoryMap`], so code written against the mapping capability cannot
//! tell in-process content from on-disk content.
//!
//! ## Lifecycle
//!
//! ```text
//! new(key, table, size, read_only)
//!   ├── key absent   -> invalid map: data() = None, size() = UNMAPPED_SIZE,
//!   │                   no ownership taken
//!   └── key present  -> EntryBorrow taken (owner count +1)
//!         ├── writable  -> value write guard held, value resized to `size`
//!         └── read-only -> value read guard held, value must hold `size` bytes
//! unmap()            -> hooks run with the last view, value guard released
//! drop               -> unmap() if needed, then EntryBorrow dropped (owner -1)
//! ```
//!
//! The owner count is tied to the `EntryBorrow` field, so it is released
//! exactly once on every path, including construction failures.
//!
//! ## Locking
//!
//! Guards are taken with `try_*`, so a map never blocks on a conflicting
//! holder of the same value. A writable map conflicts with any other map of
//! the same entry; read-only maps share. Conflicts fail with `WriterActive`.

use std::fmt;
use std::hash::Hash;

use eyre::{bail, Result};
use tracing::{debug, warn};

use super::map::{MemoryMap, UnmapHook, UnmapHooks};
use crate::config::UNMAPPED_SIZE;
use crate::error::ContentError;
use crate::memory::{EntryBorrow, EntryTable, ValueReadGuard, ValueWriteGuard};

enum View {
    Read(ValueReadGuard),
    Write(ValueWriteGuard),
    Released,
}

pub struct AtomicEntryMemoryMap<K> {
    view: View,
    borrow: Option<EntryBorrow<K>>,
    size: usize,
    read_only: bool,
    hooks: UnmapHooks,
}

impl<K: fmt::Debug> fmt::Debug for AtomicEntryMemoryMap<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AtomicEntryMemoryMap")
            .field("key", &self.borrow.as_ref().map(|b| b.key()))
            .field("size", &self.size)
            .field("read_only", &self.read_only)
            .field("hooks", &self.hooks)
            .finish()
    }
}

impl<K> AtomicEntryMemoryMap<K>
where
    K: Eq + Hash + Clone + fmt::Debug,
{
    /// Maps the value stored under `key`. A missing key yields an invalid
    /// mapping rather than an error.
    pub fn new(key: &K, table: &EntryTable<K>, size: usize, read_only: bool) -> Result<Self> {
        match table.borrow(key) {
            Some(borrow) => Self::with_borrow(borrow, size, read_only),
            None => {
                debug!(key = ?key, "volatile entry not found, mapping is invalid");
                Ok(Self {
                    view: View::Released,
                    borrow: None,
                    size: UNMAPPED_SIZE,
                    read_only,
                    hooks: UnmapHooks::new(),
                })
            }
        }
    }

    pub fn with_borrow(borrow: EntryBorrow<K>, size: usize, read_only: bool) -> Result<Self> {
        let view = if read_only {
            let Some(guard) = borrow.try_read_value() else {
                bail!(ContentError::WriterActive {
                    claim: format!("{:?}", borrow.key()),
                });
            };
            if guard.len() < size {
                bail!(ContentError::InsufficientBackingStore {
                    claim: format!("{:?}", borrow.key()),
                    requested: size,
                    available: guard.len() as u64,
                });
            }
            View::Read(guard)
        } else {
            let Some(mut guard) = borrow.try_write_value() else {
                bail!(ContentError::WriterActive {
                    claim: format!("{:?}", borrow.key()),
                });
            };
            borrow.resize_value(&mut guard, size)?;
            View::Write(guard)
        };

        debug!(key = ?borrow.key(), size, read_only, "mapped volatile entry");

        Ok(Self {
            view,
            borrow: Some(borrow),
            size,
            read_only,
            hooks: UnmapHooks::new(),
        })
    }

    pub fn key(&self) -> Option<&K> {
        self.borrow.as_ref().map(|borrow| borrow.key())
    }
}

impl<K> MemoryMap for AtomicEntryMemoryMap<K>
where
    K: Eq + Hash + Clone + fmt::Debug + Send + Sync,
{
    fn data(&self) -> Option<&[u8]> {
        match &self.view {
            View::Read(guard) => Some(&guard[..self.size]),
            View::Write(guard) => Some(&guard[..]),
            View::Released => None,
        }
    }

    fn data_mut(&mut self) -> Option<&mut [u8]> {
        match &mut self.view {
            View::Write(guard) => Some(&mut guard[..]),
            _ => None,
        }
    }

    fn size(&self) -> usize {
        match &self.view {
            View::Read(_) => self.size,
            View::Write(guard) => guard.len(),
            View::Released => UNMAPPED_SIZE,
        }
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

        let (Some(borrow), View::Write(guard)) = (&self.borrow, &mut self.view) else {
            bail!(ContentError::InvalidMapping {
                operation: "resize"
            });
        };

        borrow.resize_value(guard, new_size)?;
        self.size = new_size;
        Ok(&mut guard[..])
    }

    fn register_unmap_hook(&mut self, hook: UnmapHook) {
        self.hooks.register(hook);
    }
}

impl<K> AtomicEntryMemoryMap<K> {
    /// Runs the hooks with the last view and lets go of the value guard. The
    /// entry borrow stays until drop.
    fn release(&mut self) -> Result<()> {
        let view = std::mem::replace(&mut self.view, View::Released);
        let bytes: &[u8] = match &view {
            View::Read(guard) => &guard[..self.size],
            View::Write(guard) => &guard[..],
            View::Released => &[],
        };

        let result = self.hooks.fire(bytes);
        drop(view);
        result
    }
}

impl<K> Drop for AtomicEntryMemoryMap<K> {
    fn drop(&mut self) {
        if let Err(err) = self.release() {
            warn!(error = %err, "unmap hook failed on drop of volatile mapping");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MIN_VOLATILE_MAX_BYTES;
    use crate::error::{error_kind, ErrorKind};
    use parking_lot::Mutex;
    use std::sync::Arc;

    fn table() -> EntryTable<String> {
        EntryTable::new(MIN_VOLATILE_MAX_BYTES, 16)
    }

    fn seed(table: &EntryTable<String>, key: &str, bytes: &[u8]) {
        let entry = table.get_or_insert(key.to_string()).unwrap();
        let mut value = entry.write_value();
        entry.append_value(&mut value, bytes).unwrap();
    }

    #[test]
    fn missing_key_yields_invalid_map_without_leak() {
        let table = table();
        seed(&table, "other", b"x");

        {
            let map = AtomicEntryMemoryMap::new(&"absent".to_string(), &table, 10, false).unwrap();
            assert!(map.data().is_none());
            assert_eq!(map.size(), UNMAPPED_SIZE);
            assert!(!map.is_valid());
            assert!(map.key().is_none());
        }

        assert_eq!(table.total_owners(), 0);
        assert!(!table.contains(&"absent".to_string()));
    }

    #[test]
    fn writable_map_resizes_value() {
        let table = table();
        seed(&table, "k", b"abc");
        let key = "k".to_string();

        {
            let mut map = AtomicEntryMemoryMap::new(&key, &table, 6, false).unwrap();
            assert_eq!(map.data().unwrap(), b"abc\0\0\0");
            map.write_at(3, b"def").unwrap();
            assert_eq!(table.owner_count(&key), Some(1));
        }

        assert_eq!(table.owner_count(&key), Some(0));
        assert_eq!(table.value_len(&key), Some(6));
        let entry = table.borrow(&key).unwrap();
        assert_eq!(&entry.read_value()[..], b"abcdef");
    }

    #[test]
    fn read_only_map_exposes_requested_prefix() {
        let table = table();
        seed(&table, "k", b"helloworld");

        let mut map = AtomicEntryMemoryMap::new(&"k".to_string(), &table, 5, true).unwrap();

        assert_eq!(map.data().unwrap(), b"hello");
        assert_eq!(map.size(), 5);
        assert!(map.data_mut().is_none());
        let err = map.resize(10).unwrap_err();
        assert_eq!(error_kind(&err), Some(ErrorKind::NotSupported));
    }

    #[test]
    fn read_only_map_rejects_undersized_value() {
        let table = table();
        seed(&table, "k", b"helloworld");
        let key = "k".to_string();

        let err = AtomicEntryMemoryMap::new(&key, &table, 11, true).unwrap_err();

        assert_eq!(error_kind(&err), Some(ErrorKind::InsufficientBackingStore));
        assert_eq!(table.owner_count(&key), Some(0));
        assert_eq!(table.value_len(&key), Some(10));
    }

    #[test]
    fn readers_share_and_writer_conflicts() {
        let table = table();
        seed(&table, "k", b"data");
        let key = "k".to_string();

        let first = AtomicEntryMemoryMap::new(&key, &table, 4, true).unwrap();
        let second = AtomicEntryMemoryMap::new(&key, &table, 2, true).unwrap();
        let err = AtomicEntryMemoryMap::new(&key, &table, 4, false).unwrap_err();

        assert_eq!(error_kind(&err), Some(ErrorKind::WriterActive));
        assert_eq!(table.owner_count(&key), Some(2));
        drop((first, second));
        assert_eq!(table.owner_count(&key), Some(0));
    }

    #[test]
    fn unmap_runs_hooks_and_releases_guard() {
        let table = table();
        seed(&table, "k", b"xy");
        let key = "k".to_string();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let mut map = AtomicEntryMemoryMap::new(&key, &table, 2, false).unwrap();
        let sink = Arc::clone(&seen);
        map.register_unmap_hook(Box::new(move |view: &[u8]| {
            sink.lock().extend_from_slice(view);
            Ok(())
        }));

        map.unmap().unwrap();
        map.unmap().unwrap();

        assert_eq!(*seen.lock(), b"xy".to_vec());
        assert!(map.data().is_none());
        assert_eq!(map.size(), UNMAPPED_SIZE);
        // guard released, ownership still held until drop
        assert!(AtomicEntryMemoryMap::new(&key, &table, 2, false).is_ok());
        assert_eq!(table.owner_count(&key), Some(1));
        drop(map);
        assert_eq!(table.owner_count(&key), Some(0));
    }

    #[test]
    fn resize_grows_and_truncates() {
        let table = table();
        seed(&table, "k", b"\x01\x02");
        let key = "k".to_string();

        let mut map = AtomicEntryMemoryMap::new(&key, &table, 2, false).unwrap();
        assert_eq!(map.resize(4).unwrap(), b"\x01\x02\0\0");
        assert_eq!(map.resize(1).unwrap(), b"\x01");
        assert_eq!(map.size(), 1);
        map.unmap().unwrap();

        let err = map.resize(3).unwrap_err();
        assert_eq!(error_kind(&err), Some(ErrorKind::InvalidMapping));
        assert_eq!(table.budget().bytes_used(), 1);
    }

    #[test]
    fn resize_past_budget_fails() {
        let table = table();
        seed(&table, "k", b"");

        let mut map = AtomicEntryMemoryMap::new(&"k".to_string(), &table, 0, false).unwrap();
        let err = map.resize(MIN_VOLATILE_MAX_BYTES + 1).unwrap_err();

        assert_eq!(error_kind(&err), Some(ErrorKind::CapacityExceeded));
        assert_eq!(map.size(), 0);
    }

    #[test]
    fn generic_over_key_type() {
        let table: EntryTable<u64> = EntryTable::new(MIN_VOLATILE_MAX_BYTES, 4);
        table.get_or_insert(7).unwrap();

        let mut map = AtomicEntryMemoryMap::new(&7, &table, 3, false).unwrap();
        map.write_at(0, b"abc").unwrap();

        assert_eq!(map.key(), Some(&7));
        assert_eq!(map.read_at(1, 2).unwrap(), b"bc");
    }
}
