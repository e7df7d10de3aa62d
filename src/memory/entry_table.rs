//! # Atomic Entry Table
//!
//! The volatile repository keeps content in an [`EntryTable`]: a map from a
//! typed key to a shared, reference-counted byte buffer ([`AtomicEntry`]).
//!
//! ## Ownership Protocol
//!
//! Every entry carries an owner count. The only way to raise it is to obtain
//! an [`EntryBorrow`] from the table, and the only way to lower it is to drop
//! that borrow:
//!
//! 1. `borrow(key)` increments the count while holding the table's read lock
//! 2. the caller reads or writes the value through the borrow
//! 3. dropping the borrow decrements the count exactly once
//!
//! A lookup that misses returns `None` and touches no counter, so the not-found
//! path cannot leak ownership.
//!
//! `remove(key)` takes the table's write lock and refuses while the owner
//! count is positive. Because borrows are only handed out under the read lock,
//! no borrow can appear between the check and the removal.
//!
//! ## Value Locking
//!
//! The buffer itself sits behind a `parking_lot::RwLock`. Mappings and streams
//! hold an owned (`Arc`) guard for their whole lifetime: writers hold the write
//! guard, readers hold read guards. Guards are `Send` so mappings can move
//! between threads. The `try_*` accessors never block, which lets callers
//! reject a conflicting holder instead of waiting on it.
//!
//! ## Accounting
//!
//! All size changes go through [`AtomicEntry::resize_value`] and
//! [`AtomicEntry::append_value`], which charge the shared [`ContentBudget`]
//! before touching the buffer.

use std::collections::HashMap;
use std::fmt;
use std::hash::Hash;
use std::ops::Deref;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::{ArcRwLockReadGuard, ArcRwLockWriteGuard, RawRwLock, RwLock};
use tracing::trace;

use super::budget::ContentBudget;
use crate::error::ContentError;

pub type ValueReadGuard = ArcRwLockReadGuard<RawRwLock, Vec<u8>>;
pub type ValueWriteGuard = ArcRwLockWriteGuard<RawRwLock, Vec<u8>>;

pub struct AtomicEntry<K> {
    key: K,
    value: Arc<RwLock<Vec<u8>>>,
    len: AtomicUsize,
    owners: AtomicUsize,
    budget: Arc<ContentBudget>,
}

impl<K: fmt::Debug> fmt::Debug for AtomicEntry<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AtomicEntry")
            .field("key", &self.key)
            .field("len", &self.len())
            .field("owners", &self.owner_count())
            .finish()
    }
}

impl<K> AtomicEntry<K> {
    fn new(key: K, budget: Arc<ContentBudget>) -> Self {
        Self {
            key,
            value: Arc::new(RwLock::new(Vec::new())),
            len: AtomicUsize::new(0),
            owners: AtomicUsize::new(0),
            budget,
        }
    }

    pub fn key(&self) -> &K {
        &self.key
    }

    /// Current length of the value. Readable while another thread holds the
    /// value's write guard.
    pub fn len(&self) -> usize {
        self.len.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn owner_count(&self) -> usize {
        self.owners.load(Ordering::Acquire)
    }

    pub fn read_value(&self) -> ValueReadGuard {
        self.value.read_arc()
    }

    pub fn write_value(&self) -> ValueWriteGuard {
        self.value.write_arc()
    }

    /// Like [`read_value`](Self::read_value) but returns `None` instead of
    /// blocking while a writer holds the value.
    pub fn try_read_value(&self) -> Option<ValueReadGuard> {
        self.value.try_read_arc()
    }

    pub fn try_write_value(&self) -> Option<ValueWriteGuard> {
        self.value.try_write_arc()
    }

    /// Grows (zero-filled) or truncates the value held by `guard`.
    ///
    /// `guard` must be this entry's write guard.
    pub fn resize_value(&self, guard: &mut ValueWriteGuard, new_len: usize) -> Result<(), ContentError> {
        debug_assert!(
            std::ptr::eq(&**guard, self.value.data_ptr()),
            "guard belongs to a different entry"
        );
        self.budget.adjust(guard.len(), new_len)?;
        guard.resize(new_len, 0);
        self.len.store(new_len, Ordering::Release);
        Ok(())
    }

    pub fn append_value(&self, guard: &mut ValueWriteGuard, bytes: &[u8]) -> Result<(), ContentError> {
        debug_assert!(
            std::ptr::eq(&**guard, self.value.data_ptr()),
            "guard belongs to a different entry"
        );
        self.budget.allocate(bytes.len())?;
        guard.extend_from_slice(bytes);
        self.len.store(guard.len(), Ordering::Release);
        Ok(())
    }

    fn take_owner(&self) -> usize {
        self.owners.fetch_add(1, Ordering::AcqRel) + 1
    }

    fn drop_owner(&self) -> usize {
        let prev = self.owners.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0, "entry ownership released below zero");
        prev - 1
    }
}

/// Scope guard holding one ownership on an [`AtomicEntry`].
pub struct EntryBorrow<K> {
    entry: Arc<AtomicEntry<K>>,
}

impl<K: fmt::Debug> fmt::Debug for EntryBorrow<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("EntryBorrow").field(&self.entry).finish()
    }
}

impl<K> EntryBorrow<K> {
    fn new(entry: Arc<AtomicEntry<K>>) -> Self {
        entry.take_owner();
        Self { entry }
    }
}

impl<K> Clone for EntryBorrow<K> {
    fn clone(&self) -> Self {
        Self::new(Arc::clone(&self.entry))
    }
}

impl<K> Deref for EntryBorrow<K> {
    type Target = AtomicEntry<K>;

    fn deref(&self) -> &AtomicEntry<K> {
        &self.entry
    }
}

impl<K> Drop for EntryBorrow<K> {
    fn drop(&mut self) {
        self.entry.drop_owner();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Removal {
    Removed,
    Absent,
    Owned(usize),
}

pub struct EntryTable<K> {
    entries: RwLock<HashMap<K, Arc<AtomicEntry<K>>>>,
    budget: Arc<ContentBudget>,
}

impl<K> fmt::Debug for EntryTable<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EntryTable")
            .field("entries", &self.entries.read().len())
            .field("budget", &self.budget.stats())
            .finish()
    }
}

impl<K> EntryTable<K>
where
    K: Eq + Hash + Clone + fmt::Debug,
{
    pub fn new(max_bytes: usize, max_count: usize) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            budget: Arc::new(ContentBudget::new(max_bytes, max_count)),
        }
    }

    pub fn budget(&self) -> &ContentBudget {
        &self.budget
    }

    pub fn borrow(&self, key: &K) -> Option<EntryBorrow<K>> {
        let entries = self.entries.read();
        entries.get(key).map(|entry| EntryBorrow::new(Arc::clone(entry)))
    }

    pub fn get_or_insert(&self, key: K) -> Result<EntryBorrow<K>, ContentError> {
        if let Some(borrow) = self.borrow(&key) {
            return Ok(borrow);
        }

        let mut entries = self.entries.write();

        if let Some(entry) = entries.get(&key) {
            return Ok(EntryBorrow::new(Arc::clone(entry)));
        }

        self.budget.admit_entry()?;
        trace!(key = ?key, "volatile entry created");

        let entry = Arc::new(AtomicEntry::new(key.clone(), Arc::clone(&self.budget)));
        entries.insert(key, Arc::clone(&entry));
        Ok(EntryBorrow::new(entry))
    }

    pub fn contains(&self, key: &K) -> bool {
        self.entries.read().contains_key(key)
    }

    pub fn value_len(&self, key: &K) -> Option<usize> {
        self.entries.read().get(key).map(|entry| entry.len())
    }

    pub fn owner_count(&self, key: &K) -> Option<usize> {
        self.entries.read().get(key).map(|entry| entry.owner_count())
    }

    /// Sum of owner counts over every entry in the table.
    pub fn total_owners(&self) -> usize {
        self.entries
            .read()
            .values()
            .map(|entry| entry.owner_count())
            .sum()
    }

    pub fn remove(&self, key: &K) -> Removal {
        let mut entries = self.entries.write();

        let owners = match entries.get(key) {
            Some(entry) => entry.owner_count(),
            None => return Removal::Absent,
        };

        if owners > 0 {
            return Removal::Owned(owners);
        }

        if let Some(entry) = entries.remove(key) {
            self.budget.release(entry.len());
            self.budget.retire_entry();
            trace!(key = ?key, "volatile entry removed");
        }

        Removal::Removed
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
