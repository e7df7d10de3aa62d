//! # Volatile Repository
//!
//! Content lives only in process memory, in an [`EntryTable<String>`] keyed
//! by claim identifier. Nothing survives the repository.
//!
//! ## Limits
//!
//! The table enforces `max_bytes` over all values and `max_count` entries.
//! Growth past either fails with `CapacityExceeded`; nothing is evicted.
//! An entry created by an open that then fails is removed again, so a
//! failed write leaves no empty content behind.
//!
//! ## Locking
//!
//! Each value sits behind its own lock. Writable mappings and writer streams
//! hold the write side, readers the read side, and nothing waits: a request
//! that conflicts with a live holder fails with `WriterActive`.

use std::io::{self, Read, Write};
use std::sync::Arc;

use eyre::Result;
use tracing::{debug, warn};

use super::lease::{hold_until_unmap, WriteLease, WriterRegistry};
use super::stream::{check_seek, closed_stream, ContentReader, ContentWriter};
use super::{ensure_unreferenced, missing_content, ContentRepository};
use crate::claim::{ClaimRef, ResourceClaim};
use crate::config::{DEFAULT_VOLATILE_MAX_BYTES, DEFAULT_VOLATILE_MAX_COUNT};
use crate::error::ContentError;
use crate::memory::{EntryBorrow, EntryTable, Removal, ValueReadGuard, ValueWriteGuard};
use crate::storage::{AtomicEntryMemoryMap, MemoryMap};

#[derive(Debug)]
pub struct VolatileRepository {
    table: EntryTable<String>,
    writers: Arc<WriterRegistry>,
}

impl Default for VolatileRepository {
    fn default() -> Self {
        Self::new(DEFAULT_VOLATILE_MAX_BYTES, DEFAULT_VOLATILE_MAX_COUNT)
    }
}

impl VolatileRepository {
    pub const NAME: &'static str = "VolatileContentRepository";

    pub fn new(max_bytes: usize, max_count: usize) -> Self {
        let table = EntryTable::new(max_bytes, max_count);
        debug!(stats = ?table.budget().stats(), "opened volatile content repository");

        Self {
            table,
            writers: Arc::new(WriterRegistry::new()),
        }
    }

    pub fn table(&self) -> &EntryTable<String> {
        &self.table
    }

    fn key(claim: &ResourceClaim) -> String {
        claim.identifier().to_string()
    }

    /// Borrows the entry for `key`, creating it if absent, and hands it to
    /// `open`. Call with the writer lease held, so no one else can create
    /// the entry meanwhile.
    fn open_entry<T>(
        &self,
        key: String,
        open: impl FnOnce(EntryBorrow<String>) -> Result<T>,
    ) -> Result<T> {
        let created = !self.table.contains(&key);
        let borrow = self.table.get_or_insert(key.clone())?;

        open(borrow).map_err(|err| {
            if created {
                if let Removal::Owned(owners) = self.table.remove(&key) {
                    warn!(claim = %key, owners, "entry from failed open still owned");
                }
            }
            err
        })
    }
}

impl ContentRepository for VolatileRepository {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn exists(&self, claim: &ResourceClaim) -> Result<bool> {
        Ok(self.table.contains(&Self::key(claim)))
    }

    fn size(&self, claim: &ResourceClaim) -> Result<Option<u64>> {
        Ok(self.table.value_len(&Self::key(claim)).map(|len| len as u64))
    }

    fn mmap(
        &self,
        claim: &Arc<ResourceClaim>,
        size: usize,
        read_only: bool,
    ) -> Result<Box<dyn MemoryMap>> {
        let reference = claim.acquire();
        let key = Self::key(claim);

        let (mut map, lease) = if read_only {
            let borrow = self
                .table
                .borrow(&key)
                .ok_or_else(|| missing_content(claim, size))?;
            (AtomicEntryMemoryMap::with_borrow(borrow, size, true)?, None)
        } else {
            let lease = self.writers.acquire(claim)?;
            let map = self.open_entry(key, |borrow| {
                AtomicEntryMemoryMap::with_borrow(borrow, size, false)
            })?;
            (map, Some(lease))
        };

        hold_until_unmap(&mut map, reference, lease);
        Ok(Box::new(map))
    }

    fn read(&self, claim: &Arc<ResourceClaim>) -> Result<Box<dyn ContentReader>> {
        let reference = claim.acquire();

        let borrow = self
            .table
            .borrow(&Self::key(claim))
            .ok_or_else(|| missing_content(claim, 0))?;

        let value = borrow
            .try_read_value()
            .ok_or_else(|| ContentError::WriterActive {
                claim: Self::key(claim),
            })?;

        Ok(Box::new(VolatileReader {
            value,
            position: 0,
            _borrow: borrow,
            _reference: reference,
        }))
    }

    fn write(&self, claim: &Arc<ResourceClaim>, append: bool) -> Result<Box<dyn ContentWriter>> {
        let reference = claim.acquire();
        let lease = self.writers.acquire(claim)?;
        let (borrow, value) = self.open_entry(Self::key(claim), |borrow| {
            let mut value = borrow
                .try_write_value()
                .ok_or_else(|| ContentError::WriterActive {
                    claim: Self::key(claim),
                })?;

            if !append {
                borrow.resize_value(&mut value, 0)?;
            }
            Ok((borrow, value))
        })?;

        Ok(Box::new(VolatileWriter {
            value: Some(value),
            borrow,
            written: 0,
            lease: Some(lease),
            _reference: reference,
        }))
    }

    fn remove(&self, claim: &ResourceClaim) -> Result<bool> {
        ensure_unreferenced(claim)?;

        match self.table.remove(&Self::key(claim)) {
            Removal::Removed => Ok(true),
            Removal::Absent => Ok(false),
            Removal::Owned(owners) => Err(ContentError::ClaimInUse {
                claim: Self::key(claim),
                references: owners as u64,
            }
            .into()),
        }
    }
}

struct VolatileReader {
    value: ValueReadGuard,
    position: usize,
    _borrow: EntryBorrow<String>,
    _reference: ClaimRef,
}

impl Read for VolatileReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let remaining = &self.value[self.position.min(self.value.len())..];
        let n = remaining.len().min(buf.len());
        buf[..n].copy_from_slice(&remaining[..n]);
        self.position += n;
        Ok(n)
    }
}

impl ContentReader for VolatileReader {
    fn len(&self) -> u64 {
        self.value.len() as u64
    }

    fn position(&self) -> u64 {
        self.position as u64
    }

    fn seek(&mut self, offset: u64) -> Result<()> {
        check_seek(offset, self.len())?;
        // offset <= len, so it fits in usize
        self.position = offset as usize;
        Ok(())
    }
}

struct VolatileWriter {
    value: Option<ValueWriteGuard>,
    borrow: EntryBorrow<String>,
    written: u64,
    lease: Option<WriteLease>,
    _reference: ClaimRef,
}

impl Write for VolatileWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let value = self.value.as_mut().ok_or_else(closed_stream)?;
        self.borrow
            .append_value(value, buf)
            .map_err(io::Error::other)?;
        self.written += buf.len() as u64;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl ContentWriter for VolatileWriter {
    fn bytes_written(&self) -> u64 {
        self.written
    }

    fn close(&mut self) -> Result<()> {
        self.release();
        Ok(())
    }
}

impl VolatileWriter {
    fn release(&mut self) {
        if self.value.take().is_some() {
            self.lease = None;
            debug!(claim = %self.borrow.key(), bytes = self.written, "closed volatile writer");
        }
    }
}

impl Drop for VolatileWriter {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MIN_VOLATILE_MAX_BYTES;
    use crate::error::{error_kind, ErrorKind};

    fn repository() -> (Arc<VolatileRepository>, Arc<dyn ContentRepository>) {
        let concrete = Arc::new(VolatileRepository::new(MIN_VOLATILE_MAX_BYTES, 4));
        let shared: Arc<dyn ContentRepository> = concrete.clone();
        (concrete, shared)
    }

    #[test]
    fn writable_mmap_round_trip() {
        let (_, repo) = repository();
        let claim = ResourceClaim::new("a", &repo);

        let mut map = repo.mmap(&claim, 10, false).unwrap();
        map.write_at(0, b"hello").unwrap();
        assert_eq!(&map.data().unwrap()[5..], &[0u8; 5]);
        drop(map);

        let map = repo.mmap(&claim, 5, true).unwrap();
        assert_eq!(map.data().unwrap(), b"hello");
        assert!(repo.mmap(&claim, 11, true).is_err());
    }

    #[test]
    fn read_only_mmap_of_absent_claim_fails_without_leak() {
        let (concrete, repo) = repository();
        let claim = ResourceClaim::new("absent", &repo);

        let err = repo.mmap(&claim, 3, true).unwrap_err();

        assert_eq!(error_kind(&err), Some(ErrorKind::InsufficientBackingStore));
        assert!(concrete.table().is_empty());
        assert_eq!(claim.ref_count(), 0);
    }

    #[test]
    fn stream_round_trip() {
        let (_, repo) = repository();
        let claim = ResourceClaim::new("s", &repo);

        let mut writer = repo.write(&claim, false).unwrap();
        writer.write_data(&[1, 2, 3]).unwrap();
        writer.close().unwrap();

        let mut reader = repo.read(&claim).unwrap();
        let mut buf = Vec::new();
        assert_eq!(reader.read_data(&mut buf, 3).unwrap(), 3);
        assert_eq!(buf, vec![1, 2, 3]);
    }

    #[test]
    fn replace_writer_truncates_and_append_extends() {
        let (_, repo) = repository();
        let claim = ResourceClaim::new("s", &repo);

        repo.write(&claim, false).unwrap().write_data(b"abcdef").unwrap();
        repo.write(&claim, false).unwrap().write_data(b"xy").unwrap();
        repo.write(&claim, true).unwrap().write_data(b"z").unwrap();

        assert_eq!(repo.size(&claim).unwrap(), Some(3));
        let map = repo.mmap(&claim, 3, true).unwrap();
        assert_eq!(map.data().unwrap(), b"xyz");
    }

    #[test]
    fn reader_conflicts_with_open_writer() {
        let (_, repo) = repository();
        let claim = ResourceClaim::new("busy", &repo);

        let writer = repo.write(&claim, false).unwrap();
        let err = repo.read(&claim).unwrap_err();
        assert_eq!(error_kind(&err), Some(ErrorKind::WriterActive));
        let err = repo.mmap(&claim, 0, true).unwrap_err();
        assert_eq!(error_kind(&err), Some(ErrorKind::WriterActive));
        drop(writer);

        assert!(repo.read(&claim).is_ok());
    }

    #[test]
    fn budget_limits_growth() {
        let (concrete, repo) = repository();
        let claim = ResourceClaim::new("big", &repo);

        let err = repo.mmap(&claim, MIN_VOLATILE_MAX_BYTES + 1, false).unwrap_err();
        assert_eq!(error_kind(&err), Some(ErrorKind::CapacityExceeded));
        assert!(!repo.exists(&claim).unwrap());
        assert_eq!(repo.size(&claim).unwrap(), None);
        assert!(concrete.table().is_empty());
        assert_eq!(claim.ref_count(), 0);

        let mut writer = repo.write(&claim, false).unwrap();
        let big = vec![0u8; MIN_VOLATILE_MAX_BYTES + 1];
        assert!(writer.write_data(&big).is_err());
        assert_eq!(concrete.table().budget().bytes_used(), 0);
    }

    #[test]
    fn failed_open_keeps_existing_entry() {
        let (concrete, repo) = repository();
        let claim = ResourceClaim::new("kept", &repo);
        repo.write(&claim, false).unwrap().write_data(b"abc").unwrap();

        assert!(repo.mmap(&claim, MIN_VOLATILE_MAX_BYTES + 1, false).is_err());

        assert_eq!(repo.size(&claim).unwrap(), Some(3));
        assert_eq!(concrete.table().len(), 1);
    }

    #[test]
    fn failed_open_frees_count_slot() {
        let concrete = Arc::new(VolatileRepository::new(MIN_VOLATILE_MAX_BYTES, 1));
        let repo: Arc<dyn ContentRepository> = concrete.clone();
        let big = ResourceClaim::new("big", &repo);
        let small = ResourceClaim::new("small", &repo);

        assert!(repo.mmap(&big, MIN_VOLATILE_MAX_BYTES + 1, false).is_err());

        repo.write(&small, false).unwrap().write_data(b"fits").unwrap();
        assert_eq!(repo.size(&small).unwrap(), Some(4));
    }

    #[test]
    fn remove_waits_for_holders() {
        let (concrete, repo) = repository();
        let claim = ResourceClaim::new("r", &repo);
        repo.write(&claim, false).unwrap().write_data(b"abc").unwrap();

        let reader = repo.read(&claim).unwrap();
        let err = repo.remove(&claim).unwrap_err();
        assert_eq!(error_kind(&err), Some(ErrorKind::ClaimInUse));
        drop(reader);

        assert!(repo.remove(&claim).unwrap());
        assert!(!repo.exists(&claim).unwrap());
        assert_eq!(concrete.table().budget().bytes_used(), 0);
        assert_eq!(concrete.table().total_owners(), 0);
    }

    #[test]
    fn every_path_releases_ownership() {
        let (concrete, repo) = repository();
        let claim = ResourceClaim::new("o", &repo);

        drop(repo.mmap(&claim, 4, false).unwrap());
        drop(repo.mmap(&claim, 4, true).unwrap());
        let _ = repo.mmap(&claim, 5, true);
        drop(repo.read(&claim).unwrap());
        drop(repo.write(&claim, true).unwrap());

        assert_eq!(concrete.table().total_owners(), 0);
        assert_eq!(claim.ref_count(), 0);
    }
}
