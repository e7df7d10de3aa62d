//! # Database Repository
//!
//! Content is stored in a `redb` key/value file, one row per claim in the
//! `content` table (claim identifier -> bytes). Every change is its own
//! committed write transaction, so content written through this backend is
//! durable once the writer closes or the mapping unmaps.
//!
//! ## Mapping
//!
//! A key/value store cannot hand out its pages, so `mmap` decodes the value
//! into an owned buffer and wraps it in a [`PassthroughMemoryMap`]:
//!
//! ```text
//! read-only : value loaded, checked against `size`, truncated to `size`
//! writable  : value loaded (or empty), resized to `size`,
//!             unmap hook writes the final buffer back and commits
//! ```
//!
//! Reads after a writable mapping is unmapped see exactly the bytes written.
//!
//! ## Streams
//!
//! Readers load the value once and serve it from memory. Writers buffer and
//! commit on `close()` (or drop); `append` starts from the stored value.

use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use eyre::{Result, WrapErr};
use redb::{Database, TableDefinition};
use tracing::{debug, warn};

use super::lease::{hold_until_unmap, WriteLease, WriterRegistry};
use super::stream::{closed_stream, BufferReader, ContentReader, ContentWriter};
use super::{ensure_unreferenced, missing_content, ContentRepository};
use crate::claim::{ClaimRef, ResourceClaim};
use crate::config::CONTENT_TABLE_NAME;
use crate::error::ContentError;
use crate::storage::{MemoryMap, PassthroughMemoryMap, PassthroughOps};

const CONTENT: TableDefinition<&str, &[u8]> = TableDefinition::new(CONTENT_TABLE_NAME);

pub struct DatabaseRepository {
    db: Arc<Database>,
    path: PathBuf,
    writers: Arc<WriterRegistry>,
}

impl std::fmt::Debug for DatabaseRepository {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DatabaseRepository")
            .field("path", &self.path)
            .finish()
    }
}

impl DatabaseRepository {
    pub const NAME: &'static str = "DatabaseContentRepository";

    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .map_err(|e| ContentError::io("create directory", parent, e))?;
        }

        let db = Database::create(path)
            .wrap_err_with(|| format!("failed to open content database '{}'", path.display()))?;

        let txn = db.begin_write().wrap_err("failed to begin write transaction")?;
        txn.open_table(CONTENT)
            .wrap_err("failed to create content table")?;
        txn.commit().wrap_err("failed to commit content table")?;

        debug!(path = %path.display(), "opened database content repository");

        Ok(Self {
            db: Arc::new(db),
            path: path.to_path_buf(),
            writers: Arc::new(WriterRegistry::new()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn load(&self, claim: &ResourceClaim) -> Result<Option<Vec<u8>>> {
        let txn = self
            .db
            .begin_read()
            .wrap_err("failed to begin read transaction")?;
        let table = txn.open_table(CONTENT).wrap_err("failed to open content table")?;

        let value = table
            .get(claim.identifier())
            .wrap_err_with(|| format!("failed to load content for claim '{}'", claim))?
            .map(|guard| guard.value().to_vec());

        Ok(value)
    }
}

fn store(db: &Database, key: &str, bytes: &[u8]) -> Result<()> {
    let txn = db.begin_write().wrap_err("failed to begin write transaction")?;
    {
        let mut table = txn.open_table(CONTENT).wrap_err("failed to open content table")?;
        table
            .insert(key, bytes)
            .wrap_err_with(|| format!("failed to store content for claim '{}'", key))?;
    }
    txn.commit().wrap_err("failed to commit content")?;

    debug!(claim = key, bytes = bytes.len(), "stored content");
    Ok(())
}

impl ContentRepository for DatabaseRepository {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn exists(&self, claim: &ResourceClaim) -> Result<bool> {
        Ok(self.load(claim)?.is_some())
    }

    fn size(&self, claim: &ResourceClaim) -> Result<Option<u64>> {
        Ok(self.load(claim)?.map(|value| value.len() as u64))
    }

    fn mmap(
        &self,
        claim: &Arc<ResourceClaim>,
        size: usize,
        read_only: bool,
    ) -> Result<Box<dyn MemoryMap>> {
        let reference = claim.acquire();

        if read_only {
            let mut value = self
                .load(claim)?
                .ok_or_else(|| missing_content(claim, size))?;

            if value.len() < size {
                return Err(ContentError::InsufficientBackingStore {
                    claim: claim.identifier().to_string(),
                    requested: size,
                    available: value.len() as u64,
                }
                .into());
            }
            value.truncate(size);

            let mut map = PassthroughMemoryMap::new(value, PassthroughOps::vec(), true);
            hold_until_unmap(&mut map, reference, ());
            return Ok(Box::new(map));
        }

        let lease = self.writers.acquire(claim)?;
        let mut value = self.load(claim)?.unwrap_or_default();
        value.resize(size, 0);

        let mut map = PassthroughMemoryMap::new(value, PassthroughOps::vec(), false);

        let db = Arc::clone(&self.db);
        let key = claim.identifier().to_string();
        map.register_unmap_hook(Box::new(move |view: &[u8]| store(&db, &key, view)));
        hold_until_unmap(&mut map, reference, lease);

        Ok(Box::new(map))
    }

    fn read(&self, claim: &Arc<ResourceClaim>) -> Result<Box<dyn ContentReader>> {
        let reference = claim.acquire();
        let value = self
            .load(claim)?
            .ok_or_else(|| missing_content(claim, 0))?;

        Ok(Box::new(DatabaseReader {
            bytes: BufferReader::new(value),
            _reference: reference,
        }))
    }

    fn write(&self, claim: &Arc<ResourceClaim>, append: bool) -> Result<Box<dyn ContentWriter>> {
        let reference = claim.acquire();
        let lease = self.writers.acquire(claim)?;

        let buffer = if append {
            self.load(claim)?.unwrap_or_default()
        } else {
            Vec::new()
        };

        Ok(Box::new(DatabaseWriter {
            db: Arc::clone(&self.db),
            key: claim.identifier().to_string(),
            buffer: Some(buffer),
            written: 0,
            lease: Some(lease),
            _reference: reference,
        }))
    }

    fn remove(&self, claim: &ResourceClaim) -> Result<bool> {
        ensure_unreferenced(claim)?;

        let txn = self
            .db
            .begin_write()
            .wrap_err("failed to begin write transaction")?;
        let removed = {
            let mut table = txn.open_table(CONTENT).wrap_err("failed to open content table")?;
            let removed = table
                .remove(claim.identifier())
                .wrap_err_with(|| format!("failed to remove content for claim '{}'", claim))?;
            removed.is_some()
        };
        txn.commit().wrap_err("failed to commit content removal")?;

        Ok(removed)
    }
}

struct DatabaseReader {
    bytes: BufferReader,
    _reference: ClaimRef,
}

impl Read for DatabaseReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.bytes.read(buf)
    }
}

impl ContentReader for DatabaseReader {
    fn len(&self) -> u64 {
        self.bytes.len()
    }

    fn position(&self) -> u64 {
        self.bytes.position()
    }

    fn seek(&mut self, offset: u64) -> Result<()> {
        self.bytes.seek(offset)
    }
}

struct DatabaseWriter {
    db: Arc<Database>,
    key: String,
    buffer: Option<Vec<u8>>,
    written: u64,
    lease: Option<WriteLease>,
    _reference: ClaimRef,
}

impl Write for DatabaseWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let buffer = self.buffer.as_mut().ok_or_else(closed_stream)?;
        buffer.extend_from_slice(buf);
        self.written += buf.len() as u64;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl ContentWriter for DatabaseWriter {
    fn bytes_written(&self) -> u64 {
        self.written
    }

    fn close(&mut self) -> Result<()> {
        let Some(buffer) = self.buffer.take() else {
            return Ok(());
        };

        let stored = store(&self.db, &self.key, &buffer);
        self.lease = None;
        stored
    }
}

impl Drop for DatabaseWriter {
    fn drop(&mut self) {
        if let Err(err) = self.close() {
            warn!(claim = %self.key, error = %err, "failed to commit content writer on drop");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{error_kind, ErrorKind};
    use tempfile::tempdir;

    fn repository(dir: &Path) -> Arc<dyn ContentRepository> {
        Arc::new(DatabaseRepository::open(dir.join("db").join("content.redb")).unwrap())
    }

    #[test]
    fn writable_mapping_writes_back_on_unmap() {
        let dir = tempdir().unwrap();
        let repo = repository(dir.path());
        let claim = ResourceClaim::new("a", &repo);

        let mut map = repo.mmap(&claim, 10, false).unwrap();
        map.write_at(0, b"helloworld").unwrap();
        assert!(!repo.exists(&claim).unwrap());
        map.unmap().unwrap();

        let map = repo.mmap(&claim, 10, true).unwrap();
        assert_eq!(map.data().unwrap(), b"helloworld");
        let err = repo.mmap(&claim, 11, true).unwrap_err();
        assert_eq!(error_kind(&err), Some(ErrorKind::InsufficientBackingStore));
    }

    #[test]
    fn resized_mapping_stores_final_length() {
        let dir = tempdir().unwrap();
        let repo = repository(dir.path());
        let claim = ResourceClaim::new("r", &repo);

        let mut map = repo.mmap(&claim, 2, false).unwrap();
        map.write_at(0, b"ab").unwrap();
        map.resize(4).unwrap();
        drop(map);

        assert_eq!(repo.size(&claim).unwrap(), Some(4));
        let map = repo.mmap(&claim, 4, true).unwrap();
        assert_eq!(map.data().unwrap(), b"ab\0\0");
    }

    #[test]
    fn content_survives_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("content.redb");

        {
            let repo: Arc<dyn ContentRepository> =
                Arc::new(DatabaseRepository::open(&path).unwrap());
            let claim = ResourceClaim::new("durable", &repo);
            let mut writer = repo.write(&claim, false).unwrap();
            writer.write_data(b"persist").unwrap();
            writer.close().unwrap();
        }

        let repo: Arc<dyn ContentRepository> = Arc::new(DatabaseRepository::open(&path).unwrap());
        let claim = ResourceClaim::new("durable", &repo);
        let mut reader = repo.read(&claim).unwrap();
        let mut buf = Vec::new();
        reader.read_data(&mut buf, 64).unwrap();
        assert_eq!(buf, b"persist".to_vec());
    }

    #[test]
    fn append_writer_extends_stored_value() {
        let dir = tempdir().unwrap();
        let repo = repository(dir.path());
        let claim = ResourceClaim::new("s", &repo);

        repo.write(&claim, false).unwrap().write_data(b"abc").unwrap();
        repo.write(&claim, true).unwrap().write_data(b"def").unwrap();

        let mut reader = repo.read(&claim).unwrap();
        let mut buf = Vec::new();
        reader.seek(2).unwrap();
        assert_eq!(reader.read_data(&mut buf, 10).unwrap(), 4);
        assert_eq!(buf, b"cdef".to_vec());
    }

    #[test]
    fn absent_content_is_reported() {
        let dir = tempdir().unwrap();
        let repo = repository(dir.path());
        let claim = ResourceClaim::new("none", &repo);

        let err = repo.read(&claim).unwrap_err();
        assert_eq!(error_kind(&err), Some(ErrorKind::NotFound));
        let err = repo.mmap(&claim, 1, true).unwrap_err();
        assert_eq!(error_kind(&err), Some(ErrorKind::InsufficientBackingStore));
        assert_eq!(repo.size(&claim).unwrap(), None);
        assert!(!repo.remove(&claim).unwrap());
    }

    #[test]
    fn remove_deletes_row() {
        let dir = tempdir().unwrap();
        let repo = repository(dir.path());
        let claim = ResourceClaim::new("d", &repo);
        repo.write(&claim, false).unwrap().write_data(b"x").unwrap();

        let map = repo.mmap(&claim, 1, true).unwrap();
        assert!(repo.remove(&claim).is_err());
        drop(map);

        assert!(repo.remove(&claim).unwrap());
        assert!(!repo.exists(&claim).unwrap());
    }

    #[test]
    fn single_writer_per_claim() {
        let dir = tempdir().unwrap();
        let repo = repository(dir.path());
        let claim = ResourceClaim::new("w", &repo);

        let writer = repo.write(&claim, false).unwrap();
        let err = repo.mmap(&claim, 1, false).unwrap_err();

        assert_eq!(error_kind(&err), Some(ErrorKind::WriterActive));
        drop(writer);
        assert!(repo.mmap(&claim, 1, false).is_ok());
    }
}
