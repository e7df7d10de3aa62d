//! # File-System Repository
//!
//! One regular file per claim at `<directory>/<claim identifier>`. There is
//! no header or sidecar metadata: the file's length and bytes are the only
//! state. Identifiers containing `/` land in subdirectories, which are
//! created on first write.
//!
//! Writable mappings extend the file to the requested size, so the file is
//! always at least as long as the largest writable mapping ever made of it.
//! Writer streams replace (`append = false`) or extend (`append = true`) the
//! file and `sync_data` it on close.
//!
//! Read-only mappings are counted per claim. While any is live, the file may
//! grow but not shrink: replacing writers and shrinking resizes fail with
//! `WriterActive`.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use eyre::Result;
use tracing::{debug, warn};

use super::lease::{hold_until_unmap, ReaderRegistry, WriteLease, WriterRegistry};
use super::stream::{check_seek, closed_stream, ContentReader, ContentWriter};
use super::{ensure_unreferenced, missing_content, ContentRepository};
use crate::claim::{ClaimRef, ResourceClaim};
use crate::error::ContentError;
use crate::storage::{FileMemoryMap, MemoryMap};

#[derive(Debug)]
pub struct FileSystemRepository {
    directory: PathBuf,
    writers: Arc<WriterRegistry>,
    readers: Arc<ReaderRegistry>,
}

impl FileSystemRepository {
    pub const NAME: &'static str = "FileSystemRepository";

    pub fn open<P: AsRef<Path>>(directory: P) -> Result<Self> {
        let directory = directory.as_ref();

        fs::create_dir_all(directory)
            .map_err(|e| ContentError::io("create directory", directory, e))?;

        debug!(directory = %directory.display(), "opened file-system content repository");

        Ok(Self {
            directory: directory.to_path_buf(),
            writers: Arc::new(WriterRegistry::new()),
            readers: Arc::new(ReaderRegistry::new()),
        })
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    pub fn content_path(&self, claim: &ResourceClaim) -> PathBuf {
        self.directory.join(claim.identifier())
    }

    fn stored_len(&self, claim: &ResourceClaim) -> Result<Option<u64>> {
        let path = self.content_path(claim);
        match fs::metadata(&path) {
            Ok(meta) if meta.is_file() => Ok(Some(meta.len())),
            Ok(_) => Ok(None),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(ContentError::io("read metadata of", &path, e).into()),
        }
    }
}

impl ContentRepository for FileSystemRepository {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn exists(&self, claim: &ResourceClaim) -> Result<bool> {
        Ok(self.stored_len(claim)?.is_some())
    }

    fn size(&self, claim: &ResourceClaim) -> Result<Option<u64>> {
        self.stored_len(claim)
    }

    fn mmap(
        &self,
        claim: &Arc<ResourceClaim>,
        size: usize,
        read_only: bool,
    ) -> Result<Box<dyn MemoryMap>> {
        let reference = claim.acquire();

        let path = self.content_path(claim);

        if read_only {
            let lease = self.readers.acquire(claim);
            if self.stored_len(claim)?.is_none() {
                return Err(missing_content(claim, size).into());
            }

            let mut map = FileMemoryMap::open(path, size, true)?;
            hold_until_unmap(&mut map, reference, lease);
            return Ok(Box::new(map));
        }

        let lease = self.writers.acquire(claim)?;
        let mut map =
            FileMemoryMap::open(path, size, false)?.with_truncate_gate(self.readers.gate(claim));
        hold_until_unmap(&mut map, reference, lease);

        Ok(Box::new(map))
    }

    fn read(&self, claim: &Arc<ResourceClaim>) -> Result<Box<dyn ContentReader>> {
        let reference = claim.acquire();
        let path = self.content_path(claim);

        let file = match File::open(&path) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(missing_content(claim, 0).into());
            }
            Err(e) => return Err(ContentError::io("open", &path, e).into()),
        };

        let len = file
            .metadata()
            .map_err(|e| ContentError::io("read metadata of", &path, e))?
            .len();

        Ok(Box::new(FileReader {
            file,
            path,
            len,
            position: 0,
            _reference: reference,
        }))
    }

    fn write(&self, claim: &Arc<ResourceClaim>, append: bool) -> Result<Box<dyn ContentWriter>> {
        let reference = claim.acquire();
        let lease = self.writers.acquire(claim)?;
        let path = self.content_path(claim);

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| ContentError::io("create directory", parent, e))?;
        }

        let mut options = OpenOptions::new();
        options.create(true);
        if append {
            options.append(true);
        } else {
            options.write(true).truncate(false);
        }

        let file = options
            .open(&path)
            .map_err(|e| ContentError::io("open", &path, e))?;

        if !append {
            self.readers.exclusive(claim.identifier(), || {
                file.set_len(0)
                    .map_err(|e| ContentError::io("truncate", &path, e).into())
            })?;
        }

        debug!(path = %path.display(), append, "opened content writer");

        Ok(Box::new(FileWriter {
            file: Some(file),
            path,
            written: 0,
            lease: Some(lease),
            _reference: reference,
        }))
    }

    fn remove(&self, claim: &ResourceClaim) -> Result<bool> {
        ensure_unreferenced(claim)?;
        let path = self.content_path(claim);

        match fs::remove_file(&path) {
            Ok(()) => {
                debug!(path = %path.display(), "removed content file");
                Ok(true)
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(ContentError::io("remove", &path, e).into()),
        }
    }
}

struct FileReader {
    file: File,
    path: PathBuf,
    len: u64,
    position: u64,
    _reference: ClaimRef,
}

impl Read for FileReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.file.read(buf)?;
        self.position += n as u64;
        Ok(n)
    }
}

impl ContentReader for FileReader {
    fn len(&self) -> u64 {
        self.len
    }

    fn position(&self) -> u64 {
        self.position
    }

    fn seek(&mut self, offset: u64) -> Result<()> {
        check_seek(offset, self.len)?;
        self.file
            .seek(SeekFrom::Start(offset))
            .map_err(|e| ContentError::io("seek", &self.path, e))?;
        self.position = offset;
        Ok(())
    }
}

struct FileWriter {
    file: Option<File>,
    path: PathBuf,
    written: u64,
    lease: Option<WriteLease>,
    _reference: ClaimRef,
}

impl Write for FileWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let file = self.file.as_mut().ok_or_else(closed_stream)?;
        let n = file.write(buf)?;
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        match self.file.as_mut() {
            Some(file) => file.flush(),
            None => Ok(()),
        }
    }
}

impl ContentWriter for FileWriter {
    fn bytes_written(&self) -> u64 {
        self.written
    }

    fn close(&mut self) -> Result<()> {
        let Some(mut file) = self.file.take() else {
            return Ok(());
        };

        let synced = file.flush().and_then(|()| file.sync_data());
        drop(file);
        self.lease = None;

        synced.map_err(|e| ContentError::io("sync", &self.path, e))?;
        debug!(path = %self.path.display(), bytes = self.written, "closed content writer");
        Ok(())
    }
}

impl Drop for FileWriter {
    fn drop(&mut self) {
        if let Err(err) = self.close() {
            warn!(path = %self.path.display(), error = %err, "failed to close content writer on drop");
        }
    }
}
