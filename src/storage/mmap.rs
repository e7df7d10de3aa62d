//! # File-Backed Memory Map
//!
//! `FileMemoryMap` maps one content file into the process address space.
//! It owns both the file handle and the mapping.
//!
//! ## Open Rules
//!
//! ```text
//! file length >= size            -> map `size` bytes
//! file length <  size, read-only -> InsufficientBackingStore (file untouched)
//! file length <  size, writable  -> extend file to `size` (zero tail), map
//! ```
//!
//! A read-only open never grows or truncates the file, and a mapping never
//! covers more bytes than the file really backs.
//!
//! ## Resize
//!
//! `resize(n)` on a writable map flushes dirty pages, drops the old mapping,
//! sets the file length to `n` (growing zero-fills, shrinking truncates) and
//! maps again. It takes `&mut self`, so no view into the old region can
//! outlive the call.
//!
//! Other mappings of the same file are not covered by that borrow. A map
//! opened with [`FileMemoryMap::with_truncate_gate`] shrinks only through
//! its [`TruncateGate`], which can refuse while readers have the file mapped.
//!
//! ## Unmap
//!
//! Writable maps are flushed (`msync`) before release and a flush failure is
//! returned, not swallowed. Unmap hooks then run with the last valid view.
//! The file handle is closed as part of unmap. A second `unmap()` is a no-op,
//! and `Drop` unmaps if the caller did not.
//!
//! ## Zero-Length Maps
//!
//! Mapping zero bytes is not possible on most platforms; a zero-length
//! `FileMemoryMap` keeps the file open and exposes an empty view.

use std::fmt::Debug;
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};

use eyre::{bail, Result};
use memmap2::{Mmap, MmapMut, MmapOptions};
use tracing::{debug, warn};

use super::map::{MemoryMap, UnmapHook, UnmapHooks};
use crate::config::UNMAPPED_SIZE;
use crate::error::ContentError;

/// Decides whether a mapped file may be cut short.
pub trait TruncateGate: Debug + Send {
    /// Runs `truncate`, or fails without calling it.
    fn truncate(&self, truncate: &mut dyn FnMut() -> Result<()>) -> Result<()>;
}

#[derive(Debug)]
enum Region {
    ReadOnly(Mmap),
    ReadWrite(MmapMut),
    Empty,
    Unmapped,
}

fn region_bytes(region: &Region) -> &[u8] {
    match region {
        Region::ReadOnly(mmap) => &mmap[..],
        Region::ReadWrite(mmap) => &mmap[..],
        Region::Empty | Region::Unmapped => &[],
    }
}

#[derive(Debug)]
pub struct FileMemoryMap {
    path: PathBuf,
    file: Option<File>,
    region: Region,
    length: usize,
    read_only: bool,
    hooks: UnmapHooks,
    gate: Option<Box<dyn TruncateGate>>,
}

impl FileMemoryMap {
    pub fn open<P: AsRef<Path>>(path: P, size: usize, read_only: bool) -> Result<Self> {
        let path = path.as_ref();

        let file = if read_only {
            Self::open_read_only(path, size)?
        } else {
            Self::open_writable(path, size)?
        };

        let region = Self::map(&file, path, size, read_only)?;

        debug!(path = %path.display(), size, read_only, "mapped content file");

        Ok(Self {
            path: path.to_path_buf(),
            file: Some(file),
            region,
            length: size,
            read_only,
            hooks: UnmapHooks::new(),
            gate: None,
        })
    }

    /// Routes every shrinking resize through `gate`.
    pub fn with_truncate_gate(mut self, gate: Box<dyn TruncateGate>) -> Self {
        self.gate = Some(gate);
        self
    }

    fn open_read_only(path: &Path, size: usize) -> Result<File> {
        let file = File::open(path).map_err(|e| ContentError::io("open", path, e))?;

        let file_len = file
            .metadata()
            .map_err(|e| ContentError::io("read metadata of", path, e))?
            .len();

        if file_len < size as u64 {
            bail!(ContentError::InsufficientBackingStore {
                claim: path.display().to_string(),
                requested: size,
                available: file_len,
            });
        }

        Ok(file)
    }

    fn open_writable(path: &Path, size: usize) -> Result<File> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .map_err(|e| ContentError::io("create directory", parent, e))?;
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .map_err(|e| ContentError::io("open", path, e))?;

        let file_len = file
            .metadata()
            .map_err(|e| ContentError::io("read metadata of", path, e))?
            .len();

        if file_len < size as u64 {
            file.set_len(size as u64)
                .map_err(|e| ContentError::io("extend", path, e))?;
        }

        Ok(file)
    }

    fn map(file: &File, path: &Path, size: usize, read_only: bool) -> Result<Region> {
        if size == 0 {
            return Ok(Region::Empty);
        }

        let region = if read_only {
            // SAFETY: mapping a file is unsafe because another process may
            // truncate or modify it while mapped. This is sound here because:
            // 1. The file length was checked to be >= size before mapping
            // 2. Content files are only written through the repository, which
            //    registers read-only mappings before that check and refuses
            //    any truncation while one is registered
            // 3. The mapping is dropped before the file handle it was made from
            let mmap = unsafe { MmapOptions::new().len(size).map(file) }
                .map_err(|e| ContentError::io("map", path, e))?;
            Region::ReadOnly(mmap)
        } else {
            // SAFETY: as above; additionally the file was opened read+write and
            // extended to at least `size` bytes before mapping, and resize()
            // requires &mut self so no view into the old mapping survives a
            // remap.
            let mmap = unsafe { MmapOptions::new().len(size).map_mut(file) }
                .map_err(|e| ContentError::io("map", path, e))?;
            Region::ReadWrite(mmap)
        };

        Ok(region)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn is_released(&self) -> bool {
        self.file.is_none()
    }

    /// Writes dirty pages back to the file without unmapping.
    pub fn flush(&self) -> Result<()> {
        match &self.region {
            Region::ReadWrite(mmap) => mmap
                .flush()
                .map_err(|e| ContentError::io("flush", &self.path, e).into()),
            _ => Ok(()),
        }
    }

    /// Hints to the OS that the whole mapping will be read soon.
    #[cfg(unix)]
    pub fn prefetch(&self) -> Result<()> {
        let advised = match &self.region {
            Region::ReadOnly(mmap) => mmap.advise(memmap2::Advice::WillNeed),
            Region::ReadWrite(mmap) => mmap.advise(memmap2::Advice::WillNeed),
            Region::Empty | Region::Unmapped => Ok(()),
        };
        advised.map_err(|e| ContentError::io("advise", &self.path, e).into())
    }

    #[cfg(not(unix))]
    pub fn prefetch(&self) -> Result<()> {
        Ok(())
    }
}

impl MemoryMap for FileMemoryMap {
    fn data(&self) -> Option<&[u8]> {
        match &self.region {
            Region::Unmapped => None,
            region => Some(region_bytes(region)),
        }
    }

    fn data_mut(&mut self) -> Option<&mut [u8]> {
        match &mut self.region {
            Region::ReadWrite(mmap) => Some(&mut mmap[..]),
            Region::Empty if !self.read_only => Some(<&mut [u8]>::default()),
            _ => None,
        }
    }

    fn size(&self) -> usize {
        match self.region {
            Region::Unmapped => UNMAPPED_SIZE,
            _ => self.length,
        }
    }

    fn is_read_only(&self) -> bool {
        self.read_only
    }

    fn unmap(&mut self) -> Result<()> {
        if self.is_released() {
            return Ok(());
        }

        let flushed = self.flush();
        let hooked = self.hooks.fire(region_bytes(&self.region));

        self.region = Region::Unmapped;
        self.file = None;

        debug!(path = %self.path.display(), "unmapped content file");

        flushed?;
        hooked
    }

    fn resize(&mut self, new_size: usize) -> Result<&mut [u8]> {
        if self.read_only {
            bail!(ContentError::NotSupported {
                operation: "resize"
            });
        }

        let file = match &self.file {
            Some(file) => file,
            None => bail!(ContentError::InvalidMapping {
                operation: "resize"
            }),
        };

        if let Region::ReadWrite(mmap) = &self.region {
            mmap.flush()
                .map_err(|e| ContentError::io("flush", &self.path, e))?;
        }

        let region = &mut self.region;
        let path = &self.path;
        let mut set_len = || -> Result<()> {
            *region = Region::Unmapped;
            file.set_len(new_size as u64)
                .map_err(|e| ContentError::io("resize", path, e))?;
            Ok(())
        };

        match &self.gate {
            Some(gate) if new_size < self.length => gate.truncate(&mut set_len)?,
            _ => set_len()?,
        }

        self.region = Self::map(file, &self.path, new_size, false)?;

        debug!(
            path = %self.path.display(),
            old_size = self.length,
            new_size,
            "resized content mapping"
        );

        self.length = new_size;

        match &mut self.region {
            Region::ReadWrite(mmap) => Ok(&mut mmap[..]),
            _ => Ok(<&mut [u8]>::default()),
        }
    }

    fn register_unmap_hook(&mut self, hook: UnmapHook) {
        self.hooks.register(hook);
    }
}

impl Drop for FileMemoryMap {
    fn drop(&mut self) {
        if let Err(err) = self.unmap() {
            warn!(path = %self.path.display(), error = %err, "failed to unmap content file on drop");
        }
    }
}
