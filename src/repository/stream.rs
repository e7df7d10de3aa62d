//! # Streaming Access
//!
//! The fallback path for callers that do not want a whole object in memory.
//! Readers are `std::io::Read` and writers are `std::io::Write`, so they plug
//! into `io::copy`, `BufReader` and friends. The traits below add the
//! repository contract on top:
//!
//! - [`ContentReader::read_data`] fills a caller buffer with up to `max_len`
//!   bytes and reports how many it got. A short count at end of content is
//!   not an error.
//! - [`ContentReader::seek`] repositions for random access. Offsets past the
//!   end fail with `OutOfBounds`.
//! - [`ContentWriter::close`] makes the written bytes visible to readers and
//!   releases the writer slot. Dropping an open writer closes it.

use std::fmt;
use std::io::{self, Read, Write};

use eyre::{Result, WrapErr};

use crate::error::ContentError;

pub trait ContentReader: Read + Send {
    /// Total length of the content being read.
    fn len(&self) -> u64;

    fn position(&self) -> u64;

    fn seek(&mut self, offset: u64) -> Result<()>;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn remaining(&self) -> u64 {
        self.len().saturating_sub(self.position())
    }

    /// Replaces the contents of `buf` with up to `max_len` bytes read from
    /// the current position. Returns the number of bytes read.
    fn read_data(&mut self, buf: &mut Vec<u8>, max_len: usize) -> Result<usize> {
        let limit = usize::try_from(self.remaining()).map_or(max_len, |left| left.min(max_len));
        buf.clear();
        buf.resize(limit, 0);

        let mut filled = 0;
        while filled < limit {
            match self.read(&mut buf[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    buf.truncate(filled);
                    return Err(err).wrap_err("failed to read content stream");
                }
            }
        }

        buf.truncate(filled);
        Ok(filled)
    }
}

impl fmt::Debug for dyn ContentReader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContentReader")
            .field("len", &self.len())
            .field("position", &self.position())
            .finish()
    }
}

pub trait ContentWriter: Write + Send {
    fn bytes_written(&self) -> u64;

    /// Flushes and publishes the content. Calling it again is a no-op.
    fn close(&mut self) -> Result<()>;

    fn write_data(&mut self, bytes: &[u8]) -> Result<usize> {
        self.write_all(bytes)
            .wrap_err("failed to write content stream")?;
        Ok(bytes.len())
    }
}

impl fmt::Debug for dyn ContentWriter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContentWriter")
            .field("bytes_written", &self.bytes_written())
            .finish()
    }
}

/// Validates a seek target against the content length.
pub(crate) fn check_seek(offset: u64, len: u64) -> Result<()> {
    if offset > len {
        return Err(ContentError::OutOfBounds {
            offset: usize::try_from(offset).unwrap_or(usize::MAX),
            len: 0,
            size: usize::try_from(len).unwrap_or(usize::MAX),
        }
        .into());
    }
    Ok(())
}

pub(crate) fn closed_stream() -> io::Error {
    io::Error::other("content writer is closed")
}

/// Reader over an owned byte buffer, used by backends that load the whole
/// value up front.
pub(crate) struct BufferReader {
    bytes: io::Cursor<Vec<u8>>,
}

impl BufferReader {
    pub(crate) fn new(bytes: Vec<u8>) -> Self {
        Self {
            bytes: io::Cursor::new(bytes),
        }
    }

    pub(crate) fn len(&self) -> u64 {
        self.bytes.get_ref().len() as u64
    }

    pub(crate) fn position(&self) -> u64 {
        self.bytes.position()
    }

    pub(crate) fn seek(&mut self, offset: u64) -> Result<()> {
        check_seek(offset, self.len())?;
        self.bytes.set_position(offset);
        Ok(())
    }
}

impl Read for BufferReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.bytes.read(buf)
    }
}
