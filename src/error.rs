//! # Content Error Kinds
//!
//! Every fallible operation in this crate returns `eyre::Result`. Failures
//! that callers are expected to branch on are raised as a typed
//! [`ContentError`] inside the report, so they can be recovered with
//! `downcast_ref`:
//!
//! ```ignore
//! match repo.mmap(&claim, 11, true) {
//!     Err(report) if matches!(
//!         report.downcast_ref::<ContentError>().map(ContentError::kind),
//!         Some(ErrorKind::InsufficientBackingStore)
//!     ) => { /* reopen writable or ask for less */ }
//!     other => { other?; }
//! }
//! ```
//!
//! Errors without a meaningful kind (key/value transaction failures, bad
//! configuration values) are plain `eyre` reports with context attached via
//! `wrap_err_with`.
//!
//! An unmapped or not-found mapping is NOT an error: `data()` returns `None`
//! and `size()` returns [`crate::config::UNMAPPED_SIZE`]. `InvalidMapping` is
//! only raised by operations that cannot return a sentinel, such as `resize`
//! or `write_at`.

use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Io,
    InsufficientBackingStore,
    NotSupported,
    InvalidMapping,
    OutOfBounds,
    WriterActive,
    NotFound,
    CapacityExceeded,
    RepositoryUnavailable,
    ClaimInUse,
}

#[derive(Debug, Error)]
pub enum ContentError {
    #[error("failed to {operation} '{}': {source}", .path.display())]
    Io {
        operation: &'static str,
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("cannot map {requested} bytes of '{claim}' read-only: backing store holds {available} bytes")]
    InsufficientBackingStore {
        claim: String,
        requested: usize,
        available: u64,
    },

    #[error("{operation} is not supported on a read-only mapping")]
    NotSupported { operation: &'static str },

    #[error("{operation} on an unmapped or invalid mapping")]
    InvalidMapping { operation: &'static str },

    #[error("{len} bytes at offset {offset} out of bounds (mapped size={size})")]
    OutOfBounds {
        offset: usize,
        len: usize,
        size: usize,
    },

    #[error("claim '{claim}' already has an active writer")]
    WriterActive { claim: String },

    #[error("no content stored for claim '{claim}'")]
    NotFound { claim: String },

    #[error("content capacity exceeded: requested {requested} but only {available} available")]
    CapacityExceeded { requested: usize, available: usize },

    #[error("repository for claim '{claim}' is no longer available")]
    RepositoryUnavailable { claim: String },

    #[error("claim '{claim}' is still referenced ({references} holders)")]
    ClaimInUse { claim: String, references: u64 },
}

impl ContentError {
    pub fn io(operation: &'static str, path: impl AsRef<Path>, source: io::Error) -> Self {
        ContentError::Io {
            operation,
            path: path.as_ref().to_path_buf(),
            source,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            ContentError::Io { .. } => ErrorKind::Io,
            ContentError::InsufficientBackingStore { .. } => ErrorKind::InsufficientBackingStore,
            ContentError::NotSupported { .. } => ErrorKind::NotSupported,
            ContentError::InvalidMapping { .. } => ErrorKind::InvalidMapping,
            ContentError::OutOfBounds { .. } => ErrorKind::OutOfBounds,
            ContentError::WriterActive { .. } => ErrorKind::WriterActive,
            ContentError::NotFound { .. } => ErrorKind::NotFound,
            ContentError::CapacityExceeded { .. } => ErrorKind::CapacityExceeded,
            ContentError::RepositoryUnavailable { .. } => ErrorKind::RepositoryUnavailable,
            ContentError::ClaimInUse { .. } => ErrorKind::ClaimInUse,
        }
    }
}

/// Returns the typed kind carried by `report`, if any.
pub fn error_kind(report: &eyre::Report) -> Option<ErrorKind> {
    report.downcast_ref::<ContentError>().map(ContentError::kind)
}
