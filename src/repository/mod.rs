//! # Content Repositories
//!
//! A content repository resolves a [`ResourceClaim`] to backend storage and
//! hands out either a [`MemoryMap`] or a stream over it. Three backends
//! implement [`ContentRepository`]:
//!
//! | Backend | Storage | `mmap` returns |
//! |---------|---------|----------------|
//! | [`FileSystemRepository`] | `<root>/<claim id>`, one file per claim | `FileMemoryMap` |
//! | [`VolatileRepository`] | in-process [`crate::memory::EntryTable`] | `AtomicEntryMemoryMap` |
//! | [`DatabaseRepository`] | `redb` table `content`, key = claim id | `PassthroughMemoryMap` |
//!
//! ## Uniform Rules
//!
//! Every backend applies the same size-and-mode rules, so callers written
//! against `dyn ContentRepository` never see a difference:
//!
//! ```text
//! mmap(claim, n, read_only = true)
//!   content absent, n > 0     -> InsufficientBackingStore
//!   content absent, n == 0    -> NotFound
//!   content shorter than n    -> InsufficientBackingStore
//!   otherwise                 -> first n bytes, immutable
//! mmap(claim, n, read_only = false)
//!   content created if absent, resized to n (zero-filled growth)
//! ```
//!
//! - One writer per claim: a writable mapping or a writer stream holds the
//!   claim's writer lease; a second one fails with `WriterActive`
//! - Every mapping and stream holds a claim reference while it is live
//! - `remove` refuses with `ClaimInUse` while the claim is referenced
//!
//! ## Opening
//!
//! Use [`RepositoryBuilder`], directly or from the agent's properties:
//!
//! ```ignore
//! let repo = RepositoryBuilder::new()
//!     .volatile()
//!     .max_bytes(64 * 1024 * 1024)
//!     .open()?;
//! let claim = ResourceClaim::generate(&repo);
//! ```

mod builder;
mod database;
mod file_system;
mod lease;
mod stream;
mod volatile;

pub use builder::RepositoryBuilder;
pub use database::DatabaseRepository;
pub use file_system::FileSystemRepository;
pub use lease::{ReadLease, ReaderRegistry, WriteLease, WriterRegistry};
pub use stream::{ContentReader, ContentWriter};
pub use volatile::VolatileRepository;

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use eyre::Result;

use crate::claim::ResourceClaim;
use crate::config::{DEFAULT_VOLATILE_MAX_BYTES, DEFAULT_VOLATILE_MAX_COUNT};
use crate::error::ContentError;
use crate::storage::MemoryMap;

pub trait ContentRepository: Send + Sync {
    fn name(&self) -> &'static str;

    fn exists(&self, claim: &ResourceClaim) -> Result<bool>;

    /// Stored length of the claim's content, or `None` if nothing is stored.
    fn size(&self, claim: &ResourceClaim) -> Result<Option<u64>>;

    fn mmap(
        &self,
        claim: &Arc<ResourceClaim>,
        size: usize,
        read_only: bool,
    ) -> Result<Box<dyn MemoryMap>>;

    fn read(&self, claim: &Arc<ResourceClaim>) -> Result<Box<dyn ContentReader>>;

    /// Opens a writer. With `append` the new bytes follow the existing
    /// content; otherwise the content is replaced.
    fn write(&self, claim: &Arc<ResourceClaim>, append: bool) -> Result<Box<dyn ContentWriter>>;

    /// Deletes the claim's content. Returns `false` if nothing was stored.
    fn remove(&self, claim: &ResourceClaim) -> Result<bool>;
}

impl fmt::Debug for dyn ContentRepository {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContentRepository")
            .field("name", &self.name())
            .finish()
    }
}

/// Which backend a repository uses, with its settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RepositoryKind {
    FileSystem { directory: PathBuf },
    Volatile { max_bytes: usize, max_count: usize },
    Database { path: PathBuf },
}

impl RepositoryKind {
    pub fn file_system<P: Into<PathBuf>>(directory: P) -> Self {
        RepositoryKind::FileSystem {
            directory: directory.into(),
        }
    }

    pub fn volatile() -> Self {
        RepositoryKind::Volatile {
            max_bytes: DEFAULT_VOLATILE_MAX_BYTES,
            max_count: DEFAULT_VOLATILE_MAX_COUNT,
        }
    }

    pub fn database<P: Into<PathBuf>>(path: P) -> Self {
        RepositoryKind::Database { path: path.into() }
    }

    pub fn name(&self) -> &'static str {
        match self {
            RepositoryKind::FileSystem { .. } => FileSystemRepository::NAME,
            RepositoryKind::Volatile { .. } => VolatileRepository::NAME,
            RepositoryKind::Database { .. } => DatabaseRepository::NAME,
        }
    }

    pub fn is_persistent(&self) -> bool {
        !matches!(self, RepositoryKind::Volatile { .. })
    }
}

/// Error for a read-only request against content that is not stored.
pub(crate) fn missing_content(claim: &ResourceClaim, requested: usize) -> ContentError {
    if requested == 0 {
        ContentError::NotFound {
            claim: claim.identifier().to_string(),
        }
    } else {
        ContentError::InsufficientBackingStore {
            claim: claim.identifier().to_string(),
            requested,
            available: 0,
        }
    }
}

pub(crate) fn ensure_unreferenced(claim: &ResourceClaim) -> Result<()> {
    let references = claim.ref_count();
    if references > 0 {
        return Err(ContentError::ClaimInUse {
            claim: claim.identifier().to_string(),
            references,
        }
        .into());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{error_kind, ErrorKind};

    #[test]
    fn missing_content_kind_depends_on_size() {
        let claim = ResourceClaim::detached("a");

        assert_eq!(missing_content(&claim, 0).kind(), ErrorKind::NotFound);
        assert_eq!(
            missing_content(&claim, 1).kind(),
            ErrorKind::InsufficientBackingStore
        );
    }

    #[test]
    fn referenced_claim_cannot_be_removed() {
        let claim = ResourceClaim::detached("a");
        let guard = claim.acquire();

        let err = ensure_unreferenced(&claim).unwrap_err();
        assert_eq!(error_kind(&err), Some(ErrorKind::ClaimInUse));

        drop(guard);
        assert!(ensure_unreferenced(&claim).is_ok());
    }

    #[test]
    fn kind_names_match_backends() {
        assert_eq!(RepositoryKind::file_system("/tmp/x").name(), "FileSystemRepository");
        assert_eq!(RepositoryKind::volatile().name(), "VolatileContentRepository");
        assert_eq!(RepositoryKind::database("/tmp/db").name(), "DatabaseContentRepository");
        assert!(!RepositoryKind::volatile().is_persistent());
    }
}
