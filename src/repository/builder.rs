//! # Repository Builder
//!
//! `RepositoryBuilder` configures and opens a content repository behind
//! `Arc<dyn ContentRepository>`, which is what claims route through.
//!
//! ## Configuration Options
//!
//! | Option    | Applies to | Default  |
//! |-----------|------------|----------|
//! | max_bytes | volatile   | 10 MiB   |
//! | max_count | volatile   | 10000    |
//!
//! ## Usage Examples
//!
//! ```ignore
//! let repo = RepositoryBuilder::new()
//!     .file_system("./content_repository")
//!     .open()?;
//!
//! let repo = RepositoryBuilder::new()
//!     .volatile()
//!     .max_bytes(64 * 1024 * 1024)
//!     .max_count(1000)
//!     .open()?;
//!
//! let repo = RepositoryBuilder::from_config(&config)?.open()?;
//! ```

use std::path::Path;
use std::sync::Arc;

use eyre::Result;

use super::{
    ContentRepository, DatabaseRepository, FileSystemRepository, RepositoryKind,
    VolatileRepository,
};
use crate::config::RepositoryConfig;

#[derive(Debug, Clone, Default)]
pub struct RepositoryBuilder {
    kind: Option<RepositoryKind>,
    max_bytes: Option<usize>,
    max_count: Option<usize>,
}

impl RepositoryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts from the backend selected by the agent's properties.
    pub fn from_config(config: &RepositoryConfig) -> Result<Self> {
        Ok(Self::new().kind(config.repository_kind()?))
    }

    pub fn file_system<P: AsRef<Path>>(self, directory: P) -> Self {
        self.kind(RepositoryKind::file_system(directory.as_ref()))
    }

    pub fn volatile(self) -> Self {
        self.kind(RepositoryKind::volatile())
    }

    pub fn database<P: AsRef<Path>>(self, path: P) -> Self {
        self.kind(RepositoryKind::database(path.as_ref()))
    }

    pub fn kind(mut self, kind: RepositoryKind) -> Self {
        self.kind = Some(kind);
        self
    }

    /// Overrides the volatile byte capacity.
    pub fn max_bytes(mut self, bytes: usize) -> Self {
        self.max_bytes = Some(bytes);
        self
    }

    /// Overrides the volatile entry limit.
    pub fn max_count(mut self, count: usize) -> Self {
        self.max_count = Some(count);
        self
    }

    pub fn get_kind(&self) -> Option<&RepositoryKind> {
        self.kind.as_ref()
    }

    /// Opens the configured repository.
    ///
    /// # Errors
    ///
    /// Returns an error if no backend was selected, or if the backend's
    /// directory or database file cannot be created or opened.
    pub fn open(self) -> Result<Arc<dyn ContentRepository>> {
        let kind = self.kind.ok_or_else(|| {
            eyre::eyre!(
                "repository kind not specified: call .file_system(), .volatile() or .database() first"
            )
        })?;

        let repository: Arc<dyn ContentRepository> = match kind {
            RepositoryKind::FileSystem { directory } => {
                Arc::new(FileSystemRepository::open(directory)?)
            }
            RepositoryKind::Volatile {
                max_bytes,
                max_count,
            } => Arc::new(VolatileRepository::new(
                self.max_bytes.unwrap_or(max_bytes),
                self.max_count.unwrap_or(max_count),
            )),
            RepositoryKind::Database { path } => Arc::new(DatabaseRepository::open(path)?),
        };

        Ok(repository)
    }
}
