//! # contentrepo - Content Storage for an Edge Dataflow Agent
//!
//! Stores the byte payloads that flow through processing pipelines,
//! addressed by reference-counted claims, and gives callers two access modes
//! over interchangeable backends:
//!
//! - **Zero-copy mapping**: `mmap(claim, size, read_only)` returns a
//!   [`MemoryMap`] view of the content
//! - **Streaming**: `read(claim)` / `write(claim, append)` return bounded
//!   [`ContentReader`] / [`ContentWriter`] streams
//!
//! ## Quick Start
//!
//! ```ignore
//! use contentrepo::{RepositoryBuilder, ResourceClaim};
//!
//! let repo = RepositoryBuilder::new()
//!     .file_system("./content_repository")
//!     .open()?;
//!
//! let claim = ResourceClaim::generate(&repo);
//! let mut map = claim.mmap(10, false)?;
//! map.write_at(0, b"helloworld")?;
//! map.unmap()?;
//!
//! let map = claim.mmap(10, true)?;
//! assert_eq!(map.data(), Some(&b"helloworld"[..]));
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────┐
//! │   ResourceClaim (id, ref count, Weak repo)  │
//! ├─────────────────────────────────────────────┤
//! │   dyn ContentRepository                     │
//! │   FileSystem │ Volatile │ Database (redb)   │
//! ├──────────────┼──────────┼───────────────────┤
//! │ FileMemoryMap│ AtomicEntry│ PassthroughMemoryMap
//! │   (memmap2)  │ MemoryMap  │  (owned buffer)  │
//! ├─────────────────────────────────────────────┤
//! │   MemoryMap capability + unmap hooks        │
//! └─────────────────────────────────────────────┘
//! ```
//!
//! ## Module Overview
//!
//! - [`storage`]: the mapping capability and its three realizations
//! - [`memory`]: entry table and capacity budget behind the volatile backend
//! - [`repository`]: repository trait, backends, streams, builder
//! - [`claim`]: resource claims and their reference guards
//! - [`config`]: constants and property-driven configuration
//! - [`error`]: typed error kinds carried in `eyre` reports

pub mod claim;
pub mod config;
pub mod error;
pub mod memory;
pub mod repository;
pub mod storage;

pub use claim::{ClaimRef, ResourceClaim};
pub use config::{RepositoryConfig, UNMAPPED_SIZE};
pub use error::{error_kind, ContentError, ErrorKind};
pub use repository::{
    ContentReader, ContentRepository, ContentWriter, DatabaseRepository, FileSystemRepository,
    RepositoryBuilder, RepositoryKind, VolatileRepository,
};
pub use storage::{
    AtomicEntryMemoryMap, FileMemoryMap, MemoryMap, PassthroughMemoryMap, PassthroughOps,
    TruncateGate, UnmapHook,
};
