//! # Content Repository Constants
//!
//! Centralizes sentinels, defaults and the agent property keys read by
//! [`super::RepositoryConfig`]. Interdependent values are co-located and
//! checked at compile time.
//!
//! ```text
//! DEFAULT_VOLATILE_MAX_BYTES (10 MiB)
//!       │
//!       └─> MIN_VOLATILE_MAX_BYTES (floor, must be <=)
//!             A volatile repository configured below the floor is raised to it
//!             so that small claims still fit.
//!
//! UNMAPPED_SIZE (usize::MAX)
//!       Returned by `MemoryMap::size()` after unmap or when the backing entry
//!       was not found. Never a valid mapping length.
//! ```

// ============================================================================
// MAPPING SENTINELS
// ============================================================================

/// Size reported by a mapping that is unmapped or whose backing entry is gone.
pub const UNMAPPED_SIZE: usize = usize::MAX;

/// Number of unmap hooks stored inline before spilling to the heap.
pub const INLINE_UNMAP_HOOKS: usize = 2;

// ============================================================================
// VOLATILE REPOSITORY LIMITS
// ============================================================================

/// Default byte capacity of a volatile repository (10 MiB).
pub const DEFAULT_VOLATILE_MAX_BYTES: usize = 10 * 1024 * 1024;

/// Default number of entries a volatile repository may hold.
pub const DEFAULT_VOLATILE_MAX_COUNT: usize = 10_000;

/// Smallest accepted byte capacity (4 KiB).
pub const MIN_VOLATILE_MAX_BYTES: usize = 4 * 1024;

const _: () = assert!(
    MIN_VOLATILE_MAX_BYTES <= DEFAULT_VOLATILE_MAX_BYTES,
    "MIN_VOLATILE_MAX_BYTES must not exceed DEFAULT_VOLATILE_MAX_BYTES"
);

// ============================================================================
// ON-DISK DEFAULTS
// ============================================================================

/// Default root directory of the file-system repository.
pub const DEFAULT_CONTENT_DIRECTORY: &str = "./content_repository";

/// Default path of the key/value store used by the database repository.
pub const DEFAULT_DATABASE_PATH: &str = "./dbcontentrepository";

/// Name of the key/value table holding content bytes.
pub const CONTENT_TABLE_NAME: &str = "content";

// ============================================================================
// PROPERTY KEYS
// ============================================================================

pub const PROP_REPOSITORY_CLASS: &str = "nifi.content.repository.class.name";
pub const PROP_CONTENT_DIRECTORY: &str = "nifi.content.repository.directory.default";
pub const PROP_DATABASE_DIRECTORY: &str = "nifi.database.content.repository.directory.default";
pub const PROP_VOLATILE_MAX_BYTES: &str = "nifi.volatile.repository.options.content.max.bytes";
pub const PROP_VOLATILE_MAX_COUNT: &str = "nifi.volatile.repository.options.content.max.count";
