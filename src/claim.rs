//! # Resource Claims
//!
//! A [`ResourceClaim`] names one content object inside one repository. It
//! carries no bytes and performs no I/O; it is the handle callers pass to
//! `mmap`, `read` and `write`.
//!
//! ## Reference Counting
//!
//! The claim keeps an atomic reference count. Content is reclaimable only
//! while the count is zero. Counts are never adjusted by hand: holders take a
//! [`ClaimRef`] guard, which increments on creation and decrements on drop,
//! so no early return or unwind can leak a reference.
//!
//! ```text
//! let owner = claim.acquire();        // count 0 -> 1
//! let map = repo.mmap(&claim, 10, false)?;   // mapping holds its own ClaimRef: 1 -> 2
//! drop(map);                          // 2 -> 1
//! drop(owner);                        // 1 -> 0, claim is reclaimable
//! ```
//!
//! ## Repository Routing
//!
//! The claim holds a `Weak` reference to its repository. It routes calls
//! there but never keeps the repository alive.

use std::fmt;
use std::ops::Deref;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use eyre::Result;
use tracing::trace;
use uuid::Uuid;

use crate::error::ContentError;
use crate::repository::{ContentReader, ContentRepository, ContentWriter};
use crate::storage::MemoryMap;

#[derive(Debug)]
pub struct ResourceClaim {
    identifier: String,
    repository: Option<Weak<dyn ContentRepository>>,
    ref_count: AtomicU64,
}

impl ResourceClaim {
    pub fn new(identifier: impl Into<String>, repository: &Arc<dyn ContentRepository>) -> Arc<Self> {
        Arc::new(Self {
            identifier: identifier.into(),
            repository: Some(Arc::downgrade(repository)),
            ref_count: AtomicU64::new(0),
        })
    }

    /// Creates a claim under a freshly generated unique identifier.
    pub fn generate(repository: &Arc<dyn ContentRepository>) -> Arc<Self> {
        Self::new(Uuid::new_v4().to_string(), repository)
    }

    /// Creates a claim that is not associated with any repository.
    ///
    /// Routing helpers on a detached claim fail with `RepositoryUnavailable`;
    /// it can still be passed to a repository's methods directly.
    pub fn detached(identifier: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            identifier: identifier.into(),
            repository: None,
            ref_count: AtomicU64::new(0),
        })
    }

    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    pub fn repository(&self) -> Option<Arc<dyn ContentRepository>> {
        self.repository.as_ref().and_then(Weak::upgrade)
    }

    pub fn ref_count(&self) -> u64 {
        self.ref_count.load(Ordering::Acquire)
    }

    pub fn is_reclaimable(&self) -> bool {
        self.ref_count() == 0
    }

    /// Takes a reference on this claim for as long as the guard lives.
    pub fn acquire(self: &Arc<Self>) -> ClaimRef {
        ClaimRef::new(Arc::clone(self))
    }

    pub fn mmap(self: &Arc<Self>, size: usize, read_only: bool) -> Result<Box<dyn MemoryMap>> {
        self.routed()?.mmap(self, size, read_only)
    }

    pub fn read(self: &Arc<Self>) -> Result<Box<dyn ContentReader>> {
        self.routed()?.read(self)
    }

    pub fn write(self: &Arc<Self>, append: bool) -> Result<Box<dyn ContentWriter>> {
        self.routed()?.write(self, append)
    }

    fn routed(&self) -> Result<Arc<dyn ContentRepository>> {
        match self.repository() {
            Some(repository) => Ok(repository),
            None => Err(ContentError::RepositoryUnavailable {
                claim: self.identifier.clone(),
            }
            .into()),
        }
    }

    fn increment(&self) -> u64 {
        let count = self.ref_count.fetch_add(1, Ordering::AcqRel) + 1;
        trace!(claim = %self.identifier, count, "claim reference taken");
        count
    }

    fn decrement(&self) -> u64 {
        let prev = self.ref_count.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0, "claim reference released below zero");
        let count = prev - 1;
        if count == 0 {
            trace!(claim = %self.identifier, "claim is reclaimable");
        } else {
            trace!(claim = %self.identifier, count, "claim reference released");
        }
        count
    }
}

impl fmt::Display for ResourceClaim {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.identifier)
    }
}

/// Scope guard holding one reference on a [`ResourceClaim`].
#[derive(Debug)]
pub struct ClaimRef {
    claim: Arc<ResourceClaim>,
}

impl ClaimRef {
    fn new(claim: Arc<ResourceClaim>) -> Self {
        claim.increment();
        Self { claim }
    }

    pub fn claim(&self) -> &Arc<ResourceClaim> {
        &self.claim
    }
}

impl Clone for ClaimRef {
    fn clone(&self) -> Self {
        Self::new(Arc::clone(&self.claim))
    }
}

impl Deref for ClaimRef {
    type Target = ResourceClaim;

    fn deref(&self) -> &ResourceClaim {
        &self.claim
    }
}

impl Drop for ClaimRef {
    fn drop(&mut self) {
        self.claim.decrement();
    }
}
