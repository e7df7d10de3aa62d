//! # Writer Leases
//!
//! At most one writer (a writable mapping or a writer stream) may be active
//! against a claim. Each repository keeps a [`WriterRegistry`]; opening a
//! writer takes a [`WriteLease`] from it and a second attempt fails with
//! `WriterActive` until the first lease is dropped.
//!
//! Writers may run alongside readers, but a file that is mapped read-only
//! must never get shorter: touching a mapped page past the end of the file
//! faults. [`ReaderRegistry`] counts live read-only file mappings per claim,
//! and anything that truncates goes through [`ReaderRegistry::exclusive`],
//! which fails with `WriterActive` while the count is positive.
//!
//! Mappings carry their lease and claim reference in an unmap hook (see
//! [`hold_until_unmap`]), so both are released exactly when the mapping is
//! unmapped or dropped.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use eyre::Result;
use parking_lot::Mutex;
use tracing::trace;

use crate::claim::{ClaimRef, ResourceClaim};
use crate::error::ContentError;
use crate::storage::{MemoryMap, TruncateGate};

#[derive(Debug, Default)]
pub struct WriterRegistry {
    active: Mutex<HashSet<String>>,
}

impl WriterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn acquire(self: &Arc<Self>, claim: &ResourceClaim) -> Result<WriteLease> {
        let mut active = self.active.lock();

        if !active.insert(claim.identifier().to_string()) {
            return Err(ContentError::WriterActive {
                claim: claim.identifier().to_string(),
            }
            .into());
        }

        trace!(claim = %claim, "writer lease taken");

        Ok(WriteLease {
            registry: Arc::clone(self),
            claim: claim.identifier().to_string(),
        })
    }

    pub fn is_writing(&self, claim: &ResourceClaim) -> bool {
        self.active.lock().contains(claim.identifier())
    }
}

#[derive(Debug)]
pub struct WriteLease {
    registry: Arc<WriterRegistry>,
    claim: String,
}

impl Drop for WriteLease {
    fn drop(&mut self) {
        self.registry.active.lock().remove(&self.claim);
        trace!(claim = %self.claim, "writer lease released");
    }
}

#[derive(Debug, Default)]
pub struct ReaderRegistry {
    mapped: Mutex<HashMap<String, usize>>,
}

impl ReaderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a read-only mapping. Take the lease before checking the
    /// backing length so a concurrent truncation either sees this reader or
    /// finishes first.
    pub fn acquire(self: &Arc<Self>, claim: &ResourceClaim) -> ReadLease {
        let mut mapped = self.mapped.lock();
        *mapped.entry(claim.identifier().to_string()).or_insert(0) += 1;

        ReadLease {
            registry: Arc::clone(self),
            claim: claim.identifier().to_string(),
        }
    }

    pub fn readers(&self, claim: &ResourceClaim) -> usize {
        self.mapped
            .lock()
            .get(claim.identifier())
            .copied()
            .unwrap_or(0)
    }

    /// Runs `truncate` while no read-only mapping of `claim` exists. New
    /// readers wait until it returns.
    pub fn exclusive<T>(&self, claim: &str, truncate: impl FnOnce() -> Result<T>) -> Result<T> {
        let mapped = self.mapped.lock();

        if mapped.get(claim).is_some_and(|&n| n > 0) {
            return Err(ContentError::WriterActive {
                claim: claim.to_string(),
            }
            .into());
        }

        let result = truncate();
        drop(mapped);
        result
    }

    /// A gate that lets a writable file mapping of `claim` shrink only while
    /// no reader has it mapped.
    pub fn gate(self: &Arc<Self>, claim: &ResourceClaim) -> Box<dyn TruncateGate> {
        Box::new(ReaderGate {
            registry: Arc::clone(self),
            claim: claim.identifier().to_string(),
        })
    }
}

#[derive(Debug)]
pub struct ReadLease {
    registry: Arc<ReaderRegistry>,
    claim: String,
}

impl Drop for ReadLease {
    fn drop(&mut self) {
        let mut mapped = self.registry.mapped.lock();
        if let Some(count) = mapped.get_mut(&self.claim) {
            *count -= 1;
            if *count == 0 {
                mapped.remove(&self.claim);
            }
        }
    }
}

#[derive(Debug)]
struct ReaderGate {
    registry: Arc<ReaderRegistry>,
    claim: String,
}

impl TruncateGate for ReaderGate {
    fn truncate(&self, truncate: &mut dyn FnMut() -> Result<()>) -> Result<()> {
        self.registry.exclusive(&self.claim, truncate)
    }
}

/// Keeps `claim` referenced, and `lease` held, until `map` is unmapped.
pub(crate) fn hold_until_unmap<L: Send + 'static>(
    map: &mut dyn MemoryMap,
    claim: ClaimRef,
    lease: L,
) {
    map.register_unmap_hook(Box::new(move |_: &[u8]| {
        drop(lease);
        drop(claim);
        Ok(())
    }));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{error_kind, ErrorKind};
    use crate::storage::{PassthroughMemoryMap, PassthroughOps};

    #[test]
    fn second_writer_is_rejected() {
        let registry = Arc::new(WriterRegistry::new());
        let claim = ResourceClaim::detached("a");

        let lease = registry.acquire(&claim).unwrap();
        let err = registry.acquire(&claim).unwrap_err();

        assert_eq!(error_kind(&err), Some(ErrorKind::WriterActive));
        assert!(registry.is_writing(&claim));
        drop(lease);
        assert!(!registry.is_writing(&claim));
        assert!(registry.acquire(&claim).is_ok());
    }

    #[test]
    fn different_claims_do_not_conflict() {
        let registry = Arc::new(WriterRegistry::new());

        let _a = registry.acquire(&ResourceClaim::detached("a")).unwrap();
        let _b = registry.acquire(&ResourceClaim::detached("b")).unwrap();
    }

    #[test]
    fn hook_releases_lease_and_reference_on_unmap() {
        let registry = Arc::new(WriterRegistry::new());
        let claim = ResourceClaim::detached("a");
        let lease = registry.acquire(&claim).unwrap();

        let mut map = PassthroughMemoryMap::new(Vec::new(), PassthroughOps::vec(), false);
        hold_until_unmap(&mut map, claim.acquire(), Some(lease));
        assert_eq!(claim.ref_count(), 1);

        map.unmap().unwrap();

        assert_eq!(claim.ref_count(), 0);
        assert!(!registry.is_writing(&claim));
    }

    #[test]
    fn truncation_waits_for_mapped_readers() {
        let registry = Arc::new(ReaderRegistry::new());
        let claim = ResourceClaim::detached("a");

        let first = registry.acquire(&claim);
        let second = registry.acquire(&claim);
        assert_eq!(registry.readers(&claim), 2);

        let err = registry.exclusive("a", || Ok(())).unwrap_err();
        assert_eq!(error_kind(&err), Some(ErrorKind::WriterActive));
        assert!(registry.exclusive("b", || Ok(())).is_ok());

        drop(first);
        assert!(registry.exclusive("a", || Ok(())).is_err());
        drop(second);

        assert_eq!(registry.readers(&claim), 0);
        assert_eq!(registry.exclusive("a", || Ok(7)).unwrap(), 7);
    }

    #[test]
    fn gate_skips_truncation_while_mapped() {
        let registry = Arc::new(ReaderRegistry::new());
        let claim = ResourceClaim::detached("a");
        let gate = registry.gate(&claim);
        let mut truncated = 0;
        let mut truncate = || -> Result<()> {
            truncated += 1;
            Ok(())
        };

        let lease = registry.acquire(&claim);
        assert!(gate.truncate(&mut truncate).is_err());
        drop(lease);
        gate.truncate(&mut truncate).unwrap();

        assert_eq!(truncated, 1);
    }
}
