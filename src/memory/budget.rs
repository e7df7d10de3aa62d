//! # Content Budget
//!
//! Byte and entry accounting for the volatile repository.
//!
//! ## Design Principles
//!
//! 1. **Hard Limits**: growth that would exceed the budget fails immediately
//!    with `ContentError::CapacityExceeded`
//! 2. **Lock-Free**: counters are atomics updated with compare-exchange loops,
//!    so concurrent mappings growing different entries never lose an update
//! 3. **Saturating Release**: releasing more than was allocated clamps at zero
//!
//! The limit is fixed at construction; there is no eviction. When the budget
//! is exhausted callers must remove content before more can be stored.

use std::sync::atomic::{AtomicUsize, Ordering};

use crate::config::MIN_VOLATILE_MAX_BYTES;
use crate::error::ContentError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BudgetStats {
    pub max_bytes: usize,
    pub bytes_used: usize,
    pub max_count: usize,
    pub entries: usize,
}

impl BudgetStats {
    pub fn bytes_available(&self) -> usize {
        self.max_bytes.saturating_sub(self.bytes_used)
    }

    pub fn utilization_percent(&self) -> f64 {
        if self.max_bytes == 0 {
            return 0.0;
        }
        (self.bytes_used as f64 / self.max_bytes as f64) * 100.0
    }
}

#[derive(Debug)]
pub struct ContentBudget {
    max_bytes: usize,
    max_count: usize,
    bytes_used: AtomicUsize,
    entries: AtomicUsize,
}

impl ContentBudget {
    pub fn new(max_bytes: usize, max_count: usize) -> Self {
        Self {
            max_bytes: max_bytes.max(MIN_VOLATILE_MAX_BYTES),
            max_count: max_count.max(1),
            bytes_used: AtomicUsize::new(0),
            entries: AtomicUsize::new(0),
        }
    }

    pub fn max_bytes(&self) -> usize {
        self.max_bytes
    }

    pub fn bytes_used(&self) -> usize {
        self.bytes_used.load(Ordering::Acquire)
    }

    pub fn entries(&self) -> usize {
        self.entries.load(Ordering::Acquire)
    }

    pub fn can_allocate(&self, bytes: usize) -> bool {
        self.max_bytes.saturating_sub(self.bytes_used()) >= bytes
    }

    pub fn allocate(&self, bytes: usize) -> Result<(), ContentError> {
        if bytes == 0 {
            return Ok(());
        }

        Self::reserve(&self.bytes_used, bytes, self.max_bytes)
    }

    pub fn release(&self, bytes: usize) {
        if bytes == 0 {
            return;
        }

        Self::saturating_release(&self.bytes_used, bytes);
    }

    pub fn admit_entry(&self) -> Result<(), ContentError> {
        Self::reserve(&self.entries, 1, self.max_count)
    }

    pub fn retire_entry(&self) {
        Self::saturating_release(&self.entries, 1);
    }

    /// Moves accounting from `old_len` to `new_len` bytes.
    pub fn adjust(&self, old_len: usize, new_len: usize) -> Result<(), ContentError> {
        if new_len > old_len {
            self.allocate(new_len - old_len)
        } else {
            self.release(old_len - new_len);
            Ok(())
        }
    }

    pub fn stats(&self) -> BudgetStats {
        BudgetStats {
            max_bytes: self.max_bytes,
            bytes_used: self.bytes_used(),
            max_count: self.max_count,
            entries: self.entries(),
        }
    }

    fn reserve(counter: &AtomicUsize, amount: usize, limit: usize) -> Result<(), ContentError> {
        loop {
            let current = counter.load(Ordering::Acquire);
            let available = limit.saturating_sub(current);

            if amount > available {
                return Err(ContentError::CapacityExceeded {
                    requested: amount,
                    available,
                });
            }

            match counter.compare_exchange_weak(
                current,
                current + amount,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Ok(()),
                Err(_) => continue,
            }
        }
    }

    fn saturating_release(counter: &AtomicUsize, amount: usize) {
        loop {
            let current = counter.load(Ordering::Acquire);
            let new_value = current.saturating_sub(amount);

            match counter.compare_exchange_weak(
                current,
                new_value,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return,
                Err(_) => continue,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn limit_respects_floor() {
        let budget = ContentBudget::new(10, 0);

        assert_eq!(budget.max_bytes(), MIN_VOLATILE_MAX_BYTES);
        assert_eq!(budget.stats().max_count, 1);
    }

    #[test]
    fn allocate_past_limit_fails() {
        let budget = ContentBudget::new(MIN_VOLATILE_MAX_BYTES, 10);

        budget.allocate(MIN_VOLATILE_MAX_BYTES - 1).unwrap();
        let err = budget.allocate(2).unwrap_err();

        match err {
            ContentError::CapacityExceeded {
                requested,
                available,
            } => {
                assert_eq!(requested, 2);
                assert_eq!(available, 1);
            }
            other => panic!("unexpected error {:?}", other),
        }
        assert_eq!(budget.bytes_used(), MIN_VOLATILE_MAX_BYTES - 1);
    }

    #[test]
    fn release_underflow_protection() {
        let budget = ContentBudget::new(MIN_VOLATILE_MAX_BYTES, 10);

        budget.release(1000);

        assert_eq!(budget.bytes_used(), 0);
    }

    #[test]
    fn adjust_grows_and_shrinks() {
        let budget = ContentBudget::new(MIN_VOLATILE_MAX_BYTES, 10);

        budget.adjust(0, 100).unwrap();
        budget.adjust(100, 40).unwrap();

        assert_eq!(budget.bytes_used(), 40);
        assert!(budget.can_allocate(MIN_VOLATILE_MAX_BYTES - 40));
        assert!(!budget.can_allocate(MIN_VOLATILE_MAX_BYTES - 39));
    }

    #[test]
    fn entry_count_is_capped() {
        let budget = ContentBudget::new(MIN_VOLATILE_MAX_BYTES, 2);

        budget.admit_entry().unwrap();
        budget.admit_entry().unwrap();
        assert!(budget.admit_entry().is_err());

        budget.retire_entry();
        assert!(budget.admit_entry().is_ok());
    }

    #[test]
    fn concurrent_allocations_are_exact() {
        let budget = Arc::new(ContentBudget::new(1024 * 1024, 10));

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let budget = Arc::clone(&budget);
                thread::spawn(move || {
                    for _ in 0..1000 {
                        budget.allocate(16).unwrap();
                        budget.release(8);
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(budget.bytes_used(), 4 * 1000 * 8);
    }
}
