//! Memory-bounded allocator for storage outside the managed heap
//!
//! Buffers backing typed arrays and similar objects live outside the engine's
//! heap, so the engine cannot see them when it decides whether to collect.
//! Every such allocation is reserved here first; the running total is the
//! isolate's `extra_allocated_memory`, which the heap governor adds to the
//! engine-reported heap usage when it enforces the memory limit.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, trace};

/// The memory limit and external allocation counter of one isolate
#[derive(Debug)]
pub struct MemoryAccount {
    limit: usize,
    extra_allocated: AtomicUsize,
}

impl MemoryAccount {
    pub fn new(limit: usize) -> Self {
        Self {
            limit,
            extra_allocated: AtomicUsize::new(0),
        }
    }

    /// Configured memory limit in bytes.
    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Bytes currently allocated outside the managed heap.
    pub fn extra_allocated(&self) -> usize {
        self.extra_allocated.load(Ordering::Acquire)
    }

    /// Add (or with a negative delta, remove) externally tracked bytes.
    pub fn adjust(&self, delta: isize) -> usize {
        let magnitude = delta.unsigned_abs();
        if delta >= 0 {
            self.extra_allocated.fetch_add(magnitude, Ordering::AcqRel) + magnitude
        } else {
            let previous = self
                .extra_allocated
                .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                    Some(current.saturating_sub(magnitude))
                })
                .unwrap_or_default();
            previous.saturating_sub(magnitude)
        }
    }
}

/// Allocator handed to the engine at creation time
///
/// Reservations are refused once they would push external memory past the
/// limit. Heap usage is not consulted here; the governor reconciles both at
/// heap checks and after collections.
#[derive(Debug)]
pub struct LimitedAllocator {
    account: Arc<MemoryAccount>,
}

impl LimitedAllocator {
    pub fn new(account: Arc<MemoryAccount>) -> Self {
        Self { account }
    }

    /// Try to reserve `length` bytes. Returns `false` if the budget is exhausted.
    pub fn try_reserve(&self, length: usize) -> bool {
        let limit = self.account.limit();
        let reserved = self.account.extra_allocated.fetch_update(
            Ordering::AcqRel,
            Ordering::Acquire,
            |current| {
                current
                    .checked_add(length)
                    .filter(|&total| total <= limit)
            },
        );
        match reserved {
            Ok(previous) => {
                trace!(length, total = previous + length, "Reserved external memory");
                true
            }
            Err(current) => {
                debug!(length, current, limit, "Refusing external allocation over memory limit");
                false
            }
        }
    }

    /// Return `length` previously reserved bytes.
    pub fn release(&self, length: usize) {
        self.account.adjust(-(length as isize));
    }

    /// Account for an in-place resize of an existing allocation.
    pub fn adjust(&self, delta: isize) {
        self.account.adjust(delta);
    }

    pub fn account(&self) -> &Arc<MemoryAccount> {
        &self.account
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reserve_within_limit() {
        let allocator = LimitedAllocator::new(Arc::new(MemoryAccount::new(1024)));
        assert!(allocator.try_reserve(1000));
        assert_eq!(allocator.account().extra_allocated(), 1000);
        assert!(allocator.try_reserve(24));
        assert_eq!(allocator.account().extra_allocated(), 1024);
    }

    #[test]
    fn test_reserve_refused_over_limit() {
        let allocator = LimitedAllocator::new(Arc::new(MemoryAccount::new(1024)));
        assert!(allocator.try_reserve(1000));
        assert!(!allocator.try_reserve(25));
        // A refused reservation leaves the counter untouched.
        assert_eq!(allocator.account().extra_allocated(), 1000);
    }

    #[test]
    fn test_release_and_adjust() {
        let allocator = LimitedAllocator::new(Arc::new(MemoryAccount::new(4096)));
        assert!(allocator.try_reserve(2048));
        allocator.adjust(512);
        assert_eq!(allocator.account().extra_allocated(), 2560);
        allocator.release(2560);
        assert_eq!(allocator.account().extra_allocated(), 0);
    }

    #[test]
    fn test_adjust_saturates_at_zero() {
        let account = MemoryAccount::new(10);
        assert_eq!(account.adjust(5), 5);
        assert_eq!(account.adjust(-50), 0);
        assert_eq!(account.extra_allocated(), 0);
    }
}
