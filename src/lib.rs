// Copyright (c) 2025 RustySync Contributors
//
// Concurrent data structures and synchronization primitives
//
// This crate provides fine-grained, scalable concurrency building blocks:
// a FIFO queue lock with local spinning, a phase-fair reader-writer lock,
// a lock-coupled concurrent skip list, a reader-writer-locked red-black
// tree, and a single-threaded balanced-tree builder. All structures are
// volatile, intra-process, and lock-based with local spinning.

pub mod binary_tree;
pub mod error;
pub mod mcs;
pub mod pfq;
pub mod randomizer;
pub mod rbtree;
pub mod skiplist;

// Re-export main types
pub use binary_tree::BinaryTree;
pub use error::{Error, Result};
pub use mcs::{McsLock, McsNode};
pub use pfq::{PfqReadGuard, PfqRwLock, PfqWriteGuard};
pub use rbtree::RwTree;
pub use skiplist::{ConcurrentSkipList, SkipListStats, MAX_HEIGHT};

/// Cache line size for padding to avoid false sharing
pub const CACHE_LINE_SIZE: usize = 64;

/// Three-way comparison callback supplied by callers of the ordered
/// structures. Returns `Less`/`Equal`/`Greater` like a trichotomy function.
pub type CmpFn<T> = fn(&T, &T) -> std::cmp::Ordering;

/// Backoff strategy for validation-retry loops
pub struct Backoff {
    step: u32,
    max_step: u32,
}

impl Backoff {
    /// Create a new backoff strategy
    pub fn new() -> Self {
        Self {
            step: 0,
            max_step: 10,
        }
    }

    /// Perform a backoff step
    pub fn spin(&mut self) {
        for _ in 0..(1 << self.step.min(self.max_step)) {
            std::hint::spin_loop();
        }
        self.step = self.step.saturating_add(1);
    }

    /// Reset backoff to initial state
    pub fn reset(&mut self) {
        self.step = 0;
    }

    /// Check if we should yield to scheduler
    pub fn should_yield(&self) -> bool {
        self.step > 6
    }

    /// Snooze - either spin or yield
    pub fn snooze(&mut self) {
        if self.should_yield() {
            std::thread::yield_now();
        } else {
            self.spin();
        }
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff() {
        let mut backoff = Backoff::new();
        assert_eq!(backoff.step, 0);

        backoff.spin();
        assert_eq!(backoff.step, 1);

        backoff.reset();
        assert_eq!(backoff.step, 0);
    }
}
