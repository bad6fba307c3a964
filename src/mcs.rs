// Copyright (c) 2025 RustySync Contributors
//
// MCS queue lock
//
// Fair FIFO mutual exclusion with local spinning. Each contending thread
// enqueues a caller-owned node and spins on its own flag, so waiters
// generate no coherence traffic on the shared tail word.
//
// Reference:
//   John M. Mellor-Crummey and Michael L. Scott. 1991. Algorithms for
//   scalable synchronization on shared-memory multiprocessors. ACM
//   Transactions on Computer Systems 9, 1 (February 1991), 21-65.

use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicPtr, Ordering};

/// A thread's place in the queue.
///
/// The node is caller-owned: it must stay at a stable address from the
/// `lock` call until the matching `unlock` returns, because both the
/// predecessor and the successor hold raw pointers to it. One node may
/// serve one lock acquisition at a time.
///
/// Cache-line aligned to prevent false sharing between waiters.
#[repr(C, align(64))]
pub struct McsNode {
    pub(crate) next: AtomicPtr<McsNode>,
    pub(crate) blocked: AtomicBool,
}

impl McsNode {
    pub const fn new() -> Self {
        Self {
            next: AtomicPtr::new(ptr::null_mut()),
            blocked: AtomicBool::new(false),
        }
    }
}

impl Default for McsNode {
    fn default() -> Self {
        Self::new()
    }
}

/// FIFO queue lock. The lock word is a single tail pointer; an empty
/// queue is null.
#[repr(C, align(64))]
pub struct McsLock {
    tail: AtomicPtr<McsNode>,
}

impl McsLock {
    pub const fn new() -> Self {
        Self {
            tail: AtomicPtr::new(ptr::null_mut()),
        }
    }

    /// Acquire the lock, spinning locally behind any predecessor.
    pub fn lock(&self, me: &McsNode) {
        me.next.store(ptr::null_mut(), Ordering::Relaxed);
        let me_ptr = me as *const McsNode as *mut McsNode;

        let predecessor = self.tail.swap(me_ptr, Ordering::AcqRel);
        if !predecessor.is_null() {
            // blocked must be set before this node is published to the
            // predecessor; the release store on next orders both.
            me.blocked.store(true, Ordering::Relaxed);
            unsafe { (*predecessor).next.store(me_ptr, Ordering::Release) };

            while me.blocked.load(Ordering::Acquire) {
                std::hint::spin_loop();
            }
        }
    }

    /// Acquire the lock only if the queue is empty.
    pub fn try_lock(&self, me: &McsNode) -> bool {
        me.next.store(ptr::null_mut(), Ordering::Relaxed);
        let me_ptr = me as *const McsNode as *mut McsNode;

        self.tail
            .compare_exchange(ptr::null_mut(), me_ptr, Ordering::AcqRel, Ordering::Relaxed)
            .is_ok()
    }

    /// Release the lock, handing it to the successor if one is queued.
    pub fn unlock(&self, me: &McsNode) {
        let me_ptr = me as *const McsNode as *mut McsNode;

        let mut successor = me.next.load(Ordering::Acquire);
        if successor.is_null() {
            // nobody visibly queued behind us; if the tail still points at
            // this node, the queue empties here
            if self
                .tail
                .compare_exchange(me_ptr, ptr::null_mut(), Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return;
            }

            // a successor swapped the tail but has not linked itself yet
            loop {
                successor = me.next.load(Ordering::Acquire);
                if !successor.is_null() {
                    break;
                }
                std::hint::spin_loop();
            }
        }

        unsafe { (*successor).blocked.store(false, Ordering::Release) };
    }
}

impl Default for McsLock {
    fn default() -> Self {
        Self::new()
    }
}
