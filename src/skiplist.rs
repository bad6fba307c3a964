// Copyright (c) 2025 RustySync Contributors
//
// Lock-coupled concurrent skip list
//
// An ordered set over caller-compared values, based on the optimistic
// lock-coupling design of Herlihy et al. Individual operations run under
// the reader mode of an outer phase-fair lock and synchronize with each
// other through per-node queue locks plus validation; the bulk range
// delete takes the outer lock in writer mode and restructures the list
// with no per-node locking at all.
//
// Nodes are logically removed by setting their marked flag and physically
// spliced out under the predecessors' locks. Reclamation of individually
// deleted nodes is deferred through an epoch so in-flight traversals
// never touch freed memory; bulk delete frees eagerly because writer mode
// excludes every other operation.

use std::cmp::Ordering as CmpOrdering;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

use crossbeam::epoch::{self, Atomic, Guard, Owned, Shared};

use crate::mcs::{McsLock, McsNode};
use crate::pfq::PfqRwLock;
use crate::randomizer::random_level;
use crate::{Backoff, CmpFn, Error, Result};

/// Upper bound on per-list heights; a list picks its own maximum at
/// construction, up to this cap.
pub const MAX_HEIGHT: usize = 32;

#[derive(PartialEq, Clone, Copy)]
enum FindMode {
    /// stop at the first layer where the value matches (read-only find)
    EarlyExit,
    /// fill preds/succs at every layer (insert and delete need all hooks)
    Full,
}

/// Skip-list node. The forward-pointer array is sized by the node's
/// height, which is immutable after construction.
struct Node<T> {
    value: T,
    height: usize,
    nexts: Box<[Atomic<Node<T>>]>,
    /// set once, after the node is linked at every layer
    fully_linked: AtomicBool,
    /// set once, when the node is logically deleted
    marked: AtomicBool,
    /// guards this node's outgoing linkage at any layer
    lock: McsLock,
}

impl<T> Node<T> {
    fn new(value: T, height: usize) -> Self {
        let nexts = (0..height)
            .map(|_| Atomic::null())
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self {
            value,
            height,
            nexts,
            fully_linked: AtomicBool::new(false),
            marked: AtomicBool::new(false),
            lock: McsLock::new(),
        }
    }
}

/// Concurrent ordered set.
///
/// Values are ordered by a caller-supplied trichotomy function; a second
/// `in_range` trichotomy supports lookups that match when a stored value
/// *contains* the probe (zero meaning "contains"). The sentinels supplied
/// at construction must compare strictly below and above every value the
/// list will ever hold.
pub struct ConcurrentSkipList<T> {
    left_sentinel: Atomic<Node<T>>,
    right_sentinel: Atomic<Node<T>>,
    max_height: usize,
    compare: CmpFn<T>,
    in_range: CmpFn<T>,
    /// reader mode for individual operations, writer mode for bulk
    /// restructuring
    lock: PfqRwLock,
    size: AtomicUsize,

    // Statistics
    insert_count: AtomicU64,
    delete_count: AtomicU64,
    search_count: AtomicU64,
}

unsafe impl<T: Send> Send for ConcurrentSkipList<T> {}
unsafe impl<T: Send + Sync> Sync for ConcurrentSkipList<T> {}

impl<T: Clone> ConcurrentSkipList<T> {
    /// Create an empty list.
    ///
    /// `lsentinel` and `rsentinel` are the boundary values; `compare` must
    /// order `lsentinel` below and `rsentinel` above everything that will
    /// be inserted.
    pub fn new(
        lsentinel: T,
        rsentinel: T,
        max_height: usize,
        compare: CmpFn<T>,
        in_range: CmpFn<T>,
    ) -> Result<Self> {
        if max_height == 0 || max_height > MAX_HEIGHT {
            return Err(Error::InvalidHeight {
                requested: max_height,
                cap: MAX_HEIGHT,
            });
        }
        if compare(&lsentinel, &rsentinel) != CmpOrdering::Less {
            return Err(Error::SentinelOrder);
        }

        // the list is not yet shared; no pin is needed to link sentinels
        let guard = unsafe { epoch::unprotected() };
        let right = Owned::new(Node::new(rsentinel, max_height)).into_shared(guard);
        let left = Node::new(lsentinel, max_height);
        for layer in 0..max_height {
            left.nexts[layer].store(right, Ordering::Relaxed);
        }
        let left = Owned::new(left).into_shared(guard);

        let list = Self {
            left_sentinel: Atomic::null(),
            right_sentinel: Atomic::null(),
            max_height,
            compare,
            in_range,
            lock: PfqRwLock::new(),
            size: AtomicUsize::new(0),
            insert_count: AtomicU64::new(0),
            delete_count: AtomicU64::new(0),
            search_count: AtomicU64::new(0),
        };
        list.left_sentinel.store(left, Ordering::Relaxed);
        list.right_sentinel.store(right, Ordering::Relaxed);
        Ok(list)
    }

    /// Walk the list from `from` downward, recording at each layer the
    /// last node ordered below `value` and the node it points at.
    ///
    /// Post-conditions, for every populated layer L:
    /// `compare(preds[L].value, value) < 0` and
    /// `compare(succs[L].value, value) >= 0`; the returned layer, if any,
    /// is the first (topmost) one where the value matched.
    fn find_node<'g>(
        &self,
        compare: CmpFn<T>,
        from: Shared<'g, Node<T>>,
        value: &T,
        preds: &mut [Shared<'g, Node<T>>; MAX_HEIGHT],
        succs: &mut [Shared<'g, Node<T>>; MAX_HEIGHT],
        mode: FindMode,
        guard: &'g Guard,
    ) -> Option<usize> {
        let mut found_layer = None;
        let mut pred = from;

        for layer in (0..self.max_height).rev() {
            let mut curr = unsafe { pred.deref() }.nexts[layer].load(Ordering::Acquire, guard);

            // advance along this layer until a value not below ours
            loop {
                let curr_ref = unsafe { curr.deref() };
                if compare(&curr_ref.value, value) != CmpOrdering::Less {
                    break;
                }
                pred = curr;
                curr = curr_ref.nexts[layer].load(Ordering::Acquire, guard);
            }
            // loop invariant: pred.value < value <= curr.value

            preds[layer] = pred;
            succs[layer] = curr;

            if found_layer.is_none()
                && compare(unsafe { &curr.deref().value }, value) == CmpOrdering::Equal
            {
                found_layer = Some(layer);
                // read-only callers do not need hooks below the match
                if mode == FindMode::EarlyExit {
                    break;
                }
            }
        }

        found_layer
    }

    fn search(&self, compare: CmpFn<T>, value: &T) -> Option<T> {
        self.search_count.fetch_add(1, Ordering::Relaxed);

        let guard = &epoch::pin();
        let _read = self.lock.read();

        let mut preds = [Shared::null(); MAX_HEIGHT];
        let mut succs = [Shared::null(); MAX_HEIGHT];
        let sentinel = self.left_sentinel.load(Ordering::Acquire, guard);
        let found = self.find_node(
            compare,
            sentinel,
            value,
            &mut preds,
            &mut succs,
            FindMode::EarlyExit,
            guard,
        );

        found.and_then(|layer| {
            let node = unsafe { succs[layer].deref() };
            if node.fully_linked.load(Ordering::Acquire) && !node.marked.load(Ordering::Acquire) {
                Some(node.value.clone())
            } else {
                None
            }
        })
    }

    /// Look up a value by exact comparison.
    pub fn find(&self, value: &T) -> Option<T> {
        self.search(self.compare, value)
    }

    /// Look up the stored value whose range contains `value`, according
    /// to the `in_range` trichotomy supplied at construction.
    pub fn find_in_range(&self, value: &T) -> Option<T> {
        self.search(self.in_range, value)
    }

    /// Insert `value`. Returns false (and drops the value) when an equal
    /// value is already present.
    pub fn insert(&self, value: T) -> bool {
        let compare = self.compare;
        let height = random_level(self.max_height);

        let guard = &epoch::pin();
        // allocate up front; linking happens under the predecessor locks
        let node = Owned::new(Node::new(value, height)).into_shared(guard);
        let node_ref = unsafe { node.deref() };

        let mut backoff = Backoff::new();
        loop {
            let _read = self.lock.read();

            let mut preds = [Shared::null(); MAX_HEIGHT];
            let mut succs = [Shared::null(); MAX_HEIGHT];
            let sentinel = self.left_sentinel.load(Ordering::Acquire, guard);
            let found = self.find_node(
                compare,
                sentinel,
                &node_ref.value,
                &mut preds,
                &mut succs,
                FindMode::Full,
                guard,
            );

            if let Some(layer) = found {
                let existing = unsafe { succs[layer].deref() };
                if existing.marked.load(Ordering::Acquire) {
                    // the equal node is being deleted; wait out the splice
                    // and race to reinsert
                    drop(_read);
                    backoff.snooze();
                    continue;
                }
                while !existing.fully_linked.load(Ordering::Acquire) {
                    std::hint::spin_loop();
                }
                // never linked, so nothing else can reference the node
                drop(unsafe { node.into_owned() });
                return false;
            }

            // lock the predecessor at each layer, skipping duplicates
            let slots: Vec<McsNode> = (0..height).map(|_| McsNode::new()).collect();
            let mut highest_locked = None;
            let mut prev_pred = Shared::null();
            let mut valid_layers = 0;
            for layer in 0..height {
                let pred = preds[layer];
                let succ = succs[layer];
                if pred != prev_pred {
                    unsafe { pred.deref() }.lock.lock(&slots[layer]);
                    highest_locked = Some(layer);
                    prev_pred = pred;
                }
                // valid: neither neighbor is being deleted and the hook
                // still points where the walk saw it
                let pred_ref = unsafe { pred.deref() };
                let succ_ref = unsafe { succ.deref() };
                if pred_ref.marked.load(Ordering::Acquire)
                    || succ_ref.marked.load(Ordering::Acquire)
                    || pred_ref.nexts[layer].load(Ordering::Acquire, guard) != succ
                {
                    break;
                }
                debug_assert_eq!(compare(&node_ref.value, &succ_ref.value), CmpOrdering::Less);
                valid_layers += 1;
            }

            if valid_layers == height {
                // link in at layers [0, height); the level-0 hook makes
                // the node reachable
                for layer in 0..height {
                    node_ref.nexts[layer].store(succs[layer], Ordering::Relaxed);
                    unsafe { preds[layer].deref() }.nexts[layer].store(node, Ordering::Release);
                }
                node_ref.fully_linked.store(true, Ordering::Release);

                unlock_preds(&preds, &slots, highest_locked);
                self.size.fetch_add(1, Ordering::Relaxed);
                self.insert_count.fetch_add(1, Ordering::Relaxed);
                return true;
            }

            unlock_preds(&preds, &slots, highest_locked);
            drop(_read);
            backoff.snooze();
        }
    }

    /// Delete the value equal to `value`. Returns false when no such
    /// value is present (or it is already being deleted by another
    /// thread).
    pub fn delete(&self, value: &T) -> bool {
        let compare = self.compare;

        let guard = &epoch::pin();
        // the victim stays locked and marked across validation retries,
        // so its queue slot must outlive the retry loop
        let victim_slot = McsNode::new();
        let mut victim = Shared::null();
        let mut victim_is_marked = false;

        let mut backoff = Backoff::new();
        loop {
            let _read = self.lock.read();

            let mut preds = [Shared::null(); MAX_HEIGHT];
            let mut succs = [Shared::null(); MAX_HEIGHT];
            let sentinel = self.left_sentinel.load(Ordering::Acquire, guard);
            let found = self.find_node(
                compare,
                sentinel,
                value,
                &mut preds,
                &mut succs,
                FindMode::Full,
                guard,
            );

            if !victim_is_marked {
                let Some(layer) = found else { return false };
                let candidate = succs[layer];
                let cand_ref = unsafe { candidate.deref() };
                let removable = cand_ref.fully_linked.load(Ordering::Acquire)
                    && cand_ref.height - 1 == layer
                    && !cand_ref.marked.load(Ordering::Acquire);
                if !removable {
                    return false;
                }

                cand_ref.lock.lock(&victim_slot);
                if cand_ref.marked.load(Ordering::Acquire) {
                    // another thread won the race to delete it
                    cand_ref.lock.unlock(&victim_slot);
                    return false;
                }
                cand_ref.marked.store(true, Ordering::Release);
                victim = candidate;
                victim_is_marked = true;
            }
            // post-condition: victim is marked and locked

            let victim_ref = unsafe { victim.deref() };
            let height = victim_ref.height;

            // lock the predecessor at each layer, skipping duplicates
            let slots: Vec<McsNode> = (0..height).map(|_| McsNode::new()).collect();
            let mut highest_locked = None;
            let mut prev_pred = Shared::null();
            let mut valid = true;
            for layer in 0..height {
                let pred = preds[layer];
                if pred != prev_pred {
                    unsafe { pred.deref() }.lock.lock(&slots[layer]);
                    highest_locked = Some(layer);
                    prev_pred = pred;
                }
                let pred_ref = unsafe { pred.deref() };
                if pred_ref.marked.load(Ordering::Acquire)
                    || pred_ref.nexts[layer].load(Ordering::Acquire, guard) != victim
                {
                    valid = false;
                    break;
                }
            }

            if !valid {
                unlock_preds(&preds, &slots, highest_locked);
                drop(_read);
                backoff.snooze();
                continue;
            }

            // splice out at every layer, top down
            for layer in (0..height).rev() {
                let succ = victim_ref.nexts[layer].load(Ordering::Acquire, guard);
                unsafe { preds[layer].deref() }.nexts[layer].store(succ, Ordering::Release);
            }

            victim_ref.lock.unlock(&victim_slot);
            unlock_preds(&preds, &slots, highest_locked);

            // traversals may still hold references; reclaim after a grace
            // period
            unsafe { guard.defer_destroy(victim) };
            self.size.fetch_sub(1, Ordering::Relaxed);
            self.delete_count.fetch_add(1, Ordering::Relaxed);
            return true;
        }
    }

    /// Remove every value in `[lo, hi]` by exact comparison. Returns true
    /// if anything was removed.
    pub fn delete_range(&self, lo: &T, hi: &T) -> bool {
        self.del_bulk(self.compare, lo, hi)
    }

    /// Remove every stored value whose range intersects `[lo, hi]`
    /// according to the `in_range` trichotomy. Returns true if anything
    /// was removed.
    pub fn delete_range_in(&self, lo: &T, hi: &T) -> bool {
        self.del_bulk(self.in_range, lo, hi)
    }

    /// Bulk unsynchronized delete: writer mode on the outer lock excludes
    /// every individual operation, so the splice takes no per-node locks
    /// and frees eagerly.
    fn del_bulk(&self, compare: CmpFn<T>, lo: &T, hi: &T) -> bool {
        let max_height = self.max_height;
        let me = McsNode::new();
        let _write = self.lock.write(&me);

        // exclusive access: no pin needed while the writer lock is held
        let guard = unsafe { epoch::unprotected() };

        let mut lpreds = [Shared::null(); MAX_HEIGHT];
        let mut hsuccs = [Shared::null(); MAX_HEIGHT];
        let mut other = [Shared::null(); MAX_HEIGHT];

        // hooks around the first candidate
        let sentinel = self.left_sentinel.load(Ordering::Relaxed, guard);
        let low_layer = self.find_node(
            compare,
            sentinel,
            lo,
            &mut lpreds,
            &mut other,
            FindMode::Full,
            guard,
        );
        let first = unsafe { lpreds[0].deref() }.nexts[0].load(Ordering::Relaxed, guard);

        // hooks around the last candidate. A caller probing a single
        // point passes the same reference twice; the low hooks already
        // answer for the high side then.
        let high_layer = if std::ptr::eq(lo, hi) {
            hsuccs = lpreds;
            low_layer
        } else {
            self.find_node(
                compare,
                lpreds[max_height - 1],
                hi,
                &mut hsuccs,
                &mut other,
                FindMode::Full,
                guard,
            )
        };

        // splice whole layers above any layer where hi matched
        let lowest_whole = high_layer.map_or(0, |layer| layer + 1);
        for layer in (lowest_whole..max_height).rev() {
            let after = unsafe { hsuccs[layer].deref() }.nexts[layer].load(Ordering::Relaxed, guard);
            unsafe { lpreds[layer].deref() }.nexts[layer].store(after, Ordering::Relaxed);
        }

        // on the layers hi occupies, splice past the matched node too
        if let Some(top) = high_layer {
            for layer in (0..=top).rev() {
                let matched =
                    unsafe { hsuccs[layer].deref() }.nexts[layer].load(Ordering::Relaxed, guard);
                let after = unsafe { matched.deref() }.nexts[layer].load(Ordering::Relaxed, guard);
                unsafe { lpreds[layer].deref() }.nexts[layer].store(after, Ordering::Relaxed);
            }
        }

        let last = unsafe { lpreds[0].deref() }.nexts[0].load(Ordering::Relaxed, guard);

        // free everything the splice cut out
        let mut removed: usize = 0;
        let mut node = first;
        while node != last {
            let next = unsafe { node.deref() }.nexts[0].load(Ordering::Relaxed, guard);
            drop(unsafe { node.into_owned() });
            node = next;
            removed += 1;
        }

        if removed > 0 {
            tracing::trace!(removed, "bulk range delete spliced nodes out");
            self.size.fetch_sub(removed, Ordering::Relaxed);
            self.delete_count.fetch_add(removed as u64, Ordering::Relaxed);
        }
        removed > 0
    }

    /// Number of values in the list. Approximate under concurrency.
    pub fn len(&self) -> usize {
        self.size.load(Ordering::Relaxed)
    }

    /// Check if empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Get statistics
    pub fn stats(&self) -> SkipListStats {
        SkipListStats {
            size: self.len(),
            inserts: self.insert_count.load(Ordering::Relaxed),
            deletes: self.delete_count.load(Ordering::Relaxed),
            searches: self.search_count.load(Ordering::Relaxed),
        }
    }
}

/// Release the predecessor locks taken by insert or delete, skipping the
/// layers where the same node was locked once for several layers.
fn unlock_preds<T>(
    preds: &[Shared<'_, Node<T>>; MAX_HEIGHT],
    slots: &[McsNode],
    highest_locked: Option<usize>,
) {
    let Some(top) = highest_locked else { return };
    let mut prev_pred = Shared::null();
    for layer in 0..=top {
        let pred = preds[layer];
        if pred != prev_pred {
            unsafe { pred.deref() }.lock.unlock(&slots[layer]);
        }
        prev_pred = pred;
    }
}

impl<T> Drop for ConcurrentSkipList<T> {
    fn drop(&mut self) {
        // exclusive access: walk level 0 and free everything, sentinels
        // included
        let guard = unsafe { epoch::unprotected() };
        let mut node = self.left_sentinel.load(Ordering::Relaxed, guard);
        while !node.is_null() {
            let next = unsafe { node.deref() }.nexts[0].load(Ordering::Relaxed, guard);
            drop(unsafe { node.into_owned() });
            node = next;
        }
    }
}

impl<T: Clone + fmt::Debug> fmt::Debug for ConcurrentSkipList<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let guard = &epoch::pin();
        let _read = self.lock.read();

        let right = self.right_sentinel.load(Ordering::Acquire, guard);
        let left = self.left_sentinel.load(Ordering::Acquire, guard);
        let mut node = unsafe { left.deref() }.nexts[0].load(Ordering::Acquire, guard);

        let mut list = f.debug_list();
        while node != right {
            let node_ref = unsafe { node.deref() };
            list.entry(&format_args!(
                "{:?} @{}/{}",
                node_ref.value, node_ref.height, self.max_height
            ));
            node = node_ref.nexts[0].load(Ordering::Acquire, guard);
        }
        list.finish()
    }
}

/// Skip list statistics
#[derive(Debug, Clone)]
pub struct SkipListStats {
    pub size: usize,
    pub inserts: u64,
    pub deletes: u64,
    pub searches: u64,
}
