// Copyright (c) 2025 RustySync Contributors
//
// Reader-writer red-black tree
//
// An ordered map protected by one phase-fair lock: lookups run in reader
// mode and may overlap freely, inserts run in writer mode. The tree keeps
// the standard red-black invariants (black root, no red node with a red
// child, uniform black count on every root-to-leaf path) through the CLR
// insert fix-up. There is no delete.

use std::cell::UnsafeCell;
use std::cmp::Ordering as CmpOrdering;
use std::ptr;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::mcs::McsNode;
use crate::pfq::PfqRwLock;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum Color {
    Red,
    Black,
}

struct RbNode<K, V> {
    key: K,
    value: V,
    parent: *mut RbNode<K, V>,
    left: *mut RbNode<K, V>,
    right: *mut RbNode<K, V>,
    color: Color,
}

impl<K, V> RbNode<K, V> {
    fn new(key: K, value: V, parent: *mut RbNode<K, V>) -> Self {
        Self {
            key,
            value,
            parent,
            left: ptr::null_mut(),
            right: ptr::null_mut(),
            color: Color::Red,
        }
    }
}

/// Concurrent ordered map with reader-parallel lookups and serialized
/// inserts.
pub struct RwTree<K, V> {
    /// touched only while holding the lock in the appropriate mode
    root: UnsafeCell<*mut RbNode<K, V>>,
    size: AtomicUsize,
    lock: PfqRwLock,
}

unsafe impl<K: Send, V: Send> Send for RwTree<K, V> {}
unsafe impl<K: Send + Sync, V: Send + Sync> Sync for RwTree<K, V> {}

impl<K: Ord, V> RwTree<K, V> {
    pub fn new() -> Self {
        Self {
            root: UnsafeCell::new(ptr::null_mut()),
            size: AtomicUsize::new(0),
            lock: PfqRwLock::new(),
        }
    }

    /// Look up a key under reader mode.
    pub fn find(&self, key: &K) -> Option<V>
    where
        V: Clone,
    {
        let _read = self.lock.read();

        let mut x = unsafe { *self.root.get() };
        while !x.is_null() {
            let node = unsafe { &*x };
            match key.cmp(&node.key) {
                CmpOrdering::Equal => return Some(node.value.clone()),
                CmpOrdering::Less => x = node.left,
                CmpOrdering::Greater => x = node.right,
            }
        }
        None
    }

    /// Insert `key` under writer mode, keeping the existing entry if the
    /// key is already present. Returns true when a new node was created.
    /// `me` is the caller's writer-queue slot.
    pub fn insert(&self, key: K, value: V, me: &McsNode) -> bool {
        let _write = self.lock.write(me);
        unsafe { self.insert_locked(key, value) }
    }

    /// Number of distinct keys inserted.
    pub fn len(&self) -> usize {
        self.size.load(Ordering::Relaxed)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of the keys in ascending order, taken under reader mode.
    pub fn keys_in_order(&self) -> Vec<K>
    where
        K: Clone,
    {
        let _read = self.lock.read();

        let mut out = Vec::with_capacity(self.size.load(Ordering::Relaxed));
        let mut stack = Vec::new();
        let mut x = unsafe { *self.root.get() };
        while !x.is_null() || !stack.is_empty() {
            while !x.is_null() {
                stack.push(x);
                x = unsafe { (*x).left };
            }
            x = stack.pop().unwrap();
            out.push(unsafe { (*x).key.clone() });
            x = unsafe { (*x).right };
        }
        out
    }

    unsafe fn insert_locked(&self, key: K, value: V) -> bool {
        let root = self.root.get();

        if (*root).is_null() {
            let node = Box::into_raw(Box::new(RbNode::new(key, value, ptr::null_mut())));
            (*node).color = Color::Black;
            *root = node;
            self.size.store(1, Ordering::Relaxed);
            return true;
        }

        // find the existing node or the attachment point
        let mut x = *root;
        let mut x_parent = ptr::null_mut();
        let mut path_dir = CmpOrdering::Equal;
        while !x.is_null() {
            match key.cmp(&(*x).key) {
                CmpOrdering::Equal => return false,
                dir => {
                    x_parent = x;
                    path_dir = dir;
                    x = if dir == CmpOrdering::Less {
                        (*x).left
                    } else {
                        (*x).right
                    };
                }
            }
        }

        // attach a red leaf (invariant: path_dir is Less or Greater)
        let node = Box::into_raw(Box::new(RbNode::new(key, value, x_parent)));
        if path_dir == CmpOrdering::Less {
            (*x_parent).left = node;
        } else {
            (*x_parent).right = node;
        }
        self.size.fetch_add(1, Ordering::Relaxed);

        self.rebalance(node);
        (**root).color = Color::Black;
        true
    }

    unsafe fn rebalance(&self, mut x: *mut RbNode<K, V>) {
        let root = self.root.get();

        while x != *root && (*(*x).parent).color == Color::Red {
            let mut x_parent = (*x).parent;
            let x_gparent = (*x_parent).parent;

            if x_parent == (*x_gparent).left {
                let y = (*x_gparent).right;
                if !y.is_null() && (*y).color == Color::Red {
                    // red uncle: recolor and ascend
                    (*x_parent).color = Color::Black;
                    (*y).color = Color::Black;
                    (*x_gparent).color = Color::Red;
                    x = x_gparent;
                } else {
                    if x == (*x_parent).right {
                        x = x_parent;
                        self.left_rotate(x);
                        x_parent = (*x).parent;
                    }
                    let x_gparent = (*x_parent).parent;
                    (*x_parent).color = Color::Black;
                    (*x_gparent).color = Color::Red;
                    self.right_rotate(x_gparent);
                }
            } else {
                let y = (*x_gparent).left;
                if !y.is_null() && (*y).color == Color::Red {
                    (*x_parent).color = Color::Black;
                    (*y).color = Color::Black;
                    (*x_gparent).color = Color::Red;
                    x = x_gparent;
                } else {
                    if x == (*x_parent).left {
                        x = x_parent;
                        self.right_rotate(x);
                        x_parent = (*x).parent;
                    }
                    let x_gparent = (*x_parent).parent;
                    (*x_parent).color = Color::Black;
                    (*x_gparent).color = Color::Red;
                    self.left_rotate(x_gparent);
                }
            }
        }
    }

    //     y           x       |
    //    / \         / \      |
    //   x   c  <==  a   y     |
    //  / \             / \    |
    // a   b           b   c   |
    unsafe fn left_rotate(&self, x: *mut RbNode<K, V>) {
        let root = self.root.get();

        // set y (invariant: y != null)
        let y = (*x).right;

        // move b to x's right subtree
        (*x).right = (*y).left;
        if !(*y).left.is_null() {
            (*(*y).left).parent = x;
        }

        // move y to x's old position
        (*y).parent = (*x).parent;
        if (*x).parent.is_null() {
            *root = y;
        } else if x == (*(*x).parent).left {
            (*(*x).parent).left = y;
        } else {
            (*(*x).parent).right = y;
        }

        // move x to y's left
        (*y).left = x;
        (*x).parent = y;
    }

    //     y           x       |
    //    / \         / \      |
    //   x   c  ==>  a   y     |
    //  / \             / \    |
    // a   b           b   c   |
    unsafe fn right_rotate(&self, y: *mut RbNode<K, V>) {
        let root = self.root.get();

        let x = (*y).left;

        (*y).left = (*x).right;
        if !(*x).right.is_null() {
            (*(*x).right).parent = y;
        }

        (*x).parent = (*y).parent;
        if (*y).parent.is_null() {
            *root = x;
        } else if y == (*(*y).parent).left {
            (*(*y).parent).left = x;
        } else {
            (*(*y).parent).right = x;
        }

        (*x).right = y;
        (*y).parent = x;
    }
}

impl<K: Ord, V> Default for RwTree<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V> Drop for RwTree<K, V> {
    fn drop(&mut self) {
        unsafe fn free_subtree<K, V>(node: *mut RbNode<K, V>) {
            if node.is_null() {
                return;
            }
            free_subtree((*node).left);
            free_subtree((*node).right);
            drop(Box::from_raw(node));
        }
        unsafe { free_subtree(*self.root.get()) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    // check the red-black invariants; returns the black height
    fn check_subtree<K: Ord, V>(node: *mut RbNode<K, V>) -> usize {
        if node.is_null() {
            return 1;
        }
        unsafe {
            if (*node).color == Color::Red {
                for child in [(*node).left, (*node).right] {
                    if !child.is_null() {
                        assert_eq!((*child).color, Color::Black, "red node with red child");
                    }
                }
            }
            if !(*node).left.is_null() {
                assert!((*(*node).left).key < (*node).key);
                assert_eq!((*(*node).left).parent, node);
            }
            if !(*node).right.is_null() {
                assert!((*(*node).right).key > (*node).key);
                assert_eq!((*(*node).right).parent, node);
            }

            let left_black = check_subtree((*node).left);
            let right_black = check_subtree((*node).right);
            assert_eq!(left_black, right_black, "unequal black heights");
            left_black + usize::from((*node).color == Color::Black)
        }
    }

    fn check_invariants<K: Ord, V>(tree: &RwTree<K, V>) {
        let root = unsafe { *tree.root.get() };
        if !root.is_null() {
            assert_eq!(unsafe { (*root).color }, Color::Black, "red root");
        }
        check_subtree(root);
    }

    #[test]
    fn test_empty() {
        let tree: RwTree<i64, i64> = RwTree::new();
        assert!(tree.is_empty());
        assert_eq!(tree.find(&1), None);
        check_invariants(&tree);
    }

    #[test]
    fn test_insert_find() {
        let tree = RwTree::new();
        let me = McsNode::new();

        let keys = [7, 3, 18, 10, 22, 8, 11, 26, 2, 6, 13];
        for &key in &keys {
            assert!(tree.insert(key, key * 10, &me));
            check_invariants(&tree);
        }

        assert_eq!(tree.len(), keys.len());
        for &key in &keys {
            assert_eq!(tree.find(&key), Some(key * 10));
        }
        assert_eq!(tree.find(&99), None);

        let mut sorted = keys.to_vec();
        sorted.sort_unstable();
        assert_eq!(tree.keys_in_order(), sorted);
    }

    #[test]
    fn test_insert_keeps_existing() {
        let tree = RwTree::new();
        let me = McsNode::new();

        assert!(tree.insert(5, "first", &me));
        assert!(!tree.insert(5, "second", &me));
        assert_eq!(tree.find(&5), Some("first"));
        assert_eq!(tree.len(), 1);
    }

    #[test]
    fn test_ascending_and_descending_runs() {
        let tree = RwTree::new();
        let me = McsNode::new();

        for key in 0..64 {
            tree.insert(key, (), &me);
            check_invariants(&tree);
        }
        for key in (64..128).rev() {
            tree.insert(key, (), &me);
            check_invariants(&tree);
        }

        assert_eq!(tree.len(), 128);
        assert_eq!(tree.keys_in_order(), (0..128).collect::<Vec<_>>());
    }

    #[test]
    fn test_concurrent_get_or_insert() {
        let tree = Arc::new(RwTree::new());
        let mut handles = vec![];

        for t in 0..8i64 {
            let tree = Arc::clone(&tree);
            handles.push(thread::spawn(move || {
                let me = McsNode::new();
                let mut created = 0;
                for key in 0..500 {
                    if tree.insert(key, t, &me) {
                        created += 1;
                    }
                    assert!(tree.find(&key).is_some());
                }
                created
            }));
        }

        let created: i32 = handles.into_iter().map(|h| h.join().unwrap()).sum();
        // every key was created by exactly one thread
        assert_eq!(created, 500);
        assert_eq!(tree.len(), 500);
        assert_eq!(tree.keys_in_order(), (0..500).collect::<Vec<_>>());
        check_invariants(&tree);
    }
}
