//! Red-black tree back-end.
//!
//! Synchronous ordered map; the dispatcher serializes access with a mutex.
//! Classic parent-pointer red-black tree with null leaves (null reads as
//! black everywhere).

use std::ptr;

use crate::{MapError, Mapping};

struct RbNode {
    key: u64,
    value: Mapping,
    red: bool,
    parent: *mut RbNode,
    left: *mut RbNode,
    right: *mut RbNode,
}

pub struct RbTree {
    root: *mut RbNode,
    len: u64,
}

unsafe impl Send for RbTree {}

fn is_red(node: *mut RbNode) -> bool {
    !node.is_null() && unsafe { (*node).red }
}

impl RbTree {
    pub fn new() -> Self {
        Self {
            root: ptr::null_mut(),
            len: 0,
        }
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    fn find(&self, key: u64) -> *mut RbNode {
        let mut node = self.root;
        while !node.is_null() {
            let nkey = unsafe { (*node).key };
            node = if key == nkey {
                return node;
            } else if key < nkey {
                unsafe { (*node).left }
            } else {
                unsafe { (*node).right }
            };
        }
        ptr::null_mut()
    }

    pub fn lookup(&self, key: u64) -> Option<Mapping> {
        let node = self.find(key);
        if node.is_null() {
            return None;
        }
        Some(unsafe { (*node).value })
    }

    pub fn insert(&mut self, key: u64, mapping: Mapping) -> Result<(), MapError> {
        let mut parent = ptr::null_mut();
        let mut link = &mut self.root as *mut *mut RbNode;
        unsafe {
            while !(*link).is_null() {
                let cur = *link;
                parent = cur;
                link = if key == (*cur).key {
                    return Err(MapError::DuplicateKey(key));
                } else if key < (*cur).key {
                    &mut (*cur).left
                } else {
                    &mut (*cur).right
                };
            }
            let node = Box::into_raw(Box::new(RbNode {
                key,
                value: mapping,
                red: true,
                parent,
                left: ptr::null_mut(),
                right: ptr::null_mut(),
            }));
            *link = node;
            self.insert_fixup(node);
        }
        self.len += 1;
        Ok(())
    }

    unsafe fn insert_fixup(&mut self, mut z: *mut RbNode) {
        while is_red((*z).parent) {
            let parent = (*z).parent;
            let grand = (*parent).parent;
            debug_assert!(!grand.is_null(), "red parent implies a grandparent");
            if parent == (*grand).left {
                let uncle = (*grand).right;
                if is_red(uncle) {
                    (*parent).red = false;
                    (*uncle).red = false;
                    (*grand).red = true;
                    z = grand;
                } else {
                    if z == (*parent).right {
                        z = parent;
                        self.left_rotate(z);
                    }
                    let parent = (*z).parent;
                    let grand = (*parent).parent;
                    (*parent).red = false;
                    (*grand).red = true;
                    self.right_rotate(grand);
                }
            } else {
                let uncle = (*grand).left;
                if is_red(uncle) {
                    (*parent).red = false;
                    (*uncle).red = false;
                    (*grand).red = true;
                    z = grand;
                } else {
                    if z == (*parent).left {
                        z = parent;
                        self.right_rotate(z);
                    }
                    let parent = (*z).parent;
                    let grand = (*parent).parent;
                    (*parent).red = false;
                    (*grand).red = true;
                    self.left_rotate(grand);
                }
            }
        }
        (*self.root).red = false;
    }

    unsafe fn left_rotate(&mut self, x: *mut RbNode) {
        let y = (*x).right;
        (*x).right = (*y).left;
        if !(*y).left.is_null() {
            (*(*y).left).parent = x;
        }
        (*y).parent = (*x).parent;
        if (*x).parent.is_null() {
            self.root = y;
        } else if x == (*(*x).parent).left {
            (*(*x).parent).left = y;
        } else {
            (*(*x).parent).right = y;
        }
        (*y).left = x;
        (*x).parent = y;
    }

    unsafe fn right_rotate(&mut self, x: *mut RbNode) {
        let y = (*x).left;
        (*x).left = (*y).right;
        if !(*y).right.is_null() {
            (*(*y).right).parent = x;
        }
        (*y).parent = (*x).parent;
        if (*x).parent.is_null() {
            self.root = y;
        } else if x == (*(*x).parent).right {
            (*(*x).parent).right = y;
        } else {
            (*(*x).parent).left = y;
        }
        (*y).right = x;
        (*x).parent = y;
    }

    /// Replaces the subtree rooted at `u` with the one rooted at `v`.
    unsafe fn transplant(&mut self, u: *mut RbNode, v: *mut RbNode) {
        let up = (*u).parent;
        if up.is_null() {
            self.root = v;
        } else if u == (*up).left {
            (*up).left = v;
        } else {
            (*up).right = v;
        }
        if !v.is_null() {
            (*v).parent = up;
        }
    }

    pub fn remove(&mut self, key: u64) -> bool {
        let z = self.find(key);
        if z.is_null() {
            return false;
        }
        unsafe {
            let mut removed_red = (*z).red;
            let x: *mut RbNode;
            let x_parent: *mut RbNode;
            if (*z).left.is_null() {
                x = (*z).right;
                x_parent = (*z).parent;
                self.transplant(z, x);
            } else if (*z).right.is_null() {
                x = (*z).left;
                x_parent = (*z).parent;
                self.transplant(z, x);
            } else {
                // Two children: splice in the in-order successor.
                let mut y = (*z).right;
                while !(*y).left.is_null() {
                    y = (*y).left;
                }
                removed_red = (*y).red;
                x = (*y).right;
                if (*y).parent == z {
                    x_parent = y;
                } else {
                    x_parent = (*y).parent;
                    self.transplant(y, x);
                    (*y).right = (*z).right;
                    (*(*y).right).parent = y;
                }
                self.transplant(z, y);
                (*y).left = (*z).left;
                (*(*y).left).parent = y;
                (*y).red = (*z).red;
            }
            drop(Box::from_raw(z));
            if !removed_red {
                self.delete_fixup(x, x_parent);
            }
        }
        self.len -= 1;
        true
    }

    /// `x` may be null; `x_parent` is its parent (null when `x` is the root).
    unsafe fn delete_fixup(&mut self, mut x: *mut RbNode, mut x_parent: *mut RbNode) {
        while x != self.root && !is_red(x) {
            if x_parent.is_null() {
                break;
            }
            if x == (*x_parent).left {
                let mut w = (*x_parent).right;
                if is_red(w) {
                    (*w).red = false;
                    (*x_parent).red = true;
                    self.left_rotate(x_parent);
                    w = (*x_parent).right;
                }
                if !is_red((*w).left) && !is_red((*w).right) {
                    (*w).red = true;
                    x = x_parent;
                    x_parent = (*x).parent;
                } else {
                    if !is_red((*w).right) {
                        (*(*w).left).red = false;
                        (*w).red = true;
                        self.right_rotate(w);
                        w = (*x_parent).right;
                    }
                    (*w).red = (*x_parent).red;
                    (*x_parent).red = false;
                    (*(*w).right).red = false;
                    self.left_rotate(x_parent);
                    x = self.root;
                    x_parent = ptr::null_mut();
                }
            } else {
                let mut w = (*x_parent).left;
                if is_red(w) {
                    (*w).red = false;
                    (*x_parent).red = true;
                    self.right_rotate(x_parent);
                    w = (*x_parent).left;
                }
                if !is_red((*w).left) && !is_red((*w).right) {
                    (*w).red = true;
                    x = x_parent;
                    x_parent = (*x).parent;
                } else {
                    if !is_red((*w).left) {
                        (*(*w).right).red = false;
                        (*w).red = true;
                        self.left_rotate(w);
                        w = (*x_parent).left;
                    }
                    (*w).red = (*x_parent).red;
                    (*x_parent).red = false;
                    (*(*w).left).red = false;
                    self.right_rotate(x_parent);
                    x = self.root;
                    x_parent = ptr::null_mut();
                }
            }
        }
        if !x.is_null() {
            (*x).red = false;
        }
    }

    /// Greatest key strictly below `key`, with its value.
    pub fn predecessor(&self, key: u64) -> Option<(u64, Mapping)> {
        let mut node = self.root;
        let mut best: *mut RbNode = ptr::null_mut();
        while !node.is_null() {
            node = if unsafe { (*node).key } < key {
                best = node;
                unsafe { (*node).right }
            } else {
                unsafe { (*node).left }
            };
        }
        if best.is_null() {
            return None;
        }
        Some((unsafe { (*best).key }, unsafe { (*best).value }))
    }

    /// Rightmost node.
    pub fn greatest_key(&self) -> Option<u64> {
        let mut node = self.root;
        if node.is_null() {
            return None;
        }
        unsafe {
            while !(*node).right.is_null() {
                node = (*node).right;
            }
            Some((*node).key)
        }
    }
}

impl Default for RbTree {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for RbTree {
    fn drop(&mut self) {
        let mut stack = Vec::new();
        if !self.root.is_null() {
            stack.push(self.root);
        }
        while let Some(node) = stack.pop() {
            unsafe {
                if !(*node).left.is_null() {
                    stack.push((*node).left);
                }
                if !(*node).right.is_null() {
                    stack.push((*node).right);
                }
                drop(Box::from_raw(node));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Checks the red-black invariants: the root is black, no red node has a
    /// red child, and every root-to-null path carries the same black count.
    fn check_invariants(tree: &RbTree) {
        fn walk(node: *mut RbNode, parent_red: bool) -> usize {
            if node.is_null() {
                return 1;
            }
            unsafe {
                assert!(
                    !(parent_red && (*node).red),
                    "red node with red parent at key {}",
                    (*node).key
                );
                let lh = walk((*node).left, (*node).red);
                let rh = walk((*node).right, (*node).red);
                assert_eq!(lh, rh, "black height mismatch at key {}", (*node).key);
                lh + usize::from(!(*node).red)
            }
        }
        if !tree.root.is_null() {
            assert!(!unsafe { (*tree.root).red }, "red root");
        }
        walk(tree.root, false);
    }

    #[test]
    fn insert_remove_keeps_invariants() {
        let mut rb = RbTree::new();
        // Deterministic but scrambled insertion order.
        let mut keys: Vec<u64> = (1..=300).map(|k| (k * 7919) % 1000 + 1).collect();
        keys.sort_unstable();
        keys.dedup();
        let n = keys.len() as u64;
        for (i, &k) in keys.iter().enumerate() {
            rb.insert(k, Mapping::new(i as u64 + 32, 512)).unwrap();
            if i % 37 == 0 {
                check_invariants(&rb);
            }
        }
        assert_eq!(rb.len(), n);
        check_invariants(&rb);

        for (i, &k) in keys.iter().enumerate() {
            assert_eq!(rb.lookup(k), Some(Mapping::new(i as u64 + 32, 512)));
        }

        for (i, &k) in keys.iter().enumerate().filter(|(i, _)| i % 3 != 0) {
            assert!(rb.remove(k), "failed to remove {k}");
            if i % 23 == 0 {
                check_invariants(&rb);
            }
        }
        check_invariants(&rb);
        for (i, &k) in keys.iter().enumerate() {
            let expect = (i % 3 == 0).then(|| Mapping::new(i as u64 + 32, 512));
            assert_eq!(rb.lookup(k), expect);
        }
    }

    #[test]
    fn duplicate_insert_is_reported() {
        let mut rb = RbTree::new();
        rb.insert(9, Mapping::new(32, 512)).unwrap();
        assert_eq!(
            rb.insert(9, Mapping::new(40, 512)),
            Err(MapError::DuplicateKey(9))
        );
        assert_eq!(rb.len(), 1);
    }

    #[test]
    fn predecessor_and_greatest() {
        let mut rb = RbTree::new();
        assert_eq!(rb.greatest_key(), None);
        for k in [50u64, 20, 80, 10, 30, 70, 90] {
            rb.insert(k, Mapping::new(k + 1000, 512)).unwrap();
        }
        assert_eq!(rb.greatest_key(), Some(90));
        assert_eq!(rb.predecessor(10), None);
        assert_eq!(rb.predecessor(55), Some((50, Mapping::new(1050, 512))));
        assert_eq!(rb.predecessor(80), Some((70, Mapping::new(1070, 512))));
        assert_eq!(rb.predecessor(u64::MAX), Some((90, Mapping::new(1090, 512))));

        assert!(rb.remove(90));
        assert_eq!(rb.greatest_key(), Some(80));
        assert!(!rb.remove(90));
    }
}
