//! Lock-free skip list.
//!
//! Towers of marked next pointers, up to [`MAX_LVL`] levels. A single head
//! guard of full height anchors the left side; the right side is
//! null-terminated. The deletion mark lives in the low bit of each level's
//! next pointer; marking the bottom level is the linearization point of a
//! removal, and only the thread that wins that CAS retires the node. Nodes
//! and replaced value records are reclaimed when the list is dropped, never
//! in-line.

use std::collections::HashSet;
use std::ptr;
use std::sync::atomic::{AtomicPtr, AtomicU64, AtomicUsize, Ordering::SeqCst};
use std::sync::{Arc, Mutex};

use tracing::debug;

use crate::marked;
use crate::pool::SlabPool;
use crate::{InsertOutcome, MapError, Mapping};

pub const MAX_LVL: usize = 24;

/// How marked nodes encountered by [`SkipList::find_preds`] are treated.
#[derive(Clone, Copy, PartialEq, Eq)]
enum Unlink {
    /// Step over marked nodes without touching the structure.
    Dont,
    /// Opportunistically unlink marked runs while passing.
    Assist,
    /// Sweep used after a removal or an abandoned insert: same unlinking
    /// CAS, issued to guarantee the node is fully disconnected.
    Force,
}

pub struct SlNode {
    key: u64,
    value: AtomicPtr<Mapping>,
    height: u32,
    removed_link: AtomicPtr<SlNode>,
    /// Marked pointers; only `next[..height]` are ever linked.
    next: [AtomicUsize; MAX_LVL],
}

impl SlNode {
    fn new(key: u64, value: *mut Mapping, height: usize) -> Self {
        debug_assert!(height >= 1 && height <= MAX_LVL);
        Self {
            key,
            value: AtomicPtr::new(value),
            height: height as u32,
            removed_link: AtomicPtr::new(ptr::null_mut()),
            next: std::array::from_fn(|_| AtomicUsize::new(0)),
        }
    }
}

pub struct SkipList {
    head: *mut SlNode,
    /// High-water mark of levels in use, `1..=MAX_LVL`.
    max_lvl: AtomicUsize,
    last_key: AtomicU64,
    len: AtomicU64,
    removed_stack: AtomicPtr<SlNode>,
    retired_values: Mutex<Vec<*mut Mapping>>,
    nodes: Arc<SlabPool<SlNode>>,
    values: Arc<SlabPool<Mapping>>,
}

unsafe impl Send for SkipList {}
unsafe impl Sync for SkipList {}

impl SkipList {
    pub fn new() -> Self {
        let nodes: Arc<SlabPool<SlNode>> = Arc::new(SlabPool::new());
        let values: Arc<SlabPool<Mapping>> = Arc::new(SlabPool::new());
        let head = nodes.alloc(SlNode::new(0, ptr::null_mut(), MAX_LVL));
        Self {
            head,
            max_lvl: AtomicUsize::new(1),
            last_key: AtomicU64::new(0),
            len: AtomicU64::new(0),
            removed_stack: AtomicPtr::new(ptr::null_mut()),
            retired_values: Mutex::new(Vec::new()),
            nodes,
            values,
        }
    }

    pub fn len(&self) -> u64 {
        self.len.load(SeqCst)
    }

    pub fn is_empty(&self) -> bool {
        marked::strip(unsafe { (*self.head).next[0].load(SeqCst) }) == 0
    }

    /// Cached maximum key ever inserted; 0 means the list never held a key.
    pub fn greatest_key(&self) -> Option<u64> {
        match self.last_key.load(SeqCst) {
            0 => None,
            k => Some(k),
        }
    }

    /// Tower height for a new node: trailing zeros of a random word, halved,
    /// clamped to `[1, MAX_LVL]`. Raises the level high-water mark by at most
    /// one per insert.
    fn random_levels(&self) -> usize {
        let r: u32 = rand::random();
        let mut levels = (r.trailing_zeros() / 2) as usize;
        if levels == 0 {
            return 1;
        }
        if levels > MAX_LVL {
            levels = MAX_LVL;
        }
        let cur = self.max_lvl.load(SeqCst);
        if levels > cur && cur < MAX_LVL {
            let raised = match self.max_lvl.compare_exchange(cur, cur + 1, SeqCst, SeqCst) {
                Ok(_) => cur + 1,
                Err(seen) => seen.min(MAX_LVL),
            };
            debug!(levels = raised, "skiplist: raised level high-water mark");
            return raised;
        }
        levels.min(cur.max(1))
    }

    /// Top-down traversal filling `preds`/`succs` for levels below `n`.
    /// Returns the node matching `key`, or null. Marked nodes are skipped or
    /// unlinked according to `unlink`; CAS interference restarts the
    /// traversal from the head.
    fn find_preds(
        &self,
        preds: &mut [*mut SlNode; MAX_LVL],
        succs: &mut [*mut SlNode; MAX_LVL],
        n: usize,
        key: u64,
        unlink: Unlink,
    ) -> *mut SlNode {
        'restart: loop {
            let mut pred = self.head;
            let mut found: *mut SlNode = ptr::null_mut();
            let top = self.max_lvl.load(SeqCst).min(MAX_LVL);
            for level in (0..top).rev() {
                let next = unsafe { (*pred).next[level].load(SeqCst) };
                if next == 0 && level >= n {
                    continue;
                }
                if marked::is_marked(next) {
                    // pred is mid-removal; its next pointers are frozen.
                    continue 'restart;
                }
                let mut node = next as *mut SlNode;
                while !node.is_null() {
                    let mut node_next = unsafe { (*node).next[level].load(SeqCst) };
                    while marked::is_marked(node_next) {
                        if unlink == Unlink::Dont {
                            // Step over the logically removed node.
                            node = marked::strip(node_next) as *mut SlNode;
                            if node.is_null() {
                                break;
                            }
                            node_next = unsafe { (*node).next[level].load(SeqCst) };
                        } else {
                            // Physically disconnect it.
                            let target = marked::strip(node_next);
                            match unsafe {
                                (*pred).next[level].compare_exchange(
                                    node as usize,
                                    target,
                                    SeqCst,
                                    SeqCst,
                                )
                            } {
                                Ok(_) => node = target as *mut SlNode,
                                Err(other) => {
                                    if marked::is_marked(other) {
                                        continue 'restart;
                                    }
                                    node = other as *mut SlNode;
                                }
                            }
                            node_next = if node.is_null() {
                                0
                            } else {
                                unsafe { (*node).next[level].load(SeqCst) }
                            };
                        }
                    }
                    if node.is_null() {
                        break;
                    }
                    let nkey = unsafe { (*node).key };
                    if nkey >= key {
                        found = if nkey == key { node } else { ptr::null_mut() };
                        break;
                    }
                    found = ptr::null_mut();
                    pred = node;
                    node = node_next as *mut SlNode;
                }
                if node.is_null() {
                    found = ptr::null_mut();
                }
                if level < n {
                    preds[level] = pred;
                    succs[level] = node;
                }
            }
            return found;
        }
    }

    pub fn lookup(&self, key: u64) -> Option<Mapping> {
        if key == 0 {
            return None;
        }
        let mut preds = [ptr::null_mut(); MAX_LVL];
        let mut succs = [ptr::null_mut(); MAX_LVL];
        let node = self.find_preds(&mut preds, &mut succs, 0, key, Unlink::Dont);
        if node.is_null() {
            return None;
        }
        let val = unsafe { (*node).value.load(SeqCst) };
        if val.is_null() {
            // A remover already swapped the value out from under us.
            return None;
        }
        Some(unsafe { *val })
    }

    /// Inserts `key`, or updates its value in place when it already exists
    /// (the update CAS establishes ordering against concurrent removals).
    pub fn insert(&self, key: u64, mapping: Mapping) -> Result<InsertOutcome, MapError> {
        if key == 0 {
            return Err(MapError::ReservedKey);
        }
        self.last_key.fetch_max(key, SeqCst);

        let height = self.random_levels();
        let mut preds = [ptr::null_mut(); MAX_LVL];
        let mut succs = [ptr::null_mut(); MAX_LVL];
        let value = self.values.alloc(mapping);

        'retry: loop {
            let existing = self.find_preds(&mut preds, &mut succs, height, key, Unlink::Assist);
            if !existing.is_null() {
                let old = unsafe { (*existing).value.load(SeqCst) };
                if old.is_null() {
                    // Lost a race to a remover; the key is on its way out.
                    continue 'retry;
                }
                // CAS, not swap: a concurrent remover swaps in null, and we
                // must not resurrect the value behind its back.
                if unsafe {
                    (*existing)
                        .value
                        .compare_exchange(old, value, SeqCst, SeqCst)
                }
                .is_ok()
                {
                    self.retire_value(old);
                    return Ok(InsertOutcome::Updated);
                }
                continue 'retry;
            }

            let node = self.nodes.alloc(SlNode::new(key, value, height));
            for level in 0..height {
                unsafe { (*node).next[level].store(succs[level] as usize, SeqCst) };
            }

            // Linking the bottom level makes the node officially present.
            let pred = preds[0];
            if unsafe {
                (*pred).next[0].compare_exchange(
                    succs[0] as usize,
                    node as usize,
                    SeqCst,
                    SeqCst,
                )
            }
            .is_err()
            {
                unsafe { self.nodes.recycle(node) };
                continue 'retry;
            }
            self.len.fetch_add(1, SeqCst);

            for level in 1..height {
                loop {
                    if unsafe {
                        (*preds[level]).next[level].compare_exchange(
                            succs[level] as usize,
                            node as usize,
                            SeqCst,
                            SeqCst,
                        )
                    }
                    .is_ok()
                    {
                        break;
                    }

                    // Lost the race at this level: recompute the windows and
                    // repair the tower's own next pointers before retrying.
                    self.find_preds(&mut preds, &mut succs, height, key, Unlink::Assist);
                    for i in level..height {
                        let old_next = unsafe { (*node).next[i].load(SeqCst) };
                        if succs[i] as usize == old_next {
                            continue;
                        }
                        if let Err(observed) = unsafe {
                            (*node).next[i].compare_exchange(
                                old_next,
                                succs[i] as usize,
                                SeqCst,
                                SeqCst,
                            )
                        } {
                            debug_assert_eq!(observed, marked::mark(old_next));
                            // A remover marked the tower mid-insert; make
                            // sure it is fully unlinked and stop here.
                            self.force_unlink(key);
                            return Ok(InsertOutcome::Inserted);
                        }
                    }
                }
            }

            if marked::is_marked(unsafe { (*node).next[height - 1].load(SeqCst) }) {
                self.force_unlink(key);
            }
            return Ok(InsertOutcome::Inserted);
        }
    }

    /// Removes `key`. Returns false when no live node matches.
    pub fn remove(&self, key: u64) -> bool {
        let mut preds = [ptr::null_mut(); MAX_LVL];
        let mut succs = [ptr::null_mut(); MAX_LVL];
        let top = self.max_lvl.load(SeqCst).min(MAX_LVL);
        let node = self.find_preds(&mut preds, &mut succs, top, key, Unlink::Assist);
        if node.is_null() {
            return false;
        }

        // Mark every level top-down; the bottom level decides which of the
        // racing removers owns the node.
        let height = unsafe { (*node).height } as usize;
        for level in (0..height).rev() {
            let mut old_next = unsafe { (*node).next[level].load(SeqCst) };
            loop {
                if marked::is_marked(old_next) {
                    if level == 0 {
                        // Another thread won the bottom mark; it retires.
                        return true;
                    }
                    break;
                }
                match unsafe {
                    (*node).next[level].compare_exchange(
                        old_next,
                        marked::mark(old_next),
                        SeqCst,
                        SeqCst,
                    )
                } {
                    Ok(_) => break,
                    Err(observed) => old_next = observed,
                }
            }
        }

        // Swap the value out so concurrent readers and updaters observe the
        // removal; this orders the remove against in-flight value updates.
        let val = unsafe { (*node).value.swap(ptr::null_mut(), SeqCst) };
        if !val.is_null() {
            self.retire_value(val);
        }
        self.force_unlink(key);
        self.push_retired(node);
        self.len.fetch_sub(1, SeqCst);
        true
    }

    /// Greatest key strictly below `key`, with its value. Descends tracking
    /// the rightmost live node whose key is smaller; nodes that are already
    /// marked for removal are stepped over without being reported.
    pub fn predecessor(&self, key: u64) -> Option<(u64, Mapping)> {
        let mut best: *mut SlNode = ptr::null_mut();
        // A marked terminal node means an unlink is in flight right where the
        // answer lives; retry until the sweep lands (bounded like the list's
        // window search), then settle for the best live node seen.
        for _ in 0..10_000 {
            best = ptr::null_mut();
            let mut pred = self.head;
            let top = self.max_lvl.load(SeqCst).min(MAX_LVL);
            for level in (0..top).rev() {
                loop {
                    let next = unsafe { (*pred).next[level].load(SeqCst) };
                    let node = marked::strip(next) as *mut SlNode;
                    if node.is_null() || unsafe { (*node).key } >= key {
                        break;
                    }
                    // The bottom-level mark is the removal linearization point.
                    if !marked::is_marked(unsafe { (*node).next[0].load(SeqCst) }) {
                        best = node;
                    }
                    pred = node;
                }
            }
            if pred == self.head || !marked::is_marked(unsafe { (*pred).next[0].load(SeqCst) })
            {
                break;
            }
        }
        if best.is_null() {
            return None;
        }
        let val = unsafe { (*best).value.load(SeqCst) };
        if val.is_null() {
            // Removed between the liveness check and the value read.
            return None;
        }
        Some((unsafe { (*best).key }, unsafe { *val }))
    }

    fn force_unlink(&self, key: u64) {
        let mut preds = [ptr::null_mut(); MAX_LVL];
        let mut succs = [ptr::null_mut(); MAX_LVL];
        self.find_preds(&mut preds, &mut succs, 0, key, Unlink::Force);
    }

    fn retire_value(&self, val: *mut Mapping) {
        self.retired_values
            .lock()
            .expect("retired value list poisoned")
            .push(val);
    }

    fn push_retired(&self, node: *mut SlNode) {
        loop {
            let old_head = self.removed_stack.load(SeqCst);
            if old_head == node {
                tracing::warn!("skiplist: node already heads the retired stack");
                return;
            }
            unsafe { (*node).removed_link.store(old_head, SeqCst) };
            if self
                .removed_stack
                .compare_exchange(old_head, node, SeqCst, SeqCst)
                .is_ok()
            {
                return;
            }
        }
    }

    unsafe fn free_node(&self, node: *mut SlNode, seen: &mut HashSet<usize>) {
        if !seen.insert(node as usize) {
            tracing::warn!("skiplist: duplicate node during teardown, skipping");
            return;
        }
        let val = (*node).value.load(SeqCst);
        if !val.is_null() {
            self.values.recycle(val);
        }
        self.nodes.recycle(node);
    }
}

impl Default for SkipList {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for SkipList {
    fn drop(&mut self) {
        let mut seen = HashSet::new();

        let mut node =
            marked::strip(unsafe { (*self.head).next[0].load(SeqCst) }) as *mut SlNode;
        while !node.is_null() {
            let next = marked::strip(unsafe { (*node).next[0].load(SeqCst) }) as *mut SlNode;
            unsafe { self.free_node(node, &mut seen) };
            node = next;
        }

        let mut node = self.removed_stack.swap(ptr::null_mut(), SeqCst);
        while !node.is_null() {
            let next = unsafe { (*node).removed_link.load(SeqCst) };
            unsafe { self.free_node(node, &mut seen) };
            node = next;
        }

        for val in self
            .retired_values
            .get_mut()
            .expect("retired value list poisoned")
            .drain(..)
        {
            unsafe { self.values.recycle(val) };
        }

        unsafe { self.free_node(self.head, &mut seen) };
    }
}
