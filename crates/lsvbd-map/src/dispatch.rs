//! Back-end selection and uniform dispatch.

use std::fmt;
use std::str::FromStr;
use std::sync::Mutex;

use tracing::warn;

use crate::bptree::BpTree;
use crate::hashed::HashedBuckets;
use crate::rbtree::RbTree;
use crate::skiplist::SkipList;
use crate::{MapError, Mapping};

/// Operator-facing back-end tags.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MapKind {
    /// B+-tree (`"bt"`).
    BTree,
    /// Lock-free skip list (`"sl"`).
    SkipList,
    /// Hash table of lock-free sorted lists (`"ht"`).
    Hashed,
    /// Red-black tree (`"rb"`).
    RbTree,
}

impl MapKind {
    pub const ALL: [MapKind; 4] = [
        MapKind::BTree,
        MapKind::SkipList,
        MapKind::Hashed,
        MapKind::RbTree,
    ];

    pub fn tag(&self) -> &'static str {
        match self {
            MapKind::BTree => "bt",
            MapKind::SkipList => "sl",
            MapKind::Hashed => "ht",
            MapKind::RbTree => "rb",
        }
    }

    /// Whether the back-end tolerates concurrent callers without locking.
    pub fn is_lock_free(&self) -> bool {
        matches!(self, MapKind::SkipList | MapKind::Hashed)
    }
}

impl fmt::Display for MapKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

impl FromStr for MapKind {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "bt" => Ok(MapKind::BTree),
            "sl" => Ok(MapKind::SkipList),
            "ht" => Ok(MapKind::Hashed),
            "rb" => Ok(MapKind::RbTree),
            _ => Err(()),
        }
    }
}

/// What an insert did. The skip list's insert doubles as its update
/// primitive, so an existing key reports [`Updated`](InsertOutcome::Updated)
/// rather than failing.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted,
    Updated,
}

/// One ordered map per virtual device, in the operator-selected back-end.
///
/// The lock-free variants take concurrent callers directly; the tree
/// variants are serialized here behind a mutex, which keeps the engine
/// oblivious to the distinction.
pub enum SectorMap {
    BTree(Mutex<BpTree>),
    SkipList(SkipList),
    Hashed(HashedBuckets),
    RbTree(Mutex<RbTree>),
}

impl SectorMap {
    pub fn new(kind: MapKind) -> Self {
        match kind {
            MapKind::BTree => SectorMap::BTree(Mutex::new(BpTree::new())),
            MapKind::SkipList => SectorMap::SkipList(SkipList::new()),
            MapKind::Hashed => SectorMap::Hashed(HashedBuckets::new()),
            MapKind::RbTree => SectorMap::RbTree(Mutex::new(RbTree::new())),
        }
    }

    pub fn kind(&self) -> MapKind {
        match self {
            SectorMap::BTree(_) => MapKind::BTree,
            SectorMap::SkipList(_) => MapKind::SkipList,
            SectorMap::Hashed(_) => MapKind::Hashed,
            SectorMap::RbTree(_) => MapKind::RbTree,
        }
    }

    pub fn lookup(&self, key: u64) -> Option<Mapping> {
        match self {
            SectorMap::BTree(bt) => bt.lock().expect("map poisoned").lookup(key),
            SectorMap::SkipList(sl) => sl.lookup(key),
            SectorMap::Hashed(ht) => ht.lookup(key),
            SectorMap::RbTree(rb) => rb.lock().expect("map poisoned").lookup(key),
        }
    }

    /// Inserts `key`. Duplicates cannot arise from the write path (it
    /// removes first), so they are reported: as an error by the tree and
    /// list back-ends, as a warning by the updating skip list.
    pub fn insert(&self, key: u64, mapping: Mapping) -> Result<(), MapError> {
        match self {
            SectorMap::BTree(bt) => bt.lock().expect("map poisoned").insert(key, mapping),
            SectorMap::SkipList(sl) => match sl.insert(key, mapping)? {
                InsertOutcome::Inserted => Ok(()),
                InsertOutcome::Updated => {
                    warn!(key, "skiplist insert updated an existing mapping");
                    Ok(())
                }
            },
            SectorMap::Hashed(ht) => ht.insert(key, mapping),
            SectorMap::RbTree(rb) => rb.lock().expect("map poisoned").insert(key, mapping),
        }
    }

    /// Removes `key`; removing an absent key is a logged no-op.
    pub fn remove(&self, key: u64) {
        let removed = match self {
            SectorMap::BTree(bt) => bt.lock().expect("map poisoned").remove(key),
            SectorMap::SkipList(sl) => sl.remove(key),
            SectorMap::Hashed(ht) => ht.remove(key),
            SectorMap::RbTree(rb) => rb.lock().expect("map poisoned").remove(key),
        };
        if !removed {
            warn!(key, "remove of absent key");
        }
    }

    /// Value of the greatest key strictly less than `key`, with that key.
    pub fn predecessor(&self, key: u64) -> Option<(u64, Mapping)> {
        match self {
            SectorMap::BTree(bt) => bt.lock().expect("map poisoned").predecessor(key),
            SectorMap::SkipList(sl) => sl.predecessor(key),
            SectorMap::Hashed(ht) => ht.predecessor(key),
            SectorMap::RbTree(rb) => rb.lock().expect("map poisoned").predecessor(key),
        }
    }

    /// Greatest key present. The lock-free back-ends answer from an
    /// insert-maintained cache, the trees by traversal.
    pub fn greatest_key(&self) -> Option<u64> {
        match self {
            SectorMap::BTree(bt) => bt.lock().expect("map poisoned").greatest_key(),
            SectorMap::SkipList(sl) => sl.greatest_key(),
            SectorMap::Hashed(ht) => ht.greatest_key(),
            SectorMap::RbTree(rb) => rb.lock().expect("map poisoned").greatest_key(),
        }
    }

    pub fn is_empty(&self) -> bool {
        match self {
            SectorMap::BTree(bt) => bt.lock().expect("map poisoned").is_empty(),
            SectorMap::SkipList(sl) => sl.is_empty(),
            SectorMap::Hashed(ht) => ht.is_empty(),
            SectorMap::RbTree(rb) => rb.lock().expect("map poisoned").is_empty(),
        }
    }

    pub fn len(&self) -> u64 {
        match self {
            SectorMap::BTree(bt) => bt.lock().expect("map poisoned").len(),
            SectorMap::SkipList(sl) => sl.len(),
            SectorMap::Hashed(ht) => ht.len(),
            SectorMap::RbTree(rb) => rb.lock().expect("map poisoned").len(),
        }
    }
}
