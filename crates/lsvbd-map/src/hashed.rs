//! Hash table of lock-free sorted lists.
//!
//! The key space is carved into chunks of [`CHUNK_SIZE`] sectors; a chunk
//! hashes to one of `1 << 17` buckets, each an independent
//! [`LfList`](crate::lf_list::LfList). Keys inside a bucket are sorted, but
//! there is no order across buckets, so a predecessor probe that comes up
//! empty in its own bucket falls back to the previous chunk's bucket.
//!
//! Buckets are materialized on first touch; an idle map costs one pointer
//! slot per bucket, not two guard nodes per bucket.

use std::ptr;
use std::sync::atomic::{AtomicPtr, AtomicU64, Ordering::SeqCst};
use std::sync::Arc;

use tracing::debug;

use crate::lf_list::{LfList, LfNode, RemoveOutcome};
use crate::pool::SlabPool;
use crate::{MapError, Mapping};

pub const HT_MAP_BITS: u32 = 17;
pub const BUCKET_COUNT: usize = 1 << HT_MAP_BITS;
/// Sectors per chunk of key space; one chunk maps to one bucket.
pub const CHUNK_SIZE: u64 = 2048;

/// Sentinel for "no chunk populated yet" (chunk 0 is a valid chunk).
const NO_CHUNK: u64 = u64::MAX;

const GOLDEN_RATIO_64: u64 = 0x61c8_8646_80b5_83eb;

/// The kernel's `hash_min` for 64-bit values: multiplicative hash keeping
/// the top `bits` bits.
fn hash_min(val: u64, bits: u32) -> usize {
    (val.wrapping_mul(GOLDEN_RATIO_64) >> (64 - bits)) as usize
}

pub struct HashedBuckets {
    buckets: Box<[AtomicPtr<LfList>]>,
    /// Maximum-keyed node ever inserted; nodes outlive removal (retired, not
    /// freed), so reading its key stays safe even when stale.
    last_el: AtomicPtr<LfNode>,
    /// Highest chunk number ever populated, or [`NO_CHUNK`].
    max_chunk: AtomicU64,
    len: AtomicU64,
    nodes: Arc<SlabPool<LfNode>>,
    values: Arc<SlabPool<Mapping>>,
}

unsafe impl Send for HashedBuckets {}
unsafe impl Sync for HashedBuckets {}

impl HashedBuckets {
    pub fn new() -> Self {
        let buckets = (0..BUCKET_COUNT)
            .map(|_| AtomicPtr::new(ptr::null_mut()))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self {
            buckets,
            last_el: AtomicPtr::new(ptr::null_mut()),
            max_chunk: AtomicU64::new(NO_CHUNK),
            len: AtomicU64::new(0),
            nodes: Arc::new(SlabPool::new()),
            values: Arc::new(SlabPool::new()),
        }
    }

    pub fn len(&self) -> u64 {
        self.len.load(SeqCst)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn greatest_key(&self) -> Option<u64> {
        let last = self.last_el.load(SeqCst);
        if last.is_null() {
            return None;
        }
        Some(unsafe { (*last).key })
    }

    fn bucket(&self, chunk: u64) -> Option<&LfList> {
        let slot = &self.buckets[hash_min(chunk, HT_MAP_BITS)];
        let list = slot.load(SeqCst);
        if list.is_null() {
            return None;
        }
        Some(unsafe { &*list })
    }

    fn bucket_or_create(&self, chunk: u64) -> &LfList {
        let slot = &self.buckets[hash_min(chunk, HT_MAP_BITS)];
        let list = slot.load(SeqCst);
        if !list.is_null() {
            return unsafe { &*list };
        }
        let fresh = Box::into_raw(Box::new(LfList::new(
            self.nodes.clone(),
            self.values.clone(),
        )));
        match slot.compare_exchange(ptr::null_mut(), fresh, SeqCst, SeqCst) {
            Ok(_) => {
                debug!(chunk, "hashed map: created bucket");
                unsafe { &*fresh }
            }
            Err(winner) => {
                drop(unsafe { Box::from_raw(fresh) });
                unsafe { &*winner }
            }
        }
    }

    pub fn lookup(&self, key: u64) -> Option<Mapping> {
        self.bucket(key / CHUNK_SIZE)?.lookup(key)
    }

    pub fn insert(&self, key: u64, mapping: Mapping) -> Result<(), MapError> {
        if key == 0 {
            return Err(MapError::ReservedKey);
        }
        let chunk = key / CHUNK_SIZE;
        let node = self.bucket_or_create(chunk).insert(key, mapping)?;
        self.len.fetch_add(1, SeqCst);

        // Raise the populated-chunk high-water mark.
        let mut max = self.max_chunk.load(SeqCst);
        while max == NO_CHUNK || chunk > max {
            match self.max_chunk.compare_exchange(max, chunk, SeqCst, SeqCst) {
                Ok(_) => break,
                Err(seen) => max = seen,
            }
        }

        // Track the maximum-keyed node for greatest_key().
        let mut last = self.last_el.load(SeqCst);
        loop {
            if !last.is_null() && unsafe { (*last).key } >= key {
                break;
            }
            match self.last_el.compare_exchange(last, node, SeqCst, SeqCst) {
                Ok(_) => break,
                Err(seen) => last = seen,
            }
        }
        Ok(())
    }

    pub fn remove(&self, key: u64) -> bool {
        let Some(list) = self.bucket(key / CHUNK_SIZE) else {
            return false;
        };
        let outcome = list.remove(key);
        // Only the winning remover accounts for the element; a racing
        // observer of the same mark must not decrement a second time.
        if outcome == RemoveOutcome::Removed {
            self.len.fetch_sub(1, SeqCst);
        }
        outcome.key_gone()
    }

    /// Predecessor within the key's bucket, falling back to the previous
    /// chunk's bucket when the local window only offers the head guard.
    pub fn predecessor(&self, key: u64) -> Option<(u64, Mapping)> {
        let chunk = key / CHUNK_SIZE;
        if let Some(list) = self.bucket(chunk) {
            if let Some(hit) = list.predecessor(key) {
                return Some(hit);
            }
        }
        let max = self.max_chunk.load(SeqCst);
        if max == NO_CHUNK {
            return None;
        }
        // chunk 0 wraps to u64::MAX and is clamped back to the high-water
        // mark, mirroring the unsigned arithmetic of the original probe.
        let prev_chunk = chunk.wrapping_sub(1).min(max);
        if prev_chunk == chunk {
            return None;
        }
        self.bucket(prev_chunk)?.predecessor(key)
    }
}

impl Default for HashedBuckets {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for HashedBuckets {
    fn drop(&mut self) {
        for slot in self.buckets.iter() {
            let list = slot.swap(ptr::null_mut(), SeqCst);
            if !list.is_null() {
                drop(unsafe { Box::from_raw(list) });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_min_is_stable_and_in_range() {
        for chunk in [0u64, 1, 2, 63, 64, 1 << 20, u64::MAX / CHUNK_SIZE] {
            let b = hash_min(chunk, HT_MAP_BITS);
            assert!(b < BUCKET_COUNT);
            assert_eq!(b, hash_min(chunk, HT_MAP_BITS));
        }
    }

    #[test]
    fn insert_lookup_remove_across_chunks() {
        let ht = HashedBuckets::new();
        assert!(ht.is_empty());

        // Same chunk.
        ht.insert(100, Mapping::new(32, 512)).unwrap();
        ht.insert(200, Mapping::new(33, 512)).unwrap();
        // A far-away chunk.
        let far = 10 * CHUNK_SIZE + 7;
        ht.insert(far, Mapping::new(34, 512)).unwrap();

        assert_eq!(ht.lookup(100), Some(Mapping::new(32, 512)));
        assert_eq!(ht.lookup(far), Some(Mapping::new(34, 512)));
        assert_eq!(ht.lookup(101), None);
        assert_eq!(ht.greatest_key(), Some(far));
        assert_eq!(ht.len(), 3);

        assert!(ht.remove(100));
        assert!(!ht.remove(100));
        assert_eq!(ht.lookup(100), None);
        assert_eq!(ht.len(), 2);
    }

    #[test]
    fn predecessor_falls_back_to_previous_chunk() {
        let ht = HashedBuckets::new();
        ht.insert(10, Mapping::new(32, 512)).unwrap();
        // Key in chunk 1 with an empty local window below it.
        let key = CHUNK_SIZE + 5;
        ht.insert(key, Mapping::new(40, 512)).unwrap();

        // Within-bucket predecessor.
        assert_eq!(
            ht.predecessor(key + 1),
            Some((key, Mapping::new(40, 512)))
        );
        // Falls back to chunk 0.
        assert_eq!(ht.predecessor(key), Some((10, Mapping::new(32, 512))));
        // Nothing below the smallest key.
        assert_eq!(ht.predecessor(10), None);
    }

    #[test]
    fn greatest_key_tracks_inserts_only() {
        let ht = HashedBuckets::new();
        assert_eq!(ht.greatest_key(), None);
        ht.insert(500, Mapping::new(32, 512)).unwrap();
        ht.insert(300, Mapping::new(33, 512)).unwrap();
        assert_eq!(ht.greatest_key(), Some(500));
    }
}
