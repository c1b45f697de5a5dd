//! Ordered sector maps for LBA → PBA redirection.
//!
//! A log-structured block-device layer needs one logically ordered map per
//! virtual device: key = logical sector, value = [`Mapping`] (physical start
//! sector + byte length of the write that produced it). This crate provides
//! that map in four interchangeable back-ends behind the [`SectorMap`]
//! dispatcher:
//!
//! - [`skiplist::SkipList`] — lock-free skip list (up to 24 levels),
//! - [`hashed::HashedBuckets`] — hash table of lock-free sorted lists,
//! - [`bptree::BpTree`] — B+-tree (serialized by the dispatcher),
//! - [`rbtree::RbTree`] — red-black tree (serialized by the dispatcher).
//!
//! The lock-free back-ends tag the low-order pointer bit to mark logically
//! deleted nodes and defer all physical reclamation to map destruction; see
//! the `marked` and `pool` modules.

pub mod bptree;
mod dispatch;
pub mod hashed;
pub mod lf_list;
mod marked;
pub mod pool;
pub mod rbtree;
pub mod skiplist;

pub use dispatch::{InsertOutcome, MapKind, SectorMap};
pub use pool::SlabPool;

use thiserror::Error;

/// Bytes per sector. All map keys and `pba_start` values are in sectors;
/// `length_bytes` is in bytes and is always a multiple of this.
pub const SECTOR_SIZE: u32 = 512;

/// A redirection record: the physical start sector a write landed on and how
/// many bytes it covered.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Mapping {
    pub pba_start: u64,
    pub length_bytes: u32,
}

impl Mapping {
    /// `length_bytes` must be a positive multiple of [`SECTOR_SIZE`].
    pub fn new(pba_start: u64, length_bytes: u32) -> Self {
        debug_assert!(length_bytes > 0 && length_bytes % SECTOR_SIZE == 0);
        Self {
            pba_start,
            length_bytes,
        }
    }

    pub fn len_sectors(&self) -> u64 {
        u64::from(self.length_bytes / SECTOR_SIZE)
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum MapError {
    #[error("key {0} already present")]
    DuplicateKey(u64),
    /// Sector 0 cannot be mapped: the lock-free lists use key 0 as the head
    /// guard, and the engine's allocation offset keeps real writes above it.
    #[error("key 0 is reserved")]
    ReservedKey,
    #[error("lookup retry limit exhausted")]
    RetriesExhausted,
}
