//! Log-structured virtual block device (LSVBD) mapping layer.
//!
//! Sits between an upper block-I/O issuer and a backing device: every write
//! is redirected to a fresh physical range taken from a single append-only
//! log head, and reads consult the per-device indirection map to find where
//! the most recent write for their range landed. Random writes become
//! sequential appends on the backing device; reads keep ordinary random
//! semantics.
//!
//! The moving parts:
//!
//! - [`Registry`] — the device list, the operator control surface, and the
//!   global log head;
//! - [`Engine`] — the I/O redirection engine (write allocator, read segment
//!   resolver, split driver);
//! - [`StorageBackend`] / [`CloneSink`] — the backing-device seam: real
//!   file-backed devices, in-memory images for tests, or a recording sink
//!   that just captures what the engine submits;
//! - the per-device indirection map itself lives in `lsvbd-map` and is
//!   re-exported here.

mod backend;
mod device;
mod engine;
mod error;
mod io;
mod registry;

pub use backend::{FileBackend, MemBackend, StorageBackend};
pub use device::VirtualDevice;
pub use engine::Engine;
pub use error::VbdError;
pub use io::{
    BackendSink, CloneIo, CloneRecord, CloneSink, IoCompletion, IoOp, IoPayload, IoRequest,
    RecordingSink,
};
pub use registry::{Registry, DEVICE_NAME_PREFIX};

pub use lsvbd_map::{MapError, MapKind, Mapping, SectorMap, SECTOR_SIZE};

/// First sector the log allocator will ever hand out. Keeps sector 0 (and a
/// little headroom) out of the mapped range: the lock-free maps reserve
/// key 0, and early-boot probes below this offset classify as system I/O.
pub const SECTOR_OFFSET: u64 = 32;

pub type Result<T> = std::result::Result<T, VbdError>;
