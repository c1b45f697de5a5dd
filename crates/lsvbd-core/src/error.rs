use lsvbd_map::MapError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum VbdError {
    #[error("no such virtual device: {0}")]
    NoSuchDevice(String),
    #[error("virtual device name already in use: {0}")]
    DuplicateName(String),
    #[error("no virtual device at index {0}")]
    BadIndex(usize),
    #[error("unknown map back-end tag: {0}")]
    UnknownBackend(String),
    #[error("no map back-end selected")]
    BackendNotSelected,
    #[error("map operation failed: {0}")]
    Map(#[from] MapError),
    #[error("request not sector-aligned")]
    Misaligned,
    #[error("access out of bounds (offset {offset}, len {len}, backend {backend_len})")]
    OutOfBounds {
        offset: u64,
        len: usize,
        backend_len: u64,
    },
    #[error("offset overflow")]
    OffsetOverflow,
    #[error("not supported: {0}")]
    NotSupported(&'static str),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}
