//! Byte-addressed backing stores.
//!
//! The engine's clones ultimately land on one of these. [`MemBackend`] is
//! the test workhorse; [`FileBackend`] backs a virtual device with a file or
//! raw device node opened by path.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

use crate::{Result, VbdError};

pub trait StorageBackend: Send {
    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<()>;
    fn write_at(&mut self, offset: u64, data: &[u8]) -> Result<()>;
    fn len(&mut self) -> Result<u64>;
    fn is_empty(&mut self) -> Result<bool> {
        Ok(self.len()? == 0)
    }
    fn set_len(&mut self, len: u64) -> Result<()>;
    fn flush(&mut self) -> Result<()>;
}

fn end_of(offset: u64, len: usize) -> Result<u64> {
    offset
        .checked_add(len as u64)
        .ok_or(VbdError::OffsetOverflow)
}

/// Growable in-memory image. Reads past the end are out of bounds; writes
/// past the end extend the image, zero-filling any gap.
#[derive(Default)]
pub struct MemBackend {
    data: Vec<u8>,
}

impl MemBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_len(len: u64) -> Self {
        Self {
            data: vec![0; len as usize],
        }
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }
}

impl StorageBackend for MemBackend {
    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let end = end_of(offset, buf.len())?;
        if end > self.data.len() as u64 {
            return Err(VbdError::OutOfBounds {
                offset,
                len: buf.len(),
                backend_len: self.data.len() as u64,
            });
        }
        buf.copy_from_slice(&self.data[offset as usize..end as usize]);
        Ok(())
    }

    fn write_at(&mut self, offset: u64, data: &[u8]) -> Result<()> {
        let end = end_of(offset, data.len())?;
        if end > self.data.len() as u64 {
            self.data.resize(end as usize, 0);
        }
        self.data[offset as usize..end as usize].copy_from_slice(data);
        Ok(())
    }

    fn len(&mut self) -> Result<u64> {
        Ok(self.data.len() as u64)
    }

    fn set_len(&mut self, len: u64) -> Result<()> {
        self.data.resize(len as usize, 0);
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        Ok(())
    }
}

/// File-backed store. Writing past the end grows the file (the OS zero-fills
/// the gap); reading past the end is out of bounds.
pub struct FileBackend {
    file: File,
    read_only: bool,
}

impl FileBackend {
    pub fn create(path: &Path, len: u64) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        file.set_len(len)?;
        Ok(Self {
            file,
            read_only: false,
        })
    }

    pub fn open_rw(path: &Path) -> Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        Ok(Self {
            file,
            read_only: false,
        })
    }

    pub fn open_read_only(path: &Path) -> Result<Self> {
        let file = OpenOptions::new().read(true).open(path)?;
        Ok(Self {
            file,
            read_only: true,
        })
    }
}

impl StorageBackend for FileBackend {
    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let end = end_of(offset, buf.len())?;
        let file_len = self.file.metadata()?.len();
        if end > file_len {
            return Err(VbdError::OutOfBounds {
                offset,
                len: buf.len(),
                backend_len: file_len,
            });
        }
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.read_exact(buf)?;
        Ok(())
    }

    fn write_at(&mut self, offset: u64, data: &[u8]) -> Result<()> {
        if self.read_only {
            return Err(VbdError::NotSupported("read-only backend"));
        }
        end_of(offset, data.len())?;
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.write_all(data)?;
        Ok(())
    }

    fn len(&mut self) -> Result<u64> {
        Ok(self.file.metadata()?.len())
    }

    fn set_len(&mut self, len: u64) -> Result<()> {
        if self.read_only {
            return Err(VbdError::NotSupported("read-only backend"));
        }
        self.file.set_len(len)?;
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        if !self.read_only {
            self.file.sync_all()?;
        }
        Ok(())
    }
}
