//! The byte device: positioned I/O, resize, length, and durability barrier.
//!
//! The engine and allocator never touch `std::fs::File` directly; they go
//! through this trait so that any file-like backend honouring the contract
//! (positioned read, positioned write, truncate/resize, length, flush) can
//! stand in for the default OS file backend below.

use std::fs::{File, OpenOptions};
use std::path::Path;

#[cfg(unix)]
use std::os::unix::fs::FileExt;

use crate::error::Result;

/// A positioned, resizable, flushable byte store.
pub trait ByteDevice {
    /// Read exactly `buf.len()` bytes starting at `offset`.
    fn pread(&self, buf: &mut [u8], offset: u64) -> Result<()>;

    /// Write all of `buf` starting at `offset`.
    fn pwrite(&self, buf: &[u8], offset: u64) -> Result<()>;

    /// Grow or shrink the device to exactly `new_len` bytes.
    fn resize(&self, new_len: u64) -> Result<()>;

    /// Current length of the device in bytes.
    fn len(&self) -> Result<u64>;

    /// Durability barrier: block until prior writes are durable.
    fn sync(&self) -> Result<()>;
}

/// The default backend: a plain OS file, opened once and kept for the
/// lifetime of the tree handle.
pub struct OsFileDevice {
    file: File,
}

impl OsFileDevice {
    pub fn create_or_open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)?;
        Ok(OsFileDevice { file })
    }

    pub fn open_existing<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        Ok(OsFileDevice { file })
    }
}

#[cfg(unix)]
impl ByteDevice for OsFileDevice {
    fn pread(&self, buf: &mut [u8], offset: u64) -> Result<()> {
        self.file.read_exact_at(buf, offset)?;
        Ok(())
    }

    fn pwrite(&self, buf: &[u8], offset: u64) -> Result<()> {
        self.file.write_all_at(buf, offset)?;
        Ok(())
    }

    fn resize(&self, new_len: u64) -> Result<()> {
        self.file.set_len(new_len)?;
        Ok(())
    }

    fn len(&self) -> Result<u64> {
        Ok(self.file.metadata()?.len())
    }

    fn sync(&self) -> Result<()> {
        self.file.sync_data()?;
        Ok(())
    }
}

#[cfg(not(unix))]
impl ByteDevice for OsFileDevice {
    fn pread(&self, buf: &mut [u8], offset: u64) -> Result<()> {
        use std::io::{Read, Seek, SeekFrom};
        let mut file = self.file.try_clone()?;
        file.seek(SeekFrom::Start(offset))?;
        file.read_exact(buf)?;
        Ok(())
    }

    fn pwrite(&self, buf: &[u8], offset: u64) -> Result<()> {
        use std::io::{Seek, SeekFrom, Write};
        let mut file = self.file.try_clone()?;
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(buf)?;
        Ok(())
    }

    fn resize(&self, new_len: u64) -> Result<()> {
        self.file.set_len(new_len)?;
        Ok(())
    }

    fn len(&self) -> Result<u64> {
        Ok(self.file.metadata()?.len())
    }

    fn sync(&self) -> Result<()> {
        self.file.sync_data()?;
        Ok(())
    }
}
