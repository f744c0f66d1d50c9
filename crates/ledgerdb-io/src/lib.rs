#![forbid(unsafe_code)]
//! The narrow file-I/O seam the commit log and object store are built
//! on. Kept as a trait (rather than calling `std::fs::File` directly)
//! so tests can substitute an in-memory backend without touching the
//! commit-log format code.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::Arc;

use parking_lot::Mutex;

/// A positional file handle: every call is independent of any other
/// call's cursor position, matching how the commit log and object
/// store interleave reads and appends.
pub trait FileIo: Send + Sync {
    /// Reads `buf.len()` bytes starting at `offset`.
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> std::io::Result<()>;
    /// Writes `buf` at `offset`, extending the file if necessary.
    fn write_at(&self, offset: u64, buf: &[u8]) -> std::io::Result<()>;
    /// Returns the current file length.
    fn len(&self) -> std::io::Result<u64>;
    /// True when the file is empty.
    fn is_empty(&self) -> std::io::Result<bool> {
        Ok(self.len()? == 0)
    }
    /// Truncates (or extends with zeros) the file to exactly `len` bytes.
    fn truncate(&self, len: u64) -> std::io::Result<()>;
    /// Flushes buffered writes and fsyncs the underlying file.
    fn sync_all(&self) -> std::io::Result<()>;
}

/// A `FileIo` backed by a real `std::fs::File`, serialized behind a
/// mutex so `read_at`/`write_at` can be called from any thread without
/// each caller tracking a cursor.
#[derive(Clone)]
pub struct StdFileIo {
    inner: Arc<Mutex<File>>,
}

impl StdFileIo {
    /// Opens (creating if absent) the file at `path` for read/write.
    pub fn open(path: impl AsRef<Path>) -> std::io::Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(path)?;
        Ok(Self {
            inner: Arc::new(Mutex::new(file)),
        })
    }
}

impl FileIo for StdFileIo {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> std::io::Result<()> {
        let mut file = self.inner.lock();
        file.seek(SeekFrom::Start(offset))?;
        file.read_exact(buf)
    }

    fn write_at(&self, offset: u64, buf: &[u8]) -> std::io::Result<()> {
        let mut file = self.inner.lock();
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(buf)
    }

    fn len(&self) -> std::io::Result<u64> {
        let file = self.inner.lock();
        file.metadata().map(|m| m.len())
    }

    fn truncate(&self, len: u64) -> std::io::Result<()> {
        let file = self.inner.lock();
        file.set_len(len)
    }

    fn sync_all(&self) -> std::io::Result<()> {
        let file = self.inner.lock();
        file.sync_all()
    }
}

/// An in-memory `FileIo` for unit tests that don't want to touch disk.
#[derive(Clone, Default)]
pub struct MemFileIo {
    inner: Arc<Mutex<Vec<u8>>>,
}

impl MemFileIo {
    /// Creates an empty in-memory file.
    pub fn new() -> Self {
        Self::default()
    }
}

impl FileIo for MemFileIo {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> std::io::Result<()> {
        let data = self.inner.lock();
        let offset = offset as usize;
        if offset + buf.len() > data.len() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "read past end of in-memory file",
            ));
        }
        buf.copy_from_slice(&data[offset..offset + buf.len()]);
        Ok(())
    }

    fn write_at(&self, offset: u64, buf: &[u8]) -> std::io::Result<()> {
        let mut data = self.inner.lock();
        let offset = offset as usize;
        if data.len() < offset + buf.len() {
            data.resize(offset + buf.len(), 0);
        }
        data[offset..offset + buf.len()].copy_from_slice(buf);
        Ok(())
    }

    fn len(&self) -> std::io::Result<u64> {
        Ok(self.inner.lock().len() as u64)
    }

    fn truncate(&self, len: u64) -> std::io::Result<()> {
        let mut data = self.inner.lock();
        data.resize(len as usize, 0);
        Ok(())
    }

    fn sync_all(&self) -> std::io::Result<()> {
        Ok(())
    }
}
