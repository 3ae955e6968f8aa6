#![forbid(unsafe_code)]
//! Byte-addressed files backing the command log.

use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::{self, ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::types::{Result, SombraError};

/// Positioned reads and writes over a single log file.
pub trait FileIo: Send + Sync + 'static {
    /// Fills `dst` from `off`; fails with `UnexpectedEof` past the end.
    fn read_at(&self, off: u64, dst: &mut [u8]) -> Result<()>;
    /// Writes all of `src` at `off`, growing the file as needed.
    fn write_at(&self, off: u64, src: &[u8]) -> Result<()>;
    /// Flushes written data to durable storage.
    fn sync_all(&self) -> Result<()>;
    /// Current length in bytes.
    fn len(&self) -> Result<u64>;
    /// True when the file holds no bytes.
    fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }
    /// Cuts or zero-extends the file to `len` bytes.
    fn truncate(&self, len: u64) -> Result<()>;
}

/// Log file on disk. Every access seeks under one lock, so clones of the
/// same handle never interleave a seek with another clone's read.
#[derive(Clone)]
pub struct StdFileIo {
    path: Arc<PathBuf>,
    file: Arc<Mutex<File>>,
}

impl StdFileIo {
    /// Opens `path` for reading and writing, creating it empty if missing.
    /// Existing contents are kept.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        Ok(Self {
            path: Arc::new(path.to_path_buf()),
            file: Arc::new(Mutex::new(file)),
        })
    }

    /// Path the file was opened at.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl fmt::Debug for StdFileIo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StdFileIo").field("path", &self.path).finish()
    }
}

impl FileIo for StdFileIo {
    fn read_at(&self, off: u64, dst: &mut [u8]) -> Result<()> {
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(off))?;
        file.read_exact(dst)?;
        Ok(())
    }

    fn write_at(&self, off: u64, src: &[u8]) -> Result<()> {
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(off))?;
        file.write_all(src)?;
        Ok(())
    }

    fn sync_all(&self) -> Result<()> {
        Ok(self.file.lock().sync_all()?)
    }

    fn len(&self) -> Result<u64> {
        Ok(self.file.lock().metadata()?.len())
    }

    fn truncate(&self, len: u64) -> Result<()> {
        Ok(self.file.lock().set_len(len)?)
    }
}

/// Log file held in memory; clones share the same bytes.
#[derive(Clone, Default)]
pub struct MemFileIo {
    bytes: Arc<Mutex<Vec<u8>>>,
}

impl MemFileIo {
    /// Creates an empty in-memory file.
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of the current contents.
    pub fn snapshot(&self) -> Vec<u8> {
        self.bytes.lock().clone()
    }
}

impl FileIo for MemFileIo {
    fn read_at(&self, off: u64, dst: &mut [u8]) -> Result<()> {
        let bytes = self.bytes.lock();
        let src = usize::try_from(off)
            .ok()
            .and_then(|start| bytes.get(start..start.checked_add(dst.len())?))
            .ok_or_else(|| {
                SombraError::Io(io::Error::new(
                    ErrorKind::UnexpectedEof,
                    format!("read of {} bytes at {off} past end of log", dst.len()),
                ))
            })?;
        dst.copy_from_slice(src);
        Ok(())
    }

    fn write_at(&self, off: u64, src: &[u8]) -> Result<()> {
        let start = usize::try_from(off)
            .map_err(|_| SombraError::Invalid("log offset exceeds addressable memory"))?;
        let end = start + src.len();
        let mut bytes = self.bytes.lock();
        if bytes.len() < end {
            bytes.resize(end, 0);
        }
        bytes[start..end].copy_from_slice(src);
        Ok(())
    }

    fn sync_all(&self) -> Result<()> {
        Ok(())
    }

    fn len(&self) -> Result<u64> {
        Ok(self.bytes.lock().len() as u64)
    }

    fn truncate(&self, len: u64) -> Result<()> {
        let len = usize::try_from(len)
            .map_err(|_| SombraError::Invalid("log length exceeds addressable memory"))?;
        self.bytes.lock().resize(len, 0);
        Ok(())
    }
}
