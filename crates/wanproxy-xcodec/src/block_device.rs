//! Block I/O beneath the disk cache.
//!
//! Provides a trait-based abstraction ([`BlockDevice`]) over fixed-size block
//! reads and writes, with a file-backed implementation for production and an
//! in-memory one for tests.

use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use crate::layout::BLOCK_SIZE;

/// Fixed-size block storage. Each call either fully succeeds or fails.
pub trait BlockDevice: Send {
    /// Number of addressable blocks
    fn block_count(&self) -> u64;

    /// Read block `index` into `buf` (exactly [`BLOCK_SIZE`] bytes).
    fn read_block(&self, index: u64, buf: &mut [u8]) -> io::Result<()>;

    /// Write `buf` (exactly [`BLOCK_SIZE`] bytes) to block `index`.
    fn write_block(&self, index: u64, buf: &[u8]) -> io::Result<()>;

    /// Flush written blocks to stable storage.
    fn sync(&self) -> io::Result<()> {
        Ok(())
    }
}

fn check_request(index: u64, len: usize, block_count: u64) -> io::Result<()> {
    if len != BLOCK_SIZE {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("buffer of {} bytes is not one block", len),
        ));
    }
    if index >= block_count {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("block {} beyond device end {}", index, block_count),
        ));
    }
    Ok(())
}

/// Block device over a regular file using positioned reads and writes.
#[derive(Debug)]
pub struct FileBlockDevice {
    file: File,
    path: PathBuf,
    block_count: u64,
}

impl FileBlockDevice {
    /// Open or create `path`, growing it to at least `min_blocks` blocks.
    ///
    /// An existing larger file keeps its size.
    pub fn open(path: &Path, min_blocks: u64) -> io::Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        let wanted = min_blocks * BLOCK_SIZE as u64;
        let len = file.metadata()?.len();
        if len < wanted {
            file.set_len(wanted)?;
            debug!(path = %path.display(), from = len, to = wanted, "extended cache file");
        }
        let block_count = len.max(wanted) / BLOCK_SIZE as u64;
        Ok(Self {
            file,
            path: path.to_path_buf(),
            block_count,
        })
    }

    /// Path of the backing file
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl BlockDevice for FileBlockDevice {
    fn block_count(&self) -> u64 {
        self.block_count
    }

    fn read_block(&self, index: u64, buf: &mut [u8]) -> io::Result<()> {
        check_request(index, buf.len(), self.block_count)?;
        self.file.read_exact_at(buf, index * BLOCK_SIZE as u64)
    }

    fn write_block(&self, index: u64, buf: &[u8]) -> io::Result<()> {
        check_request(index, buf.len(), self.block_count)?;
        self.file.write_all_at(buf, index * BLOCK_SIZE as u64)
    }

    fn sync(&self) -> io::Result<()> {
        self.file.sync_data()
    }
}

/// In-memory block device for testing.
///
/// Clones share the same blocks, so a test can keep a handle while a store
/// owns another. [`MemoryBlockDevice::snapshot`] copies the current contents,
/// which is what a fresh open after a crash would see.
#[derive(Debug, Clone)]
pub struct MemoryBlockDevice {
    blocks: Arc<Mutex<Vec<u8>>>,
    block_count: u64,
    fail_io: Arc<AtomicBool>,
}

impl MemoryBlockDevice {
    /// Create a zero-filled device of `block_count` blocks.
    pub fn new(block_count: u64) -> Self {
        Self {
            blocks: Arc::new(Mutex::new(vec![0u8; block_count as usize * BLOCK_SIZE])),
            block_count,
            fail_io: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Independent copy of the current contents.
    pub fn snapshot(&self) -> Self {
        Self {
            blocks: Arc::new(Mutex::new(self.blocks.lock().clone())),
            block_count: self.block_count,
            fail_io: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Make every subsequent read and write fail (or succeed again).
    pub fn set_failing(&self, failing: bool) {
        self.fail_io.store(failing, Ordering::SeqCst);
    }

    /// Overwrite raw bytes of block `index` starting at `offset`.
    pub fn corrupt(&self, index: u64, offset: usize, bytes: &[u8]) {
        let start = index as usize * BLOCK_SIZE + offset;
        self.blocks.lock()[start..start + bytes.len()].copy_from_slice(bytes);
    }

    fn check_failing(&self) -> io::Result<()> {
        if self.fail_io.load(Ordering::SeqCst) {
            return Err(io::Error::other("injected block I/O failure"));
        }
        Ok(())
    }
}

impl BlockDevice for MemoryBlockDevice {
    fn block_count(&self) -> u64 {
        self.block_count
    }

    fn read_block(&self, index: u64, buf: &mut [u8]) -> io::Result<()> {
        self.check_failing()?;
        check_request(index, buf.len(), self.block_count)?;
        let start = index as usize * BLOCK_SIZE;
        buf.copy_from_slice(&self.blocks.lock()[start..start + BLOCK_SIZE]);
        Ok(())
    }

    fn write_block(&self, index: u64, buf: &[u8]) -> io::Result<()> {
        self.check_failing()?;
        check_request(index, buf.len(), self.block_count)?;
        let start = index as usize * BLOCK_SIZE;
        self.blocks.lock()[start..start + BLOCK_SIZE].copy_from_slice(buf);
        Ok(())
    }
}
