//! Byte-addressed devices the log lives on.
//!
//! The store never touches a file directly. It reads and writes through a
//! [`BlockDevice`], so the same engine runs over a memory-mapped disk image
//! or a plain buffer in tests.

use std::fs::{File, OpenOptions};
use std::io;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};

use log::debug;
use memmap2::{MmapMut, MmapOptions};
use spin::Mutex;

use crate::error::{LfsError, LfsResult};

pub trait BlockDevice: Send + Sync {
    /// Copy bytes starting at `pos` into `buf`. Returns how many bytes were
    /// available, which is short only at the end of the device.
    fn read_at(&self, pos: u64, buf: &mut [u8]) -> LfsResult<usize>;
    /// Store `buf` at `pos`. Returns how many bytes fit before the end of
    /// the device.
    fn write_at(&self, pos: u64, buf: &[u8]) -> LfsResult<usize>;
    /// Fixed capacity in bytes.
    fn size(&self) -> u64;
    /// Make every completed write durable.
    fn flush(&self) -> LfsResult<()>;
}

fn copy_out(src: &[u8], pos: u64, buf: &mut [u8]) -> usize {
    let len = src.len() as u64;
    if pos >= len {
        return 0;
    }
    let end = core::cmp::min(pos + buf.len() as u64, len) as usize;
    let n = end - pos as usize;
    buf[..n].copy_from_slice(&src[pos as usize..end]);
    n
}

fn copy_in(dst: &mut [u8], pos: u64, buf: &[u8]) -> usize {
    let len = dst.len() as u64;
    if pos >= len {
        return 0;
    }
    let end = core::cmp::min(pos + buf.len() as u64, len) as usize;
    let n = end - pos as usize;
    dst[pos as usize..end].copy_from_slice(&buf[..n]);
    n
}

/// Disk image file mapped into memory.
pub struct MmapDevice {
    map: Mutex<MmapMut>,
    len: u64,
    // Keeps the descriptor open for as long as the mapping is used.
    _file: File,
}

impl MmapDevice {
    /// Map an existing disk image.
    pub fn open(path: impl AsRef<Path>) -> LfsResult<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path.as_ref())?;
        Self::map(file)
    }

    /// Create (or truncate) a disk image of `capacity` bytes and map it.
    pub fn create(path: impl AsRef<Path>, capacity: u64) -> LfsResult<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path.as_ref())?;
        file.set_len(capacity)?;
        Self::map(file)
    }

    fn map(file: File) -> LfsResult<Self> {
        let len = file.metadata()?.len();
        if len == 0 {
            return Err(LfsError::Io(io::Error::new(
                io::ErrorKind::InvalidInput,
                "disk image is empty",
            )));
        }
        // SAFETY: the volume assumes it is the only user of the image file
        // while mounted; nobody else truncates or rewrites it underneath us.
        let map = unsafe { MmapOptions::new().map_mut(&file)? };
        debug!("mapped disk image, {} bytes", len);
        Ok(Self {
            map: Mutex::new(map),
            len,
            _file: file,
        })
    }
}

impl BlockDevice for MmapDevice {
    fn read_at(&self, pos: u64, buf: &mut [u8]) -> LfsResult<usize> {
        let map = self.map.lock();
        Ok(copy_out(&map[..], pos, buf))
    }

    fn write_at(&self, pos: u64, buf: &[u8]) -> LfsResult<usize> {
        let mut map = self.map.lock();
        Ok(copy_in(&mut map[..], pos, buf))
    }

    fn size(&self) -> u64 {
        self.len
    }

    fn flush(&self) -> LfsResult<()> {
        self.map.lock().flush()?;
        Ok(())
    }
}

/// Fixed-size buffer standing in for a disk image.
pub struct MemDevice {
    data: Mutex<Vec<u8>>,
    fail_flush: AtomicBool,
}

impl MemDevice {
    pub fn new(size: usize) -> Self {
        Self {
            data: Mutex::new(vec![0u8; size]),
            fail_flush: AtomicBool::new(false),
        }
    }

    /// Make every following [`BlockDevice::flush`] fail, to exercise the
    /// sync error path.
    pub fn set_fail_flush(&self, fail: bool) {
        self.fail_flush.store(fail, Ordering::SeqCst);
    }

    /// Copy of the whole device contents.
    pub fn snapshot(&self) -> Vec<u8> {
        self.data.lock().clone()
    }
}

impl BlockDevice for MemDevice {
    fn read_at(&self, pos: u64, buf: &mut [u8]) -> LfsResult<usize> {
        let data = self.data.lock();
        Ok(copy_out(&data, pos, buf))
    }

    fn write_at(&self, pos: u64, buf: &[u8]) -> LfsResult<usize> {
        let mut data = self.data.lock();
        Ok(copy_in(&mut data, pos, buf))
    }

    fn size(&self) -> u64 {
        self.data.lock().len() as u64
    }

    fn flush(&self) -> LfsResult<()> {
        if self.fail_flush.load(Ordering::SeqCst) {
            return Err(LfsError::Io(io::Error::new(
                io::ErrorKind::Other,
                "injected flush failure",
            )));
        }
        Ok(())
    }
}

impl<D: BlockDevice + ?Sized> BlockDevice for std::sync::Arc<D> {
    fn read_at(&self, pos: u64, buf: &mut [u8]) -> LfsResult<usize> {
        (**self).read_at(pos, buf)
    }

    fn write_at(&self, pos: u64, buf: &[u8]) -> LfsResult<usize> {
        (**self).write_at(pos, buf)
    }

    fn size(&self) -> u64 {
        (**self).size()
    }

    fn flush(&self) -> LfsResult<()> {
        (**self).flush()
    }
}
