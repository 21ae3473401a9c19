//! File-backed block device
//!
//! Serves a single device id from an image file. Block `n` lives at byte
//! offset `n * block_size`; reads past the end of the file return zeros, so a
//! fresh image behaves like a zeroed disk.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use tracing::debug;

use super::{check_len, BlockDevice, DeviceStats};
use crate::error::{Error, Result};

/// Block device backed by an image file
pub struct FileDisk {
    dev: u32,
    block_size: usize,
    path: PathBuf,
    file: Mutex<File>,
    reads: AtomicU64,
    writes: AtomicU64,
}

impl FileDisk {
    /// Open (or create) an image file serving device `dev`
    pub fn open(path: impl AsRef<Path>, dev: u32, block_size: usize) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;

        debug!(path = %path.display(), dev, block_size, "Opened disk image");

        Ok(Self {
            dev,
            block_size,
            path,
            file: Mutex::new(file),
            reads: AtomicU64::new(0),
            writes: AtomicU64::new(0),
        })
    }

    /// Image file path
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Device id served by this image
    pub fn dev(&self) -> u32 {
        self.dev
    }

    /// Flush written blocks to stable storage
    pub fn sync(&self) -> Result<()> {
        self.file.lock().sync_all()?;
        Ok(())
    }

    fn check_dev(&self, dev: u32, blockno: u32) -> Result<()> {
        if dev != self.dev {
            return Err(Error::Device {
                dev,
                blockno,
                reason: format!("image {} serves device {}", self.path.display(), self.dev),
            });
        }
        Ok(())
    }

    fn offset(&self, blockno: u32) -> u64 {
        blockno as u64 * self.block_size as u64
    }

    fn device_error(dev: u32, blockno: u32, e: std::io::Error) -> Error {
        Error::Device {
            dev,
            blockno,
            reason: e.to_string(),
        }
    }
}

impl BlockDevice for FileDisk {
    fn block_size(&self) -> usize {
        self.block_size
    }

    fn read_block(&self, dev: u32, blockno: u32, buf: &mut [u8]) -> Result<()> {
        self.check_dev(dev, blockno)?;
        check_len(dev, blockno, buf.len(), self.block_size)?;

        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(self.offset(blockno)))
            .map_err(|e| Self::device_error(dev, blockno, e))?;

        let mut filled = 0;
        while filled < buf.len() {
            let n = file
                .read(&mut buf[filled..])
                .map_err(|e| Self::device_error(dev, blockno, e))?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        buf[filled..].fill(0);

        self.reads.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn write_block(&self, dev: u32, blockno: u32, buf: &[u8]) -> Result<()> {
        self.check_dev(dev, blockno)?;
        check_len(dev, blockno, buf.len(), self.block_size)?;

        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(self.offset(blockno)))
            .map_err(|e| Self::device_error(dev, blockno, e))?;
        file.write_all(buf)
            .map_err(|e| Self::device_error(dev, blockno, e))?;

        self.writes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn stats(&self) -> DeviceStats {
        DeviceStats {
            reads: self.reads.load(Ordering::Relaxed),
            writes: self.writes.load(Ordering::Relaxed),
        }
    }
}

impl std::fmt::Debug for FileDisk {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileDisk")
            .field("dev", &self.dev)
            .field("block_size", &self.block_size)
            .field("path", &self.path)
            .finish()
    }
}
