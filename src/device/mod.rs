//! Block Devices
//!
//! The cache talks to storage through [`BlockDevice`]: synchronous,
//! whole-block reads and writes addressed by (device, block number).
//! The driver owns retries and partial-failure handling; any error it
//! returns is fatal to the cache operation that issued the I/O.
//!
//! # Backends
//!
//! - [`MemDisk`] - in-memory blocks, call counting and fault injection for tests
//! - [`FileDisk`] - one device backed by an image file

mod file;
mod memory;

pub use file::FileDisk;
pub use memory::MemDisk;

use serde::Serialize;

use crate::error::Result;

/// Synchronous block device driver
pub trait BlockDevice: Send + Sync {
    /// Size of one block in bytes
    fn block_size(&self) -> usize;

    /// Read one block into `buf` (exactly `block_size` bytes)
    fn read_block(&self, dev: u32, blockno: u32, buf: &mut [u8]) -> Result<()>;

    /// Write one block from `buf` (exactly `block_size` bytes)
    fn write_block(&self, dev: u32, blockno: u32, buf: &[u8]) -> Result<()>;

    /// I/O counters
    fn stats(&self) -> DeviceStats;
}

/// Device I/O statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DeviceStats {
    /// Blocks read
    pub reads: u64,
    /// Blocks written
    pub writes: u64,
}

/// Check that a caller-supplied buffer is exactly one block
pub(crate) fn check_len(dev: u32, blockno: u32, len: usize, block_size: usize) -> Result<()> {
    if len != block_size {
        return Err(crate::error::Error::Device {
            dev,
            blockno,
            reason: format!("buffer is {} bytes, block size is {}", len, block_size),
        });
    }
    Ok(())
}
