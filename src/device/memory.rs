//! In-memory block device
//!
//! Blocks live in a DashMap keyed by (device, block number). Blocks that were
//! never written read back as zeros. Every read and write is counted, which is
//! how tests observe whether the cache touched the device at all.

use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::{DashMap, DashSet};

use super::{check_len, BlockDevice, DeviceStats};
use crate::error::{Error, Result};

/// In-memory block device for testing and simulation
pub struct MemDisk {
    block_size: usize,
    /// Block contents - sharded for concurrent workers
    blocks: DashMap<(u32, u32), Box<[u8]>>,
    /// Blocks whose reads fail
    read_faults: DashSet<(u32, u32)>,
    /// Blocks whose writes fail
    write_faults: DashSet<(u32, u32)>,
    reads: AtomicU64,
    writes: AtomicU64,
}

impl MemDisk {
    /// Create an empty disk with the given block size
    pub fn new(block_size: usize) -> Self {
        Self {
            block_size,
            blocks: DashMap::new(),
            read_faults: DashSet::new(),
            write_faults: DashSet::new(),
            reads: AtomicU64::new(0),
            writes: AtomicU64::new(0),
        }
    }

    /// Store block contents directly, bypassing the I/O counters
    pub fn load(&self, dev: u32, blockno: u32, data: &[u8]) {
        let mut block = vec![0u8; self.block_size].into_boxed_slice();
        let n = data.len().min(self.block_size);
        block[..n].copy_from_slice(&data[..n]);
        self.blocks.insert((dev, blockno), block);
    }

    /// Current contents of a block, if it was ever written
    pub fn block(&self, dev: u32, blockno: u32) -> Option<Vec<u8>> {
        self.blocks.get(&(dev, blockno)).map(|b| b.to_vec())
    }

    /// Number of distinct blocks stored
    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    /// True if nothing was ever written
    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    /// Make reads of a block fail
    pub fn fail_reads(&self, dev: u32, blockno: u32) {
        self.read_faults.insert((dev, blockno));
    }

    /// Make writes of a block fail
    pub fn fail_writes(&self, dev: u32, blockno: u32) {
        self.write_faults.insert((dev, blockno));
    }

    /// Remove all injected faults
    pub fn clear_faults(&self) {
        self.read_faults.clear();
        self.write_faults.clear();
    }

    /// Reset I/O counters
    pub fn reset_stats(&self) {
        self.reads.store(0, Ordering::Relaxed);
        self.writes.store(0, Ordering::Relaxed);
    }
}

impl BlockDevice for MemDisk {
    fn block_size(&self) -> usize {
        self.block_size
    }

    fn read_block(&self, dev: u32, blockno: u32, buf: &mut [u8]) -> Result<()> {
        check_len(dev, blockno, buf.len(), self.block_size)?;
        if self.read_faults.contains(&(dev, blockno)) {
            return Err(Error::Device {
                dev,
                blockno,
                reason: "injected read fault".into(),
            });
        }

        self.reads.fetch_add(1, Ordering::Relaxed);
        match self.blocks.get(&(dev, blockno)) {
            Some(block) => buf.copy_from_slice(&block),
            None => buf.fill(0),
        }
        Ok(())
    }

    fn write_block(&self, dev: u32, blockno: u32, buf: &[u8]) -> Result<()> {
        check_len(dev, blockno, buf.len(), self.block_size)?;
        if self.write_faults.contains(&(dev, blockno)) {
            return Err(Error::Device {
                dev,
                blockno,
                reason: "injected write fault".into(),
            });
        }

        self.writes.fetch_add(1, Ordering::Relaxed);
        self.blocks.insert((dev, blockno), buf.into());
        Ok(())
    }

    fn stats(&self) -> DeviceStats {
        DeviceStats {
            reads: self.reads.load(Ordering::Relaxed),
            writes: self.writes.load(Ordering::Relaxed),
        }
    }
}

impl std::fmt::Debug for MemDisk {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemDisk")
            .field("block_size", &self.block_size)
            .field("blocks", &self.blocks.len())
            .field("stats", &self.stats())
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
