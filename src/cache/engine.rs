//! Block Cache Engine
//!
//! Lookup, allocation, eviction, release and pinning over the bucket table
//! and the buffer pool.
//!
//! # Lock Tiers
//!
//! 1. Shard mutex - short hold, guards identity, reference count and
//!    timestamp of the descriptors linked into the shard
//! 2. Buffer sleep lock - guards the payload, may be held across device I/O
//!
//! No shard mutex is held while waiting for a sleep lock or doing I/O.
//!
//! # Eviction
//!
//! A miss sweeps the shards circularly from the home shard, visiting each
//! once. The home shard stays locked for the whole call; every other shard is
//! only ever *try*-locked and skipped when busy, so two threads evicting from
//! each other's home shards cannot deadlock. The first shard holding an
//! unreferenced descriptor supplies the victim: its oldest one by timestamp.
//! The sweep does not look further for a globally older buffer, and a shard
//! skipped as busy may hide the only free buffer, in which case the call
//! reports exhaustion.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, trace};

use super::buffer::{Buf, BufId, BufSlot};
use super::clock::{Clock, LogicalClock};
use super::metrics::{CacheMetrics, MetricsSnapshot};
use super::shard::{BlockKey, BufMeta, Shard};
use super::{DEFAULT_BLOCK_SIZE, DEFAULT_BUFFER_COUNT, DEFAULT_SHARD_COUNT, INITIAL_SHARD};
use crate::device::BlockDevice;
use crate::error::{Error, Result};

/// Cache configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Number of bucket shards
    pub shard_count: usize,
    /// Number of buffers in the pool
    pub buffer_count: usize,
    /// Bytes per block; must match the device
    pub block_size: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            shard_count: DEFAULT_SHARD_COUNT,
            buffer_count: DEFAULT_BUFFER_COUNT,
            block_size: DEFAULT_BLOCK_SIZE,
        }
    }
}

impl CacheConfig {
    /// Check that every size is positive
    pub fn validate(&self) -> Result<()> {
        if self.shard_count == 0 {
            return Err(Error::Config("shard_count must be positive".into()));
        }
        if self.buffer_count == 0 {
            return Err(Error::Config("buffer_count must be positive".into()));
        }
        if self.block_size == 0 {
            return Err(Error::Config("block_size must be positive".into()));
        }
        Ok(())
    }

    /// Parse a YAML document; missing fields take their defaults
    pub fn from_yaml(text: &str) -> Result<Self> {
        let config: CacheConfig = serde_yaml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }
}

/// Sharded block buffer cache
///
/// Constructed once by the storage layer and shared by reference. All
/// operations may be called from any thread.
///
/// A thread must not `get`/`fetch` a block it already holds: the buffer lock
/// is not reentrant and the call waits forever.
pub struct BlockCache {
    config: CacheConfig,
    /// Bucket table
    shards: Box<[Shard]>,
    /// Buffer pool
    slots: Box<[BufSlot]>,
    device: Arc<dyn BlockDevice>,
    clock: Arc<dyn Clock>,
    metrics: CacheMetrics,
}

impl BlockCache {
    /// Build the bucket table and link every buffer into the initial shard
    pub fn new(
        config: CacheConfig,
        device: Arc<dyn BlockDevice>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        config.validate()?;
        if device.block_size() != config.block_size {
            return Err(Error::Config(format!(
                "device block size {} does not match cache block size {}",
                device.block_size(),
                config.block_size
            )));
        }

        let shards: Box<[Shard]> = (0..config.shard_count).map(Shard::new).collect();
        let slots: Box<[BufSlot]> = (0..config.buffer_count)
            .map(|_| BufSlot::new(config.block_size))
            .collect();

        {
            let mut initial = shards[INITIAL_SHARD].lock();
            for index in 0..config.buffer_count {
                initial.link(BufMeta::new(BufId::new(index)));
            }
        }

        info!(
            "Block cache initialized: {} buffers of {} bytes across {} shards",
            config.buffer_count, config.block_size, config.shard_count
        );

        Ok(Self {
            config,
            shards,
            slots,
            device,
            clock,
            metrics: CacheMetrics::new(),
        })
    }

    /// Create with a logical clock
    pub fn with_device(config: CacheConfig, device: Arc<dyn BlockDevice>) -> Result<Self> {
        Self::new(config, device, Arc::new(LogicalClock::new()))
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }

    pub fn buffer_count(&self) -> usize {
        self.slots.len()
    }

    pub fn block_size(&self) -> usize {
        self.config.block_size
    }

    pub fn device(&self) -> &Arc<dyn BlockDevice> {
        &self.device
    }

    pub fn metrics(&self) -> &CacheMetrics {
        &self.metrics
    }

    /// Snapshot of the cache counters
    pub fn stats(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Shard a block number hashes to
    #[inline]
    pub fn home_shard(&self, blockno: u32) -> usize {
        blockno as usize % self.shards.len()
    }

    pub(crate) fn slot(&self, id: BufId) -> &BufSlot {
        &self.slots[id.index()]
    }

    // =========================================================================
    // Lookup / Allocate
    // =========================================================================

    /// Return the buffer for a block, referenced and locked
    ///
    /// On a miss the returned buffer is recycled and not valid; use
    /// [`fetch`](Self::fetch) to have it filled from the device.
    pub fn get(&self, dev: u32, blockno: u32) -> Result<Buf<'_>> {
        let key = BlockKey::new(dev, blockno);
        let home = self.home_shard(blockno);
        let mut home_list = self.shards[home].lock_home();

        if let Some(meta) = home_list.find_key_mut(key) {
            meta.refcnt += 1;
            let id = meta.id;
            drop(home_list);

            self.metrics.record_hit();
            trace!("Hit {} for block {}", id, key);
            return Ok(self.lock_buf(id, key));
        }
        self.metrics.record_miss();

        let shard_count = self.shards.len();
        for step in 0..shard_count {
            let index = (home + step) % shard_count;

            let id = if index == home {
                let Some(meta) = home_list
                    .lru_victim()
                    .and_then(|pos| home_list.get_mut(pos))
                else {
                    continue;
                };
                self.rebind(meta, key)
            } else {
                let Some(mut other) = self.shards[index].try_lock() else {
                    self.metrics.record_skip();
                    trace!("Shard {} busy, skipped while evicting for {}", index, key);
                    continue;
                };
                let Some(victim) = other.lru_victim().and_then(|pos| other.unlink(pos)) else {
                    continue;
                };
                drop(other);

                self.metrics.record_relocation();
                debug!(
                    "Relocating {} from shard {} to shard {} for block {}",
                    victim.id, index, home, key
                );
                let meta = home_list.link(victim);
                self.rebind(meta, key)
            };
            drop(home_list);

            self.metrics.record_eviction();
            return Ok(self.lock_buf(id, key));
        }
        drop(home_list);

        self.metrics.record_exhaustion();
        error!("No evictable buffer for block {}: pool exhausted", key);
        Err(Error::PoolExhausted { dev, blockno })
    }

    /// Bind a victim to a new block; caller holds the shard the record is in
    fn rebind(&self, meta: &mut BufMeta, key: BlockKey) -> BufId {
        meta.key = Some(key);
        meta.refcnt = 1;
        meta.pins = 0;
        meta.timestamp = self.clock.now();
        self.slot(meta.id).set_valid(false);
        meta.id
    }

    fn lock_buf(&self, id: BufId, key: BlockKey) -> Buf<'_> {
        let guard = self.slot(id).lock();
        Buf {
            cache: self,
            id,
            key,
            guard: Some(guard),
        }
    }

    /// True if a descriptor is currently bound to the block
    pub fn contains(&self, dev: u32, blockno: u32) -> bool {
        let key = BlockKey::new(dev, blockno);
        self.shards[self.home_shard(blockno)]
            .lock()
            .find_key_mut(key)
            .is_some()
    }

    // =========================================================================
    // Read / Write
    // =========================================================================

    /// Return a locked buffer holding the on-disk contents of a block
    ///
    /// The device is read only when the buffer is not already valid.
    pub fn fetch(&self, dev: u32, blockno: u32) -> Result<Buf<'_>> {
        let mut buf = self.get(dev, blockno)?;
        if !buf.is_valid() {
            self.device
                .read_block(dev, blockno, buf.data_mut())
                .map_err(|e| {
                    error!("Read of block {} failed: {}", buf.key, e);
                    e
                })?;
            self.metrics.record_device_read();
            self.slot(buf.id).set_valid(true);
            trace!("Read block {} into {}", buf.key, buf.id);
        }
        Ok(buf)
    }

    /// Write a buffer's payload to the device
    ///
    /// The calling thread must hold the buffer.
    pub fn write_back(&self, buf: &Buf<'_>) -> Result<()> {
        if !buf.holding() {
            return Err(self.usage_violation("write_back", buf.key));
        }

        self.device
            .write_block(buf.dev(), buf.blockno(), buf.data())
            .map_err(|e| {
                error!("Write of block {} failed: {}", buf.key, e);
                e
            })?;
        self.metrics.record_device_write();
        trace!("Wrote block {} from {}", buf.key, buf.id);
        Ok(())
    }

    // =========================================================================
    // Release / Pin
    // =========================================================================

    /// Unlock a buffer and drop the caller's reference
    ///
    /// The calling thread must hold the buffer. If it does not, the buffer is
    /// left locked and referenced for good and `NotHeld` is returned.
    pub fn release(&self, mut buf: Buf<'_>) -> Result<()> {
        self.release_buf(&mut buf)
    }

    pub(crate) fn release_buf(&self, buf: &mut Buf<'_>) -> Result<()> {
        let Some(guard) = buf.guard.take() else {
            return Ok(());
        };
        if !guard.holding() {
            std::mem::forget(guard);
            return Err(self.usage_violation("release", buf.key));
        }
        drop(guard);

        self.with_meta(buf, |meta| {
            meta.refcnt = meta.refcnt.checked_sub(1).ok_or_else(|| {
                Error::Internal(format!("{} released with no references", meta.id))
            })?;
            meta.timestamp = self.clock.now();
            Ok(())
        })?;
        self.metrics.record_release();
        Ok(())
    }

    /// Take an extra reference that keeps the buffer resident after release
    pub fn pin(&self, buf: &Buf<'_>) -> Result<()> {
        self.with_meta(buf, |meta| {
            meta.refcnt += 1;
            meta.pins += 1;
            Ok(())
        })?;
        self.metrics.record_pin();
        Ok(())
    }

    /// Drop a reference taken by [`pin`](Self::pin)
    pub fn unpin(&self, buf: &Buf<'_>) -> Result<()> {
        self.with_meta(buf, |meta| {
            // Other holders' references are not ours to drop
            if meta.pins == 0 {
                return Err(Error::NotPinned {
                    dev: buf.dev(),
                    blockno: buf.blockno(),
                });
            }
            meta.pins -= 1;
            meta.refcnt -= 1;
            Ok(())
        })
        .map_err(|e| {
            if matches!(e, Error::NotPinned { .. }) {
                self.metrics.record_usage_violation();
                error!("Unpin of block {} which is not pinned", buf.key);
            }
            e
        })?;
        self.metrics.record_unpin();
        Ok(())
    }

    /// Run `f` on a held buffer's record under its home shard lock
    fn with_meta<R>(&self, buf: &Buf<'_>, f: impl FnOnce(&mut BufMeta) -> Result<R>) -> Result<R> {
        let home = self.home_shard(buf.blockno());
        let mut list = self.shards[home].lock();
        match list.find_id_mut(buf.id) {
            Some(meta) => f(meta),
            None => Err(Error::Internal(format!(
                "{} for block {} is missing from shard {}",
                buf.id, buf.key, home
            ))),
        }
    }

    fn usage_violation(&self, op: &'static str, key: BlockKey) -> Error {
        self.metrics.record_usage_violation();
        error!("{} of block {} by a thread not holding it", op, key);
        Error::NotHeld {
            op,
            dev: key.dev,
            blockno: key.blockno,
        }
    }

    // =========================================================================
    // Introspection
    // =========================================================================

    /// Per-shard listing of every descriptor
    ///
    /// Shards are locked one at a time, so the picture is only consistent
    /// when no other thread is using the cache.
    pub fn snapshot(&self) -> CacheSnapshot {
        let shards = self
            .shards
            .iter()
            .map(|shard| {
                let list = shard.lock();
                let mut buffers = Vec::with_capacity(list.len());
                buffers.extend(list.iter().map(|meta| {
                    let slot = self.slot(meta.id);
                    BufferInfo {
                        id: meta.id,
                        key: meta.key,
                        refcnt: meta.refcnt,
                        pins: meta.pins,
                        timestamp: meta.timestamp,
                        valid: slot.is_valid(),
                        locked: slot.is_locked(),
                    }
                }));
                ShardSnapshot {
                    index: shard.index(),
                    lookups: shard.lookup_count(),
                    skips: shard.skip_count(),
                    buffers,
                }
            })
            .collect();

        CacheSnapshot { shards }
    }
}

impl std::fmt::Debug for BlockCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockCache")
            .field("config", &self.config)
            .field("metrics", &self.metrics)
            .finish()
    }
}

/// State of one descriptor at snapshot time
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BufferInfo {
    pub id: BufId,
    /// Bound block, `None` if never allocated
    pub key: Option<BlockKey>,
    pub refcnt: u32,
    /// References held by pins rather than holders
    pub pins: u32,
    pub timestamp: u64,
    pub valid: bool,
    /// Some thread holds the payload lock
    pub locked: bool,
}

/// State of one shard at snapshot time
#[derive(Debug, Clone, Serialize)]
pub struct ShardSnapshot {
    pub index: usize,
    pub lookups: u64,
    pub skips: u64,
    /// Descriptors in scan order
    pub buffers: Vec<BufferInfo>,
}

/// State of the whole bucket table
#[derive(Debug, Clone, Serialize)]
pub struct CacheSnapshot {
    pub shards: Vec<ShardSnapshot>,
}

impl CacheSnapshot {
    /// Number of descriptors across all shards
    pub fn buffer_count(&self) -> usize {
        self.shards.iter().map(|s| s.buffers.len()).sum()
    }

    /// Descriptors per shard
    pub fn occupancy(&self) -> Vec<usize> {
        self.shards.iter().map(|s| s.buffers.len()).collect()
    }

    /// Shard index and state of the descriptor bound to a block
    pub fn find(&self, key: BlockKey) -> Option<(usize, &BufferInfo)> {
        self.shards.iter().find_map(|s| {
            s.buffers
                .iter()
                .find(|b| b.key == Some(key))
                .map(|b| (s.index, b))
        })
    }

    /// Shard a descriptor is linked into
    pub fn shard_of(&self, id: BufId) -> Option<usize> {
        self.shards
            .iter()
            .find(|s| s.buffers.iter().any(|b| b.id == id))
            .map(|s| s.index)
    }

    /// Sum of all reference counts
    pub fn total_refs(&self) -> u64 {
        self.shards
            .iter()
            .flat_map(|s| s.buffers.iter())
            .map(|b| b.refcnt as u64)
            .sum()
    }
}

// =============================================================================
// Tests
// =============================================================================
