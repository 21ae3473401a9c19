//! Bucket Shards
//!
//! The bucket table is a fixed array of shards. Each shard owns the metadata
//! records of the descriptors currently linked into it, behind one short-hold
//! mutex.
//!
//! # Design
//!
//! - A descriptor's metadata (identity, reference count, timestamp) lives in
//!   exactly one shard's list; relocating a descriptor moves the record
//! - The shard mutex is never held across device I/O or a sleep-lock wait
//! - Newly linked records go to the front, so scans see the most recently
//!   relocated descriptors first
//! - Cache-line alignment between shards prevents false sharing

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::{Mutex, MutexGuard};
use serde::Serialize;

use super::buffer::BufId;

/// Identity of a cached block
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct BlockKey {
    /// Device id
    pub dev: u32,
    /// Block number on the device
    pub blockno: u32,
}

impl BlockKey {
    /// Create a new block key
    pub const fn new(dev: u32, blockno: u32) -> Self {
        Self { dev, blockno }
    }
}

impl std::fmt::Display for BlockKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.dev, self.blockno)
    }
}

/// Metadata record of one descriptor
#[derive(Debug, Clone)]
pub(crate) struct BufMeta {
    /// Slot in the buffer pool
    pub id: BufId,
    /// Cached block; `None` until the descriptor is first allocated
    pub key: Option<BlockKey>,
    /// Active holders plus pins
    pub refcnt: u32,
    /// Share of `refcnt` taken by pin
    pub pins: u32,
    /// Clock value of the last acquire or release
    pub timestamp: u64,
}

impl BufMeta {
    pub fn new(id: BufId) -> Self {
        Self {
            id,
            key: None,
            refcnt: 0,
            pins: 0,
            timestamp: 0,
        }
    }
}

/// Descriptor records linked into one shard
#[derive(Debug, Default)]
pub(crate) struct ShardList {
    entries: VecDeque<BufMeta>,
}

impl ShardList {
    /// Record caching `key`, if resident in this shard
    pub fn find_key_mut(&mut self, key: BlockKey) -> Option<&mut BufMeta> {
        self.entries.iter_mut().find(|m| m.key == Some(key))
    }

    /// Record of descriptor `id`, if linked into this shard
    pub fn find_id_mut(&mut self, id: BufId) -> Option<&mut BufMeta> {
        self.entries.iter_mut().find(|m| m.id == id)
    }

    /// Position of the unreferenced record with the lowest timestamp
    ///
    /// Ties go to the record met first in scan order.
    pub fn lru_victim(&self) -> Option<usize> {
        self.entries
            .iter()
            .enumerate()
            .filter(|(_, m)| m.refcnt == 0)
            .min_by_key(|(_, m)| m.timestamp)
            .map(|(pos, _)| pos)
    }

    /// Mutable access to the record at `pos`
    pub fn get_mut(&mut self, pos: usize) -> Option<&mut BufMeta> {
        self.entries.get_mut(pos)
    }

    /// Remove the record at `pos`
    pub fn unlink(&mut self, pos: usize) -> Option<BufMeta> {
        self.entries.remove(pos)
    }

    /// Link a record at the front and return it
    pub fn link(&mut self, meta: BufMeta) -> &mut BufMeta {
        self.entries.push_front(meta);
        &mut self.entries[0]
    }

    pub fn iter(&self) -> impl Iterator<Item = &BufMeta> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

/// One bucket of the cache
#[repr(align(64))]
pub(crate) struct Shard {
    /// Position in the bucket table
    index: usize,
    /// Linked descriptor records
    list: Mutex<ShardList>,
    /// Lookups that hashed to this shard
    lookups: AtomicU64,
    /// Eviction sweeps that skipped this shard because it was busy
    skips: AtomicU64,
}

impl Shard {
    /// Create an empty shard
    pub fn new(index: usize) -> Self {
        Self {
            index,
            list: Mutex::new(ShardList::default()),
            lookups: AtomicU64::new(0),
            skips: AtomicU64::new(0),
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    /// Lock as the home shard of a lookup
    pub fn lock_home(&self) -> MutexGuard<'_, ShardList> {
        self.lookups.fetch_add(1, Ordering::Relaxed);
        self.list.lock()
    }

    /// Lock for pin, unpin and release bookkeeping
    pub fn lock(&self) -> MutexGuard<'_, ShardList> {
        self.list.lock()
    }

    /// Non-blocking lock for a foreign shard during an eviction sweep
    ///
    /// Fails when any thread holds the shard, the caller included, because
    /// the shard mutex is not reentrant.
    pub fn try_lock(&self) -> Option<MutexGuard<'_, ShardList>> {
        let guard = self.list.try_lock();
        if guard.is_none() {
            self.skips.fetch_add(1, Ordering::Relaxed);
        }
        guard
    }

    pub fn lookup_count(&self) -> u64 {
        self.lookups.load(Ordering::Relaxed)
    }

    pub fn skip_count(&self) -> u64 {
        self.skips.load(Ordering::Relaxed)
    }
}

impl std::fmt::Debug for Shard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Shard")
            .field("index", &self.index)
            .field("lookups", &self.lookup_count())
            .field("skips", &self.skip_count())
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
