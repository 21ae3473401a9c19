//! Buffer Pool Descriptors
//!
//! The pool is a fixed arena of slots created once at cache construction.
//! A slot carries the payload behind its sleep lock plus the `valid` flag;
//! identity and reference counts live in the shard that currently links the
//! slot (see `shard.rs`).

use std::sync::atomic::{AtomicBool, Ordering};

use serde::Serialize;
use tracing::error;

use super::engine::BlockCache;
use super::shard::BlockKey;
use super::sleeplock::{SleepLock, SleepLockGuard};

/// Index of a descriptor in the buffer pool
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct BufId(usize);

impl BufId {
    pub(crate) const fn new(index: usize) -> Self {
        Self(index)
    }

    /// Position in the pool
    pub const fn index(&self) -> usize {
        self.0
    }
}

impl std::fmt::Display for BufId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "buf#{}", self.0)
    }
}

/// Payload half of a descriptor
pub(crate) struct BufSlot {
    /// Payload reflects the on-disk block it is bound to
    valid: AtomicBool,
    data: SleepLock<Box<[u8]>>,
}

impl BufSlot {
    pub fn new(block_size: usize) -> Self {
        Self {
            valid: AtomicBool::new(false),
            data: SleepLock::new(vec![0u8; block_size].into_boxed_slice(), "buffer"),
        }
    }

    pub fn is_valid(&self) -> bool {
        self.valid.load(Ordering::Acquire)
    }

    pub fn set_valid(&self, valid: bool) {
        self.valid.store(valid, Ordering::Release);
    }

    /// Block until the payload lock is ours
    pub fn lock(&self) -> SleepLockGuard<'_, Box<[u8]>> {
        self.data.lock()
    }

    pub fn is_locked(&self) -> bool {
        self.data.is_locked()
    }
}

/// A referenced, locked buffer handed out by [`BlockCache::get`] and
/// [`BlockCache::fetch`]
///
/// While a `Buf` exists its descriptor cannot be recycled and no other
/// thread can touch the payload. Pass it to [`BlockCache::release`] when
/// done; dropping it releases it as well.
///
/// A `Buf` may be sent to another thread, but write-back and release only
/// succeed on the thread that acquired it. Dropping it on any other thread
/// cannot release it: the buffer stays referenced and locked for good, and
/// the drop is counted as a usage violation. Hand it back to the acquiring
/// thread before letting it go.
pub struct Buf<'a> {
    pub(crate) cache: &'a BlockCache,
    pub(crate) id: BufId,
    pub(crate) key: BlockKey,
    /// Always `Some` until the buffer is released
    pub(crate) guard: Option<SleepLockGuard<'a, Box<[u8]>>>,
}

impl Buf<'_> {
    /// Descriptor index
    pub fn id(&self) -> BufId {
        self.id
    }

    /// Cached block
    pub fn key(&self) -> BlockKey {
        self.key
    }

    pub fn dev(&self) -> u32 {
        self.key.dev
    }

    pub fn blockno(&self) -> u32 {
        self.key.blockno
    }

    /// Payload reflects the on-disk contents
    pub fn is_valid(&self) -> bool {
        self.cache.slot(self.id).is_valid()
    }

    /// True if the calling thread holds this buffer's lock
    pub fn holding(&self) -> bool {
        self.guard.as_ref().is_some_and(|g| g.holding())
    }

    /// Payload bytes
    pub fn data(&self) -> &[u8] {
        match self.guard.as_deref() {
            Some(data) => &data[..],
            None => &[],
        }
    }

    /// Mutable payload bytes
    pub fn data_mut(&mut self) -> &mut [u8] {
        match self.guard.as_deref_mut() {
            Some(data) => &mut data[..],
            None => &mut [],
        }
    }
}

impl Drop for Buf<'_> {
    fn drop(&mut self) {
        if self.guard.is_none() {
            return;
        }
        let cache = self.cache;
        if let Err(e) = cache.release_buf(self) {
            error!(buf = %self.id, block = %self.key, "Release on drop failed: {}", e);
        }
    }
}

impl std::fmt::Debug for Buf<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Buf")
            .field("id", &self.id)
            .field("key", &self.key)
            .field("valid", &self.is_valid())
            .finish()
    }
}
