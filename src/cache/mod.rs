//! Sharded Block Buffer Cache
//!
//! Fixed pool of block-sized buffers shared by every thread of a storage
//! layer, indexed by a hash table whose buckets are independently locked.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │                            BlockCache                                │
//! ├──────────────────────────────────────────────────────────────────────┤
//! │  Bucket table (blockno % shard_count)                                │
//! │  ┌─────────┐ ┌─────────┐ ┌─────────┐       ┌─────────┐               │
//! │  │ Shard 0 │ │ Shard 1 │ │ Shard 2 │  ...  │ Shard N │  mutex each   │
//! │  │ records │ │ records │ │ records │       │ records │               │
//! │  └────┬────┘ └────┬────┘ └────┬────┘       └────┬────┘               │
//! │       │ id        │ id        │ id              │ id                 │
//! │  ┌────▼───────────▼───────────▼─────────────────▼────────────────┐   │
//! │  │ Buffer pool: [valid | sleep lock | payload] x buffer_count   │   │
//! │  └──────────────────────────────┬────────────────────────────────┘   │
//! │                                 │ read / write                       │
//! │                          BlockDevice                                 │
//! └──────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Design Principles
//!
//! - Every descriptor is linked into exactly one shard at all times
//! - A block is resident in at most one descriptor, found in its home shard
//! - Referenced descriptors are never recycled
//! - Victims are taken shard-locally by timestamp and moved to the home shard
//! - Foreign shards are only try-locked, so eviction never deadlocks

mod buffer;
mod clock;
mod engine;
mod metrics;
mod proptest;
mod shard;
mod sleeplock;

pub use buffer::{Buf, BufId};
pub use clock::{Clock, LogicalClock, TickClock};
pub use engine::{BlockCache, BufferInfo, CacheConfig, CacheSnapshot, ShardSnapshot};
pub use metrics::{CacheMetrics, MetricsSnapshot};
pub use shard::BlockKey;
pub use sleeplock::{SleepLock, SleepLockGuard};

/// Default number of bucket shards (prime, spreads sequential block numbers)
pub const DEFAULT_SHARD_COUNT: usize = 13;

/// Default number of buffers in the pool
pub const DEFAULT_BUFFER_COUNT: usize = 30;

/// Default block size in bytes
pub const DEFAULT_BLOCK_SIZE: usize = 1024;

/// Shard every buffer is linked into at construction
pub const INITIAL_SHARD: usize = 0;

/// Cache line size for alignment (x86-64)
pub const CACHE_LINE_SIZE: usize = 64;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_config() {
        let config = CacheConfig::default();
        assert_eq!(config.shard_count, DEFAULT_SHARD_COUNT);
        assert_eq!(config.buffer_count, DEFAULT_BUFFER_COUNT);
        assert_eq!(config.block_size, DEFAULT_BLOCK_SIZE);
        assert!(INITIAL_SHARD < DEFAULT_SHARD_COUNT);
    }
}
