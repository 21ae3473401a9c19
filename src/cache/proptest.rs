//! Property-Based Tests for the Block Cache
//!
//! # Test Properties
//!
//! 1. **Refcount Gating**: held buffers keep their identity and contents no
//!    matter how many other blocks cycle through the pool
//! 2. **Balanced References**: any sequence of acquires and releases leaves
//!    every reference count at zero
//! 3. **Uniqueness**: no block is ever bound to two descriptors
//! 4. **Conservation**: the shards always link exactly `buffer_count`
//!    descriptors

#![cfg(test)]

use std::collections::HashSet;
use std::sync::Arc;

use proptest::prelude::*;

use super::{BlockCache, BlockKey, Buf, CacheConfig};
use crate::device::{BlockDevice, MemDisk};
use crate::error::Error;

const BLOCK: usize = 32;

fn cache(shard_count: usize, buffer_count: usize) -> (BlockCache, Arc<MemDisk>) {
    let disk = Arc::new(MemDisk::new(BLOCK));
    let config = CacheConfig {
        shard_count,
        buffer_count,
        block_size: BLOCK,
    };
    let cache = BlockCache::with_device(config, disk.clone()).unwrap();
    (cache, disk)
}

fn check_structure(cache: &BlockCache) -> Result<(), TestCaseError> {
    let snapshot = cache.snapshot();
    prop_assert_eq!(snapshot.buffer_count(), cache.buffer_count());

    let mut ids = HashSet::new();
    let mut keys = HashSet::new();
    for shard in &snapshot.shards {
        for buf in &shard.buffers {
            prop_assert!(ids.insert(buf.id), "{} linked twice", buf.id);
            if let Some(key) = buf.key {
                prop_assert!(keys.insert(key), "block {} bound twice", key);
            }
        }
    }
    Ok(())
}

// =============================================================================
// Property Strategies
// =============================================================================

/// Shard count, pool size and number of buffers to hold (always fewer than
/// the pool)
fn layout_strategy() -> impl Strategy<Value = (usize, usize, usize)> {
    (1usize..=7, 2usize..=12).prop_flat_map(|(shards, buffers)| {
        (Just(shards), Just(buffers), 1..buffers)
    })
}

/// Sequence of (block number, release-immediately) steps
fn access_strategy() -> impl Strategy<Value = Vec<(u32, bool)>> {
    prop::collection::vec((0u32..40, any::<bool>()), 1..200)
}

// =============================================================================
// Reference Count Properties
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(100))]

    #[test]
    fn prop_held_buffers_survive_cycling(
        (shards, buffers, hold) in layout_strategy(),
        cycled in 1u32..64,
    ) {
        let (cache, disk) = cache(shards, buffers);

        let mut held = Vec::new();
        for blockno in 0..hold as u32 {
            disk.load(1, blockno, &[blockno as u8 + 1; BLOCK]);
            held.push(cache.fetch(1, blockno).unwrap());
        }
        let ids: Vec<_> = held.iter().map(|b| b.id()).collect();

        for blockno in 1000..1000 + cycled {
            let buf = cache
                .get(2, blockno)
                .map_err(|e| TestCaseError::fail(e.to_string()))?;
            cache.release(buf).unwrap();
        }

        for (i, buf) in held.iter().enumerate() {
            prop_assert_eq!(buf.id(), ids[i]);
            prop_assert_eq!(buf.key(), BlockKey::new(1, i as u32));
            prop_assert!(buf.data().iter().all(|&b| b == i as u8 + 1));
        }
        for buf in held {
            cache.release(buf).unwrap();
        }
        check_structure(&cache)?;
    }

    #[test]
    fn prop_balanced_references(
        (shards, buffers, _) in layout_strategy(),
        accesses in access_strategy(),
    ) {
        let (cache, _) = cache(shards, buffers);

        let mut held: Vec<Buf<'_>> = Vec::new();
        for (blockno, release_now) in accesses {
            // A thread must not acquire a block it already holds
            if held.iter().any(|b| b.blockno() == blockno) {
                continue;
            }
            match cache.get(1, blockno) {
                Ok(buf) if release_now => cache.release(buf).unwrap(),
                Ok(buf) => held.push(buf),
                Err(Error::PoolExhausted { .. }) => {
                    prop_assert_eq!(held.len(), buffers);
                    cache.release(held.remove(0)).unwrap();
                }
                Err(e) => prop_assert!(false, "unexpected {}", e),
            }
            check_structure(&cache)?;
        }
        for buf in held.drain(..) {
            cache.release(buf).unwrap();
        }

        prop_assert_eq!(cache.snapshot().total_refs(), 0);
        check_structure(&cache)?;
    }

    #[test]
    fn prop_device_read_per_miss(
        (shards, buffers, _) in layout_strategy(),
        blocks in prop::collection::vec(0u32..16, 1..100),
    ) {
        let (cache, disk) = cache(shards, buffers);
        for &blockno in &blocks {
            let buf = cache.fetch(1, blockno).unwrap();
            prop_assert!(buf.is_valid());
            cache.release(buf).unwrap();
        }

        let stats = cache.stats();
        prop_assert_eq!(stats.hits + stats.misses, blocks.len() as u64);
        prop_assert_eq!(disk.stats().reads, stats.misses);
        prop_assert_eq!(stats.device_reads, stats.misses);
    }
}
