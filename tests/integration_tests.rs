//! blockcache Integration Tests
//!
//! - Cache behavior through the public API: hits, refcounts, exhaustion,
//!   write-back and release preconditions
//! - Concurrency: cross-shard eviction under contention, blocking on a held
//!   buffer, deadlock freedom under a watchdog
//! - Backends: the cache over a disk image file

use std::sync::Arc;
use std::time::Duration;

use assert_matches::assert_matches;
use blockcache::cache::{BlockCache, BlockKey, CacheConfig, TickClock};
use blockcache::device::{BlockDevice, FileDisk, MemDisk};
use blockcache::error::Error;

const BLOCK: usize = 128;

fn mem_cache(shard_count: usize, buffer_count: usize) -> (Arc<BlockCache>, Arc<MemDisk>) {
    let disk = Arc::new(MemDisk::new(BLOCK));
    let config = CacheConfig {
        shard_count,
        buffer_count,
        block_size: BLOCK,
    };
    let cache = BlockCache::with_device(config, disk.clone()).unwrap();
    (Arc::new(cache), disk)
}

// =============================================================================
// Cache Behavior Tests
// =============================================================================

mod cache_tests {
    use super::*;

    #[test]
    fn test_initial_state() {
        let (cache, _) = mem_cache(13, 30);
        let snapshot = cache.snapshot();

        assert_eq!(snapshot.shards.len(), 13);
        assert_eq!(snapshot.shards[0].buffers.len(), 30);
        assert!(snapshot.shards[1..].iter().all(|s| s.buffers.is_empty()));
        for buf in &snapshot.shards[0].buffers {
            assert_eq!(buf.refcnt, 0);
            assert!(!buf.valid);
        }
    }

    #[test]
    fn test_hit_issues_no_device_read() {
        let (cache, disk) = mem_cache(13, 30);
        disk.load(1, 42, &[0xab; BLOCK]);

        let first = cache.fetch(1, 42).unwrap();
        let id = first.id();
        assert!(first.data().iter().all(|&b| b == 0xab));
        cache.release(first).unwrap();

        let second = cache.fetch(1, 42).unwrap();
        assert_eq!(second.id(), id);
        assert!(second.is_valid());
        cache.release(second).unwrap();

        assert_eq!(disk.stats().reads, 1);
    }

    #[test]
    fn test_held_buffers_are_never_recycled() {
        let (cache, _) = mem_cache(5, 8);

        let held: Vec<_> = (0..5u32).map(|b| cache.fetch(1, b).unwrap()).collect();
        for blockno in 100..300 {
            let buf = cache.get(1, blockno).unwrap();
            assert!(held.iter().all(|h| h.id() != buf.id()));
            cache.release(buf).unwrap();
        }
        for (i, buf) in held.iter().enumerate() {
            assert_eq!(buf.key(), BlockKey::new(1, i as u32));
            assert!(cache.contains(1, i as u32));
        }
    }

    #[test]
    fn test_balanced_operations_restore_refcnt() {
        let (cache, _) = mem_cache(3, 4);
        let key = BlockKey::new(2, 9);
        let refcnt = || cache.snapshot().find(key).map(|(_, b)| b.refcnt);

        let buf = cache.fetch(2, 9).unwrap();
        assert_eq!(refcnt(), Some(1));
        cache.pin(&buf).unwrap();
        cache.pin(&buf).unwrap();
        assert_eq!(refcnt(), Some(3));
        cache.unpin(&buf).unwrap();
        cache.unpin(&buf).unwrap();
        cache.release(buf).unwrap();

        assert_eq!(refcnt(), Some(0));
        assert_eq!(cache.snapshot().total_refs(), 0);
    }

    #[test]
    fn test_exhaustion() {
        let (cache, _) = mem_cache(4, 6);

        let held: Vec<_> = (0..6u32).map(|b| cache.get(1, b).unwrap()).collect();
        assert_matches!(
            cache.get(1, 6),
            Err(Error::PoolExhausted { dev: 1, blockno: 6 })
        );
        assert_matches!(cache.fetch(2, 0), Err(Error::PoolExhausted { .. }));

        cache.release(held.into_iter().next().unwrap()).unwrap();
        assert!(cache.get(1, 6).is_ok());
    }

    #[test]
    fn test_write_back_and_refetch() {
        let (cache, disk) = mem_cache(2, 2);

        let mut buf = cache.fetch(1, 5).unwrap();
        buf.data_mut().fill(0x5a);
        cache.write_back(&buf).unwrap();
        cache.release(buf).unwrap();

        // Push block 5 out of the pool, then read it back from the device
        for blockno in [6, 7, 8] {
            let buf = cache.get(1, blockno).unwrap();
            cache.release(buf).unwrap();
        }
        assert!(!cache.contains(1, 5));

        let buf = cache.fetch(1, 5).unwrap();
        assert!(buf.data().iter().all(|&b| b == 0x5a));
        assert_eq!(disk.stats().reads, 2);
    }

    #[test]
    fn test_write_back_from_non_holder() {
        let (cache, disk) = mem_cache(2, 2);
        let buf = cache.fetch(1, 1).unwrap();

        let rejected = std::thread::scope(|s| {
            s.spawn(|| matches!(cache.write_back(&buf), Err(Error::NotHeld { .. })))
                .join()
                .unwrap()
        });
        assert!(rejected);
        assert_eq!(disk.stats().writes, 0);
        assert_eq!(cache.stats().usage_violations, 1);

        cache.write_back(&buf).unwrap();
        cache.release(buf).unwrap();
        assert_eq!(disk.stats().writes, 1);
    }

    #[test]
    fn test_unpin_of_unpinned_buffer() {
        let (cache, _) = mem_cache(2, 2);
        let buf = cache.get(1, 1).unwrap();
        assert_matches!(cache.unpin(&buf), Err(Error::NotPinned { .. }));
        cache.release(buf).unwrap();
    }

    #[test]
    fn test_device_write_failure_propagates() {
        let (cache, disk) = mem_cache(2, 2);
        disk.fail_writes(1, 3);

        let buf = cache.fetch(1, 3).unwrap();
        assert_matches!(
            cache.write_back(&buf),
            Err(Error::Device { dev: 1, blockno: 3, .. })
        );
        cache.release(buf).unwrap();
        assert_eq!(cache.stats().device_writes, 0);
    }

    #[test]
    fn test_tick_clock_keeps_first_candidate() {
        let disk = Arc::new(MemDisk::new(BLOCK));
        let clock = Arc::new(TickClock::new());
        let config = CacheConfig {
            shard_count: 1,
            buffer_count: 2,
            block_size: BLOCK,
        };
        let cache = BlockCache::new(config, disk, clock.clone()).unwrap();

        // Same tick for both releases; the first record in scan order wins
        let a = cache.get(1, 0).unwrap();
        let b = cache.get(1, 1).unwrap();
        let first_in_order = cache.snapshot().shards[0].buffers[0].id;
        cache.release(a).unwrap();
        cache.release(b).unwrap();

        let c = cache.get(1, 2).unwrap();
        assert_eq!(c.id(), first_in_order);
        cache.release(c).unwrap();

        // Once block 2 is newer, the other buffer is the victim
        clock.tick();
        let c = cache.get(1, 2).unwrap();
        cache.release(c).unwrap();
        let d = cache.get(1, 3).unwrap();
        assert_ne!(d.id(), first_in_order);
    }
}

// =============================================================================
// Concurrency Tests
// =============================================================================

mod concurrency_tests {
    use super::*;
    use crossbeam::channel;

    /// Deadline for any multi-threaded scenario to finish
    const WATCHDOG: Duration = Duration::from_secs(30);

    #[test]
    fn test_cross_shard_eviction_completes() {
        // Four workers with distinct home shards, each evicting buffers
        // linked into the others' shards
        let (cache, _) = mem_cache(4, 6);
        let (tx, rx) = channel::unbounded();

        for worker in 0..4u32 {
            let cache = cache.clone();
            let tx = tx.clone();
            std::thread::spawn(move || {
                let mut retries = 0u64;
                for i in 0..2_000u32 {
                    // Block numbers congruent to `worker` share its home shard
                    let blockno = worker + 4 * (i % 16);
                    let buf = loop {
                        match cache.fetch(1, blockno) {
                            Ok(buf) => break buf,
                            Err(e) if e.is_retryable() => {
                                retries += 1;
                                std::thread::yield_now();
                            }
                            Err(e) => panic!("worker {}: {}", worker, e),
                        }
                    };
                    assert_eq!(buf.key(), BlockKey::new(1, blockno));
                    cache.release(buf).unwrap();
                }
                tx.send((worker, retries)).unwrap();
            });
        }
        drop(tx);

        let mut done = Vec::new();
        for _ in 0..4 {
            let (worker, _) = rx
                .recv_timeout(WATCHDOG)
                .expect("worker did not finish in time: possible deadlock");
            done.push(worker);
        }
        done.sort();
        assert_eq!(done, vec![0, 1, 2, 3]);

        let snapshot = cache.snapshot();
        assert_eq!(snapshot.buffer_count(), 6);
        assert_eq!(snapshot.total_refs(), 0);
        assert!(cache.stats().relocations > 0);
    }

    #[test]
    fn test_shared_block_is_exclusive() {
        let (cache, disk) = mem_cache(3, 4);
        let (tx, rx) = channel::unbounded();

        for worker in 0..4 {
            let cache = cache.clone();
            let tx = tx.clone();
            std::thread::spawn(move || {
                for _ in 0..500 {
                    let mut buf = cache.fetch(1, 0).unwrap();
                    let data = buf.data_mut();
                    let counter = u64::from_le_bytes(data[..8].try_into().unwrap());
                    data[..8].copy_from_slice(&(counter + 1).to_le_bytes());
                    cache.release(buf).unwrap();
                }
                tx.send(worker).unwrap();
            });
        }
        drop(tx);

        for _ in 0..4 {
            rx.recv_timeout(WATCHDOG).expect("worker stuck");
        }

        // One buffer for one block: no increment was lost
        let buf = cache.fetch(1, 0).unwrap();
        let counter = u64::from_le_bytes(buf.data()[..8].try_into().unwrap());
        assert_eq!(counter, 2_000);
        assert_eq!(disk.stats().reads, 1);
    }

    #[test]
    fn test_get_blocks_until_holder_releases() {
        let (cache, _) = mem_cache(2, 2);
        let buf = cache.fetch(1, 1).unwrap();
        let (tx, rx) = channel::bounded(1);

        let waiter = {
            let cache = cache.clone();
            std::thread::spawn(move || {
                let buf = cache.get(1, 1).unwrap();
                tx.send(buf.id()).unwrap();
            })
        };

        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
        let id = buf.id();
        cache.release(buf).unwrap();

        assert_eq!(rx.recv_timeout(WATCHDOG).unwrap(), id);
        waiter.join().unwrap();
        assert_eq!(cache.snapshot().total_refs(), 0);
    }

    #[test]
    fn test_release_from_non_holder_is_rejected() {
        let (cache, _) = mem_cache(1, 2);
        let buf = cache.fetch(1, 7).unwrap();

        let rejected = {
            let cache = cache.clone();
            std::thread::scope(|s| {
                s.spawn(move || matches!(cache.release(buf), Err(Error::NotHeld { .. })))
                    .join()
                    .unwrap()
            })
        };
        assert!(rejected);

        // The descriptor stays referenced and locked
        let snapshot = cache.snapshot();
        let (_, info) = snapshot.find(BlockKey::new(1, 7)).unwrap();
        assert_eq!(info.refcnt, 1);
        assert!(info.locked);
    }
}

// =============================================================================
// File Device Tests
// =============================================================================

mod file_device_tests {
    use super::*;

    #[test]
    fn test_cache_over_image_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("disk.img");
        let config = CacheConfig {
            shard_count: 3,
            buffer_count: 4,
            block_size: 256,
        };

        {
            let disk = Arc::new(FileDisk::open(&path, 1, 256).unwrap());
            let cache = BlockCache::with_device(config.clone(), disk.clone()).unwrap();
            for blockno in 0..10u32 {
                let mut buf = cache.fetch(1, blockno).unwrap();
                buf.data_mut().fill(blockno as u8);
                cache.write_back(&buf).unwrap();
                cache.release(buf).unwrap();
            }
            disk.sync().unwrap();
            assert_eq!(disk.stats().writes, 10);
        }

        let disk = Arc::new(FileDisk::open(&path, 1, 256).unwrap());
        let cache = BlockCache::with_device(config, disk).unwrap();
        for blockno in (0..10u32).rev() {
            let buf = cache.fetch(1, blockno).unwrap();
            assert!(buf.data().iter().all(|&b| b == blockno as u8));
            cache.release(buf).unwrap();
        }
    }

    #[test]
    fn test_wrong_device_id_fails_fetch() {
        let dir = tempfile::tempdir().unwrap();
        let disk = Arc::new(FileDisk::open(dir.path().join("disk.img"), 1, 64).unwrap());
        let config = CacheConfig {
            shard_count: 1,
            buffer_count: 1,
            block_size: 64,
        };
        let cache = BlockCache::with_device(config, disk).unwrap();

        assert_matches!(cache.fetch(2, 0), Err(Error::Device { dev: 2, .. }));
        // The failed fetch released its buffer
        assert!(cache.fetch(1, 0).is_ok());
    }
}
