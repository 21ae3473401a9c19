//! Concurrent Workload Driver
//!
//! Exercises a [`BlockCache`] from several worker threads the way a storage
//! layer would: fetch a block, optionally modify and write it back, release.
//!
//! # Access Pattern
//!
//! - Blocks `0..hot_blocks` are shared by every worker
//! - Each worker also owns a private range of `private_blocks` blocks
//! - `hot_ratio` of the accesses go to the shared range
//! - Every `pin_every`-th access pins its block; a worker keeps at most one
//!   block pinned and unpins the previous one when it pins the next
//!
//! Written blocks carry a stamp identifying the block, so any buffer served
//! for the wrong block shows up as a corruption in the report.
//!
//! `PoolExhausted` is retried up to `max_retries` times; any other error
//! stops the run.

use std::thread;
use std::time::{Duration, Instant};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::cache::{BlockCache, Buf, MetricsSnapshot};
use crate::device::{BlockDevice, DeviceStats};
use crate::error::{Error, Result};

/// Bytes at the start of a block holding the block stamp
const STAMP_LEN: usize = 4;

/// Workload parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkloadConfig {
    /// Worker threads
    pub threads: usize,
    /// Accesses per worker
    pub ops_per_thread: usize,
    /// Device id the workload addresses
    pub dev: u32,
    /// Blocks shared by all workers
    pub hot_blocks: u32,
    /// Blocks owned by each worker
    pub private_blocks: u32,
    /// Fraction of accesses going to the shared range
    pub hot_ratio: f64,
    /// Fraction of accesses that write the block back
    pub write_ratio: f64,
    /// Pin every n-th access (0 disables pinning)
    pub pin_every: usize,
    /// Retries of an access that hit an exhausted pool
    pub max_retries: u32,
    /// Seed for the access sequence
    pub seed: u64,
}

impl Default for WorkloadConfig {
    fn default() -> Self {
        Self {
            threads: 4,
            ops_per_thread: 10_000,
            dev: 1,
            hot_blocks: 8,
            private_blocks: 32,
            hot_ratio: 0.5,
            write_ratio: 0.1,
            pin_every: 0,
            max_retries: 1_000,
            seed: 0x5eed,
        }
    }
}

impl WorkloadConfig {
    /// Check ranges and ratios
    pub fn validate(&self) -> Result<()> {
        if self.threads == 0 {
            return Err(Error::Config("threads must be positive".into()));
        }
        if self.hot_blocks == 0 && self.private_blocks == 0 {
            return Err(Error::Config(
                "hot_blocks and private_blocks cannot both be zero".into(),
            ));
        }
        for (name, ratio) in [("hot_ratio", self.hot_ratio), ("write_ratio", self.write_ratio)] {
            if !(0.0..=1.0).contains(&ratio) {
                return Err(Error::Config(format!("{} must be within [0, 1]", name)));
            }
        }
        let span = self.hot_blocks as u64 + self.threads as u64 * self.private_blocks as u64;
        if span > u32::MAX as u64 {
            return Err(Error::Config("block ranges exceed the block number space".into()));
        }
        Ok(())
    }

    /// First block of a worker's private range
    fn private_base(&self, worker: usize) -> u32 {
        self.hot_blocks + worker as u32 * self.private_blocks
    }
}

/// Counters of one worker
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct WorkerReport {
    pub worker: usize,
    pub ops: u64,
    pub hot_ops: u64,
    pub writes: u64,
    pub pins: u64,
    /// Accesses retried after `PoolExhausted`
    pub retries: u64,
    /// Accesses given up after `max_retries`
    pub failures: u64,
    /// Blocks whose stamp named another block
    pub corruptions: u64,
}

/// Outcome of a workload run
#[derive(Debug, Clone, Serialize)]
pub struct WorkloadReport {
    pub workers: Vec<WorkerReport>,
    pub elapsed_secs: f64,
    pub ops_per_sec: f64,
    pub cache: MetricsSnapshot,
    pub device: DeviceStats,
    /// Descriptors linked into each shard at the end of the run
    pub occupancy: Vec<usize>,
}

impl WorkloadReport {
    pub fn total_ops(&self) -> u64 {
        self.workers.iter().map(|w| w.ops).sum()
    }

    pub fn total_failures(&self) -> u64 {
        self.workers.iter().map(|w| w.failures).sum()
    }

    pub fn total_corruptions(&self) -> u64 {
        self.workers.iter().map(|w| w.corruptions).sum()
    }

    pub fn total_retries(&self) -> u64 {
        self.workers.iter().map(|w| w.retries).sum()
    }
}

impl std::fmt::Display for WorkloadReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(
            f,
            "{} ops by {} workers in {:.3}s ({:.0} ops/s)",
            self.total_ops(),
            self.workers.len(),
            self.elapsed_secs,
            self.ops_per_sec
        )?;
        writeln!(
            f,
            "retries: {}, failures: {}, corruptions: {}",
            self.total_retries(),
            self.total_failures(),
            self.total_corruptions()
        )?;
        writeln!(f, "{}", self.cache)?;
        writeln!(
            f,
            "device: {} reads, {} writes",
            self.device.reads, self.device.writes
        )?;
        write!(f, "shard occupancy: {:?}", self.occupancy)
    }
}

/// Run the workload to completion
pub fn run(cache: &BlockCache, config: &WorkloadConfig) -> Result<WorkloadReport> {
    config.validate()?;
    if cache.block_size() < STAMP_LEN {
        return Err(Error::Config(format!(
            "block size {} is too small to stamp",
            cache.block_size()
        )));
    }

    info!(
        "Starting workload: {} workers x {} ops, {} hot blocks, {} private blocks each",
        config.threads, config.ops_per_thread, config.hot_blocks, config.private_blocks
    );

    let (tx, rx) = crossbeam::channel::unbounded();
    let started = Instant::now();

    thread::scope(|s| {
        for worker in 0..config.threads {
            let tx = tx.clone();
            s.spawn(move || {
                let outcome = Worker::new(cache, config, worker)
                    .run()
                    .map_err(|e| format!("worker {}: {}", worker, e));
                // Receiver outlives the scope
                let _ = tx.send(outcome);
            });
        }
    });
    drop(tx);
    let elapsed = started.elapsed();

    let mut workers = Vec::with_capacity(config.threads);
    for outcome in rx.iter() {
        workers.push(outcome.map_err(Error::Internal)?);
    }
    workers.sort_by_key(|w| w.worker);

    let report = WorkloadReport {
        elapsed_secs: elapsed.as_secs_f64(),
        ops_per_sec: throughput(workers.iter().map(|w| w.ops).sum(), elapsed),
        workers,
        cache: cache.stats(),
        device: cache.device().stats(),
        occupancy: cache.snapshot().occupancy(),
    };

    if report.total_corruptions() > 0 {
        warn!("{} corrupted blocks observed", report.total_corruptions());
    }
    info!(
        "Workload finished: {} ops in {:.3}s",
        report.total_ops(),
        report.elapsed_secs
    );
    Ok(report)
}

fn throughput(ops: u64, elapsed: Duration) -> f64 {
    let secs = elapsed.as_secs_f64();
    if secs == 0.0 {
        0.0
    } else {
        ops as f64 / secs
    }
}

struct Worker<'a> {
    cache: &'a BlockCache,
    config: &'a WorkloadConfig,
    report: WorkerReport,
    rng: StdRng,
    pinned: Option<u32>,
}

impl<'a> Worker<'a> {
    fn new(cache: &'a BlockCache, config: &'a WorkloadConfig, worker: usize) -> Self {
        Self {
            cache,
            config,
            report: WorkerReport {
                worker,
                ..Default::default()
            },
            rng: StdRng::seed_from_u64(config.seed ^ worker as u64),
            pinned: None,
        }
    }

    fn run(mut self) -> Result<WorkerReport> {
        for op in 0..self.config.ops_per_thread {
            self.step(op)?;
        }
        if let Some(blockno) = self.pinned.take() {
            self.unpin(blockno)?;
        }

        debug!(
            "Worker {} done: {} ops, {} retries",
            self.report.worker, self.report.ops, self.report.retries
        );
        Ok(self.report)
    }

    fn pick_block(&mut self) -> u32 {
        let hot = self.config.private_blocks == 0
            || (self.config.hot_blocks > 0 && self.rng.gen_bool(self.config.hot_ratio));
        if hot {
            self.report.hot_ops += 1;
            self.rng.gen_range(0..self.config.hot_blocks)
        } else {
            let offset = self.rng.gen_range(0..self.config.private_blocks);
            self.config.private_base(self.report.worker) + offset
        }
    }

    fn step(&mut self, op: usize) -> Result<()> {
        let blockno = self.pick_block();
        let write = self.rng.gen_bool(self.config.write_ratio);
        self.report.ops += 1;

        let Some(mut buf) = self.acquire(blockno, true)? else {
            return Ok(());
        };

        let stamp = u32::from_le_bytes(read_stamp(buf.data()));
        if stamp != 0 && stamp != blockno + 1 {
            self.report.corruptions += 1;
            warn!(
                "Block {} of worker {} carries the stamp of block {}",
                buf.key(),
                self.report.worker,
                stamp - 1
            );
        }

        if write {
            buf.data_mut()[..STAMP_LEN].copy_from_slice(&(blockno + 1).to_le_bytes());
            self.cache.write_back(&buf)?;
            self.report.writes += 1;
        }

        let pin = self.config.pin_every > 0
            && op % self.config.pin_every == 0
            && self.pinned != Some(blockno);
        if pin {
            self.cache.pin(&buf)?;
            self.report.pins += 1;
        }
        self.cache.release(buf)?;

        if pin {
            if let Some(previous) = self.pinned.replace(blockno) {
                self.unpin(previous)?;
            }
        }
        Ok(())
    }

    fn unpin(&mut self, blockno: u32) -> Result<()> {
        // A pinned block is resident, so this is always a hit
        if let Some(buf) = self.acquire(blockno, false)? {
            self.cache.unpin(&buf)?;
            self.cache.release(buf)?;
        }
        Ok(())
    }

    /// Fetch or get a block, retrying while the pool is exhausted
    fn acquire(&mut self, blockno: u32, read: bool) -> Result<Option<Buf<'a>>> {
        let dev = self.config.dev;
        let mut attempts = 0;
        loop {
            let result = if read {
                self.cache.fetch(dev, blockno)
            } else {
                self.cache.get(dev, blockno)
            };
            match result {
                Ok(buf) => return Ok(Some(buf)),
                Err(e) if e.is_retryable() && attempts < self.config.max_retries => {
                    attempts += 1;
                    self.report.retries += 1;
                    thread::yield_now();
                }
                Err(e) if e.is_retryable() => {
                    self.report.failures += 1;
                    warn!(
                        "Worker {} gave up on block {} after {} retries",
                        self.report.worker, blockno, attempts
                    );
                    return Ok(None);
                }
                Err(e) => return Err(e),
            }
        }
    }
}

fn read_stamp(data: &[u8]) -> [u8; STAMP_LEN] {
    let mut stamp = [0u8; STAMP_LEN];
    stamp.copy_from_slice(&data[..STAMP_LEN]);
    stamp
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CacheConfig;
    use crate::device::MemDisk;
    use assert_matches::assert_matches;
    use std::sync::Arc;

    fn cache(buffers: usize) -> (BlockCache, Arc<MemDisk>) {
        let disk = Arc::new(MemDisk::new(64));
        let config = CacheConfig {
            shard_count: 5,
            buffer_count: buffers,
            block_size: 64,
        };
        (BlockCache::with_device(config, disk.clone()).unwrap(), disk)
    }

    #[test]
    fn test_config_validation() {
        assert!(WorkloadConfig::default().validate().is_ok());

        let config = WorkloadConfig {
            threads: 0,
            ..Default::default()
        };
        assert_matches!(config.validate(), Err(Error::Config(_)));

        let config = WorkloadConfig {
            write_ratio: 1.5,
            ..Default::default()
        };
        assert_matches!(config.validate(), Err(Error::Config(_)));

        let config = WorkloadConfig {
            hot_blocks: 0,
            private_blocks: 0,
            ..Default::default()
        };
        assert_matches!(config.validate(), Err(Error::Config(_)));
    }

    #[test]
    fn test_same_seed_same_access_pattern() {
        let config = WorkloadConfig {
            threads: 1,
            ops_per_thread: 300,
            hot_blocks: 4,
            private_blocks: 12,
            write_ratio: 0.4,
            seed: 99,
            ..Default::default()
        };

        let reports: Vec<_> = (0..2)
            .map(|_| {
                let (cache, disk) = cache(8);
                let report = run(&cache, &config).unwrap();
                (report.workers[0].clone(), report.cache.misses, disk.stats())
            })
            .collect();
        assert_eq!(reports[0], reports[1]);

        let (cache, disk) = cache(8);
        let other = WorkloadConfig { seed: 100, ..config };
        let report = run(&cache, &other).unwrap();
        assert_ne!(
            (report.workers[0].clone(), report.cache.misses, disk.stats()),
            reports[0]
        );
    }

    #[test]
    fn test_single_worker_run() {
        let (cache, disk) = cache(8);
        let config = WorkloadConfig {
            threads: 1,
            ops_per_thread: 500,
            hot_blocks: 4,
            private_blocks: 12,
            write_ratio: 0.3,
            ..Default::default()
        };

        let report = run(&cache, &config).unwrap();
        assert_eq!(report.total_ops(), 500);
        assert_eq!(report.total_failures(), 0);
        assert_eq!(report.total_corruptions(), 0);
        assert_eq!(report.cache.hits + report.cache.misses, 500);
        assert_eq!(report.workers[0].writes, disk.stats().writes);
        assert_eq!(report.occupancy.iter().sum::<usize>(), 8);
        assert_eq!(cache.snapshot().total_refs(), 0);
    }

    #[test]
    fn test_concurrent_run_with_pins() {
        let (cache, _) = cache(16);
        let config = WorkloadConfig {
            threads: 4,
            ops_per_thread: 2_000,
            hot_blocks: 6,
            private_blocks: 10,
            write_ratio: 0.2,
            pin_every: 50,
            ..Default::default()
        };

        let report = run(&cache, &config).unwrap();
        assert_eq!(report.workers.len(), 4);
        assert_eq!(report.total_ops(), 8_000);
        assert_eq!(report.total_corruptions(), 0);
        assert!(report.workers.iter().all(|w| w.pins > 0));
        assert_eq!(report.cache.pins, report.cache.unpins);
        // Every pin was undone and every buffer released
        assert_eq!(cache.snapshot().total_refs(), 0);
    }

    #[test]
    fn test_stamps_survive_eviction() {
        let (cache, disk) = cache(4);
        let config = WorkloadConfig {
            threads: 2,
            ops_per_thread: 1_000,
            hot_blocks: 2,
            private_blocks: 20,
            write_ratio: 1.0,
            ..Default::default()
        };

        let report = run(&cache, &config).unwrap();
        assert_eq!(report.total_corruptions(), 0);
        assert!(report.cache.evictions > 0);

        for blockno in 0..config.private_base(2) {
            if let Some(block) = disk.block(config.dev, blockno) {
                assert_eq!(block[..STAMP_LEN], (blockno + 1).to_le_bytes());
            }
        }
    }

    #[test]
    fn test_report_serializes() {
        let (cache, _) = cache(8);
        let config = WorkloadConfig {
            threads: 2,
            ops_per_thread: 10,
            ..Default::default()
        };
        let report = run(&cache, &config).unwrap();

        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["workers"].as_array().unwrap().len(), 2);
        assert!(json["cache"]["hit_ratio"].is_number());
        assert!(report.to_string().contains("20 ops by 2 workers"));
    }
}
