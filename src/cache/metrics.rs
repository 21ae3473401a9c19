//! Cache Metrics Collection
//!
//! Counters for monitoring cache health, exported as a plain snapshot, JSON,
//! or the Prometheus text exposition format.

use std::sync::atomic::{AtomicU64, Ordering};

use prometheus::{Encoder, Gauge, IntCounter, Registry, TextEncoder};
use serde::Serialize;

use crate::error::{Error, Result};

/// Cache metrics collector
#[derive(Debug, Default)]
pub struct CacheMetrics {
    // Lookup outcomes
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    relocations: AtomicU64,
    skips: AtomicU64,
    exhaustions: AtomicU64,

    // Device traffic issued by the cache
    device_reads: AtomicU64,
    device_writes: AtomicU64,

    // Reference bookkeeping
    releases: AtomicU64,
    pins: AtomicU64,
    unpins: AtomicU64,
    usage_violations: AtomicU64,
}

impl CacheMetrics {
    /// Create a new metrics collector
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_eviction(&self) {
        self.evictions.fetch_add(1, Ordering::Relaxed);
    }

    /// Victim came from a shard other than the home shard
    pub fn record_relocation(&self) {
        self.relocations.fetch_add(1, Ordering::Relaxed);
    }

    /// Busy shard passed over by an eviction sweep
    pub fn record_skip(&self) {
        self.skips.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_exhaustion(&self) {
        self.exhaustions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_device_read(&self) {
        self.device_reads.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_device_write(&self) {
        self.device_writes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_release(&self) {
        self.releases.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_pin(&self) {
        self.pins.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_unpin(&self) {
        self.unpins.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_usage_violation(&self) {
        self.usage_violations.fetch_add(1, Ordering::Relaxed);
    }

    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    pub fn hit_ratio(&self) -> f64 {
        let hits = self.hits() as f64;
        let total = hits + self.misses() as f64;
        if total == 0.0 {
            0.0
        } else {
            hits / total
        }
    }

    /// Get snapshot of all metrics
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            hits: self.hits(),
            misses: self.misses(),
            evictions: self.evictions.load(Ordering::Relaxed),
            relocations: self.relocations.load(Ordering::Relaxed),
            skips: self.skips.load(Ordering::Relaxed),
            exhaustions: self.exhaustions.load(Ordering::Relaxed),
            device_reads: self.device_reads.load(Ordering::Relaxed),
            device_writes: self.device_writes.load(Ordering::Relaxed),
            releases: self.releases.load(Ordering::Relaxed),
            pins: self.pins.load(Ordering::Relaxed),
            unpins: self.unpins.load(Ordering::Relaxed),
            usage_violations: self.usage_violations.load(Ordering::Relaxed),
            hit_ratio: self.hit_ratio(),
        }
    }

    /// Reset all metrics
    pub fn reset(&self) {
        for counter in [
            &self.hits,
            &self.misses,
            &self.evictions,
            &self.relocations,
            &self.skips,
            &self.exhaustions,
            &self.device_reads,
            &self.device_writes,
            &self.releases,
            &self.pins,
            &self.unpins,
            &self.usage_violations,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }
}

/// Snapshot of all cache metrics
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MetricsSnapshot {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub relocations: u64,
    pub skips: u64,
    pub exhaustions: u64,
    pub device_reads: u64,
    pub device_writes: u64,
    pub releases: u64,
    pub pins: u64,
    pub unpins: u64,
    pub usage_violations: u64,
    pub hit_ratio: f64,
}

impl MetricsSnapshot {
    fn counters(&self) -> [(&'static str, &'static str, u64); 12] {
        [
            ("blockcache_hits_total", "Lookups served by a resident buffer", self.hits),
            ("blockcache_misses_total", "Lookups that needed a victim", self.misses),
            ("blockcache_evictions_total", "Buffers recycled for a new block", self.evictions),
            (
                "blockcache_relocations_total",
                "Victims moved in from a foreign shard",
                self.relocations,
            ),
            (
                "blockcache_shard_skips_total",
                "Busy shards passed over while evicting",
                self.skips,
            ),
            (
                "blockcache_exhaustions_total",
                "Lookups that found no evictable buffer",
                self.exhaustions,
            ),
            ("blockcache_device_reads_total", "Blocks read from the device", self.device_reads),
            (
                "blockcache_device_writes_total",
                "Blocks written to the device",
                self.device_writes,
            ),
            ("blockcache_releases_total", "Buffers released", self.releases),
            ("blockcache_pins_total", "Pin operations", self.pins),
            ("blockcache_unpins_total", "Unpin operations", self.unpins),
            (
                "blockcache_usage_violations_total",
                "Operations rejected for not holding the buffer",
                self.usage_violations,
            ),
        ]
    }

    /// Render in the Prometheus text exposition format
    pub fn to_prometheus(&self) -> Result<String> {
        let registry = Registry::new();

        for (name, help, value) in self.counters() {
            let counter = IntCounter::new(name, help)?;
            counter.inc_by(value);
            registry.register(Box::new(counter))?;
        }

        let ratio = Gauge::new("blockcache_hit_ratio", "Fraction of lookups that hit")?;
        ratio.set(self.hit_ratio);
        registry.register(Box::new(ratio))?;

        let mut buffer = Vec::new();
        TextEncoder::new().encode(&registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| Error::Internal(format!("metrics encoding: {}", e)))
    }
}

impl std::fmt::Display for MetricsSnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(
            f,
            "lookups: {} hits, {} misses ({:.1}% hit ratio)",
            self.hits,
            self.misses,
            self.hit_ratio * 100.0
        )?;
        writeln!(
            f,
            "evictions: {} ({} relocated across shards), busy shards skipped: {}, exhaustions: {}",
            self.evictions, self.relocations, self.skips, self.exhaustions
        )?;
        writeln!(
            f,
            "device: {} reads, {} writes",
            self.device_reads, self.device_writes
        )?;
        write!(
            f,
            "references: {} releases, {} pins, {} unpins, {} usage violations",
            self.releases, self.pins, self.unpins, self.usage_violations
        )
    }
}

// =============================================================================
// Tests
// =============================================================================
