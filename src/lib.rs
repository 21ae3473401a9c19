//! blockcache - Sharded Block Buffer Cache
//!
//! A fixed pool of block-sized buffers between a storage layer and a block
//! device. Callers fetch a block by (device, block number), get exclusive
//! access to its bytes, optionally write it back, and release it. The index
//! is split into independently locked shards so lookups of different blocks
//! proceed in parallel.
//!
//! # Architecture
//!
//! ```text
//! storage layer ──fetch/get──▶ BlockCache ──read/write──▶ BlockDevice
//!               ◀──Buf (locked)──   │
//!               ──release/pin──▶    └─ shards ─ buffer pool
//! ```
//!
//! # Modules
//!
//! - [`cache`] - Bucket shards, buffer pool, eviction and reference counting
//! - [`config`] - YAML settings file
//! - [`device`] - Block device trait and the memory and file backends
//! - [`error`] - Error types
//! - [`workload`] - Multi-threaded workload driver used by the CLI

pub mod cache;
pub mod config;
pub mod device;
pub mod error;
pub mod workload;

pub use cache::{BlockCache, BlockKey, Buf, CacheConfig, CacheSnapshot, MetricsSnapshot};
pub use device::{BlockDevice, FileDisk, MemDisk};
pub use error::{Error, Result};
