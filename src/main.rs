//! blockcache workload runner
//!
//! Builds a block cache over an in-memory disk or a disk image file, drives
//! it from several threads and reports the cache counters.
//!
//! ```text
//! ┌────────────┐   ┌─────────────────────────┐   ┌──────────────────┐
//! │  Workers   │──▶│       BlockCache        │──▶│ MemDisk/FileDisk │
//! │ (threads)  │   │ shards + buffer pool    │   │                  │
//! └─────┬──────┘   └─────────────────────────┘   └──────────────────┘
//!       │ WorkerReport (channel)
//!       ▼
//!   text / json / prometheus on stdout
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, ValueEnum};
use serde::Serialize;
use tracing::{error, info, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use blockcache::cache::{BlockCache, CacheSnapshot};
use blockcache::config::Settings;
use blockcache::device::{BlockDevice, FileDisk, MemDisk};
use blockcache::error::Result;
use blockcache::workload::{self, WorkloadReport};

// =============================================================================
// CLI Arguments
// =============================================================================

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
enum OutputFormat {
    Text,
    Json,
    Prometheus,
}

/// Drive a sharded block buffer cache with a concurrent workload
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// YAML settings file; flags override its values
    #[arg(long, env = "BLOCKCACHE_CONFIG")]
    config: Option<PathBuf>,

    /// Number of bucket shards
    #[arg(long, env = "BLOCKCACHE_SHARDS")]
    shards: Option<usize>,

    /// Number of buffers in the pool
    #[arg(long, env = "BLOCKCACHE_BUFFERS")]
    buffers: Option<usize>,

    /// Block size in bytes
    #[arg(long, env = "BLOCKCACHE_BLOCK_SIZE")]
    block_size: Option<usize>,

    /// Disk image file; an in-memory disk is used when absent
    #[arg(long, env = "BLOCKCACHE_IMAGE")]
    image: Option<PathBuf>,

    /// Device id
    #[arg(long, env = "BLOCKCACHE_DEV")]
    dev: Option<u32>,

    /// Worker threads
    #[arg(long, env = "BLOCKCACHE_THREADS")]
    threads: Option<usize>,

    /// Accesses per worker
    #[arg(long, env = "BLOCKCACHE_OPS")]
    ops: Option<usize>,

    /// Blocks shared by all workers
    #[arg(long, env = "BLOCKCACHE_HOT_BLOCKS")]
    hot_blocks: Option<u32>,

    /// Blocks owned by each worker
    #[arg(long, env = "BLOCKCACHE_PRIVATE_BLOCKS")]
    private_blocks: Option<u32>,

    /// Fraction of accesses to the shared blocks
    #[arg(long, env = "BLOCKCACHE_HOT_RATIO")]
    hot_ratio: Option<f64>,

    /// Fraction of accesses that write back
    #[arg(long, env = "BLOCKCACHE_WRITE_RATIO")]
    write_ratio: Option<f64>,

    /// Pin every n-th access (0 disables)
    #[arg(long, env = "BLOCKCACHE_PIN_EVERY")]
    pin_every: Option<usize>,

    /// Seed for the access sequence
    #[arg(long, env = "BLOCKCACHE_SEED")]
    seed: Option<u64>,

    /// Report format
    #[arg(long, value_enum, env = "BLOCKCACHE_FORMAT", default_value = "text")]
    format: OutputFormat,

    /// Include the per-shard descriptor listing in the report
    #[arg(long, env = "BLOCKCACHE_DUMP_SHARDS")]
    dump_shards: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,
}

impl Args {
    /// Settings file (or defaults) with command-line overrides applied
    fn settings(&self) -> Result<Settings> {
        let mut settings = match &self.config {
            Some(path) => Settings::load(path)?,
            None => Settings::default(),
        };

        let cache = &mut settings.cache;
        override_with(&mut cache.shard_count, self.shards);
        override_with(&mut cache.buffer_count, self.buffers);
        override_with(&mut cache.block_size, self.block_size);

        let workload = &mut settings.workload;
        override_with(&mut workload.dev, self.dev);
        override_with(&mut workload.threads, self.threads);
        override_with(&mut workload.ops_per_thread, self.ops);
        override_with(&mut workload.hot_blocks, self.hot_blocks);
        override_with(&mut workload.private_blocks, self.private_blocks);
        override_with(&mut workload.hot_ratio, self.hot_ratio);
        override_with(&mut workload.write_ratio, self.write_ratio);
        override_with(&mut workload.pin_every, self.pin_every);
        override_with(&mut workload.seed, self.seed);

        settings.validate()?;
        Ok(settings)
    }
}

fn override_with<T>(field: &mut T, value: Option<T>) {
    if let Some(value) = value {
        *field = value;
    }
}

// =============================================================================
// Main
// =============================================================================

fn main() -> Result<()> {
    let args = Args::parse();

    init_logging(&args);

    let settings = args.settings().map_err(|e| {
        error!("Invalid settings: {}", e);
        e
    })?;

    info!("Starting blockcache workload");
    info!(
        "  Cache: {} shards, {} buffers, {} byte blocks",
        settings.cache.shard_count, settings.cache.buffer_count, settings.cache.block_size
    );
    info!(
        "  Workload: {} threads x {} ops",
        settings.workload.threads, settings.workload.ops_per_thread
    );

    let device: Arc<dyn BlockDevice> = match &args.image {
        Some(path) => {
            info!("  Device: image {}", path.display());
            Arc::new(FileDisk::open(
                path,
                settings.workload.dev,
                settings.cache.block_size,
            )?)
        }
        None => {
            info!("  Device: in-memory");
            Arc::new(MemDisk::new(settings.cache.block_size))
        }
    };

    let cache = BlockCache::with_device(settings.cache.clone(), device)?;
    let report = workload::run(&cache, &settings.workload)?;
    let shards = args.dump_shards.then(|| cache.snapshot());

    print_report(args.format, &report, shards.as_ref())?;

    if report.total_corruptions() > 0 {
        error!(
            "{} blocks were served with another block's contents",
            report.total_corruptions()
        );
        std::process::exit(2);
    }
    Ok(())
}

#[derive(Serialize)]
struct JsonOutput<'a> {
    #[serde(flatten)]
    report: &'a WorkloadReport,
    #[serde(skip_serializing_if = "Option::is_none")]
    shards: Option<&'a CacheSnapshot>,
}

fn print_report(
    format: OutputFormat,
    report: &WorkloadReport,
    shards: Option<&CacheSnapshot>,
) -> Result<()> {
    match format {
        OutputFormat::Text => {
            println!("{}", report);
            if let Some(snapshot) = shards {
                for shard in &snapshot.shards {
                    println!(
                        "shard {:>3}: {} lookups, {} skips",
                        shard.index, shard.lookups, shard.skips
                    );
                    for buf in &shard.buffers {
                        let key = buf
                            .key
                            .map_or_else(|| "-".to_string(), |k| k.to_string());
                        println!(
                            "    {:<8} block {:<12} refcnt {:<3} pins {:<3} ts {:<8} valid {}",
                            buf.id, key, buf.refcnt, buf.pins, buf.timestamp, buf.valid
                        );
                    }
                }
            }
        }
        OutputFormat::Json => {
            let output = JsonOutput { report, shards };
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
        OutputFormat::Prometheus => {
            print!("{}", report.cache.to_prometheus()?);
        }
    }
    Ok(())
}

fn init_logging(args: &Args) {
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let filter = EnvFilter::from_default_env().add_directive(level.into());

    // Reports go to stdout, logs to stderr
    if args.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true).with_writer(std::io::stderr))
            .init();
    }
}
