//! Buffer cache workload simulator
//!
//! The `blkcache-sim` binary drives a buffer cache with a randomized
//! multi-threaded workload over in-memory devices, then syncs, audits the
//! cache invariants and prints the statistics.
//!
//! # Usage
//!
//! ```bash
//! # Default workload
//! blkcache-sim
//!
//! # Heavier write mix on 8 threads
//! blkcache-sim --threads 8 --write-ratio 0.6
//!
//! # Use configuration file
//! blkcache-sim --config sim.toml
//! ```

mod config;
mod workload;

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use blkcache::{BufferCache, WritebackDaemon};
use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use crate::config::SimConfig;

/// Buffer cache workload simulator
#[derive(Parser, Debug)]
#[command(
    name = "blkcache-sim",
    version,
    about = "Drive the block buffer cache with a randomized workload"
)]
struct Args {
    /// Configuration file path
    #[arg(short = 'c', long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Worker threads
    #[arg(short = 't', long)]
    threads: Option<usize>,

    /// Operations per worker
    #[arg(short = 'n', long)]
    ops: Option<usize>,

    /// Distinct blocks per object
    #[arg(long)]
    blocks: Option<u64>,

    /// Block size in bytes
    #[arg(long)]
    block_size: Option<usize>,

    /// Fraction of operations that write
    #[arg(long)]
    write_ratio: Option<f64>,

    /// Number of buffer headers
    #[arg(long)]
    nbuf: Option<usize>,

    /// Random seed
    #[arg(long)]
    seed: Option<u64>,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, default_value = "info", env = "BLKCACHE_LOG_LEVEL")]
    log_level: String,

    /// Print configuration and exit
    #[arg(long)]
    print_config: bool,
}

fn main() -> Result<()> {
    let args = Args::parse();

    init_logging(&args);

    let config = load_config(&args)?;

    if args.print_config {
        println!("{}", config.to_toml()?);
        return Ok(());
    }

    run(config)
}

fn init_logging(args: &Args) {
    let level = &args.log_level;
    let filter = EnvFilter::try_new(format!("blkcache={level},blkcache_sim={level}"))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_names(true)
        .with_file(false)
        .with_line_number(false)
        .init();
}

fn load_config(args: &Args) -> Result<SimConfig> {
    let mut config = match &args.config {
        Some(path) => SimConfig::from_file(path).context("Failed to load config file")?,
        None => SimConfig::default(),
    };

    if let Some(threads) = args.threads {
        config.threads = threads;
    }
    if let Some(ops) = args.ops {
        config.ops = ops;
    }
    if let Some(blocks) = args.blocks {
        config.blocks = blocks;
    }
    if let Some(size) = args.block_size {
        config.block_size = size;
    }
    if let Some(ratio) = args.write_ratio {
        config.write_ratio = ratio;
    }
    if let Some(seed) = args.seed {
        config.seed = seed;
    }
    if let Some(nbuf) = args.nbuf {
        // watermarks follow the pool size
        let clustering = config.cache.clustering;
        let max_cluster = config.cache.max_cluster_size;
        config.cache = blkcache::CacheConfig::new(nbuf).with_clustering(clustering, max_cluster);
    }

    config.validate()?;
    Ok(config)
}

fn run(config: SimConfig) -> Result<()> {
    info!(
        threads = config.threads,
        ops = config.ops,
        objects = config.objects,
        blocks = config.blocks,
        block_size = config.block_size,
        nbuf = config.cache.nbuf,
        "starting workload"
    );

    let cache = BufferCache::new(config.cache.clone()).context("Failed to create cache")?;
    let objects = workload::create_objects(&config);
    let daemon = WritebackDaemon::spawn(&cache).context("Failed to start write-back daemon")?;

    let report = workload::run(&cache, &objects, &config)?;
    info!(
        ops = report.total(),
        elapsed_ms = report.elapsed.as_millis() as u64,
        ops_per_sec = report.throughput() as u64,
        "workload finished"
    );

    daemon.stop();
    for object in &objects {
        cache
            .flush_object(object)
            .with_context(|| format!("Failed to flush object {}", object.id()))?;
    }
    let written = cache.shutdown().context("Failed to sync cache")?;
    info!(written, "cache synced");

    let stats = cache.stats();
    println!("{}", toml::to_string_pretty(&report)?);
    println!("{}", toml::to_string_pretty(&stats)?);
    info!(hit_ratio = stats.hit_ratio(), "done");

    let audit = cache.audit();
    if !audit.is_consistent() {
        for violation in &audit.violations {
            error!("{violation}");
        }
        bail!("cache audit found {} violations", audit.violations.len());
    }
    Ok(())
}
