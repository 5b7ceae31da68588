//! Randomized multi-threaded workload.

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Result};
use blkcache::io::MemDevice;
use blkcache::{
    BlockNo, BufferCache, CacheError, GetOptions, ObjectId, StorageObject, WriteMode,
};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use tracing::{debug, warn};

use crate::config::SimConfig;

/// Per-run operation counts.
#[derive(Debug, Clone, Default, Serialize)]
pub struct WorkloadReport {
    /// Blocks read through the cache.
    pub reads: u64,
    /// Blocks dirtied and left for write-back.
    pub delayed_writes: u64,
    /// Blocks written synchronously.
    pub sync_writes: u64,
    /// Blocks invalidated.
    pub invalidations: u64,
    /// Operations that failed with a retryable error.
    pub retryable_errors: u64,
    /// Wall-clock duration.
    #[serde(skip)]
    pub elapsed: Duration,
}

impl WorkloadReport {
    fn merge(&mut self, other: &Self) {
        self.reads += other.reads;
        self.delayed_writes += other.delayed_writes;
        self.sync_writes += other.sync_writes;
        self.invalidations += other.invalidations;
        self.retryable_errors += other.retryable_errors;
    }

    /// Returns the total number of operations.
    pub fn total(&self) -> u64 {
        self.reads + self.delayed_writes + self.sync_writes + self.invalidations
    }

    /// Returns operations per second.
    pub fn throughput(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs > 0.0 {
            self.total() as f64 / secs
        } else {
            0.0
        }
    }
}

/// Creates the storage objects, each on its own in-memory device.
pub fn create_objects(config: &SimConfig) -> Vec<Arc<StorageObject>> {
    (0..config.objects)
        .map(|i| StorageObject::new(ObjectId::new(i + 1), Arc::new(MemDevice::new())))
        .collect()
}

/// Runs the workload to completion on `config.threads` workers.
///
/// Writers block once the dirty count reaches its high watermark, so a
/// write-back daemon must be running on `cache`.
pub fn run(
    cache: &BufferCache,
    objects: &[Arc<StorageObject>],
    config: &SimConfig,
) -> Result<WorkloadReport> {
    let start = Instant::now();
    let results: Vec<Result<WorkloadReport>> = thread::scope(|s| {
        let workers: Vec<_> = (0..config.threads)
            .map(|t| s.spawn(move || worker(cache, objects, config, t as u64)))
            .collect();
        workers
            .into_iter()
            .map(|w| w.join().map_err(|_| anyhow!("worker panicked"))?)
            .collect()
    });

    let mut report = WorkloadReport::default();
    for result in results {
        report.merge(&result?);
    }
    report.elapsed = start.elapsed();
    Ok(report)
}

fn worker(
    cache: &BufferCache,
    objects: &[Arc<StorageObject>],
    config: &SimConfig,
    index: u64,
) -> Result<WorkloadReport> {
    let mut rng = StdRng::seed_from_u64(config.seed.wrapping_add(index));
    let mut report = WorkloadReport::default();
    let opts = GetOptions::new();
    let size = config.block_size;

    for _ in 0..config.ops {
        let object = &objects[rng.gen_range(0..objects.len())];
        let block = BlockNo::new(rng.gen_range(0..config.blocks) as i64);
        let roll: f64 = rng.gen();

        let outcome = if roll < config.invalidate_ratio {
            cache.get(object, block, size, &opts).map(|buf| {
                cache.invalidate(buf);
                report.invalidations += 1;
            })
        } else if roll < config.invalidate_ratio + config.write_ratio {
            let sync = rng.gen_bool(config.sync_ratio);
            write_block(cache, object, block, size, index, sync).map(|()| {
                if sync {
                    report.sync_writes += 1;
                } else {
                    report.delayed_writes += 1;
                }
            })
        } else {
            cache.read(object, block, size, &opts).map(|buf| {
                cache.release_keep(buf);
                report.reads += 1;
            })
        };

        match outcome {
            Ok(()) => {}
            Err(e) if e.is_retryable() => {
                warn!(worker = index, %block, error = %e, "operation failed");
                report.retryable_errors += 1;
            }
            Err(e) => return Err(e.into()),
        }
    }
    debug!(worker = index, ops = report.total(), "worker finished");
    Ok(report)
}

fn write_block(
    cache: &BufferCache,
    object: &Arc<StorageObject>,
    block: BlockNo,
    size: usize,
    stamp: u64,
    sync: bool,
) -> Result<(), CacheError> {
    let mut buf = cache.read(object, block, size, &GetOptions::new())?;
    {
        let mut data = buf.data_mut();
        let n = data.len().min(8);
        data[..n].copy_from_slice(&stamp.to_le_bytes()[..n]);
    }
    if sync {
        cache.write(buf, WriteMode::Sync)
    } else {
        cache.delayed_write(buf)
    }
}
