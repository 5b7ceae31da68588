//! Multi-threaded buffer cache tests
//!
//! Many threads acquiring, dirtying, writing and invalidating overlapping
//! blocks while the write-back daemon runs. Each test ends with an audit of
//! the queue and counter invariants on the quiesced cache.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use blkcache::io::MemDevice;
use blkcache::{
    BlockNo, BufferCache, CacheConfig, GetOptions, ObjectId, StorageObject, WriteMode,
    WritebackDaemon,
};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

// ============================================================================
// Helpers
// ============================================================================

const BLOCK: usize = 4096;

fn fast_daemon(config: CacheConfig) -> CacheConfig {
    config.with_daemon_timing(Duration::from_millis(5), Duration::from_millis(1))
}

fn assert_quiesced(cache: &BufferCache) {
    let audit = cache.audit();
    assert!(audit.is_consistent(), "violations: {:?}", audit.violations);
    assert_eq!(audit.held, 0);
    assert_eq!(audit.dirty_counter, 0);
    assert_eq!(
        audit.empty + audit.clean + audit.dirty,
        cache.config().nbuf
    );
}

fn version_of(data: &[u8]) -> u64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&data[..8]);
    u64::from_le_bytes(bytes)
}

// ============================================================================
// Uniqueness
// ============================================================================

#[test]
fn test_concurrent_get_binds_each_block_once() {
    const THREADS: usize = 8;
    const ITERS: usize = 200;
    const BLOCKS: usize = 8;

    let cache = BufferCache::new(CacheConfig::new(64)).unwrap();
    let obj = StorageObject::new(ObjectId::new(1), Arc::new(MemDevice::new()));
    let holders: Vec<AtomicUsize> = (0..BLOCKS).map(|_| AtomicUsize::new(0)).collect();

    thread::scope(|s| {
        for t in 0..THREADS {
            let cache = &cache;
            let obj = &obj;
            let holders = &holders;
            s.spawn(move || {
                let mut rng = StdRng::seed_from_u64(t as u64);
                for _ in 0..ITERS {
                    let b = rng.gen_range(0..BLOCKS);
                    let buf = cache
                        .get(obj, BlockNo::new(b as i64), BLOCK, &GetOptions::new())
                        .unwrap();
                    assert_eq!(holders[b].fetch_add(1, Ordering::SeqCst), 0);
                    assert_eq!(buf.block(), BlockNo::new(b as i64));
                    thread::yield_now();
                    holders[b].fetch_sub(1, Ordering::SeqCst);
                    cache.release_keep(buf);
                }
            });
        }
    });

    let stats = cache.stats();
    assert_eq!(stats.misses, BLOCKS as u64);
    assert_eq!(stats.hits + stats.misses, (THREADS * ITERS) as u64);
    assert_eq!(obj.buffer_count(), BLOCKS);
    for b in 0..BLOCKS {
        assert!(cache.lookup(&obj, BlockNo::new(b as i64)).is_some());
    }
    assert_quiesced(&cache);
}

#[test]
fn test_nested_get_on_same_thread_recurses() {
    let cache = BufferCache::new(CacheConfig::new(8)).unwrap();
    let obj = StorageObject::new(ObjectId::new(1), Arc::new(MemDevice::new()));

    let outer = cache
        .get(&obj, BlockNo::new(3), BLOCK, &GetOptions::new())
        .unwrap();
    let inner = cache
        .get(&obj, BlockNo::new(3), BLOCK, &GetOptions::new())
        .unwrap();
    assert!(inner.is_recursed());
    assert_eq!(inner.id(), outer.id());
    cache.release_keep(inner);
    assert_eq!(cache.audit().held, 1);
    cache.release_keep(outer);
    assert_quiesced(&cache);
}

// ============================================================================
// Mixed workload
// ============================================================================

#[test]
fn test_random_workload_keeps_queues_disjoint() {
    const THREADS: u64 = 4;
    const OPS: usize = 1500;
    const BLOCKS: i64 = 120;
    const SIZES: [usize; 4] = [1024, 2048, 4096, 8192];

    let config = fast_daemon(CacheConfig::new(48));
    let cache = BufferCache::new(config).unwrap();
    let objects: Vec<Arc<StorageObject>> = (1..=2)
        .map(|i| StorageObject::new(ObjectId::new(i), Arc::new(MemDevice::new())))
        .collect();
    let daemon = WritebackDaemon::spawn(&cache).unwrap();

    thread::scope(|s| {
        for t in 0..THREADS {
            let cache = &cache;
            let objects = &objects;
            s.spawn(move || {
                let mut rng = StdRng::seed_from_u64(42 + t);
                for _ in 0..OPS {
                    let obj = &objects[rng.gen_range(0..objects.len())];
                    let block = BlockNo::new(rng.gen_range(0..BLOCKS));
                    let size = SIZES[rng.gen_range(0..SIZES.len())];
                    let opts = GetOptions::new();
                    match rng.gen_range(0..6) {
                        0 => {
                            let buf = cache.read(obj, block, size, &opts).unwrap();
                            cache.release_keep(buf);
                        }
                        1 => {
                            let mut buf = cache.get(obj, block, size, &opts).unwrap();
                            buf.data_mut().fill(t as u8);
                            cache.delayed_write(buf).unwrap();
                        }
                        2 => {
                            let mut buf = cache.get(obj, block, size, &opts).unwrap();
                            buf.data_mut().fill(t as u8);
                            cache.write(buf, WriteMode::Async).unwrap();
                        }
                        3 => {
                            let buf = cache.get(obj, block, size, &opts).unwrap();
                            cache.invalidate(buf);
                        }
                        4 => {
                            let mut buf = cache.get(obj, block, size, &opts).unwrap();
                            buf.set_age(true);
                            cache.release_reuse(buf);
                        }
                        _ => {
                            let buf = cache.read(obj, block, size, &opts).unwrap();
                            cache.write(buf, WriteMode::Sync).unwrap();
                        }
                    }
                }
            });
        }
    });

    daemon.stop();
    cache.sync_all().unwrap();
    assert_quiesced(&cache);

    let space = cache.space();
    assert_eq!(space.runningspace, 0);
    assert!(space.bufspace <= cache.config().hi_bufspace);
}

// ============================================================================
// No lost writes
// ============================================================================

#[test]
fn test_delayed_writes_survive_eviction_and_flushing() {
    const THREADS: usize = 4;
    const PER_THREAD: i64 = 24;
    const ITERS: usize = 400;

    let config = fast_daemon(CacheConfig::new(24).with_dirty_watermarks(6, 12));
    let cache = BufferCache::new(config).unwrap();
    let dev = Arc::new(MemDevice::new());
    let obj = StorageObject::new(ObjectId::new(9), dev.clone());
    let daemon = WritebackDaemon::spawn(&cache).unwrap();

    let finals: Vec<Vec<u64>> = thread::scope(|s| {
        let handles: Vec<_> = (0..THREADS)
            .map(|t| {
                let cache = &cache;
                let obj = &obj;
                s.spawn(move || {
                    // each thread owns a disjoint range and tracks the
                    // version it last wrote to every block
                    let base = t as i64 * PER_THREAD;
                    let mut expected = vec![0u64; PER_THREAD as usize];
                    let mut rng = StdRng::seed_from_u64(t as u64);
                    for _ in 0..ITERS {
                        let i = rng.gen_range(0..PER_THREAD) as usize;
                        let block = BlockNo::new(base + i as i64);
                        let mut buf = cache.read(obj, block, BLOCK, &GetOptions::new()).unwrap();
                        assert_eq!(version_of(&buf.data()), expected[i], "block {block}");
                        expected[i] += 1;
                        buf.data_mut()[..8].copy_from_slice(&expected[i].to_le_bytes());
                        cache.delayed_write(buf).unwrap();
                        if rng.gen_bool(0.05) {
                            cache.flush(4);
                        }
                    }
                    expected
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    daemon.stop();
    cache.sync_all().unwrap();
    assert_quiesced(&cache);

    for (t, expected) in finals.iter().enumerate() {
        for (i, version) in expected.iter().enumerate() {
            let block = t as i64 * PER_THREAD + i as i64;
            let sectors_per_block = (BLOCK / 512) as i64;
            let raw = dev.read_raw(obj.id(), BlockNo::new(block * sectors_per_block), BLOCK);
            assert_eq!(version_of(&raw), *version, "block {block}");
        }
    }
    // far more blocks than buffers: evicted blocks came back from the device
    assert!(cache.stats().reads > THREADS as u64 * PER_THREAD as u64);
}

#[test]
fn test_daemon_drains_while_writers_block_on_watermark() {
    const THREADS: usize = 3;

    let config = fast_daemon(CacheConfig::new(32).with_dirty_watermarks(4, 8));
    let cache = BufferCache::new(config).unwrap();
    let obj = StorageObject::new(ObjectId::new(2), Arc::new(MemDevice::new()));
    let daemon = WritebackDaemon::spawn(&cache).unwrap();
    let peak = AtomicUsize::new(0);

    thread::scope(|s| {
        for t in 0..THREADS {
            let cache = &cache;
            let obj = &obj;
            let peak = &peak;
            s.spawn(move || {
                for i in 0..40 {
                    let block = BlockNo::new((t * 100 + i) as i64);
                    let buf = cache.get(obj, block, BLOCK, &GetOptions::new()).unwrap();
                    cache.delayed_write(buf).unwrap();
                    peak.fetch_max(cache.space().dirty_buffers, Ordering::Relaxed);
                }
            });
        }
    });

    // a writer passes the watermark check before marking, so each thread
    // can overshoot by at most one
    assert!(peak.load(Ordering::Relaxed) <= 8 + THREADS);
    daemon.stop();
    cache.sync_all().unwrap();
    assert_quiesced(&cache);
}
