//! Write-back, device error and teardown tests
//!
//! Exercises the public cache API end to end against the in-memory device:
//! dirty-count backpressure, retry of failed writes, error reporting through
//! object flushes, dependency rollback, object teardown and the wait
//! policies of `get`.

use std::collections::HashSet;
use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use blkcache::backing::CountingPages;
use blkcache::deps::DependencyTracker;
use blkcache::io::{DeviceError, MemDevice};
use blkcache::sync::{CancelToken, WaitPolicy};
use blkcache::{
    BlockNo, BufInfo, BufferCache, CacheConfig, CacheError, GetOptions, ObjectId, StorageObject,
    WriteMode,
};
use parking_lot::Mutex;

// ============================================================================
// Helpers
// ============================================================================

const BLOCK: usize = 4096;

fn setup(config: CacheConfig) -> (BufferCache, Arc<MemDevice>, Arc<StorageObject>) {
    let cache = BufferCache::new(config).unwrap();
    let dev = Arc::new(MemDevice::new());
    let obj = StorageObject::new(ObjectId::new(1), dev.clone());
    (cache, dev, obj)
}

fn dirty(cache: &BufferCache, obj: &Arc<StorageObject>, block: i64, fill: u8) {
    let mut buf = cache
        .get(obj, BlockNo::new(block), BLOCK, &GetOptions::new())
        .unwrap();
    buf.data_mut().fill(fill);
    cache.delayed_write(buf).unwrap();
}

fn on_device(dev: &MemDevice, obj: &StorageObject, block: i64) -> Vec<u8> {
    let sectors = (BLOCK / 512) as i64;
    dev.read_raw(obj.id(), BlockNo::new(block * sectors), BLOCK)
}

fn transient() -> DeviceError {
    DeviceError::Transient("bus reset".into())
}

// ============================================================================
// Backpressure
// ============================================================================

#[test]
fn test_writer_blocks_at_high_watermark_until_drained() {
    let config = CacheConfig::new(32)
        .with_dirty_watermarks(5, 10)
        .with_clustering(false, 0);
    let (cache, dev, obj) = setup(config);
    for b in 0..10 {
        dirty(&cache, &obj, b, 1);
    }
    assert_eq!(cache.space().dirty_buffers, 10);

    let done = AtomicBool::new(false);
    thread::scope(|s| {
        let writer = s.spawn(|| {
            let mut buf = cache
                .get(&obj, BlockNo::new(10), BLOCK, &GetOptions::new())
                .unwrap();
            cache.mark_delayed(&mut buf).unwrap();
            done.store(true, Ordering::SeqCst);
            cache.release_keep(buf);
        });

        thread::sleep(Duration::from_millis(100));
        assert!(!done.load(Ordering::SeqCst), "writer passed the high watermark");

        // stands in for the daemon
        assert!(cache.daemon_tick() >= 5);
        writer.join().unwrap();
    });

    assert!(done.load(Ordering::SeqCst));
    assert!(cache.space().dirty_buffers <= 6);
    assert!(dev.writes() >= 5);
    assert!(cache.audit().is_consistent());
}

#[test]
fn test_mark_delayed_nowait_at_watermark() {
    let config = CacheConfig::new(16).with_dirty_watermarks(1, 2);
    let (cache, _dev, obj) = setup(config);
    dirty(&cache, &obj, 0, 1);
    dirty(&cache, &obj, 1, 1);

    let mut buf = cache
        .get(&obj, BlockNo::new(2), BLOCK, &GetOptions::new())
        .unwrap();
    let err = cache
        .mark_delayed_with(&mut buf, &WaitPolicy::nowait())
        .unwrap_err();
    assert!(matches!(err, CacheError::WouldBlock { .. }));
    assert!(!buf.is_delayed());
    cache.release_keep(buf);
    assert_eq!(cache.space().dirty_buffers, 2);
}

// ============================================================================
// Device errors
// ============================================================================

#[test]
fn test_sync_write_retries_transient_failure() {
    let (cache, dev, obj) = setup(CacheConfig::new(16));
    dev.inject_write_faults([transient()]);

    let mut buf = cache
        .get(&obj, BlockNo::new(3), BLOCK, &GetOptions::new())
        .unwrap();
    buf.data_mut().fill(0x5a);
    cache.write(buf, WriteMode::Sync).unwrap();

    assert_eq!(dev.writes(), 1);
    assert_eq!(cache.stats().write_retries, 1);
    assert_eq!(on_device(&dev, &obj, 3), vec![0x5a; BLOCK]);
    let id = cache.lookup(&obj, BlockNo::new(3)).unwrap();
    assert!(!cache.buffer_info(id).unwrap().flags.contains(blkcache::BufFlags::DELWRI));
    assert_eq!(cache.space().dirty_buffers, 0);
}

#[test]
fn test_sync_write_gives_up_after_second_failure() {
    let (cache, dev, obj) = setup(CacheConfig::new(16));
    dev.inject_write_faults([transient(), transient()]);

    let buf = cache
        .get(&obj, BlockNo::new(3), BLOCK, &GetOptions::new())
        .unwrap();
    let err = cache.write(buf, WriteMode::Sync).unwrap_err();
    assert!(matches!(err, CacheError::Io { .. }));
    assert_eq!(err.device_error(), Some(&transient()));
    assert_eq!(dev.writes(), 0);
    // the failed buffer is not left holding stale data
    assert!(cache.lookup(&obj, BlockNo::new(3)).is_none());
    assert!(cache.audit().is_consistent());
}

#[test]
fn test_permanent_failure_is_not_retried() {
    let (cache, dev, obj) = setup(CacheConfig::new(16));
    dev.inject_write_faults([DeviceError::Permanent("medium error".into())]);

    let buf = cache
        .get(&obj, BlockNo::new(0), BLOCK, &GetOptions::new())
        .unwrap();
    let err = cache.write(buf, WriteMode::Sync).unwrap_err();
    assert!(!err.is_retryable());
    assert_eq!(cache.stats().write_retries, 0);
    assert_eq!(cache.stats().io_errors, 1);
}

#[test]
fn test_async_failure_requeued_then_written() {
    let (cache, dev, obj) = setup(CacheConfig::new(16));
    dirty(&cache, &obj, 0, 7);
    dev.inject_write_faults([transient()]);

    assert_eq!(cache.flush(1), 1);
    assert_eq!(dev.writes(), 0);
    assert_eq!(cache.space().dirty_buffers, 1);
    assert_eq!(obj.dirty_count(), 1);

    assert_eq!(cache.flush(1), 1);
    assert_eq!(dev.writes(), 1);
    assert_eq!(cache.space().dirty_buffers, 0);
    assert_eq!(on_device(&dev, &obj, 0), vec![7; BLOCK]);
    assert_eq!(cache.flush_object(&obj).unwrap(), 0);
}

#[test]
fn test_dropped_async_write_reported_by_flush_object() {
    let (cache, dev, obj) = setup(CacheConfig::new(16));
    dirty(&cache, &obj, 4, 1);
    dirty(&cache, &obj, 9, 1);
    dev.inject_write_faults([DeviceError::Permanent("medium error".into())]);

    // block 4 is first on DIRTY
    assert_eq!(cache.flush(1), 1);
    assert!(cache.lookup(&obj, BlockNo::new(4)).is_none());

    match cache.flush_object(&obj) {
        Err(CacheError::Io { block, source, .. }) => {
            assert_eq!(block, BlockNo::new(4));
            assert!(!source.is_transient());
        }
        other => panic!("expected the dropped write to be reported, got {other:?}"),
    }
    // block 9 was still written, and the error is reported once
    assert_eq!(dev.writes(), 1);
    assert_eq!(cache.flush_object(&obj).unwrap(), 0);
}

// ============================================================================
// Dependencies
// ============================================================================

#[derive(Default)]
struct PendingBlocks {
    pending: Mutex<HashSet<i64>>,
}

impl DependencyTracker for PendingBlocks {
    fn has_pending(&self, buf: &BufInfo) -> bool {
        self.pending.lock().contains(&buf.block.as_i64())
    }

    fn rollback_one(&self, buf: &BufInfo) -> bool {
        self.pending.lock().remove(&buf.block.as_i64())
    }
}

#[test]
fn test_sync_all_rolls_back_dependencies() {
    let tracker = Arc::new(PendingBlocks::default());
    let config = CacheConfig::new(16).with_clustering(false, 0);
    let cache =
        BufferCache::with_collaborators(config, Arc::new(CountingPages::new()), tracker.clone())
            .unwrap();
    let dev = Arc::new(MemDevice::new());
    let obj = StorageObject::new(ObjectId::new(1), dev.clone());

    for b in 0..4 {
        let mut buf = cache
            .get(&obj, BlockNo::new(b), BLOCK, &GetOptions::new())
            .unwrap();
        buf.set_dependent(true);
        cache.delayed_write(buf).unwrap();
        tracker.pending.lock().insert(b);
    }

    // a plain daemon pass skips everything, then retries with rollback
    assert_eq!(cache.flush(4), 2);
    assert_eq!(cache.stats().dependency_rollbacks, 2);

    assert_eq!(cache.sync_all().unwrap(), 2);
    assert!(tracker.pending.lock().is_empty());
    assert_eq!(dev.writes(), 4);
    assert_eq!(cache.space().dirty_buffers, 0);
}

#[test]
fn test_pending_dependency_pins_clean_buffer() {
    let tracker = Arc::new(PendingBlocks::default());
    let cache = BufferCache::with_collaborators(
        CacheConfig::new(4),
        Arc::new(CountingPages::new()),
        tracker.clone(),
    )
    .unwrap();
    let obj = StorageObject::new(ObjectId::new(1), Arc::new(MemDevice::new()));

    let mut pinned = cache
        .get(&obj, BlockNo::new(0), BLOCK, &GetOptions::new())
        .unwrap();
    pinned.set_dependent(true);
    cache.release_keep(pinned);
    tracker.pending.lock().insert(0);

    // cycle more blocks than the pool holds
    for b in 1..12 {
        let buf = cache
            .get(&obj, BlockNo::new(b), BLOCK, &GetOptions::new())
            .unwrap();
        cache.release_reuse(buf);
    }
    assert!(cache.lookup(&obj, BlockNo::new(0)).is_some());
}

// ============================================================================
// Teardown
// ============================================================================

#[test]
fn test_teardown_without_flush_discards_dirty_data() {
    let (cache, dev, obj) = setup(CacheConfig::new(16));
    for b in 0..4 {
        dirty(&cache, &obj, b, 3);
    }
    cache.invalidate_object(&obj, false).unwrap();

    assert_eq!(dev.writes(), 0);
    assert_eq!(obj.buffer_count(), 0);
    assert_eq!(cache.space().dirty_buffers, 0);
    assert!(matches!(
        cache.get(&obj, BlockNo::new(0), BLOCK, &GetOptions::new()),
        Err(CacheError::ObjectTornDown { .. })
    ));
    let audit = cache.audit();
    assert!(audit.is_consistent(), "violations: {:?}", audit.violations);
    assert_eq!(audit.empty, 16);
}

#[test]
fn test_teardown_with_flush_writes_first() {
    let (cache, dev, obj) = setup(CacheConfig::new(16));
    for b in 0..4 {
        dirty(&cache, &obj, b, 3);
    }
    cache.invalidate_object(&obj, true).unwrap();

    assert_eq!(dev.writes(), 4);
    for b in 0..4 {
        assert_eq!(on_device(&dev, &obj, b), vec![3; BLOCK]);
    }
    assert_eq!(obj.buffer_count(), 0);
    assert!(cache.audit().is_consistent());
}

#[test]
fn test_shutdown_syncs_and_refuses_acquires() {
    let (cache, dev, obj) = setup(CacheConfig::new(16));
    for b in 0..3 {
        dirty(&cache, &obj, b, 9);
    }
    assert_eq!(cache.shutdown().unwrap(), 3);
    for b in 0..3 {
        assert_eq!(on_device(&dev, &obj, b), vec![9; BLOCK]);
    }
    assert!(matches!(
        cache.get(&obj, BlockNo::new(0), BLOCK, &GetOptions::new()),
        Err(CacheError::ShuttingDown)
    ));
}

// ============================================================================
// Wait policies
// ============================================================================

#[test]
fn test_get_times_out_on_held_buffer() {
    let (cache, _dev, obj) = setup(CacheConfig::new(16));
    let held = cache
        .get(&obj, BlockNo::new(0), BLOCK, &GetOptions::new())
        .unwrap();

    thread::scope(|s| {
        s.spawn(|| {
            let opts = GetOptions::timeout(Duration::from_millis(50));
            let err = cache.get(&obj, BlockNo::new(0), BLOCK, &opts).unwrap_err();
            assert!(matches!(err, CacheError::Timeout { .. }));

            let err = cache
                .get(&obj, BlockNo::new(0), BLOCK, &GetOptions::nowait())
                .unwrap_err();
            assert!(matches!(err, CacheError::WouldBlock { .. }));
        });
    });
    cache.release_keep(held);
}

#[test]
fn test_get_interrupted_by_cancel() {
    let (cache, _dev, obj) = setup(CacheConfig::new(16));
    let held = cache
        .get(&obj, BlockNo::new(0), BLOCK, &GetOptions::new())
        .unwrap();
    let token = CancelToken::new();

    thread::scope(|s| {
        let waiter = s.spawn(|| {
            let opts = GetOptions::new().with_cancel(token.clone());
            cache.get(&obj, BlockNo::new(0), BLOCK, &opts).map(|_| ())
        });
        thread::sleep(Duration::from_millis(50));
        token.cancel();
        let result = waiter.join().unwrap();
        assert!(matches!(result, Err(CacheError::Interrupted { .. })));
    });
    cache.release_keep(held);
    assert!(cache.audit().is_consistent());
}

// ============================================================================
// Configuration files
// ============================================================================

#[test]
fn test_config_loaded_from_file() {
    let config = CacheConfig::new(128)
        .with_dirty_watermarks(10, 40)
        .with_clustering(true, 64 * 1024);
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(config.to_toml().unwrap().as_bytes()).unwrap();

    let text = std::fs::read_to_string(file.path()).unwrap();
    let loaded = CacheConfig::from_toml_str(&text).unwrap();
    assert_eq!(loaded, config);

    let cache = BufferCache::new(loaded).unwrap();
    assert_eq!(cache.config().hi_dirty, 40);
}
