//! Buffer cache benchmarks.

use std::sync::Arc;

use blkcache::io::MemDevice;
use blkcache::{BlockNo, BufferCache, CacheConfig, GetOptions, ObjectId, StorageObject};
use criterion::{black_box, criterion_group, criterion_main, Criterion};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

const BLOCK: usize = 4096;

fn setup(nbuf: usize) -> (BufferCache, Arc<StorageObject>) {
    let cache = BufferCache::new(CacheConfig::new(nbuf)).unwrap();
    let obj = StorageObject::new(ObjectId::new(1), Arc::new(MemDevice::new()));
    (cache, obj)
}

fn get_hit_benchmark(c: &mut Criterion) {
    let (cache, obj) = setup(1024);
    for b in 0..512 {
        let buf = cache.read(&obj, BlockNo::new(b), BLOCK, &GetOptions::new()).unwrap();
        cache.release_keep(buf);
    }
    let mut rng = StdRng::seed_from_u64(42);
    let opts = GetOptions::new();

    c.bench_function("get_hit_512", |b| {
        b.iter(|| {
            let block = BlockNo::new(rng.gen_range(0..512));
            let buf = cache.get(&obj, block, BLOCK, &opts).unwrap();
            black_box(buf.id());
            cache.release_keep(buf);
        })
    });
}

fn get_miss_benchmark(c: &mut Criterion) {
    let (cache, obj) = setup(256);
    let opts = GetOptions::new();
    let mut next = 0i64;

    // every block is new, so each get recycles the oldest clean buffer
    c.bench_function("get_miss_recycle_256", |b| {
        b.iter(|| {
            let buf = cache.get(&obj, BlockNo::new(next), BLOCK, &opts).unwrap();
            next += 1;
            black_box(buf.id());
            cache.release_reuse(buf);
        })
    });
}

fn delayed_write_flush_benchmark(c: &mut Criterion) {
    let config = CacheConfig::new(1024).with_dirty_watermarks(256, 512);
    let cache = BufferCache::new(config).unwrap();
    let obj = StorageObject::new(ObjectId::new(1), Arc::new(MemDevice::new()));
    let opts = GetOptions::new();

    c.bench_function("delayed_write_flush_128", |b| {
        b.iter(|| {
            for blk in 0..128 {
                let mut buf = cache.get(&obj, BlockNo::new(blk), BLOCK, &opts).unwrap();
                buf.data_mut()[0] = blk as u8;
                cache.delayed_write(buf).unwrap();
            }
            black_box(cache.flush(usize::MAX))
        })
    });
}

fn scattered_flush_benchmark(c: &mut Criterion) {
    let config = CacheConfig::new(1024).with_dirty_watermarks(256, 512);
    let cache = BufferCache::new(config).unwrap();
    let obj = StorageObject::new(ObjectId::new(1), Arc::new(MemDevice::new()));
    let opts = GetOptions::new();
    let mut rng = StdRng::seed_from_u64(42);

    c.bench_function("scattered_flush_128", |b| {
        b.iter(|| {
            for _ in 0..128 {
                let blk = rng.gen_range(0..4096);
                let buf = cache.get(&obj, BlockNo::new(blk), BLOCK, &opts).unwrap();
                cache.delayed_write(buf).unwrap();
            }
            black_box(cache.sync_all().unwrap())
        })
    });
}

criterion_group!(
    benches,
    get_hit_benchmark,
    get_miss_benchmark,
    delayed_write_flush_benchmark,
    scattered_flush_benchmark
);
criterion_main!(benches);
