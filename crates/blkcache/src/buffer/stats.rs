//! Cache statistics and the invariant audit.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

use super::space::SpaceSnapshot;

/// Event counters updated on the hot paths.
#[derive(Debug, Default)]
pub(crate) struct CacheCounters {
    pub(crate) lookups: AtomicU64,
    pub(crate) hits: AtomicU64,
    pub(crate) misses: AtomicU64,
    pub(crate) collisions: AtomicU64,
    pub(crate) reclaims: AtomicU64,
    pub(crate) header_waits: AtomicU64,
    pub(crate) space_waits: AtomicU64,
    pub(crate) kva_fragmented: AtomicU64,
    pub(crate) defrag_exchanges: AtomicU64,
    pub(crate) reads: AtomicU64,
    pub(crate) writes: AtomicU64,
    pub(crate) async_writes: AtomicU64,
    pub(crate) cluster_writes: AtomicU64,
    pub(crate) clustered_buffers: AtomicU64,
    pub(crate) io_errors: AtomicU64,
    pub(crate) write_retries: AtomicU64,
    pub(crate) delayed: AtomicU64,
    pub(crate) flush_passes: AtomicU64,
    pub(crate) dep_skips: AtomicU64,
    pub(crate) rollbacks: AtomicU64,
    pub(crate) object_busy: AtomicU64,
}

/// Bumps a counter by one.
#[inline]
pub(crate) fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

/// Bumps a counter by `n`.
#[inline]
pub(crate) fn bump_by(counter: &AtomicU64, n: u64) {
    counter.fetch_add(n, Ordering::Relaxed);
}

fn load(counter: &AtomicU64) -> u64 {
    counter.load(Ordering::Relaxed)
}

/// Buffer cache statistics.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CacheStats {
    /// Total acquire lookups.
    pub lookups: u64,
    /// Acquires satisfied by a cached buffer.
    pub hits: u64,
    /// Acquires that bound a new buffer.
    pub misses: u64,
    /// Binds that lost a race and retried.
    pub insert_collisions: u64,
    /// Buffers recycled from EMPTY or CLEAN.
    pub reclaims: u64,
    /// Sleeps waiting for a free header.
    pub header_waits: u64,
    /// Sleeps waiting for buffer or address space.
    pub space_waits: u64,
    /// Address-space reservations that hit fragmentation.
    pub kva_fragmented: u64,
    /// Reservations transferred from a recycled buffer.
    pub defrag_exchanges: u64,
    /// Device reads issued.
    pub reads: u64,
    /// Buffers written.
    pub writes: u64,
    /// Buffers written asynchronously.
    pub async_writes: u64,
    /// Multi-buffer device writes.
    pub cluster_writes: u64,
    /// Buffers written as part of a cluster.
    pub clustered_buffers: u64,
    /// Device requests that failed.
    pub io_errors: u64,
    /// Failed writes that were redirtied for retry.
    pub write_retries: u64,
    /// Transitions into delayed-write state.
    pub delayed_writes: u64,
    /// Flusher passes over DIRTY.
    pub flush_passes: u64,
    /// Dirty buffers skipped for pending dependencies.
    pub dependency_skips: u64,
    /// Dependencies rolled back so a buffer could be written.
    pub dependency_rollbacks: u64,
    /// Dirty buffers skipped because their object was locked.
    pub object_busy: u64,
    /// Buffers on EMPTY.
    pub empty_buffers: usize,
    /// Buffers on CLEAN.
    pub clean_buffers: usize,
    /// Buffers on DIRTY.
    pub dirty_queue: usize,
    /// Space counters at the time of the snapshot.
    pub space: SpaceSnapshot,
}

impl CacheStats {
    pub(crate) fn from_counters(c: &CacheCounters, space: SpaceSnapshot) -> Self {
        Self {
            lookups: load(&c.lookups),
            hits: load(&c.hits),
            misses: load(&c.misses),
            insert_collisions: load(&c.collisions),
            reclaims: load(&c.reclaims),
            header_waits: load(&c.header_waits),
            space_waits: load(&c.space_waits),
            kva_fragmented: load(&c.kva_fragmented),
            defrag_exchanges: load(&c.defrag_exchanges),
            reads: load(&c.reads),
            writes: load(&c.writes),
            async_writes: load(&c.async_writes),
            cluster_writes: load(&c.cluster_writes),
            clustered_buffers: load(&c.clustered_buffers),
            io_errors: load(&c.io_errors),
            write_retries: load(&c.write_retries),
            delayed_writes: load(&c.delayed),
            flush_passes: load(&c.flush_passes),
            dependency_skips: load(&c.dep_skips),
            dependency_rollbacks: load(&c.rollbacks),
            object_busy: load(&c.object_busy),
            space,
            empty_buffers: 0,
            clean_buffers: 0,
            dirty_queue: 0,
        }
    }

    /// Calculates hit ratio.
    pub fn hit_ratio(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

/// Result of [`BufferCache::audit`](super::BufferCache::audit).
///
/// Meaningful only on a quiescent cache: buffers in flight or mid-release
/// show up as transient violations.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Audit {
    /// Buffers held by a caller or in flight.
    pub held: usize,
    /// Buffers on EMPTY.
    pub empty: usize,
    /// Buffers on CLEAN.
    pub clean: usize,
    /// Buffers on DIRTY.
    pub dirty: usize,
    /// Buffers carrying the delayed-write flag, queued or held.
    pub delayed: usize,
    /// The dirty counter.
    pub dirty_counter: usize,
    /// The free counter.
    pub free_counter: usize,
    /// Human-readable invariant violations.
    pub violations: Vec<String>,
}

impl Audit {
    /// Returns true if no invariant was violated.
    pub fn is_consistent(&self) -> bool {
        self.violations.is_empty()
    }
}
