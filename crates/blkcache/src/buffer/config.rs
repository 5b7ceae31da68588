//! Buffer cache configuration.
//!
//! Every watermark is derived from the header count by [`CacheConfig::new`]
//! and can be overridden individually. Configurations can be loaded from
//! TOML; fields missing from the file take the values of the default
//! pool size.

use std::time::Duration;

use blkcache_common::constants::{
    BKVASIZE, DEFAULT_DAEMON_BACKOFF_MS, DEFAULT_DAEMON_INTERVAL_MS, DEFAULT_MAX_CLUSTER_SIZE,
    DEFAULT_NBUF, DEFAULT_ROLLBACK_DIVISOR, DEV_BSIZE, DIRTY_SLACK, MAXBSIZE, MAX_HI_RUNNING,
    MIN_HI_RUNNING, MIN_NBUF, PAGE_SIZE,
};
use serde::{Deserialize, Serialize};

use super::error::{CacheError, CacheResult};

/// Configuration for the buffer cache.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Number of buffer headers in the pool.
    pub nbuf: usize,
    /// Backing page size in bytes.
    pub page_size: usize,
    /// Minimum device block size; allocations are multiples of it.
    pub min_block_size: usize,
    /// Maximum size of a single buffer.
    pub max_buffer_size: usize,
    /// Size of the address-space arena backing buffer data.
    pub kva_size: usize,
    /// Granularity of address-space reservations.
    pub kva_quantum: usize,
    /// Buffer space above which clean buffers are reclaimed before more is
    /// committed.
    pub hi_bufspace: usize,
    /// Buffer space that reclamation drains down to.
    pub lo_bufspace: usize,
    /// Dirty buffer count at which the daemon starts and writers block.
    pub hi_dirty: usize,
    /// Dirty buffer count the daemon drains down to.
    pub lo_dirty: usize,
    /// In-flight write bytes above which the daemon throttles itself.
    pub hi_running: usize,
    /// In-flight write bytes at which throttled flushers resume.
    pub lo_running: usize,
    /// Cap on heap memory used by small malloc-backed buffers.
    pub max_malloc_space: usize,
    /// Largest clustered write the flusher will build.
    pub max_cluster_size: usize,
    /// Whether the flusher clusters adjacent dirty buffers.
    pub clustering: bool,
    /// Interval between periodic daemon passes in milliseconds.
    pub daemon_interval_ms: u64,
    /// Pause after a daemon pass that made no progress in milliseconds.
    pub daemon_backoff_ms: u64,
    /// Divisor applied to the flush target on the dependency-rollback
    /// retry pass.
    pub rollback_divisor: usize,
}

impl CacheConfig {
    /// Creates a configuration with `nbuf` headers and derived watermarks.
    pub fn new(nbuf: usize) -> Self {
        let kva_size = nbuf * BKVASIZE;
        let hi_bufspace = (kva_size / 4 * 3)
            .max(kva_size.saturating_sub(MAXBSIZE * 10))
            .max(MAXBSIZE.min(kva_size));
        let hi_dirty = (nbuf / 4 + DIRTY_SLACK).min(nbuf);
        let hi_running =
            round_up(hi_bufspace / 64, MAXBSIZE).clamp(MIN_HI_RUNNING, MAX_HI_RUNNING);
        let lo_running = round_up(hi_running / 3 * 2, MAXBSIZE).min(hi_running);

        Self {
            nbuf,
            page_size: PAGE_SIZE,
            min_block_size: DEV_BSIZE,
            max_buffer_size: MAXBSIZE,
            kva_size,
            kva_quantum: BKVASIZE,
            hi_bufspace,
            lo_bufspace: hi_bufspace / 20 * 19,
            hi_dirty,
            lo_dirty: hi_dirty / 2,
            hi_running,
            lo_running,
            max_malloc_space: hi_bufspace / 20,
            max_cluster_size: DEFAULT_MAX_CLUSTER_SIZE,
            clustering: true,
            daemon_interval_ms: DEFAULT_DAEMON_INTERVAL_MS,
            daemon_backoff_ms: DEFAULT_DAEMON_BACKOFF_MS,
            rollback_divisor: DEFAULT_ROLLBACK_DIVISOR,
        }
    }

    /// Creates a configuration sized for a memory budget in bytes.
    pub fn from_memory_size(memory_bytes: usize) -> Self {
        Self::new((memory_bytes / BKVASIZE).max(MIN_NBUF))
    }

    /// Parses a configuration from TOML.
    pub fn from_toml_str(text: &str) -> CacheResult<Self> {
        let config: Self = toml::from_str(text).map_err(|e| CacheError::config(e.to_string()))?;
        config.validate().map_err(CacheError::config)?;
        Ok(config)
    }

    /// Serializes the configuration to TOML.
    pub fn to_toml(&self) -> CacheResult<String> {
        toml::to_string_pretty(self).map_err(|e| CacheError::config(e.to_string()))
    }

    /// Sets the dirty buffer watermarks.
    pub fn with_dirty_watermarks(mut self, lo: usize, hi: usize) -> Self {
        self.lo_dirty = lo;
        self.hi_dirty = hi;
        self
    }

    /// Sets the buffer space watermarks.
    pub fn with_bufspace_watermarks(mut self, lo: usize, hi: usize) -> Self {
        self.lo_bufspace = lo;
        self.hi_bufspace = hi;
        self
    }

    /// Sets the in-flight write space watermarks.
    pub fn with_running_watermarks(mut self, lo: usize, hi: usize) -> Self {
        self.lo_running = lo;
        self.hi_running = hi;
        self
    }

    /// Sets the address-space arena size and reservation granularity.
    pub fn with_kva(mut self, size: usize, quantum: usize) -> Self {
        self.kva_size = size;
        self.kva_quantum = quantum;
        self
    }

    /// Sets the maximum buffer size.
    pub fn with_max_buffer_size(mut self, size: usize) -> Self {
        self.max_buffer_size = size;
        self
    }

    /// Sets the malloc-backed buffer space cap. Zero disables them.
    pub fn with_max_malloc_space(mut self, size: usize) -> Self {
        self.max_malloc_space = size;
        self
    }

    /// Enables or disables write clustering.
    pub fn with_clustering(mut self, enabled: bool, max_cluster_size: usize) -> Self {
        self.clustering = enabled;
        self.max_cluster_size = max_cluster_size;
        self
    }

    /// Sets the daemon interval and backoff.
    pub fn with_daemon_timing(mut self, interval: Duration, backoff: Duration) -> Self {
        self.daemon_interval_ms = duration_ms(interval);
        self.daemon_backoff_ms = duration_ms(backoff);
        self
    }

    /// Sets the rollback retry divisor.
    pub fn with_rollback_divisor(mut self, divisor: usize) -> Self {
        self.rollback_divisor = divisor;
        self
    }

    /// Returns the daemon interval.
    pub fn daemon_interval(&self) -> Duration {
        Duration::from_millis(self.daemon_interval_ms)
    }

    /// Returns the daemon backoff.
    pub fn daemon_backoff(&self) -> Duration {
        Duration::from_millis(self.daemon_backoff_ms)
    }

    /// Rounds `size` up to the allocation granularity.
    pub fn round_alloc(&self, size: usize) -> usize {
        round_up(size, self.min_block_size)
    }

    /// Returns the number of backing pages for an allocation of `size`.
    pub fn pages_for(&self, size: usize) -> usize {
        size.div_ceil(self.page_size)
    }

    /// Returns true if an allocation of `size` should be malloc-backed.
    pub fn is_malloc_size(&self, size: usize) -> bool {
        self.max_malloc_space > 0 && size > 0 && size < self.page_size / 2
    }

    /// Returns the largest buffer memory this configuration can commit.
    pub fn memory_usage(&self) -> usize {
        self.hi_bufspace
    }

    /// Validates the configuration.
    pub fn validate(&self) -> Result<(), &'static str> {
        if self.nbuf == 0 {
            return Err("nbuf must be > 0");
        }
        if !self.min_block_size.is_power_of_two() {
            return Err("min_block_size must be a power of 2");
        }
        if !self.page_size.is_power_of_two() || self.page_size < self.min_block_size {
            return Err("page_size must be a power of 2 no smaller than min_block_size");
        }
        if self.max_buffer_size == 0 || self.max_buffer_size % self.min_block_size != 0 {
            return Err("max_buffer_size must be a non-zero multiple of min_block_size");
        }
        if self.kva_quantum == 0 || self.kva_quantum % self.min_block_size != 0 {
            return Err("kva_quantum must be a non-zero multiple of min_block_size");
        }
        if self.kva_size < self.max_buffer_size {
            return Err("kva_size must hold at least one maximum-size buffer");
        }
        if self.lo_bufspace > self.hi_bufspace || self.hi_bufspace < self.max_buffer_size {
            return Err("bufspace watermarks must satisfy lo <= hi and hold one maximum-size buffer");
        }
        if self.hi_dirty == 0 || self.lo_dirty >= self.hi_dirty || self.hi_dirty > self.nbuf {
            return Err("dirty watermarks must satisfy lo < hi <= nbuf");
        }
        if self.lo_running > self.hi_running || self.hi_running == 0 {
            return Err("running watermarks must satisfy lo <= hi and hi > 0");
        }
        if self.rollback_divisor == 0 {
            return Err("rollback_divisor must be > 0");
        }
        Ok(())
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self::new(DEFAULT_NBUF)
    }
}

fn round_up(value: usize, to: usize) -> usize {
    value.div_ceil(to) * to
}

fn duration_ms(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}
