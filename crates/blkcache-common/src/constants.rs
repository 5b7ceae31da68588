//! System-wide constants for the block buffer cache.
//!
//! The defaults follow the classic BSD buffer cache sizing: buffers are
//! addressed in 512-byte device blocks, reserve address space in 16 KiB
//! chunks, and never exceed 64 KiB.

// =============================================================================
// Block and Page Sizes
// =============================================================================

/// Device block size in bytes.
///
/// Device block numbers are expressed in this unit and every buffer's
/// allocated size is a multiple of it.
pub const DEV_BSIZE: usize = 512;

/// Default page size in bytes (4 KB).
pub const PAGE_SIZE: usize = 4 * 1024;

/// Maximum size of a single buffer in bytes (64 KB).
pub const MAXBSIZE: usize = 64 * 1024;

/// Nominal address-space reservation per buffer header (16 KB).
///
/// The default address-space arena is sized at this many bytes per header
/// and reservations are rounded up to it.
pub const BKVASIZE: usize = 16 * 1024;

// =============================================================================
// Pool Sizing
// =============================================================================

/// Default number of buffer headers.
pub const DEFAULT_NBUF: usize = 1024;

/// Minimum number of buffer headers.
pub const MIN_NBUF: usize = 4;

/// Extra dirty buffers allowed above a quarter of the pool.
pub const DIRTY_SLACK: usize = 20;

/// Lower clamp for the in-flight write space high watermark (1 MB).
pub const MIN_HI_RUNNING: usize = 1024 * 1024;

/// Upper clamp for the in-flight write space high watermark (16 MB).
pub const MAX_HI_RUNNING: usize = 16 * 1024 * 1024;

// =============================================================================
// Write-Back
// =============================================================================

/// Maximum bytes gathered into one clustered write (128 KB).
pub const DEFAULT_MAX_CLUSTER_SIZE: usize = 128 * 1024;

/// Interval between periodic write-back daemon passes in milliseconds.
pub const DEFAULT_DAEMON_INTERVAL_MS: u64 = 1_000;

/// Pause after a write-back pass that made no progress, in milliseconds.
pub const DEFAULT_DAEMON_BACKOFF_MS: u64 = 10;

/// Divisor applied to the flush target when retrying with dependency
/// rollback allowed.
pub const DEFAULT_ROLLBACK_DIVISOR: usize = 2;

/// Longest single sleep while waiting on a condition, in milliseconds.
///
/// Waits re-check their deadline and cancellation token at least this often.
pub const WAIT_SLICE_MS: u64 = 10;
