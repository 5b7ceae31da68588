//! Metadata dependency tracking.
//!
//! A file system that orders metadata writes (soft updates) may attach
//! dependencies to buffers. The cache never interprets them: it only asks
//! whether a buffer has pending dependencies, in which case the reclaimer
//! and the flusher skip it, and, when the flusher is allowed to, asks the
//! tracker to roll one back so the buffer can be written anyway.

use crate::buffer::BufInfo;

/// Write-ordering constraints attached to buffers.
///
/// Only buffers flagged [`BufFlags::DEPENDENT`](crate::buffer::BufFlags)
/// are offered to the tracker.
pub trait DependencyTracker: Send + Sync {
    /// Returns true if `buf` must not be written or discarded yet.
    fn has_pending(&self, buf: &BufInfo) -> bool;

    /// Attempts to roll back `buf`'s dependencies so it can be written.
    ///
    /// Returns true if the buffer may now be written.
    fn rollback_one(&self, buf: &BufInfo) -> bool;
}

/// A tracker for systems without write-ordering constraints.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoDependencies;

impl DependencyTracker for NoDependencies {
    fn has_pending(&self, _buf: &BufInfo) -> bool {
        false
    }

    fn rollback_one(&self, _buf: &BufInfo) -> bool {
        true
    }
}
