//! Exclusive hold on a buffer.

use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

use blkcache_common::types::{BlockNo, ObjectId};
use parking_lot::{MappedMutexGuard, MutexGuard};

use super::cache::{CacheInner, Release};
use super::header::{BufFlags, BufHeader, BufId, BufInfo};
use crate::io::DeviceError;

/// A buffer held exclusively by the current thread.
///
/// Dropping the guard releases the buffer as
/// [`release_keep`](super::BufferCache::release_keep) would. The buffer
/// lock is owned by a thread, so the guard cannot be sent to another one.
pub struct BufGuard {
    inner: Arc<CacheInner>,
    id: BufId,
    recursed: bool,
    released: bool,
    _not_send: PhantomData<*const ()>,
}

impl BufGuard {
    pub(crate) fn new(inner: Arc<CacheInner>, id: BufId, recursed: bool) -> Self {
        Self {
            inner,
            id,
            recursed,
            released: false,
            _not_send: PhantomData,
        }
    }

    fn hdr(&self) -> &BufHeader {
        self.inner.hdr(self.id)
    }

    /// Gives up the guard without releasing the buffer.
    pub(crate) fn into_raw(mut self) -> (BufId, bool) {
        self.released = true;
        (self.id, self.recursed)
    }

    /// Returns the header index.
    pub fn id(&self) -> BufId {
        self.id
    }

    /// Returns true if this is a nested hold on a buffer the thread already
    /// held.
    pub fn is_recursed(&self) -> bool {
        self.recursed
    }

    /// Returns a snapshot of the buffer's identity and flags.
    pub fn info(&self) -> BufInfo {
        self.hdr().info()
    }

    /// Returns the owning object.
    pub fn object(&self) -> Option<ObjectId> {
        self.hdr().state().object_id()
    }

    /// Returns the logical block.
    pub fn block(&self) -> BlockNo {
        self.hdr().state().block
    }

    /// Returns the requested size.
    pub fn size(&self) -> usize {
        self.hdr().state().bcount
    }

    /// Returns the allocated size.
    pub fn alloc_size(&self) -> usize {
        self.hdr().state().bufsize
    }

    /// Returns the current flags.
    pub fn flags(&self) -> BufFlags {
        self.hdr().state().flags
    }

    /// Returns true if the contents match the device (or are newer).
    pub fn is_valid(&self) -> bool {
        self.flags().contains(BufFlags::CACHE)
    }

    /// Returns true if the buffer holds a delayed write.
    pub fn is_delayed(&self) -> bool {
        self.flags().contains(BufFlags::DELWRI)
    }

    /// Returns the error of the last failed I/O.
    pub fn error(&self) -> Option<DeviceError> {
        self.hdr().state().error.clone()
    }

    /// Returns the device block, once resolved.
    pub fn dev_block(&self) -> Option<BlockNo> {
        self.hdr().state().dev_block
    }

    /// Assigns the device block instead of letting the object's strategy
    /// resolve it. Resizing the buffer clears the assignment.
    pub fn set_dev_block(&mut self, dev_block: BlockNo) {
        self.hdr().state().dev_block = Some(dev_block);
    }

    /// Read access to the requested bytes.
    pub fn data(&self) -> MappedMutexGuard<'_, [u8]> {
        MutexGuard::map(self.hdr().state(), |st| {
            let n = st.bcount;
            &mut st.data[..n]
        })
    }

    /// Write access to the requested bytes.
    pub fn data_mut(&mut self) -> MappedMutexGuard<'_, [u8]> {
        MutexGuard::map(self.hdr().state(), |st| {
            let n = st.bcount;
            &mut st.data[..n]
        })
    }

    fn set_flag(&mut self, flag: BufFlags, on: bool) {
        self.hdr().state().flags.set(flag, on);
    }

    /// Places the buffer at the head of CLEAN on its next release.
    pub fn set_age(&mut self, on: bool) {
        self.set_flag(BufFlags::AGE, on);
    }

    /// Discards clean contents on the next release.
    pub fn set_nocache(&mut self, on: bool) {
        self.set_flag(BufFlags::NOCACHE, on);
    }

    /// Marks the buffer as subject to the dependency tracker.
    pub fn set_dependent(&mut self, on: bool) {
        self.set_flag(BufFlags::DEPENDENT, on);
    }

    /// Marks the backing pages as owned by the caller.
    pub fn set_managed(&mut self, on: bool) {
        self.set_flag(BufFlags::MANAGED, on);
    }
}

impl Drop for BufGuard {
    fn drop(&mut self) {
        if !self.released {
            self.released = true;
            self.inner.release_raw(self.id, self.recursed, Release::Keep);
        }
    }
}

impl fmt::Debug for BufGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufGuard")
            .field("id", &self.id)
            .field("recursed", &self.recursed)
            .finish()
    }
}
