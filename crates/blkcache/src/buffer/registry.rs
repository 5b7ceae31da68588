//! Storage objects and their buffer registries.
//!
//! Every storage object owns a registry mapping logical block numbers to
//! the one live buffer caching that block, plus the set of blocks whose
//! buffers hold delayed writes. Binding a block that is already bound fails
//! instead of overwriting: the losing caller drops its freshly prepared
//! header and restarts its lookup.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use blkcache_common::types::{BlockNo, ObjectId};
use parking_lot::{Mutex, MutexGuard};

use super::header::BufId;
use crate::io::{DeviceError, IoStrategy};

/// The block is already bound to another buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BindConflict {
    /// The buffer already bound to the block.
    pub existing: BufId,
}

#[derive(Debug, Default)]
struct Registry {
    blocks: BTreeMap<BlockNo, BufId>,
    dirty: BTreeSet<BlockNo>,
}

/// Marker for an object lock taken with a blocking acquire.
#[derive(Debug)]
pub(crate) struct Blocking;

/// Marker for an object lock taken with a try-lock.
///
/// The flusher never waits on an object, so it only accepts guards of this
/// kind.
#[derive(Debug)]
pub(crate) struct NonBlocking;

/// Held object lock. Always taken while holding a buffer lock.
pub(crate) struct ObjectLockGuard<'a, M> {
    _guard: MutexGuard<'a, ()>,
    _mode: PhantomData<M>,
}

impl<M> fmt::Debug for ObjectLockGuard<'_, M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObjectLockGuard")
            .field("mode", &std::any::type_name::<M>())
            .finish()
    }
}

/// A storage object: a file, device or region owning cached blocks.
pub struct StorageObject {
    id: ObjectId,
    strategy: Arc<dyn IoStrategy>,
    registry: Mutex<Registry>,
    lock: Mutex<()>,
    dying: AtomicBool,
    write_error: Mutex<Option<(BlockNo, DeviceError)>>,
}

impl StorageObject {
    /// Creates an object whose I/O goes to `strategy`.
    pub fn new(id: ObjectId, strategy: Arc<dyn IoStrategy>) -> Arc<Self> {
        Arc::new(Self {
            id,
            strategy,
            registry: Mutex::new(Registry::default()),
            lock: Mutex::new(()),
            dying: AtomicBool::new(false),
            write_error: Mutex::new(None),
        })
    }

    /// Returns the object ID.
    #[inline]
    pub fn id(&self) -> ObjectId {
        self.id
    }

    /// Returns the device strategy.
    pub fn strategy(&self) -> &Arc<dyn IoStrategy> {
        &self.strategy
    }

    /// Looks up the buffer bound to `block`.
    pub fn lookup(&self, block: BlockNo) -> Option<BufId> {
        self.registry.lock().blocks.get(&block).copied()
    }

    /// Binds `block` to `buf`.
    pub fn bind(&self, block: BlockNo, buf: BufId) -> Result<(), BindConflict> {
        let mut reg = self.registry.lock();
        if let Some(&existing) = reg.blocks.get(&block) {
            return Err(BindConflict { existing });
        }
        reg.blocks.insert(block, buf);
        Ok(())
    }

    /// Unbinds `block` if it is bound to `buf`.
    ///
    /// Returns false if the block was bound elsewhere or not at all.
    pub fn unbind(&self, block: BlockNo, buf: BufId) -> bool {
        let mut reg = self.registry.lock();
        if reg.blocks.get(&block) != Some(&buf) {
            return false;
        }
        reg.blocks.remove(&block);
        reg.dirty.remove(&block);
        true
    }

    /// Moves `block` onto the object's dirty list.
    pub(crate) fn mark_dirty(&self, block: BlockNo) {
        self.registry.lock().dirty.insert(block);
    }

    /// Moves `block` onto the object's clean list.
    pub(crate) fn mark_clean(&self, block: BlockNo) {
        self.registry.lock().dirty.remove(&block);
    }

    /// Returns the blocks holding delayed writes, in increasing order.
    pub fn dirty_blocks(&self) -> Vec<BlockNo> {
        self.registry.lock().dirty.iter().copied().collect()
    }

    /// Returns every bound block, in increasing order.
    pub fn blocks(&self) -> Vec<BlockNo> {
        self.registry.lock().blocks.keys().copied().collect()
    }

    /// Returns the number of bound buffers.
    pub fn buffer_count(&self) -> usize {
        self.registry.lock().blocks.len()
    }

    /// Returns the number of buffers holding delayed writes.
    pub fn dirty_count(&self) -> usize {
        self.registry.lock().dirty.len()
    }

    /// Acquires the object lock, sleeping if necessary.
    pub(crate) fn lock(&self) -> ObjectLockGuard<'_, Blocking> {
        ObjectLockGuard {
            _guard: self.lock.lock(),
            _mode: PhantomData,
        }
    }

    /// Acquires the object lock only if it is free.
    pub(crate) fn try_lock(&self) -> Option<ObjectLockGuard<'_, NonBlocking>> {
        self.lock.try_lock().map(|guard| ObjectLockGuard {
            _guard: guard,
            _mode: PhantomData,
        })
    }

    /// Returns true once teardown has begun.
    pub fn is_dying(&self) -> bool {
        self.dying.load(Ordering::Acquire)
    }

    pub(crate) fn begin_teardown(&self) {
        self.dying.store(true, Ordering::Release);
    }

    /// Records an asynchronous write failure for the next flush to report.
    ///
    /// Only the first failure is kept.
    pub(crate) fn record_write_error(&self, block: BlockNo, error: DeviceError) {
        let mut slot = self.write_error.lock();
        if slot.is_none() {
            *slot = Some((block, error));
        }
    }

    /// Takes the recorded asynchronous write failure, if any.
    pub fn take_write_error(&self) -> Option<(BlockNo, DeviceError)> {
        self.write_error.lock().take()
    }
}

impl fmt::Debug for StorageObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let reg = self.registry.lock();
        f.debug_struct("StorageObject")
            .field("id", &self.id)
            .field("buffers", &reg.blocks.len())
            .field("dirty", &reg.dirty.len())
            .field("dying", &self.is_dying())
            .finish()
    }
}
