//! Buffer headers - the fixed pool of cache slots.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;

use bitflags::bitflags;
use blkcache_common::types::{BlockNo, ObjectId};
use parking_lot::{Condvar, Mutex, MutexGuard};
use serde::{Deserialize, Serialize};

use super::kva::KvaRange;
use super::lock::BufLock;
use super::registry::StorageObject;
use crate::backing::PageRef;
use crate::io::{DeviceError, IoOp};

/// Buffer identifier - index into the cache's header array.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BufId(pub u32);

impl BufId {
    /// Invalid buffer ID.
    pub const INVALID: Self = Self(u32::MAX);

    /// Creates a new buffer ID.
    #[inline]
    pub const fn new(id: u32) -> Self {
        Self(id)
    }

    /// Returns the raw index.
    #[inline]
    pub const fn index(self) -> usize {
        self.0 as usize
    }

    /// Checks if this is a valid buffer ID.
    #[inline]
    pub const fn is_valid(self) -> bool {
        self.0 != u32::MAX
    }
}

bitflags! {
    /// Buffer state flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
    pub struct BufFlags: u32 {
        /// Contents are valid; a hit needs no device read.
        const CACHE = 1 << 0;
        /// Contents are invalid; release strips the buffer.
        const INVAL = 1 << 1;
        /// Holds data not yet written to the device.
        const DELWRI = 1 << 2;
        /// The in-progress I/O completes asynchronously and releases the
        /// buffer itself.
        const ASYNC = 1 << 3;
        /// The dependency tracker may hold ordering constraints for this
        /// buffer.
        const DEPENDENT = 1 << 4;
        /// Release places the buffer at the head of CLEAN.
        const AGE = 1 << 5;
        /// Data lives in separately accounted heap memory, not pages.
        const MALLOC = 1 << 6;
        /// Backing pages belong to the caller and are never freed here.
        const MANAGED = 1 << 7;
        /// Discard the contents on the next release.
        const NOCACHE = 1 << 8;
        /// Last I/O completed.
        const DONE = 1 << 9;
        /// Last I/O failed.
        const ERROR = 1 << 10;
        /// A write is in flight.
        const WRITING = 1 << 11;
        /// A failed asynchronous write; requeue at the head of DIRTY.
        const REQUEUE = 1 << 12;
    }
}

/// Free queue a buffer sits on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum QueueKind {
    /// Held by a caller (or in flight).
    None = 0,
    /// No data and no identity.
    Empty = 1,
    /// Valid or discardable data.
    Clean = 2,
    /// Delayed-write data.
    Dirty = 3,
}

impl QueueKind {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => Self::Empty,
            2 => Self::Clean,
            3 => Self::Dirty,
            _ => Self::None,
        }
    }

    /// Returns true for the queues counted as free buffers.
    pub fn is_free(self) -> bool {
        matches!(self, Self::Empty | Self::Clean)
    }
}

/// Snapshot of a buffer's identity, passed to collaborators.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BufInfo {
    /// Header index.
    pub id: BufId,
    /// Owning object, if bound.
    pub object: Option<ObjectId>,
    /// Logical block number.
    pub block: BlockNo,
    /// Device block number, once resolved.
    pub dev_block: Option<BlockNo>,
    /// Requested size in bytes.
    pub size: usize,
    /// Allocated size in bytes.
    pub alloc_size: usize,
    /// Flags at the time of the snapshot.
    pub flags: BufFlags,
}

/// Mutable buffer state, protected by the header mutex.
pub(crate) struct BufState {
    pub(crate) flags: BufFlags,
    pub(crate) object: Option<Arc<StorageObject>>,
    pub(crate) block: BlockNo,
    pub(crate) dev_block: Option<BlockNo>,
    /// Requested size.
    pub(crate) bcount: usize,
    /// Allocated size, a multiple of the minimum device block.
    pub(crate) bufsize: usize,
    pub(crate) kva: Option<KvaRange>,
    pub(crate) pages: Vec<PageRef>,
    pub(crate) data: Vec<u8>,
    pub(crate) io: Option<IoOp>,
    pub(crate) error: Option<DeviceError>,
    pub(crate) write_failures: u8,
}

impl BufState {
    fn new() -> Self {
        Self {
            flags: BufFlags::INVAL,
            object: None,
            block: BlockNo::new(0),
            dev_block: None,
            bcount: 0,
            bufsize: 0,
            kva: None,
            pages: Vec::new(),
            data: Vec::new(),
            io: None,
            error: None,
            write_failures: 0,
        }
    }

    pub(crate) fn object_id(&self) -> Option<ObjectId> {
        self.object.as_ref().map(|o| o.id())
    }

    pub(crate) fn is_bound_to(&self, object: &StorageObject, block: BlockNo) -> bool {
        self.block == block
            && !self.flags.contains(BufFlags::INVAL)
            && self.object.as_ref().is_some_and(|o| o.id() == object.id())
    }

    pub(crate) fn info(&self, id: BufId) -> BufInfo {
        BufInfo {
            id,
            object: self.object_id(),
            block: self.block,
            dev_block: self.dev_block,
            size: self.bcount,
            alloc_size: self.bufsize,
            flags: self.flags,
        }
    }

    pub(crate) fn kva_size(&self) -> usize {
        self.kva.map_or(0, |k| k.size())
    }
}

/// A buffer header.
///
/// Each header has:
/// - An exclusive, owner-tracking lock
/// - Mutable state (identity, flags, sizes, data) behind a mutex
/// - A condition variable signalled when I/O completes
/// - A queue tag and a pending-removal mark, both written under the lock
///   of the queue the buffer sits on
pub struct BufHeader {
    id: BufId,
    pub(crate) lock: BufLock,
    state: Mutex<BufState>,
    io_done: Condvar,
    queue: AtomicU8,
    remove_pending: AtomicBool,
}

impl BufHeader {
    /// Creates an empty, invalid header.
    pub(crate) fn new(id: BufId) -> Self {
        Self {
            id,
            lock: BufLock::new(),
            state: Mutex::new(BufState::new()),
            io_done: Condvar::new(),
            queue: AtomicU8::new(QueueKind::None as u8),
            remove_pending: AtomicBool::new(false),
        }
    }

    /// Returns the buffer ID.
    #[inline]
    pub fn id(&self) -> BufId {
        self.id
    }

    #[inline]
    pub(crate) fn state(&self) -> MutexGuard<'_, BufState> {
        self.state.lock()
    }

    /// Returns the queue the buffer is on.
    #[inline]
    pub fn queue(&self) -> QueueKind {
        QueueKind::from_u8(self.queue.load(Ordering::Acquire))
    }

    #[inline]
    pub(crate) fn set_queue(&self, kind: QueueKind) {
        self.queue.store(kind as u8, Ordering::Release);
    }

    /// Returns true if a scan has selected this buffer for removal.
    #[inline]
    pub fn is_remove_pending(&self) -> bool {
        self.remove_pending.load(Ordering::Acquire)
    }

    #[inline]
    pub(crate) fn set_remove_pending(&self, pending: bool) {
        self.remove_pending.store(pending, Ordering::Release);
    }

    pub(crate) fn info(&self) -> BufInfo {
        self.state().info(self.id)
    }

    /// Waits until the in-progress I/O has completed.
    pub(crate) fn wait_io(&self) -> Result<(), DeviceError> {
        let mut st = self.state();
        while !st.flags.contains(BufFlags::DONE) {
            self.io_done.wait(&mut st);
        }
        if st.flags.contains(BufFlags::ERROR) {
            Err(st.error.clone().unwrap_or(DeviceError::Dropped))
        } else {
            Ok(())
        }
    }

    pub(crate) fn notify_io_done(&self) {
        self.io_done.notify_all();
    }
}

impl fmt::Debug for BufHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let st = self.state();
        f.debug_struct("BufHeader")
            .field("id", &self.id)
            .field("object", &st.object_id())
            .field("block", &st.block)
            .field("bcount", &st.bcount)
            .field("bufsize", &st.bufsize)
            .field("flags", &st.flags)
            .field("queue", &self.queue())
            .field("locked", &self.lock.is_locked())
            .finish()
    }
}
