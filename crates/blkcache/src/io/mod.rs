//! Device requests and completion.
//!
//! A storage object hands each read or write to its [`IoStrategy`] as an
//! [`IoRequest`]. The device performs the transfer on whatever thread it
//! likes and reports the outcome exactly once through
//! [`IoRequest::complete`]. A request dropped without completion completes
//! itself with [`DeviceError::Dropped`], so a buffer can never be stranded
//! in flight.

mod mem;

pub use mem::{Completion, MemDevice, WriteRecord};

use std::fmt;
use std::sync::Arc;

use blkcache_common::constants::DEV_BSIZE;
use blkcache_common::types::{BlockNo, ObjectId};
use bytes::BytesMut;
use thiserror::Error;

use crate::buffer::{BufId, CacheInner};

/// Direction of a transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IoOp {
    /// Device to memory.
    Read,
    /// Memory to device.
    Write,
}

/// Failure reported by a device.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DeviceError {
    /// A failure that may succeed on retry.
    #[error("transient device error: {0}")]
    Transient(String),

    /// A failure that will not succeed on retry.
    #[error("device failure: {0}")]
    Permanent(String),

    /// The request was dropped without being completed.
    #[error("request dropped without completion")]
    Dropped,
}

impl DeviceError {
    /// Returns true if a retry may succeed.
    pub fn is_transient(&self) -> bool {
        !matches!(self, Self::Permanent(_))
    }
}

impl From<std::io::Error> for DeviceError {
    fn from(e: std::io::Error) -> Self {
        use std::io::ErrorKind;
        match e.kind() {
            ErrorKind::Interrupted | ErrorKind::WouldBlock | ErrorKind::TimedOut => {
                Self::Transient(e.to_string())
            }
            _ => Self::Permanent(e.to_string()),
        }
    }
}

/// Outcome of a transfer.
pub type IoStatus = Result<(), DeviceError>;

/// The device layer behind a storage object.
pub trait IoStrategy: Send + Sync {
    /// Starts a transfer. The request must eventually be completed or
    /// dropped.
    fn strategy(&self, request: IoRequest);

    /// Maps a logical block to a device block.
    ///
    /// The default lays blocks of `size` bytes out back to back.
    fn resolve_block(&self, object: ObjectId, block: BlockNo, size: usize) -> BlockNo {
        let _ = object;
        let per_block = i64::try_from(size.max(DEV_BSIZE) / DEV_BSIZE).unwrap_or(1);
        BlockNo::new(block.as_i64().saturating_mul(per_block))
    }
}

/// A read or write of one buffer, or of a cluster of adjacent buffers.
pub struct IoRequest {
    op: IoOp,
    object: ObjectId,
    block: BlockNo,
    payload: BytesMut,
    members: Vec<BufId>,
    sink: Option<Arc<CacheInner>>,
}

impl IoRequest {
    pub(crate) fn new(
        op: IoOp,
        object: ObjectId,
        block: BlockNo,
        payload: BytesMut,
        members: Vec<BufId>,
        sink: Arc<CacheInner>,
    ) -> Self {
        Self {
            op,
            object,
            block,
            payload,
            members,
            sink: Some(sink),
        }
    }

    /// Returns the transfer direction.
    pub fn op(&self) -> IoOp {
        self.op
    }

    /// Returns the object the transfer belongs to.
    pub fn object(&self) -> ObjectId {
        self.object
    }

    /// Returns the first device block, in [`DEV_BSIZE`] units.
    pub fn block(&self) -> BlockNo {
        self.block
    }

    /// Returns the transfer length in bytes.
    pub fn len(&self) -> usize {
        self.payload.len()
    }

    /// Returns true for a zero-length transfer.
    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }

    /// Returns the number of buffers covered.
    pub fn buffer_count(&self) -> usize {
        self.members.len()
    }

    /// Returns the bytes to write, or the read destination.
    pub fn data(&self) -> &[u8] {
        &self.payload
    }

    /// Returns the read destination.
    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.payload
    }

    /// Reports the outcome of the transfer.
    pub fn complete(mut self, status: IoStatus) {
        self.finish(status);
    }

    fn finish(&mut self, status: IoStatus) {
        if let Some(sink) = self.sink.take() {
            let payload = std::mem::take(&mut self.payload).freeze();
            let members = std::mem::take(&mut self.members);
            sink.complete_io(self.op, &members, payload, status);
        }
    }
}

impl Drop for IoRequest {
    fn drop(&mut self) {
        self.finish(Err(DeviceError::Dropped));
    }
}

impl fmt::Debug for IoRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IoRequest")
            .field("op", &self.op)
            .field("object", &self.object)
            .field("block", &self.block)
            .field("len", &self.payload.len())
            .field("buffers", &self.members.len())
            .finish()
    }
}
