//! Buffer cache errors.

use blkcache_common::types::{BlockNo, ObjectId};
use thiserror::Error;

use crate::io::DeviceError;

/// Result type for buffer cache operations.
pub type CacheResult<T> = Result<T, CacheError>;

/// Errors that can occur during buffer cache operations.
///
/// Consistency violations (releasing a buffer that is not held, completing
/// an I/O twice, double-queueing a buffer) are not represented here: they
/// panic.
#[derive(Debug, Error)]
#[allow(missing_docs)] // Fields are documented by variant docs
pub enum CacheError {
    /// The operation would have to sleep and the caller asked it not to.
    #[error("operation would block waiting for {what}")]
    WouldBlock { what: &'static str },

    /// A wait exceeded the caller's timeout.
    #[error("timed out waiting for {what}")]
    Timeout { what: &'static str },

    /// A wait was aborted by the caller's cancellation token.
    #[error("interrupted while waiting for {what}")]
    Interrupted { what: &'static str },

    /// No buffer header could be reclaimed.
    #[error("no reclaimable buffer headers")]
    NoBuffers,

    /// Buffer space or address space is exhausted.
    #[error("out of buffer space: need {needed} bytes")]
    NoSpace { needed: usize },

    /// A lookup-only acquire found no cached buffer.
    #[error("block {block} of object {object} is not cached")]
    NotCached { object: ObjectId, block: BlockNo },

    /// Requested buffer size is outside the supported range.
    #[error("invalid buffer size {size} (maximum {max})")]
    InvalidSize { size: usize, max: usize },

    /// The buffer is in a state that does not permit the operation.
    #[error("buffer {block} of object {object}: {reason}")]
    InvalidBuffer {
        object: ObjectId,
        block: BlockNo,
        reason: &'static str,
    },

    /// The storage object is being torn down.
    #[error("object {object} is being torn down")]
    ObjectTornDown { object: ObjectId },

    /// The device reported a failure.
    #[error("I/O error on block {block} of object {object}: {source}")]
    Io {
        object: ObjectId,
        block: BlockNo,
        #[source]
        source: DeviceError,
    },

    /// Configuration error.
    #[error("configuration error: {message}")]
    Config { message: String },

    /// The cache is shutting down.
    #[error("buffer cache is shutting down")]
    ShuttingDown,

    /// The write-back daemon thread could not be started.
    #[error("failed to start write-back daemon: {0}")]
    Spawn(#[from] std::io::Error),
}

impl CacheError {
    /// Creates a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Creates an I/O error with buffer context.
    pub fn io(object: ObjectId, block: BlockNo, source: DeviceError) -> Self {
        Self::Io {
            object,
            block,
            source,
        }
    }

    /// Returns true if this is a transient error that can be retried.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::WouldBlock { .. }
            | Self::Timeout { .. }
            | Self::Interrupted { .. }
            | Self::NoBuffers
            | Self::NoSpace { .. } => true,
            Self::Io { source, .. } => source.is_transient(),
            _ => false,
        }
    }

    /// Returns the device error, if this is an I/O failure.
    pub fn device_error(&self) -> Option<&DeviceError> {
        match self {
            Self::Io { source, .. } => Some(source),
            _ => None,
        }
    }
}
