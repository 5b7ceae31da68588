//! Core identifier types.
//!
//! These types wrap raw integers so an object identity can never be passed
//! where a block number is expected, and vice versa.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Storage object identifier.
///
/// A storage object is anything that owns a set of cached blocks: a file,
/// a raw device, a metadata region. Each object has its own buffer registry.
///
/// # Example
///
/// ```rust
/// use blkcache_common::types::ObjectId;
///
/// let object = ObjectId::new(3);
/// assert_eq!(object.as_u64(), 3);
/// ```
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(transparent)]
pub struct ObjectId(u64);

impl ObjectId {
    /// Invalid object ID, used as a sentinel value.
    pub const INVALID: Self = Self(u64::MAX);

    /// Creates a new `ObjectId` from a raw u64 value.
    #[inline]
    #[must_use]
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    /// Returns the raw u64 value.
    #[inline]
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// Checks if this is a valid object ID.
    #[inline]
    #[must_use]
    pub const fn is_valid(self) -> bool {
        self.0 != Self::INVALID.0
    }
}

impl fmt::Debug for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if *self == Self::INVALID {
            write!(f, "ObjectId(INVALID)")
        } else {
            write!(f, "ObjectId({})", self.0)
        }
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for ObjectId {
    #[inline]
    fn from(id: u64) -> Self {
        Self::new(id)
    }
}

/// Block number.
///
/// Used both for logical block numbers (the index of a block within its
/// storage object) and for device block numbers (in units of
/// [`DEV_BSIZE`](crate::constants::DEV_BSIZE)). Logical numbers may be
/// negative: file systems use negative numbers for indirect blocks.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(transparent)]
pub struct BlockNo(i64);

impl BlockNo {
    /// Creates a new `BlockNo` from a raw i64 value.
    #[inline]
    #[must_use]
    pub const fn new(block: i64) -> Self {
        Self(block)
    }

    /// Returns the raw i64 value.
    #[inline]
    #[must_use]
    pub const fn as_i64(self) -> i64 {
        self.0
    }

    /// Returns the block `delta` positions away.
    #[inline]
    #[must_use]
    pub const fn offset(self, delta: i64) -> Self {
        Self(self.0.saturating_add(delta))
    }

    /// Returns the next block number.
    #[inline]
    #[must_use]
    pub const fn next(self) -> Self {
        self.offset(1)
    }

    /// Returns the byte offset of this block for the given block size.
    ///
    /// Negative block numbers map to offset zero.
    #[inline]
    #[must_use]
    #[allow(clippy::cast_sign_loss)]
    pub const fn byte_offset(self, block_size: usize) -> u64 {
        if self.0 < 0 {
            0
        } else {
            self.0 as u64 * block_size as u64
        }
    }
}

impl fmt::Debug for BlockNo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BlockNo({})", self.0)
    }
}

impl fmt::Display for BlockNo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i64> for BlockNo {
    #[inline]
    fn from(block: i64) -> Self {
        Self::new(block)
    }
}

impl From<BlockNo> for i64 {
    #[inline]
    fn from(block: BlockNo) -> Self {
        block.0
    }
}
