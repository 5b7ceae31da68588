//! # blkcache-common
//!
//! Identifier types and constants shared by the block buffer cache crates.
//!
//! - **Types**: `ObjectId` (a storage object such as a file or device) and
//!   `BlockNo` (a logical or device block number)
//! - **Constants**: device block size, page size, buffer size limits and the
//!   defaults the cache derives its watermarks from
//!
//! ## Example
//!
//! ```rust
//! use blkcache_common::types::{BlockNo, ObjectId};
//! use blkcache_common::constants::DEV_BSIZE;
//!
//! let object = ObjectId::new(7);
//! let block = BlockNo::new(12);
//! assert_eq!(block.byte_offset(DEV_BSIZE), 12 * DEV_BSIZE as u64);
//! assert!(object.is_valid());
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod constants;
pub mod types;

pub use constants::*;
