//! # blkcache
//!
//! A block buffer cache fronting block-addressable storage.
//!
//! This crate implements:
//! - A fixed pool of buffer headers, each caching one block range of one
//!   storage object
//! - Per-object registries that guarantee at most one live buffer per block
//! - EMPTY / CLEAN / DIRTY free queues with scan-based reclamation
//! - Delayed (write-back) writes with dirty-count backpressure
//! - An address-space arena with a defragmenting scratch exchange
//! - A write-back daemon that drains the DIRTY queue with a cursor
//!
//! Storage objects hand device requests to an [`io::IoStrategy`]; backing
//! pages come from a [`backing::PageProvider`]; write ordering constraints
//! are consulted through a [`deps::DependencyTracker`].

#![warn(missing_docs)]
#![warn(clippy::all)]

/// Backing page provider
pub mod backing;

/// The buffer cache proper
pub mod buffer;

/// Metadata dependency tracking
pub mod deps;

/// Device requests and completion
pub mod io;

/// Wait policies and cancellation
pub mod sync;

pub use blkcache_common::types::{BlockNo, ObjectId};
pub use buffer::{
    Audit, BufFlags, BufGuard, BufId, BufInfo, BufferCache, CacheConfig, CacheError, CacheResult,
    CacheStats, GetOptions, StorageObject, WriteMode, WritebackDaemon,
};
