//! Buffer cache.
//!
//! A fixed pool of buffer headers caches block ranges of storage objects.
//! Each header is in exactly one place at a time:
//!
//! ```text
//!                 get (hit)                     get (miss)
//!   ┌──────────┐ ─────────────┐   ┌───────────────────────────┐
//!   │  CLEAN   │              ▼   │                           │
//!   ├──────────┤          ┌──────────┐  release   ┌────────┐  │
//!   │  DIRTY   │ ◄─────── │   held   │ ─────────► │ EMPTY  │ ─┘
//!   ├──────────┤  delayed └──────────┘  invalid   └────────┘
//!   │ (cursor) │  write       │    ▲
//!   └──────────┘              │    │ completion
//!        │ flush              ▼    │
//!        └────────────────► in flight
//! ```
//!
//! # Components
//!
//! - [`StorageObject`]: per-object registry mapping a block to its one
//!   live buffer
//! - `FreeQueues`: EMPTY / CLEAN / DIRTY lists with a flush cursor
//! - [`SpaceAccountant`]: buffer space, address space, in-flight writes and
//!   dirty counts against their watermarks
//! - [`KvaArena`]: address-space reservations for buffer data
//! - [`BufferCache`]: the acquire / release / write contract
//! - [`WritebackDaemon`]: background draining of DIRTY
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use blkcache::{BlockNo, BufferCache, CacheConfig, GetOptions, ObjectId, StorageObject};
//! use blkcache::io::MemDevice;
//!
//! let cache = BufferCache::new(CacheConfig::new(256))?;
//! let object = StorageObject::new(ObjectId::new(1), Arc::new(MemDevice::new()));
//!
//! let mut buf = cache.get(&object, BlockNo::new(0), 4096, &GetOptions::new())?;
//! buf.data_mut().copy_from_slice(&[0u8; 4096]);
//! cache.delayed_write(buf)?;
//! ```

mod cache;
mod config;
mod daemon;
mod error;
mod flush;
mod guard;
mod header;
mod kva;
mod lock;
mod queues;
mod registry;
mod space;
mod stats;

pub(crate) use cache::CacheInner;
pub use cache::{BufferCache, GetOptions, WriteMode};
pub use config::CacheConfig;
pub use daemon::WritebackDaemon;
pub use error::{CacheError, CacheResult};
pub use guard::BufGuard;
pub use header::{BufFlags, BufId, BufInfo, QueueKind};
pub use kva::{Fragmented, KvaArena, KvaRange};
pub use lock::{Acquired, BufLock, LockOwner};
pub use queues::End;
pub use registry::{BindConflict, StorageObject};
pub use space::{SpaceAccountant, SpaceSnapshot};
pub use stats::{Audit, CacheStats};
