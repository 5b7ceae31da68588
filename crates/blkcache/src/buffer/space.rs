//! Global space accounting.
//!
//! Tracks, each against its watermarks:
//! - `bufspace`: bytes of buffer data committed (page- and malloc-backed)
//! - `kvaspace`: bytes of address space reserved by headers
//! - `mallocspace`: bytes of small malloc-backed buffers
//! - `runningspace`: bytes of writes in flight
//! - the dirty buffer count and the free (EMPTY + CLEAN) buffer count
//!
//! Counters are atomics. Sleepers wait on one of three channels (space,
//! dirty, running), each a mutex-protected waiter count plus a condition
//! variable, and are woken when the relevant counter falls.

use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};

use super::config::CacheConfig;
use super::error::CacheResult;
use crate::sync::Sleeper;

/// A sleep/wakeup channel.
#[derive(Debug, Default)]
struct WaitChannel {
    waiters: Mutex<usize>,
    cv: Condvar,
}

impl WaitChannel {
    fn wait_until(&self, ready: impl Fn() -> bool, sleeper: &Sleeper<'_>) -> CacheResult<()> {
        let mut waiters = self.waiters.lock();
        while !ready() {
            *waiters += 1;
            let slept = sleeper.sleep(&self.cv, &mut waiters);
            *waiters -= 1;
            slept?;
        }
        Ok(())
    }

    /// Like `wait_until`, but returns after at most one sleep so the caller
    /// can act between wakeups.
    fn wait_once(&self, ready: impl Fn() -> bool, sleeper: &Sleeper<'_>) -> CacheResult<()> {
        let mut waiters = self.waiters.lock();
        if ready() {
            return Ok(());
        }
        *waiters += 1;
        let slept = sleeper.sleep(&self.cv, &mut waiters);
        *waiters -= 1;
        slept
    }

    fn wake(&self) {
        let waiters = self.waiters.lock();
        if *waiters > 0 {
            self.cv.notify_all();
        }
    }
}

/// Point-in-time copy of the counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpaceSnapshot {
    /// Committed buffer data bytes.
    pub bufspace: usize,
    /// Reserved address-space bytes.
    pub kvaspace: usize,
    /// Malloc-backed buffer bytes.
    pub mallocspace: usize,
    /// In-flight write bytes.
    pub runningspace: usize,
    /// Buffers holding delayed writes.
    pub dirty_buffers: usize,
    /// Buffers on EMPTY or CLEAN.
    pub free_buffers: usize,
}

/// Space accountant.
pub struct SpaceAccountant {
    hi_bufspace: usize,
    lo_bufspace: usize,
    hi_dirty: usize,
    lo_dirty: usize,
    hi_running: usize,
    lo_running: usize,
    max_malloc: usize,

    bufspace: AtomicUsize,
    kvaspace: AtomicUsize,
    mallocspace: AtomicUsize,
    runningspace: AtomicUsize,
    dirty: AtomicUsize,
    free: AtomicUsize,

    space_wait: WaitChannel,
    dirty_wait: WaitChannel,
    running_wait: WaitChannel,
}

impl SpaceAccountant {
    /// Creates an accountant with the configured watermarks.
    pub fn new(config: &CacheConfig) -> Self {
        Self {
            hi_bufspace: config.hi_bufspace,
            lo_bufspace: config.lo_bufspace,
            hi_dirty: config.hi_dirty,
            lo_dirty: config.lo_dirty,
            hi_running: config.hi_running,
            lo_running: config.lo_running,
            max_malloc: config.max_malloc_space,
            bufspace: AtomicUsize::new(0),
            kvaspace: AtomicUsize::new(0),
            mallocspace: AtomicUsize::new(0),
            runningspace: AtomicUsize::new(0),
            dirty: AtomicUsize::new(0),
            free: AtomicUsize::new(0),
            space_wait: WaitChannel::default(),
            dirty_wait: WaitChannel::default(),
            running_wait: WaitChannel::default(),
        }
    }

    // =========================================================================
    // Buffer space
    // =========================================================================

    /// Commits `size` bytes unless that would exceed the high watermark.
    pub fn try_reserve_bufspace(&self, size: usize) -> bool {
        try_add(&self.bufspace, size, self.hi_bufspace)
    }

    /// Returns `size` committed bytes.
    pub fn release_bufspace(&self, size: usize) {
        if size > 0 {
            sub(&self.bufspace, size, "bufspace");
            self.space_wait.wake();
        }
    }

    /// Returns committed buffer bytes.
    pub fn bufspace(&self) -> usize {
        self.bufspace.load(Ordering::Acquire)
    }

    /// Returns true if reclamation should run before `need` more bytes are
    /// committed.
    pub fn needs_reclaim(&self, need: usize) -> bool {
        self.bufspace() + need > self.lo_bufspace
    }

    /// Returns true if `need` more bytes fit under the high watermark.
    pub fn bufspace_fits(&self, need: usize) -> bool {
        self.bufspace() + need <= self.hi_bufspace
    }

    // =========================================================================
    // Address space and malloc space
    // =========================================================================

    /// Accounts `size` bytes of new address-space reservation.
    pub fn add_kva(&self, size: usize) {
        self.kvaspace.fetch_add(size, Ordering::AcqRel);
    }

    /// Accounts `size` bytes of released address space.
    pub fn release_kva(&self, size: usize) {
        if size > 0 {
            sub(&self.kvaspace, size, "kvaspace");
            self.space_wait.wake();
        }
    }

    /// Commits `size` malloc-backed bytes unless the cap would be exceeded.
    pub fn try_reserve_malloc(&self, size: usize) -> bool {
        try_add(&self.mallocspace, size, self.max_malloc)
    }

    /// Returns `size` malloc-backed bytes.
    pub fn release_malloc(&self, size: usize) {
        if size > 0 {
            sub(&self.mallocspace, size, "mallocspace");
        }
    }

    // =========================================================================
    // Running (in-flight) space
    // =========================================================================

    /// Accounts a write of `size` bytes entering the device queue.
    pub fn running_start(&self, size: usize) {
        self.runningspace.fetch_add(size, Ordering::AcqRel);
    }

    /// Accounts a completed write of `size` bytes.
    pub fn running_done(&self, size: usize) {
        if size > 0 {
            sub(&self.runningspace, size, "runningspace");
            self.running_wait.wake();
        }
    }

    /// Returns in-flight write bytes.
    pub fn runningspace(&self) -> usize {
        self.runningspace.load(Ordering::Acquire)
    }

    /// Throttles against in-flight I/O.
    ///
    /// Returns immediately while at or below the high watermark; otherwise
    /// waits for the low watermark.
    pub(crate) fn wait_running(&self, sleeper: &Sleeper<'_>) -> CacheResult<()> {
        if self.runningspace() <= self.hi_running {
            return Ok(());
        }
        self.running_wait
            .wait_until(|| self.runningspace() <= self.lo_running, sleeper)
    }

    /// Waits until no writes are in flight.
    pub(crate) fn wait_running_idle(&self, sleeper: &Sleeper<'_>) -> CacheResult<()> {
        self.running_wait
            .wait_until(|| self.runningspace() == 0, sleeper)
    }

    // =========================================================================
    // Dirty buffers
    // =========================================================================

    /// Counts one more delayed-write buffer and returns the new count.
    pub fn dirty_inc(&self) -> usize {
        self.dirty.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Counts one fewer delayed-write buffer.
    pub fn dirty_dec(&self) {
        let prev = sub(&self.dirty, 1, "dirty buffer count");
        if prev - 1 <= self.lo_dirty {
            self.dirty_wait.wake();
        }
    }

    /// Returns the delayed-write buffer count.
    pub fn dirty(&self) -> usize {
        self.dirty.load(Ordering::Acquire)
    }

    /// Returns true at or above the high dirty watermark.
    pub fn dirty_over_hi(&self) -> bool {
        self.dirty() >= self.hi_dirty
    }

    /// Blocks a writer about to create a delayed write.
    ///
    /// Returns immediately below the high watermark; otherwise waits for
    /// the count to drain to the low watermark.
    pub(crate) fn wait_dirty_room(&self, sleeper: &Sleeper<'_>) -> CacheResult<()> {
        if self.dirty() < self.hi_dirty {
            return Ok(());
        }
        self.dirty_wait
            .wait_until(|| self.dirty() <= self.lo_dirty, sleeper)
    }

    // =========================================================================
    // Free buffers
    // =========================================================================

    /// Counts a buffer entering EMPTY or CLEAN.
    pub fn free_inc(&self) {
        self.free.fetch_add(1, Ordering::AcqRel);
        self.space_wait.wake();
    }

    /// Counts a buffer leaving EMPTY or CLEAN.
    pub fn free_dec(&self) {
        sub(&self.free, 1, "free buffer count");
    }

    /// Returns the free buffer count.
    pub fn free_buffers(&self) -> usize {
        self.free.load(Ordering::Acquire)
    }

    /// Sleeps until `ready` holds, woken whenever space or headers are
    /// returned.
    pub(crate) fn wait_space(
        &self,
        ready: impl Fn() -> bool,
        sleeper: &Sleeper<'_>,
    ) -> CacheResult<()> {
        self.space_wait.wait_until(ready, sleeper)
    }

    /// Sleeps once on the space channel unless `ready` already holds.
    ///
    /// Wakes when space is returned or a buffer enters EMPTY or CLEAN.
    pub(crate) fn wait_space_once(
        &self,
        ready: impl Fn() -> bool,
        sleeper: &Sleeper<'_>,
    ) -> CacheResult<()> {
        self.space_wait.wait_once(ready, sleeper)
    }

    /// Returns a copy of every counter.
    pub fn snapshot(&self) -> SpaceSnapshot {
        SpaceSnapshot {
            bufspace: self.bufspace(),
            kvaspace: self.kvaspace.load(Ordering::Acquire),
            mallocspace: self.mallocspace.load(Ordering::Acquire),
            runningspace: self.runningspace(),
            dirty_buffers: self.dirty(),
            free_buffers: self.free_buffers(),
        }
    }
}

impl std::fmt::Debug for SpaceAccountant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SpaceAccountant")
            .field("counters", &self.snapshot())
            .finish()
    }
}

fn try_add(counter: &AtomicUsize, size: usize, limit: usize) -> bool {
    counter
        .fetch_update(Ordering::AcqRel, Ordering::Acquire, |cur| {
            cur.checked_add(size).filter(|&next| next <= limit)
        })
        .is_ok()
}

/// Subtracts from a counter, returning the previous value.
///
/// # Panics
///
/// Panics if the counter would go negative.
fn sub(counter: &AtomicUsize, size: usize, what: &str) -> usize {
    match counter.fetch_update(Ordering::AcqRel, Ordering::Acquire, |cur| {
        cur.checked_sub(size)
    }) {
        Ok(prev) => prev,
        Err(cur) => panic!("{what} underflow: {cur} - {size}"),
    }
}
