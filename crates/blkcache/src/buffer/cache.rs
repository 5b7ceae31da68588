//! The buffer cache: acquire, resize, release, delayed writes and I/O
//! completion.
//!
//! Lock order, outermost first:
//!
//! ```text
//!   buffer lock
//!     object lock          (writes block on it, the flusher only try-locks)
//!       queue lock  ──>  buffer state  ──>  object registry
//! ```
//!
//! The object lock is internal: it serializes writes to one object and is
//! never held while acquiring a buffer. Buffer state is never held while
//! taking a queue lock, and no queue lock is held across a device request.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use blkcache_common::types::{BlockNo, ObjectId};
use bytes::{Bytes, BytesMut};
use tracing::{debug, error, trace, warn};

use super::config::CacheConfig;
use super::daemon::DaemonControl;
use super::error::{CacheError, CacheResult};
use super::guard::BufGuard;
use super::header::{BufFlags, BufHeader, BufId, BufInfo, BufState, QueueKind};
use super::kva::{KvaArena, KvaRange};
use super::lock::{Acquired, LockOwner};
use super::queues::{End, FreeQueues};
use super::registry::StorageObject;
use super::space::{SpaceAccountant, SpaceSnapshot};
use super::stats::{bump, Audit, CacheCounters, CacheStats};
use crate::backing::{CountingPages, PageProvider};
use crate::deps::{DependencyTracker, NoDependencies};
use crate::io::{DeviceError, IoOp, IoRequest, IoStatus};
use crate::sync::{CancelToken, Sleeper, WaitPolicy};

/// Consecutive idle passes before [`BufferCache::sync_all`] gives up on
/// buffers it cannot flush.
const SYNC_IDLE_PASSES: usize = 50;

/// How an acquire behaves on a miss or when it would have to sleep.
#[derive(Debug, Clone, Default)]
pub struct GetOptions {
    wait: WaitPolicy,
    no_create: bool,
}

impl GetOptions {
    /// Blocks as long as necessary and creates the buffer on a miss.
    pub fn new() -> Self {
        Self::default()
    }

    /// Fails with [`CacheError::WouldBlock`] instead of sleeping.
    pub fn nowait() -> Self {
        Self::new().with_wait(WaitPolicy::nowait())
    }

    /// Sleeps at most `timeout` in total.
    pub fn timeout(timeout: Duration) -> Self {
        Self::new().with_wait(WaitPolicy::timeout(timeout))
    }

    /// Replaces the wait policy.
    pub fn with_wait(mut self, wait: WaitPolicy) -> Self {
        self.wait = wait;
        self
    }

    /// Aborts sleeps with [`CacheError::Interrupted`] when `token` fires.
    pub fn with_cancel(mut self, token: CancelToken) -> Self {
        self.wait = self.wait.with_cancel(token);
        self
    }

    /// Fails with [`CacheError::NotCached`] instead of creating a buffer.
    pub fn no_create(mut self) -> Self {
        self.no_create = true;
        self
    }

    /// Returns the wait policy.
    pub fn wait_policy(&self) -> &WaitPolicy {
        &self.wait
    }
}

/// Whether [`BufferCache::write`] waits for the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMode {
    /// Wait for completion and return its status.
    Sync,
    /// Return once the request is issued; completion releases the buffer.
    Async,
}

/// Queue placement hint for a release.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Release {
    /// The caller is done with the buffer; honor the age hint.
    Reuse,
    /// The caller expects to acquire the buffer again soon.
    Keep,
}

/// Shared cache state. Device completions hold a reference to it.
pub(crate) struct CacheInner {
    pub(crate) config: CacheConfig,
    pub(crate) headers: Vec<BufHeader>,
    pub(crate) queues: FreeQueues,
    pub(crate) space: SpaceAccountant,
    pub(crate) arena: KvaArena,
    pub(crate) pages: Arc<dyn PageProvider>,
    pub(crate) deps: Arc<dyn DependencyTracker>,
    pub(crate) control: DaemonControl,
    pub(crate) counters: CacheCounters,
    shutting_down: AtomicBool,
}

/// A block buffer cache.
///
/// Cloning yields another handle to the same cache.
#[derive(Clone)]
pub struct BufferCache {
    pub(crate) inner: Arc<CacheInner>,
}

impl BufferCache {
    /// Creates a cache with counting page backing and no dependency
    /// tracking.
    pub fn new(config: CacheConfig) -> CacheResult<Self> {
        Self::with_collaborators(
            config,
            Arc::new(CountingPages::new()),
            Arc::new(NoDependencies),
        )
    }

    /// Creates a cache with the given page provider and dependency tracker.
    pub fn with_collaborators(
        config: CacheConfig,
        pages: Arc<dyn PageProvider>,
        deps: Arc<dyn DependencyTracker>,
    ) -> CacheResult<Self> {
        config.validate().map_err(CacheError::config)?;
        let nbuf = u32::try_from(config.nbuf)
            .ok()
            .filter(|&n| n < u32::MAX)
            .ok_or_else(|| CacheError::config("nbuf exceeds the header index range"))?;

        let headers = (0..nbuf).map(|i| BufHeader::new(BufId::new(i))).collect();
        let inner = Arc::new(CacheInner {
            queues: FreeQueues::new(config.nbuf),
            space: SpaceAccountant::new(&config),
            arena: KvaArena::new(config.kva_size, config.kva_quantum),
            config,
            headers,
            pages,
            deps,
            control: DaemonControl::new(),
            counters: CacheCounters::default(),
            shutting_down: AtomicBool::new(false),
        });
        for hdr in &inner.headers {
            inner.enqueue(hdr, QueueKind::Empty, End::Tail);
        }
        debug!(nbuf, kva = inner.config.kva_size, "buffer cache initialized");
        Ok(Self { inner })
    }

    /// Returns the configuration.
    pub fn config(&self) -> &CacheConfig {
        &self.inner.config
    }

    // =========================================================================
    // Acquire
    // =========================================================================

    /// Acquires the buffer for `block` of `object`, creating it on a miss.
    ///
    /// The returned buffer is held exclusively until the guard is released.
    /// A new buffer is not valid; use [`read`](Self::read) to fill it from
    /// the device.
    pub fn get(
        &self,
        object: &Arc<StorageObject>,
        block: BlockNo,
        size: usize,
        opts: &GetOptions,
    ) -> CacheResult<BufGuard> {
        self.inner.get(object, block, size, opts)
    }

    /// Acquires the buffer and reads it from the device unless it is
    /// already valid.
    pub fn read(
        &self,
        object: &Arc<StorageObject>,
        block: BlockNo,
        size: usize,
        opts: &GetOptions,
    ) -> CacheResult<BufGuard> {
        let guard = self.get(object, block, size, opts)?;
        if guard.is_valid() {
            return Ok(guard);
        }
        match self.inner.issue_read(guard.id()) {
            Ok(()) => Ok(guard),
            Err(e) => {
                self.invalidate(guard);
                Err(CacheError::io(object.id(), block, e))
            }
        }
    }

    /// Returns the buffer caching `block`, if any, without locking it.
    pub fn lookup(&self, object: &StorageObject, block: BlockNo) -> Option<BufId> {
        object.lookup(block)
    }

    /// Changes the size of a held buffer, sleeping for space as needed.
    ///
    /// On failure the buffer keeps its previous size and contents.
    pub fn resize(&self, guard: &mut BufGuard, size: usize) -> CacheResult<()> {
        self.resize_with(guard, size, &WaitPolicy::blocking())
    }

    /// [`resize`](Self::resize) with an explicit wait policy.
    pub fn resize_with(
        &self,
        guard: &mut BufGuard,
        size: usize,
        policy: &WaitPolicy,
    ) -> CacheResult<()> {
        let hdr = self.inner.hdr(guard.id());
        self.inner.alloc_data(hdr, size, &policy.sleeper("buffer space"))
    }

    // =========================================================================
    // Release
    // =========================================================================

    /// Releases a buffer the caller is done with.
    ///
    /// Invalid, failed and empty buffers are stripped and go to EMPTY,
    /// delayed writes go to DIRTY, everything else to CLEAN (at the head if
    /// aged).
    pub fn release_reuse(&self, guard: BufGuard) {
        let (id, recursed) = guard.into_raw();
        self.inner.release_raw(id, recursed, Release::Reuse);
    }

    /// Releases a buffer the caller expects to acquire again soon.
    pub fn release_keep(&self, guard: BufGuard) {
        let (id, recursed) = guard.into_raw();
        self.inner.release_raw(id, recursed, Release::Keep);
    }

    /// Discards a held buffer's contents, including unwritten data.
    pub fn invalidate(&self, guard: BufGuard) {
        let hdr = self.inner.hdr(guard.id());
        hdr.state()
            .flags
            .insert(BufFlags::INVAL | BufFlags::NOCACHE);
        self.release_reuse(guard);
    }

    // =========================================================================
    // Writes
    // =========================================================================

    /// Marks a held buffer as a delayed write, sleeping while the dirty
    /// count is at its high watermark.
    pub fn mark_delayed(&self, guard: &mut BufGuard) -> CacheResult<()> {
        self.mark_delayed_with(guard, &WaitPolicy::blocking())
    }

    /// [`mark_delayed`](Self::mark_delayed) with an explicit wait policy.
    pub fn mark_delayed_with(&self, guard: &mut BufGuard, policy: &WaitPolicy) -> CacheResult<()> {
        self.inner.mark_delayed(guard.id(), policy)
    }

    /// Marks a buffer as a delayed write and releases it.
    pub fn delayed_write(&self, mut guard: BufGuard) -> CacheResult<()> {
        self.mark_delayed(&mut guard)?;
        self.release_keep(guard);
        Ok(())
    }

    /// Writes a held buffer to the device, consuming the hold.
    ///
    /// # Panics
    ///
    /// Panics if the buffer is held recursively.
    pub fn write(&self, guard: BufGuard, mode: WriteMode) -> CacheResult<()> {
        let (id, recursed) = guard.into_raw();
        assert!(!recursed, "writing a recursively held buffer {id:?}");
        self.inner.write_locked(id, mode)
    }

    // =========================================================================
    // Objects
    // =========================================================================

    /// Synchronously writes every delayed write of `object`.
    ///
    /// Also reports the first asynchronous write failure recorded for the
    /// object since the last flush. Returns the number of buffers written.
    pub fn flush_object(&self, object: &Arc<StorageObject>) -> CacheResult<usize> {
        self.inner.flush_object(object)
    }

    /// Tears `object` down: optionally flushes it, then invalidates every
    /// buffer it owns. Later acquires fail with
    /// [`CacheError::ObjectTornDown`].
    pub fn invalidate_object(&self, object: &Arc<StorageObject>, flush: bool) -> CacheResult<()> {
        if flush {
            self.inner.flush_object(object)?;
        }
        self.inner.invalidate_object(object)
    }

    // =========================================================================
    // Flushing
    // =========================================================================

    /// Runs one flush pass over DIRTY, writing up to `target` buffers.
    pub fn flush(&self, target: usize) -> usize {
        self.inner.flush_pass(target)
    }

    /// Runs one write-back daemon iteration on the calling thread.
    pub fn daemon_tick(&self) -> usize {
        self.inner.daemon_tick()
    }

    /// Asks the write-back daemon to drain urgently.
    pub fn speedup(&self) {
        self.inner.control.speedup();
    }

    /// Writes every delayed write and waits for in-flight writes.
    ///
    /// Buffers held by callers are left alone. Returns the number of
    /// buffers written.
    pub fn sync_all(&self) -> CacheResult<usize> {
        self.inner.sync_all()
    }

    /// Stops accepting acquires, stops the daemon and syncs.
    pub fn shutdown(&self) -> CacheResult<usize> {
        self.inner.shutting_down.store(true, Ordering::Release);
        self.inner.control.shutdown();
        self.inner.sync_all()
    }

    /// Returns true once [`shutdown`](Self::shutdown) has been called.
    pub fn is_shutting_down(&self) -> bool {
        self.inner.is_shutting_down()
    }

    // =========================================================================
    // Introspection
    // =========================================================================

    /// Returns the space counters.
    pub fn space(&self) -> SpaceSnapshot {
        self.inner.space.snapshot()
    }

    /// Returns a snapshot of a buffer's identity and flags.
    pub fn buffer_info(&self, id: BufId) -> Option<BufInfo> {
        self.inner.headers.get(id.index()).map(BufHeader::info)
    }

    /// Returns cache statistics.
    pub fn stats(&self) -> CacheStats {
        let mut stats = CacheStats::from_counters(&self.inner.counters, self.inner.space.snapshot());
        stats.empty_buffers = self.inner.queues.len(QueueKind::Empty);
        stats.clean_buffers = self.inner.queues.len(QueueKind::Clean);
        stats.dirty_queue = self.inner.queues.len(QueueKind::Dirty);
        stats
    }

    /// Checks the buffer invariants. Call on a quiescent cache.
    pub fn audit(&self) -> Audit {
        self.inner.audit()
    }
}

impl fmt::Debug for BufferCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferCache")
            .field("nbuf", &self.inner.config.nbuf)
            .field("space", &self.inner.space)
            .field("queues", &self.inner.queues)
            .finish()
    }
}

impl CacheInner {
    #[inline]
    pub(crate) fn hdr(&self, id: BufId) -> &BufHeader {
        &self.headers[id.index()]
    }

    pub(crate) fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::Acquire)
    }

    fn check_shutdown(&self) -> CacheResult<()> {
        if self.is_shutting_down() {
            Err(CacheError::ShuttingDown)
        } else {
            Ok(())
        }
    }

    pub(crate) fn enqueue(&self, hdr: &BufHeader, kind: QueueKind, end: End) {
        self.queues.insert(hdr, kind, end);
        if kind.is_free() {
            self.space.free_inc();
        }
    }

    pub(crate) fn dequeue(&self, hdr: &BufHeader) -> QueueKind {
        let kind = self.queues.remove(hdr);
        if kind.is_free() {
            self.space.free_dec();
        }
        kind
    }

    // =========================================================================
    // Acquire
    // =========================================================================

    fn get(
        self: &Arc<Self>,
        object: &Arc<StorageObject>,
        block: BlockNo,
        size: usize,
        opts: &GetOptions,
    ) -> CacheResult<BufGuard> {
        self.check_shutdown()?;
        let max = self.config.max_buffer_size;
        if size > max {
            return Err(CacheError::InvalidSize { size, max });
        }
        let sleeper = opts.wait.sleeper("buffer");

        loop {
            if object.is_dying() {
                return Err(CacheError::ObjectTornDown {
                    object: object.id(),
                });
            }
            bump(&self.counters.lookups);

            if let Some((id, acquired)) = self.lock_cached(object, block, &sleeper)? {
                if acquired == Acquired::Recursed {
                    // the outer hold owns the buffer's shape
                    if self.hdr(id).state().bcount != size {
                        self.hdr(id).lock.unlock();
                        return Err(CacheError::InvalidBuffer {
                            object: object.id(),
                            block,
                            reason: "recursive acquire with a different size",
                        });
                    }
                    bump(&self.counters.hits);
                    return Ok(BufGuard::new(Arc::clone(self), id, true));
                }
                let hdr = self.hdr(id);
                let (bcount, flags) = {
                    let st = hdr.state();
                    (st.bcount, st.flags)
                };
                if flags.contains(BufFlags::DELWRI)
                    && (!flags.contains(BufFlags::CACHE) || size > bcount)
                {
                    // unwritten data has to reach the device before the
                    // buffer changes shape
                    debug!(%block, object = %object.id(), "forcing out delayed write before resize");
                    hdr.state().flags.insert(BufFlags::NOCACHE);
                    self.write_locked(id, WriteMode::Sync)?;
                    continue;
                }
                if bcount != size {
                    if let Err(e) = self.alloc_data(hdr, size, &sleeper) {
                        self.release(id, Release::Keep);
                        return Err(e);
                    }
                }
                bump(&self.counters.hits);
                trace!(buf = ?id, %block, object = %object.id(), "cache hit");
                return Ok(BufGuard::new(Arc::clone(self), id, false));
            }

            if opts.no_create {
                return Err(CacheError::NotCached {
                    object: object.id(),
                    block,
                });
            }

            let id = self.getnewbuf(&sleeper)?;
            if let Err(conflict) = object.bind(block, id) {
                bump(&self.counters.collisions);
                trace!(buf = ?id, existing = ?conflict.existing, %block, "lost bind race, retrying");
                self.release(id, Release::Reuse);
                continue;
            }
            let hdr = self.hdr(id);
            {
                let mut st = hdr.state();
                st.object = Some(Arc::clone(object));
                st.block = block;
                st.flags = BufFlags::empty();
                st.dev_block = None;
                st.bcount = 0;
                st.error = None;
                st.io = None;
                st.write_failures = 0;
            }
            if let Err(e) = self.alloc_data(hdr, size, &sleeper) {
                hdr.state().flags.insert(BufFlags::INVAL);
                self.release(id, Release::Reuse);
                return Err(e);
            }
            bump(&self.counters.misses);
            trace!(buf = ?id, %block, object = %object.id(), size, "cache miss");
            return Ok(BufGuard::new(Arc::clone(self), id, false));
        }
    }

    /// Locks the buffer bound to `block`, if any, and takes it off its free
    /// queue. A buffer recycled while we slept on its lock is not returned.
    pub(crate) fn lock_cached(
        &self,
        object: &StorageObject,
        block: BlockNo,
        sleeper: &Sleeper<'_>,
    ) -> CacheResult<Option<(BufId, Acquired)>> {
        loop {
            let Some(id) = object.lookup(block) else {
                return Ok(None);
            };
            let hdr = self.hdr(id);
            let acquired = hdr.lock.lock(sleeper)?;
            if !hdr.state().is_bound_to(object, block) {
                hdr.lock.unlock();
                continue;
            }
            if acquired == Acquired::Exclusive {
                self.dequeue(hdr);
            }
            return Ok(Some((id, acquired)));
        }
    }

    /// Reclaims a header for a new binding. The header comes back locked,
    /// stripped and off every queue, possibly still carrying an address
    /// space reservation.
    fn getnewbuf(&self, sleeper: &Sleeper<'_>) -> CacheResult<BufId> {
        loop {
            if let Some(id) = self.reclaim(&[QueueKind::Empty, QueueKind::Clean], |_| true) {
                return Ok(id);
            }
            bump(&self.counters.header_waits);
            self.control.speedup();
            if self.space.free_buffers() > 0 {
                // free buffers exist but are busy or pinned by dependencies
                sleeper.pause()?;
                continue;
            }
            if self.all_held_by_caller() {
                return Err(CacheError::NoBuffers);
            }
            self.space
                .wait_space(|| self.space.free_buffers() > 0, sleeper)?;
        }
    }

    fn all_held_by_caller(&self) -> bool {
        let me = LockOwner::Thread(thread::current().id());
        self.headers.iter().all(|h| h.lock.owner() == Some(me))
    }

    /// Takes the first reclaimable buffer off `kinds`, in order, strips it
    /// and returns it locked. Address space is kept.
    pub(crate) fn reclaim(
        &self,
        kinds: &[QueueKind],
        mut accept: impl FnMut(&BufState) -> bool,
    ) -> Option<BufId> {
        let mut rejected: Vec<BufId> = Vec::new();
        for &kind in kinds {
            loop {
                let picked = self.queues.select(kind, &self.headers, |hdr| {
                    !rejected.contains(&hdr.id()) && hdr.lock.try_lock()
                });
                let Some(id) = picked else { break };
                let hdr = self.hdr(id);
                let (usable, dependent) = {
                    let st = hdr.state();
                    let usable = !st.flags.intersects(BufFlags::WRITING | BufFlags::DELWRI)
                        && accept(&*st);
                    let dependent = st
                        .flags
                        .contains(BufFlags::DEPENDENT)
                        .then(|| st.info(id));
                    (usable, dependent)
                };
                let usable = usable && dependent.map_or(true, |info| !self.deps.has_pending(&info));
                if !usable {
                    rejected.push(id);
                    self.queues.unmark(hdr);
                    hdr.lock.unlock();
                    continue;
                }
                self.dequeue(hdr);
                self.strip(hdr, false);
                bump(&self.counters.reclaims);
                trace!(buf = ?id, from = ?kind, "reclaimed buffer");
                return Some(id);
            }
        }
        None
    }

    // =========================================================================
    // Backing space
    // =========================================================================

    /// Sizes a held buffer's data for `size` requested bytes.
    pub(crate) fn alloc_data(
        &self,
        hdr: &BufHeader,
        size: usize,
        sleeper: &Sleeper<'_>,
    ) -> CacheResult<()> {
        let max = self.config.max_buffer_size;
        if size > max {
            return Err(CacheError::InvalidSize { size, max });
        }
        let newsize = self.config.round_alloc(size);
        let (oldsize, flags) = {
            let st = hdr.state();
            (st.bufsize, st.flags)
        };
        if newsize == oldsize {
            hdr.state().bcount = size;
            return Ok(());
        }
        if newsize < oldsize {
            self.shrink(hdr, newsize, size);
            return Ok(());
        }

        let delta = newsize - oldsize;
        if self.config.is_malloc_size(newsize)
            && (oldsize == 0 || flags.contains(BufFlags::MALLOC))
            && self.space.try_reserve_malloc(delta)
        {
            if let Err(e) = self.reserve_bufspace(delta, sleeper) {
                self.space.release_malloc(delta);
                return Err(e);
            }
            let mut st = hdr.state();
            st.flags.insert(BufFlags::MALLOC);
            st.data.resize(newsize, 0);
            grown(&mut st, oldsize, newsize, size);
            return Ok(());
        }

        // nothing about the buffer changes until every resource is secured
        self.ensure_kva(hdr, newsize, sleeper)?;
        self.reserve_bufspace(delta, sleeper)?;
        let was_malloc = flags.contains(BufFlags::MALLOC);
        let want = self.config.pages_for(newsize);
        let have = if was_malloc { 0 } else { hdr.state().pages.len() };
        let fresh = if want > have {
            match self.alloc_pages(want - have, sleeper) {
                Ok(pages) => pages,
                Err(e) => {
                    self.space.release_bufspace(delta);
                    return Err(e);
                }
            }
        } else {
            Vec::new()
        };
        let mut st = hdr.state();
        if was_malloc {
            st.flags.remove(BufFlags::MALLOC);
            self.space.release_malloc(oldsize);
        }
        st.pages.extend(fresh);
        st.data.resize(newsize, 0);
        grown(&mut st, oldsize, newsize, size);
        Ok(())
    }

    fn shrink(&self, hdr: &BufHeader, newsize: usize, bcount: usize) {
        let mut st = hdr.state();
        let freed = st.bufsize - newsize;
        if st.flags.contains(BufFlags::MALLOC) {
            self.space.release_malloc(freed);
            if newsize == 0 {
                st.flags.remove(BufFlags::MALLOC);
            }
        } else {
            let keep = self.config.pages_for(newsize);
            if st.pages.len() > keep {
                let tail = st.pages.split_off(keep);
                if !st.flags.contains(BufFlags::MANAGED) {
                    self.pages.free(tail);
                }
            }
        }
        st.data.truncate(newsize);
        st.bufsize = newsize;
        st.bcount = bcount;
        st.dev_block = None;
        self.space.release_bufspace(freed);
    }

    fn reserve_bufspace(&self, need: usize, sleeper: &Sleeper<'_>) -> CacheResult<()> {
        loop {
            if self.space.try_reserve_bufspace(need) {
                return Ok(());
            }
            if self.reclaim_bufspace(need) {
                continue;
            }
            bump(&self.counters.space_waits);
            self.control.speedup();
            // flushed buffers land on CLEAN still holding their space, so
            // reclaim again after every wakeup
            self.space
                .wait_space_once(|| self.space.bufspace_fits(need), sleeper)?;
        }
    }

    /// Discards CLEAN buffers until committed space is back under the low
    /// watermark. Returns true if anything was freed.
    fn reclaim_bufspace(&self, need: usize) -> bool {
        let mut freed = false;
        while self.space.needs_reclaim(need) {
            match self.reclaim(&[QueueKind::Clean], |st| st.bufsize > 0) {
                Some(id) => {
                    self.release(id, Release::Reuse);
                    freed = true;
                }
                None => break,
            }
        }
        if freed {
            debug!(bufspace = self.space.bufspace(), "reclaimed clean buffer space");
        }
        freed
    }

    fn alloc_pages(
        &self,
        count: usize,
        sleeper: &Sleeper<'_>,
    ) -> CacheResult<Vec<crate::backing::PageRef>> {
        loop {
            if let Some(pages) = self.pages.alloc(count) {
                return Ok(pages);
            }
            bump(&self.counters.space_waits);
            self.control.speedup();
            sleeper.pause()?;
        }
    }

    /// Gives a held buffer an address-space reservation of at least `need`
    /// bytes. The buffer keeps its current reservation until a larger one
    /// is secured, so a failed wait leaves it unchanged.
    ///
    /// A fragmented arena is worked around without sleeping whenever an
    /// idle buffer can give up its reservation: first by taking over a
    /// large enough reservation outright, then by recycling idle
    /// reservations so free runs coalesce.
    fn ensure_kva(&self, hdr: &BufHeader, need: usize, sleeper: &Sleeper<'_>) -> CacheResult<()> {
        let need = self.arena.round(need);
        if need > self.arena.capacity() {
            return Err(CacheError::NoSpace { needed: need });
        }
        loop {
            let frag = {
                let mut st = hdr.state();
                if st.kva_size() >= need {
                    return Ok(());
                }
                // our own range counts toward the search
                let attempt = match st.kva {
                    Some(old) => self.arena.exchange(old, need),
                    None => self.arena.reserve(need),
                };
                match attempt {
                    Ok(range) => {
                        self.space.add_kva(range.size());
                        if let Some(old) = st.kva.replace(range) {
                            self.space.release_kva(old.size());
                        }
                        return Ok(());
                    }
                    Err(frag) => frag,
                }
            };
            bump(&self.counters.kva_fragmented);

            if let Some(donor) = self.reclaim(&[QueueKind::Empty, QueueKind::Clean], |st| {
                st.kva_size() >= need
            }) {
                let taken = self.hdr(donor).state().kva.take();
                let prev = std::mem::replace(&mut hdr.state().kva, taken);
                if let Some(prev) = prev {
                    self.release_kva(prev);
                }
                self.release(donor, Release::Reuse);
                bump(&self.counters.defrag_exchanges);
                debug!(buf = ?hdr.id(), donor = ?donor, need, "took over address space from idle buffer");
                return Ok(());
            }

            if let Some(idle) =
                self.reclaim(&[QueueKind::Empty, QueueKind::Clean], |st| st.kva.is_some())
            {
                debug!(buf = ?idle, need, free = frag.free, largest = frag.largest, "recycling idle address space");
                self.release(idle, Release::Reuse);
                continue;
            }

            bump(&self.counters.space_waits);
            self.control.speedup();
            self.space
                .wait_space_once(|| self.arena.largest_free() >= need, sleeper)?;
        }
    }

    fn release_kva(&self, range: KvaRange) {
        self.arena.release(range);
        self.space.release_kva(range.size());
    }

    /// Drops a held buffer's identity and data. Address space is released
    /// only with `free_kva`.
    fn strip(&self, hdr: &BufHeader, free_kva: bool) {
        let mut st = hdr.state();
        if let Some(object) = st.object.take() {
            object.unbind(st.block, hdr.id());
        }
        if st.flags.contains(BufFlags::DELWRI) {
            self.space.dirty_dec();
        }
        if st.flags.contains(BufFlags::MALLOC) {
            self.space.release_malloc(st.bufsize);
        } else if !st.pages.is_empty() {
            let pages = std::mem::take(&mut st.pages);
            if !st.flags.contains(BufFlags::MANAGED) {
                self.pages.free(pages);
            }
        }
        self.space.release_bufspace(st.bufsize);
        if free_kva {
            if let Some(range) = st.kva.take() {
                self.release_kva(range);
            }
        }
        st.data = Vec::new();
        st.bufsize = 0;
        st.bcount = 0;
        st.flags = BufFlags::INVAL;
        st.dev_block = None;
        st.io = None;
        st.error = None;
        st.write_failures = 0;
    }

    // =========================================================================
    // Release
    // =========================================================================

    pub(crate) fn release_raw(&self, id: BufId, recursed: bool, how: Release) {
        let hdr = self.hdr(id);
        if recursed {
            hdr.lock.assert_held();
            hdr.lock.unlock();
        } else {
            self.release(id, how);
        }
    }

    /// Returns a held buffer to the free queue its state calls for and
    /// drops the hold.
    ///
    /// # Panics
    ///
    /// Panics if the buffer is not held by the caller (or in flight).
    pub(crate) fn release(&self, id: BufId, how: Release) {
        let hdr = self.hdr(id);
        hdr.lock.assert_held();

        let mut st = hdr.state();
        let dying = st.object.as_ref().map_or(true, |o| o.is_dying());
        let discard = dying
            || st.bufsize == 0
            || st.flags.contains(BufFlags::INVAL)
            || (!st.flags.contains(BufFlags::DELWRI)
                && st.flags.intersects(BufFlags::NOCACHE | BufFlags::ERROR));

        let (kind, end) = if discard {
            (QueueKind::Empty, End::Head)
        } else if st.flags.contains(BufFlags::DELWRI) {
            if st.flags.contains(BufFlags::REQUEUE) {
                (QueueKind::Dirty, End::Head)
            } else {
                (QueueKind::Dirty, End::Tail)
            }
        } else if how == Release::Reuse && st.flags.contains(BufFlags::AGE) {
            (QueueKind::Clean, End::Head)
        } else {
            (QueueKind::Clean, End::Tail)
        };
        st.flags
            .remove(BufFlags::ASYNC | BufFlags::NOCACHE | BufFlags::AGE | BufFlags::REQUEUE);
        drop(st);

        if discard {
            self.strip(hdr, true);
        }
        self.enqueue(hdr, kind, end);
        hdr.lock.unlock();

        if kind == QueueKind::Dirty && self.space.dirty_over_hi() {
            self.control.request();
        }
    }

    // =========================================================================
    // Delayed writes
    // =========================================================================

    fn mark_delayed(&self, id: BufId, policy: &WaitPolicy) -> CacheResult<()> {
        let hdr = self.hdr(id);
        hdr.lock.assert_held();
        {
            let st = hdr.state();
            if st.flags.contains(BufFlags::DELWRI) {
                return Ok(());
            }
            let object = st.object_id().unwrap_or(ObjectId::INVALID);
            if st.flags.contains(BufFlags::INVAL) || st.object.is_none() {
                return Err(CacheError::InvalidBuffer {
                    object,
                    block: st.block,
                    reason: "buffer is invalid",
                });
            }
            if st.bufsize == 0 {
                return Err(CacheError::InvalidBuffer {
                    object,
                    block: st.block,
                    reason: "buffer has no data",
                });
            }
        }

        if self.space.dirty_over_hi() {
            self.control.speedup();
        }
        self.space
            .wait_dirty_room(&policy.sleeper("dirty buffer room"))?;

        let mut st = hdr.state();
        st.flags.insert(BufFlags::DELWRI | BufFlags::CACHE);
        let len = st.bcount;
        self.pages.mark_dirty(&st.pages, 0..len);
        if let Some(object) = &st.object {
            object.mark_dirty(st.block);
        }
        drop(st);

        let dirty = self.space.dirty_inc();
        bump(&self.counters.delayed);
        if dirty >= self.config.hi_dirty {
            self.control.request();
        }
        Ok(())
    }

    // =========================================================================
    // Device I/O
    // =========================================================================

    /// Writes a held buffer while holding its object's lock.
    pub(crate) fn write_locked(self: &Arc<Self>, id: BufId, mode: WriteMode) -> CacheResult<()> {
        let object = self.hdr(id).state().object.clone();
        match object {
            Some(object) => {
                let _held = object.lock();
                self.issue_write(id, mode)
            }
            None => self.issue_write(id, mode),
        }
    }

    /// Hands a held buffer to its object's device. Consumes the hold: a
    /// synchronous write releases the buffer itself, an asynchronous one
    /// leaves that to the completion.
    pub(crate) fn issue_write(self: &Arc<Self>, id: BufId, mode: WriteMode) -> CacheResult<()> {
        let hdr = self.hdr(id);
        hdr.lock.assert_held();

        let mut st = hdr.state();
        let Some(object) = st.object.clone() else {
            drop(st);
            self.release(id, Release::Reuse);
            return Ok(());
        };
        let block = st.block;
        if st.flags.contains(BufFlags::INVAL) {
            drop(st);
            self.release(id, Release::Reuse);
            return Ok(());
        }
        if object.is_dying() {
            st.flags.insert(BufFlags::INVAL);
            drop(st);
            self.release(id, Release::Reuse);
            debug!(%block, object = %object.id(), "skipping write for torn down object");
            return match mode {
                WriteMode::Sync => Err(CacheError::ObjectTornDown {
                    object: object.id(),
                }),
                WriteMode::Async => Ok(()),
            };
        }

        if st.flags.contains(BufFlags::DELWRI) {
            st.flags.remove(BufFlags::DELWRI);
            self.space.dirty_dec();
            object.mark_clean(block);
        }
        st.flags
            .remove(BufFlags::DONE | BufFlags::ERROR | BufFlags::REQUEUE);
        st.flags.insert(BufFlags::WRITING);
        st.flags.set(BufFlags::ASYNC, mode == WriteMode::Async);
        st.io = Some(IoOp::Write);
        st.error = None;
        let dev = resolve_dev_block(&mut st, &object);
        let payload = BytesMut::from(&st.data[..st.bcount]);
        drop(st);

        self.space.running_start(payload.len());
        bump(&self.counters.writes);
        if mode == WriteMode::Async {
            bump(&self.counters.async_writes);
            hdr.lock.disown();
        }
        object.strategy().strategy(IoRequest::new(
            IoOp::Write,
            object.id(),
            dev,
            payload,
            vec![id],
            Arc::clone(self),
        ));
        if mode == WriteMode::Async {
            return Ok(());
        }

        match hdr.wait_io() {
            Ok(()) => {
                self.release(id, Release::Reuse);
                Ok(())
            }
            Err(e) => {
                let retry = e.is_transient()
                    && hdr.state().write_failures == 1
                    && !object.is_dying();
                if retry {
                    warn!(%block, object = %object.id(), error = %e, "write failed, retrying");
                    bump(&self.counters.write_retries);
                    {
                        let mut st = hdr.state();
                        st.flags.remove(BufFlags::ERROR);
                        st.flags.insert(BufFlags::DELWRI);
                    }
                    self.space.dirty_inc();
                    object.mark_dirty(block);
                    return self.issue_write(id, WriteMode::Sync);
                }
                error!(%block, object = %object.id(), error = %e, "write failed");
                hdr.state().flags.insert(BufFlags::INVAL);
                self.release(id, Release::Reuse);
                Err(CacheError::io(object.id(), block, e))
            }
        }
    }

    /// Reads a held buffer from the device and waits for the result.
    pub(crate) fn issue_read(self: &Arc<Self>, id: BufId) -> Result<(), DeviceError> {
        let hdr = self.hdr(id);
        let mut st = hdr.state();
        let Some(object) = st.object.clone() else {
            return Err(DeviceError::Permanent("buffer has no object".into()));
        };
        st.flags
            .remove(BufFlags::DONE | BufFlags::ERROR | BufFlags::ASYNC);
        st.io = Some(IoOp::Read);
        st.error = None;
        let dev = resolve_dev_block(&mut st, &object);
        let payload = BytesMut::zeroed(st.bcount);
        drop(st);

        bump(&self.counters.reads);
        object.strategy().strategy(IoRequest::new(
            IoOp::Read,
            object.id(),
            dev,
            payload,
            vec![id],
            Arc::clone(self),
        ));
        hdr.wait_io()
    }

    /// Completion of a device request covering `members`.
    ///
    /// # Panics
    ///
    /// Panics if a member's I/O already completed.
    pub(crate) fn complete_io(
        &self,
        op: IoOp,
        members: &[BufId],
        payload: Bytes,
        status: IoStatus,
    ) {
        if op == IoOp::Write {
            self.space.running_done(payload.len());
        }
        if status.is_err() {
            bump(&self.counters.io_errors);
        }

        let mut offset = 0;
        for &id in members {
            let hdr = self.hdr(id);
            let mut st = hdr.state();
            assert!(
                !st.flags.contains(BufFlags::DONE),
                "I/O on buffer {id:?} completed twice"
            );
            st.flags.remove(BufFlags::WRITING);
            st.flags.insert(BufFlags::DONE);
            let len = st.bcount;
            match &status {
                Ok(()) => {
                    if op == IoOp::Read {
                        let end = (offset + len).min(payload.len());
                        if end > offset {
                            st.data[..end - offset].copy_from_slice(&payload[offset..end]);
                        }
                    } else {
                        st.write_failures = 0;
                    }
                    st.flags.insert(BufFlags::CACHE);
                    st.flags.remove(BufFlags::ERROR);
                    st.error = None;
                    self.pages.mark_valid(&st.pages, 0..len);
                }
                Err(e) => {
                    st.flags.insert(BufFlags::ERROR);
                    st.error = Some(e.clone());
                    if op == IoOp::Write {
                        st.write_failures = st.write_failures.saturating_add(1);
                    }
                }
            }
            offset += len;

            if !st.flags.contains(BufFlags::ASYNC) {
                hdr.notify_io_done();
                continue;
            }
            if let Err(e) = &status {
                self.async_write_failed(&mut st, e);
            }
            drop(st);
            self.release(id, Release::Reuse);
        }
    }

    /// A failed asynchronous write is redirtied once; a second failure (or
    /// a permanent one) drops the data and is reported by the next flush of
    /// the object.
    fn async_write_failed(&self, st: &mut BufState, e: &DeviceError) {
        let object = st.object.clone();
        let object_id = st.object_id().unwrap_or(ObjectId::INVALID);
        if e.is_transient() && st.write_failures == 1 && !object.as_ref().map_or(true, |o| o.is_dying()) {
            st.flags.remove(BufFlags::ERROR);
            st.flags.insert(BufFlags::DELWRI | BufFlags::REQUEUE);
            self.space.dirty_inc();
            if let Some(object) = &object {
                object.mark_dirty(st.block);
            }
            bump(&self.counters.write_retries);
            warn!(block = %st.block, object = %object_id, error = %e, "asynchronous write failed, requeued");
        } else {
            st.flags.insert(BufFlags::INVAL);
            if let Some(object) = &object {
                object.record_write_error(st.block, e.clone());
            }
            error!(block = %st.block, object = %object_id, error = %e, "asynchronous write failed, data dropped");
        }
    }

    // =========================================================================
    // Objects
    // =========================================================================

    fn flush_object(self: &Arc<Self>, object: &Arc<StorageObject>) -> CacheResult<usize> {
        let policy = WaitPolicy::blocking();
        let sleeper = policy.sleeper("buffer");
        let mut written = 0;
        let mut first_err = None;

        // a block redirtied after a failed write is picked up by a later
        // pass
        for _ in 0..3 {
            let blocks = object.dirty_blocks();
            if blocks.is_empty() {
                break;
            }
            for block in blocks {
                let Some((id, acquired)) = self.lock_cached(object, block, &sleeper)? else {
                    continue;
                };
                let hdr = self.hdr(id);
                if acquired == Acquired::Recursed {
                    hdr.lock.unlock();
                    continue;
                }
                if !hdr.state().flags.contains(BufFlags::DELWRI) {
                    self.release(id, Release::Keep);
                    continue;
                }
                match self.write_locked(id, WriteMode::Sync) {
                    Ok(()) => written += 1,
                    Err(e) => {
                        first_err.get_or_insert(e);
                    }
                }
            }
        }

        if let Some(e) = first_err {
            return Err(e);
        }
        if let Some((block, e)) = object.take_write_error() {
            return Err(CacheError::io(object.id(), block, e));
        }
        debug!(object = %object.id(), written, "flushed object");
        Ok(written)
    }

    fn invalidate_object(&self, object: &Arc<StorageObject>) -> CacheResult<()> {
        object.begin_teardown();
        let policy = WaitPolicy::blocking();
        let sleeper = policy.sleeper("buffer");
        let mut dropped = 0;
        for block in object.blocks() {
            let Some((id, acquired)) = self.lock_cached(object, block, &sleeper)? else {
                continue;
            };
            let hdr = self.hdr(id);
            hdr.state().flags.insert(BufFlags::INVAL);
            if acquired == Acquired::Recursed {
                hdr.lock.unlock();
                continue;
            }
            self.release(id, Release::Reuse);
            dropped += 1;
        }
        debug!(object = %object.id(), dropped, "invalidated object buffers");
        Ok(())
    }

    fn sync_all(self: &Arc<Self>) -> CacheResult<usize> {
        let mut total = 0;
        let mut idle = 0;
        while self.space.dirty() > 0 && idle < SYNC_IDLE_PASSES {
            let n = self.flush_dirty(usize::MAX, true);
            total += n;
            if n == 0 {
                idle += 1;
                thread::sleep(self.config.daemon_backoff());
            } else {
                idle = 0;
            }
        }
        let policy = WaitPolicy::blocking();
        self.space
            .wait_running_idle(&policy.sleeper("in-flight writes"))?;
        debug!(written = total, remaining = self.space.dirty(), "sync complete");
        Ok(total)
    }

    // =========================================================================
    // Audit
    // =========================================================================

    fn audit(&self) -> Audit {
        let mut audit = Audit::default();
        let min_block = self.config.min_block_size;
        for hdr in &self.headers {
            let id = hdr.id();
            let queue = hdr.queue();
            let locked = hdr.lock.is_locked();
            let st = hdr.state();
            match queue {
                QueueKind::None if locked => audit.held += 1,
                QueueKind::None => audit
                    .violations
                    .push(format!("{id:?} is neither held nor queued")),
                QueueKind::Empty => audit.empty += 1,
                QueueKind::Clean => audit.clean += 1,
                QueueKind::Dirty => audit.dirty += 1,
            }
            if queue != QueueKind::None && locked {
                audit
                    .violations
                    .push(format!("{id:?} is held while on {queue:?}"));
            }
            if st.flags.contains(BufFlags::DELWRI) {
                audit.delayed += 1;
                if queue.is_free() {
                    audit
                        .violations
                        .push(format!("{id:?} holds a delayed write on {queue:?}"));
                }
            }
            if queue == QueueKind::Dirty && st.bufsize == 0 {
                audit
                    .violations
                    .push(format!("{id:?} has no data but is on DIRTY"));
            }
            if st.bufsize % min_block != 0 {
                audit.violations.push(format!(
                    "{id:?} allocated size {} is not a multiple of {min_block}",
                    st.bufsize
                ));
            }
            if st.bcount > st.bufsize {
                audit.violations.push(format!(
                    "{id:?} size {} exceeds allocation {}",
                    st.bcount, st.bufsize
                ));
            }
            if st.bufsize > 0
                && !st.flags.contains(BufFlags::MALLOC)
                && st.kva_size() < st.bufsize
            {
                audit.violations.push(format!(
                    "{id:?} has {} bytes of page-backed data but {} bytes of address space",
                    st.bufsize,
                    st.kva_size()
                ));
            }
            if let Some(object) = &st.object {
                if object.lookup(st.block) != Some(id) {
                    audit.violations.push(format!(
                        "{id:?} claims block {} of object {} but the registry disagrees",
                        st.block,
                        object.id()
                    ));
                }
            }
        }
        audit.dirty_counter = self.space.dirty();
        audit.free_counter = self.space.free_buffers();
        if audit.dirty_counter != audit.delayed {
            audit.violations.push(format!(
                "dirty counter {} but {} delayed-write buffers",
                audit.dirty_counter, audit.delayed
            ));
        }
        if audit.free_counter != audit.empty + audit.clean {
            audit.violations.push(format!(
                "free counter {} but {} buffers on EMPTY and CLEAN",
                audit.free_counter,
                audit.empty + audit.clean
            ));
        }
        audit
    }
}

fn grown(st: &mut BufState, oldsize: usize, newsize: usize, bcount: usize) {
    // the grown region has not been read
    if oldsize > 0 && !st.flags.contains(BufFlags::DELWRI) {
        st.flags.remove(BufFlags::CACHE);
    }
    // translation may depend on the size
    st.dev_block = None;
    st.bufsize = newsize;
    st.bcount = bcount;
}

pub(crate) fn resolve_dev_block(st: &mut BufState, object: &StorageObject) -> BlockNo {
    if let Some(dev) = st.dev_block {
        return dev;
    }
    let dev = object
        .strategy()
        .resolve_block(object.id(), st.block, st.bufsize);
    st.dev_block = Some(dev);
    dev
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::MemDevice;

    fn setup(nbuf: usize) -> (BufferCache, Arc<MemDevice>, Arc<StorageObject>) {
        let cache = BufferCache::new(CacheConfig::new(nbuf)).unwrap();
        let dev = Arc::new(MemDevice::new());
        let obj = StorageObject::new(ObjectId::new(1), dev.clone());
        (cache, dev, obj)
    }

    #[test]
    fn test_miss_then_hit() {
        let (cache, _dev, obj) = setup(16);
        let opts = GetOptions::new();

        let buf = cache.get(&obj, BlockNo::new(3), 4096, &opts).unwrap();
        assert!(!buf.is_valid());
        assert_eq!(buf.size(), 4096);
        let id = buf.id();
        cache.release_keep(buf);

        let buf = cache.get(&obj, BlockNo::new(3), 4096, &opts).unwrap();
        assert_eq!(buf.id(), id);
        drop(buf);

        let stats = cache.stats();
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.clean_buffers, 1);
        assert!(cache.audit().is_consistent());
    }

    #[test]
    fn test_no_create_misses() {
        let (cache, _dev, obj) = setup(8);
        let err = cache
            .get(&obj, BlockNo::new(1), 512, &GetOptions::new().no_create())
            .unwrap_err();
        assert!(matches!(err, CacheError::NotCached { .. }));
    }

    #[test]
    fn test_oversized_request_rejected() {
        let (cache, _dev, obj) = setup(8);
        let max = cache.config().max_buffer_size;
        let err = cache
            .get(&obj, BlockNo::new(1), max + 1, &GetOptions::new())
            .unwrap_err();
        assert!(matches!(err, CacheError::InvalidSize { .. }));
    }

    #[test]
    fn test_read_fills_from_device() {
        let (cache, dev, obj) = setup(16);
        let mut buf = cache.get(&obj, BlockNo::new(2), 4096, &GetOptions::new()).unwrap();
        buf.data_mut().fill(0x5a);
        cache.write(buf, WriteMode::Sync).unwrap();
        assert_eq!(dev.writes(), 1);

        // evict, then read back through a fresh buffer
        let buf = cache.get(&obj, BlockNo::new(2), 4096, &GetOptions::new()).unwrap();
        cache.invalidate(buf);
        let buf = cache.read(&obj, BlockNo::new(2), 4096, &GetOptions::new()).unwrap();
        assert!(buf.is_valid());
        assert!(buf.data().iter().all(|&b| b == 0x5a));
        assert_eq!(dev.reads(), 1);
    }

    #[test]
    fn test_release_placement() {
        let (cache, _dev, obj) = setup(16);
        let opts = GetOptions::new();

        let mut dirty = cache.get(&obj, BlockNo::new(1), 4096, &opts).unwrap();
        cache.mark_delayed(&mut dirty).unwrap();
        cache.release_reuse(dirty);

        let clean = cache.get(&obj, BlockNo::new(2), 4096, &opts).unwrap();
        cache.release_reuse(clean);

        let empty = cache.get(&obj, BlockNo::new(3), 0, &opts).unwrap();
        cache.release_reuse(empty);

        let stats = cache.stats();
        assert_eq!(stats.dirty_queue, 1);
        assert_eq!(stats.clean_buffers, 1);
        assert_eq!(stats.space.dirty_buffers, 1);
        assert_eq!(cache.lookup(&obj, BlockNo::new(3)), None);
        assert!(cache.audit().is_consistent());
    }

    #[test]
    fn test_aged_buffer_reclaimed_first() {
        let (cache, _dev, obj) = setup(4);
        let opts = GetOptions::new();
        for b in 0..4 {
            let mut buf = cache.get(&obj, BlockNo::new(b), 4096, &opts).unwrap();
            buf.set_age(b == 2);
            cache.release_reuse(buf);
        }
        // every header is CLEAN; the aged one goes first
        let buf = cache.get(&obj, BlockNo::new(10), 4096, &opts).unwrap();
        drop(buf);
        assert_eq!(cache.lookup(&obj, BlockNo::new(2)), None);
        assert!(cache.lookup(&obj, BlockNo::new(0)).is_some());
    }

    #[test]
    fn test_mark_delayed_idempotent() {
        let (cache, _dev, obj) = setup(16);
        let mut buf = cache.get(&obj, BlockNo::new(1), 4096, &GetOptions::new()).unwrap();
        cache.mark_delayed(&mut buf).unwrap();
        cache.mark_delayed(&mut buf).unwrap();
        assert_eq!(cache.space().dirty_buffers, 1);
        assert!(buf.is_delayed());
        drop(buf);
        let audit = cache.audit();
        assert_eq!(audit.dirty_counter, 1);
        assert_eq!(audit.delayed, 1);
    }

    #[test]
    fn test_mark_delayed_rejects_empty_buffer() {
        let (cache, _dev, obj) = setup(8);
        let mut buf = cache.get(&obj, BlockNo::new(1), 0, &GetOptions::new()).unwrap();
        let err = cache.mark_delayed(&mut buf).unwrap_err();
        assert!(matches!(err, CacheError::InvalidBuffer { .. }));
    }

    #[test]
    fn test_async_write_releases_on_completion() {
        let (cache, dev, obj) = setup(16);
        let mut buf = cache.get(&obj, BlockNo::new(4), 4096, &GetOptions::new()).unwrap();
        buf.data_mut()[0] = 7;
        cache.mark_delayed(&mut buf).unwrap();
        cache.write(buf, WriteMode::Async).unwrap();

        assert_eq!(cache.space().dirty_buffers, 0);
        assert_eq!(cache.space().runningspace, 0);
        assert_eq!(dev.read_raw(obj.id(), BlockNo::new(32), 1), vec![7]);
        assert_eq!(cache.stats().clean_buffers, 1);
        assert!(cache.audit().is_consistent());
    }

    #[test]
    fn test_resize_keeps_validity_on_shrink() {
        let (cache, _dev, obj) = setup(16);
        let buf = cache.get(&obj, BlockNo::new(1), 8192, &GetOptions::new()).unwrap();
        cache.write(buf, WriteMode::Sync).unwrap();

        let mut buf = cache.get(&obj, BlockNo::new(1), 8192, &GetOptions::new()).unwrap();
        assert!(buf.is_valid());
        cache.resize(&mut buf, 4096).unwrap();
        assert!(buf.is_valid());
        assert_eq!(buf.size(), 4096);
        cache.resize(&mut buf, 16384).unwrap();
        assert!(!buf.is_valid());
        assert_eq!(buf.alloc_size(), 16384);
        drop(buf);
        assert!(cache.audit().is_consistent());
    }

    #[test]
    fn test_get_forces_out_delayed_write_before_growth() {
        let (cache, dev, obj) = setup(16);
        let mut buf = cache.get(&obj, BlockNo::new(1), 2048, &GetOptions::new()).unwrap();
        buf.data_mut().fill(1);
        cache.delayed_write(buf).unwrap();

        let buf = cache.get(&obj, BlockNo::new(1), 4096, &GetOptions::new()).unwrap();
        assert_eq!(dev.writes(), 1);
        assert!(!buf.is_delayed());
        assert_eq!(buf.size(), 4096);
        drop(buf);
        assert_eq!(cache.space().dirty_buffers, 0);
    }

    #[test]
    fn test_small_buffers_use_malloc_space() {
        let (cache, _dev, obj) = setup(64);
        let buf = cache.get(&obj, BlockNo::new(1), 1024, &GetOptions::new()).unwrap();
        assert!(buf.flags().contains(BufFlags::MALLOC));
        assert_eq!(cache.space().mallocspace, 1024);
        assert_eq!(cache.space().kvaspace, 0);
        drop(buf);

        // growing past the malloc threshold converts to page backing
        let mut buf = cache.get(&obj, BlockNo::new(1), 1024, &GetOptions::new()).unwrap();
        cache.resize(&mut buf, 8192).unwrap();
        assert!(!buf.flags().contains(BufFlags::MALLOC));
        assert_eq!(cache.space().mallocspace, 0);
        assert!(cache.space().kvaspace >= 8192);
        drop(buf);
        assert!(cache.audit().is_consistent());
    }

    #[test]
    fn test_recursive_acquire() {
        let (cache, _dev, obj) = setup(8);
        let outer = cache.get(&obj, BlockNo::new(1), 512, &GetOptions::new()).unwrap();
        let inner = cache.get(&obj, BlockNo::new(1), 512, &GetOptions::new()).unwrap();
        assert!(inner.is_recursed());
        cache.release_reuse(inner);
        assert!(cache.inner.hdr(outer.id()).lock.is_locked());
        cache.release_reuse(outer);
        assert!(cache.audit().is_consistent());
    }

    #[test]
    fn test_recursive_acquire_with_other_size_rejected() {
        let (cache, _dev, obj) = setup(8);
        let outer = cache.get(&obj, BlockNo::new(1), 512, &GetOptions::new()).unwrap();
        let err = cache
            .get(&obj, BlockNo::new(1), 1024, &GetOptions::new())
            .map(|_| ())
            .unwrap_err();
        assert!(matches!(err, CacheError::InvalidBuffer { .. }));

        // the outer hold is untouched
        assert_eq!(cache.inner.hdr(outer.id()).lock.recursion(), 0);
        assert!(cache.inner.hdr(outer.id()).lock.is_locked());
        assert_eq!(outer.size(), 512);
        cache.release_keep(outer);
        assert!(cache.audit().is_consistent());
    }

    #[test]
    fn test_resize_clears_device_block() {
        let (cache, dev, obj) = setup(16);
        let buf = cache.get(&obj, BlockNo::new(3), 4096, &GetOptions::new()).unwrap();
        cache.write(buf, WriteMode::Sync).unwrap();

        let mut buf = cache.get(&obj, BlockNo::new(3), 4096, &GetOptions::new()).unwrap();
        assert_eq!(buf.dev_block(), Some(BlockNo::new(24)));
        cache.resize(&mut buf, 8192).unwrap();
        assert_eq!(buf.dev_block(), None);

        buf.data_mut().fill(9);
        cache.write(buf, WriteMode::Sync).unwrap();
        assert_eq!(dev.read_raw(obj.id(), BlockNo::new(48), 1), vec![9]);
    }

    #[test]
    fn test_sync_writes_alongside_flusher() {
        let (cache, dev, obj) = setup(64);
        for b in 0..32 {
            let buf = cache.get(&obj, BlockNo::new(b), 4096, &GetOptions::new()).unwrap();
            cache.delayed_write(buf).unwrap();
        }

        let writer = {
            let cache = cache.clone();
            let obj = obj.clone();
            thread::spawn(move || {
                for round in 0..50 {
                    let mut buf = cache
                        .get(&obj, BlockNo::new(100), 4096, &GetOptions::new())
                        .unwrap();
                    buf.data_mut()[0] = round;
                    cache.write(buf, WriteMode::Sync).unwrap();
                }
            })
        };
        while cache.space().dirty_buffers > 0 {
            cache.flush(4);
        }
        writer.join().unwrap();

        assert_eq!(dev.read_raw(obj.id(), BlockNo::new(800), 1), vec![49]);
        assert!(cache.audit().is_consistent());
    }

    #[test]
    fn test_nowait_on_held_buffer() {
        let (cache, _dev, obj) = setup(8);
        let held = cache.get(&obj, BlockNo::new(1), 512, &GetOptions::new()).unwrap();
        let cache2 = cache.clone();
        let obj2 = obj.clone();
        let err = thread::spawn(move || {
            cache2
                .get(&obj2, BlockNo::new(1), 512, &GetOptions::nowait())
                .map(|_| ())
                .unwrap_err()
        })
        .join()
        .unwrap();
        assert!(matches!(err, CacheError::WouldBlock { .. }));
        assert!(err.is_retryable());
        drop(held);
    }

    #[test]
    fn test_all_headers_held_by_caller() {
        let (cache, _dev, obj) = setup(4);
        let held: Vec<_> = (0..4)
            .map(|b| cache.get(&obj, BlockNo::new(b), 512, &GetOptions::new()).unwrap())
            .collect();
        let err = cache
            .get(&obj, BlockNo::new(9), 512, &GetOptions::new())
            .unwrap_err();
        assert!(matches!(err, CacheError::NoBuffers));
        drop(held);
    }

    #[test]
    #[should_panic(expected = "not locked")]
    fn test_double_release_panics() {
        let (cache, _dev, obj) = setup(8);
        let buf = cache.get(&obj, BlockNo::new(1), 512, &GetOptions::new()).unwrap();
        let (id, recursed) = buf.into_raw();
        cache.inner.release_raw(id, recursed, Release::Reuse);
        cache.inner.release_raw(id, recursed, Release::Reuse);
    }

    #[test]
    fn test_release_by_other_thread_panics() {
        let (cache, _dev, obj) = setup(8);
        let buf = cache.get(&obj, BlockNo::new(1), 512, &GetOptions::new()).unwrap();
        let (id, _) = buf.into_raw();
        let inner = cache.inner.clone();
        let result = thread::spawn(move || inner.release(id, Release::Reuse)).join();
        assert!(result.is_err());
        cache.inner.release(id, Release::Reuse);
    }

    #[test]
    #[should_panic(expected = "completed twice")]
    fn test_double_completion_panics() {
        let (cache, _dev, obj) = setup(8);
        let buf = cache.get(&obj, BlockNo::new(1), 512, &GetOptions::new()).unwrap();
        let id = buf.id();
        cache.inner.hdr(id).state().flags.insert(BufFlags::DONE);
        cache
            .inner
            .complete_io(IoOp::Read, &[id], Bytes::new(), Ok(()));
    }

    #[test]
    fn test_shutdown_rejects_acquire() {
        let (cache, _dev, obj) = setup(8);
        let mut buf = cache.get(&obj, BlockNo::new(1), 4096, &GetOptions::new()).unwrap();
        cache.mark_delayed(&mut buf).unwrap();
        drop(buf);
        assert_eq!(cache.shutdown().unwrap(), 1);
        assert!(cache.is_shutting_down());
        let err = cache
            .get(&obj, BlockNo::new(1), 4096, &GetOptions::new())
            .unwrap_err();
        assert!(matches!(err, CacheError::ShuttingDown));
    }
}
