//! Draining the DIRTY queue.
//!
//! A flush pass parks a cursor at the head of DIRTY and walks it forward
//! one node at a time. Buffers released to DIRTY while the pass runs land
//! behind the cursor and wait for the next pass, so a steady stream of new
//! delayed writes cannot keep a pass from finishing.
//!
//! The flusher holds a buffer lock before it looks at the buffer's object,
//! and only ever try-locks the object: a busy object (one with a write in
//! progress on another thread) is skipped rather than waited for.

use std::sync::Arc;

use blkcache_common::constants::DEV_BSIZE;
use blkcache_common::types::BlockNo;
use bytes::BytesMut;
use tracing::{debug, trace, warn};

use super::cache::{resolve_dev_block, CacheInner, Release, WriteMode};
use super::header::{BufFlags, BufId, QueueKind};
use super::queues::Step;
use super::registry::{NonBlocking, ObjectLockGuard, StorageObject};
use super::stats::{bump, bump_by};
use crate::io::{IoOp, IoRequest};

impl CacheInner {
    /// Writes up to `target` delayed-write buffers. Returns the number
    /// written (or reclaimed, for buffers found already invalid).
    pub(crate) fn flush_dirty(self: &Arc<Self>, target: usize, allow_rollback: bool) -> usize {
        if target == 0 {
            return 0;
        }
        let cursor = self.queues.cursor_insert();
        let mut flushed = 0;
        while flushed < target {
            let id = match self
                .queues
                .cursor_step(&cursor, &self.headers, |hdr| hdr.lock.try_lock())
            {
                Step::End => break,
                Step::Crossed | Step::Skipped => continue,
                Step::Selected(id) => id,
            };
            match self.flush_one(id, allow_rollback) {
                Some(n) => flushed += n,
                None => {
                    let hdr = self.hdr(id);
                    self.queues.unmark(hdr);
                    hdr.lock.unlock();
                }
            }
        }
        self.queues.cursor_remove(cursor);
        bump(&self.counters.flush_passes);
        debug!(target, flushed, allow_rollback, "flush pass");
        flushed
    }

    /// Flush pass with the liveness fallback: a pass that writes nothing
    /// is retried once with dependency rollback allowed and a reduced
    /// target.
    pub(crate) fn flush_pass(self: &Arc<Self>, target: usize) -> usize {
        let flushed = self.flush_dirty(target, false);
        if flushed > 0 || target == 0 {
            return flushed;
        }
        let retry = (target / self.config.rollback_divisor).max(1);
        if self.queues.len(QueueKind::Dirty) > 0 {
            warn!(target, retry, "flush pass made no progress, retrying with dependency rollback");
        }
        self.flush_dirty(retry, true)
    }

    /// Handles one buffer selected by the cursor. The buffer is locked and
    /// marked pending removal. Returns `None` to leave it where it is.
    fn flush_one(self: &Arc<Self>, id: BufId, allow_rollback: bool) -> Option<usize> {
        let hdr = self.hdr(id);
        let (flags, object, info) = {
            let st = hdr.state();
            (st.flags, st.object.clone(), st.info(id))
        };

        if flags.contains(BufFlags::INVAL) {
            self.dequeue(hdr);
            self.release(id, Release::Reuse);
            return Some(1);
        }
        if !flags.contains(BufFlags::DELWRI) || flags.contains(BufFlags::WRITING) {
            return None;
        }
        if flags.contains(BufFlags::DEPENDENT) && self.deps.has_pending(&info) {
            if !allow_rollback || !self.deps.rollback_one(&info) {
                bump(&self.counters.dep_skips);
                return None;
            }
            bump(&self.counters.rollbacks);
            trace!(buf = ?id, block = %info.block, "rolled back dependency");
        }

        let object = object?;
        let Some(held) = object.try_lock() else {
            bump(&self.counters.object_busy);
            return None;
        };
        self.dequeue(hdr);
        Some(self.write_clustered(id, &object, &held))
    }

    /// Issues an asynchronous write of `id` together with the delayed
    /// writes that directly follow it in the same object. Returns the
    /// number of buffers written.
    fn write_clustered(
        self: &Arc<Self>,
        id: BufId,
        object: &Arc<StorageObject>,
        _held: &ObjectLockGuard<'_, NonBlocking>,
    ) -> usize {
        let hdr = self.hdr(id);
        let (block, size, dev) = {
            let mut st = hdr.state();
            let dev = resolve_dev_block(&mut st, object);
            (st.block, st.bcount, dev)
        };
        let max = self.config.max_cluster_size;
        if !self.config.clustering
            || object.is_dying()
            || size == 0
            || size % DEV_BSIZE != 0
            || size * 2 > max
        {
            // issue_write reports failures through the completion
            let _ = self.issue_write(id, WriteMode::Async);
            return 1;
        }

        let sectors = i64::try_from(size / DEV_BSIZE).unwrap_or(i64::MAX);
        let mut members = vec![id];
        let mut next = block.next();
        while (members.len() + 1) * size <= max {
            let Some(nid) = object.lookup(next) else { break };
            let expected = dev.offset(sectors * members.len() as i64);
            if !self.cluster_candidate(nid, object, next, size, expected) {
                break;
            }
            members.push(nid);
            next = next.next();
        }
        if members.len() == 1 {
            let _ = self.issue_write(id, WriteMode::Async);
            return 1;
        }

        let mut payload = BytesMut::with_capacity(members.len() * size);
        for &m in &members {
            let mh = self.hdr(m);
            let mut st = mh.state();
            st.flags
                .remove(BufFlags::DELWRI | BufFlags::DONE | BufFlags::ERROR | BufFlags::REQUEUE);
            st.flags.insert(BufFlags::WRITING | BufFlags::ASYNC);
            st.io = Some(IoOp::Write);
            st.error = None;
            payload.extend_from_slice(&st.data[..st.bcount]);
            let b = st.block;
            drop(st);
            self.space.dirty_dec();
            object.mark_clean(b);
            mh.lock.disown();
        }

        let count = members.len();
        self.space.running_start(payload.len());
        bump_by(&self.counters.writes, count as u64);
        bump_by(&self.counters.async_writes, count as u64);
        bump(&self.counters.cluster_writes);
        bump_by(&self.counters.clustered_buffers, count as u64);
        trace!(object = %object.id(), %block, count, "clustered write");
        object.strategy().strategy(IoRequest::new(
            IoOp::Write,
            object.id(),
            dev,
            payload,
            members,
            Arc::clone(self),
        ));
        count
    }

    /// Locks and dequeues `id` if it can join a cluster at `block`,
    /// expected on the device at `dev`.
    fn cluster_candidate(
        &self,
        id: BufId,
        object: &StorageObject,
        block: BlockNo,
        size: usize,
        dev: BlockNo,
    ) -> bool {
        let hdr = self.hdr(id);
        if hdr.queue() != QueueKind::Dirty || hdr.is_remove_pending() || !hdr.lock.try_lock() {
            return false;
        }
        let fits = {
            let mut st = hdr.state();
            st.is_bound_to(object, block)
                && st.flags.contains(BufFlags::DELWRI)
                && !st
                    .flags
                    .intersects(BufFlags::WRITING | BufFlags::DEPENDENT)
                && st.bcount == size
                && st.bufsize == size
                && resolve_dev_block(&mut st, object) == dev
        };
        if !fits || self.dequeue(hdr) != QueueKind::Dirty {
            hdr.lock.unlock();
            return false;
        }
        true
    }
}
