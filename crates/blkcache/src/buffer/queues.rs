//! Free queues for buffers not held by any caller.
//!
//! Three intrusive doubly-linked lists over header indices:
//!
//! ```text
//!   EMPTY  ─┐ one lock      no data, no identity; reclaimed first
//!   CLEAN  ─┘               valid data; reclaimed in LRU order from the head
//!   DIRTY    own lock       delayed writes, drained by the flusher
//! ```
//!
//! A buffer is on at most one list at a time and on none while held. The
//! DIRTY list additionally carries cursor nodes: indices above the header
//! range that mark a flush pass's position. Cursors are never returned as
//! buffers, and a pass steps over other passes' cursors so concurrent
//! passes keep their relative order.
//!
//! A scan that selects a buffer sets its pending-removal mark under the
//! queue lock; other scans skip marked buffers until the selector either
//! unlinks the buffer or clears the mark.

use parking_lot::Mutex;

use super::header::{BufHeader, BufId, QueueKind};

const NIL: u32 = u32::MAX;
const DETACHED: u8 = u8::MAX;

const EMPTY_LIST: usize = 0;
const CLEAN_LIST: usize = 1;
const DIRTY_LIST: usize = 0;

#[derive(Debug, Clone, Copy)]
struct Link {
    prev: u32,
    next: u32,
    list: u8,
}

impl Link {
    const DETACHED: Self = Self {
        prev: NIL,
        next: NIL,
        list: DETACHED,
    };
}

#[derive(Debug, Clone, Copy)]
struct ListHead {
    first: u32,
    last: u32,
    len: usize,
}

/// A set of intrusive lists sharing one link array.
#[derive(Debug)]
struct Links {
    heads: Vec<ListHead>,
    links: Vec<Link>,
}

impl Links {
    fn new(lists: usize, nodes: usize) -> Self {
        Self {
            heads: vec![
                ListHead {
                    first: NIL,
                    last: NIL,
                    len: 0
                };
                lists
            ],
            links: vec![Link::DETACHED; nodes],
        }
    }

    fn push_front(&mut self, list: usize, n: u32) {
        debug_assert_eq!(self.links[n as usize].list, DETACHED);
        let old = self.heads[list].first;
        self.links[n as usize] = Link {
            prev: NIL,
            next: old,
            list: list as u8,
        };
        if old == NIL {
            self.heads[list].last = n;
        } else {
            self.links[old as usize].prev = n;
        }
        self.heads[list].first = n;
        self.heads[list].len += 1;
    }

    fn push_back(&mut self, list: usize, n: u32) {
        debug_assert_eq!(self.links[n as usize].list, DETACHED);
        let old = self.heads[list].last;
        self.links[n as usize] = Link {
            prev: old,
            next: NIL,
            list: list as u8,
        };
        if old == NIL {
            self.heads[list].first = n;
        } else {
            self.links[old as usize].next = n;
        }
        self.heads[list].last = n;
        self.heads[list].len += 1;
    }

    fn insert_after(&mut self, at: u32, n: u32) {
        let list = self.links[at as usize].list as usize;
        let next = self.links[at as usize].next;
        self.links[n as usize] = Link {
            prev: at,
            next,
            list: list as u8,
        };
        self.links[at as usize].next = n;
        if next == NIL {
            self.heads[list].last = n;
        } else {
            self.links[next as usize].prev = n;
        }
        self.heads[list].len += 1;
    }

    fn unlink(&mut self, n: u32) -> bool {
        let link = self.links[n as usize];
        if link.list == DETACHED {
            return false;
        }
        let list = link.list as usize;
        if link.prev == NIL {
            self.heads[list].first = link.next;
        } else {
            self.links[link.prev as usize].next = link.next;
        }
        if link.next == NIL {
            self.heads[list].last = link.prev;
        } else {
            self.links[link.next as usize].prev = link.prev;
        }
        self.links[n as usize] = Link::DETACHED;
        self.heads[list].len -= 1;
        true
    }

    fn first(&self, list: usize) -> Option<u32> {
        Some(self.heads[list].first).filter(|&n| n != NIL)
    }

    fn next(&self, n: u32) -> Option<u32> {
        Some(self.links[n as usize].next).filter(|&n| n != NIL)
    }

    fn iter(&self, list: usize) -> impl Iterator<Item = u32> + '_ {
        std::iter::successors(self.first(list), move |&n| self.next(n))
    }
}

/// Where a released buffer is inserted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum End {
    /// Reclaimed (or flushed) first.
    Head,
    /// Reclaimed (or flushed) last.
    Tail,
}

/// A flush pass's position in the DIRTY queue.
#[derive(Debug, PartialEq, Eq)]
pub(crate) struct Cursor(u32);

/// Result of advancing a cursor by one node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Step {
    /// The cursor passed a buffer the selector accepted; it is now locked
    /// by the caller and marked pending removal.
    Selected(BufId),
    /// The cursor passed a buffer that was rejected or already pending.
    Skipped,
    /// The cursor stepped over another pass's cursor.
    Crossed,
    /// The cursor reached the end of the queue.
    End,
}

struct DirtyQueue {
    links: Links,
    free_cursors: Vec<u32>,
    /// Cursor slots allocated so far, active or free.
    cursors: usize,
}

/// The free queues.
pub struct FreeQueues {
    nbuf: u32,
    clean: Mutex<Links>,
    dirty: Mutex<DirtyQueue>,
}

impl FreeQueues {
    /// Creates empty queues for `nbuf` headers.
    pub fn new(nbuf: usize) -> Self {
        let n = u32::try_from(nbuf).unwrap_or(u32::MAX - 1);
        Self {
            nbuf: n,
            clean: Mutex::new(Links::new(2, nbuf)),
            dirty: Mutex::new(DirtyQueue {
                links: Links::new(1, nbuf),
                free_cursors: Vec::new(),
                cursors: 0,
            }),
        }
    }

    /// Inserts a buffer on `kind` at `end`.
    ///
    /// # Panics
    ///
    /// Panics if the buffer is already on a queue.
    pub(crate) fn insert(&self, hdr: &BufHeader, kind: QueueKind, end: End) {
        let n = hdr.id().0;
        let insert_into = |links: &mut Links, list: usize| {
            assert_eq!(
                hdr.queue(),
                QueueKind::None,
                "buffer {:?} inserted on {kind:?} while on {:?}",
                hdr.id(),
                hdr.queue()
            );
            match end {
                End::Head => links.push_front(list, n),
                End::Tail => links.push_back(list, n),
            }
            hdr.set_remove_pending(false);
            hdr.set_queue(kind);
        };
        match kind {
            QueueKind::Empty => insert_into(&mut *self.clean.lock(), EMPTY_LIST),
            QueueKind::Clean => insert_into(&mut *self.clean.lock(), CLEAN_LIST),
            QueueKind::Dirty => insert_into(&mut self.dirty.lock().links, DIRTY_LIST),
            QueueKind::None => panic!("buffer {:?} inserted on no queue", hdr.id()),
        }
    }

    /// Unlinks a buffer from whatever queue it is on and clears its
    /// pending-removal mark.
    ///
    /// Returns the queue it was on.
    pub(crate) fn remove(&self, hdr: &BufHeader) -> QueueKind {
        let n = hdr.id().0;
        // The tag is only written under the owning queue's lock, so re-read
        // it once that lock is held.
        loop {
            let kind = hdr.queue();
            let removed = match kind {
                QueueKind::None => {
                    hdr.set_remove_pending(false);
                    return QueueKind::None;
                }
                QueueKind::Empty | QueueKind::Clean => {
                    let mut links = self.clean.lock();
                    Self::unlink_tagged(&mut links, hdr, kind)
                }
                QueueKind::Dirty => {
                    let mut dq = self.dirty.lock();
                    Self::unlink_tagged(&mut dq.links, hdr, kind)
                }
            };
            if removed {
                hdr.set_remove_pending(false);
                hdr.set_queue(QueueKind::None);
                return kind;
            }
        }
    }

    fn unlink_tagged(links: &mut Links, hdr: &BufHeader, kind: QueueKind) -> bool {
        if hdr.queue() != kind {
            return false;
        }
        assert!(
            links.unlink(hdr.id().0),
            "buffer {:?} tagged {kind:?} but not linked",
            hdr.id()
        );
        true
    }

    /// Clears a pending-removal mark without unlinking.
    pub(crate) fn unmark(&self, hdr: &BufHeader) {
        match hdr.queue() {
            QueueKind::Dirty => {
                let _dq = self.dirty.lock();
                hdr.set_remove_pending(false);
            }
            QueueKind::Empty | QueueKind::Clean => {
                let _links = self.clean.lock();
                hdr.set_remove_pending(false);
            }
            QueueKind::None => hdr.set_remove_pending(false),
        }
    }

    /// Scans `kind` from the head and returns the first buffer `select`
    /// accepts, marked pending removal.
    ///
    /// `select` runs under the queue lock and must not block.
    pub(crate) fn select(
        &self,
        kind: QueueKind,
        headers: &[BufHeader],
        mut select: impl FnMut(&BufHeader) -> bool,
    ) -> Option<BufId> {
        let mut scan = |links: &Links, list: usize| {
            for n in links.iter(list) {
                let hdr = &headers[n as usize];
                if hdr.is_remove_pending() {
                    continue;
                }
                if select(hdr) {
                    hdr.set_remove_pending(true);
                    return Some(hdr.id());
                }
            }
            None
        };
        match kind {
            QueueKind::Empty => scan(&*self.clean.lock(), EMPTY_LIST),
            QueueKind::Clean => scan(&*self.clean.lock(), CLEAN_LIST),
            QueueKind::Dirty => scan(&self.dirty.lock().links, DIRTY_LIST),
            QueueKind::None => None,
        }
    }

    /// Inserts a new cursor at the head of DIRTY.
    pub(crate) fn cursor_insert(&self) -> Cursor {
        let mut dq = self.dirty.lock();
        let n = match dq.free_cursors.pop() {
            Some(n) => n,
            None => {
                let n = self.nbuf + u32::try_from(dq.cursors).unwrap_or(0);
                dq.cursors += 1;
                dq.links.links.push(Link::DETACHED);
                n
            }
        };
        dq.links.push_front(DIRTY_LIST, n);
        Cursor(n)
    }

    /// Moves `cursor` past the node that follows it.
    ///
    /// A buffer node is offered to `select` (under the queue lock, so it
    /// must not block); a buffer already pending removal is skipped.
    pub(crate) fn cursor_step(
        &self,
        cursor: &Cursor,
        headers: &[BufHeader],
        select: impl FnOnce(&BufHeader) -> bool,
    ) -> Step {
        let mut dq = self.dirty.lock();
        let links = &mut dq.links;
        let Some(next) = links.next(cursor.0) else {
            return Step::End;
        };
        links.unlink(cursor.0);
        links.insert_after(next, cursor.0);
        if next >= self.nbuf {
            return Step::Crossed;
        }
        let hdr = &headers[next as usize];
        if hdr.is_remove_pending() || !select(hdr) {
            return Step::Skipped;
        }
        hdr.set_remove_pending(true);
        Step::Selected(hdr.id())
    }

    /// Removes a cursor from DIRTY.
    pub(crate) fn cursor_remove(&self, cursor: Cursor) {
        let mut dq = self.dirty.lock();
        dq.links.unlink(cursor.0);
        dq.free_cursors.push(cursor.0);
    }

    /// Returns the number of buffers on `kind`.
    pub fn len(&self, kind: QueueKind) -> usize {
        match kind {
            QueueKind::Empty => self.clean.lock().heads[EMPTY_LIST].len,
            QueueKind::Clean => self.clean.lock().heads[CLEAN_LIST].len,
            QueueKind::Dirty => {
                let dq = self.dirty.lock();
                dq.links.heads[DIRTY_LIST].len - (dq.cursors - dq.free_cursors.len())
            }
            QueueKind::None => 0,
        }
    }

    /// Returns the buffers on `kind` from head to tail.
    pub fn buffers(&self, kind: QueueKind) -> Vec<BufId> {
        let collect = |links: &Links, list: usize| -> Vec<BufId> {
            links
                .iter(list)
                .filter(|&n| n < self.nbuf)
                .map(BufId::new)
                .collect()
        };
        match kind {
            QueueKind::Empty => collect(&*self.clean.lock(), EMPTY_LIST),
            QueueKind::Clean => collect(&*self.clean.lock(), CLEAN_LIST),
            QueueKind::Dirty => collect(&self.dirty.lock().links, DIRTY_LIST),
            QueueKind::None => Vec::new(),
        }
    }
}

impl std::fmt::Debug for FreeQueues {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FreeQueues")
            .field("empty", &self.len(QueueKind::Empty))
            .field("clean", &self.len(QueueKind::Clean))
            .field("dirty", &self.len(QueueKind::Dirty))
            .finish()
    }
}
