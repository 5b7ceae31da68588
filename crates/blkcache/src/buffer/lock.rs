//! Owner-tracking exclusive buffer locks.
//!
//! A buffer lock records who holds it: a thread, or nobody in particular
//! once the holder hands the buffer to asynchronous I/O. Re-acquiring a
//! lock already held by the calling thread records a recursion instead of
//! deadlocking, and releasing a recursed hold only drops the recursion.
//! Releasing a lock that is not held, or that another thread holds, is a
//! consistency violation and panics.

use std::thread::{self, ThreadId};

use parking_lot::{Condvar, Mutex};

use super::error::CacheResult;
use crate::sync::Sleeper;

/// Holder of a buffer lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockOwner {
    /// Held by a thread.
    Thread(ThreadId),
    /// Disowned to asynchronous I/O; released by the completion path.
    Kernel,
}

/// Outcome of a successful acquire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Acquired {
    /// The caller now holds the lock.
    Exclusive,
    /// The caller already held the lock; the hold was recursed.
    Recursed,
}

#[derive(Debug)]
struct LockState {
    owner: Option<LockOwner>,
    recursion: u32,
    waiters: u32,
}

/// Exclusive buffer lock.
#[derive(Debug)]
pub struct BufLock {
    state: Mutex<LockState>,
    released: Condvar,
}

impl BufLock {
    /// Creates an unlocked lock.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(LockState {
                owner: None,
                recursion: 0,
                waiters: 0,
            }),
            released: Condvar::new(),
        }
    }

    /// Acquires the lock if nobody holds it.
    ///
    /// Never recurses: a thread scanning queues must not select a buffer
    /// it already holds.
    pub fn try_lock(&self) -> bool {
        let mut st = self.state.lock();
        if st.owner.is_some() {
            return false;
        }
        st.owner = Some(LockOwner::Thread(thread::current().id()));
        true
    }

    /// Acquires the lock, sleeping according to `sleeper`.
    pub(crate) fn lock(&self, sleeper: &Sleeper<'_>) -> CacheResult<Acquired> {
        let me = LockOwner::Thread(thread::current().id());
        let mut st = self.state.lock();
        loop {
            match st.owner {
                None => {
                    st.owner = Some(me);
                    st.recursion = 0;
                    return Ok(Acquired::Exclusive);
                }
                Some(owner) if owner == me => {
                    st.recursion += 1;
                    return Ok(Acquired::Recursed);
                }
                Some(_) => {
                    st.waiters += 1;
                    let slept = sleeper.sleep(&self.released, &mut st);
                    st.waiters -= 1;
                    slept?;
                }
            }
        }
    }

    /// Releases one hold.
    ///
    /// Returns true if the lock is now free, false if only a recursion was
    /// dropped.
    ///
    /// # Panics
    ///
    /// Panics if the lock is not held, or is held by another thread.
    pub fn unlock(&self) -> bool {
        let me = thread::current().id();
        let mut st = self.state.lock();
        match st.owner {
            None => panic!("releasing a buffer that is not locked"),
            Some(LockOwner::Thread(owner)) if owner != me => {
                panic!("buffer locked by {owner:?} released by {me:?}")
            }
            _ => {}
        }
        if st.recursion > 0 {
            st.recursion -= 1;
            return false;
        }
        st.owner = None;
        if st.waiters > 0 {
            self.released.notify_all();
        }
        true
    }

    /// Hands the lock to the asynchronous I/O path.
    ///
    /// # Panics
    ///
    /// Panics unless the calling thread holds the lock without recursion.
    pub fn disown(&self) {
        let me = LockOwner::Thread(thread::current().id());
        let mut st = self.state.lock();
        assert_eq!(st.owner, Some(me), "disowning a buffer the caller does not hold");
        assert_eq!(st.recursion, 0, "disowning a recursively held buffer");
        st.owner = Some(LockOwner::Kernel);
    }

    /// Panics unless the lock is held by the calling thread or disowned.
    pub fn assert_held(&self) {
        let me = thread::current().id();
        match self.state.lock().owner {
            None => panic!("buffer is not locked"),
            Some(LockOwner::Thread(owner)) if owner != me => {
                panic!("buffer locked by {owner:?}, not by {me:?}")
            }
            _ => {}
        }
    }

    /// Returns true if anyone holds the lock.
    pub fn is_locked(&self) -> bool {
        self.state.lock().owner.is_some()
    }

    /// Returns the current holder.
    pub fn owner(&self) -> Option<LockOwner> {
        self.state.lock().owner
    }

    /// Returns the recursion depth beyond the first hold.
    pub fn recursion(&self) -> u32 {
        self.state.lock().recursion
    }
}

impl Default for BufLock {
    fn default() -> Self {
        Self::new()
    }
}
