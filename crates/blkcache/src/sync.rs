//! Blocking policy shared by every wait in the cache.
//!
//! Acquiring a buffer can sleep on a buffer lock, on a free header, on
//! buffer or address space, and on the dirty-buffer watermark. Each of
//! these waits honors the same [`WaitPolicy`]: a do-not-block mode, an
//! optional timeout and an optional [`CancelToken`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use blkcache_common::constants::WAIT_SLICE_MS;
use parking_lot::{Condvar, MutexGuard};

use crate::buffer::{CacheError, CacheResult};

/// A cancellation signal that aborts pending waits.
///
/// Cloning yields a handle to the same signal.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    /// Creates a token that has not been cancelled.
    pub fn new() -> Self {
        Self::default()
    }

    /// Cancels every wait using this token.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    /// Returns true once [`cancel`](Self::cancel) has been called.
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// How an operation behaves when it would have to sleep.
#[derive(Debug, Clone, Default)]
pub struct WaitPolicy {
    nowait: bool,
    timeout: Option<Duration>,
    cancel: Option<CancelToken>,
}

impl WaitPolicy {
    /// Block until the condition is satisfied.
    pub fn blocking() -> Self {
        Self::default()
    }

    /// Never sleep; fail with [`CacheError::WouldBlock`] instead.
    pub fn nowait() -> Self {
        Self {
            nowait: true,
            ..Self::default()
        }
    }

    /// Sleep at most `timeout` in total.
    pub fn timeout(timeout: Duration) -> Self {
        Self::default().with_timeout(timeout)
    }

    /// Sets the timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Aborts the wait with [`CacheError::Interrupted`] when `token` fires.
    pub fn with_cancel(mut self, token: CancelToken) -> Self {
        self.cancel = Some(token);
        self
    }

    /// Returns true if this policy never sleeps.
    pub fn is_nowait(&self) -> bool {
        self.nowait
    }

    pub(crate) fn sleeper(&self, what: &'static str) -> Sleeper<'_> {
        Sleeper {
            policy: self,
            deadline: self.timeout.map(|t| Instant::now() + t),
            what,
        }
    }
}

/// A single operation's view of a [`WaitPolicy`].
///
/// The deadline is fixed when the sleeper is created so that one `get`
/// sleeping on several conditions shares one timeout budget.
pub(crate) struct Sleeper<'a> {
    policy: &'a WaitPolicy,
    deadline: Option<Instant>,
    what: &'static str,
}

impl Sleeper<'_> {
    /// Returns the error to report instead of sleeping, if any.
    pub(crate) fn check(&self) -> CacheResult<()> {
        if self.policy.nowait {
            return Err(CacheError::WouldBlock { what: self.what });
        }
        if self
            .policy
            .cancel
            .as_ref()
            .is_some_and(CancelToken::is_cancelled)
        {
            return Err(CacheError::Interrupted { what: self.what });
        }
        if let Some(deadline) = self.deadline {
            if Instant::now() >= deadline {
                return Err(CacheError::Timeout { what: self.what });
            }
        }
        Ok(())
    }

    /// Sleeps on `cv` for at most one slice.
    ///
    /// The caller re-checks its condition after this returns; a timeout,
    /// cancellation or do-not-block policy is reported on the next call.
    pub(crate) fn sleep<T>(&self, cv: &Condvar, guard: &mut MutexGuard<'_, T>) -> CacheResult<()> {
        self.check()?;
        let mut until = Instant::now() + Duration::from_millis(WAIT_SLICE_MS);
        if let Some(deadline) = self.deadline {
            until = until.min(deadline);
        }
        cv.wait_until(guard, until);
        Ok(())
    }

    /// Short sleep without a condition variable, used while polling.
    pub(crate) fn pause(&self) -> CacheResult<()> {
        self.check()?;
        std::thread::sleep(Duration::from_millis(1));
        Ok(())
    }
}
