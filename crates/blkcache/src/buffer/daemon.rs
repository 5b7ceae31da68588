//! Write-back daemon.
//!
//! A background thread that keeps the dirty-buffer count near its low
//! watermark. It wakes every `daemon_interval`, when a release pushes the
//! dirty count past the high watermark, or on an urgent request from a
//! thread that is short of buffers or about to block on the dirty
//! watermark. An urgent request lowers the drain floor to half the current
//! dirty count for one iteration.

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use tracing::{debug, info, trace};

use super::cache::{BufferCache, CacheInner};
use super::error::{CacheError, CacheResult};
use crate::sync::WaitPolicy;

#[derive(Debug, Default)]
struct ControlFlags {
    requested: bool,
    urgent: bool,
    shutdown: bool,
    running: bool,
}

/// The daemon's request and urgent-request knobs.
#[derive(Debug, Default)]
pub(crate) struct DaemonControl {
    flags: Mutex<ControlFlags>,
    wake: Condvar,
}

impl DaemonControl {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Asks for a drain at the next opportunity.
    pub(crate) fn request(&self) {
        let mut f = self.flags.lock();
        if !f.requested {
            f.requested = true;
            self.wake.notify_one();
        }
    }

    /// Asks for an urgent drain.
    pub(crate) fn speedup(&self) {
        let mut f = self.flags.lock();
        f.urgent = true;
        f.requested = true;
        self.wake.notify_one();
    }

    pub(crate) fn shutdown(&self) {
        let mut f = self.flags.lock();
        f.shutdown = true;
        self.wake.notify_all();
    }

    fn take_urgent(&self) -> bool {
        std::mem::take(&mut self.flags.lock().urgent)
    }

    /// Sleeps until requested or `interval` passes. Returns false once
    /// shutdown has been requested.
    fn wait(&self, interval: Duration) -> bool {
        let mut f = self.flags.lock();
        if !f.requested && !f.shutdown {
            self.wake.wait_for(&mut f, interval);
        }
        f.requested = false;
        !f.shutdown
    }

    /// Sleeps for `backoff` unless shut down first.
    fn pause(&self, backoff: Duration) -> bool {
        let mut f = self.flags.lock();
        if !f.shutdown {
            self.wake.wait_for(&mut f, backoff);
        }
        !f.shutdown
    }

    fn try_start(&self) -> bool {
        let mut f = self.flags.lock();
        if f.running || f.shutdown {
            return false;
        }
        f.running = true;
        true
    }

    fn stopped(&self, cache_down: bool) {
        let mut f = self.flags.lock();
        f.running = false;
        // a stopped daemon may be started again unless the cache itself is
        // shutting down
        f.shutdown = cache_down;
    }
}

impl CacheInner {
    /// One daemon iteration: drains DIRTY to the low watermark (or to half
    /// the dirty count, when urgent). Returns the number of buffers written.
    pub(crate) fn daemon_tick(self: &Arc<Self>) -> usize {
        let urgent = self.control.take_urgent();
        let start = self.space.dirty();
        let lo = self.config.lo_dirty;
        let floor = if urgent { (start / 2).min(lo) } else { lo };

        let mut total = 0;
        loop {
            let dirty = self.space.dirty();
            if dirty <= floor {
                break;
            }
            // keep the device queue from saturating
            let throttle = WaitPolicy::timeout(self.config.daemon_backoff());
            if let Err(e) = self.space.wait_running(&throttle.sleeper("in-flight writes")) {
                trace!(error = %e, "throttled on in-flight writes");
            }
            let flushed = self.flush_pass(dirty - floor);
            total += flushed;
            if flushed == 0 {
                break;
            }
        }
        if total > 0 {
            debug!(written = total, dirty = self.space.dirty(), urgent, "write-back iteration");
        }
        total
    }
}

/// Handle to the background write-back thread.
///
/// Dropping the handle stops the thread.
pub struct WritebackDaemon {
    inner: Arc<CacheInner>,
    handle: Option<JoinHandle<()>>,
}

impl WritebackDaemon {
    /// Starts the daemon for `cache`. Only one may run per cache.
    pub fn spawn(cache: &BufferCache) -> CacheResult<Self> {
        let inner = Arc::clone(&cache.inner);
        if cache.is_shutting_down() {
            return Err(CacheError::ShuttingDown);
        }
        if !inner.control.try_start() {
            return Err(CacheError::config("write-back daemon already running"));
        }
        let worker = Arc::clone(&inner);
        let handle = thread::Builder::new()
            .name("bufdaemon".into())
            .spawn(move || run(worker));
        match handle {
            Ok(handle) => Ok(Self {
                inner,
                handle: Some(handle),
            }),
            Err(e) => {
                inner.control.stopped(false);
                Err(e.into())
            }
        }
    }

    /// Wakes the daemon for an urgent drain.
    pub fn wake(&self) {
        self.inner.control.speedup();
    }

    /// Stops the daemon and waits for it to exit.
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        if let Some(handle) = self.handle.take() {
            self.inner.control.shutdown();
            let _ = handle.join();
        }
    }
}

impl Drop for WritebackDaemon {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for WritebackDaemon {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WritebackDaemon")
            .field("running", &self.handle.is_some())
            .finish()
    }
}

fn run(inner: Arc<CacheInner>) {
    let interval = inner.config.daemon_interval();
    let backoff = inner.config.daemon_backoff();
    info!(
        ?interval,
        hi_dirty = inner.config.hi_dirty,
        lo_dirty = inner.config.lo_dirty,
        "write-back daemon started"
    );

    while inner.control.wait(interval) {
        let flushed = inner.daemon_tick();
        if flushed == 0 && inner.space.dirty() > inner.config.lo_dirty {
            // could not reach the low watermark
            if !inner.control.pause(backoff) {
                break;
            }
            inner.control.request();
        }
    }

    inner.control.stopped(inner.is_shutting_down());
    info!("write-back daemon stopped");
}

#[cfg(test)]
mod tests {
    use std::time::Instant;

    use blkcache_common::types::{BlockNo, ObjectId};

    use super::*;
    use crate::buffer::{CacheConfig, GetOptions, StorageObject};
    use crate::io::MemDevice;

    fn dirty_cache(nbuf: usize, count: i64) -> (BufferCache, Arc<StorageObject>) {
        let config = CacheConfig::new(nbuf)
            .with_dirty_watermarks(4, 8)
            .with_clustering(false, 0)
            .with_daemon_timing(Duration::from_millis(20), Duration::from_millis(1));
        let cache = BufferCache::new(config).unwrap();
        let obj = StorageObject::new(ObjectId::new(1), Arc::new(MemDevice::new()));
        for b in 0..count {
            let buf = cache.get(&obj, BlockNo::new(b), 4096, &GetOptions::new()).unwrap();
            cache.delayed_write(buf).unwrap();
        }
        (cache, obj)
    }

    #[test]
    fn test_tick_drains_to_low_watermark() {
        let (cache, _obj) = dirty_cache(32, 7);
        assert_eq!(cache.daemon_tick(), 3);
        assert_eq!(cache.space().dirty_buffers, 4);
        assert_eq!(cache.daemon_tick(), 0);
    }

    #[test]
    fn test_urgent_tick_halves_dirty_count() {
        let (cache, _obj) = dirty_cache(32, 4);
        assert_eq!(cache.daemon_tick(), 0);
        cache.speedup();
        assert_eq!(cache.daemon_tick(), 2);
        assert_eq!(cache.space().dirty_buffers, 2);
        // the urgent request is consumed
        assert_eq!(cache.daemon_tick(), 0);
    }

    #[test]
    fn test_daemon_thread_drains_and_stops() {
        let (cache, _obj) = dirty_cache(32, 7);
        let daemon = WritebackDaemon::spawn(&cache).unwrap();
        assert!(WritebackDaemon::spawn(&cache).is_err());
        daemon.wake();

        let deadline = Instant::now() + Duration::from_secs(5);
        while cache.space().dirty_buffers > 4 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert!(cache.space().dirty_buffers <= 4);
        daemon.stop();

        // a stopped daemon can be started again
        let again = WritebackDaemon::spawn(&cache).unwrap();
        drop(again);
    }

    #[test]
    fn test_spawn_after_shutdown_fails() {
        let (cache, _obj) = dirty_cache(32, 0);
        cache.shutdown().unwrap();
        assert!(matches!(
            WritebackDaemon::spawn(&cache),
            Err(CacheError::ShuttingDown)
        ));
    }

    #[test]
    fn test_control_flags() {
        let control = DaemonControl::new();
        control.speedup();
        assert!(control.wait(Duration::from_secs(5)));
        assert!(control.take_urgent());
        assert!(!control.take_urgent());

        control.shutdown();
        assert!(!control.wait(Duration::from_secs(5)));
        assert!(!control.try_start());
    }
}
