//! In-memory block device.
//!
//! Stores data per object in [`DEV_BSIZE`] sectors. Requests complete either
//! inside [`IoStrategy::strategy`] or later, when the owner of the device
//! drains the pending queue; write faults can be injected to exercise the
//! cache's retry and error paths.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};

use blkcache_common::constants::DEV_BSIZE;
use blkcache_common::types::{BlockNo, ObjectId};
use parking_lot::Mutex;

use super::{DeviceError, IoOp, IoRequest, IoStrategy};

/// When requests complete.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    /// Inside the `strategy` call.
    Inline,
    /// When [`MemDevice::complete_next`] or [`MemDevice::complete_all`]
    /// runs.
    Deferred,
}

/// A write the device has accepted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteRecord {
    /// Target object.
    pub object: ObjectId,
    /// First device block.
    pub block: BlockNo,
    /// Length in bytes.
    pub len: usize,
    /// Number of buffers in the request.
    pub buffers: usize,
}

/// In-memory block device.
pub struct MemDevice {
    mode: Completion,
    sectors: Mutex<HashMap<(ObjectId, i64), Vec<u8>>>,
    pending: Mutex<VecDeque<IoRequest>>,
    faults: Mutex<VecDeque<DeviceError>>,
    log: Mutex<Vec<WriteRecord>>,
    reads: AtomicU64,
    writes: AtomicU64,
}

impl MemDevice {
    /// Creates a device that completes requests inline.
    pub fn new() -> Self {
        Self::with_completion(Completion::Inline)
    }

    /// Creates a device with the given completion mode.
    pub fn with_completion(mode: Completion) -> Self {
        Self {
            mode,
            sectors: Mutex::new(HashMap::new()),
            pending: Mutex::new(VecDeque::new()),
            faults: Mutex::new(VecDeque::new()),
            log: Mutex::new(Vec::new()),
            reads: AtomicU64::new(0),
            writes: AtomicU64::new(0),
        }
    }

    /// Fails the next writes with `errors`, in order.
    pub fn inject_write_faults(&self, errors: impl IntoIterator<Item = DeviceError>) {
        self.faults.lock().extend(errors);
    }

    /// Completes the oldest pending request. Returns false if none.
    pub fn complete_next(&self) -> bool {
        let request = self.pending.lock().pop_front();
        match request {
            Some(request) => {
                self.service(request);
                true
            }
            None => false,
        }
    }

    /// Completes every pending request, including ones queued while
    /// draining. Returns how many completed.
    pub fn complete_all(&self) -> usize {
        let mut n = 0;
        while self.complete_next() {
            n += 1;
        }
        n
    }

    /// Returns the number of requests awaiting completion.
    pub fn pending(&self) -> usize {
        self.pending.lock().len()
    }

    /// Reads `len` bytes of `object` starting at device block `block`
    /// directly from the store. Unwritten sectors read as zeros.
    pub fn read_raw(&self, object: ObjectId, block: BlockNo, len: usize) -> Vec<u8> {
        let mut out = vec![0u8; len];
        let sectors = self.sectors.lock();
        for (i, chunk) in out.chunks_mut(DEV_BSIZE).enumerate() {
            let key = (object, block.as_i64() + i as i64);
            if let Some(sector) = sectors.get(&key) {
                chunk.copy_from_slice(&sector[..chunk.len()]);
            }
        }
        out
    }

    /// Returns every accepted write, in order.
    pub fn write_log(&self) -> Vec<WriteRecord> {
        self.log.lock().clone()
    }

    /// Returns the number of reads serviced.
    pub fn reads(&self) -> u64 {
        self.reads.load(Ordering::Relaxed)
    }

    /// Returns the number of writes serviced successfully.
    pub fn writes(&self) -> u64 {
        self.writes.load(Ordering::Relaxed)
    }

    fn service(&self, mut request: IoRequest) {
        match request.op() {
            IoOp::Read => {
                self.reads.fetch_add(1, Ordering::Relaxed);
                let data = self.read_raw(request.object(), request.block(), request.len());
                request.data_mut().copy_from_slice(&data);
                request.complete(Ok(()));
            }
            IoOp::Write => {
                let fault = self.faults.lock().pop_front();
                if let Some(err) = fault {
                    request.complete(Err(err));
                    return;
                }
                {
                    let mut sectors = self.sectors.lock();
                    for (i, chunk) in request.data().chunks(DEV_BSIZE).enumerate() {
                        let mut sector = vec![0u8; DEV_BSIZE];
                        sector[..chunk.len()].copy_from_slice(chunk);
                        sectors.insert((request.object(), request.block().as_i64() + i as i64), sector);
                    }
                }
                self.log.lock().push(WriteRecord {
                    object: request.object(),
                    block: request.block(),
                    len: request.len(),
                    buffers: request.buffer_count(),
                });
                self.writes.fetch_add(1, Ordering::Relaxed);
                request.complete(Ok(()));
            }
        }
    }
}

impl Default for MemDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl IoStrategy for MemDevice {
    fn strategy(&self, request: IoRequest) {
        match self.mode {
            Completion::Inline => self.service(request),
            Completion::Deferred => self.pending.lock().push_back(request),
        }
    }
}

impl std::fmt::Debug for MemDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemDevice")
            .field("mode", &self.mode)
            .field("sectors", &self.sectors.lock().len())
            .field("pending", &self.pending())
            .field("reads", &self.reads())
            .field("writes", &self.writes())
            .finish()
    }
}
