//! Address-space arena for buffer data.
//!
//! The arena hands out contiguous, quantum-aligned ranges with a first-fit
//! search over a slot bitmap. A request larger than every free run fails
//! with [`Fragmented`] even when the free total would suffice; the cache
//! then works around the fragmentation by taking over an idle buffer's
//! reservation instead of waiting.

use parking_lot::Mutex;
use thiserror::Error;

/// A reserved range of the arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KvaRange {
    base: usize,
    size: usize,
}

impl KvaRange {
    /// Returns the base offset within the arena.
    pub fn base(self) -> usize {
        self.base
    }

    /// Returns the size in bytes.
    pub fn size(self) -> usize {
        self.size
    }
}

/// No free run is large enough for the request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("address space fragmented: requested {requested} bytes, {free} free, largest run {largest}")]
pub struct Fragmented {
    /// Bytes requested, after rounding.
    pub requested: usize,
    /// Total free bytes.
    pub free: usize,
    /// Largest contiguous free run in bytes.
    pub largest: usize,
}

struct SlotMap {
    used: Vec<bool>,
    free: usize,
}

impl SlotMap {
    fn longest_run(&self) -> usize {
        let mut best = 0;
        let mut run = 0;
        for &used in &self.used {
            if used {
                run = 0;
            } else {
                run += 1;
                best = best.max(run);
            }
        }
        best
    }
}

/// Fixed-size address-space arena.
pub struct KvaArena {
    quantum: usize,
    slots: Mutex<SlotMap>,
}

impl KvaArena {
    /// Creates an arena of `size` bytes carved into `quantum`-byte slots.
    pub fn new(size: usize, quantum: usize) -> Self {
        let count = size / quantum;
        Self {
            quantum,
            slots: Mutex::new(SlotMap {
                used: vec![false; count],
                free: count,
            }),
        }
    }

    /// Rounds `size` up to the reservation granularity.
    pub fn round(&self, size: usize) -> usize {
        size.max(1).div_ceil(self.quantum) * self.quantum
    }

    /// Reserves at least `min_size` contiguous bytes.
    pub fn reserve(&self, min_size: usize) -> Result<KvaRange, Fragmented> {
        let size = self.round(min_size);
        let mut map = self.slots.lock();
        self.reserve_in(&mut map, size)
    }

    /// Trades `old` for a range of at least `min_size` bytes in one step.
    ///
    /// The old range takes part in the search, so a request that fits only
    /// once it is returned still succeeds. On failure `old` stays reserved.
    pub fn exchange(&self, old: KvaRange, min_size: usize) -> Result<KvaRange, Fragmented> {
        let size = self.round(min_size);
        let mut map = self.slots.lock();
        self.mark(&mut map, old, false);
        match self.reserve_in(&mut map, size) {
            Ok(range) => Ok(range),
            Err(frag) => {
                self.mark(&mut map, old, true);
                Err(frag)
            }
        }
    }

    fn reserve_in(&self, map: &mut SlotMap, size: usize) -> Result<KvaRange, Fragmented> {
        let want = size / self.quantum;
        let mut start = 0;
        let mut run = 0;
        for i in 0..map.used.len() {
            if map.used[i] {
                run = 0;
                start = i + 1;
                continue;
            }
            run += 1;
            if run == want {
                map.used[start..=i].iter_mut().for_each(|s| *s = true);
                map.free -= want;
                return Ok(KvaRange {
                    base: start * self.quantum,
                    size,
                });
            }
        }

        Err(Fragmented {
            requested: size,
            free: map.free * self.quantum,
            largest: map.longest_run() * self.quantum,
        })
    }

    fn mark(&self, map: &mut SlotMap, range: KvaRange, used: bool) {
        let first = range.base / self.quantum;
        let count = range.size / self.quantum;
        for slot in &mut map.used[first..first + count] {
            if used {
                assert!(!*slot, "reserving busy address space at {}", range.base);
            } else {
                assert!(*slot, "releasing unreserved address space at {}", range.base);
            }
            *slot = used;
        }
        if used {
            map.free -= count;
        } else {
            map.free += count;
        }
    }

    /// Returns a range to the arena.
    ///
    /// # Panics
    ///
    /// Panics if any part of the range is not currently reserved.
    pub fn release(&self, range: KvaRange) {
        let mut map = self.slots.lock();
        self.mark(&mut map, range, false);
    }

    /// Returns the total free bytes.
    pub fn free_bytes(&self) -> usize {
        self.slots.lock().free * self.quantum
    }

    /// Returns the largest contiguous free run in bytes.
    pub fn largest_free(&self) -> usize {
        self.slots.lock().longest_run() * self.quantum
    }

    /// Returns the arena size in bytes.
    pub fn capacity(&self) -> usize {
        self.slots.lock().used.len() * self.quantum
    }

    /// Returns the reservation granularity.
    pub fn quantum(&self) -> usize {
        self.quantum
    }
}

impl std::fmt::Debug for KvaArena {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KvaArena")
            .field("quantum", &self.quantum)
            .field("capacity", &self.capacity())
            .field("free", &self.free_bytes())
            .finish()
    }
}
