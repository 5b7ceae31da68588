//! Backing pages for buffer data.
//!
//! The cache does not manage physical memory itself. It asks a
//! [`PageProvider`] for the pages backing a buffer's data region when the
//! buffer grows, gives them back when it shrinks or is stripped, and tells
//! the provider which byte ranges now hold valid device contents.

use std::ops::Range;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

/// Opaque handle to one backing page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PageRef(u64);

impl PageRef {
    /// Creates a page handle from a provider-specific number.
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// Returns the provider-specific number.
    pub const fn raw(self) -> u64 {
        self.0
    }
}

/// Supplier of backing pages.
pub trait PageProvider: Send + Sync {
    /// Allocates `count` pages, or returns `None` if memory is short.
    fn alloc(&self, count: usize) -> Option<Vec<PageRef>>;

    /// Returns pages to the provider.
    fn free(&self, pages: Vec<PageRef>);

    /// Records that `range` (bytes from the start of `pages`) holds valid
    /// device contents.
    fn mark_valid(&self, _pages: &[PageRef], _range: Range<usize>) {}

    /// Records that `range` has been modified in memory.
    fn mark_dirty(&self, _pages: &[PageRef], _range: Range<usize>) {}
}

/// A page provider backed by a simple counter.
///
/// Hands out sequentially numbered pages up to an optional limit.
#[derive(Debug)]
pub struct CountingPages {
    next: AtomicU64,
    in_use: AtomicUsize,
    limit: usize,
}

impl CountingPages {
    /// Creates an unlimited provider.
    pub fn new() -> Self {
        Self::with_limit(usize::MAX)
    }

    /// Creates a provider that never has more than `limit` pages out.
    pub fn with_limit(limit: usize) -> Self {
        Self {
            next: AtomicU64::new(0),
            in_use: AtomicUsize::new(0),
            limit,
        }
    }

    /// Returns the number of pages currently allocated.
    pub fn in_use(&self) -> usize {
        self.in_use.load(Ordering::Acquire)
    }
}

impl Default for CountingPages {
    fn default() -> Self {
        Self::new()
    }
}

impl PageProvider for CountingPages {
    fn alloc(&self, count: usize) -> Option<Vec<PageRef>> {
        self.in_use
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |cur| {
                cur.checked_add(count).filter(|&n| n <= self.limit)
            })
            .ok()?;
        let first = self.next.fetch_add(count as u64, Ordering::Relaxed);
        Some((first..first + count as u64).map(PageRef).collect())
    }

    fn free(&self, pages: Vec<PageRef>) {
        self.in_use.fetch_sub(pages.len(), Ordering::AcqRel);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alloc_and_free() {
        let pages = CountingPages::new();
        let a = pages.alloc(3).unwrap();
        assert_eq!(a.len(), 3);
        assert_eq!(pages.in_use(), 3);
        let b = pages.alloc(1).unwrap();
        assert_ne!(a[0], b[0]);
        pages.free(a);
        assert_eq!(pages.in_use(), 1);
    }

    #[test]
    fn test_limit() {
        let pages = CountingPages::with_limit(2);
        let a = pages.alloc(2).unwrap();
        assert!(pages.alloc(1).is_none());
        pages.free(a);
        assert!(pages.alloc(1).is_some());
    }
}
