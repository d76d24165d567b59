#![forbid(unsafe_code)]

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Live counters updated on the hot path.
#[derive(Default, Debug)]
pub(crate) struct CacheCounters {
    pub(crate) hits: AtomicU64,
    pub(crate) faults: AtomicU64,
    pub(crate) evictions: AtomicU64,
    pub(crate) eviction_flushes: AtomicU64,
    pub(crate) eviction_errors: AtomicU64,
    pub(crate) cooperative_evictions: AtomicU64,
    pub(crate) flushes: AtomicU64,
    pub(crate) pins: AtomicU64,
    pub(crate) unpins: AtomicU64,
    pub(crate) bytes_read: AtomicU64,
    pub(crate) bytes_written: AtomicU64,
}

impl CacheCounters {
    pub(crate) fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn add(counter: &AtomicU64, value: u64) {
        counter.fetch_add(value, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self, free_pages: usize, max_pages: usize) -> PageCacheStats {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        PageCacheStats {
            hits: load(&self.hits),
            faults: load(&self.faults),
            evictions: load(&self.evictions),
            eviction_flushes: load(&self.eviction_flushes),
            eviction_errors: load(&self.eviction_errors),
            cooperative_evictions: load(&self.cooperative_evictions),
            flushes: load(&self.flushes),
            pins: load(&self.pins),
            unpins: load(&self.unpins),
            bytes_read: load(&self.bytes_read),
            bytes_written: load(&self.bytes_written),
            free_pages: free_pages as u64,
            max_pages: max_pages as u64,
        }
    }
}

/// Point-in-time view of cache activity.
#[derive(Default, Clone, Debug, PartialEq, Eq, Serialize)]
pub struct PageCacheStats {
    /// Pins served by a resident frame.
    pub hits: u64,
    /// Pins that loaded the page from its file.
    pub faults: u64,
    /// Frames reclaimed by eviction.
    pub evictions: u64,
    /// Evictions that had to write a dirty page first.
    pub eviction_flushes: u64,
    /// Evictions that failed to write back.
    pub eviction_errors: u64,
    /// Evictions run inline by a faulting thread.
    pub cooperative_evictions: u64,
    /// Pages written by explicit flushes.
    pub flushes: u64,
    /// Pins taken by cursors.
    pub pins: u64,
    /// Pins released by cursors.
    pub unpins: u64,
    /// Bytes loaded from files.
    pub bytes_read: u64,
    /// Bytes written to files.
    pub bytes_written: u64,
    /// Frames on the free list when the snapshot was taken.
    pub free_pages: u64,
    /// Total frames.
    pub max_pages: u64,
}

impl PageCacheStats {
    /// Fraction of pins served without a fault.
    pub fn hit_ratio(&self) -> f64 {
        let total = self.hits + self.faults;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

impl fmt::Display for PageCacheStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "hits={} faults={} evictions={} eviction_flushes={} flushes={} free={}/{}",
            self.hits,
            self.faults,
            self.evictions,
            self.eviction_flushes,
            self.flushes,
            self.free_pages,
            self.max_pages
        )
    }
}
