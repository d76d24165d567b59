#![forbid(unsafe_code)]

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use super::page::Page;
use crate::primitives::concurrency::PageLock;
use crate::types::{FileId, FrameId, PageId};

/// Pin-count bit claimed by the evictor; no new pin can land while it is set.
const EVICTING: u32 = 1 << 31;

/// One cache slot: page bytes plus the metadata that binds them to a file page.
pub(crate) struct Frame {
    pub(crate) page: Page,
    pub(crate) lock: PageLock,
    pins: AtomicU32,
    usage: AtomicBool,
    file: AtomicU32,
    page_id: AtomicU64,
    last_modified_tx: AtomicU64,
}

impl Frame {
    fn new(page_size: usize) -> Self {
        Self {
            page: Page::new(page_size),
            lock: PageLock::new(),
            pins: AtomicU32::new(0),
            usage: AtomicBool::new(false),
            file: AtomicU32::new(FileId::UNBOUND.0),
            page_id: AtomicU64::new(0),
            last_modified_tx: AtomicU64::new(0),
        }
    }

    /// Adds a pin unless the frame is being evicted.
    pub(crate) fn try_pin(&self) -> bool {
        self.pins
            .fetch_update(Ordering::Acquire, Ordering::Relaxed, |p| {
                (p & EVICTING == 0).then_some(p + 1)
            })
            .is_ok()
    }

    /// Drops one pin and returns true if it was the last.
    pub(crate) fn unpin(&self) -> bool {
        let prev = self.pins.fetch_sub(1, Ordering::Release);
        debug_assert!(prev & !EVICTING > 0, "unpin without pin");
        prev == 1
    }

    pub(crate) fn pin_count(&self) -> u32 {
        self.pins.load(Ordering::Acquire) & !EVICTING
    }

    /// Claims an unpinned frame for eviction.
    pub(crate) fn try_claim(&self) -> bool {
        self.pins
            .compare_exchange(0, EVICTING, Ordering::AcqRel, Ordering::Relaxed)
            .is_ok()
    }

    pub(crate) fn release_claim(&self) {
        self.pins.store(0, Ordering::Release);
    }

    /// Stamp for an optimistic read of this frame.
    pub(crate) fn begin_read_stamp(&self) -> u64 {
        self.lock.try_optimistic_read()
    }

    /// Returns true if the page did not change since `stamp` was taken.
    pub(crate) fn validate(&self, stamp: u64) -> bool {
        self.lock.validate_read(stamp)
    }

    pub(crate) fn touch(&self) {
        self.usage.store(true, Ordering::Relaxed);
    }

    /// Clears the usage bit and returns its previous value.
    pub(crate) fn take_usage(&self) -> bool {
        self.usage.swap(false, Ordering::Relaxed)
    }

    pub(crate) fn bind(&self, file: FileId, page_id: PageId) {
        self.page_id.store(page_id.0, Ordering::Relaxed);
        self.last_modified_tx.store(0, Ordering::Relaxed);
        self.file.store(file.0, Ordering::Release);
    }

    pub(crate) fn unbind(&self) {
        self.file.store(FileId::UNBOUND.0, Ordering::Release);
        self.last_modified_tx.store(0, Ordering::Relaxed);
    }

    pub(crate) fn file(&self) -> FileId {
        FileId(self.file.load(Ordering::Acquire))
    }

    pub(crate) fn page_id(&self) -> PageId {
        PageId(self.page_id.load(Ordering::Relaxed))
    }

    pub(crate) fn is_bound_to(&self, file: FileId, page_id: PageId) -> bool {
        self.file() == file && self.page_id() == page_id
    }

    pub(crate) fn last_modified_tx(&self) -> u64 {
        self.last_modified_tx.load(Ordering::Acquire)
    }

    pub(crate) fn raise_last_modified_tx(&self, tx: u64) {
        self.last_modified_tx.fetch_max(tx, Ordering::AcqRel);
    }
}

/// Fixed array of frames plus the free list.
pub(crate) struct FramePool {
    frames: Box<[Frame]>,
    page_size: usize,
    free: Mutex<Vec<FrameId>>,
    free_len: AtomicUsize,
    waiters: AtomicUsize,
    released_lock: Mutex<()>,
    released: Condvar,
}

impl FramePool {
    pub(crate) fn new(frame_count: usize, page_size: usize) -> Self {
        let frames: Box<[Frame]> = (0..frame_count).map(|_| Frame::new(page_size)).collect();
        // Popped from the back, so frame 0 is handed out first.
        let free: Vec<FrameId> = (0..frame_count as u32).rev().map(FrameId).collect();
        Self {
            frames,
            page_size,
            free_len: AtomicUsize::new(free.len()),
            free: Mutex::new(free),
            waiters: AtomicUsize::new(0),
            released_lock: Mutex::new(()),
            released: Condvar::new(),
        }
    }

    pub(crate) fn frame(&self, id: FrameId) -> &Frame {
        &self.frames[id.index()]
    }

    pub(crate) fn len(&self) -> usize {
        self.frames.len()
    }

    pub(crate) fn page_size(&self) -> usize {
        self.page_size
    }

    pub(crate) fn free_len(&self) -> usize {
        self.free_len.load(Ordering::Acquire)
    }

    pub(crate) fn pop_free(&self) -> Option<FrameId> {
        let mut free = self.free.lock();
        let id = free.pop()?;
        self.free_len.store(free.len(), Ordering::Release);
        Some(id)
    }

    pub(crate) fn push_free(&self, id: FrameId) {
        {
            let mut free = self.free.lock();
            free.push(id);
            self.free_len.store(free.len(), Ordering::Release);
        }
        self.notify_released();
    }

    /// Drops a pin and wakes blocked faults when the frame became evictable.
    pub(crate) fn unpin(&self, id: FrameId) {
        if self.frame(id).unpin() {
            self.notify_released();
        }
    }

    fn notify_released(&self) {
        if self.waiters.load(Ordering::Acquire) > 0 {
            let _guard = self.released_lock.lock();
            self.released.notify_all();
        }
    }

    /// Blocks until a pin is released, a frame is freed, or `timeout` passes.
    pub(crate) fn wait_for_release(&self, timeout: Duration) {
        self.waiters.fetch_add(1, Ordering::AcqRel);
        {
            let mut guard = self.released_lock.lock();
            let _ = self.released.wait_for(&mut guard, timeout);
        }
        self.waiters.fetch_sub(1, Ordering::AcqRel);
    }
}
