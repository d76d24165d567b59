#![forbid(unsafe_code)]

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{fence, AtomicBool, AtomicI64, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use tracing::{trace, warn};

use super::cache::CacheCore;
use super::cursor::{AccessMode, IoOptions, PageCursor};
use super::options::MapOptions;
use super::stats::CacheCounters;
use super::swapper::PageSwapper;
use super::translation::{FaultClaim, Slot, TranslationTable};
use super::version::CursorContext;
use crate::primitives::concurrency::{Backoff, Latch};
use crate::types::{CacheError, FileId, FrameId, PageId, Result, TxId};

/// A frame pinned by a cursor.
#[derive(Clone, Copy, Debug)]
pub(crate) struct Pin {
    pub(crate) frame: FrameId,
    pub(crate) page_id: PageId,
    /// Optimistic read stamp; unused for write and exclusive pins.
    pub(crate) stamp: u64,
}

/// Shared state of one mapped file.
pub(crate) struct MappedFile {
    pub(crate) id: FileId,
    pub(crate) path: PathBuf,
    pub(crate) page_size: usize,
    pub(crate) record_size: Option<usize>,
    pub(crate) version_tracking: bool,
    pub(crate) swapper: Arc<dyn PageSwapper>,
    pub(crate) table: TranslationTable,
    /// Open handles; only mutated under the cache mapping lock.
    pub(crate) refs: AtomicUsize,
    /// `-1` for an empty file.
    last_page: AtomicI64,
    highest_evicted_tx: AtomicU64,
    closed: AtomicBool,
    delete_on_close: AtomicBool,
}

impl MappedFile {
    pub(crate) fn new(
        id: FileId,
        path: PathBuf,
        options: &MapOptions,
        swapper: Arc<dyn PageSwapper>,
        striping: usize,
    ) -> Result<Self> {
        let last_page = match swapper.last_page_id()? {
            Some(PageId(id)) => i64::try_from(id)
                .map_err(|_| CacheError::Invalid("file too large for page ids"))?,
            None => -1,
        };
        Ok(Self {
            id,
            path,
            page_size: options.page_size,
            record_size: options.record_size,
            version_tracking: options.version_tracking,
            swapper,
            table: TranslationTable::new(striping),
            refs: AtomicUsize::new(1),
            last_page: AtomicI64::new(last_page),
            highest_evicted_tx: AtomicU64::new(0),
            closed: AtomicBool::new(false),
            delete_on_close: AtomicBool::new(options.delete_on_close),
        })
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub(crate) fn set_closed(&self, closed: bool) {
        self.closed.store(closed, Ordering::SeqCst);
    }

    pub(crate) fn is_delete_on_close(&self) -> bool {
        self.delete_on_close.load(Ordering::Acquire)
    }

    pub(crate) fn set_delete_on_close(&self, delete: bool) {
        self.delete_on_close.store(delete, Ordering::Release);
    }

    pub(crate) fn ensure_mapped(&self) -> Result<()> {
        if self.is_closed() {
            return Err(CacheError::FileNotMapped(self.path.clone()));
        }
        Ok(())
    }

    pub(crate) fn last_page_id(&self) -> Option<PageId> {
        let last = self.last_page.load(Ordering::Acquire);
        u64::try_from(last).ok().map(PageId)
    }

    pub(crate) fn grow_to(&self, page_id: PageId) {
        let target = i64::try_from(page_id.0).unwrap_or(i64::MAX);
        self.last_page.fetch_max(target, Ordering::AcqRel);
    }

    pub(crate) fn highest_evicted_tx(&self) -> TxId {
        TxId(self.highest_evicted_tx.load(Ordering::Acquire))
    }

    pub(crate) fn raise_highest_evicted_tx(&self, tx: u64) {
        self.highest_evicted_tx.fetch_max(tx, Ordering::AcqRel);
    }

    /// Pins `page_id`, faulting it in if needed, and takes the lock `mode` requires.
    pub(crate) fn pin(&self, core: &CacheCore, page_id: PageId, mode: AccessMode) -> Result<Pin> {
        let mut backoff = Backoff::new();
        loop {
            core.ensure_open()?;
            self.ensure_mapped()?;
            match self.table.get(page_id) {
                Some(Slot::Resident(frame)) => {
                    if let Some(pin) = self.try_pin_resident(core, frame, page_id, mode)? {
                        CacheCounters::bump(&core.counters.hits);
                        return Ok(pin);
                    }
                    backoff.snooze();
                }
                Some(Slot::Faulting(latch)) => latch.wait(),
                None => match self.table.begin_fault(page_id) {
                    FaultClaim::Leader(latch) => return self.fault(core, page_id, mode, latch),
                    FaultClaim::Existing => continue,
                },
            }
        }
    }

    /// Pins `page_id` only if it is already resident; never faults.
    pub(crate) fn pin_resident(
        &self,
        core: &CacheCore,
        page_id: PageId,
        mode: AccessMode,
    ) -> Result<Option<Pin>> {
        let mut backoff = Backoff::new();
        loop {
            core.ensure_open()?;
            self.ensure_mapped()?;
            let Some(Slot::Resident(frame)) = self.table.get(page_id) else {
                return Ok(None);
            };
            if let Some(pin) = self.try_pin_resident(core, frame, page_id, mode)? {
                CacheCounters::bump(&core.counters.hits);
                return Ok(Some(pin));
            }
            backoff.snooze();
        }
    }

    fn try_pin_resident(
        &self,
        core: &CacheCore,
        frame_id: FrameId,
        page_id: PageId,
        mode: AccessMode,
    ) -> Result<Option<Pin>> {
        let frame = core.pool.frame(frame_id);
        if !frame.try_pin() {
            return Ok(None);
        }
        // Pairs with the fence in unmap: either unmap sees this pin or we see `closed`.
        fence(Ordering::SeqCst);
        if !frame.is_bound_to(self.id, page_id) {
            core.pool.unpin(frame_id);
            return Ok(None);
        }
        if self.is_closed() {
            core.pool.unpin(frame_id);
            return Err(CacheError::FileNotMapped(self.path.clone()));
        }
        frame.touch();
        let stamp = match mode {
            AccessMode::SharedRead => frame.begin_read_stamp(),
            AccessMode::SharedWrite => {
                let mut backoff = Backoff::new();
                while !frame.lock.try_write_lock() {
                    backoff.snooze();
                }
                0
            }
            AccessMode::Exclusive => {
                let mut backoff = Backoff::new();
                while !frame.lock.try_exclusive_lock() {
                    backoff.snooze();
                }
                0
            }
        };
        Ok(Some(Pin {
            frame: frame_id,
            page_id,
            stamp,
        }))
    }

    fn fault(
        &self,
        core: &CacheCore,
        page_id: PageId,
        mode: AccessMode,
        latch: Arc<Latch>,
    ) -> Result<Pin> {
        let loaded = self.load_page(core, page_id);
        let frame_id = match loaded {
            Ok(frame_id) => {
                self.table.publish(page_id, frame_id);
                latch.release();
                frame_id
            }
            Err(err) => {
                self.table.abort_fault(page_id);
                latch.release();
                return Err(err);
            }
        };
        let frame = core.pool.frame(frame_id);
        let stamp = match mode {
            AccessMode::SharedRead => {
                frame.lock.unlock_exclusive();
                frame.begin_read_stamp()
            }
            AccessMode::SharedWrite => {
                frame.lock.unlock_exclusive_to_write();
                0
            }
            AccessMode::Exclusive => 0,
        };
        CacheCounters::bump(&core.counters.faults);
        Ok(Pin {
            frame: frame_id,
            page_id,
            stamp,
        })
    }

    /// Loads the page into a free frame, which is returned pinned and exclusively locked.
    fn load_page(&self, core: &CacheCore, page_id: PageId) -> Result<FrameId> {
        fence(Ordering::SeqCst);
        self.ensure_mapped()?;
        let frame_id = core.grab_free_frame()?;
        let frame = core.pool.frame(frame_id);
        let mut backoff = Backoff::new();
        // A sweep that read the binding before this frame was freed may hold a
        // claim until it sees the frame unbound.
        while !frame.try_pin() {
            backoff.snooze();
        }
        let mut backoff = Backoff::new();
        while !frame.lock.try_exclusive_lock() {
            backoff.snooze();
        }
        frame.bind(self.id, page_id);
        frame.touch();

        let mut buf = vec![0u8; core.pool.page_size()];
        match self.swapper.read(page_id, &mut buf) {
            Ok(n) => {
                frame.page.write_from(0, &buf);
                CacheCounters::add(&core.counters.bytes_read, n as u64);
                trace!(file = %self.id, page = page_id.0, frame = frame_id.0, "pagecache.fault");
                Ok(frame_id)
            }
            Err(err) => {
                warn!(
                    path = %self.path.display(),
                    page = page_id.0,
                    error = %err,
                    "pagecache.fault.failed"
                );
                frame.unbind();
                frame.lock.unlock_exclusive();
                core.pool.unpin(frame_id);
                core.pool.push_free(frame_id);
                Err(CacheError::PageFaultFailure {
                    path: self.path.clone(),
                    page_id,
                    source: Box::new(err),
                })
            }
        }
    }

    /// Writes every dirty resident page of this file, in page order.
    pub(crate) fn flush(&self, core: &CacheCore) -> Result<()> {
        let mut buf = vec![0u8; self.page_size];
        for (page_id, frame_id) in self.table.resident() {
            let frame = core.pool.frame(frame_id);
            if !frame.lock.is_modified() {
                continue;
            }
            let mut backoff = Backoff::new();
            let stamp = loop {
                if !frame.is_bound_to(self.id, page_id) {
                    break None;
                }
                if let Some(stamp) = frame.lock.try_flush_lock() {
                    break Some(stamp);
                }
                backoff.snooze();
            };
            let Some(stamp) = stamp else { continue };
            // Eviction needs the exclusive lock, so the binding is stable from here.
            if !frame.is_bound_to(self.id, page_id) {
                frame.lock.unlock_flush(stamp, false);
                continue;
            }
            frame.page.read_into(0, &mut buf);
            let written = self.swapper.write(page_id, &buf);
            frame.lock.unlock_flush(stamp, written.is_ok());
            written?;
            CacheCounters::bump(&core.counters.flushes);
            CacheCounters::add(&core.counters.bytes_written, buf.len() as u64);
        }
        Ok(())
    }

    /// Returns true while any frame of this file is pinned or being faulted.
    pub(crate) fn in_use(&self, core: &CacheCore) -> bool {
        fence(Ordering::SeqCst);
        self.table.has_faults_in_flight()
            || self
                .table
                .resident()
                .into_iter()
                .any(|(_, frame)| core.pool.frame(frame).pin_count() > 0)
    }
}

/// Handle to a file mapped into a [`crate::PageCache`].
///
/// Each successful `map` returns one handle and adds one reference; the file
/// is flushed and released when the last handle is unmapped or dropped.
pub struct PagedFile {
    pub(crate) core: Arc<CacheCore>,
    pub(crate) file: Arc<MappedFile>,
    released: AtomicBool,
}

impl PagedFile {
    pub(crate) fn new(core: Arc<CacheCore>, file: Arc<MappedFile>) -> Self {
        Self {
            core,
            file,
            released: AtomicBool::new(false),
        }
    }

    /// Opens a cursor positioned before `page_id`; the first `next()` pins it.
    pub fn io(
        &self,
        page_id: impl Into<PageId>,
        options: impl Into<IoOptions>,
        context: &CursorContext,
    ) -> Result<PageCursor> {
        self.core.ensure_open()?;
        self.file.ensure_mapped()?;
        Ok(PageCursor::new(
            Arc::clone(&self.core),
            Arc::clone(&self.file),
            page_id.into(),
            options.into(),
            context.clone(),
        ))
    }

    /// Highest page id in the file, `None` when empty.
    pub fn last_page_id(&self) -> Result<Option<PageId>> {
        self.core.ensure_open()?;
        self.file.ensure_mapped()?;
        Ok(self.file.last_page_id())
    }

    /// Logical file size in bytes, counting pages not yet written back.
    pub fn file_size(&self) -> Result<u64> {
        Ok(self
            .last_page_id()?
            .map_or(0, |last| (last.0 + 1) * self.file.page_size as u64))
    }

    /// Writes every dirty page of this file back through its swapper.
    pub fn flush(&self) -> Result<()> {
        self.core.ensure_open()?;
        self.file.ensure_mapped()?;
        self.file.flush(&self.core)
    }

    /// Flushes, then forces the swapper to stable storage.
    pub fn flush_and_force(&self) -> Result<()> {
        self.flush()?;
        self.file.swapper.force()
    }

    /// File page size in bytes.
    pub fn page_size(&self) -> usize {
        self.file.page_size
    }

    /// Path the file was mapped with.
    pub fn path(&self) -> &Path {
        &self.file.path
    }

    /// Record size given at map time.
    pub fn record_size(&self) -> Option<usize> {
        self.file.record_size
    }

    /// Whole records that fit in one page, `0` without a record size.
    pub fn records_per_page(&self) -> usize {
        self.file
            .record_size
            .map_or(0, |size| self.file.page_size / size)
    }

    /// Page id and byte offset of `record_id`.
    pub fn record_location(&self, record_id: u64) -> Result<(PageId, usize)> {
        let per_page = self.records_per_page() as u64;
        let size = self
            .file
            .record_size
            .ok_or(CacheError::Invalid("file was mapped without a record size"))?;
        Ok((
            PageId(record_id / per_page),
            (record_id % per_page) as usize * size,
        ))
    }

    /// Removes the file from disk, without flushing, once the last mapping goes.
    pub fn set_delete_on_close(&self, delete: bool) {
        self.file.set_delete_on_close(delete);
    }

    /// Returns true if the file is removed when the last mapping goes.
    pub fn is_delete_on_close(&self) -> bool {
        self.file.is_delete_on_close()
    }

    /// Unmaps this handle; equivalent to [`crate::PageCache::unmap`].
    pub fn close(self) -> Result<()> {
        self.core.unmap(&self)
    }

    /// Marks the handle released; false if it already was.
    pub(crate) fn release(&self) -> bool {
        !self.released.swap(true, Ordering::AcqRel)
    }

    pub(crate) fn unrelease(&self) {
        self.released.store(false, Ordering::Release);
    }
}

impl Drop for PagedFile {
    fn drop(&mut self) {
        if self.released.load(Ordering::Acquire) || self.core.is_closed() {
            return;
        }
        if let Err(err) = self.core.unmap(self) {
            warn!(
                path = %self.file.path.display(),
                error = %err,
                "pagecache.file.drop_unmap_failed"
            );
        }
    }
}

impl fmt::Debug for PagedFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PagedFile")
            .field("path", &self.file.path)
            .field("file", &self.file.id)
            .field("page_size", &self.file.page_size)
            .finish()
    }
}
