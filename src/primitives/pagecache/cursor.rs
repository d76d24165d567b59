#![forbid(unsafe_code)]

use std::fmt;
use std::sync::Arc;

use super::cache::CacheCore;
use super::paged_file::{MappedFile, Pin};
use super::stats::CacheCounters;
use super::version::CursorContext;
use crate::types::{CacheError, PageId, Result, TxId};

/// How a cursor accesses its pages.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum AccessMode {
    /// Lock-free optimistic reads validated by [`PageCursor::should_retry`].
    SharedRead,
    /// Shared write lock; other writers may hold the page concurrently.
    SharedWrite,
    /// Sole writer of the page.
    Exclusive,
}

impl AccessMode {
    /// Returns true for modes that may write.
    pub fn is_write(self) -> bool {
        !matches!(self, AccessMode::SharedRead)
    }
}

/// Cursor options passed to [`crate::PagedFile::io`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct IoOptions {
    /// Lock mode.
    pub mode: AccessMode,
    /// Stop write cursors at the end of the file instead of growing it.
    pub no_grow: bool,
    /// Bind only pages already in the cache; implies `no_grow`.
    ///
    /// `next()` on a page that is not resident still returns true but leaves
    /// the cursor unbound, so accesses raise the bounds flag.
    pub no_fault: bool,
}

impl IoOptions {
    fn grows(&self) -> bool {
        self.mode.is_write() && !self.no_grow && !self.no_fault
    }
}

impl From<AccessMode> for IoOptions {
    fn from(mode: AccessMode) -> Self {
        Self {
            mode,
            no_grow: false,
            no_fault: false,
        }
    }
}

/// Positioned access to the pages of one file.
///
/// A cursor is unbound until [`PageCursor::next`] pins a page. While bound it
/// holds exactly one pin; moving to another page releases it first. Reads
/// through a [`AccessMode::SharedRead`] cursor take no lock and must be
/// validated:
///
/// ```no_run
/// # use sombra_pagecache::{AccessMode, CursorContext, PageCache, Result};
/// # fn demo(cache: &PageCache) -> Result<()> {
/// let file = cache.map("data.db", 8192)?;
/// let mut cursor = file.io(0u64, AccessMode::SharedRead, &CursorContext::none())?;
/// while cursor.next()? {
///     let value = loop {
///         let value = cursor.get_u64_at(0);
///         if !cursor.should_retry()? {
///             break value;
///         }
///     };
///     println!("{value}");
/// }
/// # Ok(())
/// # }
/// ```
///
/// Out-of-bounds accesses never panic: reads yield zero, writes are dropped
/// and the bounds flag is raised until [`PageCursor::check_and_clear_bounds_flag`].
/// Accessing a closed cursor is a programming error and panics.
pub struct PageCursor {
    core: Arc<CacheCore>,
    file: Arc<MappedFile>,
    options: IoOptions,
    context: CursorContext,
    next_page_id: PageId,
    current: Option<Pin>,
    offset: usize,
    mark: usize,
    mark_out_of_bounds: bool,
    out_of_bounds: bool,
    exception: Option<String>,
    linked: Option<Box<PageCursor>>,
    closed: bool,
}

impl PageCursor {
    pub(crate) fn new(
        core: Arc<CacheCore>,
        file: Arc<MappedFile>,
        page_id: PageId,
        options: IoOptions,
        context: CursorContext,
    ) -> Self {
        Self {
            core,
            file,
            options,
            context,
            next_page_id: page_id,
            current: None,
            offset: 0,
            mark: 0,
            mark_out_of_bounds: false,
            out_of_bounds: false,
            exception: None,
            linked: None,
            closed: false,
        }
    }

    fn reopen(&mut self, page_id: PageId) {
        self.next_page_id = page_id;
        self.offset = 0;
        self.out_of_bounds = false;
        self.exception = None;
        self.closed = false;
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed {
            return Err(CacheError::CursorClosed);
        }
        Ok(())
    }

    /// Access mode of this cursor.
    pub fn mode(&self) -> AccessMode {
        self.options.mode
    }

    /// Page the cursor is bound to, if any.
    pub fn current_page_id(&self) -> Option<PageId> {
        self.current.map(|pin| pin.page_id)
    }

    /// Usable bytes per page; `0` while unbound.
    pub fn page_size(&self) -> usize {
        if self.current.is_some() {
            self.file.page_size
        } else {
            0
        }
    }

    /// Moves to the next page.
    ///
    /// Read cursors return `false` past the last page. Write cursors grow the
    /// file instead, unless opened with `no_grow` or `no_fault`. A `no_fault`
    /// cursor moves onto a page that is not resident without binding it. On
    /// error the cursor is left unbound.
    pub fn next(&mut self) -> Result<bool> {
        self.ensure_open()?;
        self.unpin();
        let page_id = self.next_page_id;
        let last = self.file.last_page_id();
        let past_end = last.map_or(true, |last| page_id > last);
        if past_end && !self.options.grows() {
            self.core.ensure_open()?;
            self.file.ensure_mapped()?;
            return Ok(false);
        }
        let pin = if self.options.no_fault {
            match self.file.pin_resident(&self.core, page_id, self.options.mode)? {
                Some(pin) => pin,
                None => {
                    self.next_page_id = page_id.next();
                    self.offset = 0;
                    self.exception = None;
                    return Ok(true);
                }
            }
        } else {
            self.file.pin(&self.core, page_id, self.options.mode)?
        };
        if past_end {
            self.file.grow_to(page_id);
        }
        CacheCounters::bump(&self.core.counters.pins);
        self.current = Some(pin);
        self.next_page_id = page_id.next();
        self.offset = 0;
        self.exception = None;
        self.verify_context();
        Ok(true)
    }

    /// Moves to `page_id`. Re-checks the version context if already there.
    pub fn next_page(&mut self, page_id: impl Into<PageId>) -> Result<bool> {
        self.ensure_open()?;
        let page_id = page_id.into();
        if self.current_page_id() == Some(page_id) {
            self.verify_context();
            return Ok(true);
        }
        self.next_page_id = page_id;
        self.next()
    }

    fn verify_context(&self) {
        if self.options.mode.is_write() || !self.file.version_tracking {
            return;
        }
        let (Some(version), Some(pin)) = (self.context.version_context(), self.current) else {
            return;
        };
        let frame = self.core.pool.frame(pin.frame);
        version.observe(TxId(frame.last_modified_tx()), self.file.highest_evicted_tx());
    }

    fn unpin(&mut self) {
        let Some(pin) = self.current.take() else {
            return;
        };
        let frame = self.core.pool.frame(pin.frame);
        match self.options.mode {
            AccessMode::SharedRead => {}
            AccessMode::SharedWrite => {
                self.stamp_committing_tx(pin);
                frame.lock.unlock_write();
            }
            AccessMode::Exclusive => {
                self.stamp_committing_tx(pin);
                frame.lock.unlock_exclusive_and_mark_modified();
            }
        }
        self.core.pool.unpin(pin.frame);
        CacheCounters::bump(&self.core.counters.unpins);
    }

    fn stamp_committing_tx(&self, pin: Pin) {
        let tx = self.context.committing_tx();
        if tx > 0 {
            self.core.pool.frame(pin.frame).raise_last_modified_tx(tx);
        }
    }

    /// Returns true if a read overlapped a write and must be repeated.
    ///
    /// When it returns true every cursor in the linked chain has been reset to
    /// offset 0 with a fresh read stamp, and its bounds flag and cursor
    /// exception are cleared. Write cursors never need a retry.
    pub fn should_retry(&mut self) -> Result<bool> {
        self.ensure_open()?;
        if self.options.mode.is_write() {
            return Ok(false);
        }
        let mut retry = false;
        let mut cursor = Some(&*self);
        while let Some(c) = cursor {
            if let Some(pin) = c.current {
                if !c.core.pool.frame(pin.frame).validate(pin.stamp) {
                    retry = true;
                    break;
                }
            }
            cursor = c.linked.as_deref().filter(|l| !l.closed);
        }
        if retry {
            let mut cursor = Some(self);
            while let Some(c) = cursor {
                c.start_retry();
                cursor = c.linked.as_deref_mut().filter(|l| !l.closed);
            }
        }
        Ok(retry)
    }

    fn start_retry(&mut self) {
        self.offset = 0;
        self.out_of_bounds = false;
        self.exception = None;
        if let Some(pin) = self.current.as_mut() {
            pin.stamp = self.core.pool.frame(pin.frame).begin_read_stamp();
        }
    }

    /// Releases the pin and closes every linked cursor. Idempotent.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.unpin();
        self.closed = true;
        if let Some(linked) = self.linked.as_deref_mut() {
            linked.close();
        }
    }

    /// Returns true after [`PageCursor::close`].
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Opens a second cursor on the same file, mode and context, owned by this one.
    ///
    /// Fails if the previously opened linked cursor is still open.
    pub fn open_linked_cursor(&mut self, page_id: impl Into<PageId>) -> Result<&mut PageCursor> {
        self.ensure_open()?;
        let page_id = page_id.into();
        match self.linked.as_deref_mut() {
            Some(linked) if !linked.closed => return Err(CacheError::LinkedCursorInUse),
            Some(linked) => linked.reopen(page_id),
            None => {
                self.linked = Some(Box::new(PageCursor::new(
                    Arc::clone(&self.core),
                    Arc::clone(&self.file),
                    page_id,
                    self.options,
                    self.context.clone(),
                )));
            }
        }
        self.linked
            .as_deref_mut()
            .ok_or(CacheError::Invalid("linked cursor missing"))
    }

    // --- offsets

    /// Current byte offset.
    pub fn offset(&self) -> usize {
        self.offset
    }

    /// Moves the offset; values past the page raise the bounds flag and reset it to 0.
    pub fn set_offset(&mut self, offset: usize) {
        if offset > self.file.page_size {
            self.offset = 0;
            self.out_of_bounds = true;
        } else {
            self.offset = offset;
        }
    }

    /// Remembers the current offset and bounds flag.
    pub fn mark(&mut self) {
        self.mark = self.offset;
        self.mark_out_of_bounds = self.out_of_bounds;
    }

    /// Returns to the state saved by [`PageCursor::mark`].
    pub fn set_offset_to_mark(&mut self) {
        self.offset = self.mark;
        self.out_of_bounds = self.mark_out_of_bounds;
    }

    /// Moves the offset back to the start of the page.
    pub fn rewind(&mut self) {
        self.offset = 0;
    }

    /// Reports and clears the bounds flag across the linked chain.
    pub fn check_and_clear_bounds_flag(&mut self) -> bool {
        let mut raised = false;
        let mut cursor = Some(self);
        while let Some(c) = cursor {
            raised |= std::mem::take(&mut c.out_of_bounds);
            cursor = c.linked.as_deref_mut();
        }
        raised
    }

    /// Records a decoding error to be surfaced by [`PageCursor::check_and_clear_cursor_exception`].
    pub fn set_cursor_exception(&mut self, message: impl Into<String>) {
        self.exception = Some(message.into());
    }

    /// Fails with the first cursor exception in the linked chain, clearing the chain.
    pub fn check_and_clear_cursor_exception(&mut self) -> Result<()> {
        let mut found = None;
        let mut cursor = Some(&mut *self);
        while let Some(c) = cursor {
            if found.is_none() {
                found = c.exception.take();
            }
            c.exception = None;
            cursor = c.linked.as_deref_mut();
        }
        match found {
            Some(message) => Err(CacheError::CursorException(message)),
            None => Ok(()),
        }
    }

    /// Clears cursor exceptions across the linked chain.
    pub fn clear_cursor_exception(&mut self) {
        let mut cursor = Some(self);
        while let Some(c) = cursor {
            c.exception = None;
            cursor = c.linked.as_deref_mut();
        }
    }

    // --- raw access

    /// Returns the page range for an access, or raises the bounds flag.
    fn bounded(&mut self, offset: usize, len: usize) -> Option<usize> {
        self.assert_open();
        let end = offset.checked_add(len);
        match (self.current, end) {
            (Some(_), Some(end)) if end <= self.file.page_size => Some(offset),
            _ => {
                self.out_of_bounds = true;
                None
            }
        }
    }

    fn assert_open(&self) {
        assert!(!self.closed, "page cursor used after close");
    }

    fn assert_writable(&self) {
        assert!(
            self.options.mode.is_write(),
            "cannot write through a {:?} cursor",
            self.options.mode
        );
    }

    fn read_raw<const N: usize>(&mut self, offset: usize) -> [u8; N] {
        let mut bytes = [0u8; N];
        if let (Some(off), Some(pin)) = (self.bounded(offset, N), self.current) {
            self.core.pool.frame(pin.frame).page.read_into(off, &mut bytes);
        }
        bytes
    }

    fn write_raw(&mut self, offset: usize, bytes: &[u8]) {
        self.assert_writable();
        if let (Some(off), Some(pin)) = (self.bounded(offset, bytes.len()), self.current) {
            self.core.pool.frame(pin.frame).page.write_from(off, bytes);
        }
    }

    fn advance(&mut self, by: usize) -> usize {
        let at = self.offset;
        self.offset = self.offset.saturating_add(by);
        at
    }

    /// Copies bytes at the offset into `dst` and advances.
    pub fn get_bytes(&mut self, dst: &mut [u8]) {
        let at = self.advance(dst.len());
        self.get_bytes_at(at, dst);
    }

    /// Copies bytes at `offset` into `dst`; leaves `dst` untouched when out of bounds.
    pub fn get_bytes_at(&mut self, offset: usize, dst: &mut [u8]) {
        if let (Some(off), Some(pin)) = (self.bounded(offset, dst.len()), self.current) {
            self.core.pool.frame(pin.frame).page.read_into(off, dst);
        }
    }

    /// Writes `src` at the offset and advances.
    pub fn put_bytes(&mut self, src: &[u8]) {
        let at = self.advance(src.len());
        self.put_bytes_at(at, src);
    }

    /// Writes `src` at `offset`.
    pub fn put_bytes_at(&mut self, offset: usize, src: &[u8]) {
        self.write_raw(offset, src);
    }

    /// Writes `len` copies of `byte` at the offset and advances.
    pub fn put_fill(&mut self, byte: u8, len: usize) {
        self.assert_writable();
        let at = self.advance(len);
        if let (Some(off), Some(pin)) = (self.bounded(at, len), self.current) {
            self.core.pool.frame(pin.frame).page.fill(off, len, byte);
        }
    }

    /// Zeroes the whole page.
    pub fn zap_page(&mut self) {
        self.assert_open();
        self.assert_writable();
        match self.current {
            Some(pin) => self.core.pool.frame(pin.frame).page.zero(),
            None => self.out_of_bounds = true,
        }
    }

    /// Copies up to `len` bytes from this page into `target`, clamped to both pages.
    ///
    /// Returns the number of bytes copied; `0` with the bounds flag raised if
    /// either offset is outside its page.
    pub fn copy_to(
        &mut self,
        source_offset: usize,
        target: &mut PageCursor,
        target_offset: usize,
        len: usize,
    ) -> usize {
        self.assert_open();
        target.assert_open();
        target.assert_writable();
        let (Some(src_pin), Some(dst_pin)) = (self.current, target.current) else {
            self.out_of_bounds = true;
            return 0;
        };
        if source_offset >= self.file.page_size || target_offset >= target.file.page_size {
            self.out_of_bounds = true;
            return 0;
        }
        let n = len
            .min(self.file.page_size - source_offset)
            .min(target.file.page_size - target_offset);
        let mut buf = vec![0u8; n];
        self.core
            .pool
            .frame(src_pin.frame)
            .page
            .read_into(source_offset, &mut buf);
        target
            .core
            .pool
            .frame(dst_pin.frame)
            .page
            .write_from(target_offset, &buf);
        n
    }

    /// Moves `len` bytes at `source_offset` by `shift` bytes within the page.
    pub fn shift_bytes(&mut self, source_offset: usize, len: usize, shift: isize) {
        self.assert_open();
        self.assert_writable();
        let target = source_offset.checked_add_signed(shift);
        let fits = |start: Option<usize>| {
            start
                .and_then(|s| s.checked_add(len))
                .is_some_and(|end| end <= self.file.page_size)
        };
        let in_bounds = fits(Some(source_offset)) && fits(target);
        match (self.current, target) {
            (Some(pin), Some(target)) if in_bounds => {
                self.core
                    .pool
                    .frame(pin.frame)
                    .page
                    .copy_within(source_offset, target, len);
            }
            _ => self.out_of_bounds = true,
        }
    }
}

macro_rules! typed_access {
    ($($ty:ty => $get:ident, $get_at:ident, $put:ident, $put_at:ident;)*) => {
        impl PageCursor {
            $(
                #[doc = concat!("Reads a little-endian `", stringify!($ty), "` at the offset and advances.")]
                pub fn $get(&mut self) -> $ty {
                    let at = self.advance(std::mem::size_of::<$ty>());
                    self.$get_at(at)
                }

                #[doc = concat!("Reads a little-endian `", stringify!($ty), "` at `offset`.")]
                pub fn $get_at(&mut self, offset: usize) -> $ty {
                    <$ty>::from_le_bytes(self.read_raw(offset))
                }

                #[doc = concat!("Writes a little-endian `", stringify!($ty), "` at the offset and advances.")]
                pub fn $put(&mut self, value: $ty) {
                    let at = self.advance(std::mem::size_of::<$ty>());
                    self.$put_at(at, value);
                }

                #[doc = concat!("Writes a little-endian `", stringify!($ty), "` at `offset`.")]
                pub fn $put_at(&mut self, offset: usize, value: $ty) {
                    self.write_raw(offset, &value.to_le_bytes());
                }
            )*
        }
    };
}

typed_access! {
    u8 => get_u8, get_u8_at, put_u8, put_u8_at;
    i8 => get_i8, get_i8_at, put_i8, put_i8_at;
    u16 => get_u16, get_u16_at, put_u16, put_u16_at;
    i16 => get_i16, get_i16_at, put_i16, put_i16_at;
    u32 => get_u32, get_u32_at, put_u32, put_u32_at;
    i32 => get_i32, get_i32_at, put_i32, put_i32_at;
    u64 => get_u64, get_u64_at, put_u64, put_u64_at;
    i64 => get_i64, get_i64_at, put_i64, put_i64_at;
}

impl Drop for PageCursor {
    fn drop(&mut self) {
        self.close();
    }
}

impl fmt::Debug for PageCursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PageCursor")
            .field("file", &self.file.id)
            .field("mode", &self.options.mode)
            .field("page", &self.current_page_id())
            .field("offset", &self.offset)
            .field("closed", &self.closed)
            .finish()
    }
}
