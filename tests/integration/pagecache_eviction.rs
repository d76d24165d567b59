//! Eviction under pressure, the background evictor and swapper failures.

#![allow(missing_docs)]

use std::io;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use sombra_pagecache::{
    AccessMode, CacheError, CursorContext, DefaultSwapperFactory, OpenMode, PageCache,
    PageCacheOptions, PageCursor, PageId, PageSwapper, Result, SwapperFactory,
};
use tempfile::tempdir;

const PAGE: usize = 128;

#[derive(Default)]
struct Faults {
    fail_reads: AtomicBool,
    fail_writes: AtomicBool,
    evicted: AtomicUsize,
}

fn injected(what: &str) -> CacheError {
    CacheError::Io(io::Error::new(
        io::ErrorKind::Other,
        format!("injected {what} failure"),
    ))
}

struct FlakySwapper {
    inner: Arc<dyn PageSwapper>,
    faults: Arc<Faults>,
}

impl PageSwapper for FlakySwapper {
    fn read(&self, page_id: PageId, buf: &mut [u8]) -> Result<usize> {
        if self.faults.fail_reads.load(Ordering::SeqCst) {
            return Err(injected("read"));
        }
        self.inner.read(page_id, buf)
    }

    fn write(&self, page_id: PageId, buf: &[u8]) -> Result<()> {
        if self.faults.fail_writes.load(Ordering::SeqCst) {
            return Err(injected("write"));
        }
        self.inner.write(page_id, buf)
    }

    fn evicted(&self, page_id: PageId) {
        self.faults.evicted.fetch_add(1, Ordering::SeqCst);
        self.inner.evicted(page_id);
    }

    fn force(&self) -> Result<()> {
        self.inner.force()
    }

    fn last_page_id(&self) -> Result<Option<PageId>> {
        self.inner.last_page_id()
    }

    fn truncate(&self) -> Result<()> {
        self.inner.truncate()
    }

    fn close(&self) -> Result<()> {
        self.inner.close()
    }

    fn path(&self) -> &Path {
        self.inner.path()
    }
}

struct FlakyFactory(Arc<Faults>);

impl SwapperFactory for FlakyFactory {
    fn create(
        &self,
        path: &Path,
        page_size: usize,
        mode: OpenMode,
    ) -> Result<Arc<dyn PageSwapper>> {
        let inner = DefaultSwapperFactory.create(path, page_size, mode)?;
        Ok(Arc::new(FlakySwapper {
            inner,
            faults: Arc::clone(&self.0),
        }))
    }
}

fn flaky_cache(pages: usize, background: bool) -> Result<(PageCache, Arc<Faults>)> {
    let faults = Arc::new(Faults::default());
    let options = PageCacheOptions {
        background_eviction: background,
        eviction_park_ms: 1,
        ..PageCacheOptions::with_pages(PAGE, pages)
    };
    let cache = PageCache::with_swapper_factory(options, Arc::new(FlakyFactory(faults.clone())))?;
    Ok((cache, faults))
}

fn read_u64(cursor: &mut PageCursor, offset: usize) -> Result<u64> {
    loop {
        let value = cursor.get_u64_at(offset);
        if !cursor.should_retry()? {
            return Ok(value);
        }
    }
}

fn wait_until(mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(2));
    }
    cond()
}

#[test]
fn pinned_pages_survive_eviction_pressure() -> Result<()> {
    let dir = tempdir()?;
    let (cache, faults) = flaky_cache(4, false)?;
    let file = cache.map(dir.path().join("pinned.db"), PAGE)?;

    let mut pinned = Vec::new();
    for page in 0..3u64 {
        let mut cursor = file.io(page, AccessMode::SharedWrite, &CursorContext::none())?;
        assert!(cursor.next()?);
        cursor.put_u64_at(0, 1000 + page);
        pinned.push(cursor);
    }

    let mut churn = file.io(3u64, AccessMode::SharedWrite, &CursorContext::none())?;
    for page in 3..40u64 {
        assert!(churn.next()?);
        assert_eq!(churn.current_page_id(), Some(PageId(page)));
        churn.put_u64_at(0, page);
    }
    churn.close();
    assert!(faults.evicted.load(Ordering::SeqCst) >= 36);

    for (page, cursor) in pinned.iter_mut().enumerate() {
        assert_eq!(cursor.current_page_id(), Some(PageId(page as u64)));
        assert_eq!(cursor.get_u64_at(0), 1000 + page as u64);
        cursor.close();
    }

    let mut reader = file.io(0u64, AccessMode::SharedRead, &CursorContext::none())?;
    for page in 0..40u64 {
        assert!(reader.next()?);
        let expected = if page < 3 { 1000 + page } else { page };
        assert_eq!(read_u64(&mut reader, 0)?, expected, "page {page}");
    }
    reader.close();
    file.close()?;
    cache.close()
}

#[test]
fn background_evictor_restores_watermark() -> Result<()> {
    let dir = tempdir()?;
    let (cache, _faults) = flaky_cache(20, true)?;
    assert_eq!(cache.keep_free_pages(), 10);
    let file = cache.map(dir.path().join("watermark.db"), PAGE)?;

    let mut cursor = file.io(0u64, AccessMode::SharedWrite, &CursorContext::none())?;
    for page in 0..60u64 {
        assert!(cursor.next()?);
        cursor.put_u64_at(8, page * 3);
    }
    cursor.close();

    assert!(
        wait_until(|| cache.free_pages() >= cache.keep_free_pages()),
        "free pages stuck at {}",
        cache.free_pages()
    );
    let stats = cache.stats();
    assert!(stats.evictions >= 40, "{stats}");
    assert!(stats.eviction_flushes > 0, "{stats}");
    file.close()?;
    cache.close()
}

#[test]
fn explicit_eviction_pass_stops_at_watermark() -> Result<()> {
    let dir = tempdir()?;
    let (cache, _faults) = flaky_cache(8, false)?;
    let file = cache.map(dir.path().join("explicit.db"), PAGE)?;
    let mut cursor = file.io(0u64, AccessMode::SharedWrite, &CursorContext::none())?;
    for _ in 0..8 {
        assert!(cursor.next()?);
    }
    cursor.close();
    assert_eq!(cache.free_pages(), 0);

    assert_eq!(cache.evict_to_watermark()?, cache.keep_free_pages());
    assert_eq!(cache.free_pages(), cache.keep_free_pages());
    assert_eq!(cache.evict_to_watermark()?, 0);
    file.close()?;
    cache.close()
}

#[test]
fn failed_fault_returns_frame_to_free_list() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("fault-fail.db");
    std::fs::write(&path, vec![7u8; PAGE * 2])?;
    let (cache, faults) = flaky_cache(4, false)?;
    let file = cache.map(&path, PAGE)?;
    let free = cache.free_pages();

    faults.fail_reads.store(true, Ordering::SeqCst);
    let mut cursor = file.io(1u64, AccessMode::SharedRead, &CursorContext::none())?;
    match cursor.next() {
        Err(err @ CacheError::PageFaultFailure { .. }) => {
            assert_eq!(err.io_kind(), Some(io::ErrorKind::Other));
        }
        other => panic!("expected fault failure, got {other:?}"),
    }
    assert_eq!(cursor.current_page_id(), None);
    assert_eq!(cache.free_pages(), free);

    faults.fail_reads.store(false, Ordering::SeqCst);
    assert!(cursor.next()?);
    assert_eq!(cursor.current_page_id(), Some(PageId(1)));
    assert_eq!(read_u64(&mut cursor, 0)?, u64::from_le_bytes([7; 8]));
    cursor.close();
    file.close()?;
    cache.close()
}

#[test]
fn failed_writeback_keeps_page_dirty() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("evict-fail.db");
    let (cache, faults) = flaky_cache(2, false)?;
    let file = cache.map(&path, PAGE)?;

    let mut cursor = file.io(0u64, AccessMode::SharedWrite, &CursorContext::none())?;
    assert!(cursor.next()?);
    cursor.put_u64_at(0, 11);
    assert!(cursor.next()?);
    cursor.put_u64_at(0, 22);
    cursor.close();

    faults.fail_writes.store(true, Ordering::SeqCst);
    let mut grower = file.io(2u64, AccessMode::SharedWrite, &CursorContext::none())?;
    assert!(matches!(
        grower.next(),
        Err(CacheError::EvictionFailure { .. })
    ));
    assert_eq!(cache.stats().eviction_errors, 1);
    assert!(file.flush().is_err());

    faults.fail_writes.store(false, Ordering::SeqCst);
    assert!(grower.next()?);
    grower.put_u64_at(0, 33);
    grower.close();
    file.flush()?;

    let bytes = std::fs::read(&path)?;
    let word = |page: usize| {
        let at = page * PAGE;
        u64::from_le_bytes(bytes[at..at + 8].try_into().unwrap())
    };
    assert_eq!((word(0), word(1), word(2)), (11, 22, 33));
    file.close()?;
    cache.close()
}

#[test]
fn background_failure_is_retained() -> Result<()> {
    let dir = tempdir()?;
    let (cache, faults) = flaky_cache(4, true)?;
    let file = cache.map(dir.path().join("bg-fail.db"), PAGE)?;
    assert!(cache.last_eviction_error().is_none());

    faults.fail_writes.store(true, Ordering::SeqCst);
    let mut cursor = file.io(0u64, AccessMode::SharedWrite, &CursorContext::none())?;
    for _ in 0..3 {
        assert!(cursor.next()?);
        cursor.put_u32_at(4, 5);
    }
    cursor.close();

    assert!(wait_until(|| cache.last_eviction_error().is_some()));
    let err = cache.last_eviction_error().expect("recorded");
    assert!(matches!(*err, CacheError::EvictionFailure { .. }), "{err}");
    assert!(cache.stats().eviction_errors >= 1);

    faults.fail_writes.store(false, Ordering::SeqCst);
    file.close()?;
    cache.close()
}
