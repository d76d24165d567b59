#![forbid(unsafe_code)]

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::trace;

use crate::primitives::io::{FileIo, OpenMode, StdFileIo};
use crate::types::{CacheError, PageId, Result};

/// Moves whole pages between the cache and one backing file.
///
/// The cache calls `read` on a fault, `write` on flush or when evicting a
/// dirty page, and `evicted` after a page has left the cache.
pub trait PageSwapper: Send + Sync + 'static {
    /// Fills `buf` with the page at `page_id`. Bytes past end of file read as zero.
    ///
    /// Returns the number of bytes that came from the file.
    fn read(&self, page_id: PageId, buf: &mut [u8]) -> Result<usize>;
    /// Writes `buf` as the page at `page_id`, growing the file if needed.
    fn write(&self, page_id: PageId, buf: &[u8]) -> Result<()>;
    /// Notification that `page_id` is no longer cached.
    fn evicted(&self, page_id: PageId);
    /// Makes previous writes durable.
    fn force(&self) -> Result<()>;
    /// Last page id present in the file, `None` when the file is empty.
    fn last_page_id(&self) -> Result<Option<PageId>>;
    /// Drops every page of the file.
    fn truncate(&self) -> Result<()>;
    /// Releases the backing file. Further calls fail.
    fn close(&self) -> Result<()>;
    /// Path of the backing file.
    fn path(&self) -> &Path;
    /// Releases the backing file and removes it.
    fn close_and_delete(&self) -> Result<()> {
        self.close()?;
        fs::remove_file(self.path())?;
        Ok(())
    }
}

/// Creates a swapper for every newly mapped file.
pub trait SwapperFactory: Send + Sync + 'static {
    /// Opens `path` with pages of `page_size` bytes.
    fn create(
        &self,
        path: &Path,
        page_size: usize,
        mode: OpenMode,
    ) -> Result<Arc<dyn PageSwapper>>;
}

/// Factory producing [`SingleFileSwapper`]s over [`StdFileIo`].
#[derive(Clone, Copy, Debug, Default)]
pub struct DefaultSwapperFactory;

impl SwapperFactory for DefaultSwapperFactory {
    fn create(
        &self,
        path: &Path,
        page_size: usize,
        mode: OpenMode,
    ) -> Result<Arc<dyn PageSwapper>> {
        let io = StdFileIo::open_with(path, mode)?;
        Ok(Arc::new(SingleFileSwapper::new(
            Arc::new(io),
            path.to_path_buf(),
            page_size,
        )))
    }
}

/// Swapper storing page `n` at byte offset `n * page_size` of one file.
pub struct SingleFileSwapper {
    io: Arc<dyn FileIo>,
    path: PathBuf,
    page_size: usize,
    closed: AtomicBool,
}

impl SingleFileSwapper {
    /// Wraps an opened file.
    pub fn new(io: Arc<dyn FileIo>, path: PathBuf, page_size: usize) -> Self {
        Self {
            io,
            path,
            page_size,
            closed: AtomicBool::new(false),
        }
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(CacheError::FileNotMapped(self.path.clone()));
        }
        Ok(())
    }

    fn offset(&self, page_id: PageId) -> u64 {
        page_id.0 * self.page_size as u64
    }
}

impl PageSwapper for SingleFileSwapper {
    fn read(&self, page_id: PageId, buf: &mut [u8]) -> Result<usize> {
        self.ensure_open()?;
        let len = buf.len().min(self.page_size);
        let n = self.io.read_at(self.offset(page_id), &mut buf[..len])?;
        buf[n..].fill(0);
        Ok(n)
    }

    fn write(&self, page_id: PageId, buf: &[u8]) -> Result<()> {
        self.ensure_open()?;
        let len = buf.len().min(self.page_size);
        self.io.write_at(self.offset(page_id), &buf[..len])
    }

    fn evicted(&self, page_id: PageId) {
        trace!(path = %self.path.display(), page = page_id.0, "pagecache.swapper.evicted");
    }

    fn force(&self) -> Result<()> {
        self.ensure_open()?;
        self.io.sync_all()
    }

    fn last_page_id(&self) -> Result<Option<PageId>> {
        self.ensure_open()?;
        let pages = self.io.len()? / self.page_size as u64;
        Ok(pages.checked_sub(1).map(PageId))
    }

    fn truncate(&self) -> Result<()> {
        self.ensure_open()?;
        self.io.truncate(0)
    }

    fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::Release);
        Ok(())
    }

    fn path(&self) -> &Path {
        &self.path
    }
}
