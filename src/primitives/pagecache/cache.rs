#![forbid(unsafe_code)]

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{fence, AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use parking_lot::{Condvar, Mutex, RwLock};
use rustc_hash::FxHashMap;
use tracing::{debug, info, warn};

use super::eviction::spawn_evictor;
use super::frame::FramePool;
use super::options::{MapOptions, PageCacheOptions, ResolvedOptions};
use super::paged_file::{MappedFile, PagedFile};
use super::stats::{CacheCounters, PageCacheStats};
use super::swapper::{DefaultSwapperFactory, SwapperFactory};
use crate::primitives::concurrency::Backoff;
use crate::primitives::io::OpenMode;
use crate::types::{CacheError, FileId, Result};

/// State shared by the cache, its files, cursors and the evictor.
pub(crate) struct CacheCore {
    pub(crate) opts: ResolvedOptions,
    pub(crate) pool: FramePool,
    /// Mapped files by id, consulted by eviction.
    pub(crate) files: RwLock<FxHashMap<FileId, Arc<MappedFile>>>,
    /// Mapped files by path; serializes map and unmap.
    mappings: Mutex<Vec<Arc<MappedFile>>>,
    factory: Arc<dyn SwapperFactory>,
    next_file_id: AtomicU32,
    pub(crate) hand: Mutex<usize>,
    pub(crate) counters: CacheCounters,
    closed: AtomicBool,
    pub(crate) evictor_wake: Mutex<bool>,
    pub(crate) evictor_cond: Condvar,
    pub(crate) last_eviction_error: Mutex<Option<Arc<CacheError>>>,
}

impl CacheCore {
    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub(crate) fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(CacheError::CacheClosed);
        }
        Ok(())
    }

    fn map(self: &Arc<Self>, path: &Path, options: &MapOptions) -> Result<PagedFile> {
        options.validate(self.opts.page_size)?;
        let path = normalize_path(path);
        let mut mappings = self.mappings.lock();
        self.ensure_open()?;
        if let Some(existing) = mappings.iter().find(|m| m.path == path) {
            if existing.page_size != options.page_size {
                return Err(CacheError::ConfigurationConflict {
                    path,
                    mapped: existing.page_size,
                    requested: options.page_size,
                });
            }
            if options.truncate_existing {
                return Err(CacheError::InvalidConfig(format!(
                    "cannot truncate {} while it is mapped",
                    path.display()
                )));
            }
            if options.delete_on_close {
                existing.set_delete_on_close(true);
            }
            existing.refs.fetch_add(1, Ordering::AcqRel);
            return Ok(PagedFile::new(Arc::clone(self), Arc::clone(existing)));
        }

        let swapper = self.factory.create(
            &path,
            options.page_size,
            OpenMode {
                create: options.create,
                truncate: false,
            },
        )?;
        if options.truncate_existing {
            swapper.truncate()?;
        }
        let id = FileId(self.next_file_id.fetch_add(1, Ordering::AcqRel));
        let file = Arc::new(MappedFile::new(id, path, options, swapper, self.opts.striping)?);
        self.files.write().insert(id, Arc::clone(&file));
        mappings.push(Arc::clone(&file));
        debug!(
            path = %file.path.display(),
            file = %id,
            page_size = file.page_size,
            last_page = ?file.last_page_id(),
            "pagecache.map"
        );
        Ok(PagedFile::new(Arc::clone(self), file))
    }

    fn existing_mapping(self: &Arc<Self>, path: &Path) -> Result<Option<PagedFile>> {
        let path = normalize_path(path);
        let mappings = self.mappings.lock();
        self.ensure_open()?;
        Ok(mappings.iter().find(|m| m.path == path).map(|file| {
            file.refs.fetch_add(1, Ordering::AcqRel);
            PagedFile::new(Arc::clone(self), Arc::clone(file))
        }))
    }

    pub(crate) fn unmap(&self, handle: &PagedFile) -> Result<()> {
        self.ensure_open()?;
        if !handle.release() {
            return Ok(());
        }
        let file = &handle.file;
        let mut mappings = self.mappings.lock();
        if file.refs.fetch_sub(1, Ordering::AcqRel) > 1 {
            return Ok(());
        }
        let result = self.close_file(file, true);
        match result {
            Ok(()) => {
                mappings.retain(|m| !Arc::ptr_eq(m, file));
                debug!(path = %file.path.display(), file = %file.id, "pagecache.unmap");
                Ok(())
            }
            Err(err) => {
                file.refs.fetch_add(1, Ordering::AcqRel);
                handle.unrelease();
                Err(err)
            }
        }
    }

    /// Flushes, evicts and releases a file whose last reference is gone.
    ///
    /// With `check_pins` the file is left mapped and `FileInUse` returned if a
    /// cursor still holds one of its pages. A file marked delete-on-close is
    /// not flushed; its dirty pages are dropped and the file removed.
    fn close_file(&self, file: &Arc<MappedFile>, check_pins: bool) -> Result<()> {
        file.set_closed(true);
        if check_pins && file.in_use(self) {
            file.set_closed(false);
            return Err(CacheError::FileInUse(file.path.clone()));
        }
        let delete = file.is_delete_on_close();
        let flushed = if delete {
            Ok(())
        } else {
            file.flush(self).and_then(|()| file.swapper.force())
        };
        if let Err(err) = flushed {
            if check_pins {
                file.set_closed(false);
                return Err(err);
            }
            warn!(path = %file.path.display(), error = %err, "pagecache.close.flush_failed");
        }
        if check_pins {
            self.evict_file(file)?;
        }
        self.files.write().remove(&file.id);
        if delete {
            debug!(path = %file.path.display(), file = %file.id, "pagecache.delete_on_close");
            file.swapper.close_and_delete()
        } else {
            file.swapper.close()
        }
    }

    /// Evicts every resident page of an unpinned, closed file.
    fn evict_file(&self, file: &MappedFile) -> Result<()> {
        for (page_id, frame_id) in file.table.resident() {
            let frame = self.pool.frame(frame_id);
            let mut backoff = Backoff::new();
            loop {
                if !frame.is_bound_to(file.id, page_id) {
                    break;
                }
                if frame.try_claim() {
                    if !frame.is_bound_to(file.id, page_id) {
                        frame.release_claim();
                        break;
                    }
                    if frame.lock.try_exclusive_lock() {
                        if file.is_delete_on_close() {
                            frame.lock.explicitly_mark_clean();
                        }
                        self.evict_claimed(frame_id)?;
                        self.pool.push_free(frame_id);
                        break;
                    }
                    frame.release_claim();
                }
                backoff.snooze();
            }
        }
        Ok(())
    }

    fn flush_and_force(&self) -> Result<()> {
        self.ensure_open()?;
        let files: Vec<Arc<MappedFile>> = self.mappings.lock().clone();
        let results: Vec<Result<()>> = thread::scope(|scope| {
            let handles: Vec<_> = files
                .iter()
                .map(|file| {
                    scope.spawn(move || {
                        file.flush(self)?;
                        file.swapper.force()
                    })
                })
                .collect();
            handles
                .into_iter()
                .map(|h| {
                    h.join()
                        .unwrap_or(Err(CacheError::Invalid("flush thread panicked")))
                })
                .collect()
        });
        results.into_iter().collect()
    }

    fn close_all(&self) -> Result<()> {
        let mut mappings = self.mappings.lock();
        let mut first_err = None;
        for file in mappings.drain(..) {
            warn!(
                path = %file.path.display(),
                refs = file.refs.load(Ordering::Acquire),
                "pagecache.close.open_mapping"
            );
            if let Err(err) = self.close_file(&file, false) {
                first_err.get_or_insert(err);
            }
        }
        first_err.map_or(Ok(()), Err)
    }
}

/// Makes two spellings of the same file compare equal, even before it exists.
fn normalize_path(path: &Path) -> PathBuf {
    if let Ok(canonical) = fs::canonicalize(path) {
        return canonical;
    }
    match (path.parent(), path.file_name()) {
        (Some(parent), Some(name)) => {
            let parent = if parent.as_os_str().is_empty() {
                Path::new(".")
            } else {
                parent
            };
            fs::canonicalize(parent)
                .map(|dir| dir.join(name))
                .unwrap_or_else(|_| path.to_path_buf())
        }
        _ => path.to_path_buf(),
    }
}

/// Bounded pool of page frames shared by every mapped file.
pub struct PageCache {
    core: Arc<CacheCore>,
    evictor: Mutex<Option<JoinHandle<()>>>,
}

impl PageCache {
    /// Creates a cache backed by regular files.
    pub fn new(options: PageCacheOptions) -> Result<Self> {
        Self::with_swapper_factory(options, Arc::new(DefaultSwapperFactory))
    }

    /// Creates a cache whose files are opened through `factory`.
    pub fn with_swapper_factory(
        options: PageCacheOptions,
        factory: Arc<dyn SwapperFactory>,
    ) -> Result<Self> {
        let opts = options.resolve()?;
        let core = Arc::new(CacheCore {
            pool: FramePool::new(opts.frames, opts.page_size),
            files: RwLock::new(FxHashMap::default()),
            mappings: Mutex::new(Vec::new()),
            factory,
            next_file_id: AtomicU32::new(1),
            hand: Mutex::new(0),
            counters: CacheCounters::default(),
            closed: AtomicBool::new(false),
            evictor_wake: Mutex::new(false),
            evictor_cond: Condvar::new(),
            last_eviction_error: Mutex::new(None),
            opts,
        });
        let evictor = if core.opts.background_eviction {
            Some(spawn_evictor(Arc::clone(&core))?)
        } else {
            None
        };
        info!(
            frames = core.opts.frames,
            page_size = core.opts.page_size,
            keep_free = core.opts.keep_free,
            background_eviction = core.opts.background_eviction,
            "pagecache.open"
        );
        Ok(Self {
            core,
            evictor: Mutex::new(evictor),
        })
    }

    /// Maps `path` with default [`MapOptions`] and the given file page size.
    pub fn map(&self, path: impl AsRef<Path>, page_size: usize) -> Result<PagedFile> {
        self.map_with(path, &MapOptions::with_page_size(page_size))
    }

    /// Maps `path`, or adds a reference to its existing mapping.
    pub fn map_with(&self, path: impl AsRef<Path>, options: &MapOptions) -> Result<PagedFile> {
        self.core.map(path.as_ref(), options)
    }

    /// Adds a reference to the mapping of `path`, if it is mapped.
    pub fn get_existing_mapping(&self, path: impl AsRef<Path>) -> Result<Option<PagedFile>> {
        self.core.existing_mapping(path.as_ref())
    }

    /// Paths and page sizes of the current mappings.
    pub fn list_existing_mappings(&self) -> Vec<(PathBuf, usize)> {
        self.core
            .mappings
            .lock()
            .iter()
            .map(|m| (m.path.clone(), m.page_size))
            .collect()
    }

    /// Drops one reference; the last one flushes, evicts and closes the file.
    pub fn unmap(&self, file: &PagedFile) -> Result<()> {
        self.core.unmap(file)
    }

    /// Flushes every mapped file, in parallel, and forces each to disk.
    pub fn flush_and_force(&self) -> Result<()> {
        self.core.flush_and_force()
    }

    /// Number of frames.
    pub fn max_cached_pages(&self) -> usize {
        self.core.pool.len()
    }

    /// Frames currently on the free list.
    pub fn free_pages(&self) -> usize {
        self.core.pool.free_len()
    }

    /// Cache page size in bytes.
    pub fn page_size(&self) -> usize {
        self.core.opts.page_size
    }

    /// Free-frame target of the background evictor.
    pub fn keep_free_pages(&self) -> usize {
        self.core.opts.keep_free
    }

    /// Runs one eviction pass up to the keep-free watermark and returns the frames freed.
    pub fn evict_to_watermark(&self) -> Result<usize> {
        self.core.ensure_open()?;
        Ok(self.core.evict_to_watermark())
    }

    /// Most recent background eviction failure.
    pub fn last_eviction_error(&self) -> Option<Arc<CacheError>> {
        self.core.last_eviction_error.lock().clone()
    }

    /// Snapshot of the cache counters.
    pub fn stats(&self) -> PageCacheStats {
        self.core
            .counters
            .snapshot(self.core.pool.free_len(), self.core.pool.len())
    }

    /// Returns true after [`PageCache::close`].
    pub fn is_closed(&self) -> bool {
        self.core.is_closed()
    }

    /// Stops the evictor and closes remaining mappings. Idempotent.
    pub fn close(&self) -> Result<()> {
        if self.core.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        fence(Ordering::SeqCst);
        self.core.wake_evictor();
        if let Some(handle) = self.evictor.lock().take() {
            if handle.join().is_err() {
                warn!("pagecache.evictor.panicked");
            }
        }
        let result = self.core.close_all();
        info!(stats = %self.stats(), "pagecache.close");
        result
    }
}

impl Drop for PageCache {
    fn drop(&mut self) {
        if let Err(err) = self.close() {
            warn!(error = %err, "pagecache.drop.close_failed");
        }
    }
}

impl fmt::Debug for PageCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PageCache")
            .field("page_size", &self.page_size())
            .field("max_cached_pages", &self.max_cached_pages())
            .field("free_pages", &self.free_pages())
            .field("closed", &self.is_closed())
            .finish()
    }
}
